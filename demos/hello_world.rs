//! Serves `Hello, World!` over HTTP/1.1 and HTTP/2, and echoes WebSocket
//! messages.
//!
//! ```text
//! cargo run --example hello_world
//! curl -v http://127.0.0.1:8000/
//! curl -v --http2-prior-knowledge http://127.0.0.1:8000/
//! ```
//!
//! Set `MUXSERVE_CONFIG` to a JSON file to override the defaults.

use std::sync::Arc;

use muxserve::app::{AppError, InboundMessage, OutboundMessage, Receiver, Scope, Sender, SharedApp};
use muxserve::config::Config;
use muxserve::http::Headers;
use muxserve::server::worker_serve;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

async fn hello(scope: Scope, mut rx: Receiver, tx: Sender) -> Result<(), AppError> {
    match scope {
        Scope::Http(scope) => {
            let body = format!("Hello, World! You asked for {} over {}\n", scope.path, scope.http_version);
            let headers: Headers = [
                ("content-type", "text/plain; charset=utf-8".to_owned()),
                ("content-length", body.len().to_string()),
            ]
            .into_iter()
            .collect();
            tx.send(OutboundMessage::HttpResponseStart {
                status: 200,
                headers,
                trailers: false,
            })
            .await?;
            tx.send(OutboundMessage::HttpResponseBody {
                body: body.into(),
                more_body: false,
            })
            .await?;
        }
        Scope::Websocket(_) => {
            while let Some(message) = rx.receive().await {
                match message {
                    InboundMessage::WebsocketConnect => {
                        tx.send(OutboundMessage::WebsocketAccept {
                            subprotocol: None,
                            headers: Headers::new(),
                        })
                        .await?;
                    }
                    InboundMessage::WebsocketReceive(message) => {
                        tx.send(OutboundMessage::WebsocketSend(message)).await?;
                    }
                    _ => break,
                }
            }
        }
        Scope::Lifespan => {
            while let Some(message) = rx.receive().await {
                match message {
                    InboundMessage::LifespanStartup => {
                        tracing::info!("application starting");
                        tx.send(OutboundMessage::LifespanStartupComplete).await?;
                    }
                    InboundMessage::LifespanShutdown => {
                        tracing::info!("application stopping");
                        tx.send(OutboundMessage::LifespanShutdownComplete).await?;
                        break;
                    }
                    _ => {}
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "muxserve=debug,hello_world=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match std::env::var("MUXSERVE_CONFIG") {
        Ok(path) => Config::from_json(&std::fs::read_to_string(path)?)?,
        Err(_) => Config::default(),
    };

    let app: SharedApp = Arc::new(hello);
    worker_serve(app, config, std::future::pending()).await?;
    Ok(())
}
