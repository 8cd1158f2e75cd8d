//! A worker: lifespan, listeners and graceful shutdown.

use std::future::Future;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{error, info};

use super::{ServerError, serve_listener};
use crate::app::SharedApp;
use crate::background::Event;
use crate::config::Config;
use crate::context::WorkerContext;
use crate::lifespan::Lifespan;

/// Binds every address in `config.bind` and serves until shut down.
///
/// Shutdown starts when `shutdown_trigger` resolves, on Ctrl-C or SIGTERM,
/// or once the worker's request budget is spent.
///
/// # Errors
///
/// [`ServerError::Config`] for an invalid configuration,
/// [`ServerError::Bind`] when an address cannot be bound, and otherwise as
/// for [`serve_listeners`].
pub async fn worker_serve<F>(app: SharedApp, config: Config, shutdown_trigger: F) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send,
{
    config.validate()?;
    let mut listeners = Vec::with_capacity(config.bind.len());
    for addr in &config.bind {
        let listener = TcpListener::bind(addr).await.map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;
        listeners.push(listener);
    }
    let context = Arc::new(WorkerContext::from_config(&config));
    serve_listeners(app, Arc::new(config), context, listeners, shutdown_trigger).await
}

/// Serves already-bound listeners.
///
/// Runs lifespan startup, accepts on every listener, then on shutdown sets
/// the `terminated` latch, stops accepting, drains live connections within
/// the graceful timeout and runs lifespan shutdown.
///
/// # Errors
///
/// [`ServerError::Lifespan`] when either lifespan stage fails or times out,
/// [`ServerError::Accept`] when a listener fails.
pub async fn serve_listeners<F>(
    app: SharedApp,
    config: Arc<Config>,
    context: Arc<WorkerContext>,
    listeners: Vec<TcpListener>,
    shutdown_trigger: F,
) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send,
{
    let mut lifespan = Lifespan::new(Arc::clone(&app), config.startup_timeout(), config.shutdown_timeout());
    lifespan.startup().await?;

    let shutdown = Arc::new(Event::new());
    let mut accepting = JoinSet::new();
    for listener in listeners {
        accepting.spawn(serve_listener(
            listener,
            Arc::clone(&app),
            Arc::clone(&config),
            Arc::clone(&context),
            Arc::clone(&shutdown),
        ));
    }

    let mut failure = None;
    tokio::select! {
        () = shutdown_trigger => info!("shutdown requested"),
        () = shutdown_signal() => info!("shutdown signal received"),
        () = context.terminate().wait() => info!(requests = context.requests(), "request budget spent; shutting down"),
        Some(joined) = accepting.join_next() => {
            failure = listener_failure(joined);
        }
    }

    context.terminated().set();
    shutdown.set();
    while let Some(joined) = accepting.join_next().await {
        if let Some(e) = listener_failure(joined) {
            failure.get_or_insert(e);
        }
    }

    lifespan.shutdown().await?;
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn listener_failure(joined: Result<Result<(), ServerError>, tokio::task::JoinError>) -> Option<ServerError> {
    match joined {
        Ok(Ok(())) => None,
        Ok(Err(e)) => {
            error!(error = %e, "listener failed");
            Some(e)
        }
        Err(e) => {
            error!(error = %e, "listener task failed");
            None
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{AppError, OutboundMessage, Receiver, Scope, Sender};
    use crate::lifespan::{LifespanError, Stage};
    use std::time::Duration;

    #[tokio::test]
    async fn rejects_invalid_config() {
        let config = Config {
            max_app_queue_size: 0,
            ..Config::default()
        };
        let result = worker_serve(crate::protocol::tests::ok_app(), config, async {}).await;
        assert!(matches!(result, Err(ServerError::Config(_))));
    }

    #[tokio::test]
    async fn lifespan_failure_is_fatal() {
        let app: SharedApp = Arc::new(|scope: Scope, _: Receiver, send: Sender| async move {
            if scope == Scope::Lifespan {
                send.send(OutboundMessage::LifespanStartupFailed {
                    message: "boom".into(),
                })
                .await?;
            }
            Ok::<(), AppError>(())
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let result = serve_listeners(
            app,
            Arc::new(Config::default()),
            Arc::new(WorkerContext::default()),
            vec![listener],
            std::future::pending(),
        )
        .await;
        assert!(matches!(
            result,
            Err(ServerError::Lifespan(LifespanError::Failure {
                stage: Stage::Startup,
                ..
            }))
        ));
    }

    #[tokio::test]
    async fn trigger_sets_terminated() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let context = Arc::new(WorkerContext::default());
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(serve_listeners(
            crate::protocol::tests::ok_app(),
            Arc::new(Config::default()),
            Arc::clone(&context),
            vec![listener],
            async move {
                let _ = rx.await;
            },
        ));
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(context.terminated().is_set());
    }
}
