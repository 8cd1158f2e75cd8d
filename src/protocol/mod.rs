//! Protocol engines.
//!
//! An engine turns [`ServerEvent`]s from the connection driver into
//! [`ProtocolEvent`]s for its stream handlers, and the handlers' events back
//! into bytes. [`ProtocolWrapper`] owns the active engine and replaces it in
//! place when HTTP/1.1 upgrades to HTTP/2.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;

use crate::app::SharedApp;
use crate::background::{Event, TaskSpawner};
use crate::config::Config;
use crate::context::WorkerContext;
use crate::events::{ProtocolEvent, ServerEvent};
use crate::http::Headers;

pub mod h11;
pub mod h2;

pub use h11::H11Protocol;
pub use h2::H2Protocol;

/// Receiver of connection-level events emitted by an engine. Implemented by
/// the connection driver.
pub(crate) trait ConnectionSink: Send + Sync + 'static {
    fn send(&self, event: ServerEvent) -> BoxFuture<'_, ()>;
}

/// Receiver of stream events emitted by a stream handler. Implemented by the
/// engines.
pub(crate) trait StreamSink: Send + Sync + 'static {
    fn stream_send(&self, event: ProtocolEvent) -> BoxFuture<'_, ()>;
}

/// Everything an engine and its streams need from the connection.
#[derive(Clone)]
pub(crate) struct ProtocolContext {
    pub app: SharedApp,
    pub config: Arc<Config>,
    pub context: Arc<WorkerContext>,
    pub spawner: TaskSpawner,
    pub client: Option<SocketAddr>,
    pub server: Option<SocketAddr>,
    pub sink: Arc<dyn ConnectionSink>,
    /// Set once the connection driver should stop reading.
    pub closing: Arc<Event>,
}

impl ProtocolContext {
    pub(crate) async fn send(&self, event: ServerEvent) {
        self.sink.send(event).await;
    }
}

/// What an engine wants done after handling an event.
#[derive(Debug, PartialEq)]
pub(crate) enum HandleOutcome {
    Continue,
    SwitchProtocol(Switch),
}

/// An HTTP/1.1 connection turning into HTTP/2.
#[derive(Debug, PartialEq)]
pub(crate) enum Switch {
    /// The client sent the HTTP/2 preface. `pending` starts with it.
    H2 { pending: Bytes },
    /// `Upgrade: h2c`. The upgrade request becomes stream 1.
    H2c {
        pending: Bytes,
        headers: Headers,
        settings: String,
    },
}

/// The request that carried an `Upgrade: h2c`.
#[derive(Debug, Clone)]
pub(crate) struct H2cUpgrade {
    /// Pseudo-headers followed by the original request headers.
    pub headers: Headers,
    /// Raw `HTTP2-Settings` value.
    pub settings: String,
}

enum Engine {
    H11(Arc<H11Protocol>),
    H2(Arc<H2Protocol>),
}

/// Owns the active engine for one connection.
pub(crate) struct ProtocolWrapper {
    ctx: ProtocolContext,
    engine: Engine,
}

impl ProtocolWrapper {
    /// Starts on HTTP/2 when ALPN selected `h2`, on HTTP/1.1 otherwise.
    pub(crate) async fn new(ctx: ProtocolContext, alpn: Option<&str>) -> Self {
        let engine = if alpn == Some("h2") {
            let h2 = H2Protocol::new(&ctx);
            h2.initiate(None).await;
            Engine::H2(h2)
        } else {
            Engine::H11(H11Protocol::new(&ctx))
        };
        Self { ctx, engine }
    }

    pub(crate) async fn handle(&mut self, event: ServerEvent) {
        let outcome = match &self.engine {
            Engine::H11(h11) => h11.handle(event).await,
            Engine::H2(h2) => {
                h2.handle(event).await;
                return;
            }
        };
        if let HandleOutcome::SwitchProtocol(switch) = outcome {
            self.switch(switch).await;
        }
    }

    async fn switch(&mut self, switch: Switch) {
        let h2 = H2Protocol::new(&self.ctx);
        let pending = match switch {
            Switch::H2 { pending } => {
                h2.initiate(None).await;
                pending
            }
            Switch::H2c {
                pending,
                headers,
                settings,
            } => {
                h2.initiate(Some(H2cUpgrade { headers, settings })).await;
                pending
            }
        };
        self.engine = Engine::H2(Arc::clone(&h2));
        if !pending.is_empty() {
            h2.handle(ServerEvent::raw(pending)).await;
        }
    }

    /// `"h11"` or `"h2"`.
    pub(crate) fn name(&self) -> &'static str {
        match self.engine {
            Engine::H11(_) => "h11",
            Engine::H2(_) => "h2",
        }
    }
}
