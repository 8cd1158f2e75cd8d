//! Stream handlers: the bridge between protocol engines and the application.
//!
//! A protocol engine creates one handler per logical stream and feeds it
//! [`ProtocolEvent`]s; the handler spawns the application and turns its
//! [`OutboundMessage`](crate::app::OutboundMessage)s back into
//! [`ProtocolEvent`]s for the engine.
//!
//! Each handler is split in two. A pure state machine (`HttpMachine`,
//! `WsMachine`) decides what happens for every input and returns a list of
//! [`Effect`]s; [`StreamCore`] then performs those effects. The machine is
//! only ever locked while computing effects, never while performing them, so
//! the engine's read path and the application's send path cannot block each
//! other.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

use tracing::{debug, info};

use crate::app::{InboundMessage, MessageSink, Scope, SharedApp};
use crate::background::{AppQueue, TaskSpawner};
use crate::config::Config;
use crate::events::ProtocolEvent;
use crate::http::{Headers, Method, StatusCode};
use crate::protocol::{ProtocolContext, StreamSink};

pub mod http;
pub mod ws;

pub use http::{HttpState, HttpStream};
pub use ws::{WsStream, WsStreamState};

/// Something a stream handler has decided to do.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Effect {
    /// Send an event to the protocol engine.
    Emit(ProtocolEvent),
    /// Queue a message for the application, waiting for queue space.
    Deliver(InboundMessage),
    /// Queue a final message without waiting, then drop the queue.
    Disconnect(InboundMessage),
    SpawnApp(Scope),
    AccessLog {
        method: Method,
        path: String,
        status: Option<u16>,
    },
    /// WebSocket only: start the ping task.
    StartHeartbeat,
}

/// The handler for one stream, as stored by a protocol engine.
#[derive(Clone)]
pub(crate) enum StreamHandler {
    Http(Arc<HttpStream>),
    Ws(Arc<WsStream>),
}

impl StreamHandler {
    pub(crate) async fn handle(&self, event: ProtocolEvent) {
        match self {
            Self::Http(stream) => stream.handle(event).await,
            Self::Ws(stream) => stream.handle(event).await,
        }
    }

    /// `true` once the stream no longer needs the connection kept open.
    pub(crate) fn is_idle(&self) -> bool {
        match self {
            Self::Http(_) => false,
            Self::Ws(stream) => stream.is_idle(),
        }
    }
}

/// State shared by both handler kinds: where to send events and how to reach
/// the application.
pub(crate) struct StreamCore {
    stream_id: u32,
    app: SharedApp,
    config: Arc<Config>,
    spawner: TaskSpawner,
    protocol: Weak<dyn StreamSink>,
    sink: Weak<dyn MessageSink>,
    queue: Mutex<Option<AppQueue>>,
    started: Instant,
}

impl StreamCore {
    fn new(
        ctx: &ProtocolContext,
        protocol: Weak<dyn StreamSink>,
        sink: Weak<dyn MessageSink>,
        stream_id: u32,
    ) -> Self {
        Self {
            stream_id,
            app: Arc::clone(&ctx.app),
            config: Arc::clone(&ctx.config),
            spawner: ctx.spawner.clone(),
            protocol,
            sink,
            queue: Mutex::new(None),
            started: Instant::now(),
        }
    }

    fn queue(&self) -> MutexGuard<'_, Option<AppQueue>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Performs effects in order.
    async fn execute(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Emit(event) => {
                    if let Some(protocol) = self.protocol.upgrade() {
                        protocol.stream_send(event).await;
                    }
                }
                Effect::Deliver(message) => {
                    let queue = self.queue().clone();
                    if let Some(queue) = queue {
                        if queue.send(message).await.is_err() {
                            debug!(stream_id = self.stream_id, "application gone; message dropped");
                        }
                    }
                }
                Effect::Disconnect(message) => {
                    if let Some(queue) = self.queue().take() {
                        let _ = queue.try_send(message);
                    }
                }
                Effect::SpawnApp(scope) => {
                    let Some(sink) = self.sink.upgrade() else {
                        continue;
                    };
                    let queue = self.spawner.spawn_app(Arc::clone(&self.app), scope, sink);
                    *self.queue() = Some(queue);
                }
                Effect::AccessLog {
                    method,
                    path,
                    status,
                } => log_access(&method, &path, status, self.started),
                Effect::StartHeartbeat => {}
            }
        }
    }
}

/// Emits one access log line: `METHOD /path - STATUS (duration)`.
pub(crate) fn log_access(method: &Method, path: &str, status: Option<u16>, started: Instant) {
    let duration = started.elapsed();
    match status {
        Some(status) => info!("{} {} - {} ({:?})", method, path, status, duration),
        None => info!("{} {} - disconnected ({:?})", method, path, duration),
    }
}

/// `true` when `server_names` is empty or the request's host is listed.
pub(crate) fn valid_server_name(config: &Config, headers: &Headers) -> bool {
    if config.server_names.is_empty() {
        return true;
    }
    let host = headers.get("host").unwrap_or_default();
    config.server_names.iter().any(|name| name == host)
}

/// The response sent when the server answers on the application's behalf.
pub(crate) fn error_response(stream_id: u32, status: StatusCode) -> [ProtocolEvent; 2] {
    let headers: Headers = [("content-length", "0"), ("connection", "close")]
        .into_iter()
        .collect();
    [
        ProtocolEvent::Response {
            stream_id,
            headers,
            status_code: status,
        },
        ProtocolEvent::EndBody { stream_id },
    ]
}

/// Request data shared by HTTP and WebSocket scopes.
#[derive(Debug, Clone)]
pub(crate) struct RequestTarget {
    pub path: String,
    pub raw_path: String,
    pub query_string: String,
}

impl RequestTarget {
    pub(crate) fn parse(raw: &str) -> Self {
        let (path, query) = crate::http::request::split_target(raw);
        Self {
            path: crate::http::request::unquote_path(path),
            raw_path: path.to_owned(),
            query_string: query.to_owned(),
        }
    }
}

/// Connection addresses copied into every scope.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Peers {
    pub client: Option<SocketAddr>,
    pub server: Option<SocketAddr>,
}

impl From<&ProtocolContext> for Peers {
    fn from(ctx: &ProtocolContext) -> Self {
        Self {
            client: ctx.client,
            server: ctx.server,
        }
    }
}
