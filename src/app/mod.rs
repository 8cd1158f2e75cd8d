//! The application contract.
//!
//! Every logical stream (an HTTP request, a WebSocket session) and the
//! process lifespan are handed to the application as a call with three
//! arguments:
//!
//! - a [`Scope`] describing the exchange, built once and never mutated;
//! - a [`Receiver`] yielding [`InboundMessage`]s from the client;
//! - a [`Sender`] accepting [`OutboundMessage`]s for the client.
//!
//! The application signals completion by returning. Any closure of the right
//! shape is an [`App`]:
//!
//! ```rust
//! use muxserve::app::{AppError, InboundMessage, OutboundMessage, Receiver, Scope, Sender};
//! use muxserve::http::Headers;
//!
//! async fn hello(scope: Scope, _rx: Receiver, tx: Sender) -> Result<(), AppError> {
//!     if let Scope::Http(_) = scope {
//!         tx.send(OutboundMessage::HttpResponseStart {
//!             status: 200,
//!             headers: Headers::new(),
//!             trailers: false,
//!         })
//!         .await?;
//!         tx.send(OutboundMessage::HttpResponseBody {
//!             body: "hello".into(),
//!             more_body: false,
//!         })
//!         .await?;
//!     }
//!     Ok(())
//! }
//!
//! fn assert_app<A: muxserve::app::App>(_: A) {}
//! assert_app(hello);
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::http::headers::HeaderError;
use crate::http::{Headers, HttpVersion, Method};
use crate::realtime::HandshakeError;

/// Error type returned by applications.
pub type AppError = Box<dyn std::error::Error + Send + Sync>;

/// Boxed future returned by [`App::call`].
pub type AppFuture = Pin<Box<dyn Future<Output = Result<(), AppError>> + Send>>;

/// A shared, type-erased application.
pub type SharedApp = Arc<dyn App>;

/// An application callable.
///
/// Any `Fn(Scope, Receiver, Sender) -> impl Future<Output = Result<(), AppError>> + Send`
/// that is also `Send + Sync + 'static` implements this trait automatically via
/// the blanket impl below.
pub trait App: Send + Sync + 'static {
    /// Call the application for one stream, boxing the returned future.
    fn call(&self, scope: Scope, receive: Receiver, send: Sender) -> AppFuture;
}

impl<T, F> App for T
where
    T: Fn(Scope, Receiver, Sender) -> F + Send + Sync + 'static,
    F: Future<Output = Result<(), AppError>> + Send + 'static,
{
    fn call(&self, scope: Scope, receive: Receiver, send: Sender) -> AppFuture {
        Box::pin((self)(scope, receive, send))
    }
}

// ── Scopes ────────────────────────────────────────────────────────────────────

/// Describes one logical exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum Scope {
    Http(HttpScope),
    Websocket(WebsocketScope),
    Lifespan,
}

/// Capability flags for optional HTTP response messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HttpExtensions {
    pub http_response_push: bool,
    pub http_response_early_hint: bool,
    pub http_response_trailers: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpScope {
    pub http_version: HttpVersion,
    pub method: Method,
    pub scheme: &'static str,
    /// Percent-decoded path.
    pub path: String,
    /// Path exactly as sent, without the query string.
    pub raw_path: String,
    pub query_string: String,
    pub headers: Headers,
    pub client: Option<SocketAddr>,
    pub server: Option<SocketAddr>,
    pub extensions: HttpExtensions,
}

/// Capability flags for WebSocket scopes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WebsocketExtensions {
    /// The application may reject the upgrade with a full HTTP response.
    pub websocket_http_response: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WebsocketScope {
    pub http_version: HttpVersion,
    pub scheme: &'static str,
    pub path: String,
    pub raw_path: String,
    pub query_string: String,
    pub headers: Headers,
    pub client: Option<SocketAddr>,
    pub server: Option<SocketAddr>,
    pub subprotocols: Vec<String>,
    pub extensions: WebsocketExtensions,
}

// ── Messages ──────────────────────────────────────────────────────────────────

/// A WebSocket message payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    Bytes(Bytes),
    Text(String),
}

/// Messages delivered to the application by [`Receiver::receive`].
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    HttpRequest { body: Bytes, more_body: bool },
    HttpDisconnect,
    WebsocketConnect,
    WebsocketReceive(WsMessage),
    WebsocketDisconnect { code: u16 },
    LifespanStartup,
    LifespanShutdown,
}

/// Messages the application sends with [`Sender::send`].
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    HttpResponseStart {
        status: u16,
        headers: Headers,
        /// Announce that trailers follow the body.
        trailers: bool,
    },
    HttpResponseBody {
        body: Bytes,
        more_body: bool,
    },
    HttpResponsePush {
        path: String,
        headers: Headers,
    },
    HttpResponseEarlyHint {
        links: Vec<String>,
    },
    HttpResponseTrailers {
        headers: Headers,
        more_trailers: bool,
    },
    WebsocketAccept {
        subprotocol: Option<String>,
        headers: Headers,
    },
    WebsocketSend(WsMessage),
    WebsocketClose {
        code: u16,
        reason: Option<String>,
    },
    WebsocketHttpResponseStart {
        status: u16,
        headers: Headers,
    },
    WebsocketHttpResponseBody {
        body: Bytes,
        more_body: bool,
    },
    LifespanStartupComplete,
    LifespanStartupFailed {
        message: String,
    },
    LifespanShutdownComplete,
    LifespanShutdownFailed {
        message: String,
    },
}

impl OutboundMessage {
    /// The message type name, e.g. `"http.response.start"`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::HttpResponseStart { .. } => "http.response.start",
            Self::HttpResponseBody { .. } => "http.response.body",
            Self::HttpResponsePush { .. } => "http.response.push",
            Self::HttpResponseEarlyHint { .. } => "http.response.early_hint",
            Self::HttpResponseTrailers { .. } => "http.response.trailers",
            Self::WebsocketAccept { .. } => "websocket.accept",
            Self::WebsocketSend(_) => "websocket.send",
            Self::WebsocketClose { .. } => "websocket.close",
            Self::WebsocketHttpResponseStart { .. } => "websocket.http.response.start",
            Self::WebsocketHttpResponseBody { .. } => "websocket.http.response.body",
            Self::LifespanStartupComplete => "lifespan.startup.complete",
            Self::LifespanStartupFailed { .. } => "lifespan.startup.failed",
            Self::LifespanShutdownComplete => "lifespan.shutdown.complete",
            Self::LifespanShutdownFailed { .. } => "lifespan.shutdown.failed",
        }
    }
}

/// Errors returned to the application by [`Sender::send`].
#[derive(Debug, Error)]
pub enum SendError {
    /// The message is not valid in the stream's current state.
    #[error("unexpected message {message} in state {state}")]
    UnexpectedMessage {
        state: &'static str,
        message: &'static str,
    },

    #[error(transparent)]
    InvalidHeaders(#[from] HeaderError),

    #[error("status {0} cannot start a response")]
    InvalidStatus(u16),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),
}

impl SendError {
    pub(crate) fn unexpected(state: &'static str, message: &OutboundMessage) -> Self {
        Self::UnexpectedMessage {
            state,
            message: message.kind(),
        }
    }
}

// ── Channels ──────────────────────────────────────────────────────────────────

/// Consumer of application output. Implemented by stream handlers and the
/// lifespan driver.
pub(crate) trait MessageSink: Send + Sync + 'static {
    /// Handles one outbound message. `None` means the application returned.
    fn app_send(&self, message: Option<OutboundMessage>) -> BoxFuture<'_, Result<(), SendError>>;
}

/// The application's inbound half.
#[derive(Debug)]
pub struct Receiver {
    rx: mpsc::Receiver<InboundMessage>,
}

impl Receiver {
    pub(crate) fn new(rx: mpsc::Receiver<InboundMessage>) -> Self {
        Self { rx }
    }

    /// Waits for the next inbound message.
    ///
    /// Returns `None` once the stream is gone and every queued message has
    /// been delivered.
    pub async fn receive(&mut self) -> Option<InboundMessage> {
        self.rx.recv().await
    }
}

/// The application's outbound half.
#[derive(Clone)]
pub struct Sender {
    sink: Arc<dyn MessageSink>,
}

impl Sender {
    pub(crate) fn new(sink: Arc<dyn MessageSink>) -> Self {
        Self { sink }
    }

    /// Sends one message to the client.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::UnexpectedMessage`] when the message is not valid
    /// in the stream's current state, and the other [`SendError`] variants
    /// for malformed messages.
    pub async fn send(&self, message: OutboundMessage) -> Result<(), SendError> {
        self.sink.app_send(Some(message)).await
    }

    pub(crate) async fn finish(&self) -> Result<(), SendError> {
        self.sink.app_send(None).await
    }
}

impl std::fmt::Debug for Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sender").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<Option<&'static str>>>,
    }

    impl MessageSink for Recording {
        fn app_send(
            &self,
            message: Option<OutboundMessage>,
        ) -> BoxFuture<'_, Result<(), SendError>> {
            self.seen.lock().unwrap().push(message.as_ref().map(OutboundMessage::kind));
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn closure_apps_are_callable() {
        let app = |scope: Scope, mut rx: Receiver, tx: Sender| async move {
            assert_eq!(scope, Scope::Lifespan);
            assert_eq!(rx.receive().await, Some(InboundMessage::LifespanStartup));
            tx.send(OutboundMessage::LifespanStartupComplete).await?;
            Ok::<(), AppError>(())
        };

        let sink = Arc::new(Recording::default());
        let (tx, rx) = mpsc::channel(1);
        tx.send(InboundMessage::LifespanStartup).await.unwrap();
        let sender = Sender::new(sink.clone());
        App::call(&app, Scope::Lifespan, Receiver::new(rx), sender.clone())
            .await
            .unwrap();
        sender.finish().await.unwrap();

        let seen = sink.seen.lock().unwrap().clone();
        assert_eq!(seen, vec![Some("lifespan.startup.complete"), None]);
    }

    #[test]
    fn unexpected_message_display() {
        let err = SendError::unexpected(
            "CLOSED",
            &OutboundMessage::HttpResponseBody {
                body: Bytes::new(),
                more_body: false,
            },
        );
        assert_eq!(
            err.to_string(),
            "unexpected message http.response.body in state CLOSED"
        );
    }
}
