//! The connection driver.
//!
//! A [`Server`] owns one accepted byte stream. It reads from the socket and
//! feeds the protocol engine, writes whatever the engine produces under a
//! single write lock, and runs the idle timer. When the read loop stops it
//! closes the engine, joins every task the connection started and shuts the
//! socket down.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::BytesMut;
use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::app::SharedApp;
use crate::background::{Event, TaskHandle, TaskSpawner};
use crate::config::{Config, ConfigError};
use crate::context::WorkerContext;
use crate::events::ServerEvent;
use crate::lifespan::LifespanError;
use crate::protocol::{ConnectionSink, ProtocolContext, ProtocolWrapper};

pub mod listener;
pub mod worker;

pub use listener::serve_listener;
pub use worker::{serve_listeners, worker_serve};

/// Errors produced while serving.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to accept connection: {0}")]
    Accept(#[source] std::io::Error),

    #[error(transparent)]
    Lifespan(#[from] LifespanError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Upper bound on a single socket read.
const MAX_RECV: usize = 64 * 1024;

/// Serves one connection.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use muxserve::app::{AppError, Receiver, Scope, SharedApp, Sender};
/// use muxserve::config::Config;
/// use muxserve::context::WorkerContext;
/// use muxserve::server::Server;
/// use tokio::net::TcpListener;
///
/// # async fn run() -> std::io::Result<()> {
/// let app: SharedApp = Arc::new(|_: Scope, _: Receiver, _: Sender| async { Ok::<(), AppError>(()) });
/// let config = Arc::new(Config::default());
/// let context = Arc::new(WorkerContext::default());
///
/// let listener = TcpListener::bind("127.0.0.1:8000").await?;
/// let (stream, peer) = listener.accept().await?;
/// let local = stream.local_addr().ok();
/// Server::new(app, config, context, stream)
///     .with_peers(Some(peer), local)
///     .serve()
///     .await;
/// # Ok(())
/// # }
/// ```
pub struct Server<S> {
    app: SharedApp,
    config: Arc<Config>,
    context: Arc<WorkerContext>,
    io: S,
    client: Option<SocketAddr>,
    server: Option<SocketAddr>,
    alpn: Option<String>,
}

impl<S> std::fmt::Debug for Server<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("client", &self.client)
            .field("server", &self.server)
            .field("alpn", &self.alpn)
            .finish_non_exhaustive()
    }
}

impl<S> Server<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(app: SharedApp, config: Arc<Config>, context: Arc<WorkerContext>, io: S) -> Self {
        Self {
            app,
            config,
            context,
            io,
            client: None,
            server: None,
            alpn: None,
        }
    }

    /// Addresses reported in request scopes.
    pub fn with_peers(mut self, client: Option<SocketAddr>, server: Option<SocketAddr>) -> Self {
        self.client = client;
        self.server = server;
        self
    }

    /// The protocol negotiated by TLS ALPN. `"h2"` starts on HTTP/2.
    pub fn with_alpn(mut self, protocol: impl Into<String>) -> Self {
        self.alpn = Some(protocol.into());
        self
    }

    /// Serves the connection until it closes.
    pub async fn serve(self) {
        let (mut reader, writer) = tokio::io::split(self.io);
        let closing = Arc::new(Event::new());
        let spawner = TaskSpawner::new(self.config.max_app_queue_size);

        let driver = Arc::new(Driver {
            writer: AsyncMutex::new(Some(writer)),
            closing: Arc::clone(&closing),
            spawner: spawner.clone(),
            context: Arc::clone(&self.context),
            keep_alive_timeout: self.config.keep_alive_timeout(),
            idle_timer: Mutex::new(None),
            peer: self.client,
        });
        driver.start_idle_timer();

        let ctx = ProtocolContext {
            app: self.app,
            config: Arc::clone(&self.config),
            context: self.context,
            spawner: spawner.clone(),
            client: self.client,
            server: self.server,
            sink: driver.clone(),
            closing: Arc::clone(&closing),
        };
        let mut protocol = ProtocolWrapper::new(ctx, self.alpn.as_deref()).await;
        debug!(peer = ?self.client, protocol = protocol.name(), "connection opened");

        let read_timeout = self.config.read_timeout();
        let mut buf = BytesMut::with_capacity(MAX_RECV);
        loop {
            let read = tokio::select! {
                () = closing.wait() => break,
                read = read_some(&mut reader, &mut buf, read_timeout) => read,
            };
            match read {
                Ok(0) => {
                    debug!(peer = ?self.client, "connection closed by peer");
                    break;
                }
                Ok(_) => {
                    let data = buf.split().freeze();
                    protocol
                        .handle(ServerEvent::RawData {
                            data,
                            peer_addr: self.client,
                        })
                        .await;
                }
                Err(e) => {
                    debug!(peer = ?self.client, error = %e, "read failed");
                    break;
                }
            }
        }

        // The timer only requests a close; the close itself happens here.
        driver.cancel_idle_timer();
        protocol.handle(ServerEvent::Closed).await;
        spawner.join(self.config.graceful_timeout()).await;
        driver.shutdown().await;
        debug!(peer = ?self.client, "connection closed");
    }
}

async fn read_some<R>(reader: &mut ReadHalf<R>, buf: &mut BytesMut, timeout: Option<Duration>) -> std::io::Result<usize>
where
    R: AsyncRead,
{
    buf.reserve(MAX_RECV);
    let mut limited = (&mut *reader).take(MAX_RECV as u64);
    let read = limited.read_buf(buf);
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, read)
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "read timed out"))?,
        None => read.await,
    }
}

/// The write half of a connection, as seen by its engine.
struct Driver<W> {
    writer: AsyncMutex<Option<WriteHalf<W>>>,
    closing: Arc<Event>,
    spawner: TaskSpawner,
    context: Arc<WorkerContext>,
    keep_alive_timeout: Duration,
    idle_timer: Mutex<Option<TaskHandle>>,
    peer: Option<SocketAddr>,
}

impl<W> Driver<W>
where
    W: AsyncRead + AsyncWrite + Send + 'static,
{
    fn idle_timer(&self) -> MutexGuard<'_, Option<TaskHandle>> {
        self.idle_timer.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Requests a close after `keep_alive_timeout`, or as soon as the worker
    /// starts shutting down.
    fn start_idle_timer(&self) {
        let closing = Arc::clone(&self.closing);
        let context = Arc::clone(&self.context);
        let timeout = self.keep_alive_timeout;
        let peer = self.peer;
        let handle = self.spawner.start(async move {
            tokio::select! {
                () = tokio::time::sleep(timeout) => debug!(peer = ?peer, "idle timeout"),
                () = context.terminated().wait() => {}
            }
            closing.set();
        });
        if let Some(previous) = self.idle_timer().replace(handle) {
            previous.cancel();
        }
    }

    fn cancel_idle_timer(&self) {
        if let Some(timer) = self.idle_timer().take() {
            timer.cancel();
        }
    }

    async fn write(&self, data: &[u8]) {
        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            return;
        };
        let written = async {
            stream.write_all(data).await?;
            stream.flush().await
        }
        .await;
        if let Err(e) = written {
            debug!(peer = ?self.peer, error = %e, "write failed; closing connection");
            self.closing.set();
        }
    }

    async fn shutdown(&self) {
        if let Some(mut stream) = self.writer.lock().await.take() {
            let _ = stream.shutdown().await;
        }
    }
}

impl<W> ConnectionSink for Driver<W>
where
    W: AsyncRead + AsyncWrite + Send + 'static,
{
    fn send(&self, event: ServerEvent) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            match event {
                ServerEvent::RawData { data, .. } => self.write(&data).await,
                ServerEvent::Closed => {
                    self.closing.set();
                }
                ServerEvent::Updated { idle: true } => self.start_idle_timer(),
                ServerEvent::Updated { idle: false } => self.cancel_idle_timer(),
            }
        })
    }
}
