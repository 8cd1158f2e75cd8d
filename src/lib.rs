//! # muxserve
//!
//! A connection-level HTTP/1.1, HTTP/2 and WebSocket server engine.
//!
//! Every request or WebSocket session is handed to an application as a
//! [`Scope`](app::Scope) plus a [`Receiver`](app::Receiver) and a
//! [`Sender`](app::Sender). HTTP/1.1 connections upgrade to HTTP/2 (`h2c` or
//! prior knowledge) in place; WebSockets run over HTTP/1.1 upgrades and
//! HTTP/2 extended CONNECT.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use muxserve::app::{AppError, OutboundMessage, Receiver, Scope, Sender, SharedApp};
//! use muxserve::config::Config;
//! use muxserve::http::Headers;
//! use muxserve::server::worker_serve;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let app: SharedApp = Arc::new(|scope: Scope, _rx: Receiver, tx: Sender| async move {
//!         if let Scope::Http(_) = scope {
//!             tx.send(OutboundMessage::HttpResponseStart {
//!                 status: 200,
//!                 headers: Headers::new(),
//!                 trailers: false,
//!             })
//!             .await?;
//!             tx.send(OutboundMessage::HttpResponseBody {
//!                 body: "Hello, World!".into(),
//!                 more_body: false,
//!             })
//!             .await?;
//!         }
//!         Ok::<(), AppError>(())
//!     });
//!     worker_serve(app, Config::default(), std::future::pending()).await?;
//!     Ok(())
//! }
//! ```

// ── Wire layers ───────────────────────────────────────────────────────────────
pub mod http;
pub mod protocol;
pub mod realtime;

// ── Application-facing surface ────────────────────────────────────────────────
pub mod app;
pub mod config;
pub mod events;
pub mod lifespan;

// ── Connection machinery ──────────────────────────────────────────────────────
pub mod background;
pub mod context;
pub mod server;
pub mod streams;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use app::{App, AppError, InboundMessage, OutboundMessage, Receiver, Scope, Sender, SharedApp};
pub use config::Config;
pub use context::WorkerContext;
pub use http::{Headers, Method, StatusCode};
pub use server::{Server, ServerError, worker_serve};
