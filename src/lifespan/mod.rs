//! The lifespan handshake.
//!
//! The application is called once with [`Scope::Lifespan`] for the whole life
//! of a worker. The worker sends `lifespan.startup` before accepting and
//! `lifespan.shutdown` after draining, and waits for the matching
//! `*.complete` or `*.failed` reply. An application that returns without ever
//! answering is treated as not supporting lifespan.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::app::{InboundMessage, MessageSink, OutboundMessage, Receiver, Scope, SendError, Sender, SharedApp};

/// Which half of the handshake failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Startup,
    Shutdown,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Startup => "startup",
            Self::Shutdown => "shutdown",
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifespanError {
    #[error("timeout during lifespan {stage}")]
    Timeout { stage: Stage },

    #[error("lifespan {stage} failed: {message}")]
    Failure { stage: Stage, message: String },
}

/// What the application did, as seen by the driver.
#[derive(Debug)]
enum Reply {
    Complete(Stage),
    Failed(Stage, String),
    /// The application returned.
    Finished,
}

struct LifespanSink {
    replies: mpsc::UnboundedSender<Reply>,
}

impl MessageSink for LifespanSink {
    fn app_send(&self, message: Option<OutboundMessage>) -> BoxFuture<'_, Result<(), SendError>> {
        let reply = match message {
            None => Ok(Reply::Finished),
            Some(OutboundMessage::LifespanStartupComplete) => Ok(Reply::Complete(Stage::Startup)),
            Some(OutboundMessage::LifespanShutdownComplete) => Ok(Reply::Complete(Stage::Shutdown)),
            Some(OutboundMessage::LifespanStartupFailed { message }) => Ok(Reply::Failed(Stage::Startup, message)),
            Some(OutboundMessage::LifespanShutdownFailed { message }) => {
                Ok(Reply::Failed(Stage::Shutdown, message))
            }
            Some(other) => Err(SendError::unexpected("lifespan", &other)),
        };
        Box::pin(async move {
            // The driver may already be gone after shutdown.
            let _ = self.replies.send(reply?);
            Ok(())
        })
    }
}

/// Drives one application's lifespan.
pub struct Lifespan {
    app: SharedApp,
    startup_timeout: Duration,
    shutdown_timeout: Duration,
    queue: Option<mpsc::Sender<InboundMessage>>,
    replies: Option<mpsc::UnboundedReceiver<Reply>>,
    task: Option<JoinHandle<()>>,
    supported: bool,
}

impl fmt::Debug for Lifespan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifespan")
            .field("supported", &self.supported)
            .finish_non_exhaustive()
    }
}

impl Lifespan {
    pub fn new(app: SharedApp, startup_timeout: Duration, shutdown_timeout: Duration) -> Self {
        Self {
            app,
            startup_timeout,
            shutdown_timeout,
            queue: None,
            replies: None,
            task: None,
            supported: true,
        }
    }

    /// `false` once the application returned without answering startup.
    pub fn is_supported(&self) -> bool {
        self.supported
    }

    /// Starts the application and waits for `lifespan.startup.complete`.
    ///
    /// # Errors
    ///
    /// [`LifespanError::Timeout`] when no answer arrives within the startup
    /// timeout, [`LifespanError::Failure`] when the application reports
    /// `lifespan.startup.failed`.
    pub async fn startup(&mut self) -> Result<(), LifespanError> {
        let (queue_tx, queue_rx) = mpsc::channel(2);
        let (replies_tx, replies_rx) = mpsc::unbounded_channel();
        let sender = Sender::new(Arc::new(LifespanSink { replies: replies_tx }));
        let call = self.app.call(Scope::Lifespan, Receiver::new(queue_rx), sender.clone());

        self.task = Some(tokio::spawn(async move {
            match AssertUnwindSafe(call).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "lifespan application failed"),
                Err(_) => error!("lifespan application panicked"),
            }
            let _ = sender.finish().await;
        }));
        self.replies = Some(replies_rx);

        // Queue capacity is 2, so this never waits.
        let _ = queue_tx.send(InboundMessage::LifespanStartup).await;
        self.queue = Some(queue_tx);
        self.wait_for(Stage::Startup, self.startup_timeout).await
    }

    /// Sends `lifespan.shutdown` and waits for the answer, then for the
    /// application to return.
    ///
    /// # Errors
    ///
    /// As for [`startup`](Self::startup), for the shutdown stage.
    pub async fn shutdown(&mut self) -> Result<(), LifespanError> {
        if !self.supported {
            return Ok(());
        }
        let Some(queue) = self.queue.take() else {
            return Ok(());
        };
        if queue.send(InboundMessage::LifespanShutdown).await.is_err() {
            debug!("lifespan application already returned");
            return Ok(());
        }
        drop(queue);
        let result = self.wait_for(Stage::Shutdown, self.shutdown_timeout).await;
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(self.shutdown_timeout, &mut task).await.is_err() {
                debug!("lifespan application still running after shutdown; aborting it");
                task.abort();
            }
        }
        result
    }

    async fn wait_for(&mut self, stage: Stage, timeout: Duration) -> Result<(), LifespanError> {
        let Some(replies) = self.replies.as_mut() else {
            return Ok(());
        };
        let answer = tokio::time::timeout(timeout, async {
            loop {
                match replies.recv().await {
                    Some(Reply::Complete(done)) if done == stage => return Ok(true),
                    Some(Reply::Failed(failed, message)) if failed == stage => {
                        return Err(LifespanError::Failure { stage, message });
                    }
                    Some(Reply::Complete(_) | Reply::Failed(..)) => {}
                    Some(Reply::Finished) | None => return Ok(false),
                }
            }
        })
        .await
        .map_err(|_| LifespanError::Timeout { stage })?;

        match answer {
            Ok(true) => Ok(()),
            Ok(false) if stage == Stage::Startup => {
                warn!("application returned during lifespan startup; continuing without lifespan support");
                self.supported = false;
                self.queue = None;
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for Lifespan {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
