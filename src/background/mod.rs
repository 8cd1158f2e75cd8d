//! Background tasks: the per-connection structured task scope.
//!
//! Every task a connection starts (application invocations, the HTTP/2 send
//! loop, WebSocket heartbeats, the idle timer) lives in the connection's
//! [`TaskSpawner`]. [`TaskSpawner::join`] waits for all of them, including
//! tasks spawned while joining, and aborts whatever is still running at the
//! deadline. Nothing outlives the connection.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::app::{InboundMessage, MessageSink, Receiver, Scope, Sender, SharedApp};

pub mod event;

pub use event::Event;

/// Queue feeding messages into one application invocation.
pub type AppQueue = mpsc::Sender<InboundMessage>;

/// Handle to a task started with [`TaskSpawner::start`].
#[derive(Debug)]
pub struct TaskHandle {
    handle: Option<AbortHandle>,
}

impl TaskHandle {
    /// Cancels the task. Cancelling a finished task is a no-op.
    pub fn cancel(&self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(AbortHandle::is_finished)
    }
}

/// The structured-concurrency scope of one connection.
#[derive(Debug, Clone)]
pub struct TaskSpawner {
    tasks: Arc<Mutex<Option<JoinSet<()>>>>,
    queue_size: usize,
}

impl TaskSpawner {
    /// Creates a scope whose application queues hold `queue_size` messages.
    pub fn new(queue_size: usize) -> Self {
        Self {
            tasks: Arc::new(Mutex::new(Some(JoinSet::new()))),
            queue_size: queue_size.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<JoinSet<()>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Starts `app` for one stream and returns the queue that feeds it.
    ///
    /// When the application returns, fails or panics, `sink` receives a final
    /// `None` so the stream can clean up.
    pub(crate) fn spawn_app(
        &self,
        app: SharedApp,
        scope: Scope,
        sink: Arc<dyn MessageSink>,
    ) -> AppQueue {
        let (tx, rx) = mpsc::channel(self.queue_size);
        let sender = Sender::new(sink);
        self.spawn(async move {
            let call = app.call(scope, Receiver::new(rx), sender.clone());
            match AssertUnwindSafe(call).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "application failed"),
                Err(_) => error!("application panicked"),
            }
            if let Err(e) = sender.finish().await {
                warn!(error = %e, "cleanup after application exit failed");
            }
        });
        tx
    }

    /// Starts an untracked background task.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.start(future);
    }

    /// Starts a task that can be cancelled on its own.
    ///
    /// Once the scope has been joined, new tasks are dropped without running.
    pub fn start<F>(&self, future: F) -> TaskHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut guard = self.lock();
        match guard.as_mut() {
            Some(set) => {
                reap(set);
                TaskHandle {
                    handle: Some(set.spawn(future)),
                }
            }
            None => {
                debug!("task spawned after scope closed; dropping it");
                TaskHandle { handle: None }
            }
        }
    }

    /// Waits for every task in the scope, then closes it.
    ///
    /// Tasks still running after `grace` are aborted.
    pub async fn join(&self, grace: Duration) {
        let deadline = Instant::now() + grace;
        loop {
            let mut set = {
                let mut guard = self.lock();
                match guard.as_mut() {
                    Some(set) if !set.is_empty() => std::mem::take(set),
                    _ => break,
                }
            };

            let drained = tokio::time::timeout_at(deadline, async {
                while let Some(result) = set.join_next().await {
                    log_outcome(result);
                }
            })
            .await;

            if drained.is_err() {
                debug!(remaining = set.len(), "grace period elapsed; aborting tasks");
                set.shutdown().await;
                break;
            }
        }

        let leftover = self.lock().take();
        if let Some(mut set) = leftover {
            set.shutdown().await;
        }
    }

    /// Returns `true` once [`join`](Self::join) has closed the scope.
    pub fn is_closed(&self) -> bool {
        self.lock().is_none()
    }
}

/// Drops tasks that already finished or were cancelled.
fn reap(set: &mut JoinSet<()>) {
    while let Some(result) = set.try_join_next() {
        log_outcome(result);
    }
}

fn log_outcome(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!(error = %e, "connection task panicked");
        }
    }
}
