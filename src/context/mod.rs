//! Per-worker shared state.
//!
//! One [`WorkerContext`] is created per worker and passed by `Arc` into every
//! listener and connection. It counts requests across all connections and
//! carries two one-way latches:
//!
//! - `terminate`: set once the worker's request budget is spent; the worker
//!   reacts by starting a graceful shutdown.
//! - `terminated`: set once graceful shutdown has begun; connections stop
//!   recycling, HTTP/2 refuses new streams and idle connections close.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::info;

use crate::background::Event;
use crate::config::Config;

#[derive(Debug)]
pub struct WorkerContext {
    max_requests: Option<u64>,
    requests: AtomicU64,
    terminate: Event,
    terminated: Event,
}

impl WorkerContext {
    /// Creates a context with an optional request budget.
    pub fn new(max_requests: Option<u64>) -> Self {
        Self {
            max_requests,
            requests: AtomicU64::new(0),
            terminate: Event::new(),
            terminated: Event::new(),
        }
    }

    /// Creates a context whose budget is `max_requests` plus jitter.
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.effective_max_requests())
    }

    /// Records one request. Safe to call concurrently from every stream.
    ///
    /// Once `max_requests` requests have been seen, `terminate` is set. The
    /// latch is never cleared.
    pub fn mark_request(&self) {
        let seen = self.requests.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(max) = self.max_requests {
            if seen >= max && self.terminate.set() {
                info!(requests = seen, max_requests = max, "request budget reached; terminating worker");
            }
        }
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Acquire)
    }

    pub fn max_requests(&self) -> Option<u64> {
        self.max_requests
    }

    /// Latch set when the worker should shut down.
    pub fn terminate(&self) -> &Event {
        &self.terminate
    }

    /// Latch set once graceful shutdown has begun.
    pub fn terminated(&self) -> &Event {
        &self.terminated
    }
}

impl Default for WorkerContext {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn unlimited_never_terminates() {
        let ctx = WorkerContext::default();
        for _ in 0..1000 {
            ctx.mark_request();
        }
        assert_eq!(ctx.requests(), 1000);
        assert!(!ctx.terminate().is_set());
    }

    #[test]
    fn single_request_budget() {
        let ctx = WorkerContext::new(Some(1));
        assert!(!ctx.terminate().is_set());
        ctx.mark_request();
        assert!(ctx.terminate().is_set());
    }

    #[tokio::test]
    async fn concurrent_marks_latch_once() {
        let ctx = Arc::new(WorkerContext::new(Some(50)));
        let mut tasks = Vec::new();
        for _ in 0..10 {
            let ctx = Arc::clone(&ctx);
            tasks.push(tokio::spawn(async move {
                for _ in 0..10 {
                    ctx.mark_request();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(ctx.requests(), 100);
        assert!(ctx.terminate().is_set());
        // Latch stays set; setting again reports no change.
        assert!(!ctx.terminate().set());
    }
}
