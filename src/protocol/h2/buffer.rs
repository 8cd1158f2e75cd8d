//! Per-stream outbound buffering with backpressure.

use std::sync::{Mutex, MutexGuard};

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use crate::background::Event;

/// Pushers wait once this many bytes are buffered.
pub const HIGH_WATER: usize = 2 * 16_384;
/// Waiting pushers resume once the buffer drains below this.
pub const LOW_WATER: usize = HIGH_WATER / 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("stream buffer is already complete")]
pub struct BufferCompleteError;

#[derive(Debug, Default)]
struct Inner {
    data: BytesMut,
    complete: bool,
}

/// Body bytes a stream has produced but the send loop has not yet framed.
#[derive(Debug)]
pub struct StreamBuffer {
    inner: Mutex<Inner>,
    empty: Event,
    writable: Event,
}

impl Default for StreamBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamBuffer {
    pub fn new() -> Self {
        let buffer = Self {
            inner: Mutex::new(Inner::default()),
            empty: Event::new(),
            writable: Event::new(),
        };
        buffer.empty.set();
        buffer.writable.set();
        buffer
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Appends `data` at once and returns a future that resolves when the
    /// buffer is below the low-water mark again. The future is ready
    /// immediately unless this push reached the high-water mark.
    ///
    /// # Errors
    ///
    /// [`BufferCompleteError`] once [`set_complete`](Self::set_complete) or
    /// [`close`](Self::close) has been called.
    pub fn push(&self, data: Bytes) -> Result<impl Future<Output = ()> + '_, BufferCompleteError> {
        let mut inner = self.lock();
        if inner.complete {
            return Err(BufferCompleteError);
        }
        inner.data.extend_from_slice(&data);
        if !inner.data.is_empty() {
            self.empty.clear();
        }
        if inner.data.len() >= HIGH_WATER {
            self.writable.clear();
        }
        Ok(self.wait_writable())
    }

    pub async fn wait_writable(&self) {
        self.writable.wait().await;
    }

    /// Takes up to `max` bytes from the front.
    pub fn pop(&self, max: usize) -> Bytes {
        let mut inner = self.lock();
        let len = max.min(inner.data.len());
        let data = inner.data.split_to(len).freeze();
        if inner.data.len() < LOW_WATER {
            self.writable.set();
        }
        if inner.data.is_empty() {
            self.empty.set();
        }
        data
    }

    /// No more data will be pushed.
    pub fn set_complete(&self) {
        self.lock().complete = true;
    }

    /// `true` once complete and fully drained.
    pub fn is_complete(&self) -> bool {
        let inner = self.lock();
        inner.complete && inner.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().data.is_empty()
    }

    /// Waits until everything pushed so far has been popped.
    pub async fn drain(&self) {
        self.empty.wait().await;
    }

    /// Discards buffered data and releases every waiter.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.complete = true;
        inner.data.clear();
        self.empty.set();
        self.writable.set();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn push_below_high_water_returns_immediately() {
        let buffer = StreamBuffer::new();
        buffer.push(Bytes::from_static(b"hello")).unwrap().await;
        assert_eq!(buffer.len(), 5);
        assert_eq!(&buffer.pop(3)[..], b"hel");
        assert_eq!(&buffer.pop(10)[..], b"lo");
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn push_blocks_until_drained_below_low_water() {
        let buffer = Arc::new(StreamBuffer::new());
        let pusher = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move { buffer.push(Bytes::from(vec![7; HIGH_WATER + 10])).unwrap().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pusher.is_finished());

        // Still above the low-water mark.
        let first = buffer.pop(16_384);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pusher.is_finished());

        let second = buffer.pop(16_384);
        tokio::time::timeout(Duration::from_secs(1), pusher)
            .await
            .unwrap()
            .unwrap();

        let rest = buffer.pop(usize::MAX);
        assert_eq!(first.len() + second.len() + rest.len(), HIGH_WATER + 10);
        assert!(rest.iter().all(|b| *b == 7));
    }

    #[tokio::test]
    async fn complete_rejects_pushes_and_reports_once_drained() {
        let buffer = StreamBuffer::new();
        buffer.push(Bytes::from_static(b"ab")).unwrap().await;
        buffer.set_complete();
        assert!(!buffer.is_complete());
        assert!(matches!(buffer.push(Bytes::from_static(b"c")), Err(BufferCompleteError)));
        buffer.pop(2);
        assert!(buffer.is_complete());
    }

    #[tokio::test]
    async fn drain_waits_for_the_send_loop() {
        let buffer = Arc::new(StreamBuffer::new());
        buffer.drain().await;
        buffer.push(Bytes::from_static(b"data")).unwrap().await;
        let drained = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move { buffer.drain().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!drained.is_finished());
        buffer.pop(4);
        tokio::time::timeout(Duration::from_secs(1), drained).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn close_releases_a_blocked_pusher() {
        let buffer = Arc::new(StreamBuffer::new());
        let pusher = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move { buffer.push(Bytes::from(vec![0; HIGH_WATER])).unwrap().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!pusher.is_finished());
        buffer.close();
        tokio::time::timeout(Duration::from_secs(1), pusher)
            .await
            .unwrap()
            .unwrap();
        assert!(buffer.is_complete());
    }
}
