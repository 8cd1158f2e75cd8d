//! A resettable, level-triggered async flag.

use tokio::sync::watch;

/// An async event that can be set, cleared and awaited.
///
/// Waiting on an event that is already set returns immediately, so a `set`
/// that happens before `wait` is never lost.
///
/// ```
/// use muxserve::background::Event;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let event = Event::new();
/// assert!(event.set());
/// assert!(!event.set()); // already set
/// event.wait().await;
/// event.clear();
/// assert!(!event.is_set());
/// # }
/// ```
#[derive(Debug)]
pub struct Event {
    tx: watch::Sender<bool>,
}

impl Event {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Sets the event, waking every waiter. Returns `true` if it was not
    /// already set.
    pub fn set(&self) -> bool {
        self.tx.send_if_modified(|value| !std::mem::replace(value, true))
    }

    pub fn clear(&self) {
        self.tx.send_if_modified(|value| std::mem::replace(value, false));
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Waits until the event is set.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|set| *set).await;
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_returns_once_set() {
        let event = Arc::new(Event::new());
        let waiter = {
            let event = Arc::clone(&event);
            tokio::spawn(async move { event.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        event.set();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn clear_rearms() {
        let event = Event::new();
        event.set();
        event.wait().await;
        event.clear();
        assert!(
            tokio::time::timeout(Duration::from_millis(20), event.wait())
                .await
                .is_err()
        );
    }
}
