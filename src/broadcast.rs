//! Best-effort text broadcast to connected clients. No persistence, no
//! replay: a publisher with no live subscribers just drops the message.
//! The HTTP/WebSocket facade that actually owns browser sockets lives
//! outside this crate; it drives the bus through `subscribe()`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Semaphore};

const CHANNEL_CAPACITY: usize = 256;
const MAX_CONCURRENT_PUBLISHES: usize = 6;

pub struct Broadcast {
    sender: broadcast::Sender<String>,
    subscriber_count: AtomicUsize,
    permits: Arc<Semaphore>,
}

impl Broadcast {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Broadcast {
            sender,
            subscriber_count: AtomicUsize::new(0),
            permits: Arc::new(Semaphore::new(MAX_CONCURRENT_PUBLISHES)),
        }
    }

    /// Registers a new subscriber. Dropping the returned receiver
    /// decrements nothing automatically; callers should call
    /// [`Broadcast::unsubscribe`] on disconnect.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.subscriber_count.fetch_add(1, Ordering::SeqCst);
        self.sender.subscribe()
    }

    pub fn unsubscribe(&self) {
        self.subscriber_count.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriber_count.load(Ordering::SeqCst)
    }

    /// Publishes `text`. Returns immediately if there are no subscribers;
    /// a send error (no receivers left) is swallowed, matching
    /// best-effort delivery. Concurrent publishes are bounded by a
    /// semaphore so a burst of events can't pile up unbounded senders.
    pub async fn publish(&self, text: impl Into<String>) {
        if self.subscriber_count() == 0 {
            return;
        }
        let _permit = self.permits.acquire().await.expect("semaphore never closed");
        let _ = self.sender.send(text.into());
    }
}

impl Default for Broadcast {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_with_no_subscribers_is_a_noop() {
        let bus = Broadcast::new();
        bus.publish("hello").await;
    }

    #[tokio::test]
    async fn subscriber_receives_published_message() {
        let bus = Broadcast::new();
        let mut rx = bus.subscribe();
        bus.publish("welcome").await;
        assert_eq!(rx.recv().await.unwrap(), "welcome");
    }

    #[tokio::test]
    async fn unsubscribe_decrements_count() {
        let bus = Broadcast::new();
        let _rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        bus.unsubscribe();
        assert_eq!(bus.subscriber_count(), 0);
    }
}
