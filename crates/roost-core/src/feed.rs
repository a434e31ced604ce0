//! Change notification fan-out.
//!
//! A [`ChangeFeed`] delivers every emitted value to every live
//! [`Subscription`], in emission order. Subscriptions are unbounded so an
//! emitter never blocks on a slow listener; dropping a subscription
//! unregisters it on the next emit.

use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Multi-subscriber change feed
pub struct ChangeFeed<T> {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<T>>>,
}

impl<T: Clone> ChangeFeed<T> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Register a new listener. Only values emitted after this call are seen.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        Subscription { rx }
    }

    /// Deliver `value` to every live subscriber
    pub fn emit(&self, value: T) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(value.clone()).is_ok());
    }

    /// Number of live subscribers as of the last emit
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }
}

impl<T: Clone> Default for ChangeFeed<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving end of a [`ChangeFeed`]
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    /// Wait for the next value. Returns `None` once the feed is dropped.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Take the next value if one is already queued
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready_eq, task};

    #[tokio::test]
    async fn test_fan_out_in_order() {
        let feed = ChangeFeed::new();
        let mut a = feed.subscribe();
        let mut b = feed.subscribe();

        feed.emit(1);
        feed.emit(2);

        assert_eq!(a.recv().await, Some(1));
        assert_eq!(a.recv().await, Some(2));
        assert_eq!(b.recv().await, Some(1));
        assert_eq!(b.recv().await, Some(2));
    }

    #[test]
    fn test_emit_wakes_waiting_subscriber() {
        let feed = ChangeFeed::new();
        let mut sub = feed.subscribe();

        let mut recv = task::spawn(sub.recv());
        assert_pending!(recv.poll());

        feed.emit(7);
        assert!(recv.is_woken());
        assert_ready_eq!(recv.poll(), Some(7));
    }

    #[test]
    fn test_recv_ends_when_feed_dropped() {
        let feed: ChangeFeed<u32> = ChangeFeed::new();
        let mut sub = feed.subscribe();

        let mut recv = task::spawn(sub.recv());
        assert_pending!(recv.poll());

        drop(feed);
        assert!(recv.is_woken());
        assert_ready_eq!(recv.poll(), None);
    }

    #[test]
    fn test_dropped_subscriber_pruned() {
        let feed = ChangeFeed::new();
        let a = feed.subscribe();
        let mut b = feed.subscribe();
        assert_eq!(feed.subscriber_count(), 2);

        drop(a);
        feed.emit("x");
        assert_eq!(feed.subscriber_count(), 1);
        assert_eq!(b.try_recv(), Some("x"));
        assert_eq!(b.try_recv(), None);
    }
}
