//! Batching and throttling combinators
//!
//! [`batch`] coalesces a burst of items into one handler call after a fixed
//! window from the first item. [`throttled`] derives a watch channel that
//! follows its source at most once per window, always settling on the
//! latest value.

use std::future::Future;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::trace;

/// Sender side of a running batch loop
pub struct Batch<T> {
    tx: mpsc::UnboundedSender<T>,
    task: JoinHandle<()>,
}

impl<T: Send + 'static> Batch<T> {
    /// Queue one item. Returns false once the loop has stopped.
    pub fn push(&self, item: T) -> bool {
        self.tx.send(item).is_ok()
    }

    pub fn extend(&self, items: impl IntoIterator<Item = T>) -> bool {
        items.into_iter().all(|item| self.push(item))
    }

    /// Stop accepting items, flush whatever is pending, and wait for the
    /// last handler call to finish
    pub async fn close(self) {
        let Batch { tx, task } = self;
        drop(tx);
        let _ = task.await;
    }
}

/// Spawn a loop that hands `handler` every item received within `window`
/// of the first un-flushed item.
///
/// The handler is awaited before the next batch starts, so at most one
/// flush is ever in flight. Items that arrive during a flush are held for
/// the next batch.
pub fn batch<T, F, Fut>(window: Duration, mut handler: F) -> Batch<T>
where
    T: Send + 'static,
    F: FnMut(Vec<T>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<T>();

    let task = tokio::spawn(async move {
        while let Some(first) = rx.recv().await {
            let mut pending = vec![first];
            let deadline = sleep_until(Instant::now() + window);
            tokio::pin!(deadline);

            let closed = loop {
                tokio::select! {
                    biased;
                    _ = &mut deadline => break false,
                    item = rx.recv() => match item {
                        Some(item) => pending.push(item),
                        None => break true,
                    },
                }
            };

            trace!(items = pending.len(), "Flushing batch");
            handler(pending).await;

            if closed {
                break;
            }
        }
    });

    Batch { tx, task }
}

/// A source value republished at most once per window
pub struct Throttled<T> {
    rx: watch::Receiver<T>,
    task: JoinHandle<()>,
}

impl<T: Clone> Throttled<T> {
    /// Wait for the next emission. Returns false once the source is gone
    /// and the last value has been delivered.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }

    /// Latest emitted value, marking it seen
    pub fn latest(&mut self) -> T {
        self.rx.borrow_and_update().clone()
    }

    pub fn receiver(&self) -> watch::Receiver<T> {
        self.rx.clone()
    }
}

impl<T> Drop for Throttled<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Follow `source`, emitting the latest value `window` after the first
/// change in each quiet period.
pub fn throttled<T>(window: Duration, mut source: watch::Receiver<T>) -> Throttled<T>
where
    T: Clone + Send + Sync + 'static,
{
    let (tx, rx) = watch::channel(source.borrow_and_update().clone());

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = source.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tx.closed() => break,
            }

            tokio::time::sleep(window).await;

            let latest = source.borrow_and_update().clone();
            if tx.send(latest).is_err() {
                break;
            }
        }
    });

    Throttled { rx, task }
}
