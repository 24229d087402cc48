//! Shared FIFO work queue with close/exhaustion semantics.
//!
//! The queue is *exhausted* when it is closed, empty, and no delivered
//! item is still in flight. All three are read under the same lock, so a
//! consumer can never observe exhaustion while a sibling is still
//! processing the last item. A dequeued item is handed out as a
//! [`Delivery`]; dropping the delivery settles it.

use std::collections::VecDeque;
use std::sync::Arc;

use opentelemetry::KeyValue;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::ItemId;
use crate::telemetry::metrics;

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<ItemId>,
    closed: bool,
    in_flight: usize,
}

impl QueueState {
    fn is_exhausted(&self) -> bool {
        self.closed && self.items.is_empty() && self.in_flight == 0
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<QueueState>,
    capacity: Option<usize>,
    /// Woken when an item arrives or the queue may have become exhausted.
    readable: Notify,
    /// Woken when space frees up or the queue closes.
    writable: Notify,
}

/// Result of a dequeue.
#[derive(Debug)]
pub enum Dequeued {
    Item(Delivery),
    Exhausted,
}

/// An item handed to exactly one consumer. Settled on drop.
#[derive(Debug)]
pub struct Delivery {
    item: ItemId,
    shared: Arc<Shared>,
}

impl Delivery {
    pub fn item(&self) -> ItemId {
        self.item
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        let exhausted = {
            let mut state = self.shared.state.lock();
            state.in_flight -= 1;
            state.is_exhausted()
        };
        if exhausted {
            // Consumers parked on "closed but still in flight" can now finish.
            self.shared.readable.notify_waiters();
        }
    }
}

/// Concurrency-safe FIFO of work item keys. Cloning shares the same queue.
#[derive(Debug, Clone)]
pub struct WorkQueue {
    shared: Arc<Shared>,
}

impl WorkQueue {
    /// Queue with no capacity limit; `enqueue` never suspends.
    pub fn unbounded() -> Self {
        Self::with_capacity(None)
    }

    /// Queue holding at most `capacity` undelivered items (minimum 1).
    pub fn bounded(capacity: usize) -> Self {
        Self::with_capacity(Some(capacity.max(1)))
    }

    fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                capacity,
                readable: Notify::new(),
                writable: Notify::new(),
            }),
        }
    }

    /// Create a closed queue pre-filled with `items`.
    pub fn from_items(items: impl IntoIterator<Item = ItemId>) -> Self {
        let queue = Self::unbounded();
        {
            let mut state = queue.shared.state.lock();
            state.items.extend(items);
            state.closed = true;
        }
        queue
    }

    pub fn capacity(&self) -> Option<usize> {
        self.shared.capacity
    }

    /// Add an item to the tail, suspending while a bounded queue is full.
    ///
    /// Fails with [`Error::ClosedQueue`] if the queue is closed, including
    /// when it closes while this call is waiting for space.
    pub async fn enqueue(&self, item: ItemId) -> Result<()> {
        loop {
            let notified = self.shared.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_enqueue(item) {
                Err(Error::QueueFull) => notified.await,
                other => return other,
            }
        }
    }

    /// Add an item without suspending.
    pub fn try_enqueue(&self, item: ItemId) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(Error::ClosedQueue);
            }
            if self
                .shared
                .capacity
                .is_some_and(|cap| state.items.len() >= cap)
            {
                return Err(Error::QueueFull);
            }
            state.items.push_back(item);
        }
        self.shared.readable.notify_one();
        metrics::queue_operations().add(1, &[KeyValue::new("operation", "enqueue")]);
        Ok(())
    }

    /// Take the next item, suspending until one is available or the queue
    /// is exhausted. Cancel-safe: dropping the future never loses an item.
    pub async fn dequeue(&self) -> Dequeued {
        loop {
            let notified = self.shared.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(dequeued) = self.poll_once() {
                return dequeued;
            }
            notified.await;
        }
    }

    /// Like [`dequeue`](Self::dequeue), but gives up with
    /// [`Error::Cancelled`] once `cancel` fires.
    pub async fn dequeue_or_cancel(&self, cancel: &CancellationToken) -> Result<Dequeued> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            dequeued = self.dequeue() => Ok(dequeued),
        }
    }

    fn poll_once(&self) -> Option<Dequeued> {
        let item = {
            let mut state = self.shared.state.lock();
            match state.items.pop_front() {
                Some(item) => {
                    state.in_flight += 1;
                    item
                }
                None if state.is_exhausted() => {
                    metrics::queue_operations()
                        .add(1, &[KeyValue::new("operation", "dequeue_exhausted")]);
                    return Some(Dequeued::Exhausted);
                }
                None => return None,
            }
        };

        self.shared.writable.notify_one();
        metrics::queue_operations().add(1, &[KeyValue::new("operation", "dequeue")]);
        Some(Dequeued::Item(Delivery {
            item,
            shared: Arc::clone(&self.shared),
        }))
    }

    /// Mark that no more items will be produced. Idempotent; returns whether
    /// this call closed the queue. Wakes every blocked producer and consumer.
    pub fn close(&self) -> bool {
        let newly_closed = {
            let mut state = self.shared.state.lock();
            !std::mem::replace(&mut state.closed, true)
        };
        if newly_closed {
            debug!(remaining = self.len(), "queue closed");
            self.shared.readable.notify_waiters();
            self.shared.writable.notify_waiters();
        }
        newly_closed
    }

    /// Snapshot: no undelivered items. Not a substitute for exhaustion.
    pub fn is_empty(&self) -> bool {
        self.shared.state.lock().items.is_empty()
    }

    /// Snapshot of undelivered items.
    pub fn len(&self) -> usize {
        self.shared.state.lock().items.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Closed, empty, and nothing in flight, observed atomically.
    pub fn is_exhausted(&self) -> bool {
        self.shared.state.lock().is_exhausted()
    }

    /// Deliveries handed out and not yet settled.
    pub fn in_flight(&self) -> usize {
        self.shared.state.lock().in_flight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhaustion_waits_for_in_flight_deliveries() {
        let queue = WorkQueue::from_items([ItemId(1)]);
        let delivery = match queue.poll_once() {
            Some(Dequeued::Item(d)) => d,
            other => panic!("expected an item, got {other:?}"),
        };

        assert!(queue.is_empty());
        assert!(queue.is_closed());
        assert!(!queue.is_exhausted());
        assert!(queue.poll_once().is_none());

        drop(delivery);
        assert!(queue.is_exhausted());
        assert!(matches!(queue.poll_once(), Some(Dequeued::Exhausted)));
    }
}
