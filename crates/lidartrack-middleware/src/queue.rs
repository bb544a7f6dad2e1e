//! Bounded hand-off queues that shed load instead of blocking.
//!
//! A push onto a full queue drops the item and increments the queue's
//! [`DropCounter`]; producers (the socket reader above all) never wait on a
//! slow consumer.  A pop on an empty queue suspends until an item arrives or
//! every sender is gone.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc::{self, error::TrySendError};

/// Shared count of items shed by one queue.
#[derive(Debug, Clone, Default)]
pub struct DropCounter(Arc<AtomicU64>);

impl DropCounter {
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn bump(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

/// What happened to a pushed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted,
    /// Queue full: the item was discarded and counted.
    Dropped,
    /// Consumer is gone: the item was discarded, not counted.
    Closed,
}

#[derive(Debug)]
pub struct DropSender<T> {
    tx: mpsc::Sender<T>,
    dropped: DropCounter,
}

// Manual impl: `T` need not be `Clone`.
impl<T> Clone for DropSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            dropped: self.dropped.clone(),
        }
    }
}

impl<T> DropSender<T> {
    /// Non-blocking push.
    pub fn push(&self, item: T) -> PushOutcome {
        match self.tx.try_send(item) {
            Ok(()) => PushOutcome::Accepted,
            Err(TrySendError::Full(_)) => {
                self.dropped.bump();
                PushOutcome::Dropped
            }
            Err(TrySendError::Closed(_)) => PushOutcome::Closed,
        }
    }

    pub fn counter(&self) -> DropCounter {
        self.dropped.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug)]
pub struct DropReceiver<T> {
    rx: mpsc::Receiver<T>,
}

impl<T> DropReceiver<T> {
    /// Wait for the next item; `None` once every sender has been dropped and
    /// the queue is drained.
    pub async fn pop(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Take an item if one is ready.
    pub fn try_pop(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Stop accepting pushes; already queued items can still be popped.
    pub fn close(&mut self) {
        self.rx.close();
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Create a queue holding at most `capacity` items (minimum 1).
pub fn bounded<T>(capacity: usize) -> (DropSender<T>, DropReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        DropSender {
            tx,
            dropped: DropCounter::default(),
        },
        DropReceiver { rx },
    )
}
