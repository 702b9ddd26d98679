/// Bounded FIFO hand-off queue between pipeline stages
///
/// A thin wrapper over a `crossbeam-channel` bounded channel that adds an
/// explicit `close()`. Producers block in `push()` while the queue is at
/// capacity, which is the pipeline's backpressure mechanism; consumers
/// block in `pop()` while it is empty and see `None` once the queue has
/// been closed and drained.
use std::sync::RwLock;

use crossbeam_channel::{bounded, Receiver, Sender};

/// Error returned by `push()` on a closed queue; carries the rejected
/// item back to the caller.
#[derive(Debug)]
pub struct QueueClosed<T>(pub T);

pub struct BoundedQueue<T> {
    tx: RwLock<Option<Sender<T>>>,
    rx: Receiver<T>,
}

impl<T> BoundedQueue<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self {
            tx: RwLock::new(Some(tx)),
            rx,
        }
    }

    /// Enqueue an item, blocking while the queue is full.
    ///
    /// Items are moved in and out; ownership transfers to the consumer on
    /// `pop()`. Returns the item back if the queue has been closed.
    pub fn push(&self, item: T) -> Result<(), QueueClosed<T>> {
        let guard = self.tx.read().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(tx) => tx.send(item).map_err(|e| QueueClosed(e.into_inner())),
            None => Err(QueueClosed(item)),
        }
    }

    /// Dequeue an item, blocking while the queue is empty.
    ///
    /// Returns `None` once the queue is closed and the backlog has
    /// drained. Safe to call from several consumer threads.
    pub fn pop(&self) -> Option<T> {
        self.rx.recv().ok()
    }

    /// Mark the end of input. Items already queued are still delivered;
    /// blocked consumers wake once the backlog drains.
    ///
    /// Must not race with `push()` from the same producer set: a stage
    /// closes its input only after all producers into it have stopped.
    pub fn close(&self) {
        let mut guard = self.tx.write().unwrap_or_else(|e| e.into_inner());
        *guard = None;
    }

    pub fn is_closed(&self) -> bool {
        self.tx
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
