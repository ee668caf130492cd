use crossbeam_queue::ArrayQueue;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

/// Result of attempting to enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Value was accepted.
    Ok,
    /// Queue is full.
    Full,
    /// Queue is closed.
    Closed,
}

/// Result of attempting to dequeue.
#[derive(Debug)]
pub enum RecvOutcome<T> {
    /// Received value.
    Data(T),
    /// Queue has been closed and drained.
    Closed,
    /// Queue currently empty.
    Empty,
}

/// Bounded sender handle.
///
/// # Example
/// ```rust
/// use evsmux_core::prelude::{SendOutcome, bounded};
///
/// let (tx, _rx) = bounded::<u8>(1);
/// assert_eq!(tx.send(1), SendOutcome::Ok);
/// assert_eq!(tx.send(2), SendOutcome::Full);
/// ```
#[derive(Clone)]
pub struct BoundedTx<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> BoundedTx<T> {
    /// Attempt to send without blocking.
    pub fn send(&self, value: T) -> SendOutcome {
        if self.inner.closed.load(Ordering::Acquire) {
            return SendOutcome::Closed;
        }
        self.inner
            .queue
            .push(value)
            .map(|_| SendOutcome::Ok)
            .unwrap_or(SendOutcome::Full)
    }

    /// Close the queue to further sends.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }
}

/// Bounded receiver handle.
#[derive(Clone)]
pub struct BoundedRx<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> BoundedRx<T> {
    /// Attempt to receive without blocking.
    pub fn recv(&self) -> RecvOutcome<T> {
        match self.inner.queue.pop() {
            Some(value) => RecvOutcome::Data(value),
            None => {
                if self.inner.closed.load(Ordering::Acquire) {
                    RecvOutcome::Closed
                } else {
                    RecvOutcome::Empty
                }
            }
        }
    }

    /// Drain everything currently queued.
    pub fn drain(&self) -> Vec<T> {
        let mut out = Vec::new();
        while let Some(value) = self.inner.queue.pop() {
            out.push(value);
        }
        out
    }

    /// Mark the queue as closed; senders will see `Closed` and exit.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }
}

struct QueueInner<T> {
    queue: ArrayQueue<T>,
    closed: AtomicBool,
}

/// Create a bounded queue with the given capacity.
///
/// # Example
/// ```rust
/// use evsmux_core::prelude::{RecvOutcome, bounded};
///
/// let (tx, rx) = bounded::<u8>(2);
/// let _ = tx.send(5);
/// assert!(matches!(rx.recv(), RecvOutcome::Data(5)));
/// ```
pub fn bounded<T>(capacity: usize) -> (BoundedTx<T>, BoundedRx<T>) {
    let inner = Arc::new(QueueInner {
        queue: ArrayQueue::new(capacity),
        closed: AtomicBool::new(false),
    });
    (
        BoundedTx {
            inner: inner.clone(),
        },
        BoundedRx { inner },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_queue_rejects_without_blocking() {
        let (tx, rx) = bounded::<u32>(2);
        assert_eq!(tx.send(1), SendOutcome::Ok);
        assert_eq!(tx.send(2), SendOutcome::Ok);
        assert_eq!(tx.send(3), SendOutcome::Full);
        assert!(matches!(rx.recv(), RecvOutcome::Data(1)));
    }

    #[test]
    fn closed_queue_drains_then_reports_closed() {
        let (tx, rx) = bounded::<u32>(2);
        let _ = tx.send(1);
        tx.close();
        assert_eq!(tx.send(2), SendOutcome::Closed);
        assert!(matches!(rx.recv(), RecvOutcome::Data(1)));
        assert!(matches!(rx.recv(), RecvOutcome::Closed));
    }
}
