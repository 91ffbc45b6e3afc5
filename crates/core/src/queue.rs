use crossbeam_queue::ArrayQueue;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::thread;
use std::time::{Duration, Instant};

/// Result of attempting to enqueue.
///
/// # Example
/// ```rust
/// use visor_core::prelude::{SendOutcome, bounded};
///
/// let (tx, _rx) = bounded::<u8>(1);
/// assert_eq!(tx.send(1), SendOutcome::Ok);
/// ```
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
///
/// # Example
/// ```rust
/// use visor_core::prelude::{RecvOutcome, bounded};
///
/// let (_tx, rx) = bounded::<u8>(1);
/// match rx.recv() {
///     RecvOutcome::Empty | RecvOutcome::Closed | RecvOutcome::Data(_) => {}
/// }
/// ```
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

    /// Receive, waiting up to `timeout` for a value.
    ///
    /// Returns `Empty` once the deadline passes so periodic stop-flag checks
    /// in consumer loops stay cheap.
    pub fn recv_timeout(&self, timeout: Duration) -> RecvOutcome<T> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.recv() {
                RecvOutcome::Empty => {
                    if Instant::now() >= deadline {
                        return RecvOutcome::Empty;
                    }
                    thread::sleep(Duration::from_millis(1));
                }
                other => return other,
            }
        }
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
/// use visor_core::prelude::{RecvOutcome, SendOutcome, bounded};
///
/// let (tx, rx) = bounded::<u8>(1);
/// assert_eq!(tx.send(1), SendOutcome::Ok);
/// match rx.recv() {
///     RecvOutcome::Data(_) | RecvOutcome::Empty | RecvOutcome::Closed => {}
/// }
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
    fn full_and_closed_outcomes() {
        let (tx, rx) = bounded::<u8>(1);
        assert_eq!(tx.send(1), SendOutcome::Ok);
        assert_eq!(tx.send(2), SendOutcome::Full);
        rx.close();
        assert_eq!(tx.send(3), SendOutcome::Closed);
        assert!(matches!(rx.recv(), RecvOutcome::Data(1)));
        assert!(matches!(rx.recv(), RecvOutcome::Closed));
    }

    #[test]
    fn recv_timeout_expires() {
        let (_tx, rx) = bounded::<u8>(1);
        let start = Instant::now();
        assert!(matches!(
            rx.recv_timeout(Duration::from_millis(10)),
            RecvOutcome::Empty
        ));
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn recv_timeout_returns_early_on_data() {
        let (tx, rx) = bounded::<u8>(1);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            tx.send(7);
        });
        assert!(matches!(
            rx.recv_timeout(Duration::from_millis(500)),
            RecvOutcome::Data(7)
        ));
        handle.join().unwrap();
    }
}
