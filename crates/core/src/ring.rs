use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;

use crate::frame::RawFrame;

const ACQUIRE_POLL: Duration = Duration::from_micros(200);

/// Create a bounded single-producer/single-consumer ring of pre-allocated
/// frames.
///
/// Slots move through free → being-written → ready → being-read and back,
/// tracked by per-slot sequence counters; slots are consumed in publish
/// order. A full ring fails a zero-timeout acquire immediately instead of
/// blocking.
///
/// # Example
/// ```rust
/// use visor_core::prelude::frame_ring;
///
/// let (mut tx, mut rx) = frame_ring(4);
/// let mut slot = tx.try_acquire().expect("free slot");
/// slot.sequence = 1;
/// slot.publish();
/// let read = rx.try_acquire().expect("ready slot");
/// assert_eq!(read.sequence, 1);
/// ```
pub fn frame_ring(capacity: usize) -> (RingProducer, RingConsumer) {
    assert!(capacity > 0, "ring capacity must be non-zero");
    let slots = (0..capacity)
        .map(|i| Slot {
            seq: AtomicU64::new(i as u64),
            frame: UnsafeCell::new(RawFrame::new()),
        })
        .collect::<Vec<_>>()
        .into_boxed_slice();
    let shared = Arc::new(RingShared {
        slots,
        capacity: capacity as u64,
        head: CachePadded::new(AtomicU64::new(0)),
        tail: CachePadded::new(AtomicU64::new(0)),
    });
    (
        RingProducer {
            shared: shared.clone(),
        },
        RingConsumer { shared },
    )
}

struct Slot {
    seq: AtomicU64,
    frame: UnsafeCell<RawFrame>,
}

struct RingShared {
    slots: Box<[Slot]>,
    capacity: u64,
    head: CachePadded<AtomicU64>,
    tail: CachePadded<AtomicU64>,
}

// Slot frames are only touched by the side whose sequence check passed, and
// the producer/consumer handles are unique, so cross-thread access is
// serialized by the seq counters.
unsafe impl Send for RingShared {}
unsafe impl Sync for RingShared {}

impl RingShared {
    fn slot(&self, pos: u64) -> &Slot {
        &self.slots[(pos % self.capacity) as usize]
    }
}

/// Writing half of a frame ring. Not cloneable: one producer by contract.
pub struct RingProducer {
    shared: Arc<RingShared>,
}

impl RingProducer {
    /// Acquire a free slot for writing, failing immediately when the ring is
    /// full.
    pub fn try_acquire(&mut self) -> Option<SlotWriter<'_>> {
        let pos = self.shared.tail.load(Ordering::Relaxed);
        if self.shared.slot(pos).seq.load(Ordering::Acquire) == pos {
            Some(SlotWriter {
                shared: &self.shared,
                pos,
            })
        } else {
            None
        }
    }

    /// Acquire a free slot, waiting up to `timeout` for the consumer to free
    /// one.
    pub fn acquire(&mut self, timeout: Duration) -> Option<SlotWriter<'_>> {
        let deadline = Instant::now() + timeout;
        loop {
            let pos = self.shared.tail.load(Ordering::Relaxed);
            if self.shared.slot(pos).seq.load(Ordering::Acquire) == pos {
                return Some(SlotWriter {
                    shared: &self.shared,
                    pos,
                });
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(ACQUIRE_POLL);
        }
    }
}

/// Reading half of a frame ring. Not cloneable: one consumer by contract.
pub struct RingConsumer {
    shared: Arc<RingShared>,
}

impl RingConsumer {
    /// Take the oldest ready slot, if any.
    pub fn try_acquire(&mut self) -> Option<SlotReader<'_>> {
        let pos = self.shared.head.load(Ordering::Relaxed);
        if self.shared.slot(pos).seq.load(Ordering::Acquire) == pos + 1 {
            Some(SlotReader {
                shared: &self.shared,
                pos,
            })
        } else {
            None
        }
    }

    /// Take the oldest ready slot, waiting up to `timeout` for the producer.
    pub fn acquire(&mut self, timeout: Duration) -> Option<SlotReader<'_>> {
        let deadline = Instant::now() + timeout;
        loop {
            let pos = self.shared.head.load(Ordering::Relaxed);
            if self.shared.slot(pos).seq.load(Ordering::Acquire) == pos + 1 {
                return Some(SlotReader {
                    shared: &self.shared,
                    pos,
                });
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(ACQUIRE_POLL);
        }
    }
}

/// Exclusive write access to one ring slot.
///
/// Dropping the writer without calling [`SlotWriter::publish`] abandons the
/// write: the slot stays free and the consumer never sees it.
pub struct SlotWriter<'a> {
    shared: &'a RingShared,
    pos: u64,
}

impl SlotWriter<'_> {
    /// Publish the slot as ready for the consumer.
    pub fn publish(self) {
        let slot = self.shared.slot(self.pos);
        slot.seq.store(self.pos + 1, Ordering::Release);
        self.shared.tail.store(self.pos + 1, Ordering::Relaxed);
    }
}

impl Deref for SlotWriter<'_> {
    type Target = RawFrame;

    fn deref(&self) -> &RawFrame {
        unsafe { &*self.shared.slot(self.pos).frame.get() }
    }
}

impl DerefMut for SlotWriter<'_> {
    fn deref_mut(&mut self) -> &mut RawFrame {
        unsafe { &mut *self.shared.slot(self.pos).frame.get() }
    }
}

/// Shared read access to one ring slot; the slot returns to the free pool
/// when the reader is dropped.
pub struct SlotReader<'a> {
    shared: &'a RingShared,
    pos: u64,
}

impl Deref for SlotReader<'_> {
    type Target = RawFrame;

    fn deref(&self) -> &RawFrame {
        unsafe { &*self.shared.slot(self.pos).frame.get() }
    }
}

impl Drop for SlotReader<'_> {
    fn drop(&mut self) {
        let slot = self.shared.slot(self.pos);
        slot.seq
            .store(self.pos + self.shared.capacity, Ordering::Release);
        self.shared.head.store(self.pos + 1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publishes_in_order() {
        let (mut tx, mut rx) = frame_ring(4);
        for seq in 0..3u64 {
            let mut slot = tx.try_acquire().expect("free slot");
            slot.sequence = seq;
            slot.publish();
        }
        for seq in 0..3u64 {
            let read = rx.try_acquire().expect("ready slot");
            assert_eq!(read.sequence, seq);
        }
        assert!(rx.try_acquire().is_none());
    }

    #[test]
    fn full_ring_fails_immediately() {
        let (mut tx, mut rx) = frame_ring(2);
        tx.try_acquire().unwrap().publish();
        tx.try_acquire().unwrap().publish();
        assert!(tx.try_acquire().is_none());
        assert!(tx.acquire(Duration::from_millis(5)).is_none());

        drop(rx.try_acquire().unwrap());
        assert!(tx.try_acquire().is_some());
    }

    #[test]
    fn abandoned_write_stays_invisible() {
        let (mut tx, mut rx) = frame_ring(2);
        {
            let mut slot = tx.try_acquire().unwrap();
            slot.sequence = 42;
            // dropped without publish
        }
        assert!(rx.try_acquire().is_none());
        let mut slot = tx.try_acquire().unwrap();
        slot.sequence = 1;
        slot.publish();
        assert_eq!(rx.try_acquire().unwrap().sequence, 1);
    }

    #[test]
    fn crosses_threads() {
        let (mut tx, mut rx) = frame_ring(4);
        let writer = thread::spawn(move || {
            for seq in 0..64u64 {
                let mut slot = tx.acquire(Duration::from_secs(1)).expect("slot");
                slot.sequence = seq;
                slot.online = true;
                slot.publish();
            }
        });
        let mut next = 0u64;
        while next < 64 {
            if let Some(read) = rx.acquire(Duration::from_secs(1)) {
                assert_eq!(read.sequence, next);
                assert!(read.online);
                next += 1;
            }
        }
        writer.join().unwrap();
    }
}
