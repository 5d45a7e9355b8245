//! Bounded single-producer single-consumer queue.
//!
//! The receive worker is the only producer and the downstream consumer the
//! only reader, so a Lamport ring with two atomic cursors is enough: no locks
//! and no syscalls on either side. Items are moved in and out, never copied.
//!
//! ```
//! use iqrx::sync::spsc;
//!
//! let (tx, rx) = spsc::channel::<u32>(4);
//! tx.push(7).unwrap();
//! assert_eq!(rx.pop(), Some(7));
//! assert_eq!(rx.pop(), None);
//! ```

use std::cell::{Cell, UnsafeCell};
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use minstant::Instant;

/// Timeout for blocking operations.
#[derive(Debug, Clone, Copy)]
pub enum Timeout {
    /// Wait indefinitely.
    Infinite,
    /// Wait for at most the given duration.
    Duration(Duration),
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Self::Duration(d)
    }
}

/// Keeps the two cursors on separate cache lines.
#[repr(align(64))]
struct Padded(AtomicUsize);

struct Ring<T> {
    /// Next position the producer writes. Written by the producer only.
    head: Padded,
    /// Next position the consumer reads. Written by the consumer only.
    tail: Padded,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// SAFETY: a slot is written only by the producer while `head - tail < cap`
// and read only by the consumer while `tail < head`; the Release stores of
// each cursor paired with the other side's Acquire load hand the slot over.
unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
    fn with_capacity(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();
        Self {
            head: Padded(AtomicUsize::new(0)),
            tail: Padded(AtomicUsize::new(0)),
            slots,
        }
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    fn len(&self) -> usize {
        let tail = self.tail.0.load(Ordering::Acquire);
        let head = self.head.0.load(Ordering::Acquire);
        head.wrapping_sub(tail)
    }

    /// # Safety
    ///
    /// Must only be called by the single producer.
    #[inline]
    unsafe fn push(&self, item: T) -> Result<(), T> {
        let head = self.head.0.load(Ordering::Relaxed);
        let tail = self.tail.0.load(Ordering::Acquire);
        if head.wrapping_sub(tail) == self.capacity() {
            return Err(item);
        }
        let slot = &self.slots[head % self.capacity()];
        // SAFETY: the slot is outside the consumer's readable range.
        unsafe { (*slot.get()).write(item) };
        self.head.0.store(head.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// # Safety
    ///
    /// Must only be called by the single consumer.
    #[inline]
    unsafe fn pop(&self) -> Option<T> {
        let tail = self.tail.0.load(Ordering::Relaxed);
        let head = self.head.0.load(Ordering::Acquire);
        if tail == head {
            return None;
        }
        let slot = &self.slots[tail % self.capacity()];
        // SAFETY: the producer published this slot before advancing head.
        let item = unsafe { (*slot.get()).assume_init_read() };
        self.tail.0.store(tail.wrapping_add(1), Ordering::Release);
        Some(item)
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        let cap = self.capacity();
        let mut tail = *self.tail.0.get_mut();
        let head = *self.head.0.get_mut();
        while tail != head {
            // SAFETY: exclusive access; slots in `tail..head` are initialized.
            unsafe { self.slots[tail % cap].get_mut().assume_init_drop() };
            tail = tail.wrapping_add(1);
        }
    }
}

/// Marker to opt out of `Sync` while staying `Send`.
type PhantomUnsync = PhantomData<Cell<&'static ()>>;

/// Write end. `Send` but not `Sync`: exactly one thread pushes.
pub struct Producer<T: Send> {
    ring: Arc<Ring<T>>,
    _unsync: PhantomUnsync,
}

/// Read end. `Send` but not `Sync`: exactly one thread pops.
pub struct Consumer<T: Send> {
    ring: Arc<Ring<T>>,
    _unsync: PhantomUnsync,
}

/// Creates a queue holding at most `capacity` items.
///
/// # Panics
///
/// Panics if `capacity` is zero.
#[must_use]
pub fn channel<T: Send>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    assert!(capacity > 0, "queue capacity must be greater than 0");
    let ring = Arc::new(Ring::with_capacity(capacity));
    (
        Producer {
            ring: Arc::clone(&ring),
            _unsync: PhantomData,
        },
        Consumer {
            ring,
            _unsync: PhantomData,
        },
    )
}

impl<T: Send> Producer<T> {
    /// Pushes without waiting.
    ///
    /// # Errors
    ///
    /// Returns the item back if the queue is full.
    #[inline]
    pub fn push(&self, item: T) -> Result<(), T> {
        // SAFETY: `Producer` is not `Sync` and not `Clone`, so this is the
        // only pushing thread.
        unsafe { self.ring.push(item) }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}

impl<T: Send> Consumer<T> {
    /// Pops without waiting.
    #[inline]
    #[must_use]
    pub fn pop(&self) -> Option<T> {
        // SAFETY: `Consumer` is not `Sync` and not `Clone`, so this is the
        // only popping thread.
        unsafe { self.ring.pop() }
    }

    /// Waits for an item, yielding the CPU between attempts.
    ///
    /// Returns `None` on timeout.
    #[must_use]
    pub fn pop_blocking(&self, timeout: Timeout) -> Option<T> {
        let deadline = match timeout {
            Timeout::Infinite => None,
            Timeout::Duration(d) => Some(Instant::now() + d),
        };
        let mut spins = 0u32;
        loop {
            if let Some(item) = self.pop() {
                return Some(item);
            }
            if let Some(dl) = deadline
                && Instant::now() > dl
            {
                return None;
            }
            if spins < 64 {
                spins += 1;
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_fifo() {
        let (producer, consumer) = channel::<u64>(16);
        for i in 0..10 {
            producer.push(i).unwrap();
        }
        assert_eq!(consumer.len(), 10);
        for i in 0..10 {
            assert_eq!(consumer.pop(), Some(i));
        }
        assert_eq!(consumer.pop(), None);
        assert!(producer.is_empty());
    }

    #[test]
    fn full_queue_returns_item() {
        let (producer, consumer) = channel::<u64>(4);
        for i in 0..4 {
            producer.push(i).unwrap();
        }
        assert_eq!(producer.push(99), Err(99));
        assert_eq!(consumer.pop(), Some(0));
        producer.push(4).unwrap();
        assert_eq!(producer.push(100), Err(100));
    }

    #[test]
    fn wraps_many_times() {
        let (producer, consumer) = channel::<u64>(3);
        for round in 0..20u64 {
            for i in 0..3 {
                producer.push(round * 10 + i).unwrap();
            }
            for i in 0..3 {
                assert_eq!(consumer.pop(), Some(round * 10 + i));
            }
        }
    }

    #[test]
    fn drop_releases_queued_items() {
        let marker = Arc::new(());
        {
            let (producer, _consumer) = channel::<Arc<()>>(4);
            producer.push(Arc::clone(&marker)).unwrap();
            producer.push(Arc::clone(&marker)).unwrap();
            assert_eq!(Arc::strong_count(&marker), 3);
        }
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[test]
    fn pop_blocking_times_out() {
        let (_producer, consumer) = channel::<u8>(1);
        let start = std::time::Instant::now();
        assert_eq!(consumer.pop_blocking(Duration::from_millis(20).into()), None);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn concurrent_transfer_keeps_order() {
        let (producer, consumer) = channel::<u64>(8);
        let count = 10_000u64;

        let writer = std::thread::spawn(move || {
            for i in 0..count {
                let mut item = i;
                while let Err(back) = producer.push(item) {
                    item = back;
                    std::hint::spin_loop();
                }
            }
        });

        for expected in 0..count {
            let got = consumer
                .pop_blocking(Timeout::Duration(Duration::from_secs(5)))
                .expect("producer stalled");
            assert_eq!(got, expected);
        }
        writer.join().unwrap();
    }
}
