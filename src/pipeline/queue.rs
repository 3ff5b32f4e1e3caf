//! Bounded blocking queue used as the only transport between stages
//!
//! A fixed ring of `capacity` slots with read and write cursors advancing
//! modulo the capacity. One slot always stays empty so that `read == write`
//! means empty and `write + 1 == read` means full; at most `capacity - 1`
//! elements are live at any time.
//!
//! All state sits behind one mutex. Producers wait on `not_full`, consumers on
//! `not_empty`; there is no spinning. Closing wakes every waiter, rejects new
//! pushes and lets consumers drain what is already buffered.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Queue depth used when a caller asks for the default (`0`)
pub const DEFAULT_QUEUE_SIZE: usize = 32;

/// How long a push or pop may block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Block until the operation can complete or the queue closes
    Forever,
    /// Return immediately
    NonBlocking,
    /// Block at most this long
    After(Duration),
}

impl Timeout {
    /// Millisecond convention used by the configuration layer:
    /// `0` blocks indefinitely, negative values never block.
    pub fn from_millis(ms: i64) -> Self {
        match ms {
            0 => Timeout::Forever,
            ms if ms < 0 => Timeout::NonBlocking,
            ms => Timeout::After(Duration::from_millis(ms as u64)),
        }
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Timeout::After(d)
    }
}

/// Why a push failed; the rejected element is handed back
#[derive(Debug, PartialEq, Eq)]
pub enum PushError<T> {
    /// No slot became free in time
    Full(T),
    /// The queue is closed
    Closed(T),
}

impl<T> PushError<T> {
    pub fn into_inner(self) -> T {
        match self {
            PushError::Full(t) | PushError::Closed(t) => t,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, PushError::Closed(_))
    }
}

/// Why a pop failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopError {
    /// Nothing arrived in time
    Empty,
    /// The queue is closed and fully drained
    Closed,
}

struct Ring<T> {
    slots: Vec<Option<T>>,
    read: usize,
    write: usize,
    closed: bool,
}

impl<T> Ring<T> {
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn len(&self) -> usize {
        (self.write + self.capacity() - self.read) % self.capacity()
    }

    fn is_empty(&self) -> bool {
        self.read == self.write
    }

    fn is_full(&self) -> bool {
        (self.write + 1) % self.capacity() == self.read
    }
}

/// Fixed-capacity multi-producer/multi-consumer blocking queue
pub struct BoundedQueue<T> {
    ring: Mutex<Ring<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> BoundedQueue<T> {
    /// Create a queue with `capacity` slots (`capacity - 1` usable)
    ///
    /// `0` selects [`DEFAULT_QUEUE_SIZE`]. A capacity of 1 could never hold an
    /// element and is rejected.
    pub fn new(capacity: usize) -> Result<Self> {
        let capacity = if capacity == 0 {
            DEFAULT_QUEUE_SIZE
        } else {
            capacity
        };
        if capacity < 2 {
            return Err(Error::InvalidParameter(format!(
                "queue capacity must be at least 2, got {}",
                capacity
            )));
        }

        let mut slots = Vec::new();
        slots.try_reserve_exact(capacity)?;
        slots.resize_with(capacity, || None);

        Ok(Self {
            ring: Mutex::new(Ring {
                slots,
                read: 0,
                write: 0,
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Ring<T>> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait on `cond` until `ready` holds, the queue closes or the timeout passes.
    /// Returns the guard and whether `ready` holds.
    fn wait_until<'a>(
        &self,
        mut guard: MutexGuard<'a, Ring<T>>,
        cond: &Condvar,
        timeout: Timeout,
        ready: impl Fn(&Ring<T>) -> bool,
    ) -> (MutexGuard<'a, Ring<T>>, bool) {
        let deadline = match timeout {
            Timeout::After(d) => Some(Instant::now() + d),
            _ => None,
        };

        while !ready(&*guard) && !guard.closed {
            match timeout {
                Timeout::NonBlocking => break,
                Timeout::Forever => {
                    guard = cond.wait(guard).unwrap_or_else(PoisonError::into_inner);
                }
                Timeout::After(_) => {
                    let now = Instant::now();
                    let Some(remaining) = deadline.and_then(|d| d.checked_duration_since(now)) else {
                        break;
                    };
                    if remaining.is_zero() {
                        break;
                    }
                    guard = cond
                        .wait_timeout(guard, remaining)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }

        let ok = ready(&*guard);
        (guard, ok)
    }

    /// Push an element, blocking up to `timeout` for a free slot
    ///
    /// On success ownership moves into the queue. On failure the element is
    /// returned inside the error.
    pub fn push(&self, elem: T, timeout: impl Into<Timeout>) -> std::result::Result<(), PushError<T>> {
        let guard = self.lock();
        let (mut ring, _) = self.wait_until(guard, &self.not_full, timeout.into(), |r| !r.is_full());

        if ring.closed {
            return Err(PushError::Closed(elem));
        }
        if ring.is_full() {
            return Err(PushError::Full(elem));
        }

        let write = ring.write;
        ring.slots[write] = Some(elem);
        ring.write = (write + 1) % ring.capacity();
        drop(ring);

        self.not_empty.notify_one();
        Ok(())
    }

    /// Pop the oldest element, blocking up to `timeout`
    ///
    /// A closed queue keeps returning buffered elements until it is empty.
    pub fn pop(&self, timeout: impl Into<Timeout>) -> std::result::Result<T, PopError> {
        let guard = self.lock();
        let (mut ring, available) =
            self.wait_until(guard, &self.not_empty, timeout.into(), |r| !r.is_empty());

        if !available {
            return Err(if ring.closed {
                PopError::Closed
            } else {
                PopError::Empty
            });
        }

        let read = ring.read;
        let elem = ring.slots[read].take();
        ring.read = (read + 1) % ring.capacity();
        drop(ring);

        self.not_full.notify_one();
        // The slot between read and write is always populated
        elem.ok_or(PopError::Empty)
    }

    /// Non-blocking push
    pub fn try_push(&self, elem: T) -> std::result::Result<(), PushError<T>> {
        self.push(elem, Timeout::NonBlocking)
    }

    /// Non-blocking pop
    pub fn try_pop(&self) -> std::result::Result<T, PopError> {
        self.pop(Timeout::NonBlocking)
    }

    /// Close the queue. Idempotent; wakes every blocked producer and consumer.
    pub fn close(&self) {
        let mut ring = self.lock();
        ring.closed = true;
        drop(ring);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of live elements
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.lock().is_full()
    }

    /// Both flags read under a single lock
    pub fn occupancy(&self) -> (bool, bool) {
        let ring = self.lock();
        (ring.is_empty(), ring.is_full())
    }

    /// Number of slots (one more than the number of usable elements)
    pub fn capacity(&self) -> usize {
        self.lock().capacity()
    }

    /// Drop every buffered element, returning how many were discarded
    pub fn clear(&self) -> usize {
        let mut ring = self.lock();
        let mut dropped = 0;
        while !ring.is_empty() {
            let read = ring.read;
            ring.slots[read] = None;
            ring.read = (read + 1) % ring.capacity();
            dropped += 1;
        }
        drop(ring);
        self.not_full.notify_all();
        dropped
    }
}

impl<T> std::fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ring = self.lock();
        f.debug_struct("BoundedQueue")
            .field("capacity", &ring.capacity())
            .field("len", &ring.len())
            .field("closed", &ring.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_capacity_minus_one_usable() {
        let queue = BoundedQueue::new(4).unwrap();
        assert!(queue.try_push(1).is_ok());
        assert!(queue.try_push(2).is_ok());
        assert!(queue.try_push(3).is_ok());
        assert!(queue.is_full());
        assert_eq!(queue.try_push(4), Err(PushError::Full(4)));
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_invalid_capacity() {
        assert!(matches!(BoundedQueue::<u8>::new(1), Err(Error::InvalidParameter(_))));
        assert_eq!(BoundedQueue::<u8>::new(0).unwrap().capacity(), DEFAULT_QUEUE_SIZE);
    }

    #[test]
    fn test_fifo_across_wraparound() {
        let queue = BoundedQueue::new(4).unwrap();
        let mut expected = 0;
        for round in 0..10 {
            for i in 0..3 {
                queue.try_push(round * 3 + i).unwrap();
            }
            for _ in 0..3 {
                assert_eq!(queue.try_pop(), Ok(expected));
                expected += 1;
            }
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pop_empty_times_out() {
        let queue = BoundedQueue::<u32>::new(4).unwrap();
        assert_eq!(queue.try_pop(), Err(PopError::Empty));

        let start = Instant::now();
        assert_eq!(queue.pop(Duration::from_millis(30)), Err(PopError::Empty));
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_push_full_times_out() {
        let queue = BoundedQueue::new(2).unwrap();
        queue.try_push(1).unwrap();
        let start = Instant::now();
        assert_eq!(queue.push(2, Duration::from_millis(30)), Err(PushError::Full(2)));
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_closed_semantics() {
        let queue = BoundedQueue::new(4).unwrap();
        queue.try_push(1).unwrap();
        queue.try_push(2).unwrap();
        queue.close();
        queue.close();

        assert!(queue.is_closed());
        assert_eq!(queue.try_push(3), Err(PushError::Closed(3)));
        assert_eq!(queue.pop(Timeout::Forever), Ok(1));
        assert_eq!(queue.pop(Timeout::Forever), Ok(2));
        assert_eq!(queue.pop(Timeout::Forever), Err(PopError::Closed));
        assert_eq!(queue.try_pop(), Err(PopError::Closed));
    }

    #[test]
    fn test_close_wakes_blocked_consumer() {
        let queue = Arc::new(BoundedQueue::<u32>::new(4).unwrap());
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop(Timeout::Forever))
        };
        thread::sleep(Duration::from_millis(20));
        queue.close();
        assert_eq!(consumer.join().unwrap(), Err(PopError::Closed));
    }

    #[test]
    fn test_close_wakes_blocked_producer() {
        let queue = Arc::new(BoundedQueue::new(2).unwrap());
        queue.try_push(0u32).unwrap();
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.push(1, Timeout::Forever))
        };
        thread::sleep(Duration::from_millis(20));
        queue.close();
        assert_eq!(producer.join().unwrap(), Err(PushError::Closed(1)));
    }

    #[test]
    fn test_blocked_producer_resumes_after_pop() {
        let queue = Arc::new(BoundedQueue::new(2).unwrap());
        queue.try_push(0u32).unwrap();
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.push(1, Timeout::Forever))
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(queue.try_pop(), Ok(0));
        assert!(producer.join().unwrap().is_ok());
        assert_eq!(queue.try_pop(), Ok(1));
    }

    #[test]
    fn test_timeout_from_millis() {
        assert_eq!(Timeout::from_millis(0), Timeout::Forever);
        assert_eq!(Timeout::from_millis(-1), Timeout::NonBlocking);
        assert_eq!(Timeout::from_millis(15), Timeout::After(Duration::from_millis(15)));
    }

    #[test]
    fn test_concurrent_no_loss_no_duplication() {
        const PER_PRODUCER: u64 = 2_000;
        let queue = Arc::new(BoundedQueue::new(8).unwrap());

        let producers: Vec<_> = (0..3u64)
            .map(|p| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        queue.push(p * PER_PRODUCER + i, Timeout::Forever).unwrap();
                    }
                })
            })
            .collect();

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let mut seen = HashSet::new();
                let mut last_per_producer = [None::<u64>; 3];
                while let Ok(v) = queue.pop(Timeout::Forever) {
                    assert!(seen.insert(v), "duplicate {}", v);
                    // Per-producer FIFO
                    let p = (v / PER_PRODUCER) as usize;
                    if let Some(last) = last_per_producer[p] {
                        assert!(v > last);
                    }
                    last_per_producer[p] = Some(v);
                }
                seen
            })
        };

        for producer in producers {
            producer.join().unwrap();
        }
        queue.close();
        let seen = consumer.join().unwrap();
        assert_eq!(seen.len() as u64, 3 * PER_PRODUCER);
    }

    #[test]
    fn test_never_full_and_empty_simultaneously() {
        let queue = BoundedQueue::new(4).unwrap();
        // Two producers interleaved with one consumer, simulated sequentially
        for step in 0..200u32 {
            match step % 5 {
                0 | 1 => {
                    let _ = queue.try_push(step);
                }
                2 | 3 => {
                    let _ = queue.try_push(step + 1000);
                }
                _ => {
                    let _ = queue.try_pop();
                }
            }
            let (empty, full) = queue.occupancy();
            assert!(!(empty && full));
            assert!(!(queue.is_empty() && queue.is_full()));
        }
    }

    #[test]
    fn test_clear_discards_buffered() {
        let queue = BoundedQueue::new(4).unwrap();
        queue.try_push(1).unwrap();
        queue.try_push(2).unwrap();
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
    }
}
