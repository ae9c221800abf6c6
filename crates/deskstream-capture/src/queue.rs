//! Bounded drop-oldest frame queue between the capture thread and its consumer.
//!
//! `push` never blocks the producer: at capacity the oldest frame is evicted
//! and counted. `pop` blocks for at most its timeout and returns early when a
//! frame arrives or the queue is closed.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use deskstream_core::Frame;

struct Inner {
    frames: VecDeque<Frame>,
    open: bool,
    dropped: u64,
}

pub struct FrameQueue {
    capacity: usize,
    inner: Mutex<Inner>,
    available: Condvar,
}

impl FrameQueue {
    /// Create an open queue.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "frame queue capacity must be > 0");
        Self {
            capacity,
            inner: Mutex::new(Inner {
                frames: VecDeque::with_capacity(capacity),
                open: true,
                dropped: 0,
            }),
            available: Condvar::new(),
        }
    }

    /// Insert `frame`, evicting and returning the oldest frame when full.
    pub fn push(&self, frame: Frame) -> Option<Frame> {
        let evicted = {
            let mut inner = self.lock();
            let evicted = if inner.frames.len() >= self.capacity {
                inner.dropped += 1;
                inner.frames.pop_front()
            } else {
                None
            };
            inner.frames.push_back(frame);
            evicted
        };
        self.available.notify_one();
        evicted
    }

    /// Wait up to `timeout` for the oldest frame.
    ///
    /// Returns `None` on timeout, or right away once the queue is closed and
    /// empty.
    pub fn pop(&self, timeout: Duration) -> Option<Frame> {
        let inner = self.lock();
        let (mut inner, _) = self
            .available
            .wait_timeout_while(inner, timeout, |inner| inner.frames.is_empty() && inner.open)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.frames.pop_front()
    }

    /// Drop every queued frame without counting them as overflow drops.
    pub fn clear(&self) -> usize {
        let mut inner = self.lock();
        let n = inner.frames.len();
        inner.frames.clear();
        n
    }

    pub fn open(&self) {
        self.lock().open = true;
    }

    /// Mark the producer as stopped and wake every waiting consumer.
    pub fn close(&self) {
        self.lock().open = false;
        self.available.notify_all();
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total overflow evictions since creation.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for FrameQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("dropped", &self.dropped())
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use deskstream_core::PixelFormat;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    fn frame(ts: u64) -> Frame {
        Frame::new(2, 2, 8, PixelFormat::Bgra8, ts, vec![0; 16]).unwrap()
    }

    #[test]
    fn pops_in_capture_order() {
        let q = FrameQueue::new(4);
        for ts in 1..=4 {
            assert!(q.push(frame(ts)).is_none());
        }
        let order: Vec<u64> = std::iter::from_fn(|| q.pop(Duration::ZERO))
            .map(|f| f.timestamp_us())
            .collect();
        assert_eq!(order, vec![1, 2, 3, 4]);
    }

    #[test]
    fn overflow_evicts_oldest_and_counts_exactly() {
        let capacity = 3;
        let pushes = 10u64;
        let q = FrameQueue::new(capacity);
        for ts in 0..pushes {
            let evicted = q.push(frame(ts));
            if ts >= capacity as u64 {
                assert_eq!(evicted.map(|f| f.timestamp_us()), Some(ts - capacity as u64));
            }
            assert!(q.len() <= capacity);
        }
        assert_eq!(q.dropped(), pushes - capacity as u64);

        // Survivors are the newest frames, still in order
        let left: Vec<u64> = std::iter::from_fn(|| q.pop(Duration::ZERO))
            .map(|f| f.timestamp_us())
            .collect();
        assert_eq!(left, vec![7, 8, 9]);
    }

    #[test]
    fn clear_does_not_count_as_drops() {
        let q = FrameQueue::new(2);
        q.push(frame(1));
        q.push(frame(2));
        assert_eq!(q.clear(), 2);
        assert_eq!(q.dropped(), 0);
        assert!(q.is_empty());
    }

    #[test]
    fn pop_waits_for_full_timeout_when_empty() {
        let q = FrameQueue::new(3);
        let timeout = Duration::from_millis(50);
        let start = Instant::now();
        assert!(q.pop(timeout).is_none());
        assert!(start.elapsed() >= timeout);
    }

    #[test]
    fn pop_returns_promptly_after_concurrent_push() {
        let q = Arc::new(FrameQueue::new(3));
        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                q.push(frame(42));
            })
        };
        let start = Instant::now();
        let got = q.pop(Duration::from_secs(5)).expect("frame pushed concurrently");
        assert_eq!(got.timestamp_us(), 42);
        assert!(start.elapsed() < Duration::from_secs(2));
        producer.join().unwrap();
    }

    #[test]
    fn close_wakes_blocked_consumer() {
        let q = Arc::new(FrameQueue::new(3));
        let closer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                q.close();
            })
        };
        let start = Instant::now();
        assert!(q.pop(Duration::from_secs(5)).is_none());
        assert!(start.elapsed() < Duration::from_secs(2));
        closer.join().unwrap();

        // A closed queue still hands out what it holds
        q.push(frame(1));
        assert_eq!(q.pop(Duration::from_secs(1)).map(|f| f.timestamp_us()), Some(1));
    }

    #[test]
    fn single_producer_single_consumer_never_reorders() {
        let q = Arc::new(FrameQueue::new(3));
        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                for ts in 0..2_000 {
                    q.push(frame(ts));
                }
                q.close();
            })
        };
        let mut last = None;
        let mut received = 0u64;
        while let Some(f) = q.pop(Duration::from_secs(1)) {
            if let Some(prev) = last {
                assert!(f.timestamp_us() > prev, "reordered: {} after {}", f.timestamp_us(), prev);
            }
            last = Some(f.timestamp_us());
            received += 1;
        }
        producer.join().unwrap();
        assert_eq!(received + q.dropped(), 2_000);
    }
}
