//! Response-plea bookkeeping.
//!
//! Every request awaiting a pool reply is a "plea": its send time sits in a
//! FIFO owned by the client task, which is the only producer and the only
//! consumer. The queue serves two purposes: round-trip timing (a reply
//! dequeues the oldest plea) and timeout detection (the watchdog checks the
//! age of the oldest plea).
//!
//! A small atomic snapshot shadows the count and the oldest timestamp so
//! that other tasks can observe in-flight pressure without touching the
//! queue itself.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

/// Queue capacity. Submission throttling keeps the depth well below this.
pub const PLEA_CAPACITY: usize = 64;

/// Cross-task view of the plea queue.
#[derive(Debug)]
pub struct PleaSnapshot {
    count: AtomicUsize,
    oldest_micros: AtomicU64,
    epoch: Instant,
}

impl PleaSnapshot {
    fn new(epoch: Instant) -> Self {
        Self {
            count: AtomicUsize::new(0),
            oldest_micros: AtomicU64::new(0),
            epoch,
        }
    }

    /// Number of requests currently awaiting a reply.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Age of the oldest outstanding plea, if any.
    pub fn oldest_age(&self) -> Option<Duration> {
        if self.count() == 0 {
            return None;
        }
        let oldest = self.epoch + Duration::from_micros(self.oldest_micros.load(Ordering::Acquire));
        Some(Instant::now().duration_since(oldest))
    }

    fn store(&self, count: usize, oldest: Option<Instant>) {
        if let Some(oldest) = oldest {
            let micros = oldest.duration_since(self.epoch).as_micros() as u64;
            self.oldest_micros.store(micros, Ordering::Release);
        }
        self.count.store(count, Ordering::Release);
    }
}

/// FIFO of outstanding request timestamps.
#[derive(Debug)]
pub struct PleaQueue {
    times: VecDeque<Instant>,
    snapshot: Arc<PleaSnapshot>,
}

impl PleaQueue {
    pub fn new() -> Self {
        let epoch = Instant::now();
        Self {
            times: VecDeque::with_capacity(PLEA_CAPACITY),
            snapshot: Arc::new(PleaSnapshot::new(epoch)),
        }
    }

    /// Shared handle for observers on other tasks.
    pub fn snapshot(&self) -> Arc<PleaSnapshot> {
        Arc::clone(&self.snapshot)
    }

    pub fn count(&self) -> usize {
        self.times.len()
    }

    /// Age of the oldest outstanding plea, if any.
    pub fn oldest_age(&self) -> Option<Duration> {
        self.times
            .front()
            .map(|t| Instant::now().duration_since(*t))
    }

    /// Record a request sent now. Returns false when the queue is full and
    /// the plea was not recorded.
    pub fn enqueue(&mut self) -> bool {
        if self.times.len() >= PLEA_CAPACITY {
            return false;
        }
        self.times.push_back(Instant::now());
        self.publish();
        true
    }

    /// Match a reply to the oldest plea, returning the round trip. An empty
    /// queue yields a zero duration.
    pub fn dequeue(&mut self) -> Duration {
        match self.times.pop_front() {
            Some(sent) => {
                let delay = Instant::now().duration_since(sent);
                self.publish();
                delay
            }
            None => Duration::ZERO,
        }
    }

    /// Drop all outstanding pleas.
    pub fn clear(&mut self) {
        self.times.clear();
        self.publish();
    }

    fn publish(&self) {
        self.snapshot
            .store(self.times.len(), self.times.front().copied());
    }
}

impl Default for PleaQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_count_tracks_enqueue_dequeue() {
        let mut queue = PleaQueue::new();
        assert_eq!(queue.count(), 0);

        assert!(queue.enqueue());
        assert!(queue.enqueue());
        assert_eq!(queue.count(), 2);
        assert_eq!(queue.snapshot().count(), 2);

        queue.dequeue();
        assert_eq!(queue.count(), 1);

        queue.clear();
        assert_eq!(queue.count(), 0);
        assert_eq!(queue.snapshot().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dequeue_empty_is_zero() {
        let mut queue = PleaQueue::new();
        assert_eq!(queue.dequeue(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_trip_measures_elapsed() {
        let mut queue = PleaQueue::new();
        queue.enqueue();
        tokio::time::advance(Duration::from_millis(250)).await;
        let rtt = queue.dequeue();
        assert_eq!(rtt, Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_order() {
        let mut queue = PleaQueue::new();
        queue.enqueue();
        tokio::time::advance(Duration::from_millis(100)).await;
        queue.enqueue();
        tokio::time::advance(Duration::from_millis(50)).await;

        // First dequeue matches the older plea.
        assert_eq!(queue.dequeue(), Duration::from_millis(150));
        assert_eq!(queue.dequeue(), Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_capacity() {
        let mut queue = PleaQueue::new();
        for _ in 0..PLEA_CAPACITY {
            assert!(queue.enqueue());
        }
        assert!(!queue.enqueue());
        assert_eq!(queue.count(), PLEA_CAPACITY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_oldest_age() {
        let mut queue = PleaQueue::new();
        let snapshot = queue.snapshot();
        assert_eq!(snapshot.oldest_age(), None);

        queue.enqueue();
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(snapshot.oldest_age(), Some(Duration::from_secs(3)));

        queue.clear();
        assert_eq!(snapshot.oldest_age(), None);
    }
}
