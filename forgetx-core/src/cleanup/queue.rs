// cleanup/queue.rs
//! In-process cleanup queue
//!
//! Attempts that finished with state behind them (PENDING, COMMITTED,
//! ABORTED) are queued here by the driver. A min-heap keyed on each
//! entry's ready time lets the worker wait out the small grace period
//! that gives the foreground protocol a chance to finish on its own.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

use parking_lot::Mutex;

use super::entry::AtrCleanupEntry;

struct QueueItem(AtrCleanupEntry);

// BinaryHeap is a max-heap; invert so the earliest ready time pops first
impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.ready_time().cmp(&self.0.ready_time())
    }
}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.0.ready_time() == other.0.ready_time()
    }
}

impl Eq for QueueItem {}

/// Priority queue of cleanup entries, earliest-ready first
#[derive(Default)]
pub struct AtrCleanupQueue {
    heap: Mutex<BinaryHeap<QueueItem>>,
}

impl AtrCleanupQueue {
    pub fn new() -> Self {
        AtrCleanupQueue {
            heap: Mutex::new(BinaryHeap::new()),
        }
    }

    pub fn push(&self, entry: AtrCleanupEntry) {
        self.heap.lock().push(QueueItem(entry));
    }

    /// Pop the next entry whose ready time has passed
    pub fn pop_ready(&self) -> Option<AtrCleanupEntry> {
        let mut heap = self.heap.lock();
        if heap.peek().map(|item| item.0.ready()).unwrap_or(false) {
            heap.pop().map(|item| item.0)
        } else {
            None
        }
    }

    /// Pop regardless of ready time (shutdown drain, tests)
    pub fn pop_any(&self) -> Option<AtrCleanupEntry> {
        self.heap.lock().pop().map(|item| item.0)
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocId;
    use std::time::Duration;

    fn entry(key: &str, ready_in: Duration) -> AtrCleanupEntry {
        AtrCleanupEntry::new(
            DocId::in_default_collection("default", key),
            format!("attempt-{}", key),
            false,
            Instant::now() + ready_in,
        )
    }

    #[test]
    fn test_pops_in_ready_order() {
        let queue = AtrCleanupQueue::new();
        queue.push(entry("late", Duration::from_secs(60)));
        queue.push(entry("soon", Duration::from_millis(0)));

        std::thread::sleep(Duration::from_millis(2));
        let popped = queue.pop_ready().expect("soon entry is ready");
        assert_eq!(popped.attempt_id(), "attempt-soon");
        // The late entry is not ready yet
        assert!(queue.pop_ready().is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_pop_any_ignores_ready_time() {
        let queue = AtrCleanupQueue::new();
        queue.push(entry("late", Duration::from_secs(60)));
        assert!(queue.pop_ready().is_none());
        assert!(queue.pop_any().is_some());
        assert!(queue.is_empty());
    }
}
