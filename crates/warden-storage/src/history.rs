use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use warden_core_domain::{ExecutionRecord, HistoryEntry, Snapshot};

pub const SNAPSHOT_HISTORY_CAPACITY: usize = 200;
pub const EXECUTION_HISTORY_CAPACITY: usize = 500;

/// Fixed-capacity FIFO shared between writers and readers. Append and
/// eviction happen under one lock; readers get a cloned copy.
#[derive(Debug)]
pub struct BoundedLog<T> {
    capacity: usize,
    entries: Mutex<VecDeque<T>>,
}

impl<T: Clone> BoundedLog<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    fn guard(&self) -> MutexGuard<'_, VecDeque<T>> {
        // A panicking writer cannot leave the deque half-updated.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, entry: T) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.guard();
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.guard().iter().cloned().collect()
    }

    /// Last `limit` entries accepted by `filter`, oldest first.
    pub fn recent_matching<F>(&self, limit: usize, filter: F) -> Vec<T>
    where
        F: Fn(&T) -> bool,
    {
        let entries = self.guard();
        let mut picked: Vec<T> = entries
            .iter()
            .rev()
            .filter(|entry| filter(entry))
            .take(limit)
            .cloned()
            .collect();
        picked.reverse();
        picked
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Snapshot history across all targets. Eviction is global, not per target.
#[derive(Debug)]
pub struct SnapshotHistory {
    log: BoundedLog<HistoryEntry>,
}

impl Default for SnapshotHistory {
    fn default() -> Self {
        Self::with_capacity(SNAPSHOT_HISTORY_CAPACITY)
    }
}

impl SnapshotHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            log: BoundedLog::new(capacity),
        }
    }

    pub fn record(&self, target: Option<String>, snapshot: Snapshot) -> HistoryEntry {
        let entry = HistoryEntry {
            timestamp: Utc::now(),
            target,
            snapshot,
        };
        self.log.push(entry.clone());
        entry
    }

    /// Most recent `limit` entries for `target`, in insertion order. `None`
    /// matches every entry.
    pub fn recent(&self, target: Option<&str>, limit: usize) -> Vec<HistoryEntry> {
        self.log.recent_matching(limit, |entry| match target {
            None => true,
            Some(wanted) => entry.target.as_deref() == Some(wanted),
        })
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.log.capacity()
    }
}

#[derive(Debug)]
pub struct ExecutionHistory {
    log: BoundedLog<ExecutionRecord>,
}

impl Default for ExecutionHistory {
    fn default() -> Self {
        Self {
            log: BoundedLog::new(EXECUTION_HISTORY_CAPACITY),
        }
    }
}

impl ExecutionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, record: ExecutionRecord) {
        self.log.push(record);
    }

    pub fn recent(&self, limit: usize) -> Vec<ExecutionRecord> {
        self.log.recent_matching(limit, |_| true)
    }

    pub fn all(&self) -> Vec<ExecutionRecord> {
        self.log.snapshot()
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use warden_core_domain::{DockerPart, LinuxPart, NginxPart, PostgresPart};

    fn empty_snapshot() -> Snapshot {
        Snapshot {
            timestamp: Utc::now(),
            linux: LinuxPart::default(),
            docker: DockerPart::default(),
            postgres: PostgresPart::default(),
            nginx: NginxPart::default(),
        }
    }

    #[test]
    fn bounded_log_keeps_most_recent_in_order() {
        let log = BoundedLog::new(3);
        for value in 1..=7 {
            log.push(value);
            assert!(log.len() <= 3);
        }
        assert_eq!(log.snapshot(), vec![5, 6, 7]);
    }

    #[test]
    fn recent_matching_returns_tail_in_insertion_order() {
        let log = BoundedLog::new(10);
        for value in 0..10 {
            log.push(value);
        }
        assert_eq!(log.recent_matching(3, |v| v % 2 == 0), vec![4, 6, 8]);
        assert!(log.recent_matching(0, |_| true).is_empty());
    }

    #[test]
    fn snapshot_history_evicts_globally_across_targets() {
        let history = SnapshotHistory::with_capacity(4);
        history.record(Some("a".to_string()), empty_snapshot());
        history.record(Some("a".to_string()), empty_snapshot());
        for _ in 0..3 {
            history.record(Some("b".to_string()), empty_snapshot());
        }
        assert_eq!(history.len(), 4);
        assert_eq!(history.recent(Some("a"), 10).len(), 1);
        assert_eq!(history.recent(Some("b"), 10).len(), 3);
        assert_eq!(history.recent(None, 10).len(), 4);
    }

    #[test]
    fn default_capacities() {
        assert_eq!(SnapshotHistory::new().capacity(), 200);
        assert_eq!(ExecutionHistory::new().log.capacity(), 500);
    }

    #[test]
    fn concurrent_writers_never_exceed_capacity() {
        let log = Arc::new(BoundedLog::new(50));
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let log = Arc::clone(&log);
                thread::spawn(move || {
                    for i in 0..200 {
                        log.push(worker * 1000 + i);
                        assert!(log.snapshot().len() <= 50);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("writer thread");
        }
        assert_eq!(log.len(), 50);
    }
}
