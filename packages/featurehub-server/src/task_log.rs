//! Bounded audit log of task records, shared by the migration and cleanup
//! engines (spec §3.3, §3.4): each sweep or manually triggered task
//! produces one record, retained for `GET /records` / `GET /statistics`
//! style queries.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

/// Keeps the most recent `capacity` records, keyed by `task_id`. Older
/// records are evicted on insert once the cap is reached -- this is an
/// in-process audit trail, not a durable store, matching the "collaborator,
/// not core" status spec.md §1 gives to anything outside the four
/// subsystems' consistency model.
pub struct TaskRecordLog<T> {
    entries: DashMap<String, Arc<T>>,
    order: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl<T> TaskRecordLog<T> {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self { entries: DashMap::new(), order: Mutex::new(VecDeque::new()), capacity: capacity.max(1) }
    }

    /// Inserts or replaces the record for `task_id`, evicting the oldest
    /// entry if the log is at capacity.
    pub fn put(&self, task_id: impl Into<String>, record: T) {
        let task_id = task_id.into();
        let is_new = !self.entries.contains_key(&task_id);
        self.entries.insert(task_id.clone(), Arc::new(record));

        if is_new {
            let mut order = self.order.lock();
            order.push_back(task_id);
            while order.len() > self.capacity {
                if let Some(evicted) = order.pop_front() {
                    self.entries.remove(&evicted);
                }
            }
        }
    }

    #[must_use]
    pub fn get(&self, task_id: &str) -> Option<Arc<T>> {
        self.entries.get(task_id).map(|e| e.value().clone())
    }

    /// Most-recently-inserted records first.
    #[must_use]
    pub fn list_recent(&self, limit: usize) -> Vec<Arc<T>>
    where
        T: Clone,
    {
        let order = self.order.lock();
        order
            .iter()
            .rev()
            .take(limit)
            .filter_map(|id| self.entries.get(id).map(|e| e.value().clone()))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.order.lock().len()
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
    fn put_then_get_round_trips() {
        let log: TaskRecordLog<i32> = TaskRecordLog::new(10);
        log.put("t1", 42);
        assert_eq!(*log.get("t1").unwrap(), 42);
    }

    #[test]
    fn list_recent_is_newest_first() {
        let log: TaskRecordLog<i32> = TaskRecordLog::new(10);
        log.put("t1", 1);
        log.put("t2", 2);
        log.put("t3", 3);

        let recent = log.list_recent(10);
        let values: Vec<i32> = recent.iter().map(|r| **r).collect();
        assert_eq!(values, vec![3, 2, 1]);
    }

    #[test]
    fn eviction_respects_capacity() {
        let log: TaskRecordLog<i32> = TaskRecordLog::new(2);
        log.put("t1", 1);
        log.put("t2", 2);
        log.put("t3", 3);

        assert_eq!(log.len(), 2);
        assert!(log.get("t1").is_none());
        assert!(log.get("t3").is_some());
    }

    #[test]
    fn replacing_an_existing_key_does_not_evict() {
        let log: TaskRecordLog<i32> = TaskRecordLog::new(2);
        log.put("t1", 1);
        log.put("t1", 11);
        assert_eq!(log.len(), 1);
        assert_eq!(*log.get("t1").unwrap(), 11);
    }
}
