//! Bounded async access-stat update queue (spec §5, §9): the router
//! triggers a background metadata access-stat update on every read, but
//! fans it out through a bounded queue rather than unbounded
//! fire-and-forget, so a traffic spike can't grow memory without limit.
//! When the queue is full the oldest pending update is dropped --
//! `access_count` is advisory, so losing an update is acceptable.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

use crate::metadata::MetadataService;

struct Inner {
    queue: Mutex<VecDeque<String>>,
    capacity: usize,
    notify: Notify,
}

/// Handle the router holds to submit advisory access-stat updates.
/// Cloning is cheap; every clone feeds the same bounded queue.
#[derive(Clone)]
pub struct StatsQueue {
    inner: Arc<Inner>,
}

impl StatsQueue {
    /// Spawns the worker tasks that drain the queue. `worker_count`
    /// independent consumers pull from the same queue, so stat updates
    /// for different keys proceed in parallel (spec §5: no ordering is
    /// guaranteed between distinct keys).
    #[must_use]
    pub fn spawn(metadata: Arc<MetadataService>, capacity: usize, worker_count: usize) -> Self {
        let inner = Arc::new(Inner {
            queue: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
            notify: Notify::new(),
        });

        for _ in 0..worker_count.max(1) {
            let metadata = metadata.clone();
            let inner = inner.clone();
            tokio::spawn(async move {
                loop {
                    let key = inner.queue.lock().pop_front();
                    match key {
                        Some(key) => metadata.record_access(&key).await,
                        None => inner.notify.notified().await,
                    }
                }
            });
        }

        Self { inner }
    }

    /// Enqueues a fire-and-forget access-stat bump for `key`. If the
    /// queue is at capacity, the *oldest* pending submission is evicted
    /// to make room rather than rejecting the new one or blocking the
    /// request path -- `access_count` is advisory, so losing an update is
    /// acceptable either way, but a drop-oldest policy keeps the queue
    /// biased toward the most recent access pattern.
    pub fn submit(&self, key: impl Into<String>) {
        let key = key.into();
        {
            let mut guard = self.inner.queue.lock();
            if guard.len() >= self.inner.capacity {
                if let Some(dropped) = guard.pop_front() {
                    trace!(dropped_key = %dropped, new_key = %key, "stats queue full, dropping oldest pending access-stat update");
                }
            }
            guard.push_back(key);
        }
        self.inner.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use featurehub_core::{FeatureMetadata, StorageTier, SystemClock};

    use super::*;
    use crate::metadata::store::memory::InMemoryMetadataStore;
    use crate::metadata::MetadataCache;

    fn metadata_service() -> Arc<MetadataService> {
        Arc::new(MetadataService::new(
            Arc::new(InMemoryMetadataStore::new()),
            MetadataCache::new(Duration::from_secs(60), Arc::new(SystemClock)),
            Arc::new(SystemClock),
        ))
    }

    #[tokio::test]
    async fn submit_eventually_updates_access_count() {
        let metadata = metadata_service();
        metadata
            .upsert(FeatureMetadata::new_for_write("k", StorageTier::Hot, 1, 0, None, None))
            .await
            .unwrap();

        let queue = StatsQueue::spawn(metadata.clone(), 16, 2);
        queue.submit("k");
        queue.submit("k");

        tokio::time::sleep(Duration::from_millis(50)).await;
        let row = metadata.get("k").await.unwrap().unwrap();
        assert_eq!(row.access_count, 2);
    }

    #[tokio::test]
    async fn submit_on_full_queue_drops_without_blocking() {
        let metadata = metadata_service();
        let queue = StatsQueue::spawn(metadata, 1, 1);
        for i in 0..100 {
            queue.submit(format!("k{i}"));
        }
    }

    /// Spec §9: "drop-oldest when full" -- with no workers draining the
    /// queue, submitting past capacity must evict the earliest-submitted
    /// keys and retain the most recent ones, not the other way around.
    #[tokio::test]
    async fn submit_past_capacity_drops_oldest_not_newest() {
        // No `spawn`-ed workers here: nothing drains the queue, so its
        // contents after submission are exactly what the drop policy
        // left behind.
        let inner = Arc::new(Inner {
            queue: Mutex::new(VecDeque::with_capacity(3)),
            capacity: 3,
            notify: Notify::new(),
        });
        let queue = StatsQueue { inner };

        for i in 0..5 {
            queue.submit(format!("k{i}"));
        }

        let remaining: Vec<String> = queue.inner.queue.lock().iter().cloned().collect();
        assert_eq!(remaining, vec!["k2".to_string(), "k3".to_string(), "k4".to_string()]);
    }
}
