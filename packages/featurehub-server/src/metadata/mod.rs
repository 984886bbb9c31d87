//! The metadata component (spec §4.2): system of record for per-key
//! placement, wrapped with a read-through cache.

pub mod cache;
pub mod store;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use featurehub_core::{Clock, FeatureError, FeatureMetadata, StorageTier};
use tracing::warn;

pub use cache::MetadataCache;
pub use store::{MetadataStore, TierStats, UpsertOutcome};

/// Wraps a [`MetadataStore`] with a [`MetadataCache`], implementing the
/// full contract of spec §4.2. This is the only type the router,
/// migration engine and cleanup engine should hold a reference to --
/// nothing outside this module talks to a `MetadataStore` directly.
pub struct MetadataService {
    store: Arc<dyn MetadataStore>,
    cache: MetadataCache,
    clock: Arc<dyn Clock>,
}

impl MetadataService {
    #[must_use]
    pub fn new(store: Arc<dyn MetadataStore>, cache: MetadataCache, clock: Arc<dyn Clock>) -> Self {
        Self { store, cache, clock }
    }

    pub async fn get(&self, key: &str) -> Result<Option<FeatureMetadata>, FeatureError> {
        if let Some(cached) = self.cache.get(key) {
            return Ok(Some(cached));
        }
        let fetched = self.store.get(key).await?;
        if let Some(value) = &fetched {
            self.cache.put(value.clone());
        }
        Ok(fetched)
    }

    /// One cache multi-get, one authoritative batch query for misses, one
    /// cache multi-set for the result -- three round-trips regardless of
    /// batch size (spec §4.2). Duplicate input keys are deduplicated
    /// before backend I/O; the returned map naturally collapses them.
    pub async fn batch_get(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, FeatureMetadata>, FeatureError> {
        let deduped: Vec<String> = {
            let mut seen = std::collections::HashSet::with_capacity(keys.len());
            keys.iter().filter(|k| seen.insert((*k).clone())).cloned().collect()
        };

        let mut result = self.cache.get_many(&deduped);
        let misses: Vec<String> = deduped.into_iter().filter(|k| !result.contains_key(k)).collect();

        if !misses.is_empty() {
            let fetched = self.store.batch_get(&misses).await?;
            self.cache.put_many(fetched.values().cloned());
            result.extend(fetched);
        }
        Ok(result)
    }

    pub async fn upsert(&self, record: FeatureMetadata) -> Result<UpsertOutcome, FeatureError> {
        let value_for_cache = record.clone();
        let outcome = self.store.upsert(record).await?;
        self.cache.put(value_for_cache);
        Ok(outcome)
    }

    pub async fn update(&self, record: FeatureMetadata) -> Result<bool, FeatureError> {
        let key = record.key_name.clone();
        let updated = self.store.update(record.clone()).await?;
        if updated {
            self.cache.put(record);
        } else {
            self.cache.invalidate(&key);
        }
        Ok(updated)
    }

    pub async fn batch_update(
        &self,
        records: Vec<FeatureMetadata>,
    ) -> Result<HashMap<String, bool>, FeatureError> {
        let mut out = HashMap::with_capacity(records.len());
        for record in records {
            let key = record.key_name.clone();
            out.insert(key, self.update(record).await?);
        }
        Ok(out)
    }

    pub async fn delete(&self, key: &str) -> Result<bool, FeatureError> {
        let deleted = self.store.delete(key).await?;
        self.cache.invalidate(key);
        Ok(deleted)
    }

    /// Claim a key for migration and keep the cache from serving a stale
    /// STABLE row while the migration is in flight.
    pub async fn claim_migration(&self, key: &str) -> Result<Option<FeatureMetadata>, FeatureError> {
        let now = self.clock.now_ms();
        let claimed = self.store.claim_migration(key, now).await?;
        if let Some(row) = &claimed {
            self.cache.put(row.clone());
        }
        Ok(claimed)
    }

    pub async fn finalize_migration(&self, key: &str, target: StorageTier) -> Result<bool, FeatureError> {
        let now = self.clock.now_ms();
        let ok = self.store.finalize_migration(key, target, now).await?;
        self.cache.invalidate(key);
        Ok(ok)
    }

    pub async fn abort_migration(&self, key: &str) -> Result<bool, FeatureError> {
        let now = self.clock.now_ms();
        let ok = self.store.abort_migration(key, now).await?;
        self.cache.invalidate(key);
        Ok(ok)
    }

    pub async fn select_for_hot_to_cold(
        &self,
        idle_threshold_ms: i64,
        min_stable_idle_ms: i64,
        limit: usize,
    ) -> Result<Vec<FeatureMetadata>, FeatureError> {
        let now = self.clock.now_ms();
        self.store.select_for_hot_to_cold(now, idle_threshold_ms, min_stable_idle_ms, limit).await
    }

    pub async fn select_for_cold_to_hot(
        &self,
        access_count_threshold: i64,
        recent_access_window_ms: i64,
        limit: usize,
    ) -> Result<Vec<FeatureMetadata>, FeatureError> {
        let recent_access_since = self.clock.now_ms() - recent_access_window_ms;
        self.store.select_for_cold_to_hot(access_count_threshold, recent_access_since, limit).await
    }

    pub async fn select_expired(&self, limit: usize) -> Result<Vec<String>, FeatureError> {
        let now = self.clock.now_ms();
        self.store.select_expired(now, limit).await
    }

    pub async fn delete_expired(&self) -> Result<u64, FeatureError> {
        let now = self.clock.now_ms();
        self.store.delete_expired(now).await
    }

    pub async fn count_by_tier(&self) -> Result<HashMap<StorageTier, u64>, FeatureError> {
        self.store.count_by_tier().await
    }

    pub async fn stats_by_tier(&self, tier: StorageTier) -> Result<TierStats, FeatureError> {
        self.store.stats_by_tier(tier).await
    }

    pub async fn stats_by_tag(&self, tag: &str) -> Result<TierStats, FeatureError> {
        self.store.stats_by_tag(tag).await
    }

    pub async fn reset_access_counts(&self) -> Result<u64, FeatureError> {
        let now = self.clock.now_ms();
        self.store.reset_access_counts(now).await
    }

    /// Fire-and-forget stat bump from the router's bounded async queue.
    /// Cache errors and backend errors alike are logged, never propagated
    /// -- `access_count` is advisory (spec §4.2, §9).
    pub async fn record_access(&self, key: &str) {
        let now = self.clock.now_ms();
        if let Err(err) = self.store.record_access(key, now).await {
            warn!(key, %err, "advisory access-stat update failed");
        }
        self.cache.invalidate(key);
    }
}

#[async_trait]
impl crate::registry::ManagedService for MetadataService {
    fn name(&self) -> &'static str {
        "metadata"
    }

    async fn init(&self, _ctx: &crate::registry::ServiceContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn shutdown(&self, _terminate: bool) -> anyhow::Result<()> {
        Ok(())
    }
}
