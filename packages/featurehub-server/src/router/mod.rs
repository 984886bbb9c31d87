//! The router component (spec §4.1): translates a feature key to the
//! right backend, fans batch requests out across backends in parallel,
//! and records access telemetry.

pub mod stats_queue;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use featurehub_core::{
    Clock, FeatureError, FeatureMetadata, MigrationStatus, QueryLog, StorageTier,
};

use crate::backend::KvBackend;
use crate::bus::{publish_event, EventBus};
use crate::metadata::MetadataService;
use crate::registry::{ManagedService, ServiceContext};
use stats_queue::StatsQueue;

const QUERY_LOG_TOPIC: &str = "feature-query-logs";

#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    pub include_metadata: bool,
    pub timeout_ms: Option<u64>,
    pub user_id: Option<String>,
    pub client_ip: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct BatchGetOptions {
    pub include_metadata: bool,
    pub timeout_ms: Option<u64>,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub ttl_secs: Option<u64>,
    pub storage_hint: Option<StorageTier>,
}

/// Result of a single-key read, per spec §4.1's `Get` contract.
#[derive(Debug, Clone)]
pub struct FeatureResult {
    pub found: bool,
    pub value: Option<String>,
    pub tier: Option<StorageTier>,
    pub query_time_ms: u64,
    pub error: Option<String>,
    pub metadata: Option<FeatureMetadata>,
}

#[derive(Debug, Clone, Default)]
pub struct BatchSummary {
    pub total: usize,
    pub found: usize,
    pub not_found: usize,
    pub hot_hits: usize,
    pub cold_hits: usize,
    pub total_time_ms: u64,
}

#[derive(Debug, Clone)]
pub struct BatchResult {
    pub results: Vec<FeatureResult>,
    pub summary: BatchSummary,
}

#[derive(Debug, Clone)]
pub struct PutResult {
    pub tier: StorageTier,
    pub ttl_secs: Option<u64>,
}

/// Translates feature keys to backends and records telemetry. Holds no
/// state of its own beyond its collaborators -- placement truth lives in
/// [`MetadataService`], bytes live in the two [`KvBackend`]s.
pub struct RouterService {
    hot: Arc<dyn KvBackend>,
    cold: Arc<dyn KvBackend>,
    metadata: Arc<MetadataService>,
    bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
    stats_queue: StatsQueue,
    default_timeout: Duration,
}

impl RouterService {
    #[must_use]
    pub fn new(
        hot: Arc<dyn KvBackend>,
        cold: Arc<dyn KvBackend>,
        metadata: Arc<MetadataService>,
        bus: Arc<dyn EventBus>,
        clock: Arc<dyn Clock>,
        stats_queue: StatsQueue,
        default_timeout: Duration,
    ) -> Self {
        Self { hot, cold, metadata, bus, clock, stats_queue, default_timeout }
    }

    fn backend_for(&self, tier: StorageTier) -> &Arc<dyn KvBackend> {
        match tier {
            StorageTier::Hot => &self.hot,
            StorageTier::Cold => &self.cold,
        }
    }

    fn deadline(&self, timeout_ms: Option<u64>) -> Duration {
        timeout_ms.map(Duration::from_millis).unwrap_or(self.default_timeout)
    }

    async fn bounded_get(
        &self,
        tier: StorageTier,
        key: &str,
        deadline: Duration,
    ) -> Result<Option<Vec<u8>>, FeatureError> {
        match tokio::time::timeout(deadline, self.backend_for(tier).get(key)).await {
            Ok(result) => result,
            Err(_) => Err(FeatureError::Timeout { timeout_ms: deadline.as_millis() as u64 }),
        }
    }

    /// Single-key read (spec §4.1 "Single-key read").
    pub async fn get(&self, key: &str, opts: GetOptions) -> FeatureResult {
        let started = Instant::now();
        let now = self.clock.now_ms();
        let deadline = self.deadline(opts.timeout_ms);

        // A metadata-read error degrades to single-store HOT access, not
        // a full outage (spec §4.1 "Error behavior").
        let metadata = self.metadata.get(key).await.unwrap_or(None);

        let read_result = match &metadata {
            Some(m) if m.migration_status == MigrationStatus::Migrating => {
                let source = m.storage_tier;
                let target = source.other();
                match self.bounded_get(source, key, deadline).await {
                    Ok(Some(value)) => Ok((Some(value), Some(source))),
                    Ok(None) => match self.bounded_get(target, key, deadline).await {
                        Ok(value) => Ok((value.clone(), value.map(|_| target))),
                        Err(err) => Err(err),
                    },
                    Err(err) => Err(err),
                }
            }
            Some(m) => match self.bounded_get(m.storage_tier, key, deadline).await {
                Ok(value) => Ok((value.clone(), value.map(|_| m.storage_tier))),
                Err(err) => Err(err),
            },
            None => match self.bounded_get(StorageTier::Hot, key, deadline).await {
                Ok(value) => Ok((value.clone(), value.map(|_| StorageTier::Hot))),
                Err(err) => Err(err),
            },
        };

        let query_time_ms = started.elapsed().as_millis() as u64;

        let result = match read_result {
            Ok((Some(bytes), tier)) => {
                let log = QueryLog {
                    client_ip: opts.client_ip.clone(),
                    user_id: opts.user_id.clone(),
                    business_tag: metadata.as_ref().and_then(|m| m.business_tag.clone()),
                    ..QueryLog::hit(key, now, tier.unwrap_or(StorageTier::Hot), query_time_ms)
                };
                publish_event(self.bus.as_ref(), QUERY_LOG_TOPIC, key, &log).await;
                FeatureResult {
                    found: true,
                    value: Some(String::from_utf8_lossy(&bytes).into_owned()),
                    tier,
                    query_time_ms,
                    error: None,
                    metadata: if opts.include_metadata { metadata } else { None },
                }
            }
            Ok((None, _)) => {
                let log = QueryLog {
                    client_ip: opts.client_ip.clone(),
                    user_id: opts.user_id.clone(),
                    ..QueryLog::miss(key, now, query_time_ms)
                };
                publish_event(self.bus.as_ref(), QUERY_LOG_TOPIC, key, &log).await;
                FeatureResult {
                    found: false,
                    value: None,
                    tier: None,
                    query_time_ms,
                    error: None,
                    metadata: None,
                }
            }
            Err(err) => {
                let log = QueryLog {
                    client_ip: opts.client_ip.clone(),
                    user_id: opts.user_id.clone(),
                    ..QueryLog::error(key, now, query_time_ms, err.to_string())
                };
                publish_event(self.bus.as_ref(), QUERY_LOG_TOPIC, key, &log).await;
                FeatureResult {
                    found: false,
                    value: None,
                    tier: None,
                    query_time_ms,
                    error: Some(err.to_string()),
                    metadata: None,
                }
            }
        };

        let outcome = if result.error.is_some() { "error" } else if result.found { "hit" } else { "miss" };
        metrics::counter!("featurehub_router_get_total", "outcome" => outcome).increment(1);
        metrics::histogram!("featurehub_router_get_duration_ms").record(query_time_ms as f64);

        self.stats_queue.submit(key);
        result
    }

    /// Batch read (spec §4.1 "Batch read"): one metadata lookup, one
    /// concurrent multi-get per tier, merge preserving input order.
    pub async fn batch_get(&self, keys: &[String], opts: BatchGetOptions) -> BatchResult {
        let started = Instant::now();
        let now = self.clock.now_ms();
        let deadline = self.deadline(opts.timeout_ms);

        let metadata = self.metadata.batch_get(keys).await.unwrap_or_default();

        let mut hot_keys = Vec::new();
        let mut cold_keys = Vec::new();
        for key in keys {
            match metadata.get(key).map(|m| m.storage_tier) {
                Some(StorageTier::Cold) => cold_keys.push(key.clone()),
                _ => hot_keys.push(key.clone()),
            }
        }

        let (hot_result, cold_result) = tokio::join!(
            async {
                if hot_keys.is_empty() {
                    return Ok(HashMap::new());
                }
                tokio::time::timeout(deadline, self.hot.mget(&hot_keys))
                    .await
                    .unwrap_or_else(|_| Err(FeatureError::Timeout { timeout_ms: deadline.as_millis() as u64 }))
            },
            async {
                if cold_keys.is_empty() {
                    return Ok(HashMap::new());
                }
                tokio::time::timeout(deadline, self.cold.mget(&cold_keys))
                    .await
                    .unwrap_or_else(|_| Err(FeatureError::Timeout { timeout_ms: deadline.as_millis() as u64 }))
            },
        );

        let hot_values = hot_result.unwrap_or_default();
        let cold_values = cold_result.unwrap_or_default();

        let mut summary = BatchSummary { total: keys.len(), ..Default::default() };
        let mut results = Vec::with_capacity(keys.len());

        for key in keys {
            let row = metadata.get(key);
            let tier = row.map_or(StorageTier::Hot, |m| m.storage_tier);
            let bytes = match tier {
                StorageTier::Hot => hot_values.get(key),
                StorageTier::Cold => cold_values.get(key),
            };

            let log = QueryLog {
                user_id: opts.user_id.clone(),
                ..match bytes {
                    Some(_) => QueryLog::hit(key.clone(), now, tier, 0),
                    None => QueryLog::miss(key.clone(), now, 0),
                }
            };
            publish_event(self.bus.as_ref(), QUERY_LOG_TOPIC, key, &log).await;
            self.stats_queue.submit(key.clone());

            match bytes {
                Some(value) => {
                    summary.found += 1;
                    match tier {
                        StorageTier::Hot => summary.hot_hits += 1,
                        StorageTier::Cold => summary.cold_hits += 1,
                    }
                    results.push(FeatureResult {
                        found: true,
                        value: Some(String::from_utf8_lossy(value).into_owned()),
                        tier: Some(tier),
                        query_time_ms: 0,
                        error: None,
                        metadata: if opts.include_metadata { row.cloned() } else { None },
                    });
                }
                None => {
                    summary.not_found += 1;
                    results.push(FeatureResult {
                        found: false,
                        value: None,
                        tier: None,
                        query_time_ms: 0,
                        error: None,
                        metadata: None,
                    });
                }
            }
        }

        summary.total_time_ms = started.elapsed().as_millis() as u64;
        metrics::counter!("featurehub_router_batch_get_total").increment(1);
        metrics::counter!("featurehub_router_batch_get_keys_total", "outcome" => "found").increment(summary.found as u64);
        metrics::counter!("featurehub_router_batch_get_keys_total", "outcome" => "not_found").increment(summary.not_found as u64);
        metrics::histogram!("featurehub_router_batch_get_duration_ms").record(summary.total_time_ms as f64);
        BatchResult { results, summary }
    }

    /// Write (spec §4.1 "Write"): storage hint applies only on first
    /// write (Open Question 3); upserts metadata; cleans up a stale copy
    /// in the old tier when a write changes a key's tier.
    pub async fn put(&self, key: &str, value: String, opts: PutOptions) -> Result<PutResult, FeatureError> {
        let now = self.clock.now_ms();
        let existing = self.metadata.get(key).await.unwrap_or(None);

        let tier = match &existing {
            Some(row) => row.storage_tier,
            None => opts.storage_hint.unwrap_or(StorageTier::Hot),
        };

        self.backend_for(tier).set(key, value.clone().into_bytes(), opts.ttl_secs).await?;

        let record = match existing {
            Some(mut row) => {
                row.storage_tier = tier;
                row.update_time = now;
                row.data_size = value.len() as u64;
                row.expire_time = opts.ttl_secs.map(|secs| now + secs as i64 * 1000);
                row
            }
            None => FeatureMetadata::new_for_write(key, tier, value.len() as u64, now, opts.ttl_secs, None),
        };

        let outcome = self.metadata.upsert(record).await?;

        if let Some(previous) = outcome.previous {
            if previous.storage_tier != tier && previous.migration_status == MigrationStatus::Stable {
                self.backend_for(previous.storage_tier).del(key).await?;
            }
        }

        metrics::counter!("featurehub_router_put_total", "tier" => tier.to_string()).increment(1);
        Ok(PutResult { tier, ttl_secs: opts.ttl_secs })
    }
}

#[async_trait]
impl ManagedService for RouterService {
    fn name(&self) -> &'static str {
        "router"
    }

    async fn init(&self, _ctx: &ServiceContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn shutdown(&self, _terminate: bool) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use featurehub_core::{SystemClock, TestClock};

    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::bus::NullEventBus;
    use crate::metadata::store::memory::InMemoryMetadataStore;
    use crate::metadata::MetadataCache;

    pub(super) fn router_with_clock(clock: Arc<dyn Clock>) -> RouterService {
        let metadata = Arc::new(MetadataService::new(
            Arc::new(InMemoryMetadataStore::new()),
            MetadataCache::new(Duration::from_secs(60), clock.clone()),
            clock.clone(),
        ));
        let stats_queue = StatsQueue::spawn(metadata.clone(), 100, 2);
        RouterService::new(
            Arc::new(MemoryBackend::with_clock(clock.clone())),
            Arc::new(MemoryBackend::with_clock(clock.clone())),
            metadata,
            Arc::new(NullEventBus),
            clock,
            stats_queue,
            Duration::from_secs(5),
        )
    }

    pub(super) fn router() -> RouterService {
        router_with_clock(Arc::new(SystemClock))
    }

    #[tokio::test]
    async fn s1_write_then_read_hot() {
        let router = router();
        let put = router.put("user:1:age", "25".to_string(), PutOptions { ttl_secs: Some(3600), ..Default::default() }).await.unwrap();
        assert_eq!(put.tier, StorageTier::Hot);

        let result = router.get("user:1:age", GetOptions::default()).await;
        assert!(result.found);
        assert_eq!(result.value.as_deref(), Some("25"));
        assert_eq!(result.tier, Some(StorageTier::Hot));
    }

    #[tokio::test]
    async fn get_missing_key_is_not_found() {
        let router = router();
        let result = router.get("missing", GetOptions::default()).await;
        assert!(!result.found);
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn s2_batch_across_tiers() {
        let router = router();
        router.put("a", "A".to_string(), PutOptions::default()).await.unwrap();
        router
            .put("b", "B".to_string(), PutOptions { storage_hint: Some(StorageTier::Cold), ..Default::default() })
            .await
            .unwrap();

        let batch = router
            .batch_get(&["a".to_string(), "b".to_string(), "c".to_string()], BatchGetOptions::default())
            .await;

        assert_eq!(batch.summary.total, 3);
        assert_eq!(batch.summary.found, 2);
        assert_eq!(batch.summary.hot_hits, 1);
        assert_eq!(batch.summary.cold_hits, 1);
        assert!(batch.results[0].found);
        assert_eq!(batch.results[0].value.as_deref(), Some("A"));
        assert!(batch.results[1].found);
        assert_eq!(batch.results[1].value.as_deref(), Some("B"));
        assert!(!batch.results[2].found);
    }

    #[tokio::test]
    async fn put_changing_tier_cleans_up_old_copy() {
        let clock = Arc::new(TestClock::new(0));
        let router = router_with_clock(clock.clone());

        router.put("k", "v1".to_string(), PutOptions::default()).await.unwrap();
        assert!(router.get("k", GetOptions::default()).await.found);

        // Simulate a migration having moved the key to COLD and finalized it.
        router.metadata.claim_migration("k").await.unwrap();
        router.cold.set("k", b"v1".to_vec(), None).await.unwrap();
        router.metadata.finalize_migration("k", StorageTier::Cold).await.unwrap();

        router.put("k", "v2".to_string(), PutOptions { storage_hint: Some(StorageTier::Hot), ..Default::default() }).await.unwrap();

        // Update ignores the hint: tier stays COLD (Open Question 3).
        let row = router.metadata.get("k").await.unwrap().unwrap();
        assert_eq!(row.storage_tier, StorageTier::Cold);
    }

    #[tokio::test]
    async fn dual_tier_read_during_migration_finds_source_value() {
        let clock = Arc::new(TestClock::new(0));
        let router = router_with_clock(clock);

        router.put("k", "v".to_string(), PutOptions::default()).await.unwrap();
        router.metadata.claim_migration("k").await.unwrap();

        let result = router.get("k", GetOptions::default()).await;
        assert!(result.found);
        assert_eq!(result.value.as_deref(), Some("v"));
    }
}

#[cfg(test)]
mod properties {
    use proptest::prelude::*;

    use super::tests::*;
    use super::*;

    /// Invariant 4 (spec §8): for any input `keys`, the output has one
    /// entry per input index, preserving order; duplicates in input
    /// yield the same value at both positions.
    #[test]
    fn batch_get_preserves_order_and_duplicates() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        proptest!(|(indices in prop::collection::vec(0usize..6, 1..20))| {
            runtime.block_on(async {
                let router = router();
                // 6 seed keys: even-indexed ones written to HOT, odd to
                // COLD, so both tiers are exercised by the batch.
                for i in 0..6 {
                    let hint = if i % 2 == 0 { StorageTier::Hot } else { StorageTier::Cold };
                    router
                        .put(&format!("key{i}"), format!("val{i}"), PutOptions { storage_hint: Some(hint), ..Default::default() })
                        .await
                        .unwrap();
                }

                let keys: Vec<String> = indices.iter().map(|i| format!("key{i}")).collect();
                let batch = router.batch_get(&keys, BatchGetOptions::default()).await;

                prop_assert_eq!(batch.results.len(), keys.len());
                for (i, key) in keys.iter().enumerate() {
                    prop_assert!(batch.results[i].found);
                    prop_assert_eq!(batch.results[i].value.as_deref(), Some(format!("val{}", &key[3..]).as_str()));
                }

                // Every position holding the same input key must agree on value.
                let mut seen: HashMap<&str, &str> = HashMap::new();
                for (i, key) in keys.iter().enumerate() {
                    let value = batch.results[i].value.as_deref().unwrap();
                    if let Some(expected) = seen.get(key.as_str()) {
                        prop_assert_eq!(*expected, value);
                    } else {
                        seen.insert(key.as_str(), value);
                    }
                }
                Ok(())
            })?;
        });
    }
}
