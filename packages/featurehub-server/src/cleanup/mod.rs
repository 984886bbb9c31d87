//! The cleanup engine (spec §4.4): reconciles metadata, HOT and COLD by
//! sweeping expired rows and orphaned store keys.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use featurehub_core::{CleanupRecord, CleanupType};
use parking_lot::Mutex;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backend::KvBackend;
use crate::bus::{publish_event, EventBus};
use crate::config::FeatureHubConfig;
use crate::metadata::MetadataService;
use crate::registry::{ManagedService, ServiceContext};
use crate::task_log::TaskRecordLog;
use featurehub_core::{Clock, StorageTier};

const CLEANUP_EVENTS_TOPIC: &str = "cleanup-events";

/// Records a completed sweep's cleaned/failed counts (SPEC_FULL §4
/// [EXPANDED] Metrics: "cleanup cleaned/failed counters").
fn emit_cleanup_metrics(record: &CleanupRecord) {
    let cleanup_type = format!("{:?}", record.cleanup_type);
    metrics::counter!("featurehub_cleanup_keys_total", "type" => cleanup_type.clone(), "outcome" => "cleaned")
        .increment(record.cleaned_count as u64);
    metrics::counter!("featurehub_cleanup_keys_total", "type" => cleanup_type, "outcome" => "failed")
        .increment(record.failed_count as u64);
}

/// Tunables the cleanup engine needs from `FeatureHubConfig` (spec §6.4).
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    pub batch_size: usize,
    pub batch_interval: Duration,
    pub orphan_cleanup_enabled: bool,
    pub expiry_sweep_interval: Duration,
    pub orphan_sweep_interval: Duration,
    /// Suppresses actual `DEL`s; the sweep still walks every candidate and
    /// reports what it would have deleted (spec §4.4 "Safety").
    pub dry_run: bool,
}

impl From<&FeatureHubConfig> for CleanupConfig {
    fn from(cfg: &FeatureHubConfig) -> Self {
        Self {
            batch_size: cfg.cleanup_batch_size,
            batch_interval: Duration::from_millis(cfg.batch_interval_ms),
            orphan_cleanup_enabled: cfg.orphan_cleanup_enabled,
            expiry_sweep_interval: cfg.expiry_sweep_interval,
            orphan_sweep_interval: cfg.orphan_sweep_interval,
            dry_run: cfg.dry_run,
        }
    }
}

#[derive(Clone)]
struct Collaborators {
    hot: Arc<dyn KvBackend>,
    cold: Arc<dyn KvBackend>,
    metadata: Arc<MetadataService>,
    bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
}

impl Collaborators {
    fn backend_for(&self, tier: StorageTier) -> &Arc<dyn KvBackend> {
        match tier {
            StorageTier::Hot => &self.hot,
            StorageTier::Cold => &self.cold,
        }
    }

    /// Deletes one expired key from its recorded tier and from metadata.
    /// Log-and-skip (record a failure, don't panic the sweep) if the
    /// metadata row has disappeared since selection -- another cleanup
    /// pass or a concurrent write may have already removed it.
    async fn clean_expired_key(&self, key: &str, dry_run: bool) -> bool {
        let row = match self.metadata.get(key).await {
            Ok(Some(row)) => row,
            Ok(None) => {
                warn!(key, "expired key had no metadata row at cleanup time, skipping");
                return false;
            }
            Err(err) => {
                warn!(key, %err, "metadata lookup failed during expiry cleanup, skipping");
                return false;
            }
        };

        if !dry_run {
            if let Err(err) = self.backend_for(row.storage_tier).del(key).await {
                warn!(key, %err, "store delete failed during expiry cleanup");
            }
            let _ = self.metadata.delete(key).await;
        }
        true
    }

    /// Deletes `key` from `tier` if (and only if) metadata has no row for
    /// it. `MetadataService::get` never caches negative lookups -- a miss
    /// always re-checks the authoritative store -- so this already
    /// satisfies spec §4.4's "never declare an orphan from a stale cache
    /// view" safety rule without a second explicit re-check.
    async fn clean_if_orphan(&self, tier: StorageTier, key: &str, dry_run: bool) -> bool {
        match self.metadata.get(key).await {
            Ok(None) => {
                if !dry_run {
                    if let Err(err) = self.backend_for(tier).del(key).await {
                        warn!(key, %err, "store delete failed during orphan cleanup");
                    }
                }
                true
            }
            _ => false,
        }
    }
}

/// The cleanup engine (spec §4.4): an expiry sweep and an orphan sweep,
/// each scheduled independently and triggerable on demand.
pub struct CleanupEngine {
    collaborators: Collaborators,
    config: CleanupConfig,
    records: Arc<TaskRecordLog<CleanupRecord>>,
    expiry_busy: Arc<AtomicBool>,
    orphan_busy: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CleanupEngine {
    #[must_use]
    pub fn new(
        hot: Arc<dyn KvBackend>,
        cold: Arc<dyn KvBackend>,
        metadata: Arc<MetadataService>,
        bus: Arc<dyn EventBus>,
        clock: Arc<dyn Clock>,
        config: CleanupConfig,
    ) -> Self {
        Self {
            collaborators: Collaborators { hot, cold, metadata, bus, clock },
            config,
            records: Arc::new(TaskRecordLog::new(500)),
            expiry_busy: Arc::new(AtomicBool::new(false)),
            orphan_busy: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &CleanupConfig {
        &self.config
    }

    #[must_use]
    pub fn records(&self) -> &TaskRecordLog<CleanupRecord> {
        &self.records
    }

    /// Runs one expiry sweep (spec §4.4 "Expiry sweep"): pulls batches of
    /// `expire_time < now` keys from metadata and deletes each from its
    /// recorded tier, then from metadata. In `dry_run` mode the sweep
    /// does exactly one batch -- repeated passes would otherwise re-select
    /// the same never-deleted keys forever.
    pub async fn run_expiry_sweep(&self, explicit_keys: Option<Vec<String>>) -> CleanupRecord {
        let task_id = Uuid::new_v4().to_string();
        let mut record = CleanupRecord::start(task_id.clone(), CleanupType::Expired, self.collaborators.clock.now_ms());
        let dry_run = self.config.dry_run;

        if let Some(keys) = explicit_keys {
            for key in &keys {
                if self.collaborators.clean_expired_key(key, dry_run).await {
                    record.record_cleaned();
                } else {
                    record.record_failed();
                }
            }
        } else {
            loop {
                let keys = match self.collaborators.metadata.select_expired(self.config.batch_size).await {
                    Ok(keys) => keys,
                    Err(err) => {
                        record.error_message = Some(err.to_string());
                        break;
                    }
                };
                if keys.is_empty() {
                    break;
                }
                for key in &keys {
                    if self.collaborators.clean_expired_key(key, dry_run).await {
                        record.record_cleaned();
                    } else {
                        record.record_failed();
                    }
                }
                if dry_run {
                    break;
                }
                tokio::time::sleep(self.config.batch_interval).await;
            }
        }

        record.finish(self.collaborators.clock.now_ms());
        self.publish_and_store(record)
    }

    /// Runs one orphan sweep (spec §4.4 "Orphan sweep"): a bounded
    /// cursor-based scan of both tiers, deleting any key with no
    /// metadata row. A no-op if `orphan_cleanup_enabled` is false.
    pub async fn run_orphan_sweep(&self, explicit_keys: Option<Vec<String>>) -> CleanupRecord {
        let task_id = Uuid::new_v4().to_string();
        let mut record = CleanupRecord::start(task_id.clone(), CleanupType::Orphan, self.collaborators.clock.now_ms());
        let dry_run = self.config.dry_run;

        if !self.config.orphan_cleanup_enabled {
            record.finish(self.collaborators.clock.now_ms());
            return self.publish_and_store(record);
        }

        if let Some(keys) = explicit_keys {
            // Explicit keys carry no tier hint; check both.
            for key in &keys {
                let cleaned_hot = self.collaborators.clean_if_orphan(StorageTier::Hot, key, dry_run).await;
                let cleaned_cold = self.collaborators.clean_if_orphan(StorageTier::Cold, key, dry_run).await;
                if cleaned_hot || cleaned_cold {
                    record.record_cleaned();
                }
            }
        } else {
            for tier in [StorageTier::Hot, StorageTier::Cold] {
                let mut cursor = 0u64;
                loop {
                    let (next_cursor, keys) = match self.collaborators.backend_for(tier).scan("", cursor, self.config.batch_size).await {
                        Ok(page) => page,
                        Err(err) => {
                            record.error_message = Some(err.to_string());
                            break;
                        }
                    };
                    for key in &keys {
                        if self.collaborators.clean_if_orphan(tier, key, dry_run).await {
                            record.record_cleaned();
                        }
                    }
                    cursor = next_cursor;
                    if cursor == 0 {
                        break;
                    }
                    tokio::time::sleep(self.config.batch_interval).await;
                }
            }
        }

        record.finish(self.collaborators.clock.now_ms());
        self.publish_and_store(record)
    }

    fn publish_and_store(&self, record: CleanupRecord) -> CleanupRecord {
        emit_cleanup_metrics(&record);
        self.records.put(record.task_id.clone(), record.clone());
        let records = self.records.clone();
        let bus = self.collaborators.bus.clone();
        let record_for_event = record.clone();
        tokio::spawn(async move {
            publish_event(bus.as_ref(), CLEANUP_EVENTS_TOPIC, &record_for_event.task_id, &record_for_event).await;
            drop(records);
        });
        record
    }

    #[must_use]
    pub fn statistics(&self) -> HashMap<String, u64> {
        let records = self.records.list_recent(self.records.len());
        let mut stats = HashMap::new();
        stats.insert("total_tasks".to_string(), records.len() as u64);
        stats.insert("total_cleaned".to_string(), records.iter().map(|r| r.cleaned_count as u64).sum());
        stats.insert("total_failed".to_string(), records.iter().map(|r| r.failed_count as u64).sum());
        stats
    }

    fn spawn_expiry_loop(&self) -> JoinHandle<()> {
        let collaborators = self.collaborators.clone();
        let config = self.config.clone();
        let records = self.records.clone();
        let busy = self.expiry_busy.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.expiry_sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if busy.swap(true, Ordering::SeqCst) {
                    continue;
                }
                let task_id = Uuid::new_v4().to_string();
                let mut record = CleanupRecord::start(task_id.clone(), CleanupType::Expired, collaborators.clock.now_ms());
                loop {
                    let keys = match collaborators.metadata.select_expired(config.batch_size).await {
                        Ok(keys) => keys,
                        Err(_) => break,
                    };
                    if keys.is_empty() {
                        break;
                    }
                    for key in &keys {
                        if collaborators.clean_expired_key(key, config.dry_run).await {
                            record.record_cleaned();
                        } else {
                            record.record_failed();
                        }
                    }
                    if config.dry_run {
                        break;
                    }
                    tokio::time::sleep(config.batch_interval).await;
                }
                record.finish(collaborators.clock.now_ms());
                info!(cleaned = record.cleaned_count, failed = record.failed_count, "expiry sweep complete");
                emit_cleanup_metrics(&record);
                records.put(task_id, record);
                busy.store(false, Ordering::SeqCst);
            }
        })
    }

    fn spawn_orphan_loop(&self) -> JoinHandle<()> {
        let collaborators = self.collaborators.clone();
        let config = self.config.clone();
        let records = self.records.clone();
        let busy = self.orphan_busy.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.orphan_sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if !config.orphan_cleanup_enabled {
                    continue;
                }
                if busy.swap(true, Ordering::SeqCst) {
                    continue;
                }
                let task_id = Uuid::new_v4().to_string();
                let mut record = CleanupRecord::start(task_id.clone(), CleanupType::Orphan, collaborators.clock.now_ms());
                for tier in [StorageTier::Hot, StorageTier::Cold] {
                    let mut cursor = 0u64;
                    loop {
                        let (next_cursor, keys) = match collaborators.backend_for(tier).scan("", cursor, config.batch_size).await {
                            Ok(page) => page,
                            Err(_) => break,
                        };
                        for key in &keys {
                            if collaborators.clean_if_orphan(tier, key, config.dry_run).await {
                                record.record_cleaned();
                            }
                        }
                        cursor = next_cursor;
                        if cursor == 0 {
                            break;
                        }
                        tokio::time::sleep(config.batch_interval).await;
                    }
                }
                record.finish(collaborators.clock.now_ms());
                info!(cleaned = record.cleaned_count, "orphan sweep complete");
                emit_cleanup_metrics(&record);
                records.put(task_id, record);
                busy.store(false, Ordering::SeqCst);
            }
        })
    }
}

#[async_trait]
impl ManagedService for CleanupEngine {
    fn name(&self) -> &'static str {
        "cleanup"
    }

    async fn init(&self, _ctx: &ServiceContext) -> anyhow::Result<()> {
        let mut tasks = self.tasks.lock();
        tasks.push(self.spawn_expiry_loop());
        tasks.push(self.spawn_orphan_loop());
        Ok(())
    }

    async fn shutdown(&self, _terminate: bool) -> anyhow::Result<()> {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        Ok(())
    }
}


#[cfg(test)]
mod properties {
    use std::time::Duration;

    use featurehub_core::{FeatureMetadata, TestClock};
    use proptest::prelude::*;

    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::bus::NullEventBus;
    use crate::metadata::store::memory::InMemoryMetadataStore;
    use crate::metadata::MetadataCache;

    /// Invariant 6 (spec §8): an orphan sweep never deletes a key for
    /// which metadata exists at the moment of the sweep's reconcile-read.
    /// Seeds an arbitrary mix of keys with and without a metadata row,
    /// all present in COLD, and checks that only the metadata-less keys
    /// are gone afterwards.
    #[test]
    fn orphan_sweep_never_deletes_keys_with_metadata() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        proptest!(|(has_metadata in prop::collection::vec(any::<bool>(), 1..20))| {
            runtime.block_on(async {
                let clock = Arc::new(TestClock::new(0));
                let hot: Arc<dyn KvBackend> = Arc::new(MemoryBackend::with_clock(clock.clone()));
                let cold: Arc<dyn KvBackend> = Arc::new(MemoryBackend::with_clock(clock.clone()));
                let metadata = Arc::new(MetadataService::new(
                    Arc::new(InMemoryMetadataStore::new()),
                    MetadataCache::new(Duration::from_secs(1_800), clock.clone()),
                    clock.clone(),
                ));
                let config = CleanupConfig {
                    batch_size: 1_000,
                    batch_interval: Duration::from_millis(0),
                    orphan_cleanup_enabled: true,
                    expiry_sweep_interval: Duration::from_secs(3_600),
                    orphan_sweep_interval: Duration::from_secs(3_600),
                    dry_run: false,
                };
                let engine = CleanupEngine::new(hot.clone(), cold.clone(), metadata.clone(), Arc::new(NullEventBus), clock, config);

                let keys: Vec<String> = (0..has_metadata.len()).map(|i| format!("k{i}")).collect();
                for (key, keep) in keys.iter().zip(&has_metadata) {
                    cold.set(key, b"v".to_vec(), None).await.unwrap();
                    if *keep {
                        metadata.upsert(FeatureMetadata::new_for_write(key.clone(), StorageTier::Cold, 1, 0, None, None)).await.unwrap();
                    }
                }

                engine.run_orphan_sweep(Some(keys.clone())).await;

                for (key, keep) in keys.iter().zip(&has_metadata) {
                    let still_present = cold.get(key).await.unwrap().is_some();
                    prop_assert_eq!(still_present, *keep, "key {} with metadata={} should stay iff it had a metadata row", key, keep);
                }
                Ok(())
            })?;
        });
    }
}
