//! The authoritative metadata store contract (spec §4.2, §6.2) and its
//! two implementations: an in-memory store for tests and single-node
//! development, and a `PostgreSQL`-backed store for production.

use std::collections::HashMap;

use async_trait::async_trait;
use featurehub_core::{FeatureError, FeatureMetadata, MigrationStatus, StorageTier};
use serde::Serialize;

/// Result of an [`MetadataStore::upsert`]. `previous` carries the row as
/// it stood before the write, used by the router's stale-copy cleanup
/// (spec §4.1 step 4: delete the key from its old tier if that tier
/// differs from the new one and the old row was STABLE).
#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub created: bool,
    pub previous: Option<FeatureMetadata>,
}

/// Per-tier row/byte totals returned by `StatsByTier` / `StatsByTag`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierStats {
    pub count: u64,
    pub total_bytes: u64,
}

/// The system of record for per-key placement, statistics and lifecycle
/// (spec §4.2). The [`crate::metadata::MetadataService`] wraps an
/// implementation of this trait with a read-through cache; callers
/// outside that service should never talk to a `MetadataStore` directly.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<FeatureMetadata>, FeatureError>;

    async fn batch_get(&self, keys: &[String]) -> Result<HashMap<String, FeatureMetadata>, FeatureError>;

    async fn upsert(&self, record: FeatureMetadata) -> Result<UpsertOutcome, FeatureError>;

    /// No-op (`false`) if the row is missing.
    async fn update(&self, record: FeatureMetadata) -> Result<bool, FeatureError>;

    async fn batch_update(&self, records: Vec<FeatureMetadata>) -> Result<HashMap<String, bool>, FeatureError>;

    async fn delete(&self, key: &str) -> Result<bool, FeatureError>;

    /// Atomic CAS: STABLE|FAILED -> MIGRATING. Returns the claimed row
    /// (with `migration_status=Migrating`, `migration_time=now_ms`) on
    /// success, `None` if another claimer won or the row is missing.
    async fn claim_migration(
        &self,
        key: &str,
        now_ms: i64,
    ) -> Result<Option<FeatureMetadata>, FeatureError>;

    /// Finalize a successful migration: `storage_tier=target`,
    /// `migration_status=Stable`, `migration_time=update_time=now_ms`.
    async fn finalize_migration(
        &self,
        key: &str,
        target: StorageTier,
        now_ms: i64,
    ) -> Result<bool, FeatureError>;

    /// Abort a migration in progress: `migration_status=Failed`,
    /// `migration_time=now_ms`. Tier is left unchanged.
    async fn abort_migration(&self, key: &str, now_ms: i64) -> Result<bool, FeatureError>;

    /// tier=HOT ∧ status=STABLE ∧ (now - last_access_time) > idle_threshold_ms
    /// ∧ (now - max(last_access_time, migration_time, update_time)) > min_stable_idle_ms,
    /// ordered ascending by `last_access_time`.
    async fn select_for_hot_to_cold(
        &self,
        now_ms: i64,
        idle_threshold_ms: i64,
        min_stable_idle_ms: i64,
        limit: usize,
    ) -> Result<Vec<FeatureMetadata>, FeatureError>;

    /// tier=COLD ∧ status=STABLE ∧ access_count >= threshold ∧
    /// last_access_time >= recent_access_since, ordered descending by
    /// (access_count, last_access_time).
    async fn select_for_cold_to_hot(
        &self,
        access_count_threshold: i64,
        recent_access_since: i64,
        limit: usize,
    ) -> Result<Vec<FeatureMetadata>, FeatureError>;

    async fn select_expired(&self, now_ms: i64, limit: usize) -> Result<Vec<String>, FeatureError>;

    async fn delete_expired(&self, now_ms: i64) -> Result<u64, FeatureError>;

    async fn count_by_tier(&self) -> Result<HashMap<StorageTier, u64>, FeatureError>;

    async fn stats_by_tier(&self, tier: StorageTier) -> Result<TierStats, FeatureError>;

    async fn stats_by_tag(&self, tag: &str) -> Result<TierStats, FeatureError>;

    /// Resets every row's `access_count` to zero; returns the number of
    /// rows touched.
    async fn reset_access_counts(&self, now_ms: i64) -> Result<u64, FeatureError>;

    /// Advisory increment of `access_count` / bump of `last_access_time`,
    /// used by the router's bounded async stat-update queue. Lost updates
    /// under concurrent callers are tolerated (spec §4.2).
    async fn record_access(&self, key: &str, now_ms: i64) -> Result<(), FeatureError>;
}

pub mod memory {
    use std::sync::atomic::{AtomicI64, Ordering};

    use dashmap::DashMap;

    use super::*;

    /// In-memory [`MetadataStore`]. Per-key atomicity (including the
    /// migration CAS) comes from `DashMap`'s per-shard locking: each
    /// `entry()` call holds exclusive access to that key's slot for the
    /// duration of the closure.
    pub struct InMemoryMetadataStore {
        rows: DashMap<String, FeatureMetadata>,
        task_seq: AtomicI64,
    }

    impl InMemoryMetadataStore {
        #[must_use]
        pub fn new() -> Self {
            Self { rows: DashMap::new(), task_seq: AtomicI64::new(0) }
        }

        #[must_use]
        pub fn next_task_id(&self) -> String {
            format!("task-{}", self.task_seq.fetch_add(1, Ordering::Relaxed))
        }
    }

    impl Default for InMemoryMetadataStore {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl MetadataStore for InMemoryMetadataStore {
        async fn get(&self, key: &str) -> Result<Option<FeatureMetadata>, FeatureError> {
            Ok(self.rows.get(key).map(|r| r.clone()))
        }

        async fn batch_get(
            &self,
            keys: &[String],
        ) -> Result<HashMap<String, FeatureMetadata>, FeatureError> {
            let mut out = HashMap::with_capacity(keys.len());
            for key in keys {
                if let Some(row) = self.rows.get(key) {
                    out.insert(key.clone(), row.clone());
                }
            }
            Ok(out)
        }

        async fn upsert(&self, record: FeatureMetadata) -> Result<UpsertOutcome, FeatureError> {
            let key = record.key_name.clone();
            let mut created = false;
            let previous = match self.rows.entry(key) {
                dashmap::mapref::entry::Entry::Occupied(mut occ) => {
                    let previous = occ.get().clone();
                    occ.insert(record);
                    Some(previous)
                }
                dashmap::mapref::entry::Entry::Vacant(vac) => {
                    created = true;
                    vac.insert(record);
                    None
                }
            };
            Ok(UpsertOutcome { created, previous })
        }

        async fn update(&self, record: FeatureMetadata) -> Result<bool, FeatureError> {
            match self.rows.get_mut(&record.key_name) {
                Some(mut slot) => {
                    *slot = record;
                    Ok(true)
                }
                None => Ok(false),
            }
        }

        async fn batch_update(
            &self,
            records: Vec<FeatureMetadata>,
        ) -> Result<HashMap<String, bool>, FeatureError> {
            let mut out = HashMap::with_capacity(records.len());
            for record in records {
                let key = record.key_name.clone();
                let updated = self.update(record).await?;
                out.insert(key, updated);
            }
            Ok(out)
        }

        async fn delete(&self, key: &str) -> Result<bool, FeatureError> {
            Ok(self.rows.remove(key).is_some())
        }

        async fn claim_migration(
            &self,
            key: &str,
            now_ms: i64,
        ) -> Result<Option<FeatureMetadata>, FeatureError> {
            match self.rows.get_mut(key) {
                Some(mut row) if row.migration_status.is_claimable() => {
                    row.migration_status = MigrationStatus::Migrating;
                    row.migration_time = Some(now_ms);
                    Ok(Some(row.clone()))
                }
                _ => Ok(None),
            }
        }

        async fn finalize_migration(
            &self,
            key: &str,
            target: StorageTier,
            now_ms: i64,
        ) -> Result<bool, FeatureError> {
            match self.rows.get_mut(key) {
                Some(mut row) => {
                    row.storage_tier = target;
                    row.migration_status = MigrationStatus::Stable;
                    row.migration_time = Some(now_ms);
                    row.update_time = now_ms;
                    Ok(true)
                }
                None => Ok(false),
            }
        }

        async fn abort_migration(&self, key: &str, now_ms: i64) -> Result<bool, FeatureError> {
            match self.rows.get_mut(key) {
                Some(mut row) => {
                    row.migration_status = MigrationStatus::Failed;
                    row.migration_time = Some(now_ms);
                    Ok(true)
                }
                None => Ok(false),
            }
        }

        async fn select_for_hot_to_cold(
            &self,
            now_ms: i64,
            idle_threshold_ms: i64,
            min_stable_idle_ms: i64,
            limit: usize,
        ) -> Result<Vec<FeatureMetadata>, FeatureError> {
            let mut candidates: Vec<FeatureMetadata> = self
                .rows
                .iter()
                .map(|e| e.value().clone())
                .filter(|r| {
                    r.storage_tier == StorageTier::Hot
                        && r.migration_status == MigrationStatus::Stable
                        && now_ms - r.last_access_time > idle_threshold_ms
                        && now_ms - r.update_time.max(r.migration_time.unwrap_or(i64::MIN))
                            > min_stable_idle_ms
                })
                .collect();
            candidates.sort_by_key(|r| r.last_access_time);
            candidates.truncate(limit);
            Ok(candidates)
        }

        async fn select_for_cold_to_hot(
            &self,
            access_count_threshold: i64,
            recent_access_since: i64,
            limit: usize,
        ) -> Result<Vec<FeatureMetadata>, FeatureError> {
            let mut candidates: Vec<FeatureMetadata> = self
                .rows
                .iter()
                .map(|e| e.value().clone())
                .filter(|r| {
                    r.storage_tier == StorageTier::Cold
                        && r.migration_status == MigrationStatus::Stable
                        && r.access_count >= access_count_threshold
                        && r.last_access_time >= recent_access_since
                })
                .collect();
            candidates.sort_by(|a, b| {
                b.access_count
                    .cmp(&a.access_count)
                    .then_with(|| b.last_access_time.cmp(&a.last_access_time))
            });
            candidates.truncate(limit);
            Ok(candidates)
        }

        async fn select_expired(&self, now_ms: i64, limit: usize) -> Result<Vec<String>, FeatureError> {
            let keys: Vec<String> = self
                .rows
                .iter()
                .filter(|e| e.value().is_expired(now_ms))
                .map(|e| e.key().clone())
                .take(limit)
                .collect();
            Ok(keys)
        }

        async fn delete_expired(&self, now_ms: i64) -> Result<u64, FeatureError> {
            let keys = self.select_expired(now_ms, usize::MAX).await?;
            let mut count = 0;
            for key in keys {
                if self.rows.remove(&key).is_some() {
                    count += 1;
                }
            }
            Ok(count)
        }

        async fn count_by_tier(&self) -> Result<HashMap<StorageTier, u64>, FeatureError> {
            let mut out = HashMap::new();
            for entry in self.rows.iter() {
                *out.entry(entry.value().storage_tier).or_insert(0u64) += 1;
            }
            Ok(out)
        }

        async fn stats_by_tier(&self, tier: StorageTier) -> Result<TierStats, FeatureError> {
            let mut stats = TierStats::default();
            for entry in self.rows.iter().filter(|e| e.value().storage_tier == tier) {
                stats.count += 1;
                stats.total_bytes += entry.value().data_size;
            }
            Ok(stats)
        }

        async fn stats_by_tag(&self, tag: &str) -> Result<TierStats, FeatureError> {
            let mut stats = TierStats::default();
            for entry in self.rows.iter().filter(|e| e.value().business_tag.as_deref() == Some(tag)) {
                stats.count += 1;
                stats.total_bytes += entry.value().data_size;
            }
            Ok(stats)
        }

        async fn reset_access_counts(&self, now_ms: i64) -> Result<u64, FeatureError> {
            let mut touched = 0;
            for mut entry in self.rows.iter_mut() {
                entry.value_mut().access_count = 0;
                entry.value_mut().update_time = now_ms;
                touched += 1;
            }
            Ok(touched)
        }

        async fn record_access(&self, key: &str, now_ms: i64) -> Result<(), FeatureError> {
            if let Some(mut row) = self.rows.get_mut(key) {
                row.access_count += 1;
                row.last_access_time = now_ms;
            }
            Ok(())
        }
    }
}

#[cfg(feature = "postgres")]
pub mod postgres {
    use sqlx::postgres::PgPool;
    use sqlx::Row;

    use super::*;

    /// `PostgreSQL`-backed [`MetadataStore`]. Assumes a `feature_metadata`
    /// table shaped like:
    ///
    /// ```sql
    /// CREATE TABLE feature_metadata (
    ///     key_name          TEXT PRIMARY KEY,
    ///     storage_tier      TEXT NOT NULL,
    ///     last_access_time  BIGINT NOT NULL,
    ///     access_count      BIGINT NOT NULL DEFAULT 0,
    ///     create_time       BIGINT NOT NULL,
    ///     update_time       BIGINT NOT NULL,
    ///     expire_time       BIGINT,
    ///     data_size         BIGINT NOT NULL,
    ///     business_tag      TEXT,
    ///     migration_status  TEXT NOT NULL,
    ///     migration_time    BIGINT
    /// );
    /// ```
    pub struct PgMetadataStore {
        pool: PgPool,
    }

    impl PgMetadataStore {
        #[must_use]
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }

        fn row_to_metadata(row: &sqlx::postgres::PgRow) -> Result<FeatureMetadata, FeatureError> {
            let tier: String = row.try_get("storage_tier").map_err(pg_err)?;
            let status: String = row.try_get("migration_status").map_err(pg_err)?;
            Ok(FeatureMetadata {
                key_name: row.try_get("key_name").map_err(pg_err)?,
                storage_tier: parse_tier(&tier)?,
                last_access_time: row.try_get("last_access_time").map_err(pg_err)?,
                access_count: row.try_get("access_count").map_err(pg_err)?,
                create_time: row.try_get("create_time").map_err(pg_err)?,
                update_time: row.try_get("update_time").map_err(pg_err)?,
                expire_time: row.try_get("expire_time").map_err(pg_err)?,
                data_size: row.try_get::<i64, _>("data_size").map_err(pg_err)? as u64,
                business_tag: row.try_get("business_tag").map_err(pg_err)?,
                migration_status: parse_status(&status)?,
                migration_time: row.try_get("migration_time").map_err(pg_err)?,
            })
        }
    }

    fn pg_err(e: sqlx::Error) -> FeatureError {
        FeatureError::backend_unavailable(e.to_string())
    }

    fn parse_tier(raw: &str) -> Result<StorageTier, FeatureError> {
        match raw {
            "HOT" => Ok(StorageTier::Hot),
            "COLD" => Ok(StorageTier::Cold),
            other => Err(FeatureError::Internal(anyhow::anyhow!("unknown storage_tier: {other}"))),
        }
    }

    fn parse_status(raw: &str) -> Result<MigrationStatus, FeatureError> {
        match raw {
            "STABLE" => Ok(MigrationStatus::Stable),
            "MIGRATING" => Ok(MigrationStatus::Migrating),
            "FAILED" => Ok(MigrationStatus::Failed),
            other => Err(FeatureError::Internal(anyhow::anyhow!("unknown migration_status: {other}"))),
        }
    }

    #[async_trait]
    impl MetadataStore for PgMetadataStore {
        async fn get(&self, key: &str) -> Result<Option<FeatureMetadata>, FeatureError> {
            let row = sqlx::query("SELECT * FROM feature_metadata WHERE key_name = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(pg_err)?;
            row.as_ref().map(Self::row_to_metadata).transpose()
        }

        async fn batch_get(
            &self,
            keys: &[String],
        ) -> Result<HashMap<String, FeatureMetadata>, FeatureError> {
            if keys.is_empty() {
                return Ok(HashMap::new());
            }
            let rows = sqlx::query("SELECT * FROM feature_metadata WHERE key_name = ANY($1)")
                .bind(keys)
                .fetch_all(&self.pool)
                .await
                .map_err(pg_err)?;
            let mut out = HashMap::with_capacity(rows.len());
            for row in &rows {
                let m = Self::row_to_metadata(row)?;
                out.insert(m.key_name.clone(), m);
            }
            Ok(out)
        }

        async fn upsert(&self, record: FeatureMetadata) -> Result<UpsertOutcome, FeatureError> {
            let previous = self.get(&record.key_name).await?;
            sqlx::query(
                r"
                INSERT INTO feature_metadata
                    (key_name, storage_tier, last_access_time, access_count, create_time,
                     update_time, expire_time, data_size, business_tag, migration_status, migration_time)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ON CONFLICT (key_name) DO UPDATE SET
                    storage_tier = EXCLUDED.storage_tier,
                    last_access_time = EXCLUDED.last_access_time,
                    access_count = EXCLUDED.access_count,
                    update_time = EXCLUDED.update_time,
                    expire_time = EXCLUDED.expire_time,
                    data_size = EXCLUDED.data_size,
                    business_tag = EXCLUDED.business_tag,
                    migration_status = EXCLUDED.migration_status,
                    migration_time = EXCLUDED.migration_time
                ",
            )
            .bind(&record.key_name)
            .bind(record.storage_tier.as_str())
            .bind(record.last_access_time)
            .bind(record.access_count)
            .bind(record.create_time)
            .bind(record.update_time)
            .bind(record.expire_time)
            .bind(record.data_size as i64)
            .bind(&record.business_tag)
            .bind(match record.migration_status {
                MigrationStatus::Stable => "STABLE",
                MigrationStatus::Migrating => "MIGRATING",
                MigrationStatus::Failed => "FAILED",
            })
            .bind(record.migration_time)
            .execute(&self.pool)
            .await
            .map_err(pg_err)?;

            Ok(UpsertOutcome { created: previous.is_none(), previous })
        }

        async fn update(&self, record: FeatureMetadata) -> Result<bool, FeatureError> {
            let result = sqlx::query(
                r"
                UPDATE feature_metadata SET
                    storage_tier = $2, last_access_time = $3, access_count = $4,
                    update_time = $5, expire_time = $6, data_size = $7,
                    business_tag = $8, migration_status = $9, migration_time = $10
                WHERE key_name = $1
                ",
            )
            .bind(&record.key_name)
            .bind(record.storage_tier.as_str())
            .bind(record.last_access_time)
            .bind(record.access_count)
            .bind(record.update_time)
            .bind(record.expire_time)
            .bind(record.data_size as i64)
            .bind(&record.business_tag)
            .bind(match record.migration_status {
                MigrationStatus::Stable => "STABLE",
                MigrationStatus::Migrating => "MIGRATING",
                MigrationStatus::Failed => "FAILED",
            })
            .bind(record.migration_time)
            .execute(&self.pool)
            .await
            .map_err(pg_err)?;
            Ok(result.rows_affected() > 0)
        }

        async fn batch_update(
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

        async fn delete(&self, key: &str) -> Result<bool, FeatureError> {
            let result = sqlx::query("DELETE FROM feature_metadata WHERE key_name = $1")
                .bind(key)
                .execute(&self.pool)
                .await
                .map_err(pg_err)?;
            Ok(result.rows_affected() > 0)
        }

        async fn claim_migration(
            &self,
            key: &str,
            now_ms: i64,
        ) -> Result<Option<FeatureMetadata>, FeatureError> {
            let row = sqlx::query(
                r"
                UPDATE feature_metadata
                SET migration_status = 'MIGRATING', migration_time = $2
                WHERE key_name = $1 AND migration_status IN ('STABLE', 'FAILED')
                RETURNING *
                ",
            )
            .bind(key)
            .bind(now_ms)
            .fetch_optional(&self.pool)
            .await
            .map_err(pg_err)?;
            row.as_ref().map(Self::row_to_metadata).transpose()
        }

        async fn finalize_migration(
            &self,
            key: &str,
            target: StorageTier,
            now_ms: i64,
        ) -> Result<bool, FeatureError> {
            let result = sqlx::query(
                r"
                UPDATE feature_metadata
                SET storage_tier = $2, migration_status = 'STABLE', migration_time = $3, update_time = $3
                WHERE key_name = $1
                ",
            )
            .bind(key)
            .bind(target.as_str())
            .bind(now_ms)
            .execute(&self.pool)
            .await
            .map_err(pg_err)?;
            Ok(result.rows_affected() > 0)
        }

        async fn abort_migration(&self, key: &str, now_ms: i64) -> Result<bool, FeatureError> {
            let result = sqlx::query(
                "UPDATE feature_metadata SET migration_status = 'FAILED', migration_time = $2 WHERE key_name = $1",
            )
            .bind(key)
            .bind(now_ms)
            .execute(&self.pool)
            .await
            .map_err(pg_err)?;
            Ok(result.rows_affected() > 0)
        }

        async fn select_for_hot_to_cold(
            &self,
            now_ms: i64,
            idle_threshold_ms: i64,
            min_stable_idle_ms: i64,
            limit: usize,
        ) -> Result<Vec<FeatureMetadata>, FeatureError> {
            let rows = sqlx::query(
                r"
                SELECT * FROM feature_metadata
                WHERE storage_tier = 'HOT' AND migration_status = 'STABLE'
                  AND ($1 - last_access_time) > $2
                  AND ($1 - GREATEST(update_time, COALESCE(migration_time, 0))) > $3
                ORDER BY last_access_time ASC
                LIMIT $4
                ",
            )
            .bind(now_ms)
            .bind(idle_threshold_ms)
            .bind(min_stable_idle_ms)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(pg_err)?;
            rows.iter().map(Self::row_to_metadata).collect()
        }

        async fn select_for_cold_to_hot(
            &self,
            access_count_threshold: i64,
            recent_access_since: i64,
            limit: usize,
        ) -> Result<Vec<FeatureMetadata>, FeatureError> {
            let rows = sqlx::query(
                r"
                SELECT * FROM feature_metadata
                WHERE storage_tier = 'COLD' AND migration_status = 'STABLE'
                  AND access_count >= $1 AND last_access_time >= $2
                ORDER BY access_count DESC, last_access_time DESC
                LIMIT $3
                ",
            )
            .bind(access_count_threshold)
            .bind(recent_access_since)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(pg_err)?;
            rows.iter().map(Self::row_to_metadata).collect()
        }

        async fn select_expired(&self, now_ms: i64, limit: usize) -> Result<Vec<String>, FeatureError> {
            let rows = sqlx::query(
                "SELECT key_name FROM feature_metadata WHERE expire_time IS NOT NULL AND expire_time < $1 LIMIT $2",
            )
            .bind(now_ms)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(pg_err)?;
            rows.iter().map(|r| r.try_get("key_name").map_err(pg_err)).collect()
        }

        async fn delete_expired(&self, now_ms: i64) -> Result<u64, FeatureError> {
            let result = sqlx::query("DELETE FROM feature_metadata WHERE expire_time IS NOT NULL AND expire_time < $1")
                .bind(now_ms)
                .execute(&self.pool)
                .await
                .map_err(pg_err)?;
            Ok(result.rows_affected())
        }

        async fn count_by_tier(&self) -> Result<HashMap<StorageTier, u64>, FeatureError> {
            let rows = sqlx::query("SELECT storage_tier, COUNT(*) AS n FROM feature_metadata GROUP BY storage_tier")
                .fetch_all(&self.pool)
                .await
                .map_err(pg_err)?;
            let mut out = HashMap::new();
            for row in &rows {
                let tier: String = row.try_get("storage_tier").map_err(pg_err)?;
                let n: i64 = row.try_get("n").map_err(pg_err)?;
                out.insert(parse_tier(&tier)?, n as u64);
            }
            Ok(out)
        }

        async fn stats_by_tier(&self, tier: StorageTier) -> Result<TierStats, FeatureError> {
            let row = sqlx::query(
                "SELECT COUNT(*) AS n, COALESCE(SUM(data_size), 0) AS bytes FROM feature_metadata WHERE storage_tier = $1",
            )
            .bind(tier.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(pg_err)?;
            Ok(TierStats {
                count: row.try_get::<i64, _>("n").map_err(pg_err)? as u64,
                total_bytes: row.try_get::<i64, _>("bytes").map_err(pg_err)? as u64,
            })
        }

        async fn stats_by_tag(&self, tag: &str) -> Result<TierStats, FeatureError> {
            let row = sqlx::query(
                "SELECT COUNT(*) AS n, COALESCE(SUM(data_size), 0) AS bytes FROM feature_metadata WHERE business_tag = $1",
            )
            .bind(tag)
            .fetch_one(&self.pool)
            .await
            .map_err(pg_err)?;
            Ok(TierStats {
                count: row.try_get::<i64, _>("n").map_err(pg_err)? as u64,
                total_bytes: row.try_get::<i64, _>("bytes").map_err(pg_err)? as u64,
            })
        }

        async fn reset_access_counts(&self, now_ms: i64) -> Result<u64, FeatureError> {
            let result = sqlx::query("UPDATE feature_metadata SET access_count = 0, update_time = $1")
                .bind(now_ms)
                .execute(&self.pool)
                .await
                .map_err(pg_err)?;
            Ok(result.rows_affected())
        }

        async fn record_access(&self, key: &str, now_ms: i64) -> Result<(), FeatureError> {
            sqlx::query(
                "UPDATE feature_metadata SET access_count = access_count + 1, last_access_time = $2 WHERE key_name = $1",
            )
            .bind(key)
            .bind(now_ms)
            .execute(&self.pool)
            .await
            .map_err(pg_err)?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use featurehub_core::FeatureMetadata;

    use super::memory::InMemoryMetadataStore;
    use super::*;

    fn row(key: &str, tier: StorageTier, now: i64) -> FeatureMetadata {
        FeatureMetadata::new_for_write(key, tier, 10, now, None, None)
    }

    #[tokio::test]
    async fn upsert_reports_created_then_updated() {
        let store = InMemoryMetadataStore::new();
        let first = store.upsert(row("k", StorageTier::Hot, 0)).await.unwrap();
        assert!(first.created);
        assert!(first.previous.is_none());

        let second = store.upsert(row("k", StorageTier::Cold, 100)).await.unwrap();
        assert!(!second.created);
        assert_eq!(second.previous.unwrap().storage_tier, StorageTier::Hot);
    }

    #[tokio::test]
    async fn claim_migration_is_exclusive() {
        let store = InMemoryMetadataStore::new();
        store.upsert(row("k", StorageTier::Hot, 0)).await.unwrap();

        let claimed = store.claim_migration("k", 10).await.unwrap();
        assert!(claimed.is_some());
        assert_eq!(claimed.unwrap().migration_status, MigrationStatus::Migrating);

        let second = store.claim_migration("k", 20).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn claim_migration_missing_key_is_none() {
        let store = InMemoryMetadataStore::new();
        assert!(store.claim_migration("missing", 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn finalize_and_abort_migration() {
        let store = InMemoryMetadataStore::new();
        store.upsert(row("k", StorageTier::Hot, 0)).await.unwrap();
        store.claim_migration("k", 10).await.unwrap();

        assert!(store.finalize_migration("k", StorageTier::Cold, 20).await.unwrap());
        let row = store.get("k").await.unwrap().unwrap();
        assert_eq!(row.storage_tier, StorageTier::Cold);
        assert_eq!(row.migration_status, MigrationStatus::Stable);

        store.claim_migration("k", 30).await.unwrap();
        assert!(store.abort_migration("k", 40).await.unwrap());
        let row = store.get("k").await.unwrap().unwrap();
        assert_eq!(row.migration_status, MigrationStatus::Failed);
    }

    #[tokio::test]
    async fn select_for_hot_to_cold_respects_idle_and_stability_windows() {
        let store = InMemoryMetadataStore::new();
        let mut old = row("idle", StorageTier::Hot, 0);
        old.last_access_time = 0;
        old.update_time = 0;
        store.upsert(old).await.unwrap();

        let mut fresh = row("fresh", StorageTier::Hot, 0);
        fresh.last_access_time = 9_999;
        store.upsert(fresh).await.unwrap();

        let candidates = store.select_for_hot_to_cold(10_000, 5_000, 100, 10).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].key_name, "idle");
    }

    #[tokio::test]
    async fn select_expired_and_delete_expired() {
        let store = InMemoryMetadataStore::new();
        let mut expired = row("x", StorageTier::Hot, 0);
        expired.expire_time = Some(-1);
        store.upsert(expired).await.unwrap();

        let keys = store.select_expired(0, 10).await.unwrap();
        assert_eq!(keys, vec!["x".to_string()]);

        let deleted = store.delete_expired(0).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get("x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn record_access_increments_count() {
        let store = InMemoryMetadataStore::new();
        store.upsert(row("k", StorageTier::Hot, 0)).await.unwrap();
        store.record_access("k", 5).await.unwrap();
        store.record_access("k", 10).await.unwrap();

        let row = store.get("k").await.unwrap().unwrap();
        assert_eq!(row.access_count, 2);
        assert_eq!(row.last_access_time, 10);
    }

    #[tokio::test]
    async fn reset_access_counts_zeroes_all_rows() {
        let store = InMemoryMetadataStore::new();
        store.upsert(row("a", StorageTier::Hot, 0)).await.unwrap();
        store.record_access("a", 1).await.unwrap();

        let touched = store.reset_access_counts(100).await.unwrap();
        assert_eq!(touched, 1);
        assert_eq!(store.get("a").await.unwrap().unwrap().access_count, 0);
    }
}
