//! The authoritative placement record: [`FeatureMetadata`].

use serde::{Deserialize, Serialize};

/// Maximum length of a feature key, in bytes. See [`crate::config`]-level
/// callers for enforcement; kept here as the data model's own ceiling.
pub const MAX_KEY_LENGTH: usize = 255;

/// Which physical store currently (or, during migration, formerly) holds
/// a key's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageTier {
    Hot,
    Cold,
}

impl StorageTier {
    pub fn other(self) -> Self {
        match self {
            Self::Hot => Self::Cold,
            Self::Cold => Self::Hot,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hot => "HOT",
            Self::Cold => "COLD",
        }
    }
}

impl std::fmt::Display for StorageTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a key with respect to the migration engine.
///
/// A row transitions STABLE/FAILED -> MIGRATING via compare-and-swap
/// (the claim), and MIGRATING -> STABLE or FAILED on completion or abort.
/// This is the *only* per-key lock in the system (see design notes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MigrationStatus {
    Stable,
    Migrating,
    Failed,
}

impl MigrationStatus {
    /// Whether a claim (CAS to `Migrating`) is legal from this status.
    pub fn is_claimable(self) -> bool {
        matches!(self, Self::Stable | Self::Failed)
    }
}

/// The authoritative per-key placement record (spec §3.1).
///
/// Keyed by `key_name`. Owned entirely by the metadata component: the
/// migration and cleanup engines only ever mutate it through that
/// component's contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureMetadata {
    pub key_name: String,
    pub storage_tier: StorageTier,
    pub last_access_time: i64,
    /// Advisory, monotonic-within-a-window counter. Lost updates under
    /// concurrent increments are tolerated (see §4.2).
    pub access_count: i64,
    pub create_time: i64,
    pub update_time: i64,
    pub expire_time: Option<i64>,
    pub data_size: u64,
    pub business_tag: Option<String>,
    pub migration_status: MigrationStatus,
    pub migration_time: Option<i64>,
}

impl FeatureMetadata {
    /// Construct a brand-new row for a first write, per §4.1 step 3.
    pub fn new_for_write(
        key_name: impl Into<String>,
        tier: StorageTier,
        data_size: u64,
        now_ms: i64,
        ttl_secs: Option<u64>,
        business_tag: Option<String>,
    ) -> Self {
        Self {
            key_name: key_name.into(),
            storage_tier: tier,
            last_access_time: now_ms,
            access_count: 0,
            create_time: now_ms,
            update_time: now_ms,
            expire_time: ttl_secs.map(|ttl| now_ms + ttl as i64 * 1000),
            data_size,
            business_tag,
            migration_status: MigrationStatus::Stable,
            migration_time: None,
        }
    }

    /// I4: whether this row is expired as of `now_ms`.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        matches!(self.expire_time, Some(expire) if expire < now_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_other_is_involutive() {
        assert_eq!(StorageTier::Hot.other(), StorageTier::Cold);
        assert_eq!(StorageTier::Cold.other(), StorageTier::Hot);
        assert_eq!(StorageTier::Hot.other().other(), StorageTier::Hot);
    }

    #[test]
    fn claimable_statuses() {
        assert!(MigrationStatus::Stable.is_claimable());
        assert!(MigrationStatus::Failed.is_claimable());
        assert!(!MigrationStatus::Migrating.is_claimable());
    }

    #[test]
    fn new_for_write_sets_expiry_from_ttl() {
        let m = FeatureMetadata::new_for_write("k", StorageTier::Hot, 10, 1_000, Some(60), None);
        assert_eq!(m.create_time, 1_000);
        assert_eq!(m.update_time, 1_000);
        assert_eq!(m.expire_time, Some(1_000 + 60_000));
        assert_eq!(m.migration_status, MigrationStatus::Stable);
    }

    #[test]
    fn new_for_write_without_ttl_never_expires() {
        let m = FeatureMetadata::new_for_write("k", StorageTier::Cold, 0, 1_000, None, None);
        assert_eq!(m.expire_time, None);
        assert!(!m.is_expired(i64::MAX));
    }

    #[test]
    fn expiry_check() {
        let mut m = FeatureMetadata::new_for_write("k", StorageTier::Hot, 0, 0, Some(1), None);
        assert!(!m.is_expired(500));
        assert!(m.is_expired(1_001));
        m.expire_time = None;
        assert!(!m.is_expired(i64::MAX));
    }
}
