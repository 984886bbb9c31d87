//! [`QueryLog`]: the per-read telemetry record emitted by the router
//! (spec §3.2).

use serde::{Deserialize, Serialize};

use crate::metadata::StorageTier;

/// One record per read, partitioned onto the event bus by `key` so that
/// per-key ordering is preserved (see §5).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryLog {
    pub key: String,
    pub timestamp_ms: i64,
    /// Tier the value was actually served from, if found.
    pub source_tier: Option<StorageTier>,
    pub client_ip: Option<String>,
    pub user_id: Option<String>,
    pub success: bool,
    pub query_time_ms: u64,
    pub error: Option<String>,
    pub business_tag: Option<String>,
}

impl QueryLog {
    pub fn hit(
        key: impl Into<String>,
        timestamp_ms: i64,
        source_tier: StorageTier,
        query_time_ms: u64,
    ) -> Self {
        Self {
            key: key.into(),
            timestamp_ms,
            source_tier: Some(source_tier),
            client_ip: None,
            user_id: None,
            success: true,
            query_time_ms,
            error: None,
            business_tag: None,
        }
    }

    pub fn miss(key: impl Into<String>, timestamp_ms: i64, query_time_ms: u64) -> Self {
        Self {
            key: key.into(),
            timestamp_ms,
            source_tier: None,
            client_ip: None,
            user_id: None,
            success: false,
            query_time_ms,
            error: None,
            business_tag: None,
        }
    }

    pub fn error(
        key: impl Into<String>,
        timestamp_ms: i64,
        query_time_ms: u64,
        error: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            timestamp_ms,
            source_tier: None,
            client_ip: None,
            user_id: None,
            success: false,
            query_time_ms,
            error: Some(error.into()),
            business_tag: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_carries_tier_and_success() {
        let log = QueryLog::hit("k", 1, StorageTier::Hot, 2);
        assert!(log.success);
        assert_eq!(log.source_tier, Some(StorageTier::Hot));
        assert!(log.error.is_none());
    }

    #[test]
    fn miss_has_no_tier() {
        let log = QueryLog::miss("k", 1, 2);
        assert!(!log.success);
        assert_eq!(log.source_tier, None);
    }
}
