//! Shared error taxonomy.
//!
//! Every component (router, metadata, migration, cleanup) returns
//! [`FeatureError`] from its fallible contract methods. Each component's
//! HTTP layer owns the mapping from this taxonomy to status codes; the
//! taxonomy itself stays transport-agnostic here.

use thiserror::Error;

/// Errors shared across the router, metadata, migration and cleanup
/// components.
#[derive(Debug, Error)]
pub enum FeatureError {
    /// Key absent from a tier or from metadata.
    #[error("not found")]
    NotFound,

    /// A deadline elapsed before the operation completed.
    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// A backend (HOT, COLD, cache, authoritative store, bus) failed or
    /// was unreachable. Non-fatal for batch operations.
    #[error("backend unavailable: {detail}")]
    BackendUnavailable { detail: String },

    /// A compare-and-swap on `migration_status` lost the race.
    #[error("conflict: migration status changed concurrently")]
    Conflict,

    /// Malformed input: oversize/empty key, oversize batch, unknown tier.
    #[error("validation failed: {detail}")]
    Validation { detail: String },

    /// Invariant breach or unexpected failure.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl FeatureError {
    pub fn backend_unavailable(detail: impl Into<String>) -> Self {
        Self::BackendUnavailable { detail: detail.into() }
    }

    pub fn validation(detail: impl Into<String>) -> Self {
        Self::Validation { detail: detail.into() }
    }

    /// Whether the caller should surface this as a per-result error inside
    /// a partially-successful batch rather than failing the whole batch.
    pub fn is_partial_failure(&self) -> bool {
        matches!(self, Self::NotFound | Self::Timeout { .. } | Self::BackendUnavailable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_failure_classification() {
        assert!(FeatureError::NotFound.is_partial_failure());
        assert!(FeatureError::Timeout { timeout_ms: 100 }.is_partial_failure());
        assert!(FeatureError::backend_unavailable("down").is_partial_failure());
        assert!(!FeatureError::Conflict.is_partial_failure());
        assert!(!FeatureError::validation("bad").is_partial_failure());
    }

    #[test]
    fn display_messages_are_stable() {
        assert_eq!(FeatureError::NotFound.to_string(), "not found");
        assert_eq!(
            FeatureError::Timeout { timeout_ms: 5000 }.to_string(),
            "timed out after 5000ms"
        );
    }
}
