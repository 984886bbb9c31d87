//! [`CleanupRecord`]: the per-sweep audit entry emitted by the cleanup
//! engine (spec §3.4).

use serde::{Deserialize, Serialize};

use crate::migration::MigrationTaskStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CleanupType {
    #[serde(rename = "EXPIRED_DATA")]
    Expired,
    #[serde(rename = "ORPHAN_DATA")]
    Orphan,
}

/// Audit entry for one expiry sweep or one orphan sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupRecord {
    pub task_id: String,
    #[serde(rename = "type")]
    pub cleanup_type: CleanupType,
    pub status: MigrationTaskStatus,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub cleaned_count: usize,
    pub failed_count: usize,
    pub error_message: Option<String>,
}

impl CleanupRecord {
    pub fn start(task_id: impl Into<String>, cleanup_type: CleanupType, now_ms: i64) -> Self {
        Self {
            task_id: task_id.into(),
            cleanup_type,
            status: MigrationTaskStatus::Running,
            start_time: now_ms,
            end_time: None,
            cleaned_count: 0,
            failed_count: 0,
            error_message: None,
        }
    }

    pub fn record_cleaned(&mut self) {
        self.cleaned_count += 1;
    }

    pub fn record_failed(&mut self) {
        self.failed_count += 1;
    }

    pub fn finish(&mut self, now_ms: i64) {
        self.end_time = Some(now_ms);
        self.status = if self.failed_count == 0 {
            MigrationTaskStatus::Completed
        } else if self.cleaned_count == 0 {
            MigrationTaskStatus::Failed
        } else {
            MigrationTaskStatus::Completed
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleaned_with_no_failures_completes() {
        let mut rec = CleanupRecord::start("c1", CleanupType::Expired, 0);
        rec.record_cleaned();
        rec.record_cleaned();
        rec.finish(5);
        assert_eq!(rec.status, MigrationTaskStatus::Completed);
        assert_eq!(rec.cleaned_count, 2);
        assert_eq!(rec.end_time, Some(5));
    }

    #[test]
    fn orphan_sweep_with_no_work_is_a_clean_noop() {
        let mut rec = CleanupRecord::start("c2", CleanupType::Orphan, 0);
        rec.finish(1);
        assert_eq!(rec.status, MigrationTaskStatus::Completed);
        assert_eq!(rec.cleaned_count, 0);
    }
}
