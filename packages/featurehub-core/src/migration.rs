//! [`MigrationRecord`]: the per-task audit entry emitted by the migration
//! engine (spec §3.3).

use serde::{Deserialize, Serialize};

use crate::metadata::StorageTier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationType {
    HotToCold,
    ColdToHot,
}

impl MigrationType {
    pub fn source(self) -> StorageTier {
        match self {
            Self::HotToCold => StorageTier::Hot,
            Self::ColdToHot => StorageTier::Cold,
        }
    }

    pub fn target(self) -> StorageTier {
        self.source().other()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationTaskStatus {
    Running,
    Completed,
    Failed,
}

/// Audit entry for one sweep (or one manually triggered task) of the
/// migration engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub task_id: String,
    #[serde(rename = "type")]
    pub task_type: MigrationType,
    pub status: MigrationTaskStatus,
    pub source_tier: StorageTier,
    pub target_tier: StorageTier,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub total: usize,
    pub success_count: usize,
    pub fail_count: usize,
    pub failed_keys: Vec<String>,
    pub error_message: Option<String>,
}

impl MigrationRecord {
    pub fn start(task_id: impl Into<String>, task_type: MigrationType, total: usize, now_ms: i64) -> Self {
        Self {
            task_id: task_id.into(),
            task_type,
            status: MigrationTaskStatus::Running,
            source_tier: task_type.source(),
            target_tier: task_type.target(),
            start_time: now_ms,
            end_time: None,
            total,
            success_count: 0,
            fail_count: 0,
            failed_keys: Vec::new(),
            error_message: None,
        }
    }

    pub fn record_success(&mut self) {
        self.success_count += 1;
    }

    pub fn record_failure(&mut self, key: impl Into<String>) {
        self.fail_count += 1;
        self.failed_keys.push(key.into());
    }

    pub fn finish(&mut self, now_ms: i64) {
        self.end_time = Some(now_ms);
        self.status = if self.fail_count == 0 {
            MigrationTaskStatus::Completed
        } else if self.success_count == 0 {
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
    fn hot_to_cold_source_and_target() {
        assert_eq!(MigrationType::HotToCold.source(), StorageTier::Hot);
        assert_eq!(MigrationType::HotToCold.target(), StorageTier::Cold);
        assert_eq!(MigrationType::ColdToHot.source(), StorageTier::Cold);
        assert_eq!(MigrationType::ColdToHot.target(), StorageTier::Hot);
    }

    #[test]
    fn finish_marks_completed_when_no_failures() {
        let mut rec = MigrationRecord::start("t1", MigrationType::HotToCold, 3, 0);
        rec.record_success();
        rec.record_success();
        rec.record_success();
        rec.finish(100);
        assert_eq!(rec.status, MigrationTaskStatus::Completed);
        assert_eq!(rec.end_time, Some(100));
    }

    #[test]
    fn finish_marks_failed_when_all_fail() {
        let mut rec = MigrationRecord::start("t2", MigrationType::ColdToHot, 2, 0);
        rec.record_failure("a");
        rec.record_failure("b");
        rec.finish(50);
        assert_eq!(rec.status, MigrationTaskStatus::Failed);
        assert_eq!(rec.failed_keys, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn finish_is_completed_on_partial_failure() {
        let mut rec = MigrationRecord::start("t3", MigrationType::HotToCold, 2, 0);
        rec.record_success();
        rec.record_failure("a");
        rec.finish(10);
        assert_eq!(rec.status, MigrationTaskStatus::Completed);
        assert_eq!(rec.fail_count, 1);
    }
}
