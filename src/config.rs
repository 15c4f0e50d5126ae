//! Configuration types for the task queue.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration for the queue engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Path of the SQLite database file.
    pub db_path: PathBuf,
    /// Retry limit applied at enqueue time to tasks that do not set
    /// their own.
    pub default_retry_limit: u32,
    /// Upper bound, in seconds, for the exponential retry delay.
    pub max_retry_delay_secs: u32,
    /// Age, in days, task retention cleanup uses when the caller does
    /// not pass one.
    pub task_retention_days: u32,
    /// Age, in days, event retention cleanup uses when the caller does
    /// not pass one.
    pub event_retention_days: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("taskwell.db"),
            default_retry_limit: crate::task::DEFAULT_RETRY_LIMIT,
            max_retry_delay_secs: 86_400,
            task_retention_days: 7,
            event_retention_days: 7,
        }
    }
}

impl QueueConfig {
    /// Configuration pointing at the given database file.
    pub fn with_db_path(path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: path.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_durable_contract() {
        let cfg = QueueConfig::default();
        assert_eq!(cfg.default_retry_limit, 17);
        assert_eq!(cfg.max_retry_delay_secs, 86_400);
        assert_eq!(cfg.task_retention_days, 7);
    }

    #[test]
    fn config_serde_round_trip() {
        let cfg = QueueConfig::with_db_path("/tmp/q.db");
        let json = serde_json::to_string(&cfg).expect("serialize");
        let restored: QueueConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(restored.db_path, PathBuf::from("/tmp/q.db"));
        assert_eq!(restored.default_retry_limit, cfg.default_retry_limit);
    }
}
