//! Key→blob persistence for the task system.
//!
//! The store is a checkpoint, not a log: each key holds one JSON blob and
//! writes replace the whole blob. Two backends are provided:
//!
//! - [`JsonStorage`]: a single JSON file, the default
//! - [`MemoryStorage`]: in-memory, for tests and ephemeral embedding

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;

use crate::error::Result;

mod json;
pub use json::JsonStorage;

/// Well-known storage keys used by the core.
pub mod keys {
    /// Serialized persistent pending tasks (queue).
    pub const PENDING_TASKS: &str = "pendingTasks";
    /// Serialized scheduled jobs (scheduler).
    pub const SCHEDULED_JOBS: &str = "scheduledJobs";
    /// Bounded failed task history (tracker).
    pub const FAILED_TASK_HISTORY: &str = "failedTaskHistory";
    /// Bounded completed task history (tracker).
    pub const COMPLETED_TASK_HISTORY: &str = "completedTaskHistory";
}

/// Trait for storage backends.
///
/// `save` must be atomic at the key granularity: a crash mid-write must
/// not corrupt previously persisted keys.
pub trait Storage: Send + Sync {
    /// Load the blob stored under `key`, or `None` if absent/unreadable.
    fn load(&self, key: &str) -> Option<Value>;

    /// Store `value` under `key`, replacing any previous blob.
    fn save(&self, key: &str, value: Value) -> Result<()>;

    /// Remove the blob stored under `key`.
    fn clear(&self, key: &str) -> Result<()>;
}

/// In-memory storage backend for testing and ephemeral use.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    data: RwLock<HashMap<String, Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn load(&self, key: &str) -> Option<Value> {
        self.data.read().get(key).cloned()
    }

    fn save(&self, key: &str, value: Value) -> Result<()> {
        self.data.write().insert(key.to_string(), value);
        Ok(())
    }

    fn clear(&self, key: &str) -> Result<()> {
        self.data.write().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_memory_storage_roundtrip() {
        let storage = MemoryStorage::new();
        assert!(storage.load("missing").is_none());

        storage.save("k", json!({"a": 1})).unwrap();
        assert_eq!(storage.load("k").unwrap()["a"], 1);

        storage.clear("k").unwrap();
        assert!(storage.load("k").is_none());
    }
}
