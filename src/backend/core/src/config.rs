//! Configuration management.

use serde::Deserialize;

/// Configuration for the task execution core.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskSystemConfig {
    /// Maximum number of concurrently running tasks
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,

    /// Path of the JSON storage file
    #[serde(default = "default_storage_path")]
    pub storage_path: String,

    /// Maximum entries kept in the failed/completed task histories
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Capacity of the event broadcast channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for TaskSystemConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            storage_path: default_storage_path(),
            history_limit: default_history_limit(),
            event_capacity: default_event_capacity(),
        }
    }
}

// Default value functions
fn default_max_concurrent_tasks() -> usize { 3 }
fn default_storage_path() -> String { "task_storage.json".to_string() }
fn default_history_limit() -> usize { 1000 }
fn default_event_capacity() -> usize { 256 }

impl TaskSystemConfig {
    /// Load configuration from `TASKFORGE__`-prefixed environment variables.
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("TASKFORGE").separator("__"))
            .build()?;

        let cfg: TaskSystemConfig = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with environment overrides.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("TASKFORGE").separator("__"))
            .build()?;

        let cfg: TaskSystemConfig = config.try_deserialize()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = TaskSystemConfig::default();
        assert_eq!(cfg.max_concurrent_tasks, 3);
        assert_eq!(cfg.storage_path, "task_storage.json");
        assert_eq!(cfg.history_limit, 1000);
        assert_eq!(cfg.event_capacity, 256);
    }

    #[test]
    fn test_deserialize_partial() {
        let cfg: TaskSystemConfig =
            serde_json::from_str(r#"{"max_concurrent_tasks": 8}"#).unwrap();
        assert_eq!(cfg.max_concurrent_tasks, 8);
        assert_eq!(cfg.history_limit, 1000);
    }
}
