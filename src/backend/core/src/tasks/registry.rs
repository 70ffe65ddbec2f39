//! Dynamic dispatch over task kinds for deserialization.
//!
//! Persisted blobs carry an opaque `kind` discriminator; the registry
//! maps it back to a deserializer closure populated at program start.
//! The core never interprets the discriminator beyond lookup.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Result, TaskSystemError};
use crate::tasks::chain::{TaskChain, CHAIN_KIND};
use crate::tasks::task::Task;

type Deserializer =
    Box<dyn Fn(&TaskRegistry, &Value) -> Result<Arc<dyn Task>> + Send + Sync>;

/// Registry of `kind → deserializer` used to reconstruct tasks from
/// persisted blobs.
#[derive(Default)]
pub struct TaskRegistry {
    deserializers: RwLock<HashMap<String, Deserializer>>,
}

impl TaskRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the chain composite pre-registered.
    pub fn with_chain() -> Self {
        let registry = Self::new();
        registry.register(CHAIN_KIND, |registry, blob| {
            TaskChain::deserialize(registry, blob).map(|chain| Arc::new(chain) as Arc<dyn Task>)
        });
        registry
    }

    /// Register a deserializer for a task kind.
    ///
    /// The closure receives the registry itself so composite kinds can
    /// reconstruct nested tasks. Registering an existing kind replaces
    /// the previous deserializer.
    pub fn register<F>(&self, kind: impl Into<String>, deserializer: F)
    where
        F: Fn(&TaskRegistry, &Value) -> Result<Arc<dyn Task>> + Send + Sync + 'static,
    {
        let kind = kind.into();
        tracing::debug!(kind = %kind, "task kind registered");
        self.deserializers
            .write()
            .insert(kind, Box::new(deserializer));
    }

    /// Whether a deserializer exists for `kind`.
    pub fn contains(&self, kind: &str) -> bool {
        self.deserializers.read().contains_key(kind)
    }

    /// Registered kind names.
    pub fn kinds(&self) -> Vec<String> {
        self.deserializers.read().keys().cloned().collect()
    }

    /// Reconstruct a task from its persisted blob, dispatching on the
    /// blob's `kind` field.
    pub fn deserialize(&self, blob: &Value) -> Result<Arc<dyn Task>> {
        let kind = blob["kind"]
            .as_str()
            .ok_or_else(|| TaskSystemError::Deserialization {
                kind: "<unknown>".to_string(),
                reason: "blob has no kind discriminator".to_string(),
            })?;
        let deserializers = self.deserializers.read();
        let deserializer =
            deserializers
                .get(kind)
                .ok_or_else(|| TaskSystemError::Deserialization {
                    kind: kind.to_string(),
                    reason: "kind is not registered".to_string(),
                })?;
        deserializer(self, blob)
    }
}
