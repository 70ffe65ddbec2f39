//! Shared context for tasks executing inside a chain.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::error::{Result, TaskSystemError};
use crate::tasks::task::TaskId;

/// Thread-safe key/value bag scoped to one chain's execution.
///
/// Values are JSON by construction, which keeps every entry persistable
/// across restarts. Reads and writes are atomic: readers observe either
/// the pre- or post-write value, never a torn one.
#[derive(Debug)]
pub struct ChainContext {
    chain_id: TaskId,
    data: Mutex<Map<String, Value>>,
}

impl ChainContext {
    /// Create an empty context for the given chain.
    pub fn new(chain_id: TaskId) -> Self {
        tracing::debug!(chain_id = %chain_id, "chain context initialized");
        Self {
            chain_id,
            data: Mutex::new(Map::new()),
        }
    }

    /// Id of the owning chain.
    pub fn chain_id(&self) -> TaskId {
        self.chain_id
    }

    /// Get a value, or `default` if the key is absent.
    pub fn get(&self, key: &str, default: Value) -> Value {
        self.data.lock().get(key).cloned().unwrap_or(default)
    }

    /// Store a JSON value under `key`.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        self.data.lock().insert(key.clone(), value);
        tracing::debug!(chain_id = %self.chain_id, key = %key, "chain context key set");
    }

    /// Serialize and store any serializable value under `key`.
    ///
    /// Rejects values that cannot be represented as JSON (e.g. maps with
    /// non-string keys, non-finite floats).
    pub fn set_value<T: Serialize>(&self, key: impl Into<String>, value: &T) -> Result<()> {
        let json = serde_json::to_value(value).map_err(TaskSystemError::Serialization)?;
        self.set(key, json);
        Ok(())
    }

    /// Check if a key exists.
    pub fn has(&self, key: &str) -> bool {
        self.data.lock().contains_key(key)
    }

    /// All keys currently stored.
    pub fn keys(&self) -> Vec<String> {
        self.data.lock().keys().cloned().collect()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }

    /// Remove all entries.
    pub fn clear(&self) {
        self.data.lock().clear();
        tracing::debug!(chain_id = %self.chain_id, "chain context cleared");
    }

    /// Serialize to `{chainId, data}` for persistence.
    pub fn serialize(&self) -> Value {
        json!({
            "chainId": self.chain_id.to_string(),
            "data": Value::Object(self.data.lock().clone()),
        })
    }

    /// A copy of the stored data alone.
    pub fn data(&self) -> Value {
        Value::Object(self.data.lock().clone())
    }

    /// Reconstruct a context from its serialized form.
    pub fn deserialize(blob: &Value) -> Result<Self> {
        let chain_id: TaskId = blob["chainId"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| TaskSystemError::Deserialization {
                kind: "ChainContext".to_string(),
                reason: "missing or invalid chainId".to_string(),
            })?;
        let data = blob["data"].as_object().cloned().unwrap_or_default();
        Ok(Self {
            chain_id,
            data: Mutex::new(data),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_get_set_has_keys() {
        let ctx = ChainContext::new(TaskId::new());
        assert!(!ctx.has("token"));
        assert_eq!(ctx.get("token", Value::Null), Value::Null);

        ctx.set("token", json!("abc"));
        assert!(ctx.has("token"));
        assert_eq!(ctx.get("token", Value::Null), json!("abc"));
        assert_eq!(ctx.keys(), vec!["token".to_string()]);
        assert_eq!(ctx.len(), 1);

        ctx.clear();
        assert!(ctx.is_empty());
    }

    #[test]
    fn test_set_value_rejects_unrepresentable() {
        let ctx = ChainContext::new(TaskId::new());
        assert!(ctx.set_value("nan", &f64::NAN).is_err());
        assert!(!ctx.has("nan"));
        assert!(ctx.set_value("list", &vec![1, 2, 3]).is_ok());
    }

    #[test]
    fn test_serialize_roundtrip() {
        let chain_id = TaskId::new();
        let ctx = ChainContext::new(chain_id);
        ctx.set("count", json!(3));
        ctx.set("nested", json!({"a": [1, 2]}));

        let blob = ctx.serialize();
        assert_eq!(blob["chainId"], chain_id.to_string());

        let restored = ChainContext::deserialize(&blob).unwrap();
        assert_eq!(restored.chain_id(), chain_id);
        assert_eq!(restored.get("count", Value::Null), json!(3));
        assert_eq!(restored.get("nested", Value::Null), json!({"a": [1, 2]}));
    }

    #[test]
    fn test_deserialize_requires_chain_id() {
        assert!(ChainContext::deserialize(&json!({"data": {}})).is_err());
    }

    #[test]
    fn test_concurrent_access() {
        let ctx = Arc::new(ChainContext::new(TaskId::new()));
        let mut handles = Vec::new();
        for worker in 0..8 {
            let ctx = ctx.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..50 {
                    ctx.set(format!("k{worker}"), json!(i));
                    let _ = ctx.get(&format!("k{}", (worker + 1) % 8), Value::Null);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(ctx.len(), 8);
    }
}
