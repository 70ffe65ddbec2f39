//! JSON file-based storage backend.

use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

use super::Storage;
use crate::error::{Result, TaskSystemError};

/// Storage backend persisting all keys into one flat JSON object on disk.
///
/// Writes go to a temporary file in the same directory followed by a
/// rename, so a crash mid-write leaves the previous file intact.
pub struct JsonStorage {
    path: PathBuf,
    data: Mutex<Map<String, Value>>,
}

impl JsonStorage {
    /// Open (or create) the storage file at `path`.
    ///
    /// An unreadable or malformed file is logged and treated as empty;
    /// the core continues with last-known (here: no) state.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let data = Self::read_file(&path);
        Self {
            path,
            data: Mutex::new(data),
        }
    }

    fn read_file(path: &Path) -> Map<String, Value> {
        if !path.exists() {
            return Map::new();
        }
        match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<Value>(&contents) {
                Ok(Value::Object(map)) => map,
                Ok(_) => {
                    tracing::error!(path = %path.display(), "storage file is not a JSON object, starting empty");
                    Map::new()
                }
                Err(error) => {
                    tracing::error!(path = %path.display(), %error, "failed to parse storage file, starting empty");
                    Map::new()
                }
            },
            Err(error) => {
                tracing::error!(path = %path.display(), %error, "failed to read storage file, starting empty");
                Map::new()
            }
        }
    }

    /// Write the whole object out, atomically replacing the previous file.
    fn write_file(&self, data: &Map<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(TaskSystemError::storage)?;
            }
        }
        let serialized =
            serde_json::to_string_pretty(&Value::Object(data.clone()))?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, serialized).map_err(TaskSystemError::storage)?;
        fs::rename(&tmp_path, &self.path).map_err(TaskSystemError::storage)?;
        Ok(())
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Storage for JsonStorage {
    fn load(&self, key: &str) -> Option<Value> {
        self.data.lock().get(key).cloned()
    }

    fn save(&self, key: &str, value: Value) -> Result<()> {
        let mut data = self.data.lock();
        data.insert(key.to_string(), value);
        self.write_file(&data)
    }

    fn clear(&self, key: &str) -> Result<()> {
        let mut data = self.data.lock();
        if data.remove(key).is_some() {
            self.write_file(&data)?;
        }
        Ok(())
    }
}
