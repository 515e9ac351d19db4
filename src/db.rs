use crate::error::{PanelError, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

/// Key-value persistence collaborator. Controls are stored under
/// `controls/{controlId}`; the full table is reconstructable at startup by
/// enumerating keys.
pub trait KeyValueStore: Send + Sync {
    fn get_key(&self, key: &str) -> Option<Value>;
    fn set_key(&self, key: &str, value: Value) -> Result<()>;
    fn delete_key(&self, key: &str) -> Result<()>;
    fn keys_with_prefix(&self, prefix: &str) -> Vec<String>;
}

pub fn control_db_key(control_id: &str) -> String {
    format!("controls/{control_id}")
}

pub const CONTROLS_DB_PREFIX: &str = "controls/";

/// Store backed by a single JSON file, written atomically on every change.
pub struct JsonFileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, Value>>,
}

impl JsonFileStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let entries = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str(&content)
                .map_err(|e| PanelError::Db(format!("{}: {e}", path.display())))?
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path: path.to_path_buf(),
            entries: Mutex::new(entries),
        })
    }

    fn flush(&self, entries: &BTreeMap<String, Value>) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        let content = serde_json::to_string_pretty(entries)?;
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for JsonFileStore {
    fn get_key(&self, key: &str) -> Option<Value> {
        self.entries.lock().expect("db poisoned").get(key).cloned()
    }

    fn set_key(&self, key: &str, value: Value) -> Result<()> {
        let mut entries = self.entries.lock().expect("db poisoned");
        entries.insert(key.to_string(), value);
        self.flush(&entries)
    }

    fn delete_key(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().expect("db poisoned");
        if entries.remove(key).is_some() {
            self.flush(&entries)?;
        }
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.entries
            .lock()
            .expect("db poisoned")
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }
}

/// In-memory store for tests and `--check` runs.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get_key(&self, key: &str) -> Option<Value> {
        self.entries.lock().expect("db poisoned").get(key).cloned()
    }

    fn set_key(&self, key: &str, value: Value) -> Result<()> {
        self.entries
            .lock()
            .expect("db poisoned")
            .insert(key.to_string(), value);
        Ok(())
    }

    fn delete_key(&self, key: &str) -> Result<()> {
        self.entries.lock().expect("db poisoned").remove(key);
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.entries
            .lock()
            .expect("db poisoned")
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }
}

/// Persist a value, logging instead of failing the mutation that caused it.
/// A failed write must not leave the in-memory state inconsistent.
pub fn persist_best_effort(db: &dyn KeyValueStore, key: &str, value: Value) {
    if let Err(e) = db.set_key(key, value) {
        warn!("failed to persist {key}: {e}");
    }
}
