//! Key-value preference storage.
//!
//! Credential records, "remember password" flags and the recent-connections
//! list persist through the [`PreferenceStore`] trait. Two implementations are
//! provided: an in-memory one and a JSON file written through on every change.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use dashmap::DashMap;
use tracing::warn;

/// Simple string key-value store.
pub trait PreferenceStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn put(&self, key: &str, value: &str);

    fn remove(&self, key: &str);
}

/// Process-local preferences; lost on exit.
#[derive(Debug, Default)]
pub struct MemoryPreferences {
    values: DashMap<String, String>,
}

impl MemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl PreferenceStore for MemoryPreferences {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).map(|v| v.clone())
    }

    fn put(&self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        self.values.remove(key);
    }
}

/// Preferences kept in a flat JSON object on disk.
///
/// Write failures are logged and otherwise ignored; the in-memory view stays
/// authoritative for the rest of the process.
#[derive(Debug)]
pub struct JsonFilePreferences {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl JsonFilePreferences {
    /// Open (or lazily create) the preference file at `path`.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let values = match std::fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => BTreeMap::new(),
            Ok(text) => serde_json::from_str(&text)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e),
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.values.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn flush(&self, values: &BTreeMap<String, String>) {
        let result = serde_json::to_string_pretty(values)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
            .and_then(|text| {
                if let Some(parent) = self.path.parent()
                    && !parent.as_os_str().is_empty()
                {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&self.path, text)
            });
        if let Err(e) = result {
            warn!(path = %self.path.display(), "failed to persist preferences: {}", e);
        }
    }
}

impl PreferenceStore for JsonFilePreferences {
    fn get(&self, key: &str) -> Option<String> {
        self.lock().get(key).cloned()
    }

    fn put(&self, key: &str, value: &str) {
        let mut values = self.lock();
        values.insert(key.to_string(), value.to_string());
        self.flush(&values);
    }

    fn remove(&self, key: &str) {
        let mut values = self.lock();
        if values.remove(key).is_some() {
            self.flush(&values);
        }
    }
}
