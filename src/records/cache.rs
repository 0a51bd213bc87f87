//! Record cache
//!
//! A process-local TTL cache of validated records, one entry per
//! `(layer, key)`, mirrored to `cache/<layer>/<hash_hex>` so a restart
//! warms up immediately.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

use crate::dht::{DhtId, LayerId};
use crate::unix_now;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CacheEntry {
    /// The record
    v: Value,
    /// Unix seconds when cached
    t: u64,
}

/// TTL cache of records, optionally persisted
pub struct RecordCache {
    root: Option<PathBuf>,
    entries: Mutex<HashMap<(LayerId, DhtId), CacheEntry>>,
}

impl RecordCache {
    /// Cache persisted under `root`, loading whatever is already there
    pub fn open(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let entries = load_entries(&root);
        debug!("Record cache warmed with {} entries from {:?}", entries.len(), root);
        Self {
            root: Some(root),
            entries: Mutex::new(entries),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            root: None,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Cached record for `key` if younger than `ttl`
    pub fn get(&self, layer: LayerId, key: &str, ttl: Duration) -> Option<Value> {
        let id = DhtId::from_key(key);
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries.get(&(layer, id))?;
        if unix_now().saturating_sub(entry.t) > ttl.as_secs() {
            return None;
        }
        Some(entry.v.clone())
    }

    pub fn put(&self, layer: LayerId, key: &str, record: Value) {
        let id = DhtId::from_key(key);
        let entry = CacheEntry {
            v: record,
            t: unix_now(),
        };
        if let Some(path) = self.path_of(layer, &id) {
            if let Err(e) = write_entry(&path, &entry) {
                warn!("Failed to persist cached record {}: {}", key, e);
            }
        }
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((layer, id), entry);
    }

    pub fn remove(&self, layer: LayerId, key: &str) {
        let id = DhtId::from_key(key);
        if let Some(path) = self.path_of(layer, &id) {
            if path.exists() {
                if let Err(e) = fs::remove_file(&path) {
                    warn!("Failed to remove cached record {}: {}", key, e);
                }
            }
        }
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(layer, id));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn path_of(&self, layer: LayerId, id: &DhtId) -> Option<PathBuf> {
        self.root
            .as_ref()
            .map(|root| root.join(layer.to_string()).join(id.to_hex()))
    }
}

fn write_entry(path: &Path, entry: &CacheEntry) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_vec(entry)?)
}

fn load_entries(root: &Path) -> HashMap<(LayerId, DhtId), CacheEntry> {
    let mut entries = HashMap::new();
    let Ok(layers) = fs::read_dir(root) else {
        return entries;
    };
    for layer_dir in layers.flatten() {
        let Some(layer) = layer_dir
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<LayerId>().ok())
        else {
            continue;
        };
        let Ok(files) = fs::read_dir(layer_dir.path()) else {
            continue;
        };
        for file in files.flatten() {
            let Some(id) = file
                .file_name()
                .to_str()
                .and_then(|name| DhtId::from_hex(name).ok())
            else {
                continue;
            };
            let parsed = fs::read(file.path())
                .ok()
                .and_then(|raw| serde_json::from_slice::<CacheEntry>(&raw).ok());
            match parsed {
                Some(entry) => {
                    entries.insert((layer, id), entry);
                }
                None => debug!("Skipping unreadable cache file {:?}", file.path()),
            }
        }
    }
    entries
}
