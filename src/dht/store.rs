//! Per-layer key/value stores using sled embedded database
//!
//! Each attached layer gets its own database `db_<layer_id>` under the DHT
//! directory. The DHT node is the only writer.

use serde::{Deserialize, Serialize};
use sled::Db;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

use super::key::{DhtId, LayerId};
use super::DhtError;
use crate::unix_now;

/// A value held on behalf of the network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredValue {
    pub value: String,
    pub original_publisher: DhtId,
    /// Unix time of the original publication
    pub original_publish_time: u64,
    /// Unix time this node last received the value
    pub last_published: u64,
    pub expire_seconds: u64,
}

impl StoredValue {
    /// Age in seconds since original publication
    pub fn age(&self, now: u64) -> u64 {
        now.saturating_sub(self.original_publish_time)
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.age(now) > self.expire_seconds
    }
}

/// Store of one layer
pub struct DataStore {
    db: Db,
}

impl DataStore {
    fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn get(&self, key: &DhtId) -> Result<Option<StoredValue>, DhtError> {
        match self.db.get(key.as_bytes())? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn put(&self, key: &DhtId, value: &StoredValue) -> Result<(), DhtError> {
        self.db.insert(key.as_bytes(), serde_json::to_vec(value)?)?;
        Ok(())
    }

    pub fn remove(&self, key: &DhtId) -> Result<bool, DhtError> {
        Ok(self.db.remove(key.as_bytes())?.is_some())
    }

    pub fn keys(&self) -> Result<Vec<DhtId>, DhtError> {
        let mut keys = Vec::new();
        for item in self.db.iter() {
            let (key, _) = item?;
            if let Ok(bytes) = key.as_ref().try_into() {
                keys.push(DhtId(bytes));
            }
        }
        Ok(keys)
    }

    /// Drop every value older than its expiry, returning how many were dropped
    pub fn remove_expired(&self, now: u64) -> Result<usize, DhtError> {
        let mut removed = 0;
        for item in self.db.iter() {
            let (key, raw) = item?;
            let expired = match serde_json::from_slice::<StoredValue>(&raw) {
                Ok(stored) => stored.is_expired(now),
                Err(_) => true,
            };
            if expired {
                self.db.remove(key)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }

    pub fn flush(&self) -> Result<(), DhtError> {
        self.db.flush()?;
        Ok(())
    }
}

/// Stores of all attached layers
pub struct LayerStores {
    /// `None` keeps everything in temporary databases
    root: Option<PathBuf>,
    stores: RwLock<HashMap<LayerId, Arc<DataStore>>>,
}

impl LayerStores {
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            stores: RwLock::new(HashMap::new()),
        }
    }

    pub fn temporary() -> Self {
        Self {
            root: None,
            stores: RwLock::new(HashMap::new()),
        }
    }

    /// Open the store of `layer`, creating it if needed
    pub fn attach(&self, layer: LayerId) -> Result<Arc<DataStore>, DhtError> {
        if let Some(store) = self.get(layer) {
            return Ok(store);
        }
        let db = match &self.root {
            Some(root) => sled::open(root.join(format!("db_{}", layer)))?,
            None => sled::Config::new().temporary(true).open()?,
        };
        let store = Arc::new(DataStore::new(db));
        self.stores
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(layer, store.clone());
        info!("Attached DHT store for layer {}", layer);
        Ok(store)
    }

    pub fn detach(&self, layer: LayerId) {
        let removed = self
            .stores
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&layer);
        if let Some(store) = removed {
            let _ = store.flush();
            debug!("Detached DHT store for layer {}", layer);
        }
    }

    pub fn get(&self, layer: LayerId) -> Option<Arc<DataStore>> {
        self.stores
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&layer)
            .cloned()
    }

    pub fn layers(&self) -> Vec<LayerId> {
        self.stores
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect()
    }

    /// Expire values in every layer
    pub fn remove_expired(&self, now: u64) -> Result<usize, DhtError> {
        let stores: Vec<_> = self
            .stores
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        let mut removed = 0;
        for store in stores {
            removed += store.remove_expired(now)?;
        }
        Ok(removed)
    }
}

/// Build a value received at `now` with the given `age`
pub fn received_value(
    value: String,
    original_publisher: DhtId,
    age: u64,
    expire_seconds: u64,
) -> StoredValue {
    let now = unix_now();
    StoredValue {
        value,
        original_publisher,
        original_publish_time: now.saturating_sub(age),
        last_published: now,
        expire_seconds,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_put_get_remove() {
        let dir = tempdir().unwrap();
        let stores = LayerStores::open(dir.path());
        let store = stores.attach(3).unwrap();
        let key = DhtId::from_key("suppliers:x:0:7");

        let value = received_value("{}".to_string(), DhtId::random(), 0, 3600);
        store.put(&key, &value).unwrap();
        assert_eq!(store.get(&key).unwrap().unwrap().value, "{}");
        assert!(dir.path().join("db_3").exists());

        assert!(store.remove(&key).unwrap());
        assert!(!store.remove(&key).unwrap());
        assert!(store.get(&key).unwrap().is_none());
    }

    #[test]
    fn test_expiry() {
        let stores = LayerStores::temporary();
        let store = stores.attach(0).unwrap();
        let fresh = DhtId::from_key("fresh");
        let stale = DhtId::from_key("stale");

        store
            .put(&fresh, &received_value("a".into(), DhtId::random(), 0, 600))
            .unwrap();
        store
            .put(&stale, &received_value("b".into(), DhtId::random(), 700, 600))
            .unwrap();

        assert_eq!(stores.remove_expired(unix_now()).unwrap(), 1);
        assert!(store.get(&fresh).unwrap().is_some());
        assert!(store.get(&stale).unwrap().is_none());
    }
}
