use regex::Regex;
use serde_json::{Map, Value};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use super::cache::RecordCache;
use super::rules::{RecordRules, ValidationError};
use super::types::Record;
use crate::dht::{Contact, DhtError, DhtId, DhtNode, LayerId, Lookup, Response};

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("Revision conflict, current revision is {current_revision}")]
    RevisionConflict { current_revision: u64 },
    #[error("Write failed: {0}")]
    WriteFailed(String),
    #[error("DHT error: {0}")]
    Dht(#[from] DhtError),
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl RecordError {
    pub fn current_revision(&self) -> Option<u64> {
        match self {
            RecordError::RevisionConflict { current_revision } => Some(*current_revision),
            _ => None,
        }
    }
}

fn revision_advisory() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"current revision is (\d+)").ok())
        .as_ref()
}

/// Parse the revision a store rejection advises, if any
pub fn parse_revision_advisory(message: &str) -> Option<u64> {
    revision_advisory()?
        .captures(message)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Stable encoding of a record: sorted keys, no whitespace
pub fn encode_record(record: &Value) -> Result<String, serde_json::Error> {
    serde_json::to_string(record)
}

/// Typed, validated, revisioned records on top of the DHT
#[derive(Clone)]
pub struct RecordLayer {
    dht: DhtNode,
    cache: Arc<RecordCache>,
}

impl RecordLayer {
    pub fn new(dht: DhtNode, cache: Arc<RecordCache>) -> Self {
        Self { dht, cache }
    }

    pub fn dht(&self) -> &DhtNode {
        &self.dht
    }

    pub fn cache(&self) -> &RecordCache {
        &self.cache
    }

    /// Validate and store a record, auditing every node's answer
    pub async fn set_valid_data(
        &self,
        key: &str,
        record: Value,
        rules: &RecordRules,
        expire: u64,
        layer: LayerId,
    ) -> Result<Vec<Contact>, RecordError> {
        let record = prepare(key, record, rules)?;
        let encoded = encode_record(&record)?;

        let outcome = self.dht.set_value(key, &encoded, 0, expire, true, layer).await?;
        for (contact, result) in &outcome.results {
            match result {
                Ok(Response::Ok) => {}
                Err(e) if e.is_timeout() => {
                    debug!("Store of {} at {} timed out", key, contact.addr);
                }
                Err(e) => return Err(RecordError::WriteFailed(e.to_string())),
                Ok(Response::Error { message }) => {
                    if let Some(current_revision) = parse_revision_advisory(message) {
                        warn!(
                            key = key,
                            current_revision = current_revision,
                            "Store rejected by {}: {}",
                            contact.addr,
                            message
                        );
                        return Err(RecordError::RevisionConflict { current_revision });
                    }
                    return Err(RecordError::WriteFailed(message.clone()));
                }
                Ok(other) => {
                    return Err(RecordError::WriteFailed(format!(
                        "unexpected response: {:?}",
                        other
                    )))
                }
            }
        }
        self.cache.put(layer, key, record);
        Ok(outcome.nodes)
    }

    /// Read the latest valid replica of a record
    ///
    /// With `use_cache_ttl` a fresh cached copy is returned without a
    /// lookup. Invalid replicas are treated as absent.
    pub async fn get_valid_data(
        &self,
        key: &str,
        rules: &RecordRules,
        layer: LayerId,
        use_cache_ttl: Option<Duration>,
    ) -> Result<Option<Value>, RecordError> {
        if let Some(ttl) = use_cache_ttl {
            if let Some(cached) = self.cache.get(layer, key, ttl) {
                if rules.validate(&cached).is_valid() {
                    debug!("Cache hit for {}", key);
                    return Ok(Some(cached));
                }
            }
        }

        let replicas = match self.dht.get_value(key, layer).await? {
            Lookup::Contacts(_) => {
                debug!("No value found for {} in layer {}", key, layer);
                return Ok(None);
            }
            Lookup::Values(values) => values,
        };

        let candidates: Vec<Value> = replicas
            .iter()
            .filter_map(|raw| serde_json::from_str::<Value>(raw).ok())
            .filter_map(|value| match value {
                Value::Object(mut fields) => {
                    rules.populate_meta(&mut fields, key);
                    Some(Value::Object(fields))
                }
                _ => None,
            })
            .filter(|value| {
                let result = rules.validate(value);
                if !result.is_valid() {
                    debug!("Discarding invalid replica of {}: {:?}", key, result.errors);
                }
                result.is_valid()
            })
            .collect();

        let Some(latest) = select_latest(candidates) else {
            return Ok(None);
        };
        self.cache.put(layer, key, latest.clone());
        Ok(Some(latest))
    }

    /// Store a record while discovering live neighbours, then hint them to
    /// refresh it from their own stores
    pub async fn write_verify_republish(
        &self,
        key: &str,
        record: Value,
        rules: &RecordRules,
        expire: u64,
        layer: LayerId,
    ) -> Result<Vec<Contact>, RecordError> {
        let record = prepare(key, record, rules)?;
        let encoded = encode_record(&record)?;

        let (found, written) = tokio::join!(
            self.dht.find_node(DhtId::random(), layer),
            self.set_valid_data(key, record, rules, expire, layer),
        );
        let nodes = written?;
        let found = found?;

        let results = self
            .dht
            .verify_update(&found, key, &encoded, 0, expire, layer)
            .await;
        let refreshed = results
            .iter()
            .filter(|(_, r)| matches!(r, Ok(Response::Ok)))
            .count();
        debug!(
            "Verified {} on {} of {} discovered nodes",
            key,
            refreshed,
            found.len()
        );
        Ok(nodes)
    }

    /// Remove a record from the DHT and the cache
    pub async fn erase(&self, key: &str, layer: LayerId) -> Result<Vec<Contact>, RecordError> {
        self.cache.remove(layer, key);
        Ok(self.dht.delete_key(key, layer).await?)
    }

    /// Write a typed record under its own key and layer
    pub async fn write<R: Record>(
        &self,
        record: &R,
        expire: Option<u64>,
    ) -> Result<Vec<Contact>, RecordError> {
        record.validate()?;
        self.set_valid_data(
            &record.key(),
            serde_json::to_value(record)?,
            &R::TYPE.rules(),
            expire.unwrap_or_else(|| record.expire()),
            record.layer(),
        )
        .await
    }

    /// Read a typed record, with the type's cache TTL when `use_cache`
    pub async fn read<R: Record>(&self, key: &str, use_cache: bool) -> Result<Option<R>, RecordError> {
        let ttl = use_cache.then(|| R::TYPE.cache_ttl());
        let Some(value) = self
            .get_valid_data(key, &R::TYPE.rules(), R::TYPE.layer(), ttl)
            .await?
        else {
            return Ok(None);
        };
        let record: R = match serde_json::from_value(value) {
            Ok(record) => record,
            Err(e) => {
                debug!("Record {} does not decode as {}: {}", key, R::TYPE, e);
                return Ok(None);
            }
        };
        if let Err(e) = record.validate() {
            debug!("Record {} is invalid: {}", key, e);
            return Ok(None);
        }
        Ok(Some(record))
    }
}

/// Fill in meta fields and run the rules table
fn prepare(key: &str, record: Value, rules: &RecordRules) -> Result<Value, RecordError> {
    let mut fields: Map<String, Value> = match record {
        Value::Object(fields) => fields,
        _ => {
            return Err(ValidationError::new("record", "object", "Record is not a JSON object").into())
        }
    };
    rules.populate_meta(&mut fields, key);
    let record = Value::Object(fields);
    rules.validate(&record).into_result()?;
    Ok(record)
}

/// Highest revision wins; without revisions the latest timestamp wins
pub fn select_latest(records: Vec<Value>) -> Option<Value> {
    records.into_iter().max_by_key(|record| {
        let revision = record
            .get("revision")
            .and_then(|r| r.as_i64().or_else(|| r.as_str().and_then(|s| s.parse().ok())))
            .unwrap_or(-1);
        let timestamp = record.get("timestamp").and_then(Value::as_i64).unwrap_or(0);
        (revision, timestamp)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::{KademliaConfig, MemoryNetwork, LAYER_SUPPLIERS};
    use crate::records::{RecordArbiter, SuppliersRecord};
    use serde_json::json;
    use std::net::SocketAddr;

    async fn test_layers(size: u16) -> Vec<RecordLayer> {
        let network = MemoryNetwork::new();
        let mut layers = Vec::new();
        for i in 0..size {
            let addr = SocketAddr::from(([10, 0, 1, 1], 6000 + i));
            let node = DhtNode::memory(&network, addr, KademliaConfig::default()).unwrap();
            node.set_validator(Arc::new(RecordArbiter::new()));
            node.attach_layer(LAYER_SUPPLIERS).await.unwrap();
            if i > 0 {
                let seed = SocketAddr::from(([10, 0, 1, 1], 6000));
                node.bootstrap(LAYER_SUPPLIERS, &[seed]).await.unwrap();
            }
            layers.push(RecordLayer::new(node, Arc::new(RecordCache::in_memory())));
        }
        layers
    }

    #[test]
    fn test_parse_revision_advisory() {
        assert_eq!(
            parse_revision_advisory(
                "new json data must increment revision number, current revision is 12 "
            ),
            Some(12)
        );
        assert_eq!(parse_revision_advisory("input data is not a json value"), None);
    }

    #[test]
    fn test_select_latest() {
        let picked = select_latest(vec![
            json!({"revision": 2, "timestamp": 5}),
            json!({"revision": 3, "timestamp": 1}),
            json!({"revision": 3, "timestamp": 4}),
        ])
        .unwrap();
        assert_eq!(picked, json!({"revision": 3, "timestamp": 4}));

        let picked = select_latest(vec![json!({"timestamp": 5}), json!({"timestamp": 9})]).unwrap();
        assert_eq!(picked["timestamp"], 9);
        assert!(select_latest(vec![]).is_none());
    }

    #[test]
    fn test_encoding_is_sorted_and_compact() {
        let encoded = encode_record(&json!({"b": 1, "a": [1, 2]})).unwrap();
        assert_eq!(encoded, "{\"a\":[1,2],\"b\":1}");
        let decoded: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(encode_record(&decoded).unwrap(), encoded);
    }

    #[tokio::test]
    async fn test_write_then_read_from_fresh_node() {
        let layers = test_layers(6).await;
        let record = SuppliersRecord::new("c", Some("a"), "ecc/2x2", vec!["a".into(), "".into()], 1);
        layers[1].write(&record, None).await.unwrap();

        let read: SuppliersRecord = layers[4]
            .read(&SuppliersRecord::key_for("c"), false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.suppliers, record.suppliers);
        assert_eq!(read.revision, 1);
        assert_eq!(read.key, SuppliersRecord::key_for("c"));
    }

    #[tokio::test]
    async fn test_stale_revision_is_a_conflict() {
        let layers = test_layers(5).await;
        let newer = SuppliersRecord::new("c", Some("a"), "ecc/2x2", vec!["a".into(), "".into()], 4);
        layers[0].write(&newer, None).await.unwrap();

        let older = SuppliersRecord::new("c", Some("b"), "ecc/2x2", vec!["".into(), "b".into()], 2);
        let error = layers[3].write(&older, None).await.unwrap_err();
        assert_eq!(error.current_revision(), Some(4));
    }

    #[tokio::test]
    async fn test_invalid_record_not_written() {
        let layers = test_layers(2).await;
        let rules = RecordRules::for_type(crate::records::RecordType::Suppliers);
        let error = layers[0]
            .set_valid_data("suppliers:c:0:7", json!({"ecc_map": "ecc/2x2"}), &rules, 3600, LAYER_SUPPLIERS)
            .await
            .unwrap_err();
        assert!(matches!(error, RecordError::Validation(_)));
    }

    #[tokio::test]
    async fn test_cache_served_then_erased() {
        let layers = test_layers(3).await;
        let record = SuppliersRecord::new("d", None, "ecc/2x2", vec!["".into(), "".into()], 0);
        layers[0].write(&record, None).await.unwrap();
        let key = SuppliersRecord::key_for("d");

        let cached: Option<SuppliersRecord> = layers[0].read(&key, true).await.unwrap();
        assert!(cached.is_some());

        layers[0].erase(&key, LAYER_SUPPLIERS).await.unwrap();
        layers[0].erase(&key, LAYER_SUPPLIERS).await.unwrap();
        let gone: Option<SuppliersRecord> = layers[2].read(&key, false).await.unwrap();
        assert!(gone.is_none());
    }

    #[tokio::test]
    async fn test_write_verify_republish() {
        let layers = test_layers(5).await;
        let record = SuppliersRecord::new("e", Some("a"), "ecc/2x2", vec!["a".into(), "".into()], 1);
        let rules = RecordRules::for_type(crate::records::RecordType::Suppliers);
        let nodes = layers[2]
            .write_verify_republish(
                &record.key(),
                serde_json::to_value(&record).unwrap(),
                &rules,
                3600,
                LAYER_SUPPLIERS,
            )
            .await
            .unwrap();
        assert!(!nodes.is_empty());
    }
}
