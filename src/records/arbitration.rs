//! Store-time arbitration between an incoming record and the stored one
//!
//! Runs on the receiving node for every `store` and `verify_update`. The
//! incoming record must pass its type's rules and belong to the key it is
//! stored under. A rejection message that involves revisions ends with
//! `current revision is <n> ` so the writer can retry above it.

use serde_json::Value;
use tracing::debug;

use super::types::{
    IdentityRecord, IdentityRequestRecord, MessageBrokerRecord, NicknameRecord, Record, RecordType,
    SuppliersRecord,
};
use crate::dht::{DhtId, LayerId, StoreValidator};

/// Revision and equivalence rules for JSON records
#[derive(Debug, Default, Clone, Copy)]
pub struct RecordArbiter;

impl RecordArbiter {
    pub fn new() -> Self {
        Self
    }

    /// Check `incoming` against `existing`, returning the rejection message
    pub fn arbitrate(&self, incoming: &str, existing: Option<&str>) -> Result<(), String> {
        let new = parse_incoming(incoming)?;
        self.arbitrate_value(&new, existing)
    }

    /// Rules table, type invariants and key binding of an incoming record
    pub fn check_record(&self, key: &DhtId, record: &Value) -> Result<(), String> {
        let name = record.get("type").and_then(Value::as_str).unwrap_or_default();
        let record_type =
            RecordType::parse(name).ok_or_else(|| format!("unknown record type: {}", record))?;
        record_type
            .rules()
            .validate(record)
            .into_result()
            .map_err(|e| format!("input data is not valid: {}", e))?;
        let printable = match record_type {
            RecordType::Nickname => typed_key::<NicknameRecord>(record)?,
            RecordType::Identity => typed_key::<IdentityRecord>(record)?,
            RecordType::Suppliers => typed_key::<SuppliersRecord>(record)?,
            RecordType::MessageBroker => typed_key::<MessageBrokerRecord>(record)?,
            RecordType::BismuthIdentityRequest => typed_key::<IdentityRequestRecord>(record)?,
        };
        if DhtId::from_key(&printable) != *key {
            return Err(format!("record {} is not stored under its own key", printable));
        }
        Ok(())
    }

    fn arbitrate_value(&self, new: &Value, existing: Option<&str>) -> Result<(), String> {
        let new_type = match new.get("type").and_then(Value::as_str) {
            Some(t) if !t.is_empty() => t,
            _ => return Err(format!("input data do not have \"type\" field present: {}", new)),
        };

        let Some(existing) = existing else {
            return Ok(());
        };
        let Ok(prev) = serde_json::from_str::<Value>(existing) else {
            debug!("Stored value is not JSON, overwriting");
            return Ok(());
        };
        let prev_type = prev.get("type").and_then(Value::as_str);
        if let Some(prev_type) = prev_type {
            if prev_type != new_type {
                return Err(format!(
                    "new json data type do not match to existing record type: {}",
                    prev
                ));
            }
        }

        let Some(prev_revision) = revision_of(&prev) else {
            return Ok(());
        };
        let new_revision = revision_of(new)
            .ok_or_else(|| "new json data must have a revision".to_string())?;
        if new_revision < prev_revision {
            return Err(format!(
                "new json data must increment revision number, current revision is {} ",
                prev_revision
            ));
        }
        if new_revision > prev_revision {
            return Ok(());
        }

        match prev_type {
            Some("suppliers") => {
                let prev_ecc = prev.get("ecc_map").filter(|v| !is_blank(v));
                if let Some(prev_ecc) = prev_ecc {
                    if new.get("ecc_map") != Some(prev_ecc) {
                        return Err(format!(
                            "new json data have same revision but different ecc_map, current revision is {} ",
                            prev_revision
                        ));
                    }
                }
                if suppliers_of(&prev) != suppliers_of(new) {
                    return Err(format!(
                        "new json data have same revision but different suppliers list, current revision is {} ",
                        prev_revision
                    ));
                }
            }
            Some("message_broker") => {
                let prev_broker = prev.get("broker_idurl").filter(|v| !v.is_null());
                let prev_position = prev.get("position").filter(|v| !v.is_null());
                if let (Some(prev_broker), Some(prev_position)) = (prev_broker, prev_position) {
                    if new.get("broker_idurl") != Some(prev_broker)
                        || new.get("position") != Some(prev_position)
                    {
                        return Err(format!(
                            "new json data have same revision but different broker info, current revision is {} ",
                            prev_revision
                        ));
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}

impl StoreValidator for RecordArbiter {
    fn validate_store(
        &self,
        _layer: LayerId,
        key: &DhtId,
        incoming: &str,
        existing: Option<&str>,
    ) -> Result<(), String> {
        let new = parse_incoming(incoming)?;
        self.check_record(key, &new)?;
        self.arbitrate_value(&new, existing)
    }
}

fn parse_incoming(incoming: &str) -> Result<Value, String> {
    serde_json::from_str(incoming).map_err(|_| format!("input data is not a json value: {}", incoming))
}

/// Printable key derived from the record's own fields
fn typed_key<R: Record>(record: &Value) -> Result<String, String> {
    let typed: R = serde_json::from_value(record.clone())
        .map_err(|e| format!("input data is not a valid {} record: {}", R::TYPE, e))?;
    typed
        .validate()
        .map_err(|e| format!("input data is not valid: {}", e))?;
    Ok(typed.key())
}

/// Revision as a non-negative integer, accepting numeric strings
fn revision_of(record: &Value) -> Option<u64> {
    match record.get("revision")? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn suppliers_of(record: &Value) -> Vec<String> {
    record
        .get("suppliers")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .map(|v| v.as_str().unwrap_or_default().to_string())
                .collect()
        })
        .unwrap_or_default()
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn suppliers(revision: u64, list: &[&str]) -> String {
        json!({
            "type": "suppliers",
            "revision": revision,
            "ecc_map": "ecc/2x2",
            "suppliers": list,
        })
        .to_string()
    }

    #[test]
    fn test_first_store_accepted() {
        let arbiter = RecordArbiter::new();
        assert!(arbiter.arbitrate(&suppliers(0, &["a", ""]), None).is_ok());
    }

    #[test]
    fn test_rejects_non_json_and_untyped() {
        let arbiter = RecordArbiter::new();
        assert!(arbiter.arbitrate("not json", None).is_err());
        let error = arbiter.arbitrate("{\"a\":1}", None).unwrap_err();
        assert!(error.contains("\"type\" field"));
    }

    #[test]
    fn test_type_mismatch() {
        let arbiter = RecordArbiter::new();
        let nickname = json!({"type": "nickname"}).to_string();
        let error = arbiter
            .arbitrate(&suppliers(1, &["a", ""]), Some(&nickname))
            .unwrap_err();
        assert!(error.contains("type do not match"));
    }

    #[test]
    fn test_revision_must_not_decrease() {
        let arbiter = RecordArbiter::new();
        let stored = suppliers(5, &["a", "b"]);
        let error = arbiter
            .arbitrate(&suppliers(4, &["a", "b"]), Some(&stored))
            .unwrap_err();
        assert_eq!(
            error,
            "new json data must increment revision number, current revision is 5 "
        );
        assert!(arbiter.arbitrate(&suppliers(6, &["b", "a"]), Some(&stored)).is_ok());
    }

    #[test]
    fn test_missing_revision_rejected() {
        let arbiter = RecordArbiter::new();
        let stored = suppliers(2, &["a", ""]);
        let incoming = json!({"type": "suppliers", "ecc_map": "ecc/2x2"}).to_string();
        assert_eq!(
            arbiter.arbitrate(&incoming, Some(&stored)).unwrap_err(),
            "new json data must have a revision"
        );
    }

    #[test]
    fn test_equal_revision_requires_same_family() {
        let arbiter = RecordArbiter::new();
        let stored = suppliers(3, &["a", "b"]);
        assert!(arbiter.arbitrate(&suppliers(3, &["a", "b"]), Some(&stored)).is_ok());
        let error = arbiter
            .arbitrate(&suppliers(3, &["a", "c"]), Some(&stored))
            .unwrap_err();
        assert!(error.contains("different suppliers list, current revision is 3"));

        let other_ecc = json!({
            "type": "suppliers",
            "revision": 3,
            "ecc_map": "ecc/4x4",
            "suppliers": ["a", "b"],
        })
        .to_string();
        assert!(arbiter
            .arbitrate(&other_ecc, Some(&stored))
            .unwrap_err()
            .contains("different ecc_map"));
    }

    #[test]
    fn test_equal_revision_broker_info() {
        let arbiter = RecordArbiter::new();
        let broker = |b: &str, pos: u32| {
            json!({"type": "message_broker", "revision": 1, "broker_idurl": b, "position": pos})
                .to_string()
        };
        let stored = broker("x", 0);
        assert!(arbiter.arbitrate(&broker("x", 0), Some(&stored)).is_ok());
        assert!(arbiter
            .arbitrate(&broker("y", 0), Some(&stored))
            .unwrap_err()
            .contains("different broker info, current revision is 1"));
    }

    #[test]
    fn test_unrevisioned_records_overwrite() {
        let arbiter = RecordArbiter::new();
        let a = json!({"type": "nickname", "idurl": "a"}).to_string();
        let b = json!({"type": "nickname", "idurl": "b"}).to_string();
        assert!(arbiter.arbitrate(&b, Some(&a)).is_ok());
    }

    fn stored_under(printable: &str, record: &Value) -> Result<(), String> {
        RecordArbiter::new().validate_store(
            crate::dht::LAYER_SUPPLIERS,
            &DhtId::from_key(printable),
            &record.to_string(),
            None,
        )
    }

    fn family(list: &[&str]) -> Value {
        let customer = "http://id.net/c.xml";
        json!({
            "type": "suppliers",
            "key": SuppliersRecord::key_for(customer),
            "timestamp": 1,
            "revision": 1,
            "customer_idurl": customer,
            "ecc_map": "ecc/2x2",
            "suppliers": list,
        })
    }

    #[test]
    fn test_store_accepts_well_formed_record() {
        let key = SuppliersRecord::key_for("http://id.net/c.xml");
        assert!(stored_under(&key, &family(&["http://id.net/a.xml", ""])).is_ok());
        assert!(stored_under("suppliers:http://id.net/other.xml:0:7", &family(&["", ""]))
            .unwrap_err()
            .contains("not stored under its own key"));
    }

    #[test]
    fn test_store_rejects_family_not_fitting_ecc() {
        let key = SuppliersRecord::key_for("http://id.net/c.xml");
        let error = stored_under(&key, &family(&["a", "b", "c"])).unwrap_err();
        assert!(error.contains("suppliers"), "{}", error);
    }

    #[test]
    fn test_store_rejects_record_missing_fields() {
        let key = SuppliersRecord::key_for("http://id.net/c.xml");
        let error = stored_under(&key, &json!({"type": "suppliers"})).unwrap_err();
        assert!(error.contains("input data is not valid"), "{}", error);
        assert!(stored_under(&key, &json!({"type": "bogus"})).is_err());
    }

    #[test]
    fn test_store_rejects_broker_at_foreign_position() {
        let customer = "http://id.net/c.xml";
        let broker = |position: u32, key: String| {
            json!({
                "type": "message_broker",
                "key": key,
                "timestamp": 1,
                "customer_idurl": customer,
                "broker_idurl": "http://id.net/b.xml",
                "position": position,
            })
        };
        let slot_one = MessageBrokerRecord::key_for(customer, 1);
        assert!(stored_under(&slot_one, &broker(1, slot_one.clone())).is_ok());
        assert!(stored_under(&slot_one, &broker(5, slot_one.clone())).is_err());

        let slot_five = MessageBrokerRecord::key_for(customer, 5);
        assert!(stored_under(&slot_one, &broker(5, slot_five)).is_err());
    }
}
