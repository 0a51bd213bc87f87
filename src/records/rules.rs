//! Record Validation Rules
//!
//! Every record type carries a table of field rules checked on both sides of
//! the wire: by the writer before a store and by the reader after a lookup.
//!
//! - `exist`: the field must be present
//! - `equal`: the field's text form must equal a constant

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use super::types::RecordType;

/// A rule applied to one field of a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "arg", rename_all = "snake_case")]
pub enum ValidationRule {
    /// Field must be present
    Exist,
    /// Field's text form must equal the argument
    Equal(String),
}

impl ValidationRule {
    pub fn equal(value: &str) -> Self {
        ValidationRule::Equal(value.to_string())
    }

    fn name(&self) -> &'static str {
        match self {
            ValidationRule::Exist => "exist",
            ValidationRule::Equal(_) => "equal",
        }
    }
}

/// Detailed error information for a validation failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    /// Name of the field that failed validation
    pub field: String,

    /// The rule that was violated
    pub rule: String,

    /// Human-readable error message
    pub message: String,

    /// Expected value or constraint
    pub expected: Option<String>,

    /// Actual value found
    pub actual: Option<String>,
}

impl ValidationError {
    pub fn new(field: &str, rule: &str, message: &str) -> Self {
        Self {
            field: field.to_string(),
            rule: rule.to_string(),
            message: message.to_string(),
            expected: None,
            actual: None,
        }
    }

    pub fn with_expected(mut self, expected: &str) -> Self {
        self.expected = Some(expected.to_string());
        self
    }

    pub fn with_actual(mut self, actual: &str) -> Self {
        self.actual = Some(actual.to_string());
        self
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Field '{}' failed {}: {}", self.field, self.rule, self.message)?;
        if let Some(ref expected) = self.expected {
            write!(f, " (expected: {})", expected)?;
        }
        if let Some(ref actual) = self.actual {
            write!(f, " (actual: {})", actual)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

/// Result of validating a record
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    /// Per-field status, true when every rule passed
    pub field_results: HashMap<String, bool>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_field_result(&mut self, field: &str, passed: bool) {
        self.field_results.insert(field.to_string(), passed);
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.field_results.insert(error.field.clone(), false);
        self.errors.push(error);
    }

    /// First error, if any
    pub fn into_result(self) -> Result<(), ValidationError> {
        match self.errors.into_iter().next() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Ordered field rules for one record type
#[derive(Debug, Clone, PartialEq)]
pub struct RecordRules {
    record_type: RecordType,
    rules: Vec<(String, Vec<ValidationRule>)>,
}

impl RecordRules {
    /// Rules with only the `type` discriminator
    pub fn new(record_type: RecordType) -> Self {
        Self {
            record_type,
            rules: vec![(
                "type".to_string(),
                vec![ValidationRule::equal(record_type.as_str())],
            )],
        }
    }

    /// Builder pattern: add a rule for a field
    pub fn rule(mut self, field: &str, rule: ValidationRule) -> Self {
        match self.rules.iter_mut().find(|(name, _)| name == field) {
            Some((_, rules)) => rules.push(rule),
            None => self.rules.push((field.to_string(), vec![rule])),
        }
        self
    }

    /// Builder pattern: require every listed field
    pub fn exist(mut self, fields: &[&str]) -> Self {
        for field in fields {
            self = self.rule(field, ValidationRule::Exist);
        }
        self
    }

    /// Rule table of a record type
    pub fn for_type(record_type: RecordType) -> Self {
        let rules = Self::new(record_type);
        match record_type {
            RecordType::Nickname => rules.exist(&["key", "timestamp", "idurl", "nickname", "position"]),
            RecordType::Identity => rules.exist(&["key", "timestamp", "idurl", "identity"]),
            RecordType::Suppliers => rules.exist(&[
                "key",
                "timestamp",
                "customer_idurl",
                "ecc_map",
                "suppliers",
                "revision",
            ]),
            RecordType::MessageBroker => rules.exist(&[
                "key",
                "timestamp",
                "customer_idurl",
                "broker_idurl",
                "position",
            ]),
            RecordType::BismuthIdentityRequest => {
                rules.exist(&["timestamp", "idurl", "public_key", "position"])
            }
        }
    }

    pub fn record_type(&self) -> RecordType {
        self.record_type
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|(name, _)| name.as_str())
    }

    /// Fill in a missing `type` and set `key`
    ///
    /// A present but wrong `type` is kept so the rules table rejects it.
    pub fn populate_meta(&self, record: &mut Map<String, Value>, key: &str) {
        if !record.contains_key("type") {
            record.insert("type".to_string(), Value::from(self.record_type.as_str()));
        }
        if record.get("key").and_then(Value::as_str) != Some(key) {
            record.insert("key".to_string(), Value::from(key));
        }
    }

    /// Check every rule, stopping at the first failure of each field
    pub fn validate(&self, record: &Value) -> ValidationResult {
        let mut result = ValidationResult::default();
        let Some(fields) = record.as_object() else {
            result.add_error(ValidationError::new("record", "object", "Record is not a JSON object"));
            return result;
        };
        for (field, rules) in &self.rules {
            let value = fields.get(field);
            let mut passed = true;
            for rule in rules {
                if let Err(error) = check_rule(field, value, rule) {
                    result.add_error(error);
                    passed = false;
                    break;
                }
            }
            result.add_field_result(field, passed);
        }
        result
    }
}

fn check_rule(field: &str, value: Option<&Value>, rule: &ValidationRule) -> Result<(), ValidationError> {
    match rule {
        ValidationRule::Exist => {
            if value.is_none() {
                return Err(ValidationError::new(field, rule.name(), "Field is missing"));
            }
        }
        ValidationRule::Equal(expected) => {
            let actual = value.map(text_form).unwrap_or_default();
            if actual != *expected {
                return Err(
                    ValidationError::new(field, rule.name(), "Value does not match")
                        .with_expected(expected)
                        .with_actual(&actual),
                );
            }
        }
    }
    Ok(())
}

/// Strings compare without quotes, everything else as compact JSON
fn text_form(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_suppliers_rules() {
        let rules = RecordRules::for_type(RecordType::Suppliers);
        let record = json!({
            "type": "suppliers",
            "key": "suppliers:http://id.net/c.xml:0:7",
            "timestamp": 1700000000,
            "customer_idurl": "http://id.net/c.xml",
            "ecc_map": "ecc/2x2",
            "suppliers": ["", ""],
            "revision": 1,
        });
        assert!(rules.validate(&record).is_valid());

        let mut missing = record.clone();
        missing.as_object_mut().unwrap().remove("revision");
        let result = rules.validate(&missing);
        assert!(!result.is_valid());
        assert_eq!(result.errors[0].field, "revision");
        assert_eq!(result.errors[0].rule, "exist");
    }

    #[test]
    fn test_type_must_match() {
        let rules = RecordRules::for_type(RecordType::Nickname);
        let record = json!({
            "type": "identity",
            "key": "nickname:alice:0:7",
            "timestamp": 1,
            "idurl": "http://id.net/alice.xml",
            "nickname": "alice",
            "position": 0,
        });
        let error = rules.validate(&record).into_result().unwrap_err();
        assert_eq!(error.field, "type");
        assert_eq!(error.expected.as_deref(), Some("nickname"));
        assert_eq!(error.actual.as_deref(), Some("identity"));
    }

    #[test]
    fn test_identity_request_has_no_key_rule() {
        let rules = RecordRules::for_type(RecordType::BismuthIdentityRequest);
        assert!(!rules.fields().any(|f| f == "key"));
        let record = json!({
            "type": "bismuth_identity_request",
            "timestamp": 1,
            "idurl": "http://id.net/r.xml",
            "public_key": "AAAA",
            "position": 1,
        });
        assert!(rules.validate(&record).is_valid());
    }

    #[test]
    fn test_populate_meta() {
        let rules = RecordRules::for_type(RecordType::MessageBroker);
        let mut record = Map::new();
        rules.populate_meta(&mut record, "message_broker:c0:0:7");
        assert_eq!(record["type"], "message_broker");
        assert_eq!(record["key"], "message_broker:c0:0:7");
    }

    #[test]
    fn test_populate_meta_keeps_foreign_type() {
        let rules = RecordRules::for_type(RecordType::Suppliers);
        let mut record = json!({
            "type": "nickname",
            "timestamp": 1,
            "customer_idurl": "http://id.net/c.xml",
            "ecc_map": "ecc/2x2",
            "suppliers": ["", ""],
            "revision": 1,
        })
        .as_object()
        .cloned()
        .unwrap();
        rules.populate_meta(&mut record, "suppliers:http://id.net/c.xml:0:7");
        assert_eq!(record["type"], "nickname");
        let error = rules.validate(&Value::Object(record)).into_result().unwrap_err();
        assert_eq!(error.field, "type");
        assert_eq!(error.actual.as_deref(), Some("nickname"));
    }

    #[test]
    fn test_not_an_object() {
        let rules = RecordRules::for_type(RecordType::Identity);
        assert!(!rules.validate(&json!([1, 2])).is_valid());
    }
}
