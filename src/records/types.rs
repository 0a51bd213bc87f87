//! Record Types
//!
//! Each record class stored in the DHT is a distinct struct implementing
//! [`Record`]. The shared envelope fields (`type`, `key`, `timestamp`) are
//! part of every struct; `type` is filled in from the rules table on write.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::rules::{RecordRules, ValidationError};
use crate::dht::{make_key, LayerId, LAYER_DEFAULT, LAYER_MESSAGE_BROKERS, LAYER_SUPPLIERS};
use crate::ecc::ecc_suppliers;
use crate::unix_now;

const HOUR: u64 = 60 * 60;

/// Discriminator of every DHT record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    Nickname,
    Identity,
    Suppliers,
    MessageBroker,
    BismuthIdentityRequest,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::Nickname => "nickname",
            RecordType::Identity => "identity",
            RecordType::Suppliers => "suppliers",
            RecordType::MessageBroker => "message_broker",
            RecordType::BismuthIdentityRequest => "bismuth_identity_request",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "nickname" => Some(RecordType::Nickname),
            "identity" => Some(RecordType::Identity),
            "suppliers" => Some(RecordType::Suppliers),
            "message_broker" => Some(RecordType::MessageBroker),
            "bismuth_identity_request" => Some(RecordType::BismuthIdentityRequest),
            _ => None,
        }
    }

    /// Layer the record class lives in
    pub fn layer(&self) -> LayerId {
        match self {
            RecordType::Suppliers => LAYER_SUPPLIERS,
            RecordType::MessageBroker => LAYER_MESSAGE_BROKERS,
            _ => LAYER_DEFAULT,
        }
    }

    /// How long a cached copy is served without a lookup
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(match self {
            RecordType::Nickname => 24 * HOUR,
            RecordType::Identity => HOUR,
            RecordType::Suppliers => 12 * HOUR,
            RecordType::MessageBroker => 12 * HOUR,
            RecordType::BismuthIdentityRequest => HOUR,
        })
    }

    /// Default lifetime in the DHT, in seconds
    pub fn default_expire(&self) -> u64 {
        match self {
            RecordType::Nickname => 24 * HOUR,
            RecordType::Suppliers | RecordType::MessageBroker => HOUR,
            RecordType::Identity | RecordType::BismuthIdentityRequest => 12 * HOUR,
        }
    }

    pub fn rules(&self) -> RecordRules {
        RecordRules::for_type(*self)
    }
}

impl std::fmt::Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed DHT record
pub trait Record: Serialize + DeserializeOwned + Send + Sync {
    const TYPE: RecordType;

    /// Printable DHT key the record is stored under
    fn key(&self) -> String;

    fn revision(&self) -> Option<u64> {
        None
    }

    /// Type-specific invariants beyond the rules table
    fn validate(&self) -> Result<(), ValidationError> {
        Ok(())
    }

    fn layer(&self) -> LayerId {
        Self::TYPE.layer()
    }

    fn expire(&self) -> u64 {
        Self::TYPE.default_expire()
    }
}

/// `nickname:<nick>:<index>:7`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NicknameRecord {
    #[serde(default)]
    pub key: String,
    pub timestamp: u64,
    pub nickname: String,
    pub idurl: String,
    pub position: u32,
}

impl NicknameRecord {
    pub fn key_for(nickname: &str, position: u32) -> String {
        make_key("nickname", nickname, position)
    }

    pub fn new(nickname: &str, position: u32, idurl: &str) -> Self {
        Self {
            key: Self::key_for(nickname, position),
            timestamp: unix_now(),
            nickname: nickname.to_string(),
            idurl: idurl.to_string(),
            position,
        }
    }
}

impl Record for NicknameRecord {
    const TYPE: RecordType = RecordType::Nickname;

    fn key(&self) -> String {
        Self::key_for(&self.nickname, self.position)
    }
}

/// Identity document published under its own IDURL
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityRecord {
    #[serde(default)]
    pub key: String,
    pub timestamp: u64,
    pub idurl: String,
    pub identity: String,
}

impl IdentityRecord {
    pub fn new(idurl: &str, identity: &str) -> Self {
        Self {
            key: idurl.to_string(),
            timestamp: unix_now(),
            idurl: idurl.to_string(),
            identity: identity.to_string(),
        }
    }
}

impl Record for IdentityRecord {
    const TYPE: RecordType = RecordType::Identity;

    fn key(&self) -> String {
        self.idurl.clone()
    }
}

/// Ordered supplier list of one customer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuppliersRecord {
    #[serde(default)]
    pub key: String,
    pub timestamp: u64,
    pub revision: u64,
    pub customer_idurl: String,
    #[serde(default)]
    pub publisher_idurl: Option<String>,
    pub ecc_map: String,
    /// Positional, empty strings for free slots
    pub suppliers: Vec<String>,
}

impl SuppliersRecord {
    pub fn key_for(customer_idurl: &str) -> String {
        make_key("suppliers", customer_idurl, 0)
    }

    pub fn new(
        customer_idurl: &str,
        publisher_idurl: Option<&str>,
        ecc_map: &str,
        suppliers: Vec<String>,
        revision: u64,
    ) -> Self {
        Self {
            key: Self::key_for(customer_idurl),
            timestamp: unix_now(),
            revision,
            customer_idurl: customer_idurl.to_string(),
            publisher_idurl: publisher_idurl.map(str::to_string),
            ecc_map: ecc_map.to_string(),
            suppliers,
        }
    }
}

impl Record for SuppliersRecord {
    const TYPE: RecordType = RecordType::Suppliers;

    fn key(&self) -> String {
        Self::key_for(&self.customer_idurl)
    }

    fn revision(&self) -> Option<u64> {
        Some(self.revision)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        let expected = ecc_suppliers(&self.ecc_map).ok_or_else(|| {
            ValidationError::new("ecc_map", "ecc", "Unknown ECC map").with_actual(&self.ecc_map)
        })?;
        if self.suppliers.len() != expected {
            return Err(
                ValidationError::new("suppliers", "ecc", "Suppliers list does not fit the ECC map")
                    .with_expected(&expected.to_string())
                    .with_actual(&self.suppliers.len().to_string()),
            );
        }
        Ok(())
    }
}

/// Message broker of a customer at one position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBrokerRecord {
    #[serde(default)]
    pub key: String,
    pub timestamp: u64,
    #[serde(default)]
    pub revision: u64,
    pub customer_idurl: String,
    pub broker_idurl: String,
    pub position: u32,
}

impl MessageBrokerRecord {
    pub fn key_for(customer_idurl: &str, position: u32) -> String {
        make_key("message_broker", &format!("{}{}", customer_idurl, position), 0)
    }

    pub fn new(customer_idurl: &str, broker_idurl: &str, position: u32, revision: u64) -> Self {
        Self {
            key: Self::key_for(customer_idurl, position),
            timestamp: unix_now(),
            revision,
            customer_idurl: customer_idurl.to_string(),
            broker_idurl: broker_idurl.to_string(),
            position,
        }
    }
}

impl Record for MessageBrokerRecord {
    const TYPE: RecordType = RecordType::MessageBroker;

    fn key(&self) -> String {
        Self::key_for(&self.customer_idurl, self.position)
    }

    fn revision(&self) -> Option<u64> {
        Some(self.revision)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if !self.key.is_empty() && self.key != self.key() {
            return Err(
                ValidationError::new("position", "key", "Position does not match the key")
                    .with_expected(&self.key)
                    .with_actual(&self.key()),
            );
        }
        Ok(())
    }
}

/// Registration request queued for the blockchain authority
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityRequestRecord {
    #[serde(default)]
    pub key: String,
    pub timestamp: u64,
    pub idurl: String,
    pub public_key: String,
    #[serde(default)]
    pub wallet_address: String,
    pub position: u32,
}

/// Queue slots rotate every hour
pub fn hour_bucket(now: u64) -> u64 {
    now / HOUR
}

impl IdentityRequestRecord {
    pub fn key_for(bucket: u64, position: u32) -> String {
        make_key("blockchain_identity", &bucket.to_string(), position)
    }

    pub fn new(position: u32, idurl: &str, public_key: &str, wallet_address: &str) -> Self {
        let timestamp = unix_now();
        Self {
            key: Self::key_for(hour_bucket(timestamp), position),
            timestamp,
            idurl: idurl.to_string(),
            public_key: public_key.to_string(),
            wallet_address: wallet_address.to_string(),
            position,
        }
    }
}

impl Record for IdentityRequestRecord {
    const TYPE: RecordType = RecordType::BismuthIdentityRequest;

    fn key(&self) -> String {
        if self.key.is_empty() {
            Self::key_for(hour_bucket(self.timestamp), self.position)
        } else {
            self.key.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_keys() {
        assert_eq!(
            SuppliersRecord::key_for("http://id.net/c.xml"),
            "suppliers:http://id.net/c.xml:0:7"
        );
        assert_eq!(
            MessageBrokerRecord::key_for("http://id.net/c.xml", 2),
            "message_broker:http://id.net/c.xml2:0:7"
        );
        assert_eq!(
            IdentityRequestRecord::key_for(472000, 3),
            "blockchain_identity:472000:3:7"
        );
        assert_eq!(NicknameRecord::key_for("alice", 1), "nickname:alice:1:7");
    }

    #[test]
    fn test_suppliers_size_must_fit_ecc() {
        let ok = SuppliersRecord::new("c", None, "ecc/2x2", vec!["a".into(), "".into()], 1);
        assert!(ok.validate().is_ok());

        let short = SuppliersRecord::new("c", None, "ecc/4x4", vec!["a".into()], 1);
        let error = short.validate().unwrap_err();
        assert_eq!(error.field, "suppliers");
        assert_eq!(error.expected.as_deref(), Some("4"));

        let unknown = SuppliersRecord::new("c", None, "ecc/3x3", vec![], 1);
        assert_eq!(unknown.validate().unwrap_err().field, "ecc_map");
    }

    #[test]
    fn test_broker_position_matches_key() {
        let mut record = MessageBrokerRecord::new("c", "b", 1, 0);
        assert!(record.validate().is_ok());
        record.position = 2;
        assert!(record.validate().is_err());
    }

    #[test]
    fn test_layers_and_ttls() {
        assert_eq!(RecordType::Suppliers.layer(), LAYER_SUPPLIERS);
        assert_eq!(RecordType::MessageBroker.layer(), LAYER_MESSAGE_BROKERS);
        assert_eq!(RecordType::Nickname.layer(), LAYER_DEFAULT);
        assert_eq!(RecordType::Suppliers.default_expire(), 3600);
        assert_eq!(RecordType::Identity.cache_ttl(), Duration::from_secs(3600));
        assert_eq!(RecordType::parse("message_broker"), Some(RecordType::MessageBroker));
    }
}
