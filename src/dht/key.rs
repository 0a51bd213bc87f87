//! DHT keys and node identifiers
//!
//! Printable keys have the form `<prefix>:<key>:<index>:<version>`. On the
//! wire every key, like every node id, is a 160-bit BLAKE3 digest.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Version suffix of every printable key
pub const PROTOCOL_VERSION: u32 = 7;

/// DHT layer identifier
pub type LayerId = u32;

pub const LAYER_DEFAULT: LayerId = 0;
pub const LAYER_ID_SERVERS: LayerId = 1;
pub const LAYER_PROXY_ROUTERS: LayerId = 2;
pub const LAYER_SUPPLIERS: LayerId = 3;
pub const LAYER_REBUILDERS: LayerId = 4;
pub const LAYER_BROADCASTERS: LayerId = 5;
pub const LAYER_MERCHANTS: LayerId = 6;
pub const LAYER_MESSAGE_BROKERS: LayerId = 7;
pub const LAYER_CUSTOMERS: LayerId = 8;

/// Identifier length in bytes
pub const ID_LEN: usize = 20;
/// Identifier length in bits, one k-bucket per bit
pub const ID_BITS: usize = ID_LEN * 8;

/// A 160-bit key or node identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DhtId(pub [u8; ID_LEN]);

impl DhtId {
    /// Hash a printable key into its wire form
    pub fn from_key(key: &str) -> Self {
        Self::from_data(key.as_bytes())
    }

    pub fn from_data(data: &[u8]) -> Self {
        let hash = blake3::hash(data);
        let mut id = [0u8; ID_LEN];
        id.copy_from_slice(&hash.as_bytes()[..ID_LEN]);
        Self(id)
    }

    pub fn random() -> Self {
        let mut id = [0u8; ID_LEN];
        rand::thread_rng().fill_bytes(&mut id);
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; ID_LEN] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }

    /// XOR distance to another id
    pub fn distance(&self, other: &DhtId) -> [u8; ID_LEN] {
        let mut out = [0u8; ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Index of the k-bucket `other` falls into, `None` for our own id
    pub fn bucket_index(&self, other: &DhtId) -> Option<usize> {
        let distance = self.distance(other);
        for (i, byte) in distance.iter().enumerate() {
            if *byte != 0 {
                let leading = byte.leading_zeros() as usize;
                return Some(ID_BITS - 1 - (i * 8 + leading));
            }
        }
        None
    }

    /// Random id that falls into bucket `index` relative to `self`
    pub fn random_in_bucket(&self, index: usize) -> DhtId {
        let mut distance = DhtId::random().0;
        let bit = ID_BITS - 1 - index.min(ID_BITS - 1);
        let (byte, offset) = (bit / 8, bit % 8);
        for b in distance.iter_mut().take(byte) {
            *b = 0;
        }
        let top = 0x80u8 >> offset;
        distance[byte] = (distance[byte] & (top.wrapping_sub(1))) | top;
        let mut out = [0u8; ID_LEN];
        for (i, o) in out.iter_mut().enumerate() {
            *o = self.0[i] ^ distance[i];
        }
        DhtId(out)
    }
}

impl fmt::Display for DhtId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for DhtId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DhtId({}...)", &self.to_hex()[..8])
    }
}

impl Serialize for DhtId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for DhtId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        DhtId::from_hex(&text).map_err(serde::de::Error::custom)
    }
}

/// Build a printable key
pub fn make_key(prefix: &str, key: &str, index: u32) -> String {
    format!("{}:{}:{}:{}", prefix, key, index, PROTOCOL_VERSION)
}

/// Components of a printable key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyParts {
    pub prefix: String,
    pub key: String,
    pub index: String,
    pub version: String,
}

/// Split a printable key, the middle part may itself contain ':'
pub fn split_key(full: &str) -> Option<KeyParts> {
    let (prefix, rest) = full.split_once(':')?;
    let (rest, version) = rest.rsplit_once(':')?;
    let (key, index) = rest.rsplit_once(':')?;
    Some(KeyParts {
        prefix: prefix.to_string(),
        key: key.to_string(),
        index: index.to_string(),
        version: version.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_and_split_key() {
        let key = make_key("suppliers", "http://id.net/carol.xml", 0);
        assert_eq!(key, "suppliers:http://id.net/carol.xml:0:7");

        let parts = split_key(&key).unwrap();
        assert_eq!(parts.prefix, "suppliers");
        assert_eq!(parts.key, "http://id.net/carol.xml");
        assert_eq!(parts.index, "0");
        assert_eq!(parts.version, "7");
        assert!(split_key("nocolons").is_none());
    }

    #[test]
    fn test_same_key_same_id() {
        assert_eq!(DhtId::from_key("a:b:0:7"), DhtId::from_key("a:b:0:7"));
        assert_ne!(DhtId::from_key("a:b:0:7"), DhtId::from_key("a:b:1:7"));
    }

    #[test]
    fn test_bucket_index() {
        let me = DhtId([0u8; ID_LEN]);
        let mut far = [0u8; ID_LEN];
        far[0] = 0x80;
        assert_eq!(me.bucket_index(&DhtId(far)), Some(ID_BITS - 1));

        let mut near = [0u8; ID_LEN];
        near[ID_LEN - 1] = 1;
        assert_eq!(me.bucket_index(&DhtId(near)), Some(0));
        assert_eq!(me.bucket_index(&me), None);
    }

    #[test]
    fn test_random_in_bucket() {
        let me = DhtId::random();
        for index in [0, 7, 8, 100, ID_BITS - 1] {
            let id = me.random_in_bucket(index);
            assert_eq!(me.bucket_index(&id), Some(index));
        }
    }
}
