//! ECC map catalogue
//!
//! An ECC map names an erasure-coding layout such as `ecc/4x4`. The name
//! fixes how many suppliers hold pieces of a customer's data and how many
//! of them may be lost before the data becomes unrecoverable.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EccError {
    #[error("Unknown ecc map: {0}")]
    UnknownMap(String),
    #[error("No ecc map for {0} suppliers")]
    NoMapForCount(usize),
}

/// Known layouts: (name, suppliers, correctable errors, fire-hire errors)
const CATALOGUE: &[(&str, usize, usize, usize)] = &[
    ("ecc/2x2", 2, 1, 1),
    ("ecc/4x4", 4, 2, 1),
    ("ecc/7x7", 7, 3, 2),
    ("ecc/13x13", 13, 4, 2),
    ("ecc/18x18", 18, 5, 2),
    ("ecc/26x26", 26, 6, 3),
    ("ecc/64x64", 64, 10, 5),
];

/// A validated ECC map name
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EccMap(usize);

impl EccMap {
    /// Look up a map by its name
    pub fn parse(name: &str) -> Result<Self, EccError> {
        CATALOGUE
            .iter()
            .position(|(n, ..)| *n == name)
            .map(EccMap)
            .ok_or_else(|| EccError::UnknownMap(name.to_string()))
    }

    /// Map whose supplier count equals `suppliers`
    pub fn for_suppliers(suppliers: usize) -> Result<Self, EccError> {
        CATALOGUE
            .iter()
            .position(|(_, n, ..)| *n == suppliers)
            .map(EccMap)
            .ok_or(EccError::NoMapForCount(suppliers))
    }

    pub fn name(&self) -> &'static str {
        CATALOGUE[self.0].0
    }

    /// Number of suppliers (total shards) in this layout
    pub fn suppliers(&self) -> usize {
        CATALOGUE[self.0].1
    }

    /// Suppliers that may be lost while data stays recoverable
    pub fn correctable_errors(&self) -> usize {
        CATALOGUE[self.0].2
    }

    /// Offline suppliers at which the employer starts replacing
    pub fn fire_hire_errors(&self) -> usize {
        CATALOGUE[self.0].3
    }
}

impl fmt::Display for EccMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Debug for EccMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EccMap({})", self.name())
    }
}

impl Serialize for EccMap {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for EccMap {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        EccMap::parse(&name).map_err(serde::de::Error::custom)
    }
}

/// Supplier count implied by a map name, `None` if the name is unknown
pub fn ecc_suppliers(name: &str) -> Option<usize> {
    EccMap::parse(name).ok().map(|m| m.suppliers())
}

/// Whether `name` is a known ECC map
pub fn is_valid_ecc(name: &str) -> bool {
    EccMap::parse(name).is_ok()
}

/// Pad with empty slots or truncate at the tail so the list has `size` entries
pub fn fit_to_size<T: Clone + Default>(list: &mut Vec<T>, size: usize) {
    list.resize(size, T::default());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supplier_counts() {
        assert_eq!(ecc_suppliers("ecc/2x2"), Some(2));
        assert_eq!(ecc_suppliers("ecc/4x4"), Some(4));
        assert_eq!(ecc_suppliers("ecc/64x64"), Some(64));
        assert_eq!(ecc_suppliers("ecc/5x5"), None);
    }

    #[test]
    fn test_error_bounds() {
        let map = EccMap::parse("ecc/7x7").unwrap();
        assert_eq!(map.correctable_errors(), 3);
        assert_eq!(map.fire_hire_errors(), 2);
        assert_eq!(EccMap::for_suppliers(26).unwrap().name(), "ecc/26x26");
        assert!(matches!(EccMap::for_suppliers(3), Err(EccError::NoMapForCount(3))));
    }

    #[test]
    fn test_fit_to_size() {
        let mut list = vec!["a".to_string()];
        fit_to_size(&mut list, 4);
        assert_eq!(list, vec!["a", "", "", ""]);

        fit_to_size(&mut list, 2);
        assert_eq!(list, vec!["a", ""]);
    }

    #[test]
    fn test_serde_as_name() {
        let map = EccMap::parse("ecc/4x4").unwrap();
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, "\"ecc/4x4\"");
        let back: EccMap = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
        assert!(serde_json::from_str::<EccMap>("\"ecc/3x3\"").is_err());
    }
}
