//! Record Layer
//!
//! Typed, validated and revisioned JSON records stored in the DHT:
//!
//! - `rules`: per-type field rules checked by writers and readers
//! - `types`: the record classes and the [`Record`] trait
//! - `arbitration`: store-time revision rules run by the receiving node
//! - `cache`: persisted TTL cache of records read or written
//! - `layer`: [`RecordLayer`], the read/write surface used by upper layers

pub mod arbitration;
pub mod cache;
pub mod layer;
pub mod rules;
pub mod types;

pub use arbitration::RecordArbiter;
pub use cache::RecordCache;
pub use layer::{encode_record, parse_revision_advisory, select_latest, RecordError, RecordLayer};
pub use rules::{RecordRules, ValidationError, ValidationResult, ValidationRule};
pub use types::{
    hour_bucket, IdentityRecord, IdentityRequestRecord, MessageBrokerRecord, NicknameRecord, Record,
    RecordType, SuppliersRecord,
};
