//! P2P Backup Core - customer-family coordination for a peer-to-peer backup network
//!
//! Every customer spreads its data over a family of suppliers. This crate
//! keeps that family consistent:
//! - A layered Kademlia DHT stores small, validated records
//! - The suppliers of a customer agree on the family layout by peer review
//!   before a new revision is published
//! - The customer hires and dismisses suppliers through a finder that walks
//!   the suppliers layer
//! - Identities are confirmed on a blockchain through a queue of requests
//!   kept in the DHT

pub mod blockchain;
pub mod config;
pub mod context;
pub mod dht;
pub mod ecc;
pub mod employer;
pub mod family;
pub mod identity;
pub mod network;
pub mod records;
pub mod relations;
pub mod storage;

pub use config::{Config, ConfigError};
pub use context::{ContextError, CoreContext};
pub use dht::{DhtError, DhtId, DhtNode, KademliaConfig, LayerId};
pub use ecc::EccMap;
pub use identity::{IdUrl, Identity, IdentityCache};
pub use records::{RecordError, RecordLayer};
pub use relations::{Relations, RelationsError};
pub use storage::ContactsStore;

// Family coordination
pub use family::{CustomerFamilies, FamilyInfo, FamilyRequest, FamilyState};

// Customer side
pub use employer::{Decision, Employer, SupplierFinder, SupplierState};

// Blockchain identity confirmation
pub use blockchain::{Authority, AuthorityState, BlockchainClient, Registrant, RegistrantState};

/// Seconds since the Unix epoch
pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
