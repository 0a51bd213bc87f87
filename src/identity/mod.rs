//! Peer identities
//!
//! IDURLs with rotation history and the identity cache fed by the DHT
//! relations and the supplier finder.

pub mod cache;
pub mod idurl;

pub use cache::{
    DirectoryIdentitySource, Identity, IdentityCache, IdentityError, IdentityFetcher,
    MemoryIdentitySource,
};
pub use idurl::{IdUrl, IdUrlInterner};
