//! DHT Kernel
//!
//! A layered Kademlia node: every layer is an independent overlay with its
//! own routing table and store, while all layers share one transport.
//!
//! - `key`: printable keys, 160-bit ids, layer numbers
//! - `routing`: k-bucket routing table
//! - `store`: sled-backed per-layer stores
//! - `protocol`: RPC messages and datagram fragmentation
//! - `transport`: UDP and in-memory transports
//! - `node`: iterative lookups, store with result collection, RPC handling

pub mod key;
pub mod node;
pub mod protocol;
pub mod routing;
pub mod store;
pub mod transport;

pub use key::{
    make_key, split_key, DhtId, KeyParts, LayerId, LAYER_BROADCASTERS, LAYER_CUSTOMERS,
    LAYER_DEFAULT, LAYER_ID_SERVERS, LAYER_MERCHANTS, LAYER_MESSAGE_BROKERS,
    LAYER_PROXY_ROUTERS, LAYER_REBUILDERS, LAYER_SUPPLIERS, PROTOCOL_VERSION,
};
pub use node::{DhtNode, KademliaConfig, Lookup, StoreOutcome, StoreValidator};
pub use protocol::{Request, Response};
pub use routing::Contact;
pub use store::LayerStores;
pub use transport::{DhtRpc, MemoryNetwork, RpcHandler, UdpTransport};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DhtError {
    #[error("RPC timed out")]
    Timeout,
    #[error("Layer {0} is not attached")]
    LayerNotAttached(LayerId),
    #[error("No contacts known in layer {0}")]
    NoContacts(LayerId),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
    #[error("Remote error: {0}")]
    Remote(String),
    #[error("Store error: {0}")]
    Store(#[from] sled::Error),
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Cancelled")]
    Cancelled,
}

impl DhtError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, DhtError::Timeout)
    }
}
