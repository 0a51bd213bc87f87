//! Peer-to-peer signaling
//!
//! Carries `Contacts` packets between principals and their `Ack` / `Fail`
//! answers. Two transports implement the same seams:
//! - libp2p request-response over TCP/QUIC with Noise and Yamux
//! - an in-memory router used by multi-node tests

pub mod behaviour;
pub mod memory;
pub mod node;
pub mod protocol;

pub use behaviour::SignalBehaviour;
pub use memory::{MemoryEndpoint, MemorySignals};
pub use node::{SignalingConfig, SignalingHandle, SignalingNode};
pub use protocol::{
    ContactsBody, ContactsPacket, PeerView, SignalRequest, SignalResponse, FAMILY_SPACE,
};

use async_trait::async_trait;
use thiserror::Error;

use crate::identity::{IdUrl, IdentityError};

#[derive(Error, Debug)]
pub enum SignalError {
    #[error("Request to {0} timed out")]
    Timeout(IdUrl),
    #[error("Peer {0} is unreachable: {1}")]
    Unreachable(IdUrl, String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),
    #[error("Signaling node stopped")]
    Closed,
}

/// Outgoing side: deliver a packet and wait for the answer
#[async_trait]
pub trait ContactsSender: Send + Sync {
    async fn send_contacts(
        &self,
        recipient: &IdUrl,
        packet: ContactsPacket,
    ) -> Result<SignalResponse, SignalError>;
}

/// Incoming side: answer a packet from `sender`
#[async_trait]
pub trait ContactsHandler: Send + Sync {
    async fn handle_contacts(&self, sender: IdUrl, packet: ContactsPacket) -> SignalResponse;
}
