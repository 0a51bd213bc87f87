//! DHT wire protocol
//!
//! Messages are JSON envelopes carried in UDP datagrams. Every RPC except
//! `Ping` names the layer it targets.

use serde::{Deserialize, Serialize};

use super::key::{DhtId, LayerId};
use super::routing::Contact;

/// Largest datagram sent on the wire
pub const MAX_DATAGRAM: usize = 8192;

/// Remote procedure calls between DHT nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rpc", rename_all = "snake_case")]
pub enum Request {
    Ping,
    FindNode {
        key: DhtId,
        layer_id: LayerId,
    },
    FindValue {
        key: DhtId,
        layer_id: LayerId,
    },
    Store {
        key: DhtId,
        value: String,
        original_publisher: DhtId,
        age: u64,
        expire_seconds: u64,
        layer_id: LayerId,
    },
    Delete {
        key: DhtId,
        layer_id: LayerId,
    },
    /// Ask for a piece of the node's own data, e.g. its IDURL
    Request {
        key: String,
        layer_id: LayerId,
    },
    VerifyUpdate {
        key: DhtId,
        value: String,
        age: u64,
        expire_seconds: u64,
        layer_id: LayerId,
    },
}

impl Request {
    pub fn layer_id(&self) -> Option<LayerId> {
        match self {
            Request::Ping => None,
            Request::FindNode { layer_id, .. }
            | Request::FindValue { layer_id, .. }
            | Request::Store { layer_id, .. }
            | Request::Delete { layer_id, .. }
            | Request::Request { layer_id, .. }
            | Request::VerifyUpdate { layer_id, .. } => Some(*layer_id),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Request::Ping => "ping",
            Request::FindNode { .. } => "findNode",
            Request::FindValue { .. } => "findValue",
            Request::Store { .. } => "store",
            Request::Delete { .. } => "delete",
            Request::Request { .. } => "request",
            Request::VerifyUpdate { .. } => "verify_update",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Response {
    Pong { node_id: DhtId },
    Nodes { contacts: Vec<Contact> },
    Value { value: String },
    /// Acknowledgement of `Store`, `Delete` and `VerifyUpdate`
    Ok,
    Data { value: serde_json::Value },
    Error { message: String },
}

/// Request or response as sent on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Body {
    Request(Request),
    Response(Response),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Correlates a response with its request
    pub rpc_id: u64,
    /// Id of the sending node
    pub sender: DhtId,
    /// Port the sender listens on
    pub sender_port: u16,
    pub body: Body,
}

impl Envelope {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }
}

const FRAGMENT_MAGIC: u8 = 0xB7;
/// magic + message id + sequence + total
const FRAGMENT_HEADER: usize = 1 + 8 + 2 + 2;
const FRAGMENT_PAYLOAD: usize = MAX_DATAGRAM - FRAGMENT_HEADER;

/// Split an encoded message into datagrams
pub fn fragment(message_id: u64, payload: &[u8]) -> Vec<Vec<u8>> {
    let chunks: Vec<&[u8]> = if payload.is_empty() {
        vec![&[]]
    } else {
        payload.chunks(FRAGMENT_PAYLOAD).collect()
    };
    let total = chunks.len() as u16;
    chunks
        .into_iter()
        .enumerate()
        .map(|(seq, chunk)| {
            let mut datagram = Vec::with_capacity(FRAGMENT_HEADER + chunk.len());
            datagram.push(FRAGMENT_MAGIC);
            datagram.extend_from_slice(&message_id.to_be_bytes());
            datagram.extend_from_slice(&(seq as u16).to_be_bytes());
            datagram.extend_from_slice(&total.to_be_bytes());
            datagram.extend_from_slice(chunk);
            datagram
        })
        .collect()
}

/// Parsed datagram header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub message_id: u64,
    pub seq: u16,
    pub total: u16,
}

/// Split a datagram into header and payload
pub fn parse_fragment(datagram: &[u8]) -> Option<(FragmentHeader, &[u8])> {
    if datagram.len() < FRAGMENT_HEADER || datagram[0] != FRAGMENT_MAGIC {
        return None;
    }
    let message_id = u64::from_be_bytes(datagram[1..9].try_into().ok()?);
    let seq = u16::from_be_bytes(datagram[9..11].try_into().ok()?);
    let total = u16::from_be_bytes(datagram[11..13].try_into().ok()?);
    if total == 0 || seq >= total {
        return None;
    }
    Some((
        FragmentHeader {
            message_id,
            seq,
            total,
        },
        &datagram[FRAGMENT_HEADER..],
    ))
}
