//! Contacts signaling protocol definitions

use futures::prelude::*;
use libp2p::{request_response::Codec, StreamProtocol};
use serde::{Deserialize, Serialize};
use std::io;

use crate::identity::IdUrl;

/// Protocol name for contacts packets between peers
pub const CONTACTS_PROTOCOL: StreamProtocol = StreamProtocol::new("/p2p-backup/contacts/1.0.0");

/// Space of the packets exchanged between members of one customer family
pub const FAMILY_SPACE: &str = "family_member";

/// Largest accepted packet, identity lists included
const MAX_PACKET_SIZE: u64 = 256 * 1024;

/// Payload of a contacts packet, tagged by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContactsBody {
    /// A supplier asks the others to review its next family transaction
    SuppliersList {
        customer_idurl: IdUrl,
        #[serde(default)]
        customer_ecc_map: Option<String>,
        transaction_revision: u64,
        suppliers_list: Vec<IdUrl>,
    },
    /// The customer tells a supplier which slot of the family it holds
    SupplierPosition {
        customer_idurl: IdUrl,
        customer_ecc_map: String,
        supplier_idurl: IdUrl,
        supplier_position: usize,
        #[serde(default)]
        family_snapshot: Vec<IdUrl>,
    },
}

impl ContactsBody {
    pub fn customer_idurl(&self) -> &IdUrl {
        match self {
            ContactsBody::SuppliersList { customer_idurl, .. } => customer_idurl,
            ContactsBody::SupplierPosition { customer_idurl, .. } => customer_idurl,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ContactsBody::SuppliersList { .. } => "suppliers_list",
            ContactsBody::SupplierPosition { .. } => "supplier_position",
        }
    }
}

/// JSON payload of a `Contacts` packet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactsPacket {
    pub space: String,
    #[serde(flatten)]
    pub body: ContactsBody,
}

impl ContactsPacket {
    pub fn family(body: ContactsBody) -> Self {
        Self {
            space: FAMILY_SPACE.to_string(),
            body,
        }
    }
}

/// What a peer believes the family looks like
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerView {
    pub revision: u64,
    #[serde(default)]
    pub ecc_map: Option<String>,
    pub suppliers: Vec<IdUrl>,
}

/// Request on the wire: who sends, and the packet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRequest {
    pub sender: IdUrl,
    pub packet: ContactsPacket,
}

/// `Ack` with empty payload or `Fail` echoing the responder's view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum SignalResponse {
    Ack,
    Fail {
        reason: String,
        #[serde(default)]
        view: Option<PeerView>,
    },
}

impl SignalResponse {
    pub fn fail(reason: impl Into<String>) -> Self {
        SignalResponse::Fail {
            reason: reason.into(),
            view: None,
        }
    }

    pub fn fail_with_view(reason: impl Into<String>, view: PeerView) -> Self {
        SignalResponse::Fail {
            reason: reason.into(),
            view: Some(view),
        }
    }

    pub fn is_ack(&self) -> bool {
        matches!(self, SignalResponse::Ack)
    }
}

/// JSON codec for the contacts protocol
#[derive(Debug, Clone, Default)]
pub struct ContactsCodec;

async fn read_json<T, D>(io: &mut T) -> io::Result<D>
where
    T: AsyncRead + Unpin + Send,
    D: serde::de::DeserializeOwned,
{
    let mut buf = Vec::new();
    io.take(MAX_PACKET_SIZE).read_to_end(&mut buf).await?;
    serde_json::from_slice(&buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

async fn write_json<T, S>(io: &mut T, value: &S) -> io::Result<()>
where
    T: AsyncWrite + Unpin + Send,
    S: Serialize,
{
    let buf =
        serde_json::to_vec(value).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    io.write_all(&buf).await?;
    io.close().await?;
    Ok(())
}

#[async_trait::async_trait]
impl Codec for ContactsCodec {
    type Protocol = StreamProtocol;
    type Request = SignalRequest;
    type Response = SignalResponse;

    async fn read_request<T>(&mut self, _: &Self::Protocol, io: &mut T) -> io::Result<Self::Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_json(io).await
    }

    async fn read_response<T>(&mut self, _: &Self::Protocol, io: &mut T) -> io::Result<Self::Response>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_json(io).await
    }

    async fn write_request<T>(&mut self, _: &Self::Protocol, io: &mut T, req: Self::Request) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_json(io, &req).await
    }

    async fn write_response<T>(&mut self, _: &Self::Protocol, io: &mut T, res: Self::Response) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_json(io, &res).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suppliers_list_wire_format() {
        let packet = ContactsPacket::family(ContactsBody::SuppliersList {
            customer_idurl: IdUrl::new("http://id.net/carol.xml"),
            customer_ecc_map: Some("ecc/2x2".to_string()),
            transaction_revision: 3,
            suppliers_list: vec![IdUrl::new("http://id.net/a.xml"), IdUrl::empty()],
        });
        let json = serde_json::to_value(&packet).unwrap();
        assert_eq!(json["space"], "family_member");
        assert_eq!(json["type"], "suppliers_list");
        assert_eq!(json["transaction_revision"], 3);
        assert_eq!(json["suppliers_list"][1], "");

        let back: ContactsPacket = serde_json::from_value(json).unwrap();
        assert_eq!(back, packet);
    }

    #[test]
    fn test_supplier_position_without_snapshot() {
        let raw = r#"{"space":"family_member","type":"supplier_position",
            "customer_idurl":"http://id.net/carol.xml","customer_ecc_map":"ecc/4x4",
            "supplier_idurl":"http://id.net/a.xml","supplier_position":2}"#;
        let packet: ContactsPacket = serde_json::from_str(raw).unwrap();
        match packet.body {
            ContactsBody::SupplierPosition {
                supplier_position,
                family_snapshot,
                ..
            } => {
                assert_eq!(supplier_position, 2);
                assert!(family_snapshot.is_empty());
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_fail_carries_view() {
        let response = SignalResponse::fail_with_view(
            "moved",
            PeerView {
                revision: 4,
                ecc_map: Some("ecc/2x2".to_string()),
                suppliers: vec![IdUrl::new("http://id.net/a.xml"), IdUrl::empty()],
            },
        );
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"command\":\"fail\""));
        let back: SignalResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back, response);
        assert!(!back.is_ack());
        assert!(serde_json::from_str::<SignalResponse>(r#"{"command":"ack"}"#)
            .unwrap()
            .is_ack());
    }
}
