//! Combined network behaviour for peer signaling

use libp2p::{
    identify, ping,
    request_response::{self, ProtocolSupport},
    swarm::NetworkBehaviour,
};
use std::time::Duration;

use super::protocol::{ContactsCodec, SignalRequest, SignalResponse, CONTACTS_PROTOCOL};

/// Combined network behaviour
#[derive(NetworkBehaviour)]
pub struct SignalBehaviour {
    /// Request-response for contacts packets
    pub contacts: request_response::Behaviour<ContactsCodec>,
    /// Identify protocol for peer info exchange
    pub identify: identify::Behaviour,
    /// Ping for connection keepalive
    pub ping: ping::Behaviour,
}

impl SignalBehaviour {
    pub fn new(
        local_public_key: libp2p::identity::PublicKey,
        request_timeout: Duration,
    ) -> Self {
        let contacts = request_response::Behaviour::new(
            [(CONTACTS_PROTOCOL, ProtocolSupport::Full)],
            request_response::Config::default().with_request_timeout(request_timeout),
        );

        let identify = identify::Behaviour::new(identify::Config::new(
            "/p2p-backup/id/1.0.0".to_string(),
            local_public_key,
        ));

        let ping = ping::Behaviour::new(ping::Config::new().with_interval(Duration::from_secs(30)));

        Self {
            contacts,
            identify,
            ping,
        }
    }
}

/// Events from the contacts protocol
pub type ContactsEvent = request_response::Event<SignalRequest, SignalResponse>;
