//! In-process signaling router

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, Weak};
use tracing::debug;

use super::{ContactsHandler, ContactsPacket, ContactsSender, SignalError, SignalResponse};
use crate::identity::IdUrl;

/// Routes contacts packets between handlers registered under an IDURL
#[derive(Default)]
pub struct MemorySignals {
    handlers: RwLock<HashMap<String, Weak<dyn ContactsHandler>>>,
    offline: RwLock<HashSet<String>>,
}

impl MemorySignals {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, idurl: &IdUrl, handler: Weak<dyn ContactsHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(idurl.to_text().to_string(), handler);
    }

    /// Sender whose packets are signed as coming from `me`
    pub fn endpoint(self: &Arc<Self>, me: IdUrl) -> Arc<MemoryEndpoint> {
        Arc::new(MemoryEndpoint {
            signals: self.clone(),
            me,
        })
    }

    /// Make a peer unreachable without removing it
    pub fn set_offline(&self, idurl: &IdUrl, offline: bool) {
        let mut set = self.offline.write().unwrap_or_else(|e| e.into_inner());
        if offline {
            set.insert(idurl.to_text().to_string());
        } else {
            set.remove(idurl.to_text());
        }
    }

    fn handler(&self, idurl: &IdUrl) -> Option<Arc<dyn ContactsHandler>> {
        let offline = self.offline.read().unwrap_or_else(|e| e.into_inner());
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        idurl
            .forms()
            .filter(|form| !offline.contains(*form))
            .find_map(|form| handlers.get(form).and_then(Weak::upgrade))
    }
}

pub struct MemoryEndpoint {
    signals: Arc<MemorySignals>,
    me: IdUrl,
}

#[async_trait]
impl ContactsSender for MemoryEndpoint {
    async fn send_contacts(
        &self,
        recipient: &IdUrl,
        packet: ContactsPacket,
    ) -> Result<SignalResponse, SignalError> {
        let handler = self
            .signals
            .handler(recipient)
            .ok_or_else(|| SignalError::Timeout(recipient.clone()))?;
        debug!("{} -> {}: {}", self.me, recipient, packet.body.kind());
        Ok(handler.handle_contacts(self.me.clone(), packet).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ContactsBody;

    struct Echo;

    #[async_trait]
    impl ContactsHandler for Echo {
        async fn handle_contacts(&self, sender: IdUrl, packet: ContactsPacket) -> SignalResponse {
            if packet.body.customer_idurl() == &sender {
                SignalResponse::Ack
            } else {
                SignalResponse::fail("not my customer")
            }
        }
    }

    fn packet(customer: &str) -> ContactsPacket {
        ContactsPacket::family(ContactsBody::SuppliersList {
            customer_idurl: IdUrl::new(customer),
            customer_ecc_map: None,
            transaction_revision: 1,
            suppliers_list: vec![],
        })
    }

    #[tokio::test]
    async fn test_routing_and_offline() {
        let signals = MemorySignals::new();
        let echo: Arc<dyn ContactsHandler> = Arc::new(Echo);
        let bob = IdUrl::new("http://id.net/bob.xml");
        signals.register(&bob, Arc::downgrade(&echo));

        let alice = signals.endpoint(IdUrl::new("http://id.net/alice.xml"));
        let reply = alice
            .send_contacts(&bob, packet("http://id.net/alice.xml"))
            .await
            .unwrap();
        assert!(reply.is_ack());
        let reply = alice
            .send_contacts(&bob, packet("http://id.net/carol.xml"))
            .await
            .unwrap();
        assert!(!reply.is_ack());

        signals.set_offline(&bob, true);
        let result = alice.send_contacts(&bob, packet("http://id.net/alice.xml")).await;
        assert!(matches!(result, Err(SignalError::Timeout(_))));

        drop(echo);
        signals.set_offline(&bob, false);
        assert!(alice.send_contacts(&bob, packet("x")).await.is_err());
    }
}
