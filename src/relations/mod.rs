//! Relations Layer
//!
//! Typed wrappers over the Record Layer that build the canonical key of each
//! record class and keep the identity cache and contacts database in step
//! with what is read from the DHT.

pub mod brokers;
pub mod identity;
pub mod suppliers;

pub use brokers::BrokerInfo;
pub use suppliers::CustomerSuppliers;

use std::sync::Arc;
use thiserror::Error;

use crate::identity::{IdUrl, IdentityCache};
use crate::records::{RecordError, RecordLayer};
use crate::storage::{ContactsError, ContactsStore};

#[derive(Error, Debug)]
pub enum RelationsError {
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error(transparent)]
    Contacts(#[from] ContactsError),
}

impl RelationsError {
    /// Revision advised by a storing node that rejected a write
    pub fn current_revision(&self) -> Option<u64> {
        match self {
            RelationsError::Record(e) => e.current_revision(),
            _ => None,
        }
    }
}

/// Relations between principals, as published in the DHT
#[derive(Clone)]
pub struct Relations {
    records: RecordLayer,
    identities: Arc<IdentityCache>,
    contacts: Arc<ContactsStore>,
    my_idurl: IdUrl,
}

impl Relations {
    pub fn new(
        records: RecordLayer,
        identities: Arc<IdentityCache>,
        contacts: Arc<ContactsStore>,
        my_idurl: IdUrl,
    ) -> Self {
        Self {
            records,
            identities,
            contacts,
            my_idurl,
        }
    }

    pub fn records(&self) -> &RecordLayer {
        &self.records
    }

    pub fn identities(&self) -> &Arc<IdentityCache> {
        &self.identities
    }

    pub fn contacts(&self) -> &Arc<ContactsStore> {
        &self.contacts
    }

    pub fn my_idurl(&self) -> &IdUrl {
        &self.my_idurl
    }

    /// Current text form of an IDURL
    fn current_form(&self, idurl: &IdUrl) -> String {
        if idurl.is_empty() {
            return String::new();
        }
        self.identities
            .interner()
            .canonicalize(idurl)
            .to_text()
            .to_string()
    }

    fn is_me(&self, idurl: &IdUrl) -> bool {
        *idurl == self.my_idurl
            || self
                .identities
                .interner()
                .rotated_equal(idurl.to_text(), self.my_idurl.to_text())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::dht::{DhtNode, KademliaConfig, MemoryNetwork, LAYER_MESSAGE_BROKERS, LAYER_SUPPLIERS};
    use crate::identity::{Identity, IdUrlInterner, MemoryIdentitySource};
    use crate::records::{RecordArbiter, RecordCache};
    use std::net::SocketAddr;

    pub struct TestNet {
        pub network: Arc<MemoryNetwork>,
        pub identities: Arc<MemoryIdentitySource>,
    }

    impl TestNet {
        pub fn new() -> Self {
            Self {
                network: MemoryNetwork::new(),
                identities: Arc::new(MemoryIdentitySource::new()),
            }
        }

        pub async fn publish(&self, idurl: &str) {
            self.identities
                .publish(Identity {
                    sources: vec![idurl.to_string()],
                    public_key: format!("ssh-rsa KEY-{}", idurl),
                    contacts: vec![format!("mem://{}", idurl)],
                    revision: 0,
                })
                .await;
        }

        /// A node on the shared network, bootstrapped through port 7000
        pub async fn relations(&self, port: u16, me: &str) -> Relations {
            let addr = SocketAddr::from(([10, 0, 2, 1], port));
            let node = DhtNode::memory(&self.network, addr, KademliaConfig::default()).unwrap();
            node.set_validator(Arc::new(RecordArbiter::new()));
            let seed = SocketAddr::from(([10, 0, 2, 1], 7000));
            for layer in [0, LAYER_SUPPLIERS, LAYER_MESSAGE_BROKERS] {
                node.attach_layer(layer).await.unwrap();
                if port != 7000 {
                    node.bootstrap(layer, &[seed]).await.unwrap();
                }
            }
            let records = RecordLayer::new(node, Arc::new(RecordCache::in_memory()));
            let cache = Arc::new(IdentityCache::new(
                self.identities.clone(),
                Arc::new(IdUrlInterner::new()),
            ));
            Relations::new(
                records,
                cache,
                Arc::new(ContactsStore::temporary().unwrap()),
                IdUrl::new(me),
            )
        }
    }
}
