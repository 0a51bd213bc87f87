//! Registry of family members, one per customer
//!
//! The registry owns the handles; a coordinator removes itself from the
//! registry when it closes, which is the only way one is destroyed.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::member::{spawn, FamilyConfig, FamilyMemberHandle};
use crate::identity::IdUrl;
use crate::network::{
    ContactsBody, ContactsHandler, ContactsPacket, ContactsSender, SignalResponse, FAMILY_SPACE,
};
use crate::relations::Relations;

struct MemberEntry {
    id: u64,
    customer: IdUrl,
    handle: FamilyMemberHandle,
}

pub struct CustomerFamilies {
    this: Weak<CustomerFamilies>,
    relations: Relations,
    signals: Arc<dyn ContactsSender>,
    config: FamilyConfig,
    shutdown: CancellationToken,
    members: Mutex<Vec<MemberEntry>>,
    next_id: AtomicU64,
}

impl CustomerFamilies {
    pub fn new(
        relations: Relations,
        signals: Arc<dyn ContactsSender>,
        config: FamilyConfig,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            relations,
            signals,
            config,
            shutdown,
            members: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn my_idurl(&self) -> &IdUrl {
        self.relations.my_idurl()
    }

    fn same_customer(&self, a: &IdUrl, b: &IdUrl) -> bool {
        a == b
            || self
                .relations
                .identities()
                .interner()
                .rotated_equal(a.to_text(), b.to_text())
    }

    fn find(&self, members: &[MemberEntry], customer: &IdUrl) -> Option<FamilyMemberHandle> {
        members
            .iter()
            .find(|entry| self.same_customer(&entry.customer, customer) && !entry.handle.is_closed())
            .map(|entry| entry.handle.clone())
    }

    pub fn get(&self, customer: &IdUrl) -> Option<FamilyMemberHandle> {
        let members = self.members.lock().unwrap_or_else(|e| e.into_inner());
        self.find(&members, customer)
    }

    /// Coordinator of `customer`, started if there is none
    pub fn get_or_create(&self, customer: &IdUrl) -> FamilyMemberHandle {
        let mut members = self.members.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = self.find(&members, customer) {
            return handle;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let registry = self.this.clone();
        let handle = spawn(
            customer.clone(),
            self.relations.clone(),
            self.signals.clone(),
            self.config.clone(),
            &self.shutdown,
            Box::new(move || {
                if let Some(registry) = registry.upgrade() {
                    registry.remove(id);
                }
            }),
        );
        info!("Started family member of {}", customer);
        members.push(MemberEntry {
            id,
            customer: customer.clone(),
            handle: handle.clone(),
        });
        handle
    }

    fn remove(&self, id: u64) {
        let mut members = self.members.lock().unwrap_or_else(|e| e.into_inner());
        members.retain(|entry| entry.id != id);
    }

    pub fn customers(&self) -> Vec<IdUrl> {
        let members = self.members.lock().unwrap_or_else(|e| e.into_inner());
        members.iter().map(|entry| entry.customer.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.members.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start coordinators for every customer known from the contacts database
    pub async fn restore(&self) -> usize {
        let customers = match self.relations.contacts().customers() {
            Ok(customers) => customers,
            Err(e) => {
                warn!("Failed listing known customers: {}", e);
                return 0;
            }
        };
        for customer in &customers {
            let handle = self.get_or_create(customer);
            if let Err(e) = handle.refresh().await {
                warn!("Failed refreshing family of {}: {}", customer, e);
            }
        }
        customers.len()
    }

    /// Close every coordinator and wait until they are gone
    pub async fn shutdown_all(&self) {
        let handles: Vec<FamilyMemberHandle> = {
            let members = self.members.lock().unwrap_or_else(|e| e.into_inner());
            members.iter().map(|entry| entry.handle.clone()).collect()
        };
        for handle in &handles {
            let _ = handle.shutdown().await;
        }
        for handle in &handles {
            let _ = handle.wait_for(super::FamilyState::Closed).await;
        }
        debug!("Closed {} family members", handles.len());
    }
}

#[async_trait]
impl ContactsHandler for CustomerFamilies {
    async fn handle_contacts(&self, sender: IdUrl, packet: ContactsPacket) -> SignalResponse {
        if packet.space != FAMILY_SPACE {
            return SignalResponse::fail(format!("unknown space {}", packet.space));
        }
        let customer = packet.body.customer_idurl().clone();
        let handle = match &packet.body {
            ContactsBody::SupplierPosition { .. } => self.get_or_create(&customer),
            ContactsBody::SuppliersList { .. } => match self.get(&customer) {
                Some(handle) => handle,
                None => {
                    debug!("No family member of {}, accepting review from {}", customer, sender);
                    return SignalResponse::Ack;
                }
            },
        };
        handle.contacts(sender, packet.body).await
    }
}

#[cfg(test)]
mod tests {
    use super::super::member::tests::{settled, until};
    use super::*;
    use crate::family::FamilyState;
    use crate::network::MemorySignals;
    use crate::relations::testing::TestNet;
    use std::time::Duration;

    const A: &str = "http://id.net/a.xml";
    const B: &str = "http://id.net/b.xml";
    const X: &str = "http://id.net/x.xml";
    const Y: &str = "http://id.net/y.xml";
    const CAROL: &str = "http://id.net/carol.xml";
    const SEED: &str = "http://id.net/seed.xml";

    fn ids(list: &[&str]) -> Vec<IdUrl> {
        list.iter().map(|s| IdUrl::new(*s)).collect()
    }

    async fn families(
        net: &TestNet,
        signals: &Arc<MemorySignals>,
        port: u16,
        me: &str,
    ) -> Arc<CustomerFamilies> {
        let registry = CustomerFamilies::new(
            net.relations(port, me).await,
            signals.endpoint(IdUrl::new(me)),
            FamilyConfig::default(),
            CancellationToken::new(),
        );
        let handler: Arc<dyn ContactsHandler> = registry.clone();
        signals.register(&IdUrl::new(me), Arc::downgrade(&handler));
        registry
    }

    #[tokio::test]
    async fn test_two_suppliers_join() {
        let net = TestNet::new();
        for idurl in [A, B, CAROL] {
            net.publish(idurl).await;
        }
        let signals = MemorySignals::new();
        let seed = net.relations(7000, SEED).await;
        let alice = families(&net, &signals, 7001, A).await;
        let bob = families(&net, &signals, 7002, B).await;
        let carol = IdUrl::new(CAROL);

        let a = alice.get_or_create(&carol);
        a.join(Some("ecc/4x4".to_string()), Some(0), vec![]).await.unwrap();
        until(&a, |s| settled(s) && s.my_info.is_some()).await;

        let b = bob.get_or_create(&carol);
        b.join(Some("ecc/4x4".to_string()), Some(2), vec![]).await.unwrap();
        let snapshot = until(&b, |s| settled(s) && s.my_info.is_some()).await;
        assert_eq!(snapshot.state, FamilyState::Connected);

        let family = seed
            .read_customer_suppliers(&carol, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(family.revision, 2);
        assert_eq!(family.publisher_idurl, Some(IdUrl::new(B)));
        assert_eq!(family.suppliers, ids(&[A, "", B, ""]));

        // alice learned the new revision while reviewing it
        let snapshot = until(&a, |s| {
            settled(s) && s.my_info.as_ref().map_or(false, |i| i.revision == 2)
        })
        .await;
        assert_eq!(snapshot.my_info.unwrap().suppliers, ids(&[A, "", B, ""]));
    }

    #[tokio::test]
    async fn test_leave_removes_member() {
        let net = TestNet::new();
        for idurl in [A, B, CAROL] {
            net.publish(idurl).await;
        }
        let signals = MemorySignals::new();
        let seed = net.relations(7000, SEED).await;
        let alice = families(&net, &signals, 7001, A).await;
        let carol = IdUrl::new(CAROL);

        let a = alice.get_or_create(&carol);
        a.join(Some("ecc/2x2".to_string()), Some(1), vec![]).await.unwrap();
        until(&a, |s| settled(s) && s.my_info.is_some()).await;
        assert_eq!(alice.customers(), vec![carol.clone()]);

        a.leave(None).await.unwrap();
        tokio::time::timeout(Duration::from_secs(10), a.wait_for(FamilyState::Closed))
            .await
            .unwrap()
            .unwrap();
        assert!(alice.is_empty());
        assert!(alice.get(&carol).is_none());

        let family = seed
            .read_customer_suppliers(&carol, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(family.revision, 2);
        assert_eq!(family.suppliers, ids(&["", ""]));

        // a new coordinator can be started again for the same customer
        let again = alice.get_or_create(&carol);
        assert_eq!(again.customer_idurl(), &carol);
        assert_eq!(alice.len(), 1);
    }

    #[tokio::test]
    async fn test_incoming_packets() {
        let net = TestNet::new();
        for idurl in [A, CAROL] {
            net.publish(idurl).await;
        }
        let signals = MemorySignals::new();
        let _seed = net.relations(7000, SEED).await;
        let alice = families(&net, &signals, 7001, A).await;
        let carol = IdUrl::new(CAROL);
        let from_carol = signals.endpoint(carol.clone());

        let mut packet = ContactsPacket::family(ContactsBody::SuppliersList {
            customer_idurl: carol.clone(),
            customer_ecc_map: None,
            transaction_revision: 1,
            suppliers_list: ids(&[B, ""]),
        });
        let reply = from_carol.send_contacts(&IdUrl::new(A), packet.clone()).await.unwrap();
        assert!(reply.is_ack());
        assert!(alice.is_empty());

        packet.space = "something_else".to_string();
        let reply = from_carol.send_contacts(&IdUrl::new(A), packet).await.unwrap();
        assert!(!reply.is_ack());

        let position = ContactsPacket::family(ContactsBody::SupplierPosition {
            customer_idurl: carol.clone(),
            customer_ecc_map: "ecc/2x2".to_string(),
            supplier_idurl: IdUrl::new(A),
            supplier_position: 0,
            family_snapshot: vec![],
        });
        let reply = from_carol.send_contacts(&IdUrl::new(A), position).await.unwrap();
        assert!(reply.is_ack());
        assert_eq!(alice.len(), 1);
        let meta = alice
            .relations
            .contacts()
            .customer_meta(&carol)
            .unwrap()
            .unwrap();
        assert_eq!(meta.position, Some(0));

        alice.shutdown_all().await;
        assert!(alice.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_joins_at_same_position() {
        let net = TestNet::new();
        for idurl in [A, B, X, Y, CAROL] {
            net.publish(idurl).await;
        }
        let signals = MemorySignals::new();
        let seed = net.relations(7000, SEED).await;
        let carol = IdUrl::new(CAROL);
        seed.write_customer_suppliers(&carol, &ids(&[A, "", B, ""]), "ecc/4x4", 2, Some(&IdUrl::new(B)))
            .await
            .unwrap();
        let _alice = families(&net, &signals, 7001, A).await;
        let _bob = families(&net, &signals, 7002, B).await;
        let xs = families(&net, &signals, 7003, X).await;
        let ys = families(&net, &signals, 7004, Y).await;

        let x = xs.get_or_create(&carol);
        let y = ys.get_or_create(&carol);
        let (joined_x, joined_y) = tokio::join!(
            x.join(Some("ecc/4x4".to_string()), Some(1), vec![]),
            y.join(Some("ecc/4x4".to_string()), Some(1), vec![]),
        );
        joined_x.unwrap();
        joined_y.unwrap();
        until(&x, settled).await;
        until(&y, settled).await;

        let family = seed
            .read_customer_suppliers(&carol, false)
            .await
            .unwrap()
            .unwrap();
        assert!(family.revision >= 3);
        assert_eq!(family.suppliers[0], IdUrl::new(A));
        assert_eq!(family.suppliers[2], IdUrl::new(B));
        let holder = family.suppliers[1].clone();
        assert!(holder == IdUrl::new(X) || holder == IdUrl::new(Y), "{:?}", family.suppliers);
        let other = if holder == IdUrl::new(X) { Y } else { X };
        assert!(!family.suppliers.contains(&IdUrl::new(other)));
    }
}
