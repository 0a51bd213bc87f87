//! Supplier Finder and Employer
//!
//! The employer runs on the customer side. Each cycle it connects the
//! suppliers it already has, decides whom to dismiss, hires at most one
//! new supplier through the finder and tells that supplier which slot of
//! the family it takes.

pub mod connector;
pub mod finder;
pub mod fire_hire;

pub use connector::SignalingConnector;
pub use finder::{
    FinderError, HireRequest, SupplierConnector, SupplierFinder, SupplierState,
    MAX_FINDER_ATTEMPTS, NODE_DATA_IDURL,
};
pub use fire_hire::{Decision, DismissalPolicy, SlotStatus};

use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EmployerConfig;
use crate::ecc::{fit_to_size, EccError, EccMap};
use crate::family::member::write_transaction;
use crate::family::FamilyInfo;
use crate::identity::IdUrl;
use crate::network::{ContactsBody, ContactsPacket, ContactsSender};
use crate::relations::{Relations, RelationsError};
use crate::storage::ContactsError;

#[derive(Error, Debug)]
pub enum EmployerError {
    #[error("ECC error: {0}")]
    Ecc(#[from] EccError),
    #[error("Contacts error: {0}")]
    Contacts(#[from] ContactsError),
    #[error("Relations error: {0}")]
    Relations(#[from] RelationsError),
}

/// What one employer cycle did
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub decision: Decision,
    pub hired: Option<(usize, IdUrl)>,
    /// Revision of my suppliers record when it was republished
    pub revision: Option<u64>,
}

pub struct Employer {
    relations: Relations,
    finder: SupplierFinder,
    connector: Arc<dyn SupplierConnector>,
    signals: Arc<dyn ContactsSender>,
    config: EmployerConfig,
    desired: usize,
    fire_list: Mutex<Vec<IdUrl>>,
}

impl Employer {
    pub fn new(
        relations: Relations,
        connector: Arc<dyn SupplierConnector>,
        signals: Arc<dyn ContactsSender>,
        config: EmployerConfig,
        desired: usize,
    ) -> Self {
        let finder = SupplierFinder::new(
            relations.records().dht().clone(),
            relations.identities().clone(),
            connector.clone(),
            relations.my_idurl().clone(),
        );
        for candidate in config.candidates.iter().rev() {
            finder.add_candidate(IdUrl::new(candidate.as_str()));
        }
        Self {
            relations,
            finder,
            connector,
            signals,
            config,
            desired,
            fire_list: Mutex::new(Vec::new()),
        }
    }

    pub fn finder(&self) -> &SupplierFinder {
        &self.finder
    }

    /// Ask the next cycle to replace `supplier`
    pub fn fire(&self, supplier: IdUrl) {
        let mut fire_list = self.fire_list.lock().unwrap_or_else(|e| e.into_inner());
        if !fire_list.contains(&supplier) {
            fire_list.push(supplier);
        }
    }

    fn take_fire_list(&self) -> Vec<IdUrl> {
        std::mem::take(&mut *self.fire_list.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// My suppliers as stored locally, padded to the desired size
    pub fn my_suppliers(&self) -> Result<Vec<IdUrl>, EmployerError> {
        let mut suppliers = self
            .relations
            .contacts()
            .suppliers(self.relations.my_idurl())?
            .map(|list| list.suppliers)
            .unwrap_or_default();
        if suppliers.len() < self.desired {
            fit_to_size(&mut suppliers, self.desired);
        }
        Ok(suppliers)
    }

    async fn connect_all(&self, suppliers: &[IdUrl], ecc_map: EccMap) -> Vec<SlotStatus> {
        let mut slots = Vec::with_capacity(suppliers.len());
        for (position, supplier) in suppliers.iter().enumerate() {
            if supplier.is_empty() {
                slots.push(SlotStatus::vacant());
                continue;
            }
            let mut state = self.connector.state(supplier).await;
            if matches!(state, None | Some(SupplierState::Disconnected)) {
                let request = HireRequest {
                    family_position: position,
                    ecc_map: ecc_map.name().to_string(),
                    family_snapshot: suppliers.to_vec(),
                };
                state = Some(self.connector.connect(supplier, &request).await);
            }
            slots.push(SlotStatus {
                idurl: supplier.clone(),
                state,
                online: self.connector.is_online(supplier).await,
            });
        }
        slots
    }

    /// One pass of connect, decide, substitute and publish
    pub async fn cycle(&self) -> Result<CycleReport, EmployerError> {
        let ecc_map = EccMap::for_suppliers(self.desired)?;
        let mut suppliers = self.my_suppliers()?;
        let slots = self.connect_all(&suppliers, ecc_map).await;

        let policy = DismissalPolicy {
            desired: self.desired,
            ecc_map,
            replace_critically_offline: self.config.replace_critically_offline,
        };
        let decision = policy.decide(&slots, &self.take_fire_list());
        if let Decision::Keep(reason) = &decision {
            debug!("Keeping current suppliers: {}", reason);
        }
        let dismissed = decision.dismissed().to_vec();
        let mut changed = false;
        if !matches!(decision, Decision::Redundant(_)) {
            for slot in suppliers.iter_mut() {
                if dismissed.contains(slot) {
                    *slot = IdUrl::empty();
                    changed = true;
                }
            }
        }
        if suppliers.len() > self.desired {
            fit_to_size(&mut suppliers, self.desired);
            changed = true;
        }

        let hired = match suppliers.iter().position(IdUrl::is_empty) {
            Some(position) => self.hire(&mut suppliers, position, &dismissed, ecc_map).await,
            None => None,
        };
        changed |= hired.is_some();

        let mut revision = None;
        if changed {
            self.relations.contacts().set_suppliers(
                self.relations.my_idurl(),
                &suppliers,
                Some(ecc_map.name()),
            )?;
            if let Some((position, supplier)) = &hired {
                self.send_position(supplier, *position, &suppliers, ecc_map).await;
            }
            revision = Some(self.publish(&suppliers, ecc_map).await?);
        }
        for supplier in &dismissed {
            info!("Dismissed supplier {}", supplier);
            self.connector.disconnect(supplier).await;
        }
        Ok(CycleReport {
            decision,
            hired,
            revision,
        })
    }

    async fn hire(
        &self,
        suppliers: &mut [IdUrl],
        position: usize,
        dismissed: &[IdUrl],
        ecc_map: EccMap,
    ) -> Option<(usize, IdUrl)> {
        let exclude: Vec<IdUrl> = suppliers
            .iter()
            .chain(dismissed.iter())
            .filter(|s| !s.is_empty())
            .cloned()
            .collect();
        let request = HireRequest {
            family_position: position,
            ecc_map: ecc_map.name().to_string(),
            family_snapshot: suppliers.to_vec(),
        };
        match self.finder.find(&exclude, &request).await {
            Ok(supplier) => {
                suppliers[position] = supplier.clone();
                Some((position, supplier))
            }
            Err(e) => {
                warn!("Failed to hire supplier for position {}: {}", position, e);
                None
            }
        }
    }

    async fn send_position(
        &self,
        supplier: &IdUrl,
        position: usize,
        suppliers: &[IdUrl],
        ecc_map: EccMap,
    ) {
        let packet = ContactsPacket::family(ContactsBody::SupplierPosition {
            customer_idurl: self.relations.my_idurl().clone(),
            customer_ecc_map: ecc_map.name().to_string(),
            supplier_idurl: supplier.clone(),
            supplier_position: position,
            family_snapshot: suppliers.to_vec(),
        });
        match self.signals.send_contacts(supplier, packet).await {
            Ok(response) if response.is_ack() => {
                debug!("Supplier {} accepted position {}", supplier, position);
            }
            Ok(response) => warn!("Supplier {} refused position {}: {:?}", supplier, position, response),
            Err(e) => warn!("Failed sending position to {}: {}", supplier, e),
        }
    }

    /// Republish my suppliers record with me as publisher
    async fn publish(&self, suppliers: &[IdUrl], ecc_map: EccMap) -> Result<u64, EmployerError> {
        let me = self.relations.my_idurl();
        let current = self
            .relations
            .read_customer_suppliers(me, false)
            .await?
            .map_or(0, |family| family.revision);
        let transaction = FamilyInfo {
            revision: current + 1,
            publisher_idurl: Some(me.clone()),
            suppliers: suppliers.to_vec(),
            ecc_map: Some(ecc_map.name().to_string()),
            customer_idurl: me.clone(),
        };
        let written = write_transaction(&self.relations, transaction).await?;
        info!("Published my {} suppliers at revision {}", suppliers.len(), written.revision);
        Ok(written.revision)
    }

    /// Run cycles until cancelled
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.interval_secs.max(1)));
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!("Employer stopped");
                    return;
                }
                _ = ticker.tick() => {
                    match self.cycle().await {
                        Ok(report) => debug!("Employer cycle finished: {:?}", report),
                        Err(e) => warn!("Employer cycle failed: {}", e),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::finder::tests::TableConnector;
    use super::*;
    use crate::dht::LAYER_SUPPLIERS;
    use crate::network::{ContactsHandler, MemorySignals, SignalResponse};
    use crate::relations::testing::TestNet;
    use async_trait::async_trait;
    use tokio::sync::RwLock;

    const A: &str = "http://id.net/a.xml";
    const B: &str = "http://id.net/b.xml";
    const CAROL: &str = "http://id.net/carol.xml";
    const SEED: &str = "http://id.net/seed.xml";
    const X: &str = "http://id.net/x.xml";
    const Y: &str = "http://id.net/y.xml";

    #[derive(Default)]
    struct Recorder(RwLock<Vec<ContactsPacket>>);

    #[async_trait]
    impl ContactsHandler for Recorder {
        async fn handle_contacts(&self, _sender: IdUrl, packet: ContactsPacket) -> SignalResponse {
            self.0.write().await.push(packet);
            SignalResponse::Ack
        }
    }

    struct Fixture {
        _net: TestNet,
        _nodes: Vec<Relations>,
        employer: Employer,
        connector: Arc<TableConnector>,
        recorder: Arc<Recorder>,
        _handler: Arc<dyn ContactsHandler>,
    }

    async fn fixture() -> Fixture {
        let net = TestNet::new();
        for idurl in [A, B, CAROL] {
            net.publish(idurl).await;
        }
        let mut nodes = vec![net.relations(7000, SEED).await];
        for (port, idurl) in [(7001, A), (7002, B)] {
            let node = net.relations(port, idurl).await;
            node.records()
                .dht()
                .set_node_data(LAYER_SUPPLIERS, NODE_DATA_IDURL, serde_json::json!(idurl))
                .await;
            nodes.push(node);
        }
        let carol = net.relations(7003, CAROL).await;

        let connector = Arc::new(TableConnector::default());
        connector.set(A, SupplierState::Connected, true).await;
        connector.set(B, SupplierState::Connected, true).await;
        let signals = MemorySignals::new();
        let recorder = Arc::new(Recorder::default());
        let handler: Arc<dyn ContactsHandler> = recorder.clone();
        signals.register(&IdUrl::new(A), Arc::downgrade(&handler));
        signals.register(&IdUrl::new(B), Arc::downgrade(&handler));

        let employer = Employer::new(
            carol,
            connector.clone(),
            signals.endpoint(IdUrl::new(CAROL)),
            EmployerConfig::default(),
            2,
        );
        Fixture {
            _net: net,
            _nodes: nodes,
            employer,
            connector,
            recorder,
            _handler: handler,
        }
    }

    #[tokio::test]
    async fn test_hire_one_per_cycle() {
        let f = fixture().await;
        let first = f.employer.cycle().await.unwrap();
        assert_eq!(first.decision, Decision::Keep("found empty supplier"));
        let (position, hired) = first.hired.clone().unwrap();
        assert_eq!(position, 0);
        assert_eq!(first.revision, Some(1));

        let second = f.employer.cycle().await.unwrap();
        let (position, other) = second.hired.clone().unwrap();
        assert_eq!(position, 1);
        assert_ne!(hired, other);
        assert_eq!(second.revision, Some(2));

        let suppliers = f.employer.my_suppliers().unwrap();
        assert_eq!(suppliers, vec![hired.clone(), other.clone()]);
        let packets = f.recorder.0.read().await;
        assert_eq!(packets.len(), 2);
        assert!(matches!(
            &packets[1].body,
            ContactsBody::SupplierPosition { supplier_position: 1, supplier_idurl, .. }
                if *supplier_idurl == other
        ));
        drop(packets);

        let record = f
            .employer
            .relations
            .read_customer_suppliers(&IdUrl::new(CAROL), false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.revision, 2);
        assert_eq!(record.publisher_idurl, Some(IdUrl::new(CAROL)));
        assert_eq!(record.ecc_map, "ecc/2x2");
        assert_eq!(record.suppliers, suppliers);

        // full and healthy, nothing to do
        let third = f.employer.cycle().await.unwrap();
        assert_eq!(third.hired, None);
        assert_eq!(third.revision, None);
    }

    #[tokio::test]
    async fn test_fired_supplier_is_replaced() {
        let f = fixture().await;
        let me = IdUrl::new(CAROL);
        f.employer
            .relations
            .contacts()
            .set_suppliers(&me, &[IdUrl::new(A)], Some("ecc/2x2"))
            .unwrap();
        f.employer.fire(IdUrl::new(A));

        let report = f.employer.cycle().await.unwrap();
        assert_eq!(report.decision, Decision::Fire(vec![IdUrl::new(A)]));
        assert_eq!(report.hired, Some((0, IdUrl::new(B))));
        assert_eq!(f.employer.my_suppliers().unwrap(), vec![IdUrl::new(B), IdUrl::empty()]);
        assert_eq!(*f.connector.disconnected.read().await, vec![IdUrl::new(A)]);
    }

    #[tokio::test]
    async fn test_redundant_suppliers_trimmed() {
        let f = fixture().await;
        let me = IdUrl::new(CAROL);
        f.connector.set(X, SupplierState::Connected, true).await;
        f.connector.set(Y, SupplierState::Connected, true).await;
        let listed: Vec<IdUrl> = [A, B, X, Y].iter().map(|s| IdUrl::new(*s)).collect();
        f.employer
            .relations
            .contacts()
            .set_suppliers(&me, &listed, Some("ecc/4x4"))
            .unwrap();
        let report = f.employer.cycle().await.unwrap();
        assert_eq!(
            report.decision,
            Decision::Redundant(vec![IdUrl::new(X), IdUrl::new(Y)])
        );
        assert_eq!(report.hired, None);
        assert_eq!(report.revision, Some(1));
        assert_eq!(f.employer.my_suppliers().unwrap(), listed[..2].to_vec());
        assert_eq!(f.connector.disconnected.read().await.len(), 2);
    }
}
