//! Supplier connector over the contacts signaling
//!
//! The handshake is the `supplier_position` packet itself: a supplier that
//! acks it has taken the slot, a `Fail` answer is a refusal and a peer that
//! cannot be reached is disconnected and offline.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::finder::{HireRequest, SupplierConnector, SupplierState};
use crate::identity::IdUrl;
use crate::network::{ContactsBody, ContactsPacket, ContactsSender, SignalError, SignalResponse};

/// A disconnected supplier is probed again after this long
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(60);

struct Connection {
    supplier: IdUrl,
    state: SupplierState,
    online: Option<bool>,
    checked_at: Instant,
}

pub struct SignalingConnector {
    signals: Arc<dyn ContactsSender>,
    me: IdUrl,
    reconnect_interval: Duration,
    connections: RwLock<Vec<Connection>>,
}

impl SignalingConnector {
    pub fn new(signals: Arc<dyn ContactsSender>, me: IdUrl) -> Self {
        Self {
            signals,
            me,
            reconnect_interval: RECONNECT_INTERVAL,
            connections: RwLock::new(Vec::new()),
        }
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    async fn remember(&self, supplier: &IdUrl, state: SupplierState, online: Option<bool>) {
        let mut connections = self.connections.write().await;
        let checked_at = Instant::now();
        match connections.iter_mut().find(|c| c.supplier == *supplier) {
            Some(connection) => {
                connection.state = state;
                connection.online = online;
                connection.checked_at = checked_at;
            }
            None => connections.push(Connection {
                supplier: supplier.clone(),
                state,
                online,
                checked_at,
            }),
        }
    }
}

#[async_trait]
impl SupplierConnector for SignalingConnector {
    async fn connect(&self, supplier: &IdUrl, request: &HireRequest) -> SupplierState {
        let packet = ContactsPacket::family(ContactsBody::SupplierPosition {
            customer_idurl: self.me.clone(),
            customer_ecc_map: request.ecc_map.clone(),
            supplier_idurl: supplier.clone(),
            supplier_position: request.family_position,
            family_snapshot: request.family_snapshot.clone(),
        });
        let (state, online) = match self.signals.send_contacts(supplier, packet).await {
            Ok(SignalResponse::Ack) => (SupplierState::Connected, Some(true)),
            Ok(SignalResponse::Fail { reason, .. }) => {
                debug!("Supplier {} refused: {}", supplier, reason);
                (SupplierState::Refuse, Some(true))
            }
            Err(SignalError::Timeout(_)) | Err(SignalError::Unreachable(..)) => {
                (SupplierState::Disconnected, Some(false))
            }
            Err(e) => {
                debug!("Connecting {} failed: {}", supplier, e);
                (SupplierState::NoService, None)
            }
        };
        info!("Supplier {} at slot {} is {:?}", supplier, request.family_position, state);
        self.remember(supplier, state, online).await;
        state
    }

    async fn disconnect(&self, supplier: &IdUrl) {
        let mut connections = self.connections.write().await;
        connections.retain(|c| c.supplier != *supplier);
    }

    async fn state(&self, supplier: &IdUrl) -> Option<SupplierState> {
        let connections = self.connections.read().await;
        let connection = connections.iter().find(|c| c.supplier == *supplier)?;
        if connection.state == SupplierState::Disconnected
            && connection.checked_at.elapsed() >= self.reconnect_interval
        {
            return None;
        }
        Some(connection.state)
    }

    async fn is_online(&self, supplier: &IdUrl) -> Option<bool> {
        let connections = self.connections.read().await;
        connections
            .iter()
            .find(|c| c.supplier == *supplier)
            .and_then(|c| c.online)
    }
}
