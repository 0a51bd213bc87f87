//! Supplier Finder
//!
//! Picks a random node of the suppliers layer, asks it for its IDURL and
//! tries to connect it as a supplier. Configured candidates are tried
//! first. A search gives up after five misses.

use async_trait::async_trait;
use rand::seq::SliceRandom;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::dht::{DhtError, DhtId, DhtNode, LAYER_SUPPLIERS};
use crate::identity::{IdUrl, IdentityCache};

/// Misses allowed in one search
pub const MAX_FINDER_ATTEMPTS: usize = 5;

/// Key of the node data answering who runs a DHT node
pub const NODE_DATA_IDURL: &str = "idurl";

#[derive(Error, Debug)]
pub enum FinderError {
    #[error("No supplier found after {0} attempts")]
    SearchFailed(usize),
    #[error("DHT error: {0}")]
    Dht(#[from] DhtError),
}

/// State of the supplier connection as reported by the connector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupplierState {
    Connected,
    Disconnected,
    Refuse,
    NoService,
}

/// What the customer asks a new supplier to take
#[derive(Debug, Clone, PartialEq)]
pub struct HireRequest {
    pub family_position: usize,
    pub ecc_map: String,
    pub family_snapshot: Vec<IdUrl>,
}

/// Storage service handshake with one supplier
#[async_trait]
pub trait SupplierConnector: Send + Sync {
    async fn connect(&self, supplier: &IdUrl, request: &HireRequest) -> SupplierState;

    async fn disconnect(&self, supplier: &IdUrl);

    /// Last known state, `None` when never connected
    async fn state(&self, supplier: &IdUrl) -> Option<SupplierState>;

    /// `Some(true)` online, `Some(false)` offline, `None` while being checked
    async fn is_online(&self, supplier: &IdUrl) -> Option<bool>;
}

pub struct SupplierFinder {
    dht: DhtNode,
    identities: Arc<IdentityCache>,
    connector: Arc<dyn SupplierConnector>,
    me: IdUrl,
    candidates: Mutex<VecDeque<IdUrl>>,
}

impl SupplierFinder {
    pub fn new(
        dht: DhtNode,
        identities: Arc<IdentityCache>,
        connector: Arc<dyn SupplierConnector>,
        me: IdUrl,
    ) -> Self {
        Self {
            dht,
            identities,
            connector,
            me,
            candidates: Mutex::new(VecDeque::new()),
        }
    }

    /// Try `idurl` before any random node
    pub fn add_candidate(&self, idurl: IdUrl) {
        let mut candidates = self.candidates.lock().unwrap_or_else(|e| e.into_inner());
        if !candidates.contains(&idurl) {
            candidates.push_front(idurl);
        }
    }

    fn pop_candidate(&self, exclude: &[IdUrl]) -> Option<IdUrl> {
        let mut candidates = self.candidates.lock().unwrap_or_else(|e| e.into_inner());
        while let Some(candidate) = candidates.pop_front() {
            if !exclude.contains(&candidate) && candidate != self.me {
                return Some(candidate);
            }
        }
        None
    }

    /// IDURL of a random node in the suppliers layer
    async fn random_user(&self, exclude: &[IdUrl]) -> Result<Option<IdUrl>, FinderError> {
        let mut contacts = self.dht.find_node(DhtId::random(), LAYER_SUPPLIERS).await?;
        contacts.shuffle(&mut rand::thread_rng());
        for contact in contacts.iter().filter(|c| c.id != self.dht.id()) {
            let value = match self.dht.request(contact, NODE_DATA_IDURL, LAYER_SUPPLIERS).await {
                Ok(value) => value,
                Err(e) => {
                    debug!("Node {} did not answer: {}", contact.addr, e);
                    continue;
                }
            };
            let Some(text) = value.as_str().filter(|t| !t.is_empty()) else {
                continue;
            };
            let idurl = IdUrl::new(text);
            if idurl == self.me || exclude.contains(&idurl) {
                debug!("Skip {}, already a supplier", idurl);
                continue;
            }
            return Ok(Some(idurl));
        }
        Ok(None)
    }

    /// Find and connect one new supplier that is not in `exclude`
    pub async fn find(&self, exclude: &[IdUrl], request: &HireRequest) -> Result<IdUrl, FinderError> {
        for attempt in 1..=MAX_FINDER_ATTEMPTS {
            let candidate = match self.pop_candidate(exclude) {
                Some(candidate) => {
                    info!("Trying listed candidate {}", candidate);
                    Some(candidate)
                }
                None => self.random_user(exclude).await?,
            };
            let Some(candidate) = candidate else {
                warn!("Users not found, attempt {}", attempt);
                continue;
            };
            if let Err(e) = self.identities.immediately_caching(&candidate).await {
                warn!("Failed caching identity of {}: {}", candidate, e);
                continue;
            }
            match self.connector.connect(&candidate, request).await {
                SupplierState::Connected => {
                    info!(
                        "Hired {} at position {} of {}",
                        candidate, request.family_position, request.ecc_map
                    );
                    return Ok(candidate);
                }
                state => {
                    debug!("Candidate {} answered {:?}, attempt {}", candidate, state, attempt);
                }
            }
        }
        Err(FinderError::SearchFailed(MAX_FINDER_ATTEMPTS))
    }
}
