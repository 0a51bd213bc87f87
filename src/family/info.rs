//! Family state model

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ecc::{ecc_suppliers, fit_to_size};
use crate::identity::IdUrl;
use crate::network::PeerView;
use crate::relations::CustomerSuppliers;

/// Coordinator states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FamilyState {
    AtStartup,
    Disconnected,
    DhtRead,
    Suppliers,
    DhtWrite,
    Connected,
    Closed,
}

impl FamilyState {
    /// States in which the next queued request may start
    pub fn is_stable(&self) -> bool {
        matches!(self, FamilyState::Disconnected | FamilyState::Connected)
    }

    pub fn name(&self) -> &'static str {
        match self {
            FamilyState::AtStartup => "AT_STARTUP",
            FamilyState::Disconnected => "DISCONNECTED",
            FamilyState::DhtRead => "DHT_READ",
            FamilyState::Suppliers => "SUPPLIERS",
            FamilyState::DhtWrite => "DHT_WRITE",
            FamilyState::Connected => "CONNECTED",
            FamilyState::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for FamilyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A change request for the family, queued by the coordinator
#[derive(Debug, Clone, PartialEq)]
pub enum FamilyRequest {
    Join {
        ecc_map: Option<String>,
        /// Slot to take; the first empty one when absent
        position: Option<usize>,
        family_snapshot: Vec<IdUrl>,
    },
    Leave {
        ecc_map: Option<String>,
    },
    Refresh,
}

impl FamilyRequest {
    pub fn command(&self) -> &'static str {
        match self {
            FamilyRequest::Join { .. } => "family-join",
            FamilyRequest::Leave { .. } => "family-leave",
            FamilyRequest::Refresh => "family-refresh",
        }
    }

    pub fn is_leave(&self) -> bool {
        matches!(self, FamilyRequest::Leave { .. })
    }

    pub fn ecc_map(&self) -> Option<&str> {
        match self {
            FamilyRequest::Join { ecc_map, .. } | FamilyRequest::Leave { ecc_map } => {
                ecc_map.as_deref().filter(|e| !e.is_empty())
            }
            FamilyRequest::Refresh => None,
        }
    }

    pub fn family_snapshot(&self) -> &[IdUrl] {
        match self {
            FamilyRequest::Join {
                family_snapshot, ..
            } => family_snapshot,
            _ => &[],
        }
    }
}

/// One revision of a customer's family
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FamilyInfo {
    pub revision: u64,
    pub publisher_idurl: Option<IdUrl>,
    pub suppliers: Vec<IdUrl>,
    pub ecc_map: Option<String>,
    pub customer_idurl: IdUrl,
}

impl FamilyInfo {
    /// Slot held by `idurl`, vacant slots never match
    pub fn position_of(&self, idurl: &IdUrl) -> Option<usize> {
        position_in(&self.suppliers, idurl)
    }

    pub fn contains(&self, idurl: &IdUrl) -> bool {
        self.position_of(idurl).is_some()
    }

    /// Supplier count implied by the ECC map
    pub fn expected_size(&self) -> Option<usize> {
        self.ecc_map.as_deref().and_then(ecc_suppliers)
    }

    /// Pad or truncate the suppliers list to the ECC map size, if known
    pub fn fit_to_ecc(&mut self) {
        if let Some(size) = self.expected_size() {
            fit_to_size(&mut self.suppliers, size);
        }
    }

    pub fn view(&self) -> PeerView {
        PeerView {
            revision: self.revision,
            ecc_map: self.ecc_map.clone(),
            suppliers: self.suppliers.clone(),
        }
    }
}

impl From<CustomerSuppliers> for FamilyInfo {
    fn from(family: CustomerSuppliers) -> Self {
        Self {
            revision: family.revision,
            publisher_idurl: family.publisher_idurl,
            suppliers: family.suppliers,
            ecc_map: Some(family.ecc_map).filter(|e| !e.is_empty()),
            customer_idurl: family.customer_idurl,
        }
    }
}

pub(crate) fn position_in(list: &[IdUrl], idurl: &IdUrl) -> Option<usize> {
    if idurl.is_empty() {
        return None;
    }
    list.iter().position(|s| !s.is_empty() && s == idurl)
}
