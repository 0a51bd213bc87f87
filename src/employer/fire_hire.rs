//! Dismissal policy
//!
//! Looks at the connection and online state of every supplier of this
//! customer and picks whom to replace. The checks run in a fixed order and
//! most of them end the decision early with nobody dismissed.

use tracing::{debug, info, warn};

use super::finder::SupplierState;
use crate::ecc::EccMap;
use crate::identity::IdUrl;

/// What the employer knows about one family slot
#[derive(Debug, Clone, PartialEq)]
pub struct SlotStatus {
    /// Empty when the slot is vacant
    pub idurl: IdUrl,
    pub state: Option<SupplierState>,
    /// `None` while the contact status is still being checked
    pub online: Option<bool>,
}

impl SlotStatus {
    pub fn vacant() -> Self {
        Self {
            idurl: IdUrl::empty(),
            state: None,
            online: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Nothing to do this cycle, with the reason
    Keep(&'static str),
    /// Fired on request from outside the policy
    Fire(Vec<IdUrl>),
    /// Holding slots beyond the desired family size
    Redundant(Vec<IdUrl>),
    /// One bad supplier to replace
    Replace(IdUrl),
}

impl Decision {
    pub fn dismissed(&self) -> &[IdUrl] {
        match self {
            Decision::Keep(_) => &[],
            Decision::Fire(list) | Decision::Redundant(list) => list,
            Decision::Replace(idurl) => std::slice::from_ref(idurl),
        }
    }
}

pub struct DismissalPolicy {
    pub desired: usize,
    pub ecc_map: EccMap,
    pub replace_critically_offline: bool,
}

impl DismissalPolicy {
    pub fn decide(&self, slots: &[SlotStatus], fire_list: &[IdUrl]) -> Decision {
        let fired: Vec<IdUrl> = fire_list
            .iter()
            .filter(|idurl| slots.iter().any(|s| s.idurl == **idurl))
            .cloned()
            .collect();
        if !fired.is_empty() {
            warn!("Going to fire {} suppliers on external request", fired.len());
            return Decision::Fire(fired);
        }

        if slots.iter().any(|s| s.idurl.is_empty()) {
            return Decision::Keep("found empty supplier");
        }

        let mut potentially_fired: Vec<IdUrl> = Vec::new();
        let mut connected = 0;
        let mut disconnected = 0;
        let mut online = 0;
        let mut offline: Vec<IdUrl> = Vec::new();
        let mut checking = 0;
        for slot in slots {
            match slot.state {
                Some(SupplierState::NoService) => {
                    warn!("Found supplier {} without service", slot.idurl);
                    disconnected += 1;
                    potentially_fired.push(slot.idurl.clone());
                }
                Some(SupplierState::Connected) => connected += 1,
                Some(SupplierState::Disconnected) | Some(SupplierState::Refuse) => {
                    disconnected += 1
                }
                None => {
                    debug!("No connector state for supplier {}", slot.idurl);
                }
            }
            match slot.online {
                Some(false) => offline.push(slot.idurl.clone()),
                Some(true) => online += 1,
                None => checking += 1,
            }
        }

        let redundant: Vec<IdUrl> = slots
            .iter()
            .skip(self.desired)
            .map(|s| s.idurl.clone())
            .collect();
        for (position, idurl) in redundant.iter().enumerate() {
            warn!("Found redundant supplier {} at position {}", idurl, position + self.desired);
        }

        if connected == 0 || online == 0 {
            return Decision::Keep("no online suppliers at the moment");
        }
        if checking > 0 {
            return Decision::Keep("still waiting response from some of suppliers");
        }
        if !redundant.is_empty() {
            info!("Will remove {} redundant suppliers", redundant.len());
            return Decision::Redundant(redundant);
        }
        if disconnected == 0 {
            return Decision::Keep("no offline suppliers at the moment");
        }
        if offline.len() + online != self.desired {
            return Decision::Keep("offline and online suppliers do not sum up to desired count");
        }
        if offline.len() > self.ecc_map.correctable_errors() {
            warn!(
                "Too many offline suppliers: {} > {}",
                offline.len(),
                self.ecc_map.correctable_errors()
            );
            return Decision::Keep("too many offline suppliers at the moment");
        }
        if self.replace_critically_offline && offline.len() >= self.ecc_map.fire_hire_errors() {
            if let Some(dead) = offline.first() {
                warn!(
                    "Found critically offline supplier {}, limit is {}",
                    dead,
                    self.ecc_map.fire_hire_errors()
                );
                if !potentially_fired.contains(dead) {
                    potentially_fired.push(dead.clone());
                }
            }
        }
        match potentially_fired.into_iter().next() {
            Some(idurl) => {
                info!("Will replace supplier {}", idurl);
                Decision::Replace(idurl)
            }
            None => Decision::Keep("found no bad suppliers"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "http://id.net/a.xml";
    const B: &str = "http://id.net/b.xml";
    const C: &str = "http://id.net/c.xml";
    const D: &str = "http://id.net/d.xml";

    fn slot(idurl: &str, state: SupplierState, online: Option<bool>) -> SlotStatus {
        SlotStatus {
            idurl: IdUrl::new(idurl),
            state: Some(state),
            online,
        }
    }

    fn policy(desired: usize, replace: bool) -> DismissalPolicy {
        DismissalPolicy {
            desired,
            ecc_map: EccMap::for_suppliers(desired).unwrap(),
            replace_critically_offline: replace,
        }
    }

    fn healthy(idurl: &str) -> SlotStatus {
        slot(idurl, SupplierState::Connected, Some(true))
    }

    #[test]
    fn test_fire_list_first() {
        let slots = vec![healthy(A), SlotStatus::vacant()];
        let decision = policy(2, true).decide(&slots, &[IdUrl::new(A), IdUrl::new(C)]);
        assert_eq!(decision, Decision::Fire(vec![IdUrl::new(A)]));
    }

    #[test]
    fn test_skip_with_empty_slot() {
        let slots = vec![slot(A, SupplierState::NoService, Some(true)), SlotStatus::vacant()];
        assert!(matches!(policy(2, true).decide(&slots, &[]), Decision::Keep(_)));
    }

    #[test]
    fn test_redundant_suppliers() {
        let slots = vec![healthy(A), healthy(B), healthy(C), healthy(D)];
        assert_eq!(
            policy(2, true).decide(&slots, &[]),
            Decision::Redundant(vec![IdUrl::new(C), IdUrl::new(D)])
        );
    }

    #[test]
    fn test_no_service_replaced_one_at_a_time() {
        let slots = vec![
            healthy(A),
            slot(B, SupplierState::NoService, Some(true)),
            slot(C, SupplierState::NoService, Some(true)),
            healthy(D),
        ];
        let decision = policy(4, false).decide(&slots, &[]);
        assert_eq!(decision, Decision::Replace(IdUrl::new(B)));
        assert_eq!(decision.dismissed(), &[IdUrl::new(B)]);
    }

    #[test]
    fn test_skip_conditions() {
        let all_offline = vec![
            slot(A, SupplierState::Disconnected, Some(false)),
            slot(B, SupplierState::Disconnected, Some(false)),
        ];
        assert!(matches!(policy(2, true).decide(&all_offline, &[]), Decision::Keep(_)));

        let checking = vec![healthy(A), slot(B, SupplierState::Disconnected, None)];
        assert_eq!(
            policy(2, true).decide(&checking, &[]),
            Decision::Keep("still waiting response from some of suppliers")
        );

        let all_good = vec![healthy(A), healthy(B), healthy(C), healthy(D)];
        assert_eq!(
            policy(4, true).decide(&all_good, &[]),
            Decision::Keep("no offline suppliers at the moment")
        );

        // ecc/4x4 tolerates two lost suppliers
        let three_offline = vec![
            healthy(A),
            slot(B, SupplierState::Disconnected, Some(false)),
            slot(C, SupplierState::Disconnected, Some(false)),
            slot(D, SupplierState::Disconnected, Some(false)),
        ];
        assert_eq!(
            policy(4, true).decide(&three_offline, &[]),
            Decision::Keep("too many offline suppliers at the moment")
        );
    }

    #[test]
    fn test_critically_offline() {
        let slots = vec![
            healthy(A),
            slot(B, SupplierState::Disconnected, Some(false)),
            healthy(C),
            healthy(D),
        ];
        assert_eq!(
            policy(4, true).decide(&slots, &[]),
            Decision::Replace(IdUrl::new(B))
        );
        assert_eq!(
            policy(4, false).decide(&slots, &[]),
            Decision::Keep("found no bad suppliers")
        );
    }
}
