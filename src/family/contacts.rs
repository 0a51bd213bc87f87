//! Answers to contacts packets addressed to a family member

use tracing::{debug, info, warn};

use super::info::{position_in, FamilyInfo};
use super::merge::MergeContext;
use crate::identity::IdUrl;
use crate::network::SignalResponse;
use crate::storage::CustomerMeta;

/// Answer to a packet plus the side effects the coordinator must apply
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub response: SignalResponse,
    /// Queue a `family-refresh` request
    pub refresh: bool,
    /// Customer meta info to persist
    pub meta: Option<CustomerMeta>,
}

impl Verdict {
    fn ack() -> Self {
        Self {
            response: SignalResponse::Ack,
            refresh: false,
            meta: None,
        }
    }

    fn fail(reason: &str, my_info: &FamilyInfo) -> Self {
        Self {
            response: SignalResponse::fail_with_view(reason, my_info.view()),
            refresh: false,
            meta: None,
        }
    }
}

impl MergeContext<'_> {
    /// Review a transaction another supplier of the same customer proposes
    pub fn on_suppliers_list(
        &self,
        my_info: &mut Option<FamilyInfo>,
        ecc_map: Option<String>,
        suppliers: Vec<IdUrl>,
        revision: u64,
    ) -> Verdict {
        let Some(mine) = my_info.as_ref() else {
            debug!("Family of {} is not known yet, accepting review", self.customer);
            return Verdict::ack();
        };
        if revision >= mine.revision {
            let (fresher, meta) = self.revision_from_another_supplier(revision, suppliers, ecc_map);
            info!(
                "Another supplier has a fresher revision {} of {}, refreshing",
                revision, self.customer
            );
            *my_info = Some(fresher);
            return Verdict {
                response: SignalResponse::Ack,
                refresh: true,
                meta,
            };
        }
        let Some(proposed) = position_in(&suppliers, self.me) else {
            warn!("Another supplier is trying to remove me from the family of {}", self.customer);
            return Verdict::fail("my IDURL is missing from the proposed family", mine);
        };
        let Some(known) = mine.position_of(self.me) else {
            warn!("Another supplier is trying to add me to the family of {}", self.customer);
            return Verdict::fail("my position in the family is unknown", mine);
        };
        if proposed != known {
            warn!(
                "Another supplier is trying to move me from {} to {} in the family of {}",
                known, proposed, self.customer
            );
            return Verdict::fail("my IDURL is at another position", mine);
        }
        debug!("Review of {} is correct, refreshing", self.customer);
        Verdict {
            response: SignalResponse::Ack,
            refresh: true,
            meta: None,
        }
    }

    /// The customer tells me which slot of its family I hold
    pub fn on_supplier_position(
        &self,
        supplier: &IdUrl,
        ecc_map: String,
        position: usize,
        family_snapshot: Vec<IdUrl>,
    ) -> Verdict {
        if supplier != self.me {
            return Verdict {
                response: SignalResponse::fail(
                    "contacts packet with supplier position not addressed to me",
                ),
                refresh: false,
                meta: None,
            };
        }
        debug!(
            "Customer {} placed me at position {} of {}",
            self.customer, position, ecc_map
        );
        Verdict {
            response: SignalResponse::Ack,
            refresh: false,
            meta: Some(CustomerMeta {
                ecc_map: Some(ecc_map),
                position: Some(position),
                family_snapshot,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "http://id.net/a.xml";
    const B: &str = "http://id.net/b.xml";
    const CAROL: &str = "http://id.net/carol.xml";

    fn ids(list: &[&str]) -> Vec<IdUrl> {
        list.iter().map(|s| IdUrl::new(*s)).collect()
    }

    fn mine(revision: u64, suppliers: &[&str]) -> Option<FamilyInfo> {
        Some(FamilyInfo {
            revision,
            publisher_idurl: None,
            suppliers: ids(suppliers),
            ecc_map: Some("ecc/4x4".to_string()),
            customer_idurl: IdUrl::new(CAROL),
        })
    }

    #[test]
    fn test_unknown_family_acks() {
        let (me, customer) = (IdUrl::new(A), IdUrl::new(CAROL));
        let ctx = MergeContext { me: &me, customer: &customer, meta: None };
        let verdict = ctx.on_suppliers_list(&mut None, None, ids(&[B]), 1);
        assert_eq!(verdict, Verdict::ack());
    }

    #[test]
    fn test_fresher_revision_adopted() {
        let (me, customer) = (IdUrl::new(A), IdUrl::new(CAROL));
        let ctx = MergeContext { me: &me, customer: &customer, meta: None };
        let mut my_info = mine(1, &[A, "", "", ""]);
        let verdict = ctx.on_suppliers_list(
            &mut my_info,
            Some("ecc/4x4".to_string()),
            ids(&[A, "", B, ""]),
            2,
        );
        assert!(verdict.response.is_ack());
        assert!(verdict.refresh);
        let updated = my_info.unwrap();
        assert_eq!(updated.revision, 2);
        assert_eq!(updated.suppliers, ids(&[A, "", B, ""]));
    }

    #[test]
    fn test_stale_list_that_drops_me_fails() {
        let (me, customer) = (IdUrl::new(A), IdUrl::new(CAROL));
        let ctx = MergeContext { me: &me, customer: &customer, meta: None };
        let mut my_info = mine(5, &[A, "", B, ""]);
        let verdict = ctx.on_suppliers_list(&mut my_info, None, ids(&["", "", B, ""]), 4);
        match verdict.response {
            SignalResponse::Fail { view: Some(view), .. } => {
                assert_eq!(view.revision, 5);
                assert_eq!(view.suppliers, ids(&[A, "", B, ""]));
            }
            other => panic!("expected fail, got {:?}", other),
        }
        assert!(!verdict.refresh);
        assert_eq!(my_info.unwrap().revision, 5);
    }

    #[test]
    fn test_stale_list_that_moves_me_fails() {
        let (me, customer) = (IdUrl::new(A), IdUrl::new(CAROL));
        let ctx = MergeContext { me: &me, customer: &customer, meta: None };
        let mut my_info = mine(5, &[A, "", B, ""]);
        let verdict = ctx.on_suppliers_list(&mut my_info, None, ids(&["", A, B, ""]), 4);
        assert!(!verdict.response.is_ack());

        let verdict = ctx.on_suppliers_list(&mut my_info, None, ids(&[A, "", "", ""]), 4);
        assert!(verdict.response.is_ack());
        assert!(verdict.refresh);
    }

    #[test]
    fn test_supplier_position() {
        let (me, customer) = (IdUrl::new(A), IdUrl::new(CAROL));
        let ctx = MergeContext { me: &me, customer: &customer, meta: None };
        let verdict = ctx.on_supplier_position(&IdUrl::new(B), "ecc/4x4".to_string(), 1, vec![]);
        assert!(!verdict.response.is_ack());
        assert!(verdict.meta.is_none());

        let verdict = ctx.on_supplier_position(&me, "ecc/4x4".to_string(), 1, ids(&[B, ""]));
        assert!(verdict.response.is_ack());
        let meta = verdict.meta.unwrap();
        assert_eq!(meta.position, Some(1));
        assert_eq!(meta.ecc_map.as_deref(), Some("ecc/4x4"));
        assert_eq!(meta.family_snapshot, ids(&[B, ""]));
    }
}
