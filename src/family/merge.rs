//! Family merge rules
//!
//! Turns the family read from the DHT, the family this supplier committed
//! last and one pending request into the next transaction. Nothing here
//! touches the network; the coordinator feeds in what it has read and
//! decides what to do with the result.

use tracing::{debug, error, info, warn};

use super::info::{position_in, FamilyInfo, FamilyRequest};
use crate::ecc::{ecc_suppliers, fit_to_size, is_valid_ecc};
use crate::identity::IdUrl;
use crate::network::PeerView;
use crate::storage::CustomerMeta;

/// Who merges, for which customer, and what the customer told us
pub struct MergeContext<'a> {
    pub me: &'a IdUrl,
    pub customer: &'a IdUrl,
    pub meta: Option<&'a CustomerMeta>,
}

fn check_family(info: &FamilyInfo) -> Result<(), &'static str> {
    if info.revision < 1 {
        return Err("invalid revision");
    }
    if info.suppliers.is_empty() {
        return Err("family must include some suppliers");
    }
    if let Some(ecc_map) = &info.ecc_map {
        if !is_valid_ecc(ecc_map) {
            return Err("invalid ecc_map name");
        }
    }
    Ok(())
}

/// Latest of the two revisions, 0 when neither is known
pub fn detect_latest_revision(dht_info: Option<&FamilyInfo>, my_info: Option<&FamilyInfo>) -> u64 {
    let my_revision = my_info.map(|i| i.revision).unwrap_or(0);
    let dht_revision = dht_info.map(|i| i.revision).unwrap_or(0);
    if my_revision > dht_revision {
        info!(
            my_revision,
            dht_revision, "Known family info is more fresh than the DHT record"
        );
        if my_revision > dht_revision + 1 {
            warn!("Switching revision too far, normally it grows by one on every change");
        }
        return my_revision;
    }
    dht_revision
}

/// Take the slot `peer` claims in its own view, if it is vacant here
pub fn solve_conflict(mut transaction: FamilyInfo, peer: &IdUrl, view: &PeerView) -> Option<FamilyInfo> {
    let Some(position) = position_in(&view.suppliers, peer) else {
        error!("Uncooperative supplier {} raised a conflict without claiming a slot", peer);
        return None;
    };
    if position >= transaction.suppliers.len() {
        warn!(
            "Position {} of {} is beyond the family size, conflict not solved",
            position, peer
        );
        return None;
    }
    if !transaction.suppliers[position].is_empty() {
        warn!(
            "Position {} claimed by {} is taken, conflict not solved",
            position, peer
        );
        return None;
    }
    transaction.suppliers[position] = peer.clone();
    info!("Solved family conflict: {} keeps position {}", peer, position);
    Some(transaction)
}

impl<'a> MergeContext<'a> {
    fn meta_ecc(&self) -> Option<String> {
        self.meta
            .and_then(|m| m.ecc_map.clone())
            .filter(|e| !e.is_empty())
    }

    fn meta_position(&self) -> Option<usize> {
        self.meta.and_then(|m| m.position)
    }

    /// DHT record as usable input, or `None` to treat it as absent
    pub fn validate_dht_info(&self, info: Option<&FamilyInfo>) -> Option<FamilyInfo> {
        let info = info?;
        if let Err(reason) = check_family(info) {
            warn!("Skip invalid DHT info of {}: {}", self.customer, reason);
            return None;
        }
        Some(info.clone())
    }

    /// Own committed info as usable input
    pub fn validate_my_info(&self, info: Option<&FamilyInfo>) -> Option<FamilyInfo> {
        let info = info?;
        if let Err(reason) = check_family(info) {
            debug!("My info of {} is not usable: {}", self.customer, reason);
            return None;
        }
        if info.customer_idurl != *self.customer {
            warn!("My info names customer {} instead of {}", info.customer_idurl, self.customer);
            return None;
        }
        Some(info.clone())
    }

    /// Revision 0 built from the request, published by me
    pub fn first_revision(&self, request: &FamilyRequest) -> FamilyInfo {
        FamilyInfo {
            revision: 0,
            publisher_idurl: Some(self.me.clone()),
            suppliers: request.family_snapshot().to_vec(),
            ecc_map: request.ecc_map().map(str::to_string),
            customer_idurl: self.customer.clone(),
        }
    }

    /// What the family probably looks like according to the customer's meta info
    pub fn possible_revision(&self, latest_revision: u64) -> FamilyInfo {
        let mut suppliers = self
            .meta
            .map(|m| m.family_snapshot.clone())
            .unwrap_or_default();
        if let Some(position) = self.meta_position() {
            if position_in(&suppliers, self.me).is_none() && position < suppliers.len() {
                suppliers[position] = self.me.clone();
            }
        }
        FamilyInfo {
            revision: latest_revision,
            publisher_idurl: Some(self.me.clone()),
            suppliers,
            ecc_map: self.meta_ecc(),
            customer_idurl: self.customer.clone(),
        }
    }

    /// My info derived from a fresher list another supplier sent
    ///
    /// When the customer gave me a position, I am placed there and the
    /// returned meta info should be persisted.
    pub fn revision_from_another_supplier(
        &self,
        revision: u64,
        mut suppliers: Vec<IdUrl>,
        ecc_map: Option<String>,
    ) -> (FamilyInfo, Option<CustomerMeta>) {
        let mut meta = None;
        if let Some(position) = self.meta_position() {
            if position < suppliers.len() {
                suppliers[position] = self.me.clone();
            } else {
                warn!(
                    "My position {} is beyond the list of {} suppliers sent for {}",
                    position,
                    suppliers.len(),
                    self.customer
                );
            }
            meta = Some(CustomerMeta {
                ecc_map: ecc_map.clone(),
                position: Some(position),
                family_snapshot: suppliers.clone(),
            });
        }
        let info = FamilyInfo {
            revision,
            publisher_idurl: Some(self.me.clone()),
            suppliers,
            ecc_map,
            customer_idurl: self.customer.clone(),
        };
        (info, meta)
    }

    /// Pick the side holding `latest` and size-correct it
    pub fn merge_revisions(
        &self,
        dht_info: Option<FamilyInfo>,
        my_info: Option<FamilyInfo>,
        latest: u64,
    ) -> Option<FamilyInfo> {
        let merged = match dht_info {
            None => my_info,
            Some(dht) if dht.revision == latest => match my_info {
                Some(my) if my.revision > dht.revision => Some(my),
                _ => Some(dht),
            },
            Some(_) => my_info,
        };
        let mut merged = merged?;
        if merged.ecc_map.is_none() {
            let known = self.meta_ecc();
            warn!("Unknown ecc_map of {}, populating known value {:?}", self.customer, known);
            merged.ecc_map = known;
        }
        merged.fit_to_ecc();
        if merged.revision != latest {
            info!("Switching known revision {} to the latest {}", merged.revision, latest);
        }
        merged.revision = latest;
        Some(merged)
    }

    fn adopt_request_ecc(&self, merged: &mut FamilyInfo, ecc_map: Option<&str>, command: &str) {
        let Some(requested) = ecc_map else {
            return;
        };
        match merged.ecc_map.as_deref() {
            Some(current) if current != requested => info!(
                "From {} request detected ecc_map change {} -> {} for {}",
                command, current, requested, self.customer
            ),
            None => info!(
                "From {} request ecc_map was set to {} for the first time for {}",
                command, requested, self.customer
            ),
            _ => {}
        }
        merged.ecc_map = Some(requested.to_string());
    }

    /// Apply a `family-join` of this supplier
    pub fn join(
        &self,
        mut merged: FamilyInfo,
        ecc_map: Option<&str>,
        position: Option<usize>,
        family_snapshot: &[IdUrl],
    ) -> Option<FamilyInfo> {
        if let (Some(size), Some(position)) = (ecc_map.and_then(ecc_suppliers), position) {
            if position >= size {
                warn!(
                    "Join request is not valid, position {} is out of {} slots of {:?}",
                    position, size, ecc_map
                );
                return None;
            }
        }
        self.adopt_request_ecc(&mut merged, ecc_map, "family-join");
        if merged.ecc_map.is_none() {
            if let Some(known) = self.meta_ecc() {
                warn!("Unknown ecc_map, populating known value from customer meta info: {}", known);
                merged.ecc_map = Some(known);
            }
        }
        let Some(expected) = merged.expected_size() else {
            warn!("Still no ecc_map for {} from the DHT or the request", self.customer);
            return None;
        };
        fit_to_size(&mut merged.suppliers, expected);

        // the slot the customer assigned, unless the request names one
        let position = position.or_else(|| self.meta_position());
        let existing = merged.position_of(self.me);
        if let Some(position) = position {
            if position >= expected {
                warn!("Join request is not valid, position {} is out of {} slots", position, expected);
                return None;
            }
            if let Some(existing) = existing.filter(|e| *e != position) {
                merged.suppliers[existing] = IdUrl::empty();
                debug!("Moving myself from position {} to {}", existing, position);
            }
            if merged.suppliers[position] != *self.me {
                if !merged.suppliers[position].is_empty() {
                    warn!(
                        "Overwriting supplier {} with my IDURL at position {} in family of {}",
                        merged.suppliers[position], position, self.customer
                    );
                }
                merged.suppliers[position] = self.me.clone();
            }
        }

        if !merged.contains(self.me) {
            let Some(vacant) = merged.suppliers.iter().position(IdUrl::is_empty) else {
                warn!("Family of {} has no vacant slot for me", self.customer);
                return None;
            };
            merged.suppliers[vacant] = self.me.clone();
            debug!("Placed myself at first vacant position {}", vacant);
        }

        for (slot, candidate) in merged.suppliers.iter_mut().zip(family_snapshot) {
            if slot.is_empty() && !candidate.is_empty() {
                debug!("Populating vacant slot with {} from the snapshot", candidate);
                *slot = candidate.clone();
            }
        }
        Some(merged)
    }

    /// Apply a `family-leave` of this supplier
    pub fn leave(&self, mut merged: FamilyInfo, ecc_map: Option<&str>) -> Option<FamilyInfo> {
        let existing = merged.position_of(self.me);
        self.adopt_request_ecc(&mut merged, ecc_map, "family-leave");
        let Some(expected) = merged.expected_size() else {
            warn!("Still no ecc_map for {} from the DHT or the request", self.customer);
            return None;
        };
        fit_to_size(&mut merged.suppliers, expected);
        match existing {
            None => debug!("I am not in the family of {}, probably already left", self.customer),
            Some(position) if position < expected => {
                merged.suppliers[position] = IdUrl::empty();
                info!("Erasing myself from position {} in family of {}", position, self.customer);
            }
            Some(_) => {}
        }
        Some(merged)
    }

    /// Re-assert my own position as I know it
    pub fn refresh(&self, mut merged: FamilyInfo, my_info: &mut Option<FamilyInfo>) -> Option<FamilyInfo> {
        let mine = my_info.get_or_insert_with(|| {
            let possible = self.possible_revision(merged.revision);
            warn!("Refresh will use possible info from customer meta: {:?}", possible);
            possible
        });
        if mine.revision > merged.revision {
            info!("Refresh overwrites the DHT record, my revision {} is higher", mine.revision);
            return Some(mine.clone());
        }
        let Some(my_position) = mine.position_of(self.me) else {
            warn!("Refresh failed, my own position in family of {} is unknown", self.customer);
            return None;
        };
        if let Some(expected) = mine.expected_size() {
            if my_position >= expected {
                warn!("Refresh failed, my position {} is out of {} slots", my_position, expected);
                return None;
            }
            if merged.suppliers.len() != expected {
                warn!("Unexpected number of suppliers while refreshing family of {}", self.customer);
                fit_to_size(&mut merged.suppliers, expected);
            }
        }
        if my_position >= merged.suppliers.len() {
            warn!("Refresh failed, my position {} is beyond the family size", my_position);
            return None;
        }

        match merged.position_of(self.me) {
            None => {
                if !merged.suppliers[my_position].is_empty() {
                    warn!(
                        "Overwriting supplier {} with my IDURL at position {} in family of {}",
                        merged.suppliers[my_position], my_position, self.customer
                    );
                }
                merged.suppliers[my_position] = self.me.clone();
            }
            Some(existing) if existing != my_position => {
                merged.suppliers[existing] = IdUrl::empty();
                merged.suppliers[my_position] = self.me.clone();
                debug!("Moving myself from position {} to {}", existing, my_position);
            }
            Some(_) => {}
        }
        Some(merged)
    }

    pub fn process_request(
        &self,
        merged: FamilyInfo,
        request: &FamilyRequest,
        my_info: &mut Option<FamilyInfo>,
    ) -> Option<FamilyInfo> {
        match request {
            FamilyRequest::Join {
                position,
                family_snapshot,
                ..
            } => self.join(merged, request.ecc_map(), *position, family_snapshot),
            FamilyRequest::Leave { .. } => self.leave(merged, request.ecc_map()),
            FamilyRequest::Refresh => self.refresh(merged, my_info),
        }
    }

    /// Bump the revision and sign as publisher, unless nothing changed
    pub fn increment_revision(
        &self,
        mut transaction: FamilyInfo,
        dht_info: Option<&FamilyInfo>,
        leaving: bool,
    ) -> Option<FamilyInfo> {
        if transaction.customer_idurl.to_text() != self.customer.to_text() {
            transaction.customer_idurl = self.customer.clone();
            transaction.revision += 1;
            transaction.publisher_idurl = Some(self.me.clone());
            info!(
                "Incremented family revision to {} after customer {} rotated",
                transaction.revision, self.customer
            );
            return Some(transaction);
        }
        if let Some(dht) = dht_info {
            if dht.suppliers == transaction.suppliers && dht.ecc_map == transaction.ecc_map {
                if !leaving {
                    debug!("No changes in family of {}, skip transaction", self.customer);
                    return None;
                }
                debug!("Re-publishing latest DHT info while leaving");
            }
        }
        transaction.revision += 1;
        transaction.publisher_idurl = Some(self.me.clone());
        Some(transaction)
    }

    /// Build the next transaction, `None` when there is nothing to publish
    pub fn rebuild(
        &self,
        dht_info: Option<&FamilyInfo>,
        my_info: &mut Option<FamilyInfo>,
        request: &FamilyRequest,
    ) -> Option<FamilyInfo> {
        let dht_valid = self.validate_dht_info(dht_info);
        let my_valid = self.validate_my_info(my_info.as_ref());
        let latest = detect_latest_revision(dht_valid.as_ref(), my_valid.as_ref());
        let merged = if latest > 0 {
            self.merge_revisions(dht_valid, my_valid, latest)
        } else {
            None
        };
        let merged = merged.unwrap_or_else(|| self.first_revision(request));
        let Some(possible) = self.process_request(merged, request, my_info) else {
            warn!("Failed to process {} request of {}, skip transaction", request.command(), self.customer);
            return None;
        };
        self.increment_revision(possible, dht_info, request.is_leave())
    }

    /// Whether the DHT record already holds me where I believe I am
    pub fn is_my_position_ok(
        &self,
        dht_info: Option<&FamilyInfo>,
        my_info: Option<&FamilyInfo>,
        leaving: bool,
    ) -> bool {
        let Some(dht) = self.validate_dht_info(dht_info) else {
            return false;
        };
        if leaving && !dht.contains(self.me) {
            return true;
        }
        let Some(my) = self.validate_my_info(my_info) else {
            return false;
        };
        if detect_latest_revision(Some(&dht), Some(&my)) == 0 {
            return false;
        }
        match (my.position_of(self.me), dht.position_of(self.me)) {
            (Some(mine), Some(published)) => mine == published,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "http://id.net/a.xml";
    const B: &str = "http://id.net/b.xml";
    const X: &str = "http://id.net/x.xml";
    const CAROL: &str = "http://id.net/carol.xml";

    fn ids(list: &[&str]) -> Vec<IdUrl> {
        list.iter().map(|s| IdUrl::new(*s)).collect()
    }

    fn family(revision: u64, suppliers: &[&str], ecc_map: &str) -> FamilyInfo {
        FamilyInfo {
            revision,
            publisher_idurl: None,
            suppliers: ids(suppliers),
            ecc_map: Some(ecc_map.to_string()),
            customer_idurl: IdUrl::new(CAROL),
        }
    }

    fn join(position: Option<usize>) -> FamilyRequest {
        FamilyRequest::Join {
            ecc_map: Some("ecc/4x4".to_string()),
            position,
            family_snapshot: vec![],
        }
    }

    #[test]
    fn test_fresh_join() {
        let (me, customer) = (IdUrl::new(A), IdUrl::new(CAROL));
        let ctx = MergeContext { me: &me, customer: &customer, meta: None };
        let mut my_info = None;

        let tx = ctx.rebuild(None, &mut my_info, &join(Some(0))).unwrap();
        assert_eq!(tx.revision, 1);
        assert_eq!(tx.publisher_idurl, Some(me.clone()));
        assert_eq!(tx.suppliers, ids(&[A, "", "", ""]));
        assert_eq!(tx.ecc_map.as_deref(), Some("ecc/4x4"));
        assert_eq!(tx.customer_idurl, customer);
    }

    #[test]
    fn test_second_supplier_join() {
        let (me, customer) = (IdUrl::new(B), IdUrl::new(CAROL));
        let ctx = MergeContext { me: &me, customer: &customer, meta: None };
        let dht = family(1, &[A, "", "", ""], "ecc/4x4");
        let mut my_info = None;

        assert!(!ctx.is_my_position_ok(Some(&dht), None, false));
        let tx = ctx.rebuild(Some(&dht), &mut my_info, &join(Some(2))).unwrap();
        assert_eq!(tx.revision, 2);
        assert_eq!(tx.suppliers, ids(&[A, "", B, ""]));
        assert_eq!(tx.publisher_idurl, Some(me));
    }

    #[test]
    fn test_join_out_of_range() {
        let (me, customer) = (IdUrl::new(B), IdUrl::new(CAROL));
        let ctx = MergeContext { me: &me, customer: &customer, meta: None };
        let dht = family(1, &[A, "", "", ""], "ecc/4x4");
        assert!(ctx.join(dht.clone(), Some("ecc/4x4"), Some(4), &[]).is_none());
        assert!(ctx.join(dht, None, Some(4), &[]).is_none());
    }

    #[test]
    fn test_join_overwrites_and_moves() {
        let (me, customer) = (IdUrl::new(X), IdUrl::new(CAROL));
        let ctx = MergeContext { me: &me, customer: &customer, meta: None };
        let merged = family(3, &[A, B, "", X], "ecc/4x4");
        let joined = ctx.join(merged, None, Some(1), &[]).unwrap();
        assert_eq!(joined.suppliers, ids(&[A, X, "", ""]));
    }

    #[test]
    fn test_join_full_family_rejected() {
        let (me, customer) = (IdUrl::new(X), IdUrl::new(CAROL));
        let ctx = MergeContext { me: &me, customer: &customer, meta: None };
        let merged = family(3, &[A, B], "ecc/2x2");
        assert!(ctx.join(merged, None, None, &[]).is_none());
    }

    #[test]
    fn test_join_fills_from_snapshot_and_meta_ecc() {
        let (me, customer) = (IdUrl::new(B), IdUrl::new(CAROL));
        let meta = CustomerMeta {
            ecc_map: Some("ecc/2x2".to_string()),
            position: Some(1),
            family_snapshot: vec![],
        };
        let ctx = MergeContext { me: &me, customer: &customer, meta: Some(&meta) };
        let mut merged = family(0, &[], "ecc/2x2");
        merged.ecc_map = None;
        let joined = ctx.join(merged, None, Some(1), &ids(&[A, X])).unwrap();
        assert_eq!(joined.ecc_map.as_deref(), Some("ecc/2x2"));
        assert_eq!(joined.suppliers, ids(&[A, B]));
    }

    #[test]
    fn test_join_without_any_ecc() {
        let (me, customer) = (IdUrl::new(B), IdUrl::new(CAROL));
        let ctx = MergeContext { me: &me, customer: &customer, meta: None };
        let request = FamilyRequest::Join { ecc_map: None, position: None, family_snapshot: vec![] };
        assert!(ctx.rebuild(None, &mut None, &request).is_none());
    }

    #[test]
    fn test_leave_clears_slot() {
        let (me, customer) = (IdUrl::new(A), IdUrl::new(CAROL));
        let ctx = MergeContext { me: &me, customer: &customer, meta: None };
        let dht = family(2, &[A, "", B, ""], "ecc/4x4");
        let mut my_info = Some(dht.clone());
        let request = FamilyRequest::Leave { ecc_map: None };

        assert!(ctx.is_my_position_ok(Some(&dht), my_info.as_ref(), true));
        let tx = ctx.rebuild(Some(&dht), &mut my_info, &request).unwrap();
        assert_eq!(tx.revision, 3);
        assert_eq!(tx.suppliers, ids(&["", "", B, ""]));
    }

    #[test]
    fn test_leave_absent_still_republishes() {
        let (me, customer) = (IdUrl::new(X), IdUrl::new(CAROL));
        let ctx = MergeContext { me: &me, customer: &customer, meta: None };
        let dht = family(2, &[A, "", B, ""], "ecc/4x4");
        assert!(ctx.is_my_position_ok(Some(&dht), None, true));

        let tx = ctx
            .rebuild(Some(&dht), &mut None, &FamilyRequest::Leave { ecc_map: None })
            .unwrap();
        assert_eq!(tx.suppliers, dht.suppliers);
        assert_eq!(tx.revision, 3);
    }

    #[test]
    fn test_refresh_without_changes_is_skipped() {
        let (me, customer) = (IdUrl::new(A), IdUrl::new(CAROL));
        let ctx = MergeContext { me: &me, customer: &customer, meta: None };
        let dht = family(2, &[A, "", B, ""], "ecc/4x4");
        let mut my_info = Some(dht.clone());
        assert!(ctx.is_my_position_ok(Some(&dht), my_info.as_ref(), false));
        assert!(ctx.rebuild(Some(&dht), &mut my_info, &FamilyRequest::Refresh).is_none());
    }

    #[test]
    fn test_refresh_restores_my_position() {
        let (me, customer) = (IdUrl::new(A), IdUrl::new(CAROL));
        let ctx = MergeContext { me: &me, customer: &customer, meta: None };
        let dht = family(3, &[X, "", B, ""], "ecc/4x4");
        let mut my_info = Some(family(2, &[A, "", B, ""], "ecc/4x4"));

        assert!(!ctx.is_my_position_ok(Some(&dht), my_info.as_ref(), false));
        let tx = ctx.rebuild(Some(&dht), &mut my_info, &FamilyRequest::Refresh).unwrap();
        assert_eq!(tx.revision, 4);
        assert_eq!(tx.suppliers, ids(&[A, "", B, ""]));
    }

    #[test]
    fn test_refresh_with_higher_own_revision_overwrites() {
        let (me, customer) = (IdUrl::new(A), IdUrl::new(CAROL));
        let ctx = MergeContext { me: &me, customer: &customer, meta: None };
        let dht = family(2, &[A, "", "", ""], "ecc/4x4");
        let mut my_info = Some(family(3, &[A, X, "", ""], "ecc/4x4"));
        let tx = ctx.rebuild(Some(&dht), &mut my_info, &FamilyRequest::Refresh).unwrap();
        assert_eq!(tx.revision, 4);
        assert_eq!(tx.suppliers, ids(&[A, X, "", ""]));
    }

    #[test]
    fn test_refresh_uses_possible_revision() {
        let (me, customer) = (IdUrl::new(B), IdUrl::new(CAROL));
        let meta = CustomerMeta {
            ecc_map: Some("ecc/2x2".to_string()),
            position: Some(1),
            family_snapshot: ids(&[A, ""]),
        };
        let ctx = MergeContext { me: &me, customer: &customer, meta: Some(&meta) };
        let dht = family(5, &[A, ""], "ecc/2x2");
        let mut my_info = None;
        let tx = ctx.rebuild(Some(&dht), &mut my_info, &FamilyRequest::Refresh).unwrap();
        assert_eq!(tx.suppliers, ids(&[A, B]));
        assert_eq!(tx.revision, 6);
        assert_eq!(my_info.unwrap().revision, 5);
    }

    #[test]
    fn test_merge_prefers_latest_side() {
        let (me, customer) = (IdUrl::new(A), IdUrl::new(CAROL));
        let ctx = MergeContext { me: &me, customer: &customer, meta: None };
        let dht = family(2, &[A, B], "ecc/2x2");
        let mine = family(3, &[A, X], "ecc/2x2");
        let latest = detect_latest_revision(Some(&dht), Some(&mine));
        assert_eq!(latest, 3);
        let merged = ctx.merge_revisions(Some(dht.clone()), Some(mine), latest).unwrap();
        assert_eq!(merged.suppliers, ids(&[A, X]));

        let stale = family(1, &[A, ""], "ecc/2x2");
        let merged = ctx.merge_revisions(Some(dht), Some(stale), 2).unwrap();
        assert_eq!(merged.suppliers, ids(&[A, B]));
    }

    #[test]
    fn test_empty_list_padded_to_ecc() {
        let (me, customer) = (IdUrl::new(A), IdUrl::new(CAROL));
        let ctx = MergeContext { me: &me, customer: &customer, meta: None };
        let mut mine = family(1, &[""], "ecc/4x4");
        mine.suppliers.clear();
        let merged = ctx.merge_revisions(None, Some(mine), 1).unwrap();
        assert_eq!(merged.suppliers.len(), 4);
        assert!(merged.suppliers.iter().all(IdUrl::is_empty));
    }

    #[test]
    fn test_invalid_inputs_dropped() {
        let (me, customer) = (IdUrl::new(A), IdUrl::new(CAROL));
        let ctx = MergeContext { me: &me, customer: &customer, meta: None };
        assert!(ctx.validate_dht_info(Some(&family(0, &[A], "ecc/2x2"))).is_none());
        assert!(ctx.validate_dht_info(Some(&family(1, &[A], "ecc/3x3"))).is_none());
        let mut other = family(1, &[A, ""], "ecc/2x2");
        other.customer_idurl = IdUrl::new("http://id.net/dave.xml");
        assert!(ctx.validate_dht_info(Some(&other)).is_some());
        assert!(ctx.validate_my_info(Some(&other)).is_none());
    }

    #[test]
    fn test_rotated_customer_bumps_revision() {
        let me = IdUrl::new(A);
        let customer = IdUrl::Rotated {
            current: "http://new.net/carol.xml".to_string(),
            history: vec![CAROL.to_string()],
        };
        let ctx = MergeContext { me: &me, customer: &customer, meta: None };
        let dht = family(4, &[A, ""], "ecc/2x2");
        let tx = ctx.increment_revision(dht.clone(), Some(&dht), false).unwrap();
        assert_eq!(tx.revision, 5);
        assert_eq!(tx.customer_idurl.to_text(), "http://new.net/carol.xml");
    }

    #[test]
    fn test_revision_from_another_supplier_keeps_my_slot() {
        let (me, customer) = (IdUrl::new(B), IdUrl::new(CAROL));
        let meta = CustomerMeta {
            ecc_map: Some("ecc/2x2".to_string()),
            position: Some(1),
            family_snapshot: vec![],
        };
        let ctx = MergeContext { me: &me, customer: &customer, meta: Some(&meta) };
        let (info, saved) =
            ctx.revision_from_another_supplier(7, ids(&[A, X]), Some("ecc/2x2".to_string()));
        assert_eq!(info.revision, 7);
        assert_eq!(info.suppliers, ids(&[A, B]));
        assert_eq!(saved.unwrap().family_snapshot, ids(&[A, B]));

        let ctx = MergeContext { me: &me, customer: &customer, meta: None };
        let (info, saved) = ctx.revision_from_another_supplier(7, ids(&[A, X]), None);
        assert_eq!(info.suppliers, ids(&[A, X]));
        assert!(saved.is_none());
    }

    #[test]
    fn test_solve_conflict() {
        let tx = family(3, &[A, "", B, ""], "ecc/4x4");
        let peer = IdUrl::new(X);
        let claims_vacant = PeerView { revision: 3, ecc_map: None, suppliers: ids(&["", X, "", ""]) };
        let solved = solve_conflict(tx.clone(), &peer, &claims_vacant).unwrap();
        assert_eq!(solved.suppliers, ids(&[A, X, B, ""]));

        let claims_taken = PeerView { revision: 3, ecc_map: None, suppliers: ids(&[X, "", "", ""]) };
        assert!(solve_conflict(tx.clone(), &peer, &claims_taken).is_none());

        let no_claim = PeerView { revision: 3, ecc_map: None, suppliers: ids(&[A, "", "", ""]) };
        assert!(solve_conflict(tx.clone(), &peer, &no_claim).is_none());

        let beyond = PeerView { revision: 3, ecc_map: None, suppliers: ids(&["", "", "", "", X]) };
        assert!(solve_conflict(tx, &peer, &beyond).is_none());
    }

    #[test]
    fn test_position_zero_counts() {
        let (me, customer) = (IdUrl::new(A), IdUrl::new(CAROL));
        let ctx = MergeContext { me: &me, customer: &customer, meta: None };
        let dht = family(1, &[A, ""], "ecc/2x2");
        assert!(ctx.is_my_position_ok(Some(&dht), Some(&dht), false));
        let moved = family(2, &["", A], "ecc/2x2");
        assert!(!ctx.is_my_position_ok(Some(&moved), Some(&dht), false));
    }
}
