//! Peer review of a family transaction
//!
//! Before committing, the transaction is sent to every other supplier
//! listed in it. Each reviewer answers once; the round collects the
//! answers and decides whether the transaction may be written.

use futures::future::join_all;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::info::FamilyInfo;
use crate::identity::IdUrl;
use crate::network::{ContactsBody, ContactsPacket, ContactsSender, PeerView, SignalResponse};

/// Time a reviewer has to answer
pub const REVIEW_TIMEOUT: Duration = Duration::from_secs(10);

/// Answer of one reviewer
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Acked,
    /// The reviewer disagrees and sent its own view of the family
    Failed(PeerView),
    TimedOut,
}

impl From<SignalResponse> for Outcome {
    fn from(response: SignalResponse) -> Self {
        match response {
            SignalResponse::Ack => Outcome::Acked,
            SignalResponse::Fail {
                view: Some(view), ..
            } => Outcome::Failed(view),
            // A failure without a view carries nothing to reconcile
            SignalResponse::Fail { reason, view: None } => {
                debug!("Reviewer failed without a view: {}", reason);
                Outcome::Acked
            }
        }
    }
}

/// Result of a finished round
#[derive(Debug, Clone, PartialEq)]
pub enum ReviewResult {
    /// Every reviewer acked, or enough did before the others timed out
    Agreed,
    /// First reviewer that disagreed, in suppliers-list order
    Disagreed { peer: IdUrl, view: PeerView },
    /// Too many reviewers did not answer
    NoQuorum { acked: usize, reviewers: usize },
}

/// A review round for one transaction
#[derive(Debug)]
pub struct ReviewRound {
    transaction: FamilyInfo,
    reviewers: Vec<IdUrl>,
    outcomes: Vec<(IdUrl, Outcome)>,
}

impl ReviewRound {
    pub fn new(transaction: FamilyInfo, me: &IdUrl) -> Self {
        let mut reviewers: Vec<IdUrl> = Vec::new();
        for supplier in &transaction.suppliers {
            if supplier.is_empty() || supplier == me || reviewers.contains(supplier) {
                continue;
            }
            reviewers.push(supplier.clone());
        }
        Self {
            transaction,
            reviewers,
            outcomes: Vec::new(),
        }
    }

    /// Also ask the suppliers of `previous` the transaction drops
    pub fn with_displaced(mut self, previous: &[IdUrl], me: &IdUrl) -> Self {
        for supplier in previous {
            if supplier.is_empty()
                || supplier == me
                || self.reviewers.contains(supplier)
                || self.transaction.contains(supplier)
            {
                continue;
            }
            self.reviewers.push(supplier.clone());
        }
        self
    }

    pub fn transaction(&self) -> &FamilyInfo {
        &self.transaction
    }

    pub fn reviewers(&self) -> &[IdUrl] {
        &self.reviewers
    }

    /// Packet sent to every reviewer
    pub fn packet(&self) -> ContactsPacket {
        ContactsPacket::family(ContactsBody::SuppliersList {
            customer_idurl: self.transaction.customer_idurl.clone(),
            customer_ecc_map: self.transaction.ecc_map.clone(),
            transaction_revision: self.transaction.revision,
            suppliers_list: self.transaction.suppliers.clone(),
        })
    }

    /// Record an answer; answers from non-reviewers and repeated answers are ignored
    pub fn record(&mut self, reviewer: &IdUrl, outcome: Outcome) {
        if !self.reviewers.contains(reviewer) {
            warn!("Ignoring review from {} which is not in the family", reviewer);
            return;
        }
        if self.outcome(reviewer).is_none() {
            self.outcomes.push((reviewer.clone(), outcome));
        }
    }

    fn outcome(&self, reviewer: &IdUrl) -> Option<&Outcome> {
        self.outcomes
            .iter()
            .find(|(r, _)| r == reviewer)
            .map(|(_, o)| o)
    }

    pub fn acked(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, Outcome::Acked))
            .count()
    }

    /// Acks needed when some reviewers timed out
    pub fn quorum(&self) -> usize {
        self.reviewers.len() / 2
    }

    /// Decide the round; reviewers that never answered count as timed out
    pub fn finalize(&self) -> ReviewResult {
        for reviewer in &self.reviewers {
            if let Some(Outcome::Failed(view)) = self.outcome(reviewer) {
                return ReviewResult::Disagreed {
                    peer: reviewer.clone(),
                    view: view.clone(),
                };
            }
        }
        let acked = self.acked();
        if acked == self.reviewers.len() || acked >= self.quorum() {
            ReviewResult::Agreed
        } else {
            ReviewResult::NoQuorum {
                acked,
                reviewers: self.reviewers.len(),
            }
        }
    }

    /// Send the transaction to every reviewer and decide
    ///
    /// Returns `None` when cancelled before all answers arrived.
    pub async fn run(
        mut self,
        sender: &dyn ContactsSender,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Option<ReviewResult> {
        if self.reviewers.is_empty() {
            debug!("No other suppliers to review revision {}", self.transaction.revision);
            return Some(ReviewResult::Agreed);
        }
        let packet = self.packet();
        let requests = self.reviewers.iter().map(|reviewer| {
            let packet = packet.clone();
            async move {
                let outcome =
                    match tokio::time::timeout(timeout, sender.send_contacts(reviewer, packet)).await {
                        Ok(Ok(response)) => Outcome::from(response),
                        Ok(Err(e)) => {
                            debug!("Review by {} failed: {}", reviewer, e);
                            Outcome::TimedOut
                        }
                        Err(_) => Outcome::TimedOut,
                    };
                (reviewer.clone(), outcome)
            }
        });

        let answers = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            answers = join_all(requests) => answers,
        };
        for (reviewer, outcome) in answers {
            self.record(&reviewer, outcome);
        }
        let result = self.finalize();
        info!(
            revision = self.transaction.revision,
            acked = self.acked(),
            reviewers = self.reviewers.len(),
            "Review of family of {} finished: {:?}",
            self.transaction.customer_idurl,
            result
        );
        Some(result)
    }
}
