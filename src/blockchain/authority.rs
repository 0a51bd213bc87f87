//! Authority: confirm queued identity requests on the blockchain
//!
//! Sweeps the request slots `offset+1 ..= limit` of the current hour. A
//! valid request whose transaction is already on the chain is erased from
//! the queue; otherwise one confirming transaction is submitted. The chain
//! is searched before every submission, so a request is never confirmed
//! twice by the same honest authority.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{identity_openfield, BlockchainClient, OPERATION_IDENTITY};
use crate::config::AuthorityConfig;
use crate::identity::IdUrl;
use crate::records::IdentityRequestRecord;
use crate::relations::Relations;

/// Pause after a slot with nothing to do
pub const AUTHORITY_TICK: Duration = Duration::from_secs(60);

/// Consecutive empty slots after which the sweep restarts
const MAX_EMPTY_STREAK: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorityState {
    AtStartup,
    Idle,
    DhtRead,
    FindTx,
    SendTx,
    Closed,
}

/// Result of handling one slot
#[derive(Debug, Clone, PartialEq)]
pub enum SlotOutcome {
    Empty,
    /// The request failed verification
    Invalid(String),
    /// Already confirmed, slot erased
    Confirmed,
    Sent(String),
    SendFailed(String),
}

impl SlotOutcome {
    /// Outcomes after which the next slot is read without waiting
    fn run_soon(&self) -> bool {
        matches!(
            self,
            SlotOutcome::Confirmed | SlotOutcome::Sent(_) | SlotOutcome::SendFailed(_)
        )
    }
}

pub struct Authority {
    relations: Relations,
    chain: Arc<dyn BlockchainClient>,
    config: AuthorityConfig,
    position: u32,
    empty_streak: u32,
    tick: Duration,
    state: watch::Sender<AuthorityState>,
}

impl Authority {
    pub fn new(relations: Relations, chain: Arc<dyn BlockchainClient>, config: AuthorityConfig) -> Self {
        let (state, _) = watch::channel(AuthorityState::AtStartup);
        let position = config.requests_reading_offset;
        Self {
            relations,
            chain,
            config,
            position,
            empty_streak: 0,
            tick: AUTHORITY_TICK,
            state,
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn position(&self) -> u32 {
        self.position
    }

    pub fn state(&self) -> AuthorityState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthorityState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: AuthorityState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(
                position = self.position,
                empty_streak = self.empty_streak,
                "Authority {:?} -> {:?}",
                previous,
                state
            );
        }
    }

    /// Advance to the next slot, restarting the sweep at the end of the window
    pub fn next_record(&mut self) {
        let offset = self.config.requests_reading_offset;
        let limit = self.config.requests_reading_limit;
        let streak_limit = MAX_EMPTY_STREAK.min(limit / 5 + 1);
        if self.empty_streak >= streak_limit || self.position >= offset.saturating_add(limit) {
            self.position = offset;
            self.empty_streak = 0;
        }
        self.position += 1;
    }

    /// Check the request against the identity it claims
    async fn verify(&self, request: &IdentityRequestRecord) -> Result<(), String> {
        let idurl = IdUrl::new(request.idurl.as_str());
        let identity = self
            .relations
            .identities()
            .immediately_caching(&idurl)
            .await
            .map_err(|e| format!("identity {} was not cached: {}", idurl, e))?;
        let cached = identity.idurl();
        let same = cached == idurl
            || self
                .relations
                .identities()
                .interner()
                .rotated_equal(cached.to_text(), idurl.to_text());
        if !same {
            return Err(format!("idurl {} is not matching {}", idurl, cached));
        }
        if identity.clean_public_key() != request.public_key {
            return Err(format!("public key of {} is not matching", idurl));
        }
        Ok(())
    }

    /// Handle the request queued at `position` of the current hour
    pub async fn process_slot(&mut self, position: u32) -> SlotOutcome {
        self.set_state(AuthorityState::DhtRead);
        let request = match self.relations.read_identity_request(position).await {
            Ok(Some(request)) => request,
            Ok(None) => {
                self.empty_streak += 1;
                return SlotOutcome::Empty;
            }
            Err(e) => {
                debug!("Failed reading slot {}: {}", position, e);
                self.empty_streak += 1;
                return SlotOutcome::Empty;
            }
        };
        if let Err(reason) = self.verify(&request).await {
            warn!("Invalid identity request at slot {}: {}", position, reason);
            self.empty_streak += 1;
            return SlotOutcome::Invalid(reason);
        }
        self.empty_streak = 0;

        let username = IdUrl::new(request.idurl.as_str()).username();
        let openfield = identity_openfield(&username, &request.public_key);
        self.set_state(AuthorityState::FindTx);
        match self
            .chain
            .find_transactions(&request.wallet_address, OPERATION_IDENTITY, &openfield)
            .await
        {
            Ok(found) if !found.is_empty() => {
                if let Err(e) = self.relations.erase_identity_request(position).await {
                    warn!("Failed erasing slot {}: {}", position, e);
                }
                debug!("Identity {} already confirmed by {}", request.idurl, found[0].id);
                return SlotOutcome::Confirmed;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Blockchain search for {} failed: {}", request.idurl, e);
                return SlotOutcome::SendFailed(e.to_string());
            }
        }

        self.set_state(AuthorityState::SendTx);
        match self
            .chain
            .send_transaction(
                &request.wallet_address,
                self.config.registration_bonus_coins,
                OPERATION_IDENTITY,
                &openfield,
            )
            .await
        {
            Ok(tx_id) => {
                info!("Confirmed identity {} with transaction {}", request.idurl, tx_id);
                SlotOutcome::Sent(tx_id)
            }
            Err(e) => {
                warn!("Failed sending transaction for {}: {}", request.idurl, e);
                SlotOutcome::SendFailed(e.to_string())
            }
        }
    }

    /// Sweep the queue until cancelled
    pub async fn run(mut self, shutdown: CancellationToken) {
        self.set_state(AuthorityState::Idle);
        self.next_record();
        loop {
            let outcome = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                outcome = self.process_slot(self.position) => outcome,
            };
            self.set_state(AuthorityState::Idle);
            let run_soon = outcome.run_soon();
            self.next_record();
            if run_soon {
                continue;
            }
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.tick) => {}
            }
        }
        self.set_state(AuthorityState::Closed);
        debug!("Authority stopped");
    }
}
