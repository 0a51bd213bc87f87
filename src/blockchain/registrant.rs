//! Registrant: get my identity confirmed on the blockchain
//!
//! Searches the chain for the confirming transaction first. Until it shows
//! up, the registrant keeps a request in a free slot of the authority queue
//! and polls the chain every five minutes.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{identity_openfield, BlockchainClient, BlockchainError, OPERATION_IDENTITY};
use crate::identity::{IdUrl, Identity};
use crate::relations::Relations;

pub const REGISTRANT_POLL_INTERVAL: Duration = Duration::from_secs(300);

/// Failed writes tolerated before waiting for the next poll
const MAX_WRITE_ATTEMPTS: u32 = 5;

/// Slots above this wrap back to the first one
const MAX_POSITION: u32 = 500;

const FIRST_POSITION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrantState {
    AtStartup,
    BlockchainRead,
    DhtRead,
    DhtWrite,
    Ready,
    Closed,
}

/// What the registrant found in a queue slot
#[derive(Debug, Clone, PartialEq)]
enum SlotRead {
    Vacant,
    Mine,
    Taken(String),
}

pub struct Registrant {
    relations: Relations,
    chain: Arc<dyn BlockchainClient>,
    identity: Identity,
    position: u32,
    poll_interval: Duration,
    state: watch::Sender<RegistrantState>,
}

impl Registrant {
    pub fn new(relations: Relations, chain: Arc<dyn BlockchainClient>, identity: Identity) -> Self {
        let (state, _) = watch::channel(RegistrantState::AtStartup);
        Self {
            relations,
            chain,
            identity,
            position: FIRST_POSITION,
            poll_interval: REGISTRANT_POLL_INTERVAL,
            state,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn state(&self) -> RegistrantState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<RegistrantState> {
        self.state.subscribe()
    }

    pub fn position(&self) -> u32 {
        self.position
    }

    fn set_state(&self, state: RegistrantState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Registrant {:?} -> {:?} at slot {}", previous, state, self.position);
        }
    }

    fn openfield(&self) -> String {
        identity_openfield(&self.identity.username(), self.identity.clean_public_key())
    }

    /// Whether the confirming transaction is on the chain
    pub async fn search_confirmation(&self) -> Result<bool, BlockchainError> {
        let found = self
            .chain
            .find_transactions(self.chain.wallet_address(), OPERATION_IDENTITY, &self.openfield())
            .await?;
        Ok(!found.is_empty())
    }

    /// Jump forward by a random step, wrapping around at the end of the queue
    fn next_position(&mut self) {
        let current = self.position;
        self.position += rand::thread_rng().gen_range(current + 1..=current * 2 + 1);
        if self.position > MAX_POSITION {
            self.position = FIRST_POSITION;
        }
    }

    async fn read_slot(&self) -> Result<SlotRead, BlockchainError> {
        let Some(request) = self.relations.read_identity_request(self.position).await? else {
            return Ok(SlotRead::Vacant);
        };
        let me = self.relations.my_idurl();
        let holder = IdUrl::new(request.idurl.as_str());
        let same = holder == *me
            || self
                .relations
                .identities()
                .interner()
                .rotated_equal(holder.to_text(), me.to_text());
        if !same {
            return Ok(SlotRead::Taken(request.idurl));
        }
        if request.wallet_address != self.chain.wallet_address() {
            // my own request with a stale wallet, overwrite it
            return Ok(SlotRead::Vacant);
        }
        Ok(SlotRead::Mine)
    }

    /// Make sure my request sits in some queue slot, returns the slot
    pub async fn publish_request(&mut self) -> Option<u32> {
        let mut attempts = 0;
        loop {
            self.set_state(RegistrantState::DhtRead);
            match self.read_slot().await {
                Ok(SlotRead::Mine) => {
                    debug!("My identity request is already at slot {}", self.position);
                    return Some(self.position);
                }
                Ok(SlotRead::Taken(holder)) => {
                    debug!("Slot {} is taken by {}", self.position, holder);
                    self.next_position();
                    continue;
                }
                Ok(SlotRead::Vacant) => {}
                Err(e) => debug!("Failed reading slot {}: {}", self.position, e),
            }

            self.set_state(RegistrantState::DhtWrite);
            let written = self
                .relations
                .write_identity_request(
                    self.position,
                    self.relations.my_idurl(),
                    self.identity.clean_public_key(),
                    self.chain.wallet_address(),
                )
                .await;
            match written {
                Ok(_) => {
                    info!("Queued identity request at slot {}", self.position);
                    return Some(self.position);
                }
                Err(e) if attempts < MAX_WRITE_ATTEMPTS => {
                    attempts += 1;
                    warn!("Failed writing identity request at slot {}: {}", self.position, e);
                    self.next_position();
                }
                Err(e) => {
                    warn!("Giving up writing identity request: {}", e);
                    return None;
                }
            }
        }
    }

    /// Poll until confirmed or cancelled, returns the final state
    pub async fn run(mut self, shutdown: CancellationToken) -> RegistrantState {
        loop {
            self.set_state(RegistrantState::BlockchainRead);
            match self.search_confirmation().await {
                Ok(true) => {
                    if let Err(e) = self.relations.erase_identity_request(self.position).await {
                        debug!("Failed erasing slot {}: {}", self.position, e);
                    }
                    info!("Identity {} is confirmed on the blockchain", self.relations.my_idurl());
                    self.set_state(RegistrantState::Ready);
                    return RegistrantState::Ready;
                }
                Ok(false) => {
                    self.publish_request().await;
                    self.set_state(RegistrantState::BlockchainRead);
                }
                Err(e) => warn!("Blockchain search failed: {}", e),
            }
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    self.set_state(RegistrantState::Closed);
                    return RegistrantState::Closed;
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}
