//! Family member coordinator
//!
//! One actor per customer this node supplies. The actor owns the family
//! state and consumes events from a channel, so everything done for one
//! customer happens in order. DHT reads, DHT writes and peer reviews run as
//! child tasks holding a child cancellation token; they report back through
//! the same channel tagged with the operation number that started them, and
//! answers for an operation that is no longer current are dropped.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::info::{FamilyInfo, FamilyRequest, FamilyState};
use super::merge::{solve_conflict, MergeContext};
use super::review::{ReviewResult, ReviewRound, REVIEW_TIMEOUT};
use super::contacts::Verdict;
use crate::identity::IdUrl;
use crate::network::{ContactsBody, ContactsSender, SignalResponse};
use crate::relations::{Relations, RelationsError};
use crate::storage::CustomerMeta;
use crate::unix_now;

/// Base refresh period, multiplied by the number of suppliers
pub const DHT_RECORD_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Read-merge-write cycles per request before giving up
pub const MAX_WRITE_ATTEMPTS: u32 = 3;

/// Retries of one write after the storing node advised a newer revision
pub const MAX_REVISION_RETRIES: u32 = 3;

/// Review rounds per request before it is dropped
pub const MAX_MERGE_ROUNDS: u32 = 5;

const MAX_HISTORY: usize = 100;

#[derive(Error, Debug)]
pub enum FamilyError {
    #[error("Family member of {0} is closed")]
    Closed(IdUrl),
}

#[derive(Debug, Clone)]
pub struct FamilyConfig {
    pub review_timeout: Duration,
    pub refresh_interval: Duration,
    /// Family size assumed while no ECC map is known
    pub default_suppliers: usize,
}

impl Default for FamilyConfig {
    fn default() -> Self {
        Self {
            review_timeout: REVIEW_TIMEOUT,
            refresh_interval: DHT_RECORD_REFRESH_INTERVAL,
            default_suppliers: 2,
        }
    }
}

/// What moved the coordinator from one state to another
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Init,
    Instant,
    DhtReadFail,
    DhtValueExist,
    DhtValueNotExist,
    DhtWriteOk,
    DhtWriteFail,
    AllSuppliersAgree,
    OneSupplierNotAgree,
    NoQuorum,
    Disconnect,
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct TransitionRecord {
    pub from: FamilyState,
    pub to: FamilyState,
    pub trigger: Trigger,
    pub timestamp: u64,
}

/// Point-in-time copy of the coordinator state
#[derive(Debug, Clone)]
pub struct FamilySnapshot {
    pub customer_idurl: IdUrl,
    pub state: FamilyState,
    pub my_info: Option<FamilyInfo>,
    pub dht_info: Option<FamilyInfo>,
    pub transaction: Option<FamilyInfo>,
    pub current: Option<FamilyRequest>,
    pub queued: Vec<FamilyRequest>,
    pub history: Vec<TransitionRecord>,
}

pub(crate) type OnClose = Box<dyn FnOnce() + Send>;

#[derive(Debug)]
enum Event {
    Init,
    Request(FamilyRequest),
    Contacts {
        sender: IdUrl,
        body: ContactsBody,
        reply: oneshot::Sender<SignalResponse>,
    },
    Disconnect,
    Shutdown,
    RefreshTick,
    DhtRead {
        op: u64,
        result: Result<Option<FamilyInfo>, RelationsError>,
    },
    DhtWrite {
        op: u64,
        result: Result<FamilyInfo, RelationsError>,
    },
    Review {
        op: u64,
        result: ReviewResult,
    },
    Snapshot(oneshot::Sender<FamilySnapshot>),
}

impl Event {
    fn name(&self) -> &'static str {
        match self {
            Event::Init => "init",
            Event::Request(request) => request.command(),
            Event::Contacts { .. } => "contacts-received",
            Event::Disconnect => "disconnect",
            Event::Shutdown => "shutdown",
            Event::RefreshTick => "refresh-tick",
            Event::DhtRead { .. } => "dht-read",
            Event::DhtWrite { .. } => "dht-write",
            Event::Review { .. } => "review",
            Event::Snapshot(_) => "snapshot",
        }
    }
}

#[derive(Debug, Clone)]
struct PendingRequest {
    request: FamilyRequest,
    rounds: u32,
}

async fn send_event(events: &mpsc::WeakSender<Event>, event: Event) -> bool {
    match events.upgrade() {
        Some(events) => events.send(event).await.is_ok(),
        None => false,
    }
}

struct FamilyMember {
    customer: IdUrl,
    me: IdUrl,
    relations: Relations,
    signals: Arc<dyn ContactsSender>,
    config: FamilyConfig,
    state: FamilyState,
    state_tx: watch::Sender<FamilyState>,
    events: mpsc::WeakSender<Event>,
    requests: VecDeque<PendingRequest>,
    current: Option<PendingRequest>,
    dht_info: Option<FamilyInfo>,
    my_info: Option<FamilyInfo>,
    transaction: Option<FamilyInfo>,
    attempts: u32,
    op: u64,
    op_token: Option<CancellationToken>,
    refresh_token: Option<CancellationToken>,
    cancel: CancellationToken,
    history: VecDeque<TransitionRecord>,
    on_close: Option<OnClose>,
}

/// Start a coordinator for `customer` and feed it `init`
pub(crate) fn spawn(
    customer: IdUrl,
    relations: Relations,
    signals: Arc<dyn ContactsSender>,
    config: FamilyConfig,
    parent: &CancellationToken,
    on_close: OnClose,
) -> FamilyMemberHandle {
    let (events_tx, events_rx) = mpsc::channel(100);
    let (state_tx, state_rx) = watch::channel(FamilyState::AtStartup);
    let member = FamilyMember {
        customer: customer.clone(),
        me: relations.my_idurl().clone(),
        relations,
        signals,
        config,
        state: FamilyState::AtStartup,
        state_tx,
        events: events_tx.downgrade(),
        requests: VecDeque::new(),
        current: None,
        dht_info: None,
        my_info: None,
        transaction: None,
        attempts: 0,
        op: 0,
        op_token: None,
        refresh_token: None,
        cancel: parent.child_token(),
        history: VecDeque::with_capacity(MAX_HISTORY),
        on_close: Some(on_close),
    };
    // fresh channel, cannot be full
    let _ = events_tx.try_send(Event::Init);
    tokio::spawn(member.run(events_rx));
    FamilyMemberHandle {
        customer,
        events: events_tx,
        state: state_rx,
    }
}

impl FamilyMember {
    async fn run(mut self, mut events: mpsc::Receiver<Event>) {
        debug!("Family member of {} started", self.customer);
        let cancel = self.cancel.clone();
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => None,
                event = events.recv() => event,
            };
            let Some(event) = event else {
                self.close(Trigger::Shutdown);
                break;
            };
            self.handle(event);
            if self.state == FamilyState::Closed {
                break;
            }
            self.instant();
        }
    }

    fn handle(&mut self, event: Event) {
        use FamilyState::*;
        match (self.state, event) {
            (_, Event::Snapshot(reply)) => {
                let _ = reply.send(self.snapshot());
            }
            (Closed, _) => {}
            (AtStartup, Event::Init) => self.set_state(Disconnected, Trigger::Init),
            (_, Event::Request(request)) => self.push_request(request),
            (_, Event::Contacts {
                sender,
                body,
                reply,
            }) => {
                let response = self.on_contacts(&sender, body);
                let _ = reply.send(response);
            }
            (_, Event::Shutdown) => self.close(Trigger::Shutdown),
            (Connected, Event::Disconnect) => self.set_state(Disconnected, Trigger::Disconnect),
            (Connected | Disconnected, Event::RefreshTick) => self.push_request(FamilyRequest::Refresh),
            (DhtRead, Event::DhtRead { op, result }) if op == self.op => self.on_dht_read(result),
            (Suppliers, Event::Review { op, result }) if op == self.op => self.on_review(result),
            (DhtWrite, Event::DhtWrite { op, result }) if op == self.op => self.on_dht_write(result),
            (state, event) => {
                debug!("Family member of {} ignores {} in {}", self.customer, event.name(), state);
            }
        }
    }

    /// Start the next queued request once the coordinator is stable
    fn instant(&mut self) {
        if !self.state.is_stable() || self.current.is_some() {
            return;
        }
        let Some(pending) = self.requests.pop_front() else {
            return;
        };
        debug!(
            "Family member of {} starts {} ({} more queued)",
            self.customer,
            pending.request.command(),
            self.requests.len()
        );
        self.current = Some(pending);
        self.attempts = 0;
        self.set_state(FamilyState::DhtRead, Trigger::Instant);
        self.start_read();
    }

    fn set_state(&mut self, to: FamilyState, trigger: Trigger) {
        let from = self.state;
        self.state = to;
        self.history.push_back(TransitionRecord {
            from,
            to,
            trigger,
            timestamp: unix_now(),
        });
        if self.history.len() > MAX_HISTORY {
            self.history.pop_front();
        }
        self.state_tx.send_replace(to);
        debug!(customer = %self.customer, ?trigger, "{} -> {}", from, to);
    }

    fn push_request(&mut self, request: FamilyRequest) {
        let duplicate = request == FamilyRequest::Refresh
            && self.requests.iter().any(|p| p.request == request);
        if duplicate {
            return;
        }
        debug!("Family member of {} queued {}", self.customer, request.command());
        self.requests.push_back(PendingRequest { request, rounds: 0 });
    }

    fn leaving(&self) -> bool {
        self.current
            .as_ref()
            .map_or(false, |p| p.request.is_leave())
    }

    fn load_meta(&self) -> Option<CustomerMeta> {
        match self.relations.contacts().customer_meta(&self.customer) {
            Ok(meta) => meta,
            Err(e) => {
                warn!("Failed reading meta info of {}: {}", self.customer, e);
                None
            }
        }
    }

    /// Cancel the running operation and open a new one
    fn next_op(&mut self) -> (u64, CancellationToken) {
        if let Some(previous) = self.op_token.take() {
            previous.cancel();
        }
        self.op += 1;
        let token = self.cancel.child_token();
        self.op_token = Some(token.clone());
        (self.op, token)
    }

    fn start_read(&mut self) {
        let (op, token) = self.next_op();
        let relations = self.relations.clone();
        let customer = self.customer.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => return,
                result = relations.read_customer_suppliers(&customer, false) => result,
            };
            let result = result.map(|found| found.map(FamilyInfo::from));
            send_event(&events, Event::DhtRead { op, result }).await;
        });
    }

    fn on_dht_read(&mut self, result: Result<Option<FamilyInfo>, RelationsError>) {
        let found = match result {
            Ok(found) => found,
            Err(e) => {
                warn!("Failed reading family of {}: {}", self.customer, e);
                self.set_state(FamilyState::Disconnected, Trigger::DhtReadFail);
                self.notify_disconnected();
                return;
            }
        };
        let trigger = if found.is_some() {
            Trigger::DhtValueExist
        } else {
            Trigger::DhtValueNotExist
        };
        self.dht_info = found;
        let leaving = self.leaving();
        let position_ok = MergeContext {
            me: &self.me,
            customer: &self.customer,
            meta: None,
        }
        .is_my_position_ok(self.dht_info.as_ref(), self.my_info.as_ref(), leaving);

        if position_ok && !leaving {
            self.set_state(FamilyState::Connected, trigger);
            self.notify_connected();
            return;
        }
        self.rebuild();
        if position_ok {
            if self.transaction.is_none() {
                info!("Nothing to publish while leaving family of {}", self.customer);
                self.close(trigger);
                return;
            }
            self.attempts += 1;
            self.set_state(FamilyState::DhtWrite, trigger);
            self.start_write();
            return;
        }
        self.attempts += 1;
        self.set_state(FamilyState::Suppliers, trigger);
        self.start_review();
    }

    fn rebuild(&mut self) {
        let Some(pending) = self.current.as_ref() else {
            self.transaction = None;
            return;
        };
        let meta = self.load_meta();
        let ctx = MergeContext {
            me: &self.me,
            customer: &self.customer,
            meta: meta.as_ref(),
        };
        self.transaction = ctx.rebuild(self.dht_info.as_ref(), &mut self.my_info, &pending.request);
    }

    fn start_review(&mut self) {
        let Some(transaction) = self.transaction.clone() else {
            debug!("No transaction for family of {}, nothing to review", self.customer);
            self.on_review(ReviewResult::Agreed);
            return;
        };
        let (op, token) = self.next_op();
        let displaced = self
            .dht_info
            .as_ref()
            .map(|dht| dht.suppliers.as_slice())
            .unwrap_or_default();
        let round = ReviewRound::new(transaction, &self.me).with_displaced(displaced, &self.me);
        let signals = self.signals.clone();
        let timeout = self.config.review_timeout;
        let events = self.events.clone();
        tokio::spawn(async move {
            if let Some(result) = round.run(signals.as_ref(), timeout, token).await {
                send_event(&events, Event::Review { op, result }).await;
            }
        });
    }

    fn on_review(&mut self, result: ReviewResult) {
        match result {
            ReviewResult::Agreed => {
                if self.transaction.is_some() {
                    self.set_state(FamilyState::DhtWrite, Trigger::AllSuppliersAgree);
                    self.start_write();
                } else {
                    self.set_state(FamilyState::Connected, Trigger::AllSuppliersAgree);
                    self.notify_connected();
                }
            }
            ReviewResult::Disagreed { peer, view } => {
                let rounds = self.current.as_mut().map_or(MAX_MERGE_ROUNDS, |p| {
                    p.rounds += 1;
                    p.rounds
                });
                if rounds >= MAX_MERGE_ROUNDS {
                    warn!(
                        "Too many merge rounds for family of {}, dropping the request",
                        self.customer
                    );
                    self.transaction = None;
                    self.set_state(FamilyState::Connected, Trigger::OneSupplierNotAgree);
                    self.notify_connected();
                    return;
                }
                self.transaction = self
                    .transaction
                    .take()
                    .and_then(|tx| solve_conflict(tx, &peer, &view));
                if self.transaction.is_none() {
                    warn!(
                        "Supplier {} disagrees on family of {}, transaction abandoned",
                        peer, self.customer
                    );
                }
                self.start_review();
            }
            ReviewResult::NoQuorum { acked, reviewers } => {
                warn!(
                    "Only {} of {} suppliers of {} acked, transaction abandoned",
                    acked, reviewers, self.customer
                );
                self.transaction = None;
                if let Some(mut pending) = self.current.take() {
                    pending.rounds += 1;
                    if pending.rounds < MAX_MERGE_ROUNDS {
                        self.requests.push_front(pending);
                    }
                }
                self.set_state(FamilyState::Disconnected, Trigger::NoQuorum);
                self.notify_disconnected();
            }
        }
    }

    fn start_write(&mut self) {
        let Some(transaction) = self.transaction.clone() else {
            return;
        };
        let (op, token) = self.next_op();
        let relations = self.relations.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => return,
                result = publish_transaction(&relations, &transaction) => result,
            };
            let result = result.map(|()| transaction);
            send_event(&events, Event::DhtWrite { op, result }).await;
        });
    }

    fn on_dht_write(&mut self, result: Result<FamilyInfo, RelationsError>) {
        let leaving = self.leaving();
        match result {
            Ok(committed) => {
                info!(
                    revision = committed.revision,
                    "Family of {} committed: {:?}",
                    self.customer,
                    committed.suppliers
                );
                if leaving {
                    self.close(Trigger::DhtWriteOk);
                    return;
                }
                self.my_info = Some(committed);
                self.dht_info = None;
                self.transaction = None;
                self.set_state(FamilyState::Connected, Trigger::DhtWriteOk);
                self.notify_connected();
            }
            Err(e) => {
                let conflict = e.current_revision();
                match conflict {
                    Some(current) => info!(
                        "Family of {} moved to revision {} meanwhile, merging again",
                        self.customer, current
                    ),
                    None => warn!("Failed writing family of {}: {}", self.customer, e),
                }
                let give_up = self.attempts > MAX_WRITE_ATTEMPTS;
                if leaving && (give_up || conflict.is_none()) {
                    self.close(Trigger::DhtWriteFail);
                } else if give_up {
                    self.set_state(FamilyState::Disconnected, Trigger::DhtWriteFail);
                    self.notify_disconnected();
                } else {
                    self.set_state(FamilyState::DhtRead, Trigger::DhtWriteFail);
                    self.start_read();
                }
            }
        }
    }

    fn notify_connected(&mut self) {
        self.op_token = None;
        let finished = self.current.take();
        self.restart_refresh();
        if finished.map_or(false, |p| p.request.is_leave()) {
            self.close(Trigger::Shutdown);
        }
    }

    fn notify_disconnected(&mut self) {
        self.op_token = None;
        if let Some(dropped) = self.current.take() {
            debug!("Dropped {} of {}", dropped.request.command(), self.customer);
        }
        if self.refresh_token.is_none() {
            self.restart_refresh();
        }
    }

    fn restart_refresh(&mut self) {
        if let Some(previous) = self.refresh_token.take() {
            previous.cancel();
        }
        let suppliers = self
            .my_info
            .as_ref()
            .and_then(FamilyInfo::expected_size)
            .unwrap_or(self.config.default_suppliers)
            .max(1);
        let period = self.config.refresh_interval * suppliers as u32;
        let token = self.cancel.child_token();
        self.refresh_token = Some(token.clone());
        let events = self.events.clone();
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticks.tick() => {
                        if !send_event(&events, Event::RefreshTick).await {
                            break;
                        }
                    }
                }
            }
        });
    }

    fn on_contacts(&mut self, sender: &IdUrl, body: ContactsBody) -> SignalResponse {
        let verdict = match body {
            ContactsBody::SuppliersList {
                customer_ecc_map,
                transaction_revision,
                suppliers_list,
                ..
            } => {
                let meta = self.load_meta();
                let ctx = MergeContext {
                    me: &self.me,
                    customer: &self.customer,
                    meta: meta.as_ref(),
                };
                ctx.on_suppliers_list(
                    &mut self.my_info,
                    customer_ecc_map,
                    suppliers_list,
                    transaction_revision,
                )
            }
            ContactsBody::SupplierPosition {
                customer_ecc_map,
                supplier_idurl,
                supplier_position,
                family_snapshot,
                ..
            } => {
                if *sender != self.customer {
                    warn!("Supplier position for {} sent by {}", self.customer, sender);
                    return SignalResponse::fail("supplier position must come from the customer");
                }
                MergeContext {
                    me: &self.me,
                    customer: &self.customer,
                    meta: None,
                }
                .on_supplier_position(
                    &supplier_idurl,
                    customer_ecc_map,
                    supplier_position,
                    family_snapshot,
                )
            }
        };
        self.apply_verdict(verdict)
    }

    fn apply_verdict(&mut self, verdict: Verdict) -> SignalResponse {
        if let Some(meta) = &verdict.meta {
            if let Err(e) = self.relations.contacts().set_customer_meta(&self.customer, meta) {
                warn!("Failed saving meta info of {}: {}", self.customer, e);
            }
        }
        if verdict.refresh {
            self.push_request(FamilyRequest::Refresh);
        }
        verdict.response
    }

    fn close(&mut self, trigger: Trigger) {
        if self.state == FamilyState::Closed {
            return;
        }
        self.cancel.cancel();
        self.op_token = None;
        self.refresh_token = None;
        self.requests.clear();
        self.current = None;
        self.transaction = None;
        if let Some(on_close) = self.on_close.take() {
            on_close();
        }
        self.set_state(FamilyState::Closed, trigger);
        info!("Family member of {} closed", self.customer);
    }

    fn snapshot(&self) -> FamilySnapshot {
        FamilySnapshot {
            customer_idurl: self.customer.clone(),
            state: self.state,
            my_info: self.my_info.clone(),
            dht_info: self.dht_info.clone(),
            transaction: self.transaction.clone(),
            current: self.current.as_ref().map(|p| p.request.clone()),
            queued: self.requests.iter().map(|p| p.request.clone()).collect(),
            history: self.history.iter().cloned().collect(),
        }
    }
}

/// Store a transaction once, a revision conflict is returned as is
pub(crate) async fn publish_transaction(
    relations: &Relations,
    transaction: &FamilyInfo,
) -> Result<(), RelationsError> {
    let ecc_map = transaction.ecc_map.clone().unwrap_or_default();
    let nodes = relations
        .write_customer_suppliers(
            &transaction.customer_idurl,
            &transaction.suppliers,
            &ecc_map,
            transaction.revision,
            transaction.publisher_idurl.as_ref(),
        )
        .await?;
    debug!(
        "Revision {} of {} stored on {} nodes",
        transaction.revision,
        transaction.customer_idurl,
        nodes.len()
    );
    Ok(())
}

/// Publish a list only its owner writes, following revision advice of the
/// storing nodes
pub(crate) async fn write_transaction(
    relations: &Relations,
    mut transaction: FamilyInfo,
) -> Result<FamilyInfo, RelationsError> {
    let mut retries = 0;
    loop {
        match publish_transaction(relations, &transaction).await {
            Ok(()) => return Ok(transaction),
            Err(e) => match e.current_revision() {
                Some(current) if retries < MAX_REVISION_RETRIES => {
                    retries += 1;
                    warn!(
                        "Revision {} of {} rejected, current is {}, retrying with {}",
                        transaction.revision,
                        transaction.customer_idurl,
                        current,
                        current + 1
                    );
                    transaction.revision = current + 1;
                }
                _ => return Err(e),
            },
        }
    }
}

/// Cheap handle to a running coordinator
#[derive(Clone)]
pub struct FamilyMemberHandle {
    customer: IdUrl,
    events: mpsc::Sender<Event>,
    state: watch::Receiver<FamilyState>,
}

impl FamilyMemberHandle {
    pub fn customer_idurl(&self) -> &IdUrl {
        &self.customer
    }

    pub fn state(&self) -> FamilyState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<FamilyState> {
        self.state.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }

    async fn send(&self, event: Event) -> Result<(), FamilyError> {
        self.events
            .send(event)
            .await
            .map_err(|_| FamilyError::Closed(self.customer.clone()))
    }

    pub async fn request(&self, request: FamilyRequest) -> Result<(), FamilyError> {
        self.send(Event::Request(request)).await
    }

    pub async fn join(
        &self,
        ecc_map: Option<String>,
        position: Option<usize>,
        family_snapshot: Vec<IdUrl>,
    ) -> Result<(), FamilyError> {
        self.request(FamilyRequest::Join {
            ecc_map,
            position,
            family_snapshot,
        })
        .await
    }

    pub async fn leave(&self, ecc_map: Option<String>) -> Result<(), FamilyError> {
        self.request(FamilyRequest::Leave { ecc_map }).await
    }

    pub async fn refresh(&self) -> Result<(), FamilyError> {
        self.request(FamilyRequest::Refresh).await
    }

    pub async fn disconnect(&self) -> Result<(), FamilyError> {
        self.send(Event::Disconnect).await
    }

    pub async fn shutdown(&self) -> Result<(), FamilyError> {
        self.send(Event::Shutdown).await
    }

    /// Pass an incoming contacts packet and wait for the answer
    pub async fn contacts(&self, sender: IdUrl, body: ContactsBody) -> SignalResponse {
        let (reply, answer) = oneshot::channel();
        let event = Event::Contacts {
            sender,
            body,
            reply,
        };
        if self.send(event).await.is_err() {
            return SignalResponse::fail("family member is closed");
        }
        answer
            .await
            .unwrap_or_else(|_| SignalResponse::fail("family member is closed"))
    }

    pub async fn snapshot(&self) -> Result<FamilySnapshot, FamilyError> {
        let (reply, answer) = oneshot::channel();
        self.send(Event::Snapshot(reply)).await?;
        answer
            .await
            .map_err(|_| FamilyError::Closed(self.customer.clone()))
    }

    /// Wait until the coordinator reaches `state`
    pub async fn wait_for(&self, state: FamilyState) -> Result<(), FamilyError> {
        let mut rx = self.state.clone();
        rx.wait_for(|current| *current == state)
            .await
            .map(|_| ())
            .map_err(|_| FamilyError::Closed(self.customer.clone()))
    }
}
