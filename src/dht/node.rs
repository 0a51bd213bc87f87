//! Layered Kademlia node
//!
//! Iterative lookups query `alpha` candidates per round, keep the `k`
//! closest responders and finish with one round over every unqueried
//! contact of the shortlist once no closer node turns up.

use async_trait::async_trait;
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::key::{DhtId, LayerId, LAYER_DEFAULT};
use super::protocol::{Request, Response};
use super::routing::{Contact, RoutingTable};
use super::store::{received_value, LayerStores, StoredValue};
use super::transport::{DhtRpc, MemoryNetwork, RpcHandler, UdpTransport};
use super::DhtError;
use crate::config::DhtConfig;
use crate::unix_now;

const MAX_LOOKUP_ITERATIONS: usize = 20;
/// Shortest lifetime a store request may ask for
pub const KEY_EXPIRE_MIN_SECONDS: u64 = 120;
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Kademlia network parameters
#[derive(Debug, Clone)]
pub struct KademliaConfig {
    pub k: usize,
    pub alpha: usize,
    pub rpc_timeout: Duration,
    pub refresh_timeout: Duration,
    pub data_expire: Duration,
}

impl Default for KademliaConfig {
    fn default() -> Self {
        Self::from(&DhtConfig::default())
    }
}

impl From<&DhtConfig> for KademliaConfig {
    fn from(config: &DhtConfig) -> Self {
        Self {
            k: config.k.max(1),
            alpha: config.alpha.max(1),
            rpc_timeout: Duration::from_secs(config.rpc_timeout_secs),
            refresh_timeout: Duration::from_secs(config.refresh_timeout_secs),
            data_expire: Duration::from_secs(config.data_expire_secs),
        }
    }
}

/// Server-side arbitration of incoming stores
pub trait StoreValidator: Send + Sync {
    /// Accept `incoming` under `key` over `existing`, or explain the rejection
    fn validate_store(
        &self,
        layer: LayerId,
        key: &DhtId,
        incoming: &str,
        existing: Option<&str>,
    ) -> Result<(), String>;
}

/// Result of a value lookup
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// Every replica found
    Values(Vec<String>),
    /// Nothing stored, closest live contacts instead
    Contacts(Vec<Contact>),
}

/// Result of an iterative store
#[derive(Debug)]
pub struct StoreOutcome {
    /// Nodes the value was sent to
    pub nodes: Vec<Contact>,
    /// Per-node answers, empty unless results were collected
    pub results: Vec<(Contact, Result<Response, DhtError>)>,
}

impl StoreOutcome {
    pub fn acknowledged(&self) -> usize {
        self.results
            .iter()
            .filter(|(_, r)| matches!(r, Ok(Response::Ok)))
            .count()
    }
}

struct LookupResult {
    closest: Vec<Contact>,
    values: Vec<String>,
}

/// Handle to a DHT node, cheap to clone
#[derive(Clone)]
pub struct DhtNode {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    contact: Contact,
    config: KademliaConfig,
    rpc: Arc<dyn DhtRpc>,
    routing: RwLock<HashMap<LayerId, RoutingTable>>,
    stores: LayerStores,
    validator: std::sync::RwLock<Option<Arc<dyn StoreValidator>>>,
    /// Serializes read-validate-write of incoming values
    store_lock: std::sync::Mutex<()>,
    node_data: RwLock<HashMap<LayerId, HashMap<String, serde_json::Value>>>,
    rpc_slots: Semaphore,
}

impl DhtNode {
    /// Create a node on top of an existing transport, attached to layer 0
    pub fn new(
        contact: Contact,
        config: KademliaConfig,
        rpc: Arc<dyn DhtRpc>,
        stores: LayerStores,
    ) -> Result<Self, DhtError> {
        let rpc_slots = Semaphore::new(config.alpha);
        let node = Self {
            inner: Arc::new(NodeInner {
                contact,
                config,
                rpc,
                routing: RwLock::new(HashMap::new()),
                stores,
                validator: std::sync::RwLock::new(None),
                store_lock: std::sync::Mutex::new(()),
                node_data: RwLock::new(HashMap::new()),
                rpc_slots,
            }),
        };
        node.inner.stores.attach(LAYER_DEFAULT)?;
        node.inner
            .routing
            .try_write()
            .map_err(|_| DhtError::Transport("routing table busy".into()))?
            .insert(
                LAYER_DEFAULT,
                RoutingTable::new(node.inner.contact.id, node.inner.config.k),
            );
        Ok(node)
    }

    /// Node bound to a UDP socket; the caller runs the returned transport
    pub async fn udp(
        bind: SocketAddr,
        config: KademliaConfig,
        stores: LayerStores,
    ) -> Result<(Self, Arc<UdpTransport>), DhtError> {
        let id = DhtId::random();
        let transport = UdpTransport::bind(bind, id, config.rpc_timeout).await?;
        let contact = Contact::new(id, transport.local_addr()?);
        let node = Self::new(contact, config, transport.clone(), stores)?;
        transport.set_handler(node.handler());
        info!("DHT node {} on {}", id, node.contact().addr);
        Ok((node, transport))
    }

    /// Node living on an in-process network
    pub fn memory(
        network: &Arc<MemoryNetwork>,
        addr: SocketAddr,
        config: KademliaConfig,
    ) -> Result<Self, DhtError> {
        let contact = Contact::new(DhtId::random(), addr);
        let transport = network.transport(contact.clone());
        let node = Self::new(contact, config, transport, LayerStores::temporary())?;
        network.register(addr, node.handler());
        Ok(node)
    }

    fn handler(&self) -> Weak<dyn RpcHandler> {
        let weak: Weak<NodeInner> = Arc::downgrade(&self.inner);
        weak
    }

    pub fn id(&self) -> DhtId {
        self.inner.contact.id
    }

    pub fn contact(&self) -> Contact {
        self.inner.contact.clone()
    }

    pub fn config(&self) -> &KademliaConfig {
        &self.inner.config
    }

    pub fn set_validator(&self, validator: Arc<dyn StoreValidator>) {
        *self
            .inner
            .validator
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(validator);
    }

    /// Join a layer, opening its store
    pub async fn attach_layer(&self, layer: LayerId) -> Result<(), DhtError> {
        self.inner.stores.attach(layer)?;
        let mut routing = self.inner.routing.write().await;
        routing
            .entry(layer)
            .or_insert_with(|| RoutingTable::new(self.inner.contact.id, self.inner.config.k));
        info!("Attached to DHT layer {}", layer);
        Ok(())
    }

    pub async fn detach_layer(&self, layer: LayerId) {
        if layer == LAYER_DEFAULT {
            return;
        }
        self.inner.routing.write().await.remove(&layer);
        self.inner.stores.detach(layer);
        self.inner.node_data.write().await.remove(&layer);
        info!("Detached from DHT layer {}", layer);
    }

    pub async fn is_attached(&self, layer: LayerId) -> bool {
        self.inner.is_attached(layer).await
    }

    pub async fn attached_layers(&self) -> Vec<LayerId> {
        let mut layers: Vec<_> = self.inner.routing.read().await.keys().copied().collect();
        layers.sort_unstable();
        layers
    }

    /// Ping seed nodes and look up our own id to fill the routing table
    pub async fn bootstrap(&self, layer: LayerId, seeds: &[SocketAddr]) -> Result<usize, DhtError> {
        self.inner.ensure_attached(layer).await?;
        for addr in seeds {
            if *addr == self.inner.contact.addr {
                continue;
            }
            match self.inner.rpc.ping_addr(*addr).await {
                Ok(id) => {
                    self.inner.observe(layer, Contact::new(id, *addr)).await;
                }
                Err(e) => warn!("Seed node {} did not answer: {}", addr, e),
            }
        }
        self.find_node(self.id(), layer).await?;
        let known = self.routing_contacts(layer).await.len();
        debug!("Layer {} bootstrapped with {} contacts", layer, known);
        Ok(known)
    }

    pub async fn add_contact(&self, layer: LayerId, contact: Contact) {
        self.inner.observe(layer, contact).await;
    }

    pub async fn routing_contacts(&self, layer: LayerId) -> Vec<Contact> {
        self.inner
            .routing
            .read()
            .await
            .get(&layer)
            .map(RoutingTable::contacts)
            .unwrap_or_default()
    }

    /// Iterative node lookup
    pub async fn find_node(&self, target: DhtId, layer: LayerId) -> Result<Vec<Contact>, DhtError> {
        Ok(self.inner.iterative_lookup(target, layer, false).await?.closest)
    }

    /// Iterative value lookup returning every replica found
    pub async fn get_value(&self, key: &str, layer: LayerId) -> Result<Lookup, DhtError> {
        let target = DhtId::from_key(key);
        let mut result = self.inner.iterative_lookup(target, layer, true).await?;
        if let Some(local) = self.local_value(&target, layer)? {
            result.values.insert(0, local.value);
        }
        if result.values.is_empty() {
            Ok(Lookup::Contacts(result.closest))
        } else {
            Ok(Lookup::Values(result.values))
        }
    }

    /// Iterative store to the `k` closest nodes
    ///
    /// The value is also kept locally when this node is among the closest.
    pub async fn set_value(
        &self,
        key: &str,
        value: &str,
        age: u64,
        expire_seconds: u64,
        collect_results: bool,
        layer: LayerId,
    ) -> Result<StoreOutcome, DhtError> {
        let target = DhtId::from_key(key);
        let mut nodes = self.find_node(target, layer).await?;
        let request = Request::Store {
            key: target,
            value: value.to_string(),
            original_publisher: self.id(),
            age,
            expire_seconds,
            layer_id: layer,
        };
        let futures = nodes.iter().map(|contact| {
            let request = request.clone();
            async move { (contact.clone(), self.inner.call(layer, contact, request).await) }
        });
        let mut results = join_all(futures).await;

        if self.inner.is_among_closest(&target, &nodes) {
            let local = self
                .inner
                .store_locally(layer, target, value.to_string(), self.id(), age, expire_seconds)
                .map(|_| Response::Ok)
                .unwrap_or_else(|message| Response::Error { message });
            nodes.push(self.contact());
            results.push((self.contact(), Ok(local)));
        }

        debug!(
            "Stored {} on {} nodes in layer {} (acknowledged {})",
            key,
            nodes.len(),
            layer,
            results
                .iter()
                .filter(|(_, r)| matches!(r, Ok(Response::Ok)))
                .count()
        );
        Ok(StoreOutcome {
            nodes,
            results: if collect_results { results } else { Vec::new() },
        })
    }

    /// Iterative delete from the closest nodes and the local store
    pub async fn delete_key(&self, key: &str, layer: LayerId) -> Result<Vec<Contact>, DhtError> {
        let target = DhtId::from_key(key);
        let nodes = self.find_node(target, layer).await?;
        let futures = nodes.iter().map(|contact| {
            self.inner.call(
                layer,
                contact,
                Request::Delete {
                    key: target,
                    layer_id: layer,
                },
            )
        });
        for result in join_all(futures).await {
            if let Err(e) = result {
                debug!("Delete of {} not confirmed: {}", key, e);
            }
        }
        if let Some(store) = self.inner.stores.get(layer) {
            store.remove(&target)?;
        }
        Ok(nodes)
    }

    /// Ask `contact` for a piece of its node data
    pub async fn request(
        &self,
        contact: &Contact,
        key: &str,
        layer: LayerId,
    ) -> Result<serde_json::Value, DhtError> {
        let request = Request::Request {
            key: key.to_string(),
            layer_id: layer,
        };
        match self.inner.call(layer, contact, request).await? {
            Response::Data { value } => Ok(value),
            Response::Error { message } => Err(DhtError::Remote(message)),
            other => Err(DhtError::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    /// Hint `contacts` to refresh `key` from their own stores
    pub async fn verify_update(
        &self,
        contacts: &[Contact],
        key: &str,
        value: &str,
        age: u64,
        expire_seconds: u64,
        layer: LayerId,
    ) -> Vec<(Contact, Result<Response, DhtError>)> {
        let target = DhtId::from_key(key);
        let futures = contacts.iter().filter(|c| c.id != self.id()).map(|contact| {
            let request = Request::VerifyUpdate {
                key: target,
                value: value.to_string(),
                age,
                expire_seconds,
                layer_id: layer,
            };
            async move { (contact.clone(), self.inner.call(layer, contact, request).await) }
        });
        join_all(futures).await
    }

    /// Publish a value answered to `request` RPCs in `layer`
    pub async fn set_node_data(&self, layer: LayerId, key: &str, value: serde_json::Value) {
        self.inner
            .node_data
            .write()
            .await
            .entry(layer)
            .or_default()
            .insert(key.to_string(), value);
    }

    pub fn local_value(&self, key: &DhtId, layer: LayerId) -> Result<Option<StoredValue>, DhtError> {
        match self.inner.stores.get(layer) {
            Some(store) => store.get(key),
            None => Err(DhtError::LayerNotAttached(layer)),
        }
    }

    /// Expire stored values and refresh idle buckets until `shutdown`
    pub async fn maintain(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.inner.stores.remove_expired(unix_now()) {
                Ok(0) => {}
                Ok(n) => debug!("Expired {} stored values", n),
                Err(e) => warn!("Expiring stored values failed: {}", e),
            }
            self.refresh_buckets().await;
        }
        debug!("DHT maintenance stopped");
    }

    async fn refresh_buckets(&self) {
        let stale: Vec<(LayerId, usize)> = {
            let routing = self.inner.routing.read().await;
            routing
                .iter()
                .flat_map(|(layer, table)| {
                    table
                        .stale_buckets(self.inner.config.refresh_timeout)
                        .into_iter()
                        .map(move |i| (*layer, i))
                })
                .collect()
        };
        for (layer, index) in stale {
            let target = self.id().random_in_bucket(index);
            if let Err(e) = self.find_node(target, layer).await {
                debug!("Refresh of bucket {} in layer {} failed: {}", index, layer, e);
            }
            if let Some(table) = self.inner.routing.write().await.get_mut(&layer) {
                table.mark_refreshed(index);
            }
        }
    }
}

impl NodeInner {
    async fn is_attached(&self, layer: LayerId) -> bool {
        self.routing.read().await.contains_key(&layer)
    }

    async fn ensure_attached(&self, layer: LayerId) -> Result<(), DhtError> {
        if self.is_attached(layer).await {
            Ok(())
        } else {
            Err(DhtError::LayerNotAttached(layer))
        }
    }

    async fn observe(&self, layer: LayerId, contact: Contact) {
        if let Some(table) = self.routing.write().await.get_mut(&layer) {
            table.add_contact(contact);
        }
    }

    async fn record_failure(&self, layer: LayerId, id: &DhtId) {
        if let Some(table) = self.routing.write().await.get_mut(&layer) {
            table.record_failure(id);
        }
    }

    /// One outgoing RPC, bounded by the parallelism limit
    async fn call(
        &self,
        layer: LayerId,
        contact: &Contact,
        request: Request,
    ) -> Result<Response, DhtError> {
        let _permit = self
            .rpc_slots
            .acquire()
            .await
            .map_err(|_| DhtError::Cancelled)?;
        let name = request.name();
        match self.rpc.call(contact, request).await {
            Ok(response) => {
                self.observe(layer, contact.clone()).await;
                Ok(response)
            }
            Err(e) => {
                debug!("{} to {} failed: {}", name, contact.addr, e);
                self.record_failure(layer, &contact.id).await;
                Err(e)
            }
        }
    }

    fn is_among_closest(&self, target: &DhtId, nodes: &[Contact]) -> bool {
        if nodes.len() < self.config.k {
            return true;
        }
        let own = self.contact.id.distance(target);
        nodes.iter().any(|c| own < c.id.distance(target))
    }

    async fn iterative_lookup(
        &self,
        target: DhtId,
        layer: LayerId,
        find_value: bool,
    ) -> Result<LookupResult, DhtError> {
        let k = self.config.k;
        let alpha = self.config.alpha;
        let mut shortlist = {
            let routing = self.routing.read().await;
            let table = routing.get(&layer).ok_or(DhtError::LayerNotAttached(layer))?;
            table.find_close_nodes(&target, k, None)
        };
        if let Some(table) = self.routing.write().await.get_mut(&layer) {
            table.touch(&target);
        }

        let mut seen: HashSet<DhtId> = shortlist.iter().map(|c| c.id).collect();
        seen.insert(self.contact.id);
        let mut queried: HashSet<DhtId> = HashSet::new();
        let mut responded: HashSet<DhtId> = HashSet::new();
        let mut values: Vec<String> = Vec::new();
        let mut best = shortlist.first().map(|c| c.id.distance(&target));
        let mut final_round = false;

        for _ in 0..MAX_LOOKUP_ITERATIONS {
            let candidates: Vec<Contact> = shortlist
                .iter()
                .filter(|c| !queried.contains(&c.id))
                .take(if final_round { k } else { alpha })
                .cloned()
                .collect();
            if candidates.is_empty() {
                break;
            }
            for c in &candidates {
                queried.insert(c.id);
            }

            let futures = candidates.into_iter().map(|contact| {
                let request = if find_value {
                    Request::FindValue {
                        key: target,
                        layer_id: layer,
                    }
                } else {
                    Request::FindNode {
                        key: target,
                        layer_id: layer,
                    }
                };
                async move {
                    let result = self.call(layer, &contact, request).await;
                    (contact, result)
                }
            });

            for (contact, result) in join_all(futures).await {
                match result {
                    Ok(Response::Nodes { contacts }) => {
                        responded.insert(contact.id);
                        for n in contacts {
                            if seen.insert(n.id) {
                                shortlist.push(n);
                            }
                        }
                    }
                    Ok(Response::Value { value }) => {
                        responded.insert(contact.id);
                        values.push(value);
                    }
                    Ok(Response::Error { message }) => {
                        debug!("Lookup peer {} refused: {}", contact.addr, message);
                        shortlist.retain(|c| c.id != contact.id);
                    }
                    Ok(_) => {
                        shortlist.retain(|c| c.id != contact.id);
                    }
                    Err(_) => {
                        shortlist.retain(|c| c.id != contact.id);
                    }
                }
            }

            shortlist.sort_by_key(|c| c.id.distance(&target));
            shortlist.truncate(k);

            let closest = shortlist.first().map(|c| c.id.distance(&target));
            let improved = match (closest, best) {
                (Some(new), Some(old)) => new < old,
                (Some(_), None) => true,
                _ => false,
            };
            if improved {
                best = closest;
                final_round = false;
            } else if final_round {
                break;
            } else {
                final_round = true;
            }
        }

        let closest: Vec<Contact> = shortlist
            .into_iter()
            .filter(|c| responded.contains(&c.id))
            .collect();
        debug!(
            "Lookup {} in layer {}: {} contacts, {} values, {} queried",
            target,
            layer,
            closest.len(),
            values.len(),
            queried.len()
        );
        Ok(LookupResult { closest, values })
    }

    /// Arbitrate and persist an incoming value
    fn store_locally(
        &self,
        layer: LayerId,
        key: DhtId,
        value: String,
        publisher: DhtId,
        age: u64,
        expire_seconds: u64,
    ) -> Result<(), String> {
        let _guard = self.store_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.arbitrate_and_put(layer, key, value, publisher, age, expire_seconds)
    }

    fn verify_locally(
        &self,
        layer: LayerId,
        key: DhtId,
        value: String,
        publisher: DhtId,
        age: u64,
        expire_seconds: u64,
    ) -> Result<(), String> {
        let _guard = self.store_lock.lock().unwrap_or_else(|e| e.into_inner());
        let store = self
            .stores
            .get(layer)
            .ok_or_else(|| format!("layer {} is not attached", layer))?;
        match store.get(&key).map_err(|e| e.to_string())? {
            Some(mut existing) if existing.value == value => {
                existing.last_published = unix_now();
                store.put(&key, &existing).map_err(|e| e.to_string())
            }
            _ => self.arbitrate_and_put(layer, key, value, publisher, age, expire_seconds),
        }
    }

    /// Caller holds `store_lock`
    fn arbitrate_and_put(
        &self,
        layer: LayerId,
        key: DhtId,
        value: String,
        publisher: DhtId,
        age: u64,
        expire_seconds: u64,
    ) -> Result<(), String> {
        let store = self
            .stores
            .get(layer)
            .ok_or_else(|| format!("layer {} is not attached", layer))?;
        let existing = store.get(&key).map_err(|e| e.to_string())?;

        let validator = self
            .validator
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(validator) = validator {
            validator.validate_store(
                layer,
                &key,
                &value,
                existing.as_ref().map(|s| s.value.as_str()),
            )?;
        }

        let max_expire = self.config.data_expire.as_secs().max(KEY_EXPIRE_MIN_SECONDS);
        let expire_seconds = expire_seconds.clamp(KEY_EXPIRE_MIN_SECONDS, max_expire);
        store
            .put(&key, &received_value(value, publisher, age, expire_seconds))
            .map_err(|e| e.to_string())
    }
}

#[async_trait]
impl RpcHandler for NodeInner {
    async fn handle(&self, sender: Contact, request: Request) -> Response {
        let Some(layer) = request.layer_id() else {
            return Response::Pong {
                node_id: self.contact.id,
            };
        };
        if !self.is_attached(layer).await {
            return Response::Error {
                message: format!("layer {} is not attached", layer),
            };
        }
        self.observe(layer, sender.clone()).await;

        match request {
            Request::Ping => Response::Pong {
                node_id: self.contact.id,
            },
            Request::FindNode { key, .. } => Response::Nodes {
                contacts: self.closest_for(layer, &key, &sender.id).await,
            },
            Request::FindValue { key, .. } => {
                let local = self.stores.get(layer).and_then(|s| s.get(&key).ok().flatten());
                match local {
                    Some(stored) => Response::Value {
                        value: stored.value,
                    },
                    None => Response::Nodes {
                        contacts: self.closest_for(layer, &key, &sender.id).await,
                    },
                }
            }
            Request::Store {
                key,
                value,
                original_publisher,
                age,
                expire_seconds,
                ..
            } => match self.store_locally(layer, key, value, original_publisher, age, expire_seconds) {
                Ok(()) => Response::Ok,
                Err(message) => {
                    warn!("Store of {} in layer {} rejected: {}", key, layer, message);
                    Response::Error { message }
                }
            },
            Request::Delete { key, .. } => match self.stores.get(layer) {
                Some(store) => match store.remove(&key) {
                    Ok(_) => Response::Ok,
                    Err(e) => Response::Error {
                        message: e.to_string(),
                    },
                },
                None => Response::Error {
                    message: format!("layer {} is not attached", layer),
                },
            },
            Request::Request { key, .. } => {
                let value = self
                    .node_data
                    .read()
                    .await
                    .get(&layer)
                    .and_then(|data| data.get(&key).cloned())
                    .unwrap_or(serde_json::json!(0));
                Response::Data { value }
            }
            Request::VerifyUpdate {
                key,
                value,
                age,
                expire_seconds,
                ..
            } => match self.verify_locally(layer, key, value, sender.id, age, expire_seconds) {
                Ok(()) => Response::Ok,
                Err(message) => Response::Error { message },
            },
        }
    }
}

impl NodeInner {
    async fn closest_for(&self, layer: LayerId, key: &DhtId, exclude: &DhtId) -> Vec<Contact> {
        self.routing
            .read()
            .await
            .get(&layer)
            .map(|t| t.find_close_nodes(key, self.config.k, Some(exclude)))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::key::LAYER_SUPPLIERS;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    async fn test_network(size: u16, layer: LayerId) -> Vec<DhtNode> {
        let network = MemoryNetwork::new();
        let mut nodes = Vec::new();
        for i in 0..size {
            let node = DhtNode::memory(&network, addr(5000 + i), KademliaConfig::default()).unwrap();
            node.attach_layer(layer).await.unwrap();
            nodes.push(node);
        }
        for node in nodes.iter().skip(1) {
            node.bootstrap(layer, &[addr(5000)]).await.unwrap();
        }
        nodes
    }

    struct RejectAll;

    impl StoreValidator for RejectAll {
        fn validate_store(
            &self,
            _: LayerId,
            _: &DhtId,
            _: &str,
            existing: Option<&str>,
        ) -> Result<(), String> {
            match existing {
                Some(_) => Err("current revision is 4 ".to_string()),
                None => Ok(()),
            }
        }
    }

    #[tokio::test]
    async fn test_store_and_find_value() {
        let nodes = test_network(8, LAYER_DEFAULT).await;

        let outcome = nodes[3]
            .set_value("nickname:alice:0:7", "{\"a\":1}", 0, 3600, true, LAYER_DEFAULT)
            .await
            .unwrap();
        assert!(outcome.acknowledged() > 0);

        match nodes[6].get_value("nickname:alice:0:7", LAYER_DEFAULT).await.unwrap() {
            Lookup::Values(values) => assert!(values.iter().all(|v| v == "{\"a\":1}")),
            Lookup::Contacts(_) => panic!("value not found"),
        }
        match nodes[6].get_value("nickname:bob:0:7", LAYER_DEFAULT).await.unwrap() {
            Lookup::Contacts(contacts) => assert!(!contacts.is_empty()),
            Lookup::Values(_) => panic!("unexpected value"),
        }
    }

    #[tokio::test]
    async fn test_store_arbitration_error_is_collected() {
        let nodes = test_network(5, LAYER_DEFAULT).await;
        for node in &nodes {
            node.set_validator(Arc::new(RejectAll));
        }
        nodes[1]
            .set_value("k:x:0:7", "first", 0, 3600, true, LAYER_DEFAULT)
            .await
            .unwrap();
        let outcome = nodes[2]
            .set_value("k:x:0:7", "second", 0, 3600, true, LAYER_DEFAULT)
            .await
            .unwrap();
        assert!(outcome.results.iter().any(|(_, r)| matches!(
            r,
            Ok(Response::Error { message }) if message.contains("current revision is 4")
        )));
    }

    #[tokio::test]
    async fn test_delete_key_is_idempotent() {
        let nodes = test_network(5, LAYER_DEFAULT).await;
        nodes[0]
            .set_value("k:y:0:7", "v", 0, 3600, false, LAYER_DEFAULT)
            .await
            .unwrap();
        nodes[4].delete_key("k:y:0:7", LAYER_DEFAULT).await.unwrap();
        nodes[4].delete_key("k:y:0:7", LAYER_DEFAULT).await.unwrap();
        assert!(matches!(
            nodes[2].get_value("k:y:0:7", LAYER_DEFAULT).await.unwrap(),
            Lookup::Contacts(_)
        ));
    }

    #[tokio::test]
    async fn test_layers_are_independent() {
        let nodes = test_network(4, LAYER_SUPPLIERS).await;
        nodes[1]
            .set_value("k:z:0:7", "v", 0, 3600, false, LAYER_SUPPLIERS)
            .await
            .unwrap();
        assert!(matches!(
            nodes[2].get_value("k:z:0:7", LAYER_DEFAULT).await.unwrap(),
            Lookup::Contacts(_)
        ));
        assert!(matches!(
            nodes[2].get_value("k:z:0:7", 6).await,
            Err(DhtError::LayerNotAttached(6))
        ));
    }

    #[tokio::test]
    async fn test_request_node_data() {
        let nodes = test_network(3, LAYER_SUPPLIERS).await;
        nodes[1]
            .set_node_data(LAYER_SUPPLIERS, "idurl", serde_json::json!("http://id.net/b.xml"))
            .await;
        let value = nodes[2]
            .request(&nodes[1].contact(), "idurl", LAYER_SUPPLIERS)
            .await
            .unwrap();
        assert_eq!(value, "http://id.net/b.xml");
        let missing = nodes[2]
            .request(&nodes[1].contact(), "nickname", LAYER_SUPPLIERS)
            .await
            .unwrap();
        assert_eq!(missing, 0);
    }

    #[tokio::test]
    async fn test_verify_update_stores_missing_value() {
        let nodes = test_network(3, LAYER_DEFAULT).await;
        let results = nodes[0]
            .verify_update(&[nodes[2].contact()], "k:w:0:7", "v", 0, 3600, LAYER_DEFAULT)
            .await;
        assert!(matches!(results[0].1, Ok(Response::Ok)));
        let stored = nodes[2]
            .local_value(&DhtId::from_key("k:w:0:7"), LAYER_DEFAULT)
            .unwrap()
            .unwrap();
        assert_eq!(stored.value, "v");
    }

    #[tokio::test]
    async fn test_short_expiry_is_clamped() {
        let nodes = test_network(1, LAYER_DEFAULT).await;
        nodes[0]
            .set_value("k:e:0:7", "v", 0, 5, false, LAYER_DEFAULT)
            .await
            .unwrap();
        let stored = nodes[0]
            .local_value(&DhtId::from_key("k:e:0:7"), LAYER_DEFAULT)
            .unwrap()
            .unwrap();
        assert_eq!(stored.expire_seconds, KEY_EXPIRE_MIN_SECONDS);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_same_revision_stores_accept_one() {
        use crate::records::{RecordArbiter, SuppliersRecord};
        use serde_json::json;
        use std::sync::Barrier;

        let network = MemoryNetwork::new();
        let node = DhtNode::memory(&network, addr(5100), KademliaConfig::default()).unwrap();
        node.attach_layer(LAYER_SUPPLIERS).await.unwrap();
        node.set_validator(Arc::new(RecordArbiter::new()));

        let printable = SuppliersRecord::key_for("http://id.net/c.xml");
        let key = DhtId::from_key(&printable);
        let family = |revision: u64, first: &str| {
            json!({
                "type": "suppliers",
                "key": printable,
                "timestamp": 1,
                "revision": revision,
                "customer_idurl": "http://id.net/c.xml",
                "ecc_map": "ecc/2x2",
                "suppliers": [first, ""],
            })
            .to_string()
        };
        node.inner
            .store_locally(LAYER_SUPPLIERS, key, family(2, "http://id.net/s.xml"), node.id(), 0, 3600)
            .unwrap();

        let writers = 8;
        let barrier = Arc::new(Barrier::new(writers));
        let mut tasks = Vec::new();
        for i in 0..writers {
            let inner = node.inner.clone();
            let barrier = barrier.clone();
            let value = family(3, &format!("http://id.net/s{}.xml", i));
            tasks.push(tokio::task::spawn_blocking(move || {
                barrier.wait();
                inner.store_locally(LAYER_SUPPLIERS, key, value, DhtId::random(), 0, 3600)
            }));
        }
        let mut accepted = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(()) => accepted += 1,
                Err(message) => assert!(message.contains("current revision is 3"), "{}", message),
            }
        }
        assert_eq!(accepted, 1);
    }
}
