//! DHT transports
//!
//! [`UdpTransport`] multiplexes all layers over one UDP socket.
//! [`MemoryNetwork`] routes calls between in-process nodes and is what the
//! multi-node tests run on.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::key::DhtId;
use super::protocol::{fragment, parse_fragment, Body, Envelope, Request, Response};
use super::routing::Contact;
use super::DhtError;

/// Drop partially received messages after this long
const REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Outgoing side of the DHT wire
#[async_trait]
pub trait DhtRpc: Send + Sync {
    async fn call(&self, to: &Contact, request: Request) -> Result<Response, DhtError>;

    /// Ping a node known only by address, learning its id
    async fn ping_addr(&self, addr: SocketAddr) -> Result<DhtId, DhtError>;
}

/// Incoming side of the DHT wire
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, sender: Contact, request: Request) -> Response;
}

type PendingMap = HashMap<u64, oneshot::Sender<Response>>;

struct Partial {
    started: Instant,
    total: u16,
    chunks: HashMap<u16, Vec<u8>>,
}

/// UDP transport shared by all layers of a node
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    own_id: DhtId,
    rpc_timeout: Duration,
    next_id: AtomicU64,
    pending: Mutex<PendingMap>,
    partials: Mutex<HashMap<(SocketAddr, u64), Partial>>,
    handler: RwLock<Option<Weak<dyn RpcHandler>>>,
}

impl UdpTransport {
    pub async fn bind(
        addr: SocketAddr,
        own_id: DhtId,
        rpc_timeout: Duration,
    ) -> Result<Arc<Self>, DhtError> {
        let socket = UdpSocket::bind(addr).await?;
        debug!("DHT listening on udp {}", socket.local_addr()?);
        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            own_id,
            rpc_timeout,
            next_id: AtomicU64::new(rand::random::<u32>() as u64),
            pending: Mutex::new(HashMap::new()),
            partials: Mutex::new(HashMap::new()),
            handler: RwLock::new(None),
        }))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, DhtError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn set_handler(&self, handler: Weak<dyn RpcHandler>) {
        *self.handler.write().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    fn handler(&self) -> Option<Arc<dyn RpcHandler>> {
        self.handler
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .and_then(Weak::upgrade)
    }

    async fn send(&self, to: SocketAddr, envelope: &Envelope) -> Result<(), DhtError> {
        let payload = envelope.encode()?;
        let message_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        for datagram in fragment(message_id, &payload) {
            self.socket.send_to(&datagram, to).await?;
        }
        Ok(())
    }

    async fn request(&self, to: SocketAddr, request: Request) -> Result<Response, DhtError> {
        let rpc_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(rpc_id, tx);

        let envelope = Envelope {
            rpc_id,
            sender: self.own_id,
            sender_port: self.local_addr()?.port(),
            body: Body::Request(request),
        };
        if let Err(e) = self.send(to, &envelope).await {
            self.forget(rpc_id);
            return Err(e);
        }

        match tokio::time::timeout(self.rpc_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(DhtError::Transport("response channel closed".into())),
            Err(_) => {
                self.forget(rpc_id);
                Err(DhtError::Timeout)
            }
        }
    }

    fn forget(&self, rpc_id: u64) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&rpc_id);
    }

    /// Collect one datagram, returning the full message once complete
    fn reassemble(&self, from: SocketAddr, datagram: &[u8]) -> Option<Vec<u8>> {
        let (header, payload) = parse_fragment(datagram)?;
        if header.total == 1 {
            return Some(payload.to_vec());
        }
        let mut partials = self.partials.lock().unwrap_or_else(|e| e.into_inner());
        partials.retain(|_, p| p.started.elapsed() < REASSEMBLY_TIMEOUT);
        let partial = partials
            .entry((from, header.message_id))
            .or_insert_with(|| Partial {
                started: Instant::now(),
                total: header.total,
                chunks: HashMap::new(),
            });
        partial.chunks.insert(header.seq, payload.to_vec());
        if partial.chunks.len() < partial.total as usize {
            return None;
        }
        let partial = partials.remove(&(from, header.message_id))?;
        let mut message = Vec::new();
        for seq in 0..partial.total {
            message.extend_from_slice(partial.chunks.get(&seq)?);
        }
        Some(message)
    }

    /// Receive loop, runs until `shutdown` is cancelled
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut buf = vec![0u8; 65536];
        loop {
            let (len, from) = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        warn!("DHT socket receive failed: {}", e);
                        continue;
                    }
                },
            };
            let Some(message) = self.reassemble(from, &buf[..len]) else {
                continue;
            };
            let envelope = match Envelope::decode(&message) {
                Ok(envelope) => envelope,
                Err(e) => {
                    debug!("Malformed DHT message from {}: {}", from, e);
                    continue;
                }
            };
            match envelope.body {
                Body::Response(response) => {
                    let waiter = self
                        .pending
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(&envelope.rpc_id);
                    if let Some(waiter) = waiter {
                        let _ = waiter.send(response);
                    }
                }
                Body::Request(request) => {
                    let Some(handler) = self.handler() else {
                        continue;
                    };
                    let transport = self.clone();
                    let sender = Contact::new(
                        envelope.sender,
                        SocketAddr::new(from.ip(), envelope.sender_port),
                    );
                    tokio::spawn(async move {
                        let response = handler.handle(sender, request).await;
                        let reply = Envelope {
                            rpc_id: envelope.rpc_id,
                            sender: transport.own_id,
                            sender_port: transport.local_addr().map(|a| a.port()).unwrap_or(0),
                            body: Body::Response(response),
                        };
                        if let Err(e) = transport.send(from, &reply).await {
                            debug!("Failed to answer {}: {}", from, e);
                        }
                    });
                }
            }
        }
        debug!("DHT receive loop stopped");
    }
}

#[async_trait]
impl DhtRpc for UdpTransport {
    async fn call(&self, to: &Contact, request: Request) -> Result<Response, DhtError> {
        self.request(to.addr, request).await
    }

    async fn ping_addr(&self, addr: SocketAddr) -> Result<DhtId, DhtError> {
        match self.request(addr, Request::Ping).await? {
            Response::Pong { node_id } => Ok(node_id),
            other => Err(DhtError::UnexpectedResponse(format!("{:?}", other))),
        }
    }
}

/// In-process network of DHT nodes addressed by socket address
#[derive(Default)]
pub struct MemoryNetwork {
    nodes: RwLock<HashMap<SocketAddr, Weak<dyn RpcHandler>>>,
    offline: RwLock<HashSet<SocketAddr>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transport for a node living at `addr`
    pub fn transport(self: &Arc<Self>, own: Contact) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            network: self.clone(),
            own,
        })
    }

    pub fn register(&self, addr: SocketAddr, handler: Weak<dyn RpcHandler>) {
        self.nodes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(addr, handler);
    }

    /// Make a node unreachable without removing it
    pub fn set_offline(&self, addr: SocketAddr, offline: bool) {
        let mut set = self.offline.write().unwrap_or_else(|e| e.into_inner());
        if offline {
            set.insert(addr);
        } else {
            set.remove(&addr);
        }
    }

    fn handler(&self, addr: &SocketAddr) -> Option<Arc<dyn RpcHandler>> {
        if self
            .offline
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(addr)
        {
            return None;
        }
        self.nodes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(addr)
            .and_then(Weak::upgrade)
    }
}

pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    own: Contact,
}

#[async_trait]
impl DhtRpc for MemoryTransport {
    async fn call(&self, to: &Contact, request: Request) -> Result<Response, DhtError> {
        let handler = self.network.handler(&to.addr).ok_or(DhtError::Timeout)?;
        Ok(handler.handle(self.own.clone(), request).await)
    }

    async fn ping_addr(&self, addr: SocketAddr) -> Result<DhtId, DhtError> {
        let handler = self.network.handler(&addr).ok_or(DhtError::Timeout)?;
        match handler.handle(self.own.clone(), Request::Ping).await {
            Response::Pong { node_id } => Ok(node_id),
            other => Err(DhtError::UnexpectedResponse(format!("{:?}", other))),
        }
    }
}
