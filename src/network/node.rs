//! libp2p signaling node

use async_trait::async_trait;
use futures::StreamExt;
use libp2p::{
    identity, multiaddr::Protocol, noise,
    request_response::{self, OutboundRequestId, ResponseChannel},
    swarm::SwarmEvent,
    yamux, Multiaddr, PeerId, Swarm,
};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::behaviour::{ContactsEvent, SignalBehaviour, SignalBehaviourEvent};
use super::protocol::{ContactsPacket, SignalRequest, SignalResponse};
use super::{ContactsHandler, ContactsSender, SignalError};
use crate::identity::{IdUrl, IdentityCache};

/// Signaling node configuration
#[derive(Clone)]
pub struct SignalingConfig {
    /// Port to listen on (0 for random)
    pub listen_port: u16,
    /// Peers dialed at start-up
    pub bootstrap: Vec<Multiaddr>,
    /// Transport-level limit for one request
    pub request_timeout: Duration,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            listen_port: 0,
            bootstrap: vec![],
            request_timeout: Duration::from_secs(30),
        }
    }
}

type Reply = oneshot::Sender<Result<SignalResponse, SignalError>>;

enum Command {
    Send {
        peer: PeerId,
        addr: Multiaddr,
        recipient: IdUrl,
        request: SignalRequest,
        reply: Reply,
    },
}

/// Owns the swarm; driven by [`SignalingNode::run`]
pub struct SignalingNode {
    swarm: Swarm<SignalBehaviour>,
    commands: mpsc::Receiver<Command>,
    answers_tx: mpsc::Sender<(ResponseChannel<SignalResponse>, SignalResponse)>,
    answers_rx: mpsc::Receiver<(ResponseChannel<SignalResponse>, SignalResponse)>,
    pending: HashMap<OutboundRequestId, (IdUrl, Reply)>,
    listen_tx: watch::Sender<Vec<Multiaddr>>,
}

impl SignalingNode {
    /// Create the node and the handle used to send packets through it
    pub fn new(
        config: SignalingConfig,
        identities: Arc<IdentityCache>,
        me: IdUrl,
    ) -> Result<(Self, SignalingHandle), SignalError> {
        let local_key = identity::Keypair::generate_ed25519();
        let local_peer_id = PeerId::from(local_key.public());
        let local_public_key = local_key.public();
        info!("Signaling peer ID: {}", local_peer_id);

        let request_timeout = config.request_timeout;
        let mut swarm = libp2p::SwarmBuilder::with_existing_identity(local_key)
            .with_tokio()
            .with_tcp(
                libp2p::tcp::Config::default(),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(|e| SignalError::Transport(e.to_string()))?
            .with_quic()
            .with_behaviour(|_| SignalBehaviour::new(local_public_key, request_timeout))
            .map_err(|e| SignalError::Transport(e.to_string()))?
            .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(Duration::from_secs(60)))
            .build();

        let listen_addr: Multiaddr = format!("/ip4/0.0.0.0/tcp/{}", config.listen_port)
            .parse()
            .map_err(|e: libp2p::multiaddr::Error| SignalError::Transport(e.to_string()))?;
        swarm
            .listen_on(listen_addr)
            .map_err(|e| SignalError::Transport(e.to_string()))?;

        for addr in config.bootstrap {
            if let Err(e) = swarm.dial(addr.clone()) {
                warn!("Failed to dial bootstrap peer {}: {}", addr, e);
            }
        }

        let (commands_tx, commands) = mpsc::channel(100);
        let (answers_tx, answers_rx) = mpsc::channel(100);
        let (listen_tx, listen_rx) = watch::channel(Vec::new());

        let node = Self {
            swarm,
            commands,
            answers_tx,
            answers_rx,
            pending: HashMap::new(),
            listen_tx,
        };
        let handle = SignalingHandle {
            commands: commands_tx,
            identities,
            me,
            local_peer_id,
            listen: listen_rx,
        };
        Ok((node, handle))
    }

    /// Run the node event loop until `shutdown` fires
    pub async fn run(mut self, handler: Weak<dyn ContactsHandler>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = self.swarm.select_next_some() => self.handle_swarm_event(event, &handler),
                Some(command) = self.commands.recv() => self.handle_command(command),
                Some((channel, response)) = self.answers_rx.recv() => {
                    if self.swarm.behaviour_mut().contacts.send_response(channel, response).is_err() {
                        debug!("Peer went away before the answer was sent");
                    }
                }
            }
        }
        for (_, (recipient, reply)) in self.pending.drain() {
            let _ = reply.send(Err(SignalError::Unreachable(recipient, "node stopped".into())));
        }
        info!("Signaling node stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Send {
                peer,
                addr,
                recipient,
                request,
                reply,
            } => {
                self.swarm.add_peer_address(peer, addr);
                let request_id = self
                    .swarm
                    .behaviour_mut()
                    .contacts
                    .send_request(&peer, request);
                self.pending.insert(request_id, (recipient, reply));
            }
        }
    }

    fn handle_swarm_event(
        &mut self,
        event: SwarmEvent<SignalBehaviourEvent>,
        handler: &Weak<dyn ContactsHandler>,
    ) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("Listening on {}", address);
                self.listen_tx.send_modify(|addrs| addrs.push(address));
            }
            SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                debug!("Connected to {}", peer_id);
            }
            SwarmEvent::ConnectionClosed { peer_id, .. } => {
                debug!("Disconnected from {}", peer_id);
            }
            SwarmEvent::Behaviour(SignalBehaviourEvent::Contacts(event)) => {
                self.handle_contacts_event(event, handler);
            }
            SwarmEvent::Behaviour(SignalBehaviourEvent::Identify(
                libp2p::identify::Event::Received { peer_id, info, .. },
            )) => {
                debug!("Identified peer {}: {}", peer_id, info.agent_version);
                for addr in info.listen_addrs {
                    self.swarm.add_peer_address(peer_id, addr);
                }
            }
            _ => {}
        }
    }

    fn handle_contacts_event(&mut self, event: ContactsEvent, handler: &Weak<dyn ContactsHandler>) {
        match event {
            request_response::Event::Message { peer, message } => match message {
                request_response::Message::Request {
                    request, channel, ..
                } => {
                    let Some(handler) = handler.upgrade() else {
                        let _ = self.swarm.behaviour_mut().contacts.send_response(
                            channel,
                            SignalResponse::fail("no handler for contacts packets"),
                        );
                        return;
                    };
                    debug!(
                        "Contacts {} from {} ({})",
                        request.packet.body.kind(),
                        request.sender,
                        peer
                    );
                    let answers = self.answers_tx.clone();
                    tokio::spawn(async move {
                        let response = handler.handle_contacts(request.sender, request.packet).await;
                        let _ = answers.send((channel, response)).await;
                    });
                }
                request_response::Message::Response {
                    request_id,
                    response,
                } => {
                    if let Some((_, reply)) = self.pending.remove(&request_id) {
                        let _ = reply.send(Ok(response));
                    }
                }
            },
            request_response::Event::OutboundFailure {
                peer,
                request_id,
                error,
            } => {
                warn!("Contacts request to {} failed: {:?}", peer, error);
                if let Some((recipient, reply)) = self.pending.remove(&request_id) {
                    let error = match error {
                        request_response::OutboundFailure::Timeout => SignalError::Timeout(recipient),
                        other => SignalError::Unreachable(recipient, other.to_string()),
                    };
                    let _ = reply.send(Err(error));
                }
            }
            request_response::Event::InboundFailure { peer, error, .. } => {
                warn!("Contacts request from {} failed: {:?}", peer, error);
            }
            _ => {}
        }
    }
}

/// Cheap handle used by the rest of the crate to send contacts packets
#[derive(Clone)]
pub struct SignalingHandle {
    commands: mpsc::Sender<Command>,
    identities: Arc<IdentityCache>,
    me: IdUrl,
    local_peer_id: PeerId,
    listen: watch::Receiver<Vec<Multiaddr>>,
}

impl SignalingHandle {
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Addresses to publish as contacts in the own identity document
    pub fn contact_addrs(&self) -> Vec<Multiaddr> {
        self.listen
            .borrow()
            .iter()
            .cloned()
            .map(|addr| addr.with(Protocol::P2p(self.local_peer_id)))
            .collect()
    }

    /// First identity contact that names a libp2p peer
    async fn resolve(&self, recipient: &IdUrl) -> Result<(PeerId, Multiaddr), SignalError> {
        let identity = self.identities.immediately_caching(recipient).await?;
        identity
            .contacts
            .iter()
            .filter_map(|contact| contact.parse::<Multiaddr>().ok())
            .find_map(|addr| match addr.iter().last() {
                Some(Protocol::P2p(peer)) => Some((peer, addr)),
                _ => None,
            })
            .ok_or_else(|| {
                SignalError::Unreachable(recipient.clone(), "no libp2p contact".to_string())
            })
    }
}

#[async_trait]
impl ContactsSender for SignalingHandle {
    async fn send_contacts(
        &self,
        recipient: &IdUrl,
        packet: ContactsPacket,
    ) -> Result<SignalResponse, SignalError> {
        let (peer, addr) = self.resolve(recipient).await?;
        let (reply, answer) = oneshot::channel();
        self.commands
            .send(Command::Send {
                peer,
                addr,
                recipient: recipient.clone(),
                request: SignalRequest {
                    sender: self.me.clone(),
                    packet,
                },
                reply,
            })
            .await
            .map_err(|_| SignalError::Closed)?;
        answer.await.map_err(|_| SignalError::Closed)?
    }
}
