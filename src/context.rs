//! Shared services of one running node
//!
//! `CoreContext` owns everything the coordinators, the employer and the
//! blockchain loops reach for: the DHT, the record and relations layers,
//! the contacts database, the identity cache, signaling and the family
//! registry. Components get what they need from here instead of module
//! level state.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::blockchain::{Authority, BismuthClient, BlockchainClient, BlockchainError, Registrant, WalletKey};
use crate::config::Config;
use crate::dht::{DhtError, DhtNode, KademliaConfig, LayerId, LayerStores, LAYER_SUPPLIERS};
use crate::employer::{Employer, SignalingConnector, NODE_DATA_IDURL};
use crate::family::{CustomerFamilies, FamilyConfig};
use crate::identity::{DirectoryIdentitySource, IdUrl, IdUrlInterner, IdentityCache, IdentityError};
use crate::network::{self, ContactsHandler, ContactsSender, SignalError, SignalingNode};
use crate::records::{RecordArbiter, RecordCache, RecordLayer};
use crate::relations::Relations;
use crate::storage::{ContactsError, ContactsStore};

#[derive(Error, Debug)]
pub enum ContextError {
    #[error("DHT error: {0}")]
    Dht(#[from] DhtError),
    #[error("Contacts error: {0}")]
    Contacts(#[from] ContactsError),
    #[error("Signaling error: {0}")]
    Signal(#[from] SignalError),
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),
    #[error("Blockchain error: {0}")]
    Blockchain(#[from] BlockchainError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid address {0}")]
    InvalidAddress(String),
}

pub struct CoreContext {
    config: Config,
    relations: Relations,
    signals: Arc<dyn ContactsSender>,
    families: Arc<CustomerFamilies>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl CoreContext {
    /// Bundle already built services; the family registry is created here
    pub fn assemble(
        config: Config,
        relations: Relations,
        signals: Arc<dyn ContactsSender>,
        shutdown: CancellationToken,
    ) -> Self {
        let family_config = FamilyConfig {
            review_timeout: Duration::from_secs(config.signaling.review_timeout_secs),
            default_suppliers: config.customer.suppliers_number,
            ..FamilyConfig::default()
        };
        let families = CustomerFamilies::new(
            relations.clone(),
            signals.clone(),
            family_config,
            shutdown.clone(),
        );
        Self {
            config,
            relations,
            signals,
            families,
            shutdown,
            tasks: Vec::new(),
        }
    }

    /// Open the local stores, bind the sockets and join the network
    pub async fn start(config: Config) -> Result<Self, ContextError> {
        let shutdown = CancellationToken::new();
        let data_dir = config.node.data_dir.clone();
        tokio::fs::create_dir_all(&data_dir).await?;
        let me = IdUrl::new(config.node.idurl.as_str());

        let identities_dir = config
            .node
            .identities_dir
            .clone()
            .unwrap_or_else(|| data_dir.join("identities"));
        let identities = Arc::new(IdentityCache::new(
            Arc::new(DirectoryIdentitySource::new(identities_dir)),
            Arc::new(IdUrlInterner::new()),
        ));

        let bind = SocketAddr::from(([0, 0, 0, 0], config.dht.udp_port));
        let (dht, transport) = DhtNode::udp(
            bind,
            KademliaConfig::from(&config.dht),
            LayerStores::open(data_dir.join("dht")),
        )
        .await?;
        dht.set_validator(Arc::new(RecordArbiter::new()));
        let mut tasks = vec![
            tokio::spawn(transport.run(shutdown.clone())),
            tokio::spawn({
                let dht = dht.clone();
                let shutdown = shutdown.clone();
                async move { dht.maintain(shutdown).await }
            }),
        ];

        let seeds = resolve_known_nodes(&config.dht.known_nodes).await;
        for layer in layers_to_attach(&config.dht.attached_layers) {
            dht.attach_layer(layer).await?;
            match dht.bootstrap(layer, &seeds).await {
                Ok(known) => debug!(layer, known, "Layer bootstrapped"),
                Err(e) => warn!("Bootstrap of layer {} failed: {}", layer, e),
            }
        }
        dht.set_node_data(LAYER_SUPPLIERS, NODE_DATA_IDURL, serde_json::json!(me.to_text()))
            .await;

        let records = RecordLayer::new(dht, Arc::new(RecordCache::open(data_dir.join("cache"))));
        let contacts = Arc::new(ContactsStore::open(data_dir.join("contacts"))?);
        let relations = Relations::new(records, identities.clone(), contacts, me.clone());

        let mut bootstrap: Vec<libp2p::Multiaddr> = Vec::new();
        for addr in &config.signaling.bootstrap {
            bootstrap.push(
                addr.parse()
                    .map_err(|_| ContextError::InvalidAddress(addr.clone()))?,
            );
        }
        let signaling_config = network::SignalingConfig {
            listen_port: config.signaling.listen_port,
            bootstrap,
            ..network::SignalingConfig::default()
        };
        let (node, handle) = SignalingNode::new(signaling_config, identities, me)?;

        let mut context = Self::assemble(config, relations, Arc::new(handle), shutdown);
        let handler: Arc<dyn ContactsHandler> = context.families.clone();
        let handler = Arc::downgrade(&handler);
        tasks.push(tokio::spawn(node.run(handler, context.shutdown.clone())));
        context.tasks.append(&mut tasks);

        let restored = context.families.restore().await;
        info!("Node {} started with {} known customers", context.relations.my_idurl(), restored);
        Ok(context)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn relations(&self) -> &Relations {
        &self.relations
    }

    pub fn dht(&self) -> &DhtNode {
        self.relations.records().dht()
    }

    pub fn signals(&self) -> &Arc<dyn ContactsSender> {
        &self.signals
    }

    pub fn families(&self) -> &Arc<CustomerFamilies> {
        &self.families
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn blockchain_dir(&self) -> PathBuf {
        self.config
            .blockchain
            .data_dir
            .clone()
            .unwrap_or_else(|| self.config.node.data_dir.join("blockchain"))
    }

    /// Wallet-server client when one is configured
    fn blockchain_client(&self) -> Result<Option<Arc<dyn BlockchainClient>>, ContextError> {
        let Some(server) = self.config.blockchain.wallet_server.clone() else {
            return Ok(None);
        };
        let dir = self.blockchain_dir();
        let key = WalletKey::load_or_create(&dir)?;
        info!("Using wallet {} with server {}", key.address(), server);
        Ok(Some(Arc::new(BismuthClient::new(server, key, dir))))
    }

    /// Start the employer and the blockchain loops enabled in the configuration
    pub async fn spawn_services(&mut self) -> Result<(), ContextError> {
        self.spawn_services_with(None).await
    }

    /// Same as [`spawn_services`](Self::spawn_services) with an explicit chain client
    pub async fn spawn_services_with(
        &mut self,
        chain: Option<Arc<dyn BlockchainClient>>,
    ) -> Result<(), ContextError> {
        if self.config.employer.enabled {
            let me = self.relations.my_idurl().clone();
            let connector = Arc::new(SignalingConnector::new(self.signals.clone(), me));
            let employer = Arc::new(Employer::new(
                self.relations.clone(),
                connector,
                self.signals.clone(),
                self.config.employer.clone(),
                self.config.customer.suppliers_number,
            ));
            self.tasks.push(tokio::spawn(employer.run(self.shutdown.clone())));
            info!("Employer started");
        }

        let wants_chain =
            self.config.blockchain_authority.enabled || self.config.blockchain_registrant.enabled;
        if !wants_chain {
            return Ok(());
        }
        let chain = match chain {
            Some(chain) => chain,
            None => match self.blockchain_client()? {
                Some(chain) => chain,
                None => {
                    warn!("No wallet server configured, blockchain services stay off");
                    return Ok(());
                }
            },
        };

        if self.config.blockchain_registrant.enabled {
            let identity = self
                .relations
                .identities()
                .immediately_caching(self.relations.my_idurl())
                .await?;
            let registrant = Registrant::new(self.relations.clone(), chain.clone(), identity);
            let shutdown = self.shutdown.clone();
            self.tasks.push(tokio::spawn(async move {
                let state = registrant.run(shutdown).await;
                debug!("Registrant finished in {:?}", state);
            }));
        }
        if self.config.blockchain_authority.enabled {
            let authority = Authority::new(
                self.relations.clone(),
                chain,
                self.config.blockchain_authority.clone(),
            );
            self.tasks.push(tokio::spawn(authority.run(self.shutdown.clone())));
            info!("Blockchain authority started");
        }
        Ok(())
    }

    /// Close every coordinator, stop the background tasks and wait for them
    pub async fn shutdown(self) {
        self.families.shutdown_all().await;
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Background task failed: {}", e);
            }
        }
        if let Err(e) = self.relations.contacts().flush() {
            warn!("Failed flushing contacts: {}", e);
        }
        info!("Node stopped");
    }
}

/// Suppliers layer first, then the configured ones
fn layers_to_attach(configured: &[u32]) -> Vec<LayerId> {
    let mut layers = vec![LAYER_SUPPLIERS];
    for layer in configured {
        if !layers.contains(layer) {
            layers.push(*layer);
        }
    }
    layers
}

async fn resolve_known_nodes(known: &[String]) -> Vec<SocketAddr> {
    let mut seeds = Vec::new();
    for node in known {
        match tokio::net::lookup_host(node.as_str()).await {
            Ok(addrs) => seeds.extend(addrs),
            Err(e) => warn!("Cannot resolve known node {}: {}", node, e),
        }
    }
    seeds
}
