//! Node configuration
//!
//! Every option has a default so an empty TOML file yields a working node.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub dht: DhtConfig,
    #[serde(default)]
    pub customer: CustomerConfig,
    #[serde(default)]
    pub employer: EmployerConfig,
    #[serde(default)]
    pub signaling: SignalingConfig,
    #[serde(default)]
    pub blockchain: BlockchainConfig,
    #[serde(default)]
    pub blockchain_authority: AuthorityConfig,
    #[serde(default)]
    pub blockchain_registrant: RegistrantConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Root directory for the DHT stores, record cache, contacts and wallet
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// IDURL of this node
    #[serde(default = "default_idurl")]
    pub idurl: String,

    /// Directory holding known identity documents (`<username>.json`)
    #[serde(default)]
    pub identities_dir: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            idurl: default_idurl(),
            identities_dir: None,
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("p2p-backup")
}

fn default_idurl() -> String {
    "http://localhost/node.xml".to_string()
}

/// Kademlia network-config record plus the per-layer options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhtConfig {
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,

    /// Seed nodes as `host:port`
    #[serde(default)]
    pub known_nodes: Vec<String>,

    /// Layers joined in addition to the default layer 0
    #[serde(default)]
    pub attached_layers: Vec<u32>,

    /// Bucket size
    #[serde(default = "default_k")]
    pub k: usize,

    /// Lookup parallelism
    #[serde(default = "default_alpha")]
    pub alpha: usize,

    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_secs: u64,

    #[serde(default = "default_refresh_timeout")]
    pub refresh_timeout_secs: u64,

    #[serde(default = "default_data_expire")]
    pub data_expire_secs: u64,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            udp_port: default_udp_port(),
            known_nodes: Vec::new(),
            attached_layers: Vec::new(),
            k: default_k(),
            alpha: default_alpha(),
            rpc_timeout_secs: default_rpc_timeout(),
            refresh_timeout_secs: default_refresh_timeout(),
            data_expire_secs: default_data_expire(),
        }
    }
}

fn default_udp_port() -> u16 { 14441 }
fn default_k() -> usize { 4 }
fn default_alpha() -> usize { 4 }
fn default_rpc_timeout() -> u64 { 10 }
fn default_refresh_timeout() -> u64 { 600 }
fn default_data_expire() -> u64 { 24 * 60 * 60 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerConfig {
    #[serde(default = "default_suppliers_number")]
    pub suppliers_number: usize,

    /// Space to request from each supplier, e.g. "1 GB"
    #[serde(default = "default_needed_space")]
    pub needed_space: String,
}

impl Default for CustomerConfig {
    fn default() -> Self {
        Self {
            suppliers_number: default_suppliers_number(),
            needed_space: default_needed_space(),
        }
    }
}

fn default_suppliers_number() -> usize { 2 }
fn default_needed_space() -> String { "1 GB".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmployerConfig {
    /// Run the employer loop on this node
    #[serde(default)]
    pub enabled: bool,

    /// Preferred candidate IDURLs tried before the random walk
    #[serde(default)]
    pub candidates: Vec<String>,

    /// Replace one supplier when offline count reaches the fire-hire bound
    #[serde(default = "default_true")]
    pub replace_critically_offline: bool,

    #[serde(default = "default_employer_interval")]
    pub interval_secs: u64,
}

impl Default for EmployerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            candidates: Vec::new(),
            replace_critically_offline: true,
            interval_secs: default_employer_interval(),
        }
    }
}

fn default_employer_interval() -> u64 { 60 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    #[serde(default)]
    pub listen_port: u16,

    /// Multiaddrs to dial at start-up
    #[serde(default)]
    pub bootstrap: Vec<String>,

    #[serde(default = "default_review_timeout")]
    pub review_timeout_secs: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            listen_port: 0,
            bootstrap: Vec::new(),
            review_timeout_secs: default_review_timeout(),
        }
    }
}

fn default_review_timeout() -> u64 { 10 }

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockchainConfig {
    /// Wallet server address as `host:port`
    #[serde(default)]
    pub wallet_server: Option<String>,

    /// Defaults to `<data_dir>/blockchain`
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorityConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_reading_limit")]
    pub requests_reading_limit: u32,

    #[serde(default)]
    pub requests_reading_offset: u32,

    #[serde(default)]
    pub registration_bonus_coins: u64,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            requests_reading_limit: default_reading_limit(),
            requests_reading_offset: 0,
            registration_bonus_coins: 0,
        }
    }
}

fn default_reading_limit() -> u32 { 10 }

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrantConfig {
    #[serde(default)]
    pub enabled: bool,
}

fn default_true() -> bool { true }
