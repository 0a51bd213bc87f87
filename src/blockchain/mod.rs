//! Blockchain identity confirmation
//!
//! A registrant queues a request for its identity in the DHT and waits for
//! a confirming transaction; an authority sweeps the queue and submits
//! those transactions. Both talk to the chain through [`BlockchainClient`].

pub mod authority;
pub mod bismuth;
pub mod ledger;
pub mod registrant;
pub mod wallet;

pub use authority::{Authority, AuthorityState, SlotOutcome};
pub use bismuth::BismuthClient;
pub use ledger::{MemoryLedger, MemoryWallet};
pub use registrant::{Registrant, RegistrantState};
pub use wallet::WalletKey;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::relations::RelationsError;

/// Operation name of identity confirming transactions
pub const OPERATION_IDENTITY: &str = "identity";

#[derive(Error, Debug)]
pub enum BlockchainError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Wallet server protocol error: {0}")]
    Protocol(String),
    #[error("Transaction rejected: {0}")]
    Rejected(String),
    #[error("Wallet server timed out")]
    Timeout,
    #[error("Wallet key error: {0}")]
    Key(String),
    #[error("No wallet server configured")]
    NotConfigured,
    #[error(transparent)]
    Relations(#[from] RelationsError),
}

/// A transaction as found on the chain or in the mempool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    #[serde(default)]
    pub block_height: Option<u64>,
    pub timestamp: f64,
    pub address: String,
    pub recipient: String,
    pub amount: f64,
    pub operation: String,
    pub openfield: String,
}

#[async_trait]
pub trait BlockchainClient: Send + Sync {
    /// Address of the wallet this client signs with
    fn wallet_address(&self) -> &str;

    async fn find_transactions(
        &self,
        recipient: &str,
        operation: &str,
        openfield: &str,
    ) -> Result<Vec<Transaction>, BlockchainError>;

    /// Submit a transaction, returns its id
    async fn send_transaction(
        &self,
        recipient: &str,
        amount: u64,
        operation: &str,
        data: &str,
    ) -> Result<String, BlockchainError>;
}

/// Openfield of the transaction confirming `username` with `clean_public_key`
pub fn identity_openfield(username: &str, clean_public_key: &str) -> String {
    format!("{}:{}", username, clean_public_key)
}
