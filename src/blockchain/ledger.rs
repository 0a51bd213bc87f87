//! In-memory chain shared by several wallets, used by tests and local runs

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{BlockchainClient, BlockchainError, Transaction};
use crate::unix_now;

#[derive(Default)]
pub struct MemoryLedger {
    transactions: RwLock<Vec<Transaction>>,
    next_id: AtomicU64,
    reject: AtomicBool,
}

impl MemoryLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Client signing with `address`
    pub fn wallet(self: &Arc<Self>, address: impl Into<String>) -> MemoryWallet {
        MemoryWallet {
            ledger: self.clone(),
            address: address.into(),
        }
    }

    /// Make every submission fail until switched back
    pub fn set_rejecting(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    pub async fn transactions(&self) -> Vec<Transaction> {
        self.transactions.read().await.clone()
    }
}

pub struct MemoryWallet {
    ledger: Arc<MemoryLedger>,
    address: String,
}

#[async_trait]
impl BlockchainClient for MemoryWallet {
    fn wallet_address(&self) -> &str {
        &self.address
    }

    async fn find_transactions(
        &self,
        recipient: &str,
        operation: &str,
        openfield: &str,
    ) -> Result<Vec<Transaction>, BlockchainError> {
        let transactions = self.ledger.transactions.read().await;
        Ok(transactions
            .iter()
            .filter(|tx| {
                tx.recipient == recipient && tx.operation == operation && tx.openfield == openfield
            })
            .cloned()
            .collect())
    }

    async fn send_transaction(
        &self,
        recipient: &str,
        amount: u64,
        operation: &str,
        data: &str,
    ) -> Result<String, BlockchainError> {
        if self.ledger.reject.load(Ordering::SeqCst) {
            return Err(BlockchainError::Rejected("ledger is rejecting".to_string()));
        }
        let mut transactions = self.ledger.transactions.write().await;
        let id = format!("tx-{}", self.ledger.next_id.fetch_add(1, Ordering::Relaxed));
        let height = transactions.len() as u64 + 1;
        transactions.push(Transaction {
            id: id.clone(),
            block_height: Some(height),
            timestamp: unix_now() as f64,
            address: self.address.clone(),
            recipient: recipient.to_string(),
            amount: amount as f64,
            operation: operation.to_string(),
            openfield: data.to_string(),
        });
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shared_chain() {
        let ledger = MemoryLedger::new();
        let authority = ledger.wallet("authority");
        let alice = ledger.wallet("wallet-a");
        authority
            .send_transaction("wallet-a", 3, "identity", "alice:KEY")
            .await
            .unwrap();
        let found = alice
            .find_transactions("wallet-a", "identity", "alice:KEY")
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].address, "authority");
        assert!(alice
            .find_transactions("wallet-a", "identity", "alice:OTHER")
            .await
            .unwrap()
            .is_empty());

        ledger.set_rejecting(true);
        assert!(authority.send_transaction("x", 0, "identity", "y").await.is_err());
        assert_eq!(ledger.transactions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_block_heights_follow_chain_length() {
        let ledger = MemoryLedger::new();
        let authority = ledger.wallet("authority");
        for i in 0..3 {
            authority
                .send_transaction("wallet-a", 1, "identity", &format!("k{}", i))
                .await
                .unwrap();
        }
        let heights: Vec<_> = ledger
            .transactions()
            .await
            .iter()
            .map(|t| t.block_height)
            .collect();
        assert_eq!(heights, vec![Some(1), Some(2), Some(3)]);
    }
}
