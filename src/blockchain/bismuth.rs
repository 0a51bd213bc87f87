//! Bismuth wallet-server client
//!
//! Every message on the socket is a JSON value preceded by its length as
//! ten zero-padded decimal digits. A command is sent as the command name
//! followed by one message per parameter, and the server answers with a
//! single message.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::wallet::WalletKey;
use super::{BlockchainClient, BlockchainError, Transaction};

const HEADER_LEN: usize = 10;

/// Largest reply accepted from the server
const MAX_MESSAGE: usize = 16 * 1024 * 1024;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(35);

/// Transactions returned by one search
const SEARCH_LIMIT: u32 = 10;

pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Value,
) -> Result<(), BlockchainError> {
    let body = serde_json::to_string(message)?;
    let header = format!("{:0width$}", body.len(), width = HEADER_LEN);
    if header.len() != HEADER_LEN {
        return Err(BlockchainError::Protocol(format!("message of {} bytes is too large", body.len())));
    }
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(body.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Value, BlockchainError> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let len: usize = std::str::from_utf8(&header)
        .ok()
        .and_then(|text| text.trim().parse().ok())
        .ok_or_else(|| BlockchainError::Protocol(format!("bad header {:?}", header)))?;
    if len > MAX_MESSAGE {
        return Err(BlockchainError::Protocol(format!("message of {} bytes is too large", len)));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Parse one row of a `txsearch` answer
///
/// Rows are `[block_height, timestamp, address, recipient, amount,
/// signature, public_key, block_hash, fee, reward, operation, openfield]`.
fn parse_transaction(row: &Value) -> Option<Transaction> {
    let fields = row.as_array()?;
    if fields.len() < 12 {
        return None;
    }
    let number = |v: &Value| v.as_f64().or_else(|| v.as_str().and_then(|s| s.parse().ok()));
    let text = |v: &Value| v.as_str().map(str::to_string);
    let signature = text(&fields[5])?;
    Some(Transaction {
        id: signature.chars().take(56).collect(),
        block_height: fields[0].as_u64(),
        timestamp: number(&fields[1])?,
        address: text(&fields[2])?,
        recipient: text(&fields[3])?,
        amount: number(&fields[4])?,
        operation: text(&fields[10])?,
        openfield: text(&fields[11])?,
    })
}

pub struct BismuthClient {
    server: String,
    key: WalletKey,
    address: String,
    receipts: PathBuf,
}

impl BismuthClient {
    /// Client for the wallet server at `host:port`, keeping receipts in `data_dir`
    pub fn new(server: impl Into<String>, key: WalletKey, data_dir: impl Into<PathBuf>) -> Self {
        let address = key.address();
        Self {
            server: server.into(),
            key,
            address,
            receipts: data_dir.into().join("receipts"),
        }
    }

    pub async fn command(&self, command: &str, params: &[Value]) -> Result<Value, BlockchainError> {
        let exchange = async {
            let mut stream = TcpStream::connect(&self.server).await?;
            write_message(&mut stream, &json!(command)).await?;
            for param in params {
                write_message(&mut stream, param).await?;
            }
            read_message(&mut stream).await
        };
        match tokio::time::timeout(COMMAND_TIMEOUT, exchange).await {
            Ok(result) => result,
            Err(_) => Err(BlockchainError::Timeout),
        }
    }

    async fn write_receipt(&self, receipt: &Value, signature: &str) -> Result<(), BlockchainError> {
        tokio::fs::create_dir_all(&self.receipts).await?;
        let name = blake3::hash(signature.as_bytes()).to_hex();
        let path = self.receipts.join(format!("{}.json", &name.as_str()[..16]));
        tokio::fs::write(&path, serde_json::to_vec_pretty(receipt)?).await?;
        debug!("Stored receipt {}", path.display());
        Ok(())
    }
}

#[async_trait]
impl BlockchainClient for BismuthClient {
    fn wallet_address(&self) -> &str {
        &self.address
    }

    async fn find_transactions(
        &self,
        recipient: &str,
        operation: &str,
        openfield: &str,
    ) -> Result<Vec<Transaction>, BlockchainError> {
        let query = json!([[Value::Null, recipient, operation, openfield, SEARCH_LIMIT, 0, Value::Null]]);
        let reply = self.command("txsearch", &[query]).await?;
        let rows = reply
            .as_array()
            .ok_or_else(|| BlockchainError::Protocol(format!("unexpected txsearch reply {}", reply)))?;
        let found: Vec<Transaction> = rows.iter().filter_map(parse_transaction).collect();
        if found.len() != rows.len() {
            warn!("Skipped {} malformed transactions", rows.len() - found.len());
        }
        Ok(found)
    }

    async fn send_transaction(
        &self,
        recipient: &str,
        amount: u64,
        operation: &str,
        data: &str,
    ) -> Result<String, BlockchainError> {
        let timestamp = format!(
            "{:.2}",
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or_default()
        );
        let amount = format!("{:.8}", amount as f64);
        let message = format!(
            "('{}', '{}', '{}', '{}', '{}', '{}')",
            timestamp, self.address, recipient, amount, operation, data
        );
        let signature = self.key.sign(&message);
        let tx_id: String = signature.chars().take(56).collect();
        let submit = json!([
            timestamp,
            self.address,
            recipient,
            amount,
            signature,
            self.key.encoded_public_key(),
            operation,
            data
        ]);
        let reply = self.command("mpinsert", &[json!([submit.clone()])]).await?;
        let status = reply
            .as_array()
            .and_then(|items| items.last())
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if status != "Success" {
            return Err(BlockchainError::Rejected(reply.to_string()));
        }
        let receipt = json!({
            "tx_id": tx_id,
            "transaction": submit,
            "reply": reply,
        });
        if let Err(e) = self.write_receipt(&receipt, &signature).await {
            warn!("Failed storing receipt of {}: {}", tx_id, e);
        }
        info!("Sent {} transaction to {}", operation, recipient);
        Ok(tx_id)
    }
}
