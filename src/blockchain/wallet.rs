//! Wallet key stored in the blockchain-data directory
//!
//! The key is an Ed25519 signing key kept as hex in `wallet.key`. The
//! wallet address is derived from the public key with BLAKE3.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use std::fs;
use std::path::Path;
use tracing::info;

use super::BlockchainError;

pub const WALLET_FILE: &str = "wallet.key";

/// Hex characters in a wallet address
const ADDRESS_LEN: usize = 56;

pub struct WalletKey {
    signing: SigningKey,
}

impl WalletKey {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Load the wallet from `dir`, creating a new key on first use
    pub fn load_or_create(dir: &Path) -> Result<Self, BlockchainError> {
        let path = dir.join(WALLET_FILE);
        if path.exists() {
            let text = fs::read_to_string(&path)?;
            let bytes = hex::decode(text.trim()).map_err(|e| BlockchainError::Key(e.to_string()))?;
            let secret: [u8; 32] = bytes
                .try_into()
                .map_err(|_| BlockchainError::Key(format!("{} has wrong length", path.display())))?;
            return Ok(Self {
                signing: SigningKey::from_bytes(&secret),
            });
        }
        fs::create_dir_all(dir)?;
        let key = Self::generate();
        fs::write(&path, hex::encode(key.signing.to_bytes()))?;
        info!("Created wallet {} in {}", key.address(), dir.display());
        Ok(key)
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    pub fn address(&self) -> String {
        let hash = blake3::hash(self.verifying_key().as_bytes());
        hash.to_hex().as_str()[..ADDRESS_LEN].to_string()
    }

    /// Public key as sent along with a transaction
    pub fn encoded_public_key(&self) -> String {
        BASE64.encode(self.verifying_key().as_bytes())
    }

    /// Base64 signature of `message`
    pub fn sign(&self, message: &str) -> String {
        BASE64.encode(self.signing.sign(message.as_bytes()).to_bytes())
    }

    pub fn verify(&self, message: &str, signature: &str) -> bool {
        let Ok(raw) = BASE64.decode(signature) else {
            return false;
        };
        let Ok(signature) = ed25519_dalek::Signature::from_slice(&raw) else {
            return false;
        };
        self.verifying_key()
            .verify(message.as_bytes(), &signature)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wallet_persists() {
        let dir = tempfile::tempdir().unwrap();
        let first = WalletKey::load_or_create(dir.path()).unwrap();
        let again = WalletKey::load_or_create(dir.path()).unwrap();
        assert_eq!(first.address(), again.address());
        assert_eq!(first.address().len(), 56);
    }

    #[test]
    fn test_sign_and_verify() {
        let key = WalletKey::generate();
        let signature = key.sign("identity:alice");
        assert!(key.verify("identity:alice", &signature));
        assert!(!key.verify("identity:mallory", &signature));
        assert!(!WalletKey::generate().verify("identity:alice", &signature));
    }

    #[test]
    fn test_corrupted_key_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(WALLET_FILE), "abcd").unwrap();
        assert!(matches!(
            WalletKey::load_or_create(dir.path()),
            Err(BlockchainError::Key(_))
        ));
    }
}
