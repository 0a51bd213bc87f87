//! Process-wide identity cache
//!
//! Identities are only written through [`IdentityCache::immediately_caching`],
//! which is idempotent for the same IDURL.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::idurl::{IdUrl, IdUrlInterner};

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Identity not found: {0}")]
    NotFound(String),
    #[error("Failed to read identity: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed identity: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Published identity document of a peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    /// IDURLs under which this document is served, the first one is current
    pub sources: Vec<String>,
    /// Public key text, e.g. `ssh-rsa AAAA...`
    pub public_key: String,
    /// Transport contacts, e.g. libp2p multiaddrs
    #[serde(default)]
    pub contacts: Vec<String>,
    #[serde(default)]
    pub revision: u64,
}

impl Identity {
    pub fn idurl(&self) -> IdUrl {
        self.sources.first().cloned().map(IdUrl::new).unwrap_or_default()
    }

    pub fn username(&self) -> String {
        self.idurl().username()
    }

    /// Public key with the leading key-format token stripped
    pub fn clean_public_key(&self) -> &str {
        self.public_key
            .strip_prefix("ssh-rsa ")
            .unwrap_or(&self.public_key)
    }
}

/// Source of identity documents for IDURLs not yet cached
#[async_trait]
pub trait IdentityFetcher: Send + Sync {
    async fn fetch(&self, idurl: &str) -> Result<Identity, IdentityError>;
}

/// Identity cache shared by all components of one node
pub struct IdentityCache {
    fetcher: Arc<dyn IdentityFetcher>,
    interner: Arc<IdUrlInterner>,
    identities: RwLock<HashMap<String, Identity>>,
}

impl IdentityCache {
    pub fn new(fetcher: Arc<dyn IdentityFetcher>, interner: Arc<IdUrlInterner>) -> Self {
        Self {
            fetcher,
            interner,
            identities: RwLock::new(HashMap::new()),
        }
    }

    /// Return the cached identity or fetch and cache it
    pub async fn immediately_caching(&self, idurl: &IdUrl) -> Result<Identity, IdentityError> {
        if let Some(identity) = self.get(idurl).await {
            return Ok(identity);
        }
        let identity = self.fetcher.fetch(idurl.to_text()).await?;
        self.cache(identity.clone()).await;
        if !identity.sources.iter().any(|s| s == idurl.to_text()) {
            // served under a form the document itself no longer lists
            self.interner
                .record_rotation(idurl.to_text(), identity.idurl().to_text());
            self.identities
                .write()
                .await
                .insert(idurl.to_text().to_string(), identity.clone());
        }
        debug!("Cached identity {}", idurl);
        Ok(identity)
    }

    /// Store an identity document under all of its sources
    pub async fn cache(&self, identity: Identity) {
        if self
            .interner
            .observe_identity(&identity.sources, &identity.public_key)
        {
            info!("Found rotated identity for {}", identity.idurl());
        }
        let mut identities = self.identities.write().await;
        for source in &identity.sources {
            identities.insert(source.clone(), identity.clone());
        }
    }

    /// Cached identity for any known form of `idurl`
    pub async fn get(&self, idurl: &IdUrl) -> Option<Identity> {
        let identities = self.identities.read().await;
        let resolved = self.interner.canonicalize(idurl);
        let found = resolved
            .forms()
            .chain(idurl.forms())
            .find_map(|form| identities.get(form).cloned());
        found
    }

    pub async fn is_cached(&self, idurl: &IdUrl) -> bool {
        self.get(idurl).await.is_some()
    }

    pub fn interner(&self) -> &Arc<IdUrlInterner> {
        &self.interner
    }
}

/// In-memory identity server
#[derive(Default)]
pub struct MemoryIdentitySource {
    identities: RwLock<HashMap<String, Identity>>,
}

impl MemoryIdentitySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn publish(&self, identity: Identity) {
        let mut identities = self.identities.write().await;
        for source in &identity.sources {
            identities.insert(source.clone(), identity.clone());
        }
    }

    /// Serve `identity` also under a retired IDURL
    pub async fn publish_as(&self, idurl: &str, identity: Identity) {
        self.identities
            .write()
            .await
            .insert(idurl.to_string(), identity);
    }
}

#[async_trait]
impl IdentityFetcher for MemoryIdentitySource {
    async fn fetch(&self, idurl: &str) -> Result<Identity, IdentityError> {
        self.identities
            .read()
            .await
            .get(idurl)
            .cloned()
            .ok_or_else(|| IdentityError::NotFound(idurl.to_string()))
    }
}

/// Identities stored as `<dir>/<username>.json`
pub struct DirectoryIdentitySource {
    dir: PathBuf,
}

impl DirectoryIdentitySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl IdentityFetcher for DirectoryIdentitySource {
    async fn fetch(&self, idurl: &str) -> Result<Identity, IdentityError> {
        let path = self
            .dir
            .join(format!("{}.json", IdUrl::new(idurl).username()));
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(IdentityError::NotFound(idurl.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn alice(source: &str) -> Identity {
        Identity {
            sources: vec![source.to_string()],
            public_key: "ssh-rsa AAAAalice".to_string(),
            contacts: vec![],
            revision: 1,
        }
    }

    #[tokio::test]
    async fn test_immediately_caching_is_idempotent() {
        let source = Arc::new(MemoryIdentitySource::new());
        source.publish(alice("http://a.net/alice.xml")).await;
        let cache = IdentityCache::new(source.clone(), Arc::new(IdUrlInterner::new()));

        let idurl = IdUrl::new("http://a.net/alice.xml");
        let first = cache.immediately_caching(&idurl).await.unwrap();
        let second = cache.immediately_caching(&idurl).await.unwrap();
        assert_eq!(first.public_key, second.public_key);
        assert_eq!(first.clean_public_key(), "AAAAalice");
    }

    #[tokio::test]
    async fn test_missing_identity() {
        let cache = IdentityCache::new(
            Arc::new(MemoryIdentitySource::new()),
            Arc::new(IdUrlInterner::new()),
        );
        let result = cache.immediately_caching(&IdUrl::new("http://a.net/bob.xml")).await;
        assert!(matches!(result, Err(IdentityError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_rotation_detected_on_caching() {
        let source = Arc::new(MemoryIdentitySource::new());
        let interner = Arc::new(IdUrlInterner::new());
        let cache = IdentityCache::new(source.clone(), interner.clone());

        cache.cache(alice("http://a.net/alice.xml")).await;
        source.publish(alice("http://b.net/alice.xml")).await;
        cache
            .immediately_caching(&IdUrl::new("http://b.net/alice.xml"))
            .await
            .unwrap();

        assert!(interner.rotated_equal("http://a.net/alice.xml", "http://b.net/alice.xml"));
        let cached = cache.get(&IdUrl::new("http://a.net/alice.xml")).await.unwrap();
        assert_eq!(cached.idurl().to_text(), "http://b.net/alice.xml");
    }

    #[tokio::test]
    async fn test_directory_source() {
        let dir = tempdir().unwrap();
        let identity = alice("http://a.net/alice.xml");
        std::fs::write(
            dir.path().join("alice.json"),
            serde_json::to_vec(&identity).unwrap(),
        )
        .unwrap();

        let source = DirectoryIdentitySource::new(dir.path());
        let fetched = source.fetch("http://a.net/alice.xml").await.unwrap();
        assert_eq!(fetched.public_key, identity.public_key);
        assert!(matches!(
            source.fetch("http://a.net/carol.xml").await,
            Err(IdentityError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_get_cached_forms_only() {
        let cache = IdentityCache::new(
            Arc::new(MemoryIdentitySource::new()),
            Arc::new(IdUrlInterner::new()),
        );
        let idurl = IdUrl::new("http://a.net/alice.xml");
        assert!(cache.get(&idurl).await.is_none());
        assert!(!cache.is_cached(&idurl).await);

        cache.cache(alice("http://a.net/alice.xml")).await;
        let cached = cache.get(&idurl).await.unwrap();
        assert_eq!(cached.public_key, "ssh-rsa AAAAalice");
        assert!(cache.get(&IdUrl::new("http://a.net/bob.xml")).await.is_none());
    }
}
