//! Artifact loading and verifying-key caching
//!
//! Proving and verifying keys are fetched through an opaque capability and
//! cached process-wide. Integrity is checked with blake3 when a digest is
//! registered for the identifier.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::constants::circuits;
use crate::errors::{Error, Result};

use super::ProofSystem;

pub fn ccs_id(circuit: &str) -> String {
    format!("{circuit}.ccs")
}

pub fn pk_id(circuit: &str) -> String {
    format!("{circuit}.pk")
}

pub fn vk_id(circuit: &str) -> String {
    format!("{circuit}.vk")
}

/// Generate and register artifacts for every core circuit through the
/// backend. Development and test bootstrap; production deployments load
/// pre-built artifacts instead.
pub async fn bootstrap_artifacts(
    prover: &dyn ProofSystem,
    store: &MemoryArtifactStore,
) -> Result<()> {
    for circuit in [
        circuits::BALLOT_PROOF,
        circuits::BALLOT_PROOF_DUMMY,
        circuits::AGGREGATOR,
        circuits::STATE_TRANSITION,
    ] {
        let ccs = prover.compile(circuit).await?;
        let (pk, vk) = prover.setup(&ccs).await?;
        store.put(&ccs_id(circuit), ccs).await;
        store.put(&pk_id(circuit), pk).await;
        store.put(&vk_id(circuit), vk).await;
    }
    Ok(())
}

/// Opaque artifact source.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn load(&self, identifier: &str) -> Result<Vec<u8>>;
}

/// Filesystem-backed artifacts, one file per identifier, with optional
/// blake3 integrity pins.
pub struct FsArtifactStore {
    dir: PathBuf,
    digests: HashMap<String, [u8; 32]>,
}

impl FsArtifactStore {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            digests: HashMap::new(),
        }
    }

    pub fn pin_digest(&mut self, identifier: &str, digest: [u8; 32]) {
        self.digests.insert(identifier.to_string(), digest);
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn load(&self, identifier: &str) -> Result<Vec<u8>> {
        let path = self.dir.join(identifier);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| Error::NotFound(format!("artifact {identifier}: {e}")))?;
        if let Some(expected) = self.digests.get(identifier) {
            let got = blake3::hash(&bytes);
            if got.as_bytes() != expected {
                return Err(Error::Internal(format!(
                    "artifact {identifier} failed integrity check"
                )));
            }
        }
        Ok(bytes)
    }
}

/// In-memory artifacts for tests and development.
#[derive(Default)]
pub struct MemoryArtifactStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryArtifactStore {
    pub async fn put(&self, identifier: &str, bytes: Vec<u8>) {
        self.entries
            .write()
            .await
            .insert(identifier.to_string(), bytes);
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn load(&self, identifier: &str) -> Result<Vec<u8>> {
        self.entries
            .read()
            .await
            .get(identifier)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("artifact {identifier}")))
    }
}

/// Process-wide verifying-key cache in front of the artifact store.
pub struct KeyCache {
    artifacts: Arc<dyn ArtifactStore>,
    cache: RwLock<HashMap<String, Arc<Vec<u8>>>>,
}

impl KeyCache {
    pub fn new(artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self {
            artifacts,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, identifier: &str) -> Result<Arc<Vec<u8>>> {
        if let Some(hit) = self.cache.read().await.get(identifier) {
            return Ok(Arc::clone(hit));
        }
        let bytes = Arc::new(self.artifacts.load(identifier).await?);
        self.cache
            .write()
            .await
            .insert(identifier.to_string(), Arc::clone(&bytes));
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_and_cache() {
        let store = Arc::new(MemoryArtifactStore::default());
        store.put("vk", vec![1, 2, 3]).await;
        let cache = KeyCache::new(store);
        assert_eq!(*cache.get("vk").await.unwrap(), vec![1, 2, 3]);
        // second read hits the cache
        assert_eq!(*cache.get("vk").await.unwrap(), vec![1, 2, 3]);
        assert!(cache.get("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_fs_integrity_check() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("vk"), b"keybytes")
            .await
            .unwrap();
        let mut store = FsArtifactStore::new(dir.path().to_path_buf());
        store.pin_digest("vk", *blake3::hash(b"keybytes").as_bytes());
        assert_eq!(store.load("vk").await.unwrap(), b"keybytes");
        store.pin_digest("vk", [0u8; 32]);
        assert!(store.load("vk").await.is_err());
    }
}
