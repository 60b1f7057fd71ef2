//! Census registry: persistent authenticated sets of eligible voters
//!
//! Each census is a sparse Merkle tree in its own `cs_{uuid}` keyspace,
//! with reference metadata under `cr_{uuid}`. A reverse `root -> uuid`
//! index serves proof-by-root lookups; all index renames are serialized
//! through a single-consumer mailbox so a reader never observes the window
//! between removing the old root and inserting the new one. Mutators await
//! the rename acknowledgment before returning, so the new root is
//! observable once the call completes.

pub mod tree;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::constants::{CENSUS_KEY_MAX_LEN, HASH_LEN, MAX_TREE_LEVELS};
use crate::crypto::fields::{self, OuterField};
use crate::crypto::mimc::mimc_outer;
use crate::errors::{Error, Result};
use crate::storage::{keys, Keyspace, Store};
use crate::types::{hex_array, CensusProof};

use self::tree::{LeafScan, MerkleProof, Tree};

/// Census reference metadata, persisted under `cr_{uuid}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CensusRef {
    pub uuid: Uuid,
    #[serde(with = "hex_array")]
    pub current_root: [u8; HASH_LEN],
    pub max_levels: usize,
    pub hash_type: String,
    pub last_used: u64,
}

struct CensusHandle {
    uuid: Uuid,
    tree: Mutex<Tree<Keyspace>>,
}

struct RootRename {
    uuid: Uuid,
    old_root: Option<[u8; HASH_LEN]>,
    new_root: Option<[u8; HASH_LEN]>,
    done: oneshot::Sender<()>,
}

/// Outcome of a bulk participant insertion. Invalid rows are reported
/// without aborting the batch; the tree advances for the accepted rows.
#[derive(Debug)]
pub struct InsertOutcome {
    pub root: [u8; HASH_LEN],
    pub invalid: Vec<(usize, Error)>,
}

pub struct CensusRegistry {
    store: Store,
    censuses: RwLock<HashMap<Uuid, Arc<CensusHandle>>>,
    root_index: Arc<RwLock<HashMap<[u8; HASH_LEN], Uuid>>>,
    rename_tx: mpsc::Sender<RootRename>,
    delete_tx: mpsc::Sender<String>,
}

impl CensusRegistry {
    /// Spawns the rename consumer and the bounded deletion worker; must be
    /// called from within a tokio runtime.
    pub fn new(store: Store) -> Arc<Self> {
        let root_index: Arc<RwLock<HashMap<[u8; HASH_LEN], Uuid>>> =
            Arc::new(RwLock::new(HashMap::new()));

        let (rename_tx, mut rename_rx) = mpsc::channel::<RootRename>(256);
        let index_for_task = Arc::clone(&root_index);
        tokio::spawn(async move {
            while let Some(rename) = rename_rx.recv().await {
                {
                    let mut index = index_for_task.write().expect("root index poisoned");
                    if let Some(old) = rename.old_root {
                        if index.get(&old) == Some(&rename.uuid) {
                            index.remove(&old);
                        }
                    }
                    if let Some(new) = rename.new_root {
                        // first-registered census wins on a shared root
                        index.entry(new).or_insert(rename.uuid);
                    }
                }
                let _ = rename.done.send(());
            }
        });

        let (delete_tx, mut delete_rx) = mpsc::channel::<String>(64);
        let store_for_task = store.clone();
        tokio::spawn(async move {
            while let Some(name) = delete_rx.recv().await {
                let store = store_for_task.clone();
                let dropped = tokio::task::spawn_blocking(move || store.drop_keyspace(&name)).await;
                match dropped {
                    Ok(Ok(_)) => debug!("census keyspace reclaimed"),
                    Ok(Err(e)) => warn!(error = %e, "census keyspace reclamation failed"),
                    Err(e) => warn!(error = %e, "census deletion task panicked"),
                }
            }
        });

        Arc::new(Self {
            store,
            censuses: RwLock::new(HashMap::new()),
            root_index,
            rename_tx,
            delete_tx,
        })
    }

    fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    async fn rename_root(
        &self,
        uuid: Uuid,
        old_root: Option<[u8; HASH_LEN]>,
        new_root: Option<[u8; HASH_LEN]>,
    ) -> Result<()> {
        let (done, ack) = oneshot::channel();
        self.rename_tx
            .send(RootRename {
                uuid,
                old_root,
                new_root,
                done,
            })
            .await
            .map_err(|_| Error::Internal("root index consumer gone".into()))?;
        ack.await
            .map_err(|_| Error::Internal("root index consumer dropped ack".into()))
    }

    /// Create a census; fails with `AlreadyExists` when the id is taken.
    pub async fn create(&self, uuid: Uuid) -> Result<CensusRef> {
        if self.store.get(&keys::census_ref(&uuid))?.is_some() {
            return Err(Error::AlreadyExists(format!("census {uuid}")));
        }
        let keyspace = self.store.keyspace(&keys::census_nodes(&uuid))?;
        let tree = Tree::open(keyspace, MAX_TREE_LEVELS)?;
        let reference = CensusRef {
            uuid,
            current_root: tree.root(),
            max_levels: MAX_TREE_LEVELS,
            hash_type: "mimc".into(),
            last_used: Self::now(),
        };
        self.store.put_json(&keys::census_ref(&uuid), &reference)?;

        let handle = Arc::new(CensusHandle {
            uuid,
            tree: Mutex::new(tree),
        });
        {
            let mut map = self.censuses.write().expect("census map poisoned");
            if map.contains_key(&uuid) {
                return Err(Error::AlreadyExists(format!("census {uuid}")));
            }
            map.insert(uuid, handle);
        }
        self.rename_root(uuid, None, Some(reference.current_root))
            .await?;
        Ok(reference)
    }

    /// Load a census reference, rebuilding the in-memory handle from the
    /// persisted metadata when needed.
    pub fn load(&self, uuid: &Uuid) -> Result<CensusRef> {
        let reference: CensusRef = self
            .store
            .get_json(&keys::census_ref(uuid))?
            .ok_or_else(|| Error::NotFound(format!("census {uuid}")))?;
        self.handle(uuid)?;
        Ok(reference)
    }

    fn handle(&self, uuid: &Uuid) -> Result<Arc<CensusHandle>> {
        if let Some(handle) = self
            .censuses
            .read()
            .expect("census map poisoned")
            .get(uuid)
        {
            return Ok(Arc::clone(handle));
        }
        // rebuild from storage
        if self.store.get(&keys::census_ref(uuid))?.is_none() {
            return Err(Error::NotFound(format!("census {uuid}")));
        }
        let keyspace = self.store.keyspace(&keys::census_nodes(uuid))?;
        let tree = Tree::open(keyspace, MAX_TREE_LEVELS)?;
        let handle = Arc::new(CensusHandle {
            uuid: *uuid,
            tree: Mutex::new(tree),
        });
        let mut map = self.censuses.write().expect("census map poisoned");
        Ok(Arc::clone(map.entry(*uuid).or_insert(handle)))
    }

    /// Delete a census: the reference and index entries go synchronously,
    /// the node keyspace is reclaimed in the background.
    pub async fn delete(&self, uuid: &Uuid) -> Result<()> {
        let handle = self.handle(uuid)?;
        let root = handle.tree.lock().await.root();
        {
            let mut map = self.censuses.write().expect("census map poisoned");
            map.remove(uuid);
        }
        self.store.delete(&keys::census_ref(uuid))?;
        self.rename_root(*uuid, Some(root), None).await?;
        self.delete_tx
            .send(keys::census_nodes(uuid))
            .await
            .map_err(|_| Error::Internal("census deletion worker gone".into()))?;
        Ok(())
    }

    /// Reduce an over-long participant key: hash and truncate to the tree
    /// key length. A hash output shorter than the key length would be a
    /// programmer error, not a user error.
    fn normalize_key(key: &[u8]) -> Result<Vec<u8>> {
        if key.is_empty() {
            return Err(Error::MalformedInput("empty census key".into()));
        }
        if key.len() <= CENSUS_KEY_MAX_LEN {
            return Ok(key.to_vec());
        }
        let fields: Vec<OuterField> = key
            .chunks(31)
            .map(fields::from_bytes_le::<OuterField>)
            .collect();
        let digest = fields::to_bytes_le(&mimc_outer(&fields));
        let want = MAX_TREE_LEVELS / 8;
        if digest.len() < want {
            return Err(Error::Internal("hash output shorter than key length".into()));
        }
        Ok(digest[..want].to_vec())
    }

    /// Weight as a tree value: big-endian to the hash length, then reduced
    /// to the canonical field form.
    fn weight_value(weight: &BigUint) -> [u8; HASH_LEN] {
        let be = weight.to_bytes_be();
        let mut padded = [0u8; HASH_LEN];
        let start = HASH_LEN.saturating_sub(be.len());
        padded[start..].copy_from_slice(&be[be.len().saturating_sub(HASH_LEN)..]);
        fields::to_bytes_le(&fields::from_bytes_be::<OuterField>(&padded))
    }

    /// Insert one participant; errors on duplicates and over-long keys.
    pub async fn insert(&self, uuid: &Uuid, key: &[u8], weight: &BigUint) -> Result<[u8; HASH_LEN]> {
        let mut outcome = self.insert_batch(uuid, &[(key.to_vec(), weight.clone())]).await?;
        if let Some((_, error)) = outcome.invalid.pop() {
            return Err(error);
        }
        Ok(outcome.root)
    }

    /// Bulk insertion: invalid rows (collisions, bad encodings) are
    /// reported without aborting; the tree advances for accepted rows.
    pub async fn insert_batch(
        &self,
        uuid: &Uuid,
        rows: &[(Vec<u8>, BigUint)],
    ) -> Result<InsertOutcome> {
        let handle = self.handle(uuid)?;
        let mut tree = handle.tree.lock().await;
        let old_root = tree.root();
        let mut invalid = Vec::new();
        for (i, (key, weight)) in rows.iter().enumerate() {
            let normalized = match Self::normalize_key(key) {
                Ok(k) => k,
                Err(e) => {
                    invalid.push((i, e));
                    continue;
                }
            };
            match tree.add(&normalized, &Self::weight_value(weight)) {
                Ok(()) => {}
                Err(e @ (Error::AlreadyExists(_) | Error::KeyTooLong { .. })) => {
                    invalid.push((i, e));
                }
                Err(e) => return Err(e),
            }
        }
        let new_root = tree.root();

        let mut reference: CensusRef = self
            .store
            .get_json(&keys::census_ref(uuid))?
            .ok_or_else(|| Error::NotFound(format!("census {uuid}")))?;
        reference.current_root = new_root;
        reference.last_used = Self::now();
        self.store.put_json(&keys::census_ref(uuid), &reference)?;

        if new_root != old_root {
            self.rename_root(handle.uuid, Some(old_root), Some(new_root))
                .await?;
        }
        Ok(InsertOutcome {
            root: new_root,
            invalid,
        })
    }

    pub async fn root(&self, uuid: &Uuid) -> Result<[u8; HASH_LEN]> {
        let handle = self.handle(uuid)?;
        let tree = handle.tree.lock().await;
        Ok(tree.root())
    }

    pub async fn size(&self, uuid: &Uuid) -> Result<u64> {
        let handle = self.handle(uuid)?;
        let tree = handle.tree.lock().await;
        Ok(tree.leaf_count())
    }

    /// All participants as `(key, weight)` pairs.
    pub async fn participants(&self, uuid: &Uuid) -> Result<Vec<(Vec<u8>, BigUint)>> {
        let handle = self.handle(uuid)?;
        let tree = handle.tree.lock().await;
        let leaves = tree.store().scan_leaves()?;
        Ok(leaves
            .into_iter()
            .map(|(key, value)| {
                let weight = fields::field_to_biguint(&fields::from_bytes_le::<OuterField>(&value));
                (key, weight)
            })
            .collect())
    }

    /// Inclusion proof for a participant of a census.
    pub async fn prove(&self, uuid: &Uuid, key: &[u8]) -> Result<CensusProof> {
        let handle = self.handle(uuid)?;
        let tree = handle.tree.lock().await;
        let normalized = Self::normalize_key(key)?;
        let proof = tree.prove(&normalized)?;
        if !proof.included {
            return Err(Error::NotFound(format!("census key {}", hex::encode(key))));
        }
        Ok(Self::to_census_proof(proof))
    }

    fn to_census_proof(proof: MerkleProof) -> CensusProof {
        let weight = fields::field_to_biguint(&fields::from_bytes_le::<OuterField>(&proof.value));
        CensusProof {
            root: proof.root,
            key: proof.key.clone(),
            value: proof.value,
            siblings: proof.pack_siblings(),
            weight,
        }
    }

    /// Resolve a root to its census through the reverse index, rebuilding
    /// the index from persisted references on a miss. When several
    /// censuses share a root, the first registered wins.
    fn resolve_root(&self, root: &[u8; HASH_LEN]) -> Result<Uuid> {
        if let Some(uuid) = self.root_index.read().expect("root index poisoned").get(root) {
            return Ok(*uuid);
        }
        // lazy rebuild from cr_ records
        let mut found = None;
        {
            let mut index = self.root_index.write().expect("root index poisoned");
            for (_, raw) in self.store.scan_prefix(keys::CENSUS_REF_PREFIX)? {
                if let Ok(reference) = serde_json::from_slice::<CensusRef>(&raw) {
                    index.entry(reference.current_root).or_insert(reference.uuid);
                }
            }
            if let Some(uuid) = index.get(root) {
                found = Some(*uuid);
            }
        }
        found.ok_or_else(|| Error::NotFound(format!("root {}", hex::encode(root))))
    }

    /// Proof by root: resolves `root -> uuid` and proves against the
    /// census's current tree.
    pub async fn proof_by_root(&self, root: &[u8; HASH_LEN], key: &[u8]) -> Result<CensusProof> {
        let uuid = self.resolve_root(root)?;
        self.prove(&uuid, key).await
    }

    pub async fn size_by_root(&self, root: &[u8; HASH_LEN]) -> Result<u64> {
        let uuid = self.resolve_root(root)?;
        self.size(&uuid).await
    }

    /// Verify a census proof without touching any census state.
    pub fn verify_proof(proof: &CensusProof) -> Result<bool> {
        let siblings = tree::unpack_siblings(&proof.siblings)?;
        Ok(tree::verify_proof(
            &proof.root,
            &proof.key,
            &proof.value,
            &siblings,
        ))
    }
}

pub use tree::EMPTY_HASH as EMPTY_ROOT;

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<CensusRegistry> {
        CensusRegistry::new(Store::temporary().unwrap())
    }

    #[tokio::test]
    async fn test_create_and_load() {
        let reg = registry();
        let id = Uuid::new_v4();
        let created = reg.create(id).await.unwrap();
        assert_eq!(created.current_root, tree::EMPTY_HASH);
        let loaded = reg.load(&id).unwrap();
        assert_eq!(loaded.uuid, id);
    }

    #[tokio::test]
    async fn test_create_twice_conflicts() {
        let reg = registry();
        let id = Uuid::new_v4();
        reg.create(id).await.unwrap();
        assert!(matches!(reg.create(id).await, Err(Error::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_insert_and_prove() {
        let reg = registry();
        let id = Uuid::new_v4();
        reg.create(id).await.unwrap();
        let rows = vec![
            (vec![0x01; 20], BigUint::from(1u8)),
            (vec![0x02; 20], BigUint::from(1u8)),
        ];
        let outcome = reg.insert_batch(&id, &rows).await.unwrap();
        assert!(outcome.invalid.is_empty());
        assert_eq!(reg.size(&id).await.unwrap(), 2);

        let proof = reg.prove(&id, &[0x01; 20]).await.unwrap();
        assert_eq!(proof.root, reg.root(&id).await.unwrap());
        assert!(CensusRegistry::verify_proof(&proof).unwrap());
        assert_eq!(proof.weight, BigUint::from(1u8));
    }

    #[tokio::test]
    async fn test_invalid_rows_reported_not_fatal() {
        let reg = registry();
        let id = Uuid::new_v4();
        reg.create(id).await.unwrap();
        let rows = vec![
            (vec![0x01; 20], BigUint::from(1u8)),
            (vec![0x01; 20], BigUint::from(2u8)), // duplicate
            (vec![0x03; 20], BigUint::from(3u8)),
        ];
        let outcome = reg.insert_batch(&id, &rows).await.unwrap();
        assert_eq!(outcome.invalid.len(), 1);
        assert_eq!(outcome.invalid[0].0, 1);
        assert_eq!(reg.size(&id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_root_reindex() {
        let reg = registry();
        let id = Uuid::new_v4();
        reg.create(id).await.unwrap();
        let root_a = reg.root(&id).await.unwrap();

        let rows = vec![(vec![0x05; 20], BigUint::from(1u8))];
        let outcome = reg.insert_batch(&id, &rows).await.unwrap();
        let root_b = outcome.root;
        assert_ne!(root_a, root_b);

        // stale root no longer resolves; the new one does
        assert!(reg.proof_by_root(&root_a, &[0x05; 20]).await.is_err());
        let proof = reg.proof_by_root(&root_b, &[0x05; 20]).await.unwrap();
        assert!(CensusRegistry::verify_proof(&proof).unwrap());
        assert_eq!(reg.size_by_root(&root_b).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_removes_reference() {
        let reg = registry();
        let id = Uuid::new_v4();
        reg.create(id).await.unwrap();
        reg.delete(&id).await.unwrap();
        assert!(reg.load(&id).is_err());
        assert!(reg.root(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_long_key_normalized() {
        let reg = registry();
        let id = Uuid::new_v4();
        reg.create(id).await.unwrap();
        let long_key = vec![0xaa; 64];
        reg.insert(&id, &long_key, &BigUint::from(2u8)).await.unwrap();
        let proof = reg.prove(&id, &long_key).await.unwrap();
        assert!(CensusRegistry::verify_proof(&proof).unwrap());
        assert_eq!(proof.key.len(), MAX_TREE_LEVELS / 8);
    }

    #[tokio::test]
    async fn test_lazy_index_rebuild() {
        let store = Store::temporary().unwrap();
        let reg = CensusRegistry::new(store.clone());
        let id = Uuid::new_v4();
        reg.create(id).await.unwrap();
        reg.insert(&id, &[0x07; 20], &BigUint::from(1u8)).await.unwrap();
        let root = reg.root(&id).await.unwrap();

        // a fresh registry over the same store has an empty in-memory
        // index and must rebuild it from cr_ records
        let fresh = CensusRegistry::new(store);
        let proof = fresh.proof_by_root(&root, &[0x07; 20]).await.unwrap();
        assert!(CensusRegistry::verify_proof(&proof).unwrap());
    }
}
