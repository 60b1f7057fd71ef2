//! Persistent sparse Merkle tree over the outer field
//!
//! Content-addressed binary tree: `node = H(left, right)`,
//! `leaf = H(key, value, 1)`, empty = zero, with MiMC7 over the outer
//! field. Leaves sit at the first level where their path is alone, so
//! proofs carry only as many siblings as the tree actually branches.
//! Path bit `i` of a key is bit `i % 8` of byte `i / 8`.
//!
//! Nodes live under `n:`-prefixed storage keys; leaf records (raw key to
//! value) under `l:`; the root and leaf count under `m:`. One tree
//! instance is single-writer, guarded by its owner.

use std::collections::HashMap;

use crate::constants::{HASH_LEN, MAX_TREE_LEVELS};
use crate::crypto::fields::{from_bytes_le, to_bytes_le, OuterField};
use crate::crypto::mimc::mimc_outer;
use crate::errors::{Error, Result};
use crate::storage::Keyspace;

pub const EMPTY_HASH: [u8; HASH_LEN] = [0u8; HASH_LEN];

const NODE_PREFIX: u8 = b'n';
const LEAF_RECORD_PREFIX: u8 = b'l';
const META_ROOT: &[u8] = b"m:root";
const META_COUNT: &[u8] = b"m:count";

const TAG_LEAF: u8 = 1;
const TAG_MID: u8 = 2;

/// Node persistence behind the tree. The census uses the direct keyspace;
/// the state engine stages writes for atomic batch application.
pub trait NodeStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()>;
}

impl NodeStore for Keyspace {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Keyspace::get(self, key)
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        Keyspace::put(self, key, value)
    }
}

/// Write-staging overlay. Reads fall through to the base keyspace; writes
/// stay in memory until [`StagedStore::flush`] commits them in one batch.
pub struct StagedStore {
    base: Keyspace,
    staged: HashMap<Vec<u8>, Vec<u8>>,
}

impl StagedStore {
    pub fn new(base: Keyspace) -> Self {
        Self {
            base,
            staged: HashMap::new(),
        }
    }

    /// Commit all staged writes atomically.
    pub fn flush(&mut self) -> Result<()> {
        let writes: Vec<_> = self
            .staged
            .drain()
            .map(|(k, v)| (k, Some(v)))
            .collect();
        self.base.apply(&writes)
    }

    /// Drop staged writes, leaving the base untouched.
    pub fn discard(&mut self) {
        self.staged.clear();
    }
}

impl NodeStore for StagedStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(v) = self.staged.get(key) {
            return Ok(Some(v.clone()));
        }
        self.base.get(key)
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.staged.insert(key.to_vec(), value.to_vec());
        Ok(())
    }
}

enum Node {
    Leaf { key: [u8; 32], value: [u8; 32] },
    Mid { left: [u8; 32], right: [u8; 32] },
}

/// Inclusion (or non-inclusion) proof. Siblings are indexed by level,
/// level 0 at the root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MerkleProof {
    pub root: [u8; 32],
    pub key: Vec<u8>,
    pub value: [u8; 32],
    pub siblings: Vec<[u8; 32]>,
    pub included: bool,
}

impl MerkleProof {
    /// Packed sibling encoding:
    /// `levels (u16 LE) | bitmap_len (u16 LE) | bitmap | non-empty siblings`.
    /// Bit `i` of the bitmap marks a non-empty sibling at level `i`.
    pub fn pack_siblings(&self) -> Vec<u8> {
        pack_siblings(&self.siblings)
    }
}

pub fn pack_siblings(siblings: &[[u8; 32]]) -> Vec<u8> {
    let bitmap_len = siblings.len().div_ceil(8);
    let mut out = Vec::with_capacity(4 + bitmap_len + siblings.len() * HASH_LEN);
    out.extend_from_slice(&(siblings.len() as u16).to_le_bytes());
    out.extend_from_slice(&(bitmap_len as u16).to_le_bytes());
    let mut bitmap = vec![0u8; bitmap_len];
    for (i, sib) in siblings.iter().enumerate() {
        if *sib != EMPTY_HASH {
            bitmap[i / 8] |= 1 << (i % 8);
        }
    }
    out.extend_from_slice(&bitmap);
    for sib in siblings {
        if *sib != EMPTY_HASH {
            out.extend_from_slice(sib);
        }
    }
    out
}

pub fn unpack_siblings(packed: &[u8]) -> Result<Vec<[u8; 32]>> {
    if packed.len() < 4 {
        return Err(Error::MalformedInput("packed siblings too short".into()));
    }
    let levels = u16::from_le_bytes([packed[0], packed[1]]) as usize;
    let bitmap_len = u16::from_le_bytes([packed[2], packed[3]]) as usize;
    if levels > MAX_TREE_LEVELS || bitmap_len < levels.div_ceil(8) {
        return Err(Error::MalformedInput("bad sibling header".into()));
    }
    let bitmap = packed
        .get(4..4 + bitmap_len)
        .ok_or_else(|| Error::MalformedInput("packed siblings truncated".into()))?;
    let mut rest = &packed[4 + bitmap_len..];
    let mut out = Vec::with_capacity(levels);
    for i in 0..levels {
        if bitmap[i / 8] >> (i % 8) & 1 == 1 {
            let sib: [u8; 32] = rest
                .get(..HASH_LEN)
                .ok_or_else(|| Error::MalformedInput("packed siblings truncated".into()))?
                .try_into()
                .unwrap();
            rest = &rest[HASH_LEN..];
            out.push(sib);
        } else {
            out.push(EMPTY_HASH);
        }
    }
    if !rest.is_empty() {
        return Err(Error::MalformedInput("trailing sibling bytes".into()));
    }
    Ok(out)
}

fn path_bit(key_bytes: &[u8; 32], level: usize) -> bool {
    key_bytes[level / 8] >> (level % 8) & 1 == 1
}

fn hash_mid(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let l: OuterField = from_bytes_le(left);
    let r: OuterField = from_bytes_le(right);
    to_bytes_le(&mimc_outer(&[l, r]))
}

fn hash_leaf(key: &[u8; 32], value: &[u8; 32]) -> [u8; 32] {
    let k: OuterField = from_bytes_le(key);
    let v: OuterField = from_bytes_le(value);
    to_bytes_le(&mimc_outer(&[k, v, OuterField::from(1u64)]))
}

/// Canonical 32-byte little-endian field form of key or value bytes.
fn canonical(bytes: &[u8]) -> [u8; 32] {
    to_bytes_le(&from_bytes_le::<OuterField>(bytes))
}

/// Recompute the root implied by an inclusion proof.
pub fn root_from_proof(key: &[u8], value: &[u8; 32], siblings: &[[u8; 32]]) -> [u8; 32] {
    let key_c = canonical(key);
    let mut cur = hash_leaf(&key_c, value);
    for level in (0..siblings.len()).rev() {
        cur = if path_bit(&key_c, level) {
            hash_mid(&siblings[level], &cur)
        } else {
            hash_mid(&cur, &siblings[level])
        };
    }
    cur
}

/// Verify an inclusion proof against a root.
pub fn verify_proof(root: &[u8; 32], key: &[u8], value: &[u8; 32], siblings: &[[u8; 32]]) -> bool {
    root_from_proof(key, value, siblings) == *root
}

/// The tree proper, generic over node persistence.
pub struct Tree<S: NodeStore> {
    store: S,
    max_levels: usize,
    root: [u8; 32],
    leaf_count: u64,
}

impl<S: NodeStore> Tree<S> {
    /// Open a tree over a store, reading the persisted root if present.
    pub fn open(store: S, max_levels: usize) -> Result<Self> {
        let mut tree = Self {
            store,
            max_levels,
            root: EMPTY_HASH,
            leaf_count: 0,
        };
        if let Some(root) = tree.store.get(META_ROOT)? {
            tree.root = root
                .try_into()
                .map_err(|_| Error::Internal("corrupt root record".into()))?;
        }
        if let Some(count) = tree.store.get(META_COUNT)? {
            let bytes: [u8; 8] = count
                .try_into()
                .map_err(|_| Error::Internal("corrupt count record".into()))?;
            tree.leaf_count = u64::from_be_bytes(bytes);
        }
        Ok(tree)
    }

    pub fn root(&self) -> [u8; 32] {
        self.root
    }

    pub fn leaf_count(&self) -> u64 {
        self.leaf_count
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() * 8 > self.max_levels {
            return Err(Error::KeyTooLong {
                max_levels: self.max_levels,
            });
        }
        Ok(())
    }

    fn load_node(&self, hash: &[u8; 32]) -> Result<Node> {
        let mut storage_key = vec![NODE_PREFIX, b':'];
        storage_key.extend_from_slice(hash);
        let raw = self
            .store
            .get(&storage_key)?
            .ok_or_else(|| Error::Internal(format!("missing tree node {}", hex::encode(hash))))?;
        if raw.len() != 1 + 2 * HASH_LEN {
            return Err(Error::Internal("corrupt tree node".into()));
        }
        let a: [u8; 32] = raw[1..33].try_into().unwrap();
        let b: [u8; 32] = raw[33..].try_into().unwrap();
        match raw[0] {
            TAG_LEAF => Ok(Node::Leaf { key: a, value: b }),
            TAG_MID => Ok(Node::Mid { left: a, right: b }),
            _ => Err(Error::Internal("unknown tree node tag".into())),
        }
    }

    fn store_node(&mut self, hash: &[u8; 32], node: &Node) -> Result<()> {
        let mut storage_key = vec![NODE_PREFIX, b':'];
        storage_key.extend_from_slice(hash);
        let mut raw = Vec::with_capacity(1 + 2 * HASH_LEN);
        match node {
            Node::Leaf { key, value } => {
                raw.push(TAG_LEAF);
                raw.extend_from_slice(key);
                raw.extend_from_slice(value);
            }
            Node::Mid { left, right } => {
                raw.push(TAG_MID);
                raw.extend_from_slice(left);
                raw.extend_from_slice(right);
            }
        }
        self.store.put(&storage_key, &raw)
    }

    fn persist_meta(&mut self) -> Result<()> {
        let root = self.root;
        let count = self.leaf_count.to_be_bytes();
        self.store.put(META_ROOT, &root)?;
        self.store.put(META_COUNT, &count)
    }

    /// Insert a new leaf; fails with `AlreadyExists` on a duplicate key.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write(key, value, false).map(|_| ())
    }

    /// Insert or replace a leaf, returning the previous canonical value.
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<Option<[u8; 32]>> {
        self.write(key, value, true)
    }

    fn write(&mut self, key: &[u8], value: &[u8], replace: bool) -> Result<Option<[u8; 32]>> {
        self.check_key(key)?;
        if value.len() > HASH_LEN {
            return Err(Error::MalformedInput("tree value exceeds hash length".into()));
        }
        let key_c = canonical(key);
        let value_c = canonical(value);
        let new_leaf = hash_leaf(&key_c, &value_c);

        // descend, collecting siblings per level
        let mut siblings: Vec<[u8; 32]> = Vec::new();
        let mut cur = self.root;
        let mut previous: Option<[u8; 32]> = None;
        let subtree = loop {
            let level = siblings.len();
            if cur == EMPTY_HASH {
                self.store_node(
                    &new_leaf,
                    &Node::Leaf {
                        key: key_c,
                        value: value_c,
                    },
                )?;
                break new_leaf;
            }
            match self.load_node(&cur)? {
                Node::Leaf {
                    key: other_key,
                    value: other_value,
                } => {
                    if other_key == key_c {
                        if !replace {
                            return Err(Error::AlreadyExists(format!(
                                "key {}",
                                hex::encode(key)
                            )));
                        }
                        previous = Some(other_value);
                        self.store_node(
                            &new_leaf,
                            &Node::Leaf {
                                key: key_c,
                                value: value_c,
                            },
                        )?;
                        break new_leaf;
                    }
                    // split: push the resident leaf down to the first
                    // divergent path bit
                    let mut divergence = level;
                    while divergence < self.max_levels
                        && path_bit(&key_c, divergence) == path_bit(&other_key, divergence)
                    {
                        divergence += 1;
                    }
                    if divergence >= self.max_levels {
                        return Err(Error::KeyTooLong {
                            max_levels: self.max_levels,
                        });
                    }
                    self.store_node(
                        &new_leaf,
                        &Node::Leaf {
                            key: key_c,
                            value: value_c,
                        },
                    )?;
                    let (left, right) = if path_bit(&key_c, divergence) {
                        (cur, new_leaf)
                    } else {
                        (new_leaf, cur)
                    };
                    let mut sub = hash_mid(&left, &right);
                    self.store_node(&sub, &Node::Mid { left, right })?;
                    for lvl in (level..divergence).rev() {
                        let (left, right) = if path_bit(&key_c, lvl) {
                            (EMPTY_HASH, sub)
                        } else {
                            (sub, EMPTY_HASH)
                        };
                        sub = hash_mid(&left, &right);
                        self.store_node(&sub, &Node::Mid { left, right })?;
                    }
                    break sub;
                }
                Node::Mid { left, right } => {
                    if level >= self.max_levels {
                        return Err(Error::KeyTooLong {
                            max_levels: self.max_levels,
                        });
                    }
                    if path_bit(&key_c, level) {
                        siblings.push(left);
                        cur = right;
                    } else {
                        siblings.push(right);
                        cur = left;
                    }
                }
            }
        };

        // rehash up along the collected siblings
        let mut cur = subtree;
        for level in (0..siblings.len()).rev() {
            let (left, right) = if path_bit(&key_c, level) {
                (siblings[level], cur)
            } else {
                (cur, siblings[level])
            };
            cur = hash_mid(&left, &right);
            self.store_node(&cur, &Node::Mid { left, right })?;
        }
        self.root = cur;
        if previous.is_none() {
            self.leaf_count += 1;
        }

        // leaf record for enumeration
        let mut record_key = vec![LEAF_RECORD_PREFIX, b':'];
        record_key.extend_from_slice(key);
        self.store.put(&record_key, &value_c)?;
        self.persist_meta()?;
        Ok(previous)
    }

    /// Canonical value of a leaf, if present.
    pub fn get(&self, key: &[u8]) -> Result<Option<[u8; 32]>> {
        self.check_key(key)?;
        let key_c = canonical(key);
        let mut cur = self.root;
        let mut level = 0;
        loop {
            if cur == EMPTY_HASH {
                return Ok(None);
            }
            match self.load_node(&cur)? {
                Node::Leaf { key: k, value } => {
                    return Ok(if k == key_c { Some(value) } else { None });
                }
                Node::Mid { left, right } => {
                    if level >= self.max_levels {
                        return Ok(None);
                    }
                    cur = if path_bit(&key_c, level) { right } else { left };
                    level += 1;
                }
            }
        }
    }

    /// Inclusion proof for a key. An absent key yields `included = false`.
    pub fn prove(&self, key: &[u8]) -> Result<MerkleProof> {
        self.check_key(key)?;
        let key_c = canonical(key);
        let mut siblings = Vec::new();
        let mut cur = self.root;
        loop {
            if cur == EMPTY_HASH {
                return Ok(MerkleProof {
                    root: self.root,
                    key: key.to_vec(),
                    value: EMPTY_HASH,
                    siblings,
                    included: false,
                });
            }
            match self.load_node(&cur)? {
                Node::Leaf { key: k, value } => {
                    return Ok(MerkleProof {
                        root: self.root,
                        key: key.to_vec(),
                        value,
                        siblings,
                        included: k == key_c,
                    });
                }
                Node::Mid { left, right } => {
                    if siblings.len() >= self.max_levels {
                        return Err(Error::Internal("tree deeper than max levels".into()));
                    }
                    if path_bit(&key_c, siblings.len()) {
                        siblings.push(left);
                        cur = right;
                    } else {
                        siblings.push(right);
                        cur = left;
                    }
                }
            }
        }
    }

    /// All leaf records `(raw key, canonical value)`, in key order.
    pub fn leaves(&self) -> Result<Vec<(Vec<u8>, [u8; 32])>>
    where
        S: LeafScan,
    {
        self.store.scan_leaves()
    }
}

/// Leaf enumeration, available on stores that can scan.
pub trait LeafScan {
    fn scan_leaves(&self) -> Result<Vec<(Vec<u8>, [u8; 32])>>;
}

impl LeafScan for Keyspace {
    fn scan_leaves(&self) -> Result<Vec<(Vec<u8>, [u8; 32])>> {
        let mut out = Vec::new();
        for item in self.iter() {
            let (k, v) = item?;
            if k.starts_with(&[LEAF_RECORD_PREFIX, b':']) {
                let value: [u8; 32] = v
                    .try_into()
                    .map_err(|_| Error::Internal("corrupt leaf record".into()))?;
                out.push((k[2..].to_vec(), value));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Store;

    fn test_tree() -> Tree<Keyspace> {
        let store = Store::temporary().unwrap();
        let ks = store.keyspace("cs_test").unwrap();
        Tree::open(ks, MAX_TREE_LEVELS).unwrap()
    }

    #[test]
    fn test_empty_root() {
        let tree = test_tree();
        assert_eq!(tree.root(), EMPTY_HASH);
        assert_eq!(tree.leaf_count(), 0);
    }

    #[test]
    fn test_add_and_get() {
        let mut tree = test_tree();
        tree.add(&[1u8; 20], &[7u8]).unwrap();
        assert_eq!(tree.leaf_count(), 1);
        let got = tree.get(&[1u8; 20]).unwrap().unwrap();
        assert_eq!(got, canonical(&[7u8]));
        assert!(tree.get(&[2u8; 20]).unwrap().is_none());
    }

    #[test]
    fn test_duplicate_add_rejected() {
        let mut tree = test_tree();
        tree.add(&[1u8; 20], &[7u8]).unwrap();
        assert!(matches!(
            tree.add(&[1u8; 20], &[8u8]),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_set_returns_previous() {
        let mut tree = test_tree();
        assert!(tree.set(&[1u8; 20], &[7u8]).unwrap().is_none());
        let prev = tree.set(&[1u8; 20], &[8u8]).unwrap().unwrap();
        assert_eq!(prev, canonical(&[7u8]));
        assert_eq!(tree.leaf_count(), 1);
    }

    #[test]
    fn test_proofs_verify() {
        let mut tree = test_tree();
        for i in 1u8..=16 {
            tree.add(&[i; 20], &[i]).unwrap();
        }
        let root = tree.root();
        for i in 1u8..=16 {
            let proof = tree.prove(&[i; 20]).unwrap();
            assert!(proof.included, "leaf {i} missing");
            assert!(verify_proof(&root, &[i; 20], &proof.value, &proof.siblings));
        }
    }

    #[test]
    fn test_proof_fails_for_wrong_value() {
        let mut tree = test_tree();
        tree.add(&[1u8; 20], &[7u8]).unwrap();
        let proof = tree.prove(&[1u8; 20]).unwrap();
        let bogus = canonical(&[9u8]);
        assert!(!verify_proof(&tree.root(), &[1u8; 20], &bogus, &proof.siblings));
    }

    #[test]
    fn test_absent_key_not_included() {
        let mut tree = test_tree();
        tree.add(&[1u8; 20], &[7u8]).unwrap();
        let proof = tree.prove(&[9u8; 20]).unwrap();
        assert!(!proof.included);
    }

    #[test]
    fn test_key_too_long() {
        let mut tree = test_tree();
        let long_key = vec![1u8; MAX_TREE_LEVELS / 8 + 1];
        assert!(matches!(
            tree.add(&long_key, &[1u8]),
            Err(Error::KeyTooLong { .. })
        ));
    }

    #[test]
    fn test_value_too_long() {
        let mut tree = test_tree();
        assert!(tree.add(&[1u8; 20], &[1u8; 33]).is_err());
    }

    #[test]
    fn test_root_changes_on_update() {
        let mut tree = test_tree();
        tree.add(&[1u8; 20], &[7u8]).unwrap();
        let r1 = tree.root();
        tree.set(&[1u8; 20], &[8u8]).unwrap();
        assert_ne!(tree.root(), r1);
    }

    #[test]
    fn test_sibling_packing_round_trip() {
        let mut tree = test_tree();
        for i in 1u8..=8 {
            tree.add(&[i; 20], &[i]).unwrap();
        }
        let proof = tree.prove(&[3u8; 20]).unwrap();
        let packed = proof.pack_siblings();
        assert_eq!(unpack_siblings(&packed).unwrap(), proof.siblings);
    }

    #[test]
    fn test_insertion_order_independent_root() {
        let mut a = test_tree();
        let mut b = test_tree();
        for i in 1u8..=8 {
            a.add(&[i; 20], &[i]).unwrap();
        }
        for i in (1u8..=8).rev() {
            b.add(&[i; 20], &[i]).unwrap();
        }
        assert_eq!(a.root(), b.root());
    }

    #[test]
    fn test_staged_store_discard() {
        let store = Store::temporary().unwrap();
        let ks = store.keyspace("st_test").unwrap();
        let mut tree = Tree::open(StagedStore::new(ks.clone()), MAX_TREE_LEVELS).unwrap();
        tree.set(&[1u8; 20], &[1u8]).unwrap();
        tree.store_mut().discard();
        // reopening from the untouched base sees an empty tree
        let reopened = Tree::open(StagedStore::new(ks), MAX_TREE_LEVELS).unwrap();
        assert_eq!(reopened.root(), EMPTY_HASH);
    }
}
