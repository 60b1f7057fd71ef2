//! Embedded persistence
//!
//! One sled database backs everything. The keyspace is partitioned by
//! record kind: `cs_{uuid}` census tree nodes, `cr_{uuid}`
//! census reference metadata, `st_{process_id}` state tree nodes,
//! `p_{process_id}` process records, `vb_{process_id}` verified-ballot
//! queue entries. Tree-node keyspaces map to named sled trees; record
//! keyspaces are key prefixes in the default tree.

use std::path::Path;

use crate::errors::{Error, Result};

/// Handle to the shared backing store.
#[derive(Clone)]
pub struct Store {
    db: sled::Db,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// In-memory store for tests and development.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    /// Named node keyspace (census or state tree nodes).
    pub fn keyspace(&self, name: &str) -> Result<Keyspace> {
        let tree = self.db.open_tree(name)?;
        Ok(Keyspace { tree })
    }

    /// Drop a node keyspace wholesale. Used by census deletion; may take
    /// time proportional to the keyspace size.
    pub fn drop_keyspace(&self, name: &str) -> Result<bool> {
        Ok(self.db.drop_tree(name)?)
    }

    // ---- default-tree records ----

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.db.insert(key, value)?;
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key)?.map(|v| v.to_vec()))
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.db.remove(key)?;
        Ok(())
    }

    /// All `(key, value)` pairs under a prefix, in key order.
    pub fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        for item in self.db.scan_prefix(prefix) {
            let (k, v) = item?;
            out.push((k.to_vec(), v.to_vec()));
        }
        Ok(out)
    }

    pub fn put_json<T: serde::Serialize>(&self, key: &[u8], value: &T) -> Result<()> {
        self.put(key, &serde_json::to_vec(value)?)
    }

    pub fn get_json<T: serde::de::DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>> {
        match self.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

/// A named node keyspace.
#[derive(Clone)]
pub struct Keyspace {
    tree: sled::Tree,
}

impl Keyspace {
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.tree.get(key)?.map(|v| v.to_vec()))
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.tree.insert(key, value)?;
        Ok(())
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.tree.remove(key)?;
        Ok(())
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.tree.contains_key(key)?)
    }

    /// Apply a set of writes atomically.
    pub fn apply(&self, writes: &[(Vec<u8>, Option<Vec<u8>>)]) -> Result<()> {
        let mut batch = sled::Batch::default();
        for (key, value) in writes {
            match value {
                Some(v) => batch.insert(key.as_slice(), v.as_slice()),
                None => batch.remove(key.as_slice()),
            }
        }
        self.tree.apply_batch(batch).map_err(Error::from)?;
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = Result<(Vec<u8>, Vec<u8>)>> {
        self.tree
            .iter()
            .map(|item| item.map(|(k, v)| (k.to_vec(), v.to_vec())).map_err(Error::from))
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

/// Record-key builders for the default tree.
pub mod keys {
    use uuid::Uuid;

    pub fn census_ref(uuid: &Uuid) -> Vec<u8> {
        format!("cr_{uuid}").into_bytes()
    }

    pub const CENSUS_REF_PREFIX: &[u8] = b"cr_";

    pub fn process(process_id: &[u8]) -> Vec<u8> {
        let mut key = b"p_".to_vec();
        key.extend_from_slice(process_id);
        key
    }

    pub const PROCESS_PREFIX: &[u8] = b"p_";

    pub fn census_nodes(uuid: &Uuid) -> String {
        format!("cs_{uuid}")
    }

    pub fn state_nodes(process_id: &[u8]) -> String {
        format!("st_{}", hex::encode(process_id))
    }

    pub fn verified_ballots(process_id: &[u8]) -> String {
        format!("vb_{}", hex::encode(process_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tree_round_trip() {
        let store = Store::temporary().unwrap();
        store.put(b"p_abc", b"value").unwrap();
        assert_eq!(store.get(b"p_abc").unwrap().unwrap(), b"value");
        store.delete(b"p_abc").unwrap();
        assert!(store.get(b"p_abc").unwrap().is_none());
    }

    #[test]
    fn test_scan_prefix() {
        let store = Store::temporary().unwrap();
        store.put(b"cr_a", b"1").unwrap();
        store.put(b"cr_b", b"2").unwrap();
        store.put(b"p_a", b"3").unwrap();
        let rows = store.scan_prefix(b"cr_").unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_keyspace_batch() {
        let store = Store::temporary().unwrap();
        let ks = store.keyspace("cs_test").unwrap();
        ks.apply(&[
            (b"a".to_vec(), Some(b"1".to_vec())),
            (b"b".to_vec(), Some(b"2".to_vec())),
        ])
        .unwrap();
        assert_eq!(ks.len(), 2);
        assert!(store.drop_keyspace("cs_test").unwrap());
    }
}
