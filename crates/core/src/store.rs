//! Transactional key/value store facade using heed (LMDB)
//!
//! One environment, one byte-keyed database holding every key shape from
//! [`crate::keys`]. LMDB gives the required contract directly:
//! serializable read snapshots, a single exclusive writer, and ordered
//! prefix scans. Values yielded by `get` and the iterators borrow the
//! transaction; copy anything that must outlive it.

use std::path::Path;

use color_eyre::Result;
use color_eyre::eyre::eyre;
use heed::types::Bytes;
use heed::{Database, Env, EnvFlags, EnvOpenOptions, RoPrefix, RoTxn, RwTxn};

/// Maximum size of the memory map.
const MAP_SIZE: usize = 1024 * 1024 * 1024;

const INDEX_DB_NAME: &str = "index";

/// Handle to the index database. Cheap to clone; all clones share the
/// same environment.
#[derive(Clone)]
pub struct Store {
    env: Env,
    db: Database<Bytes, Bytes>,
}

impl Store {
    /// Open or create the index database at the given path.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or created.
    #[allow(unsafe_code)]
    pub fn open(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)?;

        // SAFETY: We're opening the database with standard settings. The
        // unsafe is required by heed for memory-mapped I/O. The only
        // requirement is that the database file is not modified externally
        // while the Env is open.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(MAP_SIZE)
                .max_dbs(1)
                .open(path)?
        };

        let mut wtxn = env.write_txn()?;
        let db: Database<Bytes, Bytes> = env
            .database_options()
            .types::<Bytes, Bytes>()
            .name(INDEX_DB_NAME)
            .create(&mut wtxn)?;
        wtxn.commit()?;

        Ok(Self { env, db })
    }

    /// Open an existing index database read-only, for inspection tools.
    ///
    /// # Errors
    /// Returns an error if the database does not exist or cannot be
    /// opened.
    #[allow(unsafe_code)]
    pub fn open_read_only(path: &Path) -> Result<Self> {
        // SAFETY: As in `open`; READ_ONLY additionally forbids any write
        // transaction on this environment.
        let env = unsafe {
            let mut options = EnvOpenOptions::new();
            options.map_size(MAP_SIZE).max_dbs(1);
            options.flags(EnvFlags::READ_ONLY);
            options.open(path)?
        };

        let rtxn = env.read_txn()?;
        let db = env
            .open_database::<Bytes, Bytes>(&rtxn, Some(INDEX_DB_NAME))?
            .ok_or_else(|| eyre!("no index database at {}", path.display()))?;
        drop(rtxn);

        Ok(Self { env, db })
    }

    /// Begin a read snapshot.
    ///
    /// # Errors
    /// Returns an error if the transaction cannot be started.
    pub fn read_txn(&self) -> Result<RoTxn<'_>> {
        Ok(self.env.read_txn()?)
    }

    /// Begin the write transaction. Blocks while another writer is
    /// active.
    ///
    /// # Errors
    /// Returns an error if the transaction cannot be started.
    pub fn write_txn(&self) -> Result<RwTxn<'_>> {
        Ok(self.env.write_txn()?)
    }

    /// Point lookup. `None` when the key is absent.
    ///
    /// # Errors
    /// Returns an error on store failure.
    pub fn get<'t>(&self, txn: &'t RoTxn<'_>, key: &[u8]) -> Result<Option<&'t [u8]>> {
        Ok(self.db.get(txn, key)?)
    }

    /// Insert or overwrite a key.
    ///
    /// # Errors
    /// Returns an error on store failure.
    pub fn put(&self, txn: &mut RwTxn<'_>, key: &[u8], value: &[u8]) -> Result<()> {
        Ok(self.db.put(txn, key, value)?)
    }

    /// Delete a key. Returns whether it existed.
    ///
    /// # Errors
    /// Returns an error on store failure.
    pub fn delete(&self, txn: &mut RwTxn<'_>, key: &[u8]) -> Result<bool> {
        Ok(self.db.delete(txn, key)?)
    }

    /// Iterate all keys sharing a prefix, in key order.
    ///
    /// # Errors
    /// Returns an error on store failure.
    pub fn prefix_iter<'t>(
        &self,
        txn: &'t RoTxn<'_>,
        prefix: &[u8],
    ) -> Result<RoPrefix<'t, Bytes, Bytes>> {
        Ok(self.db.prefix_iter(txn, prefix)?)
    }

    /// Iterate the whole keyspace, in key order.
    ///
    /// # Errors
    /// Returns an error on store failure.
    pub fn iter<'t>(&self, txn: &'t RoTxn<'_>) -> Result<heed::RoIter<'t, Bytes, Bytes>> {
        Ok(self.db.iter(txn)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_put_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        let mut wtxn = store.write_txn().unwrap();
        store.put(&mut wtxn, b"k1", b"v1").unwrap();
        wtxn.commit().unwrap();

        let rtxn = store.read_txn().unwrap();
        assert_eq!(store.get(&rtxn, b"k1").unwrap(), Some(&b"v1"[..]));
        assert_eq!(store.get(&rtxn, b"k2").unwrap(), None);
        drop(rtxn);

        let mut wtxn = store.write_txn().unwrap();
        assert!(store.delete(&mut wtxn, b"k1").unwrap());
        assert!(!store.delete(&mut wtxn, b"k1").unwrap());
        wtxn.commit().unwrap();
    }

    #[test]
    fn test_prefix_iter_is_ordered_and_scoped() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        let mut wtxn = store.write_txn().unwrap();
        for key in [&b"a/2"[..], b"a/1", b"b/1", b"a/3"] {
            store.put(&mut wtxn, key, b"x").unwrap();
        }
        wtxn.commit().unwrap();

        let rtxn = store.read_txn().unwrap();
        let keys: Vec<Vec<u8>> = store
            .prefix_iter(&rtxn, b"a/")
            .unwrap()
            .map(|r| r.unwrap().0.to_vec())
            .collect();
        assert_eq!(keys, vec![b"a/1".to_vec(), b"a/2".to_vec(), b"a/3".to_vec()]);
    }

    #[test]
    fn test_snapshot_does_not_see_later_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        let mut wtxn = store.write_txn().unwrap();
        store.put(&mut wtxn, b"k", b"old").unwrap();
        wtxn.commit().unwrap();

        let rtxn = store.read_txn().unwrap();

        let mut wtxn = store.write_txn().unwrap();
        store.put(&mut wtxn, b"k", b"new").unwrap();
        wtxn.commit().unwrap();

        assert_eq!(store.get(&rtxn, b"k").unwrap(), Some(&b"old"[..]));
    }
}
