//! Block index
//!
//! A per-folder secondary index from block content hash to the files
//! containing that block and the block's position within them. The file
//! reconstructor uses it to find local source data for a wanted block.
//! Entries follow the local device's live regular files; the index is an
//! eventually-consistent hint and consumers verify candidate blocks
//! before use.

use std::sync::RwLock;

use color_eyre::Result;
use tracing::debug;

use crate::config::Config;
use crate::file::FileInfo;
use crate::keys::{self, FOLDER_SLOT_LEN};
use crate::store::Store;

/// Per-folder hash → (file, block index) map.
pub struct BlockMap {
    folder: String,
    folder_slot: [u8; FOLDER_SLOT_LEN],
    store: Store,
}

impl BlockMap {
    /// Create the block map for a folder.
    ///
    /// # Errors
    /// Returns an error if the folder identifier exceeds the key slot.
    pub fn new(folder: &str, store: Store) -> Result<Self> {
        Ok(Self {
            folder: folder.to_owned(),
            folder_slot: keys::folder_slot(folder)?,
            store,
        })
    }

    /// Add files to the block map, ignoring any deleted, invalid or
    /// directory entries.
    ///
    /// # Errors
    /// Returns an error on store failure.
    pub fn add(&self, files: &[FileInfo]) -> Result<()> {
        debug!(folder = %self.folder, files = files.len(), "block map add");

        let mut wtxn = self.store.write_txn()?;
        for file in files {
            if file.is_directory() || file.is_deleted() || file.is_invalid() {
                continue;
            }
            self.add_one(&mut wtxn, file)?;
        }
        wtxn.commit()?;
        Ok(())
    }

    /// Apply changed files: deleted or invalid ones are discarded, the
    /// rest re-added, in one transaction.
    ///
    /// # Errors
    /// Returns an error on store failure.
    pub fn update(&self, files: &[FileInfo]) -> Result<()> {
        debug!(folder = %self.folder, files = files.len(), "block map update");

        let mut wtxn = self.store.write_txn()?;
        for file in files {
            if file.is_directory() {
                continue;
            }
            if file.is_deleted() || file.is_invalid() {
                self.discard_one(&mut wtxn, file)?;
            } else {
                self.add_one(&mut wtxn, file)?;
            }
        }
        wtxn.commit()?;
        Ok(())
    }

    /// Remove the given files' blocks from the map.
    ///
    /// # Errors
    /// Returns an error on store failure.
    pub fn discard(&self, files: &[FileInfo]) -> Result<()> {
        debug!(folder = %self.folder, files = files.len(), "block map discard");

        let mut wtxn = self.store.write_txn()?;
        for file in files {
            self.discard_one(&mut wtxn, file)?;
        }
        wtxn.commit()?;
        Ok(())
    }

    /// Remove every entry of this folder.
    ///
    /// # Errors
    /// Returns an error on store failure.
    pub fn drop_all(&self) -> Result<()> {
        debug!(folder = %self.folder, "block map drop");

        let mut wtxn = self.store.write_txn()?;
        let prefix = keys::block_folder_prefix(&self.folder_slot);
        let keys: Vec<Vec<u8>> = {
            let mut out = Vec::new();
            for item in self.store.prefix_iter(&wtxn, &prefix)? {
                let (k, _v) = item?;
                out.push(k.to_vec());
            }
            out
        };
        for key in keys {
            self.store.delete(&mut wtxn, &key)?;
        }
        wtxn.commit()?;
        Ok(())
    }

    /// Visit every (file, block index) entry for a hash in this folder.
    /// The callback returns true when satisfied; returns whether any
    /// callback was.
    ///
    /// # Errors
    /// Returns an error on store failure.
    pub fn iterate<F>(&self, hash: &[u8; 32], mut visit: F) -> Result<bool>
    where
        F: FnMut(&str, u32) -> bool,
    {
        let rtxn = self.store.read_txn()?;
        let prefix = keys::block_hash_prefix(&self.folder_slot, hash);
        for item in self.store.prefix_iter(&rtxn, &prefix)? {
            let (k, v) = item?;
            let (_hash, name) = keys::block_key_parts(k);
            let name = std::str::from_utf8(name)
                .unwrap_or_else(|_| panic!("block index corrupt: name is not UTF-8"));
            if visit(name, decode_index(v)) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn add_one(&self, wtxn: &mut heed::RwTxn<'_>, file: &FileInfo) -> Result<()> {
        for (i, block) in file.blocks.iter().enumerate() {
            let key = keys::block_key(&self.folder_slot, &block.hash, &file.name);
            self.store.put(wtxn, &key, &(i as u32).to_be_bytes())?;
        }
        Ok(())
    }

    fn discard_one(&self, wtxn: &mut heed::RwTxn<'_>, file: &FileInfo) -> Result<()> {
        for block in &file.blocks {
            let key = keys::block_key(&self.folder_slot, &block.hash, &file.name);
            self.store.delete(wtxn, &key)?;
        }
        Ok(())
    }
}

/// Cross-folder block lookup. Holds the configured folder order and
/// iterates the per-folder indices in that order, so every lookup walks
/// folders deterministically.
pub struct BlockFinder {
    store: Store,
    folders: RwLock<Vec<String>>,
}

impl BlockFinder {
    /// Create a finder over the folders named by the configuration.
    #[must_use]
    pub fn new(store: Store, config: &Config) -> Self {
        let finder = Self {
            store,
            folders: RwLock::new(Vec::new()),
        };
        finder.config_changed(config);
        finder
    }

    /// Replace the folder order wholesale after a configuration change.
    pub fn config_changed(&self, config: &Config) {
        let mut folders: Vec<String> = config.folders.iter().map(|f| f.id.clone()).collect();
        folders.sort();

        debug!(folders = folders.len(), "block finder folders updated");
        *self.folders.write().expect("folder lock poisoned") = folders;
    }

    /// Visit every (folder, file, block index) entry for a hash, in
    /// configured folder order. The callback returns true when satisfied
    /// with a block; returns whether any callback was.
    ///
    /// # Errors
    /// Returns an error on store failure.
    pub fn iterate<F>(&self, hash: &[u8; 32], mut visit: F) -> Result<bool>
    where
        F: FnMut(&str, &str, u32) -> bool,
    {
        let folders = self.folders.read().expect("folder lock poisoned").clone();
        let rtxn = self.store.read_txn()?;

        for folder in &folders {
            let Ok(slot) = keys::folder_slot(folder) else {
                continue;
            };
            let prefix = keys::block_hash_prefix(&slot, hash);
            for item in self.store.prefix_iter(&rtxn, &prefix)? {
                let (k, v) = item?;
                let (_hash, name) = keys::block_key_parts(k);
                let name = std::str::from_utf8(name)
                    .unwrap_or_else(|_| panic!("block index corrupt: name is not UTF-8"));
                if visit(folder, name, decode_index(v)) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Repair one stale entry: the old hash's entry for (folder, file)
    /// is dropped and an entry under the new hash written, atomically.
    ///
    /// # Errors
    /// Returns an error if the folder identifier is invalid or the store
    /// fails.
    pub fn fix(
        &self,
        folder: &str,
        file: &str,
        index: u32,
        old_hash: &[u8; 32],
        new_hash: &[u8; 32],
    ) -> Result<()> {
        debug!(%folder, %file, index, "block map fix");

        let slot = keys::folder_slot(folder)?;
        let mut wtxn = self.store.write_txn()?;
        self.store
            .delete(&mut wtxn, &keys::block_key(&slot, old_hash, file))?;
        self.store.put(
            &mut wtxn,
            &keys::block_key(&slot, new_hash, file),
            &index.to_be_bytes(),
        )?;
        wtxn.commit()?;
        Ok(())
    }
}

fn decode_index(v: &[u8]) -> u32 {
    let bytes: [u8; 4] = v
        .try_into()
        .unwrap_or_else(|_| panic!("block index corrupt: entry is not 4 bytes"));
    u32::from_be_bytes(bytes)
}
