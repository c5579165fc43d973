//! The replicated file-index set
//!
//! A [`FileSet`] tracks, for one folder, the files every participating
//! device claims to have, and keeps the per-name global version list
//! mechanically consistent with those records inside the same write
//! transaction. Reads run on snapshots and never block the writer.
//!
//! Undecodable records and version-list heads without a backing device
//! record are integrity errors: the data model has no safe continuation,
//! so these panic rather than pretend to recover.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use color_eyre::Result;
use heed::RwTxn;
use tracing::debug;

use crate::clock::Clock;
use crate::device::DeviceId;
use crate::file::{FileInfo, FileInfoTruncated, FileVersion, VersionList, FLAG_DELETED};
use crate::keys::{self, FOLDER_SLOT_LEN};
use crate::store::Store;
use crate::version::{Ordering, Vector};
use crate::wire;

fn corrupt(what: &str, err: color_eyre::Report) -> ! {
    panic!("file index corrupt: {what}: {err:#}");
}

/// Per-folder file index.
pub struct FileSet {
    folder: String,
    folder_slot: [u8; FOLDER_SLOT_LEN],
    store: Store,
    clock: Arc<Clock>,
    /// Largest local_version stored per device, the incremental-exchange
    /// watermark. Guarded briefly; the store transaction is the real
    /// serialization point.
    local_version: Mutex<HashMap<DeviceId, i64>>,
}

impl FileSet {
    /// Create the index for a folder, bound to a store and a clock.
    ///
    /// Seeds the local-version watermarks from the existing records and
    /// advances the clock past the largest local stamp seen.
    ///
    /// # Errors
    /// Returns an error if the folder identifier exceeds the key slot or
    /// the store fails.
    pub fn new(folder: &str, store: Store, clock: Arc<Clock>) -> Result<Self> {
        let folder_slot = keys::folder_slot(folder)?;
        let set = Self {
            folder: folder.to_owned(),
            folder_slot,
            store,
            clock,
            local_version: Mutex::new(HashMap::new()),
        };

        let mut seeded: HashMap<DeviceId, i64> = HashMap::new();
        let rtxn = set.store.read_txn()?;
        let prefix = keys::device_folder_prefix(&set.folder_slot);
        for item in set.store.prefix_iter(&rtxn, &prefix)? {
            let (k, v) = item?;
            let device = keys::device_key_device(k)
                .unwrap_or_else(|| panic!("file index corrupt: malformed device key"));
            let f = wire::decode_file_info_truncated(v)
                .unwrap_or_else(|e| corrupt("device record", e));
            let entry = seeded.entry(device).or_insert(0);
            if f.local_version > *entry {
                *entry = f.local_version;
            }
        }
        drop(rtxn);

        if let Some(&max) = seeded.get(&DeviceId::LOCAL) {
            set.clock.tick(max);
        }
        *set.local_version.lock().expect("watermark mutex poisoned") = seeded;

        debug!(folder = %set.folder, "file set opened");
        Ok(set)
    }

    /// The folder this set indexes.
    #[must_use]
    pub fn folder(&self) -> &str {
        &self.folder
    }

    /// Idempotent incremental merge of records for one device.
    ///
    /// Records whose (version, flags) match what is stored are no-ops.
    /// Invalid records are pulled out of the global version list; all
    /// others are upserted into it. LOCAL records arriving with a zero
    /// local_version are stamped from the clock. Returns the largest
    /// local_version written, for checkpointing.
    ///
    /// # Errors
    /// Returns an error on store failure; nothing is partially applied.
    pub fn update(&self, device: &DeviceId, fs: &[FileInfo]) -> Result<i64> {
        debug!(folder = %self.folder, %device, files = fs.len(), "update");

        let mut max_local_ver = 0;
        let mut wtxn = self.store.write_txn()?;

        for f in fs {
            let key = keys::device_key(&self.folder_slot, device, &f.name);
            let existing = self
                .store
                .get(&wtxn, &key)?
                .map(|bs| {
                    wire::decode_file_info_truncated(bs)
                        .unwrap_or_else(|e| corrupt("device record", e))
                });

            // Flags can change without a version bump, e.g. when a file is
            // marked invalid in place.
            if let Some(ef) = &existing {
                if ef.version.equal(&f.version) && ef.flags == f.flags {
                    continue;
                }
            }

            let lv = self.insert(&mut wtxn, device, f)?;
            if lv > max_local_ver {
                max_local_ver = lv;
            }
            if f.is_invalid() {
                self.remove_from_global(&mut wtxn, device, &f.name)?;
            } else {
                self.update_global(&mut wtxn, device, &f.name, &f.version)?;
            }
        }

        wtxn.commit()?;
        self.note_local_version(device, max_local_ver);
        Ok(max_local_ver)
    }

    /// Replace the device's record set wholesale. Names missing from `fs`
    /// lose both their device record and their version-list entry.
    ///
    /// # Errors
    /// Returns an error on store failure; nothing is partially applied.
    pub fn replace(&self, device: &DeviceId, fs: &[FileInfo]) -> Result<i64> {
        debug!(folder = %self.folder, %device, files = fs.len(), "replace");

        self.generic_replace(device, fs, |set, wtxn, dev, old| {
            set.remove_from_global(wtxn, dev, &old.name)?;
            set.store
                .delete(wtxn, &keys::device_key(&set.folder_slot, dev, &old.name))?;
            Ok(0)
        })
    }

    /// Replace the device's record set, turning disappeared names into
    /// deletion tombstones instead of erasing them. This is how a local
    /// filesystem scan propagates disappearances into the index.
    ///
    /// # Errors
    /// Returns an error on store failure; nothing is partially applied.
    pub fn replace_with_delete(
        &self,
        device: &DeviceId,
        fs: &[FileInfo],
        local_short_id: u64,
    ) -> Result<i64> {
        debug!(folder = %self.folder, %device, files = fs.len(), "replace with delete");

        self.generic_replace(device, fs, move |set, wtxn, dev, old| {
            if old.is_deleted() {
                return Ok(0);
            }
            let ts = set.clock.tick(old.local_version);
            let tombstone = FileInfo {
                name: old.name.clone(),
                flags: old.flags | FLAG_DELETED,
                modified: old.modified,
                version: old.version.clone().update(local_short_id),
                local_version: ts,
                blocks: Vec::new(),
            };
            set.store.put(
                wtxn,
                &keys::device_key(&set.folder_slot, dev, &tombstone.name),
                &wire::encode_file_info(&tombstone),
            )?;
            set.update_global(wtxn, dev, &tombstone.name, &tombstone.version)?;
            Ok(ts)
        })
    }

    /// Merge-sort diff of `fs` against the device's stored records, both
    /// ordered by name. `delete_fn` decides what happens to names present
    /// in the store but absent from `fs`.
    fn generic_replace<D>(&self, device: &DeviceId, fs: &[FileInfo], mut delete_fn: D) -> Result<i64>
    where
        D: FnMut(&Self, &mut RwTxn<'_>, &DeviceId, &FileInfoTruncated) -> Result<i64>,
    {
        let mut fs: Vec<&FileInfo> = fs.iter().collect();
        fs.sort_by(|a, b| a.name.cmp(&b.name));

        let mut wtxn = self.store.write_txn()?;

        // An LMDB cursor borrows its transaction, so snapshot the existing
        // records before mutating. Truncated decode; the diff never needs
        // block lists.
        let existing: Vec<FileInfoTruncated> = {
            let prefix = keys::device_key_prefix(&self.folder_slot, device);
            let mut out = Vec::new();
            for item in self.store.prefix_iter(&wtxn, &prefix)? {
                let (_k, v) = item?;
                out.push(
                    wire::decode_file_info_truncated(v)
                        .unwrap_or_else(|e| corrupt("device record", e)),
                );
            }
            out
        };

        let mut max_local_ver = 0;
        let mut fi = 0;
        let mut ei = 0;
        while fi < fs.len() || ei < existing.len() {
            let cmp = if fi >= fs.len() {
                std::cmp::Ordering::Greater
            } else if ei >= existing.len() {
                std::cmp::Ordering::Less
            } else {
                fs[fi].name.as_str().cmp(existing[ei].name.as_str())
            };

            match cmp {
                std::cmp::Ordering::Less => {
                    // The store is missing this name. Insert it.
                    let f = fs[fi];
                    let lv = self.insert(&mut wtxn, device, f)?;
                    if lv > max_local_ver {
                        max_local_ver = lv;
                    }
                    if f.is_invalid() {
                        self.remove_from_global(&mut wtxn, device, &f.name)?;
                    } else {
                        self.update_global(&mut wtxn, device, &f.name, &f.version)?;
                    }
                    fi += 1;
                }
                std::cmp::Ordering::Equal => {
                    // Present on both sides; rewrite only on a version or
                    // flag difference.
                    let f = fs[fi];
                    let ef = &existing[ei];
                    if !f.version.equal(&ef.version) || f.flags != ef.flags {
                        let lv = self.insert(&mut wtxn, device, f)?;
                        if lv > max_local_ver {
                            max_local_ver = lv;
                        }
                        if f.is_invalid() {
                            self.remove_from_global(&mut wtxn, device, &f.name)?;
                        } else {
                            self.update_global(&mut wtxn, device, &f.name, &f.version)?;
                        }
                    }
                    fi += 1;
                    ei += 1;
                }
                std::cmp::Ordering::Greater => {
                    // The store has a name the new set lacks.
                    let lv = delete_fn(self, &mut wtxn, device, &existing[ei])?;
                    if lv > max_local_ver {
                        max_local_ver = lv;
                    }
                    ei += 1;
                }
            }
        }

        wtxn.commit()?;
        self.note_local_version(device, max_local_ver);
        Ok(max_local_ver)
    }

    /// Write one device record, stamping LOCAL records that arrive
    /// without a local_version.
    fn insert(&self, wtxn: &mut RwTxn<'_>, device: &DeviceId, f: &FileInfo) -> Result<i64> {
        let key = keys::device_key(&self.folder_slot, device, &f.name);
        if *device == DeviceId::LOCAL && f.local_version == 0 {
            let mut f = f.clone();
            f.local_version = self.clock.tick(0);
            self.store.put(wtxn, &key, &wire::encode_file_info(&f))?;
            Ok(f.local_version)
        } else {
            self.store.put(wtxn, &key, &wire::encode_file_info(f))?;
            Ok(f.local_version)
        }
    }

    /// Upsert this device's entry in the name's version list, keeping the
    /// list sorted descending under the vector total order. Returns false
    /// when the stored entry was already identical.
    fn update_global(
        &self,
        wtxn: &mut RwTxn<'_>,
        device: &DeviceId,
        name: &str,
        version: &Vector,
    ) -> Result<bool> {
        let gkey = keys::global_key(&self.folder_slot, name);
        let mut vl = match self.store.get(wtxn, &gkey)? {
            Some(bs) => {
                wire::decode_version_list(bs).unwrap_or_else(|e| corrupt("version list", e))
            }
            None => VersionList::default(),
        };

        if let Some(i) = vl.versions.iter().position(|fv| fv.device == *device) {
            if vl.versions[i].version.equal(version) {
                return Ok(false);
            }
            vl.versions.remove(i);
        }

        let nv = FileVersion {
            device: *device,
            version: version.clone(),
        };
        // Compare against ConcurrentLesser as well: conflicting versions
        // must land in the same order on every device.
        let pos = vl.versions.iter().position(|fv| {
            matches!(
                fv.version.compare(version),
                Ordering::Equal | Ordering::Lesser | Ordering::ConcurrentLesser
            )
        });
        match pos {
            Some(i) => vl.versions.insert(i, nv),
            None => vl.versions.push(nv),
        }

        self.store.put(wtxn, &gkey, &wire::encode_version_list(&vl))?;
        Ok(true)
    }

    /// Drop this device's entry from the name's version list, deleting
    /// the list entirely when it empties.
    fn remove_from_global(
        &self,
        wtxn: &mut RwTxn<'_>,
        device: &DeviceId,
        name: &str,
    ) -> Result<()> {
        let gkey = keys::global_key(&self.folder_slot, name);
        // The first record for a name may already be invalid, in which
        // case there is no list to remove from.
        let Some(bs) = self.store.get(wtxn, &gkey)? else {
            return Ok(());
        };
        let mut vl =
            wire::decode_version_list(bs).unwrap_or_else(|e| corrupt("version list", e));

        if let Some(i) = vl.versions.iter().position(|fv| fv.device == *device) {
            vl.versions.remove(i);
        }

        if vl.versions.is_empty() {
            self.store.delete(wtxn, &gkey)?;
        } else {
            self.store.put(wtxn, &gkey, &wire::encode_version_list(&vl))?;
        }
        Ok(())
    }

    /// One device's record of one name.
    ///
    /// # Errors
    /// Returns an error on store failure. Absence is `None`, not an
    /// error.
    pub fn get(&self, device: &DeviceId, name: &str) -> Result<Option<FileInfo>> {
        let rtxn = self.store.read_txn()?;
        let key = keys::device_key(&self.folder_slot, device, name);
        match self.store.get(&rtxn, &key)? {
            Some(bs) => Ok(Some(
                wire::decode_file_info(bs).unwrap_or_else(|e| corrupt("device record", e)),
            )),
            None => Ok(None),
        }
    }

    /// The cluster-wide winning record for a name: the head of the
    /// version list, resolved to its device record.
    ///
    /// # Errors
    /// Returns an error on store failure.
    pub fn get_global(&self, name: &str) -> Result<Option<FileInfo>> {
        let rtxn = self.store.read_txn()?;
        let Some(bs) = self
            .store
            .get(&rtxn, &keys::global_key(&self.folder_slot, name))?
        else {
            return Ok(None);
        };
        let vl = wire::decode_version_list(bs).unwrap_or_else(|e| corrupt("version list", e));
        let Some(head) = vl.head() else {
            panic!("file index corrupt: empty version list for {name:?}");
        };

        let key = keys::device_key(&self.folder_slot, &head.device, name);
        let bs = self.store.get(&rtxn, &key)?.unwrap_or_else(|| {
            panic!("file index corrupt: version list head for {name:?} has no device record")
        });
        Ok(Some(
            wire::decode_file_info(bs).unwrap_or_else(|e| corrupt("device record", e)),
        ))
    }

    /// Visit every record of one device, in name order. The callback
    /// returns true to continue.
    ///
    /// # Errors
    /// Returns an error on store failure.
    pub fn with_have<F>(&self, device: &DeviceId, mut visit: F) -> Result<()>
    where
        F: FnMut(&FileInfo) -> bool,
    {
        let rtxn = self.store.read_txn()?;
        let prefix = keys::device_key_prefix(&self.folder_slot, device);
        for item in self.store.prefix_iter(&rtxn, &prefix)? {
            let (_k, v) = item?;
            let f = wire::decode_file_info(v).unwrap_or_else(|e| corrupt("device record", e));
            if !visit(&f) {
                break;
            }
        }
        Ok(())
    }

    /// As [`Self::with_have`] without decoding block lists.
    ///
    /// # Errors
    /// Returns an error on store failure.
    pub fn with_have_truncated<F>(&self, device: &DeviceId, mut visit: F) -> Result<()>
    where
        F: FnMut(&FileInfoTruncated) -> bool,
    {
        let rtxn = self.store.read_txn()?;
        let prefix = keys::device_key_prefix(&self.folder_slot, device);
        for item in self.store.prefix_iter(&rtxn, &prefix)? {
            let (_k, v) = item?;
            let f = wire::decode_file_info_truncated(v)
                .unwrap_or_else(|e| corrupt("device record", e));
            if !visit(&f) {
                break;
            }
        }
        Ok(())
    }

    /// Visit the winning record of every name, in name order.
    ///
    /// # Errors
    /// Returns an error on store failure.
    pub fn with_global<F>(&self, visit: F) -> Result<()>
    where
        F: FnMut(&FileInfo) -> bool,
    {
        self.with_global_prefixed("", visit)
    }

    /// As [`Self::with_global`], narrowed to names starting with
    /// `name_prefix`.
    ///
    /// # Errors
    /// Returns an error on store failure.
    pub fn with_global_prefixed<F>(&self, name_prefix: &str, mut visit: F) -> Result<()>
    where
        F: FnMut(&FileInfo) -> bool,
    {
        let rtxn = self.store.read_txn()?;
        let prefix = keys::global_key_prefix(&self.folder_slot, name_prefix);
        for item in self.store.prefix_iter(&rtxn, &prefix)? {
            let (k, v) = item?;
            let f = self.resolve_head(&rtxn, k, v)?;
            if !visit(&f) {
                break;
            }
        }
        Ok(())
    }

    /// As [`Self::with_global`] without decoding block lists.
    ///
    /// # Errors
    /// Returns an error on store failure.
    pub fn with_global_truncated<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(&FileInfoTruncated) -> bool,
    {
        let rtxn = self.store.read_txn()?;
        let prefix = keys::global_key_prefix(&self.folder_slot, "");
        for item in self.store.prefix_iter(&rtxn, &prefix)? {
            let (k, v) = item?;
            let f = self.resolve_head(&rtxn, k, v)?;
            if !visit(&f.truncate()) {
                break;
            }
        }
        Ok(())
    }

    fn resolve_head(
        &self,
        rtxn: &heed::RoTxn<'_>,
        gkey: &[u8],
        gval: &[u8],
    ) -> Result<FileInfo> {
        let vl = wire::decode_version_list(gval).unwrap_or_else(|e| corrupt("version list", e));
        let name = std::str::from_utf8(keys::global_key_name(gkey))
            .unwrap_or_else(|_| panic!("file index corrupt: global key name is not UTF-8"));
        let Some(head) = vl.head() else {
            panic!("file index corrupt: empty version list for {name:?}");
        };
        let key = keys::device_key(&self.folder_slot, &head.device, name);
        let bs = self.store.get(rtxn, &key)?.unwrap_or_else(|| {
            panic!("file index corrupt: version list head for {name:?} has no device record")
        });
        Ok(wire::decode_file_info(bs).unwrap_or_else(|e| corrupt("device record", e)))
    }

    /// Visit the winning record of every name the device needs: names it
    /// lacks entirely, or holds at a version that is not greater-equal
    /// the head (concurrent copies count as needed). Deleted winners are
    /// skipped for devices that never had the file; invalid copies are
    /// never handed out. Resolution falls through equal-version copies
    /// until a valid one is found.
    ///
    /// # Errors
    /// Returns an error on store failure.
    pub fn with_need<F>(&self, device: &DeviceId, mut visit: F) -> Result<()>
    where
        F: FnMut(&FileInfo) -> bool,
    {
        self.with_need_impl(device, |f| visit(f))
    }

    /// As [`Self::with_need`] without block lists in the callback.
    ///
    /// # Errors
    /// Returns an error on store failure.
    pub fn with_need_truncated<F>(&self, device: &DeviceId, mut visit: F) -> Result<()>
    where
        F: FnMut(&FileInfoTruncated) -> bool,
    {
        self.with_need_impl(device, |f| visit(&f.clone().truncate()))
    }

    fn with_need_impl<F>(&self, device: &DeviceId, mut visit: F) -> Result<()>
    where
        F: FnMut(&FileInfo) -> bool,
    {
        let rtxn = self.store.read_txn()?;
        let prefix = keys::global_key_prefix(&self.folder_slot, "");
        'next_file: for item in self.store.prefix_iter(&rtxn, &prefix)? {
            let (k, v) = item?;
            let vl = wire::decode_version_list(v).unwrap_or_else(|e| corrupt("version list", e));
            let name = std::str::from_utf8(keys::global_key_name(k))
                .unwrap_or_else(|_| panic!("file index corrupt: global key name is not UTF-8"));
            let Some(head) = vl.head() else {
                panic!("file index corrupt: empty version list for {name:?}");
            };

            let mut have = false; // the device has the file, any version
            let mut need = false; // the device has a losing version
            for fv in &vl.versions {
                if fv.device == *device {
                    have = true;
                    need = !fv.version.greater_equal(&head.version);
                    break;
                }
            }
            if have && !need {
                continue;
            }

            for fv in &vl.versions {
                if !fv.version.equal(&head.version) {
                    // Out of copies at the winning version; nothing valid
                    // to hand out for this name.
                    continue 'next_file;
                }
                let key = keys::device_key(&self.folder_slot, &fv.device, name);
                let bs = self.store.get(&rtxn, &key)?.unwrap_or_else(|| {
                    panic!(
                        "file index corrupt: version list entry for {name:?} has no device record"
                    )
                });
                let gf =
                    wire::decode_file_info(bs).unwrap_or_else(|e| corrupt("device record", e));

                if gf.is_invalid() {
                    // Try the next copy at the same version.
                    continue;
                }
                if gf.is_deleted() && !have {
                    // Nobody needs a deletion of a file they never had.
                    continue 'next_file;
                }
                if !visit(&gf) {
                    return Ok(());
                }
                continue 'next_file;
            }
        }
        Ok(())
    }

    /// The devices holding exactly the winning version of a name. Empty
    /// when the name is unknown.
    ///
    /// # Errors
    /// Returns an error on store failure.
    pub fn availability(&self, name: &str) -> Result<Vec<DeviceId>> {
        let rtxn = self.store.read_txn()?;
        let Some(bs) = self
            .store
            .get(&rtxn, &keys::global_key(&self.folder_slot, name))?
        else {
            return Ok(Vec::new());
        };
        let vl = wire::decode_version_list(bs).unwrap_or_else(|e| corrupt("version list", e));

        let mut devices = Vec::new();
        if let Some(head) = vl.head() {
            for fv in &vl.versions {
                if !fv.version.equal(&head.version) {
                    break;
                }
                devices.push(fv.device);
            }
        }
        Ok(devices)
    }

    /// The largest local_version stored for a device; the ack watermark
    /// for incremental exchanges. Zero for unknown devices.
    #[must_use]
    pub fn local_version(&self, device: &DeviceId) -> i64 {
        self.local_version
            .lock()
            .expect("watermark mutex poisoned")
            .get(device)
            .copied()
            .unwrap_or(0)
    }

    fn note_local_version(&self, device: &DeviceId, lv: i64) {
        if lv == 0 {
            return;
        }
        let mut map = self.local_version.lock().expect("watermark mutex poisoned");
        let entry = map.entry(*device).or_insert(0);
        if lv > *entry {
            *entry = lv;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::{BlockInfo, FLAG_INVALID};

    const REMOTE1: DeviceId = DeviceId::from_raw([1; 32]);
    const REMOTE2: DeviceId = DeviceId::from_raw([2; 32]);

    fn setup() -> (tempfile::TempDir, FileSet) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let set = FileSet::new("test", store, Arc::new(Clock::new())).unwrap();
        (dir, set)
    }

    fn gen_blocks(n: usize) -> Vec<BlockInfo> {
        (0..n)
            .map(|i| {
                let mut hash = [0u8; 32];
                for (j, b) in hash.iter_mut().enumerate() {
                    *b = (i + j) as u8;
                }
                BlockInfo {
                    hash,
                    offset: i as i64 * 128,
                    size: 128,
                }
            })
            .collect()
    }

    fn file(name: &str, pairs: &[(u64, u64)]) -> FileInfo {
        FileInfo {
            name: name.into(),
            version: Vector::from_pairs(pairs),
            blocks: gen_blocks(2),
            ..FileInfo::default()
        }
    }

    fn global_names(set: &FileSet) -> Vec<String> {
        let mut names = Vec::new();
        set.with_global(|f| {
            names.push(f.name.clone());
            true
        })
        .unwrap();
        names
    }

    fn need_names(set: &FileSet, device: &DeviceId) -> Vec<String> {
        let mut names = Vec::new();
        set.with_need(device, |f| {
            names.push(f.name.clone());
            true
        })
        .unwrap();
        names
    }

    /// List order tracks update arrival among equal versions; sort for
    /// set comparisons.
    fn availability_sorted(set: &FileSet, name: &str) -> Vec<DeviceId> {
        let mut devs = set.availability(name).unwrap();
        devs.sort();
        devs
    }

    fn have_dump(set: &FileSet, device: &DeviceId) -> Vec<FileInfo> {
        let mut out = Vec::new();
        set.with_have(device, |f| {
            out.push(f.clone());
            true
        })
        .unwrap();
        out
    }

    #[test]
    fn test_two_device_merge() {
        let (_dir, set) = setup();
        let local_short = DeviceId::LOCAL.short_id();
        let rem_short = REMOTE1.short_id();

        set.replace(
            &DeviceId::LOCAL,
            &[file("a", &[(local_short, 1)]), file("b", &[(local_short, 1)])],
        )
        .unwrap();
        set.update(
            &REMOTE1,
            &[file("a", &[(local_short, 1)]), file("c", &[(rem_short, 1)])],
        )
        .unwrap();

        assert_eq!(global_names(&set), vec!["a", "b", "c"]);
        assert_eq!(
            availability_sorted(&set, "a"),
            vec![REMOTE1, DeviceId::LOCAL]
        );
        assert_eq!(need_names(&set, &REMOTE1), vec!["b"]);
        assert_eq!(need_names(&set, &DeviceId::LOCAL), vec!["c"]);
    }

    #[test]
    fn test_concurrent_conflict_breaks_deterministically() {
        let (_dir, set) = setup();
        let local_short = DeviceId::LOCAL.short_id();
        let rem_short = REMOTE1.short_id();

        set.replace(&DeviceId::LOCAL, &[file("a", &[(local_short, 2)])])
            .unwrap();
        set.update(&REMOTE1, &[file("a", &[(rem_short, 2)])]).unwrap();

        // LOCAL's short id (0xFF..) encodes larger than REMOTE1's, so the
        // local copy wins the tiebreak and is the sole head.
        let winner = set.get_global("a").unwrap().unwrap();
        assert_eq!(winner.version, Vector::from_pairs(&[(local_short, 2)]));
        assert_eq!(set.availability("a").unwrap(), vec![DeviceId::LOCAL]);

        // The conflicting copy counts as needed by its loser.
        assert_eq!(need_names(&set, &REMOTE1), vec!["a"]);
    }

    #[test]
    fn test_deletion_propagates_as_tombstone() {
        let (_dir, set) = setup();
        let local_short = DeviceId::LOCAL.short_id();

        let a = file("a", &[(local_short, 1)]);
        let b = file("b", &[(local_short, 1)]);
        set.replace_with_delete(&DeviceId::LOCAL, &[a.clone(), b.clone()], local_short)
            .unwrap();
        set.update(&REMOTE1, &[b.clone()]).unwrap();

        // The next scan no longer sees b.
        set.replace_with_delete(&DeviceId::LOCAL, &[a.clone()], local_short)
            .unwrap();

        let stored = set.get(&DeviceId::LOCAL, "b").unwrap().unwrap();
        assert!(stored.is_deleted());
        assert!(stored.blocks.is_empty());
        assert_eq!(stored.version.counter(local_short), 2);
        assert!(stored.local_version > 0);

        // The tombstone wins globally, and the remote still holding the
        // old copy needs it.
        let winner = set.get_global("b").unwrap().unwrap();
        assert!(winner.is_deleted());
        assert_eq!(need_names(&set, &REMOTE1), vec!["a", "b"]);
        // Devices that never had b do not need its deletion, only the
        // live file.
        assert_eq!(need_names(&set, &REMOTE2), vec!["a"]);
    }

    #[test]
    fn test_invalid_bit_removes_from_global() {
        let (_dir, set) = setup();
        let local_short = DeviceId::LOCAL.short_id();

        let a = file("a", &[(local_short, 1)]);
        set.replace(&DeviceId::LOCAL, &[a.clone()]).unwrap();
        set.update(&REMOTE1, &[a.clone()]).unwrap();
        assert_eq!(
            availability_sorted(&set, "a"),
            vec![REMOTE1, DeviceId::LOCAL]
        );

        let mut invalid = a.clone();
        invalid.flags |= FLAG_INVALID;
        set.update(&REMOTE1, &[invalid]).unwrap();

        assert_eq!(set.availability("a").unwrap(), vec![DeviceId::LOCAL]);
        // The device record itself survives, flagged.
        assert!(set.get(&REMOTE1, "a").unwrap().unwrap().is_invalid());
    }

    #[test]
    fn test_invalid_first_record_never_reaches_global() {
        let (_dir, set) = setup();
        let rem_short = REMOTE1.short_id();

        let mut f = file("ghost", &[(rem_short, 1)]);
        f.flags |= FLAG_INVALID;
        set.update(&REMOTE1, &[f]).unwrap();

        assert_eq!(global_names(&set), Vec::<String>::new());
        assert!(set.get_global("ghost").unwrap().is_none());
    }

    #[test]
    fn test_update_is_idempotent() {
        let (_dir, set) = setup();
        let rem_short = REMOTE1.short_id();

        let fs = vec![file("a", &[(rem_short, 1)]), file("b", &[(rem_short, 2)])];
        set.update(&REMOTE1, &fs).unwrap();
        let before = have_dump(&set, &REMOTE1);
        set.update(&REMOTE1, &fs).unwrap();
        let after = have_dump(&set, &REMOTE1);

        assert_eq!(before, after);
        assert_eq!(global_names(&set), vec!["a", "b"]);
    }

    #[test]
    fn test_replace_is_idempotent() {
        let (_dir, set) = setup();
        let local_short = DeviceId::LOCAL.short_id();

        let fs = vec![file("a", &[(local_short, 1)]), file("b", &[(local_short, 1)])];
        set.replace(&DeviceId::LOCAL, &fs).unwrap();
        let before = have_dump(&set, &DeviceId::LOCAL);

        set.replace(&DeviceId::LOCAL, &fs).unwrap();
        assert_eq!(have_dump(&set, &DeviceId::LOCAL), before);

        // A delete-style replace of the identical set changes nothing
        // either: every name is still present.
        set.replace_with_delete(&DeviceId::LOCAL, &fs, local_short)
            .unwrap();
        assert_eq!(have_dump(&set, &DeviceId::LOCAL), before);
    }

    #[test]
    fn test_empty_replace_clears_device() {
        let (_dir, set) = setup();
        let local_short = DeviceId::LOCAL.short_id();
        let rem_short = REMOTE1.short_id();

        let shared = file("a", &[(local_short, 1)]);
        set.replace(&DeviceId::LOCAL, &[shared.clone()]).unwrap();
        set.update(&REMOTE1, &[shared, file("only-remote", &[(rem_short, 1)])])
            .unwrap();

        set.replace(&REMOTE1, &[]).unwrap();

        assert_eq!(have_dump(&set, &REMOTE1), Vec::<FileInfo>::new());
        // a's list keeps LOCAL; only-remote's list emptied and vanished.
        assert_eq!(set.availability("a").unwrap(), vec![DeviceId::LOCAL]);
        assert_eq!(global_names(&set), vec!["a"]);
    }

    #[test]
    fn test_tombstone_revived_by_newer_version() {
        let (_dir, set) = setup();
        let local_short = DeviceId::LOCAL.short_id();
        let rem_short = REMOTE1.short_id();

        set.replace_with_delete(
            &DeviceId::LOCAL,
            &[file("a", &[(local_short, 1)])],
            local_short,
        )
        .unwrap();
        set.replace_with_delete(&DeviceId::LOCAL, &[], local_short)
            .unwrap();
        assert!(set.get(&DeviceId::LOCAL, "a").unwrap().unwrap().is_deleted());

        // A strictly newer live copy takes over.
        let revived = file("a", &[(local_short, 2), (rem_short, 1)]);
        set.update(&DeviceId::LOCAL, &[revived.clone()]).unwrap();
        let stored = set.get(&DeviceId::LOCAL, "a").unwrap().unwrap();
        assert!(!stored.is_deleted());
        assert_eq!(stored.version, revived.version);
    }

    #[test]
    fn test_get_and_get_global() {
        let (_dir, set) = setup();
        let local_short = DeviceId::LOCAL.short_id();
        let rem_short = REMOTE1.short_id();

        let old = file("b", &[(local_short, 1)]);
        let newer = file("b", &[(local_short, 1), (rem_short, 1)]);
        set.replace(&DeviceId::LOCAL, &[old.clone()]).unwrap();
        set.update(&REMOTE1, &[newer.clone()]).unwrap();

        assert_eq!(set.get(&DeviceId::LOCAL, "b").unwrap().unwrap().version, old.version);
        assert_eq!(set.get_global("b").unwrap().unwrap().version, newer.version);
        assert!(set.get(&DeviceId::LOCAL, "nope").unwrap().is_none());
        assert!(set.get_global("nope").unwrap().is_none());
    }

    #[test]
    fn test_local_version_watermark_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let rem_short = REMOTE1.short_id();

        let set = FileSet::new("test", store.clone(), Arc::new(Clock::new())).unwrap();
        set.update(
            &DeviceId::LOCAL,
            &[file("a", &[(DeviceId::LOCAL.short_id(), 1)])],
        )
        .unwrap();
        let mut remote = file("r", &[(rem_short, 1)]);
        remote.local_version = 77;
        set.update(&REMOTE1, &[remote]).unwrap();

        let local_mark = set.local_version(&DeviceId::LOCAL);
        assert!(local_mark > 0);
        assert_eq!(set.local_version(&REMOTE1), 77);
        assert_eq!(set.local_version(&REMOTE2), 0);

        let reopened = FileSet::new("test", store, Arc::new(Clock::new())).unwrap();
        assert_eq!(reopened.local_version(&DeviceId::LOCAL), local_mark);
        assert_eq!(reopened.local_version(&REMOTE1), 77);
    }

    #[test]
    fn test_reopened_clock_stays_ahead_of_stored_stamps() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let local_short = DeviceId::LOCAL.short_id();

        let set = FileSet::new("test", store.clone(), Arc::new(Clock::new())).unwrap();
        set.update(&DeviceId::LOCAL, &[file("a", &[(local_short, 1)])])
            .unwrap();
        let mark = set.local_version(&DeviceId::LOCAL);

        let clock = Arc::new(Clock::new());
        let set = FileSet::new("test", store, clock.clone()).unwrap();
        set.update(&DeviceId::LOCAL, &[file("b", &[(local_short, 1)])])
            .unwrap();
        assert!(set.local_version(&DeviceId::LOCAL) > mark);
    }

    #[test]
    fn test_long_names_are_accepted() {
        let (_dir, set) = setup();
        let local_short = DeviceId::LOCAL.short_id();

        let name = format!("dir/{}", "x".repeat(1500));
        set.update(&DeviceId::LOCAL, &[file(&name, &[(local_short, 1)])])
            .unwrap();
        assert!(set.get(&DeviceId::LOCAL, &name).unwrap().is_some());
        assert_eq!(global_names(&set), vec![name]);
    }

    #[test]
    fn test_folder_longer_than_slot_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let folder = "f".repeat(65);
        assert!(FileSet::new(&folder, store, Arc::new(Clock::new())).is_err());
    }

    #[test]
    fn test_with_have_stops_on_false() {
        let (_dir, set) = setup();
        let local_short = DeviceId::LOCAL.short_id();

        set.replace(
            &DeviceId::LOCAL,
            &[
                file("a", &[(local_short, 1)]),
                file("b", &[(local_short, 1)]),
                file("c", &[(local_short, 1)]),
            ],
        )
        .unwrap();

        let mut seen = 0;
        set.with_have(&DeviceId::LOCAL, |_| {
            seen += 1;
            seen < 2
        })
        .unwrap();
        assert_eq!(seen, 2);
    }

    #[test]
    fn test_with_global_prefixed() {
        let (_dir, set) = setup();
        let local_short = DeviceId::LOCAL.short_id();

        set.replace(
            &DeviceId::LOCAL,
            &[
                file("dir/a", &[(local_short, 1)]),
                file("dir/b", &[(local_short, 1)]),
                file("other", &[(local_short, 1)]),
            ],
        )
        .unwrap();

        let mut names = Vec::new();
        set.with_global_prefixed("dir/", |f| {
            names.push(f.name.clone());
            true
        })
        .unwrap();
        assert_eq!(names, vec!["dir/a", "dir/b"]);
    }

    #[test]
    fn test_version_list_invariant_head_backed_by_record() {
        let (_dir, set) = setup();
        let local_short = DeviceId::LOCAL.short_id();
        let rem_short = REMOTE1.short_id();

        set.replace(&DeviceId::LOCAL, &[file("a", &[(local_short, 1)])])
            .unwrap();
        set.update(&REMOTE1, &[file("a", &[(local_short, 1), (rem_short, 1)])])
            .unwrap();
        set.update(&REMOTE2, &[file("a", &[(local_short, 1)])]).unwrap();

        // Whatever the head claims must exist as a device record with an
        // equal version — resolve through the public surface.
        let winner = set.get_global("a").unwrap().unwrap();
        let holders = set.availability("a").unwrap();
        assert_eq!(holders, vec![REMOTE1]);
        for dev in holders {
            let copy = set.get(&dev, "a").unwrap().unwrap();
            assert!(copy.version.equal(&winner.version));
        }
    }

    #[test]
    fn test_truncated_iteration_matches_full() {
        let (_dir, set) = setup();
        let local_short = DeviceId::LOCAL.short_id();

        set.replace(
            &DeviceId::LOCAL,
            &[file("a", &[(local_short, 1)]), file("b", &[(local_short, 2)])],
        )
        .unwrap();

        let full = have_dump(&set, &DeviceId::LOCAL);
        let mut truncated = Vec::new();
        set.with_have_truncated(&DeviceId::LOCAL, |f| {
            truncated.push(f.clone());
            true
        })
        .unwrap();

        let expected: Vec<_> = full.into_iter().map(FileInfo::truncate).collect();
        assert_eq!(truncated, expected);
    }
}
