//! Scanner-facing glue
//!
//! The filesystem walker itself is an external collaborator: it hashes
//! files and produces [`FileInfo`] descriptors over a channel, consulting
//! the index through [`CurrentFiler`] for what it knew before. This
//! module owns the other half: scoping a scan to sane subdirectories,
//! streaming walker output into the index in batches, and sweeping the
//! index afterwards for records the disk no longer backs, which become
//! invalid or deleted tombstones.

use std::path::{Component, Path, PathBuf};
use std::sync::mpsc;

use color_eyre::Result;
use color_eyre::eyre::bail;
use ignore::gitignore::Gitignore;
use tracing::{debug, warn};

use crate::device::DeviceId;
use crate::file::{FileInfo, FLAG_DELETED, FLAG_INVALID};
use crate::fileset::FileSet;

/// Default block size for walkers that chunk file contents.
pub const DEFAULT_BLOCK_SIZE: u32 = 128 * 1024;

/// Default prefix of in-progress temporary files, which never enter the
/// index.
pub const DEFAULT_TEMP_PREFIX: &str = ".findex.tmp.";

/// Ignore patterns file, looked up in the folder root.
pub const IGNORE_FILE: &str = ".findexignore";

/// Records per index write during a scan.
const SCAN_BATCH_SIZE: usize = 100;

/// Walker configuration, handed to the external scanner.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Filesystem root of the folder.
    pub folder_root: PathBuf,
    /// Content block size the walker should hash at.
    pub block_size: u32,
    /// Name prefix marking temporary files.
    pub temp_prefix: String,
    /// Parallel hashing workers the walker may use.
    pub hashers: usize,
}

impl ScanConfig {
    /// Defaults for a folder root.
    #[must_use]
    pub fn new(folder_root: impl Into<PathBuf>) -> Self {
        Self {
            folder_root: folder_root.into(),
            block_size: DEFAULT_BLOCK_SIZE,
            temp_prefix: DEFAULT_TEMP_PREFIX.to_owned(),
            hashers: 1,
        }
    }

    /// Whether a name denotes an in-progress temporary file.
    #[must_use]
    pub fn is_temporary(&self, name: &str) -> bool {
        name.rsplit('/')
            .next()
            .is_some_and(|base| base.starts_with(&self.temp_prefix))
    }
}

/// The external filesystem walker. One walk streams descriptors for
/// everything under the given sub ("" for the whole folder).
pub trait Scanner {
    /// Start a walk; descriptors arrive on the returned channel.
    ///
    /// # Errors
    /// Returns an error if the walk cannot start.
    fn walk(&mut self, sub: &str) -> Result<mpsc::Receiver<FileInfo>>;
}

/// Lookup of what the index currently records for a local name; walkers
/// use it to skip unchanged files.
pub trait CurrentFiler {
    /// The local device's record for a name.
    ///
    /// # Errors
    /// Returns an error on store failure.
    fn current_file(&self, name: &str) -> Result<Option<FileInfo>>;
}

impl CurrentFiler for FileSet {
    fn current_file(&self, name: &str) -> Result<Option<FileInfo>> {
        self.get(&DeviceId::LOCAL, name)
    }
}

/// Load the folder's ignore patterns, or `None` when there are none.
#[must_use]
pub fn load_ignores(folder_root: &Path) -> Option<Gitignore> {
    let path = folder_root.join(IGNORE_FILE);
    if !path.exists() {
        return None;
    }
    let (matcher, err) = Gitignore::new(&path);
    if let Some(err) = err {
        warn!(path = %path.display(), "ignore file partially parsed: {err}");
    }
    Some(matcher)
}

/// One folder's scan driver: walker in front, tombstone sweep behind.
pub struct FolderScanner<'a, S> {
    fileset: &'a FileSet,
    scanner: S,
    config: ScanConfig,
    matcher: Option<Gitignore>,
    local_short_id: u64,
    symlinks_enabled: bool,
}

impl<'a, S: Scanner> FolderScanner<'a, S> {
    /// Build a scan driver for one folder.
    #[must_use]
    pub fn new(
        fileset: &'a FileSet,
        scanner: S,
        config: ScanConfig,
        matcher: Option<Gitignore>,
        local_short_id: u64,
    ) -> Self {
        Self {
            fileset,
            scanner,
            config,
            matcher,
            local_short_id,
            symlinks_enabled: cfg!(unix),
        }
    }

    /// Run one scan over the given subdirectories ("" or an empty list
    /// scans the whole folder).
    ///
    /// # Errors
    /// Returns an error if a sub escapes the folder root, the walker
    /// fails to start, or an index write fails. Index writes already
    /// applied stay applied; re-running the scan converges.
    pub fn scan(&mut self, subs: &[&str]) -> Result<()> {
        let subs = self.normalize_subs(subs)?;
        debug!(folder = %self.fileset.folder(), ?subs, "scanning");

        for sub in &subs {
            let rx = self.scanner.walk(sub)?;
            let mut batch = Vec::with_capacity(SCAN_BATCH_SIZE);
            for f in rx {
                if self.config.is_temporary(&f.name) {
                    warn!(name = %f.name, "walker produced a temporary file, skipping");
                    continue;
                }
                if batch.len() == SCAN_BATCH_SIZE {
                    self.fileset.update(&DeviceId::LOCAL, &batch)?;
                    batch.clear();
                }
                batch.push(f);
            }
            if !batch.is_empty() {
                self.fileset.update(&DeviceId::LOCAL, &batch)?;
            }
        }

        for sub in &subs {
            let tombstones = self.collect_tombstones(sub)?;
            debug!(
                folder = %self.fileset.folder(),
                sub = %sub,
                tombstones = tombstones.len(),
                "scan sweep"
            );
            for batch in tombstones.chunks(SCAN_BATCH_SIZE) {
                self.fileset.update(&DeviceId::LOCAL, batch)?;
            }
        }

        Ok(())
    }

    /// Walk the local records under `sub` and produce a tombstone for
    /// everything the disk no longer backs: newly-ignored names and
    /// unsupported symlinks become invalid (version kept), names missing
    /// on disk become deleted (version bumped by the local device).
    fn collect_tombstones(&self, sub: &str) -> Result<Vec<FileInfo>> {
        let mut out = Vec::new();
        let mut seen_prefix = false;

        self.fileset.with_have_truncated(&DeviceId::LOCAL, |f| {
            if !name_under_sub(&f.name, sub) {
                // Records are name-ordered: keep going until the subtree
                // starts, stop once past its end.
                return !seen_prefix;
            }
            seen_prefix = true;

            if f.is_deleted() || f.is_invalid() {
                return true;
            }

            if self.ignored(&f.name) || (f.is_symlink() && !self.symlinks_enabled) {
                out.push(FileInfo {
                    name: f.name.clone(),
                    flags: f.flags | FLAG_INVALID,
                    modified: f.modified,
                    // The file itself is unchanged, so the version stays.
                    version: f.version.clone(),
                    local_version: 0,
                    blocks: Vec::new(),
                });
            } else if std::fs::symlink_metadata(self.config.folder_root.join(&f.name)).is_err() {
                // Any lstat error counts as deleted; a directory turning
                // into a file yields "not a directory" for its former
                // children, not "not found".
                out.push(FileInfo {
                    name: f.name.clone(),
                    flags: f.flags | FLAG_DELETED,
                    modified: f.modified,
                    version: f.version.clone().update(self.local_short_id),
                    local_version: 0,
                    blocks: Vec::new(),
                });
            }
            true
        })?;

        Ok(out)
    }

    fn ignored(&self, name: &str) -> bool {
        self.matcher
            .as_ref()
            .is_some_and(|m| m.matched(Path::new(name), false).is_ignore())
    }

    /// Clean and validate subs, reduce each upward to a directory the
    /// index knows (or the folder root), deduplicate, and drop
    /// descendants of shorter subs.
    fn normalize_subs(&self, subs: &[&str]) -> Result<Vec<String>> {
        if subs.is_empty() {
            return Ok(vec![String::new()]);
        }

        let mut cleaned = Vec::new();
        for sub in subs {
            let mut rel = clean_relative(sub)?;
            // Start the walk somewhere the index is already aware of.
            while !rel.is_empty() {
                match self.fileset.get(&DeviceId::LOCAL, &rel)? {
                    Some(f) if f.is_directory() => break,
                    _ => rel = parent_name(&rel),
                }
            }
            if rel.is_empty() {
                return Ok(vec![String::new()]);
            }
            cleaned.push(rel);
        }

        cleaned.sort();
        cleaned.dedup();

        let mut out: Vec<String> = Vec::new();
        for sub in cleaned {
            if out.iter().any(|kept| name_under_sub(&sub, kept)) {
                continue;
            }
            out.push(sub);
        }
        Ok(out)
    }
}

/// True when `name` equals `sub` or lies beneath it. An empty sub covers
/// everything.
fn name_under_sub(name: &str, sub: &str) -> bool {
    if sub.is_empty() {
        return true;
    }
    match name.strip_prefix(sub) {
        Some("") => true,
        Some(rest) => rest.starts_with('/'),
        None => false,
    }
}

/// Resolve `.` and `..` components and reject paths leaving the root.
fn clean_relative(sub: &str) -> Result<String> {
    let mut parts: Vec<&str> = Vec::new();
    for comp in Path::new(sub).components() {
        match comp {
            Component::CurDir => {}
            Component::Normal(p) => {
                let Some(p) = p.to_str() else {
                    bail!("sub {sub:?} is not valid UTF-8");
                };
                parts.push(p);
            }
            Component::ParentDir => {
                if parts.pop().is_none() {
                    bail!("sub {sub:?} escapes the folder root");
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                bail!("sub {sub:?} is not relative to the folder root");
            }
        }
    }
    Ok(parts.join("/"))
}

fn parent_name(name: &str) -> String {
    match name.rfind('/') {
        Some(i) => name[..i].to_owned(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::file::FLAG_DIRECTORY;
    use crate::store::Store;
    use crate::version::Vector;
    use std::sync::Arc;

    /// Walker stand-in replaying a fixed descriptor list, scoped to the
    /// requested sub.
    struct StaticScanner {
        files: Vec<FileInfo>,
    }

    impl Scanner for StaticScanner {
        fn walk(&mut self, sub: &str) -> Result<mpsc::Receiver<FileInfo>> {
            let (tx, rx) = mpsc::channel();
            for f in &self.files {
                if name_under_sub(&f.name, sub) {
                    tx.send(f.clone()).expect("receiver alive");
                }
            }
            Ok(rx)
        }
    }

    fn setup() -> (tempfile::TempDir, FileSet) {
        let db_dir = tempfile::tempdir().unwrap();
        let store = Store::open(db_dir.path()).unwrap();
        let set = FileSet::new("test", store, Arc::new(Clock::new())).unwrap();
        (db_dir, set)
    }

    fn file(name: &str) -> FileInfo {
        FileInfo {
            name: name.into(),
            version: Vector::from_pairs(&[(DeviceId::LOCAL.short_id(), 1)]),
            ..FileInfo::default()
        }
    }

    fn dir(name: &str) -> FileInfo {
        FileInfo {
            flags: FLAG_DIRECTORY,
            ..file(name)
        }
    }

    fn run_scan(root: &Path, set: &FileSet, files: Vec<FileInfo>) -> Result<()> {
        let mut fs = FolderScanner::new(
            set,
            StaticScanner { files },
            ScanConfig::new(root),
            load_ignores(root),
            DeviceId::LOCAL.short_id(),
        );
        fs.scan(&[])
    }

    #[test]
    fn test_scan_indexes_walker_output() {
        let root = tempfile::tempdir().unwrap();
        let (_db, set) = setup();
        std::fs::write(root.path().join("a.txt"), "a").unwrap();

        run_scan(root.path(), &set, vec![file("a.txt")]).unwrap();

        let stored = set.get(&DeviceId::LOCAL, "a.txt").unwrap().unwrap();
        assert!(!stored.is_deleted());
        assert!(stored.local_version > 0);
    }

    #[test]
    fn test_missing_file_becomes_deleted_tombstone() {
        let root = tempfile::tempdir().unwrap();
        let (_db, set) = setup();
        std::fs::write(root.path().join("keep.txt"), "k").unwrap();

        run_scan(root.path(), &set, vec![file("keep.txt"), file("gone.txt")]).unwrap();
        // Second scan: gone.txt is indexed but absent on disk.
        run_scan(root.path(), &set, vec![file("keep.txt")]).unwrap();

        let kept = set.get(&DeviceId::LOCAL, "keep.txt").unwrap().unwrap();
        assert!(!kept.is_deleted());

        let gone = set.get(&DeviceId::LOCAL, "gone.txt").unwrap().unwrap();
        assert!(gone.is_deleted());
        // The local device bumped the version so the deletion wins.
        assert_eq!(gone.version.counter(DeviceId::LOCAL.short_id()), 2);
        assert!(gone.local_version > 0);
    }

    #[test]
    fn test_newly_ignored_file_becomes_invalid_tombstone() {
        let root = tempfile::tempdir().unwrap();
        let (_db, set) = setup();
        std::fs::write(root.path().join("build.log"), "x").unwrap();

        run_scan(root.path(), &set, vec![file("build.log")]).unwrap();
        let before = set.get(&DeviceId::LOCAL, "build.log").unwrap().unwrap();
        assert!(!before.is_invalid());

        // The pattern arrives between scans.
        std::fs::write(root.path().join(IGNORE_FILE), "*.log\n").unwrap();
        run_scan(root.path(), &set, vec![]).unwrap();

        let after = set.get(&DeviceId::LOCAL, "build.log").unwrap().unwrap();
        assert!(after.is_invalid());
        // Invalidation does not claim a change to the file itself.
        assert!(after.version.equal(&before.version));
    }

    #[test]
    fn test_temporary_files_never_enter_the_index() {
        let root = tempfile::tempdir().unwrap();
        let (_db, set) = setup();

        let temp = format!("{DEFAULT_TEMP_PREFIX}partial");
        run_scan(root.path(), &set, vec![file(&temp)]).unwrap();
        assert!(set.get(&DeviceId::LOCAL, &temp).unwrap().is_none());
    }

    #[test]
    fn test_normalize_subs_reduces_to_known_directory() {
        let root = tempfile::tempdir().unwrap();
        let (_db, set) = setup();
        set.update(&DeviceId::LOCAL, &[dir("dir"), file("dir/file.txt")])
            .unwrap();

        let fs = FolderScanner::new(
            &set,
            StaticScanner { files: vec![] },
            ScanConfig::new(root.path()),
            None,
            DeviceId::LOCAL.short_id(),
        );

        // An unknown leaf under a known directory reduces to it.
        assert_eq!(
            fs.normalize_subs(&["dir/file.txt/extra"]).unwrap(),
            vec!["dir"]
        );
        // Unknown top-level paths reduce all the way to the root.
        assert_eq!(fs.normalize_subs(&["unknown/deep"]).unwrap(), vec![""]);
    }

    #[test]
    fn test_normalize_subs_dedupes_and_drops_descendants() {
        let root = tempfile::tempdir().unwrap();
        let (_db, set) = setup();
        set.update(&DeviceId::LOCAL, &[dir("a"), dir("a/b"), dir("c")])
            .unwrap();

        let fs = FolderScanner::new(
            &set,
            StaticScanner { files: vec![] },
            ScanConfig::new(root.path()),
            None,
            DeviceId::LOCAL.short_id(),
        );

        assert_eq!(
            fs.normalize_subs(&["a/b", "c", "a", "c"]).unwrap(),
            vec!["a", "c"]
        );
    }

    #[test]
    fn test_escaping_sub_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let (_db, set) = setup();

        let fs = FolderScanner::new(
            &set,
            StaticScanner { files: vec![] },
            ScanConfig::new(root.path()),
            None,
            DeviceId::LOCAL.short_id(),
        );

        assert!(fs.normalize_subs(&["../outside"]).is_err());
        assert!(fs.normalize_subs(&["a/../../outside"]).is_err());
        // Indirections that stay inside are fine.
        assert_eq!(fs.normalize_subs(&["a/../b"]).unwrap(), vec![""]);
    }

    #[test]
    fn test_is_temporary_checks_basename() {
        let config = ScanConfig::new("/tmp/folder");
        assert!(config.is_temporary(".findex.tmp.xyz"));
        assert!(config.is_temporary("deep/dir/.findex.tmp.xyz"));
        assert!(!config.is_temporary("deep/.findex.tmp.dir/real.txt"));
        assert!(!config.is_temporary("normal.txt"));
    }

    #[test]
    fn test_current_filer_reads_local_records() {
        let (_db, set) = setup();
        set.update(&DeviceId::LOCAL, &[file("x")]).unwrap();

        let current = set.current_file("x").unwrap();
        assert!(current.is_some());
        assert!(set.current_file("y").unwrap().is_none());
    }
}
