//! File descriptors and version lists
//!
//! [`FileInfo`] is the unit of replication: one device's claim about one
//! path. [`VersionList`] is the per-name reconciliation record: every
//! device holding the file, ordered so the head is the cluster-wide
//! winner. [`FileInfoTruncated`] is a `FileInfo` decoded without its block
//! list, for iteration paths that must not touch the block bytes.

use crate::device::DeviceId;
use crate::version::Vector;

/// Flag bits. The values are fixed by the persisted format; the low
/// twelve bits carry Unix permissions.
pub const FLAG_DELETED: u32 = 1 << 12;
pub const FLAG_INVALID: u32 = 1 << 13;
pub const FLAG_DIRECTORY: u32 = 1 << 14;
pub const FLAG_NO_PERMS: u32 = 1 << 15;
pub const FLAG_SYMLINK: u32 = 1 << 16;

/// One block of a regular file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Content hash of the block.
    pub hash: [u8; 32],
    /// Byte offset within the file.
    pub offset: i64,
    /// Block length in bytes.
    pub size: u32,
}

/// A device's record of one file.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileInfo {
    /// Wire-form path: NFC-normalized, forward-slash separated.
    pub name: String,
    /// Flag bitfield, see the `FLAG_*` constants.
    pub flags: u32,
    /// Modification time, seconds since the epoch.
    pub modified: i64,
    /// Causal version of this copy.
    pub version: Vector,
    /// Lamport stamp assigned when the record was admitted; the
    /// incremental-exchange watermark.
    pub local_version: i64,
    /// Ordered block list. Empty for anything that is not a live regular
    /// file.
    pub blocks: Vec<BlockInfo>,
}

impl FileInfo {
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.flags & FLAG_DELETED != 0
    }

    #[must_use]
    pub fn is_invalid(&self) -> bool {
        self.flags & FLAG_INVALID != 0
    }

    #[must_use]
    pub fn is_directory(&self) -> bool {
        self.flags & FLAG_DIRECTORY != 0
    }

    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.flags & FLAG_SYMLINK != 0
    }

    #[must_use]
    pub fn has_no_perms(&self) -> bool {
        self.flags & FLAG_NO_PERMS != 0
    }

    /// Total size, the sum of block sizes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.blocks.iter().map(|b| u64::from(b.size)).sum()
    }

    /// Drop the block list.
    #[must_use]
    pub fn truncate(self) -> FileInfoTruncated {
        FileInfoTruncated {
            name: self.name,
            flags: self.flags,
            modified: self.modified,
            version: self.version,
            local_version: self.local_version,
        }
    }
}

/// A `FileInfo` without its block list.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileInfoTruncated {
    pub name: String,
    pub flags: u32,
    pub modified: i64,
    pub version: Vector,
    pub local_version: i64,
}

impl FileInfoTruncated {
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.flags & FLAG_DELETED != 0
    }

    #[must_use]
    pub fn is_invalid(&self) -> bool {
        self.flags & FLAG_INVALID != 0
    }

    #[must_use]
    pub fn is_directory(&self) -> bool {
        self.flags & FLAG_DIRECTORY != 0
    }

    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.flags & FLAG_SYMLINK != 0
    }
}

/// One device's entry in a version list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileVersion {
    pub device: DeviceId,
    pub version: Vector,
}

/// Per-name list of (device, version), ordered descending under the
/// vector total order. The head is the winner. An empty list is never
/// persisted; the global key is deleted instead.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VersionList {
    pub versions: Vec<FileVersion>,
}

impl VersionList {
    /// The winning entry, if any.
    #[must_use]
    pub fn head(&self) -> Option<&FileVersion> {
        self.versions.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_helpers() {
        let mut f = FileInfo {
            name: "a".into(),
            ..FileInfo::default()
        };
        assert!(!f.is_deleted());
        f.flags |= FLAG_DELETED | FLAG_SYMLINK;
        assert!(f.is_deleted());
        assert!(f.is_symlink());
        assert!(!f.is_directory());
    }

    #[test]
    fn test_size_sums_blocks() {
        let f = FileInfo {
            name: "a".into(),
            blocks: vec![
                BlockInfo {
                    hash: [0; 32],
                    offset: 0,
                    size: 100,
                },
                BlockInfo {
                    hash: [1; 32],
                    offset: 100,
                    size: 34,
                },
            ],
            ..FileInfo::default()
        };
        assert_eq!(f.size(), 134);
    }

    #[test]
    fn test_truncate_drops_blocks_only() {
        let f = FileInfo {
            name: "path/to/file".into(),
            flags: FLAG_DIRECTORY,
            modified: 1_400_000_000,
            version: Vector::from_pairs(&[(1, 4)]),
            local_version: 9,
            blocks: vec![BlockInfo {
                hash: [7; 32],
                offset: 0,
                size: 1,
            }],
        };
        let t = f.clone().truncate();
        assert_eq!(t.name, f.name);
        assert_eq!(t.flags, f.flags);
        assert_eq!(t.modified, f.modified);
        assert_eq!(t.version, f.version);
        assert_eq!(t.local_version, f.local_version);
    }
}
