//! findex-core: Replicated file-index engine
//!
//! Tracks, per synchronization folder, the files each participating
//! device claims to have, reconciles per-file version vectors into a
//! global winner index, and maintains a block-hash index for file
//! reconstruction. Everything persists through one transactional
//! embedded store and stays crash-consistent.

pub mod blockmap;
pub mod clock;
pub mod config;
pub mod device;
pub mod file;
pub mod fileset;
pub mod keys;
pub mod scan;
pub mod store;
pub mod version;
pub mod wire;

pub use blockmap::{BlockFinder, BlockMap};
pub use clock::Clock;
pub use config::{Config, FolderConfig};
pub use device::DeviceId;
pub use file::{BlockInfo, FileInfo, FileInfoTruncated, FileVersion, VersionList};
pub use fileset::FileSet;
pub use scan::{CurrentFiler, FolderScanner, ScanConfig, Scanner};
pub use store::Store;
pub use version::Vector;
