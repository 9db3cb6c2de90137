// drive_meta maps hierarchical paths onto the flat, parent-referenced object
// store: directory cache, path resolution, the filesystem adapter used by the
// protocol layer, and the in-memory lock table.

pub mod background;
pub mod dir_cache;
pub mod drive_fs;
pub mod file_writer;
pub mod lock_mgr;
pub mod path_resolver;

mod edge_locks;

#[cfg(test)]
mod drive_fs_tests;

pub use background::{sweep_once, Maintenance, SweepStats, DEFAULT_SWEEP_INTERVAL};
pub use dir_cache::{DirCache, DirListing};
pub use drive_fs::{DriveFs, DriveFsConfig, DriveReader};
pub use file_writer::{Committed, DriveFileWriter, WriteMode};
pub use lock_mgr::{
    LockDepth, LockInfo, LockMgr, LockMgrConfig, LockRequest, LockScope, LOCK_TOKEN_PREFIX,
};
pub use path_resolver::{pick_winner, Freshness, PathResolver};
