//! FFSP - a log-structured file system for flash-like storage
//!
//! The backing medium is partitioned into fixed-size erase blocks, each
//! divided into fixed-size clusters. All live data is written out-of-place
//! into open erase blocks; stale clusters are later reclaimed by a garbage
//! collector that compacts surviving content into fresh erase blocks.
//!
//! The crate is organized into the following subsystems:
//! - On-medium record layout and byte-order helpers (`layout`)
//! - Positional I/O backends over a file or memory buffer (`backend`)
//! - Inode store: map, cache, dirty tracking, group packing (`inode`,
//!   `inode_cache`, `inode_group`)
//! - Typed erase-block lifecycle and cluster allocation (`eraseblk`,
//!   `summary`)
//! - Three-tier file data engine (`data`)
//! - Flat directory entries stored as file data (`dir`)
//! - Garbage collection (`gc`)
//! - Volume bootstrap and bind/unbind (`mkfs`, `mount`)
//! - Host-facing operation surface with errno protocol (`fs`, `host`)

pub mod backend;
pub mod check;
pub mod data;
pub mod dir;
pub mod eraseblk;
pub mod error;
pub mod fs;
pub mod gc;
pub mod host;
pub mod inode;
pub mod inode_cache;
pub mod inode_group;
pub mod layout;
pub mod logger;
pub mod metrics;
pub mod mkfs;
pub mod mount;
pub mod summary;

pub use backend::{Backend, FileBackend, MemBackend};
pub use error::{FsError, FsResult};
pub use fs::{DirEntry, Ffsp, OpenFlags, StatBuf, StatVfs};
pub use host::FfspHost;
pub use layout::{DataTier, EraseBlockType, Timespec};
pub use metrics::MetricsSnapshot;
pub use mkfs::MkfsOptions;

/// Crate version reported by the command line front-ends.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Inode number type
pub type InodeNo = u32;

/// Cluster id type (cluster offset / cluster size)
pub type ClusterId = u32;

/// Erase block id type (erase block offset / erase block size)
pub type EraseBlockId = u32;

/// Inode number 0 is never a valid inode.
pub const INVALID_INO: InodeNo = 0;

/// Inode number 1 is the root directory.
pub const ROOT_INO: InodeNo = 1;

/// Inode map entry of a free inode number.
pub const FREE_CLUSTER: ClusterId = 0x0000_0000;

/// Inode map entry of an allocated inode that has not yet been written
/// to a cluster.
pub const RESERVED_CLUSTER: ClusterId = 0xffff_ffff;

/// Erase block id 0 holds the superblock and is never handed out.
pub const INVALID_EB: EraseBlockId = 0;
