//! Mounted volume state and the host-facing operation surface
//!
//! `Ffsp` owns everything a mounted volume needs: the I/O backend, the
//! superblock geometry, the erase block usage array, the inode map, the
//! caches and one erase-block-sized scratch buffer. The methods in this
//! module are the operation contracts the host binding calls into; they
//! return typed errors which the host layer converts to errnos.

use log::debug;

use crate::backend::Backend;
use crate::data;
use crate::error::{FsError, FsResult};
use crate::gc::GcEntry;
use crate::inode_cache::InodeCache;
use crate::layout::{EraseBlockEntry, EraseBlockType, Timespec, NAME_MAX};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::summary::SummaryCache;
use crate::{ClusterId, InodeNo};

bitflags::bitflags! {
    /// Open flags understood by the core.
    pub struct OpenFlags: u32 {
        /// Open for reading only
        const RDONLY = 0o0;
        /// Open for writing only
        const WRONLY = 0o1;
        /// Open for reading and writing
        const RDWR = 0o2;
        /// Truncate to zero length on open
        const TRUNC = 0o1000;
    }
}

/// Attributes of one inode, filled by `getattr`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatBuf {
    pub ino: InodeNo,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    pub blocks: u64,
    pub atime: Timespec,
    pub mtime: Timespec,
    pub ctime: Timespec,
}

/// Volume statistics, filled by `statfs`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatVfs {
    pub bsize: u32,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub namemax: u32,
}

/// One readdir result entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: InodeNo,
    pub name: String,
}

/// A mounted volume.
pub struct Ffsp {
    pub(crate) backend: Box<dyn Backend>,

    /// Mount flags from the superblock
    pub(crate) flags: u32,
    pub(crate) neraseblocks: u32,
    pub(crate) nino: u32,
    pub(crate) blocksize: u32,
    pub(crate) clustersize: u32,
    pub(crate) erasesize: u32,
    pub(crate) ninoopen: u32,
    pub(crate) neraseopen: u32,
    pub(crate) nerasereserve: u32,
    pub(crate) nerasewrites: u32,

    /// Usage information about every erase block
    pub(crate) eb_usage: Vec<EraseBlockEntry>,

    /// Cluster id currently holding each inode, indexed by inode number.
    /// Lives in the first erase block, outside the log.
    pub(crate) ino_map: Vec<ClusterId>,

    /// Live inodes per cluster, indexed by cluster id
    pub(crate) cl_occupancy: Vec<i32>,

    /// Open summary buffers of cluster indirect erase blocks
    pub(crate) summaries: SummaryCache,

    /// Resident inodes and the dirty set
    pub(crate) inodes: InodeCache,

    /// Per-type GC state
    pub(crate) gcinfo: Vec<GcEntry>,

    /// I/O counters over the mount lifetime
    pub(crate) metrics: Metrics,

    /// Scratch buffer, one erase block large, for moving clusters and
    /// erase blocks around
    pub(crate) buf: Vec<u8>,
}

impl Ffsp {
    // ------------------------------------------------------------------
    // Internal data access helpers
    // ------------------------------------------------------------------

    /// Read a resident inode's whole content.
    pub(crate) fn read_whole(&self, no: InodeNo) -> FsResult<Vec<u8>> {
        let ino = self.inodes.get(no).ok_or(FsError::Io)?;
        let mut buf = vec![0u8; ino.size as usize];
        data::read(self, ino, &mut buf, 0)?;
        Ok(buf)
    }

    /// Write through the data engine by inode number: the inode is
    /// detached from the cache for the duration of the write, then marked
    /// dirty; crossing the dirty threshold flushes, flushing may trigger
    /// collection.
    pub(crate) fn write_ino(&mut self, no: InodeNo, buf: &[u8], offset: u64) -> FsResult<usize> {
        self.lookup_no(no)?;
        let mut ino = self.inodes.take(no).ok_or(FsError::Io)?;
        let res = data::write(self, &mut ino, buf, offset);
        self.inodes.insert(ino);

        let count = res?;
        self.mark_dirty(no);
        self.flush_inodes(false)?;
        self.gc()?;
        Ok(count)
    }

    /// Write by inode number (handle-based host calls).
    pub fn write_handle(&mut self, no: InodeNo, buf: &[u8], offset: u64) -> FsResult<usize> {
        let count = self.write_ino(no, buf, offset)?;
        self.metrics.add_host_write(count as u64);
        Ok(count)
    }

    pub(crate) fn truncate_ino(&mut self, no: InodeNo, length: u64) -> FsResult<()> {
        self.lookup_no(no)?;
        let mut ino = self.inodes.take(no).ok_or(FsError::Io)?;
        let res = data::truncate(self, &mut ino, length);
        self.inodes.insert(ino);

        res?;
        self.mark_dirty(no);
        self.flush_inodes(false)?;
        self.gc()
    }

    fn stat_of(&self, no: InodeNo) -> FsResult<StatBuf> {
        let ino = self.inodes.get(no).ok_or(FsError::Io)?;
        Ok(StatBuf {
            ino: ino.no,
            mode: ino.mode,
            nlink: ino.nlink,
            uid: ino.uid,
            gid: ino.gid,
            rdev: ino.rdev,
            size: ino.size,
            blocks: (ino.size + 511) / 512 + 1,
            atime: ino.atime,
            mtime: ino.mtime,
            ctime: ino.ctime,
        })
    }

    // ------------------------------------------------------------------
    // Host-facing operations
    // ------------------------------------------------------------------

    /// Fill a stat buffer from the inode behind `path`.
    pub fn getattr(&mut self, path: &str) -> FsResult<StatBuf> {
        debug!("getattr(path={})", path);
        let no = self.lookup(path)?;
        self.stat_of(no)
    }

    /// List a directory, skipping tombstones.
    pub fn readdir(&mut self, path: &str) -> FsResult<Vec<DirEntry>> {
        debug!("readdir(path={})", path);
        let no = self.lookup(path)?;
        if !self.inodes.get(no).map(|i| i.is_dir()).unwrap_or(false) {
            return Err(FsError::NotADirectory);
        }
        let dentries = self.read_dir(no)?;
        Ok(dentries
            .iter()
            .filter(|d| d.ino != 0)
            .map(|d| DirEntry {
                ino: d.ino,
                name: d.name_str(),
            })
            .collect())
    }

    /// Resolve a path for I/O; `TRUNC` cuts the file to zero length
    /// atomically with the open. Returns the inode number as the file
    /// handle.
    pub fn open(&mut self, path: &str, flags: OpenFlags) -> FsResult<InodeNo> {
        debug!("open(path={}, flags={:#o})", path, flags.bits());
        let no = self.lookup(path)?;
        if flags.contains(OpenFlags::TRUNC) {
            self.truncate_ino(no, 0)?;
        }
        Ok(no)
    }

    /// Drop a file handle. Nothing is cached per handle.
    pub fn release(&mut self, _no: InodeNo) -> FsResult<()> {
        Ok(())
    }

    pub fn read(&mut self, path: &str, buf: &mut [u8], offset: u64) -> FsResult<usize> {
        debug!("read(path={}, nbyte={}, offset={})", path, buf.len(), offset);
        let no = self.lookup(path)?;
        self.read_ino(no, buf, offset)
    }

    /// Read by inode number (handle-based host calls).
    pub fn read_ino(&mut self, no: InodeNo, buf: &mut [u8], offset: u64) -> FsResult<usize> {
        self.lookup_no(no)?;
        let count = {
            let ino = self.inodes.get(no).ok_or(FsError::Io)?;
            data::read(self, ino, buf, offset)?
        };
        self.metrics.add_host_read(count as u64);
        Ok(count)
    }

    pub fn write(&mut self, path: &str, buf: &[u8], offset: u64) -> FsResult<usize> {
        debug!("write(path={}, nbyte={}, offset={})", path, buf.len(), offset);
        let no = self.lookup(path)?;
        self.write_handle(no, buf, offset)
    }

    /// Create a file system node. The mode carries the node type bits.
    pub fn mknod(&mut self, path: &str, mode: u32, uid: u32, gid: u32, rdev: u64) -> FsResult<()> {
        debug!("mknod(path={}, mode={:#o}, rdev={})", path, mode, rdev);
        self.create(path, mode, uid, gid, rdev)
    }

    pub fn mkdir(&mut self, path: &str, mode: u32, uid: u32, gid: u32) -> FsResult<()> {
        debug!("mkdir(path={}, mode={:#o})", path, mode);
        self.create(path, mode | libc::S_IFDIR, uid, gid, 0)
    }

    pub fn truncate(&mut self, path: &str, length: u64) -> FsResult<()> {
        debug!("truncate(path={}, length={})", path, length);
        let no = self.lookup(path)?;
        self.truncate_ino(no, length)
    }

    pub fn chmod(&mut self, path: &str, mode: u32) -> FsResult<()> {
        debug!("chmod(path={}, mode={:#o})", path, mode);
        let no = self.lookup(path)?;
        if let Some(ino) = self.inodes.get_mut(no) {
            ino.mode = mode;
        }
        self.mark_dirty(no);
        self.flush_inodes(false)
    }

    pub fn chown(&mut self, path: &str, uid: u32, gid: u32) -> FsResult<()> {
        debug!("chown(path={}, uid={}, gid={})", path, uid, gid);
        let no = self.lookup(path)?;
        if let Some(ino) = self.inodes.get_mut(no) {
            ino.uid = uid;
            ino.gid = gid;
        }
        self.mark_dirty(no);
        self.flush_inodes(false)
    }

    /// Set access and modification time.
    pub fn utimens(&mut self, path: &str, atime: Timespec, mtime: Timespec) -> FsResult<()> {
        debug!("utimens(path={})", path);
        let no = self.lookup(path)?;
        if let Some(ino) = self.inodes.get_mut(no) {
            ino.atime = atime;
            ino.mtime = mtime;
        }
        self.mark_dirty(no);
        self.flush_inodes(false)
    }

    /// Volume statistics. The free cluster count is derived from the
    /// erase block usage array.
    pub fn statfs(&self) -> StatVfs {
        // The first erase block never holds data.
        let fs_bytes = (self.neraseblocks as u64 - 1) * self.erasesize as u64;

        let mut bfree = 0u64;
        for entry in &self.eb_usage[1..] {
            match entry.eb_type {
                EraseBlockType::Ebin => {}
                EraseBlockType::Empty => bfree += self.cl_per_eb() as u64,
                _ => bfree += self.cl_per_eb() as u64 - entry.cvalid as u64,
            }
        }

        let used_inodes = (1..self.nino)
            .filter(|&no| self.ino_map[no as usize] != crate::FREE_CLUSTER)
            .count() as u64;

        StatVfs {
            bsize: self.blocksize,
            blocks: fs_bytes / self.blocksize as u64,
            bfree,
            bavail: bfree,
            files: used_inodes,
            ffree: self.nino as u64 - used_inodes,
            namemax: NAME_MAX as u32,
        }
    }

    /// Write back the erase block array and the inode map.
    pub fn flush_meta(&mut self) -> FsResult<()> {
        debug!("flush_meta()");
        self.write_meta_data()
    }

    /// Push all dirty inodes and the metadata to the medium.
    pub fn fsync(&mut self) -> FsResult<()> {
        debug!("fsync()");
        self.flush_inodes(true)?;
        self.write_meta_data()
    }

    // Exposed volume geometry, mainly for the front-ends and tests.

    pub fn clustersize(&self) -> u32 {
        self.clustersize
    }

    pub fn erasesize(&self) -> u32 {
        self.erasesize
    }

    pub fn neraseblocks(&self) -> u32 {
        self.neraseblocks
    }

    pub fn nino(&self) -> u32 {
        self.nino
    }

    /// Number of currently empty erase blocks.
    pub fn empty_eraseblocks(&self) -> u32 {
        self.empty_eraseblk_count()
    }

    /// Data tier of the inode behind `path` (diagnostics and tests).
    pub fn data_tier_of(&mut self, path: &str) -> FsResult<crate::layout::DataTier> {
        let no = self.lookup(path)?;
        self.inodes.get(no).ok_or(FsError::Io)?.tier()
    }

    /// Dirty inode count (diagnostics and tests).
    pub fn dirty_inodes(&self) -> u32 {
        self.inodes.dirty_count()
    }

    /// Snapshot of the I/O counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}
