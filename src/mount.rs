//! Binding and unbinding a volume
//!
//! Mounting reads the superblock, the erase block usage array and the
//! inode map from the first erase block and derives the in-memory state
//! (cluster occupancy, caches, GC info, scratch buffer). Unmounting
//! flushes dirty inodes, closes open erase blocks and writes the
//! metadata back.

use log::{debug, error};

use crate::backend::{read_raw, Backend};
use crate::error::{FsError, FsResult};
use crate::fs::Ffsp;
use crate::gc;
use crate::inode_cache::InodeCache;
use crate::layout::{
    EraseBlockEntry, Superblock, EB_ENTRY_SIZE, FFSP_MAGIC, INODE_SIZE, SUPERBLOCK_SIZE,
};
use crate::metrics::Metrics;
use crate::summary::SummaryCache;
use crate::{FREE_CLUSTER, RESERVED_CLUSTER};

fn read_super(backend: &dyn Backend) -> FsResult<Superblock> {
    let mut buf = [0u8; SUPERBLOCK_SIZE];
    read_raw(backend, &mut buf, 0)?;
    let sb = Superblock::decode(&buf)?;

    if sb.fsid != FFSP_MAGIC {
        error!("mount(): invalid file system id {:#x}", sb.fsid);
        return Err(FsError::Io);
    }
    if sb.clustersize as usize <= INODE_SIZE
        || sb.erasesize == 0
        || sb.erasesize % sb.clustersize != 0
        || sb.neraseblocks < 2
        || sb.nino < 2
    {
        error!("mount(): implausible superblock geometry");
        return Err(FsError::Io);
    }
    Ok(sb)
}

fn read_eb_usage(backend: &dyn Backend, sb: &Superblock) -> FsResult<Vec<EraseBlockEntry>> {
    let size = sb.neraseblocks as usize * EB_ENTRY_SIZE;
    let mut buf = vec![0u8; size];
    read_raw(backend, &mut buf, sb.clustersize as u64)?;

    (0..sb.neraseblocks as usize)
        .map(|i| EraseBlockEntry::decode(&buf, i * EB_ENTRY_SIZE))
        .collect()
}

fn read_ino_map(backend: &dyn Backend, sb: &Superblock) -> FsResult<Vec<u32>> {
    let size = sb.nino as usize * 4;
    let mut buf = vec![0u8; size];
    // The map ends exactly at the end of erase block 0; the entry of the
    // invalid inode 0 is read along with the rest.
    let offset = sb.erasesize as u64 - size as u64;
    read_raw(backend, &mut buf, offset)?;

    Ok((0..sb.nino as usize)
        .map(|i| crate::layout::get_be32(&buf, i * 4))
        .collect())
}

/// Count the live inodes per cluster from the inode map.
fn build_cl_occupancy(backend: &dyn Backend, sb: &Superblock, ino_map: &[u32]) -> Vec<i32> {
    let clusters = (backend.size() / sb.clustersize as u64) as usize;
    let mut occupancy = vec![0i32; clusters];

    for &cl_id in &ino_map[1..] {
        if cl_id != FREE_CLUSTER && cl_id != RESERVED_CLUSTER {
            if let Some(slot) = occupancy.get_mut(cl_id as usize) {
                *slot += 1;
            }
        }
    }
    occupancy
}

/// Bind a volume: parse the metadata erase block and build the in-memory
/// state.
pub fn mount(backend: Box<dyn Backend>) -> FsResult<Ffsp> {
    let sb = read_super(&*backend)?;
    let eb_usage = read_eb_usage(&*backend, &sb)?;
    let ino_map = read_ino_map(&*backend, &sb)?;
    let cl_occupancy = build_cl_occupancy(&*backend, &sb, &ino_map);

    debug!(
        "mount(): neraseblocks={} nino={} clustersize={} erasesize={}",
        sb.neraseblocks, sb.nino, sb.clustersize, sb.erasesize
    );

    Ok(Ffsp {
        backend,
        flags: sb.flags,
        neraseblocks: sb.neraseblocks,
        nino: sb.nino,
        blocksize: sb.blocksize,
        clustersize: sb.clustersize,
        erasesize: sb.erasesize,
        ninoopen: sb.ninoopen,
        neraseopen: sb.neraseopen,
        nerasereserve: sb.nerasereserve,
        nerasewrites: sb.nerasewrites,
        eb_usage,
        ino_map,
        cl_occupancy,
        summaries: SummaryCache::new(),
        inodes: InodeCache::new(sb.nino),
        gcinfo: gc::gcinfo_init(sb.neraseopen),
        metrics: Metrics::new(),
        buf: vec![0u8; sb.erasesize as usize],
    })
}

impl Ffsp {
    /// Unbind the volume: flush dirty inodes, close open erase blocks
    /// (writing their summaries) and write the metadata. The backend is
    /// handed back to the caller.
    pub fn unmount(mut self) -> FsResult<Box<dyn Backend>> {
        self.release_inodes()?;
        self.close_eraseblks()?;
        self.write_meta_data()?;
        Ok(self.backend)
    }
}
