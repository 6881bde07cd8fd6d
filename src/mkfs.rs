//! Volume bootstrap
//!
//! mkfs writes the first erase block (superblock, erase block usage
//! array, inode map) and a second erase block holding the root directory
//! inode with its embedded "." and ".." entries.

use crate::backend::{write_raw, Backend, FileBackend};
use crate::error::{FsError, FsResult};
use crate::inode::Inode;
use crate::layout::{
    DataTier, Dentry, EraseBlockEntry, EraseBlockType, Superblock, Timespec, DENTRY_SIZE,
    EB_ENTRY_SIZE, FFSP_MAGIC, INODE_SIZE,
};
use crate::ROOT_INO;

/// Formatting options; the defaults match the reference front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MkfsOptions {
    pub clustersize: u32,
    pub erasesize: u32,
    /// Dirty inode flush threshold
    pub ninoopen: u32,
    /// Simultaneously open erase blocks
    pub neraseopen: u32,
    /// Erase blocks withheld from allocation
    pub nerasereserve: u32,
    /// Newly finalized erase blocks of one type that trigger GC
    pub nerasewrites: u32,
}

impl Default for MkfsOptions {
    fn default() -> Self {
        MkfsOptions {
            clustersize: 1024 * 32,
            erasesize: 1024 * 1024 * 4,
            ninoopen: 128,
            neraseopen: 5,
            nerasereserve: 3,
            nerasewrites: 5,
        }
    }
}

fn eraseblk_cnt(backend: &dyn Backend, erasesize: u32) -> u32 {
    (backend.size() / erasesize as u64) as u32
}

/// Supported inode count: whatever space the first erase block has left
/// after the superblock cluster and the erase block usage array, at four
/// bytes per inode map entry. Inode number 0 is always invalid.
fn inode_cnt(erasesize: u32, clustersize: u32, eb_cnt: u32) -> u32 {
    (erasesize - clustersize - eb_cnt * EB_ENTRY_SIZE as u32) / 4
}

fn check_options(backend: &dyn Backend, options: &MkfsOptions) -> FsResult<()> {
    let cs = options.clustersize;
    let es = options.erasesize;

    // The root directory's "." and ".." entries have to fit into the
    // embedded data region.
    if cs as usize <= INODE_SIZE + 2 * DENTRY_SIZE || !cs.is_power_of_two() {
        return Err(FsError::InvalidArgument);
    }
    if es < cs || es % cs != 0 {
        return Err(FsError::InvalidArgument);
    }
    if options.neraseopen < 3 {
        return Err(FsError::InvalidArgument);
    }
    if eraseblk_cnt(backend, es) < 2 {
        return Err(FsError::InvalidArgument);
    }
    let eb_cnt = eraseblk_cnt(backend, es);
    if es <= cs + eb_cnt * EB_ENTRY_SIZE as u32 {
        return Err(FsError::InvalidArgument);
    }
    Ok(())
}

/// First erase block: superblock (padded to one cluster), the erase
/// block usage array and the inode map filling the block's tail.
fn create_super_eb(backend: &mut dyn Backend, options: &MkfsOptions) -> FsResult<()> {
    let eb_cnt = eraseblk_cnt(backend, options.erasesize);
    let ino_cnt = inode_cnt(options.erasesize, options.clustersize, eb_cnt);
    let max_writeops = (options.erasesize / options.clustersize) as u16;

    let mut eb_buf = vec![0u8; options.erasesize as usize];

    let sb = Superblock {
        fsid: FFSP_MAGIC,
        flags: 0,
        neraseblocks: eb_cnt,
        nino: ino_cnt,
        blocksize: options.clustersize,
        clustersize: options.clustersize,
        erasesize: options.erasesize,
        ninoopen: options.ninoopen,
        neraseopen: options.neraseopen,
        nerasereserve: options.nerasereserve,
        nerasewrites: options.nerasewrites,
    };
    eb_buf[..crate::layout::SUPERBLOCK_SIZE].copy_from_slice(&sb.encode());

    // The erase block usage array is aligned to the cluster size.
    let mut off = options.clustersize as usize;

    // Erase block 0 carries the superblock, the usage array and the
    // inode map.
    EraseBlockEntry {
        eb_type: EraseBlockType::Super,
        lastwrite: 0,
        cvalid: 0,
        writeops: 0,
    }
    .encode(&mut eb_buf, off);
    off += EB_ENTRY_SIZE;

    // Erase block 1 holds the root directory inode. Only that one
    // cluster is valid but the erase block starts out closed.
    EraseBlockEntry {
        eb_type: EraseBlockType::DentryInode,
        lastwrite: 0,
        cvalid: 1,
        writeops: max_writeops,
    }
    .encode(&mut eb_buf, off);
    off += EB_ENTRY_SIZE;

    for _ in 2..eb_cnt {
        EraseBlockEntry::empty().encode(&mut eb_buf, off);
        off += EB_ENTRY_SIZE;
    }

    // The inode map follows the usage array and ends exactly at the end
    // of the erase block. Inode number 0 is defined to be invalid; inode
    // number 1 points at the root inode's cluster.
    crate::layout::put_be32(&mut eb_buf, off, crate::RESERVED_CLUSTER);
    off += 4;
    crate::layout::put_be32(&mut eb_buf, off, options.erasesize / options.clustersize);

    write_raw(backend, &eb_buf, 0)?;
    Ok(())
}

/// Second erase block: the root directory inode at its first cluster.
fn create_inode_eb(backend: &mut dyn Backend, options: &MkfsOptions) -> FsResult<()> {
    let mut root = Inode::new(options.clustersize);
    root.flags = DataTier::Emb as u32;
    root.no = ROOT_INO;
    root.uid = unsafe { libc::getuid() };
    root.gid = unsafe { libc::getgid() };
    root.mode = libc::S_IFDIR | 0o755;
    root.rdev = 0;
    root.ctime = Timespec::now();

    // "." and ".." of the root both point at the root itself.
    let dot = Dentry::new(ROOT_INO, ".");
    let dotdot = Dentry::new(ROOT_INO, "..");
    dot.encode(&mut root.data, 0);
    dotdot.encode(&mut root.data, DENTRY_SIZE);
    root.size = (2 * DENTRY_SIZE) as u64;
    root.nlink = 2;

    let mut buf = vec![0u8; options.clustersize as usize];
    root.encode(&mut buf, 0, options.clustersize, options.erasesize);

    write_raw(backend, &buf, options.erasesize as u64)?;
    Ok(())
}

/// Format the medium behind `backend`.
pub fn mkfs(backend: &mut dyn Backend, options: &MkfsOptions) -> FsResult<()> {
    check_options(backend, options)?;
    create_super_eb(backend, options)?;
    create_inode_eb(backend, options)
}

/// Format the file at `path`.
pub fn mkfs_path(path: &str, options: &MkfsOptions) -> FsResult<()> {
    let mut backend = FileBackend::open_plain(path)?;
    mkfs(&mut backend, options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemBackend;
    use crate::layout::{Superblock, SUPERBLOCK_SIZE};

    #[test]
    fn test_mkfs_writes_superblock() {
        let mut backend = MemBackend::new(8 * 64 * 1024);
        let options = MkfsOptions {
            clustersize: 4096,
            erasesize: 64 * 1024,
            ninoopen: 16,
            neraseopen: 5,
            nerasereserve: 2,
            nerasewrites: 3,
        };
        mkfs(&mut backend, &options).unwrap();

        let mut buf = [0u8; SUPERBLOCK_SIZE];
        crate::backend::read_raw(&backend, &mut buf, 0).unwrap();
        let sb = Superblock::decode(&buf).unwrap();
        assert_eq!(sb.fsid, FFSP_MAGIC);
        assert_eq!(sb.neraseblocks, 8);
        assert_eq!(sb.clustersize, 4096);
        assert_eq!(sb.erasesize, 64 * 1024);
        assert_eq!(
            sb.nino,
            (64 * 1024 - 4096 - 8 * EB_ENTRY_SIZE as u32) / 4
        );
    }

    #[test]
    fn test_mkfs_rejects_bad_geometry() {
        let mut backend = MemBackend::new(64 * 1024);
        let mut options = MkfsOptions::default();
        options.clustersize = 100; // not a power of two
        assert_eq!(
            mkfs(&mut backend, &options),
            Err(FsError::InvalidArgument)
        );
    }
}
