//! In-memory inodes and the inode store operations
//!
//! An inode consists of a fixed 128 byte header followed by an embedded
//! data region that fills the rest of its cluster. Depending on the data
//! tier the region holds either file bytes directly or an array of be32
//! indirect pointers. The inode is exclusively owned by the inode cache;
//! operations detach it by value while they mutate it.

use log::{debug, error};

use crate::data;
use crate::error::{FsError, FsResult};
use crate::fs::Ffsp;
use crate::inode_group;
use crate::layout::{
    get_be32, get_be64, put_be32, put_be64, DataTier, Timespec, INODE_SIZE, NAME_MAX,
};
use crate::{InodeNo, FREE_CLUSTER, INVALID_INO, RESERVED_CLUSTER, ROOT_INO};

/// In-memory inode: fixed header plus the embedded data region.
#[derive(Debug, Clone)]
pub struct Inode {
    pub size: u64,
    /// The lower 8 bits encode the data tier.
    pub flags: u32,
    pub no: InodeNo,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub rdev: u64,
    pub atime: Timespec,
    pub ctime: Timespec,
    pub mtime: Timespec,
    /// Embedded data region, `clustersize - INODE_SIZE` bytes.
    pub data: Vec<u8>,
}

impl Inode {
    /// A zeroed inode for the given cluster size.
    pub fn new(clustersize: u32) -> Self {
        Inode {
            size: 0,
            flags: 0,
            no: INVALID_INO,
            nlink: 0,
            uid: 0,
            gid: 0,
            mode: 0,
            rdev: 0,
            atime: Timespec::default(),
            ctime: Timespec::default(),
            mtime: Timespec::default(),
            data: vec![0u8; clustersize as usize - INODE_SIZE],
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFLNK
    }

    pub fn tier(&self) -> FsResult<DataTier> {
        DataTier::from_flags(self.flags).map_err(|e| {
            error!("inode {}: unknown data tier in flags {:#x}", self.no, self.flags);
            e
        })
    }

    /// Replace the old tier bit with the new one.
    pub fn change_tier(&mut self, old: DataTier, new: DataTier) {
        self.flags &= !(old as u32);
        self.flags |= new as u32;
    }

    /// Indirect pointer access; the embedded region aliases the array.
    pub fn ind_get(&self, index: usize) -> u32 {
        get_be32(&self.data, index * 4)
    }

    pub fn ind_set(&mut self, index: usize, id: u32) {
        put_be32(&mut self.data, index * 4, id);
    }

    /// Size of the inode's on-medium encoding: the header plus the
    /// embedded bytes or the valid indirect pointers.
    pub fn stored_size(&self, clustersize: u32, erasesize: u32) -> usize {
        let ind = |unit: u32| -> usize {
            if self.size == 0 {
                4
            } else {
                (((self.size - 1) / unit as u64 + 1) * 4) as usize
            }
        };
        INODE_SIZE.saturating_add(match DataTier::from_flags(self.flags) {
            Ok(DataTier::Emb) => self.size as usize,
            Ok(DataTier::Clin) => ind(clustersize),
            Ok(DataTier::Ebin) => ind(erasesize),
            Err(_) => 0,
        })
    }

    /// Serialize header and payload into `buf` at `off`.
    pub fn encode(&self, buf: &mut [u8], off: usize, clustersize: u32, erasesize: u32) {
        put_be64(buf, off, self.size);
        put_be32(buf, off + 8, self.flags);
        put_be32(buf, off + 12, self.no);
        put_be32(buf, off + 16, self.nlink);
        put_be32(buf, off + 20, self.uid);
        put_be32(buf, off + 24, self.gid);
        put_be32(buf, off + 28, self.mode);
        put_be64(buf, off + 32, self.rdev);
        self.atime.encode(buf, off + 40);
        self.ctime.encode(buf, off + 52);
        self.mtime.encode(buf, off + 64);
        buf[off + 76..off + INODE_SIZE].fill(0);

        let payload = self.stored_size(clustersize, erasesize) - INODE_SIZE;
        buf[off + INODE_SIZE..off + INODE_SIZE + payload]
            .copy_from_slice(&self.data[..payload]);
    }

    /// Parse one inode record at `off`. Returns the inode together with
    /// its encoded size, or None if the record would run past the buffer.
    pub fn decode(
        buf: &[u8],
        off: usize,
        clustersize: u32,
        erasesize: u32,
    ) -> Option<(Inode, usize)> {
        if off + INODE_SIZE > buf.len() {
            return None;
        }
        let mut ino = Inode::new(clustersize);
        ino.size = get_be64(buf, off);
        ino.flags = get_be32(buf, off + 8);
        ino.no = get_be32(buf, off + 12);
        ino.nlink = get_be32(buf, off + 16);
        ino.uid = get_be32(buf, off + 20);
        ino.gid = get_be32(buf, off + 24);
        ino.mode = get_be32(buf, off + 28);
        ino.rdev = get_be64(buf, off + 32);
        ino.atime = Timespec::decode(buf, off + 40);
        ino.ctime = Timespec::decode(buf, off + 52);
        ino.mtime = Timespec::decode(buf, off + 64);

        let stored = ino.stored_size(clustersize, erasesize);
        if stored > buf.len() - off {
            return None;
        }
        let payload = stored - INODE_SIZE;
        ino.data[..payload].copy_from_slice(&buf[off + INODE_SIZE..off + stored]);
        Some((ino, stored))
    }
}

/// Split a path into its parent directory and final component.
pub(crate) fn split_path(path: &str) -> FsResult<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(FsError::InvalidArgument);
    }
    let idx = trimmed.rfind('/').ok_or(FsError::InvalidArgument)?;
    let name = &trimmed[idx + 1..];
    if name.is_empty() || name.len() > NAME_MAX {
        return Err(FsError::InvalidArgument);
    }
    let parent = if idx == 0 { "/" } else { &trimmed[..idx] };
    Ok((parent, name))
}

impl Ffsp {
    /// First inode number whose map entry is free.
    fn find_free_inode_no(&self) -> Option<InodeNo> {
        (1..self.nino).find(|&no| self.ino_map[no as usize] == FREE_CLUSTER)
    }

    /// Make sure the inode is resident, faulting in its inode group from
    /// the medium if necessary.
    pub(crate) fn lookup_no(&mut self, no: InodeNo) -> FsResult<()> {
        if no == INVALID_INO || no >= self.nino {
            return Err(FsError::NotFound);
        }
        if self.inodes.contains(no) {
            return Ok(());
        }

        let cl_id = self.ino_map[no as usize];
        if cl_id == FREE_CLUSTER || cl_id == RESERVED_CLUSTER {
            return Err(FsError::NotFound);
        }

        let inodes = inode_group::read_inode_group(self, cl_id)?;
        if inodes.is_empty() {
            return Err(FsError::NotFound);
        }
        for ino in inodes {
            self.inodes.insert(ino);
        }
        if !self.inodes.contains(no) {
            return Err(FsError::NotFound);
        }
        Ok(())
    }

    /// Walk a slash-separated path from the root inode and return the
    /// inode number of the final component. Every resolved inode ends up
    /// resident in the cache.
    pub(crate) fn lookup(&mut self, path: &str) -> FsResult<InodeNo> {
        self.lookup_no(ROOT_INO)?;
        let mut cur = ROOT_INO;

        for token in path.split('/').filter(|t| !t.is_empty()) {
            // The parent of the next component has to be a directory.
            let is_dir = self
                .inodes
                .get(cur)
                .map(|ino| ino.is_dir())
                .unwrap_or(false);
            if !is_dir {
                return Err(FsError::NotFound);
            }

            let dent = self
                .find_dentry(cur, token)?
                .ok_or(FsError::NotFound)?;
            self.lookup_no(dent.ino)?;
            cur = dent.ino;
        }
        Ok(cur)
    }

    // ------------------------------------------------------------------
    // Dirty tracking with occupancy side effects
    // ------------------------------------------------------------------

    /// Decrement the live-inode count of the cluster that used to hold
    /// inode `no`; a cluster dropping to zero live inodes invalidates one
    /// cluster of the enclosing erase block.
    fn drop_cluster_occupancy(&mut self, no: InodeNo) {
        let cl_id = self.ino_map[no as usize];
        if cl_id == FREE_CLUSTER || cl_id == RESERVED_CLUSTER {
            return;
        }
        self.cl_occupancy[cl_id as usize] -= 1;
        if self.cl_occupancy[cl_id as usize] == 0 {
            let eb_id = self.eb_of_cluster(cl_id);
            self.eb_dec_cvalid(eb_id);
        }
    }

    /// Mark a cached inode dirty. Idempotent; the first transition bleeds
    /// value out of the inode's previous cluster.
    pub(crate) fn mark_dirty(&mut self, no: InodeNo) {
        if !self.inodes.set_dirty(no) {
            return;
        }
        debug!(
            "inode {} is now dirty - dirty_ino_cnt={}",
            no,
            self.inodes.dirty_count()
        );
        self.drop_cluster_occupancy(no);
    }

    pub(crate) fn reset_dirty(&mut self, no: InodeNo) {
        if self.inodes.clear_dirty(no) {
            debug!(
                "inode {} is now clean - dirty_ino_cnt={}",
                no,
                self.inodes.dirty_count()
            );
        }
    }

    // ------------------------------------------------------------------
    // Flushing
    // ------------------------------------------------------------------

    fn should_write_inodes(&self) -> bool {
        self.inodes.dirty_count() >= self.ninoopen
    }

    /// Write dirty inodes back to the medium. Directory inodes go first,
    /// then file inodes. Without `force` this is a no-op while the dirty
    /// count stays below the `ninoopen` threshold.
    pub fn flush_inodes(&mut self, force: bool) -> FsResult<()> {
        if !force && !self.should_write_inodes() {
            return Ok(());
        }
        self.write_dirty_category(true)?;
        self.write_dirty_category(false)
    }

    fn write_dirty_category(&mut self, dirs: bool) -> FsResult<()> {
        let mut list = self.inodes.take_dirty(dirs);
        let res = inode_group::write_inodes(self, &mut list);
        for ino in list {
            self.inodes.insert(ino);
        }
        res
    }

    /// Unmount path: persist everything, drop the cache, give the GC a
    /// final chance to compact.
    pub(crate) fn release_inodes(&mut self) -> FsResult<()> {
        self.flush_inodes(true)?;
        self.inodes.drain();
        self.gc()?;
        // Cluster indirect collection may have remapped pointers of
        // inodes it pulled back into the cache; persist those as well.
        self.flush_inodes(true)?;
        self.inodes.drain();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Create / link / unlink
    // ------------------------------------------------------------------

    /// Allocate a free inode number, insert a dentry into the parent and
    /// initialize the new inode in the cache. The inode map entry stays
    /// reserved until the inode is first flushed.
    pub fn create(
        &mut self,
        path: &str,
        mode: u32,
        uid: u32,
        gid: u32,
        rdev: u64,
    ) -> FsResult<()> {
        let no = self.find_free_inode_no().ok_or(FsError::NoSpace)?;

        let parent_no = self.add_dentry(path, no, mode & libc::S_IFMT == libc::S_IFDIR)?;

        let mut ino = Box::new(Inode::new(self.clustersize));
        ino.size = 0;
        ino.flags = DataTier::Emb as u32;
        ino.no = no;
        ino.nlink = 1;
        ino.uid = uid;
        ino.gid = gid;
        ino.mode = mode;
        ino.rdev = rdev;
        ino.ctime = Timespec::now();

        if mode & libc::S_IFMT == libc::S_IFDIR {
            crate::dir::mk_directory(&mut ino, parent_no);
        }

        // Occupy the inode number in the map so the supported inode count
        // is enforced; the real cluster id is filled in at flush time.
        self.ino_map[no as usize] = RESERVED_CLUSTER;

        self.inodes.insert(ino);
        self.mark_dirty(no);
        self.flush_inodes(false)
    }

    /// Hard link: new dentry pointing at the existing inode.
    pub fn link(&mut self, oldpath: &str, newpath: &str) -> FsResult<()> {
        let no = self.lookup(oldpath)?;
        let is_dir = self.inodes.get(no).map(|i| i.is_dir()).unwrap_or(false);
        if is_dir {
            return Err(FsError::NotPermitted);
        }

        self.add_dentry(newpath, no, false)?;

        if let Some(ino) = self.inodes.get_mut(no) {
            ino.nlink += 1;
        }
        self.mark_dirty(no);
        self.flush_inodes(false)
    }

    /// Create a symlink whose file content is the target path.
    pub fn symlink(&mut self, target: &str, linkpath: &str, uid: u32, gid: u32) -> FsResult<()> {
        let mode = libc::S_IFLNK | 0o777;
        self.create(linkpath, mode, uid, gid, 0)?;

        let no = self.lookup(linkpath)?;
        if let Err(e) = self.write_ino(no, target.as_bytes(), 0) {
            // Do not leave an empty link behind.
            let _ = self.unlink(linkpath);
            return Err(e);
        }
        self.flush_inodes(false)
    }

    /// Read a symlink's target.
    pub fn readlink(&mut self, path: &str) -> FsResult<String> {
        let no = self.lookup(path)?;
        let buf = self.read_whole(no)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Release all indirect data of an inode that is going away.
    fn free_ino_data(&mut self, no: InodeNo) -> FsResult<()> {
        let (tier, size, ids) = {
            let ino = self.inodes.get(no).ok_or(FsError::Io)?;
            let tier = ino.tier()?;
            let unit = match tier {
                DataTier::Emb => return Ok(()),
                DataTier::Clin => self.clustersize,
                DataTier::Ebin => self.erasesize,
            };
            if ino.size == 0 {
                return Ok(());
            }
            let cnt = ((ino.size - 1) / unit as u64 + 1) as usize;
            let ids: Vec<u32> = (0..cnt).map(|i| ino.ind_get(i)).collect();
            (tier, ino.size, ids)
        };
        debug!("freeing {} indirect units of inode {} (size={})", ids.len(), no, size);
        data::invalidate_ind_ptr(self, &ids, tier);
        Ok(())
    }

    /// Drop an inode completely: map entry freed, indirect data released,
    /// cache slot evicted.
    fn remove_inode(&mut self, no: InodeNo) -> FsResult<()> {
        // A dirty inode already gave up its cluster occupancy when it
        // was marked.
        if !self.inodes.is_dirty(no) {
            self.drop_cluster_occupancy(no);
        }
        self.free_ino_data(no)?;
        self.ino_map[no as usize] = FREE_CLUSTER;
        self.inodes.remove(no);
        self.reset_dirty(no);
        Ok(())
    }

    /// Remove a directory entry; the inode itself goes away once its last
    /// link is gone.
    pub fn unlink(&mut self, path: &str) -> FsResult<()> {
        let no = self.lookup(path)?;
        let nlink = {
            let ino = self.inodes.get(no).ok_or(FsError::Io)?;
            if ino.is_dir() {
                // Directories go through rmdir.
                return Err(FsError::NotPermitted);
            }
            ino.nlink
        };

        self.remove_dentry(path, no, false)?;

        if nlink > 1 {
            if let Some(ino) = self.inodes.get_mut(no) {
                ino.nlink -= 1;
            }
            self.mark_dirty(no);
        } else if nlink == 1 {
            self.remove_inode(no)?;
        } else {
            error!("unlink(): invalid inode link count on inode {}", no);
            return Err(FsError::Io);
        }
        self.flush_inodes(false)
    }

    /// Remove an empty directory.
    pub fn rmdir(&mut self, path: &str) -> FsResult<()> {
        let no = self.lookup(path)?;
        if !self.inodes.get(no).map(|i| i.is_dir()).unwrap_or(false) {
            return Err(FsError::NotADirectory);
        }
        if !self.dir_is_empty(no)? {
            return Err(FsError::NotEmpty);
        }

        self.remove_dentry(path, no, true)?;
        self.remove_inode(no)?;
        self.flush_inodes(false)
    }

    // ------------------------------------------------------------------
    // Rename
    // ------------------------------------------------------------------

    /// POSIX rename. Overwrites an existing target (an existing directory
    /// has to be empty), refuses to move a directory into its own
    /// subtree, and keeps link counts and the moved directory's ".."
    /// entry consistent across parents.
    pub fn rename(&mut self, oldpath: &str, newpath: &str) -> FsResult<()> {
        if oldpath == newpath {
            return Ok(());
        }
        let old_no = self.lookup(oldpath)?;
        let old_is_dir = self
            .inodes
            .get(old_no)
            .map(|i| i.is_dir())
            .unwrap_or(false);

        if old_is_dir {
            let prefix = format!("{}/", oldpath.trim_end_matches('/'));
            if newpath.starts_with(&prefix) {
                return Err(FsError::InvalidArgument);
            }
        }

        match self.lookup(newpath) {
            Ok(new_no) => {
                if new_no == old_no {
                    // Hard links to the same inode; nothing to do.
                    return Ok(());
                }
                let new_is_dir = self
                    .inodes
                    .get(new_no)
                    .map(|i| i.is_dir())
                    .unwrap_or(false);
                if new_is_dir {
                    if !old_is_dir {
                        return Err(FsError::NotADirectory);
                    }
                    self.rmdir(newpath)?;
                } else {
                    if old_is_dir {
                        return Err(FsError::NotADirectory);
                    }
                    self.unlink(newpath)?;
                }
            }
            Err(FsError::NotFound) => {}
            Err(e) => return Err(e),
        }

        let new_parent_no = self.add_dentry(newpath, old_no, old_is_dir)?;
        self.remove_dentry(oldpath, old_no, old_is_dir)?;

        if old_is_dir {
            let (old_parent, _) = split_path(oldpath)?;
            let old_parent_no = self.lookup(old_parent)?;
            if old_parent_no != new_parent_no {
                self.set_dotdot(old_no, new_parent_no)?;
            }
        }
        self.flush_inodes(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("/a").unwrap(), ("/", "a"));
        assert_eq!(split_path("/a/b").unwrap(), ("/a", "b"));
        assert_eq!(split_path("/a/b/c").unwrap(), ("/a/b", "c"));
        assert_eq!(split_path("/a/b/").unwrap(), ("/a", "b"));
        assert!(split_path("/").is_err());
        assert!(split_path("").is_err());
    }

    #[test]
    fn test_inode_codec_roundtrip() {
        let cs = 4096;
        let es = 65536;
        let mut ino = Inode::new(cs);
        ino.size = 5;
        ino.flags = DataTier::Emb as u32;
        ino.no = 7;
        ino.nlink = 1;
        ino.uid = 1000;
        ino.gid = 1000;
        ino.mode = libc::S_IFREG | 0o644;
        ino.mtime = Timespec { sec: 1234, nsec: 56 };
        ino.data[..5].copy_from_slice(b"hello");

        let mut buf = vec![0u8; cs as usize];
        ino.encode(&mut buf, 0, cs, es);

        let (back, stored) = Inode::decode(&buf, 0, cs, es).unwrap();
        assert_eq!(stored, INODE_SIZE + 5);
        assert_eq!(back.no, 7);
        assert_eq!(back.size, 5);
        assert_eq!(back.mode, libc::S_IFREG | 0o644);
        assert_eq!(back.mtime, Timespec { sec: 1234, nsec: 56 });
        assert_eq!(&back.data[..5], b"hello");
    }

    #[test]
    fn test_stored_size_per_tier() {
        let cs = 4096u32;
        let es = 65536u32;
        let mut ino = Inode::new(cs);

        ino.flags = DataTier::Emb as u32;
        ino.size = 100;
        assert_eq!(ino.stored_size(cs, es), INODE_SIZE + 100);

        ino.flags = DataTier::Clin as u32;
        ino.size = 2 * cs as u64 + 1;
        assert_eq!(ino.stored_size(cs, es), INODE_SIZE + 3 * 4);

        ino.flags = DataTier::Ebin as u32;
        ino.size = es as u64;
        assert_eq!(ino.stored_size(cs, es), INODE_SIZE + 4);
    }

    #[test]
    fn test_ind_ptr_view() {
        let mut ino = Inode::new(4096);
        ino.ind_set(0, 0xdead);
        ino.ind_set(3, 0xbeef);
        assert_eq!(ino.ind_get(0), 0xdead);
        assert_eq!(ino.ind_get(1), 0);
        assert_eq!(ino.ind_get(3), 0xbeef);
    }
}
