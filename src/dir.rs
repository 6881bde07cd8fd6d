//! Directory engine
//!
//! A directory is an ordinary file whose data is a dense array of dentry
//! records. Removed entries become tombstones (`ino == 0`) that every
//! reader skips; new entries are appended at the end of the data.

use crate::error::{FsError, FsResult};
use crate::fs::Ffsp;
use crate::inode::{split_path, Inode};
use crate::layout::{put_be32, Dentry, DENTRY_SIZE};
use crate::InodeNo;

/// Embed "." and ".." as the first two entries of a fresh directory.
pub(crate) fn mk_directory(ino: &mut Inode, parent_no: InodeNo) {
    let dot = Dentry::new(ino.no, ".");
    let dotdot = Dentry::new(parent_no, "..");
    dot.encode(&mut ino.data, 0);
    dotdot.encode(&mut ino.data, DENTRY_SIZE);

    ino.size = (DENTRY_SIZE * 2) as u64;
    ino.nlink = 2;
}

impl Ffsp {
    /// Read a directory's entire dentry array as raw bytes.
    fn read_dir_bytes(&mut self, dir_no: InodeNo) -> FsResult<Vec<u8>> {
        self.lookup_no(dir_no)?;
        self.read_whole(dir_no)
    }

    /// Decode the dentry array. The number of potential entries is not
    /// tracked anywhere; invalid entries are part of the result.
    pub(crate) fn read_dir(&mut self, dir_no: InodeNo) -> FsResult<Vec<Dentry>> {
        let buf = self.read_dir_bytes(dir_no)?;
        let count = buf.len() / DENTRY_SIZE;
        Ok((0..count).map(|i| Dentry::decode(&buf, i * DENTRY_SIZE)).collect())
    }

    /// Linear scan for a name, skipping tombstones.
    pub(crate) fn find_dentry(&mut self, dir_no: InodeNo, name: &str) -> FsResult<Option<Dentry>> {
        let dentries = self.read_dir(dir_no)?;
        Ok(dentries
            .into_iter()
            .filter(|d| d.ino != 0)
            .find(|d| d.name_is(name)))
    }

    /// A directory with no valid entries besides "." and ".." is empty.
    pub(crate) fn dir_is_empty(&mut self, dir_no: InodeNo) -> FsResult<bool> {
        let dentries = self.read_dir(dir_no)?;
        Ok(!dentries
            .iter()
            .filter(|d| d.ino != 0)
            .any(|d| !d.name_is(".") && !d.name_is("..")))
    }

    /// Append a dentry for `child_no` to the parent named by `path`'s
    /// directory part. Adding a directory bumps the parent's link count.
    /// Returns the parent's inode number.
    pub(crate) fn add_dentry(
        &mut self,
        path: &str,
        child_no: InodeNo,
        is_dir: bool,
    ) -> FsResult<InodeNo> {
        let (parent, name) = split_path(path)?;
        let parent_no = self.lookup(parent)?;
        if !self
            .inodes
            .get(parent_no)
            .map(|i| i.is_dir())
            .unwrap_or(false)
        {
            return Err(FsError::NotADirectory);
        }

        let dent = Dentry::new(child_no, name);
        let mut rec = [0u8; DENTRY_SIZE];
        dent.encode(&mut rec, 0);

        let parent_size = self.inodes.get(parent_no).map(|i| i.size).ok_or(FsError::Io)?;
        self.write_ino(parent_no, &rec, parent_size)?;

        if is_dir {
            if let Some(parent_ino) = self.inodes.get_mut(parent_no) {
                parent_ino.nlink += 1;
            }
            self.mark_dirty(parent_no);
        }
        Ok(parent_no)
    }

    /// Turn the dentry pointing at `child_no` into a tombstone and write
    /// the array back. Removing a directory drops the parent's link
    /// count.
    pub(crate) fn remove_dentry(
        &mut self,
        path: &str,
        child_no: InodeNo,
        is_dir: bool,
    ) -> FsResult<()> {
        let (parent, name) = split_path(path)?;
        let parent_no = self.lookup(parent)?;

        let mut buf = self.read_dir_bytes(parent_no)?;
        let count = buf.len() / DENTRY_SIZE;
        let mut found = false;
        for i in 0..count {
            let dent = Dentry::decode(&buf, i * DENTRY_SIZE);
            if dent.ino == child_no && dent.name_is(name) {
                let off = i * DENTRY_SIZE;
                put_be32(&mut buf, off, 0);
                buf[off + 4] = 0;
                found = true;
                break;
            }
        }
        if !found {
            return Err(FsError::NotFound);
        }
        self.write_ino(parent_no, &buf, 0)?;

        if is_dir {
            if let Some(parent_ino) = self.inodes.get_mut(parent_no) {
                parent_ino.nlink = parent_ino.nlink.saturating_sub(1);
            }
            self.mark_dirty(parent_no);
        }
        Ok(())
    }

    /// Point a moved directory's ".." entry at its new parent.
    pub(crate) fn set_dotdot(&mut self, dir_no: InodeNo, new_parent: InodeNo) -> FsResult<()> {
        let mut buf = self.read_dir_bytes(dir_no)?;
        let count = buf.len() / DENTRY_SIZE;
        for i in 0..count {
            let dent = Dentry::decode(&buf, i * DENTRY_SIZE);
            if dent.ino != 0 && dent.name_is("..") {
                put_be32(&mut buf, i * DENTRY_SIZE, new_parent);
                self.write_ino(dir_no, &buf, 0)?;
                return Ok(());
            }
        }
        Err(FsError::Io)
    }
}
