//! Host binding surface
//!
//! The host binding (e.g. a FUSE adapter) is an external collaborator;
//! this module is the seam it talks to. Every operation runs under one
//! mount-level exclusive lock and returns the host's numeric protocol:
//! zero or a byte count on success, a negative errno on failure. Paths
//! under the reserved debug namespace are rejected.

use spin::Mutex;

use crate::backend::Backend;
use crate::error::FsResult;
use crate::fs::{DirEntry, Ffsp, OpenFlags, StatBuf, StatVfs};
use crate::layout::Timespec;

/// Reserved pseudo-file namespace; not backed by this build.
const DEBUG_DIR: &str = "/.FFSP.d";

fn is_debug_path(path: &str) -> bool {
    path == DEBUG_DIR || path.starts_with("/.FFSP.d/")
}

fn errno_of<T>(res: FsResult<T>) -> i32 {
    match res {
        Ok(_) => 0,
        Err(e) => e.errno(),
    }
}

/// A mounted volume behind the mount-level exclusive lock, speaking the
/// host's negative-errno protocol.
pub struct FfspHost {
    fs: Mutex<Ffsp>,
}

impl FfspHost {
    pub fn new(fs: Ffsp) -> Self {
        FfspHost { fs: Mutex::new(fs) }
    }

    /// Tear the mount down; flushes and hands the backend back.
    pub fn unmount(self) -> FsResult<Box<dyn Backend>> {
        self.fs.into_inner().unmount()
    }

    pub fn getattr(&self, path: &str, stbuf: &mut StatBuf) -> i32 {
        if is_debug_path(path) {
            return crate::error::FsError::NotPermitted.errno();
        }
        let mut fs = self.fs.lock();
        match fs.getattr(path) {
            Ok(st) => {
                *stbuf = st;
                0
            }
            Err(e) => e.errno(),
        }
    }

    pub fn readdir(&self, path: &str, entries: &mut Vec<DirEntry>) -> i32 {
        if is_debug_path(path) {
            return crate::error::FsError::NotPermitted.errno();
        }
        let mut fs = self.fs.lock();
        match fs.readdir(path) {
            Ok(list) => {
                *entries = list;
                0
            }
            Err(e) => e.errno(),
        }
    }

    /// Returns the file handle (the inode number) or a negative errno.
    pub fn open(&self, path: &str, flags: OpenFlags) -> i64 {
        if is_debug_path(path) {
            return crate::error::FsError::NotPermitted.errno() as i64;
        }
        let mut fs = self.fs.lock();
        match fs.open(path, flags) {
            Ok(no) => no as i64,
            Err(e) => e.errno() as i64,
        }
    }

    pub fn release(&self, fh: u64) -> i32 {
        let mut fs = self.fs.lock();
        errno_of(fs.release(fh as u32))
    }

    pub fn read(&self, path: &str, fh: Option<u64>, buf: &mut [u8], offset: i64) -> i64 {
        if is_debug_path(path) {
            return crate::error::FsError::NotPermitted.errno() as i64;
        }
        if offset < 0 {
            return crate::error::FsError::InvalidArgument.errno() as i64;
        }
        let mut fs = self.fs.lock();
        let res = match fh {
            Some(no) => fs.read_ino(no as u32, buf, offset as u64),
            None => fs.read(path, buf, offset as u64),
        };
        match res {
            Ok(n) => n as i64,
            Err(e) => e.errno() as i64,
        }
    }

    pub fn write(&self, path: &str, fh: Option<u64>, buf: &[u8], offset: i64) -> i64 {
        if is_debug_path(path) {
            return crate::error::FsError::NotPermitted.errno() as i64;
        }
        if offset < 0 {
            return crate::error::FsError::InvalidArgument.errno() as i64;
        }
        let mut fs = self.fs.lock();
        let res = match fh {
            Some(no) => fs.write_handle(no as u32, buf, offset as u64),
            None => fs.write(path, buf, offset as u64),
        };
        match res {
            Ok(n) => n as i64,
            Err(e) => e.errno() as i64,
        }
    }

    pub fn mknod(&self, path: &str, mode: u32, uid: u32, gid: u32, rdev: u64) -> i32 {
        if is_debug_path(path) {
            return crate::error::FsError::NotPermitted.errno();
        }
        let mut fs = self.fs.lock();
        errno_of(fs.mknod(path, mode, uid, gid, rdev))
    }

    pub fn mkdir(&self, path: &str, mode: u32, uid: u32, gid: u32) -> i32 {
        if is_debug_path(path) {
            return crate::error::FsError::NotPermitted.errno();
        }
        let mut fs = self.fs.lock();
        errno_of(fs.mkdir(path, mode, uid, gid))
    }

    pub fn link(&self, oldpath: &str, newpath: &str) -> i32 {
        if is_debug_path(oldpath) || is_debug_path(newpath) {
            return crate::error::FsError::NotPermitted.errno();
        }
        let mut fs = self.fs.lock();
        errno_of(fs.link(oldpath, newpath))
    }

    pub fn symlink(&self, target: &str, linkpath: &str, uid: u32, gid: u32) -> i32 {
        if is_debug_path(target) || is_debug_path(linkpath) {
            return crate::error::FsError::NotPermitted.errno();
        }
        let mut fs = self.fs.lock();
        errno_of(fs.symlink(target, linkpath, uid, gid))
    }

    /// Copies at most `buf.len() - 1` bytes of the target and always
    /// NUL-terminates.
    pub fn readlink(&self, path: &str, buf: &mut [u8]) -> i32 {
        if is_debug_path(path) {
            return crate::error::FsError::NotPermitted.errno();
        }
        if buf.is_empty() {
            return crate::error::FsError::InvalidArgument.errno();
        }
        let mut fs = self.fs.lock();
        match fs.readlink(path) {
            Ok(target) => {
                let n = target.len().min(buf.len() - 1);
                buf[..n].copy_from_slice(&target.as_bytes()[..n]);
                buf[n] = 0;
                0
            }
            Err(e) => e.errno(),
        }
    }

    pub fn unlink(&self, path: &str) -> i32 {
        if is_debug_path(path) {
            return crate::error::FsError::NotPermitted.errno();
        }
        let mut fs = self.fs.lock();
        errno_of(fs.unlink(path))
    }

    pub fn rmdir(&self, path: &str) -> i32 {
        if is_debug_path(path) {
            return crate::error::FsError::NotPermitted.errno();
        }
        let mut fs = self.fs.lock();
        errno_of(fs.rmdir(path))
    }

    pub fn rename(&self, oldpath: &str, newpath: &str) -> i32 {
        if is_debug_path(oldpath) || is_debug_path(newpath) {
            return crate::error::FsError::NotPermitted.errno();
        }
        let mut fs = self.fs.lock();
        errno_of(fs.rename(oldpath, newpath))
    }

    pub fn truncate(&self, path: &str, length: i64) -> i32 {
        if is_debug_path(path) {
            return crate::error::FsError::NotPermitted.errno();
        }
        if length < 0 {
            return crate::error::FsError::InvalidArgument.errno();
        }
        let mut fs = self.fs.lock();
        errno_of(fs.truncate(path, length as u64))
    }

    pub fn chmod(&self, path: &str, mode: u32) -> i32 {
        if is_debug_path(path) {
            return crate::error::FsError::NotPermitted.errno();
        }
        let mut fs = self.fs.lock();
        errno_of(fs.chmod(path, mode))
    }

    pub fn chown(&self, path: &str, uid: u32, gid: u32) -> i32 {
        if is_debug_path(path) {
            return crate::error::FsError::NotPermitted.errno();
        }
        let mut fs = self.fs.lock();
        errno_of(fs.chown(path, uid, gid))
    }

    pub fn utimens(&self, path: &str, atime: Timespec, mtime: Timespec) -> i32 {
        if is_debug_path(path) {
            return crate::error::FsError::NotPermitted.errno();
        }
        let mut fs = self.fs.lock();
        errno_of(fs.utimens(path, atime, mtime))
    }

    pub fn statfs(&self, sfs: &mut StatVfs) -> i32 {
        let fs = self.fs.lock();
        *sfs = fs.statfs();
        0
    }

    /// Write back the metadata.
    pub fn flush(&self, path: &str) -> i32 {
        if is_debug_path(path) {
            return 0;
        }
        let mut fs = self.fs.lock();
        errno_of(fs.flush_meta())
    }

    /// Write back dirty inodes and the metadata.
    pub fn fsync(&self, path: &str, _datasync: bool) -> i32 {
        if is_debug_path(path) {
            return 0;
        }
        let mut fs = self.fs.lock();
        errno_of(fs.fsync())
    }
}
