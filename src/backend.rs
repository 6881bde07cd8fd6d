//! Positional I/O backends
//!
//! The whole file system performs its medium accesses through the
//! `Backend` trait: positional reads and writes over either a regular
//! file (opened with synchronous write semantics) or an in-memory buffer.
//! There is no read-ahead and no write coalescing at this layer.

use std::fs::OpenOptions;
use std::io;
use std::path::Path;

use log::error;

use crate::error::{FsError, FsResult};

/// Positional I/O over the backing medium.
pub trait Backend: Send {
    /// Total size of the medium in bytes.
    fn size(&self) -> u64;

    /// Read `buf.len()` bytes starting at `offset`.
    fn read(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Write `buf.len()` bytes starting at `offset`.
    fn write(&mut self, buf: &[u8], offset: u64) -> io::Result<usize>;
}

/// File-backed medium. The file is opened with `O_SYNC` so that every
/// write has reached the device when the call returns.
pub struct FileBackend {
    file: std::fs::File,
}

impl FileBackend {
    pub fn open<P: AsRef<Path>>(path: P) -> FsResult<Self> {
        use std::os::unix::fs::OpenOptionsExt;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(path)
            .map_err(|e| {
                error!("FileBackend::open() failed: {}", e);
                FsError::Io
            })?;
        Ok(FileBackend { file })
    }

    /// Open without `O_SYNC`; used by mkfs where durability is enforced
    /// by the final close.
    pub fn open_plain<P: AsRef<Path>>(path: P) -> FsResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                error!("FileBackend::open_plain() failed: {}", e);
                FsError::Io
            })?;
        Ok(FileBackend { file })
    }
}

impl Backend for FileBackend {
    fn size(&self) -> u64 {
        self.file.metadata().map(|m| m.len()).unwrap_or(0)
    }

    fn read(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;
        self.file.read_at(buf, offset)
    }

    fn write(&mut self, buf: &[u8], offset: u64) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;
        self.file.write_at(buf, offset)
    }
}

/// Memory-backed medium of a fixed size.
pub struct MemBackend {
    buf: Vec<u8>,
}

impl MemBackend {
    pub fn new(size: usize) -> Self {
        MemBackend {
            buf: vec![0u8; size],
        }
    }
}

impl Backend for MemBackend {
    fn size(&self) -> u64 {
        self.buf.len() as u64
    }

    fn read(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let off = offset as usize;
        if off + buf.len() > self.buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read beyond end of medium",
            ));
        }
        buf.copy_from_slice(&self.buf[off..off + buf.len()]);
        Ok(buf.len())
    }

    fn write(&mut self, buf: &[u8], offset: u64) -> io::Result<usize> {
        let off = offset as usize;
        if off + buf.len() > self.buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "write beyond end of medium",
            ));
        }
        self.buf[off..off + buf.len()].copy_from_slice(buf);
        Ok(buf.len())
    }
}

/// Read exactly `buf.len()` bytes at `offset`, with overflow guards on
/// the byte count and offset.
pub fn read_raw(backend: &dyn Backend, buf: &mut [u8], offset: u64) -> FsResult<u64> {
    if buf.len() as u64 > i64::MAX as u64 {
        error!("read_raw(): byte count exceeds signed limits");
        return Err(FsError::Overflow);
    }
    if offset > i64::MAX as u64 {
        error!("read_raw(): offset exceeds signed limits");
        return Err(FsError::Overflow);
    }

    match backend.read(buf, offset) {
        Ok(n) if n == buf.len() => Ok(n as u64),
        Ok(n) => {
            error!("read_raw(): short read ({} of {} bytes)", n, buf.len());
            Err(FsError::Io)
        }
        Err(e) => {
            error!("read_raw(): read failed: {}", e);
            Err(FsError::Io)
        }
    }
}

/// Write all of `buf` at `offset`, with the same overflow guards.
pub fn write_raw(backend: &mut dyn Backend, buf: &[u8], offset: u64) -> FsResult<u64> {
    if buf.len() as u64 > i64::MAX as u64 {
        error!("write_raw(): byte count exceeds signed limits");
        return Err(FsError::Overflow);
    }
    if offset > i64::MAX as u64 {
        error!("write_raw(): offset exceeds signed limits");
        return Err(FsError::Overflow);
    }

    match backend.write(buf, offset) {
        Ok(n) if n == buf.len() => Ok(n as u64),
        Ok(n) => {
            error!("write_raw(): short write ({} of {} bytes)", n, buf.len());
            Err(FsError::Io)
        }
        Err(e) => {
            error!("write_raw(): write failed: {}", e);
            Err(FsError::Io)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_backend_roundtrip() {
        let mut backend = MemBackend::new(4096);
        assert_eq!(backend.size(), 4096);

        let data = [0xabu8; 128];
        write_raw(&mut backend, &data, 512).unwrap();

        let mut out = [0u8; 128];
        read_raw(&backend, &mut out, 512).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_mem_backend_bounds() {
        let mut backend = MemBackend::new(1024);
        let data = [0u8; 64];
        assert_eq!(write_raw(&mut backend, &data, 1000), Err(FsError::Io));
        let mut out = [0u8; 64];
        assert_eq!(read_raw(&backend, &mut out, 1024), Err(FsError::Io));
    }

    #[test]
    fn test_overflow_guard() {
        let mut backend = MemBackend::new(1024);
        let data = [0u8; 16];
        assert_eq!(
            write_raw(&mut backend, &data, u64::MAX),
            Err(FsError::Overflow)
        );
    }
}
