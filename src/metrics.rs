//! Volume I/O metrics
//!
//! Counters over the mount lifetime: raw medium traffic, host-initiated
//! file I/O and the bytes the garbage collector moved around. The
//! counters are atomic so read paths can bump them through a shared
//! reference; nothing in here is persisted.

use core::sync::atomic::{AtomicU64, Ordering};

/// Live byte counters of a mounted volume.
#[derive(Debug, Default)]
pub struct Metrics {
    read_raw: AtomicU64,
    write_raw: AtomicU64,
    host_read: AtomicU64,
    host_write: AtomicU64,
    gc_read: AtomicU64,
    gc_write: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Bytes read from the medium
    pub read_raw: u64,
    /// Bytes written to the medium
    pub write_raw: u64,
    /// Bytes handed out by host-level reads
    pub host_read: u64,
    /// Bytes accepted from host-level writes
    pub host_write: u64,
    /// Bytes the collector read while moving survivors
    pub gc_read: u64,
    /// Bytes the collector wrote while moving survivors
    pub gc_write: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics::default()
    }

    pub fn add_read_raw(&self, n: u64) {
        self.read_raw.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_write_raw(&self, n: u64) {
        self.write_raw.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_host_read(&self, n: u64) {
        self.host_read.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_host_write(&self, n: u64) {
        self.host_write.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_gc_read(&self, n: u64) {
        self.gc_read.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_gc_write(&self, n: u64) {
        self.gc_write.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            read_raw: self.read_raw.load(Ordering::Relaxed),
            write_raw: self.write_raw.load(Ordering::Relaxed),
            host_read: self.host_read.load(Ordering::Relaxed),
            host_write: self.host_write.load(Ordering::Relaxed),
            gc_read: self.gc_read.load(Ordering::Relaxed),
            gc_write: self.gc_write.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSnapshot {
    /// Write amplification so far: raw bytes written per host byte
    /// written. Zero until the host has written anything.
    pub fn write_amplification(&self) -> f64 {
        if self.host_write == 0 {
            return 0.0;
        }
        self.write_raw as f64 / self.host_write as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let m = Metrics::new();
        m.add_write_raw(4096);
        m.add_write_raw(4096);
        m.add_host_write(1024);

        let snap = m.snapshot();
        assert_eq!(snap.write_raw, 8192);
        assert_eq!(snap.host_write, 1024);
        assert_eq!(snap.write_amplification(), 8.0);
    }

    #[test]
    fn test_amplification_without_writes() {
        let snap = Metrics::new().snapshot();
        assert_eq!(snap.write_amplification(), 0.0);
    }
}
