//! Erase block summaries
//!
//! Cluster indirect erase blocks end with a summary cluster: an array of
//! be32 inode numbers naming, for every data cluster in the erase block,
//! the inode it belongs to. While such an erase block is open its summary
//! is accumulated in memory; since there is at most one open erase block
//! per type there is also at most one open summary buffer per type.

use log::error;

use crate::backend::{read_raw, write_raw};
use crate::error::{FsError, FsResult};
use crate::fs::Ffsp;
use crate::layout::{get_be32, put_be32, EraseBlockType};
use crate::{EraseBlockId, InodeNo};

/// In-memory buffer of indirect-cluster inode references, one open buffer
/// per cluster-indirect erase block type at most.
pub struct SummaryCache {
    open: Vec<(EraseBlockType, Vec<InodeNo>)>,
}

impl SummaryCache {
    pub fn new() -> Self {
        SummaryCache { open: Vec::new() }
    }

    /// Open a fresh summary buffer for a newly opened erase block.
    pub fn open(&mut self, eb_type: EraseBlockType, entries: usize) {
        debug_assert!(self.get(eb_type).is_none());
        self.open.push((eb_type, vec![0u32; entries]));
    }

    pub fn get(&self, eb_type: EraseBlockType) -> Option<&Vec<InodeNo>> {
        self.open
            .iter()
            .find(|(t, _)| *t == eb_type)
            .map(|(_, s)| s)
    }

    /// Record which inode the cluster at `index` belongs to.
    pub fn add_ref(
        &mut self,
        eb_type: EraseBlockType,
        index: usize,
        ino_no: InodeNo,
    ) -> FsResult<()> {
        let summary = self
            .open
            .iter_mut()
            .find(|(t, _)| *t == eb_type)
            .map(|(_, s)| s)
            .ok_or_else(|| {
                error!("no open summary for erase block type {:?}", eb_type);
                FsError::Io
            })?;
        if index >= summary.len() {
            error!("summary index {} out of range", index);
            return Err(FsError::Io);
        }
        summary[index] = ino_no;
        Ok(())
    }

    /// Close and return the open buffer of this type.
    pub fn close(&mut self, eb_type: EraseBlockType) -> FsResult<Vec<InodeNo>> {
        let pos = self
            .open
            .iter()
            .position(|(t, _)| *t == eb_type)
            .ok_or_else(|| {
                error!("no open summary for erase block type {:?}", eb_type);
                FsError::Io
            })?;
        Ok(self.open.remove(pos).1)
    }
}

impl Default for SummaryCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Read the trailing summary cluster of a cluster indirect erase block.
pub(crate) fn read_summary(fs: &Ffsp, eb_id: EraseBlockId) -> FsResult<Vec<InodeNo>> {
    let cs = fs.clustersize as usize;
    let eb_off = eb_id as u64 * fs.erasesize as u64;
    let summary_off = eb_off + fs.erasesize as u64 - cs as u64;

    let mut buf = vec![0u8; cs];
    read_raw(&*fs.backend, &mut buf, summary_off)?;
    fs.metrics.add_read_raw(cs as u64);

    let entries = fs.cl_per_eb() as usize - 1;
    Ok((0..entries).map(|i| get_be32(&buf, i * 4)).collect())
}

/// Write a summary into the last cluster of the erase block.
pub(crate) fn write_summary(
    fs: &mut Ffsp,
    eb_id: EraseBlockId,
    summary: &[InodeNo],
) -> FsResult<()> {
    let cs = fs.clustersize as usize;
    let eb_off = eb_id as u64 * fs.erasesize as u64;
    let summary_off = eb_off + fs.erasesize as u64 - cs as u64;

    let mut buf = vec![0u8; cs];
    for (i, &no) in summary.iter().enumerate() {
        put_be32(&mut buf, i * 4, no);
    }
    write_raw(&mut *fs.backend, &buf, summary_off)?;
    fs.metrics.add_write_raw(cs as u64);
    Ok(())
}
