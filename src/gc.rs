//! Garbage collection
//!
//! Every finalized erase block bumps a per-type write counter. Once a
//! counter reaches `nerasewrites` the collector picks the erase blocks of
//! that type with the fewest valid clusters and compacts their surviving
//! content into a fresh erase block, updating the inode map (for inode
//! erase blocks) or the owning inodes' indirect pointers (for cluster
//! indirect erase blocks, guided by the trailing summaries). Fully
//! invalidated erase blocks are swept back to empty afterwards.

use std::mem;

use log::debug;

use crate::backend::{read_raw, write_raw};
use crate::error::FsResult;
use crate::fs::Ffsp;
use crate::inode_group;
use crate::layout::{DataTier, EraseBlockType};
use crate::summary;
use crate::{ClusterId, EraseBlockId, InodeNo};

/// Per-type garbage collection state.
#[derive(Debug, Clone, Copy)]
pub struct GcEntry {
    pub eb_type: EraseBlockType,
    /// Monotone write sequence of this type, stamped into `lastwrite`.
    pub write_time: u16,
    /// Finalized erase blocks since the last collection of this type.
    pub write_cnt: u32,
}

impl GcEntry {
    fn new(eb_type: EraseBlockType) -> Self {
        GcEntry {
            eb_type,
            write_time: 0,
            write_cnt: 0,
        }
    }
}

/// One tracking entry per open erase block type; which types exist
/// depends on how many erase blocks may be open simultaneously.
pub fn gcinfo_init(neraseopen: u32) -> Vec<GcEntry> {
    if neraseopen == 3 {
        vec![
            GcEntry::new(EraseBlockType::DentryInode),
            GcEntry::new(EraseBlockType::DentryClin),
        ]
    } else if neraseopen == 4 {
        vec![
            GcEntry::new(EraseBlockType::DentryInode),
            GcEntry::new(EraseBlockType::FileInode),
            GcEntry::new(EraseBlockType::DentryClin),
        ]
    } else {
        vec![
            GcEntry::new(EraseBlockType::DentryInode),
            GcEntry::new(EraseBlockType::FileInode),
            GcEntry::new(EraseBlockType::DentryClin),
            GcEntry::new(EraseBlockType::FileClin),
        ]
    }
}

impl Ffsp {
    fn gc_entry_mut(&mut self, eb_type: EraseBlockType) -> Option<&mut GcEntry> {
        self.gcinfo.iter_mut().find(|e| e.eb_type == eb_type)
    }

    /// Advance the per-type write sequence and return the new stamp.
    pub(crate) fn gcinfo_update_writetime(&mut self, eb_type: EraseBlockType) -> u16 {
        match self.gc_entry_mut(eb_type) {
            Some(entry) => {
                entry.write_time = entry.write_time.wrapping_add(1);
                entry.write_time
            }
            None => 0,
        }
    }

    /// Count one finalized erase block of the given type.
    pub(crate) fn gcinfo_inc_writecnt(&mut self, eb_type: EraseBlockType) -> u32 {
        match self.gc_entry_mut(eb_type) {
            Some(entry) => {
                entry.write_cnt += 1;
                entry.write_cnt
            }
            None => 0,
        }
    }

    /// An erase block is a collection candidate if it still contains
    /// valid clusters, was closed, and is not fully valid.
    fn is_eb_collectable(&self, eb_id: EraseBlockId) -> bool {
        let entry = &self.eb_usage[eb_id as usize];
        let max_writeops = self.max_writeops();
        let max_cvalid = if entry.eb_type.has_summary() {
            // The summary cluster does not count as valid data.
            max_writeops - 1
        } else {
            max_writeops
        };
        entry.cvalid > 0 && entry.writeops == max_writeops && entry.cvalid < max_cvalid
    }

    /// Erase block of the given type with the fewest valid clusters;
    /// ties fall to the lowest erase block id.
    fn find_collectable_eraseblk(&self, eb_type: EraseBlockType) -> Option<EraseBlockId> {
        let mut least_cvalid = self.max_writeops();
        let mut least_id = None;

        for eb_id in 1..self.neraseblocks {
            let entry = &self.eb_usage[eb_id as usize];
            if entry.eb_type == eb_type
                && self.is_eb_collectable(eb_id)
                && entry.cvalid < least_cvalid
            {
                least_cvalid = entry.cvalid;
                least_id = Some(eb_id);
            }
        }
        least_id
    }

    /// First type whose finalized-erase-block counter reached the GC
    /// threshold.
    fn find_collectable_eb_type(&self) -> Option<EraseBlockType> {
        self.gcinfo
            .iter()
            .find(|e| e.write_cnt >= self.nerasewrites)
            .map(|e| e.eb_type)
    }

    /// Claim an empty erase block as the collection destination.
    fn gc_find_empty(&mut self) -> Option<EraseBlockId> {
        for eb_id in 1..self.neraseblocks {
            if self.eb_usage[eb_id as usize].eb_type == EraseBlockType::Empty {
                let entry = &mut self.eb_usage[eb_id as usize];
                entry.lastwrite = 0;
                entry.cvalid = 0;
                entry.writeops = 0;
                return Some(eb_id);
            }
        }
        None
    }

    /// Copy valid inode clusters from the source erase block into the
    /// destination, remapping every surviving inode. Stops when the
    /// source has no more valid clusters or the destination is full.
    /// Returns the number of clusters now inside the destination.
    fn move_inodes(
        &mut self,
        src_eb: EraseBlockId,
        dest_eb: EraseBlockId,
        mut dest_moved: u32,
        scratch: &mut [u8],
    ) -> FsResult<u32> {
        let cs = self.clustersize as usize;
        let max_cvalid = self.cl_per_eb();

        for i in 0..max_cvalid {
            let src_cl = src_eb * self.cl_per_eb() + i;
            let inodes = inode_group::read_inode_group(self, src_cl)?;
            // Clusters whose inodes are all dirty do not count as valid
            // anymore; the pending rewrite supersedes them.
            let live = inodes
                .iter()
                .filter(|ino| !self.inodes.is_dirty(ino.no))
                .count() as i32;
            if live == 0 {
                continue;
            }

            read_raw(&*self.backend, &mut scratch[..cs], src_cl as u64 * cs as u64)?;
            let dest_cl = dest_eb * self.cl_per_eb() + dest_moved;
            write_raw(&mut *self.backend, &scratch[..cs], dest_cl as u64 * cs as u64)?;
            self.metrics.add_gc_read(cs as u64);
            self.metrics.add_gc_write(cs as u64);

            // Remap the moved inodes and carry the cluster's occupancy
            // over. Dirty inodes gave up their contribution when they
            // were marked.
            for ino in &inodes {
                self.ino_map[ino.no as usize] = dest_cl;
            }
            self.cl_occupancy[src_cl as usize] -= live;
            self.cl_occupancy[dest_cl as usize] += live;

            self.eb_inc_cvalid(dest_eb);
            self.eb_dec_cvalid(src_eb);

            dest_moved += 1;
            if dest_moved == max_cvalid {
                break;
            }
        }
        Ok(dest_moved)
    }

    /// Compact inode erase blocks of one type into a fresh erase block.
    fn collect_inodes(&mut self, eb_type: EraseBlockType, scratch: &mut [u8]) -> FsResult<()> {
        let max_writeops = self.max_writeops();
        let max_cvalid = self.cl_per_eb();

        let dest_eb = match self.gc_find_empty() {
            Some(eb) => eb,
            None => return Ok(()),
        };

        let mut moved = 0u32;
        loop {
            let src_eb = match self.find_collectable_eraseblk(eb_type) {
                Some(eb) => eb,
                None => break,
            };
            let before = moved;
            moved = self.move_inodes(src_eb, dest_eb, moved, scratch)?;
            if moved == max_cvalid || moved == before {
                break;
            }
        }

        // Still zero if no collectable erase block was found.
        if moved > 0 {
            let write_time = self.gcinfo_update_writetime(eb_type);
            let entry = &mut self.eb_usage[dest_eb as usize];
            entry.eb_type = eb_type;
            entry.lastwrite = write_time;
            entry.writeops = max_writeops;
        }
        Ok(())
    }

    /// A cluster of a cluster indirect erase block is live iff the inode
    /// named by the summary still points at it.
    fn is_clin_valid(&mut self, cl_id: ClusterId, ino_no: InodeNo) -> FsResult<bool> {
        if ino_no == 0 || ino_no >= self.nino {
            return Ok(false);
        }
        match self.lookup_no(ino_no) {
            Ok(()) => {}
            Err(crate::error::FsError::NotFound) => return Ok(false),
            Err(e) => return Err(e),
        }

        let ino = match self.inodes.get(ino_no) {
            Some(ino) => ino,
            None => return Ok(false),
        };
        if ino.tier()? != DataTier::Clin || ino.size == 0 {
            return Ok(false);
        }
        let ind_last = ((ino.size - 1) / self.clustersize as u64) as usize;
        Ok((0..=ind_last).any(|i| ino.ind_get(i) == cl_id))
    }

    /// Replace one indirect cluster pointer of the inode and mark it
    /// dirty so the remapping is persisted.
    fn swap_cluster_id(
        &mut self,
        ino_no: InodeNo,
        old_cl: ClusterId,
        new_cl: ClusterId,
    ) -> FsResult<()> {
        self.lookup_no(ino_no)?;
        let mut swapped = false;
        if let Some(ino) = self.inodes.get_mut(ino_no) {
            let ind_last = ((ino.size - 1) / self.clustersize as u64) as usize;
            for i in 0..=ind_last {
                if ino.ind_get(i) == old_cl {
                    ino.ind_set(i, new_cl);
                    swapped = true;
                    break;
                }
            }
        }
        if swapped {
            self.mark_dirty(ino_no);
        }
        Ok(())
    }

    /// Copy live clusters out of one cluster indirect erase block, using
    /// its summary to find the owning inodes.
    fn move_clin(
        &mut self,
        src_eb: EraseBlockId,
        dest_eb: EraseBlockId,
        mut dest_moved: u32,
        dest_summary: &mut [InodeNo],
        scratch: &mut [u8],
    ) -> FsResult<u32> {
        let cs = self.clustersize as usize;
        let max_cvalid = self.cl_per_eb() - 1;
        let src_summary = summary::read_summary(self, src_eb)?;

        for i in 0..max_cvalid {
            let ino_no = src_summary[i as usize];
            let src_cl = src_eb * self.cl_per_eb() + i;
            if !self.is_clin_valid(src_cl, ino_no)? {
                continue;
            }

            let dest_cl = dest_eb * self.cl_per_eb() + dest_moved;
            read_raw(&*self.backend, &mut scratch[..cs], src_cl as u64 * cs as u64)?;
            write_raw(&mut *self.backend, &scratch[..cs], dest_cl as u64 * cs as u64)?;
            self.metrics.add_gc_read(cs as u64);
            self.metrics.add_gc_write(cs as u64);

            self.swap_cluster_id(ino_no, src_cl, dest_cl)?;
            dest_summary[dest_moved as usize] = ino_no;
            self.eb_inc_cvalid(dest_eb);
            self.eb_dec_cvalid(src_eb);

            dest_moved += 1;
            if dest_moved == max_cvalid {
                break;
            }
        }
        Ok(dest_moved)
    }

    /// Compact cluster indirect erase blocks of one type, accumulating
    /// the destination's summary along the way.
    fn collect_clin(&mut self, eb_type: EraseBlockType, scratch: &mut [u8]) -> FsResult<()> {
        let max_writeops = self.max_writeops();
        let max_cvalid = self.cl_per_eb() - 1;

        let dest_eb = match self.gc_find_empty() {
            Some(eb) => eb,
            None => return Ok(()),
        };

        let mut dest_summary = vec![0u32; max_cvalid as usize];
        let mut moved = 0u32;
        loop {
            let src_eb = match self.find_collectable_eraseblk(eb_type) {
                Some(eb) => eb,
                None => break,
            };
            let before = moved;
            moved = self.move_clin(src_eb, dest_eb, moved, &mut dest_summary, scratch)?;
            if moved == max_cvalid || moved == before {
                break;
            }
        }

        if moved > 0 {
            summary::write_summary(self, dest_eb, &dest_summary)?;

            let write_time = self.gcinfo_update_writetime(eb_type);
            let entry = &mut self.eb_usage[dest_eb as usize];
            entry.eb_type = eb_type;
            entry.lastwrite = write_time;
            entry.writeops = max_writeops;
        }
        Ok(())
    }

    /// Sweep fully invalidated erase blocks back to empty. Open cluster
    /// indirect erase blocks are skipped so their summary buffer stays
    /// attached until they close.
    fn collect_empty_eraseblks(&mut self) {
        let max_writeops = self.max_writeops();
        for eb_id in 1..self.neraseblocks {
            let entry = &self.eb_usage[eb_id as usize];
            let freeable = entry.cvalid == 0
                && (entry.eb_type.holds_inodes()
                    || (entry.eb_type.has_summary() && entry.writeops == max_writeops));
            if freeable {
                let entry = &mut self.eb_usage[eb_id as usize];
                entry.eb_type = EraseBlockType::Empty;
                entry.lastwrite = 0;
                entry.writeops = 0;
            }
        }
    }

    /// Run garbage collection. A no-op while handing out empty erase
    /// blocks would cut into the reserved pool.
    pub fn gc(&mut self) -> FsResult<()> {
        debug!("gc()");

        if self.empty_eraseblk_count() < self.nerasereserve {
            debug!("gc(): too few empty erase blocks present");
            return Ok(());
        }

        let mut scratch = mem::take(&mut self.buf);
        let mut result = Ok(());
        while let Some(eb_type) = self.find_collectable_eb_type() {
            debug!("gc(): collecting erase block type {:?}", eb_type);

            let res = if eb_type.holds_inodes() {
                self.collect_inodes(eb_type, &mut scratch)
            } else if eb_type.has_summary() {
                self.collect_clin(eb_type, &mut scratch)
            } else {
                Ok(())
            };

            if let Some(entry) = self.gc_entry_mut(eb_type) {
                entry.write_cnt = 0;
            }
            if let Err(e) = res {
                result = Err(e);
                break;
            }
        }
        self.collect_empty_eraseblks();
        self.buf = scratch;
        result
    }
}
