//! Erase block management
//!
//! Erase blocks carry a type tag and move through the lifecycle
//! `empty -> <type>(open) -> <type>(closed)` and, via the garbage
//! collector, back to `empty`. At most one erase block of each open type
//! is in progress at any time. Erase block 0 holds the superblock, the
//! erase block usage array and the inode map; it is never handed out.

use log::debug;

use crate::backend::write_raw;
use crate::error::{FsError, FsResult};
use crate::fs::Ffsp;
use crate::layout::{DataTier, EraseBlockType, EB_ENTRY_SIZE};
use crate::summary;
use crate::{ClusterId, EraseBlockId, InodeNo};

impl Ffsp {
    /// Clusters per erase block; also the maximum write operation count.
    pub(crate) fn cl_per_eb(&self) -> u32 {
        self.erasesize / self.clustersize
    }

    pub(crate) fn max_writeops(&self) -> u16 {
        self.cl_per_eb() as u16
    }

    /// Erase block enclosing the given cluster.
    pub(crate) fn eb_of_cluster(&self, cl_id: ClusterId) -> EraseBlockId {
        (cl_id as u64 * self.clustersize as u64 / self.erasesize as u64) as EraseBlockId
    }

    pub(crate) fn eb_get_cvalid(&self, eb_id: EraseBlockId) -> u16 {
        self.eb_usage[eb_id as usize].cvalid
    }

    pub(crate) fn eb_inc_cvalid(&mut self, eb_id: EraseBlockId) {
        self.eb_usage[eb_id as usize].cvalid += 1;
    }

    pub(crate) fn eb_dec_cvalid(&mut self, eb_id: EraseBlockId) {
        let entry = &mut self.eb_usage[eb_id as usize];
        entry.cvalid = entry.cvalid.saturating_sub(1);
    }

    /// Number of empty erase blocks; erase block 0 never counts.
    pub(crate) fn empty_eraseblk_count(&self) -> u32 {
        self.eb_usage[1..]
            .iter()
            .filter(|e| e.eb_type == EraseBlockType::Empty)
            .count() as u32
    }

    /// Claim an empty erase block for writing. Fails once handing one out
    /// would dip into the reserved pool.
    fn find_empty_eraseblk(&mut self) -> Option<EraseBlockId> {
        if self.empty_eraseblk_count() <= self.nerasereserve {
            return None;
        }
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

    /// Erase block type for a write of the given data tier. How finely
    /// directory and file content are separated depends on the number of
    /// simultaneously open erase blocks.
    pub(crate) fn eraseblk_type_for(&self, tier: DataTier, is_dir: bool) -> EraseBlockType {
        if self.neraseopen == 3 {
            // 1. EB: super block, erase block usage, inode map
            // 2. EB: inodes (dentry and file)
            // 3. EB: cluster indirect data (dentry and file)
            match tier {
                DataTier::Emb => return EraseBlockType::DentryInode,
                DataTier::Clin => return EraseBlockType::DentryClin,
                DataTier::Ebin => {}
            }
        } else if self.neraseopen == 4 {
            // 1. EB: super block, erase block usage, inode map
            // 2. EB: dentry inodes
            // 3. EB: file inodes
            // 4. EB: cluster indirect data (dentry and file)
            match tier {
                DataTier::Emb if is_dir => return EraseBlockType::DentryInode,
                DataTier::Emb => return EraseBlockType::FileInode,
                DataTier::Clin => return EraseBlockType::DentryClin,
                DataTier::Ebin => {}
            }
        } else if self.neraseopen >= 5 {
            // 1. EB: super block, erase block usage, inode map
            // 2. EB: dentry inodes
            // 3. EB: file inodes
            // 4. EB: cluster indirect dentry data
            // 5. EB: cluster indirect file data
            match (tier, is_dir) {
                (DataTier::Emb, true) => return EraseBlockType::DentryInode,
                (DataTier::Clin, true) => return EraseBlockType::DentryClin,
                (DataTier::Emb, false) => return EraseBlockType::FileInode,
                (DataTier::Clin, false) => return EraseBlockType::FileClin,
                (DataTier::Ebin, _) => {}
            }
        }
        EraseBlockType::Ebin
    }

    /// Find where the next write of the given type goes: an open erase
    /// block of that type, or a freshly claimed empty one. For erase
    /// block indirect data the whole erase block is the write unit.
    pub(crate) fn find_writable_cluster(
        &mut self,
        eb_type: EraseBlockType,
    ) -> FsResult<(EraseBlockId, ClusterId)> {
        if eb_type == EraseBlockType::Ebin {
            let eb_id = self.find_empty_eraseblk().ok_or(FsError::NoSpace)?;
            return Ok((eb_id, eb_id));
        }

        let max_writeops = self.max_writeops();

        // An open erase block of the matching type has the next slot.
        for eb_id in 1..self.neraseblocks {
            let entry = &self.eb_usage[eb_id as usize];
            if entry.eb_type != eb_type {
                continue;
            }
            if entry.writeops < max_writeops {
                let cl_id = eb_id * self.cl_per_eb() + entry.writeops as u32;
                return Ok((eb_id, cl_id));
            }
        }

        // No open erase block of this type; open a new one. Its first
        // cluster is the write target.
        let eb_id = self.find_empty_eraseblk().ok_or(FsError::NoSpace)?;
        Ok((eb_id, eb_id * self.cl_per_eb()))
    }

    /// Account for one committed cluster write: stamp the erase block,
    /// maintain the summary of cluster indirect erase blocks and bump the
    /// per-type GC trigger counter when an erase block fills up.
    ///
    /// This function cannot trigger garbage collection by itself; the
    /// caller may still have to invalidate a replaced cluster in another
    /// erase block before the counts are consistent.
    pub(crate) fn commit_write(
        &mut self,
        eb_type: EraseBlockType,
        eb_id: EraseBlockId,
        ino_no: InodeNo,
    ) -> FsResult<()> {
        if eb_type == EraseBlockType::Ebin {
            // Never "open": the whole erase block is written in one shot.
            self.eb_usage[eb_id as usize].eb_type = eb_type;
            return Ok(());
        }

        let write_time = self.gcinfo_update_writetime(eb_type);
        let max_writeops = self.max_writeops();
        let entry = &mut self.eb_usage[eb_id as usize];
        entry.eb_type = eb_type;
        entry.lastwrite = write_time;
        entry.cvalid += 1;
        entry.writeops += 1;
        let writeops = entry.writeops;

        if !eb_type.has_summary() {
            if writeops == max_writeops {
                // Implicitly finalized once the maximum write operation
                // count is reached.
                self.gcinfo_inc_writecnt(eb_type);
            }
            return Ok(());
        }

        if writeops == 1 {
            // First write into a newly opened erase block.
            let entries = self.cl_per_eb() as usize - 1;
            self.summaries.open(eb_type, entries);
        }
        // The last cluster of a cluster indirect erase block records the
        // owning inode of every data cluster within.
        self.summaries
            .add_ref(eb_type, writeops as usize - 1, ino_no)?;

        if writeops == max_writeops - 1 {
            // The next slot is the summary slot; writing it finalizes the
            // erase block.
            let buf = self.summaries.close(eb_type)?;
            summary::write_summary(self, eb_id, &buf)?;

            let write_time = self.gcinfo_update_writetime(eb_type);
            let entry = &mut self.eb_usage[eb_id as usize];
            entry.lastwrite = write_time;
            entry.writeops += 1;
            self.gcinfo_inc_writecnt(eb_type);
        }
        Ok(())
    }

    /// Force every open erase block closed (unmount). Cluster indirect
    /// erase blocks get their summary written out.
    pub(crate) fn close_eraseblks(&mut self) -> FsResult<()> {
        let max_writeops = self.max_writeops();

        for eb_id in 1..self.neraseblocks {
            let entry = self.eb_usage[eb_id as usize];
            match entry.eb_type {
                EraseBlockType::Ebin | EraseBlockType::Empty | EraseBlockType::Super => continue,
                _ => {}
            }
            if entry.writeops == max_writeops {
                continue; // already finalized
            }

            self.eb_usage[eb_id as usize].writeops = max_writeops;

            if !entry.eb_type.has_summary() {
                continue;
            }

            let buf = self.summaries.close(entry.eb_type)?;
            summary::write_summary(self, eb_id, &buf)?;

            let write_time = self.gcinfo_update_writetime(entry.eb_type);
            self.eb_usage[eb_id as usize].lastwrite = write_time;
        }
        Ok(())
    }

    /// Write the erase block usage array followed by the inode map as one
    /// contiguous request starting at cluster 1 of erase block 0.
    pub(crate) fn write_meta_data(&mut self) -> FsResult<()> {
        let eb_usage_size = self.neraseblocks as usize * EB_ENTRY_SIZE;
        let ino_map_size = self.nino as usize * 4;
        let mut buf = vec![0u8; eb_usage_size + ino_map_size];

        for (i, entry) in self.eb_usage.iter().enumerate() {
            entry.encode(&mut buf, i * EB_ENTRY_SIZE);
        }
        for (i, &cl_id) in self.ino_map.iter().enumerate() {
            crate::layout::put_be32(&mut buf, eb_usage_size + i * 4, cl_id);
        }

        let offset = self.clustersize as u64;
        write_raw(&mut *self.backend, &buf, offset).map_err(|e| {
            debug!("writing meta data to first erase block failed");
            e
        })?;
        self.metrics.add_write_raw(buf.len() as u64);
        Ok(())
    }
}
