//! Volume consistency verification
//!
//! Recomputes the derived state of a mounted volume from first
//! principles and compares it against the live bookkeeping:
//! - every real inode map entry leads to a cluster whose inode group
//!   contains that inode,
//! - the per-cluster occupancy counts match the map and the dirty set,
//! - every erase block's valid cluster count matches a medium scan,
//! - the empty erase block pool respects the reserve.
//!
//! The scan is expensive and meant for diagnostics and tests, not for
//! the regular operation path.

use std::collections::HashMap;

use log::debug;

use crate::error::FsResult;
use crate::fs::Ffsp;
use crate::inode_group;
use crate::layout::{DataTier, EraseBlockType};
use crate::{ClusterId, EraseBlockId, InodeNo, FREE_CLUSTER, RESERVED_CLUSTER};

impl Ffsp {
    /// Scan the volume and report every invariant violation found. An
    /// empty report means the volume is consistent.
    pub fn check_consistency(&mut self) -> FsResult<Vec<String>> {
        debug!("check_consistency()");
        let mut report = Vec::new();

        self.check_inode_map(&mut report)?;
        let occupancy = self.recount_occupancy();
        self.check_occupancy(&occupancy, &mut report);
        self.check_eraseblocks(&occupancy, &mut report)?;
        self.check_reserve(&mut report);

        Ok(report)
    }

    /// Every real map entry has to lead back to its inode.
    fn check_inode_map(&mut self, report: &mut Vec<String>) -> FsResult<()> {
        for no in 1..self.nino {
            let cl_id = self.ino_map[no as usize];
            if cl_id == FREE_CLUSTER {
                continue;
            }
            if cl_id == RESERVED_CLUSTER {
                if !self.inodes.contains(no) {
                    report.push(format!("inode {}: reserved but not cached", no));
                }
                continue;
            }
            if self.inodes.is_dirty(no) {
                // The on-medium copy is stale until the next flush.
                continue;
            }

            let group = inode_group::read_inode_group(self, cl_id)?;
            if !group.iter().any(|ino| ino.no == no) {
                report.push(format!(
                    "inode {}: cluster {} does not contain it",
                    no, cl_id
                ));
            }
        }
        Ok(())
    }

    /// Occupancy from first principles: non-dirty inodes per cluster.
    fn recount_occupancy(&self) -> HashMap<ClusterId, i32> {
        let mut occupancy: HashMap<ClusterId, i32> = HashMap::new();
        for no in 1..self.nino {
            let cl_id = self.ino_map[no as usize];
            if cl_id == FREE_CLUSTER || cl_id == RESERVED_CLUSTER {
                continue;
            }
            if self.inodes.is_dirty(no) {
                continue;
            }
            *occupancy.entry(cl_id).or_insert(0) += 1;
        }
        occupancy
    }

    fn check_occupancy(&self, occupancy: &HashMap<ClusterId, i32>, report: &mut Vec<String>) {
        for (cl_id, slot) in self.cl_occupancy.iter().enumerate() {
            let expected = occupancy.get(&(cl_id as ClusterId)).copied().unwrap_or(0);
            if *slot != expected {
                report.push(format!(
                    "cluster {}: occupancy {} but {} live inodes map to it",
                    cl_id, slot, expected
                ));
            }
        }
    }

    /// Clusters referenced from the indirect pointers of live cluster
    /// indirect inodes, grouped by erase block.
    fn count_clin_refs(&mut self) -> FsResult<HashMap<EraseBlockId, u16>> {
        let mut refs: HashMap<EraseBlockId, u16> = HashMap::new();

        let live: Vec<InodeNo> = (1..self.nino)
            .filter(|&no| self.ino_map[no as usize] != FREE_CLUSTER)
            .collect();

        for no in live {
            if self.lookup_no(no).is_err() {
                continue;
            }
            let ino = match self.inodes.get(no) {
                Some(ino) => ino,
                None => continue,
            };
            if ino.tier()? != DataTier::Clin || ino.size == 0 {
                continue;
            }
            let ind_last = ((ino.size - 1) / self.clustersize as u64) as usize;
            let ids: Vec<u32> = (0..=ind_last)
                .map(|i| ino.ind_get(i))
                .filter(|&id| id != 0)
                .collect();
            for id in ids {
                let eb_id = self.eb_of_cluster(id);
                *refs.entry(eb_id).or_insert(0) += 1;
            }
        }
        Ok(refs)
    }

    fn check_eraseblocks(
        &mut self,
        occupancy: &HashMap<ClusterId, i32>,
        report: &mut Vec<String>,
    ) -> FsResult<()> {
        let clin_refs = self.count_clin_refs()?;
        let max_writeops = self.max_writeops();

        for eb_id in 1..self.neraseblocks {
            let entry = self.eb_usage[eb_id as usize];

            if entry.writeops > max_writeops {
                report.push(format!(
                    "erase block {}: writeops {} above the maximum {}",
                    eb_id, entry.writeops, max_writeops
                ));
            }

            let expected = match entry.eb_type {
                EraseBlockType::DentryInode | EraseBlockType::FileInode => {
                    // Clusters with at least one live inode.
                    (0..self.cl_per_eb())
                        .filter(|i| {
                            let cl_id = eb_id * self.cl_per_eb() + i;
                            occupancy.get(&cl_id).copied().unwrap_or(0) > 0
                        })
                        .count() as u16
                }
                EraseBlockType::DentryClin | EraseBlockType::FileClin => {
                    clin_refs.get(&eb_id).copied().unwrap_or(0)
                }
                _ => continue,
            };

            if entry.cvalid != expected {
                report.push(format!(
                    "erase block {} ({:?}): cvalid {} but {} clusters are live",
                    eb_id, entry.eb_type, entry.cvalid, expected
                ));
            }
        }
        Ok(())
    }

    fn check_reserve(&self, report: &mut Vec<String>) {
        let empty = self.empty_eraseblk_count();
        if empty < self.nerasereserve {
            report.push(format!(
                "empty erase block pool {} below the reserve {}",
                empty, self.nerasereserve
            ));
        }
    }
}
