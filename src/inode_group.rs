//! Inode group packing
//!
//! Dirty inodes of one category are packed greedily into clusters: the
//! packer fills a cluster with variably sized inode records in iteration
//! order until the next one would overflow, then writes the cluster in one
//! cluster-aligned request. Reading a group re-parses the same encoding;
//! a record is valid iff the inode map points back at the cluster it was
//! read from.

use log::debug;

use crate::backend::{read_raw, write_raw};
use crate::error::FsResult;
use crate::fs::Ffsp;
use crate::inode::Inode;
use crate::layout::DataTier;
use crate::ClusterId;

/// Check whether an inode record read from `cl_id` is live: its number is
/// in range and the inode map still points at this cluster.
fn is_inode_valid(fs: &Ffsp, cl_id: ClusterId, ino: &Inode) -> bool {
    ino.no < fs.nino && fs.ino_map[ino.no as usize] == cl_id
}

/// Read all valid inodes from the given cluster.
pub(crate) fn read_inode_group(fs: &Ffsp, cl_id: ClusterId) -> FsResult<Vec<Box<Inode>>> {
    let cs = fs.clustersize as usize;
    let mut buf = vec![0u8; cs];
    read_raw(&*fs.backend, &mut buf, cl_id as u64 * cs as u64)?;
    fs.metrics.add_read_raw(cs as u64);

    let mut inodes = Vec::new();
    let mut off = 0usize;
    while let Some((ino, stored)) = Inode::decode(&buf, off, fs.clustersize, fs.erasesize) {
        if is_inode_valid(fs, cl_id, &ino) {
            inodes.push(Box::new(ino));
        }
        off += stored;
    }
    Ok(inodes)
}

/// Pick inodes that fit into one cluster together. Grouped entries are
/// taken out of `inodes`; the group is returned in iteration order.
fn get_inode_group(fs: &Ffsp, inodes: &mut [Option<Box<Inode>>]) -> Vec<Box<Inode>> {
    let cs = fs.clustersize as usize;
    let mut group = Vec::new();
    let mut group_size = 0usize;

    for slot in inodes.iter_mut() {
        let size = match slot.as_ref() {
            Some(ino) => ino.stored_size(fs.clustersize, fs.erasesize),
            None => continue,
        };
        if size > cs - group_size {
            // No more room inside the cluster for additional inodes.
            break;
        }
        if let Some(ino) = slot.take() {
            group.push(ino);
            group_size += size;
        }
    }
    group
}

/// Concatenate the group into the cluster buffer starting at offset 0;
/// unused trailing bytes stay zero.
fn group_inodes(fs: &Ffsp, group: &[Box<Inode>], cl_buf: &mut [u8]) {
    let mut filling = 0usize;
    for ino in group {
        let size = ino.stored_size(fs.clustersize, fs.erasesize);
        ino.encode(cl_buf, filling, fs.clustersize, fs.erasesize);
        filling += size;
    }
    cl_buf[filling..].fill(0);
}

/// Pack the given dirty inodes into clusters, write each cluster and
/// update the inode map, the cluster occupancy counts and the dirty set.
/// The caller owns the inode boxes and reinserts them into the cache.
pub(crate) fn write_inodes(fs: &mut Ffsp, inodes: &mut Vec<Box<Inode>>) -> FsResult<()> {
    if inodes.is_empty() {
        return Ok(());
    }

    // Needed to pick the erase block type; directory and file inodes may
    // live in different erase blocks.
    let is_dir = inodes[0].is_dir();
    let cs = fs.clustersize as usize;

    let mut slots: Vec<Option<Box<Inode>>> = inodes.drain(..).map(Some).collect();
    let mut cl_buf = vec![0u8; cs];

    loop {
        let group = get_inode_group(fs, &mut slots);
        if group.is_empty() {
            break;
        }

        let eb_type = fs.eraseblk_type_for(DataTier::Emb, is_dir);
        let (eb_id, cl_id) = match fs.find_writable_cluster(eb_type) {
            Ok(pair) => pair,
            Err(e) => {
                debug!("failed to find writable cluster or erase block");
                inodes.extend(group);
                inodes.extend(slots.into_iter().flatten());
                return Err(e);
            }
        };

        group_inodes(fs, &group, &mut cl_buf);
        if let Err(e) = write_raw(&mut *fs.backend, &cl_buf, cl_id as u64 * cs as u64) {
            inodes.extend(group);
            inodes.extend(slots.into_iter().flatten());
            return Err(e);
        }
        fs.metrics.add_write_raw(cs as u64);

        // Inode erase blocks carry no trailing summary; the inode number
        // argument is ignored for them.
        fs.commit_write(eb_type, eb_id, 0)?;

        for ino in group {
            fs.ino_map[ino.no as usize] = cl_id;
            fs.cl_occupancy[cl_id as usize] += 1;
            fs.reset_dirty(ino.no);
            inodes.push(ino);
        }
    }

    inodes.extend(slots.into_iter().flatten());
    Ok(())
}
