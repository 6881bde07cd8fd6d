//! Three-tier file data engine
//!
//! File content is encoded in one of three tiers selected by file size:
//! embedded in the inode's own cluster, behind an array of indirect
//! cluster pointers, or behind an array of indirect erase block pointers.
//! Writes and truncates move files between tiers; an indirect pointer of
//! zero denotes a file hole.

use std::cmp::min;
use std::mem;

use log::debug;

use crate::backend::{read_raw, write_raw};
use crate::error::{FsError, FsResult};
use crate::fs::Ffsp;
use crate::inode::Inode;
use crate::layout::{DataTier, EraseBlockType, Timespec};
use crate::{ClusterId, InodeNo};

impl Ffsp {
    /// Largest file that still fits into the inode's embedded region.
    pub fn max_emb_size(&self) -> u64 {
        (self.clustersize as usize - crate::layout::INODE_SIZE) as u64
    }

    /// Largest cluster indirect file: number of possible pointers times
    /// the size of an indirect cluster.
    pub fn max_clin_size(&self) -> u64 {
        self.max_emb_size() / 4 * self.clustersize as u64
    }

    /// Largest erase block indirect file: number of possible pointers
    /// times the size of an indirect erase block.
    pub fn max_ebin_size(&self) -> u64 {
        self.max_emb_size() / 4 * self.erasesize as u64
    }
}

fn is_buf_empty(buf: &[u8]) -> bool {
    buf.iter().all(|&b| b == 0)
}

fn ind_from_offset(offset: u64, ind_size: u32) -> usize {
    (offset / ind_size as u64) as usize
}

/// Size of one indirect unit for a file of the given size; zero while the
/// file still fits into the embedded region.
fn ind_size_from_size(fs: &Ffsp, size: u64) -> u32 {
    if size > fs.max_clin_size() {
        fs.erasesize
    } else if size > fs.max_emb_size() {
        fs.clustersize
    } else {
        0
    }
}

fn tier_from_size(fs: &Ffsp, size: u64) -> DataTier {
    if size > fs.max_clin_size() {
        DataTier::Ebin
    } else if size > fs.max_emb_size() {
        DataTier::Clin
    } else {
        DataTier::Emb
    }
}

/// State threaded through one write or truncate request.
struct WriteCtx<'a> {
    /// Remaining payload; empty for truncation.
    data: &'a [u8],
    /// Byte offset of the request (the new length for truncation).
    offset: u64,
    ino_no: InodeNo,
    is_dir: bool,
    old_size: u64,
    new_size: u64,
    old_ind_size: u32,
    new_ind_size: u32,
    old_tier: DataTier,
    new_tier: DataTier,
}

/// Write one indirect unit. An all-zero payload becomes a file hole
/// instead of consuming storage. Returns the new unit id (0 for a hole).
fn write_ind(
    fs: &mut Ffsp,
    ino_no: InodeNo,
    is_dir: bool,
    tier: DataTier,
    payload: &[u8],
) -> FsResult<ClusterId> {
    if is_buf_empty(payload) {
        return Ok(0);
    }
    let eb_type = fs.eraseblk_type_for(tier, is_dir);

    let (eb_id, unit_id) = fs.find_writable_cluster(eb_type).map_err(|e| {
        debug!("failed to find writable cluster or erase block");
        e
    })?;

    let offset = unit_id as u64 * payload.len() as u64;
    write_raw(&mut *fs.backend, payload, offset)?;
    fs.metrics.add_write_raw(payload.len() as u64);

    // May internally finalize the erase block by writing its summary.
    fs.commit_write(eb_type, eb_id, ino_no)?;
    Ok(unit_id)
}

/// Invalidate indirect pointers that no longer carry live data. Cluster
/// pointers bleed value out of their erase block; erase block pointers
/// release the whole erase block.
pub(crate) fn invalidate_ind_ptr(fs: &mut Ffsp, ids: &[u32], tier: DataTier) {
    for &id in ids {
        if id == 0 {
            continue; // file hole, not a real indirect pointer
        }
        match tier {
            DataTier::Clin => {
                let eb_id = fs.eb_of_cluster(id);
                fs.eb_dec_cvalid(eb_id);
            }
            DataTier::Ebin => {
                fs.eb_usage[id as usize].eb_type = EraseBlockType::Empty;
            }
            DataTier::Emb => {}
        }
    }
}

// ============================================================================
// Reads
// ============================================================================

fn read_emb(ino: &Inode, buf: &mut [u8], offset: u64) -> usize {
    let count = min(buf.len() as u64, ino.size - offset) as usize;
    let off = offset as usize;
    buf[..count].copy_from_slice(&ino.data[off..off + count]);
    count
}

fn read_ind(
    fs: &Ffsp,
    ino: &Inode,
    buf: &mut [u8],
    offset: u64,
    ind_size: u32,
) -> FsResult<usize> {
    // Never read more than there is available.
    let count = min(buf.len() as u64, ino.size - offset) as usize;

    let mut ind_index = ind_from_offset(offset, ind_size);
    let mut ind_offset = (offset % ind_size as u64) as usize;
    let mut done = 0usize;

    while done < count {
        let ind_left = min(count - done, ind_size as usize - ind_offset);
        let id = ino.ind_get(ind_index);

        if id == 0 {
            // File hole.
            buf[done..done + ind_left].fill(0);
        } else {
            let off = id as u64 * ind_size as u64 + ind_offset as u64;
            read_raw(&*fs.backend, &mut buf[done..done + ind_left], off)?;
            fs.metrics.add_read_raw(ind_left as u64);
        }
        done += ind_left;
        ind_offset = 0;
        ind_index += 1;
    }
    Ok(count)
}

/// Read file content, clamped to the file size. Reads do not update the
/// access time.
pub fn read(fs: &Ffsp, ino: &Inode, buf: &mut [u8], offset: u64) -> FsResult<usize> {
    if buf.is_empty() {
        return Ok(0);
    }
    if offset >= ino.size {
        debug!("read(off={}): beyond end of file", offset);
        return Ok(0);
    }

    match ino.tier()? {
        DataTier::Emb => Ok(read_emb(ino, buf, offset)),
        DataTier::Clin => read_ind(fs, ino, buf, offset, fs.clustersize),
        DataTier::Ebin => read_ind(fs, ino, buf, offset, fs.erasesize),
    }
}

// ============================================================================
// Tier transitions
// ============================================================================

/// Promote embedded data: `payload` (the old embedded bytes, possibly
/// already carrying the head of the write) becomes the first indirect
/// unit; the remaining slots up to the new end are reserved as holes.
fn trunc_emb2ind(fs: &mut Ffsp, ino: &mut Inode, ctx: &WriteCtx, payload: &[u8]) -> FsResult<()> {
    let id = write_ind(fs, ctx.ino_no, ctx.is_dir, ctx.new_tier, payload)?;
    ino.ind_set(0, id);

    let ind_last = ind_from_offset(ctx.new_size - 1, ctx.new_ind_size);
    for i in 1..=ind_last {
        ino.ind_set(i, 0);
    }
    ino.change_tier(ctx.old_tier, ctx.new_tier);
    Ok(())
}

/// Shrink an indirect file back into the embedded region. All indirect
/// pointers are invalidated; the erase block summary keeps its stale
/// references since readers detect them through the inode.
fn trunc_ind2emb(
    fs: &mut Ffsp,
    ino: &mut Inode,
    ctx: &WriteCtx,
    scratch: &mut [u8],
) -> FsResult<()> {
    let count = ctx.new_size as usize;
    read_ind(fs, ino, &mut scratch[..count], 0, ctx.old_ind_size)?;

    let ind_last = ind_from_offset(ctx.old_size.saturating_sub(1), ctx.old_ind_size);
    let old_ids: Vec<u32> = (0..=ind_last).map(|i| ino.ind_get(i)).collect();
    invalidate_ind_ptr(fs, &old_ids, ctx.old_tier);

    ino.data[..count].copy_from_slice(&scratch[..count]);
    ino.change_tier(ctx.old_tier, ctx.new_tier);
    Ok(())
}

/// Promote a cluster indirect file to erase block indirect: each
/// erasesize-sized run of the old tier is rewritten as one indirect erase
/// block, the short tail zero-padded.
fn trunc_clin2ebin(
    fs: &mut Ffsp,
    ino: &mut Inode,
    ctx: &WriteCtx,
    scratch: &mut [u8],
) -> FsResult<()> {
    let es = fs.erasesize as usize;
    let old_cnt = ind_from_offset(ctx.old_size - 1, fs.clustersize) + 1;
    let old_ids: Vec<u32> = (0..old_cnt).map(|i| ino.ind_get(i)).collect();

    let mut new_ids: Vec<u32> = Vec::new();
    let mut written: u64 = 0;
    while written < ctx.old_size {
        let n = read_ind(fs, ino, &mut scratch[..es], written, fs.clustersize)?;
        if n < es {
            // Short tail; zero out the rest of the erase block.
            scratch[n..es].fill(0);
        }

        match write_ind(fs, ctx.ino_no, ctx.is_dir, DataTier::Ebin, &scratch[..es]) {
            Ok(id) => new_ids.push(id),
            Err(e) => {
                // Roll the newly allocated erase blocks back; the inode's
                // old cluster pointers are still untouched.
                invalidate_ind_ptr(fs, &new_ids, DataTier::Ebin);
                return Err(e);
            }
        }
        written += n as u64;
    }
    invalidate_ind_ptr(fs, &old_ids, DataTier::Clin);

    for (i, &id) in new_ids.iter().enumerate() {
        ino.ind_set(i, id);
    }
    let ind_first = new_ids.len().saturating_sub(1);
    let ind_last = ind_from_offset(ctx.new_size - 1, fs.erasesize);
    for i in ind_first + 1..=ind_last {
        ino.ind_set(i, 0);
    }
    ino.change_tier(DataTier::Clin, DataTier::Ebin);
    Ok(())
}

/// Demote an erase block indirect file to cluster indirect after a shrink
/// below the cluster indirect limit: surviving content is rewritten in
/// cluster units and the old indirect erase blocks are released.
fn trunc_ebin2clin(
    fs: &mut Ffsp,
    ino: &mut Inode,
    ctx: &WriteCtx,
    scratch: &mut [u8],
) -> FsResult<()> {
    let cs = fs.clustersize as usize;
    let old_cnt = ind_from_offset(ctx.old_size - 1, fs.erasesize) + 1;
    let old_ids: Vec<u32> = (0..old_cnt).map(|i| ino.ind_get(i)).collect();

    let mut new_ids: Vec<u32> = Vec::new();
    let mut moved: u64 = 0;
    while moved < ctx.new_size {
        let want = min(cs as u64, ctx.new_size - moved) as usize;
        let n = read_ind(fs, ino, &mut scratch[..want], moved, fs.erasesize)?;
        if n < cs {
            scratch[n..cs].fill(0);
        }

        match write_ind(fs, ctx.ino_no, ctx.is_dir, DataTier::Clin, &scratch[..cs]) {
            Ok(id) => new_ids.push(id),
            Err(e) => {
                invalidate_ind_ptr(fs, &new_ids, DataTier::Clin);
                return Err(e);
            }
        }
        moved += n as u64;
    }
    invalidate_ind_ptr(fs, &old_ids, DataTier::Ebin);

    for (i, &id) in new_ids.iter().enumerate() {
        ino.ind_set(i, id);
    }
    ino.change_tier(DataTier::Ebin, DataTier::Clin);
    Ok(())
}

/// Same-tier truncate: shrinking invalidates the pointers past the new
/// end, extending reserves the fresh slots as holes.
fn trunc_ind(fs: &mut Ffsp, ino: &mut Inode, ctx: &WriteCtx) {
    if ctx.new_size < ctx.old_size {
        let ind_first = ind_from_offset(ctx.new_size.saturating_sub(1), ctx.new_ind_size);
        let ind_last = ind_from_offset(ctx.old_size - 1, ctx.new_ind_size);

        let ids: Vec<u32> = (ind_first + 1..=ind_last).map(|i| ino.ind_get(i)).collect();
        invalidate_ind_ptr(fs, &ids, ctx.old_tier);
        for i in ind_first + 1..=ind_last {
            ino.ind_set(i, 0);
        }
    } else {
        let ind_first = ind_from_offset(ctx.old_size.saturating_sub(1), ctx.new_ind_size);
        let ind_last = ind_from_offset(ctx.new_size - 1, ctx.new_ind_size);
        for i in ind_first + 1..=ind_last {
            ino.ind_set(i, 0);
        }
    }
}

fn trunc_clin(fs: &mut Ffsp, ino: &mut Inode, ctx: &WriteCtx, scratch: &mut [u8]) -> FsResult<()> {
    match ctx.new_tier {
        DataTier::Ebin => trunc_clin2ebin(fs, ino, ctx, scratch),
        DataTier::Emb => trunc_ind2emb(fs, ino, ctx, scratch),
        DataTier::Clin => {
            trunc_ind(fs, ino, ctx);
            Ok(())
        }
    }
}

fn trunc_ebin(fs: &mut Ffsp, ino: &mut Inode, ctx: &WriteCtx, scratch: &mut [u8]) -> FsResult<()> {
    match ctx.new_tier {
        DataTier::Emb => trunc_ind2emb(fs, ino, ctx, scratch),
        DataTier::Clin => trunc_ebin2clin(fs, ino, ctx, scratch),
        DataTier::Ebin => {
            trunc_ind(fs, ino, ctx);
            Ok(())
        }
    }
}

// ============================================================================
// Writes
// ============================================================================

/// Write into an embedded file. Small requests stay embedded; anything
/// pushing the file over the embedded limit moves the old content into
/// the first indirect unit and continues unit by unit.
fn write_emb(
    fs: &mut Ffsp,
    ino: &mut Inode,
    ctx: &mut WriteCtx,
    scratch: &mut [u8],
) -> FsResult<usize> {
    if ctx.new_ind_size == 0 {
        // The request takes place inside the embedded region only.
        if ctx.new_size > ctx.old_size {
            // Growth first; the gap between old end and write offset
            // reads back as zeros.
            ino.data[ctx.old_size as usize..ctx.new_size as usize].fill(0);
        }
        let off = ctx.offset as usize;
        ino.data[off..off + ctx.data.len()].copy_from_slice(ctx.data);
        return Ok(ctx.data.len());
    }

    let count = ctx.data.len();
    let unit = ctx.new_ind_size as usize;

    // The embedded bytes move into a scratch unit; they will become the
    // first indirect unit of the grown file.
    scratch[..ctx.old_size as usize].copy_from_slice(&ino.data[..ctx.old_size as usize]);
    scratch[ctx.old_size as usize..unit].fill(0);

    let mut ind_index = ind_from_offset(ctx.offset, ctx.new_ind_size);
    let mut ind_offset = (ctx.offset % ctx.new_ind_size as u64) as usize;

    if ind_index == 0 {
        // The request starts inside the to-be-promoted unit; apply that
        // part before the unit moves out.
        let n = min(ctx.data.len(), unit - ind_offset);
        scratch[ind_offset..ind_offset + n].copy_from_slice(&ctx.data[..n]);
        ctx.data = &ctx.data[n..];
        ind_offset = 0;
        ind_index = 1;
    }

    trunc_emb2ind(fs, ino, ctx, &scratch[..unit])?;

    while !ctx.data.is_empty() {
        let n = min(ctx.data.len(), unit - ind_offset);
        scratch[..ind_offset].fill(0);
        scratch[ind_offset..ind_offset + n].copy_from_slice(&ctx.data[..n]);
        scratch[ind_offset + n..unit].fill(0);

        let id = write_ind(fs, ctx.ino_no, ctx.is_dir, ctx.new_tier, &scratch[..unit])?;
        ino.ind_set(ind_index, id);

        ind_index += 1;
        ctx.data = &ctx.data[n..];
        ind_offset = 0;
    }
    Ok(count)
}

/// Write into a cluster indirect file. Partial units are read, modified
/// and rewritten out-of-place; the replaced cluster is invalidated in its
/// erase block either way.
fn write_clin(
    fs: &mut Ffsp,
    ino: &mut Inode,
    ctx: &mut WriteCtx,
    scratch: &mut [u8],
) -> FsResult<usize> {
    let count = ctx.data.len();
    let unit = ctx.new_ind_size as usize;

    let mut ind_index = ind_from_offset(ctx.offset, ctx.new_ind_size);
    let mut ind_offset = (ctx.offset % ctx.new_ind_size as u64) as usize;

    while !ctx.data.is_empty() {
        let n = min(ctx.data.len(), unit - ind_offset);
        let old_id = ino.ind_get(ind_index);

        if n < unit && old_id != 0 {
            // Partial write into an existing cluster: read-modify-write.
            let off = old_id as u64 * unit as u64;
            read_raw(&*fs.backend, &mut scratch[..unit], off)?;
            fs.metrics.add_read_raw(unit as u64);
        } else {
            scratch[..ind_offset].fill(0);
            scratch[ind_offset + n..unit].fill(0);
        }
        scratch[ind_offset..ind_offset + n].copy_from_slice(&ctx.data[..n]);

        let id = write_ind(fs, ctx.ino_no, ctx.is_dir, DataTier::Clin, &scratch[..unit])?;
        ino.ind_set(ind_index, id);

        if old_id != 0 {
            // The replaced cluster is stale now.
            let eb_id = fs.eb_of_cluster(old_id);
            fs.eb_dec_cvalid(eb_id);
        }

        ind_index += 1;
        ctx.data = &ctx.data[n..];
        ind_offset = 0;
    }
    Ok(count)
}

/// Write into an erase block indirect file. Partial writes go in place
/// cluster by cluster inside the existing indirect erase block; whole
/// units (or holes) get a freshly allocated erase block, releasing the
/// replaced one.
fn write_ebin(
    fs: &mut Ffsp,
    ino: &mut Inode,
    ctx: &mut WriteCtx,
    scratch: &mut [u8],
) -> FsResult<usize> {
    let count = ctx.data.len();
    let unit = ctx.new_ind_size as usize;
    let cs = fs.clustersize as usize;

    let mut eb_index = ind_from_offset(ctx.offset, ctx.new_ind_size);
    let mut eb_offset = (ctx.offset % ctx.new_ind_size as u64) as usize;

    while !ctx.data.is_empty() {
        let eb_left = min(ctx.data.len(), unit - eb_offset);
        let old_id = ino.ind_get(eb_index);

        if eb_left < unit && old_id != 0 {
            // Overwrite in place, in cluster-sized chunks.
            let mut cl_count = eb_left;
            let mut cl_index = eb_offset / cs;
            let mut cl_offset = eb_offset % cs;
            let mut consumed = 0usize;

            while cl_count > 0 {
                let cl_left = min(cl_count, cs - cl_offset);
                let off = old_id as u64 * unit as u64 + (cl_index * cs) as u64;

                if cl_left < cs {
                    // Not cluster aligned; read the cluster to write it
                    // back whole.
                    read_raw(&*fs.backend, &mut scratch[..cs], off)?;
                    fs.metrics.add_read_raw(cs as u64);
                } else {
                    scratch[..cl_offset].fill(0);
                }
                scratch[cl_offset..cl_offset + cl_left]
                    .copy_from_slice(&ctx.data[consumed..consumed + cl_left]);

                write_raw(&mut *fs.backend, &scratch[..cs], off)?;
                fs.metrics.add_write_raw(cs as u64);

                consumed += cl_left;
                cl_count -= cl_left;
                cl_index += 1;
                cl_offset = 0;
            }
            ctx.data = &ctx.data[consumed..];
        } else {
            // The slot is empty or completely overwritten: write a fresh
            // indirect erase block.
            scratch[..eb_offset].fill(0);
            scratch[eb_offset..eb_offset + eb_left].copy_from_slice(&ctx.data[..eb_left]);
            scratch[eb_offset + eb_left..unit].fill(0);

            let id = write_ind(fs, ctx.ino_no, ctx.is_dir, DataTier::Ebin, &scratch[..unit])?;
            ino.ind_set(eb_index, id);

            if old_id != 0 {
                // A whole-unit overwrite releases the old erase block.
                fs.eb_usage[old_id as usize].eb_type = EraseBlockType::Empty;
            }
            ctx.data = &ctx.data[eb_left..];
        }
        eb_index += 1;
        eb_offset = 0;
    }
    Ok(count)
}

fn write_inner(
    fs: &mut Ffsp,
    ino: &mut Inode,
    data: &[u8],
    offset: u64,
    new_size: u64,
    scratch: &mut [u8],
) -> FsResult<usize> {
    let old_tier = ino.tier()?;
    let old_size = ino.size;
    let mut ctx = WriteCtx {
        data,
        offset,
        ino_no: ino.no,
        is_dir: ino.is_dir(),
        old_size,
        new_size,
        old_ind_size: ind_size_from_size(fs, old_size),
        new_ind_size: ind_size_from_size(fs, new_size),
        old_tier,
        new_tier: tier_from_size(fs, new_size),
    };

    match old_tier {
        DataTier::Emb => write_emb(fs, ino, &mut ctx, scratch),
        DataTier::Clin => {
            if ctx.new_tier == DataTier::Ebin {
                // The write grows the file across the cluster indirect
                // limit; convert first, then perform the write over the
                // erase block indirect encoding.
                trunc_clin2ebin(fs, ino, &ctx, scratch)?;
                write_ebin(fs, ino, &mut ctx, scratch)
            } else {
                if ctx.new_size > ctx.old_size {
                    trunc_ind(fs, ino, &ctx);
                }
                write_clin(fs, ino, &mut ctx, scratch)
            }
        }
        DataTier::Ebin => {
            if ctx.new_size > ctx.old_size {
                trunc_ind(fs, ino, &ctx);
            }
            write_ebin(fs, ino, &mut ctx, scratch)
        }
    }
}

/// Write file content at the given offset. The inode's size, tier and
/// modification time are updated; the caller is responsible for dirty
/// tracking and flushing.
pub fn write(fs: &mut Ffsp, ino: &mut Inode, buf: &[u8], offset: u64) -> FsResult<usize> {
    if buf.is_empty() {
        return Ok(0);
    }
    let end = offset
        .checked_add(buf.len() as u64)
        .ok_or(FsError::Overflow)?;
    let new_size = ino.size.max(end);
    if new_size > fs.max_ebin_size() {
        return Err(FsError::TooLarge);
    }

    let mut scratch = mem::take(&mut fs.buf);
    let res = write_inner(fs, ino, buf, offset, new_size, &mut scratch);
    fs.buf = scratch;
    let count = res?;

    ino.size = new_size;
    ino.mtime = Timespec::now();
    Ok(count)
}

fn trunc_inner(fs: &mut Ffsp, ino: &mut Inode, length: u64, scratch: &mut [u8]) -> FsResult<()> {
    let old_tier = ino.tier()?;
    let old_size = ino.size;
    let mut ctx = WriteCtx {
        data: &[],
        offset: length,
        ino_no: ino.no,
        is_dir: ino.is_dir(),
        old_size,
        new_size: length,
        old_ind_size: ind_size_from_size(fs, old_size),
        new_ind_size: ind_size_from_size(fs, length),
        old_tier,
        new_tier: tier_from_size(fs, length),
    };

    match old_tier {
        DataTier::Emb => write_emb(fs, ino, &mut ctx, scratch).map(|_| ()),
        DataTier::Clin => trunc_clin(fs, ino, &ctx, scratch),
        DataTier::Ebin => trunc_ebin(fs, ino, &ctx, scratch),
    }
}

/// Truncate to the given length. Shrinking converts down across tier
/// boundaries and invalidates freed pointers; extending reserves holes
/// and never zeroes existing content beyond the old size itself.
pub fn truncate(fs: &mut Ffsp, ino: &mut Inode, length: u64) -> FsResult<()> {
    if length > fs.max_ebin_size() {
        return Err(FsError::TooLarge);
    }
    if length == ino.size {
        return Ok(());
    }

    let mut scratch = mem::take(&mut fs.buf);
    let res = trunc_inner(fs, ino, length, &mut scratch);
    fs.buf = scratch;
    res?;

    ino.size = length;
    let now = Timespec::now();
    ino.ctime = now;
    ino.mtime = now;
    Ok(())
}
