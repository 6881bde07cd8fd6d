//! Resident inode cache and dirty tracking
//!
//! Inodes that have been looked up from the medium are kept resident in a
//! dense slot array indexed by inode number. A bitset with one bit per
//! possible inode number tracks which cached inodes differ from their
//! on-medium copy; a counter mirrors the bitset's population count.

use crate::inode::Inode;
use crate::InodeNo;

/// Resident inodes keyed by inode number plus the dirty-inode bitset.
pub struct InodeCache {
    slots: Vec<Option<Box<Inode>>>,
    dirty: Vec<u64>,
    dirty_cnt: u32,
    valid: u32,
}

impl InodeCache {
    /// Create a cache with `nino` slots. Slot 0 is never occupied.
    pub fn new(nino: u32) -> Self {
        InodeCache {
            slots: (0..nino).map(|_| None).collect(),
            dirty: vec![0u64; (nino as usize + 63) / 64],
            dirty_cnt: 0,
            valid: 0,
        }
    }

    pub fn contains(&self, no: InodeNo) -> bool {
        self.slots
            .get(no as usize)
            .map(|s| s.is_some())
            .unwrap_or(false)
    }

    pub fn get(&self, no: InodeNo) -> Option<&Inode> {
        self.slots.get(no as usize)?.as_deref()
    }

    pub fn get_mut(&mut self, no: InodeNo) -> Option<&mut Inode> {
        self.slots.get_mut(no as usize)?.as_deref_mut()
    }

    /// Insert a fetched or newly created inode.
    pub fn insert(&mut self, ino: Box<Inode>) {
        let no = ino.no as usize;
        if self.slots[no].is_none() {
            self.valid += 1;
        }
        self.slots[no] = Some(ino);
    }

    /// Detach the inode so an operation can mutate it alongside the rest
    /// of the mount state. The caller reinserts it afterwards.
    pub fn take(&mut self, no: InodeNo) -> Option<Box<Inode>> {
        let slot = self.slots.get_mut(no as usize)?;
        let ino = slot.take();
        if ino.is_some() {
            self.valid -= 1;
        }
        ino
    }

    /// Remove an inode for good (unlink/rmdir/unmount).
    pub fn remove(&mut self, no: InodeNo) -> Option<Box<Inode>> {
        self.take(no)
    }

    pub fn entry_count(&self) -> u32 {
        self.valid
    }

    /// Detach every cached inode (unmount path).
    pub fn drain(&mut self) -> Vec<Box<Inode>> {
        self.valid = 0;
        self.slots.iter_mut().filter_map(|s| s.take()).collect()
    }

    // ------------------------------------------------------------------
    // Dirty bitset
    // ------------------------------------------------------------------

    pub fn is_dirty(&self, no: InodeNo) -> bool {
        let word = self.dirty[no as usize / 64];
        word & (1u64 << (no % 64)) != 0
    }

    /// Set the dirty bit. Returns false if the bit was already set.
    pub fn set_dirty(&mut self, no: InodeNo) -> bool {
        if self.is_dirty(no) {
            return false;
        }
        self.dirty[no as usize / 64] |= 1u64 << (no % 64);
        self.dirty_cnt += 1;
        true
    }

    /// Clear the dirty bit. Returns false if the bit was already clear.
    pub fn clear_dirty(&mut self, no: InodeNo) -> bool {
        if !self.is_dirty(no) {
            return false;
        }
        self.dirty[no as usize / 64] &= !(1u64 << (no % 64));
        self.dirty_cnt -= 1;
        true
    }

    pub fn dirty_count(&self) -> u32 {
        self.dirty_cnt
    }

    /// Detach all dirty inodes of one category (directories or files).
    /// The dirty bits stay set; they are cleared once the inodes have
    /// been persisted.
    pub fn take_dirty(&mut self, dirs: bool) -> Vec<Box<Inode>> {
        let mut out = Vec::new();
        for no in 0..self.slots.len() as u32 {
            if !self.is_dirty(no) {
                continue;
            }
            let is_dir = match self.get(no) {
                Some(ino) => ino.is_dir(),
                None => continue,
            };
            if is_dir == dirs {
                if let Some(ino) = self.take(no) {
                    out.push(ino);
                }
            }
        }
        out
    }
}
