//! Bitmap Allocator: in-memory free/used bitmap persisted to `bitmap.yfs`.
//!
//! On-disk layout:
//! ```text
//! [0..8)   total_blocks, little-endian u64
//! [8..)    bitmap bytes; bit i of byte b is block position 8*b + i (0-based)
//! ```
//! A cleared bit means free, a set bit means used. Block IDs handed to
//! callers are always 1-based; bit position `p` corresponds to block ID
//! `p + 1`.

use std::fs;
use std::path::Path;

use log::debug;

use crate::error::{Result, YfsError};

/// Number of bytes appended to the bitmap (and blocks to capacity) each time
/// the allocator grows to satisfy a single-block request.
const GROWTH_BYTES: usize = 1024;
const GROWTH_BLOCKS: u64 = GROWTH_BYTES as u64 * 8;

pub struct Bitmap {
    bytes: Vec<u8>,
    total_blocks: u64,
    search_pos: u64,
    dirty: bool,
}

impl Bitmap {
    /// Build a fresh bitmap with the given initial capacity, all blocks
    /// free.
    pub fn new(total_blocks: u64) -> Self {
        let byte_len = total_blocks.div_ceil(8) as usize;
        Self {
            bytes: vec![0u8; byte_len],
            total_blocks,
            search_pos: 0,
            dirty: true,
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read(path)?;
        if raw.len() < 8 {
            return Err(YfsError::CorruptChain(
                "bitmap.yfs shorter than its 8-byte header".into(),
            ));
        }
        let total_blocks = u64::from_le_bytes(raw[..8].try_into().unwrap());
        let bytes = raw[8..].to_vec();
        Ok(Self {
            bytes,
            total_blocks,
            search_pos: 0,
            dirty: false,
        })
    }

    pub fn save(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let mut out = Vec::with_capacity(8 + self.bytes.len());
        out.extend_from_slice(&self.total_blocks.to_le_bytes());
        out.extend_from_slice(&self.bytes);
        fs::write(path, out)?;
        self.dirty = false;
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    pub fn search_pos(&self) -> u64 {
        self.search_pos
    }

    /// Reset the allocator's rotating scan hint. Used by `defragment()`.
    pub fn reset_search_pos(&mut self) {
        self.search_pos = 0;
        self.dirty = true;
    }

    pub fn used_blocks(&self) -> u64 {
        (0..self.total_blocks).filter(|&p| self.is_set(p)).count() as u64
    }

    /// 1-based IDs of every block currently marked used. Used by
    /// `verify_integrity`'s leak check, not by the allocator itself.
    pub fn used_block_ids(&self) -> Vec<u32> {
        (0..self.total_blocks)
            .filter(|&p| self.is_set(p))
            .map(|p| p as u32 + 1)
            .collect()
    }

    fn is_set(&self, pos: u64) -> bool {
        let byte = pos / 8;
        let bit = pos % 8;
        self.bytes[byte as usize] & (1 << bit) != 0
    }

    fn set(&mut self, pos: u64) {
        let byte = pos / 8;
        let bit = pos % 8;
        self.bytes[byte as usize] |= 1 << bit;
    }

    fn clear(&mut self, pos: u64) {
        let byte = pos / 8;
        let bit = pos % 8;
        self.bytes[byte as usize] &= !(1 << bit);
    }

    fn grow(&mut self) {
        self.bytes.extend(std::iter::repeat(0u8).take(GROWTH_BYTES));
        self.total_blocks += GROWTH_BLOCKS;
        self.dirty = true;
        debug!(
            "bitmap grew by {GROWTH_BLOCKS} blocks to {} total",
            self.total_blocks
        );
    }

    /// Find and reserve the first free contiguous run of `n` positions
    /// starting the scan at `search_pos`, cyclically. Does not grow.
    fn find_contiguous(&self, n: u64) -> Option<u64> {
        if n == 0 || self.total_blocks == 0 {
            return None;
        }
        let cap = self.total_blocks;
        for offset in 0..cap {
            let start = (self.search_pos + offset) % cap;
            if start + n > cap {
                continue;
            }
            if (start..start + n).all(|p| !self.is_set(p)) {
                return Some(start);
            }
        }
        None
    }

    fn find_one(&self) -> Option<u64> {
        let cap = self.total_blocks;
        for offset in 0..cap {
            let pos = (self.search_pos + offset) % cap;
            if !self.is_set(pos) {
                return Some(pos);
            }
        }
        None
    }

    /// Allocate `n` block IDs (1-based), preferring a single contiguous run
    /// and falling back to scattered single-block allocation. Grows the
    /// bitmap on demand when `n == 1` and nothing is free.
    pub fn allocate(&mut self, n: u32) -> Result<Vec<u32>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let n64 = n as u64;

        if let Some(start) = self.find_contiguous(n64) {
            for p in start..start + n64 {
                self.set(p);
            }
            self.search_pos = start + n64;
            self.dirty = true;
            return Ok((start..start + n64).map(|p| p as u32 + 1).collect());
        }

        if n64 > 1 {
            let mut reserved = Vec::with_capacity(n as usize);
            for _ in 0..n {
                match self.find_one() {
                    Some(pos) => {
                        self.set(pos);
                        self.search_pos = pos + 1;
                        reserved.push(pos as u32 + 1);
                    }
                    None => {
                        // Couldn't satisfy the scattered fallback either;
                        // release what we grabbed and fail. Clearing undoes
                        // every bit this call set, so it leaves `dirty`
                        // exactly as it found it rather than forcing it one
                        // way or the other.
                        for id in &reserved {
                            self.clear(*id as u64 - 1);
                        }
                        return Err(YfsError::CapacityExhausted { requested: n });
                    }
                }
            }
            self.dirty = true;
            return Ok(reserved);
        }

        // n == 1 and nothing free: grow once and retry.
        self.grow();
        match self.find_one() {
            Some(pos) => {
                self.set(pos);
                self.search_pos = pos + 1;
                self.dirty = true;
                Ok(vec![pos as u32 + 1])
            }
            None => Err(YfsError::CapacityExhausted { requested: n }),
        }
    }

    /// Free each non-zero block ID. Freeing 0 or an already-free block is a
    /// silent no-op.
    pub fn free(&mut self, ids: &[u32]) {
        for &id in ids {
            if id == 0 {
                continue;
            }
            let pos = id as u64 - 1;
            if pos < self.total_blocks && self.is_set(pos) {
                self.clear(pos);
                self.dirty = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_contiguous_run() {
        let mut bm = Bitmap::new(16);
        let ids = bm.allocate(4).unwrap();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        assert_eq!(bm.used_blocks(), 4);
    }

    #[test]
    fn used_block_ids_matches_allocated_ids() {
        let mut bm = Bitmap::new(16);
        let ids = bm.allocate(4).unwrap();
        assert_eq!(bm.used_block_ids(), ids);
    }

    #[test]
    fn failed_scattered_allocation_leaves_dirty_flag_untouched() {
        let mut bm = Bitmap::new(4);
        bm.allocate(4).unwrap();
        bm.save(tempfile::NamedTempFile::new().unwrap().path()).unwrap();
        assert!(!bm.is_dirty());
        let err = bm.allocate(3).unwrap_err();
        assert!(matches!(err, YfsError::CapacityExhausted { requested: 3 }));
        assert!(!bm.is_dirty());
    }

    #[test]
    fn allocate_then_free_round_trips() {
        let mut bm = Bitmap::new(8);
        let ids = bm.allocate(3).unwrap();
        bm.free(&ids);
        assert_eq!(bm.used_blocks(), 0);
    }

    #[test]
    fn ids_are_distinct_and_in_range() {
        let mut bm = Bitmap::new(64);
        let ids = bm.allocate(10).unwrap();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), ids.len());
        assert!(ids.iter().all(|&id| id >= 1 && (id as u64) <= bm.total_blocks()));
    }

    #[test]
    fn scattered_fallback_when_no_contiguous_run() {
        let mut bm = Bitmap::new(8);
        // Fragment free space: free positions 0,2,4,6 (odd ones used).
        let all = bm.allocate(8).unwrap();
        bm.free(&[all[1], all[3], all[5], all[7]]);
        let ids = bm.allocate(4).unwrap();
        assert_eq!(ids.len(), 4);
        assert_eq!(bm.used_blocks(), 8);
    }

    #[test]
    fn single_block_grows_when_exhausted() {
        let mut bm = Bitmap::new(1);
        let first = bm.allocate(1).unwrap();
        assert_eq!(first, vec![1]);
        let before = bm.total_blocks();
        let second = bm.allocate(1).unwrap();
        assert!(bm.total_blocks() > before);
        assert_ne!(second, first);
    }

    #[test]
    fn exhausted_scattered_allocation_releases_reservations() {
        let mut bm = Bitmap::new(4);
        bm.allocate(4).unwrap(); // fill it up
        let before_used = bm.used_blocks();
        let err = bm.allocate(3).unwrap_err();
        assert!(matches!(err, YfsError::CapacityExhausted { requested: 3 }));
        assert_eq!(bm.used_blocks(), before_used);
    }

    #[test]
    fn save_then_load_round_trips() {
        let mut bm = Bitmap::new(32);
        bm.allocate(5).unwrap();
        let tmp = tempfile::NamedTempFile::new().unwrap();
        bm.save(tmp.path()).unwrap();

        let reloaded = Bitmap::load(tmp.path()).unwrap();
        assert_eq!(reloaded.total_blocks(), bm.total_blocks());
        assert_eq!(reloaded.used_blocks(), bm.used_blocks());
    }
}
