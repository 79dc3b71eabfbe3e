//! Block extents and bitmaps
//!
//! This module provides:
//! - Extents for contiguous block ranges
//! - A one-bit-per-block bitmap used for data-block accounting and for the
//!   per-segment backup bitmaps

use flashkv_common::{Error, Result};

/// An extent represents a contiguous range of blocks
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Extent {
    /// Starting block number
    pub start: u64,
    /// Number of blocks in the extent
    pub length: u64,
}

impl Extent {
    /// Create a new extent
    #[must_use]
    pub const fn new(start: u64, length: u64) -> Self {
        Self { start, length }
    }

    /// Get the ending block number (exclusive)
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.start + self.length
    }

    /// Check if this extent contains a block
    #[must_use]
    pub const fn contains(&self, block: u64) -> bool {
        block >= self.start && block < self.end()
    }

    /// Check if two extents overlap
    #[must_use]
    pub const fn overlaps(&self, other: &Extent) -> bool {
        self.start < other.end() && other.start < self.end()
    }

    /// Try to merge with another extent
    #[must_use]
    pub fn try_merge(&self, other: &Extent) -> Option<Extent> {
        if self.end() == other.start {
            Some(Extent::new(self.start, self.length + other.length))
        } else if other.end() == self.start {
            Some(Extent::new(other.start, self.length + other.length))
        } else {
            None
        }
    }
}

/// Bitmap with one bit per block: 0 = clear, 1 = set
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockBitmap {
    words: Vec<u64>,
    total_blocks: u64,
    set_blocks: u64,
    /// Hint for next free block search
    search_hint: u64,
}

impl BlockBitmap {
    /// Create a bitmap for the given number of blocks (all clear)
    #[must_use]
    pub fn new(total_blocks: u64) -> Self {
        Self {
            words: vec![0u64; total_blocks.div_ceil(64) as usize],
            total_blocks,
            set_blocks: 0,
            search_hint: 0,
        }
    }

    #[inline]
    fn bit(&self, block: u64) -> bool {
        self.words[(block / 64) as usize] & (1 << (block % 64)) != 0
    }

    #[inline]
    fn put(&mut self, block: u64, value: bool) {
        let word = &mut self.words[(block / 64) as usize];
        if value {
            *word |= 1 << (block % 64);
        } else {
            *word &= !(1 << (block % 64));
        }
    }

    fn check_range(&self, extent: &Extent) -> Result<()> {
        if extent.end() > self.total_blocks {
            return Err(Error::Storage(format!(
                "extent end {} out of range (max {})",
                extent.end(),
                self.total_blocks
            )));
        }
        Ok(())
    }

    /// Check if a block is set
    pub fn is_set(&self, block: u64) -> bool {
        block < self.total_blocks && self.bit(block)
    }

    /// Set every block of an extent, returning how many were newly set
    pub fn set_extent(&mut self, extent: &Extent) -> Result<u64> {
        self.check_range(extent)?;
        let mut newly = 0;
        for block in extent.start..extent.end() {
            if !self.bit(block) {
                self.put(block, true);
                newly += 1;
            }
        }
        self.set_blocks += newly;
        Ok(newly)
    }

    /// Clear an extent whose blocks must all be set
    ///
    /// Clearing a block that is not set would drive the count negative, so
    /// the whole extent is refused.
    pub fn clear_extent(&mut self, extent: &Extent) -> Result<()> {
        self.check_range(extent)?;
        if let Some(block) = (extent.start..extent.end()).find(|&b| !self.bit(b)) {
            return Err(Error::internal(format!(
                "block {block} freed while not allocated"
            )));
        }
        for block in extent.start..extent.end() {
            self.put(block, false);
        }
        self.set_blocks -= extent.length;
        if extent.start < self.search_hint {
            self.search_hint = extent.start;
        }
        Ok(())
    }

    /// Find and set a contiguous run of clear blocks
    pub fn allocate_extent(&mut self, count: u64) -> Option<Extent> {
        if count == 0 {
            return None;
        }
        let hint = self.search_hint;
        let found = self
            .find_clear_run(hint, self.total_blocks, count)
            .or_else(|| self.find_clear_run(0, hint, count))?;
        for block in found.start..found.end() {
            self.put(block, true);
        }
        self.set_blocks += count;
        self.search_hint = found.end();
        Some(found)
    }

    fn find_clear_run(&self, start: u64, end: u64, count: u64) -> Option<Extent> {
        let mut run_start = start;
        let mut run_len = 0u64;
        for block in start..end.min(self.total_blocks) {
            if self.bit(block) {
                run_start = block + 1;
                run_len = 0;
            } else {
                run_len += 1;
                if run_len >= count {
                    return Some(Extent::new(run_start, count));
                }
            }
        }
        None
    }

    /// Set every bit that is set in `other`
    pub fn union_with(&mut self, other: &BlockBitmap) {
        for (word, theirs) in self.words.iter_mut().zip(&other.words) {
            *word |= theirs;
        }
        self.set_blocks = self.words.iter().map(|w| u64::from(w.count_ones())).sum();
    }

    /// Clear the whole bitmap
    pub fn clear_all(&mut self) {
        self.words.fill(0);
        self.set_blocks = 0;
        self.search_hint = 0;
    }

    /// Maximal runs of set blocks, in block order
    pub fn extents(&self) -> Vec<Extent> {
        let mut out: Vec<Extent> = Vec::new();
        for block in (0..self.total_blocks).filter(|&b| self.bit(b)) {
            match out.last_mut() {
                Some(last) if last.end() == block => last.length += 1,
                _ => out.push(Extent::new(block, 1)),
            }
        }
        out
    }

    /// Number of set blocks
    pub const fn set_count(&self) -> u64 {
        self.set_blocks
    }

    /// Number of clear blocks
    pub const fn clear_count(&self) -> u64 {
        self.total_blocks - self.set_blocks
    }

    /// Get the total number of blocks
    pub const fn total_count(&self) -> u64 {
        self.total_blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extent_basic() {
        let extent = Extent::new(10, 5);
        assert_eq!(extent.end(), 15);
        assert!(extent.contains(10));
        assert!(extent.contains(14));
        assert!(!extent.contains(15));
        assert!(extent.overlaps(&Extent::new(14, 3)));
        assert!(!extent.overlaps(&Extent::new(15, 3)));
    }

    #[test]
    fn test_extent_merge() {
        let e1 = Extent::new(0, 5);
        let e2 = Extent::new(5, 3);
        let merged = e1.try_merge(&e2).unwrap();
        assert_eq!(merged, Extent::new(0, 8));
        assert!(e1.try_merge(&Extent::new(10, 2)).is_none());
    }

    #[test]
    fn test_bitmap_set_and_clear() {
        let mut bitmap = BlockBitmap::new(100);
        assert_eq!(bitmap.set_extent(&Extent::new(10, 4)).unwrap(), 4);
        assert_eq!(bitmap.set_extent(&Extent::new(12, 4)).unwrap(), 2);
        assert_eq!(bitmap.set_count(), 6);
        assert!(bitmap.is_set(15));
        bitmap.clear_extent(&Extent::new(10, 6)).unwrap();
        assert_eq!(bitmap.set_count(), 0);
        assert!(bitmap.set_extent(&Extent::new(99, 2)).is_err());
    }

    #[test]
    fn test_bitmap_clear_underflow_refused() {
        let mut bitmap = BlockBitmap::new(64);
        bitmap.set_extent(&Extent::new(0, 2)).unwrap();
        let err = bitmap.clear_extent(&Extent::new(1, 2)).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        // nothing was cleared
        assert_eq!(bitmap.set_count(), 2);
        assert!(bitmap.is_set(1));
    }

    #[test]
    fn test_bitmap_extent_allocation() {
        let mut bitmap = BlockBitmap::new(100);
        let extent = bitmap.allocate_extent(10).unwrap();
        assert_eq!(extent, Extent::new(0, 10));
        let extent2 = bitmap.allocate_extent(5).unwrap();
        assert_eq!(extent2.start, 10);
        assert_eq!(bitmap.clear_count(), 85);

        bitmap.clear_extent(&extent).unwrap();
        assert_eq!(bitmap.allocate_extent(90), None);
        assert_eq!(bitmap.allocate_extent(10).unwrap().start, 0);
    }

    #[test]
    fn test_bitmap_union_and_extents() {
        let mut a = BlockBitmap::new(200);
        let mut b = BlockBitmap::new(200);
        a.set_extent(&Extent::new(0, 3)).unwrap();
        b.set_extent(&Extent::new(3, 2)).unwrap();
        b.set_extent(&Extent::new(130, 1)).unwrap();
        a.union_with(&b);
        assert_eq!(a.set_count(), 6);
        assert_eq!(a.extents(), vec![Extent::new(0, 5), Extent::new(130, 1)]);
        a.clear_all();
        assert!(a.extents().is_empty());
    }
}
