//! Recovery log
//!
//! Each shard owns two log regions used alternately. Object-location
//! changes are appended as 64-byte records into in-memory buffers of whole
//! pages; a dedicated writer thread seals, writes and post-processes them.
//! When a region fills it is handed to the updater for merging into the
//! object table, and writing continues in the other region once that one has
//! been merged.

mod buffer;
mod writer;

pub use buffer::LogBuffer;
pub use writer::LogWriter;

use flashkv_common::{LogId, Lsn};

/// Pages and table offsets one log region has absorbed since it was last merged
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogRange {
    pub first_lsn: Lsn,
    pub high_lsn: Lsn,
    /// Lowest object-table offset touched
    pub low_offset: u64,
    /// Highest object-table offset touched
    pub high_offset: u64,
}

impl Default for LogRange {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl LogRange {
    pub const EMPTY: Self = Self {
        first_lsn: 0,
        high_lsn: 0,
        low_offset: u64::MAX,
        high_offset: 0,
    };

    /// Covers every table offset
    pub const FULL: Self = Self {
        first_lsn: 0,
        high_lsn: Lsn::MAX,
        low_offset: 0,
        high_offset: u64::MAX,
    };

    pub fn note_page(&mut self, lsn: Lsn) {
        if self.first_lsn == 0 {
            self.first_lsn = lsn;
        }
        self.high_lsn = self.high_lsn.max(lsn);
    }

    pub fn note_offset(&mut self, offset: u64) {
        self.low_offset = self.low_offset.min(offset);
        self.high_offset = self.high_offset.max(offset);
    }

    /// No record touched the table
    pub const fn is_empty(&self) -> bool {
        self.low_offset > self.high_offset
    }

    /// Whether any touched offset falls in `[start, end)`
    pub const fn overlaps(&self, start: u64, end: u64) -> bool {
        !self.is_empty() && self.low_offset < end && self.high_offset >= start
    }
}

/// Where the writer resumes after recovery
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogPosition {
    pub log: LogId,
    pub page: u64,
    /// LSN of the next fresh page
    pub lsn: Lsn,
}

/// Writer counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LogStats {
    pub records: u64,
    pub pages_written: u64,
    pub flushes: u64,
    pub syncs: u64,
    pub log_switches: u64,
    pub deallocations: u64,
    pub tombstones: u64,
    pub last_lsn: Lsn,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_tracking() {
        let mut range = LogRange::EMPTY;
        assert!(range.is_empty());
        assert!(!range.overlaps(0, u64::MAX));
        range.note_page(7);
        range.note_page(9);
        range.note_offset(40);
        range.note_offset(12);
        assert_eq!((range.first_lsn, range.high_lsn), (7, 9));
        assert!(range.overlaps(0, 13));
        assert!(!range.overlaps(0, 12));
        assert!(range.overlaps(40, 41));
        assert!(!range.overlaps(41, 100));
        assert!(LogRange::FULL.overlaps(5, 6));
    }
}
