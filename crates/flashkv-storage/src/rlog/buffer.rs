use crate::layout::{LOG_SLOT_SIZE, LogPage, LogRecord, RECORDS_PER_PAGE};
use crate::raw_io::AlignedBuffer;
use flashkv_common::{BLOCK_SIZE, LogId, Lsn};

/// In-memory run of log pages bound to a position in one log region
///
/// Pages receive their LSN when their first record is appended. A buffer
/// written out before it filled keeps its last page open; the next write
/// rewrites that page under the same (provisional) LSN.
pub struct LogBuffer {
    pages: AlignedBuffer,
    lsns: Vec<Lsn>,
    log: LogId,
    start_page: u64,
    limit_pages: usize,
    /// Records appended
    cursor: usize,
    /// Leading pages already written in their final form
    written_pages: usize,
    /// Page `written_pages` is on disk in a partial form
    partial_written: bool,
    /// Records already post-processed
    processed: usize,
}

impl LogBuffer {
    pub fn new(pages: usize) -> Self {
        Self {
            pages: AlignedBuffer::blocks(pages),
            lsns: vec![0; pages],
            log: LogId::Zero,
            start_page: 0,
            limit_pages: pages,
            cursor: 0,
            written_pages: 0,
            partial_written: false,
            processed: 0,
        }
    }

    /// Bind an empty buffer to `limit` pages of `log` starting at `page`
    pub fn reset(&mut self, log: LogId, page: u64, limit: usize) {
        self.pages.zero();
        self.lsns.fill(0);
        self.log = log;
        self.start_page = page;
        self.limit_pages = limit.min(self.lsns.len());
        self.cursor = 0;
        self.written_pages = 0;
        self.partial_written = false;
        self.processed = 0;
    }

    pub const fn log(&self) -> LogId {
        self.log
    }

    pub const fn start_page(&self) -> u64 {
        self.start_page
    }

    pub const fn limit_pages(&self) -> usize {
        self.limit_pages
    }

    pub const fn capacity_records(&self) -> usize {
        self.limit_pages * RECORDS_PER_PAGE
    }

    pub const fn len(&self) -> usize {
        self.cursor
    }

    pub const fn is_empty(&self) -> bool {
        self.cursor == 0
    }

    pub const fn is_full(&self) -> bool {
        self.cursor >= self.capacity_records()
    }

    /// Append a record, stamping a fresh page with `next_lsn`
    ///
    /// The caller checks `is_full` first.
    pub fn append(&mut self, record: &LogRecord, next_lsn: &mut Lsn) {
        debug_assert!(!self.is_full());
        let page = self.cursor / RECORDS_PER_PAGE;
        let slot = self.cursor % RECORDS_PER_PAGE + 1;
        if slot == 1 {
            self.lsns[page] = *next_lsn;
            *next_lsn += 1;
        }
        let start = page * BLOCK_SIZE + slot * LOG_SLOT_SIZE;
        record.encode_into(&mut self.pages.as_mut_slice()[start..start + LOG_SLOT_SIZE]);
        self.cursor += 1;
    }

    /// Pages holding at least one record
    pub const fn used_pages(&self) -> usize {
        self.cursor.div_ceil(RECORDS_PER_PAGE)
    }

    /// First page that still needs writing and whether it is a rewrite
    pub const fn write_start(&self) -> (usize, bool) {
        (self.written_pages, self.partial_written)
    }

    pub fn page_lsn(&self, page: usize) -> Lsn {
        self.lsns[page]
    }

    /// Seal pages `[from, to)` with their LSNs and return their bytes
    pub fn seal(&mut self, from: usize, to: usize) -> &[u8] {
        for page in from..to {
            let lsn = self.lsns[page];
            LogPage::seal(self.pages.block_mut(page), lsn);
        }
        &self.pages.as_slice()[from * BLOCK_SIZE..to * BLOCK_SIZE]
    }

    /// Records appended since the last call, for post-write processing
    pub fn take_unprocessed(&mut self) -> Vec<(Lsn, LogRecord)> {
        let records = (self.processed..self.cursor)
            .filter_map(|index| {
                let page = index / RECORDS_PER_PAGE;
                let slot = index % RECORDS_PER_PAGE + 1;
                LogPage::record(self.pages.block(page), slot).map(|r| (self.lsns[page], r))
            })
            .collect();
        self.processed = self.cursor;
        records
    }

    /// Note that everything appended so far is on disk
    pub fn mark_written(&mut self) {
        self.written_pages = self.cursor / RECORDS_PER_PAGE;
        self.partial_written = self.cursor % RECORDS_PER_PAGE != 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::PageCheck;

    fn record(seqno: u64) -> LogRecord {
        LogRecord::create(3, 9, 100 + seqno, 1, seqno)
    }

    #[test]
    fn test_append_stamps_pages() {
        let mut buffer = LogBuffer::new(4);
        buffer.reset(LogId::One, 8, 2);
        assert_eq!(buffer.capacity_records(), 14);
        let mut lsn = 20;
        for seqno in 1..=8 {
            buffer.append(&record(seqno), &mut lsn);
        }
        assert_eq!(lsn, 22);
        assert_eq!(buffer.used_pages(), 2);
        assert_eq!((buffer.page_lsn(0), buffer.page_lsn(1)), (20, 21));

        let bytes = buffer.seal(0, 2).to_vec();
        assert_eq!(LogPage::check(&bytes[..BLOCK_SIZE]).unwrap(), PageCheck::Valid(20));
        assert_eq!(LogPage::records(&bytes[BLOCK_SIZE..]).count(), 1);

        let unprocessed = buffer.take_unprocessed();
        assert_eq!(unprocessed.len(), 8);
        assert_eq!(unprocessed[7], (21, record(8)));
        assert!(buffer.take_unprocessed().is_empty());
    }

    #[test]
    fn test_partial_write_reopens_last_page() {
        let mut buffer = LogBuffer::new(2);
        buffer.reset(LogId::Zero, 0, 2);
        let mut lsn = 1;
        for seqno in 1..=3 {
            buffer.append(&record(seqno), &mut lsn);
        }
        buffer.mark_written();
        assert_eq!(buffer.write_start(), (0, true));
        for seqno in 4..=7 {
            buffer.append(&record(seqno), &mut lsn);
        }
        // Page 0 filled under its provisional LSN
        assert_eq!(lsn, 2);
        buffer.mark_written();
        assert_eq!(buffer.write_start(), (1, false));
        for seqno in 8..=14 {
            buffer.append(&record(seqno), &mut lsn);
        }
        assert!(buffer.is_full());
    }
}
