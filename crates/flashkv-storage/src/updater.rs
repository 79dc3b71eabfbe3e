//! Object-table updater
//!
//! Merges recovery-log records into the on-disk object table one chunk at a
//! time. A chunk is read into pooled buffers, every log record touching it is
//! applied in LSN order, and the chunk is written back only if something
//! changed. Once the whole log is reflected the checkpoint is raised past its
//! highest LSN.
//!
//! Recovery runs two passes: the older log (skipped if the checkpoint already
//! covers it), then the newer log while rebuilding the in-memory hash index
//! from every chunk. Replay is idempotent, so a crash during either pass only
//! repeats work.

use crate::hash::{ClassClocks, HashEntry, HashIndex};
use crate::layout::{
    ENTRIES_PER_BLOCK, ENTRY_DELETED, ENTRY_TOMBSTONE, LogPage, LogRecord, PageCheck,
    TABLE_ENTRY_SIZE, TableEntry,
};
use crate::pool::{BufferPool, PoolLease};
use crate::rlog::{LogPosition, LogRange};
use crate::shard::ShardContext;
use crossbeam_channel::{Receiver, Sender};
use flashkv_common::config::{HashConfig, UpdaterConfig};
use flashkv_common::{BLOCK_SIZE, Error, LogId, Lsn, Result, Seqno, ShardFlags, ShardId};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// Mailbox message of an updater thread
pub enum UpdaterMsg {
    /// Merge a filled log, then release the shard's log-reuse permit
    Merge {
        shard: Arc<ShardContext>,
        log: LogId,
        range: LogRange,
    },
    Shutdown,
}

/// How strictly records are checked against the table
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeMode {
    /// Replay after a crash: the table may already reflect some records
    Recovery,
    /// Merge of a freshly filled log: every record must fit the table
    Online,
}

/// Which half of a record is being applied
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Step {
    Primary,
    /// The delete implied at the overwritten location
    Superseded,
}

/// Valid prefix of a log region
#[derive(Clone, Copy, Debug)]
struct LogScan {
    log: LogId,
    /// First page above the checkpoint
    first_page: u64,
    pages: u64,
    high_lsn: Lsn,
    records: u64,
    high_seqno: Seqno,
    range: LogRange,
    /// A page carries exactly the checkpoint LSN
    holds_checkpoint: bool,
}

/// What recovery rebuilt
pub struct RecoveryReport {
    pub shard: ShardId,
    pub index: HashIndex,
    pub clocks: ClassClocks,
    pub resume: LogPosition,
    pub checkpoint_lsn: Lsn,
    pub highest_seqno: Seqno,
    pub replayed_pages: u64,
    pub replayed_records: u64,
    pub live_objects: u64,
    pub tombstones: u64,
}

/// Table chunk held in leased buffers
struct Chunk<'l> {
    lease: &'l mut PoolLease,
    start_block: u64,
    blocks: u64,
}

impl Chunk<'_> {
    fn first_entry(&self) -> u64 {
        self.start_block * ENTRIES_PER_BLOCK as u64
    }

    fn end_entry(&self) -> u64 {
        (self.start_block + self.blocks) * ENTRIES_PER_BLOCK as u64
    }

    fn contains(&self, offset: u64) -> bool {
        (self.first_entry()..self.end_entry()).contains(&offset)
    }

    fn slot(&self, offset: u64) -> (usize, usize) {
        let index = (offset - self.first_entry()) as usize;
        let (buffer, byte) = self.lease.locate(index / ENTRIES_PER_BLOCK);
        (buffer, byte + (index % ENTRIES_PER_BLOCK) * TABLE_ENTRY_SIZE)
    }

    fn entry(&self, offset: u64) -> TableEntry {
        let (buffer, byte) = self.slot(offset);
        TableEntry::decode(&self.lease.buffers()[buffer].as_slice()[byte..byte + TABLE_ENTRY_SIZE])
    }

    fn set_entry(&mut self, offset: u64, entry: &TableEntry) {
        let (buffer, byte) = self.slot(offset);
        entry.encode_into(&mut self.lease.buffers_mut()[buffer].as_mut_slice()[byte..byte + TABLE_ENTRY_SIZE]);
    }

    /// Visit each leased buffer with the table block it starts at and its block count
    fn pieces(&self) -> Vec<(usize, u64, usize)> {
        let per = self.lease.buffers().first().map_or(0, |b| b.block_count()) as u64;
        let mut out = Vec::new();
        let mut done = 0;
        let mut index = 0;
        while done < self.blocks {
            let n = per.min(self.blocks - done);
            out.push((index, self.start_block + done, n as usize));
            done += n;
            index += 1;
        }
        out
    }
}

/// Apply one half of a record to the entry it targets
fn apply_step(
    current: TableEntry,
    record: &LogRecord,
    step: Step,
    mode: MergeMode,
    flags: ShardFlags,
) -> std::result::Result<TableEntry, String> {
    let strict = mode == MergeMode::Online;
    let same_object = current.is_live() && current.syndrome == record.syndrome;
    match step {
        Step::Primary if !record.is_delete() => {
            if strict && current.is_live() {
                return Err(format!("create at {} over a live entry", record.offset));
            }
            Ok(TableEntry {
                syndrome: record.syndrome,
                flags: 0,
                blocks: record.blocks,
                bucket: record.bucket,
                seqno: record.seqno,
            })
        }
        Step::Primary => {
            if strict && !same_object {
                return Err(format!("delete at {} of a missing object", record.offset));
            }
            if !record.is_tombstone() {
                return Ok(TableEntry::EMPTY);
            }
            if current.is_empty() {
                return Ok(current);
            }
            Ok(TableEntry {
                flags: ENTRY_TOMBSTONE,
                seqno: record.seqno,
                ..current
            })
        }
        Step::Superseded => {
            if strict && !same_object {
                return Err(format!(
                    "overwrite at {} supersedes a missing object",
                    record.offset
                ));
            }
            if !flags.retains_tombstones() {
                return Ok(TableEntry::EMPTY);
            }
            if current.is_empty() {
                return Ok(current);
            }
            Ok(TableEntry {
                flags: ENTRY_DELETED,
                seqno: record.seqno,
                ..current
            })
        }
    }
}

/// State rebuilt from table chunks during the second recovery pass
struct Rebuild {
    index: HashIndex,
    clocks: ClassClocks,
    class_of: HashMap<u64, usize>,
    segment_blocks: u64,
    rtg: Seqno,
    highest_seqno: Seqno,
    live: u64,
    tombstones: u64,
    /// Extents of live objects and kept tombstones, start to end
    claimed: BTreeMap<u64, u64>,
    /// Tombstone entries held back until every live extent is known
    dead: Vec<(u64, TableEntry)>,
}

impl Rebuild {
    fn absorb(&mut self, shard: &ShardContext, chunk: &Chunk<'_>) -> Result<()> {
        let total = shard.descriptor.total_blocks;
        for offset in chunk.first_entry()..chunk.end_entry().min(total) {
            let entry = chunk.entry(offset);
            if entry.is_empty() {
                continue;
            }
            self.highest_seqno = self.highest_seqno.max(entry.seqno);
            if entry.is_live() {
                self.index.insert(
                    entry.bucket,
                    HashEntry {
                        syndrome: entry.syndrome,
                        offset,
                        blocks: entry.blocks,
                        seqno: entry.seqno,
                    },
                )?;
                shard.alloc.mark_allocated(shard.id, offset, u64::from(entry.blocks))?;
                shard.backup.note_recovered(offset, entry.blocks)?;
                if let Some(&class) = self.class_of.get(&(offset / self.segment_blocks)) {
                    self.clocks.observe(class, entry.seqno);
                }
                self.claimed.insert(offset, offset + u64::from(entry.blocks));
                self.live += 1;
            } else if entry.seqno >= self.rtg && entry.blocks > 0 {
                self.dead.push((offset, entry));
            }
        }
        Ok(())
    }

    /// Track the tombstones whose blocks no live object has reused
    ///
    /// A tombstone freed before the restart keeps its table entry, and its
    /// blocks may since belong to a newer object. Newer tombstones win when
    /// two of them overlap.
    fn finish(&mut self, shard: &ShardContext) -> Result<()> {
        let mut dead = std::mem::take(&mut self.dead);
        dead.sort_by_key(|(_, entry)| std::cmp::Reverse(entry.seqno));
        let mut tracker = shard.tombstones.lock();
        for (offset, entry) in dead {
            let end = offset + u64::from(entry.blocks);
            let reused = self
                .claimed
                .range(..end)
                .next_back()
                .is_some_and(|(_, &claimed_end)| claimed_end > offset);
            if reused {
                debug!(
                    "{} dropping tombstone at {offset} (seqno {}), its blocks are in use",
                    shard.id, entry.seqno
                );
                continue;
            }
            shard.alloc.mark_allocated(shard.id, offset, u64::from(entry.blocks))?;
            tracker.add(entry.syndrome, offset, entry.seqno);
            self.claimed.insert(offset, end);
            self.tombstones += 1;
        }
        Ok(())
    }
}

/// Merge engine bound to one shard
pub struct Updater<'a> {
    shard: &'a ShardContext,
    config: &'a UpdaterConfig,
    table_pool: &'a Arc<BufferPool>,
    log_pool: &'a Arc<BufferPool>,
}

impl<'a> Updater<'a> {
    pub fn new(
        shard: &'a ShardContext,
        config: &'a UpdaterConfig,
        table_pool: &'a Arc<BufferPool>,
        log_pool: &'a Arc<BufferPool>,
    ) -> Self {
        Self {
            shard,
            config,
            table_pool,
            log_pool,
        }
    }

    fn id(&self) -> ShardId {
        self.shard.id
    }

    /// Feed `pages` pages of a log starting at `first` to `f` until it returns false
    fn for_each_page(
        &self,
        log: LogId,
        first: u64,
        pages: u64,
        mut f: impl FnMut(&[u8]) -> Result<bool>,
    ) -> Result<()> {
        let mut lease = self.log_pool.checkout(1)?;
        let per = lease.total_blocks() as u64;
        let base = self.shard.descriptor.log_offsets[log.index()] + first;
        let yield_every = u64::from(self.config.yield_interval.max(1));
        let mut page = 0;
        while page < pages {
            let n = per.min(pages - page);
            let buffer = &mut lease.buffers_mut()[0];
            self.shard
                .io
                .read(base + page, &mut buffer.as_mut_slice()[..n as usize * BLOCK_SIZE])?;
            for i in 0..n {
                if !f(buffer.block(i as usize))? {
                    return Ok(());
                }
                if (page + i + 1) % yield_every == 0 {
                    std::thread::yield_now();
                }
            }
            page += n;
        }
        Ok(())
    }

    /// LSN of a log's first page, zero when it is not a valid page
    fn first_page_lsn(&self, log: LogId) -> Result<Lsn> {
        let mut lsn = 0;
        self.for_each_page(log, 0, 1, |page| {
            if let PageCheck::Valid(found) = LogPage::check(page)? {
                lsn = found;
            }
            Ok(false)
        })?;
        Ok(lsn)
    }

    /// Find the run of valid pages newer than `checkpoint`
    ///
    /// Leading pages the checkpoint already covers are stepped over. The run
    /// ends at a blank page, a torn page or an LSN that does not increase.
    fn scan_log(&self, log: LogId, checkpoint: Lsn, mode: MergeMode) -> Result<LogScan> {
        let mut scan = LogScan {
            log,
            first_page: 0,
            pages: 0,
            high_lsn: 0,
            records: 0,
            high_seqno: 0,
            range: LogRange::EMPTY,
            holds_checkpoint: false,
        };
        let id = self.id();
        let mut seen = 0;
        let mut last_lsn = 0;
        self.for_each_page(log, 0, self.shard.descriptor.log_pages(), |page| {
            let lsn = match LogPage::check(page)? {
                PageCheck::Blank => return Ok(false),
                PageCheck::Torn { stored, computed } => {
                    return match mode {
                        MergeMode::Online => Err(Error::ChecksumMismatch {
                            structure: "log page",
                            stored,
                            computed,
                        }),
                        MergeMode::Recovery => {
                            warn!("{id} {log} page {seen} is torn, treating it as the end of the log");
                            Ok(false)
                        }
                    };
                }
                PageCheck::Valid(lsn) => lsn,
            };
            if lsn <= last_lsn {
                return Ok(false);
            }
            last_lsn = lsn;
            seen += 1;
            if lsn <= checkpoint {
                scan.first_page = seen;
                scan.holds_checkpoint |= lsn == checkpoint;
                return Ok(true);
            }
            scan.pages += 1;
            scan.high_lsn = lsn;
            scan.range.note_page(lsn);
            for record in LogPage::records(page) {
                scan.records += 1;
                scan.high_seqno = scan.high_seqno.max(record.seqno);
                for offset in record.touched() {
                    scan.range.note_offset(offset);
                }
            }
            Ok(true)
        })?;
        debug!(
            "{id} {log}: {} pages from page {}, {} records above checkpoint {checkpoint}",
            scan.pages, scan.first_page, scan.records
        );
        Ok(scan)
    }

    fn read_chunk(&self, chunk: &mut Chunk<'_>) -> Result<()> {
        let table = self.shard.descriptor.table_offset;
        for (index, block, n) in chunk.pieces() {
            let buffer = &mut chunk.lease.buffers_mut()[index];
            self.shard
                .io
                .read(table + block, &mut buffer.as_mut_slice()[..n * BLOCK_SIZE])?;
        }
        Ok(())
    }

    fn write_chunk(&self, chunk: &Chunk<'_>) -> Result<()> {
        let table = self.shard.descriptor.table_offset;
        for (index, block, n) in chunk.pieces() {
            let buffer = &chunk.lease.buffers()[index];
            self.shard.io.write(table + block, &buffer.as_slice()[..n * BLOCK_SIZE])?;
        }
        Ok(())
    }

    /// Apply every record of the scanned log that touches the chunk
    fn apply_log(&self, scan: &LogScan, chunk: &mut Chunk<'_>, mode: MergeMode) -> Result<u64> {
        let mut changed = 0;
        let flags = self.shard.flags;
        let id = self.id();
        self.for_each_page(scan.log, scan.first_page, scan.pages, |page| {
            for record in LogPage::records(page) {
                let steps = [
                    Some((record.offset, Step::Primary)),
                    record.superseded.map(|old| (old, Step::Superseded)),
                ];
                for (offset, step) in steps.into_iter().flatten() {
                    if !chunk.contains(offset) {
                        continue;
                    }
                    let current = chunk.entry(offset);
                    let next = apply_step(current, &record, step, mode, flags).map_err(|what| {
                        Error::consistency(format!("{id} {}: {what} (seqno {})", scan.log, record.seqno))
                    })?;
                    if next != current {
                        chunk.set_entry(offset, &next);
                        changed += 1;
                    }
                }
            }
            Ok(true)
        })?;
        Ok(changed)
    }

    /// Count records that would touch a skipped chunk
    fn count_hits(&self, scan: &LogScan, chunk: &Chunk<'_>) -> Result<u64> {
        let mut hits = 0;
        self.for_each_page(scan.log, scan.first_page, scan.pages, |page| {
            hits += LogPage::records(page)
                .flat_map(|record| record.touched().collect::<Vec<_>>())
                .filter(|&offset| chunk.contains(offset))
                .count() as u64;
            Ok(true)
        })?;
        Ok(hits)
    }

    /// One pass of `scan` over the whole table
    fn merge_pass(
        &self,
        scan: &LogScan,
        mode: MergeMode,
        lease: &mut PoolLease,
        mut rebuild: Option<&mut Rebuild>,
    ) -> Result<u64> {
        let table_blocks = self.shard.descriptor.table_blocks;
        let chunk_blocks = lease.total_blocks() as u64;
        let mut written = 0;
        let mut start = 0;
        while start < table_blocks {
            let blocks = chunk_blocks.min(table_blocks - start);
            let mut chunk = Chunk {
                lease: &mut *lease,
                start_block: start,
                blocks,
            };
            start += blocks;

            let skip = scan.pages == 0 || !scan.range.overlaps(chunk.first_entry(), chunk.end_entry());
            if skip && rebuild.is_none() && !self.config.verify_skips {
                if scan.range.is_empty() || chunk.first_entry() > scan.range.high_offset {
                    break;
                }
                continue;
            }

            self.read_chunk(&mut chunk)?;
            if !skip {
                if self.apply_log(scan, &mut chunk, mode)? > 0 {
                    self.write_chunk(&chunk)?;
                    written += 1;
                }
            } else if self.config.verify_skips && scan.pages > 0 {
                let hits = self.count_hits(scan, &chunk)?;
                if hits > 0 {
                    return Err(Error::consistency(format!(
                        "{} skipped table blocks {}..{} hold {hits} log records",
                        self.id(),
                        chunk.start_block,
                        chunk.start_block + chunk.blocks
                    )));
                }
            }
            if let Some(rebuild) = rebuild.as_deref_mut() {
                rebuild.absorb(self.shard, &chunk)?;
            }
        }
        Ok(written)
    }

    /// Merge a filled log into the table and raise the checkpoint past it
    pub fn merge_online(&self, log: LogId, range: LogRange) -> Result<()> {
        let checkpoint = self.shard.checkpoint_lsn();
        let scan = self.scan_log(log, checkpoint, MergeMode::Online)?;
        if scan.high_lsn != range.high_lsn {
            return Err(Error::consistency(format!(
                "{} {log} ends at LSN {}, writer reported {}",
                self.id(),
                scan.high_lsn,
                range.high_lsn
            )));
        }

        let buffers = (self.table_pool.capacity() / self.config.online_pool_divisor.max(1) as usize).max(1);
        let mut lease = self.table_pool.checkout(buffers)?;
        let written = self.merge_pass(&scan, MergeMode::Online, &mut lease, None)?;
        drop(lease);
        self.shard.raise_checkpoint(scan.high_lsn)?;
        info!(
            "{} merged {log}: {} records, {written} chunks written, checkpoint {}",
            self.id(),
            scan.records,
            scan.high_lsn
        );
        Ok(())
    }

    /// Two-pass crash recovery of the object table
    pub fn recover(&self, max_objects: u64, hash: &HashConfig) -> Result<RecoveryReport> {
        let firsts = [self.first_page_lsn(LogId::Zero)?, self.first_page_lsn(LogId::One)?];
        let checkpoint = self.shard.checkpoint_lsn();
        let zero = self.scan_log(LogId::Zero, checkpoint, MergeMode::Recovery)?;
        let one = self.scan_log(LogId::One, checkpoint, MergeMode::Recovery)?;
        // The log holding the checkpoint was merged last; the other one is
        // either entirely older or entirely newer than it
        let older = match (zero.holds_checkpoint, one.holds_checkpoint) {
            (true, false) => LogId::Zero,
            (false, true) => LogId::One,
            _ if firsts[1] < firsts[0] => LogId::One,
            _ => LogId::Zero,
        };
        let newer = older.other();
        let old_scan = if older == LogId::Zero { zero } else { one };
        let mut lease = self.table_pool.checkout(self.table_pool.capacity())?;

        if old_scan.pages > 0 {
            self.merge_pass(&old_scan, MergeMode::Recovery, &mut lease, None)?;
            self.shard.raise_checkpoint(old_scan.high_lsn)?;
        } else {
            debug!("{} {older} already reflected in the table", self.id());
        }

        let new_scan = self.scan_log(newer, self.shard.checkpoint_lsn(), MergeMode::Recovery)?;
        let segment_blocks = self.shard.io.segment_blocks();
        let mut rebuild = Rebuild {
            index: HashIndex::new(
                self.id(),
                max_objects,
                hash,
                self.shard.flags.contains(ShardFlags::EVICTING),
            ),
            clocks: ClassClocks::new(self.shard.class_count()),
            class_of: self.shard.class_of_segment().into_iter().collect(),
            segment_blocks,
            rtg: self.shard.tombstones.lock().rtg(),
            highest_seqno: 0,
            live: 0,
            tombstones: 0,
            claimed: BTreeMap::new(),
            dead: Vec::new(),
        };
        self.merge_pass(&new_scan, MergeMode::Recovery, &mut lease, Some(&mut rebuild))?;
        drop(lease);
        rebuild.finish(self.shard)?;
        if new_scan.pages > 0 {
            self.shard.raise_checkpoint(new_scan.high_lsn)?;
        }

        let checkpoint_lsn = self.shard.checkpoint_lsn();
        let high = checkpoint_lsn.max(old_scan.high_lsn).max(new_scan.high_lsn);
        let newest = if firsts == [0, 0] {
            None
        } else if firsts[1] > firsts[0] {
            Some(LogId::One)
        } else {
            Some(LogId::Zero)
        };
        let resume = LogPosition {
            log: newest.map_or(LogId::Zero, LogId::other),
            page: 0,
            lsn: high + 1,
        };
        let highest_seqno = rebuild.highest_seqno.max(old_scan.high_seqno).max(new_scan.high_seqno);
        self.shard.observe_seqno(highest_seqno);

        info!(
            "{} recovered: {} + {} pages replayed, {} live objects, {} tombstones, checkpoint {checkpoint_lsn}",
            self.id(),
            old_scan.pages,
            new_scan.pages,
            rebuild.live,
            rebuild.tombstones
        );
        Ok(RecoveryReport {
            shard: self.id(),
            index: rebuild.index,
            clocks: rebuild.clocks,
            resume,
            checkpoint_lsn,
            highest_seqno,
            replayed_pages: old_scan.pages + new_scan.pages,
            replayed_records: old_scan.records + new_scan.records,
            live_objects: rebuild.live,
            tombstones: rebuild.tombstones,
        })
    }
}

/// Thread draining an updater mailbox
pub struct UpdaterThread {
    tx: Sender<UpdaterMsg>,
    handle: Option<JoinHandle<()>>,
}

impl UpdaterThread {
    pub fn spawn(
        name: String,
        config: UpdaterConfig,
        table_pool: Arc<BufferPool>,
        log_pool: Arc<BufferPool>,
        abort_on_fatal: bool,
    ) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(move || run_updater(&rx, &config, &table_pool, &log_pool, abort_on_fatal))?;
        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }

    pub fn sender(&self) -> Sender<UpdaterMsg> {
        self.tx.clone()
    }

    pub fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.tx.send(UpdaterMsg::Shutdown);
            if handle.join().is_err() {
                error!("updater thread panicked");
            }
        }
    }
}

impl Drop for UpdaterThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_updater(
    rx: &Receiver<UpdaterMsg>,
    config: &UpdaterConfig,
    table_pool: &Arc<BufferPool>,
    log_pool: &Arc<BufferPool>,
    abort_on_fatal: bool,
) {
    while let Ok(msg) = rx.recv() {
        match msg {
            UpdaterMsg::Merge { shard, log, range } => {
                let updater = Updater::new(&shard, config, table_pool, log_pool);
                match updater.merge_online(log, range) {
                    Ok(()) => shard.log_reuse.release(),
                    Err(err) => {
                        shard.fail(&err);
                        crate::engine::fatal(&err, abort_on_fatal);
                    }
                }
            }
            UpdaterMsg::Shutdown => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{LOG_SLOT_SIZE, RECORDS_PER_PAGE};
    use crate::mapper::SegmentAllocator as _;
    use crate::raw_io::AlignedBuffer;
    use crate::testutil::{SEGMENT_BLOCKS, TestShard, pools, updater_config};

    /// Write `records` as consecutive pages of `log` starting at LSN `first_lsn`
    fn write_log(shard: &ShardContext, log: LogId, first_lsn: Lsn, records: &[LogRecord]) -> Lsn {
        write_log_at(shard, log, 0, first_lsn, records)
    }

    fn write_log_at(shard: &ShardContext, log: LogId, page: u64, first_lsn: Lsn, records: &[LogRecord]) -> Lsn {
        let pages = records.len().div_ceil(RECORDS_PER_PAGE);
        let mut buf = AlignedBuffer::blocks(pages);
        for (page, chunk) in records.chunks(RECORDS_PER_PAGE).enumerate() {
            let block = buf.block_mut(page);
            for (i, record) in chunk.iter().enumerate() {
                let slot = (i + 1) * LOG_SLOT_SIZE;
                record.encode_into(&mut block[slot..slot + LOG_SLOT_SIZE]);
            }
            LogPage::seal(block, first_lsn + page as u64);
        }
        shard
            .io
            .write(shard.descriptor.log_offsets[log.index()] + page, buf.as_slice())
            .unwrap();
        first_lsn + pages as u64 - 1
    }

    fn table_entry(shard: &ShardContext, offset: u64) -> TableEntry {
        let mut block = AlignedBuffer::blocks(1);
        let table_block = offset / ENTRIES_PER_BLOCK as u64;
        shard
            .io
            .read(shard.descriptor.table_offset + table_block, block.as_mut_slice())
            .unwrap();
        let at = (offset % ENTRIES_PER_BLOCK as u64) as usize * TABLE_ENTRY_SIZE;
        TableEntry::decode(&block.as_slice()[at..at + TABLE_ENTRY_SIZE])
    }

    fn recover(test: &TestShard) -> Result<RecoveryReport> {
        let config = updater_config();
        let (table, log) = pools(&config);
        Updater::new(&test.shard, &config, &table, &log).recover(64, &HashConfig::default())
    }

    /// Put the on-disk checkpoint back to zero, as if it was never raised
    fn reset_checkpoint(test: &TestShard) {
        let checkpoint = crate::layout::Checkpoint {
            shard_id: test.shard.id,
            lsn: 0,
            generation: 0,
        };
        test.shard
            .io
            .write_metadata(test.shard.descriptor.checkpoint_offset, &checkpoint)
            .unwrap();
    }

    fn range(high_lsn: Lsn) -> LogRange {
        LogRange {
            high_lsn,
            ..LogRange::FULL
        }
    }

    #[test]
    fn test_apply_step_online_is_strict() {
        let flags = ShardFlags::PERSISTENT;
        let create = LogRecord::create(5, 1, 300, 2, 10);
        let live = apply_step(TableEntry::EMPTY, &create, Step::Primary, MergeMode::Online, flags).unwrap();
        assert!(live.is_live());
        assert!(apply_step(live, &create, Step::Primary, MergeMode::Online, flags).is_err());
        // Replay may find the create already applied
        assert_eq!(apply_step(live, &create, Step::Primary, MergeMode::Recovery, flags).unwrap(), live);

        let wrong = LogRecord::delete(6, 1, 300, 11);
        assert!(apply_step(live, &wrong, Step::Primary, MergeMode::Online, flags).is_err());
        let delete = LogRecord::delete(5, 1, 300, 11);
        assert_eq!(
            apply_step(live, &delete, Step::Primary, MergeMode::Online, flags).unwrap(),
            TableEntry::EMPTY
        );
    }

    #[test]
    fn test_apply_step_retains_in_replicated_shard() {
        let flags = ShardFlags::PERSISTENT | ShardFlags::REPLICATED;
        let live = TableEntry {
            syndrome: 5,
            flags: 0,
            blocks: 2,
            bucket: 1,
            seqno: 10,
        };
        let delete = LogRecord::delete(5, 1, 300, 11).with_tombstone();
        let tomb = apply_step(live, &delete, Step::Primary, MergeMode::Online, flags).unwrap();
        assert!(tomb.is_tombstone());
        assert_eq!((tomb.blocks, tomb.seqno), (2, 11));

        let overwrite = LogRecord::overwrite(5, 1, 400, 2, 12, 300);
        let old = apply_step(live, &overwrite, Step::Superseded, MergeMode::Online, flags).unwrap();
        assert!(old.is_deleted());
        assert_eq!(old.seqno, 12);
        // Nothing to retain once the slot is already empty
        assert_eq!(
            apply_step(TableEntry::EMPTY, &delete, Step::Primary, MergeMode::Recovery, flags).unwrap(),
            TableEntry::EMPTY
        );
    }

    #[test]
    fn test_online_merge_applies_log() {
        let test = TestShard::format(ShardFlags::PERSISTENT);
        let shard = &test.shard;
        let base = test.data_start();
        let mut records: Vec<_> = (0..10)
            .map(|i| LogRecord::create(i as u16 + 1, i, base + i * 4, 4, i + 1))
            .collect();
        records.push(LogRecord::overwrite(1, 0, base + 100, 4, 11, base));
        records.push(LogRecord::delete(2, 1, base + 4, 12));
        let high = write_log(shard, LogId::Zero, 1, &records);

        let config = updater_config();
        let (table, log) = pools(&config);
        Updater::new(shard, &config, &table, &log)
            .merge_online(LogId::Zero, range(high))
            .unwrap();
        assert_eq!(shard.checkpoint_lsn(), high);
        assert_eq!(table.available(), table.capacity());

        assert!(table_entry(shard, base).is_empty());
        assert!(table_entry(shard, base + 4).is_empty());
        let moved = table_entry(shard, base + 100);
        assert!(moved.is_live());
        assert_eq!((moved.syndrome, moved.seqno), (1, 11));
        assert_eq!(table_entry(shard, base + 36).seqno, 10);
    }

    #[test]
    fn test_online_merge_rejects_impossible_delete() {
        let test = TestShard::format(ShardFlags::PERSISTENT);
        let base = test.data_start();
        let high = write_log(&test.shard, LogId::Zero, 1, &[LogRecord::delete(3, 0, base, 1)]);
        let config = updater_config();
        let (table, log) = pools(&config);
        let err = Updater::new(&test.shard, &config, &table, &log)
            .merge_online(LogId::Zero, range(high))
            .unwrap_err();
        assert!(matches!(err, Error::Consistency(_)));
        assert_eq!(test.shard.checkpoint_lsn(), 0);
    }

    #[test]
    fn test_online_merge_checks_writer_range() {
        let test = TestShard::format(ShardFlags::PERSISTENT);
        let base = test.data_start();
        let high = write_log(&test.shard, LogId::Zero, 1, &[LogRecord::create(3, 0, base, 1, 1)]);
        let config = updater_config();
        let (table, log) = pools(&config);
        let err = Updater::new(&test.shard, &config, &table, &log)
            .merge_online(LogId::Zero, range(high + 1))
            .unwrap_err();
        assert!(matches!(err, Error::Consistency(_)));
    }

    #[test]
    fn test_recovery_two_passes() {
        let test = TestShard::format(ShardFlags::PERSISTENT);
        let base = test.data_start();
        // Older log: 8 creates over two pages; newer log overwrites and deletes
        let creates: Vec<_> = (0..8).map(|i| LogRecord::create(7, i, base + i * 2, 2, i + 1)).collect();
        let old_high = write_log(&test.shard, LogId::One, 1, &creates);
        assert_eq!(old_high, 2);
        let newer = [
            LogRecord::overwrite(7, 0, base + 64, 2, 9, base),
            LogRecord::delete(7, 1, base + 2, 10),
        ];
        let new_high = write_log(&test.shard, LogId::Zero, old_high + 1, &newer);

        let restarted = test.restart();
        let outcome = recover(&restarted).unwrap();
        assert_eq!(outcome.replayed_pages, 3);
        assert_eq!(outcome.replayed_records, 10);
        assert_eq!(outcome.live_objects, 7);
        assert_eq!(outcome.highest_seqno, 10);
        assert_eq!(outcome.checkpoint_lsn, new_high);
        // Log 0 holds the newest pages, so writing resumes in log 1
        assert_eq!(
            outcome.resume,
            LogPosition {
                log: LogId::One,
                page: 0,
                lsn: new_high + 1,
            }
        );
        assert_eq!(restarted.shard.last_seqno(), 10);
        assert_eq!(restarted.shard.allocate_seqno(), 11);

        assert_eq!(outcome.index.len(), 7);
        assert!(outcome.index.lookup(0, 7).any(|e| e.offset == base + 64));
        assert!(restarted.alloc.is_allocated(ShardId::new(0), base + 64));
        assert!(!restarted.alloc.is_allocated(ShardId::new(0), base));
        assert!(!restarted.alloc.is_allocated(ShardId::new(0), base + 2));
    }

    #[test]
    fn test_recovery_is_idempotent() {
        let test = TestShard::format(ShardFlags::PERSISTENT);
        let base = test.data_start();
        let records: Vec<_> = (0..20)
            .map(|i| LogRecord::create(i as u16, i, base + i, 1, i + 1))
            .chain([LogRecord::delete(3, 3, base + 3, 21)])
            .collect();
        write_log(&test.shard, LogId::Zero, 1, &records);

        let first = recover(&test.restart()).unwrap();
        let snapshot: Vec<_> = (base..base + 20).map(|o| table_entry(&test.shard, o)).collect();

        // Crash before the checkpoint reached disk: the same log replays again
        reset_checkpoint(&test);
        let second = recover(&test.restart()).unwrap();
        assert_eq!(second.live_objects, first.live_objects);
        assert_eq!(second.live_objects, 19);
        assert_eq!(second.resume, first.resume);
        let again: Vec<_> = (base..base + 20).map(|o| table_entry(&test.shard, o)).collect();
        assert_eq!(snapshot, again);

        // With the checkpoint in place nothing is replayed
        let third = recover(&test.restart()).unwrap();
        assert_eq!(third.replayed_pages, 0);
        assert_eq!(third.live_objects, 19);
    }

    #[test]
    fn test_recovery_stops_at_torn_page() {
        let test = TestShard::format(ShardFlags::PERSISTENT);
        let base = test.data_start();
        let records: Vec<_> = (0..14).map(|i| LogRecord::create(1, i, base + i, 1, i + 1)).collect();
        write_log(&test.shard, LogId::Zero, 1, &records);
        // Flip a byte of the second page
        let page = test.shard.descriptor.log_offsets[0] + 1;
        let physical = test.shard.io.segments()[(page / SEGMENT_BLOCKS) as usize];
        let device = &test.mems[physical.device];
        let at = physical.offset + (page % SEGMENT_BLOCKS) * BLOCK_SIZE as u64 + 100;
        let byte = device.peek(at, 1)[0];
        device.poke(at, &[byte ^ 0xff]);

        let outcome = recover(&test.restart()).unwrap();
        assert_eq!(outcome.replayed_pages, 1);
        assert_eq!(outcome.live_objects, 7);

        reset_checkpoint(&test);
        let fresh = test.restart();
        let config = updater_config();
        let (table, log) = pools(&config);
        let err = Updater::new(&fresh.shard, &config, &table, &log)
            .merge_online(LogId::Zero, range(2))
            .unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { structure: "log page", .. }));
    }

    #[test]
    fn test_recovery_tracks_tombstones() {
        let test = TestShard::format(ShardFlags::PERSISTENT | ShardFlags::REPLICATED);
        let base = test.data_start();
        let records = [
            LogRecord::create(1, 0, base, 2, 1),
            LogRecord::create(2, 1, base + 2, 2, 2),
            LogRecord::delete(1, 0, base, 3).with_tombstone(),
            LogRecord::overwrite(2, 1, base + 8, 2, 4, base + 2),
        ];
        write_log(&test.shard, LogId::Zero, 1, &records);
        let restarted = test.restart();
        let outcome = recover(&restarted).unwrap();
        assert_eq!(outcome.live_objects, 1);
        assert_eq!(outcome.tombstones, 2);
        let held: Vec<_> = restarted.shard.tombstones.lock().iter().map(|t| (t.offset, t.seqno)).collect();
        assert_eq!(held, vec![(base, 3), (base + 2, 4)]);
        assert!(restarted.alloc.is_allocated(ShardId::new(0), base));

        restarted.shard.tombstones.lock().set_rtg(4);
        let freed = restarted.shard.tombstones.lock().prune(restarted.alloc.as_ref()).unwrap();
        assert_eq!(freed, 1);
        assert!(!restarted.alloc.is_allocated(ShardId::new(0), base));
    }

    #[test]
    fn test_updater_thread_merges_and_releases() {
        let test = TestShard::format(ShardFlags::PERSISTENT);
        let base = test.data_start();
        let high = write_log(&test.shard, LogId::Zero, 1, &[LogRecord::create(9, 4, base, 1, 1)]);
        let config = updater_config();
        let (table, log) = pools(&config);
        let mut thread = UpdaterThread::spawn("updater-test".into(), config, table, log, false).unwrap();
        test.shard.log_reuse.acquire();
        thread
            .sender()
            .send(UpdaterMsg::Merge {
                shard: Arc::clone(&test.shard),
                log: LogId::Zero,
                range: range(high),
            })
            .unwrap();
        // Released by the updater once the merge lands
        test.shard.log_reuse.acquire();
        assert_eq!(test.shard.checkpoint_lsn(), high);
        thread.shutdown();
    }

    #[test]
    fn test_recovery_drops_tombstone_under_live_object() {
        let test = TestShard::format(ShardFlags::PERSISTENT | ShardFlags::REPLICATED);
        let base = test.data_start();
        let shard = ShardId::new(0);
        // The tombstone was freed before the crash and its blocks went to a new object
        let records = [
            LogRecord::create(1, 0, base + 10, 2, 1),
            LogRecord::delete(1, 0, base + 10, 2).with_tombstone(),
            LogRecord::create(2, 0, base + 9, 4, 3),
        ];
        write_log(&test.shard, LogId::Zero, 1, &records);
        let restarted = test.restart();
        let outcome = recover(&restarted).unwrap();
        assert_eq!(table_entry(&restarted.shard, base + 10).flags, ENTRY_TOMBSTONE);
        assert_eq!(outcome.live_objects, 1);
        assert_eq!(outcome.tombstones, 0);
        assert!(restarted.shard.tombstones.lock().is_empty());

        restarted.shard.tombstones.lock().set_rtg(10);
        let freed = restarted.shard.tombstones.lock().prune(restarted.alloc.as_ref()).unwrap();
        assert_eq!(freed, 0);
        for block in base + 9..base + 13 {
            assert!(restarted.alloc.is_allocated(shard, block));
        }
        assert_eq!(restarted.alloc.deallocate(shard, base + 9).unwrap(), 4);
    }

    #[test]
    fn test_recovery_orders_logs_by_checkpoint() {
        let test = TestShard::format(ShardFlags::PERSISTENT);
        let base = test.data_start();
        // Log 1 was merged up to LSN 11 and still holds page 12
        write_log_at(&test.shard, LogId::One, 0, 10, &[LogRecord::create(1, 0, base, 1, 1)]);
        write_log_at(&test.shard, LogId::One, 1, 11, &[LogRecord::create(1, 1, base + 1, 1, 2)]);
        write_log_at(&test.shard, LogId::One, 2, 12, &[LogRecord::create(1, 2, base + 2, 1, 3)]);
        // Log 0 starts with a stale page below both logs, then newer pages
        write_log_at(&test.shard, LogId::Zero, 0, 1, &[LogRecord::create(9, 9, base + 20, 1, 1)]);
        write_log_at(&test.shard, LogId::Zero, 1, 13, &[LogRecord::create(1, 3, base + 3, 1, 4)]);
        test.shard.raise_checkpoint(11).unwrap();

        let outcome = recover(&test).unwrap();
        assert_eq!(outcome.replayed_pages, 2);
        assert_eq!(outcome.checkpoint_lsn, 13);
        assert!(table_entry(&test.shard, base + 2).is_live());
        assert!(table_entry(&test.shard, base + 3).is_live());
        assert!(table_entry(&test.shard, base + 20).is_empty());
        assert_eq!(outcome.highest_seqno, 4);
    }
}
