use super::{LogBuffer, LogPosition, LogRange, LogStats};
use crate::layout::LogRecord;
use crate::shard::ShardContext;
use crate::sync::{Completion, Semaphore};
use crate::tombstone::Tombstone;
use crate::updater::UpdaterMsg;
use crossbeam_channel::{Receiver, Sender};
use flashkv_common::config::LogConfig;
use flashkv_common::{Error, LogId, Lsn, Result};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// Free log buffers
struct BufferRing {
    free: Mutex<Vec<LogBuffer>>,
    permits: Semaphore,
}

impl BufferRing {
    fn new(count: usize, pages: usize) -> Self {
        Self {
            free: Mutex::new((0..count).map(|_| LogBuffer::new(pages)).collect()),
            permits: Semaphore::new(count),
        }
    }

    fn take(&self) -> Result<LogBuffer> {
        self.permits.acquire();
        self.free
            .lock()
            .pop()
            .ok_or_else(|| Error::internal("log buffer ring out of step with its semaphore"))
    }

    fn put(&self, buffer: LogBuffer) {
        self.free.lock().push(buffer);
        self.permits.release();
    }
}

struct FillState {
    active: Option<LogBuffer>,
    /// LSN of the next fresh page
    next_lsn: Lsn,
    /// Where the next bound buffer starts
    log: LogId,
    next_page: u64,
}

enum WriterMsg {
    Flush {
        buffer: Option<LogBuffer>,
        sync: bool,
        reply: Option<Arc<Completion<Option<LogBuffer>>>>,
    },
    Shutdown,
}

struct Shared {
    stats: Mutex<LogStats>,
    flush_seq: AtomicU64,
}

/// Log writer of one shard
///
/// Fillers append under the shared side of the mode lock; `sync` takes the
/// exclusive side so no record is appended while the open buffer is out.
pub struct LogWriter {
    shard: Arc<ShardContext>,
    buffer_pages: usize,
    log_pages: u64,
    mode: RwLock<()>,
    fill: Mutex<FillState>,
    ring: Arc<BufferRing>,
    shared: Arc<Shared>,
    tx: Sender<WriterMsg>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LogWriter {
    /// Start the writer thread, resuming at `resume`
    pub fn start(
        shard: Arc<ShardContext>,
        config: &LogConfig,
        resume: LogPosition,
        updater: Sender<UpdaterMsg>,
    ) -> Result<Self> {
        let buffer_pages = config.buffer_pages as usize;
        let log_pages = shard.descriptor.log_pages();
        let ring = Arc::new(BufferRing::new(config.buffer_count as usize, buffer_pages));
        let shared = Arc::new(Shared {
            stats: Mutex::new(LogStats {
                last_lsn: resume.lsn.saturating_sub(1),
                ..LogStats::default()
            }),
            flush_seq: AtomicU64::new(0),
        });
        let (tx, rx) = crossbeam_channel::unbounded();

        let worker = Worker {
            shard: Arc::clone(&shard),
            ring: Arc::clone(&ring),
            shared: Arc::clone(&shared),
            updater,
            log_pages,
            sync_threshold: u64::from(config.sync_threshold.max(1)),
            last_lsn: resume.lsn.saturating_sub(1),
            current_log: resume.log,
            ranges: [LogRange::EMPTY; 2],
            unsynced: 0,
            deallocs: Vec::new(),
            tombstones: Vec::new(),
        };
        let handle = std::thread::Builder::new()
            .name(format!("rlog-{}", shard.id))
            .spawn(move || worker.run(rx))?;

        info!(
            "{} log writer resuming at {} page {} LSN {}",
            shard.id, resume.log, resume.page, resume.lsn
        );
        Ok(Self {
            buffer_pages,
            log_pages,
            mode: RwLock::new(()),
            fill: Mutex::new(FillState {
                active: None,
                next_lsn: resume.lsn,
                log: resume.log,
                next_page: resume.page,
            }),
            ring,
            shared,
            tx,
            worker: Mutex::new(Some(handle)),
            shard,
        })
    }

    fn bind(&self, fill: &mut FillState, buffer: &mut LogBuffer) {
        let limit = (self.log_pages - fill.next_page).min(self.buffer_pages as u64) as usize;
        buffer.reset(fill.log, fill.next_page, limit);
        fill.next_page += limit as u64;
        if fill.next_page >= self.log_pages {
            fill.log = fill.log.other();
            fill.next_page = 0;
        }
    }

    fn send(&self, msg: WriterMsg) -> Result<()> {
        self.tx.send(msg).map_err(|_| Error::ShuttingDown)
    }

    /// Append one record; blocks while every buffer is being written
    pub fn append(&self, record: &LogRecord) -> Result<()> {
        self.shard.check_failed()?;
        let _mode = self.mode.read();
        let mut fill = self.fill.lock();
        if fill.active.is_none() {
            drop(fill);
            let mut buffer = self.ring.take()?;
            fill = self.fill.lock();
            if fill.active.is_some() {
                // Another filler bound a buffer meanwhile
                self.ring.put(buffer);
            } else {
                self.bind(&mut fill, &mut buffer);
                fill.active = Some(buffer);
            }
        }

        let FillState {
            active, next_lsn, ..
        } = &mut *fill;
        let Some(buffer) = active.as_mut() else {
            return Err(Error::internal("no active log buffer after binding"));
        };
        buffer.append(record, next_lsn);
        if buffer.is_full() {
            // Queue it before releasing the fill lock: the next buffer carries
            // higher LSNs and must reach the writer thread after this one
            let full = fill.active.take();
            self.send(WriterMsg::Flush {
                buffer: full,
                sync: false,
                reply: None,
            })?;
        }
        Ok(())
    }

    /// Write out everything appended so far and sync the devices
    pub fn sync(&self) -> Result<()> {
        self.shard.check_failed()?;
        let _mode = self.mode.write();
        let buffer = self.fill.lock().active.take();
        let done = Arc::new(Completion::new());
        self.send(WriterMsg::Flush {
            buffer,
            sync: true,
            reply: Some(Arc::clone(&done)),
        })?;
        if let Some(buffer) = done.wait()? {
            self.fill.lock().active = Some(buffer);
        }
        Ok(())
    }

    /// Flushes post-processed so far
    pub fn flush_seq(&self) -> u64 {
        self.shared.flush_seq.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> LogStats {
        *self.shared.stats.lock()
    }

    /// Sync outstanding records and stop the writer thread
    pub fn shutdown(&self) -> Result<()> {
        let synced = if self.shard.check_failed().is_ok() {
            self.sync()
        } else {
            Ok(())
        };
        self.stop();
        synced
    }

    fn stop(&self) {
        if let Some(handle) = self.worker.lock().take() {
            let _ = self.tx.send(WriterMsg::Shutdown);
            if handle.join().is_err() {
                warn!("{} log writer thread panicked", self.shard.id);
            }
        }
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State owned by the writer thread
struct Worker {
    shard: Arc<ShardContext>,
    ring: Arc<BufferRing>,
    shared: Arc<Shared>,
    updater: Sender<UpdaterMsg>,
    log_pages: u64,
    sync_threshold: u64,
    /// Highest LSN written
    last_lsn: Lsn,
    current_log: LogId,
    ranges: [LogRange; 2],
    /// Records written since the last device sync
    unsynced: u64,
    /// Offsets freed once the next sync lands
    deallocs: Vec<u64>,
    tombstones: Vec<Tombstone>,
}

impl Worker {
    fn run(mut self, rx: Receiver<WriterMsg>) {
        while let Ok(msg) = rx.recv() {
            match msg {
                WriterMsg::Flush {
                    mut buffer,
                    sync,
                    reply,
                } => {
                    let outcome = self.flush(&mut buffer, sync);
                    if let Err(err) = &outcome {
                        self.shard.fail(err);
                    }
                    let keep = match buffer {
                        Some(b) if outcome.is_ok() && reply.is_some() && !b.is_full() => Some(b),
                        Some(b) => {
                            self.ring.put(b);
                            None
                        }
                        None => None,
                    };
                    if let Some(reply) = reply {
                        reply.finish(outcome.map(|()| keep));
                    }
                }
                WriterMsg::Shutdown => break,
            }
        }
        debug!("{} log writer stopped at LSN {}", self.shard.id, self.last_lsn);
    }

    fn flush(&mut self, buffer: &mut Option<LogBuffer>, sync: bool) -> Result<()> {
        self.shard.check_failed()?;
        let mut filled = None;
        let mut records = Vec::new();
        if let Some(buffer) = buffer.as_mut() {
            let log = buffer.log();
            records = self.write_buffer(buffer)?;
            for (_, record) in &records {
                for offset in record.touched() {
                    self.ranges[log.index()].note_offset(offset);
                }
            }
            if buffer.is_full() && buffer.start_page() + buffer.limit_pages() as u64 >= self.log_pages {
                filled = Some(log);
            }
        }

        self.post_write(&records)?;
        if sync || filled.is_some() || self.unsynced >= self.sync_threshold {
            self.sync_devices()?;
        }
        if let Some(log) = filled {
            self.hand_off(log)?;
        }
        Ok(())
    }

    fn write_buffer(&mut self, buffer: &mut LogBuffer) -> Result<Vec<(Lsn, LogRecord)>> {
        let log = buffer.log();
        if log != self.current_log {
            self.switch_to(log)?;
        }
        let (first, rewrite) = buffer.write_start();
        let end = buffer.used_pages();
        if first < end {
            for page in first..end {
                let lsn = buffer.page_lsn(page);
                let expected = if page == first && rewrite {
                    self.last_lsn
                } else {
                    self.last_lsn + 1
                };
                if lsn != expected {
                    return Err(Error::consistency(format!(
                        "{} {log} page {} carries LSN {lsn}, expected {expected}",
                        self.shard.id,
                        buffer.start_page() + page as u64
                    )));
                }
                self.last_lsn = lsn;
                self.ranges[log.index()].note_page(lsn);
            }
            let block = self.shard.descriptor.log_offsets[log.index()] + buffer.start_page() + first as u64;
            let count = (end - first) as u64;
            self.shard.io.check_within_segment(block, count)?;
            self.shard.io.write(block, buffer.seal(first, end))?;

            let mut stats = self.shared.stats.lock();
            stats.pages_written += count;
            stats.last_lsn = self.last_lsn;
        }
        buffer.mark_written();
        Ok(buffer.take_unprocessed())
    }

    fn switch_to(&mut self, log: LogId) -> Result<()> {
        debug!("{} waiting to reuse {log}", self.shard.id);
        self.shard.log_reuse.acquire();
        self.shard.check_failed()?;
        self.current_log = log;
        self.shared.stats.lock().log_switches += 1;
        Ok(())
    }

    fn post_write(&mut self, records: &[(Lsn, LogRecord)]) -> Result<()> {
        let retains = self.shard.flags.retains_tombstones();
        let mut plain = Vec::with_capacity(records.len());
        for (_, record) in records {
            self.shard.observe_seqno(record.seqno);
            let released = record
                .is_delete()
                .then_some(record.offset)
                .into_iter()
                .chain(record.superseded);
            for offset in released {
                if retains {
                    self.tombstones.push(Tombstone {
                        syndrome: record.syndrome,
                        offset,
                        seqno: record.seqno,
                    });
                } else {
                    self.deallocs.push(offset);
                }
            }
            plain.push(*record);
        }
        let seq = self.shared.flush_seq.fetch_add(1, Ordering::AcqRel) + 1;
        self.shard.backup.on_flush(seq, &plain)?;
        self.unsynced += records.len() as u64;

        let mut stats = self.shared.stats.lock();
        stats.records += records.len() as u64;
        stats.flushes += 1;
        Ok(())
    }

    fn sync_devices(&mut self) -> Result<()> {
        self.shard.io.sync()?;
        self.unsynced = 0;

        let added = self.tombstones.len() as u64;
        {
            let mut tracker = self.shard.tombstones.lock();
            for t in self.tombstones.drain(..) {
                tracker.add(t.syndrome, t.offset, t.seqno);
            }
            tracker.prune(self.shard.alloc.as_ref())?;
        }
        let freed = self.deallocs.len() as u64;
        for offset in self.deallocs.drain(..) {
            self.shard.alloc.deallocate(self.shard.id, offset)?;
        }

        let mut stats = self.shared.stats.lock();
        stats.syncs += 1;
        stats.tombstones += added;
        stats.deallocations += freed;
        Ok(())
    }

    fn hand_off(&mut self, log: LogId) -> Result<()> {
        let range = std::mem::take(&mut self.ranges[log.index()]);
        info!(
            "{} {log} full, merging LSNs {}..={}",
            self.shard.id, range.first_lsn, range.high_lsn
        );
        self.updater
            .send(UpdaterMsg::Merge {
                shard: Arc::clone(&self.shard),
                log,
                range,
            })
            .map_err(|_| Error::ShuttingDown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{LogPage, PageCheck};
    use crate::raw_io::AlignedBuffer;
    use crate::testutil::{TestShard, log_config};
    use flashkv_common::config::LogConfig;
    use flashkv_common::{ShardFlags, ShardId};
    use std::time::Duration;

    const START: LogPosition = LogPosition {
        log: LogId::Zero,
        page: 0,
        lsn: 1,
    };

    fn writer(test: &TestShard) -> (LogWriter, Receiver<UpdaterMsg>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let writer = LogWriter::start(Arc::clone(&test.shard), &log_config(), START, tx).unwrap();
        (writer, rx)
    }

    fn read_page(test: &TestShard, log: LogId, page: u64) -> Vec<u8> {
        let mut buf = AlignedBuffer::blocks(1);
        test.shard
            .io
            .read(test.shard.descriptor.log_offsets[log.index()] + page, buf.as_mut_slice())
            .unwrap();
        buf.as_slice().to_vec()
    }

    #[test]
    fn test_sync_writes_sealed_pages() {
        let test = TestShard::format(ShardFlags::PERSISTENT);
        let (writer, _rx) = writer(&test);
        let base = test.data_start();
        for i in 0..10 {
            writer.append(&LogRecord::create(1, i, base + i, 1, i + 1)).unwrap();
        }
        writer.sync().unwrap();

        let stats = writer.stats();
        assert_eq!(stats.records, 10);
        assert_eq!(stats.pages_written, 2);
        assert_eq!(stats.syncs, 1);
        assert_eq!(stats.last_lsn, 2);
        assert_eq!(writer.flush_seq(), 1);
        assert_eq!(LogPage::check(&read_page(&test, LogId::Zero, 0)).unwrap(), PageCheck::Valid(1));
        let second = read_page(&test, LogId::Zero, 1);
        assert_eq!(LogPage::check(&second).unwrap(), PageCheck::Valid(2));
        assert_eq!(LogPage::records(&second).count(), 3);
        assert_eq!(test.shard.last_seqno(), 10);
        writer.shutdown().unwrap();
    }

    #[test]
    fn test_partial_page_rewritten_under_same_lsn() {
        let test = TestShard::format(ShardFlags::PERSISTENT);
        let (writer, _rx) = writer(&test);
        let base = test.data_start();
        for i in 0..3 {
            writer.append(&LogRecord::create(1, i, base + i, 1, i + 1)).unwrap();
        }
        writer.sync().unwrap();
        for i in 3..5 {
            writer.append(&LogRecord::create(1, i, base + i, 1, i + 1)).unwrap();
        }
        writer.sync().unwrap();

        let page = read_page(&test, LogId::Zero, 0);
        assert_eq!(LogPage::check(&page).unwrap(), PageCheck::Valid(1));
        assert_eq!(LogPage::records(&page).count(), 5);
        assert_eq!(writer.stats().last_lsn, 1);
        assert_eq!(writer.stats().pages_written, 2);
    }

    #[test]
    fn test_delete_frees_blocks_after_sync() {
        let test = TestShard::format(ShardFlags::PERSISTENT);
        let (writer, _rx) = writer(&test);
        let shard = ShardId::new(0);
        let offset = test.alloc.allocate(shard, 4).unwrap();
        writer.append(&LogRecord::create(2, 7, offset, 4, 1)).unwrap();
        writer.append(&LogRecord::delete(2, 7, offset, 2)).unwrap();
        assert!(test.alloc.is_allocated(shard, offset));
        writer.sync().unwrap();
        assert!(!test.alloc.is_allocated(shard, offset));
        assert_eq!(writer.stats().deallocations, 1);
    }

    #[test]
    fn test_retaining_shard_keeps_tombstones() {
        let test = TestShard::format(ShardFlags::PERSISTENT | ShardFlags::REPLICATED);
        let (writer, _rx) = writer(&test);
        let shard = ShardId::new(0);
        let offset = test.alloc.allocate(shard, 4).unwrap();
        writer.append(&LogRecord::create(2, 7, offset, 4, 1)).unwrap();
        writer.append(&LogRecord::delete(2, 7, offset, 2).with_tombstone()).unwrap();
        writer.sync().unwrap();
        assert!(test.alloc.is_allocated(shard, offset));
        assert_eq!(test.shard.tombstones.lock().len(), 1);
        assert_eq!(writer.stats().tombstones, 1);
    }

    #[test]
    fn test_full_log_handed_to_updater() {
        let test = TestShard::format(ShardFlags::PERSISTENT);
        let (writer, rx) = writer(&test);
        let base = test.data_start();
        let log_pages = test.shard.descriptor.log_pages();
        let per_log = log_pages * crate::layout::RECORDS_PER_PAGE as u64;
        for i in 0..per_log + 3 {
            writer.append(&LogRecord::create(1, i, base + i, 1, i + 1)).unwrap();
        }
        match rx.recv_timeout(Duration::from_secs(10)).unwrap() {
            UpdaterMsg::Merge { log, range, .. } => {
                assert_eq!(log, LogId::Zero);
                assert_eq!((range.first_lsn, range.high_lsn), (1, log_pages));
                assert_eq!(range.low_offset, base);
            }
            UpdaterMsg::Shutdown => panic!("unexpected shutdown"),
        }
        // The opposite log was free, so writing carries on there
        writer.sync().unwrap();
        assert_eq!(
            LogPage::check(&read_page(&test, LogId::One, 0)).unwrap(),
            PageCheck::Valid(log_pages + 1)
        );
        assert_eq!(writer.stats().log_switches, 1);
        assert_eq!(test.shard.log_reuse.available(), 0);
    }

    #[test]
    fn test_concurrent_appends_keep_lsn_order() {
        let test = TestShard::format(ShardFlags::PERSISTENT);
        let (tx, _rx) = crossbeam_channel::unbounded();
        // One-page buffers so fillers hand buffers over constantly
        let config = LogConfig {
            buffer_pages: 1,
            buffer_count: 4,
            sync_threshold: 64,
        };
        let writer = LogWriter::start(Arc::clone(&test.shard), &config, START, tx).unwrap();
        let shard = ShardId::new(0);
        let allocated = test.alloc.allocated_blocks(shard);
        const THREADS: u64 = 8;
        const PAIRS: u64 = 6;

        std::thread::scope(|scope| {
            for t in 0..THREADS {
                let writer = &writer;
                let test = &test;
                scope.spawn(move || {
                    for i in 0..PAIRS {
                        let syndrome = t * PAIRS + i;
                        let offset = test.alloc.allocate(shard, 1).unwrap();
                        let seqno = test.shard.allocate_seqno();
                        writer.append(&LogRecord::create(1, syndrome, offset, 1, seqno)).unwrap();
                        let seqno = test.shard.allocate_seqno();
                        writer.append(&LogRecord::delete(1, syndrome, offset, seqno)).unwrap();
                    }
                });
            }
        });
        writer.sync().unwrap();
        assert!(test.shard.check_failed().is_ok());

        let total = THREADS * PAIRS * 2;
        let pages = total.div_ceil(crate::layout::RECORDS_PER_PAGE as u64);
        let stats = writer.stats();
        assert_eq!(stats.records, total);
        assert_eq!(stats.last_lsn, pages);
        for page in 0..pages {
            assert_eq!(
                LogPage::check(&read_page(&test, LogId::Zero, page)).unwrap(),
                PageCheck::Valid(page + 1)
            );
        }
        assert_eq!(test.alloc.allocated_blocks(shard), allocated);
        writer.shutdown().unwrap();
    }

    #[test]
    fn test_write_failure_fails_shard() {
        let test = TestShard::format(ShardFlags::PERSISTENT);
        let (writer, _rx) = writer(&test);
        writer.append(&LogRecord::create(1, 0, test.data_start(), 1, 1)).unwrap();
        for mem in &test.mems {
            mem.set_fail_writes(true);
        }
        assert!(writer.sync().is_err());
        let err = writer.append(&LogRecord::create(1, 1, test.data_start() + 1, 1, 2)).unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
    }
}
