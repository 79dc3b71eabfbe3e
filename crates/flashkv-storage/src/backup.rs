//! Backup and restore coordination
//!
//! Every shard keeps two bitmaps per segment: blocks holding live objects
//! (alloc) and blocks changed since the last completed backup (update). A
//! backup freezes a copy of both at a seqno boundary. The copy is taken in
//! the log writer's post-write step of the target flush so that it reflects
//! exactly the records with seqno up to the boundary:
//!
//! - records above the boundary seen before the snapshot are deferred and
//!   applied to the live bitmaps once the snapshot exists
//! - records at or below the boundary seen after the snapshot are replayed
//!   into the snapshot
//!
//! Update tracking lives in memory only. After a restart the first backup
//! must be a full one.

use crate::block::{BlockBitmap, Extent};
use crate::layout::LogRecord;
use flashkv_common::{Error, Result, Seqno, ShardId};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::{debug, info};

const IDLE: u8 = 0;
const BACKUP: u8 = 1;
const RESTORE: u8 = 2;

/// What a backup or restore covers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackupKind {
    /// Every allocated block
    Full,
    /// Blocks changed since the previous completed backup
    Incremental,
}

type SegmentBitmaps = Vec<Option<BlockBitmap>>;

struct Snapshot {
    alloc: SegmentBitmaps,
    update: SegmentBitmaps,
}

struct Session {
    kind: BackupKind,
    boundary: Seqno,
    target_flush: u64,
    snapshot: Option<Snapshot>,
    deferred: Vec<LogRecord>,
}

struct Inner {
    alloc: SegmentBitmaps,
    update: SegmentBitmaps,
    /// Live object extents by start block
    objects: BTreeMap<u64, u32>,
    /// Update bitmaps cover everything since the last completed backup
    tracking: bool,
    session: Option<Session>,
}

/// Per-shard backup state
pub struct BackupCoordinator {
    shard: ShardId,
    segment_blocks: u64,
    activity: AtomicU8,
    inner: Mutex<Inner>,
}

fn bitmap_apply(
    bitmaps: &mut SegmentBitmaps,
    segment_blocks: u64,
    offset: u64,
    blocks: u64,
    set: bool,
) -> Result<()> {
    let mut block = offset;
    let end = offset + blocks;
    while block < end {
        let segment = (block / segment_blocks) as usize;
        let within = block % segment_blocks;
        let length = (segment_blocks - within).min(end - block);
        let total = bitmaps.len();
        let slot = bitmaps.get_mut(segment).ok_or_else(|| {
            Error::consistency(format!("block {block} lies beyond the shard's {total} segments"))
        })?;
        let bitmap = slot.get_or_insert_with(|| BlockBitmap::new(segment_blocks));
        let extent = Extent::new(within, length);
        if set {
            bitmap.set_extent(&extent)?;
        } else {
            // Blocks a delete names may already be clear in the update copy
            for b in within..within + length {
                if bitmap.is_set(b) {
                    bitmap.clear_extent(&Extent::new(b, 1))?;
                }
            }
        }
        block += length;
    }
    Ok(())
}

fn bitmap_extents(bitmaps: &SegmentBitmaps, segment_blocks: u64) -> Vec<Extent> {
    let mut out: Vec<Extent> = Vec::new();
    for (segment, bitmap) in bitmaps.iter().enumerate() {
        let Some(bitmap) = bitmap else { continue };
        let base = segment as u64 * segment_blocks;
        for extent in bitmap.extents() {
            let extent = Extent::new(base + extent.start, extent.length);
            match out.last_mut().and_then(|last| last.try_merge(&extent).map(|m| (last, m))) {
                Some((last, merged)) => *last = merged,
                None => out.push(extent),
            }
        }
    }
    out
}

fn bitmap_union(into: &mut SegmentBitmaps, from: &SegmentBitmaps) {
    for (slot, other) in into.iter_mut().zip(from) {
        if let Some(other) = other {
            match slot {
                Some(bitmap) => bitmap.union_with(other),
                None => *slot = Some(other.clone()),
            }
        }
    }
}

/// Block changes a record implies: `(offset, blocks, set)`
fn record_changes(objects: &BTreeMap<u64, u32>, record: &LogRecord) -> Vec<(u64, u64, bool)> {
    let mut changes = Vec::with_capacity(2);
    let removed = |offset: u64| (offset, u64::from(objects.get(&offset).copied().unwrap_or(1)), false);
    if record.is_delete() {
        changes.push(removed(record.offset));
    } else {
        if let Some(old) = record.superseded {
            changes.push(removed(old));
        }
        changes.push((record.offset, u64::from(record.blocks), true));
    }
    changes
}

impl Inner {
    fn apply_live(&mut self, segment_blocks: u64, record: &LogRecord, mark_update: bool) -> Result<()> {
        for (offset, blocks, set) in record_changes(&self.objects, record) {
            bitmap_apply(&mut self.alloc, segment_blocks, offset, blocks, set)?;
            if mark_update {
                bitmap_apply(&mut self.update, segment_blocks, offset, blocks, true)?;
            }
        }
        if record.is_delete() {
            self.objects.remove(&record.offset);
        } else {
            if let Some(old) = record.superseded {
                self.objects.remove(&old);
            }
            self.objects.insert(record.offset, record.blocks);
        }
        Ok(())
    }
}

impl BackupCoordinator {
    pub fn new(shard: ShardId, segment_blocks: u64, total_segments: u64) -> Self {
        Self {
            shard,
            segment_blocks,
            activity: AtomicU8::new(IDLE),
            inner: Mutex::new(Inner {
                alloc: vec![None; total_segments as usize],
                update: vec![None; total_segments as usize],
                objects: BTreeMap::new(),
                tracking: false,
                session: None,
            }),
        }
    }

    /// Record an object found live by recovery
    pub fn note_recovered(&self, offset: u64, blocks: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        bitmap_apply(&mut inner.alloc, self.segment_blocks, offset, u64::from(blocks), true)?;
        inner.objects.insert(offset, blocks);
        Ok(())
    }

    /// Live objects known to the coordinator
    pub fn object_count(&self) -> usize {
        self.inner.lock().objects.len()
    }

    fn enter(&self, to: u8) -> Result<()> {
        loop {
            match self
                .activity
                .compare_exchange_weak(IDLE, to, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(()),
                Err(IDLE) => std::thread::yield_now(),
                Err(current) => {
                    let what = if current == BACKUP { "backup" } else { "restore" };
                    return Err(Error::Busy(format!("{} {what} in progress", self.shard)));
                }
            }
        }
    }

    fn leave(&self) {
        self.activity.store(IDLE, Ordering::Release);
    }

    /// Begin a backup of everything up to `boundary`
    ///
    /// `boundary` is the last seqno handed out when the backup starts, so
    /// records at or below it belong to the backup. This is the same cut as
    /// excluding everything from the next seqno on. The snapshot is taken when
    /// flush `target_flush` is post-processed; the caller forces that flush.
    pub fn backup_start(&self, kind: BackupKind, boundary: Seqno, target_flush: u64) -> Result<()> {
        self.enter(BACKUP)?;
        let mut inner = self.inner.lock();
        if kind == BackupKind::Incremental && !inner.tracking {
            drop(inner);
            self.leave();
            return Err(Error::invalid_argument(format!(
                "{} has no completed full backup since open",
                self.shard
            )));
        }
        inner.session = Some(Session {
            kind,
            boundary,
            target_flush,
            snapshot: None,
            deferred: Vec::new(),
        });
        info!(
            "{} {kind:?} backup started at seqno {boundary}, snapshot at flush {target_flush}",
            self.shard
        );
        Ok(())
    }

    /// Writer post-write hook for flush number `flush_seq`
    pub fn on_flush(&self, flush_seq: u64, records: &[LogRecord]) -> Result<()> {
        let segment_blocks = self.segment_blocks;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(session) = inner.session.as_mut() else {
            for record in records {
                inner.apply_live(segment_blocks, record, true)?;
            }
            return Ok(());
        };

        if session.snapshot.is_none() {
            let boundary = session.boundary;
            let mut due = Vec::new();
            for record in records {
                if record.seqno > boundary {
                    session.deferred.push(*record);
                } else {
                    due.push(*record);
                }
            }
            let take = flush_seq >= session.target_flush;
            for record in &due {
                inner.apply_live(segment_blocks, record, true)?;
            }
            if !take {
                return Ok(());
            }
            let snapshot = Snapshot {
                alloc: inner.alloc.clone(),
                update: std::mem::replace(&mut inner.update, vec![None; inner.alloc.len()]),
            };
            let Some(session) = inner.session.as_mut() else {
                return Ok(());
            };
            session.snapshot = Some(snapshot);
            let deferred = std::mem::take(&mut session.deferred);
            debug!(
                "{} backup snapshot taken at flush {flush_seq}, {} deferred records",
                self.shard,
                deferred.len()
            );
            for record in &deferred {
                inner.apply_live(segment_blocks, record, true)?;
            }
            return Ok(());
        }

        let boundary = session.boundary;
        let mut pending = Vec::new();
        for record in records {
            if record.seqno <= boundary {
                pending.push(*record);
            }
        }
        // Replay pre-boundary stragglers into the frozen copy first; the
        // extents they remove are still known to the object map
        if let Some(snapshot) = session.snapshot.as_mut() {
            for record in &pending {
                for (offset, blocks, set) in record_changes(&inner.objects, record) {
                    bitmap_apply(&mut snapshot.alloc, segment_blocks, offset, blocks, set)?;
                    bitmap_apply(&mut snapshot.update, segment_blocks, offset, blocks, true)?;
                }
            }
        }
        for record in records {
            inner.apply_live(segment_blocks, record, record.seqno > boundary)?;
        }
        Ok(())
    }

    /// Blocks the active backup must copy
    pub fn backup_bitmap(&self) -> Result<Vec<Extent>> {
        let inner = self.inner.lock();
        let session = inner
            .session
            .as_ref()
            .ok_or_else(|| Error::invalid_argument(format!("{} has no active backup", self.shard)))?;
        let snapshot = session
            .snapshot
            .as_ref()
            .ok_or_else(|| Error::Busy(format!("{} backup snapshot not taken yet", self.shard)))?;
        Ok(match session.kind {
            BackupKind::Full => bitmap_extents(&snapshot.alloc, self.segment_blocks),
            BackupKind::Incremental => bitmap_extents(&snapshot.update, self.segment_blocks),
        })
    }

    /// Finish or cancel the active backup
    ///
    /// Returns the backed-up boundary seqno when the backup completed.
    pub fn backup_end(&self, cancel: bool) -> Result<Option<Seqno>> {
        if self.activity.load(Ordering::Acquire) != BACKUP {
            return Err(Error::invalid_argument(format!("{} has no active backup", self.shard)));
        }
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(mut session) = inner.session.take() else {
            return Err(Error::internal(format!("{} backup state lost", self.shard)));
        };
        let outcome = if cancel {
            if let Some(snapshot) = &session.snapshot {
                bitmap_union(&mut inner.update, &snapshot.update);
            }
            let segment_blocks = self.segment_blocks;
            let replayed = std::mem::take(&mut session.deferred)
                .iter()
                .try_for_each(|record| inner.apply_live(segment_blocks, record, true));
            info!("{} backup cancelled", self.shard);
            if let Err(err) = replayed {
                drop(guard);
                self.leave();
                return Err(err);
            }
            None
        } else {
            if session.snapshot.is_none() {
                inner.session = Some(session);
                return Err(Error::Busy(format!("{} backup snapshot not taken yet", self.shard)));
            }
            inner.tracking = true;
            info!("{} {:?} backup completed at seqno {}", self.shard, session.kind, session.boundary);
            Some(session.boundary)
        };
        drop(guard);
        self.leave();
        Ok(outcome)
    }

    /// Begin a restore
    ///
    /// A full restore needs an empty container; an incremental one must
    /// continue from the last restored seqno.
    pub fn restore_start(
        &self,
        kind: BackupKind,
        prev_seqno: Seqno,
        restored_seqno: Seqno,
        container_empty: bool,
    ) -> Result<()> {
        self.enter(RESTORE)?;
        let refused = match kind {
            BackupKind::Full if !container_empty => Some(Error::AlreadyExists(format!(
                "{} full restore into a non-empty container",
                self.shard
            ))),
            BackupKind::Incremental if prev_seqno != restored_seqno => Some(Error::invalid_argument(format!(
                "{} incremental restore from {prev_seqno}, last restored {restored_seqno}",
                self.shard
            ))),
            _ => None,
        };
        if let Some(err) = refused {
            self.leave();
            return Err(err);
        }
        info!("{} {kind:?} restore started", self.shard);
        Ok(())
    }

    pub fn restore_end(&self, cancel: bool) -> Result<()> {
        if self
            .activity
            .compare_exchange(RESTORE, IDLE, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::invalid_argument(format!("{} has no active restore", self.shard)));
        }
        info!("{} restore {}", self.shard, if cancel { "cancelled" } else { "completed" });
        Ok(())
    }

    pub fn in_backup(&self) -> bool {
        self.activity.load(Ordering::Acquire) == BACKUP
    }

    pub fn in_restore(&self) -> bool {
        self.activity.load(Ordering::Acquire) == RESTORE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> BackupCoordinator {
        BackupCoordinator::new(ShardId::new(0), 64, 8)
    }

    fn create(offset: u64, blocks: u32, seqno: Seqno) -> LogRecord {
        LogRecord::create(1, 0, offset, blocks, seqno)
    }

    #[test]
    fn test_full_backup_snapshot_is_exact() {
        let backup = coordinator();
        backup.on_flush(1, &[create(64, 2, 1), create(70, 1, 2)]).unwrap();

        backup.backup_start(BackupKind::Full, 3, 3).unwrap();
        // Flush 2 carries seqno 3 (in) and 4 (after the boundary)
        backup.on_flush(2, &[create(100, 1, 4), create(80, 1, 3)]).unwrap();
        assert!(matches!(backup.backup_bitmap(), Err(Error::Busy(_))));
        // Snapshot flush; seqno 5 is after the boundary
        backup.on_flush(3, &[create(120, 1, 5)]).unwrap();
        // A straggler from before the boundary
        backup.on_flush(4, &[LogRecord::delete(1, 0, 70, 2)]).unwrap();

        let extents = backup.backup_bitmap().unwrap();
        assert_eq!(extents, vec![Extent::new(64, 2), Extent::new(80, 1)]);
        assert_eq!(backup.backup_end(false).unwrap(), Some(3));
        assert!(!backup.in_backup());
    }

    #[test]
    fn test_incremental_requires_prior_full() {
        let backup = coordinator();
        assert!(matches!(
            backup.backup_start(BackupKind::Incremental, 1, 1),
            Err(Error::InvalidArgument(_))
        ));
        assert!(!backup.in_backup());

        backup.backup_start(BackupKind::Full, 0, 1).unwrap();
        backup.on_flush(1, &[]).unwrap();
        backup.backup_end(false).unwrap();

        backup.on_flush(2, &[create(200, 4, 10)]).unwrap();
        backup.on_flush(3, &[LogRecord::overwrite(1, 0, 300, 1, 11, 200)]).unwrap();
        backup.backup_start(BackupKind::Incremental, 11, 4).unwrap();
        backup.on_flush(4, &[create(400, 1, 12)]).unwrap();
        let extents = backup.backup_bitmap().unwrap();
        assert_eq!(extents, vec![Extent::new(200, 4), Extent::new(300, 1)]);
        backup.backup_end(false).unwrap();

        // The post-boundary create is all the next incremental sees
        backup.backup_start(BackupKind::Incremental, 12, 5).unwrap();
        backup.on_flush(5, &[]).unwrap();
        assert_eq!(backup.backup_bitmap().unwrap(), vec![Extent::new(400, 1)]);
    }

    #[test]
    fn test_cancel_keeps_changes_for_next_backup() {
        let backup = coordinator();
        backup.backup_start(BackupKind::Full, 0, 1).unwrap();
        backup.on_flush(1, &[]).unwrap();
        backup.backup_end(false).unwrap();

        backup.on_flush(2, &[create(10, 1, 1)]).unwrap();
        backup.backup_start(BackupKind::Incremental, 1, 3).unwrap();
        backup.on_flush(3, &[]).unwrap();
        assert_eq!(backup.backup_end(true).unwrap(), None);

        backup.backup_start(BackupKind::Incremental, 1, 4).unwrap();
        backup.on_flush(4, &[]).unwrap();
        assert_eq!(backup.backup_bitmap().unwrap(), vec![Extent::new(10, 1)]);
    }

    #[test]
    fn test_record_beyond_shard_is_an_error() {
        let backup = coordinator();
        // Eight 64-block segments end at block 512
        let err = backup.on_flush(1, &[create(510, 4, 1)]).unwrap_err();
        assert!(matches!(err, Error::Consistency(_)));
        assert!(matches!(backup.note_recovered(600, 1), Err(Error::Consistency(_))));
        backup.note_recovered(448, 64).unwrap();
        assert_eq!(backup.object_count(), 1);
    }

    #[test]
    fn test_backup_and_restore_exclusive() {
        let backup = coordinator();
        backup.restore_start(BackupKind::Full, 0, 0, true).unwrap();
        assert!(matches!(
            backup.backup_start(BackupKind::Full, 1, 1),
            Err(Error::Busy(_))
        ));
        backup.restore_end(false).unwrap();
        assert!(backup.restore_end(false).is_err());
    }

    #[test]
    fn test_restore_gating() {
        let backup = coordinator();
        assert!(matches!(
            backup.restore_start(BackupKind::Full, 0, 0, false),
            Err(Error::AlreadyExists(_))
        ));
        assert!(matches!(
            backup.restore_start(BackupKind::Incremental, 5, 7, true),
            Err(Error::InvalidArgument(_))
        ));
        backup.restore_start(BackupKind::Incremental, 7, 7, false).unwrap();
        assert!(backup.in_restore());
    }
}
