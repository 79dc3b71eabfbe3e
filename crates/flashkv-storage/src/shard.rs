//! Runtime state of an open shard
//!
//! Shared by the log writer, the updater and the engine front end.

use crate::backup::BackupCoordinator;
use crate::format::{ShardIo, ShardMetadata, SlabClass, class_add_segment, write_shard_blob};
use crate::layout::{Checkpoint, ShardBlob, ShardDescriptor};
use crate::mapper::SegmentAllocator;
use crate::sync::Semaphore;
use crate::tombstone::TombstoneTracker;
use flashkv_common::{Error, Lsn, Result, Seqno, ShardFlags, ShardId};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, error};

/// Open shard: I/O, metadata and the trackers fed by log writes
pub struct ShardContext {
    pub id: ShardId,
    pub flags: ShardFlags,
    pub io: ShardIo,
    pub descriptor: ShardDescriptor,
    pub alloc: Arc<dyn SegmentAllocator>,
    pub tombstones: Mutex<TombstoneTracker>,
    pub backup: BackupCoordinator,
    /// Permit to write into the log opposite the one being filled
    pub log_reuse: Semaphore,
    checkpoint: Mutex<Checkpoint>,
    classes: Mutex<Vec<SlabClass>>,
    blob: Mutex<ShardBlob>,
    last_seqno: AtomicU64,
    failed: AtomicBool,
}

impl ShardContext {
    pub fn new(
        io: ShardIo,
        metadata: ShardMetadata,
        alloc: Arc<dyn SegmentAllocator>,
        tombstone_slab: usize,
    ) -> Self {
        let descriptor = metadata.descriptor;
        let id = descriptor.shard_id;
        Self {
            id,
            flags: descriptor.flags,
            backup: BackupCoordinator::new(id, io.segment_blocks(), descriptor.total_segments),
            io,
            alloc,
            tombstones: Mutex::new(TombstoneTracker::new(id, tombstone_slab)),
            log_reuse: Semaphore::new(1),
            checkpoint: Mutex::new(metadata.checkpoint),
            classes: Mutex::new(metadata.classes),
            blob: Mutex::new(metadata.blob),
            last_seqno: AtomicU64::new(0),
            failed: AtomicBool::new(false),
            descriptor,
        }
    }

    pub fn checkpoint_lsn(&self) -> Lsn {
        self.checkpoint.lock().lsn
    }

    /// Durably raise the checkpoint; lower values are ignored
    pub fn raise_checkpoint(&self, lsn: Lsn) -> Result<bool> {
        let mut checkpoint = self.checkpoint.lock();
        if lsn <= checkpoint.lsn {
            return Ok(false);
        }
        let next = Checkpoint {
            shard_id: self.id,
            lsn,
            generation: checkpoint.generation + 1,
        };
        self.io.write_metadata(self.descriptor.checkpoint_offset, &next)?;
        self.io.sync()?;
        debug!("{} checkpoint raised {} -> {lsn}", self.id, checkpoint.lsn);
        *checkpoint = next;
        Ok(true)
    }

    /// Hand out the next object seqno
    pub fn allocate_seqno(&self) -> Seqno {
        self.last_seqno.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Highest seqno handed out or recovered
    pub fn last_seqno(&self) -> Seqno {
        self.last_seqno.load(Ordering::Acquire)
    }

    pub fn observe_seqno(&self, seqno: Seqno) {
        self.last_seqno.fetch_max(seqno, Ordering::AcqRel);
    }

    /// Segment to slab class lookup
    pub fn class_of_segment(&self) -> Vec<(u64, usize)> {
        self.classes
            .lock()
            .iter()
            .enumerate()
            .flat_map(|(index, class)| class.segments.iter().map(move |&seg| (seg, index)))
            .collect()
    }

    pub fn class_count(&self) -> usize {
        self.classes.lock().len()
    }

    /// Durably hand a segment to a slab class
    pub fn add_class_segment(&self, class_index: usize, segment: u64) -> Result<()> {
        let mut classes = self.classes.lock();
        let mut meta = ShardMetadata {
            descriptor: self.descriptor.clone(),
            classes: std::mem::take(&mut *classes),
            blob: ShardBlob::default(),
            checkpoint: Checkpoint::default(),
        };
        let result = class_add_segment(&self.io, &mut meta, class_index, segment);
        *classes = meta.classes;
        result
    }

    pub fn blob(&self) -> Vec<u8> {
        self.blob.lock().data.clone()
    }

    pub fn put_blob(&self, data: &[u8]) -> Result<()> {
        let mut blob = self.blob.lock();
        *blob = write_shard_blob(&self.io, &self.descriptor, data)?;
        Ok(())
    }

    /// Latch a fatal failure; later log operations are refused
    pub fn fail(&self, err: &Error) {
        if !self.failed.swap(true, Ordering::AcqRel) {
            error!("{} failed: {err}", self.id);
        }
        // Unblock a writer waiting to reuse a log
        self.log_reuse.release();
    }

    pub fn check_failed(&self) -> Result<()> {
        if self.failed.load(Ordering::Acquire) {
            return Err(Error::corruption(format!("{} is failed", self.id)));
        }
        Ok(())
    }
}
