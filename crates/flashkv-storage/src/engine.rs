//! Recovery engine context
//!
//! [`RecoveryEngine`] owns everything the persistence core needs for one flash
//! pool: the devices, the replicated superblock, the segment allocator, the
//! updater buffer pools and the open shards with their log writers and
//! updater threads. It is built when the pool is opened and torn down when
//! it closes.

use crate::backup::BackupKind;
use crate::block::Extent;
use crate::format::{ShardIo, load_shard_metadata, plan_shard, shard_format};
use crate::layout::{FORMAT_VERSION, LOG_FORMAT_VERSION, LogRecord, MAX_CONTAINER_NAME, ShardProperties};
use crate::mapper::{SegmentAllocator, StripedAllocator};
use crate::pool::BufferPool;
use crate::raw_io::{BlockDevice, RawFile};
use crate::rlog::{LogStats, LogWriter};
use crate::shard::ShardContext;
use crate::superblock::SuperblockManager;
use crate::tombstone::TombstoneStats;
use crate::updater::{RecoveryReport, Updater, UpdaterMsg, UpdaterThread};
use crossbeam_channel::Sender;
use flashkv_common::config::UpdaterMode;
use flashkv_common::{BLOCK_SIZE, EngineConfig, Error, Result, Seqno, ShardFlags, ShardId, ShardState};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Version string exchanged with peers before replicating
pub fn protocol_version() -> String {
    format!("flashkv-recovery/{FORMAT_VERSION}.{LOG_FORMAT_VERSION}")
}

/// Report an unrecoverable error, aborting the process if configured to
pub fn fatal(err: &Error, abort: bool) {
    error!("unrecoverable error: {err}");
    if abort {
        error!("aborting to protect on-disk state");
        std::process::abort();
    }
}

/// Owner of a container metadata blob
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlobScope {
    Global,
    Shard(ShardId),
}

/// A shard with its log writer running
struct OpenShard {
    context: Arc<ShardContext>,
    writer: LogWriter,
    updater: Mutex<Option<UpdaterThread>>,
    /// Backup seqno being restored
    restoring: Mutex<Option<Seqno>>,
}

impl OpenShard {
    fn close(&self) -> Result<()> {
        let synced = self.writer.shutdown();
        if let Some(mut updater) = self.updater.lock().take() {
            updater.shutdown();
        }
        synced
    }
}

/// Persistence core of one flash pool
pub struct RecoveryEngine {
    config: EngineConfig,
    superblock: SuperblockManager,
    alloc: Arc<dyn SegmentAllocator>,
    table_pool: Arc<BufferPool>,
    log_pool: Arc<BufferPool>,
    global_updater: Mutex<Option<UpdaterThread>>,
    shards: RwLock<HashMap<ShardId, Arc<OpenShard>>>,
}

impl RecoveryEngine {
    /// Open the devices listed in the configuration
    ///
    /// With `create_size` set, regular files are created (or resized) first.
    pub fn open_devices(config: &EngineConfig, create_size: Option<u64>) -> Result<Vec<Arc<dyn BlockDevice>>> {
        if config.devices.is_empty() {
            return Err(Error::Configuration("no devices configured".into()));
        }
        config
            .devices
            .iter()
            .map(|dev| {
                let file = match create_size {
                    Some(size) => RawFile::create(&dev.path, size, dev.direct_io)?,
                    None => RawFile::open(&dev.path, false, dev.direct_io)?,
                };
                Ok(Arc::new(file) as Arc<dyn BlockDevice>)
            })
            .collect()
    }

    /// Write a fresh superblock to every device and open the empty pool
    pub fn format(config: EngineConfig, devices: Vec<Arc<dyn BlockDevice>>) -> Result<Self> {
        config.validate()?;
        let superblock = SuperblockManager::format(devices, &config.layout)?;
        Self::assemble(config, superblock)
    }

    /// Open a formatted pool, voting on and repairing the superblock
    pub fn open(config: EngineConfig, devices: Vec<Arc<dyn BlockDevice>>) -> Result<Self> {
        config.validate()?;
        let superblock = match SuperblockManager::load(devices) {
            Ok(superblock) => superblock,
            Err(err) => {
                if err.is_fatal() {
                    fatal(&err, config.abort_on_fatal);
                }
                return Err(err);
            }
        };
        let descriptor = superblock.descriptor();
        if descriptor.segment_blocks != config.layout.segment_blocks
            || descriptor.align_blocks != config.layout.align_blocks
        {
            warn!(
                "Pool geometry {}x{} overrides configured {}x{}",
                descriptor.segment_blocks,
                descriptor.align_blocks,
                config.layout.segment_blocks,
                config.layout.align_blocks
            );
        }
        Self::assemble(config, superblock)
    }

    fn assemble(mut config: EngineConfig, superblock: SuperblockManager) -> Result<Self> {
        let descriptor = superblock.descriptor();
        // The pool's recorded geometry wins over the configuration
        config.layout.segment_blocks = descriptor.segment_blocks;
        config.layout.align_blocks = descriptor.align_blocks;
        config.layout.max_shards = descriptor.max_shards;

        let alloc: Arc<dyn SegmentAllocator> = Arc::new(StripedAllocator::new(&descriptor));
        let updater = &config.updater;
        let table_pool = BufferPool::new(
            "table",
            updater.pool_buffers as usize,
            updater.pool_buffer_blocks as usize,
        );
        let log_pool = BufferPool::new(
            "log",
            updater.log_read_buffers.max(1) as usize,
            updater.log_read_blocks as usize,
        );
        let global_updater = match updater.mode {
            UpdaterMode::Global => Some(UpdaterThread::spawn(
                "updater".into(),
                updater.clone(),
                Arc::clone(&table_pool),
                Arc::clone(&log_pool),
                config.abort_on_fatal,
            )?),
            UpdaterMode::PerShard => None,
        };
        info!(
            "Flash pool {} open: {} devices, {} segments of {} blocks",
            superblock.label().pool_uuid,
            descriptor.device_count,
            descriptor.total_segments,
            descriptor.segment_blocks
        );
        Ok(Self {
            config,
            superblock,
            alloc,
            table_pool,
            log_pool,
            global_updater: Mutex::new(global_updater),
            shards: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn superblock(&self) -> &SuperblockManager {
        &self.superblock
    }

    /// Allocator the object store places data through
    pub fn allocator(&self) -> &Arc<dyn SegmentAllocator> {
        &self.alloc
    }

    /// Route fatal errors through [`fatal`] before returning them
    fn escalate<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.is_fatal() {
                fatal(err, self.config.abort_on_fatal);
            }
        }
        result
    }

    fn shard(&self, id: ShardId) -> Result<Arc<OpenShard>> {
        self.shards
            .read()
            .get(&id)
            .cloned()
            .ok_or(Error::ShardNotFound(id.get()))
    }

    fn properties(&self, id: ShardId) -> Result<ShardProperties> {
        self.superblock
            .read_property(id)?
            .ok_or(Error::ShardNotFound(id.get()))
    }

    /// Shards with a running log writer
    pub fn open_shards(&self) -> Vec<ShardId> {
        let mut ids: Vec<_> = self.shards.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Create a shard in the lowest free slot and format its region
    pub fn format_shard(
        &self,
        flags: ShardFlags,
        quota_bytes: u64,
        max_objects: u64,
        container_name: &str,
    ) -> Result<ShardId> {
        if container_name.len() > MAX_CONTAINER_NAME {
            return Err(Error::invalid_argument(format!(
                "container name of {} bytes exceeds {MAX_CONTAINER_NAME}",
                container_name.len()
            )));
        }
        if !container_name.is_empty()
            && self
                .superblock
                .used_slots()
                .iter()
                .any(|p| p.container_name == container_name)
        {
            return Err(Error::AlreadyExists(format!("container {container_name}")));
        }
        let id = self
            .superblock
            .free_slot()
            .ok_or_else(|| Error::OutOfMemory("no free shard slot".into()))?;

        let desc = plan_shard(
            id,
            flags,
            quota_bytes,
            &self.config.layout,
            self.config.log.buffer_pages,
            self.alloc.capacity_blocks(id),
        )?;
        let io = ShardIo::from_allocator(
            id,
            self.superblock.devices().to_vec(),
            self.alloc.as_ref(),
            desc.total_segments,
        )?;
        shard_format(&io, &desc)?;

        let mut props = ShardProperties::new(id, flags, quota_bytes, max_objects);
        props.container_name = container_name.to_string();
        self.superblock.write_property(id, &props)?;
        info!(
            "Formatted {id} ({flags:?}): {} blocks, table {} blocks, logs 2x{} blocks",
            desc.total_blocks, desc.table_blocks, desc.log_blocks
        );
        Ok(id)
    }

    /// Load a shard's metadata, replay its logs and start its log writer
    ///
    /// The rebuilt hash index is handed back in the report.
    pub fn recover_shard(&self, id: ShardId) -> Result<RecoveryReport> {
        if self.shards.read().contains_key(&id) {
            return Err(Error::AlreadyExists(format!("{id} is already open")));
        }
        let props = self.properties(id)?;
        let result = self.open_shard(&props);
        if result.is_err() {
            self.alloc.release_shard(id);
        }
        self.escalate(result)
    }

    fn open_shard(&self, props: &ShardProperties) -> Result<RecoveryReport> {
        let id = props.shard_id;
        let segment_blocks = u64::from(self.config.layout.segment_blocks);
        let segments = (props.quota_bytes / BLOCK_SIZE as u64).div_ceil(segment_blocks);
        let io = ShardIo::from_allocator(id, self.superblock.devices().to_vec(), self.alloc.as_ref(), segments)?;
        let meta = load_shard_metadata(&io)?;
        if meta.descriptor.flags != props.flags {
            return Err(Error::corruption(format!(
                "{id} descriptor flags {:?} disagree with its properties {:?}",
                meta.descriptor.flags, props.flags
            )));
        }
        self.alloc.reserve(id, meta.descriptor.reserved_blocks)?;
        let max_objects = if props.max_objects == 0 {
            meta.descriptor.total_blocks
        } else {
            props.max_objects
        };

        let context = Arc::new(ShardContext::new(
            io,
            meta,
            Arc::clone(&self.alloc),
            self.config.tombstone.slab_capacity as usize,
        ));
        // Table entries below the guarantee were freed before the restart
        context.tombstones.lock().set_rtg(props.retained_seqno);
        let report = Updater::new(&context, &self.config.updater, &self.table_pool, &self.log_pool)
            .recover(max_objects, &self.config.hash)?;

        let (updater, sender) = self.updater_for(id)?;
        let writer = LogWriter::start(Arc::clone(&context), &self.config.log, report.resume, sender)?;
        let shard = Arc::new(OpenShard {
            context,
            writer,
            updater: Mutex::new(updater),
            restoring: Mutex::new(None),
        });

        let mut props = props.clone();
        props.state = ShardState::Open;
        if let Err(err) = self.superblock.write_property(id, &props) {
            let _ = shard.close();
            return Err(err);
        }
        self.shards.write().insert(id, shard);
        Ok(report)
    }

    fn updater_for(&self, id: ShardId) -> Result<(Option<UpdaterThread>, Sender<UpdaterMsg>)> {
        if let Some(global) = self.global_updater.lock().as_ref() {
            return Ok((None, global.sender()));
        }
        let thread = UpdaterThread::spawn(
            format!("updater-{id}"),
            self.config.updater.clone(),
            Arc::clone(&self.table_pool),
            Arc::clone(&self.log_pool),
            self.config.abort_on_fatal,
        )?;
        let sender = thread.sender();
        Ok((Some(thread), sender))
    }

    /// Sync and stop a shard's log writer and updater
    pub fn close_shard(&self, id: ShardId) -> Result<()> {
        let shard = self
            .shards
            .write()
            .remove(&id)
            .ok_or(Error::ShardNotFound(id.get()))?;
        let closed = shard.close();
        self.alloc.release_shard(id);
        if let Some(mut props) = self.superblock.read_property(id)? {
            props.state = ShardState::Closed;
            self.superblock.write_property(id, &props)?;
        }
        info!("Closed {id}");
        self.escalate(closed)
    }

    /// Close a shard if open and free its slot
    pub fn delete_shard(&self, id: ShardId) -> Result<()> {
        let mut props = self.properties(id)?;
        if self.shards.read().contains_key(&id) {
            self.close_shard(id)?;
        }
        props.state = ShardState::Deleting;
        self.superblock.write_property(id, &props)?;
        self.superblock.clear_property(id)?;
        self.alloc.release_shard(id);
        info!("Deleted {id}");
        Ok(())
    }

    pub fn shard_get_properties(&self, id: ShardId) -> Result<ShardProperties> {
        self.properties(id)
    }

    /// Replace the mutable properties of a shard
    ///
    /// Flags and quota fix the on-disk layout and cannot change.
    pub fn shard_set_properties(&self, id: ShardId, props: &ShardProperties) -> Result<ShardProperties> {
        let current = self.properties(id)?;
        if props.shard_id != id {
            return Err(Error::invalid_argument(format!(
                "properties of {} applied to {id}",
                props.shard_id
            )));
        }
        if props.flags != current.flags || props.quota_bytes != current.quota_bytes {
            return Err(Error::invalid_argument(format!(
                "{id} flags and quota are fixed at format time"
            )));
        }
        if props.container_name.len() > MAX_CONTAINER_NAME {
            return Err(Error::invalid_argument(format!(
                "container name of {} bytes exceeds {MAX_CONTAINER_NAME}",
                props.container_name.len()
            )));
        }
        let mut props = props.clone();
        props.retained_seqno = current.retained_seqno;
        self.superblock.write_property(id, &props)
    }

    pub fn shard_set_state(&self, id: ShardId, state: ShardState) -> Result<()> {
        let mut props = self.properties(id)?;
        props.state = state;
        self.superblock.write_property(id, &props)?;
        Ok(())
    }

    /// Append one object-location change to a shard's log
    ///
    /// Deletes in shards that retain tombstones are stamped as such.
    pub fn log_write(&self, id: ShardId, record: &LogRecord) -> Result<()> {
        let shard = self.shard(id)?;
        let context = &shard.context;
        if !context.flags.contains(ShardFlags::PERSISTENT) {
            return Err(Error::invalid_argument(format!("{id} is not persistent")));
        }
        if record.seqno == 0 {
            return Err(Error::invalid_argument("log record without a seqno"));
        }
        let total = context.descriptor.total_blocks;
        if record.touched().any(|offset| offset >= total) {
            return Err(Error::invalid_argument(format!(
                "{id} record at {} beyond {total} blocks",
                record.offset
            )));
        }
        let record = if record.is_delete() && context.flags.retains_tombstones() {
            record.with_tombstone()
        } else {
            *record
        };
        self.escalate(shard.writer.append(&record))
    }

    /// Make every record written so far durable
    pub fn log_sync(&self, id: ShardId) -> Result<()> {
        let shard = self.shard(id)?;
        self.escalate(shard.writer.sync())
    }

    pub fn log_stats(&self, id: ShardId) -> Result<LogStats> {
        Ok(self.shard(id)?.writer.stats())
    }

    pub fn allocate_seqno(&self, id: ShardId) -> Result<Seqno> {
        Ok(self.shard(id)?.context.allocate_seqno())
    }

    /// Raise the retained tombstone guarantee and free what it releases
    ///
    /// A raised guarantee is persisted before anything is freed, so recovery
    /// never tracks a tombstone whose blocks were handed out again.
    pub fn set_retained_tombstone_guarantee(&self, id: ShardId, rtg: Seqno) -> Result<u64> {
        let shard = self.shard(id)?;
        let context = &shard.context;
        let mut tracker = context.tombstones.lock();
        let persisted = if rtg > tracker.rtg() {
            self.persist_rtg(id, rtg)
        } else {
            Ok(())
        };
        let freed = persisted.and_then(|()| {
            tracker.set_rtg(rtg);
            tracker.prune(context.alloc.as_ref())
        });
        drop(tracker);
        self.escalate(freed)
    }

    fn persist_rtg(&self, id: ShardId, rtg: Seqno) -> Result<()> {
        let mut props = self.properties(id)?;
        props.retained_seqno = rtg;
        self.superblock.write_property(id, &props)?;
        debug!("{id} retained tombstone guarantee persisted at {rtg}");
        Ok(())
    }

    pub fn tombstone_stats(&self, id: ShardId) -> Result<TombstoneStats> {
        Ok(self.shard(id)?.context.tombstones.lock().stats())
    }

    /// Start a backup; the snapshot is taken at the flush forced here
    pub fn backup_start(&self, id: ShardId, kind: BackupKind) -> Result<()> {
        let shard = self.shard(id)?;
        let boundary = shard.context.last_seqno();
        let target = shard.writer.flush_seq() + 1;
        shard.context.backup.backup_start(kind, boundary, target)?;
        if let Err(err) = shard.writer.sync() {
            let _ = shard.context.backup.backup_end(true);
            return self.escalate(Err(err));
        }
        Ok(())
    }

    pub fn backup_bitmap(&self, id: ShardId) -> Result<Vec<Extent>> {
        self.shard(id)?.context.backup.backup_bitmap()
    }

    /// Finish a backup, recording its seqno unless cancelled
    pub fn backup_end(&self, id: ShardId, cancel: bool) -> Result<Option<Seqno>> {
        let shard = self.shard(id)?;
        let done = shard.context.backup.backup_end(cancel)?;
        if let Some(seqno) = done {
            let mut props = self.properties(id)?;
            props.backup_seqno = seqno;
            self.superblock.write_property(id, &props)?;
        }
        Ok(done)
    }

    /// Start restoring backup `backup_seqno`, taken after `prev_seqno`
    pub fn restore_start(&self, id: ShardId, kind: BackupKind, prev_seqno: Seqno, backup_seqno: Seqno) -> Result<()> {
        let shard = self.shard(id)?;
        let props = self.properties(id)?;
        let empty = shard.context.backup.object_count() == 0;
        shard
            .context
            .backup
            .restore_start(kind, prev_seqno, props.restore_seqno, empty)?;
        *shard.restoring.lock() = Some(backup_seqno);
        Ok(())
    }

    pub fn restore_end(&self, id: ShardId, cancel: bool) -> Result<()> {
        let shard = self.shard(id)?;
        shard.context.backup.restore_end(cancel)?;
        let restored = shard.restoring.lock().take();
        if let Some(seqno) = restored.filter(|_| !cancel) {
            let mut props = self.properties(id)?;
            props.restore_seqno = seqno;
            self.superblock.write_property(id, &props)?;
        }
        Ok(())
    }

    pub fn container_meta_blob_put(&self, scope: BlobScope, data: &[u8]) -> Result<()> {
        match scope {
            BlobScope::Global => self.superblock.write_global(data, 0),
            BlobScope::Shard(id) => self.shard(id)?.context.put_blob(data),
        }
    }

    pub fn container_meta_blob_get(&self, scope: BlobScope) -> Result<Vec<u8>> {
        match scope {
            BlobScope::Global => Ok(self.superblock.read_global()),
            BlobScope::Shard(id) => Ok(self.shard(id)?.context.blob()),
        }
    }

    /// Hand a data segment to a slab class
    pub fn class_add_segment(&self, id: ShardId, class_index: usize, segment: u64) -> Result<()> {
        self.shard(id)?.context.add_class_segment(class_index, segment)
    }

    /// Close every open shard and stop the global updater
    pub fn shutdown(&self) -> Result<()> {
        let mut first_err = None;
        for id in self.open_shards() {
            if let Err(err) = self.close_shard(id) {
                warn!("Closing {id} failed: {err}");
                first_err.get_or_insert(err);
            }
        }
        if let Some(mut updater) = self.global_updater.lock().take() {
            updater.shutdown();
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for RecoveryEngine {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            error!("Flash pool shutdown failed: {err}");
        }
    }
}
