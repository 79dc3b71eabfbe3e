//! Shared fixtures for unit tests: a small in-memory pool with one formatted shard

use crate::format::{ShardIo, load_shard_metadata, plan_shard, shard_format};
use crate::mapper::{SegmentAllocator, StripedAllocator};
use crate::pool::BufferPool;
use crate::raw_io::{BlockDevice, MemDevice};
use crate::shard::ShardContext;
use crate::superblock::SuperblockManager;
use flashkv_common::config::{LayoutConfig, LogConfig, UpdaterConfig};
use flashkv_common::{BLOCK_SIZE, ShardFlags, ShardId};
use std::sync::Arc;

pub const SEGMENT_BLOCKS: u64 = 256;
pub const SHARD_SEGMENTS: u64 = 4;

/// 256-block segments, 16-block alignment, two shard slots of four segments
pub fn layout() -> LayoutConfig {
    LayoutConfig {
        segment_blocks: SEGMENT_BLOCKS as u32,
        align_blocks: 16,
        max_shards: 2,
        log_size_shift: 3,
    }
}

pub fn log_config() -> LogConfig {
    LogConfig {
        buffer_pages: 8,
        buffer_count: 2,
        sync_threshold: 64,
    }
}

pub fn updater_config() -> UpdaterConfig {
    UpdaterConfig {
        pool_buffers: 4,
        pool_buffer_blocks: 8,
        log_read_blocks: 4,
        verify_skips: true,
        ..UpdaterConfig::default()
    }
}

pub fn pools(config: &UpdaterConfig) -> (Arc<BufferPool>, Arc<BufferPool>) {
    (
        BufferPool::new("table", config.pool_buffers as usize, config.pool_buffer_blocks as usize),
        BufferPool::new("log", config.log_read_buffers as usize, config.log_read_blocks as usize),
    )
}

/// Memory devices large enough for every shard slot of [`layout`]
pub fn mem_devices(count: usize) -> (Vec<Arc<MemDevice>>, Vec<Arc<dyn BlockDevice>>) {
    let segments = SHARD_SEGMENTS * 2 / count as u64;
    let blocks = 16 + SEGMENT_BLOCKS * segments;
    let mems: Vec<Arc<MemDevice>> = (0..count)
        .map(|i| Arc::new(MemDevice::new(format!("mem{i}"), blocks * BLOCK_SIZE as u64)))
        .collect();
    let devices = mems.iter().map(|m| Arc::clone(m) as Arc<dyn BlockDevice>).collect();
    (mems, devices)
}

/// A formatted shard on a private pool
pub struct TestShard {
    pub mems: Vec<Arc<MemDevice>>,
    pub devices: Vec<Arc<dyn BlockDevice>>,
    pub alloc: Arc<StripedAllocator>,
    pub shard: Arc<ShardContext>,
}

impl TestShard {
    pub fn format(flags: ShardFlags) -> Self {
        let (mems, devices) = mem_devices(2);
        let superblock = SuperblockManager::format(devices.clone(), &layout()).unwrap();
        let id = ShardId::new(0);
        let alloc = Arc::new(StripedAllocator::new(&superblock.descriptor()));
        let desc = plan_shard(
            id,
            flags,
            SHARD_SEGMENTS * SEGMENT_BLOCKS * BLOCK_SIZE as u64,
            &layout(),
            log_config().buffer_pages,
            alloc.capacity_blocks(id),
        )
        .unwrap();
        let io = ShardIo::from_allocator(id, devices.clone(), alloc.as_ref(), desc.total_segments).unwrap();
        shard_format(&io, &desc).unwrap();
        let shard = Self::open_context(&devices, &alloc);
        Self {
            mems,
            devices,
            alloc,
            shard,
        }
    }

    fn open_context(devices: &[Arc<dyn BlockDevice>], alloc: &Arc<StripedAllocator>) -> Arc<ShardContext> {
        let id = ShardId::new(0);
        let io = ShardIo::from_allocator(id, devices.to_vec(), alloc.as_ref(), SHARD_SEGMENTS).unwrap();
        let meta = load_shard_metadata(&io).unwrap();
        alloc.reserve(id, meta.descriptor.reserved_blocks).unwrap();
        let alloc: Arc<dyn SegmentAllocator> = Arc::clone(alloc) as Arc<dyn SegmentAllocator>;
        Arc::new(ShardContext::new(io, meta, alloc, 16))
    }

    /// Forget all in-memory state and load the shard again, as after a restart
    pub fn restart(&self) -> Self {
        let superblock = SuperblockManager::load(self.devices.clone()).unwrap();
        let alloc = Arc::new(StripedAllocator::new(&superblock.descriptor()));
        let shard = Self::open_context(&self.devices, &alloc);
        Self {
            mems: self.mems.clone(),
            devices: self.devices.clone(),
            alloc,
            shard,
        }
    }

    /// First data block past the reserved region
    pub fn data_start(&self) -> u64 {
        self.shard.descriptor.reserved_blocks
    }
}
