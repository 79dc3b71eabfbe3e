//! Logical-to-physical segment mapping
//!
//! The recovery engine never allocates object data itself. It reaches
//! physical storage through a [`SegmentAllocator`]: map a shard's logical
//! block to a device location, record blocks found in use during recovery,
//! and hand back blocks whose last reference became durable.

use crate::block::{BlockBitmap, Extent};
use crate::layout::FlashDescriptor;
use flashkv_common::{BLOCK_SIZE, Error, PhysicalBlock, Result, ShardId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Block-allocator collaborator of the recovery engine
pub trait SegmentAllocator: Send + Sync {
    /// Physical location of a logical shard block
    fn map(&self, shard: ShardId, logical_block: u64) -> Result<PhysicalBlock>;

    /// Blocks per segment; no single mapping spans two segments
    fn segment_blocks(&self) -> u64;

    /// Logical blocks a shard slot can address
    fn capacity_blocks(&self, shard: ShardId) -> u64;

    /// Record an object extent found in use
    fn mark_allocated(&self, shard: ShardId, offset: u64, blocks: u64) -> Result<()>;

    /// Free the object extent starting at `offset`, returning its length
    fn deallocate(&self, shard: ShardId, offset: u64) -> Result<u64>;

    /// Keep a shard's leading metadata blocks out of data allocation
    fn reserve(&self, _shard: ShardId, _blocks: u64) -> Result<()> {
        Ok(())
    }

    /// Forget everything about a shard slot
    fn release_shard(&self, shard: ShardId);
}

/// Stripes segments round-robin over the devices of the pool
///
/// Shard slot `s` owns the fixed global segment range
/// `[s * per_shard, (s + 1) * per_shard)`; global segment `g` lives on
/// device `g % devices` at device segment `g / devices`.
pub struct StripedAllocator {
    device_count: u64,
    segment_blocks: u64,
    data_block: u64,
    segments_per_shard: u64,
    usage: Mutex<HashMap<ShardId, ShardUsage>>,
}

/// Block usage of one shard slot
struct ShardUsage {
    bitmap: BlockBitmap,
    /// Object extents by start block
    extents: BTreeMap<u64, u64>,
}

impl ShardUsage {
    fn new(blocks: u64) -> Self {
        Self {
            bitmap: BlockBitmap::new(blocks),
            extents: BTreeMap::new(),
        }
    }
}

impl StripedAllocator {
    pub fn new(desc: &FlashDescriptor) -> Self {
        let segments_per_shard = desc.total_segments / u64::from(desc.max_shards.max(1));
        debug!(
            "Striping {} segments over {} devices, {} per shard slot",
            desc.total_segments, desc.device_count, segments_per_shard
        );
        Self {
            device_count: u64::from(desc.device_count.max(1)),
            segment_blocks: u64::from(desc.segment_blocks),
            data_block: desc.data_block,
            segments_per_shard,
            usage: Mutex::new(HashMap::new()),
        }
    }

    /// Segments each shard slot owns
    pub const fn segments_per_shard(&self) -> u64 {
        self.segments_per_shard
    }

    /// Allocate a contiguous data extent inside a shard
    pub fn allocate(&self, shard: ShardId, blocks: u64) -> Result<u64> {
        let mut usage = self.usage.lock();
        let usage = usage
            .entry(shard)
            .or_insert_with(|| ShardUsage::new(self.capacity_blocks(shard)));
        let extent = usage
            .bitmap
            .allocate_extent(blocks)
            .ok_or_else(|| Error::OutOfMemory(format!("{shard} has no {blocks} free blocks")))?;
        usage.extents.insert(extent.start, extent.length);
        Ok(extent.start)
    }

    /// Blocks currently marked in use for a shard
    pub fn allocated_blocks(&self, shard: ShardId) -> u64 {
        self.usage
            .lock()
            .get(&shard)
            .map_or(0, |usage| usage.bitmap.set_count())
    }

    /// Check whether a shard block is marked in use
    pub fn is_allocated(&self, shard: ShardId, block: u64) -> bool {
        self.usage
            .lock()
            .get(&shard)
            .is_some_and(|usage| usage.bitmap.is_set(block))
    }
}

impl SegmentAllocator for StripedAllocator {
    fn map(&self, shard: ShardId, logical_block: u64) -> Result<PhysicalBlock> {
        let segment = logical_block / self.segment_blocks;
        if segment >= self.segments_per_shard {
            return Err(Error::invalid_argument(format!(
                "{shard} block {logical_block} beyond its {} segments",
                self.segments_per_shard
            )));
        }
        let global = u64::from(shard.get()) * self.segments_per_shard + segment;
        let device_segment = global / self.device_count;
        let block = self.data_block
            + device_segment * self.segment_blocks
            + logical_block % self.segment_blocks;
        Ok(PhysicalBlock {
            device: (global % self.device_count) as usize,
            offset: block * BLOCK_SIZE as u64,
        })
    }

    fn segment_blocks(&self) -> u64 {
        self.segment_blocks
    }

    fn capacity_blocks(&self, _shard: ShardId) -> u64 {
        self.segments_per_shard * self.segment_blocks
    }

    fn mark_allocated(&self, shard: ShardId, offset: u64, blocks: u64) -> Result<()> {
        let mut usage = self.usage.lock();
        let usage = usage
            .entry(shard)
            .or_insert_with(|| ShardUsage::new(self.capacity_blocks(shard)));
        usage.bitmap.set_extent(&Extent::new(offset, blocks))?;
        usage.extents.insert(offset, blocks);
        Ok(())
    }

    fn deallocate(&self, shard: ShardId, offset: u64) -> Result<u64> {
        let mut usage = self.usage.lock();
        let usage = usage
            .get_mut(&shard)
            .ok_or_else(|| Error::internal(format!("{shard} freed blocks before any allocation")))?;
        let blocks = usage.extents.remove(&offset).ok_or_else(|| {
            Error::internal(format!("{shard} freed block {offset} which starts no allocation"))
        })?;
        usage.bitmap.clear_extent(&Extent::new(offset, blocks))?;
        Ok(blocks)
    }

    fn reserve(&self, shard: ShardId, blocks: u64) -> Result<()> {
        let mut usage = self.usage.lock();
        let usage = usage
            .entry(shard)
            .or_insert_with(|| ShardUsage::new(self.capacity_blocks(shard)));
        usage.bitmap.set_extent(&Extent::new(0, blocks)).map(|_| ())
    }

    fn release_shard(&self, shard: ShardId) {
        self.usage.lock().remove(&shard);
    }
}
