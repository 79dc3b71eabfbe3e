//! Shard region sizing, formatting and metadata recovery
//!
//! A shard addresses its region in logical blocks; [`ShardIo`] translates
//! them through the shard's segment map and splits every transfer at segment
//! boundaries, since consecutive logical segments are generally not
//! physically adjacent.

use crate::layout::{
    Checkpoint, ClassDescriptor, ENTRIES_PER_BLOCK, MAX_CLASSES, MetadataBlock, SEGMAP_ENTRIES,
    SegmentMapBlock, ShardBlob, ShardDescriptor, ShardMode, align_up,
};
use crate::mapper::SegmentAllocator;
use crate::raw_io::{AlignedBuffer, BlockDevice};
use flashkv_common::config::LayoutConfig;
use flashkv_common::{BLOCK_SIZE, Error, PhysicalBlock, Result, ShardFlags, ShardId};
use std::sync::Arc;
use tracing::{debug, info};

/// Blocks zeroed per write while formatting
const ZERO_CHUNK_BLOCKS: u64 = 256;

/// Block I/O against one shard's logical address space
pub struct ShardIo {
    shard: ShardId,
    devices: Vec<Arc<dyn BlockDevice>>,
    /// Physical start of every logical segment
    segments: Vec<PhysicalBlock>,
    segment_blocks: u64,
}

impl ShardIo {
    /// Resolve every segment of a shard through the allocator
    pub fn from_allocator(
        shard: ShardId,
        devices: Vec<Arc<dyn BlockDevice>>,
        alloc: &dyn SegmentAllocator,
        total_segments: u64,
    ) -> Result<Self> {
        let segment_blocks = alloc.segment_blocks();
        let segments = (0..total_segments)
            .map(|seg| alloc.map(shard, seg * segment_blocks))
            .collect::<Result<Vec<_>>>()?;
        Self::from_map(shard, devices, segments, segment_blocks)
    }

    /// Build from an explicit segment list
    pub fn from_map(
        shard: ShardId,
        devices: Vec<Arc<dyn BlockDevice>>,
        segments: Vec<PhysicalBlock>,
        segment_blocks: u64,
    ) -> Result<Self> {
        if let Some(bad) = segments.iter().find(|s| s.device >= devices.len()) {
            return Err(Error::corruption(format!(
                "{shard} segment on device {} of {}",
                bad.device,
                devices.len()
            )));
        }
        Ok(Self {
            shard,
            devices,
            segments,
            segment_blocks,
        })
    }

    pub const fn shard(&self) -> ShardId {
        self.shard
    }

    pub fn segments(&self) -> &[PhysicalBlock] {
        &self.segments
    }

    pub const fn segment_blocks(&self) -> u64 {
        self.segment_blocks
    }

    fn locate(&self, block: u64) -> Result<(usize, u64)> {
        let seg = (block / self.segment_blocks) as usize;
        let base = self.segments.get(seg).ok_or_else(|| {
            Error::internal(format!("{} block {block} beyond its segment map", self.shard))
        })?;
        let offset = base.offset + (block % self.segment_blocks) * BLOCK_SIZE as u64;
        Ok((base.device, offset))
    }

    /// Fail unless `blocks` blocks starting at `block` stay within one segment
    pub fn check_within_segment(&self, block: u64, blocks: u64) -> Result<()> {
        if blocks == 0 || block / self.segment_blocks != (block + blocks - 1) / self.segment_blocks {
            return Err(Error::internal(format!(
                "{} I/O of {blocks} blocks at {block} crosses a segment boundary",
                self.shard
            )));
        }
        Ok(())
    }

    /// Visit each per-segment piece of a transfer
    fn for_each_piece(
        &self,
        block: u64,
        len: usize,
        mut f: impl FnMut(usize, u64, std::ops::Range<usize>) -> Result<()>,
    ) -> Result<()> {
        if len % BLOCK_SIZE != 0 {
            return Err(Error::internal(format!("{} transfer of {len} bytes", self.shard)));
        }
        let mut done = 0usize;
        let mut current = block;
        while done < len {
            let left_in_segment = self.segment_blocks - current % self.segment_blocks;
            let blocks = left_in_segment.min(((len - done) / BLOCK_SIZE) as u64);
            let bytes = blocks as usize * BLOCK_SIZE;
            let (device, offset) = self.locate(current)?;
            f(device, offset, done..done + bytes)?;
            done += bytes;
            current += blocks;
        }
        Ok(())
    }

    /// Read whole blocks starting at logical `block`
    pub fn read(&self, block: u64, buf: &mut [u8]) -> Result<()> {
        let len = buf.len();
        self.for_each_piece(block, len, |device, offset, range| {
            self.devices[device].read_at(offset, &mut buf[range])
        })
    }

    /// Write whole blocks starting at logical `block`
    pub fn write(&self, block: u64, buf: &[u8]) -> Result<()> {
        self.for_each_piece(block, buf.len(), |device, offset, range| {
            self.devices[device].write_at(offset, &buf[range])
        })
    }

    /// Read and decode one metadata block
    pub fn read_metadata<T: MetadataBlock>(&self, block: u64) -> Result<T> {
        self.check_within_segment(block, 1)?;
        let mut buf = AlignedBuffer::blocks(1);
        self.read(block, buf.as_mut_slice())?;
        T::decode(buf.as_slice())
    }

    /// Encode and write one metadata block
    pub fn write_metadata<T: MetadataBlock>(&self, block: u64, value: &T) -> Result<()> {
        self.check_within_segment(block, 1)?;
        let mut buf = AlignedBuffer::blocks(1);
        buf.copy_from(&value.encode());
        self.write(block, buf.as_slice())
    }

    /// Sync every device the shard occupies
    pub fn sync(&self) -> Result<()> {
        let mut synced = vec![false; self.devices.len()];
        for seg in &self.segments {
            if !synced[seg.device] {
                self.devices[seg.device].sync()?;
                synced[seg.device] = true;
            }
        }
        Ok(())
    }
}

/// Number of power-of-two slab classes for a segment size
pub fn slab_class_count(segment_blocks: u32) -> u32 {
    (segment_blocks.max(1).ilog2() + 1).min(MAX_CLASSES as u32)
}

/// Compute the region layout of a new shard
pub fn plan_shard(
    shard_id: ShardId,
    flags: ShardFlags,
    quota_bytes: u64,
    layout: &LayoutConfig,
    log_buffer_pages: u32,
    capacity_blocks: u64,
) -> Result<ShardDescriptor> {
    let segment_blocks = u64::from(layout.segment_blocks);
    let align = u64::from(layout.align_blocks);
    let total_blocks = quota_bytes / BLOCK_SIZE as u64;
    if total_blocks == 0 {
        return Err(Error::invalid_argument(format!(
            "{shard_id} quota of {quota_bytes} bytes is below one block"
        )));
    }
    let total_segments = total_blocks.div_ceil(segment_blocks);
    if total_segments * segment_blocks > capacity_blocks {
        return Err(Error::invalid_argument(format!(
            "{shard_id} quota needs {total_segments} segments, slot holds {}",
            capacity_blocks / segment_blocks
        )));
    }

    let class_count = if flags.contains(ShardFlags::CACHE_MODE) {
        0
    } else {
        slab_class_count(layout.segment_blocks)
    };
    let segmap_offset = 1;
    let segmap_blocks = total_segments.div_ceil(SEGMAP_ENTRIES as u64);
    let class_map_blocks = segmap_blocks;
    let mut cursor = segmap_offset + segmap_blocks;
    let mut class_offsets = Vec::with_capacity(class_count as usize);
    for _ in 0..class_count {
        class_offsets.push(cursor);
        cursor += 1 + class_map_blocks;
    }
    let blob_offset = cursor;
    let metadata_blocks = blob_offset + 1;

    let checkpoint_offset = align_up(metadata_blocks, align);
    let table_offset = checkpoint_offset + align;
    let table_blocks = total_blocks.div_ceil(ENTRIES_PER_BLOCK as u64);
    let table_padding = align_up(table_blocks, align) - table_blocks;

    let log_blocks = align_up((table_blocks >> layout.log_size_shift).max(1).next_power_of_two(), align)
        .max(u64::from(log_buffer_pages));
    let log_padding = align_up(log_blocks, align) - log_blocks;
    let log0 = table_offset + table_blocks + table_padding;
    let log1 = log0 + log_blocks + log_padding;
    let reserved_blocks = log1 + log_blocks + log_padding;
    let reserved_segments = reserved_blocks.div_ceil(segment_blocks);

    if reserved_segments >= total_segments {
        return Err(Error::invalid_argument(format!(
            "{shard_id} metadata needs {reserved_segments} of its {total_segments} segments"
        )));
    }
    if metadata_blocks > segment_blocks {
        return Err(Error::invalid_argument(format!(
            "{shard_id} metadata of {metadata_blocks} blocks does not fit its first segment"
        )));
    }

    let mode = if flags.contains(ShardFlags::CACHE_MODE) {
        ShardMode::Fifo {
            ring_segments: total_segments - reserved_segments,
        }
    } else {
        ShardMode::Slab { class_count }
    };

    Ok(ShardDescriptor {
        shard_id,
        mode,
        flags,
        segment_blocks: layout.segment_blocks,
        align_blocks: layout.align_blocks,
        total_blocks,
        total_segments,
        metadata_blocks,
        segmap_offset,
        segmap_blocks,
        class_map_blocks,
        class_offsets,
        blob_offset,
        checkpoint_offset,
        table_offset,
        table_blocks,
        table_padding,
        log_offsets: [log0, log1],
        log_blocks,
        log_padding,
        reserved_blocks,
        reserved_segments,
    })
}

/// One slab class and the segments it owns
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlabClass {
    pub descriptor: ClassDescriptor,
    pub segments: Vec<u64>,
}

/// Shard metadata recovered from disk
pub struct ShardMetadata {
    pub descriptor: ShardDescriptor,
    pub classes: Vec<SlabClass>,
    pub blob: ShardBlob,
    pub checkpoint: Checkpoint,
}

fn write_segment_list(io: &ShardIo, first_block: u64, map_blocks: u64, entries: &[u64]) -> Result<()> {
    for index in 0..map_blocks {
        let start = (index as usize * SEGMAP_ENTRIES).min(entries.len());
        let end = (start + SEGMAP_ENTRIES).min(entries.len());
        let block = SegmentMapBlock {
            index: index as u32,
            entries: entries[start..end].to_vec(),
        };
        io.write_metadata(first_block + index, &block)?;
    }
    Ok(())
}

fn read_segment_list(io: &ShardIo, first_block: u64, map_blocks: u64, count: usize) -> Result<Vec<u64>> {
    let mut entries = Vec::with_capacity(count);
    for index in 0..map_blocks {
        let block: SegmentMapBlock = io.read_metadata(first_block + index)?;
        if u64::from(block.index) != index {
            return Err(Error::corruption(format!(
                "{} segment map block {index} claims position {}",
                io.shard(),
                block.index
            )));
        }
        entries.extend(block.entries);
    }
    if entries.len() != count {
        return Err(Error::corruption(format!(
            "{} segment list holds {} entries, expected {count}",
            io.shard(),
            entries.len()
        )));
    }
    Ok(entries)
}

/// Zero and initialize the reserved region of a planned shard
pub fn shard_format(io: &ShardIo, desc: &ShardDescriptor) -> Result<()> {
    let mut zeros = AlignedBuffer::blocks(ZERO_CHUNK_BLOCKS as usize);
    zeros.zero();
    let mut block = 0;
    while block < desc.reserved_blocks {
        let blocks = ZERO_CHUNK_BLOCKS.min(desc.reserved_blocks - block);
        io.write(block, &zeros.as_slice()[..blocks as usize * BLOCK_SIZE])?;
        block += blocks;
    }

    io.write_metadata(0, desc)?;
    let packed: Vec<u64> = io.segments().iter().map(|s| SegmentMapBlock::pack(*s)).collect();
    write_segment_list(io, desc.segmap_offset, desc.segmap_blocks, &packed)?;

    for (class_index, &offset) in desc.class_offsets.iter().enumerate() {
        let class = ClassDescriptor {
            class_index: class_index as u32,
            slab_blocks: 1 << class_index,
            segment_count: 0,
            map_offset: offset + 1,
            map_blocks: desc.class_map_blocks,
        };
        io.write_metadata(offset, &class)?;
        write_segment_list(io, class.map_offset, class.map_blocks, &[])?;
    }

    io.write_metadata(desc.blob_offset, &ShardBlob::default())?;
    io.write_metadata(
        desc.checkpoint_offset,
        &Checkpoint {
            shard_id: desc.shard_id,
            lsn: 0,
            generation: 0,
        },
    )?;
    io.sync()?;

    info!(
        "Formatted {}: {} blocks in {} segments, table {} blocks, logs 2 x {} blocks, {} segments reserved",
        desc.shard_id,
        desc.total_blocks,
        desc.total_segments,
        desc.table_blocks,
        desc.log_blocks,
        desc.reserved_segments
    );
    Ok(())
}

/// Phase one of shard recovery: descriptor, segment map, classes, blob and checkpoint
///
/// The persisted segment map must agree with the allocator's mapping.
pub fn load_shard_metadata(io: &ShardIo) -> Result<ShardMetadata> {
    let shard = io.shard();
    let descriptor: ShardDescriptor = io.read_metadata(0)?;
    if descriptor.shard_id != shard {
        return Err(Error::corruption(format!(
            "{shard} region holds the descriptor of {}",
            descriptor.shard_id
        )));
    }
    if u64::from(descriptor.segment_blocks) != io.segment_blocks()
        || descriptor.total_segments != io.segments().len() as u64
    {
        return Err(Error::corruption(format!(
            "{shard} descriptor geometry {} x {} does not match the pool",
            descriptor.total_segments, descriptor.segment_blocks
        )));
    }

    let packed = read_segment_list(
        io,
        descriptor.segmap_offset,
        descriptor.segmap_blocks,
        descriptor.total_segments as usize,
    )?;
    for (seg, (&entry, actual)) in packed.iter().zip(io.segments()).enumerate() {
        if SegmentMapBlock::unpack(entry) != *actual {
            return Err(Error::corruption(format!(
                "{shard} segment {seg} mapped to {:?}, allocator says {actual:?}",
                SegmentMapBlock::unpack(entry)
            )));
        }
    }

    let mut classes = Vec::with_capacity(descriptor.class_offsets.len());
    for (expected, &offset) in descriptor.class_offsets.iter().enumerate() {
        let class: ClassDescriptor = io.read_metadata(offset)?;
        if class.class_index as usize != expected {
            return Err(Error::corruption(format!(
                "{shard} class descriptor {expected} claims index {}",
                class.class_index
            )));
        }
        let segments =
            read_segment_list(io, class.map_offset, class.map_blocks, class.segment_count as usize)?;
        classes.push(SlabClass {
            descriptor: class,
            segments,
        });
    }

    let blob: ShardBlob = io.read_metadata(descriptor.blob_offset)?;
    let checkpoint: Checkpoint = io.read_metadata(descriptor.checkpoint_offset)?;
    if checkpoint.shard_id != shard {
        return Err(Error::corruption(format!(
            "{shard} checkpoint belongs to {}",
            checkpoint.shard_id
        )));
    }

    debug!(
        "Loaded metadata of {shard}: {} classes, checkpoint LSN {}",
        classes.len(),
        checkpoint.lsn
    );
    Ok(ShardMetadata {
        descriptor,
        classes,
        blob,
        checkpoint,
    })
}

/// Durably append a segment to a slab class
pub fn class_add_segment(io: &ShardIo, meta: &mut ShardMetadata, class_index: usize, segment: u64) -> Result<()> {
    let shard = io.shard();
    let desc = &meta.descriptor;
    if segment < desc.reserved_segments || segment >= desc.total_segments {
        return Err(Error::invalid_argument(format!(
            "{shard} segment {segment} is not a data segment"
        )));
    }
    if meta.classes.iter().any(|c| c.segments.contains(&segment)) {
        return Err(Error::AlreadyExists(format!(
            "{shard} segment {segment} already belongs to a class"
        )));
    }
    let class = meta
        .classes
        .get_mut(class_index)
        .ok_or_else(|| Error::invalid_argument(format!("{shard} has no class {class_index}")))?;
    let capacity = class.descriptor.map_blocks as usize * SEGMAP_ENTRIES;
    if class.segments.len() >= capacity {
        return Err(Error::OutOfMemory(format!(
            "{shard} class {class_index} segment list is full"
        )));
    }

    let position = class.segments.len();
    let map_index = position / SEGMAP_ENTRIES;
    let start = map_index * SEGMAP_ENTRIES;
    let mut entries = class.segments[start..].to_vec();
    entries.push(segment);
    io.write_metadata(
        class.descriptor.map_offset + map_index as u64,
        &SegmentMapBlock {
            index: map_index as u32,
            entries,
        },
    )?;
    let mut updated = class.descriptor.clone();
    updated.segment_count += 1;
    io.write_metadata(desc.class_offsets[class_index], &updated)?;
    io.sync()?;

    class.descriptor = updated;
    class.segments.push(segment);
    debug!("{shard} class {class_index} gained segment {segment}");
    Ok(())
}

/// Replace the shard blob
pub fn write_shard_blob(io: &ShardIo, desc: &ShardDescriptor, data: &[u8]) -> Result<ShardBlob> {
    if data.len() > crate::layout::BLOB_CAPACITY {
        return Err(Error::invalid_argument(format!(
            "shard blob of {} bytes exceeds {}",
            data.len(),
            crate::layout::BLOB_CAPACITY
        )));
    }
    let blob = ShardBlob { data: data.to_vec() };
    io.write_metadata(desc.blob_offset, &blob)?;
    io.sync()?;
    Ok(blob)
}
