//! On-disk layout definitions
//!
//! Superblock region, replicated on every device of the pool:
//! ```text
//! +------------------+  Block 0
//! |   Volume label   |
//! +------------------+  Block 1 (reserved)
//! +------------------+  Block 2
//! | Flash descriptor |  write epoch, geometry, region offsets
//! +------------------+  Block 3
//! |   Global blob    |  opaque, owned by the surrounding engine
//! +------------------+  Block 4
//! | Shard properties |  one block per shard slot, all zero = free
//! +------------------+
//! |   Data region    |  aligned; carved into segments
//! +------------------+
//! ```
//!
//! Per-shard region, in logical shard blocks:
//! ```text
//! descriptor | segment map | (class descriptor | class map)* | blob
//! | padding | checkpoint (own aligned unit) | object table | log 0 | log 1
//! ```
//!
//! Every metadata block starts with a 16 byte header: magic, version, flags,
//! CRC32C checksum (seeded with the magic, computed with the field zeroed).
//! Object-table blocks are raw arrays of 32 byte entries.

use bytes::{Buf, BufMut};
use flashkv_common::checksum::{CHECKSUM_OFFSET, fold_seed, seal_block, verify_block_checksum};
use flashkv_common::{BLOCK_SIZE, Error, Lsn, PhysicalBlock, Result, Seqno, ShardFlags, ShardId, ShardState};
use uuid::Uuid;

/// Current superblock and shard metadata format version
pub const FORMAT_VERSION: u16 = 2;

/// Current log page format version
pub const LOG_FORMAT_VERSION: u16 = 1;

/// Segment size assumed by version 1 descriptors, which did not record it
pub const LEGACY_SEGMENT_BLOCKS: u32 = 2048;

/// Size of the common metadata header
pub const HEADER_SIZE: usize = 16;

/// Superblock region: volume label
pub const LABEL_BLOCK: u64 = 0;
/// Superblock region: flash descriptor
pub const DESCRIPTOR_BLOCK: u64 = 2;
/// Superblock region: global blob
pub const GLOBAL_BLOCK: u64 = 3;
/// Superblock region: first shard property slot
pub const PROPERTIES_BLOCK: u64 = 4;

/// Largest number of slab classes a shard descriptor can describe
pub const MAX_CLASSES: usize = 24;

/// Entries in one segment map block
pub const SEGMAP_ENTRIES: usize = (BLOCK_SIZE - HEADER_SIZE - 8) / 8;

/// Payload bytes in one blob block
pub const BLOB_CAPACITY: usize = BLOCK_SIZE - HEADER_SIZE - 4;

/// Longest container name stored in shard properties
pub const MAX_CONTAINER_NAME: usize = 64;

/// Eye-catchers of the on-disk structures
pub mod magic {
    const fn eye(tag: &[u8; 4]) -> u32 {
        u32::from_le_bytes(*tag)
    }

    pub const LABEL: u32 = eye(b"FKVL");
    pub const FLASH_DESCRIPTOR: u32 = eye(b"FKFD");
    pub const GLOBAL_BLOB: u32 = eye(b"FKGB");
    pub const SHARD_PROPERTIES: u32 = eye(b"FKSP");
    pub const SHARD_DESCRIPTOR: u32 = eye(b"FKSD");
    pub const SEGMENT_MAP: u32 = eye(b"FKSM");
    pub const CLASS_DESCRIPTOR: u32 = eye(b"FKCD");
    pub const SHARD_BLOB: u32 = eye(b"FKBS");
    pub const CHECKPOINT: u32 = eye(b"FKCP");
    pub const LOG_PAGE: u32 = eye(b"FKLP");
}

/// Round `value` up to a multiple of `align`
#[inline]
pub const fn align_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

/// Validate the common header of a metadata block and return its version
pub fn check_header(
    block: &[u8],
    structure: &'static str,
    expected_magic: u32,
    min_version: u16,
    max_version: u16,
) -> Result<u16> {
    let mut buf = &block[..HEADER_SIZE];
    let found = buf.get_u32_le();
    if found != expected_magic {
        return Err(Error::BadMagic { structure, found });
    }
    let version = buf.get_u16_le();
    verify_block_checksum(block, expected_magic, CHECKSUM_OFFSET).map_err(|(stored, computed)| {
        Error::ChecksumMismatch {
            structure,
            stored,
            computed,
        }
    })?;
    if version < min_version || version > max_version {
        return Err(Error::UnsupportedVersion { structure, version });
    }
    Ok(version)
}

fn put_header<B: BufMut>(buf: &mut B, magic: u32, version: u16) {
    buf.put_u32_le(magic);
    buf.put_u16_le(version);
    buf.put_u16_le(0); // flags
    buf.put_u32_le(0); // checksum, filled by seal
    buf.put_u32_le(0);
}

/// A checksummed single-block metadata structure
pub trait MetadataBlock: Sized {
    const MAGIC: u32;
    const VERSION: u16;
    const MIN_VERSION: u16 = Self::VERSION;
    const NAME: &'static str;

    /// Version this value encodes as
    fn version(&self) -> u16 {
        Self::VERSION
    }

    /// Write the fields following the header
    fn encode_body<B: BufMut>(&self, buf: &mut B);

    /// Read the fields following the header
    fn decode_body<B: Buf>(version: u16, buf: &mut B) -> Result<Self>;

    /// Encode into a sealed block
    fn encode(&self) -> [u8; BLOCK_SIZE] {
        let mut block = [0u8; BLOCK_SIZE];
        {
            let mut cursor = &mut block[..];
            put_header(&mut cursor, Self::MAGIC, self.version());
            self.encode_body(&mut cursor);
        }
        seal_block(&mut block, Self::MAGIC, CHECKSUM_OFFSET);
        block
    }

    /// Validate and decode a block
    fn decode(block: &[u8]) -> Result<Self> {
        if block.len() < BLOCK_SIZE {
            return Err(Error::Storage(format!("{} block too small", Self::NAME)));
        }
        let block = &block[..BLOCK_SIZE];
        let version = check_header(block, Self::NAME, Self::MAGIC, Self::MIN_VERSION, Self::VERSION)?;
        let mut buf = &block[HEADER_SIZE..];
        Self::decode_body(version, &mut buf)
    }
}

/// Volume label, identical on every device of a pool
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeLabel {
    pub pool_uuid: Uuid,
    pub device_count: u32,
    pub created_at: u64,
}

impl MetadataBlock for VolumeLabel {
    const MAGIC: u32 = magic::LABEL;
    const VERSION: u16 = FORMAT_VERSION;
    const MIN_VERSION: u16 = 1;
    const NAME: &'static str = "volume label";

    fn encode_body<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(self.pool_uuid.as_bytes());
        buf.put_u32_le(self.device_count);
        buf.put_u64_le(self.created_at);
    }

    fn decode_body<B: Buf>(_version: u16, buf: &mut B) -> Result<Self> {
        let mut uuid = [0u8; 16];
        buf.copy_to_slice(&mut uuid);
        Ok(Self {
            pool_uuid: Uuid::from_bytes(uuid),
            device_count: buf.get_u32_le(),
            created_at: buf.get_u64_le(),
        })
    }
}

/// Root descriptor of a flash pool
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlashDescriptor {
    pub version: u16,
    pub write_epoch: u64,
    pub pool_uuid: Uuid,
    pub block_size: u32,
    pub segment_blocks: u32,
    pub align_blocks: u32,
    pub max_shards: u32,
    pub device_count: u32,
    /// Usable blocks on the smallest device
    pub device_blocks: u64,
    pub label_block: u64,
    pub descriptor_block: u64,
    pub global_block: u64,
    pub properties_block: u64,
    /// First block of the data region on every device
    pub data_block: u64,
    /// Segments across all devices
    pub total_segments: u64,
}

impl FlashDescriptor {
    /// Segments available on each device
    pub const fn segments_per_device(&self) -> u64 {
        (self.device_blocks - self.data_block) / self.segment_blocks as u64
    }

    /// Bring an older descriptor up to the current version
    pub fn upgrade(&mut self) {
        if self.version < 2 {
            self.segment_blocks = LEGACY_SEGMENT_BLOCKS;
        }
        self.version = FORMAT_VERSION;
    }
}

impl MetadataBlock for FlashDescriptor {
    const MAGIC: u32 = magic::FLASH_DESCRIPTOR;
    const VERSION: u16 = FORMAT_VERSION;
    const MIN_VERSION: u16 = 1;
    const NAME: &'static str = "flash descriptor";

    fn version(&self) -> u16 {
        self.version
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64_le(self.write_epoch);
        buf.put_slice(self.pool_uuid.as_bytes());
        buf.put_u32_le(self.block_size);
        if self.version >= 2 {
            buf.put_u32_le(self.segment_blocks);
        }
        buf.put_u32_le(self.align_blocks);
        buf.put_u32_le(self.max_shards);
        buf.put_u32_le(self.device_count);
        buf.put_u64_le(self.device_blocks);
        buf.put_u64_le(self.label_block);
        buf.put_u64_le(self.descriptor_block);
        buf.put_u64_le(self.global_block);
        buf.put_u64_le(self.properties_block);
        buf.put_u64_le(self.data_block);
        buf.put_u64_le(self.total_segments);
    }

    fn decode_body<B: Buf>(version: u16, buf: &mut B) -> Result<Self> {
        let write_epoch = buf.get_u64_le();
        let mut uuid = [0u8; 16];
        buf.copy_to_slice(&mut uuid);
        let block_size = buf.get_u32_le();
        let segment_blocks = if version >= 2 { buf.get_u32_le() } else { 0 };
        let desc = Self {
            version,
            write_epoch,
            pool_uuid: Uuid::from_bytes(uuid),
            block_size,
            segment_blocks,
            align_blocks: buf.get_u32_le(),
            max_shards: buf.get_u32_le(),
            device_count: buf.get_u32_le(),
            device_blocks: buf.get_u64_le(),
            label_block: buf.get_u64_le(),
            descriptor_block: buf.get_u64_le(),
            global_block: buf.get_u64_le(),
            properties_block: buf.get_u64_le(),
            data_block: buf.get_u64_le(),
            total_segments: buf.get_u64_le(),
        };
        if desc.block_size as usize != BLOCK_SIZE {
            return Err(Error::corruption(format!(
                "flash descriptor block size {} does not match {BLOCK_SIZE}",
                desc.block_size
            )));
        }
        Ok(desc)
    }
}

/// Opaque blob block, either pool-global or per shard
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Blob<const MAGIC: u32> {
    pub data: Vec<u8>,
}

/// Pool-global blob kept in the superblock region
pub type GlobalBlob = Blob<{ magic::GLOBAL_BLOB }>;

/// Per-shard blob kept in the shard metadata region
pub type ShardBlob = Blob<{ magic::SHARD_BLOB }>;

impl<const M: u32> MetadataBlock for Blob<M> {
    const MAGIC: u32 = M;
    const VERSION: u16 = FORMAT_VERSION;
    const MIN_VERSION: u16 = 1;
    const NAME: &'static str = if M == magic::GLOBAL_BLOB {
        "global blob"
    } else {
        "shard blob"
    };

    fn encode_body<B: BufMut>(&self, buf: &mut B) {
        let len = self.data.len().min(BLOB_CAPACITY);
        buf.put_u32_le(len as u32);
        buf.put_slice(&self.data[..len]);
    }

    fn decode_body<B: Buf>(_version: u16, buf: &mut B) -> Result<Self> {
        let len = buf.get_u32_le() as usize;
        if len > BLOB_CAPACITY {
            return Err(Error::corruption(format!("blob length {len} exceeds capacity")));
        }
        let mut data = vec![0u8; len];
        buf.copy_to_slice(&mut data);
        Ok(Self { data })
    }
}

/// Properties of one shard slot
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardProperties {
    pub shard_id: ShardId,
    pub flags: ShardFlags,
    pub state: ShardState,
    pub quota_bytes: u64,
    pub max_objects: u64,
    pub replication_port: u16,
    pub container_name: String,
    /// Last completed backup sequence
    pub backup_seqno: Seqno,
    /// Last completed restore sequence
    pub restore_seqno: Seqno,
    pub write_epoch: u64,
    /// Retained tombstone guarantee; tombstones below it are already freed
    pub retained_seqno: Seqno,
}

impl ShardProperties {
    /// Fresh properties for a shard being created
    pub fn new(shard_id: ShardId, flags: ShardFlags, quota_bytes: u64, max_objects: u64) -> Self {
        Self {
            shard_id,
            flags,
            state: ShardState::Formatted,
            quota_bytes,
            max_objects,
            replication_port: 0,
            container_name: String::new(),
            backup_seqno: 0,
            restore_seqno: 0,
            write_epoch: 0,
            retained_seqno: 0,
        }
    }
}

impl MetadataBlock for ShardProperties {
    const MAGIC: u32 = magic::SHARD_PROPERTIES;
    const VERSION: u16 = FORMAT_VERSION;
    const MIN_VERSION: u16 = 1;
    const NAME: &'static str = "shard properties";

    fn encode_body<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.shard_id.get());
        buf.put_u32_le(self.flags.bits());
        buf.put_u8(self.state as u8);
        buf.put_u8(0);
        buf.put_u16_le(self.replication_port);
        buf.put_u64_le(self.quota_bytes);
        buf.put_u64_le(self.max_objects);
        buf.put_u64_le(self.backup_seqno);
        buf.put_u64_le(self.restore_seqno);
        buf.put_u64_le(self.write_epoch);
        let name = self.container_name.as_bytes();
        let len = name.len().min(MAX_CONTAINER_NAME);
        buf.put_u8(len as u8);
        let mut padded = [0u8; MAX_CONTAINER_NAME];
        padded[..len].copy_from_slice(&name[..len]);
        buf.put_slice(&padded);
        buf.put_u64_le(self.retained_seqno);
    }

    fn decode_body<B: Buf>(_version: u16, buf: &mut B) -> Result<Self> {
        let shard_id = ShardId::new(buf.get_u32_le());
        let raw_flags = buf.get_u32_le();
        let flags = ShardFlags::from_bits(raw_flags)
            .ok_or_else(|| Error::corruption(format!("unknown shard flags {raw_flags:#x}")))?;
        let raw_state = buf.get_u8();
        let state = ShardState::from_u8(raw_state)
            .ok_or_else(|| Error::corruption(format!("unknown shard state {raw_state}")))?;
        buf.advance(1);
        let replication_port = buf.get_u16_le();
        let quota_bytes = buf.get_u64_le();
        let max_objects = buf.get_u64_le();
        let backup_seqno = buf.get_u64_le();
        let restore_seqno = buf.get_u64_le();
        let write_epoch = buf.get_u64_le();
        let len = usize::from(buf.get_u8()).min(MAX_CONTAINER_NAME);
        let mut padded = [0u8; MAX_CONTAINER_NAME];
        buf.copy_to_slice(&mut padded);
        let container_name = String::from_utf8_lossy(&padded[..len]).into_owned();
        let retained_seqno = buf.get_u64_le();
        Ok(Self {
            shard_id,
            flags,
            state,
            quota_bytes,
            max_objects,
            replication_port,
            container_name,
            backup_seqno,
            restore_seqno,
            write_epoch,
            retained_seqno,
        })
    }
}

/// Layout mode of a shard
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShardMode {
    /// Power-of-two slab classes, each with its own segment list
    Slab { class_count: u32 },
    /// Cache shard written as a FIFO ring of segments
    Fifo { ring_segments: u64 },
}

impl ShardMode {
    const SLAB_TAG: u8 = 1;
    const FIFO_TAG: u8 = 2;

    /// Number of class descriptors laid out for this mode
    pub const fn class_count(&self) -> u32 {
        match self {
            Self::Slab { class_count } => *class_count,
            Self::Fifo { .. } => 0,
        }
    }
}

/// Persistent layout of one shard region
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardDescriptor {
    pub shard_id: ShardId,
    pub mode: ShardMode,
    pub flags: ShardFlags,
    pub segment_blocks: u32,
    pub align_blocks: u32,
    pub total_blocks: u64,
    pub total_segments: u64,
    pub metadata_blocks: u64,
    pub segmap_offset: u64,
    pub segmap_blocks: u64,
    /// Map blocks following each class descriptor
    pub class_map_blocks: u64,
    pub class_offsets: Vec<u64>,
    pub blob_offset: u64,
    pub checkpoint_offset: u64,
    pub table_offset: u64,
    pub table_blocks: u64,
    pub table_padding: u64,
    pub log_offsets: [u64; 2],
    pub log_blocks: u64,
    pub log_padding: u64,
    pub reserved_blocks: u64,
    pub reserved_segments: u64,
}

impl ShardDescriptor {
    /// Pages in each recovery log
    pub const fn log_pages(&self) -> u64 {
        self.log_blocks
    }

    /// Entries in the object table (one per shard block)
    pub const fn table_entries(&self) -> u64 {
        self.total_blocks
    }
}

impl MetadataBlock for ShardDescriptor {
    const MAGIC: u32 = magic::SHARD_DESCRIPTOR;
    const VERSION: u16 = FORMAT_VERSION;
    const NAME: &'static str = "shard descriptor";

    fn encode_body<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.shard_id.get());
        match self.mode {
            ShardMode::Slab { class_count } => {
                buf.put_u8(ShardMode::SLAB_TAG);
                buf.put_u64_le(u64::from(class_count));
            }
            ShardMode::Fifo { ring_segments } => {
                buf.put_u8(ShardMode::FIFO_TAG);
                buf.put_u64_le(ring_segments);
            }
        }
        buf.put_u32_le(self.flags.bits());
        buf.put_u32_le(self.segment_blocks);
        buf.put_u32_le(self.align_blocks);
        buf.put_u64_le(self.total_blocks);
        buf.put_u64_le(self.total_segments);
        buf.put_u64_le(self.metadata_blocks);
        buf.put_u64_le(self.segmap_offset);
        buf.put_u64_le(self.segmap_blocks);
        buf.put_u64_le(self.class_map_blocks);
        buf.put_u32_le(self.class_offsets.len() as u32);
        for slot in 0..MAX_CLASSES {
            buf.put_u64_le(self.class_offsets.get(slot).copied().unwrap_or(0));
        }
        buf.put_u64_le(self.blob_offset);
        buf.put_u64_le(self.checkpoint_offset);
        buf.put_u64_le(self.table_offset);
        buf.put_u64_le(self.table_blocks);
        buf.put_u64_le(self.table_padding);
        buf.put_u64_le(self.log_offsets[0]);
        buf.put_u64_le(self.log_offsets[1]);
        buf.put_u64_le(self.log_blocks);
        buf.put_u64_le(self.log_padding);
        buf.put_u64_le(self.reserved_blocks);
        buf.put_u64_le(self.reserved_segments);
    }

    fn decode_body<B: Buf>(_version: u16, buf: &mut B) -> Result<Self> {
        let shard_id = ShardId::new(buf.get_u32_le());
        let tag = buf.get_u8();
        let payload = buf.get_u64_le();
        let mode = match tag {
            ShardMode::SLAB_TAG => ShardMode::Slab {
                class_count: u32::try_from(payload)
                    .map_err(|_| Error::corruption("class count out of range"))?,
            },
            ShardMode::FIFO_TAG => ShardMode::Fifo {
                ring_segments: payload,
            },
            other => return Err(Error::corruption(format!("unknown shard mode {other}"))),
        };
        let raw_flags = buf.get_u32_le();
        let flags = ShardFlags::from_bits(raw_flags)
            .ok_or_else(|| Error::corruption(format!("unknown shard flags {raw_flags:#x}")))?;
        let segment_blocks = buf.get_u32_le();
        let align_blocks = buf.get_u32_le();
        let total_blocks = buf.get_u64_le();
        let total_segments = buf.get_u64_le();
        let metadata_blocks = buf.get_u64_le();
        let segmap_offset = buf.get_u64_le();
        let segmap_blocks = buf.get_u64_le();
        let class_map_blocks = buf.get_u64_le();
        let class_count = buf.get_u32_le() as usize;
        if class_count > MAX_CLASSES || class_count != mode.class_count() as usize {
            return Err(Error::corruption(format!(
                "shard descriptor lists {class_count} classes for {mode:?}"
            )));
        }
        let mut class_offsets = Vec::with_capacity(class_count);
        for slot in 0..MAX_CLASSES {
            let offset = buf.get_u64_le();
            if slot < class_count {
                class_offsets.push(offset);
            }
        }
        Ok(Self {
            shard_id,
            mode,
            flags,
            segment_blocks,
            align_blocks,
            total_blocks,
            total_segments,
            metadata_blocks,
            segmap_offset,
            segmap_blocks,
            class_map_blocks,
            class_offsets,
            blob_offset: buf.get_u64_le(),
            checkpoint_offset: buf.get_u64_le(),
            table_offset: buf.get_u64_le(),
            table_blocks: buf.get_u64_le(),
            table_padding: buf.get_u64_le(),
            log_offsets: [buf.get_u64_le(), buf.get_u64_le()],
            log_blocks: buf.get_u64_le(),
            log_padding: buf.get_u64_le(),
            reserved_blocks: buf.get_u64_le(),
            reserved_segments: buf.get_u64_le(),
        })
    }
}

/// One block of a segment list
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SegmentMapBlock {
    /// Position of this block within its map
    pub index: u32,
    pub entries: Vec<u64>,
}

impl SegmentMapBlock {
    /// Pack a physical location into a map entry
    pub const fn pack(block: PhysicalBlock) -> u64 {
        ((block.device as u64) << 48) | (block.offset / BLOCK_SIZE as u64)
    }

    /// Unpack a map entry into a physical location
    pub const fn unpack(entry: u64) -> PhysicalBlock {
        PhysicalBlock {
            device: (entry >> 48) as usize,
            offset: (entry & ((1 << 48) - 1)) * BLOCK_SIZE as u64,
        }
    }
}

impl MetadataBlock for SegmentMapBlock {
    const MAGIC: u32 = magic::SEGMENT_MAP;
    const VERSION: u16 = FORMAT_VERSION;
    const NAME: &'static str = "segment map";

    fn encode_body<B: BufMut>(&self, buf: &mut B) {
        let count = self.entries.len().min(SEGMAP_ENTRIES);
        buf.put_u32_le(self.index);
        buf.put_u32_le(count as u32);
        for entry in &self.entries[..count] {
            buf.put_u64_le(*entry);
        }
    }

    fn decode_body<B: Buf>(_version: u16, buf: &mut B) -> Result<Self> {
        let index = buf.get_u32_le();
        let count = buf.get_u32_le() as usize;
        if count > SEGMAP_ENTRIES {
            return Err(Error::corruption(format!("segment map block holds {count} entries")));
        }
        let entries = (0..count).map(|_| buf.get_u64_le()).collect();
        Ok(Self { index, entries })
    }
}

/// Descriptor of one slab class
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassDescriptor {
    pub class_index: u32,
    /// Slab size in blocks, a power of two
    pub slab_blocks: u32,
    pub segment_count: u32,
    pub map_offset: u64,
    pub map_blocks: u64,
}

impl MetadataBlock for ClassDescriptor {
    const MAGIC: u32 = magic::CLASS_DESCRIPTOR;
    const VERSION: u16 = FORMAT_VERSION;
    const NAME: &'static str = "class descriptor";

    fn encode_body<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.class_index);
        buf.put_u32_le(self.slab_blocks);
        buf.put_u32_le(self.segment_count);
        buf.put_u64_le(self.map_offset);
        buf.put_u64_le(self.map_blocks);
    }

    fn decode_body<B: Buf>(_version: u16, buf: &mut B) -> Result<Self> {
        let desc = Self {
            class_index: buf.get_u32_le(),
            slab_blocks: buf.get_u32_le(),
            segment_count: buf.get_u32_le(),
            map_offset: buf.get_u64_le(),
            map_blocks: buf.get_u64_le(),
        };
        if !desc.slab_blocks.is_power_of_two() {
            return Err(Error::corruption(format!(
                "class {} slab size {} is not a power of two",
                desc.class_index, desc.slab_blocks
            )));
        }
        Ok(desc)
    }
}

/// Highest log sequence number reflected in the object table
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Checkpoint {
    pub shard_id: ShardId,
    pub lsn: Lsn,
    /// Number of times the checkpoint was rewritten
    pub generation: u64,
}

impl MetadataBlock for Checkpoint {
    const MAGIC: u32 = magic::CHECKPOINT;
    const VERSION: u16 = FORMAT_VERSION;
    const NAME: &'static str = "checkpoint";

    fn encode_body<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.shard_id.get());
        buf.put_u32_le(0);
        buf.put_u64_le(self.lsn);
        buf.put_u64_le(self.generation);
    }

    fn decode_body<B: Buf>(_version: u16, buf: &mut B) -> Result<Self> {
        let shard_id = ShardId::new(buf.get_u32_le());
        buf.advance(4);
        Ok(Self {
            shard_id,
            lsn: buf.get_u64_le(),
            generation: buf.get_u64_le(),
        })
    }
}

/// Size of a log slot (header or record)
pub const LOG_SLOT_SIZE: usize = 64;

/// Slots in one log page
pub const SLOTS_PER_PAGE: usize = BLOCK_SIZE / LOG_SLOT_SIZE;

/// Records in one log page (slot 0 is the header)
pub const RECORDS_PER_PAGE: usize = SLOTS_PER_PAGE - 1;

const PAGE_LSN_OFFSET: usize = 16;

/// Record flag: delete retained as a tombstone
pub const RECORD_TOMBSTONE: u8 = 0x01;

/// One object-location change
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogRecord {
    pub syndrome: u16,
    pub flags: u8,
    /// Block count; zero means delete
    pub blocks: u32,
    pub bucket: u64,
    /// Logical shard block the record applies to
    pub offset: u64,
    pub seqno: Seqno,
    /// Location superseded by this record (overwrite)
    pub superseded: Option<u64>,
}

impl LogRecord {
    /// Record creating an object at `offset`
    pub const fn create(syndrome: u16, bucket: u64, offset: u64, blocks: u32, seqno: Seqno) -> Self {
        Self {
            syndrome,
            flags: 0,
            blocks,
            bucket,
            offset,
            seqno,
            superseded: None,
        }
    }

    /// Record deleting the object at `offset`
    pub const fn delete(syndrome: u16, bucket: u64, offset: u64, seqno: Seqno) -> Self {
        Self {
            syndrome,
            flags: 0,
            blocks: 0,
            bucket,
            offset,
            seqno,
            superseded: None,
        }
    }

    /// Record creating at `offset` and atomically deleting at `old_offset`
    pub const fn overwrite(
        syndrome: u16,
        bucket: u64,
        offset: u64,
        blocks: u32,
        seqno: Seqno,
        old_offset: u64,
    ) -> Self {
        Self {
            syndrome,
            flags: 0,
            blocks,
            bucket,
            offset,
            seqno,
            superseded: Some(old_offset),
        }
    }

    /// Mark the delete as retained tombstone
    #[must_use]
    pub const fn with_tombstone(mut self) -> Self {
        self.flags |= RECORD_TOMBSTONE;
        self
    }

    pub const fn is_delete(&self) -> bool {
        self.blocks == 0
    }

    pub const fn is_tombstone(&self) -> bool {
        self.flags & RECORD_TOMBSTONE != 0
    }

    /// Every table offset this record touches
    pub fn touched(&self) -> impl Iterator<Item = u64> {
        std::iter::once(self.offset).chain(self.superseded)
    }

    /// Encode into a 64 byte slot
    pub fn encode_into(&self, slot: &mut [u8]) {
        let mut buf = &mut slot[..LOG_SLOT_SIZE];
        buf.put_u16_le(self.syndrome);
        buf.put_u8(self.flags);
        buf.put_u8(0);
        buf.put_u32_le(self.blocks);
        buf.put_u64_le(self.bucket);
        buf.put_u64_le(self.offset);
        buf.put_u64_le(self.seqno);
        buf.put_u64_le(self.superseded.map_or(0, |old| !old));
        let rest = buf.remaining_mut();
        buf.put_bytes(0, rest);
    }

    /// Decode a slot; `None` for an unused slot
    pub fn decode(slot: &[u8]) -> Option<Self> {
        let mut buf = &slot[..LOG_SLOT_SIZE];
        let syndrome = buf.get_u16_le();
        let flags = buf.get_u8();
        buf.advance(1);
        let blocks = buf.get_u32_le();
        let bucket = buf.get_u64_le();
        let offset = buf.get_u64_le();
        let seqno = buf.get_u64_le();
        let old = buf.get_u64_le();
        if seqno == 0 {
            return None;
        }
        Some(Self {
            syndrome,
            flags,
            blocks,
            bucket,
            offset,
            seqno,
            superseded: (old != 0).then_some(!old),
        })
    }
}

/// Outcome of validating a log page
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageCheck {
    /// Page is intact and carries this LSN
    Valid(Lsn),
    /// Page was never written
    Blank,
    /// Page carries the log magic but fails its checksum
    Torn { stored: u32, computed: u32 },
}

/// Log page helpers; a page is one block of eight slots
pub struct LogPage;

impl LogPage {
    /// Stamp the header with `lsn` and seal the page
    pub fn seal(page: &mut [u8], lsn: Lsn) {
        let mut buf = &mut page[..HEADER_SIZE + 8];
        put_header(&mut buf, magic::LOG_PAGE, LOG_FORMAT_VERSION);
        buf.put_u64_le(lsn);
        seal_block(&mut page[..BLOCK_SIZE], fold_seed(magic::LOG_PAGE, lsn), CHECKSUM_OFFSET);
    }

    /// LSN recorded in the header, unvalidated
    pub fn lsn(page: &[u8]) -> Lsn {
        let mut buf = &page[PAGE_LSN_OFFSET..PAGE_LSN_OFFSET + 8];
        buf.get_u64_le()
    }

    /// Validate a page read from disk
    pub fn check(page: &[u8]) -> Result<PageCheck> {
        let mut buf = &page[..HEADER_SIZE];
        let found = buf.get_u32_le();
        if found != magic::LOG_PAGE {
            return Ok(PageCheck::Blank);
        }
        let version = buf.get_u16_le();
        let lsn = Self::lsn(page);
        if let Err((stored, computed)) =
            verify_block_checksum(&page[..BLOCK_SIZE], fold_seed(magic::LOG_PAGE, lsn), CHECKSUM_OFFSET)
        {
            return Ok(PageCheck::Torn { stored, computed });
        }
        if version == 0 || version > LOG_FORMAT_VERSION {
            return Err(Error::UnsupportedVersion {
                structure: "log page",
                version,
            });
        }
        Ok(PageCheck::Valid(lsn))
    }

    /// Record in slot `index` (1-based record slots, 0 is the header)
    pub fn record(page: &[u8], slot: usize) -> Option<LogRecord> {
        debug_assert!((1..SLOTS_PER_PAGE).contains(&slot));
        LogRecord::decode(&page[slot * LOG_SLOT_SIZE..(slot + 1) * LOG_SLOT_SIZE])
    }

    /// All used records of a page, in slot order
    pub fn records(page: &[u8]) -> impl Iterator<Item = LogRecord> + '_ {
        (1..SLOTS_PER_PAGE).filter_map(move |slot| Self::record(page, slot))
    }
}

/// Size of an object-table entry
pub const TABLE_ENTRY_SIZE: usize = 32;

/// Object-table entries per block
pub const ENTRIES_PER_BLOCK: usize = BLOCK_SIZE / TABLE_ENTRY_SIZE;

/// Entry flag: delete retained as tombstone
pub const ENTRY_TOMBSTONE: u8 = 0x01;
/// Entry flag: block superseded by an overwrite, awaiting reclaim
pub const ENTRY_DELETED: u8 = 0x02;

/// On-disk mirror of one hash-table entry
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TableEntry {
    pub syndrome: u16,
    pub flags: u8,
    pub blocks: u32,
    pub bucket: u64,
    pub seqno: Seqno,
}

impl TableEntry {
    pub const EMPTY: Self = Self {
        syndrome: 0,
        flags: 0,
        blocks: 0,
        bucket: 0,
        seqno: 0,
    };

    pub const fn is_empty(&self) -> bool {
        self.blocks == 0 && self.bucket == 0
    }

    pub const fn is_tombstone(&self) -> bool {
        self.flags & ENTRY_TOMBSTONE != 0
    }

    pub const fn is_deleted(&self) -> bool {
        self.flags & ENTRY_DELETED != 0
    }

    /// Entry names a live object
    pub const fn is_live(&self) -> bool {
        !self.is_empty() && self.flags & (ENTRY_TOMBSTONE | ENTRY_DELETED) == 0
    }

    pub fn encode_into(&self, slot: &mut [u8]) {
        let mut buf = &mut slot[..TABLE_ENTRY_SIZE];
        buf.put_u16_le(self.syndrome);
        buf.put_u8(self.flags);
        buf.put_u8(0);
        buf.put_u32_le(self.blocks);
        buf.put_u64_le(self.bucket);
        buf.put_u64_le(self.seqno);
        buf.put_u64_le(0);
    }

    pub fn decode(slot: &[u8]) -> Self {
        let mut buf = &slot[..TABLE_ENTRY_SIZE];
        let syndrome = buf.get_u16_le();
        let flags = buf.get_u8();
        buf.advance(1);
        Self {
            syndrome,
            flags,
            blocks: buf.get_u32_le(),
            bucket: buf.get_u64_le(),
            seqno: buf.get_u64_le(),
        }
    }
}
