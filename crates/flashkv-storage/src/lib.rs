//! FlashKV storage engine - persistence and crash recovery
//!
//! This crate implements the on-flash core of FlashKV:
//! - Raw device access (O_DIRECT / F_NOCACHE) and an in-memory device
//! - Superblock replication and voting across pool devices
//! - Shard metadata layout and formatting
//! - Dual recovery logs with a batching log writer
//! - Object-table updater and two-pass crash recovery
//! - Tombstones, backup bitmaps and the engine facade

pub mod backup;
pub mod block;
pub mod engine;
pub mod format;
pub mod hash;
pub mod layout;
pub mod mapper;
pub mod pool;
pub mod raw_io;
pub mod rlog;
pub mod shard;
pub mod superblock;
pub mod sync;
pub mod tombstone;
pub mod updater;

#[cfg(test)]
mod testutil;

// Re-exports
pub use backup::{BackupCoordinator, BackupKind};
pub use block::{BlockBitmap, Extent};
pub use engine::{BlobScope, RecoveryEngine, protocol_version};
pub use hash::{ClassClocks, HashEntry, HashIndex};
pub use layout::{
    Checkpoint, FORMAT_VERSION, FlashDescriptor, LOG_FORMAT_VERSION, LogRecord, ShardDescriptor, ShardMode,
    ShardProperties, TableEntry, VolumeLabel,
};
pub use mapper::{SegmentAllocator, StripedAllocator};
pub use raw_io::{AlignedBuffer, BlockDevice, MemDevice, RawFile};
pub use rlog::{LogPosition, LogRange, LogStats, LogWriter};
pub use superblock::{SuperblockManager, SuperblockStats};
pub use tombstone::{Tombstone, TombstoneStats, TombstoneTracker};
pub use updater::{RecoveryReport, UpdaterThread};
