//! Configuration types for FlashKV
//!
//! This module defines the configuration of the recovery engine. All sections
//! have defaults so a partial TOML file is enough to open a pool.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration of the recovery engine
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Devices of the flash pool, one superblock copy per device
    pub devices: Vec<DeviceConfig>,
    /// On-disk geometry
    pub layout: LayoutConfig,
    /// Recovery log writer
    pub log: LogConfig,
    /// Object-table updater
    pub updater: UpdaterConfig,
    /// In-memory hash index rebuilt by recovery
    pub hash: HashConfig,
    /// Tombstone retention
    pub tombstone: TombstoneConfig,
    /// Abort the process on unrecoverable corruption
    pub abort_on_fatal: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            layout: LayoutConfig::default(),
            log: LogConfig::default(),
            updater: UpdaterConfig::default(),
            hash: HashConfig::default(),
            tombstone: TombstoneConfig::default(),
            abort_on_fatal: true,
        }
    }
}

impl EngineConfig {
    /// Check that the configured geometry is self-consistent
    pub fn validate(&self) -> Result<()> {
        let layout = &self.layout;
        if !layout.align_blocks.is_power_of_two() {
            return Err(Error::Configuration(format!(
                "align_blocks {} is not a power of two",
                layout.align_blocks
            )));
        }
        if layout.segment_blocks == 0 || layout.segment_blocks % layout.align_blocks != 0 {
            return Err(Error::Configuration(format!(
                "segment_blocks {} is not a multiple of align_blocks {}",
                layout.segment_blocks, layout.align_blocks
            )));
        }
        if layout.max_shards == 0 {
            return Err(Error::Configuration("max_shards must be nonzero".into()));
        }
        if !self.log.buffer_pages.is_power_of_two()
            || u64::from(self.log.buffer_pages) > u64::from(layout.align_blocks)
        {
            return Err(Error::Configuration(format!(
                "log buffer_pages {} must be a power of two no larger than align_blocks {}",
                self.log.buffer_pages, layout.align_blocks
            )));
        }
        if self.log.buffer_count < 2 {
            return Err(Error::Configuration(
                "log buffer_count must be at least 2".into(),
            ));
        }
        if self.updater.pool_buffers == 0 || self.updater.pool_buffer_blocks == 0 {
            return Err(Error::Configuration(
                "updater pool must have at least one nonempty buffer".into(),
            ));
        }
        if self.updater.online_pool_divisor == 0 {
            return Err(Error::Configuration(
                "updater online_pool_divisor must be nonzero".into(),
            ));
        }
        if self.updater.log_read_blocks == 0 {
            return Err(Error::Configuration(
                "updater log_read_blocks must be nonzero".into(),
            ));
        }
        if self.hash.slots_per_bucket == 0 {
            return Err(Error::Configuration(
                "hash slots_per_bucket must be nonzero".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration for a single device of the pool
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Path to the device or backing file
    pub path: PathBuf,
    /// Use direct I/O (O_DIRECT on Linux)
    #[serde(default = "default_direct_io")]
    pub direct_io: bool,
}

const fn default_direct_io() -> bool {
    true
}

/// On-disk geometry
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    /// Blocks per allocation segment
    pub segment_blocks: u32,
    /// Alignment boundary of tables and logs, in blocks
    pub align_blocks: u32,
    /// Number of shard property slots in the superblock
    pub max_shards: u32,
    /// Log size is the table size shifted right by this amount
    pub log_size_shift: u32,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            segment_blocks: 2048, // 1 MiB
            align_blocks: 64,     // 32 KiB
            max_shards: 64,
            log_size_shift: 3,
        }
    }
}

/// Recovery log writer configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Pages per in-memory log buffer
    pub buffer_pages: u32,
    /// Number of in-memory log buffers
    pub buffer_count: u32,
    /// Records written since the last device sync that force a sync
    pub sync_threshold: u32,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            buffer_pages: 64,
            buffer_count: 2,
            sync_threshold: 4096,
        }
    }
}

/// How updater threads are deployed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdaterMode {
    /// One updater thread per open shard
    #[default]
    PerShard,
    /// A single updater thread shared by all shards
    Global,
}

/// Object-table updater configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    /// Thread deployment
    pub mode: UpdaterMode,
    /// Number of pre-allocated table-update buffers
    pub pool_buffers: u32,
    /// Size of each table-update buffer, in blocks
    pub pool_buffer_blocks: u32,
    /// Online merges reserve `pool_buffers / online_pool_divisor` buffers
    pub online_pool_divisor: u32,
    /// Size of each log-read buffer, in blocks
    pub log_read_blocks: u32,
    /// Number of pre-allocated log-read buffers
    pub log_read_buffers: u32,
    /// Rescan chunks skipped by the range optimisation and fail on any hit
    pub verify_skips: bool,
    /// Yield the thread after scanning this many log pages
    pub yield_interval: u32,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            mode: UpdaterMode::PerShard,
            pool_buffers: 8,
            pool_buffer_blocks: 2048,
            online_pool_divisor: 4,
            log_read_blocks: 256,
            log_read_buffers: 2,
            verify_skips: false,
            yield_interval: 1024,
        }
    }
}

/// Hash index sizing
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HashConfig {
    /// Entries per hash bucket
    pub slots_per_bucket: u32,
    /// Overflow table size as a percentage of the bucket table
    pub overflow_percent: u32,
}

impl Default for HashConfig {
    fn default() -> Self {
        Self {
            slots_per_bucket: 4,
            overflow_percent: 10,
        }
    }
}

/// Tombstone tracker configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TombstoneConfig {
    /// Tombstones held in the fixed slab before overflow allocation
    pub slab_capacity: u32,
}

impl Default for TombstoneConfig {
    fn default() -> Self {
        Self {
            slab_capacity: 4096,
        }
    }
}
