//! Core type definitions for FlashKV
//!
//! Identifiers, shard flags and states shared between the storage engine and
//! its tools.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Log sequence number of a written log page
pub type Lsn = u64;

/// Object sequence number assigned by the object store
pub type Seqno = u64;

/// On-disk block size in bytes
pub const BLOCK_SIZE: usize = 512;

/// Identifier of a shard (index of its property slot)
#[derive(
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into,
)]
#[display("shard-{_0}")]
pub struct ShardId(u32);

impl ShardId {
    /// Create a shard id
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Raw slot index
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Slot index as usize
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShardId({})", self.0)
    }
}

/// One of the two recovery logs of a shard
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum LogId {
    #[display("log0")]
    Zero,
    #[display("log1")]
    One,
}

impl LogId {
    /// Both logs, in index order
    pub const ALL: [Self; 2] = [Self::Zero, Self::One];

    /// The opposite log
    #[must_use]
    pub const fn other(self) -> Self {
        match self {
            Self::Zero => Self::One,
            Self::One => Self::Zero,
        }
    }

    /// Index of this log (0 or 1)
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Zero => 0,
            Self::One => 1,
        }
    }

    /// Log for an index; anything but 0 is log 1
    #[must_use]
    pub const fn from_index(index: usize) -> Self {
        if index == 0 { Self::Zero } else { Self::One }
    }
}

/// Persistence and eviction flags of a shard
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardFlags(u32);

impl ShardFlags {
    /// Objects survive restart (shard has logs and a table)
    pub const PERSISTENT: Self = Self(1 << 0);
    /// Objects may be evicted when the shard is full
    pub const EVICTING: Self = Self(1 << 1);
    /// Shard is replicated; deletes are retained as tombstones
    pub const REPLICATED: Self = Self(1 << 2);
    /// Cache-mode shard laid out as a FIFO ring instead of slab classes
    pub const CACHE_MODE: Self = Self(1 << 3);

    const ALL_BITS: u32 = 0b1111;

    /// Empty flag set
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Construct from raw bits, rejecting unknown bits
    #[must_use]
    pub const fn from_bits(bits: u32) -> Option<Self> {
        if bits & !Self::ALL_BITS == 0 {
            Some(Self(bits))
        } else {
            None
        }
    }

    /// Raw bits
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Check whether all bits of `other` are set
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of two flag sets
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Deletes must be retained as tombstones until the RTG passes them
    #[must_use]
    pub const fn retains_tombstones(self) -> bool {
        self.contains(Self::REPLICATED) || self.contains(Self::CACHE_MODE)
    }
}

impl std::ops::BitOr for ShardFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl fmt::Debug for ShardFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::PERSISTENT, "PERSISTENT"),
            (Self::EVICTING, "EVICTING"),
            (Self::REPLICATED, "REPLICATED"),
            (Self::CACHE_MODE, "CACHE_MODE"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "ShardFlags({})", set.join("|"))
    }
}

/// Lifecycle state of a shard as recorded in its property slot
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[repr(u8)]
pub enum ShardState {
    /// Slot is unused
    #[default]
    Free = 0,
    /// Region formatted, never opened
    Formatted = 1,
    /// Shard is open and serving
    Open = 2,
    /// Shard was closed cleanly
    Closed = 3,
    /// Deletion in progress
    Deleting = 4,
}

impl ShardState {
    /// Decode a state byte
    #[must_use]
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Free),
            1 => Some(Self::Formatted),
            2 => Some(Self::Open),
            3 => Some(Self::Closed),
            4 => Some(Self::Deleting),
            _ => None,
        }
    }
}

/// A physical location on one device of the pool
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PhysicalBlock {
    /// Index of the device in the pool
    pub device: usize,
    /// Byte offset on that device
    pub offset: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_id_display() {
        assert_eq!(ShardId::new(7).to_string(), "shard-7");
        assert_eq!(u32::from(ShardId::new(3)), 3);
    }

    #[test]
    fn test_log_id_other() {
        assert_eq!(LogId::Zero.other(), LogId::One);
        assert_eq!(LogId::One.other(), LogId::Zero);
        assert_eq!(LogId::from_index(LogId::One.index()), LogId::One);
    }

    #[test]
    fn test_shard_flags() {
        let flags = ShardFlags::PERSISTENT | ShardFlags::REPLICATED;
        assert!(flags.contains(ShardFlags::PERSISTENT));
        assert!(!flags.contains(ShardFlags::EVICTING));
        assert!(flags.retains_tombstones());
        assert!(!ShardFlags::PERSISTENT.retains_tombstones());
        assert_eq!(ShardFlags::from_bits(1 << 9), None);
        assert_eq!(format!("{flags:?}"), "ShardFlags(PERSISTENT|REPLICATED)");
    }

    #[test]
    fn test_shard_state_roundtrip() {
        for state in [
            ShardState::Free,
            ShardState::Formatted,
            ShardState::Open,
            ShardState::Closed,
            ShardState::Deleting,
        ] {
            assert_eq!(ShardState::from_u8(state as u8), Some(state));
        }
        assert_eq!(ShardState::from_u8(9), None);
    }
}
