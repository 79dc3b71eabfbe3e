//! Retained-delete tracking
//!
//! Shards that replicate (or cache) keep the blocks of deleted objects until
//! every peer has seen the delete. The tracker keeps those tombstones in a
//! seqno-ordered doubly-linked list and frees everything below the retained
//! tombstone guarantee (RTG) when asked to prune.

use crate::mapper::SegmentAllocator;
use flashkv_common::{Result, Seqno, ShardId};
use tracing::{debug, trace};

/// A delete whose blocks are still held
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tombstone {
    pub syndrome: u16,
    pub offset: u64,
    pub seqno: Seqno,
}

#[derive(Clone, Copy, Debug)]
struct Node {
    tombstone: Tombstone,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Tracker counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TombstoneStats {
    pub live: u64,
    /// Live tombstones held outside the fixed slab
    pub overflow: u64,
    pub added: u64,
    pub pruned: u64,
    pub peak: u64,
    pub rtg: Seqno,
}

/// Seqno-ordered tombstone list for one shard
pub struct TombstoneTracker {
    shard: ShardId,
    nodes: Vec<Option<Node>>,
    slab_capacity: usize,
    slab_free: Vec<usize>,
    overflow_free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    rtg: Seqno,
    stats: TombstoneStats,
}

impl TombstoneTracker {
    pub fn new(shard: ShardId, slab_capacity: usize) -> Self {
        Self {
            shard,
            nodes: vec![None; slab_capacity],
            slab_capacity,
            slab_free: (0..slab_capacity).rev().collect(),
            overflow_free: Vec::new(),
            head: None,
            tail: None,
            rtg: 0,
            stats: TombstoneStats::default(),
        }
    }

    fn node(&self, index: usize) -> &Node {
        self.nodes[index].as_ref().unwrap_or_else(|| unreachable!("linked slot {index} is free"))
    }

    fn node_mut(&mut self, index: usize) -> &mut Node {
        self.nodes[index].as_mut().unwrap_or_else(|| unreachable!("linked slot {index} is free"))
    }

    fn take_slot(&mut self) -> usize {
        if let Some(index) = self.slab_free.pop().or_else(|| self.overflow_free.pop()) {
            return index;
        }
        self.nodes.push(None);
        self.nodes.len() - 1
    }

    /// Track a tombstone, keeping the list ordered by seqno
    pub fn add(&mut self, syndrome: u16, offset: u64, seqno: Seqno) {
        let tombstone = Tombstone {
            syndrome,
            offset,
            seqno,
        };
        // Deletes arrive nearly in seqno order; search from the tail
        let mut after = self.tail;
        while let Some(index) = after {
            let node = self.node(index);
            if node.tombstone.seqno <= seqno {
                break;
            }
            after = node.prev;
        }
        let before = match after {
            Some(index) => self.node(index).next,
            None => self.head,
        };

        let slot = self.take_slot();
        self.nodes[slot] = Some(Node {
            tombstone,
            prev: after,
            next: before,
        });
        match after {
            Some(index) => self.node_mut(index).next = Some(slot),
            None => self.head = Some(slot),
        }
        match before {
            Some(index) => self.node_mut(index).prev = Some(slot),
            None => self.tail = Some(slot),
        }

        self.stats.added += 1;
        self.stats.live += 1;
        if slot >= self.slab_capacity {
            self.stats.overflow += 1;
        }
        self.stats.peak = self.stats.peak.max(self.stats.live);
        trace!("{} tombstone at {offset} seqno {seqno}", self.shard);
    }

    fn pop_head(&mut self) -> Option<Tombstone> {
        let index = self.head?;
        let node = self.nodes[index].take()?;
        self.head = node.next;
        match node.next {
            Some(next) => self.node_mut(next).prev = None,
            None => self.tail = None,
        }
        if index < self.slab_capacity {
            self.slab_free.push(index);
        } else {
            self.overflow_free.push(index);
            self.stats.overflow -= 1;
        }
        self.stats.live -= 1;
        Some(node.tombstone)
    }

    /// Set the retained tombstone guarantee; it never moves backwards
    pub fn set_rtg(&mut self, rtg: Seqno) {
        if rtg < self.rtg {
            debug!("{} ignoring RTG {rtg} below {}", self.shard, self.rtg);
            return;
        }
        self.rtg = rtg;
        self.stats.rtg = rtg;
    }

    pub const fn rtg(&self) -> Seqno {
        self.rtg
    }

    /// Oldest tracked seqno
    pub fn oldest(&self) -> Option<Seqno> {
        self.head.map(|index| self.node(index).tombstone.seqno)
    }

    /// Free every tombstone below the RTG, returning how many were freed
    pub fn prune(&mut self, alloc: &dyn SegmentAllocator) -> Result<u64> {
        let mut freed = 0;
        while let Some(tombstone) = self.head.map(|index| self.node(index).tombstone) {
            if tombstone.seqno >= self.rtg {
                break;
            }
            // Stays tracked until its blocks are actually released
            alloc.deallocate(self.shard, tombstone.offset)?;
            self.pop_head();
            self.stats.pruned += 1;
            freed += 1;
        }
        if freed > 0 {
            debug!(
                "{} pruned {freed} tombstones below RTG {}, {} remain",
                self.shard, self.rtg, self.stats.live
            );
        }
        Ok(freed)
    }

    /// Tracked tombstones in seqno order
    pub fn iter(&self) -> impl Iterator<Item = Tombstone> + '_ {
        std::iter::successors(self.head, move |&index| self.node(index).next)
            .map(move |index| self.node(index).tombstone)
    }

    pub const fn len(&self) -> u64 {
        self.stats.live
    }

    pub const fn is_empty(&self) -> bool {
        self.stats.live == 0
    }

    pub const fn stats(&self) -> TombstoneStats {
        self.stats
    }
}
