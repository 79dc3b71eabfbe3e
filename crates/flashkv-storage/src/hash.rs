//! In-memory hash index rebuilt by recovery
//!
//! The object store's hash table is a fixed bucket array plus a small
//! overflow table. Recovery refills it from the live entries of the object
//! table; when an evicting shard runs out of room the oldest object of the
//! bucket is evicted instead of failing.

use flashkv_common::config::HashConfig;
use flashkv_common::{Error, Result, Seqno, ShardId};
use tracing::{debug, warn};

/// One indexed object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HashEntry {
    pub syndrome: u16,
    /// Logical shard block of the object
    pub offset: u64,
    pub blocks: u32,
    pub seqno: Seqno,
}

/// Bucket array with overflow table
pub struct HashIndex {
    shard: ShardId,
    slots_per_bucket: usize,
    bucket_count: u64,
    slots: Vec<Option<HashEntry>>,
    overflow: Vec<(u64, HashEntry)>,
    overflow_capacity: usize,
    evicting: bool,
    evicted: Vec<HashEntry>,
    len: u64,
}

impl HashIndex {
    /// Size the index for `max_objects` objects
    pub fn new(shard: ShardId, max_objects: u64, config: &HashConfig, evicting: bool) -> Self {
        let slots_per_bucket = config.slots_per_bucket.max(1) as usize;
        let bucket_count = max_objects.max(1).div_ceil(slots_per_bucket as u64);
        let overflow_capacity =
            ((bucket_count * slots_per_bucket as u64 * u64::from(config.overflow_percent)) / 100).max(1) as usize;
        debug!(
            "{shard} hash index: {bucket_count} buckets x {slots_per_bucket}, overflow {overflow_capacity}"
        );
        Self {
            shard,
            slots_per_bucket,
            bucket_count,
            slots: vec![None; bucket_count as usize * slots_per_bucket],
            overflow: Vec::new(),
            overflow_capacity,
            evicting,
            evicted: Vec::new(),
            len: 0,
        }
    }

    fn bucket_range(&self, bucket: u64) -> std::ops::Range<usize> {
        let start = (bucket % self.bucket_count) as usize * self.slots_per_bucket;
        start..start + self.slots_per_bucket
    }

    /// Index an object under its bucket hash
    pub fn insert(&mut self, bucket: u64, entry: HashEntry) -> Result<()> {
        let range = self.bucket_range(bucket);
        if let Some(slot) = self.slots[range.clone()].iter_mut().find(|s| s.is_none()) {
            *slot = Some(entry);
            self.len += 1;
            return Ok(());
        }
        if self.overflow.len() < self.overflow_capacity {
            self.overflow.push((bucket % self.bucket_count, entry));
            self.len += 1;
            return Ok(());
        }
        if !self.evicting {
            return Err(Error::consistency(format!(
                "{} hash index overflow at bucket {}",
                self.shard,
                bucket % self.bucket_count
            )));
        }

        let oldest = self.slots[range]
            .iter_mut()
            .filter_map(|slot| slot.as_mut())
            .min_by_key(|existing| existing.seqno);
        let victim = match oldest {
            Some(existing) if existing.seqno < entry.seqno => std::mem::replace(existing, entry),
            _ => entry,
        };
        warn!(
            "{} evicted object at {} (seqno {}) from a full bucket",
            self.shard, victim.offset, victim.seqno
        );
        self.evicted.push(victim);
        Ok(())
    }

    /// Entries of a bucket carrying `syndrome`
    pub fn lookup(&self, bucket: u64, syndrome: u16) -> impl Iterator<Item = &HashEntry> + '_ {
        let home = bucket % self.bucket_count;
        self.slots[self.bucket_range(bucket)]
            .iter()
            .flatten()
            .chain(
                self.overflow
                    .iter()
                    .filter(move |(b, _)| *b == home)
                    .map(|(_, entry)| entry),
            )
            .filter(move |entry| entry.syndrome == syndrome)
    }

    /// Objects indexed, evictions excluded
    pub const fn len(&self) -> u64 {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub const fn bucket_count(&self) -> u64 {
        self.bucket_count
    }

    pub fn overflow_len(&self) -> usize {
        self.overflow.len()
    }

    /// Objects evicted for lack of room
    pub fn evicted(&self) -> &[HashEntry] {
        &self.evicted
    }
}

/// Per-class eviction clock seeds: the oldest seqno found in each class
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClassClocks {
    seeds: Vec<Option<Seqno>>,
}

impl ClassClocks {
    pub fn new(classes: usize) -> Self {
        Self {
            seeds: vec![None; classes],
        }
    }

    pub fn observe(&mut self, class: usize, seqno: Seqno) {
        if let Some(seed) = self.seeds.get_mut(class) {
            *seed = Some(seed.map_or(seqno, |current| current.min(seqno)));
        }
    }

    /// Clock seed of a class; `None` when the class holds no objects
    pub fn seed(&self, class: usize) -> Option<Seqno> {
        self.seeds.get(class).copied().flatten()
    }

    pub fn len(&self) -> usize {
        self.seeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seeds.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(offset: u64, seqno: Seqno) -> HashEntry {
        HashEntry {
            syndrome: 7,
            offset,
            blocks: 1,
            seqno,
        }
    }

    fn config() -> HashConfig {
        HashConfig {
            slots_per_bucket: 2,
            overflow_percent: 25,
        }
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut index = HashIndex::new(ShardId::new(0), 8, &config(), false);
        assert_eq!(index.bucket_count(), 4);
        index.insert(1, entry(10, 1)).unwrap();
        index.insert(5, entry(20, 2)).unwrap();
        // Third entry in bucket 1 spills into overflow
        index.insert(9, entry(30, 3)).unwrap();
        assert_eq!(index.overflow_len(), 1);
        let found: Vec<_> = index.lookup(1, 7).map(|e| e.offset).collect();
        assert_eq!(found, vec![10, 20, 30]);
        assert_eq!(index.lookup(1, 8).count(), 0);
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn test_hard_overflow_is_fatal() {
        let mut index = HashIndex::new(ShardId::new(0), 8, &config(), false);
        for i in 0..4 {
            index.insert(0, entry(i, i + 1)).unwrap();
        }
        let err = index.insert(0, entry(9, 9)).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_evicting_shard_drops_oldest() {
        let mut index = HashIndex::new(ShardId::new(0), 8, &config(), true);
        index.insert(0, entry(1, 5)).unwrap();
        index.insert(0, entry(2, 3)).unwrap();
        index.insert(0, entry(3, 8)).unwrap();
        index.insert(0, entry(4, 2)).unwrap();
        index.insert(0, entry(5, 9)).unwrap();
        // seqno 3 was the oldest entry in the bucket itself
        assert_eq!(index.evicted(), &[entry(2, 3)]);
        // A newcomer older than everything is evicted directly
        index.insert(0, entry(6, 1)).unwrap();
        assert_eq!(index.evicted().len(), 2);
        assert_eq!(index.evicted()[1].offset, 6);
        assert_eq!(index.len(), 4);
    }

    #[test]
    fn test_class_clocks_track_minimum() {
        let mut clocks = ClassClocks::new(3);
        clocks.observe(1, 40);
        clocks.observe(1, 12);
        clocks.observe(7, 1);
        assert_eq!(clocks.seed(1), Some(12));
        assert_eq!(clocks.seed(0), None);
        assert_eq!(clocks.len(), 3);
    }
}
