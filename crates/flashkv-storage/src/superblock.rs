//! Replicated superblock management
//!
//! Every device of the pool carries an identical copy of the superblock
//! region. Loading reads each region from every device, keeps the copies
//! that validate, and votes: the largest byte-identical group wins and every
//! other copy is rewritten from it.

use crate::layout::{
    BLOB_CAPACITY, DESCRIPTOR_BLOCK, FORMAT_VERSION, FlashDescriptor, GLOBAL_BLOCK, GlobalBlob,
    LABEL_BLOCK, MetadataBlock, PROPERTIES_BLOCK, ShardProperties, VolumeLabel, align_up,
};
use crate::raw_io::{AlignedBuffer, BlockDevice};
use flashkv_common::config::LayoutConfig;
use flashkv_common::{BLOCK_SIZE, Error, Result, ShardId};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Superblock statistics
#[derive(Debug, Default)]
pub struct SuperblockStats {
    /// Copies rewritten by voting
    pub repaired_copies: AtomicU64,
    /// Property and blob writes
    pub writes: AtomicU64,
}

/// Result of voting on one region
struct Vote {
    winner: Vec<u8>,
    /// Devices whose copy must be rewritten
    outvoted: Vec<usize>,
    agreeing: usize,
}

/// Steps of descriptor loading
enum DescriptorLoad {
    Read { upgraded: bool },
    Upgrade(FlashDescriptor),
    Validated(FlashDescriptor),
}

/// Owner of the replicated superblock region
pub struct SuperblockManager {
    devices: Vec<Arc<dyn BlockDevice>>,
    label: VolumeLabel,
    descriptor: RwLock<FlashDescriptor>,
    global: RwLock<GlobalBlob>,
    properties: RwLock<Vec<Option<ShardProperties>>>,
    /// Serializes writes of replicated blocks
    write_lock: Mutex<()>,
    stats: SuperblockStats,
}

impl SuperblockManager {
    /// Write a fresh superblock region to every device
    pub fn format(devices: Vec<Arc<dyn BlockDevice>>, layout: &LayoutConfig) -> Result<Self> {
        if devices.is_empty() {
            return Err(Error::Configuration("a pool needs at least one device".into()));
        }
        let device_blocks = devices
            .iter()
            .map(|d| d.size() / BLOCK_SIZE as u64)
            .min()
            .unwrap_or(0);
        let align = u64::from(layout.align_blocks);
        let properties_end = PROPERTIES_BLOCK + u64::from(layout.max_shards);
        let data_block = align_up(properties_end, align);
        let segment_blocks = u64::from(layout.segment_blocks);
        let per_device = device_blocks.saturating_sub(data_block) / segment_blocks;
        let total_segments = per_device * devices.len() as u64;
        if total_segments < u64::from(layout.max_shards) {
            return Err(Error::Configuration(format!(
                "pool of {} devices x {device_blocks} blocks holds {total_segments} segments, \
                 fewer than {} shard slots",
                devices.len(),
                layout.max_shards
            )));
        }

        let pool_uuid = Uuid::new_v4();
        let label = VolumeLabel {
            pool_uuid,
            device_count: devices.len() as u32,
            created_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };
        let descriptor = FlashDescriptor {
            version: FORMAT_VERSION,
            write_epoch: 1,
            pool_uuid,
            block_size: BLOCK_SIZE as u32,
            segment_blocks: layout.segment_blocks,
            align_blocks: layout.align_blocks,
            max_shards: layout.max_shards,
            device_count: devices.len() as u32,
            device_blocks,
            label_block: LABEL_BLOCK,
            descriptor_block: DESCRIPTOR_BLOCK,
            global_block: GLOBAL_BLOCK,
            properties_block: PROPERTIES_BLOCK,
            data_block,
            total_segments,
        };

        // Label, reserved block, descriptor, global blob, then empty slots
        let mut region = AlignedBuffer::blocks(properties_end as usize);
        region.block_mut(LABEL_BLOCK as usize).copy_from_slice(&label.encode());
        region
            .block_mut(DESCRIPTOR_BLOCK as usize)
            .copy_from_slice(&descriptor.encode());
        region
            .block_mut(GLOBAL_BLOCK as usize)
            .copy_from_slice(&GlobalBlob::default().encode());
        for device in &devices {
            device.write_at(0, region.as_slice())?;
            device.sync()?;
        }

        info!(
            "Formatted flash pool {} on {} devices: {} segments of {} blocks, data at block {}",
            pool_uuid,
            devices.len(),
            total_segments,
            segment_blocks,
            data_block
        );

        Ok(Self {
            devices,
            label,
            descriptor: RwLock::new(descriptor),
            global: RwLock::new(GlobalBlob::default()),
            properties: RwLock::new(vec![None; layout.max_shards as usize]),
            write_lock: Mutex::new(()),
            stats: SuperblockStats::default(),
        })
    }

    /// Load, vote and repair the superblock region of every device
    pub fn load(devices: Vec<Arc<dyn BlockDevice>>) -> Result<Self> {
        if devices.is_empty() {
            return Err(Error::Configuration("a pool needs at least one device".into()));
        }
        let stats = SuperblockStats::default();

        let vote = Self::vote(&devices, &stats, "volume label", LABEL_BLOCK, |block| {
            VolumeLabel::decode(block).ok().map(|_| 0)
        })?;
        let label = VolumeLabel::decode(&vote.winner)?;
        if label.device_count as usize != devices.len() {
            return Err(Error::Configuration(format!(
                "pool {} was formatted with {} devices, {} given",
                label.pool_uuid,
                label.device_count,
                devices.len()
            )));
        }

        let descriptor = Self::load_descriptor(&devices, &stats)?;
        if descriptor.pool_uuid != label.pool_uuid {
            return Err(Error::corruption(format!(
                "flash descriptor belongs to pool {}, label to {}",
                descriptor.pool_uuid, label.pool_uuid
            )));
        }

        let vote = Self::vote(&devices, &stats, "global blob", GLOBAL_BLOCK, |block| {
            GlobalBlob::decode(block).ok().map(|_| 0)
        })?;
        let global = GlobalBlob::decode(&vote.winner)?;

        let mut properties = Vec::with_capacity(descriptor.max_shards as usize);
        for slot in 0..descriptor.max_shards {
            let region = format!("shard properties slot {slot}");
            let vote = Self::vote(
                &devices,
                &stats,
                &region,
                PROPERTIES_BLOCK + u64::from(slot),
                |block| {
                    if block.iter().all(|&b| b == 0) {
                        Some(0)
                    } else {
                        ShardProperties::decode(block).ok().map(|p| p.write_epoch)
                    }
                },
            )?;
            if vote.winner.iter().all(|&b| b == 0) {
                properties.push(None);
                continue;
            }
            let props = ShardProperties::decode(&vote.winner)?;
            if props.shard_id != ShardId::new(slot) {
                return Err(Error::corruption(format!(
                    "{region} holds properties of {}",
                    props.shard_id
                )));
            }
            properties.push(Some(props));
        }

        info!(
            "Loaded flash pool {} (epoch {}), {} of {} shard slots in use, {} copies repaired",
            descriptor.pool_uuid,
            descriptor.write_epoch,
            properties.iter().filter(|p| p.is_some()).count(),
            descriptor.max_shards,
            stats.repaired_copies.load(Ordering::Relaxed)
        );

        Ok(Self {
            devices,
            label,
            descriptor: RwLock::new(descriptor),
            global: RwLock::new(global),
            properties: RwLock::new(properties),
            write_lock: Mutex::new(()),
            stats,
        })
    }

    fn load_descriptor(
        devices: &[Arc<dyn BlockDevice>],
        stats: &SuperblockStats,
    ) -> Result<FlashDescriptor> {
        let mut state = DescriptorLoad::Read { upgraded: false };
        loop {
            state = match state {
                DescriptorLoad::Read { upgraded } => {
                    let vote = Self::vote(devices, stats, "flash descriptor", DESCRIPTOR_BLOCK, |block| {
                        FlashDescriptor::decode(block).ok().map(|d| d.write_epoch)
                    })?;
                    let desc = FlashDescriptor::decode(&vote.winner)?;
                    if desc.version == FORMAT_VERSION {
                        DescriptorLoad::Validated(desc)
                    } else if upgraded {
                        return Err(Error::corruption(format!(
                            "flash descriptor still at version {} after upgrade",
                            desc.version
                        )));
                    } else {
                        DescriptorLoad::Upgrade(desc)
                    }
                }
                DescriptorLoad::Upgrade(mut desc) => {
                    warn!(
                        "Upgrading flash descriptor from version {} to {}",
                        desc.version, FORMAT_VERSION
                    );
                    desc.upgrade();
                    desc.write_epoch += 1;
                    Self::write_all(devices, DESCRIPTOR_BLOCK, &desc.encode())?;
                    DescriptorLoad::Read { upgraded: true }
                }
                DescriptorLoad::Validated(desc) => return Ok(desc),
            };
        }
    }

    /// Read one region from every device and vote
    ///
    /// `validate` returns the write epoch of a valid copy. Ties between equal
    /// sized groups go to the higher epoch, then to the lower device index.
    fn vote(
        devices: &[Arc<dyn BlockDevice>],
        stats: &SuperblockStats,
        region: &str,
        block: u64,
        validate: impl Fn(&[u8]) -> Option<u64>,
    ) -> Result<Vote> {
        // (copy, epoch, member devices)
        let mut groups: Vec<(Vec<u8>, u64, Vec<usize>)> = Vec::new();
        let mut buf = AlignedBuffer::blocks(1);
        for (index, device) in devices.iter().enumerate() {
            if let Err(e) = device.read_at(block * BLOCK_SIZE as u64, buf.as_mut_slice()) {
                warn!("{region}: read from {} failed: {e}", device.name());
                continue;
            }
            let Some(epoch) = validate(buf.as_slice()) else {
                debug!("{region}: copy on {} does not validate", device.name());
                continue;
            };
            match groups.iter_mut().find(|(copy, _, _)| copy == buf.as_slice()) {
                Some((_, _, members)) => members.push(index),
                None => groups.push((buf.as_slice().to_vec(), epoch, vec![index])),
            }
        }

        let best = groups
            .into_iter()
            .reduce(|best, next| {
                let better = next.2.len() > best.2.len()
                    || (next.2.len() == best.2.len() && next.1 > best.1);
                if better { next } else { best }
            })
            .ok_or_else(|| {
                error!("{region}: no valid copy on any of {} devices", devices.len());
                Error::NoQuorum {
                    region: region.to_string(),
                }
            })?;

        let (winner, _, members) = best;
        let outvoted: Vec<usize> = (0..devices.len()).filter(|i| !members.contains(i)).collect();
        let vote = Vote {
            winner,
            outvoted,
            agreeing: members.len(),
        };

        if !vote.outvoted.is_empty() {
            let total = devices.len();
            if vote.agreeing * 2 <= total {
                error!(
                    "{region}: only {} of {total} copies agree, repairing {} from the survivor",
                    vote.agreeing,
                    vote.outvoted.len()
                );
            } else if vote.outvoted.len() == 1 {
                info!("{region}: repairing one bad copy of {total}");
            } else {
                warn!(
                    "{region}: repairing {} bad copies of {total}",
                    vote.outvoted.len()
                );
            }
            let mut repair = AlignedBuffer::blocks(1);
            repair.copy_from(&vote.winner);
            for &index in &vote.outvoted {
                let device = &devices[index];
                device.write_at(block * BLOCK_SIZE as u64, repair.as_slice())?;
                device.sync()?;
                stats.repaired_copies.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(vote)
    }

    /// Write one block to every device and sync them
    fn write_all(devices: &[Arc<dyn BlockDevice>], block: u64, data: &[u8]) -> Result<()> {
        let mut buf = AlignedBuffer::blocks(1);
        buf.copy_from(data);
        for device in devices {
            device.write_at(block * BLOCK_SIZE as u64, buf.as_slice())?;
        }
        for device in devices {
            device.sync()?;
        }
        Ok(())
    }

    fn check_slot(&self, slot: ShardId) -> Result<()> {
        if slot.get() >= self.descriptor.read().max_shards {
            return Err(Error::ShardNotFound(slot.get()));
        }
        Ok(())
    }

    /// Persist the properties of a slot on every device
    ///
    /// The slot's write epoch is advanced before the copies are written.
    pub fn write_property(&self, slot: ShardId, props: &ShardProperties) -> Result<ShardProperties> {
        self.check_slot(slot)?;
        if props.shard_id != slot {
            return Err(Error::invalid_argument(format!(
                "properties of {} written to slot {slot}",
                props.shard_id
            )));
        }
        let _guard = self.write_lock.lock();
        let mut props = props.clone();
        let previous = self.properties.read()[slot.index()]
            .as_ref()
            .map_or(0, |p| p.write_epoch);
        props.write_epoch = previous + 1;
        Self::write_all(&self.devices, PROPERTIES_BLOCK + u64::from(slot.get()), &props.encode())?;
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        debug!("Wrote properties of {slot} at epoch {}", props.write_epoch);
        self.properties.write()[slot.index()] = Some(props.clone());
        Ok(props)
    }

    /// Zero a property slot, freeing it
    pub fn clear_property(&self, slot: ShardId) -> Result<()> {
        self.check_slot(slot)?;
        let _guard = self.write_lock.lock();
        Self::write_all(
            &self.devices,
            PROPERTIES_BLOCK + u64::from(slot.get()),
            &[0u8; BLOCK_SIZE],
        )?;
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        self.properties.write()[slot.index()] = None;
        Ok(())
    }

    /// Cached properties of a slot
    pub fn read_property(&self, slot: ShardId) -> Result<Option<ShardProperties>> {
        self.check_slot(slot)?;
        Ok(self.properties.read()[slot.index()].clone())
    }

    /// Lowest unused property slot
    pub fn free_slot(&self) -> Option<ShardId> {
        self.properties
            .read()
            .iter()
            .position(Option::is_none)
            .map(|i| ShardId::new(i as u32))
    }

    /// Slots currently in use
    pub fn used_slots(&self) -> Vec<ShardProperties> {
        self.properties.read().iter().flatten().cloned().collect()
    }

    /// Write `data` at `offset` of the global blob
    ///
    /// The blob ends after the written bytes; bytes before `offset` are kept.
    pub fn write_global(&self, data: &[u8], offset: usize) -> Result<()> {
        let end = offset + data.len();
        if end > BLOB_CAPACITY {
            return Err(Error::invalid_argument(format!(
                "global blob write of {} bytes at {offset} exceeds {BLOB_CAPACITY}",
                data.len()
            )));
        }
        let _guard = self.write_lock.lock();
        let mut blob = self.global.read().clone();
        blob.data.resize(end, 0);
        blob.data[offset..end].copy_from_slice(data);
        Self::write_all(&self.devices, GLOBAL_BLOCK, &blob.encode())?;
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        *self.global.write() = blob;
        Ok(())
    }

    /// Current global blob
    pub fn read_global(&self) -> Vec<u8> {
        self.global.read().data.clone()
    }

    /// Current flash descriptor
    pub fn descriptor(&self) -> FlashDescriptor {
        self.descriptor.read().clone()
    }

    pub fn label(&self) -> &VolumeLabel {
        &self.label
    }

    pub fn devices(&self) -> &[Arc<dyn BlockDevice>] {
        &self.devices
    }

    pub fn stats(&self) -> &SuperblockStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw_io::MemDevice;
    use flashkv_common::ShardFlags;

    const DEVICE_SIZE: u64 = 4 << 20;

    fn layout() -> LayoutConfig {
        LayoutConfig {
            segment_blocks: 256,
            align_blocks: 16,
            max_shards: 8,
            log_size_shift: 3,
        }
    }

    fn mem_devices(n: usize) -> (Vec<Arc<MemDevice>>, Vec<Arc<dyn BlockDevice>>) {
        let mems: Vec<Arc<MemDevice>> = (0..n)
            .map(|i| Arc::new(MemDevice::new(format!("mem{i}"), DEVICE_SIZE)))
            .collect();
        let devs = mems
            .iter()
            .map(|m| Arc::clone(m) as Arc<dyn BlockDevice>)
            .collect();
        (mems, devs)
    }

    fn block_offset(block: u64) -> u64 {
        block * BLOCK_SIZE as u64
    }

    #[test]
    fn test_format_then_load() {
        let (_mems, devs) = mem_devices(3);
        let sb = SuperblockManager::format(devs.clone(), &layout()).unwrap();
        let desc = sb.descriptor();
        assert_eq!(desc.data_block, 16);
        assert_eq!(desc.total_segments, 3 * ((8192 - 16) / 256));
        drop(sb);

        let sb = SuperblockManager::load(devs).unwrap();
        assert_eq!(sb.descriptor(), desc);
        assert_eq!(sb.stats().repaired_copies.load(Ordering::Relaxed), 0);
        assert_eq!(sb.free_slot(), Some(ShardId::new(0)));
    }

    #[test]
    fn test_format_rejects_tiny_pool() {
        let devs: Vec<Arc<dyn BlockDevice>> = vec![Arc::new(MemDevice::new("tiny", 64 * 1024))];
        assert!(matches!(
            SuperblockManager::format(devs, &layout()),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_property_write_and_reload() {
        let (_mems, devs) = mem_devices(2);
        let sb = SuperblockManager::format(devs.clone(), &layout()).unwrap();
        let slot = ShardId::new(2);
        let props = ShardProperties::new(slot, ShardFlags::PERSISTENT, 1 << 20, 100);
        assert_eq!(sb.write_property(slot, &props).unwrap().write_epoch, 1);
        assert_eq!(sb.write_property(slot, &props).unwrap().write_epoch, 2);
        sb.write_global(b"hello", 0).unwrap();
        sb.write_global(b"world", 5).unwrap();
        drop(sb);

        let sb = SuperblockManager::load(devs).unwrap();
        let loaded = sb.read_property(slot).unwrap().unwrap();
        assert_eq!(loaded.write_epoch, 2);
        assert_eq!(sb.read_global(), b"helloworld");
        assert_eq!(sb.used_slots().len(), 1);

        sb.clear_property(slot).unwrap();
        assert_eq!(sb.read_property(slot).unwrap(), None);
        assert!(sb.read_property(ShardId::new(99)).is_err());
    }

    #[test]
    fn test_vote_repairs_corrupted_copies() {
        let (mems, devs) = mem_devices(3);
        SuperblockManager::format(devs.clone(), &layout()).unwrap();
        // Corrupt the descriptor on one device and the label on another
        mems[1].poke(block_offset(DESCRIPTOR_BLOCK) + 40, &[0xff, 0xee]);
        mems[2].poke(block_offset(LABEL_BLOCK) + 20, &[0x01]);

        let sb = SuperblockManager::load(devs.clone()).unwrap();
        assert_eq!(sb.stats().repaired_copies.load(Ordering::Relaxed), 2);
        assert_eq!(
            mems[1].peek(block_offset(DESCRIPTOR_BLOCK), BLOCK_SIZE),
            mems[0].peek(block_offset(DESCRIPTOR_BLOCK), BLOCK_SIZE)
        );

        let sb = SuperblockManager::load(devs).unwrap();
        assert_eq!(sb.stats().repaired_copies.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_vote_survives_single_good_copy() {
        let (mems, devs) = mem_devices(3);
        SuperblockManager::format(devs.clone(), &layout()).unwrap();
        mems[0].poke(block_offset(DESCRIPTOR_BLOCK) + 30, &[0x55]);
        mems[1].poke(block_offset(DESCRIPTOR_BLOCK) + 31, &[0x66]);
        let sb = SuperblockManager::load(devs).unwrap();
        assert_eq!(sb.stats().repaired_copies.load(Ordering::Relaxed), 2);
        assert!(
            FlashDescriptor::decode(&mems[0].peek(block_offset(DESCRIPTOR_BLOCK), BLOCK_SIZE))
                .is_ok()
        );
    }

    #[test]
    fn test_no_quorum_when_every_copy_bad() {
        let (mems, devs) = mem_devices(2);
        SuperblockManager::format(devs.clone(), &layout()).unwrap();
        for mem in &mems {
            mem.poke(block_offset(DESCRIPTOR_BLOCK) + 30, &[0x55]);
        }
        let err = SuperblockManager::load(devs).err().unwrap();
        assert!(matches!(err, Error::NoQuorum { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_tie_prefers_newer_epoch() {
        let (mems, devs) = mem_devices(2);
        let sb = SuperblockManager::format(devs.clone(), &layout()).unwrap();
        let slot = ShardId::new(1);
        let props = ShardProperties::new(slot, ShardFlags::PERSISTENT, 1 << 20, 100);
        sb.write_property(slot, &props).unwrap();
        let old = mems[0].peek(block_offset(PROPERTIES_BLOCK + 1), BLOCK_SIZE);
        let mut newer = props.clone();
        newer.max_objects = 500;
        sb.write_property(slot, &newer).unwrap();
        drop(sb);
        // Device 0 missed the second write
        mems[0].poke(block_offset(PROPERTIES_BLOCK + 1), &old);

        let sb = SuperblockManager::load(devs).unwrap();
        assert_eq!(sb.read_property(slot).unwrap().unwrap().max_objects, 500);
        assert_eq!(sb.stats().repaired_copies.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_v1_descriptor_upgraded_once() {
        let (mems, devs) = mem_devices(2);
        let sb = SuperblockManager::format(devs.clone(), &layout()).unwrap();
        let mut v1 = sb.descriptor();
        drop(sb);
        v1.version = 1;
        for mem in &mems {
            mem.poke(block_offset(DESCRIPTOR_BLOCK), &v1.encode());
        }

        let sb = SuperblockManager::load(devs.clone()).unwrap();
        let desc = sb.descriptor();
        assert_eq!(desc.version, FORMAT_VERSION);
        assert_eq!(desc.segment_blocks, crate::layout::LEGACY_SEGMENT_BLOCKS);
        assert_eq!(desc.write_epoch, v1.write_epoch + 1);
        drop(sb);

        let on_disk =
            FlashDescriptor::decode(&mems[1].peek(block_offset(DESCRIPTOR_BLOCK), BLOCK_SIZE))
                .unwrap();
        assert_eq!(on_disk, desc);
    }
}
