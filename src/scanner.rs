//! Raw device scan.
//!
//! Walk each device in `leafsize`-aligned strides, skip superblock
//! mirrors, reject anything that doesn't belong to this filesystem or
//! fails its checksum, keep only level-0 (leaf) blocks, fence by
//! generation per owning tree, then hand matching items to the Record
//! Store.

use crate::device::Device;
use crate::error::Result;
use crate::node::LeafView;
use crate::record::{
    BlockGroupRecord, ChunkRecord, DeviceExtentRecord, IntervalStore, Stripe,
};
use crate::structures::*;
use log::{debug, warn};

/// the scan-time configuration: filesystem UUID, checksum algorithm, the
/// two generation fences, and the block sizes needed to stride through a
/// device.
#[derive(Clone, Copy)]
pub struct ScanConfig {
    pub fsid: BtrfsFsid,
    pub csum_type: BtrfsCsumType,
    pub sectorsize: u32,
    pub leafsize: u32,
    pub tree_root_generation: u64,
    pub chunk_root_generation: u64,
}

#[derive(Default)]
pub struct RecordStores {
    pub chunks: IntervalStore<ChunkRecord>,
    pub block_groups: IntervalStore<BlockGroupRecord>,
    pub device_extents: IntervalStore<DeviceExtentRecord>,
}

impl Default for IntervalStore<ChunkRecord> {
    fn default() -> Self {
        IntervalStore::new("chunk")
    }
}
impl Default for IntervalStore<BlockGroupRecord> {
    fn default() -> Self {
        IntervalStore::new("block group")
    }
}
impl Default for IntervalStore<DeviceExtentRecord> {
    fn default() -> Self {
        IntervalStore::new("device extent")
    }
}

impl RecordStores {
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty() && self.block_groups.is_empty() && self.device_extents.is_empty()
    }
}

/// scans every device in `devices`, accumulating records in `stores`. An
/// I/O open/short-read is handled per device (advance to the next one),
/// but any item-insertion failure stops the whole scan.
pub fn scan_devices(devices: &mut [Device], cfg: &ScanConfig, stores: &mut RecordStores) -> Result<()> {
    for dev in devices.iter_mut() {
        debug!("scanning {}", dev.path.display());
        scan_one_device(dev, cfg, stores)?;
    }
    Ok(())
}

fn scan_one_device(dev: &mut Device, cfg: &ScanConfig, stores: &mut RecordStores) -> Result<()> {
    let leafsize = cfg.leafsize as u64;
    let mut bytenr: u64 = 0;
    let mut buf = vec![0u8; cfg.leafsize as usize];

    while bytenr < dev.len() {
        if is_super_block_address(bytenr) {
            bytenr += cfg.sectorsize as u64;
            continue;
        }

        if !dev.read_at(bytenr, &mut buf)? {
            break; // short read: end of device, not fatal
        }

        if buf.len() < std::mem::size_of::<BtrfsHeader>() {
            break;
        }

        let header_fsid = unsafe { &*(buf.as_ptr() as *const BtrfsHeader) }.fsid;
        if header_fsid != cfg.fsid {
            bytenr += cfg.sectorsize as u64;
            continue;
        }

        if !verify_leaf_checksum(&buf, cfg.csum_type)? {
            bytenr += cfg.sectorsize as u64;
            continue;
        }

        let level = unsafe { &*(buf.as_ptr() as *const BtrfsHeader) }.level;
        if level != 0 {
            // internal nodes still cost one leaf-sized stride to skip.
            bytenr += leafsize;
            continue;
        }

        let owner = unsafe { &*(buf.as_ptr() as *const BtrfsHeader) }.owner;
        let generation = unsafe { &*(buf.as_ptr() as *const BtrfsHeader) }.generation;

        let accept = match owner {
            BTRFS_EXTENT_TREE_OBJECTID | BTRFS_DEV_TREE_OBJECTID => {
                generation <= cfg.tree_root_generation
            }
            BTRFS_CHUNK_TREE_OBJECTID => generation <= cfg.chunk_root_generation,
            _ => false,
        };

        if accept {
            extract_metadata_record(&buf, generation, stores)?;
        }

        bytenr += leafsize;
    }
    Ok(())
}

fn verify_leaf_checksum(buf: &[u8], csum_type: BtrfsCsumType) -> Result<bool> {
    let header = unsafe { &*(buf.as_ptr() as *const BtrfsHeader) };
    let stored = header.csum;
    let computed = csum_data(&buf[BTRFS_CSUM_SIZE..], csum_type)?;
    Ok(stored == computed)
}

/// dispatches every item in a qualifying leaf by key type. Every record's
/// `generation` is inherited from the leaf's header generation, since
/// none of the three item payloads carry a generation field of their own.
fn extract_metadata_record(buf: &[u8], leaf_generation: u64, stores: &mut RecordStores) -> Result<()> {
    let leaf = LeafView::new(buf);
    for (item, data) in leaf.items() {
        let item_type = item.key.item_type;
        if item_type == BtrfsItemType::BLOCK_GROUP_ITEM as u8 {
            submit_block_group(&item.key, data, leaf_generation, &mut stores.block_groups)?;
        } else if item_type == BtrfsItemType::CHUNK_ITEM as u8 {
            submit_chunk(&item.key, data, leaf_generation, &mut stores.chunks)?;
        } else if item_type == BtrfsItemType::DEV_EXTENT as u8 {
            submit_device_extent(&item.key, data, leaf_generation, &mut stores.device_extents)?;
        }
    }
    Ok(())
}

fn submit_block_group(
    key: &BtrfsDiskKey,
    data: &[u8],
    generation: u64,
    store: &mut IntervalStore<BlockGroupRecord>,
) -> Result<()> {
    if data.len() < std::mem::size_of::<BtrfsBlockGroupItem>() {
        warn!("short block group item at {:?}, skipping", key);
        return Ok(());
    }
    let bg = unsafe { &*(data.as_ptr() as *const BtrfsBlockGroupItem) };
    let rec = BlockGroupRecord {
        objectid: key.objectid,
        length: key.offset,
        flags: bg.flags,
        generation,
    };
    if rec.length == 0 {
        return Ok(());
    }
    store.insert(rec).map(|_| ())
}

fn submit_chunk(
    key: &BtrfsDiskKey,
    data: &[u8],
    generation: u64,
    store: &mut IntervalStore<ChunkRecord>,
) -> Result<()> {
    if data.len() < std::mem::size_of::<BtrfsChunk>() {
        warn!("short chunk item at {:?}, skipping", key);
        return Ok(());
    }
    let chunk = unsafe { &*(data.as_ptr() as *const BtrfsChunk) };
    let num_stripes = chunk.num_stripes as usize;
    let expected_size = std::mem::size_of::<BtrfsChunk>() + num_stripes * std::mem::size_of::<BtrfsStripe>();
    if data.len() < expected_size || num_stripes == 0 {
        warn!("chunk item at {:?} has inconsistent stripe count, skipping", key);
        return Ok(());
    }

    let mut stripes = Vec::with_capacity(num_stripes);
    let stripe_base = std::mem::size_of::<BtrfsChunk>();
    for i in 0..num_stripes {
        let off = stripe_base + i * std::mem::size_of::<BtrfsStripe>();
        let s = unsafe { &*(data.as_ptr().add(off) as *const BtrfsStripe) };
        stripes.push(Stripe {
            devid: s.devid,
            offset: s.offset,
            dev_uuid: s.dev_uuid,
        });
    }

    let rec = ChunkRecord {
        offset: key.offset,
        length: chunk.length,
        owner: chunk.owner,
        type_flags: chunk.r#type,
        stripe_len: chunk.stripe_len,
        io_align: chunk.io_align,
        io_width: chunk.io_width,
        sector_size: chunk.sector_size,
        sub_stripes: chunk.sub_stripes,
        generation,
        stripes,
    };
    store.insert(rec).map(|_| ())
}

fn submit_device_extent(
    key: &BtrfsDiskKey,
    data: &[u8],
    generation: u64,
    store: &mut IntervalStore<DeviceExtentRecord>,
) -> Result<()> {
    if data.len() < std::mem::size_of::<BtrfsDevExtent>() {
        warn!("short device extent item at {:?}, skipping", key);
        return Ok(());
    }
    let de = unsafe { &*(data.as_ptr() as *const BtrfsDevExtent) };
    let rec = DeviceExtentRecord {
        devid: key.objectid,
        physical_offset: key.offset,
        length: de.length,
        chunk_offset: de.chunk_offset,
        generation,
    };
    store.insert(rec).map(|_| ())
}
