//! Rebuilder.
//!
//! Purge system-chunk residue with exact `bytes_used` accounting, build
//! one fresh chunk-tree leaf (device items followed by chunk items),
//! populate the superblock's system-chunk array, and stage every write in
//! a `Transaction` that only touches devices on `commit()` — nothing is
//! destructive until the operator's confirmation has already been
//! honored and every write has been staged successfully.
//!
//! There is no space allocator here: the fresh chunk-tree leaf reuses the
//! existing chunk-root address recorded in the superblock. Real space
//! allocation is out of scope for an offline recovery tool whose only job
//! is to reconstruct *metadata describing already allocated stripes*,
//! never to allocate new ones.

use crate::checker::DerivedChunk;
use crate::error::{RecoverError, Result};
use crate::fsview::BrokenChunkFs;
use crate::node::LeafView;
use crate::record::ChunkRecord;
use crate::structures::*;
use log::{debug, info};
use std::mem::size_of;

/// accumulates a sorted set of `(key, item bytes)` pairs and packs them into
/// one `nodesize`-long leaf buffer, items laid out ascending from just past
/// the header and data packed backward from the end of the block — the
/// same tail-of-sorted-items shape `node.rs::LeafView` reads.
pub struct LeafBuilder {
    items: Vec<(BtrfsDiskKey, Vec<u8>)>,
}

impl LeafBuilder {
    pub fn new() -> LeafBuilder {
        LeafBuilder { items: Vec::new() }
    }

    pub fn from_items(items: Vec<(BtrfsDiskKey, Vec<u8>)>) -> LeafBuilder {
        LeafBuilder { items }
    }

    pub fn push(&mut self, key: BtrfsDiskKey, data: Vec<u8>) {
        self.items.push((key, data));
    }

    pub fn build(&self, node_size: usize, mut header: BtrfsHeader, csum_type: BtrfsCsumType) -> Result<Vec<u8>> {
        let mut sorted = self.items.clone();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));

        let header_size = size_of::<BtrfsHeader>();
        let item_size = size_of::<BtrfsItem>();
        let mut buf = vec![0u8; node_size];
        let mut data_cursor = node_size;

        for (i, (key, data)) in sorted.iter().enumerate() {
            data_cursor -= data.len();
            let item = BtrfsItem {
                key: *key,
                offset: (data_cursor - header_size) as u32,
                size: data.len() as u32,
            };
            let item_off = header_size + i * item_size;
            unsafe {
                *(buf.as_mut_ptr().add(item_off) as *mut BtrfsItem) = item;
            }
            buf[data_cursor..data_cursor + data.len()].copy_from_slice(data);
        }

        header.nritems = sorted.len() as u32;
        header.level = 0;
        unsafe {
            *(buf.as_mut_ptr() as *mut BtrfsHeader) = header;
        }

        let csum = csum_data(&buf[BTRFS_CSUM_SIZE..], csum_type)?;
        buf[..BTRFS_CSUM_SIZE].copy_from_slice(&csum);
        Ok(buf)
    }
}

fn struct_bytes<T: Copy>(value: &T) -> Vec<u8> {
    unsafe { std::slice::from_raw_parts(value as *const T as *const u8, size_of::<T>()).to_vec() }
}

fn device_item_bytes(orig: &BtrfsDevItem) -> Vec<u8> {
    let mut item = *orig;
    item.generation = 0;
    struct_bytes(&item)
}

fn chunk_item_bytes(chunk: &ChunkRecord) -> Vec<u8> {
    let fixed = BtrfsChunk {
        length: chunk.length,
        owner: chunk.owner,
        stripe_len: chunk.stripe_len,
        r#type: chunk.type_flags,
        io_align: chunk.io_align,
        io_width: chunk.io_width,
        sector_size: chunk.sector_size,
        num_stripes: chunk.stripes.len() as u16,
        sub_stripes: chunk.sub_stripes,
    };
    let mut buf = struct_bytes(&fixed);
    for s in &chunk.stripes {
        let stripe = BtrfsStripe {
            devid: s.devid,
            offset: s.offset,
            dev_uuid: s.dev_uuid,
        };
        buf.extend_from_slice(&struct_bytes(&stripe));
    }
    buf
}

/// a write staged by `rebuild()`, not applied to any device until
/// `Transaction::commit`.
enum PendingWrite {
    VirtBlock { virt_offset: u64, data: Vec<u8> },
}

pub struct Transaction {
    writes: Vec<PendingWrite>,
    new_superblock: BtrfsSuperBlock,
}

impl Transaction {
    /// flushes every staged write to its device, then the updated
    /// superblock to every member device, and syncs. Nothing upstream of
    /// this call has touched a device.
    pub fn commit(self, fs: &mut BrokenChunkFs) -> Result<()> {
        for write in &self.writes {
            match write {
                PendingWrite::VirtBlock { virt_offset, data } => {
                    fs.write_virt_block(*virt_offset, data)?;
                }
            }
        }

        let sb_bytes = struct_bytes(&self.new_superblock);
        for (devid, dev) in fs.devices_mut() {
            dev.write_at(BTRFS_SUPER_INFO_OFFSET, &sb_bytes)?;
            dev.flush()?;
            debug!("committed superblock to device {devid}");
        }

        fs.superblock = self.new_superblock;
        info!("rebuild committed");
        Ok(())
    }
}

/// walk the extent tree for every leaf with an item inside a system
/// chunk's logical range, drop extent/metadata items found there and
/// zero the `used` counter of the block group item, tallying exactly how
/// many bytes were reclaimed. Returns the reclaimed leaf rewrites as
/// pending writes rather than applying them.
fn purge_system_chunks(
    fs: &mut BrokenChunkFs,
    good_chunks: &[DerivedChunk],
    node_size: u64,
    csum_type: BtrfsCsumType,
) -> Result<(u64, Vec<PendingWrite>)> {
    let sys_ranges: Vec<(u64, u64)> = good_chunks
        .iter()
        .filter(|d| d.chunk.type_flags & BTRFS_BLOCK_GROUP_SYSTEM != 0)
        .map(|d| (d.chunk.offset, d.chunk.length))
        .collect();
    if sys_ranges.is_empty() {
        return Ok((0, Vec::new()));
    }

    let mut bytes_reclaimed = 0u64;
    let mut rewrites = Vec::new();
    let extent_root = fs.extent_root();

    fs.walk_leaves(extent_root, &mut |bytenr, block| {
        let leaf = LeafView::new(block);
        let mut kept = Vec::new();
        let mut changed = false;

        for (item, data) in leaf.items() {
            let key = item.key;
            let in_range = sys_ranges
                .iter()
                .any(|(start, length)| key.objectid >= *start && key.objectid < start + length);

            if in_range && key.item_type == BtrfsItemType::EXTENT_ITEM as u8 {
                bytes_reclaimed += key.offset;
                changed = true;
                continue;
            }
            if in_range && key.item_type == BtrfsItemType::METADATA_ITEM as u8 {
                bytes_reclaimed += node_size;
                changed = true;
                continue;
            }
            if in_range
                && key.item_type == BtrfsItemType::BLOCK_GROUP_ITEM as u8
                && data.len() >= size_of::<BtrfsBlockGroupItem>()
            {
                let mut owned = data.to_vec();
                let bg = unsafe { &mut *(owned.as_mut_ptr() as *mut BtrfsBlockGroupItem) };
                bg.used = 0;
                changed = true;
                kept.push((key, owned));
                continue;
            }

            kept.push((key, data.to_vec()));
        }

        if changed {
            let header = *leaf.header();
            let new_leaf = LeafBuilder::from_items(kept).build(node_size as usize, header, csum_type)?;
            rewrites.push(PendingWrite::VirtBlock {
                virt_offset: bytenr,
                data: new_leaf,
            });
        }
        Ok(())
    })?;

    Ok((bytes_reclaimed, rewrites))
}

/// purges system-chunk residue and builds a fresh chunk-tree leaf end to
/// end, returning a `Transaction` ready to `commit()`. Only invoked after
/// the Cross-Check succeeds and the operator confirms.
pub fn rebuild(fs: &mut BrokenChunkFs, good_chunks: &[DerivedChunk]) -> Result<Transaction> {
    let node_size = fs.node_size();
    let csum_type = fs.superblock.csum_type;
    let txid = fs.superblock.generation + 1;

    let (bytes_reclaimed, mut writes) = purge_system_chunks(fs, good_chunks, node_size, csum_type)?;
    info!("purged {bytes_reclaimed} bytes of system chunk residue");

    if fs.dev_items().is_empty() {
        return Err(RecoverError::InsufficientEvidence {
            detail: "no devices to rebuild chunk tree from".into(),
        });
    }
    // a first disk-key synthesized from the smallest device id present
    // falls out for free: all device items share objectid
    // `DEV_ITEMS_OBJECTID` and are keyed by devid, and `LeafBuilder::build`
    // sorts ascending, so the smallest-devid device item is already the
    // first key once every item is in the leaf.

    let old_chunk_root_block = fs.load_virt_block(fs.superblock.chunk_root)?;
    let chunk_tree_uuid = unsafe { (*(old_chunk_root_block.as_ptr() as *const BtrfsHeader)).chunk_tree_uuid };

    let mut builder = LeafBuilder::new();
    for (devid, dev_item) in fs.dev_items() {
        let key = BtrfsDiskKey::new(BTRFS_DEV_ITEMS_OBJECTID, BtrfsItemType::DEV_ITEM, *devid);
        builder.push(key, device_item_bytes(dev_item));
    }
    for derived in good_chunks {
        let key = BtrfsDiskKey::new(
            BTRFS_FIRST_CHUNK_TREE_OBJECTID,
            BtrfsItemType::CHUNK_ITEM,
            derived.chunk.offset,
        );
        builder.push(key, chunk_item_bytes(&derived.chunk));
    }

    let header = BtrfsHeader {
        csum: [0; BTRFS_CSUM_SIZE],
        fsid: fs.superblock.fsid,
        bytenr: fs.superblock.chunk_root,
        flags: 0,
        chunk_tree_uuid,
        generation: txid,
        owner: BTRFS_CHUNK_TREE_OBJECTID,
        nritems: 0,
        level: 0,
    };
    let new_leaf = builder.build(node_size as usize, header, csum_type)?;
    writes.push(PendingWrite::VirtBlock {
        virt_offset: fs.superblock.chunk_root,
        data: new_leaf,
    });

    let mut new_superblock = fs.superblock;
    new_superblock.generation = txid;
    new_superblock.chunk_root_generation = txid;
    new_superblock.sys_chunk_array = [0u8; BTRFS_SYSTEM_CHUNK_ARRAY_SIZE];
    let mut cursor = 0usize;
    for derived in good_chunks
        .iter()
        .filter(|d| d.chunk.type_flags & BTRFS_BLOCK_GROUP_SYSTEM != 0)
    {
        let key = BtrfsDiskKey::new(
            BTRFS_FIRST_CHUNK_TREE_OBJECTID,
            BtrfsItemType::CHUNK_ITEM,
            derived.chunk.offset,
        );
        let key_bytes = struct_bytes(&key);
        let chunk_bytes = chunk_item_bytes(&derived.chunk);
        let total = key_bytes.len() + chunk_bytes.len();
        if cursor + total > BTRFS_SYSTEM_CHUNK_ARRAY_SIZE {
            return Err(RecoverError::InsufficientEvidence {
                detail: "rebuilt system chunk set does not fit the superblock's system chunk array".into(),
            });
        }
        new_superblock.sys_chunk_array[cursor..cursor + key_bytes.len()].copy_from_slice(&key_bytes);
        cursor += key_bytes.len();
        new_superblock.sys_chunk_array[cursor..cursor + chunk_bytes.len()].copy_from_slice(&chunk_bytes);
        cursor += chunk_bytes.len();
    }
    new_superblock.sys_chunk_array_size = cursor as u32;
    let csum = csum_data(&struct_bytes(&new_superblock)[BTRFS_CSUM_SIZE..], csum_type)?;
    new_superblock.csum = csum;

    Ok(Transaction {
        writes,
        new_superblock,
    })
}
