//! Scan -> record store -> consistency checker pipeline, driven against a
//! real file through `Device` rather than hand-built record fixtures.
//! Covers only the Scanner and Checker; see `tests/full_recovery.rs` for
//! the complete pipeline through Cross-Check, Rebuild and commit.

use chunk_recover_core::device::Device;
use chunk_recover_core::rebuild::LeafBuilder;
use chunk_recover_core::scanner::{scan_devices, RecordStores, ScanConfig};
use chunk_recover_core::structures::*;
use std::io::Write;

const NODE_SIZE: usize = 4096;
const FSID: BtrfsFsid = [0x42; BTRFS_FSID_SIZE];

fn struct_bytes<T: Copy>(value: &T) -> Vec<u8> {
    unsafe {
        std::slice::from_raw_parts(value as *const T as *const u8, std::mem::size_of::<T>()).to_vec()
    }
}

fn leaf_header(owner: u64, generation: u64, bytenr: u64) -> BtrfsHeader {
    BtrfsHeader {
        csum: [0; BTRFS_CSUM_SIZE],
        fsid: FSID,
        bytenr,
        flags: 0,
        chunk_tree_uuid: [0x11; BTRFS_UUID_SIZE],
        generation,
        owner,
        nritems: 0,
        level: 0,
    }
}

/// builds a tiny single-device image with exactly one chunk, block group
/// and device extent, all mutually consistent, at fixed leaf-aligned
/// offsets. Returns the path plus the scan configuration that matches it.
fn build_image() -> (tempfile::NamedTempFile, ScanConfig) {
    let chunk_offset: u64 = 0x100_0000;
    let chunk_length: u64 = 0x10_0000;
    let stripe_physical_offset: u64 = 0x20_0000;
    let devid: u64 = 1;
    let generation: u64 = 10;

    // CHUNK_ITEM leaf at physical offset 4096.
    let chunk_struct = BtrfsChunk {
        length: chunk_length,
        owner: BTRFS_EXTENT_TREE_OBJECTID,
        stripe_len: 0x10000,
        r#type: BTRFS_BLOCK_GROUP_DATA,
        io_align: 4096,
        io_width: 4096,
        sector_size: 4096,
        num_stripes: 1,
        sub_stripes: 1,
    };
    let stripe = BtrfsStripe {
        devid,
        offset: stripe_physical_offset,
        dev_uuid: [0x22; BTRFS_UUID_SIZE],
    };
    let mut chunk_data = struct_bytes(&chunk_struct);
    chunk_data.extend_from_slice(&struct_bytes(&stripe));
    let chunk_key = BtrfsDiskKey::new(
        BTRFS_FIRST_CHUNK_TREE_OBJECTID,
        BtrfsItemType::CHUNK_ITEM,
        chunk_offset,
    );
    let mut chunk_leaf_builder = LeafBuilder::new();
    chunk_leaf_builder.push(chunk_key, chunk_data);
    let chunk_leaf = chunk_leaf_builder
        .build(
            NODE_SIZE,
            leaf_header(BTRFS_CHUNK_TREE_OBJECTID, generation, 4096),
            BtrfsCsumType::CRC32,
        )
        .unwrap();

    // BLOCK_GROUP_ITEM leaf at physical offset 8192.
    let bg_struct = BtrfsBlockGroupItem {
        used: chunk_length,
        chunk_objectid: BTRFS_FIRST_CHUNK_TREE_OBJECTID,
        flags: BTRFS_BLOCK_GROUP_DATA,
    };
    let bg_key = BtrfsDiskKey::new(
        chunk_offset,
        BtrfsItemType::BLOCK_GROUP_ITEM,
        chunk_length,
    );
    let mut bg_leaf_builder = LeafBuilder::new();
    bg_leaf_builder.push(bg_key, struct_bytes(&bg_struct));
    let bg_leaf = bg_leaf_builder
        .build(
            NODE_SIZE,
            leaf_header(BTRFS_EXTENT_TREE_OBJECTID, generation, 8192),
            BtrfsCsumType::CRC32,
        )
        .unwrap();

    // DEV_EXTENT leaf at physical offset 12288.
    let de_struct = BtrfsDevExtent {
        chunk_tree: BTRFS_CHUNK_TREE_OBJECTID,
        chunk_objectid: BTRFS_FIRST_CHUNK_TREE_OBJECTID,
        chunk_offset,
        length: chunk_length,
        chunk_tree_uuid: [0x11; BTRFS_UUID_SIZE],
    };
    let de_key = BtrfsDiskKey::new(devid, BtrfsItemType::DEV_EXTENT, stripe_physical_offset);
    let mut de_leaf_builder = LeafBuilder::new();
    de_leaf_builder.push(de_key, struct_bytes(&de_struct));
    let de_leaf = de_leaf_builder
        .build(
            NODE_SIZE,
            leaf_header(BTRFS_DEV_TREE_OBJECTID, generation, 12288),
            BtrfsCsumType::CRC32,
        )
        .unwrap();

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&[0u8; NODE_SIZE]).unwrap(); // bytenr 0: zero block, wrong fsid, skipped
    file.write_all(&chunk_leaf).unwrap();
    file.write_all(&bg_leaf).unwrap();
    file.write_all(&de_leaf).unwrap();
    file.flush().unwrap();

    let cfg = ScanConfig {
        fsid: FSID,
        csum_type: BtrfsCsumType::CRC32,
        sectorsize: 4096,
        leafsize: NODE_SIZE as u32,
        tree_root_generation: generation,
        chunk_root_generation: generation,
    };
    (file, cfg)
}

#[test]
fn scan_then_check_yields_one_good_chunk() {
    let (file, cfg) = build_image();
    let mut devices = vec![Device::open_read_write(file.path()).unwrap()];

    let mut stores = RecordStores::default();
    scan_devices(&mut devices, &cfg, &mut stores).unwrap();
    assert_eq!(stores.chunks.len(), 1);
    assert_eq!(stores.block_groups.len(), 1);
    assert_eq!(stores.device_extents.len(), 1);

    let result = chunk_recover_core::checker::check_chunks(stores, true);
    assert!(result.is_clean());
    assert_eq!(result.good_chunks.len(), 1);
    let derived = &result.good_chunks[0];
    assert_eq!(derived.chunk.offset, 0x100_0000);
    assert_eq!(derived.chunk.length, 0x10_0000);
    assert!(derived.bg_rec.is_some());
    assert_eq!(derived.dextents.len(), 1);
}

#[test]
fn scan_then_check_flags_bad_chunk_when_device_extent_missing() {
    let (file, mut cfg) = build_image();
    // truncate the image just before the device-extent leaf so it never
    // gets scanned, leaving the chunk's stripe uncorroborated.
    {
        let f = std::fs::OpenOptions::new().write(true).open(file.path()).unwrap();
        f.set_len(3 * NODE_SIZE as u64).unwrap();
    }
    cfg.chunk_root_generation = 10;

    let mut devices = vec![Device::open_read_write(file.path()).unwrap()];
    let mut stores = RecordStores::default();
    scan_devices(&mut devices, &cfg, &mut stores).unwrap();
    assert_eq!(stores.device_extents.len(), 0);

    let result = chunk_recover_core::checker::check_chunks(stores, true);
    assert_eq!(result.bad_chunks.len(), 1);
    assert!(result.bad_chunks[0].dextents.is_empty());
}
