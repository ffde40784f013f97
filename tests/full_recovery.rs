//! Full recovery pipeline, end to end: scan -> check -> open the
//! surrounding trees -> cross-check -> rebuild -> commit, against a real
//! on-disk image built with the library's own `LeafBuilder` and checksum
//! code. Exercises all three chunk-group types (data, metadata, system)
//! so the rebuilt system-chunk array and the system-chunk purge step both
//! get real input, not just the scan/check half covered by
//! `tests/scan_and_check.rs`.

use chunk_recover_core::checker::check_chunks;
use chunk_recover_core::crosscheck::cross_check;
use chunk_recover_core::device::Device;
use chunk_recover_core::fsview::BrokenChunkFs;
use chunk_recover_core::rebuild::{rebuild, LeafBuilder};
use chunk_recover_core::scanner::{scan_devices, RecordStores, ScanConfig};
use chunk_recover_core::structures::*;
use std::io::Write;

const NODE_SIZE: u64 = 4096;
const FSID: BtrfsFsid = [0x42; BTRFS_FSID_SIZE];
const CHUNK_TREE_UUID: BtrfsUuid = [0x11; BTRFS_UUID_SIZE];
const DEV_UUID: BtrfsUuid = [0x22; BTRFS_UUID_SIZE];
const GEN: u64 = 10;

const L_DATA: u64 = 0x0200_0000;
const L_META: u64 = 0x0100_0000;
const L_SYS: u64 = 0x0300_0000;
const LEN_DATA: u64 = 0x0010_0000;
const LEN_META: u64 = 0x0001_0000;
const LEN_SYS: u64 = 0x0001_0000;

const P_DATA: u64 = 0x0002_0000;
const P_META: u64 = 0x0001_2000;
const P_SYS: u64 = 0x0003_0000;

const P_CHUNK_SCAN_LEAF: u64 = 0x0001_1000;

fn struct_bytes<T: Copy>(value: &T) -> Vec<u8> {
    unsafe { std::slice::from_raw_parts(value as *const T as *const u8, std::mem::size_of::<T>()).to_vec() }
}

fn leaf_header(owner: u64, generation: u64, bytenr: u64) -> BtrfsHeader {
    BtrfsHeader {
        csum: [0; BTRFS_CSUM_SIZE],
        fsid: FSID,
        bytenr,
        flags: 0,
        chunk_tree_uuid: CHUNK_TREE_UUID,
        generation,
        owner,
        nritems: 0,
        level: 0,
    }
}

struct ChunkSpec {
    offset: u64,
    length: u64,
    flags: u64,
    physical: u64,
}

fn chunk_item_and_stripe(spec: &ChunkSpec) -> Vec<u8> {
    let chunk = BtrfsChunk {
        length: spec.length,
        owner: BTRFS_CHUNK_TREE_OBJECTID,
        stripe_len: 0x10000,
        r#type: spec.flags,
        io_align: 4096,
        io_width: 4096,
        sector_size: 4096,
        num_stripes: 1,
        sub_stripes: 1,
    };
    let stripe = BtrfsStripe {
        devid: 1,
        offset: spec.physical,
        dev_uuid: DEV_UUID,
    };
    let mut data = struct_bytes(&chunk);
    data.extend_from_slice(&struct_bytes(&stripe));
    data
}

/// builds the synthetic device image and returns its path plus the
/// `ScanConfig` that matches the superblock written into it.
fn build_image() -> (tempfile::NamedTempFile, ScanConfig) {
    let specs = [
        ChunkSpec { offset: L_DATA, length: LEN_DATA, flags: BTRFS_BLOCK_GROUP_DATA, physical: P_DATA },
        ChunkSpec { offset: L_META, length: LEN_META, flags: BTRFS_BLOCK_GROUP_METADATA, physical: P_META },
        ChunkSpec { offset: L_SYS, length: LEN_SYS, flags: BTRFS_BLOCK_GROUP_SYSTEM, physical: P_SYS },
    ];

    // chunk-tree leaf reachable only by the raw linear scan (the rebuilt
    // chunk tree is what we're recovering, so nothing walks this one by
    // logical address).
    let mut chunk_scan_builder = LeafBuilder::new();
    for spec in &specs {
        let key = BtrfsDiskKey::new(BTRFS_FIRST_CHUNK_TREE_OBJECTID, BtrfsItemType::CHUNK_ITEM, spec.offset);
        chunk_scan_builder.push(key, chunk_item_and_stripe(spec));
    }
    let chunk_scan_leaf = chunk_scan_builder
        .build(NODE_SIZE as usize, leaf_header(BTRFS_CHUNK_TREE_OBJECTID, GEN, P_CHUNK_SCAN_LEAF), BtrfsCsumType::CRC32)
        .unwrap();

    // root tree leaf: lives at the metadata chunk's first slot, so it is
    // reachable both as `superblock.root` (logical L_META) and, once
    // resolved through the chunk map, at physical P_META.
    let mut root_builder = LeafBuilder::new();
    root_builder.push(
        BtrfsDiskKey::new(BTRFS_EXTENT_TREE_OBJECTID, BtrfsItemType::ROOT_ITEM, 0),
        struct_bytes(&BtrfsRootItem { bytenr: L_META + NODE_SIZE, generation: GEN, objectid: BTRFS_EXTENT_TREE_OBJECTID, level: 0 }),
    );
    root_builder.push(
        BtrfsDiskKey::new(BTRFS_DEV_TREE_OBJECTID, BtrfsItemType::ROOT_ITEM, 0),
        struct_bytes(&BtrfsRootItem { bytenr: L_META + 2 * NODE_SIZE, generation: GEN, objectid: BTRFS_DEV_TREE_OBJECTID, level: 0 }),
    );
    let root_leaf = root_builder
        .build(NODE_SIZE as usize, leaf_header(BTRFS_ROOT_TREE_OBJECTID, GEN, L_META), BtrfsCsumType::CRC32)
        .unwrap();

    // extent tree leaf: metadata chunk slot 1. Raw-scanned (feeds the
    // Checker's block-group store) and walked by logical address (feeds
    // Cross-Check and the Rebuilder's system-chunk purge). Carries one
    // extent item inside the system chunk's range so the purge step has
    // real residue to reclaim.
    let mut extent_builder = LeafBuilder::new();
    for spec in &specs {
        let key = BtrfsDiskKey::new(spec.offset, BtrfsItemType::BLOCK_GROUP_ITEM, spec.length);
        let bg = BtrfsBlockGroupItem { used: spec.length, chunk_objectid: BTRFS_FIRST_CHUNK_TREE_OBJECTID, flags: spec.flags };
        extent_builder.push(key, struct_bytes(&bg));
    }
    let stray_extent_key = BtrfsDiskKey::new(L_SYS + 0x1000, BtrfsItemType::EXTENT_ITEM, 4096);
    extent_builder.push(stray_extent_key, vec![0u8; 8]);
    let extent_leaf = extent_builder
        .build(
            NODE_SIZE as usize,
            leaf_header(BTRFS_EXTENT_TREE_OBJECTID, GEN, L_META + NODE_SIZE),
            BtrfsCsumType::CRC32,
        )
        .unwrap();

    // dev tree leaf: metadata chunk slot 2.
    let mut dev_builder = LeafBuilder::new();
    for spec in &specs {
        let key = BtrfsDiskKey::new(1, BtrfsItemType::DEV_EXTENT, spec.physical);
        let de = BtrfsDevExtent {
            chunk_tree: BTRFS_CHUNK_TREE_OBJECTID,
            chunk_objectid: BTRFS_FIRST_CHUNK_TREE_OBJECTID,
            chunk_offset: spec.offset,
            length: spec.length,
            chunk_tree_uuid: CHUNK_TREE_UUID,
        };
        dev_builder.push(key, struct_bytes(&de));
    }
    let dev_leaf = dev_builder
        .build(
            NODE_SIZE as usize,
            leaf_header(BTRFS_DEV_TREE_OBJECTID, GEN, L_META + 2 * NODE_SIZE),
            BtrfsCsumType::CRC32,
        )
        .unwrap();

    // placeholder at the system chunk's first slot, standing in for the
    // (broken) on-disk chunk tree root; only its header is read, for
    // `chunk_tree_uuid`.
    let mut old_chunk_root = vec![0u8; NODE_SIZE as usize];
    let old_header = leaf_header(BTRFS_CHUNK_TREE_OBJECTID, GEN, L_SYS);
    unsafe {
        *(old_chunk_root.as_mut_ptr() as *mut BtrfsHeader) = old_header;
    }

    let dev_item = BtrfsDevItem {
        devid: 1,
        total_bytes: 0x1000_0000,
        bytes_used: LEN_DATA + LEN_META + LEN_SYS,
        io_align: 4096,
        io_width: 4096,
        sector_size: 4096,
        r#type: 0,
        generation: GEN,
        start_offset: 0,
        dev_group: 0,
        seek_speed: 0,
        bandwidth: 0,
        uuid: DEV_UUID,
        fsid: FSID,
    };

    let mut sb = BtrfsSuperBlock {
        csum: [0; BTRFS_CSUM_SIZE],
        fsid: FSID,
        bytenr: BTRFS_SUPER_INFO_OFFSET,
        flags: 0,
        magic: BTRFS_MAGIC,
        generation: GEN,
        root: L_META,
        chunk_root: L_SYS,
        log_root: 0,
        log_root_transid: 0,
        total_bytes: 0x1000_0000,
        bytes_used: LEN_DATA + LEN_META + LEN_SYS,
        root_dir_objectid: 0,
        num_devices: 1,
        sectorsize: 4096,
        nodesize: NODE_SIZE as u32,
        leafsize: NODE_SIZE as u32,
        stripesize: 4096,
        sys_chunk_array_size: 0,
        chunk_root_generation: GEN,
        compat_flags: 0,
        compat_ro_flags: 0,
        incompat_flags: 0,
        csum_type: BtrfsCsumType::CRC32,
        root_level: 0,
        chunk_root_level: 0,
        log_root_level: 0,
        dev_item,
        label: [0; BTRFS_LABEL_SIZE],
        cache_generation: 0,
        uuid_tree_generation: 0,
        metadata_uuid: FSID,
        reserved: [0; 28],
        sys_chunk_array: [0; BTRFS_SYSTEM_CHUNK_ARRAY_SIZE],
        super_roots: [BtrfsRootBackup {
            tree_root: 0,
            tree_root_gen: 0,
            chunk_root: 0,
            chunk_root_gen: 0,
            extent_root: 0,
            extent_root_gen: 0,
            fs_root: 0,
            fs_root_gen: 0,
            dev_root: 0,
            dev_root_gen: 0,
            csum_root: 0,
            csum_root_gen: 0,
            total_bytes: 0,
            bytes_used: 0,
            num_devices: 0,
            unused_64: [0; 4],
            tree_root_level: 0,
            chunk_root_level: 0,
            extent_root_level: 0,
            fs_root_level: 0,
            dev_root_level: 0,
            csum_root_level: 0,
            unused_8: [0; 10],
        }; BTRFS_NUM_BACKUP_ROOTS],
        padding: [0; 565],
    };
    let csum = csum_data(&struct_bytes(&sb)[BTRFS_CSUM_SIZE..], BtrfsCsumType::CRC32).unwrap();
    sb.csum = csum;
    let sb_bytes = struct_bytes(&sb);

    let mut image = vec![0u8; (P_SYS + NODE_SIZE) as usize];
    image[BTRFS_SUPER_INFO_OFFSET as usize..BTRFS_SUPER_INFO_OFFSET as usize + sb_bytes.len()]
        .copy_from_slice(&sb_bytes);
    image[P_CHUNK_SCAN_LEAF as usize..P_CHUNK_SCAN_LEAF as usize + chunk_scan_leaf.len()]
        .copy_from_slice(&chunk_scan_leaf);
    image[P_META as usize..P_META as usize + root_leaf.len()].copy_from_slice(&root_leaf);
    image[(P_META + NODE_SIZE) as usize..(P_META + NODE_SIZE) as usize + extent_leaf.len()]
        .copy_from_slice(&extent_leaf);
    image[(P_META + 2 * NODE_SIZE) as usize..(P_META + 2 * NODE_SIZE) as usize + dev_leaf.len()]
        .copy_from_slice(&dev_leaf);
    image[P_SYS as usize..P_SYS as usize + old_chunk_root.len()].copy_from_slice(&old_chunk_root);

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&image).unwrap();
    file.flush().unwrap();

    let cfg = ScanConfig {
        fsid: FSID,
        csum_type: BtrfsCsumType::CRC32,
        sectorsize: 4096,
        leafsize: NODE_SIZE as u32,
        tree_root_generation: GEN,
        chunk_root_generation: GEN,
    };
    (file, cfg)
}

#[test]
fn full_pipeline_scan_through_commit() {
    let (file, cfg) = build_image();
    let path = file.path().to_path_buf();

    let mut devices = vec![Device::open_read_write(&path).unwrap()];
    let mut stores = RecordStores::default();
    scan_devices(&mut devices, &cfg, &mut stores).unwrap();
    assert_eq!(stores.chunks.len(), 3);
    assert_eq!(stores.block_groups.len(), 3);
    assert_eq!(stores.device_extents.len(), 3);
    drop(devices);

    let check_result = check_chunks(stores, true);
    assert!(check_result.is_clean());
    assert_eq!(check_result.good_chunks.len(), 3);

    let good_chunk_records: Vec<_> = check_result.good_chunks.iter().map(|d| d.chunk.clone()).collect();
    let member_paths = vec![path.clone()];
    let mut fs = BrokenChunkFs::open(&member_paths, &good_chunk_records).unwrap();

    let cross = cross_check(&mut fs, check_result.good_chunks, check_result.bad_chunks).unwrap();
    assert_eq!(cross.good_chunks.len(), 3);
    assert!(cross.bad_chunks.is_empty());
    assert!(cross.enoent_chunks.is_empty());

    let txn = rebuild(&mut fs, &cross.good_chunks).unwrap();
    txn.commit(&mut fs).unwrap();

    // re-read the raw image and verify the committed state directly,
    // independent of the library's own read path.
    let raw = std::fs::read(&path).unwrap();

    let sb_bytes = &raw[BTRFS_SUPER_INFO_OFFSET as usize..BTRFS_SUPER_INFO_OFFSET as usize + std::mem::size_of::<BtrfsSuperBlock>()];
    let sb = unsafe { *(sb_bytes.as_ptr() as *const BtrfsSuperBlock) };
    assert_eq!({ sb.generation }, GEN + 1);
    assert_eq!({ sb.chunk_root_generation }, GEN + 1);
    assert!({ sb.sys_chunk_array_size } > 0);
    let computed_sb_csum = csum_data(&sb_bytes[BTRFS_CSUM_SIZE..], BtrfsCsumType::CRC32).unwrap();
    assert_eq!({ sb.csum }, computed_sb_csum);

    // the new chunk-tree leaf landed at the system chunk's physical slot:
    // one dev item plus three chunk items, checksummed and generation-bumped.
    let new_chunk_leaf = &raw[P_SYS as usize..P_SYS as usize + NODE_SIZE as usize];
    let new_header = unsafe { &*(new_chunk_leaf.as_ptr() as *const BtrfsHeader) };
    assert_eq!({ new_header.nritems }, 4);
    assert_eq!({ new_header.generation }, GEN + 1);
    let computed_leaf_csum = csum_data(&new_chunk_leaf[BTRFS_CSUM_SIZE..], BtrfsCsumType::CRC32).unwrap();
    assert_eq!({ new_header.csum }, computed_leaf_csum);

    // the extent leaf got rewritten by the system-chunk purge: the stray
    // extent item inside the system range is gone (3 items remain, down
    // from 4) and the system block group's `used` counter is zeroed.
    let new_extent_leaf = &raw[(P_META + NODE_SIZE) as usize..(P_META + 2 * NODE_SIZE) as usize];
    let extent_header = unsafe { &*(new_extent_leaf.as_ptr() as *const BtrfsHeader) };
    assert_eq!({ extent_header.nritems }, 3);
}
