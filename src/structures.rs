//! On-disk btrfs structures consumed (and, for the chunk tree, produced) by
//! this tool. Field layouts follow the kernel's `ctree.h`; this module only
//! carries the subset needed to scan leaves and rebuild the chunk tree.

pub const BTRFS_CSUM_SIZE: usize = 32;
pub const BTRFS_FSID_SIZE: usize = 16;
pub const BTRFS_UUID_SIZE: usize = 16;
pub const BTRFS_SUPER_INFO_OFFSET: u64 = 65536;
pub const BTRFS_SUPER_INFO_SIZE: usize = 4096;

pub const BTRFS_SUPER_MIRROR_MAX: usize = 3;

pub const BTRFS_SYSTEM_CHUNK_ARRAY_SIZE: usize = 2048;
pub const BTRFS_LABEL_SIZE: usize = 256;

pub const BTRFS_MAGIC: u64 = 0x4D5F53665248425F;
pub const BTRFS_NUM_BACKUP_ROOTS: usize = 4;

pub const BTRFS_ROOT_TREE_OBJECTID: u64 = 1;
pub const BTRFS_EXTENT_TREE_OBJECTID: u64 = 2;
pub const BTRFS_CHUNK_TREE_OBJECTID: u64 = 3;
pub const BTRFS_DEV_TREE_OBJECTID: u64 = 4;
pub const BTRFS_FS_TREE_OBJECTID: u64 = 5;

pub const BTRFS_DEV_ITEMS_OBJECTID: u64 = 1;
pub const BTRFS_FIRST_CHUNK_TREE_OBJECTID: u64 = 256;

pub const BTRFS_SUPER_FLAG_SEEDING: u64 = 1 << 32;

/// block-group type/flags. Only the accounting flags this tool has to
/// preserve (data/metadata/system + raid bits) are named.
pub const BTRFS_BLOCK_GROUP_DATA: u64 = 1 << 0;
pub const BTRFS_BLOCK_GROUP_SYSTEM: u64 = 1 << 1;
pub const BTRFS_BLOCK_GROUP_METADATA: u64 = 1 << 2;
pub const BTRFS_BLOCK_GROUP_RAID0: u64 = 1 << 3;
pub const BTRFS_BLOCK_GROUP_RAID1: u64 = 1 << 4;
pub const BTRFS_BLOCK_GROUP_DUP: u64 = 1 << 5;
pub const BTRFS_BLOCK_GROUP_RAID10: u64 = 1 << 6;
pub const BTRFS_BLOCK_GROUP_RAID5: u64 = 1 << 7;
pub const BTRFS_BLOCK_GROUP_RAID6: u64 = 1 << 8;

/// fixed mirror offsets skipped during linear scan: 64KiB, 64MiB, 256GiB.
pub const SUPER_MIRROR_OFFSETS: [u64; BTRFS_SUPER_MIRROR_MAX] =
    [BTRFS_SUPER_INFO_OFFSET, 0x4000000, 0x4000000000];

pub fn is_super_block_address(offset: u64) -> bool {
    SUPER_MIRROR_OFFSETS.contains(&offset)
}

#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(dead_code, non_camel_case_types)]
pub enum BtrfsCsumType {
    CRC32 = 0,
    XXHASH = 1,
    SHA256 = 2,
    BLAKE2 = 3,
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[allow(dead_code, non_camel_case_types)]
pub enum BtrfsItemType {
    MIN = 0x00,
    INODE_ITEM = 0x01,
    INODE_REF = 0x0c,
    DIR_ITEM = 0x54,
    DIR_INDEX = 0x60,
    EXTENT_DATA = 0x6c,
    EXTENT_CSUM = 0x80,
    ROOT_ITEM = 0x84,
    ROOT_REF = 0x9c,
    EXTENT_ITEM = 0xa8,
    METADATA_ITEM = 0xa9,
    BLOCK_GROUP_ITEM = 0xc0,
    DEV_EXTENT = 0xcc,
    DEV_ITEM = 0xd8,
    CHUNK_ITEM = 0xe4,
    MAX = 0xff,
}

pub type LE16 = u16;
pub type LE32 = u32;
pub type LE64 = u64;

pub type BtrfsCsum = [u8; BTRFS_CSUM_SIZE];
pub type BtrfsUuid = [u8; BTRFS_UUID_SIZE];
pub type BtrfsFsid = [u8; BTRFS_FSID_SIZE];

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct BtrfsDevItem {
    pub devid: LE64,
    pub total_bytes: LE64,
    pub bytes_used: LE64,
    pub io_align: LE32,
    pub io_width: LE32,
    pub sector_size: LE32,
    pub r#type: LE64,
    pub generation: LE64,
    pub start_offset: LE64,
    pub dev_group: LE32,
    pub seek_speed: u8,
    pub bandwidth: u8,
    pub uuid: BtrfsUuid,
    pub fsid: BtrfsFsid,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct BtrfsRootBackup {
    pub tree_root: LE64,
    pub tree_root_gen: LE64,
    pub chunk_root: LE64,
    pub chunk_root_gen: LE64,
    pub extent_root: LE64,
    pub extent_root_gen: LE64,
    pub fs_root: LE64,
    pub fs_root_gen: LE64,
    pub dev_root: LE64,
    pub dev_root_gen: LE64,
    pub csum_root: LE64,
    pub csum_root_gen: LE64,
    pub total_bytes: LE64,
    pub bytes_used: LE64,
    pub num_devices: LE64,
    pub unused_64: [LE64; 4],
    pub tree_root_level: u8,
    pub chunk_root_level: u8,
    pub extent_root_level: u8,
    pub fs_root_level: u8,
    pub dev_root_level: u8,
    pub csum_root_level: u8,
    pub unused_8: [u8; 10],
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct BtrfsSuperBlock {
    pub csum: BtrfsCsum,
    pub fsid: BtrfsFsid,
    pub bytenr: LE64,
    pub flags: LE64,
    pub magic: LE64,
    pub generation: LE64,
    pub root: LE64,
    pub chunk_root: LE64,
    pub log_root: LE64,
    pub log_root_transid: LE64,
    pub total_bytes: LE64,
    pub bytes_used: LE64,
    pub root_dir_objectid: LE64,
    pub num_devices: LE64,
    pub sectorsize: LE32,
    pub nodesize: LE32,
    pub leafsize: LE32,
    pub stripesize: LE32,
    pub sys_chunk_array_size: LE32,
    pub chunk_root_generation: LE64,
    pub compat_flags: LE64,
    pub compat_ro_flags: LE64,
    pub incompat_flags: LE64,
    pub csum_type: BtrfsCsumType,
    pub root_level: u8,
    pub chunk_root_level: u8,
    pub log_root_level: u8,
    pub dev_item: BtrfsDevItem,
    pub label: [u8; BTRFS_LABEL_SIZE],
    pub cache_generation: LE64,
    pub uuid_tree_generation: LE64,
    pub metadata_uuid: BtrfsFsid,
    pub reserved: [LE64; 28],
    pub sys_chunk_array: [u8; BTRFS_SYSTEM_CHUNK_ARRAY_SIZE],
    pub super_roots: [BtrfsRootBackup; BTRFS_NUM_BACKUP_ROOTS],
    pub padding: [u8; 565],
}
static_assertions::assert_eq_size!([u8; BTRFS_SUPER_INFO_SIZE], BtrfsSuperBlock);

/* header is stored at the start of every tree node */
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct BtrfsHeader {
    pub csum: BtrfsCsum,
    pub fsid: BtrfsFsid,
    pub bytenr: LE64,
    pub flags: LE64,
    pub chunk_tree_uuid: BtrfsUuid,
    pub generation: LE64,
    pub owner: LE64,
    pub nritems: LE32,
    pub level: u8,
}

/* leaf nodes are full of btrfs_items, and data */
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct BtrfsItem {
    pub key: BtrfsDiskKey,
    pub offset: LE32,
    pub size: LE32,
}

/* non-leaf nodes are full of btrfs_key_ptrs */
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct BtrfsKeyPtr {
    pub key: BtrfsDiskKey,
    pub blockptr: LE64,
    pub generation: LE64,
}

#[repr(C, packed)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BtrfsDiskKey {
    pub objectid: LE64,
    pub item_type: u8,
    pub offset: LE64,
}

impl std::fmt::Debug for BtrfsDiskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let objectid = self.objectid;
        let item_type = self.item_type;
        let offset = self.offset;
        write!(f, "({objectid} {item_type:#x} {offset})")
    }
}

impl BtrfsDiskKey {
    pub fn new(objectid: u64, item_type: BtrfsItemType, offset: u64) -> BtrfsDiskKey {
        BtrfsDiskKey {
            objectid,
            item_type: item_type as u8,
            offset,
        }
    }
}

impl PartialOrd for BtrfsDiskKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BtrfsDiskKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.objectid, self.item_type, self.offset).cmp(&(
            other.objectid,
            other.item_type,
            other.offset,
        ))
    }
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct BtrfsStripe {
    pub devid: LE64,
    pub offset: LE64,
    pub dev_uuid: BtrfsUuid,
}
static_assertions::assert_eq_size!([u8; 32], BtrfsStripe);

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct BtrfsChunk {
    pub length: LE64,
    pub owner: LE64,
    pub stripe_len: LE64,
    pub r#type: LE64,
    pub io_align: LE32,
    pub io_width: LE32,
    pub sector_size: LE32,
    pub num_stripes: LE16,
    pub sub_stripes: LE16,
    /* `num_stripes` btrfs_stripe entries follow */
}

/// extent-tree bookkeeping record for exactly one chunk: logical bytes
/// in use, the chunk it belongs to, and its block-group flags. Laid out
/// per the kernel's `btrfs_block_group_item`.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct BtrfsBlockGroupItem {
    pub used: LE64,
    pub chunk_objectid: LE64,
    pub flags: LE64,
}

/// device-tree record claiming a physical region of one device for a
/// specific chunk. Laid out per the kernel's `btrfs_dev_extent`.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct BtrfsDevExtent {
    pub chunk_tree: LE64,
    pub chunk_objectid: LE64,
    pub chunk_offset: LE64,
    pub length: LE64,
    pub chunk_tree_uuid: BtrfsUuid,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct BtrfsRootItem {
    pub bytenr: LE64,
    pub generation: LE64,
    pub objectid: LE64,
    pub level: u8,
}

/// returns a 32-byte checksum buffer so csum fields stay a fixed
/// `BtrfsCsum` size regardless of the algorithm actually in use. Only
/// crc32c is implemented; `csum_type` comes straight off an on-disk
/// superblock, so an unsupported algorithm is reported rather than
/// panicking the process.
pub fn csum_data(buf: &[u8], csum_type: BtrfsCsumType) -> crate::error::Result<BtrfsCsum> {
    match csum_type {
        BtrfsCsumType::CRC32 => Ok(csum_data_crc32(buf)),
        other => Err(crate::error::RecoverError::Verification {
            detail: format!("unsupported checksum algorithm {other:?}"),
        }),
    }
}

fn csum_data_crc32(buf: &[u8]) -> BtrfsCsum {
    use crc::{Crc, CRC_32_ISCSI};
    const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);
    let mut ret = [0_u8; BTRFS_CSUM_SIZE];
    let cs = CASTAGNOLI.checksum(buf).to_le_bytes();
    ret[..cs.len()].copy_from_slice(&cs);
    ret
}

pub fn uuid_str(uuid: &BtrfsUuid) -> String {
    format!(
        "{}-{}-{}-{}-{}",
        hex::encode(&uuid[0..4]),
        hex::encode(&uuid[4..6]),
        hex::encode(&uuid[6..8]),
        hex::encode(&uuid[8..10]),
        hex::encode(&uuid[10..]),
    )
}
