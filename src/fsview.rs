//! Opening the surrounding trees with a broken chunk tree.
//!
//! `BrokenChunkFs` holds open device handles and a master superblock, but
//! resolves every virtual address exclusively through the in-memory
//! `ChunkMap` built from `good_chunks`, never by reading the on-disk chunk
//! tree, because that tree is exactly what may be broken. Tree descent
//! itself (`find_item`) is a standard key-ptr/leaf binary-search walk,
//! reduced to exact-key point lookups (device-extent and block-group
//! lookups are both point queries, not range scans) and returning owned
//! buffers rather than borrowed slices, since `Device` reads through
//! `pread` rather than mapping memory.

use crate::chunkmap::ChunkMap;
use crate::device::Device;
use crate::error::{RecoverError, Result};
use crate::node::{InternalView, LeafView};
use crate::record::ChunkRecord;
use crate::structures::*;
use log::debug;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub struct BrokenChunkFs {
    pub superblock: BtrfsSuperBlock,
    devices: HashMap<u64, Device>,
    dev_items: HashMap<u64, BtrfsDevItem>,
    chunk_map: ChunkMap,
    extent_root: u64,
    dev_root: u64,
}

fn read_superblock(path: &Path) -> Result<BtrfsSuperBlock> {
    let mut dev = Device::open_read_only(path)?;
    let mut buf = [0u8; BTRFS_SUPER_INFO_SIZE];
    if !dev.read_at(BTRFS_SUPER_INFO_OFFSET, &mut buf)? {
        return Err(RecoverError::Verification {
            detail: format!("{} too short to hold a superblock", path.display()),
        });
    }
    let sb = unsafe { *(buf.as_ptr() as *const BtrfsSuperBlock) };
    if sb.magic != BTRFS_MAGIC {
        return Err(RecoverError::Verification {
            detail: format!("{}: bad superblock magic", path.display()),
        });
    }
    if csum_data(&buf[BTRFS_CSUM_SIZE..], sb.csum_type)? != sb.csum {
        return Err(RecoverError::Verification {
            detail: format!("{}: bad superblock checksum", path.display()),
        });
    }
    Ok(sb)
}

/// reads and verifies the primary superblock of one device, independent of
/// any `BrokenChunkFs` (used by the driver to gather `ScanConfig` before a
/// chunk map even exists).
pub fn read_primary_superblock(path: &Path) -> Result<BtrfsSuperBlock> {
    read_superblock(path)
}

impl BrokenChunkFs {
    /// open every member device read/write, read the primary superblock,
    /// reject seeding filesystems, install the good chunks as the chunk
    /// map.
    pub fn open(
        member_paths: &[PathBuf],
        good_chunks: &[ChunkRecord],
    ) -> Result<BrokenChunkFs> {
        let mut superblock: Option<BtrfsSuperBlock> = None;
        let mut devices = HashMap::new();
        let mut dev_items = HashMap::new();

        for path in member_paths {
            let sb = read_superblock(path)?;
            if let Some(existing) = &superblock {
                if sb.fsid != existing.fsid {
                    return Err(RecoverError::Verification {
                        detail: format!("{}: fsid does not match filesystem", path.display()),
                    });
                }
                if sb.generation > existing.generation {
                    superblock = Some(sb);
                }
            } else {
                superblock = Some(sb);
            }
            let dev = Device::open_read_write(path)?;
            dev_items.insert(sb.dev_item.devid, sb.dev_item);
            devices.insert(sb.dev_item.devid, dev);
        }

        let superblock = superblock.ok_or_else(|| RecoverError::Verification {
            detail: "no member device supplied".into(),
        })?;

        if superblock.flags & BTRFS_SUPER_FLAG_SEEDING != 0 {
            return Err(RecoverError::Verification {
                detail: "refusing to operate on a seeding filesystem".into(),
            });
        }

        let chunk_map = ChunkMap::from_good_chunks(good_chunks);
        if chunk_map.is_empty() {
            return Err(RecoverError::InsufficientEvidence {
                detail: "no good chunks to build a chunk map from".into(),
            });
        }

        // fail fast on any stripe whose device never showed up among
        // member_paths, rather than discovering it lazily the first time
        // some virtual address happens to need exactly that stripe.
        for chunk in good_chunks {
            for stripe in &chunk.stripes {
                if !devices.contains_key(&stripe.devid) {
                    return Err(RecoverError::Io(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!(
                            "chunk at {} references device {} which is not open",
                            chunk.offset, stripe.devid
                        ),
                    )));
                }
            }
        }

        let mut fs = BrokenChunkFs {
            superblock,
            devices,
            dev_items,
            chunk_map,
            extent_root: 0,
            dev_root: 0,
        };

        fs.extent_root = fs.resolve_root_bytenr(BTRFS_EXTENT_TREE_OBJECTID)?;
        fs.dev_root = fs.resolve_root_bytenr(BTRFS_DEV_TREE_OBJECTID)?;
        Ok(fs)
    }

    pub fn extent_root(&self) -> u64 {
        self.extent_root
    }

    pub fn dev_root(&self) -> u64 {
        self.dev_root
    }

    pub fn device_mut(&mut self, devid: u64) -> Option<&mut Device> {
        self.devices.get_mut(&devid)
    }

    pub fn devices_mut(&mut self) -> impl Iterator<Item = (&u64, &mut Device)> {
        self.devices.iter_mut()
    }

    pub fn dev_items(&self) -> &HashMap<u64, BtrfsDevItem> {
        &self.dev_items
    }

    /// writes `buf` to every stripe copy of the block at virtual address
    /// `virt_offset`, which must already be resolvable via the installed
    /// chunk map. Used by the Rebuilder's system-chunk purge step to
    /// rewrite an extent-tree leaf in place.
    pub fn write_virt_block(&mut self, virt_offset: u64, buf: &[u8]) -> Result<()> {
        let (_, locations) = self.chunk_map.resolve(virt_offset).ok_or_else(|| {
            RecoverError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("virtual address {virt_offset} is not covered by any good chunk"),
            ))
        })?;
        let mut wrote_any = false;
        for (devid, physical_offset) in locations {
            if let Some(dev) = self.devices.get_mut(&devid) {
                dev.write_at(physical_offset, buf)?;
                wrote_any = true;
            }
        }
        if !wrote_any {
            return Err(RecoverError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no device holding a stripe copy of virtual address {virt_offset} is open"),
            )));
        }
        Ok(())
    }

    /// depth-first visit of every leaf reachable from `root`, in key
    /// order. The purge step genuinely needs every leaf in a logical
    /// range, not just the one leaf a point lookup would land on, so this
    /// does a full recursive descent.
    pub fn walk_leaves(
        &mut self,
        root: u64,
        visit: &mut impl FnMut(u64, &[u8]) -> Result<()>,
    ) -> Result<()> {
        let block = self.load_virt_block(root)?;
        let header = unsafe { &*(block.as_ptr() as *const BtrfsHeader) };
        if header.level == 0 {
            visit(root, &block)?;
            return Ok(());
        }
        let internal = InternalView::new(&block);
        let children: Vec<u64> = (0..internal.header().nritems)
            .map(|i| internal.key_ptr(i).blockptr)
            .collect();
        drop(block);
        for child in children {
            self.walk_leaves(child, visit)?;
        }
        Ok(())
    }

    pub fn node_size(&self) -> u64 {
        self.superblock.nodesize as u64
    }

    /// reads the `nodesize`-long block at virtual address `virt_offset`,
    /// trying every stripe copy in order until one device is present.
    pub(crate) fn load_virt_block(&mut self, virt_offset: u64) -> Result<Vec<u8>> {
        let node_size = self.node_size();
        let (_, locations) = self
            .chunk_map
            .resolve(virt_offset)
            .ok_or_else(|| RecoverError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("virtual address {virt_offset} is not covered by any good chunk"),
            )))?;

        for (devid, physical_offset) in locations {
            if let Some(dev) = self.devices.get_mut(&devid) {
                let mut buf = vec![0u8; node_size as usize];
                if dev.read_at(physical_offset, &mut buf)? {
                    return Ok(buf);
                }
            }
        }
        Err(RecoverError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no device holding a stripe copy of virtual address {virt_offset} is open"),
        )))
    }

    /// exact-key point lookup, descending from `root`. Both the
    /// device-extent and block-group lookups that call this are exact-key
    /// point queries, never range scans.
    pub fn find_item(&mut self, root: u64, key: &BtrfsDiskKey) -> Result<Option<Vec<u8>>> {
        let mut bytenr = root;
        loop {
            let block = self.load_virt_block(bytenr)?;
            let header = unsafe { &*(block.as_ptr() as *const BtrfsHeader) };
            if header.level == 0 {
                let leaf = LeafView::new(&block);
                return Ok(leaf.find(key).map(|(_, data)| data.to_vec()));
            }
            let internal = InternalView::new(&block);
            if internal.header().nritems == 0 {
                return Ok(None);
            }
            let slot = internal.descend_slot(key);
            bytenr = internal.key_ptr(slot).blockptr;
            debug!("descending to block {bytenr} for key {key:?}");
        }
    }

    fn resolve_root_bytenr(&mut self, tree_objectid: u64) -> Result<u64> {
        let key = BtrfsDiskKey::new(tree_objectid, BtrfsItemType::ROOT_ITEM, 0);
        let root = self.superblock.root;
        let data = self.find_item(root, &key)?.ok_or_else(|| {
            RecoverError::InsufficientEvidence {
                detail: format!("no root item for tree object id {tree_objectid}"),
            }
        })?;
        if data.len() < std::mem::size_of::<BtrfsRootItem>() {
            return Err(RecoverError::Verification {
                detail: format!("short root item for tree object id {tree_objectid}"),
            });
        }
        let item = unsafe { &*(data.as_ptr() as *const BtrfsRootItem) };
        Ok(item.bytenr)
    }
}
