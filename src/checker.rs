//! Consistency Checker.
//!
//! Walk every harvested chunk, pair it against its block group and device
//! extents, and whatever's left unclaimed in the other two stores is an
//! orphan. The stores hand out owned values here (`into_values`) because a
//! `DerivedChunk` needs to own its matched records, not borrow from three
//! containers with different lifetimes.

use crate::record::{BlockGroupRecord, ChunkRecord, DeviceExtentRecord};
use crate::scanner::RecordStores;
use log::warn;
use std::collections::BTreeMap;

/// a `ChunkRecord` after checking, with back-pointers to the evidence that
/// corroborates it.
#[derive(Clone, Debug)]
pub struct DerivedChunk {
    pub chunk: ChunkRecord,
    pub bg_rec: Option<BlockGroupRecord>,
    pub dextents: Vec<DeviceExtentRecord>,
}

pub struct CheckResult {
    pub good_chunks: Vec<DerivedChunk>,
    pub bad_chunks: Vec<DerivedChunk>,
    pub orphan_block_groups: Vec<BlockGroupRecord>,
    pub orphan_device_extents: Vec<DeviceExtentRecord>,
}

impl CheckResult {
    pub fn is_clean(&self) -> bool {
        self.bad_chunks.is_empty()
            && self.orphan_block_groups.is_empty()
            && self.orphan_device_extents.is_empty()
    }
}

/// `check_device_extents` toggles whether stripes are matched against the
/// device-extent store (default: on); when false, a chunk is judged
/// solely on its block group.
pub fn check_chunks(stores: RecordStores, check_device_extents: bool) -> CheckResult {
    let mut block_groups: BTreeMap<(u64, u64), BlockGroupRecord> = stores
        .block_groups
        .into_values()
        .map(|bg| ((bg.objectid, bg.length), bg))
        .collect();
    let mut device_extents: BTreeMap<(u64, u64), DeviceExtentRecord> = stores
        .device_extents
        .into_values()
        .map(|de| ((de.devid, de.physical_offset), de))
        .collect();

    let mut good_chunks = Vec::new();
    let mut bad_chunks = Vec::new();

    for chunk in stores.chunks.into_values() {
        let bg_key = (chunk.offset, chunk.length);
        let bg = block_groups.get(&bg_key).cloned();

        let bg_ok = match &bg {
            Some(bg) => bg.flags == chunk.type_flags,
            None => false,
        };
        if !bg_ok {
            warn!(
                "chunk at {} has no matching block group, marking bad",
                chunk.offset
            );
            bad_chunks.push(DerivedChunk {
                chunk,
                bg_rec: None,
                dextents: Vec::new(),
            });
            continue;
        }

        let mut dextents = Vec::new();
        let mut stripes_ok = true;
        if check_device_extents {
            let stripe_len = chunk.stripe_length();
            for stripe in &chunk.stripes {
                let key = (stripe.devid, stripe.offset);
                match device_extents.get(&key) {
                    Some(de) if de.length == stripe_len && de.chunk_offset == chunk.offset => {
                        dextents.push(de.clone());
                    }
                    _ => {
                        stripes_ok = false;
                        break;
                    }
                }
            }
        }

        if !stripes_ok {
            warn!(
                "chunk at {} has missing or mismatched device extents, marking bad",
                chunk.offset
            );
            bad_chunks.push(DerivedChunk {
                chunk,
                bg_rec: bg,
                dextents: Vec::new(),
            });
            continue;
        }

        // claim the block group and every matched device extent so they
        // don't show up as orphans below.
        block_groups.remove(&bg_key);
        for d in &dextents {
            device_extents.remove(&(d.devid, d.physical_offset));
        }

        good_chunks.push(DerivedChunk {
            chunk,
            bg_rec: bg,
            dextents,
        });
    }

    CheckResult {
        good_chunks,
        bad_chunks,
        orphan_block_groups: block_groups.into_values().collect(),
        orphan_device_extents: device_extents.into_values().collect(),
    }
}
