//! In-memory chunk map built only from `good_chunks`: each corroborated
//! chunk is installed as a resolved logical-to-physical entry, used
//! instead of bootstrapping from the on-disk chunk tree, because the
//! on-disk chunk tree is exactly what may be broken.

use crate::record::{ChunkRecord, Stripe};
use std::collections::BTreeMap;

#[derive(Clone, Debug)]
pub struct ChunkMapEntry {
    pub start: u64,
    pub length: u64,
    pub stripes: Vec<Stripe>,
    pub stripe_len: u64,
    pub data_stripes: u64,
    pub sub_stripes: u64,
}

/// maps chunk-tree logical addresses to `(devid, physical offset)`; this
/// is the only source of truth for that mapping, never a fallback from
/// the on-disk chunk tree.
pub struct ChunkMap {
    entries: BTreeMap<u64, ChunkMapEntry>,
}

impl ChunkMap {
    pub fn from_good_chunks<'a>(chunks: impl IntoIterator<Item = &'a ChunkRecord>) -> ChunkMap {
        let mut entries = BTreeMap::new();
        for chunk in chunks {
            let data_stripes = chunk.data_stripe_count().max(1);
            entries.insert(
                chunk.offset,
                ChunkMapEntry {
                    start: chunk.offset,
                    length: chunk.length,
                    stripes: chunk.stripes.clone(),
                    stripe_len: chunk.stripe_len.max(1),
                    data_stripes,
                    sub_stripes: chunk.sub_stripes.max(1) as u64,
                },
            );
        }
        ChunkMap { entries }
    }

    fn containing(&self, virt_offset: u64) -> Option<&ChunkMapEntry> {
        self.entries
            .range(..=virt_offset)
            .next_back()
            .map(|(_, e)| e)
            .filter(|e| virt_offset < e.start + e.length)
    }

    /// resolves a virtual address to every stripe copy that could hold it,
    /// in on-disk order; the caller tries each in turn until one device is
    /// open.
    ///
    /// For mirrored profiles (SINGLE/DUP/RAID1, `data_stripes == 1`) every
    /// stripe holds the whole logical range, so `within` applies
    /// uniformly. For RAID0/RAID10, the logical range is interleaved
    /// across the data stripes in `stripe_len`-sized runs: pick the data
    /// stripe by `(within / stripe_len) % data_stripes`, then the physical
    /// offset within that stripe's extent by folding the run number back
    /// in. RAID10's mirrors of one data stripe sit contiguously in
    /// `stripes`, `sub_stripes` wide.
    pub fn resolve(&self, virt_offset: u64) -> Option<(u64, Vec<(u64, u64)>)> {
        let entry = self.containing(virt_offset)?;
        let within = virt_offset - entry.start;

        let locations = if entry.data_stripes <= 1 {
            entry
                .stripes
                .iter()
                .map(|s| (s.devid, s.offset + within))
                .collect()
        } else {
            let stripe_nr = within / entry.stripe_len;
            let stripe_index = (stripe_nr % entry.data_stripes) as usize;
            let offset_in_stripe = within % entry.stripe_len;
            let stripe_physical_offset =
                (stripe_nr / entry.data_stripes) * entry.stripe_len + offset_in_stripe;

            let group_start = stripe_index * entry.sub_stripes as usize;
            let group_end = group_start + entry.sub_stripes as usize;
            match entry.stripes.get(group_start..group_end) {
                Some(group) => group
                    .iter()
                    .map(|s| (s.devid, s.offset + stripe_physical_offset))
                    .collect(),
                None => return None,
            }
        };
        Some((entry.length, locations))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
