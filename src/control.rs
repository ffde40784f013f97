//! Control/Flow driver.
//!
//! Sequences every phase in order: prepare -> scan -> abort if nothing was
//! found -> check -> abort if orphans remain -> open the surrounding trees
//! under the scanned chunk map -> cross-check -> confirm -> rebuild ->
//! commit. Threads one `Result` through a linear sequence of phases and
//! propagates the first failure.

use crate::checker::check_chunks;
use crate::crosscheck::cross_check;
use crate::device::Device;
use crate::error::{RecoverError, Result};
use crate::fsview::{read_primary_superblock, BrokenChunkFs};
use crate::prompt::confirm;
use crate::rebuild::rebuild;
use crate::record::ChunkRecord;
use crate::scanner::{scan_devices, RecordStores, ScanConfig};
use log::info;
use std::path::PathBuf;

pub struct RecoverConfig {
    pub device: PathBuf,
    /// skip the destructive-write confirmation prompt (`-y`).
    pub assume_yes: bool,
    /// device-extent checking flag the Consistency Checker takes as
    /// input (default on).
    pub check_device_extents: bool,
}

impl RecoverConfig {
    pub fn new(device: PathBuf) -> RecoverConfig {
        RecoverConfig {
            device,
            assume_yes: false,
            check_device_extents: true,
        }
    }
}

/// enumerates every device belonging to this filesystem. Real device
/// discovery needs a libblkid-equivalent scanner, out of scope here (no
/// example in the retrieved corpus provides one); this enumerator only
/// returns the device the operator pointed at, so only single-device
/// filesystems are fully supported end to end today.
fn enumerate_member_devices(primary: &PathBuf) -> Vec<PathBuf> {
    vec![primary.clone()]
}

pub fn recover(cfg: &RecoverConfig) -> Result<()> {
    info!("preparing: reading superblock of {}", cfg.device.display());
    let member_paths = enumerate_member_devices(&cfg.device);
    let primary_sb = read_primary_superblock(&cfg.device)?;

    let scan_cfg = ScanConfig {
        fsid: primary_sb.fsid,
        csum_type: primary_sb.csum_type,
        sectorsize: primary_sb.sectorsize,
        leafsize: primary_sb.leafsize,
        tree_root_generation: primary_sb.generation,
        chunk_root_generation: primary_sb.chunk_root_generation,
    };

    let mut devices: Vec<Device> = member_paths
        .iter()
        .map(|p| Device::open_read_only(p))
        .collect::<Result<_>>()?;

    let mut stores = RecordStores::default();
    scan_devices(&mut devices, &scan_cfg, &mut stores)?;
    drop(devices);

    if stores.is_empty() {
        return Err(RecoverError::InsufficientEvidence {
            detail: "no recoverable chunk metadata found on any scanned device".into(),
        });
    }
    info!(
        "scan complete: {} chunks, {} block groups, {} device extents",
        stores.chunks.len(),
        stores.block_groups.len(),
        stores.device_extents.len()
    );

    let check_result = check_chunks(stores, cfg.check_device_extents);
    info!(
        "checker complete: {} good, {} bad, {} orphan block groups, {} orphan device extents",
        check_result.good_chunks.len(),
        check_result.bad_chunks.len(),
        check_result.orphan_block_groups.len(),
        check_result.orphan_device_extents.len()
    );
    if !check_result.orphan_block_groups.is_empty() || !check_result.orphan_device_extents.is_empty() {
        return Err(RecoverError::InsufficientEvidence {
            detail: "orphan block groups and device extents, we can't repair them now".into(),
        });
    }

    let good_chunk_records: Vec<ChunkRecord> = check_result
        .good_chunks
        .iter()
        .map(|d| d.chunk.clone())
        .collect();
    let mut fs = BrokenChunkFs::open(&member_paths, &good_chunk_records)?;

    let cross = cross_check(&mut fs, check_result.good_chunks, check_result.bad_chunks)?;
    info!(
        "cross-check complete: {} good, {} bad, {} enoent",
        cross.good_chunks.len(),
        cross.bad_chunks.len(),
        cross.enoent_chunks.len()
    );
    if !cross.bad_chunks.is_empty() || !cross.enoent_chunks.is_empty() {
        return Err(RecoverError::InsufficientEvidence {
            detail: "some chunks failed metadata cross-check".into(),
        });
    }

    if !cfg.assume_yes
        && !confirm("rebuild the chunk tree on disk? this destructively overwrites it")?
    {
        return Err(RecoverError::Aborted);
    }

    let txn = rebuild(&mut fs, &cross.good_chunks)?;
    txn.commit(&mut fs)?;
    info!("recovery complete");
    Ok(())
}
