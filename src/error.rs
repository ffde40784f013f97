//! Error taxonomy for the recovery pipeline.
//!
//! The CLI boundary (`main.rs`) still works in terms `anyhow` would
//! recognize; this enum exists so the library layer can match on failure
//! *kind* (fatal I/O vs. a skippable verification failure vs. the operator
//! declining the destructive prompt) instead of matching on message text.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecoverError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// bad UUID, bad checksum, unexpected level. Always handled by
    /// skipping the offending block during scan; never propagated past
    /// the Scanner.
    #[error("verification failed: {detail}")]
    Verification { detail: String },

    /// equal-generation records that are not byte-identical past the
    /// generation field. The Record Store's EEXIST.
    #[error("inconsistent duplicate {kind} record at offset {offset}")]
    InconsistentDuplicate { kind: &'static str, offset: u64 },

    /// orphan block groups/device extents, or a chunk lacking stripes,
    /// once they can no longer be tolerated.
    #[error("insufficient evidence: {detail}")]
    InsufficientEvidence { detail: String },

    /// operator declined the destructive-write prompt. Translated to a
    /// clean exit(0) at the process boundary.
    #[error("aborted by operator")]
    Aborted,
}

pub type Result<T> = std::result::Result<T, RecoverError>;
