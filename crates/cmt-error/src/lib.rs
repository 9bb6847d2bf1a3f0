#![forbid(unsafe_code)]
//! Error types for the cache metadata toolkit.
//!
//! Defines `MetaError` and a `Result<T>` alias used throughout the
//! workspace.

use cmt_types::{BlockAddress, ParseError};
use thiserror::Error;

/// Unified error type for all metadata operations.
#[derive(Debug, Error)]
pub enum MetaError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O failed at block {location}: {source}")]
    BlockIo {
        location: BlockAddress,
        #[source]
        source: std::io::Error,
    },

    #[error("block {location} out of range (device has {nr_blocks} blocks)")]
    OutOfRange {
        location: BlockAddress,
        nr_blocks: u64,
    },

    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption {
        block: BlockAddress,
        detail: String,
    },

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("lock violation at block {block}: {detail}")]
    LockViolation {
        block: BlockAddress,
        detail: &'static str,
    },

    #[error("superblock released while {held} other locks held")]
    SuperblockUnlockedEarly { held: usize },

    #[error("metadata device is read-only")]
    ReadOnly,

    #[error("no free blocks in the metadata space map")]
    NoSpace,

    #[error("invalid metadata: {0}")]
    Invalid(String),
}

/// Result alias using `MetaError`.
pub type Result<T> = std::result::Result<T, MetaError>;
