#![forbid(unsafe_code)]
//! Cache-target metadata.
//!
//! The persistent metadata of a block-level cache: the superblock, the
//! mapping array (cache block -> origin block), the optional hint array,
//! and the dirty/discard bitsets, plus the read-only checker that
//! validates them and reports damage to a visitor.

mod check;
mod damage;
mod hint;
mod mapping;
mod superblock;

pub use check::{
    check_bitset, check_device, check_metadata, clear_needs_check, open_metadata, CheckOptions,
    CheckReport, PathClassification,
};
pub use damage::{BitsetKind, CountingVisitor, Damage, DamageVisitor};
pub use hint::{check_hint_array, HintCodec};
pub use mapping::{
    check_mapping_array, pack_mapping, Mapping, MappingCodec, MAPPING_FLAG_DIRTY,
    MAPPING_FLAG_VALID,
};
pub use superblock::{
    read_superblock, stamp_superblock_checksum, superblock_invalid_reasons, Superblock,
    SuperblockValidator, MAX_POLICY_HINT_SIZE, SUPERBLOCK_FLAG_NEEDS_CHECK,
};

pub use cmt_block::IoMode;
pub use cmt_types::ErrorState;
