//! Damage taxonomy and visitor.
//!
//! Walks report inconsistencies as values of [`Damage`] through a
//! [`DamageVisitor`]; visitors observe and accumulate, they never abort a
//! walk, so a single pass collects every observable problem.

use serde::Serialize;
use std::fmt;
use std::ops::Range;

/// Which packed bitset a `MissingBits` report refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BitsetKind {
    Dirty,
    Discard,
}

impl fmt::Display for BitsetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dirty => write!(f, "dirty"),
            Self::Discard => write!(f, "discard"),
        }
    }
}

/// A structured metadata inconsistency.
#[derive(Debug, Clone, Serialize)]
pub enum Damage {
    /// Block 0 failed its checksum or magic.
    SuperblockCorrupt { detail: String },
    /// Block 0 parsed but its fields are wrong.
    SuperblockInvalid { detail: String },
    /// Cache blocks without a mapping entry.
    MissingMappings { indices: Range<u64> },
    /// A mapping entry with impossible flags.
    InvalidMapping {
        cache_block: u64,
        origin_block: u64,
        flags: u32,
        detail: &'static str,
    },
    /// Cache blocks without a hint entry.
    MissingHints { indices: Range<u64> },
    /// Absent stretches of the dirty or discard bitset.
    MissingBits {
        kind: BitsetKind,
        indices: Range<u64>,
    },
}

impl fmt::Display for Damage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SuperblockCorrupt { detail } => write!(f, "superblock is corrupt: {detail}"),
            Self::SuperblockInvalid { detail } => write!(f, "superblock is invalid: {detail}"),
            Self::MissingMappings { indices } => {
                write!(f, "missing mappings [{}, {})", indices.start, indices.end)
            }
            Self::InvalidMapping {
                cache_block,
                origin_block,
                flags,
                detail,
            } => write!(
                f,
                "invalid mapping: {detail} [cblock = {cache_block}, oblock = {origin_block}, flags = {flags:#x}]"
            ),
            Self::MissingHints { indices } => {
                write!(f, "missing hints [{}, {})", indices.start, indices.end)
            }
            Self::MissingBits { kind, indices } => write!(
                f,
                "missing {kind} bits [{}, {})",
                indices.start, indices.end
            ),
        }
    }
}

/// Callback bundle receiving damage reports during a check.
pub trait DamageVisitor {
    fn visit(&mut self, damage: Damage);
}

/// Visitor that only counts; handy for callers that just need a verdict.
#[derive(Debug, Default)]
pub struct CountingVisitor {
    pub count: usize,
}

impl DamageVisitor for CountingVisitor {
    fn visit(&mut self, _damage: Damage) {
        self.count += 1;
    }
}
