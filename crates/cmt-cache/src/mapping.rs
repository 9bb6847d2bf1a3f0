//! The mapping array: cache block -> (origin block, flags).
//!
//! Each entry packs into a u64 as `origin_block << 16 | flags`. A valid
//! array holds exactly one entry per cache block with the VALID bit set;
//! the DIRTY bit is only legal in version 1 metadata (version 2 keeps
//! dirtiness in its own bitset).

use crate::damage::{Damage, DamageVisitor};
use cmt_error::Result;
use cmt_pdata::{ArrayVisitor, ArrayWalker, TransactionManager, ValueCodec};
use cmt_types::{read_le_u64, BlockAddress, ErrorState, ParseError};
use serde::Serialize;
use std::ops::Range;

pub const MAPPING_FLAG_VALID: u32 = 1;
pub const MAPPING_FLAG_DIRTY: u32 = 2;

const KNOWN_MAPPING_FLAGS: u32 = MAPPING_FLAG_VALID | MAPPING_FLAG_DIRTY;
const MAPPING_FLAGS_MASK: u64 = 0xFFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Mapping {
    pub oblock: u64,
    pub flags: u32,
}

impl Mapping {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.flags & MAPPING_FLAG_VALID != 0
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.flags & MAPPING_FLAG_DIRTY != 0
    }
}

/// Pack a mapping into its on-disk u64.
#[must_use]
pub fn pack_mapping(mapping: &Mapping) -> u64 {
    (mapping.oblock << 16) | (u64::from(mapping.flags) & MAPPING_FLAGS_MASK)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MappingCodec;

impl ValueCodec for MappingCodec {
    type Value = Mapping;

    fn value_size(&self) -> usize {
        8
    }

    fn unpack(&self, data: &[u8]) -> std::result::Result<Mapping, ParseError> {
        let raw = read_le_u64(data, 0)?;
        Ok(Mapping {
            oblock: raw >> 16,
            flags: (raw & MAPPING_FLAGS_MASK) as u32,
        })
    }
}

/// Walk the mapping array of `cache_blocks` entries, reporting missing
/// indices and invalid entries; returns the resulting error state.
pub fn check_mapping_array(
    tm: &TransactionManager,
    root: BlockAddress,
    cache_blocks: u64,
    version: u32,
    visitor: &mut dyn DamageVisitor,
) -> Result<ErrorState> {
    let codec = MappingCodec;
    let mut checker = MappingChecker {
        version,
        visitor,
        err: ErrorState::NoError,
    };
    ArrayWalker::new(tm, &codec, cache_blocks).walk(root, &mut checker)?;
    Ok(checker.err)
}

struct MappingChecker<'a> {
    version: u32,
    visitor: &'a mut dyn DamageVisitor,
    err: ErrorState,
}

impl MappingChecker<'_> {
    fn mapping_problem(&self, mapping: &Mapping) -> Option<&'static str> {
        if mapping.flags & !KNOWN_MAPPING_FLAGS != 0 {
            Some("unknown flag bits")
        } else if !mapping.is_valid() {
            Some("valid flag is not set")
        } else if self.version >= 2 && mapping.is_dirty() {
            Some("dirty flag in version 2 metadata")
        } else {
            None
        }
    }
}

impl ArrayVisitor<Mapping> for MappingChecker<'_> {
    fn visit_value(&mut self, index: u64, mapping: Mapping) -> Result<()> {
        if let Some(detail) = self.mapping_problem(&mapping) {
            self.err = self.err.combine(ErrorState::Fatal);
            self.visitor.visit(Damage::InvalidMapping {
                cache_block: index,
                origin_block: mapping.oblock,
                flags: mapping.flags,
                detail,
            });
        }
        Ok(())
    }

    fn visit_missing(&mut self, indices: Range<u64>) {
        self.err = self.err.combine(ErrorState::Fatal);
        self.visitor.visit(Damage::MissingMappings { indices });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_splits_oblock_and_flags() {
        let codec = MappingCodec;
        let packed = pack_mapping(&Mapping {
            oblock: 0xABCD,
            flags: MAPPING_FLAG_VALID | MAPPING_FLAG_DIRTY,
        });
        let mapping = codec.unpack(&packed.to_le_bytes()).unwrap();
        assert_eq!(mapping.oblock, 0xABCD);
        assert!(mapping.is_valid());
        assert!(mapping.is_dirty());
    }

    #[test]
    fn flag_policy_depends_on_version() {
        let dirty = Mapping {
            oblock: 1,
            flags: MAPPING_FLAG_VALID | MAPPING_FLAG_DIRTY,
        };
        let mut sink = crate::damage::CountingVisitor::default();
        let v1 = MappingChecker {
            version: 1,
            visitor: &mut sink,
            err: ErrorState::NoError,
        };
        assert_eq!(v1.mapping_problem(&dirty), None);

        let mut sink = crate::damage::CountingVisitor::default();
        let v2 = MappingChecker {
            version: 2,
            visitor: &mut sink,
            err: ErrorState::NoError,
        };
        assert_eq!(
            v2.mapping_problem(&dirty),
            Some("dirty flag in version 2 metadata")
        );

        let unmapped = Mapping { oblock: 0, flags: 0 };
        assert_eq!(v2.mapping_problem(&unmapped), Some("valid flag is not set"));

        let unknown = Mapping {
            oblock: 0,
            flags: MAPPING_FLAG_VALID | 0x8,
        };
        assert_eq!(v2.mapping_problem(&unknown), Some("unknown flag bits"));
    }
}
