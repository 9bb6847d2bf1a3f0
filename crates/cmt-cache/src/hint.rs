//! The hint array: one opaque policy-private blob per cache block.
//!
//! Hint contents belong to the cache policy and are not interpreted here;
//! the check is purely structural (width sanity and density).

use crate::damage::{Damage, DamageVisitor};
use cmt_error::Result;
use cmt_pdata::{ArrayVisitor, ArrayWalker, TransactionManager, ValueCodec};
use cmt_types::{ensure_slice, BlockAddress, ErrorState, ParseError};
use std::ops::Range;

/// Fixed-width opaque values of `policy_hint_size` bytes.
#[derive(Debug, Clone, Copy)]
pub struct HintCodec {
    width: usize,
}

impl HintCodec {
    #[must_use]
    pub fn new(width: u32) -> Self {
        Self {
            width: width as usize,
        }
    }
}

impl ValueCodec for HintCodec {
    type Value = Vec<u8>;

    fn value_size(&self) -> usize {
        self.width
    }

    fn unpack(&self, data: &[u8]) -> std::result::Result<Vec<u8>, ParseError> {
        Ok(ensure_slice(data, 0, self.width)?.to_vec())
    }
}

/// Walk the hint array of `cache_blocks` entries; gaps are damage, values
/// are opaque and pass through unexamined.
pub fn check_hint_array(
    tm: &TransactionManager,
    root: BlockAddress,
    cache_blocks: u64,
    hint_width: u32,
    visitor: &mut dyn DamageVisitor,
) -> Result<ErrorState> {
    let codec = HintCodec::new(hint_width);
    let mut checker = HintChecker {
        visitor,
        err: ErrorState::NoError,
    };
    ArrayWalker::new(tm, &codec, cache_blocks).walk(root, &mut checker)?;
    Ok(checker.err)
}

struct HintChecker<'a> {
    visitor: &'a mut dyn DamageVisitor,
    err: ErrorState,
}

impl ArrayVisitor<Vec<u8>> for HintChecker<'_> {
    fn visit_value(&mut self, _index: u64, _hint: Vec<u8>) -> Result<()> {
        Ok(())
    }

    fn visit_missing(&mut self, indices: Range<u64>) {
        self.err = self.err.combine(ErrorState::Fatal);
        self.visitor.visit(Damage::MissingHints { indices });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_width_follows_policy_hint_size() {
        let codec = HintCodec::new(4);
        assert_eq!(codec.value_size(), 4);
        let hint = codec.unpack(&[1, 2, 3, 4]).unwrap();
        assert_eq!(hint, vec![1, 2, 3, 4]);
    }

    #[test]
    fn short_hint_bytes_are_rejected() {
        let codec = HintCodec::new(8);
        assert!(codec.unpack(&[1, 2, 3]).is_err());
    }
}
