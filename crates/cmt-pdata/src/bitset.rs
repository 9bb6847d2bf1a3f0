//! Packed bitsets.
//!
//! A bitset is an array of little-endian u64 words, LSB first, so each
//! leaf holds `(block size - header) * 8` bits. The walker checks for
//! missing word ranges exactly like any other array and reports them as
//! bit ranges.

use crate::array::{ArrayVisitor, ArrayWalker};
use crate::btree::U64Codec;
use crate::transaction::TransactionManager;
use cmt_error::Result;
use cmt_types::BlockAddress;
use std::ops::Range;

/// Receives each bit in ascending index order; absent ranges arrive via
/// `visit_missing`.
pub trait BitsetVisitor {
    fn visit_bit(&mut self, index: u64, value: bool) -> Result<()>;
    fn visit_missing(&mut self, indices: Range<u64>);
}

/// Ascending walk of a bitset holding `nr_bits` bits.
pub struct BitsetWalker<'a> {
    tm: &'a TransactionManager,
    nr_bits: u64,
}

impl<'a> BitsetWalker<'a> {
    #[must_use]
    pub fn new(tm: &'a TransactionManager, nr_bits: u64) -> Self {
        Self { tm, nr_bits }
    }

    pub fn walk(&self, root: BlockAddress, visitor: &mut dyn BitsetVisitor) -> Result<()> {
        let codec = U64Codec;
        let mut words = WordVisitor {
            nr_bits: self.nr_bits,
            visitor,
        };
        ArrayWalker::new(self.tm, &codec, self.nr_bits.div_ceil(64))
            .walk(root, &mut words)
    }
}

struct WordVisitor<'a> {
    nr_bits: u64,
    visitor: &'a mut dyn BitsetVisitor,
}

impl ArrayVisitor<u64> for WordVisitor<'_> {
    fn visit_value(&mut self, index: u64, word: u64) -> Result<()> {
        let base = index.saturating_mul(64);
        for bit in 0..64 {
            let global = base + bit;
            if global >= self.nr_bits {
                break;
            }
            self.visitor.visit_bit(global, (word >> bit) & 1 == 1)?;
        }
        Ok(())
    }

    fn visit_missing(&mut self, indices: Range<u64>) {
        let begin = indices.start.saturating_mul(64).min(self.nr_bits);
        let end = indices.end.saturating_mul(64).min(self.nr_bits);
        if begin < end {
            self.visitor.visit_missing(begin..end);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{entries_per_leaf, pack_array_leaf};
    use crate::btree::pack_node;
    use crate::space_map::CoreSpaceMap;
    use cmt_block::{BlockIo, BlockManager};
    use cmt_types::MD_BLOCK_SIZE;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct MemIo {
        blocks: Mutex<Vec<Vec<u8>>>,
    }

    impl BlockIo for MemIo {
        fn nr_blocks(&self) -> u64 {
            self.blocks.lock().len() as u64
        }
        fn read_block(&self, location: BlockAddress, buf: &mut [u8]) -> Result<()> {
            buf.copy_from_slice(&self.blocks.lock()[location.0 as usize]);
            Ok(())
        }
        fn write_block(&self, location: BlockAddress, buf: &[u8]) -> Result<()> {
            self.blocks.lock()[location.0 as usize].copy_from_slice(buf);
            Ok(())
        }
        fn sync(&self) -> Result<()> {
            Ok(())
        }
    }

    fn tm_over(blocks: Vec<Vec<u8>>) -> TransactionManager {
        let nr = blocks.len() as u64;
        let bm = Arc::new(BlockManager::new(
            Box::new(MemIo {
                blocks: Mutex::new(blocks),
            }),
            16,
        ));
        TransactionManager::new(bm, CoreSpaceMap::new(nr))
    }

    fn inner_node(blocknr: u64, keys: &[u64], leaf_addrs: &[u64]) -> Vec<u8> {
        let mut data = vec![0_u8; MD_BLOCK_SIZE];
        let values: Vec<u8> = leaf_addrs.iter().flat_map(|v| v.to_le_bytes()).collect();
        pack_node(&mut data, blocknr, false, 64, 8, keys, &values);
        data
    }

    fn word_leaf(blocknr: u64, words: &[u64]) -> Vec<u8> {
        let mut data = vec![0_u8; MD_BLOCK_SIZE];
        let packed: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        pack_array_leaf(&mut data, blocknr, entries_per_leaf(8) as u32, 8, &packed);
        data
    }

    #[derive(Default)]
    struct Collector {
        set: Vec<u64>,
        total: u64,
        missing: Vec<Range<u64>>,
    }

    impl BitsetVisitor for Collector {
        fn visit_bit(&mut self, index: u64, value: bool) -> Result<()> {
            self.total += 1;
            if value {
                self.set.push(index);
            }
            Ok(())
        }
        fn visit_missing(&mut self, indices: Range<u64>) {
            self.missing.push(indices);
        }
    }

    #[test]
    fn bits_come_out_lsb_first() {
        // Bits 0, 1, 65 and 100 set over 128 bits.
        let words = [0b11_u64, (1 << 1) | (1 << 36)];
        let blocks = vec![inner_node(0, &[0], &[1]), word_leaf(1, &words)];
        let tm = tm_over(blocks);
        let mut collector = Collector::default();
        BitsetWalker::new(&tm, 128)
            .walk(BlockAddress(0), &mut collector)
            .unwrap();

        assert_eq!(collector.total, 128);
        assert_eq!(collector.set, vec![0, 1, 65, 100]);
        assert!(collector.missing.is_empty());
    }

    #[test]
    fn trailing_bits_past_nr_bits_are_ignored() {
        let words = [u64::MAX];
        let blocks = vec![inner_node(0, &[0], &[1]), word_leaf(1, &words)];
        let tm = tm_over(blocks);
        let mut collector = Collector::default();
        BitsetWalker::new(&tm, 10)
            .walk(BlockAddress(0), &mut collector)
            .unwrap();

        assert_eq!(collector.total, 10);
        assert_eq!(collector.set.len(), 10);
    }

    #[test]
    fn missing_words_surface_as_bit_ranges() {
        // Bitset of 70 bits needs 2 words; the leaf only holds one.
        let words = [0_u64];
        let blocks = vec![inner_node(0, &[0], &[1]), word_leaf(1, &words)];
        let tm = tm_over(blocks);
        let mut collector = Collector::default();
        BitsetWalker::new(&tm, 70)
            .walk(BlockAddress(0), &mut collector)
            .unwrap();

        assert_eq!(collector.total, 64);
        assert_eq!(collector.missing, vec![64..70]);
    }

    #[test]
    fn absent_tree_loses_all_bits() {
        // Root points past the device.
        let blocks = vec![inner_node(0, &[0], &[9])];
        let tm = tm_over(blocks);
        let mut collector = Collector::default();
        BitsetWalker::new(&tm, 32)
            .walk(BlockAddress(0), &mut collector)
            .unwrap();

        assert_eq!(collector.total, 0);
        assert_eq!(collector.missing, vec![0..32]);
    }
}
