//! Fixed-width typed arrays.
//!
//! An array is an inner B-tree keyed by `index / entries_per_leaf` whose
//! values are the block addresses of array leaves; each leaf reuses the
//! 32-byte node header (with its own checksum salt) and packs
//! `entries_per_leaf` fixed-width values. The walker visits indices in
//! ascending order and turns every gap (a missing inner key, an
//! unreadable leaf, a short leaf, a skipped btree subtree) into a
//! `visit_missing` index range.

use crate::btree::{
    BtreeDamage, BtreeWalker, NodeHeader, NodeVisitor, U64Codec, ValueCodec, NODE_HEADER_SIZE,
};
use crate::checksum::{block_checksum, stamp_checksum};
use crate::transaction::TransactionManager;
use cmt_block::Validator;
use cmt_error::{MetaError, Result};
use cmt_types::{ensure_slice, read_le_u32, read_le_u64, BlockAddress, ARRAY_CSUM_XOR, MD_BLOCK_SIZE};
use std::ops::Range;
use std::sync::Arc;
use tracing::debug;

/// Values a single array leaf can hold.
#[must_use]
pub fn entries_per_leaf(value_size: usize) -> u64 {
    ((MD_BLOCK_SIZE - NODE_HEADER_SIZE) / value_size.max(1)) as u64
}

/// Checksum + misdirection validator for array leaves.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArrayBlockValidator;

impl Validator for ArrayBlockValidator {
    fn check(&self, data: &[u8], location: BlockAddress) -> Result<()> {
        let stored = read_le_u32(data, 0)?;
        let computed = block_checksum(data, ARRAY_CSUM_XOR);
        if stored != computed {
            return Err(MetaError::Corruption {
                block: location,
                detail: format!(
                    "array block checksum mismatch (stored {stored:#x}, computed {computed:#x})"
                ),
            });
        }
        let blocknr = read_le_u64(data, 8)?;
        if blocknr != location.0 {
            return Err(MetaError::Corruption {
                block: location,
                detail: format!("misdirected array block (claims to be block {blocknr})"),
            });
        }
        Ok(())
    }

    fn prepare(&self, data: &mut [u8], location: BlockAddress) {
        data[8..16].copy_from_slice(&location.0.to_le_bytes());
        stamp_checksum(data, ARRAY_CSUM_XOR);
    }
}

/// Serialize an array leaf into `data` and stamp its checksum. `values`
/// holds the packed value bytes.
pub fn pack_array_leaf(
    data: &mut [u8],
    blocknr: u64,
    max_entries: u32,
    value_size: u32,
    values: &[u8],
) {
    let header = NodeHeader {
        flags: 0,
        blocknr,
        nr_entries: (values.len() / value_size.max(1) as usize) as u32,
        max_entries,
        value_size,
    };
    header.pack(data);
    data[NODE_HEADER_SIZE..NODE_HEADER_SIZE + values.len()].copy_from_slice(values);
    stamp_checksum(data, ARRAY_CSUM_XOR);
}

/// Receives array values in ascending index order; gaps arrive as
/// half-open index ranges.
pub trait ArrayVisitor<V> {
    fn visit_value(&mut self, index: u64, value: V) -> Result<()>;
    fn visit_missing(&mut self, indices: Range<u64>);
}

/// Ascending walk of an array of `nr_entries` values.
pub struct ArrayWalker<'a, C: ValueCodec> {
    tm: &'a TransactionManager,
    codec: &'a C,
    nr_entries: u64,
}

impl<'a, C: ValueCodec> ArrayWalker<'a, C> {
    #[must_use]
    pub fn new(tm: &'a TransactionManager, codec: &'a C, nr_entries: u64) -> Self {
        Self {
            tm,
            codec,
            nr_entries,
        }
    }

    pub fn walk(&self, root: BlockAddress, visitor: &mut dyn ArrayVisitor<C::Value>) -> Result<()> {
        let inner_codec = U64Codec;
        let mut leaves = LeafVisitor {
            tm: self.tm,
            codec: self.codec,
            validator: Arc::new(ArrayBlockValidator),
            visitor,
            nr_entries: self.nr_entries,
            entries_per_leaf: entries_per_leaf(self.codec.value_size()),
            next_key: 0,
        };
        BtreeWalker::new(self.tm, &inner_codec).walk(root, &mut leaves)?;
        leaves.finish();
        Ok(())
    }
}

/// Adapter from inner-btree entries (`leaf key -> leaf address`) to
/// per-index array visits.
struct LeafVisitor<'a, C: ValueCodec> {
    tm: &'a TransactionManager,
    codec: &'a C,
    validator: Arc<dyn Validator>,
    visitor: &'a mut dyn ArrayVisitor<C::Value>,
    nr_entries: u64,
    entries_per_leaf: u64,
    next_key: u64,
}

impl<C: ValueCodec> LeafVisitor<'_, C> {
    fn nr_leaves(&self) -> u64 {
        self.nr_entries.div_ceil(self.entries_per_leaf)
    }

    /// Report indices covered by leaf keys `[from, to)` as missing.
    fn missing_leaves(&mut self, from: u64, to: u64) {
        let begin = from
            .saturating_mul(self.entries_per_leaf)
            .min(self.nr_entries);
        let end = to.saturating_mul(self.entries_per_leaf).min(self.nr_entries);
        if begin < end {
            self.visitor.visit_missing(begin..end);
        }
    }

    fn finish(&mut self) {
        let nr_leaves = self.nr_leaves();
        if self.next_key < nr_leaves {
            self.missing_leaves(self.next_key, nr_leaves);
            self.next_key = nr_leaves;
        }
    }
}

impl<C: ValueCodec> NodeVisitor<u64> for LeafVisitor<'_, C> {
    fn visit_entry(&mut self, key: u64, leaf_addr: u64) -> Result<()> {
        if key < self.next_key {
            // Out-of-order inner keys were already reported by the btree
            // walk; nothing more to do with this entry.
            return Ok(());
        }
        if key > self.next_key {
            self.missing_leaves(self.next_key, key);
        }
        self.next_key = key + 1;

        let base = key.saturating_mul(self.entries_per_leaf);
        if base >= self.nr_entries {
            return Ok(());
        }
        let expected = self.entries_per_leaf.min(self.nr_entries - base);

        if leaf_addr >= self.tm.bm().nr_blocks() {
            self.visitor.visit_missing(base..base + expected);
            return Ok(());
        }
        let already_claimed = self.tm.with_space_map(|sm| {
            let count = sm.get(BlockAddress(leaf_addr));
            sm.inc(BlockAddress(leaf_addr));
            count
        });
        if already_claimed > 0 {
            self.visitor.visit_missing(base..base + expected);
            return Ok(());
        }

        let leaf = match self
            .tm
            .read_lock(BlockAddress(leaf_addr), Arc::clone(&self.validator))
        {
            Ok(leaf) => leaf,
            Err(MetaError::Corruption { detail, .. }) => {
                debug!(
                    target: "cmt::pdata::array",
                    event = "bad_leaf",
                    block = leaf_addr,
                    detail = %detail
                );
                self.visitor.visit_missing(base..base + expected);
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        let data = leaf.data();

        let value_size = self.codec.value_size();
        let usable = match NodeHeader::unpack(data) {
            Ok(header)
                if header.value_size as usize == value_size
                    && u64::from(header.max_entries) == self.entries_per_leaf
                    && header.nr_entries <= header.max_entries =>
            {
                u64::from(header.nr_entries)
            }
            _ => {
                self.visitor.visit_missing(base..base + expected);
                return Ok(());
            }
        };

        let have = usable.min(expected);
        for i in 0..have {
            let offset = NODE_HEADER_SIZE + (i as usize) * value_size;
            let value = ensure_slice(data, offset, value_size)
                .and_then(|bytes| self.codec.unpack(bytes));
            match value {
                Ok(value) => self.visitor.visit_value(base + i, value)?,
                Err(_) => self.visitor.visit_missing(base + i..base + i + 1),
            }
        }
        if have < expected {
            self.visitor.visit_missing(base + have..base + expected);
        }
        Ok(())
    }

    fn visit_damage(&mut self, damage: BtreeDamage) {
        debug!(target: "cmt::pdata::array", event = "inner_damage", damage = ?damage);
        if let Some(range) = damage.lost_keys() {
            let from = range.begin.max(self.next_key);
            match range.end {
                Some(end) => {
                    if from < end {
                        self.missing_leaves(from, end);
                    }
                    self.next_key = self.next_key.max(end);
                }
                None => {
                    self.missing_leaves(from, self.nr_leaves());
                    self.next_key = self.nr_leaves();
                }
            }
        }
    }
}
