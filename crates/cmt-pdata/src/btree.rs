//! Copy-on-write B-tree, read path.
//!
//! Nodes are single blocks: a 32-byte header (checksum, flags, the node's
//! own block address for misdirection detection, entry counts, value
//! size), a key array sized to `max_entries`, then either child pointers
//! (internal) or packed values (leaf). Traversal validates every node and
//! reports damage to the caller's visitor instead of failing, so one pass
//! surfaces every observable problem; a subtree that cannot be parsed is
//! skipped whole.

use crate::checksum::{block_checksum, stamp_checksum};
use crate::transaction::TransactionManager;
use cmt_block::Validator;
use cmt_error::{MetaError, Result};
use cmt_types::{
    read_le_u32, read_le_u64, BlockAddress, ParseError, BTREE_CSUM_XOR, MD_BLOCK_SIZE,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

pub const NODE_HEADER_SIZE: usize = 32;

const INTERNAL_NODE_FLAG: u32 = 1;

/// Trees are shallow in practice; anything deeper is corruption.
const MAX_TREE_DEPTH: usize = 32;

/// Decoded node header; the checksum word is checked by the validator
/// and not retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NodeHeader {
    pub flags: u32,
    pub blocknr: u64,
    pub nr_entries: u32,
    pub max_entries: u32,
    pub value_size: u32,
}

impl NodeHeader {
    pub fn unpack(data: &[u8]) -> std::result::Result<Self, ParseError> {
        Ok(Self {
            flags: read_le_u32(data, 4)?,
            blocknr: read_le_u64(data, 8)?,
            nr_entries: read_le_u32(data, 16)?,
            max_entries: read_le_u32(data, 20)?,
            value_size: read_le_u32(data, 24)?,
        })
    }

    pub fn pack(&self, data: &mut [u8]) {
        data[4..8].copy_from_slice(&self.flags.to_le_bytes());
        data[8..16].copy_from_slice(&self.blocknr.to_le_bytes());
        data[16..20].copy_from_slice(&self.nr_entries.to_le_bytes());
        data[20..24].copy_from_slice(&self.max_entries.to_le_bytes());
        data[24..28].copy_from_slice(&self.value_size.to_le_bytes());
        data[28..32].fill(0);
    }

    #[must_use]
    pub fn is_internal(&self) -> bool {
        self.flags & INTERNAL_NODE_FLAG != 0
    }
}

/// Serialize a whole node into `data` and stamp its checksum. `values`
/// holds the packed value bytes, `keys.len() * value_size` of them.
pub fn pack_node(
    data: &mut [u8],
    blocknr: u64,
    internal: bool,
    max_entries: u32,
    value_size: u32,
    keys: &[u64],
    values: &[u8],
) {
    let header = NodeHeader {
        flags: if internal { INTERNAL_NODE_FLAG } else { 0 },
        blocknr,
        nr_entries: keys.len() as u32,
        max_entries,
        value_size,
    };
    header.pack(data);
    for (i, key) in keys.iter().enumerate() {
        let off = NODE_HEADER_SIZE + i * 8;
        data[off..off + 8].copy_from_slice(&key.to_le_bytes());
    }
    let values_offset = NODE_HEADER_SIZE + max_entries as usize * 8;
    data[values_offset..values_offset + values.len()].copy_from_slice(values);
    stamp_checksum(data, BTREE_CSUM_XOR);
}

/// Checksum + misdirection validator for btree nodes.
#[derive(Debug, Default, Clone, Copy)]
pub struct BtreeNodeValidator;

impl Validator for BtreeNodeValidator {
    fn check(&self, data: &[u8], location: BlockAddress) -> Result<()> {
        let stored = read_le_u32(data, 0)?;
        let computed = block_checksum(data, BTREE_CSUM_XOR);
        if stored != computed {
            return Err(MetaError::Corruption {
                block: location,
                detail: format!(
                    "btree node checksum mismatch (stored {stored:#x}, computed {computed:#x})"
                ),
            });
        }
        let blocknr = read_le_u64(data, 8)?;
        if blocknr != location.0 {
            return Err(MetaError::Corruption {
                block: location,
                detail: format!("misdirected btree node (claims to be block {blocknr})"),
            });
        }
        Ok(())
    }

    fn prepare(&self, data: &mut [u8], location: BlockAddress) {
        data[8..16].copy_from_slice(&location.0.to_le_bytes());
        stamp_checksum(data, BTREE_CSUM_XOR);
    }
}

/// Typed decoding of leaf values.
pub trait ValueCodec {
    type Value;

    fn value_size(&self) -> usize;
    fn unpack(&self, data: &[u8]) -> std::result::Result<Self::Value, ParseError>;
}

/// Plain little-endian u64 values (child pointers, array leaf addresses).
#[derive(Debug, Default, Clone, Copy)]
pub struct U64Codec;

impl ValueCodec for U64Codec {
    type Value = u64;

    fn value_size(&self) -> usize {
        8
    }

    fn unpack(&self, data: &[u8]) -> std::result::Result<u64, ParseError> {
        read_le_u64(data, 0)
    }
}

/// Half-open key interval a subtree is expected to cover; `end: None`
/// means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KeyRange {
    pub begin: u64,
    pub end: Option<u64>,
}

impl KeyRange {
    #[must_use]
    pub fn contains(&self, key: u64) -> bool {
        key >= self.begin && self.end.is_none_or(|end| key < end)
    }
}

/// Damage observable while walking a tree. Each variant carries the key
/// range whose entries are lost with it.
#[derive(Debug, Clone, Serialize)]
pub enum BtreeDamage {
    /// Checksum, misdirection, or header failure; subtree skipped.
    BadNode {
        block: u64,
        range: KeyRange,
        reason: String,
    },
    /// A key outside the range promised by the parent.
    UnexpectedKey {
        block: u64,
        key: u64,
        range: KeyRange,
    },
    /// Child pointer outside the device.
    BadChild { child: u64, range: KeyRange },
    /// Leaf/internal shape mismatch, repeated block, or an undecodable
    /// value.
    StructuralError {
        block: u64,
        range: KeyRange,
        detail: String,
    },
}

impl BtreeDamage {
    /// Key range whose entries were lost, if the damage skipped a subtree.
    #[must_use]
    pub fn lost_keys(&self) -> Option<KeyRange> {
        match self {
            Self::BadNode { range, .. }
            | Self::BadChild { range, .. }
            | Self::StructuralError { range, .. } => Some(*range),
            Self::UnexpectedKey { .. } => None,
        }
    }
}

/// Receives leaf entries in ascending key order plus any damage found on
/// the way. Damage reporting never aborts the walk.
pub trait NodeVisitor<V> {
    fn visit_entry(&mut self, key: u64, value: V) -> Result<()>;
    fn visit_damage(&mut self, damage: BtreeDamage);
}

/// Read-only traversal of one tree.
pub struct BtreeWalker<'a, C: ValueCodec> {
    tm: &'a TransactionManager,
    codec: &'a C,
    validator: Arc<dyn Validator>,
    nr_blocks: u64,
}

impl<'a, C: ValueCodec> BtreeWalker<'a, C> {
    #[must_use]
    pub fn new(tm: &'a TransactionManager, codec: &'a C) -> Self {
        let nr_blocks = tm.bm().nr_blocks();
        Self {
            tm,
            codec,
            validator: Arc::new(BtreeNodeValidator),
            nr_blocks,
        }
    }

    pub fn walk(&self, root: BlockAddress, visitor: &mut dyn NodeVisitor<C::Value>) -> Result<()> {
        self.walk_node(
            root.0,
            KeyRange {
                begin: 0,
                end: None,
            },
            0,
            visitor,
        )
    }

    fn walk_node(
        &self,
        block: u64,
        range: KeyRange,
        depth: usize,
        visitor: &mut dyn NodeVisitor<C::Value>,
    ) -> Result<()> {
        if block >= self.nr_blocks {
            visitor.visit_damage(BtreeDamage::BadChild {
                child: block,
                range,
            });
            return Ok(());
        }
        if depth > MAX_TREE_DEPTH {
            visitor.visit_damage(BtreeDamage::StructuralError {
                block,
                range,
                detail: format!("tree deeper than {MAX_TREE_DEPTH} levels"),
            });
            return Ok(());
        }
        let already_claimed = self.tm.with_space_map(|sm| {
            let count = sm.get(BlockAddress(block));
            sm.inc(BlockAddress(block));
            count
        });
        if already_claimed > 0 {
            visitor.visit_damage(BtreeDamage::StructuralError {
                block,
                range,
                detail: "block referenced more than once".to_owned(),
            });
            return Ok(());
        }

        let node = match self.tm.read_lock(BlockAddress(block), Arc::clone(&self.validator)) {
            Ok(node) => node,
            Err(MetaError::Corruption { detail, .. }) => {
                visitor.visit_damage(BtreeDamage::BadNode {
                    block,
                    range,
                    reason: detail,
                });
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        let data = node.data();

        let header = match NodeHeader::unpack(data) {
            Ok(header) => header,
            Err(err) => {
                visitor.visit_damage(BtreeDamage::BadNode {
                    block,
                    range,
                    reason: err.to_string(),
                });
                return Ok(());
            }
        };
        if let Some(reason) = header_problem(&header) {
            visitor.visit_damage(BtreeDamage::BadNode {
                block,
                range,
                reason,
            });
            return Ok(());
        }

        let mut keys = Vec::with_capacity(header.nr_entries as usize);
        for i in 0..header.nr_entries as usize {
            match read_le_u64(data, NODE_HEADER_SIZE + i * 8) {
                Ok(key) => keys.push(key),
                Err(err) => {
                    visitor.visit_damage(BtreeDamage::BadNode {
                        block,
                        range,
                        reason: err.to_string(),
                    });
                    return Ok(());
                }
            }
        }
        if !keys.windows(2).all(|pair| pair[0] < pair[1]) {
            visitor.visit_damage(BtreeDamage::BadNode {
                block,
                range,
                reason: "keys out of order".to_owned(),
            });
            return Ok(());
        }

        let values_offset = NODE_HEADER_SIZE + header.max_entries as usize * 8;
        if header.is_internal() {
            self.walk_internal(block, &header, &keys, data, values_offset, range, depth, visitor)
        } else {
            self.walk_leaf(block, &header, &keys, data, values_offset, range, visitor)
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn walk_internal(
        &self,
        block: u64,
        header: &NodeHeader,
        keys: &[u64],
        data: &[u8],
        values_offset: usize,
        range: KeyRange,
        depth: usize,
        visitor: &mut dyn NodeVisitor<C::Value>,
    ) -> Result<()> {
        if header.value_size != 8 {
            visitor.visit_damage(BtreeDamage::StructuralError {
                block,
                range,
                detail: format!(
                    "internal node with value size {} instead of a block pointer",
                    header.value_size
                ),
            });
            return Ok(());
        }
        for (i, &key) in keys.iter().enumerate() {
            if !range.contains(key) {
                visitor.visit_damage(BtreeDamage::UnexpectedKey { block, key, range });
                continue;
            }
            let child = match read_le_u64(data, values_offset + i * 8) {
                Ok(child) => child,
                Err(err) => {
                    visitor.visit_damage(BtreeDamage::BadNode {
                        block,
                        range,
                        reason: err.to_string(),
                    });
                    return Ok(());
                }
            };
            let child_range = KeyRange {
                begin: key,
                end: keys.get(i + 1).copied().or(range.end),
            };
            self.walk_node(child, child_range, depth + 1, visitor)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn walk_leaf(
        &self,
        block: u64,
        header: &NodeHeader,
        keys: &[u64],
        data: &[u8],
        values_offset: usize,
        range: KeyRange,
        visitor: &mut dyn NodeVisitor<C::Value>,
    ) -> Result<()> {
        let value_size = self.codec.value_size();
        if header.value_size as usize != value_size {
            visitor.visit_damage(BtreeDamage::StructuralError {
                block,
                range,
                detail: format!(
                    "leaf value size {} where {value_size} was expected",
                    header.value_size
                ),
            });
            return Ok(());
        }
        for (i, &key) in keys.iter().enumerate() {
            if !range.contains(key) {
                visitor.visit_damage(BtreeDamage::UnexpectedKey { block, key, range });
                continue;
            }
            let start = values_offset + i * value_size;
            let value = cmt_types::ensure_slice(data, start, value_size)
                .and_then(|bytes| self.codec.unpack(bytes));
            match value {
                Ok(value) => visitor.visit_entry(key, value)?,
                Err(err) => {
                    debug!(
                        target: "cmt::pdata::btree",
                        event = "bad_value",
                        block,
                        key,
                        error = %err
                    );
                    visitor.visit_damage(BtreeDamage::StructuralError {
                        block,
                        range: KeyRange {
                            begin: key,
                            end: Some(key + 1),
                        },
                        detail: err.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

fn header_problem(header: &NodeHeader) -> Option<String> {
    if header.value_size == 0 {
        return Some("value size is zero".to_owned());
    }
    if header.max_entries == 0 {
        return Some("max entries is zero".to_owned());
    }
    let per_entry = 8 + header.value_size as usize;
    if header.max_entries as usize * per_entry > MD_BLOCK_SIZE - NODE_HEADER_SIZE {
        return Some(format!(
            "max entries {} does not fit in a block",
            header.max_entries
        ));
    }
    if header.nr_entries > header.max_entries {
        return Some(format!(
            "entry count {} exceeds max {}",
            header.nr_entries, header.max_entries
        ));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space_map::CoreSpaceMap;
    use cmt_block::{BlockIo, BlockManager};
    use parking_lot::Mutex;

    struct MemIo {
        blocks: Mutex<Vec<Vec<u8>>>,
    }

    impl MemIo {
        fn from_blocks(blocks: Vec<Vec<u8>>) -> Self {
            Self {
                blocks: Mutex::new(blocks),
            }
        }
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

    const TEST_MAX_ENTRIES: u32 = 64;

    fn u64s(values: &[u64]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn leaf(blocknr: u64, keys: &[u64], values: &[u64]) -> Vec<u8> {
        let mut data = vec![0_u8; MD_BLOCK_SIZE];
        pack_node(
            &mut data,
            blocknr,
            false,
            TEST_MAX_ENTRIES,
            8,
            keys,
            &u64s(values),
        );
        data
    }

    fn internal(blocknr: u64, keys: &[u64], children: &[u64]) -> Vec<u8> {
        let mut data = vec![0_u8; MD_BLOCK_SIZE];
        pack_node(
            &mut data,
            blocknr,
            true,
            TEST_MAX_ENTRIES,
            8,
            keys,
            &u64s(children),
        );
        data
    }

    fn tm_over(blocks: Vec<Vec<u8>>) -> TransactionManager {
        let nr = blocks.len() as u64;
        let bm = Arc::new(BlockManager::new(
            Box::new(MemIo::from_blocks(blocks)),
            16,
        ));
        TransactionManager::new(bm, CoreSpaceMap::new(nr))
    }

    #[derive(Default)]
    struct Collector {
        entries: Vec<(u64, u64)>,
        damage: Vec<BtreeDamage>,
    }

    impl NodeVisitor<u64> for Collector {
        fn visit_entry(&mut self, key: u64, value: u64) -> Result<()> {
            self.entries.push((key, value));
            Ok(())
        }
        fn visit_damage(&mut self, damage: BtreeDamage) {
            self.damage.push(damage);
        }
    }

    #[test]
    fn single_leaf_scan_is_ascending() {
        let blocks = vec![leaf(0, &[1, 5, 9], &[100, 500, 900])];
        let tm = tm_over(blocks);
        let codec = U64Codec;
        let mut collector = Collector::default();
        BtreeWalker::new(&tm, &codec)
            .walk(BlockAddress(0), &mut collector)
            .unwrap();

        assert_eq!(collector.entries, vec![(1, 100), (5, 500), (9, 900)]);
        assert!(collector.damage.is_empty());
        assert!(collector.entries.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn two_level_tree_scans_all_leaves_in_order() {
        let blocks = vec![
            internal(0, &[0, 10], &[1, 2]),
            leaf(1, &[0, 3], &[1, 2]),
            leaf(2, &[10, 11], &[3, 4]),
        ];
        let tm = tm_over(blocks);
        let codec = U64Codec;
        let mut collector = Collector::default();
        BtreeWalker::new(&tm, &codec)
            .walk(BlockAddress(0), &mut collector)
            .unwrap();

        assert_eq!(
            collector.entries,
            vec![(0, 1), (3, 2), (10, 3), (11, 4)]
        );
        assert!(collector.damage.is_empty());
    }

    #[test]
    fn corrupt_leaf_damages_its_range_but_siblings_survive() {
        let mut bad = leaf(1, &[0, 3], &[1, 2]);
        bad[100] ^= 0xFF; // break the checksum
        let blocks = vec![internal(0, &[0, 10], &[1, 2]), bad, leaf(2, &[10], &[3])];
        let tm = tm_over(blocks);
        let codec = U64Codec;
        let mut collector = Collector::default();
        BtreeWalker::new(&tm, &codec)
            .walk(BlockAddress(0), &mut collector)
            .unwrap();

        assert_eq!(collector.entries, vec![(10, 3)]);
        assert_eq!(collector.damage.len(), 1);
        match &collector.damage[0] {
            BtreeDamage::BadNode { block, range, .. } => {
                assert_eq!(*block, 1);
                assert_eq!(
                    *range,
                    KeyRange {
                        begin: 0,
                        end: Some(10)
                    }
                );
            }
            other => panic!("expected BadNode, got {other:?}"),
        }
    }

    #[test]
    fn misdirected_node_is_bad() {
        // Written as if it lived at block 5, placed at block 0.
        let blocks = vec![leaf(5, &[1], &[1])];
        let tm = tm_over(blocks);
        let codec = U64Codec;
        let mut collector = Collector::default();
        BtreeWalker::new(&tm, &codec)
            .walk(BlockAddress(0), &mut collector)
            .unwrap();

        assert!(collector.entries.is_empty());
        assert!(matches!(
            collector.damage.as_slice(),
            [BtreeDamage::BadNode { .. }]
        ));
    }

    #[test]
    fn out_of_range_child_pointer_is_reported() {
        let blocks = vec![internal(0, &[0], &[99]), leaf(1, &[], &[])];
        let tm = tm_over(blocks);
        let codec = U64Codec;
        let mut collector = Collector::default();
        BtreeWalker::new(&tm, &codec)
            .walk(BlockAddress(0), &mut collector)
            .unwrap();

        assert!(matches!(
            collector.damage.as_slice(),
            [BtreeDamage::BadChild { child: 99, .. }]
        ));
    }

    #[test]
    fn unordered_keys_fail_the_node() {
        let mut data = vec![0_u8; MD_BLOCK_SIZE];
        pack_node(
            &mut data,
            0,
            false,
            TEST_MAX_ENTRIES,
            8,
            &[5, 2],
            &u64s(&[1, 2]),
        );
        let tm = tm_over(vec![data]);
        let codec = U64Codec;
        let mut collector = Collector::default();
        BtreeWalker::new(&tm, &codec)
            .walk(BlockAddress(0), &mut collector)
            .unwrap();

        assert!(collector.entries.is_empty());
        match &collector.damage[..] {
            [BtreeDamage::BadNode { reason, .. }] => assert!(reason.contains("out of order")),
            other => panic!("expected BadNode, got {other:?}"),
        }
    }

    #[test]
    fn leaf_with_wrong_value_size_is_structural_damage() {
        let mut data = vec![0_u8; MD_BLOCK_SIZE];
        pack_node(&mut data, 0, false, 100, 4, &[1], &[0xAA, 0, 0, 0]);
        let tm = tm_over(vec![data]);
        let codec = U64Codec; // expects 8-byte values
        let mut collector = Collector::default();
        BtreeWalker::new(&tm, &codec)
            .walk(BlockAddress(0), &mut collector)
            .unwrap();

        assert!(matches!(
            collector.damage.as_slice(),
            [BtreeDamage::StructuralError { .. }]
        ));
    }

    #[test]
    fn repeated_child_block_is_claimed_only_once() {
        // Both children point at block 1.
        let blocks = vec![internal(0, &[0, 10], &[1, 1]), leaf(1, &[0], &[7])];
        let tm = tm_over(blocks);
        let codec = U64Codec;
        let mut collector = Collector::default();
        BtreeWalker::new(&tm, &codec)
            .walk(BlockAddress(0), &mut collector)
            .unwrap();

        assert_eq!(collector.entries, vec![(0, 7)]);
        assert!(matches!(
            collector.damage.as_slice(),
            [BtreeDamage::StructuralError { block: 1, .. }]
        ));
    }

    #[test]
    fn unexpected_key_outside_parent_range() {
        // Parent promises [10, ..) for child, child holds key 3.
        let blocks = vec![internal(0, &[10], &[1]), leaf(1, &[3], &[1])];
        let tm = tm_over(blocks);
        let codec = U64Codec;
        let mut collector = Collector::default();
        BtreeWalker::new(&tm, &codec)
            .walk(BlockAddress(0), &mut collector)
            .unwrap();

        assert!(collector.entries.is_empty());
        assert!(matches!(
            collector.damage.as_slice(),
            [BtreeDamage::UnexpectedKey { key: 3, .. }]
        ));
    }
}
