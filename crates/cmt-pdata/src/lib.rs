#![forbid(unsafe_code)]
//! Persistent data structures for cache metadata.
//!
//! Everything here sits on top of the `cmt-block` manager: the in-memory
//! space map, copy-on-write transaction manager, the B-tree read path
//! with typed value codecs, and the array/bitset layouts built from
//! B-tree leaves.

pub mod array;
pub mod bitset;
pub mod btree;
pub mod checksum;
pub mod space_map;
pub mod transaction;

pub use array::{ArrayBlockValidator, ArrayVisitor, ArrayWalker};
pub use bitset::{BitsetVisitor, BitsetWalker};
pub use btree::{
    BtreeDamage, BtreeNodeValidator, BtreeWalker, KeyRange, NodeHeader, NodeVisitor, U64Codec,
    ValueCodec, NODE_HEADER_SIZE,
};
pub use space_map::CoreSpaceMap;
pub use transaction::TransactionManager;
