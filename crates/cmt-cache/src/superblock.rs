//! The cache superblock: block 0, describing every other structure.
//!
//! Layout (little-endian): checksum, magic, version, flags, then the
//! structure roots, geometry and policy fields. Version 1 has no dirty
//! bitset root; in version 2 the field sits between the discard root and
//! the cache block count, shifting the tail up by eight bytes.

use cmt_block::{BlockManager, Validator};
use cmt_error::{MetaError, Result};
use cmt_pdata::checksum::{block_checksum, stamp_checksum};
use cmt_types::{
    read_fixed, read_le_u32, read_le_u64, trim_nul_padded, BlockAddress, ParseError,
    MAX_METADATA_VERSION, MIN_METADATA_VERSION, POLICY_NAME_SIZE, SUPERBLOCK_CSUM_XOR,
    SUPERBLOCK_LOCATION, SUPERBLOCK_MAGIC,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Bit 0 of the flags word: the metadata was marked as needing a check.
pub const SUPERBLOCK_FLAG_NEEDS_CHECK: u32 = 1;

const KNOWN_FLAGS: u32 = SUPERBLOCK_FLAG_NEEDS_CHECK;

/// Largest per-block policy hint the format allows.
pub const MAX_POLICY_HINT_SIZE: u32 = 128;

pub const SB_MAGIC_OFFSET: usize = 4;
pub const SB_VERSION_OFFSET: usize = 8;
pub const SB_FLAGS_OFFSET: usize = 12;
const SB_MAPPING_ROOT_OFFSET: usize = 16;
const SB_HINT_ROOT_OFFSET: usize = 24;
const SB_DISCARD_ROOT_OFFSET: usize = 32;
const SB_DIRTY_ROOT_OFFSET: usize = 40;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub version: u32,
    pub flags: u32,
    pub mapping_root: BlockAddress,
    pub hint_root: Option<BlockAddress>,
    pub discard_root: Option<BlockAddress>,
    /// Present in version >= 2 metadata only.
    pub dirty_root: Option<BlockAddress>,
    pub cache_blocks: u32,
    /// Origin blocks covered by one discard bit.
    pub discard_block_size: u64,
    pub discard_nr_blocks: u64,
    pub policy_hint_size: u32,
    pub policy_name: String,
    pub policy_version: [u32; 3],
}

impl Superblock {
    #[must_use]
    pub fn needs_check(&self) -> bool {
        self.flags & SUPERBLOCK_FLAG_NEEDS_CHECK != 0
    }

    pub fn unpack(data: &[u8]) -> std::result::Result<Self, ParseError> {
        let magic = read_le_u32(data, SB_MAGIC_OFFSET)?;
        if magic != SUPERBLOCK_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(SUPERBLOCK_MAGIC),
                actual: u64::from(magic),
            });
        }
        let version = read_le_u32(data, SB_VERSION_OFFSET)?;
        if !(MIN_METADATA_VERSION..=MAX_METADATA_VERSION).contains(&version) {
            return Err(ParseError::InvalidField {
                field: "version",
                reason: "unsupported metadata version",
            });
        }
        let flags = read_le_u32(data, SB_FLAGS_OFFSET)?;
        let mapping_root = BlockAddress(read_le_u64(data, SB_MAPPING_ROOT_OFFSET)?);
        let hint_root = optional_root(read_le_u64(data, SB_HINT_ROOT_OFFSET)?);
        let discard_root = optional_root(read_le_u64(data, SB_DISCARD_ROOT_OFFSET)?);
        let (dirty_root, tail) = if version >= 2 {
            (
                optional_root(read_le_u64(data, SB_DIRTY_ROOT_OFFSET)?),
                SB_DIRTY_ROOT_OFFSET + 8,
            )
        } else {
            (None, SB_DIRTY_ROOT_OFFSET)
        };
        let cache_blocks = read_le_u32(data, tail)?;
        let discard_block_size = read_le_u64(data, tail + 4)?;
        let discard_nr_blocks = read_le_u64(data, tail + 12)?;
        let policy_hint_size = read_le_u32(data, tail + 20)?;
        let name_raw: [u8; POLICY_NAME_SIZE] = read_fixed(data, tail + 24)?;
        let policy_name = trim_nul_padded(&name_raw);
        let policy_version = [
            read_le_u32(data, tail + 40)?,
            read_le_u32(data, tail + 44)?,
            read_le_u32(data, tail + 48)?,
        ];
        Ok(Self {
            version,
            flags,
            mapping_root,
            hint_root,
            discard_root,
            dirty_root,
            cache_blocks,
            discard_block_size,
            discard_nr_blocks,
            policy_hint_size,
            policy_name,
            policy_version,
        })
    }

    /// Serialize into a block buffer. The checksum word is left for the
    /// validator's `prepare` (or [`stamp_superblock_checksum`]).
    pub fn pack(&self, data: &mut [u8]) {
        data[SB_MAGIC_OFFSET..SB_MAGIC_OFFSET + 4]
            .copy_from_slice(&SUPERBLOCK_MAGIC.to_le_bytes());
        data[SB_VERSION_OFFSET..SB_VERSION_OFFSET + 4].copy_from_slice(&self.version.to_le_bytes());
        data[SB_FLAGS_OFFSET..SB_FLAGS_OFFSET + 4].copy_from_slice(&self.flags.to_le_bytes());
        data[SB_MAPPING_ROOT_OFFSET..SB_MAPPING_ROOT_OFFSET + 8]
            .copy_from_slice(&self.mapping_root.0.to_le_bytes());
        pack_optional_root(data, SB_HINT_ROOT_OFFSET, self.hint_root);
        pack_optional_root(data, SB_DISCARD_ROOT_OFFSET, self.discard_root);
        let tail = if self.version >= 2 {
            pack_optional_root(data, SB_DIRTY_ROOT_OFFSET, self.dirty_root);
            SB_DIRTY_ROOT_OFFSET + 8
        } else {
            SB_DIRTY_ROOT_OFFSET
        };
        data[tail..tail + 4].copy_from_slice(&self.cache_blocks.to_le_bytes());
        data[tail + 4..tail + 12].copy_from_slice(&self.discard_block_size.to_le_bytes());
        data[tail + 12..tail + 20].copy_from_slice(&self.discard_nr_blocks.to_le_bytes());
        data[tail + 20..tail + 24].copy_from_slice(&self.policy_hint_size.to_le_bytes());
        let mut name = [0_u8; POLICY_NAME_SIZE];
        let take = self.policy_name.len().min(POLICY_NAME_SIZE);
        name[..take].copy_from_slice(&self.policy_name.as_bytes()[..take]);
        data[tail + 24..tail + 24 + POLICY_NAME_SIZE].copy_from_slice(&name);
        for (i, v) in self.policy_version.iter().enumerate() {
            let off = tail + 40 + i * 4;
            data[off..off + 4].copy_from_slice(&v.to_le_bytes());
        }
    }
}

fn optional_root(addr: u64) -> Option<BlockAddress> {
    (addr != 0).then_some(BlockAddress(addr))
}

fn pack_optional_root(data: &mut [u8], offset: usize, root: Option<BlockAddress>) {
    let raw = root.map_or(0, |r| r.0);
    data[offset..offset + 8].copy_from_slice(&raw.to_le_bytes());
}

/// Stamp the superblock checksum; used when building images outside the
/// block manager.
pub fn stamp_superblock_checksum(data: &mut [u8]) {
    stamp_checksum(data, SUPERBLOCK_CSUM_XOR);
}

/// Checksum + magic validator for block 0.
#[derive(Debug, Default, Clone, Copy)]
pub struct SuperblockValidator;

impl Validator for SuperblockValidator {
    fn check(&self, data: &[u8], location: BlockAddress) -> Result<()> {
        let stored = read_le_u32(data, 0)?;
        let computed = block_checksum(data, SUPERBLOCK_CSUM_XOR);
        if stored != computed {
            return Err(MetaError::Corruption {
                block: location,
                detail: format!(
                    "superblock checksum mismatch (stored {stored:#x}, computed {computed:#x})"
                ),
            });
        }
        let magic = read_le_u32(data, SB_MAGIC_OFFSET)?;
        if magic != SUPERBLOCK_MAGIC {
            return Err(MetaError::Corruption {
                block: location,
                detail: format!("bad superblock magic {magic:#x}"),
            });
        }
        Ok(())
    }

    fn prepare(&self, data: &mut [u8], _location: BlockAddress) {
        stamp_checksum(data, SUPERBLOCK_CSUM_XOR);
    }
}

/// Load and decode block 0 through the validator.
pub fn read_superblock(bm: &BlockManager) -> Result<Superblock> {
    let guard = bm.read_lock(SUPERBLOCK_LOCATION, Arc::new(SuperblockValidator))?;
    Ok(Superblock::unpack(guard.data())?)
}

/// Field-level validity problems in a superblock that parsed cleanly.
/// Empty means the superblock can be traversed.
#[must_use]
pub fn superblock_invalid_reasons(sb: &Superblock, nr_blocks: u64) -> Vec<String> {
    let mut reasons = Vec::new();
    if sb.flags & !KNOWN_FLAGS != 0 {
        reasons.push(format!("unknown flag bits {:#x}", sb.flags & !KNOWN_FLAGS));
    }
    if sb.mapping_root.0 == 0 {
        reasons.push("mapping root is unset".to_owned());
    } else if sb.mapping_root.0 >= nr_blocks {
        reasons.push(format!("mapping root {} is out of bounds", sb.mapping_root));
    }
    for (name, root) in [
        ("hint root", sb.hint_root),
        ("discard root", sb.discard_root),
        ("dirty root", sb.dirty_root),
    ] {
        if let Some(root) = root {
            if root.0 >= nr_blocks {
                reasons.push(format!("{name} {root} is out of bounds"));
            }
        }
    }
    if sb.version >= 2 && sb.dirty_root.is_none() {
        reasons.push("version 2 metadata without a dirty bitset root".to_owned());
    }
    if sb.policy_hint_size != 0
        && (sb.policy_hint_size % 4 != 0 || sb.policy_hint_size > MAX_POLICY_HINT_SIZE)
    {
        reasons.push(format!(
            "policy hint size {} is not a multiple of 4 up to {MAX_POLICY_HINT_SIZE}",
            sb.policy_hint_size
        ));
    }
    if sb.hint_root.is_some() && sb.policy_hint_size == 0 {
        reasons.push("hint array present but policy hint size is zero".to_owned());
    }
    if sb.policy_name.is_empty() {
        reasons.push("policy name is empty".to_owned());
    } else if !sb.policy_name.bytes().all(|b| b.is_ascii_graphic()) {
        reasons.push(format!("policy name {:?} is not printable ASCII", sb.policy_name));
    }
    reasons
}
