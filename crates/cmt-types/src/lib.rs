#![forbid(unsafe_code)]
//! Shared types for the cache metadata toolkit.
//!
//! On-disk constants, the `BlockAddress` newtype, little-endian field
//! readers used by every structure parser, `ParseError`, and the
//! three-level `ErrorState` lattice the checker folds its results into.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// All persistent metadata lives in fixed 4 KiB blocks.
pub const MD_BLOCK_SIZE: usize = 4096;

/// Block 0 is always the superblock.
pub const SUPERBLOCK_LOCATION: BlockAddress = BlockAddress(0);

/// Magic tag in the superblock identifying the cache metadata format.
pub const SUPERBLOCK_MAGIC: u32 = 6_142_003;

/// Salt XORed into the superblock checksum so a superblock cannot be
/// mistaken for a btree node with a coincidentally matching CRC.
pub const SUPERBLOCK_CSUM_XOR: u32 = 9_031_977;
/// Salt for btree node checksums.
pub const BTREE_CSUM_XOR: u32 = 121_107;
/// Salt for array leaf checksums.
pub const ARRAY_CSUM_XOR: u32 = 595_846_735;

pub const MIN_METADATA_VERSION: u32 = 1;
pub const MAX_METADATA_VERSION: u32 = 2;

/// Width of the NUL-padded policy name field in the superblock.
pub const POLICY_NAME_SIZE: usize = 16;

/// Address of a 4 KiB metadata block on the device.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct BlockAddress(pub u64);

impl fmt::Display for BlockAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for BlockAddress {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Failure while decoding an on-disk structure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

/// Borrow `len` bytes at `offset`, or report exactly what was missing.
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let end = offset.checked_add(len).ok_or(ParseError::InsufficientData {
        needed: len,
        offset,
        actual: data.len(),
    })?;
    data.get(offset..end).ok_or(ParseError::InsufficientData {
        needed: len,
        offset,
        actual: data.len(),
    })
}

pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    let mut raw = [0_u8; 8];
    raw.copy_from_slice(bytes);
    Ok(u64::from_le_bytes(raw))
}

/// Read a fixed-size byte array at `offset`.
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut raw = [0_u8; N];
    raw.copy_from_slice(bytes);
    Ok(raw)
}

/// Decode a NUL-padded ASCII field, dropping the padding.
#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Aggregate severity of a metadata check.
///
/// Forms a join-semilattice under [`ErrorState::combine`]: `NoError` is the
/// identity and `Fatal` is absorbing. Variant order is the lattice order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum ErrorState {
    #[default]
    NoError,
    NonFatal,
    Fatal,
}

impl ErrorState {
    /// Join two states, keeping the worse of the pair.
    #[must_use]
    pub fn combine(self, other: Self) -> Self {
        self.max(other)
    }
}

impl fmt::Display for ErrorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoError => write!(f, "no error"),
            Self::NonFatal => write!(f, "non-fatal"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_le_helpers_decode_at_offset() {
        let mut data = vec![0_u8; 32];
        data[4..8].copy_from_slice(&0xDEAD_BEEF_u32.to_le_bytes());
        data[8..16].copy_from_slice(&0x0123_4567_89AB_CDEF_u64.to_le_bytes());
        data[16..18].copy_from_slice(&0xBEEF_u16.to_le_bytes());

        assert_eq!(read_le_u32(&data, 4).unwrap(), 0xDEAD_BEEF);
        assert_eq!(read_le_u64(&data, 8).unwrap(), 0x0123_4567_89AB_CDEF);
        assert_eq!(read_le_u16(&data, 16).unwrap(), 0xBEEF);
    }

    #[test]
    fn read_past_end_reports_offset_and_need() {
        let data = [0_u8; 8];
        let err = read_le_u64(&data, 4).unwrap_err();
        assert_eq!(
            err,
            ParseError::InsufficientData {
                needed: 8,
                offset: 4,
                actual: 8
            }
        );
    }

    #[test]
    fn trim_nul_padded_stops_at_first_nul() {
        assert_eq!(trim_nul_padded(b"mq\0\0\0\0\0\0"), "mq");
        assert_eq!(trim_nul_padded(b"smq"), "smq");
        assert_eq!(trim_nul_padded(b"\0\0"), "");
    }

    #[test]
    fn error_state_combine_is_a_bounded_join() {
        use ErrorState::{Fatal, NoError, NonFatal};
        let all = [NoError, NonFatal, Fatal];

        // Identity.
        for s in all {
            assert_eq!(NoError.combine(s), s);
            assert_eq!(s.combine(NoError), s);
        }
        // Commutativity, associativity, idempotence.
        for a in all {
            assert_eq!(a.combine(a), a);
            for b in all {
                assert_eq!(a.combine(b), b.combine(a));
                for c in all {
                    assert_eq!(a.combine(b).combine(c), a.combine(b.combine(c)));
                }
            }
        }
        // Fatal absorbs.
        for s in all {
            assert_eq!(Fatal.combine(s), Fatal);
        }
    }
}
