//! Block checksums.
//!
//! Every persistent structure stores a CRC32C of the block tail (bytes
//! 4..4096) in its first word, XORed with a per-structure salt so blocks
//! of one kind can never pass for another.

use cmt_types::MD_BLOCK_SIZE;

/// Compute the salted checksum over a whole metadata block.
#[must_use]
pub fn block_checksum(data: &[u8], salt: u32) -> u32 {
    crc32c::crc32c(&data[4..]) ^ salt
}

/// Stamp the checksum into the block's first word.
pub fn stamp_checksum(data: &mut [u8], salt: u32) {
    debug_assert_eq!(data.len(), MD_BLOCK_SIZE);
    let csum = block_checksum(data, salt);
    data[0..4].copy_from_slice(&csum.to_le_bytes());
}
