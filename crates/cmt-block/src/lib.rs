#![forbid(unsafe_code)]
//! Block I/O layer for cache metadata.
//!
//! Provides the [`BlockIo`] trait with a file/device backend doing aligned
//! whole-block transfers, the per-block [`Validator`] hook, and the caching
//! [`BlockManager`] with scoped read/write references and the
//! superblock-last commit protocol.

mod manager;

pub use manager::{BlockKind, BlockManager, ReadRef, WriteRef, DEFAULT_CACHE_CAPACITY};

use cmt_error::{MetaError, Result};
use cmt_types::{BlockAddress, MD_BLOCK_SIZE};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::{FileExt, FileTypeExt};
use std::path::Path;
use tracing::debug;

/// Owned 4 KiB block buffer whose exposed slice starts on a 4 KiB boundary.
///
/// Remains fully safe by over-allocating and exposing an aligned subslice,
/// so the backend can use direct I/O without extra copies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlignedBlock {
    storage: Vec<u8>,
    start: usize,
}

impl AlignedBlock {
    #[must_use]
    pub fn zeroed() -> Self {
        let storage = vec![0_u8; MD_BLOCK_SIZE * 2 - 1];
        let base = storage.as_ptr() as usize;
        let misalignment = base & (MD_BLOCK_SIZE - 1);
        let start = if misalignment == 0 {
            0
        } else {
            MD_BLOCK_SIZE - misalignment
        };
        Self { storage, start }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.start..self.start + MD_BLOCK_SIZE]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.storage[self.start..self.start + MD_BLOCK_SIZE]
    }
}

impl Default for AlignedBlock {
    fn default() -> Self {
        Self::zeroed()
    }
}

/// Whether the underlying device may be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    ReadOnly,
    ReadWrite,
}

/// Raw whole-block I/O against a metadata device.
///
/// Transfers are always exactly [`MD_BLOCK_SIZE`] bytes; the layer is
/// stateless beyond the descriptor. Caching and ordering live in
/// [`BlockManager`].
pub trait BlockIo: Send + Sync {
    /// Size of the device in blocks.
    fn nr_blocks(&self) -> u64;

    /// Read block `location` into `buf` (`buf.len()` must be one block).
    fn read_block(&self, location: BlockAddress, buf: &mut [u8]) -> Result<()>;

    /// Write one block of `buf` at `location`.
    fn write_block(&self, location: BlockAddress, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// File-backed block I/O using `pread`/`pwrite` semantics.
///
/// Works on regular files and block devices; the device length is probed
/// with a seek when `metadata().len()` reports zero.
#[derive(Debug)]
pub struct FileBlockIo {
    file: File,
    nr_blocks: u64,
    mode: IoMode,
}

impl FileBlockIo {
    pub fn open(path: impl AsRef<Path>, mode: IoMode) -> Result<Self> {
        let path = path.as_ref();
        let file = match mode {
            IoMode::ReadOnly => OpenOptions::new().read(true).open(path)?,
            IoMode::ReadWrite => OpenOptions::new().read(true).write(true).open(path)?,
        };
        let len = device_length(&file)?;
        let nr_blocks = len / MD_BLOCK_SIZE as u64;
        debug!(
            target: "cmt::block::io",
            event = "open",
            path = %path.display(),
            nr_blocks,
            writeable = (mode == IoMode::ReadWrite)
        );
        Ok(Self {
            file,
            nr_blocks,
            mode,
        })
    }

    fn check_range(&self, location: BlockAddress, len: usize) -> Result<u64> {
        if len != MD_BLOCK_SIZE {
            return Err(MetaError::Invalid(format!(
                "partial block transfer of {len} bytes at block {location}"
            )));
        }
        if location.0 >= self.nr_blocks {
            return Err(MetaError::OutOfRange {
                location,
                nr_blocks: self.nr_blocks,
            });
        }
        Ok(location.0 * MD_BLOCK_SIZE as u64)
    }
}

/// Byte length of a regular file or block device.
pub fn device_length(file: &File) -> Result<u64> {
    let meta = file.metadata()?;
    if meta.file_type().is_block_device() {
        let mut probe = file.try_clone()?;
        Ok(probe.seek(SeekFrom::End(0))?)
    } else {
        Ok(meta.len())
    }
}

impl BlockIo for FileBlockIo {
    fn nr_blocks(&self) -> u64 {
        self.nr_blocks
    }

    fn read_block(&self, location: BlockAddress, buf: &mut [u8]) -> Result<()> {
        let offset = self.check_range(location, buf.len())?;
        self.file
            .read_exact_at(buf, offset)
            .map_err(|source| MetaError::BlockIo { location, source })
    }

    fn write_block(&self, location: BlockAddress, buf: &[u8]) -> Result<()> {
        if self.mode == IoMode::ReadOnly {
            return Err(MetaError::ReadOnly);
        }
        let offset = self.check_range(location, buf.len())?;
        self.file
            .write_all_at(buf, offset)
            .map_err(|source| MetaError::BlockIo { location, source })
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Per-block integrity hook.
///
/// `check` runs after every first read of a block, `prepare` immediately
/// before every write. Implementations must be deterministic and hold no
/// per-call state, so `check` after `prepare` always succeeds.
pub trait Validator: Send + Sync {
    fn check(&self, data: &[u8], location: BlockAddress) -> Result<()>;
    fn prepare(&self, data: &mut [u8], location: BlockAddress);
}

/// Identity validator for blocks whose structure is checked elsewhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopValidator;

impl Validator for NoopValidator {
    fn check(&self, _data: &[u8], _location: BlockAddress) -> Result<()> {
        Ok(())
    }

    fn prepare(&self, _data: &mut [u8], _location: BlockAddress) {}
}
