//! The metadata checker.
//!
//! Orchestrates a read-only pass over a metadata device: classify the
//! path, validate the superblock, then walk the mapping array, dirty and
//! discard bitsets, and hint array as requested, joining the per-phase
//! results in the error lattice. On success it can clear the NEEDS_CHECK
//! flag through the superblock commit protocol.

use crate::damage::{BitsetKind, Damage, DamageVisitor};
use crate::hint::check_hint_array;
use crate::mapping::check_mapping_array;
use crate::superblock::{
    superblock_invalid_reasons, Superblock, SuperblockValidator, SB_FLAGS_OFFSET,
    SUPERBLOCK_FLAG_NEEDS_CHECK,
};
use cmt_block::{BlockManager, FileBlockIo, IoMode, DEFAULT_CACHE_CAPACITY};
use cmt_error::{MetaError, Result};
use cmt_pdata::{BitsetVisitor, BitsetWalker, CoreSpaceMap, TransactionManager};
use cmt_types::{read_le_u32, BlockAddress, ErrorState, MD_BLOCK_SIZE, SUPERBLOCK_LOCATION};
use serde::Serialize;
use std::fs::File;
use std::io::Read;
use std::ops::Range;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// What to verify and how to treat the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckOptions {
    pub check_mappings: bool,
    pub check_hints: bool,
    pub check_discards: bool,
    /// Treat a non-fatal end state as success.
    pub skip_nonfatal: bool,
    /// Suppress human-facing output; consulted by reporters, not by the
    /// traversal itself.
    pub quiet: bool,
    pub clear_needs_check_on_success: bool,
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self {
            check_mappings: true,
            check_hints: true,
            check_discards: true,
            skip_nonfatal: false,
            quiet: false,
            clear_needs_check_on_success: false,
        }
    }
}

/// What kind of input the path turned out to hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PathClassification {
    /// Binary metadata, at least one block long.
    Metadata,
    /// Shorter than a single metadata block.
    TooSmall,
    /// Shorter than a block and starting with an XML prolog, almost
    /// certainly a metadata dump, which this tool does not read.
    LooksLikeXml,
}

/// Outcome of a full device check.
#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub classification: PathClassification,
    pub error_state: ErrorState,
    pub needs_check_set: bool,
    pub cleared_needs_check: bool,
}

impl CheckReport {
    /// Success under the caller's skip-nonfatal policy.
    #[must_use]
    pub fn success(&self, skip_nonfatal: bool) -> bool {
        if skip_nonfatal {
            self.error_state != ErrorState::Fatal
        } else {
            self.error_state == ErrorState::NoError
        }
    }
}

/// Open a metadata device for checking or repair tooling.
pub fn open_metadata(path: impl AsRef<Path>, mode: IoMode) -> Result<Arc<BlockManager>> {
    let io = FileBlockIo::open(path, mode)?;
    Ok(Arc::new(BlockManager::new(
        Box::new(io),
        DEFAULT_CACHE_CAPACITY,
    )))
}

/// Check an already-open block manager.
///
/// Returns the joined error state plus whether NEEDS_CHECK was set.
/// Damage goes to `visitor`; only environmental failures (I/O errors)
/// surface as `Err`.
pub fn check_metadata(
    bm: &Arc<BlockManager>,
    opts: &CheckOptions,
    visitor: &mut dyn DamageVisitor,
) -> Result<(ErrorState, bool)> {
    info!(target: "cmt::check", event = "examining_superblock");
    let sb = {
        let guard = match bm.read_lock(SUPERBLOCK_LOCATION, Arc::new(SuperblockValidator)) {
            Ok(guard) => guard,
            Err(MetaError::Corruption { detail, .. }) => {
                visitor.visit(Damage::SuperblockCorrupt { detail });
                return Ok((ErrorState::Fatal, false));
            }
            Err(err) => return Err(err),
        };
        match Superblock::unpack(guard.data()) {
            Ok(sb) => sb,
            Err(err) => {
                visitor.visit(Damage::SuperblockInvalid {
                    detail: err.to_string(),
                });
                return Ok((ErrorState::Fatal, false));
            }
        }
    };

    let needs_check = sb.needs_check();
    let reasons = superblock_invalid_reasons(&sb, bm.nr_blocks());
    if !reasons.is_empty() {
        for detail in reasons {
            visitor.visit(Damage::SuperblockInvalid { detail });
        }
        return Ok((ErrorState::Fatal, needs_check));
    }

    let mut sm = CoreSpaceMap::new(bm.nr_blocks());
    sm.inc(SUPERBLOCK_LOCATION);
    let tm = TransactionManager::new(Arc::clone(bm), sm);

    let mut err = ErrorState::NoError;
    if opts.check_mappings {
        info!(target: "cmt::check", event = "examining_mapping_array", cache_blocks = sb.cache_blocks);
        err = err.combine(check_mapping_array(
            &tm,
            sb.mapping_root,
            u64::from(sb.cache_blocks),
            sb.version,
            visitor,
        )?);
        if sb.version >= 2 {
            if let Some(dirty_root) = sb.dirty_root {
                info!(target: "cmt::check", event = "examining_dirty_bitset");
                err = err.combine(check_bitset(
                    &tm,
                    dirty_root,
                    u64::from(sb.cache_blocks),
                    BitsetKind::Dirty,
                    visitor,
                )?);
            }
        }
    }

    if opts.check_hints {
        match sb.hint_root {
            None => info!(target: "cmt::check", event = "no_hint_array"),
            Some(root) => {
                info!(target: "cmt::check", event = "examining_hint_array", hint_width = sb.policy_hint_size);
                err = err.combine(check_hint_array(
                    &tm,
                    root,
                    u64::from(sb.cache_blocks),
                    sb.policy_hint_size,
                    visitor,
                )?);
            }
        }
    }

    if opts.check_discards {
        match sb.discard_root {
            None => info!(target: "cmt::check", event = "no_discard_bitset"),
            Some(root) => {
                info!(target: "cmt::check", event = "examining_discard_bitset", nr_bits = sb.discard_nr_blocks);
                err = err.combine(check_bitset(
                    &tm,
                    root,
                    sb.discard_nr_blocks,
                    BitsetKind::Discard,
                    visitor,
                )?);
            }
        }
    }

    Ok((err, needs_check))
}

/// Full path-level check: classify the input, run the metadata pass, and
/// clear NEEDS_CHECK afterwards when asked to and earned.
pub fn check_device(
    path: impl AsRef<Path>,
    opts: &CheckOptions,
    visitor: &mut dyn DamageVisitor,
) -> Result<CheckReport> {
    let path = path.as_ref();
    let meta = std::fs::metadata(path)?;
    let file_type = meta.file_type();
    if !file_type.is_file() && !file_type.is_block_device() {
        return Err(MetaError::Invalid(format!(
            "{}: not a block device or regular file",
            path.display()
        )));
    }

    // Size gate runs before any block-manager construction.
    let length = if file_type.is_block_device() {
        cmt_block::device_length(&File::open(path)?)?
    } else {
        meta.len()
    };
    if length < MD_BLOCK_SIZE as u64 {
        let classification = if looks_like_xml(path)? {
            PathClassification::LooksLikeXml
        } else {
            PathClassification::TooSmall
        };
        return Ok(CheckReport {
            classification,
            error_state: ErrorState::Fatal,
            needs_check_set: false,
            cleared_needs_check: false,
        });
    }

    let (error_state, needs_check_set) = {
        let bm = open_metadata(path, IoMode::ReadOnly)?;
        check_metadata(&bm, opts, visitor)?
    };

    let mut report = CheckReport {
        classification: PathClassification::Metadata,
        error_state,
        needs_check_set,
        cleared_needs_check: false,
    };
    if report.success(opts.skip_nonfatal) && opts.clear_needs_check_on_success && needs_check_set {
        clear_needs_check(path)?;
        report.cleared_needs_check = true;
    }
    Ok(report)
}

/// Clear the NEEDS_CHECK flag in place and commit superblock-last.
///
/// Only the flags word and the checksum change; every other byte of
/// block 0 is preserved.
pub fn clear_needs_check(path: impl AsRef<Path>) -> Result<()> {
    let bm = open_metadata(path, IoMode::ReadWrite)?;
    let mut guard = bm.superblock(SUPERBLOCK_LOCATION, Arc::new(SuperblockValidator))?;
    let flags = read_le_u32(guard.data(), SB_FLAGS_OFFSET)?;
    let cleared = flags & !SUPERBLOCK_FLAG_NEEDS_CHECK;
    guard.data_mut()[SB_FLAGS_OFFSET..SB_FLAGS_OFFSET + 4]
        .copy_from_slice(&cleared.to_le_bytes());
    guard.commit()?;
    info!(target: "cmt::check", event = "cleared_needs_check");
    Ok(())
}

/// Walk a bitset and report absent ranges.
pub fn check_bitset(
    tm: &TransactionManager,
    root: BlockAddress,
    nr_bits: u64,
    kind: BitsetKind,
    visitor: &mut dyn DamageVisitor,
) -> Result<ErrorState> {
    let mut checker = BitsetChecker {
        kind,
        visitor,
        err: ErrorState::NoError,
    };
    BitsetWalker::new(tm, nr_bits).walk(root, &mut checker)?;
    Ok(checker.err)
}

struct BitsetChecker<'a> {
    kind: BitsetKind,
    visitor: &'a mut dyn DamageVisitor,
    err: ErrorState,
}

impl BitsetVisitor for BitsetChecker<'_> {
    fn visit_bit(&mut self, _index: u64, _value: bool) -> Result<()> {
        Ok(())
    }

    fn visit_missing(&mut self, indices: Range<u64>) {
        self.err = self.err.combine(ErrorState::Fatal);
        self.visitor.visit(Damage::MissingBits {
            kind: self.kind,
            indices,
        });
    }
}

/// True when the head of the file is an XML prolog, allowing for an
/// optional UTF-8 BOM and leading whitespace.
fn looks_like_xml(path: &Path) -> Result<bool> {
    let mut head = [0_u8; 64];
    let mut file = File::open(path)?;
    let n = file.read(&mut head)?;
    let mut text = &head[..n];
    if let Some(stripped) = text.strip_prefix(&[0xEF, 0xBB, 0xBF]) {
        text = stripped;
    }
    while let Some((first, rest)) = text.split_first() {
        if first.is_ascii_whitespace() {
            text = rest;
        } else {
            break;
        }
    }
    Ok(text.starts_with(b"<?xml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn classify(contents: &[u8]) -> bool {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(contents).unwrap();
        tmp.flush().unwrap();
        looks_like_xml(tmp.path()).unwrap()
    }

    #[test]
    fn xml_prolog_is_detected() {
        assert!(classify(b"<?xml version=\"1.0\"?>\n"));
        assert!(classify(b"  \n<?xml version=\"1.0\"?>"));
        assert!(classify(b"\xEF\xBB\xBF<?xml"));
    }

    #[test]
    fn binary_and_empty_inputs_are_not_xml() {
        assert!(!classify(b""));
        assert!(!classify(b"\x00\x01\x02"));
        assert!(!classify(b"<html>"));
    }

    #[test]
    fn default_options_check_everything() {
        let opts = CheckOptions::default();
        assert!(opts.check_mappings && opts.check_hints && opts.check_discards);
        assert!(!opts.skip_nonfatal && !opts.quiet && !opts.clear_needs_check_on_success);
    }

    #[test]
    fn report_success_policy() {
        let mut report = CheckReport {
            classification: PathClassification::Metadata,
            error_state: ErrorState::NonFatal,
            needs_check_set: false,
            cleared_needs_check: false,
        };
        assert!(!report.success(false));
        assert!(report.success(true));
        report.error_state = ErrorState::Fatal;
        assert!(!report.success(true));
    }
}
