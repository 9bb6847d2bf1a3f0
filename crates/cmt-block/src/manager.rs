//! Cached, reference-counted block locking with ordered superblock commit.
//!
//! The manager owns the I/O backend and a bounded cache of recently used
//! blocks. External code only ever sees a block through a scoped
//! [`ReadRef`] or [`WriteRef`]; dropping the reference releases the lock.
//! The fallible superblock protocol is the explicit [`WriteRef::commit`],
//! which flushes every other dirty block, issues a barrier, and writes the
//! superblock last.

use crate::{AlignedBlock, BlockIo, Validator};
use cmt_error::{MetaError, Result};
use cmt_types::BlockAddress;
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, trace, warn};

pub const DEFAULT_CACHE_CAPACITY: usize = 256;

/// Role of a block in the commit protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Normal,
    Superblock,
}

struct CacheEntry {
    data: Arc<AlignedBlock>,
    kind: BlockKind,
    dirty: bool,
    validator: Arc<dyn Validator>,
}

enum LockState {
    Read(u32),
    Write,
}

#[derive(Default)]
struct BmState {
    cache: HashMap<u64, CacheEntry>,
    lru: VecDeque<u64>,
    locks: HashMap<u64, LockState>,
}

impl BmState {
    fn touch(&mut self, location: u64) {
        if let Some(pos) = self.lru.iter().position(|&l| l == location) {
            let _ = self.lru.remove(pos);
        }
        self.lru.push_back(location);
    }
}

/// Caching block manager enforcing the lock invariants:
/// a location holds either no lock, N shared read locks, or one write lock.
/// Conflicting acquisitions fail immediately.
pub struct BlockManager {
    io: Box<dyn BlockIo>,
    state: Mutex<BmState>,
    capacity: usize,
}

impl BlockManager {
    #[must_use]
    pub fn new(io: Box<dyn BlockIo>, capacity: usize) -> Self {
        Self {
            io,
            state: Mutex::new(BmState::default()),
            capacity: capacity.max(1),
        }
    }

    #[must_use]
    pub fn nr_blocks(&self) -> u64 {
        self.io.nr_blocks()
    }

    /// Acquire a shared lock. Fails if a write lock is held, or if the
    /// block fails its validator on first load (no lock is granted then).
    pub fn read_lock(
        &self,
        location: BlockAddress,
        validator: Arc<dyn Validator>,
    ) -> Result<ReadRef<'_>> {
        let mut state = self.state.lock();
        if matches!(state.locks.get(&location.0), Some(LockState::Write)) {
            return Err(MetaError::LockViolation {
                block: location,
                detail: "write lock held",
            });
        }
        self.ensure_cached(&mut state, location, &validator)?;
        match state.locks.entry(location.0) {
            Entry::Occupied(mut held) => {
                if let LockState::Read(n) = held.get_mut() {
                    *n += 1;
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(LockState::Read(1));
            }
        }
        let data = state
            .cache
            .get(&location.0)
            .map(|entry| Arc::clone(&entry.data))
            .ok_or_else(|| MetaError::Invalid(format!("block {location} missing from cache")))?;
        Ok(ReadRef {
            bm: self,
            location,
            data,
        })
    }

    /// Acquire an exclusive lock, loading and validating the block first.
    pub fn write_lock(
        &self,
        location: BlockAddress,
        validator: Arc<dyn Validator>,
    ) -> Result<WriteRef<'_>> {
        self.write_lock_impl(location, validator, BlockKind::Normal, false)
    }

    /// Exclusive lock over a zeroed buffer; the previous contents are
    /// neither read nor validated. For callers overwriting the whole block.
    pub fn write_lock_zero(
        &self,
        location: BlockAddress,
        validator: Arc<dyn Validator>,
    ) -> Result<WriteRef<'_>> {
        self.write_lock_impl(location, validator, BlockKind::Normal, true)
    }

    /// Exclusive lock on a superblock-kind block; committing the returned
    /// reference runs the ordered flush protocol.
    pub fn superblock(
        &self,
        location: BlockAddress,
        validator: Arc<dyn Validator>,
    ) -> Result<WriteRef<'_>> {
        self.write_lock_impl(location, validator, BlockKind::Superblock, false)
    }

    pub fn superblock_zero(
        &self,
        location: BlockAddress,
        validator: Arc<dyn Validator>,
    ) -> Result<WriteRef<'_>> {
        self.write_lock_impl(location, validator, BlockKind::Superblock, true)
    }

    /// Write back every dirty non-superblock block, then sync.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.flush_normal(&mut state)?;
        self.io.sync()
    }

    fn write_lock_impl(
        &self,
        location: BlockAddress,
        validator: Arc<dyn Validator>,
        kind: BlockKind,
        zero: bool,
    ) -> Result<WriteRef<'_>> {
        if location.0 >= self.io.nr_blocks() {
            return Err(MetaError::OutOfRange {
                location,
                nr_blocks: self.io.nr_blocks(),
            });
        }
        let mut state = self.state.lock();
        if state.locks.contains_key(&location.0) {
            return Err(MetaError::LockViolation {
                block: location,
                detail: "lock already held",
            });
        }
        if zero {
            if !state.cache.contains_key(&location.0) {
                self.make_room(&mut state)?;
            }
            state.cache.insert(
                location.0,
                CacheEntry {
                    data: Arc::new(AlignedBlock::zeroed()),
                    kind,
                    dirty: false,
                    validator: Arc::clone(&validator),
                },
            );
            state.touch(location.0);
        } else {
            self.ensure_cached(&mut state, location, &validator)?;
            if let Some(entry) = state.cache.get_mut(&location.0) {
                entry.kind = kind;
                entry.validator = Arc::clone(&validator);
            }
        }
        let data = state
            .cache
            .get(&location.0)
            .map(|entry| entry.data.as_ref().clone())
            .ok_or_else(|| MetaError::Invalid(format!("block {location} missing from cache")))?;
        state.locks.insert(location.0, LockState::Write);
        Ok(WriteRef {
            bm: self,
            location,
            kind,
            data: Some(data),
        })
    }

    fn ensure_cached(
        &self,
        state: &mut BmState,
        location: BlockAddress,
        validator: &Arc<dyn Validator>,
    ) -> Result<()> {
        if state.cache.contains_key(&location.0) {
            state.touch(location.0);
            return Ok(());
        }
        let mut block = AlignedBlock::zeroed();
        self.io.read_block(location, block.as_mut_slice())?;
        validator.check(block.as_slice(), location)?;
        self.make_room(state)?;
        state.cache.insert(
            location.0,
            CacheEntry {
                data: Arc::new(block),
                kind: BlockKind::Normal,
                dirty: false,
                validator: Arc::clone(validator),
            },
        );
        state.lru.push_back(location.0);
        trace!(target: "cmt::block::cache", event = "load", block = location.0);
        Ok(())
    }

    /// Evict unlocked entries until the cache is under capacity. Dirty
    /// victims are written back first; dirty superblocks are never
    /// evicted (they must be the last write the device sees).
    fn make_room(&self, state: &mut BmState) -> Result<()> {
        while state.cache.len() >= self.capacity {
            let candidate = state.lru.iter().copied().find(|loc| {
                !state.locks.contains_key(loc)
                    && state
                        .cache
                        .get(loc)
                        .is_some_and(|e| !(e.dirty && e.kind == BlockKind::Superblock))
            });
            let Some(victim) = candidate else {
                // Everything is pinned; let the cache grow past its bound.
                trace!(
                    target: "cmt::block::cache",
                    event = "overcommit",
                    cached = state.cache.len()
                );
                return Ok(());
            };
            if let Some(entry) = state.cache.get_mut(&victim) {
                if entry.dirty {
                    let mut block = entry.data.as_ref().clone();
                    entry
                        .validator
                        .prepare(block.as_mut_slice(), BlockAddress(victim));
                    self.io.write_block(BlockAddress(victim), block.as_slice())?;
                    trace!(target: "cmt::block::cache", event = "evict_writeback", block = victim);
                }
            }
            state.cache.remove(&victim);
            if let Some(pos) = state.lru.iter().position(|&l| l == victim) {
                let _ = state.lru.remove(pos);
            }
        }
        Ok(())
    }

    fn flush_normal(&self, state: &mut BmState) -> Result<()> {
        let dirty: Vec<u64> = state
            .cache
            .iter()
            .filter(|(_, e)| e.dirty && e.kind == BlockKind::Normal)
            .map(|(&loc, _)| loc)
            .collect();
        for loc in dirty {
            if let Some(entry) = state.cache.get_mut(&loc) {
                let mut block = entry.data.as_ref().clone();
                entry.validator.prepare(block.as_mut_slice(), BlockAddress(loc));
                self.io.write_block(BlockAddress(loc), block.as_slice())?;
                entry.data = Arc::new(block);
                entry.dirty = false;
            }
        }
        Ok(())
    }

    fn release_read(&self, location: BlockAddress) {
        let mut state = self.state.lock();
        match state.locks.entry(location.0) {
            Entry::Occupied(mut held) => match held.get_mut() {
                LockState::Read(n) if *n > 1 => *n -= 1,
                _ => {
                    held.remove();
                }
            },
            Entry::Vacant(_) => {}
        }
    }

    fn clone_read(&self, location: BlockAddress) {
        let mut state = self.state.lock();
        if let Some(LockState::Read(n)) = state.locks.get_mut(&location.0) {
            *n += 1;
        }
    }

    /// Store modified data back into the cache and drop the write lock.
    /// No I/O happens here; the data reaches the device on flush,
    /// eviction, or superblock commit.
    fn release_write(&self, location: BlockAddress, data: AlignedBlock, kind: BlockKind) {
        let mut state = self.state.lock();
        if let Some(entry) = state.cache.get_mut(&location.0) {
            entry.data = Arc::new(data);
            entry.dirty = true;
            entry.kind = kind;
        }
        state.locks.remove(&location.0);
        if kind == BlockKind::Superblock {
            warn!(
                target: "cmt::block",
                event = "superblock_dropped_uncommitted",
                block = location.0
            );
        }
    }

    fn commit_write(&self, location: BlockAddress, data: AlignedBlock, kind: BlockKind) -> Result<()> {
        match kind {
            BlockKind::Normal => {
                let mut state = self.state.lock();
                if let Some(entry) = state.cache.get_mut(&location.0) {
                    entry.data = Arc::new(data);
                    entry.dirty = true;
                }
                state.locks.remove(&location.0);
                Ok(())
            }
            BlockKind::Superblock => self.commit_superblock(location, data),
        }
    }

    /// The two-phase commit: releasing a superblock with intent to commit
    /// must be the only outstanding lock; every other dirty block is
    /// written and synced before the superblock itself goes out.
    fn commit_superblock(&self, location: BlockAddress, data: AlignedBlock) -> Result<()> {
        let mut state = self.state.lock();
        state.locks.remove(&location.0);
        let held = state.locks.len();
        if held > 0 {
            if let Some(entry) = state.cache.get_mut(&location.0) {
                entry.data = Arc::new(data);
                entry.dirty = true;
                entry.kind = BlockKind::Superblock;
            }
            return Err(MetaError::SuperblockUnlockedEarly { held });
        }

        self.flush_normal(&mut state)?;
        self.io.sync()?;

        let Some(entry) = state.cache.get_mut(&location.0) else {
            return Err(MetaError::Invalid(format!(
                "superblock {location} missing from cache"
            )));
        };
        let mut block = data;
        entry.validator.prepare(block.as_mut_slice(), location);
        self.io.write_block(location, block.as_slice())?;
        self.io.sync()?;
        entry.data = Arc::new(block);
        entry.dirty = false;
        entry.kind = BlockKind::Superblock;
        debug!(target: "cmt::block", event = "superblock_commit", block = location.0);
        Ok(())
    }
}

/// Shared lock on one block. Cheap to clone; the lock is released when the
/// last copy is dropped.
pub struct ReadRef<'a> {
    bm: &'a BlockManager,
    location: BlockAddress,
    data: Arc<AlignedBlock>,
}

impl ReadRef<'_> {
    #[must_use]
    pub fn location(&self) -> BlockAddress {
        self.location
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.data.as_slice()
    }
}

impl Clone for ReadRef<'_> {
    fn clone(&self) -> Self {
        self.bm.clone_read(self.location);
        Self {
            bm: self.bm,
            location: self.location,
            data: Arc::clone(&self.data),
        }
    }
}

impl Drop for ReadRef<'_> {
    fn drop(&mut self) {
        self.bm.release_read(self.location);
    }
}

/// Exclusive lock on one block with an owned working buffer.
///
/// Dropping the reference stores the buffer back as dirty cache data and
/// releases the lock; no I/O happens on drop. [`WriteRef::commit`] is the
/// fallible release: for superblock-kind references it runs the ordered
/// flush protocol.
pub struct WriteRef<'a> {
    bm: &'a BlockManager,
    location: BlockAddress,
    kind: BlockKind,
    data: Option<AlignedBlock>,
}

impl WriteRef<'_> {
    #[must_use]
    pub fn location(&self) -> BlockAddress {
        self.location
    }

    #[must_use]
    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        match &self.data {
            Some(block) => block.as_slice(),
            None => &[],
        }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        match &mut self.data {
            Some(block) => block.as_mut_slice(),
            None => &mut [],
        }
    }

    /// Release with intent to commit. For normal blocks this is the same
    /// as dropping; for the superblock it fails with
    /// `SuperblockUnlockedEarly` if any other lock is still held, then
    /// flushes all dirty blocks, syncs, and writes the superblock last.
    pub fn commit(mut self) -> Result<()> {
        let Some(data) = self.data.take() else {
            return Ok(());
        };
        self.bm.commit_write(self.location, data, self.kind)
    }
}

impl Drop for WriteRef<'_> {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            self.bm.release_write(self.location, data, self.kind);
        }
    }
}
