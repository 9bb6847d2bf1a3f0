//! Copy-on-write transactions over the block manager.
//!
//! `shadow` turns "write lock with intent to modify" into either an
//! in-place lock (the block is only referenced once, or was already
//! shadowed in this transaction) or a fresh copy with adjusted reference
//! counts. The read-only checker uses only `read_lock` from this layer,
//! plus the space map for double-claim detection.

use crate::space_map::CoreSpaceMap;
use cmt_block::{BlockManager, ReadRef, Validator, WriteRef};
use cmt_error::{MetaError, Result};
use cmt_types::BlockAddress;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::trace;

pub struct TransactionManager {
    bm: Arc<BlockManager>,
    sm: Mutex<CoreSpaceMap>,
    /// Blocks already shadowed in this transaction; re-shadowing them is
    /// in-place.
    shadows: Mutex<HashSet<u64>>,
}

impl TransactionManager {
    #[must_use]
    pub fn new(bm: Arc<BlockManager>, sm: CoreSpaceMap) -> Self {
        Self {
            bm,
            sm: Mutex::new(sm),
            shadows: Mutex::new(HashSet::new()),
        }
    }

    #[must_use]
    pub fn bm(&self) -> &Arc<BlockManager> {
        &self.bm
    }

    /// Run `f` against the space map. The checker uses this to mark and
    /// query visited blocks.
    pub fn with_space_map<R>(&self, f: impl FnOnce(&mut CoreSpaceMap) -> R) -> R {
        f(&mut self.sm.lock())
    }

    pub fn read_lock(
        &self,
        b: BlockAddress,
        validator: Arc<dyn Validator>,
    ) -> Result<ReadRef<'_>> {
        self.bm.read_lock(b, validator)
    }

    /// Write-lock `b` for modification under copy-on-write rules.
    ///
    /// Returns the reference plus `true` when the contents moved to a new
    /// location; the caller must then use `ref.location()` as the new
    /// child/root pointer.
    pub fn shadow(
        &self,
        b: BlockAddress,
        validator: Arc<dyn Validator>,
    ) -> Result<(WriteRef<'_>, bool)> {
        {
            let shadows = self.shadows.lock();
            if shadows.contains(&b.0) {
                return Ok((self.bm.write_lock(b, validator)?, false));
            }
        }

        let count = self.sm.lock().get(b);
        if count == 1 {
            self.shadows.lock().insert(b.0);
            return Ok((self.bm.write_lock(b, validator)?, false));
        }

        // Shared block: copy to a fresh location and move one reference.
        let new = self
            .sm
            .lock()
            .new_block()
            .ok_or(MetaError::NoSpace)?;
        let old = self.bm.read_lock(b, Arc::clone(&validator))?;
        let mut shadow = self.bm.write_lock_zero(new, validator)?;
        shadow.data_mut().copy_from_slice(old.data());
        drop(old);
        self.sm.lock().dec(b);
        self.shadows.lock().insert(new.0);
        trace!(target: "cmt::pdata::tm", event = "shadow", from = b.0, to = new.0);
        Ok((shadow, true))
    }

    /// Allocate a zeroed block with reference count one.
    pub fn new_block(&self, validator: Arc<dyn Validator>) -> Result<WriteRef<'_>> {
        let b = self
            .sm
            .lock()
            .new_block()
            .ok_or(MetaError::NoSpace)?;
        self.shadows.lock().insert(b.0);
        self.bm.write_lock_zero(b, validator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmt_block::{BlockIo, NoopValidator};
    use cmt_types::MD_BLOCK_SIZE;

    struct MemIo {
        blocks: Mutex<Vec<Vec<u8>>>,
    }

    impl MemIo {
        fn new(n: usize) -> Self {
            Self {
                blocks: Mutex::new(vec![vec![0_u8; MD_BLOCK_SIZE]; n]),
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

    fn tm(nr_blocks: usize) -> TransactionManager {
        let bm = Arc::new(BlockManager::new(Box::new(MemIo::new(nr_blocks)), 16));
        TransactionManager::new(bm, CoreSpaceMap::new(nr_blocks as u64))
    }

    fn noop() -> Arc<dyn Validator> {
        Arc::new(NoopValidator)
    }

    #[test]
    fn shadow_of_exclusive_block_is_in_place() {
        let tm = tm(8);
        tm.with_space_map(|sm| sm.set(BlockAddress(3), 1));
        let (w, moved) = tm.shadow(BlockAddress(3), noop()).unwrap();
        assert!(!moved);
        assert_eq!(w.location(), BlockAddress(3));
    }

    #[test]
    fn shadow_of_shared_block_copies_and_moves_a_reference() {
        let tm = tm(8);
        // Write recognisable contents to block 2, then share it.
        {
            let mut w = tm.bm().write_lock_zero(BlockAddress(2), noop()).unwrap();
            w.data_mut()[0] = 0x77;
        }
        tm.with_space_map(|sm| sm.set(BlockAddress(2), 2));

        let (w, moved) = tm.shadow(BlockAddress(2), noop()).unwrap();
        assert!(moved);
        assert_ne!(w.location(), BlockAddress(2));
        assert_eq!(w.data()[0], 0x77);

        let new = w.location();
        drop(w);
        assert_eq!(tm.with_space_map(|sm| sm.get(BlockAddress(2))), 1);
        assert_eq!(tm.with_space_map(|sm| sm.get(new)), 1);
    }

    #[test]
    fn reshadowing_within_a_transaction_stays_in_place() {
        let tm = tm(8);
        tm.with_space_map(|sm| sm.set(BlockAddress(2), 2));
        let (w, moved) = tm.shadow(BlockAddress(2), noop()).unwrap();
        assert!(moved);
        let new = w.location();
        drop(w);

        let (w2, moved2) = tm.shadow(new, noop()).unwrap();
        assert!(!moved2);
        assert_eq!(w2.location(), new);
    }

    #[test]
    fn new_block_allocates_zeroed_with_count_one() {
        let tm = tm(4);
        let w = tm.new_block(noop()).unwrap();
        assert!(w.data().iter().all(|&b| b == 0));
        let loc = w.location();
        drop(w);
        assert_eq!(tm.with_space_map(|sm| sm.get(loc)), 1);
    }

    #[test]
    fn exhausted_space_map_reports_no_space() {
        let tm = tm(2);
        tm.with_space_map(|sm| {
            sm.set(BlockAddress(0), 1);
            sm.set(BlockAddress(1), 1);
        });
        assert!(matches!(tm.new_block(noop()), Err(MetaError::NoSpace)));
    }
}
