//! Per-frame lock table.
//!
//! File-per-frame sequences keep a decoder handle open across several
//! partial reads of the same frame, and the decoders are not reentrant
//! across handles for those operations. One mutex per frame index makes
//! that reuse safe: two workers targeting the same index serialize, workers
//! on distinct indices proceed in parallel.

use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use crate::error::{CallistoError, Result};

/// Lazily allocated table of one lock per frame index.
pub struct FrameLocks {
    count: usize,
    slots: OnceLock<Box<[Mutex<()>]>>,
}

impl FrameLocks {
    /// A table for `count` frames. No locks are allocated until the first
    /// `open_for_reuse`.
    pub fn new(count: usize) -> Self {
        Self {
            count,
            slots: OnceLock::new(),
        }
    }

    pub fn frame_count(&self) -> usize {
        self.count
    }

    /// Whether the table has been materialized by a first open.
    pub fn is_allocated(&self) -> bool {
        self.slots.get().is_some()
    }

    /// Bracket a held-open frame handle: the returned guard serializes all
    /// access to `index` until it is dropped.
    pub fn open_for_reuse(&self, index: usize) -> Result<FrameLock<'_>> {
        if index >= self.count {
            return Err(CallistoError::FrameIndexOutOfRange {
                index,
                total: self.count,
            });
        }
        let slots = self
            .slots
            .get_or_init(|| (0..self.count).map(|_| Mutex::new(())).collect());
        let guard = slots[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(FrameLock {
            index,
            _guard: guard,
        })
    }
}

/// Exclusive access to one frame index; dropping it closes the bracket.
pub struct FrameLock<'a> {
    index: usize,
    _guard: MutexGuard<'a, ()>,
}

impl FrameLock<'_> {
    pub fn index(&self) -> usize {
        self.index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_is_lazy() {
        let locks = FrameLocks::new(4);
        assert!(!locks.is_allocated());
        let guard = locks.open_for_reuse(2).unwrap();
        assert!(locks.is_allocated());
        assert_eq!(guard.index(), 2);
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let locks = FrameLocks::new(2);
        assert!(locks.open_for_reuse(2).is_err());
    }

    #[test]
    fn distinct_indices_do_not_block() {
        let locks = FrameLocks::new(3);
        let a = locks.open_for_reuse(0).unwrap();
        let b = locks.open_for_reuse(1).unwrap();
        drop(a);
        drop(b);
    }
}
