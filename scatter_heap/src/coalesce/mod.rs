//! Merging the small requests of a lock-step group into one allocation
//!
//! All members of a group call [ScatterHeap::allocate_grouped] together.
//! When more than one of them asks for a small amount, they reserve
//! consecutive ranges of one block, and only one of them (the leader, who
//! reserved the range right after the header) goes to the heap:
//!
//! ```text
//! +-- chunk ---------------------------------------------+
//! | count | lane 3 (32) | lane 0 (16) | lane 7 (48) | ... |
//! +------------------------------------------------------+
//! ^ header ^ leader
//! ```
//!
//! The header counts the members still using the block. Freeing any of the
//! pointers decrements it, and the last one frees the chunk.
//!
//! Members that do not take part (large or empty requests, or everybody
//! when only one member has a small request) allocate on their own.
//! Requests of a page or more take turns so that at most one member of the
//! group is ever waiting on the page-based lock.

use std::{
    ptr::{self, NonNull},
    sync::{atomic::Ordering, Barrier},
};

use crate::{
    config::{Derived, HeapConfig, COALESCE_HEADER, GROUP_SIZE},
    heap::ScatterHeap,
    lane::LaneId,
    loom_testing::*,
    util::UsizePtr,
};

/// State shared by the members of one lock-step group
///
/// The same group can be used for any number of rounds of
/// [ScatterHeap::allocate_grouped], each of which all `size` members take
/// part in.
#[derive(Debug)]
pub struct LockstepGroup {
    size: u32,
    barrier: Barrier,
    /// Members with a request small enough to merge
    coalescible: AtomicU32,
    /// Members with a request of a page or more
    large: AtomicU32,
    /// Running total of the merged block
    total: AtomicU32,
    /// Merged block, published by the leader
    base: AtomicPtr<u8>,
}

impl LockstepGroup {
    pub fn new(size: u32) -> Self {
        assert!(size > 0 && size <= GROUP_SIZE, "bad group size {}", size);
        Self {
            size,
            barrier: Barrier::new(size as usize),
            coalescible: AtomicU32::new(0),
            large: AtomicU32::new(0),
            total: AtomicU32::new(COALESCE_HEADER),
            base: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    fn wait(&self) -> bool {
        self.barrier.wait().is_leader()
    }

    /// Back to the initial state for the next round
    fn reset(&self) {
        self.coalescible.store(0, Ordering::Relaxed);
        self.large.store(0, Ordering::Relaxed);
        self.total.store(COALESCE_HEADER, Ordering::Relaxed);
        self.base.store(ptr::null_mut(), Ordering::Relaxed);
    }
}

impl<'arena, C: HeapConfig> ScatterHeap<'arena, C> {
    /// Allocate together with the other members of `group`
    ///
    /// Must be called by all `group.size()` members, each with a distinct
    /// `lane.lane` below the group size. Returns what [allocate](Self::allocate)
    /// would return; pointers into a merged block are returned to the heap
    /// with [deallocate](Self::deallocate) like any other.
    pub fn allocate_grouped(
        &self,
        group: &LockstepGroup,
        lane: LaneId,
        bytes: usize,
    ) -> Option<NonNull<u8>> {
        debug_assert!(lane.lane < group.size());
        let padded = Self::pad_request(bytes);
        let coalescible =
            C::USE_COALESCING && matches!(padded, Some(b) if b < Derived::<C>::COALESCE_LIMIT);
        let large = matches!(padded, Some(b) if b >= C::PAGESIZE);

        // the previous round's reset is done once everybody is here
        group.wait();
        if coalescible {
            group.coalescible.fetch_add(1, Ordering::Relaxed);
        }
        if large {
            group.large.fetch_add(1, Ordering::Relaxed);
        }
        group.wait();
        let merging = group.coalescible.load(Ordering::Relaxed) > 1;
        let any_large = group.large.load(Ordering::Relaxed) > 0;

        let mut result = None;
        if merging {
            let mut offset = None;
            if let (true, Some(b)) = (coalescible, padded) {
                offset = Some(group.total.fetch_add(b, Ordering::AcqRel));
            }
            group.wait();
            if offset == Some(COALESCE_HEADER) {
                let total = group.total.load(Ordering::Acquire);
                let participants = group.coalescible.load(Ordering::Relaxed);
                let block = self.allocate(lane, total as usize);
                if let Some(block) = block {
                    // safety: fresh chunk of at least COALESCE_HEADER bytes
                    unsafe {
                        ptr::write(block.as_ptr() as *mut AtomicU32, AtomicU32::new(participants))
                    };
                }
                tracing::trace!(
                    total,
                    participants,
                    block = ?UsizePtr::from(block),
                    "coalesced group allocation"
                );
                // order: release the header to everybody reading base
                group.base.store(
                    block.map_or(ptr::null_mut(), |b| b.as_ptr()),
                    Ordering::Release,
                );
            }
            group.wait();
            if let Some(offset) = offset {
                let base = group.base.load(Ordering::Acquire);
                // safety: offset is within the block the leader allocated
                result = NonNull::new(base)
                    .map(|b| unsafe { NonNull::new_unchecked(b.as_ptr().add(offset as usize)) });
            }
        }

        if !large && (!coalescible || !merging) {
            result = self.allocate(lane, bytes);
        }
        if any_large {
            for turn in 0..group.size() {
                if large && turn == lane.lane {
                    result = self.allocate(lane, bytes);
                }
                group.wait();
            }
        }

        if group.wait() {
            group.reset();
        }
        result
    }
}
