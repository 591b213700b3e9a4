//! Allocations of a page or more
//!
//! A large allocation takes a run of consecutive unformatted pages and
//! stores the request size in the `chunksize` of every page of the run.
//! Searching for a run is a linear scan, so it is done under one heap-wide
//! spin lock. Chunk searches never take the lock; both sides only ever move
//! a page out of the unformatted state by CAS, so a page claimed by a chunk
//! search in the middle of a candidate run simply makes the run fail.

use std::{fmt::Debug, ptr::NonNull, sync::atomic::Ordering};

use crate::{config::HeapConfig, loom_testing::*, util::divroundup};

use super::ScatterHeap;

/// Tight exchange-based spin lock
pub(crate) struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    pub(crate) fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    pub(crate) fn lock(&self) -> SpinLockGuard<'_> {
        // order: acquire pairs with the release in the guard's drop
        while self.locked.swap(true, Ordering::Acquire) {
            while self.locked.load(Ordering::Relaxed) {
                spin_hint();
            }
        }
        SpinLockGuard(self)
    }
}

impl Debug for SpinLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpinLock")
            .field("locked", &self.locked.load(Ordering::Relaxed))
            .finish()
    }
}

pub(crate) struct SpinLockGuard<'lock>(&'lock SpinLock);

impl<'lock> Drop for SpinLockGuard<'lock> {
    fn drop(&mut self) {
        self.0.locked.store(false, Ordering::Release);
    }
}

impl<'arena, C: HeapConfig> ScatterHeap<'arena, C> {
    pub(super) fn alloc_page_based(&self, bytes: u32) -> Option<NonNull<u8>> {
        let num_pages = self.layout.num_pages;
        if num_pages == 0 {
            return None;
        }
        let pages = divroundup(bytes as usize, C::PAGESIZE as usize) as u32;
        if pages > num_pages {
            return None;
        }

        let _guard = self.page_based_lock.lock();
        let hint = self.first_free_page_based.load(Ordering::Relaxed);
        let hint = if hint >= num_pages { num_pages - 1 } else { hint };

        // runs ending at or below the hint, then runs ending above it
        let start = self
            .claim_run_below(hint + 1, 0, pages, bytes)
            .or_else(|| {
                self.claim_run_below(num_pages, (hint + 1).saturating_sub(pages - 1), pages, bytes)
            });

        let Some(start) = start else {
            tracing::trace!(bytes, pages, "page-based search exhausted");
            return None;
        };
        self.first_free_page_based
            .fetch_min(start.saturating_sub(1), Ordering::Relaxed);
        NonNull::new(self.layout.page_ptr::<C>(start))
    }

    /// Scan pages `end - 1` down to `stop` for `pages` consecutive
    /// unformatted pages and claim them, returning the first page
    fn claim_run_below(&self, end: u32, stop: u32, pages: u32, bytes: u32) -> Option<u32> {
        let mut free = 0;
        let mut search = end;
        while search > stop {
            search -= 1;
            if self.pte(search).chunksize.load(Ordering::Relaxed) != 0 {
                free = 0;
                continue;
            }
            free += 1;
            if free < pages {
                continue;
            }
            if self.claim_run(search, pages, bytes) {
                return Some(search);
            }
            free = 0;
        }
        None
    }

    /// Claim `pages` pages from `start` for a request of `bytes`, or none of them
    fn claim_run(&self, start: u32, pages: u32, bytes: u32) -> bool {
        for page in start..start + pages {
            if self
                .pte(page)
                .chunksize
                .compare_exchange(0, bytes, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                // lost against a chunk search, undo what we have
                for undo in start..page {
                    let _ = self.pte(undo).chunksize.compare_exchange(
                        bytes,
                        0,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    );
                }
                tracing::trace!(start, page, "page run claim lost a race");
                return false;
            }
        }
        true
    }

    /// # Safety
    ///
    /// `page` must be the first page of a live page-based allocation of `bytes`
    pub(super) unsafe fn dealloc_page_based(&self, page: u32, bytes: u32) {
        let pages = divroundup(bytes as usize, C::PAGESIZE as usize) as u32;
        debug_assert!(page + pages <= self.layout.num_pages);

        // whatever was written there must not look like bitmaps
        // to whoever formats these pages next
        for p in page..page + pages {
            self.layout.clear_tail::<C>(p);
        }
        fence(Ordering::Release);
        for p in page..page + pages {
            let res = self.pte(p).chunksize.compare_exchange(
                bytes,
                0,
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
            debug_assert!(res.is_ok(), "page {} is not part of this allocation", p);
        }

        for region in page / C::REGIONSIZE..=(page + pages - 1) / C::REGIONSIZE {
            self.region(region).store(0, Ordering::Relaxed);
        }
        self.first_free_page_based
            .fetch_max(page + pages - 1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(loom))]
    #[test]
    fn spinlock_excludes() {
        let lock = SpinLock::new();
        let counter = AtomicU32::new(0);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        let _guard = lock.lock();
                        let x = counter.load(Ordering::Relaxed);
                        counter.store(x + 1, Ordering::Relaxed);
                    }
                });
            }
        });
        assert_eq!(counter.load(Ordering::Relaxed), 4000);
        assert!(!lock.locked.load(Ordering::Relaxed));
    }

    #[cfg(loom)]
    #[test]
    fn spinlock_loom_excludes() {
        loom::model(|| {
            let lock = &*Box::leak(Box::new(SpinLock::new()));
            let counter = &*Box::leak(Box::new(AtomicU32::new(0)));

            let threads: Vec<_> = (0..2)
                .map(|_| {
                    loom::thread::spawn(move || {
                        let _guard = lock.lock();
                        let x = counter.load(Ordering::Relaxed);
                        counter.store(x + 1, Ordering::Relaxed);
                    })
                })
                .collect();
            for t in threads {
                t.join().unwrap();
            }
            assert_eq!(counter.load(Ordering::Relaxed), 2);
        })
    }
}
