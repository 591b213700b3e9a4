//! How much is left
//!
//! Everything here reads the page table without any synchronization beyond
//! the individual atomic loads, so results are estimates: allocations and
//! frees running concurrently may or may not be reflected.

use std::{cmp, sync::atomic::Ordering};

use crate::{
    arena::PageGeometry,
    config::{HeapConfig, MIN_CHUNK_SIZE},
    heap::ScatterHeap,
    util::divroundup,
};

/// Point-in-time page table summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapStats {
    pub pages: u32,
    pub regions: u32,
    /// Pages formatted for chunks
    pub chunk_pages: u32,
    /// Pages belonging to page-based allocations
    pub page_based_pages: u32,
    /// Sum of the chunk counts of all chunk pages
    pub chunks_in_use: u32,
}

impl<'arena, C: HeapConfig> ScatterHeap<'arena, C> {
    /// Free chunks on `page` if it is (or were) formatted for `chunksize`
    pub fn count_free_chunks_in_page(&self, page: u32, chunksize: u32) -> u32 {
        let capacity = PageGeometry::for_chunksize::<C>(chunksize).capacity();
        // a page being reset has a count far above its capacity
        capacity.saturating_sub(self.pte(page).count.load(Ordering::Relaxed))
    }

    /// Number of `slot`-byte allocations that would currently succeed,
    /// counting only the pages `gid, gid + stride, ...`
    ///
    /// Summing this over `gid` in `0..stride` gives the estimate for the
    /// whole heap. Slots of a page or more are counted by `gid == 0` alone
    /// since runs of pages cannot be split between workers.
    pub fn estimate_available_slots_strided(&self, slot: usize, gid: usize, stride: usize) -> usize {
        debug_assert!(stride > 0 && gid < stride);
        let Some(slot) = Self::pad_request(slot) else {
            return 0;
        };
        if slot >= C::PAGESIZE {
            return if gid == 0 {
                self.count_free_page_runs(slot)
            } else {
                0
            };
        }

        let slot = cmp::max(slot, MIN_CHUNK_SIZE);
        let maxchunksize = cmp::min(C::PAGESIZE - 1, slot.saturating_mul(C::WASTEFACTOR));
        let mut slots = 0;
        for page in (gid..self.num_pages() as usize).step_by(stride) {
            let page = page as u32;
            let chunksize = self.pte(page).chunksize.load(Ordering::Relaxed);
            if chunksize == 0 {
                slots += PageGeometry::for_chunksize::<C>(slot).capacity() as usize;
            } else if chunksize >= slot && chunksize <= maxchunksize {
                slots += self.count_free_chunks_in_page(page, chunksize) as usize;
            }
        }
        slots
    }

    /// Disjoint runs of unformatted pages large enough for `bytes`
    fn count_free_page_runs(&self, bytes: u32) -> usize {
        let pages = divroundup(bytes as usize, C::PAGESIZE as usize) as u32;
        let mut runs = 0;
        let mut free = 0;
        for page in (0..self.num_pages()).rev() {
            if self.pte(page).chunksize.load(Ordering::Relaxed) == 0 {
                free += 1;
                if free == pages {
                    runs += 1;
                    free = 0;
                }
            } else {
                free = 0;
            }
        }
        runs
    }

    /// Free bytes on the pages `gid, gid + stride, ...`
    ///
    /// Unformatted pages count fully, chunk pages count their free chunks.
    pub fn estimate_available_bytes_strided(&self, gid: usize, stride: usize) -> usize {
        debug_assert!(stride > 0 && gid < stride);
        let mut bytes = 0;
        for page in (gid..self.num_pages() as usize).step_by(stride) {
            let page = page as u32;
            let chunksize = self.pte(page).chunksize.load(Ordering::Relaxed);
            if chunksize == 0 {
                bytes += C::PAGESIZE as usize;
            } else if chunksize < C::PAGESIZE {
                bytes += self.count_free_chunks_in_page(page, chunksize) as usize
                    * chunksize as usize;
            }
        }
        bytes
    }

    /// Run a strided scan on [HeapConfig::SCAN_WORKERS] threads and add up
    fn fan_out<F>(&self, scan: F) -> usize
    where
        F: Fn(&Self, usize, usize) -> usize + Sync,
    {
        let workers = C::SCAN_WORKERS;
        if workers == 1 || (self.num_pages() as usize) < workers {
            return scan(self, 0, 1);
        }
        std::thread::scope(|s| {
            let handles: Vec<_> = (0..workers)
                .map(|gid| {
                    let scan = &scan;
                    s.spawn(move || scan(self, gid, workers))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| match h.join() {
                    Ok(x) => x,
                    Err(e) => std::panic::resume_unwind(e),
                })
                .sum()
        })
    }

    /// Number of `slot`-byte allocations that would currently succeed
    pub fn estimate_available_slots(&self, slot: usize) -> usize {
        self.fan_out(|heap, gid, stride| heap.estimate_available_slots_strided(slot, gid, stride))
    }

    /// Free bytes in the heap
    pub fn estimate_available_bytes(&self) -> usize {
        self.fan_out(|heap, gid, stride| heap.estimate_available_bytes_strided(gid, stride))
    }

    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            pages: self.num_pages(),
            regions: self.num_regions(),
            ..Default::default()
        };
        for page in 0..self.num_pages() {
            let pte = self.pte(page);
            match pte.chunksize.load(Ordering::Relaxed) {
                0 => {}
                cs if cs < C::PAGESIZE => {
                    stats.chunk_pages += 1;
                    stats.chunks_in_use += pte.count.load(Ordering::Relaxed);
                }
                _ => stats.page_based_pages += 1,
            }
        }
        stats
    }
}
