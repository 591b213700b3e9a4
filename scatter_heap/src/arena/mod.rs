//! Carving a raw buffer into pages, page table entries and region counters
//!
//! ```text
//! +-- buffer -------------------------------------------------------------+
//! | pad | page 0 | page 1 | ... | page n-1 | PTE 0 ... PTE n-1 | regions  |
//! +-----------------------------------------------------------------------+
//!       ^ 16-byte aligned                  ^ 12 bytes each     ^ u32 each
//! ```
//!
//! The number of pages is always a multiple of the region size. Pages are
//! first in the buffer so that the page of any pointer handed out is just
//! `(ptr - pages) / PAGESIZE`.
//!
//! A formatted page keeps its chunks at the front and, for hierarchical
//! chunk sizes, one occupancy word per segment right after the last chunk:
//!
//! ```text
//! +-- page -----------------------------------------------------------+
//! | chunk 0 | chunk 1 | ... | chunk cap-1 | seg words | slack         |
//! +-------------------------------------------------------------------+
//!                                         ^ chunksize * capacity
//! ```

use std::{
    cmp,
    fmt::Debug,
    mem::size_of,
    ptr::{self, NonNull},
    slice,
    sync::atomic::Ordering,
};

use crate::{
    config::{Derived, HeapConfig, DATA_ALIGNMENT, MAX_SEGMENTS},
    loom_testing::*,
};

/// Page table entry: metadata for one page
#[repr(C)]
pub struct Pte {
    /// Chunk size the page is formatted for, 0 if unformatted.
    ///
    /// Pages of a page-based allocation hold the request size
    /// (which is at least a page) instead.
    pub chunksize: AtomicU32,
    /// Number of chunks in use (or reserved by a claim in progress)
    pub count: AtomicU32,
    /// First-level occupancy: one bit per chunk (flat) or one
    /// "segment full" bit per segment (hierarchical)
    pub bitmask: AtomicU32,
}

impl Pte {
    pub fn new() -> Self {
        Self {
            chunksize: AtomicU32::new(0),
            count: AtomicU32::new(0),
            bitmask: AtomicU32::new(0),
        }
    }
}

impl Default for Pte {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for Pte {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pte")
            .field("chunksize", &self.chunksize.load(Ordering::Relaxed))
            .field("count", &self.count.load(Ordering::Relaxed))
            .field(
                "bitmask",
                &format_args!("{:#034b}", self.bitmask.load(Ordering::Relaxed)),
            )
            .finish()
    }
}

/// How a page formatted for a given chunk size is subdivided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageGeometry {
    /// At most 32 chunks, tracked directly by the PTE bitmask
    Flat { chunks: u32 },
    /// Segments of 32 chunks (the last one possibly partial), each tracked
    /// by a word in the page tail
    Hierarchical {
        full_segments: u32,
        additional_chunks: u32,
    },
}

impl PageGeometry {
    /// Geometry for a chunk-formatted page (`0 < chunksize < PAGESIZE`)
    pub fn for_chunksize<C: HeapConfig>(chunksize: u32) -> Self {
        debug_assert!(chunksize > 0 && chunksize < C::PAGESIZE);
        if chunksize <= Derived::<C>::HIERARCHY_THRESHOLD {
            // each segment is 32 chunks plus its occupancy word
            let segmentsize = chunksize * 32 + size_of::<u32>() as u32;
            let full_segments = cmp::min(MAX_SEGMENTS, C::PAGESIZE / segmentsize);
            let additional_chunks = if full_segments == MAX_SEGMENTS {
                0
            } else {
                C::PAGESIZE.saturating_sub(full_segments * segmentsize + size_of::<u32>() as u32)
                    / chunksize
            };
            PageGeometry::Hierarchical {
                full_segments,
                additional_chunks,
            }
        } else {
            PageGeometry::Flat {
                chunks: cmp::min(C::PAGESIZE / chunksize, 32),
            }
        }
    }

    /// Number of chunks the page holds
    pub fn capacity(&self) -> u32 {
        match *self {
            PageGeometry::Flat { chunks } => chunks,
            PageGeometry::Hierarchical {
                full_segments,
                additional_chunks,
            } => full_segments * 32 + additional_chunks,
        }
    }

    /// Number of second-level words (0 for flat pages)
    pub fn segments(&self) -> u32 {
        match *self {
            PageGeometry::Flat { .. } => 0,
            PageGeometry::Hierarchical {
                full_segments,
                additional_chunks,
            } => full_segments + if additional_chunks > 0 { 1 } else { 0 },
        }
    }

    /// Usable bits of the last segment word
    pub fn last_segment_spots(&self) -> u32 {
        match *self {
            PageGeometry::Flat { chunks } => chunks,
            PageGeometry::Hierarchical {
                additional_chunks, ..
            } => {
                if additional_chunks > 0 {
                    additional_chunks
                } else {
                    32
                }
            }
        }
    }
}

/// Result of partitioning a buffer
///
/// This only holds pointers and counts; nothing is valid to access until
/// every index has been initialized by [ArenaLayout::init_strided].
#[derive(Clone, Copy)]
pub struct ArenaLayout {
    pub(crate) pages: NonNull<u8>,
    pub(crate) ptes: NonNull<Pte>,
    pub(crate) regions: NonNull<AtomicU32>,
    pub num_pages: u32,
    pub num_regions: u32,
    /// Size of the buffer as supplied by the caller
    pub memsize: usize,
}

// safety: the layout is only a description. Initialization by several
// workers touches disjoint indices; afterwards everything is atomics
unsafe impl Send for ArenaLayout {}
unsafe impl Sync for ArenaLayout {}

impl Debug for ArenaLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArenaLayout")
            .field("pages", &self.pages)
            .field("ptes", &self.ptes)
            .field("regions", &self.regions)
            .field("num_pages", &self.num_pages)
            .field("num_regions", &self.num_regions)
            .field("memsize", &self.memsize)
            .finish()
    }
}

impl ArenaLayout {
    /// Compute how many regions of pages (plus their metadata) fit
    ///
    /// Emits a warning (and adjusts) if `base` is not 16-byte aligned or if
    /// the alignment padding pushes the metadata past the end of the buffer.
    pub fn compute<C: HeapConfig>(base: NonNull<u8>, memsize: usize) -> Self {
        let per_region = C::REGIONSIZE as usize * (size_of::<Pte>() + C::PAGESIZE as usize)
            + size_of::<AtomicU32>();
        let mut num_regions = memsize / per_region;

        let misalign = base.as_ptr() as usize % DATA_ALIGNMENT as usize;
        let padding = if misalign == 0 {
            0
        } else {
            DATA_ALIGNMENT as usize - misalign
        };
        if padding != 0 {
            tracing::warn!(
                base = ?base,
                padding,
                "heap memory is not 16 byte aligned, skipping leading bytes"
            );
        }

        // the region count above ignored the padding
        if num_regions > 0 && padding + num_regions * per_region > memsize {
            num_regions -= 1;
            tracing::warn!(
                num_regions,
                "needed to reduce number of regions to stay within memory limit"
            );
        }

        // page indices are 32-bit
        let max_regions = (u32::MAX / C::REGIONSIZE) as usize;
        if num_regions > max_regions {
            tracing::warn!(num_regions, max_regions, "heap memory too large, truncating");
            num_regions = max_regions;
        }

        if num_regions == 0 {
            tracing::warn!(memsize, "heap memory too small for a single region");
        }

        let num_pages = num_regions * C::REGIONSIZE as usize;
        // safety: all offsets stay within the buffer, checked above
        let (pages, ptes, regions) = unsafe {
            let pages = base.as_ptr().add(cmp::min(padding, memsize));
            let ptes = pages.add(num_pages * C::PAGESIZE as usize) as *mut Pte;
            let regions = ptes.add(num_pages) as *mut AtomicU32;
            (
                NonNull::new_unchecked(pages),
                NonNull::new_unchecked(ptes),
                NonNull::new_unchecked(regions),
            )
        };

        Self {
            pages,
            ptes,
            regions,
            num_pages: num_pages as u32,
            num_regions: num_regions as u32,
            memsize,
        }
    }

    /// Initialize this worker's share of the metadata
    ///
    /// Worker `worker` of `workers` handles indices `worker, worker + workers, ...`
    ///
    /// # Safety
    ///
    /// The buffer described by this layout must be valid for writes and must
    /// not be in use by a heap. Each worker index may only be run once per
    /// initialization, and all workers must finish before the heap is used.
    pub unsafe fn init_strided<C: HeapConfig>(&self, worker: usize, workers: usize) {
        debug_assert!(workers > 0 && worker < workers);
        for i in (worker..self.num_pages as usize).step_by(workers) {
            ptr::write(self.ptes.as_ptr().add(i), Pte::new());
            let tail = self.page_ptr::<C>(i as u32).add(Self::tail_start::<C>());
            for w in 0..Derived::<C>::TAIL_BYTES as usize / size_of::<u32>() {
                ptr::write((tail as *mut AtomicU32).add(w), AtomicU32::new(0));
            }
        }
        for i in (worker..self.num_regions as usize).step_by(workers) {
            ptr::write(self.regions.as_ptr().add(i), AtomicU32::new(0));
        }
    }

    /// Total number of bytes occupied by pages
    pub fn page_bytes<C: HeapConfig>(&self) -> usize {
        self.num_pages as usize * C::PAGESIZE as usize
    }

    #[inline]
    pub(crate) fn page_ptr<C: HeapConfig>(&self, page: u32) -> *mut u8 {
        debug_assert!(page < self.num_pages);
        // safety: in bounds
        unsafe { self.pages.as_ptr().add(page as usize * C::PAGESIZE as usize) }
    }

    /// Offset within a page where the window possibly holding
    /// hierarchy words starts
    #[inline]
    fn tail_start<C: HeapConfig>() -> usize {
        (C::PAGESIZE - Derived::<C>::TAIL_BYTES) as usize
    }

    /// The words of the page tail window
    ///
    /// # Safety
    ///
    /// `page` must be a page of an initialized arena
    #[inline]
    pub(crate) unsafe fn tail_words<C: HeapConfig>(&self, page: u32) -> &[AtomicU32] {
        let tail = self.page_ptr::<C>(page).add(Self::tail_start::<C>());
        slice::from_raw_parts(
            tail as *const AtomicU32,
            Derived::<C>::TAIL_BYTES as usize / size_of::<u32>(),
        )
    }

    /// The segment words of a hierarchical page
    ///
    /// # Safety
    ///
    /// `page` must be a page of an initialized arena currently formatted
    /// for `chunksize` (so nobody is using the tail as chunk memory)
    #[inline]
    pub(crate) unsafe fn segment_words<C: HeapConfig>(
        &self,
        page: u32,
        chunksize: u32,
        geometry: PageGeometry,
    ) -> &[AtomicU32] {
        let offs = chunksize as usize * geometry.capacity() as usize;
        debug_assert!(offs >= Self::tail_start::<C>());
        debug_assert!(offs % size_of::<u32>() == 0);
        debug_assert!(offs + geometry.segments() as usize * size_of::<u32>() <= C::PAGESIZE as usize);
        slice::from_raw_parts(
            self.page_ptr::<C>(page).add(offs) as *const AtomicU32,
            geometry.segments() as usize,
        )
    }

    /// Zero the hierarchy window of a page that nobody else is using
    ///
    /// # Safety
    ///
    /// `page` must be a page of an initialized arena whose chunk memory is
    /// no longer in use
    pub(crate) unsafe fn clear_tail<C: HeapConfig>(&self, page: u32) {
        for w in self.tail_words::<C>(page) {
            w.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests;
