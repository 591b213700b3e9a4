//! The heap proper: placement of chunk requests, claims and frees
//!
//! A request is padded to [DATA_ALIGNMENT] and then routed by size. Anything
//! smaller than a page goes through the chunk path: a search over pages
//! (grouped into regions and access blocks) for one formatted for a close
//! enough chunk size, followed by a claim in that page's occupancy bitmap.
//! Anything else goes through the page-based path in [page_based].
//!
//! The search starts at a page derived from the request size and the
//! caller's group and unit, so that the many lanes asking for the same size
//! at the same time spread out over different pages:
//!
//! ```text
//!          block 0            block 1            block 2
//!  +------------------+------------------+------------------+
//!  | r0  | r1  | r2   | r3  | r4  | r5   | ...              |
//!  +------------------+------------------+------------------+
//!             ^ start = first_free_block * pages_per_block + hash % pages_per_block
//! ```
//!
//! Regions whose fill level hint says they are mostly full are skipped on a
//! first pass. A second pass looks at every page.

use std::{
    cmp,
    fmt::Debug,
    hash::{Hash, Hasher},
    marker::PhantomData,
    ptr::NonNull,
    sync::atomic::Ordering,
};

use tracing::Level;

use crate::{
    arena::{ArenaLayout, PageGeometry, Pte},
    bitmap::{OccupancyWord, SegmentedBitmap},
    config::{DefaultConfig, Derived, HeapConfig, DATA_ALIGNMENT, MIN_CHUNK_SIZE},
    lane::LaneId,
    loom_testing::*,
    util::{divroundup, roundto, UsizePtr},
};

pub(crate) mod page_based;
use page_based::SpinLock;

/// hash using [rustc_hash::FxHasher]
fn hash<K: Hash>(key: &K) -> u64 {
    let mut hasher = rustc_hash::FxHasher::default();
    key.hash(&mut hasher);
    hasher.finish()
}

/// Concurrent allocator over a borrowed buffer
///
/// Every operation takes `&self` and may be called from any number of
/// threads at once. Nothing is ever handed out twice while live.
pub struct ScatterHeap<'arena, C: HeapConfig = DefaultConfig> {
    layout: ArenaLayout,
    /// Access block where chunk searches start (hint)
    first_free_block: AtomicU32,
    /// Highest page where a page-based search starts scanning down (hint)
    first_free_page_based: AtomicU32,
    /// Serializes page-based searches
    page_based_lock: SpinLock,
    /// The buffer is ours until the heap goes away
    _p: PhantomData<(&'arena mut [u8], C)>,
}

impl<'arena, C: HeapConfig> Debug for ScatterHeap<'arena, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScatterHeap")
            .field("layout", &self.layout)
            .field(
                "first_free_block",
                &self.first_free_block.load(Ordering::Relaxed),
            )
            .field(
                "first_free_page_based",
                &self.first_free_page_based.load(Ordering::Relaxed),
            )
            .field("page_based_lock", &self.page_based_lock)
            .finish()
    }
}

impl<'arena, C: HeapConfig> ScatterHeap<'arena, C> {
    /// Build a heap over `buffer`
    ///
    /// This never fails. A misaligned or awkwardly sized buffer loses some
    /// bytes (with a warning), and a buffer too small for a single region
    /// gives a heap where every allocation returns `None`.
    pub fn new(buffer: &'arena mut [u8]) -> Self {
        Self::new_parallel(buffer, 1)
    }

    /// Build a heap over `buffer`, splitting the metadata initialization
    /// over `workers` threads
    pub fn new_parallel(buffer: &'arena mut [u8], workers: usize) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Derived::<C>::CHECK;

        let workers = cmp::max(workers, 1);
        let memsize = buffer.len();
        let base = NonNull::from(buffer).cast::<u8>();
        let layout = ArenaLayout::compute::<C>(base, memsize);

        if workers == 1 {
            // safety: we hold the only borrow of the buffer
            unsafe { layout.init_strided::<C>(0, 1) };
        } else {
            std::thread::scope(|s| {
                for worker in 0..workers {
                    let layout = &layout;
                    // safety: we hold the only borrow of the buffer,
                    // and every worker index runs exactly once
                    s.spawn(move || unsafe { layout.init_strided::<C>(worker, workers) });
                }
            });
        }

        tracing::debug!(
            base = ?UsizePtr::from(layout.pages.as_ptr()),
            memsize,
            num_pages = layout.num_pages,
            num_regions = layout.num_regions,
            workers,
            "heap initialized"
        );

        Self {
            first_free_block: AtomicU32::new(0),
            first_free_page_based: AtomicU32::new(layout.num_pages.saturating_sub(1)),
            page_based_lock: SpinLock::new(),
            layout,
            _p: PhantomData,
        }
    }

    /// Number of pages managed by this heap
    pub fn num_pages(&self) -> u32 {
        self.layout.num_pages
    }

    /// Number of fill level regions
    pub fn num_regions(&self) -> u32 {
        self.layout.num_regions
    }

    pub(crate) fn layout(&self) -> &ArenaLayout {
        &self.layout
    }

    #[inline]
    pub(crate) fn pte(&self, page: u32) -> &Pte {
        debug_assert!(page < self.layout.num_pages);
        // safety: in bounds, and initialized by the constructor
        unsafe { &*self.layout.ptes.as_ptr().add(page as usize) }
    }

    #[inline]
    pub(crate) fn region(&self, region: u32) -> &AtomicU32 {
        debug_assert!(region < self.layout.num_regions);
        // safety: in bounds, and initialized by the constructor
        unsafe { &*self.layout.regions.as_ptr().add(region as usize) }
    }

    fn pages_per_block(&self) -> u32 {
        cmp::max(1, self.layout.num_pages / C::ACCESSBLOCKS)
    }

    fn num_blocks(&self) -> u32 {
        divroundup(
            self.layout.num_pages as usize,
            self.pages_per_block() as usize,
        ) as u32
    }

    /// Pad a request to the data alignment
    ///
    /// Requests smaller than a page stay smaller than a page, so the few
    /// sizes just below it end up with a chunk that starts at the page
    /// boundary instead. `None` for zero-sized requests and for requests
    /// that cannot be described by a page table entry.
    pub(crate) fn pad_request(bytes: usize) -> Option<u32> {
        if bytes == 0 {
            return None;
        }
        // roundto would overflow
        bytes.checked_add(DATA_ALIGNMENT as usize - 1)?;
        let padded = roundto(bytes, DATA_ALIGNMENT as usize);
        if bytes < C::PAGESIZE as usize {
            Some(cmp::min(padded, C::PAGESIZE as usize - 1) as u32)
        } else {
            u32::try_from(padded).ok()
        }
    }

    /// Allocate `bytes` bytes, aligned to 16
    ///
    /// Returns `None` for zero-sized requests or if no memory is available.
    /// The returned memory is not initialized.
    pub fn allocate(&self, lane: LaneId, bytes: usize) -> Option<NonNull<u8>> {
        let trace_span = tracing::span!(
            Level::TRACE,
            "heap::allocate",
            lane = lane.lane,
            group = lane.group,
            unit = lane.unit,
            bytes
        );
        let _span_enter = trace_span.enter();

        let ptr = Self::pad_request(bytes).and_then(|padded| self.allocate_padded(lane, padded));
        tracing::event!(Level::TRACE, ptr = ?UsizePtr::from(ptr));
        ptr
    }

    /// Route an already padded request by size
    pub(crate) fn allocate_padded(&self, lane: LaneId, bytes: u32) -> Option<NonNull<u8>> {
        debug_assert!(bytes > 0);
        if bytes < C::PAGESIZE {
            self.alloc_chunked(lane, bytes)
        } else {
            self.alloc_page_based(bytes)
        }
    }

    /// Page within an access block where a search for `bytes` starts
    fn start_page(&self, lane: LaneId, bytes: u32, pages_per_block: u32) -> u32 {
        let reloff = (32 * bytes as u64 / C::PAGESIZE as u64) as u32;
        let key = (bytes, lane.unit, lane.group.wrapping_mul(1 + reloff));
        (hash(&key) % pages_per_block as u64) as u32
    }

    fn alloc_chunked(&self, lane: LaneId, bytes: u32) -> Option<NonNull<u8>> {
        let num_pages = self.layout.num_pages;
        if num_pages == 0 {
            return None;
        }
        let bytes = cmp::max(bytes, MIN_CHUNK_SIZE);
        let pages_per_block = self.pages_per_block();
        let num_blocks = self.num_blocks();
        // formatted pages may waste some space, but must stay chunk pages
        let maxchunksize = cmp::min(C::PAGESIZE - 1, bytes.saturating_mul(C::WASTEFACTOR));

        let startpage = self.start_page(lane, bytes, pages_per_block);
        let mut startblock = cmp::min(
            self.first_free_block.load(Ordering::Relaxed),
            num_blocks - 1,
        );
        let mut ptetry = startblock * pages_per_block + startpage;
        let mut checklevel = C::REGIONSIZE * 3 / 4;

        for _ in 0..2 {
            for block in startblock..num_blocks {
                // everything before this block came up empty
                if block > startblock {
                    self.first_free_block.store(block, Ordering::Relaxed);
                }
                let block_end = cmp::min((block + 1).saturating_mul(pages_per_block), num_pages);
                while ptetry < block_end {
                    let region = ptetry / C::REGIONSIZE;
                    let region_end = (region + 1) * C::REGIONSIZE;
                    let filllevel = self.region(region).load(Ordering::Relaxed);
                    if filllevel >= checklevel {
                        ptetry = region_end;
                        continue;
                    }

                    while ptetry < region_end {
                        if let Some(ptr) = self.try_page(lane, ptetry, bytes, maxchunksize) {
                            return Some(ptr);
                        }
                        ptetry += 1;
                    }

                    // nothing here, make others less likely to look
                    if filllevel < C::REGIONSIZE {
                        self.region(region)
                            .fetch_max(filllevel + 1, Ordering::Relaxed);
                    }
                }
            }

            // really full, look at every page
            startblock = 0;
            ptetry = 0;
            checklevel = C::REGIONSIZE + 1;
        }

        tracing::trace!(bytes, "chunk search exhausted");
        None
    }

    /// Use `page` for a `bytes` request if its formatting allows it,
    /// formatting it first if it is unformatted
    fn try_page(
        &self,
        lane: LaneId,
        page: u32,
        bytes: u32,
        maxchunksize: u32,
    ) -> Option<NonNull<u8>> {
        let pte = self.pte(page);
        // order: acquire so that we see the cleared bitmaps of a page
        // that was reset before it got (re)formatted
        let chunksize = pte.chunksize.load(Ordering::Acquire);
        if chunksize >= bytes && chunksize <= maxchunksize {
            return self.try_use_page(lane, page, chunksize);
        }
        if chunksize != 0 {
            return None;
        }
        match pte
            .chunksize
            .compare_exchange(0, bytes, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => self.try_use_page(lane, page, bytes),
            // somebody else formatted it in the meantime, maybe it still fits
            Err(before) if before >= bytes && before <= maxchunksize => {
                self.try_use_page(lane, page, before)
            }
            Err(_) => None,
        }
    }

    /// Reserve capacity on a page formatted for `chunksize`, then claim a chunk
    fn try_use_page(&self, lane: LaneId, page: u32, chunksize: u32) -> Option<NonNull<u8>> {
        let pte = self.pte(page);
        let filllevel = pte.count.fetch_add(1, Ordering::AcqRel);

        let mut spot = None;
        // a page being reset may have changed formatting under us
        if !C::RESET_FREED_PAGES || pte.chunksize.load(Ordering::Acquire) == chunksize {
            let geometry = PageGeometry::for_chunksize::<C>(chunksize);
            if filllevel < geometry.capacity() {
                spot = match geometry {
                    PageGeometry::Flat { chunks } => {
                        OccupancyWord::new(&pte.bitmask, chunks).claim(lane.lane)
                    }
                    PageGeometry::Hierarchical { .. } => {
                        // safety: the page is formatted for chunksize and we
                        // hold a reservation, so the words stay bitmaps
                        let segments =
                            unsafe { self.layout.segment_words::<C>(page, chunksize, geometry) };
                        SegmentedBitmap::new(&pte.bitmask, segments, geometry.last_segment_spots())
                            .claim(lane.lane)
                    }
                };
            }
        }

        match spot {
            Some(spot) => {
                // safety: spot < capacity, so the chunk is inside the page
                let ptr = unsafe {
                    self.layout
                        .page_ptr::<C>(page)
                        .add(spot as usize * chunksize as usize)
                };
                NonNull::new(ptr)
            }
            None => {
                let before = pte.count.fetch_sub(1, Ordering::AcqRel);
                // we may have kept a freeing thread from resetting the page
                if C::RESET_FREED_PAGES && before == 1 {
                    self.try_reset_page(page);
                }
                None
            }
        }
    }

    /// Page containing `ptr`
    pub(crate) fn page_of(&self, ptr: NonNull<u8>) -> u32 {
        let offset = ptr.as_ptr() as usize - self.layout.pages.as_ptr() as usize;
        debug_assert!(offset < self.layout.page_bytes::<C>());
        (offset / C::PAGESIZE as usize) as u32
    }

    /// Return memory obtained from [allocate](Self::allocate) or
    /// [allocate_grouped](Self::allocate_grouped)
    ///
    /// `None` is ignored.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by an allocation on this heap and must
    /// not have been deallocated already. Nothing may access the memory
    /// afterwards.
    pub unsafe fn deallocate(&self, lane: LaneId, ptr: Option<NonNull<u8>>) {
        let trace_span = tracing::span!(
            Level::TRACE,
            "heap::deallocate",
            lane = lane.lane,
            group = lane.group,
            unit = lane.unit
        );
        let _span_enter = trace_span.enter();
        tracing::event!(Level::TRACE, ptr = ?UsizePtr::from(ptr));

        let Some(ptr) = ptr else {
            return;
        };
        let page = self.page_of(ptr);
        let chunksize = self.pte(page).chunksize.load(Ordering::Acquire);
        debug_assert!(chunksize != 0, "freeing into an unformatted page");
        if chunksize >= C::PAGESIZE {
            self.dealloc_page_based(page, chunksize);
        } else if chunksize != 0 {
            self.dealloc_chunked(lane, page, chunksize, ptr);
        }
    }

    unsafe fn dealloc_chunked(&self, lane: LaneId, page: u32, chunksize: u32, ptr: NonNull<u8>) {
        let pte = self.pte(page);
        let page_ptr = self.layout.page_ptr::<C>(page);
        let chunk = ((ptr.as_ptr() as usize - page_ptr as usize) / chunksize as usize) as u32;
        let geometry = PageGeometry::for_chunksize::<C>(chunksize);
        debug_assert!(chunk < geometry.capacity());

        let chunk_ptr = page_ptr.add(chunk as usize * chunksize as usize);
        if C::USE_COALESCING && chunk_ptr != ptr.as_ptr() {
            // part of a coalesced block, the header counts who is still using it
            let header = &*(chunk_ptr as *const AtomicU32);
            let before = header.fetch_sub(1, Ordering::AcqRel);
            debug_assert!(before > 0);
            if before != 1 {
                return;
            }
            tracing::trace!(chunk = ?UsizePtr::from(chunk_ptr), "last coalesced user gone");
        }

        match geometry {
            PageGeometry::Flat { chunks } => {
                OccupancyWord::new(&pte.bitmask, chunks).release(chunk);
            }
            PageGeometry::Hierarchical { .. } => {
                let segments = self.layout.segment_words::<C>(page, chunksize, geometry);
                SegmentedBitmap::new(&pte.bitmask, segments, geometry.last_segment_spots())
                    .release(chunk);
            }
        }
        let before = pte.count.fetch_sub(1, Ordering::AcqRel);

        if C::RESET_FREED_PAGES && before == 1 {
            self.try_reset_page(page);
        }

        // the page went from more than half full to half full
        if before == divroundup(geometry.capacity() as usize, 2) as u32 {
            self.region_has_space(lane, page);
        }
    }

    /// Turn a page whose last chunk was just freed back into an
    /// unformatted page, unless somebody started using it again
    fn try_reset_page(&self, page: u32) {
        let pte = self.pte(page);
        loop {
            // a count of PAGESIZE exceeds every capacity; anybody reserving
            // from now on fails and backs off
            if pte
                .count
                .compare_exchange(0, C::PAGESIZE, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                return;
            }

            // the page may have been reset and taken by somebody else since
            // our caller saw it, possibly by a page-based allocation
            let chunksize = pte.chunksize.load(Ordering::Acquire);
            if chunksize != 0 && chunksize < C::PAGESIZE {
                // safety: count was 0, so no chunk and no reservation exists
                unsafe { self.layout.clear_tail::<C>(page) };
                pte.bitmask.store(0, Ordering::Relaxed);
                // order: whoever formats the page next must see cleared bitmaps
                fence(Ordering::Release);
                pte.chunksize.store(0, Ordering::Release);
                tracing::trace!(page, chunksize, "page reset");
            }

            let before = pte.count.fetch_sub(C::PAGESIZE, Ordering::AcqRel);
            // reservations made in the meantime are still backing off, and
            // the last of them comes back here
            if before != C::PAGESIZE {
                return;
            }
            // otherwise somebody may have formatted the page and given up
            // while we held it
            let chunksize = pte.chunksize.load(Ordering::Acquire);
            if chunksize == 0 || chunksize >= C::PAGESIZE {
                return;
            }
        }
    }

    /// Clear the fill level hint of the region `page` is in
    fn region_has_space(&self, lane: LaneId, page: u32) {
        let region = self.region(page / C::REGIONSIZE);
        if region.load(Ordering::Relaxed) != 0 {
            region.store(0, Ordering::Relaxed);
        }
        if lane.is_hint_writer() {
            self.first_free_block
                .fetch_min(page / self.pages_per_block(), Ordering::Relaxed);
        }
    }
}
