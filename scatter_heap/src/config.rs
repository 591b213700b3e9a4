//! Compile-time allocator policy
//!
//! Every geometry formula in the heap depends on these values, so they are
//! associated constants rather than runtime settings. A configuration is a
//! zero-sized type implementing [HeapConfig]:
//!
//! ```
//! use scatter_heap::HeapConfig;
//!
//! struct EagerReset;
//! impl HeapConfig for EagerReset {
//!     const RESET_FREED_PAGES: bool = true;
//! }
//! ```

use std::marker::PhantomData;

/// Alignment (and padding granularity) of every pointer handed out
pub const DATA_ALIGNMENT: u32 = 16;
/// Smallest chunk size a page can be formatted for
pub const MIN_CHUNK_SIZE: u32 = 16;
/// Number of lanes in a lock-step execution group
pub const GROUP_SIZE: u32 = 32;
/// Upper bound on hierarchy segments (one PTE bitmask bit each)
pub const MAX_SEGMENTS: u32 = 32;
/// Reserved at the start of a coalesced block, holds the participant count
pub const COALESCE_HEADER: u32 = 16;

/// Allocator policy constants
pub trait HeapConfig: Send + Sync + 'static {
    /// Bytes per page
    const PAGESIZE: u32 = 4096;
    /// Number of partitions of the page space used to spread searches
    const ACCESSBLOCKS: u32 = 8;
    /// Pages per fill-level hint
    const REGIONSIZE: u32 = 16;
    /// Maximum accepted ratio of chunk size to request size when reusing
    /// an already formatted page
    const WASTEFACTOR: u32 = 2;
    /// Merge small requests issued together by a lock-step group
    const USE_COALESCING: bool = true;
    /// Return a page to the unformatted state as soon as its last chunk is freed
    const RESET_FREED_PAGES: bool = false;
    /// Worker threads used by the convenience capacity scans
    const SCAN_WORKERS: usize = 4;
}

/// The stock policy: 4 KiB pages, 8 access blocks, 16-page regions
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConfig;
impl HeapConfig for DefaultConfig {}

/// Values derived from a [HeapConfig]
pub(crate) struct Derived<C>(PhantomData<C>);

impl<C: HeapConfig> Derived<C> {
    /// Largest chunk size that still needs a second bitmap level
    /// (i.e. more than 32 chunks fit into a page)
    pub const HIERARCHY_THRESHOLD: u32 = (C::PAGESIZE - 2 * 4) / 33;

    /// Size of the page tail that may hold hierarchy bitmaps for some chunk size.
    ///
    /// The bitmaps start after the last chunk, so at most one chunk's worth of
    /// slack plus [MAX_SEGMENTS] words precede the end of the page.
    pub const TAIL_BYTES: u32 = {
        let raw = Self::HIERARCHY_THRESHOLD + 4 * MAX_SEGMENTS;
        let rounded = (raw + DATA_ALIGNMENT - 1) & !(DATA_ALIGNMENT - 1);
        if rounded > C::PAGESIZE {
            C::PAGESIZE
        } else {
            rounded
        }
    };

    /// Largest request (after padding) that can take part in coalescing
    pub const COALESCE_LIMIT: u32 = C::PAGESIZE / GROUP_SIZE;

    /// Evaluated by the heap constructor to reject unusable configurations
    pub const CHECK: () = {
        assert!(C::PAGESIZE % DATA_ALIGNMENT == 0, "PAGESIZE must be a multiple of 16");
        assert!(
            C::PAGESIZE >= 32 * MIN_CHUNK_SIZE,
            "PAGESIZE too small for a single bitmap segment"
        );
        // with the minimum chunk size, segments must fit in the PTE bitmask
        assert!(
            C::PAGESIZE / (32 * MIN_CHUNK_SIZE + 4) < MAX_SEGMENTS,
            "PAGESIZE too large for a 32-bit segment mask"
        );
        assert!(C::ACCESSBLOCKS > 0, "ACCESSBLOCKS must be positive");
        assert!(C::REGIONSIZE > 0, "REGIONSIZE must be positive");
        assert!(C::WASTEFACTOR >= 1, "WASTEFACTOR must be at least 1");
        assert!(C::SCAN_WORKERS > 0, "SCAN_WORKERS must be positive");
        // a full group of coalesced requests must stay on the chunk path
        assert!(
            COALESCE_HEADER + GROUP_SIZE * (Self::COALESCE_LIMIT - DATA_ALIGNMENT)
                < C::PAGESIZE,
            "coalesced blocks would exceed a page"
        );
    };
}
