//! Occupancy bitmaps
//!
//! A page tracks which of its chunks are in use with 32-bit occupancy words.
//! Pages with at most 32 chunks use a single word (the PTE `bitmask`) with
//! one bit per chunk. Pages with more chunks use two levels: the PTE
//! `bitmask` holds one bit per *segment* of 32 chunks, set once the segment
//! is known to be full, and each segment has its own word stored in the
//! page's tail.
//!
//! Claiming a slot is an atomic OR of a candidate bit. The starting
//! candidate is derived from the caller's lane index so that lanes of the
//! same group hammering the same word start on different bits. When the
//! candidate turns out to be taken, the snapshot returned by the OR is used
//! to jump straight to the next clear bit:
//!
//! ```text
//!  spots = 8, spot = 2, snapshot = 0b1011_0111
//!
//!  rotate right by spot + 1:   0b111_10110 (bit 0 is now spot 3)
//!  lowest clear bit:                    ^ bit 0 -> next spot = 3
//! ```
//!
//! Neither level needs to be exact. A segment may be marked full while a
//! concurrent free is clearing one of its bits; the free clears the full
//! bit again unconditionally, and the worst case is one wasted probe.

use std::sync::atomic::Ordering;

use crate::loom_testing::*;

/// Bound on probes within one word before giving up.
///
/// Each failed probe means some other lane claimed the probed bit, so this
/// only triggers under heavy concurrent free/claim churn or corrupted state.
#[cfg(not(loom))]
const MAX_CLAIM_ATTEMPTS: u32 = 2 * 32;
#[cfg(loom)]
const MAX_CLAIM_ATTEMPTS: u32 = 4;

/// Mask with the low `spots` bits set
#[inline]
pub const fn spot_mask(spots: u32) -> u32 {
    if spots >= 32 {
        u32::MAX
    } else {
        (1 << spots) - 1
    }
}

/// Find the next spot after `spot` that is clear in `bitfield`, wrapping
/// around within `spots`
///
/// If every spot is set, this returns `spot + 1` (modulo `spots`).
#[inline]
pub fn next_spot(bitfield: u32, spot: u32, spots: u32) -> u32 {
    debug_assert!(spot < spots && spots <= 32);
    let bitfield = bitfield & spot_mask(spots);
    let shift = spot + 1;
    let rotated = (bitfield.checked_shr(shift).unwrap_or(0)
        | bitfield.checked_shl(spots - shift).unwrap_or(0))
        & spot_mask(spots);
    let step = (!rotated).trailing_zeros() + 1;
    (spot + step) % spots
}

/// One 32-bit occupancy word with `spots` usable bits
///
/// Where the word lives (PTE or page tail) does not matter here.
#[derive(Clone, Copy)]
pub struct OccupancyWord<'a> {
    bits: &'a AtomicU32,
    spots: u32,
}

impl<'a> OccupancyWord<'a> {
    pub fn new(bits: &'a AtomicU32, spots: u32) -> Self {
        debug_assert!(spots > 0 && spots <= 32);
        Self { bits, spots }
    }

    /// Try to set one clear bit, returning its index
    ///
    /// Returns `None` once a snapshot shows every spot occupied, or after
    /// [MAX_CLAIM_ATTEMPTS] lost races.
    pub fn claim(&self, seed: u32) -> Option<u32> {
        let mut spot = seed % self.spots;
        for _ in 0..MAX_CLAIM_ATTEMPTS {
            let mask = 1 << spot;
            // order: acquire so the new owner sees everything the previous
            // owner wrote before releasing the slot
            let old = self.bits.fetch_or(mask, Ordering::AcqRel);
            if old & mask == 0 {
                return Some(spot);
            }
            // plain `== spots` would be enough if nothing is corrupted
            if (old & spot_mask(self.spots)).count_ones() >= self.spots {
                return None;
            }
            spot = next_spot(old, spot, self.spots);
        }
        tracing::trace!(spots = self.spots, "occupancy claim attempts exhausted");
        None
    }

    /// Clear bit `spot`, returning the previous word
    pub fn release(&self, spot: u32) -> u32 {
        debug_assert!(spot < self.spots);
        // order: release so the next owner sees our writes to the chunk
        self.bits.fetch_and(!(1 << spot), Ordering::AcqRel)
    }

    /// Current occupancy snapshot (masked to the usable bits)
    pub fn load(&self) -> u32 {
        self.bits.load(Ordering::Acquire) & spot_mask(self.spots)
    }

    pub fn is_full(&self) -> bool {
        self.load().count_ones() >= self.spots
    }
}

/// Two-level bitmap: a summary word with one "segment full" bit per
/// segment, and one [OccupancyWord] per segment
///
/// All segments hold 32 chunks except possibly the last one, which holds
/// `last_spots`.
#[derive(Clone, Copy)]
pub struct SegmentedBitmap<'a> {
    summary: &'a AtomicU32,
    segments: &'a [AtomicU32],
    last_spots: u32,
}

impl<'a> SegmentedBitmap<'a> {
    pub fn new(summary: &'a AtomicU32, segments: &'a [AtomicU32], last_spots: u32) -> Self {
        debug_assert!(!segments.is_empty() && segments.len() <= 32);
        debug_assert!(last_spots > 0 && last_spots <= 32);
        Self {
            summary,
            segments,
            last_spots,
        }
    }

    fn num_segments(&self) -> u32 {
        self.segments.len() as u32
    }

    fn segment(&self, i: u32) -> OccupancyWord<'a> {
        let spots = if i + 1 == self.num_segments() {
            self.last_spots
        } else {
            32
        };
        OccupancyWord::new(&self.segments[i as usize], spots)
    }

    /// Try to claim one chunk, returning its index within the page
    ///
    /// Every segment not already marked full is tried at most once.
    pub fn claim(&self, seed: u32) -> Option<u32> {
        let segments = self.num_segments();
        let mut spot = seed % segments;
        let mask = self.summary.load(Ordering::Acquire) & spot_mask(segments);
        if mask & (1 << spot) != 0 {
            spot = next_spot(mask, spot, segments);
        }
        let tries = segments - mask.count_ones();
        for _ in 0..tries {
            let word = self.segment(spot);
            if let Some(within) = word.claim(seed) {
                return Some(32 * spot + within);
            }
            // segment is exhausted, let other lanes skip it
            if word.is_full() {
                self.summary.fetch_or(1 << spot, Ordering::AcqRel);
            }
            spot = next_spot(mask, spot, segments);
        }
        None
    }

    /// Release chunk `idx`
    pub fn release(&self, idx: u32) {
        let segment = idx / 32;
        let within = idx % 32;
        self.segment(segment).release(within);
        // always clear, we may have lost a race against a claim marking it full
        self.summary.fetch_and(!(1 << segment), Ordering::AcqRel);
    }

    /// Number of occupied chunks across all segments (snapshot)
    #[cfg(test)]
    pub fn occupied(&self) -> u32 {
        (0..self.num_segments())
            .map(|i| self.segment(i).load().count_ones())
            .sum()
    }
}

#[cfg(test)]
mod tests;
