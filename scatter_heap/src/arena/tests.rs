use std::{ptr::NonNull, sync::atomic::Ordering};

use super::*;
use crate::{config::DefaultConfig, test_util::*};

const PER_REGION: usize = 16 * (12 + 4096) + 4;

fn layout_of(buf: &mut [u8]) -> ArenaLayout {
    let base = NonNull::new(buf.as_mut_ptr()).unwrap();
    ArenaLayout::compute::<DefaultConfig>(base, buf.len())
}

#[cfg(not(loom))]
#[test]
fn pte_is_three_words() {
    assert_eq!(size_of::<Pte>(), 12);
}

#[test]
fn geometry_default_pagesize() {
    type C = DefaultConfig;
    assert_eq!(
        PageGeometry::for_chunksize::<C>(16),
        PageGeometry::Hierarchical {
            full_segments: 7,
            additional_chunks: 30
        }
    );
    assert_eq!(PageGeometry::for_chunksize::<C>(16).capacity(), 254);
    assert_eq!(PageGeometry::for_chunksize::<C>(16).segments(), 8);
    assert_eq!(PageGeometry::for_chunksize::<C>(16).last_segment_spots(), 30);

    let g64 = PageGeometry::for_chunksize::<C>(64);
    assert_eq!(g64.capacity(), 63);
    assert_eq!(g64.segments(), 2);
    assert_eq!(g64.last_segment_spots(), 31);

    assert_eq!(PageGeometry::for_chunksize::<C>(112).capacity(), 36);

    // just above the hierarchy threshold
    assert_eq!(
        PageGeometry::for_chunksize::<C>(128),
        PageGeometry::Flat { chunks: 32 }
    );
    assert_eq!(PageGeometry::for_chunksize::<C>(128).segments(), 0);
    assert_eq!(PageGeometry::for_chunksize::<C>(2048).capacity(), 2);
    assert_eq!(PageGeometry::for_chunksize::<C>(4080).capacity(), 1);
}

#[test]
fn geometry_bitmaps_fit_in_tail_window() {
    type C = DefaultConfig;
    let tail_start = C::PAGESIZE - Derived::<C>::TAIL_BYTES;
    let mut cs = 16;
    while cs <= Derived::<C>::HIERARCHY_THRESHOLD {
        let g = PageGeometry::for_chunksize::<C>(cs);
        let offs = cs * g.capacity();
        assert!(offs >= tail_start, "chunksize {}", cs);
        assert!(offs + 4 * g.segments() <= C::PAGESIZE, "chunksize {}", cs);
        cs += 16;
    }
}

#[cfg(not(loom))]
#[test]
fn layout_aligned_buffer() {
    let mut buf = AlignedBuffer::new(1 << 20);
    let layout = layout_of(buf.as_bytes());

    assert_eq!(layout.num_regions, ((1 << 20) / PER_REGION) as u32);
    assert_eq!(layout.num_regions, 15);
    assert_eq!(layout.num_pages, 15 * 16);
    assert_eq!(layout.page_bytes::<DefaultConfig>(), 240 * 4096);
    assert_eq!(layout.pages.as_ptr(), buf.as_bytes().as_mut_ptr());
    assert_eq!(
        layout.ptes.as_ptr() as usize,
        layout.pages.as_ptr() as usize + 240 * 4096
    );
    assert_eq!(
        layout.regions.as_ptr() as usize,
        layout.ptes.as_ptr() as usize + 240 * 12
    );
    assert!(layout.regions.as_ptr() as usize + 15 * 4 <= buf.as_bytes().as_ptr() as usize + (1 << 20));
}

#[cfg(not(loom))]
#[test]
fn layout_misaligned_buffer() {
    init_tracing();
    let mut buf = AlignedBuffer::new(1 << 20);
    let bytes = &mut buf.as_bytes()[1..];
    let layout = layout_of(bytes);
    assert_eq!(layout.pages.as_ptr() as usize % 16, 0);
    assert_eq!(
        layout.pages.as_ptr() as usize - bytes.as_ptr() as usize,
        15
    );
    assert_eq!(layout.num_regions, 15);
}

#[cfg(not(loom))]
#[test]
fn layout_reduces_regions_for_padding() {
    init_tracing();
    let mut buf = AlignedBuffer::new(2 * PER_REGION + 32);
    // 2 regions fit by size, but not after skipping 15 bytes of padding
    let bytes = &mut buf.as_bytes()[1..2 * PER_REGION + 4];
    let layout = layout_of(bytes);
    assert_eq!(layout.num_regions, 1);
    assert_eq!(layout.num_pages, 16);
    assert!(
        layout.regions.as_ptr() as usize + 4 <= bytes.as_ptr() as usize + bytes.len()
    );
}

#[cfg(not(loom))]
#[test]
fn layout_too_small() {
    init_tracing();
    let mut buf = AlignedBuffer::new(4096);
    let layout = layout_of(buf.as_bytes());
    assert_eq!(layout.num_regions, 0);
    assert_eq!(layout.num_pages, 0);
}

#[cfg(not(loom))]
#[test]
fn strided_init_covers_everything() {
    type C = DefaultConfig;
    // buffer starts out as 0xa5 garbage
    let mut buf = AlignedBuffer::new(4 * PER_REGION);
    let layout = layout_of(buf.as_bytes());
    assert_eq!(layout.num_pages, 64);

    std::thread::scope(|s| {
        for worker in 0..5 {
            let layout = &layout;
            s.spawn(move || unsafe { layout.init_strided::<C>(worker, 5) });
        }
    });

    for page in 0..layout.num_pages {
        let pte = unsafe { &*layout.ptes.as_ptr().add(page as usize) };
        assert_eq!(pte.chunksize.load(Ordering::Relaxed), 0);
        assert_eq!(pte.count.load(Ordering::Relaxed), 0);
        assert_eq!(pte.bitmask.load(Ordering::Relaxed), 0);
        for w in unsafe { layout.tail_words::<C>(page) } {
            assert_eq!(w.load(Ordering::Relaxed), 0);
        }
        // chunk memory in front of the window is left alone
        assert_eq!(unsafe { *layout.page_ptr::<C>(page) }, 0xa5);
    }
    for region in 0..layout.num_regions {
        let r = unsafe { &*layout.regions.as_ptr().add(region as usize) };
        assert_eq!(r.load(Ordering::Relaxed), 0);
    }
}

#[cfg(not(loom))]
#[test]
fn segment_words_located_after_last_chunk() {
    type C = DefaultConfig;
    let mut buf = AlignedBuffer::new(PER_REGION);
    let layout = layout_of(buf.as_bytes());
    unsafe { layout.init_strided::<C>(0, 1) };

    let g = PageGeometry::for_chunksize::<C>(64);
    let words = unsafe { layout.segment_words::<C>(3, 64, g) };
    assert_eq!(words.len(), 2);
    assert_eq!(
        words.as_ptr() as usize,
        layout.page_ptr::<C>(3) as usize + 63 * 64
    );

    words[1].store(0xdead, Ordering::Relaxed);
    unsafe { layout.clear_tail::<C>(3) };
    assert_eq!(words[1].load(Ordering::Relaxed), 0);
}
