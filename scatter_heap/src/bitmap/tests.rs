use super::*;

#[test]
fn test_spot_mask() {
    assert_eq!(spot_mask(1), 0b1);
    assert_eq!(spot_mask(5), 0b11111);
    assert_eq!(spot_mask(32), u32::MAX);
}

#[test]
fn test_next_spot() {
    // example from the module docs
    assert_eq!(next_spot(0b1011_0111, 2, 8), 3);
    // skips over a run of set bits
    assert_eq!(next_spot(0b0000_1111, 0, 8), 4);
    // wraps around
    assert_eq!(next_spot(0b1100_0000, 6, 8), 0);
    assert_eq!(next_spot(0b1111_1110, 7, 8), 0);
    // last spot of a full-width word
    assert_eq!(next_spot(0x7fff_ffff, 30, 32), 31);
    assert_eq!(next_spot(0xffff_fffe, 31, 32), 0);
    // bits beyond `spots` are ignored
    assert_eq!(next_spot(0xffff_ff0f, 3, 8), 4);
}

#[test]
fn test_next_spot_all_set() {
    assert_eq!(next_spot(0b1111, 1, 4), 2);
    assert_eq!(next_spot(u32::MAX, 31, 32), 0);
}

#[cfg(not(loom))]
#[test]
fn occupancy_claim_all_then_full() {
    let bits = AtomicU32::new(0);
    let word = OccupancyWord::new(&bits, 5);

    let mut claimed = Vec::new();
    for i in 0..5 {
        claimed.push(word.claim(i * 3).unwrap());
    }
    claimed.sort();
    assert_eq!(claimed, vec![0, 1, 2, 3, 4]);
    assert_eq!(bits.load(Ordering::SeqCst), 0b11111);
    assert!(word.is_full());
    assert_eq!(word.claim(0), None);

    word.release(3);
    assert_eq!(word.claim(0), Some(3));
}

#[cfg(not(loom))]
#[test]
fn occupancy_claim_seed_start() {
    let bits = AtomicU32::new(0);
    let word = OccupancyWord::new(&bits, 32);
    assert_eq!(word.claim(7), Some(7));
    assert_eq!(word.claim(7), Some(8));
    assert_eq!(word.claim(39), Some(9));
    assert_eq!(word.load(), 0b11_1000_0000);
}

#[cfg(not(loom))]
#[test]
fn occupancy_corrupted_extra_bits() {
    // bits outside the usable range must not make claims loop or succeed there
    let bits = AtomicU32::new(0xffff_fff0 | 0b0111);
    let word = OccupancyWord::new(&bits, 4);
    assert_eq!(word.claim(0), Some(3));
    assert_eq!(word.claim(0), None);
}

#[cfg(not(loom))]
#[test]
fn segmented_claim_spills_into_next_segment() {
    let summary = AtomicU32::new(0);
    let segments = [AtomicU32::new(0), AtomicU32::new(0), AtomicU32::new(0)];
    let bitmap = SegmentedBitmap::new(&summary, &segments, 3);

    // 32 + 32 + 3 chunks
    let mut seen = Vec::new();
    for _ in 0..67 {
        seen.push(bitmap.claim(0).unwrap());
    }
    seen.sort();
    assert_eq!(seen, (0..67).collect::<Vec<_>>());
    assert_eq!(bitmap.occupied(), 67);
    assert_eq!(bitmap.claim(0), None);
    // first levels got marked as full on the way
    assert_eq!(summary.load(Ordering::SeqCst) & 0b011, 0b011);

    bitmap.release(40);
    assert_eq!(summary.load(Ordering::SeqCst) & 0b010, 0);
    assert_eq!(bitmap.claim(5), Some(40));
}

#[cfg(not(loom))]
#[test]
fn segmented_start_segment_from_seed() {
    let summary = AtomicU32::new(0);
    let segments = [AtomicU32::new(0), AtomicU32::new(0)];
    let bitmap = SegmentedBitmap::new(&summary, &segments, 32);
    // seed 33 -> segment 1, bit 1
    assert_eq!(bitmap.claim(33), Some(33));
    // seed 2 -> segment 0, bit 2
    assert_eq!(bitmap.claim(2), Some(2));
}

#[cfg(not(loom))]
#[test]
fn segmented_skips_marked_segments() {
    let summary = AtomicU32::new(0b01);
    let segments = [AtomicU32::new(u32::MAX), AtomicU32::new(0)];
    let bitmap = SegmentedBitmap::new(&summary, &segments, 10);
    assert_eq!(bitmap.claim(0), Some(32));
}

#[cfg(not(loom))]
#[test]
fn occupancy_threads_never_share_a_bit() {
    let bits = AtomicU32::new(0);
    let results: Vec<Vec<u32>> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8u32)
            .map(|t| {
                let bits = &bits;
                s.spawn(move || {
                    let word = OccupancyWord::new(bits, 32);
                    let mut mine = Vec::new();
                    while let Some(x) = word.claim(t) {
                        mine.push(x);
                    }
                    mine
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    let mut all: Vec<u32> = results.into_iter().flatten().collect();
    all.sort();
    assert_eq!(all, (0..32).collect::<Vec<_>>());
}

#[cfg(loom)]
#[test]
fn occupancy_loom_distinct_claims() {
    loom::model(|| {
        let bits = &*Box::leak(Box::new(AtomicU32::new(0)));

        let t0 = loom::thread::spawn(move || OccupancyWord::new(bits, 2).claim(0));
        let t1 = loom::thread::spawn(move || OccupancyWord::new(bits, 2).claim(0));

        let a = t0.join().unwrap();
        let b = t1.join().unwrap();
        assert!(a.is_some() && b.is_some());
        assert_ne!(a, b);
        assert_eq!(bits.load(Ordering::SeqCst), 0b11);
    })
}

#[cfg(loom)]
#[test]
fn occupancy_loom_claim_vs_release() {
    loom::model(|| {
        let bits = &*Box::leak(Box::new(AtomicU32::new(0b1)));

        let t0 = loom::thread::spawn(move || {
            OccupancyWord::new(bits, 1).release(0);
        });
        let t1 = loom::thread::spawn(move || OccupancyWord::new(bits, 1).claim(0));

        t0.join().unwrap();
        let claimed = t1.join().unwrap();
        match claimed {
            Some(0) => assert_eq!(bits.load(Ordering::SeqCst), 0b1),
            None => assert_eq!(bits.load(Ordering::SeqCst), 0),
            _ => unreachable!(),
        }
    })
}
