//! Helpers shared by the unit tests

use std::fmt::Debug;

/// One 16-byte aligned block of backing memory
#[derive(Clone, Copy)]
#[repr(C, align(16))]
pub struct Block16(#[allow(dead_code)] [u8; 16]);

/// Heap backing memory with a known alignment
pub struct AlignedBuffer {
    blocks: Vec<Block16>,
}

impl AlignedBuffer {
    pub fn new(bytes: usize) -> Self {
        Self {
            blocks: vec![Block16([0xa5; 16]); crate::util::divroundup(bytes, 16)],
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len() * 16
    }

    pub fn as_bytes(&mut self) -> &mut [u8] {
        let len = self.len();
        // safety: Block16 is plain bytes
        unsafe { std::slice::from_raw_parts_mut(self.blocks.as_mut_ptr() as *mut u8, len) }
    }
}

impl Debug for AlignedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("@addr", &self.blocks.as_ptr())
            .field("len", &self.len())
            .finish()
    }
}

/// Install a subscriber so `RUST_LOG=scatter_heap=trace` shows allocator events
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Assert that no two `(start, len)` ranges overlap
pub fn assert_disjoint(ranges: &mut [(usize, usize)]) {
    ranges.sort();
    for w in ranges.windows(2) {
        assert!(
            w[0].0 + w[0].1 <= w[1].0,
            "ranges 0x{:x}+{} and 0x{:x}+{} overlap",
            w[0].0,
            w[0].1,
            w[1].0,
            w[1].1
        );
    }
}
