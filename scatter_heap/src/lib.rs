//! Lock-free arena allocator for massively parallel callers
//!
//! A [ScatterHeap] manages one caller-supplied buffer. The buffer is cut
//! into fixed-size pages; each page is either unformatted, formatted for one
//! chunk size (and then handed out chunk by chunk), or part of a run of pages
//! making up one large allocation.
//!
//! Every call carries the caller's [LaneId]. It only influences where a
//! search starts, so callers that may run at the same time should pass
//! different identities to stay out of each other's way.
//!
//! ```
//! use scatter_heap::{LaneId, ScatterHeap};
//!
//! let mut buf = vec![0u8; 1 << 20];
//! let heap: ScatterHeap = ScatterHeap::new(&mut buf);
//! let p = heap.allocate(LaneId::SERIAL, 100);
//! assert!(p.is_some());
//! unsafe { heap.deallocate(LaneId::SERIAL, p) };
//! ```
//!
//! The only lock anywhere is a spin lock serializing the (rare) searches for
//! runs of pages. Everything else is atomic operations on page table words.

pub mod arena;
pub mod bitmap;
pub mod coalesce;
pub mod config;
pub mod heap;
pub mod introspect;
pub mod lane;
mod loom_testing;
pub mod util;

#[cfg(test)]
mod test_util;

pub use coalesce::LockstepGroup;
pub use config::{DefaultConfig, HeapConfig};
pub use heap::ScatterHeap;
pub use introspect::HeapStats;
pub use lane::LaneId;
