//! # rtsalloc
//!
//! A fixed-arena allocator for real-time and embedded code: one caller-supplied,
//! aligned block, no backing heap, constant-time allocate and free.
//!
//! ```text
//!   ┌──────────────┬──────────┬──────────┬────────────────────────┬──────────┐
//!   │ RtsAlloc     │ frag     │ frag     │ frag                   │ frag     │
//!   │ bins[] mask  │ used     │ free     │ used                   │ free     │
//!   │ diagnostics  │          │          │                        │          │
//!   └──────────────┴──────────┴──────────┴────────────────────────┴──────────┘
//!    INSTANCE_SIZE  ◄──────────────────── capacity ──────────────────────────►
//!    _PADDED
//! ```
//!
//! Every fragment starts with an in-place header; the user pointer is the header
//! address plus [`ALIGNMENT`]. Fragment sizes are powers of two at allocation time
//! and multiples of [`FRAGMENT_SIZE_MIN`] always. Free fragments sit in one of
//! `usize::BITS` exponential bins, with a bitmask giving the smallest sufficient
//! non-empty bin in O(1). Frees merge with free neighbors immediately.
//!
//! ```rust
//! use rtsalloc::Heap;
//!
//! let mut heap = Heap::new(1 << 20).unwrap();
//! let p = heap.allocate(1000).unwrap();
//! assert!(heap.diagnostics().allocated >= 1000);
//! unsafe { heap.free(p.as_ptr()) };
//! assert!(heap.check_heap_corruption());
//! ```
//!
//! The engine ([`RtsAlloc`]) is not thread-safe. [`LockedHeap`] puts one behind a
//! spin lock and implements [`GlobalAlloc`](core::alloc::GlobalAlloc).

mod bits;
mod engine;
mod error;
mod global;
mod heap;

#[cfg(feature = "c_api")]
pub mod c_api;

pub use engine::{
  ALIGNMENT, Diagnostics, FRAGMENT_SIZE_MAX, FRAGMENT_SIZE_MIN, FragmentInfo, Fragments,
  INSTANCE_SIZE_PADDED, MIN_ARENA_SIZE, NUM_BINS_MAX, RtsAlloc,
};
pub use error::{HeapError, InitError};
pub use global::LockedHeap;
pub use heap::{DEFAULT_HEAP_SIZE, Heap};
