#![no_std]
#![cfg_attr(feature = "nightly", feature(thread_local))]
#![cfg_attr(feature = "nightly", feature(allocator_api))]

//! rtmalloc: a per-core slab allocator.
//!
//! Small requests are served by fixed-size, self-aligned slabs out of one
//! large pre-reserved arena ([`region`]); each size class keeps a
//! per-logical-core list of slabs with free capacity plus a small LIFO free
//! cache ([`slab_manager`]). The fast path is a restartable sequence
//! (`rseq(2)`, via the optional `rseq` crate) under `feature = "percpu"`;
//! otherwise a per-(class, core) spinlock stands in for the same critical
//! sections. Requests above the largest size class go straight to the OS
//! via [`platform`].
//!
//! # Usage
//!
//! ```ignore
//! #[global_allocator]
//! static GLOBAL: rtmalloc::RtMalloc = rtmalloc::RtMalloc;
//! ```
//!
//! For isolated testing or embedding multiple independent arenas in one
//! process, construct an [`allocator::Allocator`] directly instead of going
//! through the global allocator.

#[cfg(test)]
extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

#[macro_use]
pub mod macros;

pub mod allocator;
pub mod config;
pub mod error;
#[cfg(feature = "ffi")]
pub mod ffi;
#[cfg(feature = "alloc-histogram")]
pub mod histogram;
pub mod layout;
pub mod platform;
pub mod region;
pub mod size_class;
pub mod slab;
pub mod slab_manager;
pub mod stats;
pub mod sync;

// Re-export the allocator types at crate root for convenience.
pub use allocator::{Allocator, RtMalloc};
pub use error::Error;

// Panic handler for staticlib builds (no_std has no default panic handler).
// Only active when panic="abort" (i.e., the `fast` profile), not during normal checks.
#[cfg(all(feature = "ffi", not(test), not(feature = "std"), panic = "abort"))]
#[panic_handler]
fn panic(_: &core::panic::PanicInfo) -> ! {
    unsafe extern "C" {
        fn abort() -> !;
    }
    unsafe { abort() }
}
