//! `rseq` — Linux restartable sequences for Rust.
//!
//! Zero-dependency, `no_std` wrapper around the Linux rseq(2) syscall.
//! Provides per-CPU atomic operations without hardware atomics on the
//! fast path — the kernel handles preemption detection.
//!
//! # Features
//!
//! - `nightly` — enables `#[thread_local]` for the self-managed rseq area
//!   and weak-symbol glibc detection. Without this feature, only the raw
//!   ABI types, constants, and syscall wrappers are available.
//!
//! # Architecture support
//!
//! Currently x86_64 only.

#![no_std]
#![cfg_attr(feature = "nightly", feature(thread_local, linkage))]

pub mod abi;
pub mod slab_ops;
pub mod syscall;
pub mod thread;

// Re-export key types at crate root.
pub use abi::{RSEQ_SIG, Rseq, RseqCs};
pub use slab_ops::{
    ALLOC_FULL, ALLOC_MIGRATED, ALLOC_RETRY, free_cache_try_pop, free_cache_try_push,
    manager_cas_advance_head, manager_publish_tail, slab_try_allocate,
};
pub use thread::{RseqLocal, current_cpu, current_rseq, rseq_available};
