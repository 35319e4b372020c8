//! Allocation statistics counters.
//!
//! All counters use `Relaxed` ordering — they are observational only and not
//! used as synchronization primitives. The slab/manager critical sections
//! (rseq or the fallback spinlock) provide the ordering guarantees for
//! correctness; these counters are purely for monitoring.
//!
//! # Usage
//!
//! ```ignore
//! let snap = rtmalloc::stats::snapshot();
//! println!("allocs: {}", snap.alloc_count);
//! ```
//!
//! Obtain a [`Snapshot`] with [`snapshot()`]. Individual counter loads are
//! individually atomic but not globally consistent with each other.

use core::sync::atomic::{AtomicU64, Ordering};

pub(crate) struct Stats {
    // ---- Global allocation stats ----
    /// Total calls to alloc with size > 0.
    pub alloc_count: AtomicU64,
    /// Total calls to dealloc with size > 0.
    pub dealloc_count: AtomicU64,
    /// Total calls to realloc (after null/zero-size guards).
    pub realloc_count: AtomicU64,
    /// Sum of all requested byte sizes passed to alloc.
    pub alloc_bytes: AtomicU64,

    // ---- Free-cache fast path ----
    /// Allocations served straight from a manager's free cache, with no
    /// slab bitmap touched.
    pub free_cache_hits: AtomicU64,
    /// Allocations (or frees) that missed the free cache and fell through
    /// to the slab machinery.
    pub free_cache_misses: AtomicU64,

    // ---- Slab bitmap path ----
    /// Successful owner-local bitmap reservations (`Slab::allocate` ->
    /// `Slot`).
    pub slab_allocs: AtomicU64,
    /// Times `Slab::allocate` found the owner-local summary empty and
    /// returned `Full`.
    pub slab_full_events: AtomicU64,
    /// Calls to `Slab::try_reclaim`.
    pub reclaim_attempts: AtomicU64,
    /// `try_reclaim` calls that found cross-core frees and recovered at
    /// least one slot into the owner-local bitmap.
    pub reclaim_recovered: AtomicU64,
    /// `Slab::claim_ownership` calls that won the UNOWNED -> OWNED race.
    pub slab_claims: AtomicU64,

    // ---- Bump provider / OS ----
    /// Fresh slabs minted by `Region::alloc_slab`.
    pub bump_slab_allocs: AtomicU64,
    /// Allocations routed to the oversize path (`platform::page_alloc`
    /// directly, bypassing the slab machinery).
    pub oversize_allocs: AtomicU64,
    /// Calls to `platform::page_alloc` (arena reservation plus oversize
    /// requests).
    pub os_alloc_count: AtomicU64,
    /// Bytes requested from the OS via `platform::page_alloc`.
    pub os_alloc_bytes: AtomicU64,
}

impl Stats {
    const fn new() -> Self {
        Self {
            alloc_count: AtomicU64::new(0),
            dealloc_count: AtomicU64::new(0),
            realloc_count: AtomicU64::new(0),
            alloc_bytes: AtomicU64::new(0),
            free_cache_hits: AtomicU64::new(0),
            free_cache_misses: AtomicU64::new(0),
            slab_allocs: AtomicU64::new(0),
            slab_full_events: AtomicU64::new(0),
            reclaim_attempts: AtomicU64::new(0),
            reclaim_recovered: AtomicU64::new(0),
            slab_claims: AtomicU64::new(0),
            bump_slab_allocs: AtomicU64::new(0),
            oversize_allocs: AtomicU64::new(0),
            os_alloc_count: AtomicU64::new(0),
            os_alloc_bytes: AtomicU64::new(0),
        }
    }
}

pub(crate) static STATS: Stats = Stats::new();

/// A point-in-time snapshot of all allocation statistics.
///
/// Fields are plain `u64` values loaded from the global atomic counters.
/// Individual fields are each atomically read, but the snapshot as a whole
/// is not globally consistent — concurrent allocations may race between loads.
/// For monitoring purposes this is always sufficient.
///
/// Obtain a snapshot with [`snapshot()`].
#[derive(Clone, Copy, Debug, Default)]
pub struct Snapshot {
    /// Total calls to alloc with size > 0.
    pub alloc_count: u64,
    /// Total calls to dealloc with size > 0.
    pub dealloc_count: u64,
    /// Total calls to realloc (after null/zero-size guards).
    pub realloc_count: u64,
    /// Sum of all requested byte sizes passed to alloc.
    pub alloc_bytes: u64,
    /// Allocations served straight from a manager's free cache.
    pub free_cache_hits: u64,
    /// Allocations (or frees) that missed the free cache.
    pub free_cache_misses: u64,
    /// Successful owner-local bitmap reservations.
    pub slab_allocs: u64,
    /// Times a slab's owner-local bitmap was found exhausted.
    pub slab_full_events: u64,
    /// Calls to `Slab::try_reclaim`.
    pub reclaim_attempts: u64,
    /// `try_reclaim` calls that recovered at least one cross-core free.
    pub reclaim_recovered: u64,
    /// `Slab::claim_ownership` calls that won the race.
    pub slab_claims: u64,
    /// Fresh slabs minted by the bump provider.
    pub bump_slab_allocs: u64,
    /// Allocations routed to the oversize path.
    pub oversize_allocs: u64,
    /// Calls to `platform::page_alloc`.
    pub os_alloc_count: u64,
    /// Bytes requested from the OS via `platform::page_alloc`.
    pub os_alloc_bytes: u64,
}

/// Load all counters with `Relaxed` ordering and return a [`Snapshot`].
pub fn snapshot() -> Snapshot {
    let s = &STATS;
    Snapshot {
        alloc_count: s.alloc_count.load(Ordering::Relaxed),
        dealloc_count: s.dealloc_count.load(Ordering::Relaxed),
        realloc_count: s.realloc_count.load(Ordering::Relaxed),
        alloc_bytes: s.alloc_bytes.load(Ordering::Relaxed),
        free_cache_hits: s.free_cache_hits.load(Ordering::Relaxed),
        free_cache_misses: s.free_cache_misses.load(Ordering::Relaxed),
        slab_allocs: s.slab_allocs.load(Ordering::Relaxed),
        slab_full_events: s.slab_full_events.load(Ordering::Relaxed),
        reclaim_attempts: s.reclaim_attempts.load(Ordering::Relaxed),
        reclaim_recovered: s.reclaim_recovered.load(Ordering::Relaxed),
        slab_claims: s.slab_claims.load(Ordering::Relaxed),
        bump_slab_allocs: s.bump_slab_allocs.load(Ordering::Relaxed),
        oversize_allocs: s.oversize_allocs.load(Ordering::Relaxed),
        os_alloc_count: s.os_alloc_count.load(Ordering::Relaxed),
        os_alloc_bytes: s.os_alloc_bytes.load(Ordering::Relaxed),
    }
}
