//! Per-(size class, logical core) slab manager: the singly-linked list of
//! OWNED slabs with free capacity, plus the bounded LIFO free cache.
//!
//! Also home to the two pieces of per-thread "which core am I" state every
//! other restartable-section consumer in this crate needs: [`current_core`]
//! (an index into the manager grid) and, under `feature = "percpu"`,
//! [`current_rseq`] (the registered rseq pointer backing the actual
//! restartable sequences). [`FallbackGuard`] is the portable substitute for
//! the rseq abort-and-retry contract: a per-(class, core) spinlock, held
//! for the same critical sections the asm would otherwise guard, per the
//! distilled spec's §6 "kernel coupling" fallback note.
//!
//! Grounded on `examples/original_source/allocator/{slab_manager.h,free_cache.h}`
//! for the list/cache shape, and on the teacher's `cpu_cache.rs` for the
//! rseq-pointer-through-thread-local pattern this module generalizes.

use crate::layout;
use crate::size_class::{self, SizeClassInfo};
use crate::sync::SpinLock;

/// Intrusive `next` field offset within a slab header (see `crate::slab`).
const SLAB_NEXT_OFFSET: u64 = 8;

/// A handle to one `(size class, core)` manager cell living in the arena.
#[derive(Clone, Copy)]
pub struct Manager {
    base: *mut u8,
}

unsafe impl Send for Manager {}
unsafe impl Sync for Manager {}

impl Manager {
    /// Wrap the manager grid cell for `(class, core)`, whose absolute
    /// address is `arena_base + layout::cell_offset(class, core)`.
    #[inline]
    pub unsafe fn at(arena_base: *mut u8, class: usize, core: usize) -> Self {
        let base = unsafe { arena_base.add(layout::cell_offset(class, core)) };
        Manager { base }
    }

    #[inline]
    fn word(&self, offset: usize) -> *mut u64 {
        unsafe { self.base.add(offset) as *mut u64 }
    }

    /// Head of the list (`0` = empty). Only ever read/written by the
    /// owning core, so a plain load is correct per the per-cell invariant.
    #[inline]
    pub fn head(&self) -> *mut u8 {
        (unsafe { *self.word(0) }) as *mut u8
    }

    #[inline]
    fn cache_base(&self) -> *mut u64 {
        self.word(16)
    }

    /// Pop the most recently freed pointer of this (class, core) from the
    /// free cache, or `None` if it is empty.
    pub fn try_pop(&self, class: usize, core: usize) -> Option<*mut u8> {
        cfg_if::cfg_if! {
            if #[cfg(feature = "percpu")] {
                if let Some(rseq) = current_rseq() {
                    return unsafe { rseq::free_cache_try_pop(rseq, self.cache_base()) };
                }
            }
        }
        let _guard = FallbackGuard::acquire(class, core);
        let idx_ptr = self.cache_base();
        let idx = unsafe { *idx_ptr } as usize;
        if idx == 0 {
            return None;
        }
        let idx = idx - 1;
        let ptr = unsafe { *idx_ptr.add(1 + idx) } as *mut u8;
        unsafe { *idx_ptr = idx as u64 };
        Some(ptr)
    }

    /// Push `ptr` onto the free cache. Returns `false` if the cache is
    /// already at [`crate::config::FREE_CACHE_CAPACITY`].
    pub fn try_push(&self, class: usize, core: usize, ptr: *mut u8) -> bool {
        cfg_if::cfg_if! {
            if #[cfg(feature = "percpu")] {
                if let Some(rseq) = current_rseq() {
                    return unsafe {
                        rseq::free_cache_try_push(
                            rseq,
                            self.cache_base(),
                            ptr,
                            crate::config::FREE_CACHE_CAPACITY as u64,
                        )
                    };
                }
            }
        }
        let _guard = FallbackGuard::acquire(class, core);
        let idx_ptr = self.cache_base();
        let idx = unsafe { *idx_ptr } as usize;
        if idx == crate::config::FREE_CACHE_CAPACITY {
            return false;
        }
        unsafe { *idx_ptr.add(1 + idx) = ptr as u64 };
        unsafe { *idx_ptr = (idx + 1) as u64 };
        true
    }

    /// Unlink the head if it still equals `expected`. Returns `false` if
    /// the head changed underneath the caller (or, under `percpu`, the
    /// section aborted) — either way the caller re-reads `head()` and
    /// retries.
    pub fn advance_head(&self, class: usize, core: usize, expected: *mut u8) -> bool {
        cfg_if::cfg_if! {
            if #[cfg(feature = "percpu")] {
                if let Some(rseq) = current_rseq() {
                    return unsafe {
                        rseq::manager_cas_advance_head(
                            rseq,
                            self.base as *mut u64,
                            expected,
                            SLAB_NEXT_OFFSET,
                        )
                    };
                }
            }
        }
        let _guard = FallbackGuard::acquire(class, core);
        let head_ptr = self.word(0);
        if unsafe { *head_ptr } as *mut u8 != expected {
            return false;
        }
        let next = unsafe { *(expected.add(SLAB_NEXT_OFFSET as usize) as *mut u64) };
        unsafe { *head_ptr = next };
        true
    }

    /// Publish `slab` onto this manager's list — tail-append when
    /// non-empty, head=tail=slab when empty (see SPEC_FULL.md §9 for why
    /// tail-append was chosen over head-push). `slab`'s own `next` field
    /// must already be null.
    pub fn publish(&self, class: usize, core: usize, slab: *mut u8) {
        cfg_if::cfg_if! {
            if #[cfg(feature = "percpu")] {
                if let Some(rseq) = current_rseq() {
                    loop {
                        let ok = unsafe {
                            rseq::manager_publish_tail(
                                rseq,
                                self.base as *mut u64,
                                slab,
                                SLAB_NEXT_OFFSET,
                            )
                        };
                        if ok {
                            return;
                        }
                    }
                }
            }
        }
        let _guard = FallbackGuard::acquire(class, core);
        let tail_ptr = self.word(8);
        let tail = unsafe { *tail_ptr } as *mut u8;
        if tail.is_null() {
            unsafe { *self.word(0) = slab as u64 };
            unsafe { *tail_ptr = slab as u64 };
        } else {
            unsafe { *(tail.add(SLAB_NEXT_OFFSET as usize) as *mut u64) = slab as u64 };
            unsafe { *tail_ptr = slab as u64 };
        }
    }

    #[cfg(test)]
    pub fn tail(&self) -> *mut u8 {
        (unsafe { *self.word(8) }) as *mut u8
    }

    #[cfg(test)]
    pub fn cache_len(&self) -> usize {
        unsafe { *self.cache_base() as usize }
    }
}

// ── per-thread core identity ─────────────────────────────────────────────

cfg_if::cfg_if! {
    if #[cfg(feature = "percpu")] {
        #[thread_local]
        static RSEQ: rseq::RseqLocal = rseq::RseqLocal::new();

        /// This thread's registered rseq pointer, if rseq is available.
        #[inline(always)]
        pub(crate) fn current_rseq() -> Option<*mut rseq::Rseq> {
            RSEQ.rseq_ptr()
        }

        /// Current-CPU index, bounded to the manager grid's row count. Falls
        /// back to [`sticky_core()`] when rseq is unavailable on this thread.
        #[inline(always)]
        pub fn current_core() -> usize {
            match RSEQ.cpu_id() {
                Some(cpu) => cpu as usize % crate::config::NUM_CORES,
                None => sticky_core(),
            }
        }
    } else {
        /// Current-CPU index, bounded to the manager grid's row count.
        /// Without `rseq`, there is no kernel-maintained CPU id, so this
        /// crate assigns each thread a sticky round-robin core on first use
        /// (the distilled spec's §6 "portable fallback" note).
        #[inline(always)]
        pub fn current_core() -> usize {
            sticky_core()
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "nightly")] {
        use core::sync::atomic::{AtomicUsize, Ordering};

        static NEXT_CORE: AtomicUsize = AtomicUsize::new(0);

        #[thread_local]
        static STICKY_CORE: core::cell::Cell<Option<usize>> = core::cell::Cell::new(None);

        #[cold]
        fn sticky_core() -> usize {
            if let Some(c) = STICKY_CORE.get() {
                return c;
            }
            let c = NEXT_CORE.fetch_add(1, Ordering::Relaxed) % crate::config::NUM_CORES;
            STICKY_CORE.set(Some(c));
            c
        }
    } else if #[cfg(feature = "std")] {
        use core::sync::atomic::{AtomicUsize, Ordering};

        static NEXT_CORE: AtomicUsize = AtomicUsize::new(0);

        std::thread_local! {
            static STICKY_CORE: core::cell::Cell<Option<usize>> = const { core::cell::Cell::new(None) };
        }

        #[cold]
        fn sticky_core() -> usize {
            STICKY_CORE.with(|cell| {
                if let Some(c) = cell.get() {
                    return c;
                }
                let c = NEXT_CORE.fetch_add(1, Ordering::Relaxed) % crate::config::NUM_CORES;
                cell.set(Some(c));
                c
            })
        }
    } else {
        /// Neither `nightly` nor `std`: no thread-local storage is
        /// available, so every thread is pinned to core 0. Still correct
        /// (the fallback spinlocks serialize everything), just without
        /// per-core parallelism.
        #[cold]
        fn sticky_core() -> usize {
            0
        }
    }
}

/// A per-(class, core) spinlock standing in for the restartable sequence
/// when `feature = "percpu"` is off (or rseq is unavailable at runtime).
/// Hashed into a fixed-size table rather than sized to `NUM_CLASSES *
/// NUM_CORES` so this module doesn't need const-generic arithmetic over
/// build-time-generated constants; collisions only cost contention, never
/// correctness, since every critical section this guards only touches
/// state private to one `(class, core)` cell.
const NUM_FALLBACK_LOCKS: usize = 256;

const LOCK_INIT: SpinLock = SpinLock::new();
static FALLBACK_LOCKS: [SpinLock; NUM_FALLBACK_LOCKS] = [LOCK_INIT; NUM_FALLBACK_LOCKS];

#[inline]
fn fallback_lock(class: usize, core: usize) -> &'static SpinLock {
    let h = class.wrapping_mul(0x9E37_79B9).wrapping_add(core.wrapping_mul(0x85EB_CA6B));
    &FALLBACK_LOCKS[h % NUM_FALLBACK_LOCKS]
}

/// RAII guard over a `(class, core)` fallback lock. [`SpinLock`] itself has
/// no guard (its `lock`/`unlock` are the raw primitive `SpinMutex` builds
/// on), so the bare critical sections in this module and in `crate::slab`
/// go through this instead of pairing `lock()`/`unlock()` by hand across
/// multiple early returns.
pub(crate) struct FallbackGuard(&'static SpinLock);

impl FallbackGuard {
    #[inline]
    pub(crate) fn acquire(class: usize, core: usize) -> Self {
        let lock = fallback_lock(class, core);
        lock.lock();
        FallbackGuard(lock)
    }
}

impl Drop for FallbackGuard {
    #[inline]
    fn drop(&mut self) {
        self.0.unlock();
    }
}

/// Geometry lookup convenience used by both `allocator.rs` and tests.
#[inline]
pub fn class_info(class: usize) -> &'static SizeClassInfo {
    size_class::class_info(class)
}
