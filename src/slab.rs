//! The slab: bitmap allocation engine and owner-state machine for one
//! fixed-size, self-aligned region of arena memory.
//!
//! A slab is never a Rust-owned value — it is a view over `SLAB_SIZE` bytes
//! living in the arena, reached only through raw pointers recovered by
//! masking an interior address (`addr & !(SLAB_SIZE - 1)`) or by walking a
//! [`crate::slab_manager::Manager`] list. [`Slab`] is a thin, `Copy` handle
//! around that base pointer; it carries no state of its own.
//!
//! Header layout (bytes relative to the slab base), grounded on
//! `examples/original_source/allocator/obj_slab.h`'s field order:
//!
//! ```text
//! [0, 8)                          object_size (u64, written once)
//! [8, 16)                         next (u64, owning-core-only intrusive link)
//! [16, 24)                        owner-local summary word
//! [24, 24 + 8*num_groups)         owner-local group words
//! -- rounded up to a cache line --
//! [owner_half, owner_half+8)      owner state (0 = OWNED, 1 = UNOWNED)
//! [owner_half+8, +16)             cross-core freed summary word
//! [owner_half+16, +16+8*groups)   cross-core freed group words
//! -- rounded up to a cache line --
//! [metadata_size, ..)             payload: capacity equal-size slots
//! ```
//!
//! `owner_half`/`freed_half` are recomputed here with the same formula
//! `build.rs` uses to size `metadata_size`, so the two stay in lockstep
//! without either side depending on the other's constants.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::size_class::{self, SizeClassInfo};
use crate::slab_manager::FallbackGuard;

const CACHE_LINE: usize = 64;

/// Owner-state bit: set means UNOWNED (no core holds this slab in a list).
const UNOWNED_BIT: u64 = 1;

/// Outcome of [`Slab::allocate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocOutcome {
    /// A slot was reserved; index is in `[0, capacity)`.
    Slot(usize),
    /// No owner-local slot remains; caller should unlink and try reclaim.
    Full,
    /// The critical section aborted (thread migrated); caller retries.
    Migrated,
}

/// A handle to one slab living at `base` in arena memory.
#[derive(Clone, Copy)]
pub struct Slab {
    base: *mut u8,
}

// A `Slab` is just an address; sending the handle across threads is how the
// cross-core hand-off protocol works in the first place.
unsafe impl Send for Slab {}
unsafe impl Sync for Slab {}

impl Slab {
    /// Wrap a raw slab base pointer. `base` must be `SLAB_SIZE`-aligned and
    /// point at live arena memory.
    #[inline]
    pub unsafe fn at(base: *mut u8) -> Self {
        debug_assert!(!base.is_null());
        Slab { base }
    }

    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    #[inline]
    fn word(&self, offset: usize) -> *mut u64 {
        unsafe { self.base.add(offset) as *mut u64 }
    }

    #[inline]
    fn atomic_word(&self, offset: usize) -> &AtomicU64 {
        unsafe { &*(self.base.add(offset) as *const AtomicU64) }
    }

    /// Byte offset of the end of the owner-local region (summary + groups),
    /// rounded up to a cache line.
    #[inline]
    fn owner_half(num_groups: usize) -> usize {
        (24 + num_groups * 8).div_ceil(CACHE_LINE) * CACHE_LINE
    }

    /// Byte offset of the end of the cross-core region, rounded up to a
    /// cache line. Added to `owner_half` this gives the slab's own estimate
    /// of `metadata_size`; the authoritative value is `SizeClassInfo::metadata_size`
    /// (which may include extra padding per `build.rs`'s `BASE_METADATA` floor).
    #[inline]
    fn freed_half(num_groups: usize) -> usize {
        (16 + num_groups * 8).div_ceil(CACHE_LINE) * CACHE_LINE
    }

    #[inline]
    fn owner_summary_offset() -> usize {
        16
    }

    #[inline]
    fn owner_group_offset(g: usize) -> usize {
        24 + g * 8
    }

    #[inline]
    fn owner_state_offset(num_groups: usize) -> usize {
        Self::owner_half(num_groups)
    }

    #[inline]
    fn freed_summary_offset(num_groups: usize) -> usize {
        Self::owner_half(num_groups) + 8
    }

    #[inline]
    fn freed_group_offset(num_groups: usize, g: usize) -> usize {
        Self::owner_half(num_groups) + 16 + g * 8
    }

    /// Initialize a freshly bump-provided slab for `class`: zeroed bits,
    /// object size written, every owner-local slot marked free, owner state
    /// OWNED, `next` null. Matches the distilled spec's lifecycle: "created
    /// by the bump provider (zero-initialized, all owner-local bits set,
    /// owner state OWNED)".
    pub unsafe fn init(base: *mut u8, class: usize) -> Self {
        let slab = Slab { base };
        let info = size_class::class_info(class);

        unsafe {
            *slab.word(0) = info.object_size as u64;
            *slab.word(8) = 0;
        }

        let mut summary = 0u64;
        for g in 0..info.num_groups {
            let bits_in_group = info.capacity - g * 64;
            let bits_in_group = bits_in_group.min(64);
            let word = if bits_in_group == 64 {
                u64::MAX
            } else {
                (1u64 << bits_in_group) - 1
            };
            unsafe { *slab.word(Self::owner_group_offset(g)) = word };
            if word != 0 {
                summary |= 1 << g;
            }
        }
        unsafe { *slab.word(Self::owner_summary_offset()) = summary };

        slab.atomic_word(Self::owner_state_offset(info.num_groups))
            .store(0, Ordering::Relaxed);
        slab.atomic_word(Self::freed_summary_offset(info.num_groups))
            .store(0, Ordering::Relaxed);
        for g in 0..info.num_groups {
            slab.atomic_word(Self::freed_group_offset(info.num_groups, g))
                .store(0, Ordering::Relaxed);
        }

        slab
    }

    /// Object size recorded in this slab's header.
    #[inline]
    pub fn object_size(&self) -> usize {
        unsafe { *self.word(0) as usize }
    }

    /// The intrusive `next` link, owning-core-only.
    #[inline]
    pub fn next(&self) -> *mut u8 {
        (unsafe { *self.word(8) }) as *mut u8
    }

    #[inline]
    pub fn set_next(&self, next: *mut u8) {
        unsafe { *self.word(8) = next as u64 };
    }

    /// Address of `payload[index]` for a slab of this `class`.
    #[inline]
    pub fn slot_addr(&self, class: usize, index: usize) -> *mut u8 {
        let info = size_class::class_info(class);
        debug_assert!(index < info.capacity);
        unsafe { self.base.add(info.metadata_size + index * info.object_size) }
    }

    /// Recover the slot index of `addr` within this slab, given `class`.
    #[inline]
    pub fn slot_index(&self, class: usize, addr: *mut u8) -> usize {
        let info = size_class::class_info(class);
        let rel = addr as usize - self.base as usize - info.metadata_size;
        rel / info.object_size
    }

    // ── allocate ─────────────────────────────────────────────────────────

    /// Reserve one slot from the owner-local bitmap. Must be called only by
    /// the slab's current owning core, keyed on `start_cpu`.
    ///
    /// Under `feature = "percpu"` this runs as a restartable critical
    /// section via `rseq::slab_ops::slab_try_allocate`; migration aborts
    /// return [`AllocOutcome::Migrated`]. Otherwise it runs under the
    /// portable fallback spinlock, which cannot itself be migrated away
    /// from, so [`AllocOutcome::Migrated`] is never returned in that mode.
    pub fn allocate(&self, class: usize, core: usize) -> AllocOutcome {
        let info = size_class::class_info(class);

        cfg_if::cfg_if! {
            if #[cfg(feature = "percpu")] {
                let Some(rseq) = crate::slab_manager::current_rseq() else {
                    return self.allocate_fallback(class, info, core);
                };
                loop {
                    let summary = self.word(Self::owner_summary_offset());
                    let groups = self.word(Self::owner_group_offset(0));
                    let raw = unsafe { rseq::slab_try_allocate(rseq, summary, groups) };
                    return match raw {
                        rseq::ALLOC_FULL => AllocOutcome::Full,
                        rseq::ALLOC_MIGRATED => AllocOutcome::Migrated,
                        rseq::ALLOC_RETRY => continue,
                        slot => AllocOutcome::Slot(slot as usize),
                    };
                }
            } else {
                self.allocate_fallback(class, info, core)
            }
        }
    }

    /// Portable (non-rseq) implementation of the allocate algorithm,
    /// serialized by a per-(class, core) spinlock instead of a restartable
    /// sequence. Never returns [`AllocOutcome::Migrated`].
    fn allocate_fallback(&self, class: usize, info: &SizeClassInfo, core: usize) -> AllocOutcome {
        let _guard = FallbackGuard::acquire(class, core);
        loop {
            let summary_ptr = self.word(Self::owner_summary_offset());
            let summary = unsafe { *summary_ptr };
            if summary == 0 {
                return AllocOutcome::Full;
            }
            let g = summary.trailing_zeros() as usize;
            let group_ptr = self.word(Self::owner_group_offset(g));
            let word = unsafe { *group_ptr };
            if word == 0 {
                unsafe { *summary_ptr = summary & !(1 << g) };
                continue;
            }
            let s = word.trailing_zeros() as usize;
            unsafe { *group_ptr = word & !(1 << s) };
            return AllocOutcome::Slot(g * 64 + s);
        }
    }

    // ── free / reclaim / ownership ──────────────────────────────────────

    /// Mark `index` free in the cross-core bitmap. Returns `true` iff the
    /// slab's owner state is UNOWNED at this moment (the caller should try
    /// [`Slab::claim_ownership`]).
    pub fn free(&self, class: usize, index: usize) -> bool {
        let info = size_class::class_info(class);
        let g = index / 64;
        let s = index % 64;

        let group = self.atomic_word(Self::freed_group_offset(info.num_groups, g));
        let before = group.fetch_or(1 << s, Ordering::Relaxed);
        if before == 0 {
            self.atomic_word(Self::freed_summary_offset(info.num_groups))
                .fetch_or(1 << g, Ordering::Relaxed);
        }

        self.atomic_word(Self::owner_state_offset(info.num_groups))
            .load(Ordering::Acquire)
            & UNOWNED_BIT
            != 0
    }

    /// Called by the owning core when its local summary word reached zero.
    /// Drains the cross-core freed bits back into the owner-local bits, or
    /// transitions to UNOWNED if there is nothing to reclaim. Returns `true`
    /// iff the slab is now empty (UNOWNED, dropped from the core's list).
    pub fn try_reclaim(&self, class: usize) -> bool {
        let info = size_class::class_info(class);
        let freed_summary = self.atomic_word(Self::freed_summary_offset(info.num_groups));

        let observed = freed_summary.load(Ordering::Acquire);
        if observed == 0 {
            self.atomic_word(Self::owner_state_offset(info.num_groups))
                .store(UNOWNED_BIT, Ordering::Release);
            return true;
        }

        let claimed = freed_summary.fetch_and(!observed, Ordering::AcqRel) & observed;
        if claimed == 0 {
            // A concurrent racer already reclaimed everything we observed.
            return false;
        }

        let mut owner_summary = unsafe { *self.word(Self::owner_summary_offset()) };
        let mut bits = claimed;
        while bits != 0 {
            let g = bits.trailing_zeros() as usize;
            bits &= bits - 1;

            let freed_group = self.atomic_word(Self::freed_group_offset(info.num_groups, g));
            let reclaimed_mask = freed_group.fetch_and(0, Ordering::AcqRel);
            if reclaimed_mask == 0 {
                continue;
            }
            let owner_group = self.word(Self::owner_group_offset(g));
            unsafe { *owner_group |= reclaimed_mask };
            owner_summary |= 1 << g;
        }
        unsafe { *self.word(Self::owner_summary_offset()) = owner_summary };

        false
    }

    /// Atomically clear the UNOWNED bit. Returns `true` iff this call
    /// observed the UNOWNED -> OWNED transition (only the winner may
    /// publish the slab onto a manager).
    pub fn claim_ownership(&self, class: usize) -> bool {
        let info = size_class::class_info(class);
        let prev = self
            .atomic_word(Self::owner_state_offset(info.num_groups))
            .fetch_and(!UNOWNED_BIT, Ordering::AcqRel);
        prev & UNOWNED_BIT != 0
    }

    /// `true` iff the slab's owner state is currently UNOWNED. Debug/test
    /// helper — production code drives this via `free`'s return value.
    #[cfg(test)]
    pub fn is_unowned(&self, class: usize) -> bool {
        let info = size_class::class_info(class);
        self.atomic_word(Self::owner_state_offset(info.num_groups))
            .load(Ordering::Acquire)
            & UNOWNED_BIT
            != 0
    }

    #[cfg(test)]
    pub fn owner_local_full(&self, class: usize) -> bool {
        let info = size_class::class_info(class);
        let mut total_free = 0usize;
        for g in 0..info.num_groups {
            total_free += unsafe { *self.word(Self::owner_group_offset(g)) }.count_ones() as usize;
        }
        total_free == info.capacity
    }
}
