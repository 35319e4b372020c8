//! Top-level allocator: ties the arena, slab manager, and OS oversize path
//! together and implements `GlobalAlloc`.
//!
//! [`Allocator`] is a constructible, testable handle over one [`Region`] —
//! useful for isolated-arena tests or embedding more than one arena in a
//! process. [`RtMalloc`] is the zero-sized `#[global_allocator]`-installable
//! type; it lazily reserves its own process-wide [`Region`] on first use and,
//! after that one-time construction, never takes a lock on the allocation
//! hot path (see [`get_region`]).
//!
//! Routing, grounded on `examples/original_source/allocator/object_allocator.h`'s
//! `allocate`/`free` dispatch between the per-class slab path and the
//! system allocator fallback:
//! - `size == 0` → a dangling `layout.align()`-aligned pointer, per
//!   `GlobalAlloc`'s own contract.
//! - `size` fits a size class and the slot's guaranteed alignment (the
//!   metadata/slab-size rounding in `build.rs`) covers `layout.align()` →
//!   slab path ([`alloc_small`]/[`free_small`]).
//! - otherwise → the oversize path ([`alloc_oversize`]/[`free_oversize`]),
//!   which never touches the arena at all.

use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use core::alloc::{GlobalAlloc, Layout};

use crate::error::Error;
use crate::platform;
use crate::region::Region;
use crate::size_class;
use crate::slab::{AllocOutcome, Slab};
use crate::slab_manager::{self, Manager};
use crate::sync::SpinMutex;
use crate::{hist_record, stat_add, stat_inc};

/// Largest alignment a slot's address is guaranteed to satisfy: slabs are
/// `SLAB_SIZE`-aligned, but the payload offset (`metadata_size`) is only
/// guaranteed rounded to a cache line by `build.rs`, so slot alignment
/// beyond that is not guaranteed class-to-class.
const MAX_SLAB_ALIGN: usize = 64;

/// Alignment `platform::page_alloc` itself already guarantees. Oversize
/// requests at or below this need no extra trimming.
const MMAP_ALIGN: usize = platform::PLATFORM_ALIGN;

/// Size in bytes of the inline header written just before the returned
/// pointer for over-aligned oversize allocations (see [`alloc_oversize`]).
const OVERSIZE_HEADER: usize = 16;

/// A handle over one independently constructed arena.
///
/// Unlike [`RtMalloc`], an `Allocator` is never installed as
/// `#[global_allocator]` — it exists for tests and embedders that want a
/// smaller, disposable arena (or several of them) without touching the
/// process-wide allocator.
pub struct Allocator {
    region: Region,
}

impl Allocator {
    /// Reserve a fresh `region_size`-byte arena.
    pub fn new(region_size: usize) -> Result<Self, Error> {
        Ok(Allocator {
            region: Region::new(region_size)?,
        })
    }

    /// Discard this arena's physical pages back to the OS and rewind it to
    /// freshly-reserved state. Any pointers still outstanding from this
    /// arena become invalid.
    pub fn reset(&self) {
        self.region.reset();
    }

    /// Whether `addr` was (or could have been) handed out by this arena's
    /// slab path, as opposed to the oversize path.
    pub fn in_range(&self, addr: *const u8) -> bool {
        self.region.in_range(addr)
    }

    /// # Safety
    /// Same contract as [`GlobalAlloc::alloc`].
    pub unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        unsafe { do_alloc(Some(&self.region), layout) }
    }

    /// # Safety
    /// Same contract as [`GlobalAlloc::dealloc`].
    pub unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { do_dealloc(Some(&self.region), ptr, layout) };
    }

    /// # Safety
    /// Same contract as [`GlobalAlloc::alloc_zeroed`].
    pub unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        unsafe { do_alloc_zeroed(Some(&self.region), layout) }
    }

    /// # Safety
    /// Same contract as [`GlobalAlloc::realloc`].
    pub unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        unsafe { do_realloc(Some(&self.region), ptr, layout, new_size) }
    }
}

// ── process-wide arena, lazily initialized ─────────────────────────────────

/// One-time construction race for the global arena. Never touched again
/// after [`get_region`] observes [`GLOBAL_REGION`] non-null — the
/// allocation hot path takes no lock.
static INIT_LOCK: SpinMutex<Option<Region>> = SpinMutex::new(None);
static GLOBAL_REGION: AtomicPtr<Region> = AtomicPtr::new(ptr::null_mut());

/// Returns the process-wide arena, lazily reserving it on first call.
/// Returns `None` if the reservation itself failed (the oversize path still
/// works in that case; only slab-backed allocations are unavailable).
#[inline]
fn get_region() -> Option<&'static Region> {
    let cached = GLOBAL_REGION.load(Ordering::Acquire);
    if !cached.is_null() {
        return Some(unsafe { &*cached });
    }
    init_region_slow()
}

#[cold]
fn init_region_slow() -> Option<&'static Region> {
    let mut guard = INIT_LOCK.lock();
    if guard.is_none() {
        if let Ok(region) = Region::new(crate::config::REGION_SIZE) {
            *guard = Some(region);
        }
    }
    let region_ref: &'static Region = unsafe { &*(guard.as_ref()? as *const Region) };
    GLOBAL_REGION.store(region_ref as *const Region as *mut Region, Ordering::Release);
    Some(region_ref)
}

/// The process-wide, lazily-initialized slab allocator.
///
/// Register as the global allocator with:
/// ```ignore
/// #[global_allocator]
/// static GLOBAL: rtmalloc::RtMalloc = rtmalloc::RtMalloc;
/// ```
pub struct RtMalloc;

impl RtMalloc {
    /// Install a custom-sized arena as the global allocator's backing
    /// region, ahead of its first lazy use.
    ///
    /// Returns [`Error::ArenaAlreadyInitialized`] if the global arena has
    /// already been constructed (by an earlier call to this function, or by
    /// an allocation that already ran the lazy-init path).
    pub fn new_arena(region_size: usize) -> Result<(), Error> {
        let mut guard = INIT_LOCK.lock();
        if guard.is_some() || !GLOBAL_REGION.load(Ordering::Acquire).is_null() {
            return Err(Error::ArenaAlreadyInitialized);
        }
        let region = Region::new(region_size)?;
        *guard = Some(region);
        let region_ref: &'static Region = unsafe { &*(guard.as_ref().unwrap() as *const Region) };
        GLOBAL_REGION.store(region_ref as *const Region as *mut Region, Ordering::Release);
        Ok(())
    }
}

unsafe impl GlobalAlloc for RtMalloc {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        unsafe { do_alloc(get_region(), layout) }
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { do_dealloc(get_region(), ptr, layout) };
    }

    #[inline]
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        unsafe { do_alloc_zeroed(get_region(), layout) }
    }

    #[inline]
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        unsafe { do_realloc(get_region(), ptr, layout, new_size) }
    }
}

#[cfg(feature = "nightly")]
unsafe impl core::alloc::Allocator for RtMalloc {
    fn allocate(
        &self,
        layout: Layout,
    ) -> Result<core::ptr::NonNull<[u8]>, core::alloc::AllocError> {
        let ptr = unsafe { GlobalAlloc::alloc(self, layout) };
        if ptr.is_null() {
            Err(core::alloc::AllocError)
        } else {
            let slice = core::ptr::slice_from_raw_parts_mut(ptr, layout.size());
            Ok(unsafe { core::ptr::NonNull::new_unchecked(slice) })
        }
    }

    unsafe fn deallocate(&self, ptr: core::ptr::NonNull<u8>, layout: Layout) {
        unsafe { GlobalAlloc::dealloc(self, ptr.as_ptr(), layout) }
    }
}

// ── shared alloc/dealloc/realloc logic ──────────────────────────────────────

/// Whether a slot of `class`, placed anywhere in a slab, is guaranteed to
/// satisfy `align`. Slabs are `SLAB_SIZE`-aligned and every slot lands at
/// `metadata_size + i * object_size`; both terms are only guaranteed
/// multiples of a cache line (`MAX_SLAB_ALIGN`), so beyond that the class
/// size itself must also be an exact multiple of `align`.
#[inline]
fn slab_satisfies_align(class_size: usize, align: usize) -> bool {
    align <= MAX_SLAB_ALIGN && class_size.is_multiple_of(align)
}

unsafe fn do_alloc(region: Option<&Region>, layout: Layout) -> *mut u8 {
    let size = layout.size();
    if size == 0 {
        return layout.align() as *mut u8;
    }

    stat_inc!(alloc_count);
    stat_add!(alloc_bytes, size as u64);
    hist_record!(size);

    let align = layout.align();
    let class = if align <= 8 {
        size_class::size_to_class(size)
    } else {
        let effective_size = size.max(align);
        let class = size_class::size_to_class(effective_size);
        if class != 0 && slab_satisfies_align(size_class::class_to_size(class), align) {
            class
        } else {
            0
        }
    };

    if class != 0 {
        if let Some(region) = region {
            let ptr = unsafe { alloc_small(region, class) };
            if !ptr.is_null() {
                return ptr;
            }
        }
    }

    unsafe { alloc_oversize(layout) }
}

unsafe fn do_alloc_zeroed(region: Option<&Region>, layout: Layout) -> *mut u8 {
    let ptr = unsafe { do_alloc(region, layout) };
    if !ptr.is_null() && layout.size() > 0 {
        unsafe { ptr::write_bytes(ptr, 0, layout.size()) };
    }
    ptr
}

unsafe fn do_dealloc(region: Option<&Region>, ptr: *mut u8, layout: Layout) {
    if layout.size() == 0 {
        return;
    }
    stat_inc!(dealloc_count);

    if let Some(region) = region {
        if region.in_range(ptr) {
            unsafe { free_small(region, ptr) };
            return;
        }
    }
    unsafe { free_oversize(ptr, layout) };
}

unsafe fn do_realloc(
    region: Option<&Region>,
    ptr: *mut u8,
    layout: Layout,
    new_size: usize,
) -> *mut u8 {
    if ptr.is_null() || layout.size() == 0 {
        let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
        return unsafe { do_alloc(region, new_layout) };
    }
    if new_size == 0 {
        unsafe { do_dealloc(region, ptr, layout) };
        return layout.align() as *mut u8;
    }

    stat_inc!(realloc_count);

    // No in-place grow: the slab path has no notion of "the next size class
    // up is free", and the oversize path has no span to extend. Always
    // alloc-new + copy + free-old, matching the distilled spec's explicit
    // realloc semantics.
    let old_usable = match region {
        Some(region) if region.in_range(ptr) => unsafe { slab_for(region, ptr) }.object_size(),
        _ => layout.size(),
    };

    let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
    let new_ptr = unsafe { do_alloc(region, new_layout) };
    if !new_ptr.is_null() {
        unsafe { ptr::copy_nonoverlapping(ptr, new_ptr, old_usable.min(new_size)) };
        unsafe { do_dealloc(region, ptr, layout) };
    }
    new_ptr
}

// ── slab path ────────────────────────────────────────────────────────────

/// Recover the `Slab` handle owning `ptr`, using the alignment-equals-size
/// property of slabs (`addr & !(SLAB_SIZE - 1)` relative to the arena base).
/// `ptr` must satisfy `region.in_range(ptr)`.
#[inline]
unsafe fn slab_for(region: &Region, ptr: *mut u8) -> Slab {
    let offset = ptr as usize - region.base() as usize;
    let slab_base = region.base() as usize + crate::layout::slab_base_of(offset);
    unsafe { Slab::at(slab_base as *mut u8) }
}

/// Serve one allocation of `class` from `region`: free-cache pop, then the
/// owner-local bitmap, minting a fresh slab from the bump provider if every
/// existing slab for this `(class, core)` is full.
///
/// Grounded on `object_allocator.h::allocate`'s loop over
/// "try free list, try current slab, advance to next slab, mint a new one".
unsafe fn alloc_small(region: &Region, class: usize) -> *mut u8 {
    let core = slab_manager::current_core();
    let manager = region.manager(class, core);

    if let Some(ptr) = manager.try_pop(class, core) {
        stat_inc!(free_cache_hits);
        return ptr;
    }
    stat_inc!(free_cache_misses);

    loop {
        let mut head = manager.head();
        while !head.is_null() {
            let slab = unsafe { Slab::at(head) };
            match slab.allocate(class, core) {
                AllocOutcome::Slot(idx) => {
                    stat_inc!(slab_allocs);
                    return slab.slot_addr(class, idx);
                }
                AllocOutcome::Migrated => {
                    head = manager.head();
                    continue;
                }
                AllocOutcome::Full => {
                    stat_inc!(slab_full_events);
                    // Unlink first (per spec §4.4 / object_allocator.h's
                    // _cas_set_next_available_slab-before-_try_release
                    // ordering): a slab's owner state must never read
                    // UNOWNED while it is still reachable from this
                    // manager's list, since a concurrent cross-core free
                    // takes no fallback lock on `next`.
                    if !manager.advance_head(class, core, head) {
                        head = manager.head();
                        continue;
                    }
                    slab.set_next(ptr::null_mut());
                    stat_inc!(reclaim_attempts);
                    if !slab.try_reclaim(class) {
                        // Cross-core frees arrived; the slab is usable
                        // again, so re-publish it onto this core's list.
                        stat_inc!(reclaim_recovered);
                        manager.publish(class, core, slab.base());
                    }
                    // Else the slab is now UNOWNED and already unlinked;
                    // it drops out of rotation until some core's free
                    // claims it back.
                    head = manager.head();
                    continue;
                }
            }
        }

        // No owned slab had room: mint a fresh one from the bump provider.
        let Some(base) = region.alloc_slab() else {
            return ptr::null_mut();
        };
        stat_inc!(bump_slab_allocs);
        let slab = unsafe { Slab::init(base, class) };
        manager.publish(class, core, slab.base());
    }
}

/// Free `ptr` (known to live inside `region`'s slab range) back to its slab.
///
/// Always tries the manager's free cache first (a same-core, same-class
/// free is the overwhelmingly common case). If the cache is full, falls
/// through to the slab bitmap directly, handling the cross-core hand-off:
/// when a non-owning core's free leaves the slab UNOWNED, the freeing core
/// (not the original owner) claims it and publishes it onto its own
/// manager, per the distilled spec's data-flow description — freed objects
/// become fungible pool members rather than being returned to their origin.
unsafe fn free_small(region: &Region, ptr: *mut u8) {
    let slab = unsafe { slab_for(region, ptr) };
    let object_size = slab.object_size();
    let class = size_class::size_to_class(object_size);
    let core = slab_manager::current_core();
    let manager = region.manager(class, core);

    if manager.try_push(class, core, ptr) {
        return;
    }

    let index = slab.slot_index(class, ptr);
    let now_unowned = slab.free(class, index);
    if now_unowned && slab.claim_ownership(class) {
        stat_inc!(slab_claims);
        slab.set_next(ptr::null_mut());
        manager.publish(class, core, slab.base());
    }
}

// ── oversize path ───────────────────────────────────────────────────────

/// Allocations above [`size_class::MAX_SMALL_SIZE`] (or whose alignment the
/// slab path can't satisfy) are served directly by `platform::page_alloc`,
/// bypassing the arena entirely — there is no pagemap or span bookkeeping
/// in this design, so these requests are distinguished from slab addresses
/// purely by [`Region::in_range`].
///
/// `align <= MMAP_ALIGN` needs no extra work: `platform::page_alloc` itself
/// already guarantees that alignment, and hands back a block whose valid
/// range is exactly the requested `size` bytes.
///
/// `align > MMAP_ALIGN` over-allocates `size + align + OVERSIZE_HEADER`
/// bytes and carves the aligned pointer out of the middle, writing the raw
/// pointer and mapped length into an inline header immediately before it —
/// the only way to recover them at `free_oversize`/realloc time without a
/// side table, since the returned pointer's offset from the raw mmap base
/// isn't fixed (it depends on where the raw allocation happened to land
/// relative to `align`).
unsafe fn alloc_oversize(layout: Layout) -> *mut u8 {
    stat_inc!(oversize_allocs);
    let size = layout.size();
    let align = layout.align();

    if align <= MMAP_ALIGN {
        stat_inc!(os_alloc_count);
        stat_add!(os_alloc_bytes, size as u64);
        return unsafe { platform::page_alloc(size) };
    }

    let total = size + align + OVERSIZE_HEADER;
    stat_inc!(os_alloc_count);
    stat_add!(os_alloc_bytes, total as u64);
    let raw = unsafe { platform::page_alloc(total) };
    if raw.is_null() {
        return ptr::null_mut();
    }

    let want = raw as usize + OVERSIZE_HEADER;
    let aligned = (want + align - 1) & !(align - 1);
    let header = (aligned - OVERSIZE_HEADER) as *mut u64;
    unsafe {
        *header = raw as u64;
        *header.add(1) = total as u64;
    }
    aligned as *mut u8
}

unsafe fn free_oversize(ptr: *mut u8, layout: Layout) {
    let align = layout.align();
    if align <= MMAP_ALIGN {
        unsafe { platform::page_dealloc(ptr, layout.size()) };
        return;
    }
    let header = unsafe { (ptr as *mut u64).sub(2) };
    let raw = unsafe { *header } as *mut u8;
    let total = unsafe { *header.add(1) } as usize;
    unsafe { platform::page_dealloc(raw, total) };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_layout(size: usize, align: usize) -> Layout {
        Layout::from_size_align(size, align).unwrap()
    }

    #[test]
    fn alloc_dealloc_round_trip_small() {
        let a = Allocator::new(crate::layout::minimum_region_size() + 16 * crate::config::SLAB_SIZE)
            .unwrap();
        let layout = small_layout(24, 8);
        let ptr = unsafe { a.alloc(layout) };
        assert!(!ptr.is_null());
        assert!(a.in_range(ptr));
        unsafe {
            ptr::write_bytes(ptr, 0xAB, layout.size());
            a.dealloc(ptr, layout);
        }
    }

    #[test]
    fn alloc_zero_size_returns_dangling_aligned() {
        let a = Allocator::new(crate::layout::minimum_region_size() + crate::config::SLAB_SIZE)
            .unwrap();
        let layout = small_layout(0, 16);
        let ptr = unsafe { a.alloc(layout) };
        assert_eq!(ptr as usize % 16, 0);
    }

    #[test]
    fn oversize_alloc_is_out_of_arena_range() {
        let a = Allocator::new(crate::layout::minimum_region_size() + crate::config::SLAB_SIZE)
            .unwrap();
        let layout = small_layout(size_class::MAX_SMALL_SIZE + 1, 8);
        let ptr = unsafe { a.alloc(layout) };
        assert!(!ptr.is_null());
        assert!(!a.in_range(ptr));
        unsafe { a.dealloc(ptr, layout) };
    }

    #[test]
    fn over_aligned_oversize_round_trips() {
        let a = Allocator::new(crate::layout::minimum_region_size() + crate::config::SLAB_SIZE)
            .unwrap();
        for &align in &[16384usize, 32768, 65536] {
            let layout = small_layout(align, align);
            let ptr = unsafe { a.alloc(layout) };
            assert!(!ptr.is_null());
            assert_eq!(ptr as usize % align, 0);
            unsafe {
                ptr::write_bytes(ptr, 0x42, layout.size());
                a.dealloc(ptr, layout);
            }
        }
    }

    #[test]
    fn realloc_grow_preserves_prefix() {
        let a = Allocator::new(crate::layout::minimum_region_size() + 16 * crate::config::SLAB_SIZE)
            .unwrap();
        let layout = small_layout(16, 8);
        let ptr = unsafe { a.alloc(layout) };
        unsafe { ptr::write_bytes(ptr, 0x11, 16) };
        let grown = unsafe { a.realloc(ptr, layout, 64) };
        assert!(!grown.is_null());
        let bytes = unsafe { core::slice::from_raw_parts(grown, 16) };
        assert!(bytes.iter().all(|&b| b == 0x11));
        unsafe { a.dealloc(grown, small_layout(64, 8)) };
    }

    #[test]
    fn many_small_allocations_are_distinct_and_freeable() {
        let a = Allocator::new(crate::layout::minimum_region_size() + 16 * crate::config::SLAB_SIZE)
            .unwrap();
        let layout = small_layout(32, 8);
        let mut ptrs: std::vec::Vec<*mut u8> = std::vec::Vec::new();
        for _ in 0..2000 {
            let ptr = unsafe { a.alloc(layout) };
            assert!(!ptr.is_null());
            ptrs.push(ptr);
        }
        let unique: std::collections::HashSet<usize> =
            ptrs.iter().map(|&p| p as usize).collect();
        assert_eq!(unique.len(), ptrs.len());
        for ptr in ptrs {
            unsafe { a.dealloc(ptr, layout) };
        }
    }
}
