//! Bump slab provider: hands out fresh, zeroed, slab-sized and slab-aligned
//! regions from one large pre-reserved virtual memory range.
//!
//! Grounded 1:1 on `examples/original_source/allocator/slab_allocation.h`'s
//! `shared_memory_slab_allocator` (`current_slab` advanced by
//! `__atomic_fetch_add`, `out_of_memory` comparing against the range's end).
//! The reservation itself, and its advisory discard at [`Region::reset`],
//! are grounded on the teacher's `platform::page_alloc`/`page_decommit`.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::config::SLAB_SIZE;
use crate::error::Error;
use crate::layout;
use crate::platform;
use crate::slab_manager::Manager;

/// One process-wide arena: the manager grid and bump cursor (`src/layout.rs`)
/// followed by the slab region they describe.
pub struct Region {
    /// `SLAB_SIZE`-aligned start of the arena (offset 0 in every
    /// `layout`/`slab_manager` calculation).
    base: *mut u8,
    /// The raw pointer returned by `platform::page_alloc`, kept only to
    /// hand back to `page_dealloc`/`page_decommit` on drop/reset — may
    /// differ from `base` by up to `SLAB_SIZE - 1` bytes.
    mapped_base: *mut u8,
    mapped_len: usize,
    /// The logical arena size this `Region` was constructed with (not the
    /// over-allocated `mapped_len`).
    region_size: usize,
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Reserve a fresh arena of `region_size` bytes. `region_size` must
    /// leave room for the manager grid, the bump cursor, and at least one
    /// slab (see [`layout::minimum_region_size`]).
    pub fn new(region_size: usize) -> Result<Self, Error> {
        let minimum = layout::minimum_region_size();
        if region_size < minimum {
            return Err(Error::RegionTooSmall {
                requested: region_size,
                minimum,
            });
        }

        // `platform::page_alloc` only guarantees the platform's own page
        // alignment, which is smaller than `SLAB_SIZE`; over-allocate by one
        // slab and take an aligned subrange, the same trick
        // `platform/unix.rs::page_alloc` already plays one level down for
        // `PAGE_SIZE`.
        let mapped_len = region_size + SLAB_SIZE;
        let mapped_base = unsafe { platform::page_alloc(mapped_len) };
        if mapped_base.is_null() {
            return Err(Error::OsReservationFailed);
        }

        let raw = mapped_base as usize;
        let aligned = (raw + SLAB_SIZE - 1) & !(SLAB_SIZE - 1);
        let base = aligned as *mut u8;

        let region = Region {
            base,
            mapped_base,
            mapped_len,
            region_size,
        };
        region.cursor_word().store(layout::header_size_aligned() as u64, Ordering::Relaxed);
        Ok(region)
    }

    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    #[inline]
    pub fn region_size(&self) -> usize {
        self.region_size
    }

    #[inline]
    fn cursor_word(&self) -> &AtomicU64 {
        unsafe { &*(self.base.add(layout::CURSOR_OFFSET) as *const AtomicU64) }
    }

    /// Hand out one fresh slab-sized, slab-aligned, zero-initialized region,
    /// or `None` once the arena is exhausted.
    ///
    /// Mirrors `shared_memory_slab_allocator::_new`/`out_of_memory`: the
    /// cursor is advanced unconditionally (so concurrent racers never block
    /// each other), and a result past `end` is simply discarded — the
    /// pointer is never dereferenced, so an overshoot under contention is
    /// observable only as a few wasted fetch-adds, never as unsound memory
    /// access.
    pub fn alloc_slab(&self) -> Option<*mut u8> {
        let end = layout::slab_region_end(self.region_size);
        let prev = self.cursor_word().fetch_add(SLAB_SIZE as u64, Ordering::Relaxed);
        if prev as usize >= end {
            return None;
        }
        Some(unsafe { self.base.add(prev as usize) })
    }

    /// View onto the `(class, core)` manager cell living in this arena.
    #[inline]
    pub fn manager(&self, class: usize, core: usize) -> Manager {
        unsafe { Manager::at(self.base, class, core) }
    }

    /// Whether `addr` falls inside this arena's slab region (as opposed to
    /// being an oversize allocation served directly by `platform::page_alloc`).
    #[inline]
    pub fn in_range(&self, addr: *const u8) -> bool {
        let base = self.base as usize;
        let a = addr as usize;
        a >= base && layout::in_slab_region(a - base, self.region_size)
    }

    /// Advisory teardown: discard the arena's physical pages back to the OS
    /// and rewind the bump cursor, without unmapping the virtual range.
    /// Grounded on `object_allocator::~object_allocator`'s `madv_free` call.
    pub fn reset(&self) {
        unsafe {
            platform::page_decommit(self.mapped_base, self.mapped_len);
            platform::page_recommit(self.mapped_base, self.mapped_len);
        }
        self.cursor_word().store(layout::header_size_aligned() as u64, Ordering::Relaxed);
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe { platform::page_dealloc(self.mapped_base, self.mapped_len) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_too_small_is_rejected() {
        let err = Region::new(1).unwrap_err();
        assert!(matches!(err, Error::RegionTooSmall { .. }));
    }

    #[test]
    fn alloc_slab_yields_aligned_distinct_pointers() {
        let region_size = layout::minimum_region_size() + 4 * SLAB_SIZE;
        let region = Region::new(region_size).expect("reservation should succeed");

        let mut seen = std::collections::HashSet::new();
        loop {
            match region.alloc_slab() {
                Some(ptr) => {
                    assert_eq!(ptr as usize % SLAB_SIZE, 0);
                    assert!(seen.insert(ptr as usize), "bump provider handed out a duplicate slab");
                }
                None => break,
            }
        }
        assert!(seen.len() >= 4);
    }

    #[test]
    fn alloc_slab_exhausts_then_returns_none() {
        let region_size = layout::minimum_region_size();
        let region = Region::new(region_size).expect("reservation should succeed");
        assert!(region.alloc_slab().is_some());
        assert!(region.alloc_slab().is_none());
        assert!(region.alloc_slab().is_none());
    }

    #[test]
    fn in_range_excludes_header_and_addresses_outside_arena() {
        let region_size = layout::minimum_region_size() + SLAB_SIZE;
        let region = Region::new(region_size).expect("reservation should succeed");

        assert!(!region.in_range(region.base()));
        let slab = region.alloc_slab().expect("should have room for one slab");
        assert!(region.in_range(slab));
        assert!(region.in_range(unsafe { slab.add(SLAB_SIZE - 1) }));

        let outside = (region.base() as usize + region_size + 10 * SLAB_SIZE) as *const u8;
        assert!(!region.in_range(outside));
    }

    #[test]
    fn reset_rewinds_the_cursor() {
        let region_size = layout::minimum_region_size() + SLAB_SIZE;
        let region = Region::new(region_size).expect("reservation should succeed");
        region.alloc_slab().unwrap();
        region.alloc_slab().unwrap();
        assert!(region.alloc_slab().is_none());

        region.reset();
        assert!(region.alloc_slab().is_some());
    }
}
