//! Byte-exact arena layout: where the manager grid and bump cursor live
//! relative to the slab region.
//!
//! Grounded on `object_allocator.h`'s `memory_layout` (the `num_classes ×
//! NPROCS` grid of slab managers plus the shared slab allocator) and its
//! `calculate_start`/`calculate_end` helpers, which compute the same
//! "header, then slab-aligned body" split this module implements.
//!
//! Layout of the arena's header region, bytes `[0, H)`:
//!
//! ```text
//! [0, 8)                      bump cursor (u64, fetch-add by SLAB_SIZE)
//! [8, 8 + grid_bytes)         manager grid, row-major [class][core]
//! ```
//!
//! Each grid cell (one per `(size class, core)` pair) is laid out as:
//!
//! ```text
//! [0, 8)                      head (slab pointer, 0 if list empty)
//! [8, 16)                     tail (slab pointer, 0 if list empty)
//! [16, 24)                    free-cache current_idx
//! [24, 24 + 8*capacity)       free-cache ptrs[capacity]
//! ```
//!
//! matching the layout `rseq::slab_ops::{manager_cas_advance_head,
//! manager_publish_tail, free_cache_try_pop, free_cache_try_push}` expect.
//! Bytes `[H_aligned, end)` — the smallest multiple of `SLAB_SIZE` at or
//! above `H`, through the largest multiple of `region_size` at or below the
//! requested size — are a contiguous sequence of slab-sized, slab-aligned
//! slabs handed out by the bump provider.

use crate::config::{FREE_CACHE_CAPACITY, NUM_CORES, SLAB_SIZE};
use crate::size_class::NUM_SIZE_CLASSES;

const CACHE_LINE: usize = 64;

/// Byte offset of the bump cursor within the arena.
pub const CURSOR_OFFSET: usize = 0;

/// Byte size of one manager-grid cell, rounded up to a cache-line multiple.
pub const fn cell_size() -> usize {
    let raw = 24 + FREE_CACHE_CAPACITY * 8;
    raw.div_ceil(CACHE_LINE) * CACHE_LINE
}

/// Byte offset of the start of the manager grid within the arena.
pub const fn grid_offset() -> usize {
    8
}

/// Total bytes occupied by the manager grid.
pub const fn grid_bytes() -> usize {
    NUM_SIZE_CLASSES * NUM_CORES * cell_size()
}

/// Byte offset of the `(class, core)` cell within the arena.
#[inline]
pub fn cell_offset(class: usize, core: usize) -> usize {
    debug_assert!(class < NUM_SIZE_CLASSES);
    debug_assert!(core < NUM_CORES);
    grid_offset() + (class * NUM_CORES + core) * cell_size()
}

/// Size of the header region, `H` in the module doc's layout.
pub const fn header_size() -> usize {
    grid_offset() + grid_bytes()
}

/// `H` rounded up to the next multiple of `SLAB_SIZE` — where the slab
/// region actually begins.
pub const fn header_size_aligned() -> usize {
    header_size().div_ceil(SLAB_SIZE) * SLAB_SIZE
}

/// The arena's usable end, `region_size` rounded down to a multiple of
/// `SLAB_SIZE`.
#[inline]
pub fn slab_region_end(region_size: usize) -> usize {
    (region_size / SLAB_SIZE) * SLAB_SIZE
}

/// Smallest `region_size` that leaves room for at least one slab after the
/// header.
#[inline]
pub fn minimum_region_size() -> usize {
    header_size_aligned() + SLAB_SIZE
}

/// Whether `offset` (relative to the arena base) falls inside the slab
/// region, i.e. `[header_size_aligned(), slab_region_end(region_size))`.
#[inline]
pub fn in_slab_region(offset: usize, region_size: usize) -> bool {
    offset >= header_size_aligned() && offset < slab_region_end(region_size)
}

/// Recover a slab's base offset (relative to the arena base) from any
/// interior offset, using the alignment-equals-size property of slabs.
#[inline]
pub fn slab_base_of(offset: usize) -> usize {
    offset & !(SLAB_SIZE - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_size_is_cache_line_multiple() {
        assert_eq!(cell_size() % CACHE_LINE, 0);
        assert!(cell_size() >= 24 + FREE_CACHE_CAPACITY * 8);
    }

    #[test]
    fn header_size_aligned_is_slab_multiple() {
        assert_eq!(header_size_aligned() % SLAB_SIZE, 0);
        assert!(header_size_aligned() >= header_size());
    }

    #[test]
    fn cell_offsets_are_distinct_and_in_bounds() {
        let grid_end = grid_offset() + grid_bytes();
        for class in 0..NUM_SIZE_CLASSES.min(4) {
            for core in 0..NUM_CORES.min(4) {
                let off = cell_offset(class, core);
                assert!(off + cell_size() <= grid_end);
            }
        }
        assert_ne!(cell_offset(0, 0), cell_offset(0, 1));
        assert_ne!(cell_offset(0, 0), cell_offset(1, 0));
    }

    #[test]
    fn slab_base_of_masks_to_alignment() {
        let base = 3 * SLAB_SIZE;
        assert_eq!(slab_base_of(base + 123), base);
        assert_eq!(slab_base_of(base), base);
    }

    #[test]
    fn in_slab_region_excludes_header_and_tail() {
        let region_size = minimum_region_size() + SLAB_SIZE;
        assert!(!in_slab_region(0, region_size));
        assert!(in_slab_region(header_size_aligned(), region_size));
        assert!(!in_slab_region(slab_region_end(region_size), region_size));
    }
}
