//! Size-class table and lookup functions.
//!
//! Objects are bucketed into a small number of size classes, each served by
//! its own slab geometry. Unlike a per-class monomorphized slab type, every
//! slab carries its own `object_size`/`capacity`/`num_groups`/`metadata_size`
//! in its header (the "templated-per-size" layout), so one slab type and one
//! manager-grid type serve every class — see [`crate::slab`].

/// Per-class geometry: object size, slot count, bitmap group count, and the
/// byte offset of the payload within the slab.
#[derive(Clone, Copy, Debug)]
pub struct SizeClassInfo {
    /// Allocation size for this class (bytes). Requests are rounded up to
    /// this size.
    pub object_size: usize,
    /// Number of equal-size slots in one slab of this class.
    pub capacity: usize,
    /// Number of 64-bit bitmap groups needed to cover `capacity` slots.
    pub num_groups: usize,
    /// Byte offset from the slab base to `payload[0]`.
    pub metadata_size: usize,
}

include!(concat!(env!("OUT_DIR"), "/size_class_gen.rs"));

/// Number of defined size classes, including the unused sentinel at index 0.
pub const NUM_SIZE_CLASSES: usize = SIZE_CLASSES.len();

/// Largest object size served by the slab machinery. Requests above this
/// bypass the slab path entirely (see `allocator::alloc_large`).
pub const MAX_SMALL_SIZE: usize = SIZE_CLASSES[NUM_SIZE_CLASSES - 1].object_size;

/// Map an allocation size to its size-class index.
///
/// Returns 0 for sizes above [`MAX_SMALL_SIZE`] (the caller should treat 0 as
/// "not a slab class" and fall through to the oversize path). Size 0 is
/// treated as the smallest class, matching `GlobalAlloc`'s convention that
/// every nonzero layout gets a real allocation.
#[inline]
pub fn size_to_class(size: usize) -> usize {
    if size > MAX_SMALL_SIZE {
        return 0;
    }
    let mut cls = 1;
    while cls < NUM_SIZE_CLASSES {
        if SIZE_CLASSES[cls].object_size >= size {
            return cls;
        }
        cls += 1;
    }
    0
}

/// Object size served by a given class index.
#[inline]
pub fn class_to_size(cls: usize) -> usize {
    SIZE_CLASSES[cls].object_size
}

/// Full geometry for a given class index.
#[inline]
pub fn class_info(cls: usize) -> &'static SizeClassInfo {
    &SIZE_CLASSES[cls]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_to_class_zero() {
        let cls = size_to_class(0);
        assert_eq!(cls, 1);
        assert_eq!(class_to_size(cls), 8);
    }

    #[test]
    fn test_size_to_class_exact() {
        for &sz in &[8, 16, 24, 32, 48, 64, 80, 96, 112, 128, 144] {
            assert_eq!(class_to_size(size_to_class(sz)), sz);
        }
    }

    #[test]
    fn test_size_to_class_rounds_up() {
        assert_eq!(class_to_size(size_to_class(1)), 8);
        assert_eq!(class_to_size(size_to_class(9)), 16);
        assert_eq!(class_to_size(size_to_class(17)), 24);
        assert_eq!(class_to_size(size_to_class(33)), 48);
        assert_eq!(class_to_size(size_to_class(129)), 144);
    }

    #[test]
    fn test_size_to_class_large() {
        assert_eq!(size_to_class(MAX_SMALL_SIZE + 1), 0);
        assert_eq!(size_to_class(1_000_000), 0);
    }

    #[test]
    fn test_round_trip_all_classes() {
        for cls in 1..NUM_SIZE_CLASSES {
            let size = class_to_size(cls);
            assert!(size > 0, "class {cls} has zero size");
            assert_eq!(size_to_class(size), cls, "round-trip failed for class {cls}");
        }
    }

    #[test]
    fn test_classes_monotonically_increasing() {
        for i in 2..NUM_SIZE_CLASSES {
            assert!(SIZE_CLASSES[i].object_size > SIZE_CLASSES[i - 1].object_size);
        }
    }

    #[test]
    fn test_all_sizes_8_aligned() {
        for cls in 1..NUM_SIZE_CLASSES {
            assert_eq!(SIZE_CLASSES[cls].object_size % 8, 0);
        }
    }

    #[test]
    fn test_capacity_and_metadata_fit_in_one_slab() {
        for cls in 1..NUM_SIZE_CLASSES {
            let info = &SIZE_CLASSES[cls];
            assert!(info.capacity * info.object_size + info.metadata_size <= crate::config::SLAB_SIZE);
            assert!(info.num_groups * 64 >= info.capacity);
        }
    }
}
