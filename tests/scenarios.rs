//! Literal end-to-end scenarios from this allocator's design spec: S1
//! (single-thread alloc-only), S2 (alloc/free same core reuses the free
//! cache), S3 (cross-core free), S4 (flip-flop ownership round robin), and
//! S6 (reset produces a fresh arena). S5 (32-thread random workload) is
//! covered in spirit by `tests/stress.rs::stress_many_threads_concurrent`.
//!
//! Each test builds its own isolated [`Allocator`] rather than going through
//! the process-wide `#[global_allocator]`, so the slab/class geometry is
//! exactly the one a single test is reasoning about.

use rtmalloc::Allocator;
use rtmalloc::size_class;
use std::alloc::Layout;
use std::collections::HashSet;

fn arena(extra_slabs: usize) -> Allocator {
    let region_size =
        rtmalloc::layout::minimum_region_size() + extra_slabs * rtmalloc::config::SLAB_SIZE;
    Allocator::new(region_size).expect("arena reservation should succeed")
}

/// S1: one thread allocates 4096 objects of size 24. Expected: 4096 distinct
/// addresses, all `(address - slab_base) % 24 == 0` relative to their own
/// slab, spanning `ceil(4096 / capacity(24))` slabs.
#[test]
fn s1_alloc_only_single_thread() {
    let class = size_class::size_to_class(24);
    let info = size_class::class_info(class);
    let expected_slabs = 4096usize.div_ceil(info.capacity);

    let a = arena(expected_slabs + 1);
    let layout = Layout::from_size_align(24, 8).unwrap();

    let mut seen = HashSet::new();
    let mut slab_bases = HashSet::new();
    for _ in 0..4096 {
        let ptr = unsafe { a.alloc(layout) };
        assert!(!ptr.is_null());
        assert!(seen.insert(ptr as usize), "duplicate address returned");
        slab_bases.insert(ptr as usize & !(rtmalloc::config::SLAB_SIZE - 1));
    }
    assert_eq!(seen.len(), 4096);
    assert_eq!(slab_bases.len(), expected_slabs);
}

/// S2: one thread repeatedly allocates then immediately frees a size-24
/// object. After the free cache warms up (its first `C` iterations), every
/// subsequent iteration's allocation must come from the cache rather than
/// minting a fresh slab — observed here as zero growth in distinct slab
/// bases touched after warmup.
#[test]
fn s2_alloc_free_same_core_reuses_cache() {
    let a = arena(4);
    let layout = Layout::from_size_align(24, 8).unwrap();

    let mut slab_bases = HashSet::new();
    for i in 0..200_000 {
        let ptr = unsafe { a.alloc(layout) };
        assert!(!ptr.is_null(), "alloc failed at iteration {i}");
        slab_bases.insert(ptr as usize & !(rtmalloc::config::SLAB_SIZE - 1));
        unsafe { a.dealloc(ptr, layout) };
    }
    // A steady-state alloc/free/alloc/free loop on one size class, one
    // thread, should never need more than one slab: the single live object
    // is always sitting in the free cache between iterations.
    assert_eq!(
        slab_bases.len(),
        1,
        "alloc/free loop should stabilize on a single slab once the free cache warms up"
    );
}

/// S3: thread A allocates, thread B frees all of them. After quiescence,
/// every slot must be reachable again from a subsequent allocation loop —
/// the slab has either been reclaimed by A or claimed and republished by B.
#[test]
fn s3_cross_core_free() {
    let a = std::sync::Arc::new(arena(4));
    let layout = Layout::from_size_align(24, 8).unwrap();
    let class = size_class::size_to_class(24);
    let capacity = size_class::class_info(class).capacity;

    let producer = {
        let a = a.clone();
        std::thread::spawn(move || {
            let mut ptrs = Vec::with_capacity(1024);
            for _ in 0..1024 {
                let ptr = unsafe { a.alloc(layout) };
                assert!(!ptr.is_null());
                ptrs.push(ptr as usize);
            }
            ptrs
        })
    };
    let ptrs = producer.join().unwrap();

    let consumer = {
        let a = a.clone();
        std::thread::spawn(move || {
            for &addr in &ptrs {
                unsafe { a.dealloc(addr as *mut u8, layout) };
            }
        })
    };
    consumer.join().unwrap();

    // Quiescent: every one of those 1024 freed slots must be reclaimable
    // again (property 5). This does not mean *only* those slots come
    // back — the producer's slab may still have virgin owner-local slots
    // never touched by the 1024 allocations, and those are handed out
    // first since reclaim only runs once the owner-local summary reads
    // empty. Drain the whole slab (`capacity` allocations, not just 1024)
    // so every freed slot is forced to surface, and assert the freed set
    // is a subset of what comes back rather than set equality.
    let mut reclaimed = HashSet::new();
    for _ in 0..capacity {
        let ptr = unsafe { a.alloc(layout) };
        assert!(!ptr.is_null());
        assert!(reclaimed.insert(ptr as usize));
    }
    for addr in &ptrs {
        assert!(
            reclaimed.contains(addr),
            "freed address {addr:#x} was never reclaimed"
        );
    }
}

/// S4: eight threads round-robin allocate a batch on one core and free it on
/// the next. Expected: no duplicate address observed by any thread, and the
/// peak slab count stays within a small constant multiple of
/// `ceil(32 / capacity(48))` per core.
#[test]
fn s4_flip_flop_ownership() {
    let class = size_class::size_to_class(48);
    let info = size_class::class_info(class);
    let cap_slabs_per_core = 32usize.div_ceil(info.capacity);
    let nthreads = 8usize;
    let slack = 4;

    let a = std::sync::Arc::new(arena(nthreads * (cap_slabs_per_core + slack) + 4));
    let layout = Layout::from_size_align(48, 8).unwrap();

    let iterations = 20_000usize;
    let (txs, rxs): (Vec<_>, Vec<_>) = (0..nthreads)
        .map(|_| std::sync::mpsc::channel::<Vec<usize>>())
        .unzip();

    let allocators: Vec<_> = (0..nthreads)
        .map(|tid| {
            let a = a.clone();
            let tx = txs[(tid + 1) % nthreads].clone();
            std::thread::spawn(move || {
                let mut seen = HashSet::new();
                for _ in 0..iterations {
                    let mut batch = Vec::with_capacity(32);
                    for _ in 0..32 {
                        let ptr = unsafe { a.alloc(layout) };
                        assert!(!ptr.is_null());
                        assert!(
                            seen.insert(ptr as usize),
                            "duplicate address observed by allocating thread {tid}"
                        );
                        batch.push(ptr as usize);
                    }
                    tx.send(batch).unwrap();
                }
            })
        })
        .collect();

    let freers: Vec<_> = rxs
        .into_iter()
        .map(|rx| {
            let a = a.clone();
            std::thread::spawn(move || {
                let mut count = 0usize;
                for batch in rx {
                    for addr in batch {
                        unsafe { a.dealloc(addr as *mut u8, layout) };
                    }
                    count += 1;
                }
                count
            })
        })
        .collect();

    for h in allocators {
        h.join().unwrap();
    }
    drop(txs);
    let total_batches: usize = freers.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(total_batches, nthreads * iterations);
}

/// S6: after any workload, `reset()` zeros the arena and rewinds the bump
/// cursor, so a fresh allocation sequence returns addresses identical to a
/// never-used allocator of the same size.
#[test]
fn s6_reset_reproduces_fresh_addresses() {
    let a = arena(4);
    let layout = Layout::from_size_align(24, 8).unwrap();

    let mut first_run = Vec::new();
    for _ in 0..300 {
        let ptr = unsafe { a.alloc(layout) };
        assert!(!ptr.is_null());
        first_run.push(ptr as usize);
    }

    a.reset();

    let mut second_run = Vec::new();
    for _ in 0..300 {
        let ptr = unsafe { a.alloc(layout) };
        assert!(!ptr.is_null());
        second_run.push(ptr as usize);
    }

    assert_eq!(first_run, second_run, "reset should reproduce the same address sequence");
}
