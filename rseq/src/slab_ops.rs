//! Restartable-sequence critical sections for the bitmap slab and the
//! per-(size-class, core) slab manager.
//!
//! Each function here is a single rseq critical section: a contiguous span
//! of instructions that either commits in full (the thread never left its
//! starting CPU) or never produced an externally visible effect (the
//! kernel rewrote the instruction pointer to the abort handler before the
//! commit store). Each critical section shares the same `__rseq_cs`
//! descriptor and abort-signature shape, specialized to the bitmap
//! allocate/reclaim and linked-list splice operations the slab manager
//! needs.
//!
//! Every function takes a raw, already-registered `*mut Rseq` for the
//! calling thread (see [`crate::thread::RseqLocal`]) and raw pointers into
//! arena memory that the caller has already resolved to the correct
//! (size class, core) cell. None of these functions read or validate
//! anything beyond the exact words they touch; bounds and index checks are
//! the caller's responsibility.

use core::arch::asm;

use crate::abi::Rseq;

const RSEQ_CPU_ID_OFF: u32 = 4;
const RSEQ_CS_OFF: u32 = 8;

/// Sentinel returned by [`slab_try_allocate`] when the summary word is zero
/// (no owner-local slot remains).
pub const ALLOC_FULL: u64 = u64::MAX;
/// Sentinel returned by [`slab_try_allocate`] when the critical section was
/// aborted (the thread migrated off its starting CPU). The caller should
/// re-read its start-CPU and retry.
pub const ALLOC_MIGRATED: u64 = u64::MAX - 1;
/// Sentinel returned by [`slab_try_allocate`] when a stale summary bit was
/// cleared but no slot was reserved. The caller should call again
/// immediately (no need to re-read start-CPU — no migration occurred).
pub const ALLOC_RETRY: u64 = u64::MAX - 2;

/// Reserve one slot from a slab's owner-local bitmap.
///
/// Implements the allocate algorithm from the distilled spec's slab
/// component: read the summary word, find the lowest set group bit, read
/// that group's word; if it is zero the summary bit was stale (a previous
/// reclaim cleared the group but left the summary bit set) — clear the
/// summary bit and return [`ALLOC_RETRY`]. Otherwise clear the lowest set
/// bit of the group word and return `group * 64 + slot`.
///
/// # Safety
///
/// - `rseq` must be a valid, registered rseq pointer for the calling thread.
/// - `summary` and the `num_groups` words starting at `groups` must be
///   writable only by the thread's current core (the owner-local
///   invariant); no other thread may write them concurrently.
#[inline(never)]
pub unsafe fn slab_try_allocate(rseq: *mut Rseq, summary: *mut u64, groups: *mut u64) -> u64 {
    let result: u64;

    unsafe {
        asm!(
            ".pushsection __rseq_cs, \"aw\"",
            ".balign 32",
            "77:",
            ".long 0",
            ".long 0",
            ".quad 3f",
            ".quad (4f - 3f)",
            ".quad 6f",
            ".popsection",

            "lea {tmp}, [rip + 77b]",
            "mov qword ptr [{rseq} + {rseq_cs_off}], {tmp}",

            // ── start of critical section ────────────────────────────
            "3:",
            "mov {sum}, qword ptr [{summary}]",
            "test {sum}, {sum}",
            "jz 70f",                          // summary empty -> FULL

            "tzcnt {g}, {sum}",
            "lea {gaddr}, [{groups} + {g} * 8]",
            "mov {gw}, qword ptr [{gaddr}]",
            "test {gw}, {gw}",
            "jnz 71f",                         // group non-empty -> success path

            // stale summary bit: clear it and commit
            "btr {sum}, {g}",
            "mov qword ptr [{summary}], {sum}",
            "mov {result}, {retry_sentinel}",
            "jmp 4f",

            "71:",
            "tzcnt {s}, {gw}",
            "btr {gw}, {s}",
            "mov qword ptr [{gaddr}], {gw}",
            "mov {result}, {g}",
            "shl {result}, 6",
            "add {result}, {s}",
            "4:",
            // ── end of critical section ──────────────────────────────
            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "jmp 5f",

            "70:",
            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "mov {result}, {full_sentinel}",
            "jmp 5f",

            ".long 0x53053053",
            "6:",
            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "mov {result}, {migrated_sentinel}",

            "5:",

            rseq = in(reg) rseq,
            summary = in(reg) summary,
            groups = in(reg) groups,
            sum = out(reg) _,
            g = out(reg) _,
            gaddr = out(reg) _,
            gw = out(reg) _,
            s = out(reg) _,
            result = out(reg) result,
            tmp = out(reg) _,
            rseq_cs_off = const RSEQ_CS_OFF,
            full_sentinel = const ALLOC_FULL,
            retry_sentinel = const ALLOC_RETRY,
            migrated_sentinel = const ALLOC_MIGRATED,
            options(nostack),
        );
    }

    result
}

/// Pop the top pointer from a per-(size-class, core) free cache.
///
/// Cache layout: a `u64 current_idx` immediately followed by `capacity`
/// `u64` slots. Returns `None` if the cache is empty (`current_idx == 0`)
/// or the section aborted; the caller cannot distinguish the two and
/// should simply fall through to the slower slab path on `None`, matching
/// the distilled spec's `try-pop` semantics (no cross-core content here,
/// so an abort just means "try again or take the slow path", the cache
/// itself never becomes momentarily observable as empty-when-it-isn't).
///
/// # Safety
///
/// `rseq` must be registered for the calling thread; `cache_base` must
/// point at a `current_idx` header owned exclusively by this core,
/// immediately followed by at least `current_idx` live `u64` slots.
#[inline(never)]
pub unsafe fn free_cache_try_pop(rseq: *mut Rseq, cache_base: *mut u64) -> Option<*mut u8> {
    let result: u64;
    let success: u64;

    unsafe {
        asm!(
            ".pushsection __rseq_cs, \"aw\"",
            ".balign 32",
            "77:",
            ".long 0",
            ".long 0",
            ".quad 3f",
            ".quad (4f - 3f)",
            ".quad 6f",
            ".popsection",

            "lea {tmp}, [rip + 77b]",
            "mov qword ptr [{rseq} + {rseq_cs_off}], {tmp}",

            "3:",
            "mov {idx}, qword ptr [{cache}]",
            "test {idx}, {idx}",
            "jz 7f",

            "dec {idx}",
            "mov {result}, qword ptr [{cache} + 8 + {idx} * 8]",
            "mov qword ptr [{cache}], {idx}",
            "4:",
            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "mov {succ}, 1",
            "jmp 5f",

            "7:",
            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "xor {succ:e}, {succ:e}",
            "jmp 5f",

            ".long 0x53053053",
            "6:",
            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "xor {succ:e}, {succ:e}",

            "5:",

            rseq = in(reg) rseq,
            cache = in(reg) cache_base,
            idx = out(reg) _,
            result = out(reg) result,
            succ = out(reg) success,
            tmp = out(reg) _,
            rseq_cs_off = const RSEQ_CS_OFF,
            options(nostack),
        );
    }

    if success != 0 {
        Some(result as *mut u8)
    } else {
        None
    }
}

/// Push a pointer onto a per-(size-class, core) free cache.
///
/// Returns `true` if the cache had room and the pointer was stored, `false`
/// if the cache is at `capacity` or the section aborted — either way the
/// caller must fall back to the slab's cross-core `free`.
///
/// # Safety
///
/// Same cache-layout and ownership requirements as [`free_cache_try_pop`].
#[inline(never)]
pub unsafe fn free_cache_try_push(
    rseq: *mut Rseq,
    cache_base: *mut u64,
    ptr: *mut u8,
    capacity: u64,
) -> bool {
    let success: u64;

    unsafe {
        asm!(
            ".pushsection __rseq_cs, \"aw\"",
            ".balign 32",
            "77:",
            ".long 0",
            ".long 0",
            ".quad 3f",
            ".quad (4f - 3f)",
            ".quad 6f",
            ".popsection",

            "lea {tmp}, [rip + 77b]",
            "mov qword ptr [{rseq} + {rseq_cs_off}], {tmp}",

            "3:",
            "mov {idx}, qword ptr [{cache}]",
            "cmp {idx}, {capacity}",
            "je 7f",

            "mov qword ptr [{cache} + 8 + {idx} * 8], {ptr}",
            "inc {idx}",
            "mov qword ptr [{cache}], {idx}",
            "4:",
            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "mov {succ}, 1",
            "jmp 5f",

            "7:",
            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "xor {succ:e}, {succ:e}",
            "jmp 5f",

            ".long 0x53053053",
            "6:",
            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "xor {succ:e}, {succ:e}",

            "5:",

            rseq = in(reg) rseq,
            cache = in(reg) cache_base,
            capacity = in(reg) capacity,
            ptr = in(reg) ptr,
            idx = out(reg) _,
            succ = out(reg) success,
            tmp = out(reg) _,
            rseq_cs_off = const RSEQ_CS_OFF,
            options(nostack),
        );
    }

    success != 0
}

/// Unlink the head of a slab manager's list if it still equals `expected`.
///
/// `manager_base` points at a `{ head: u64, tail: u64 }` pair. On success,
/// sets `head = (*expected).next` where `next_offset` is the byte offset of
/// the slab's intrusive `next` field. Returns `true` on success, `false` if
/// the observed head no longer matched `expected` or the section aborted —
/// either way the caller re-reads the head and retries.
///
/// # Safety
///
/// `rseq` must be registered for the calling thread; `manager_base` and
/// `expected`'s `next` field must be owned exclusively by this core.
#[inline(never)]
pub unsafe fn manager_cas_advance_head(
    rseq: *mut Rseq,
    manager_base: *mut u64,
    expected: *mut u8,
    next_offset: u64,
) -> bool {
    let success: u64;

    unsafe {
        asm!(
            ".pushsection __rseq_cs, \"aw\"",
            ".balign 32",
            "77:",
            ".long 0",
            ".long 0",
            ".quad 3f",
            ".quad (4f - 3f)",
            ".quad 6f",
            ".popsection",

            "lea {tmp}, [rip + 77b]",
            "mov qword ptr [{rseq} + {rseq_cs_off}], {tmp}",

            "3:",
            "mov {cur}, qword ptr [{manager}]",
            "cmp {cur}, {expected}",
            "jne 7f",

            "mov {cur}, qword ptr [{cur} + {next_off}]",
            "mov qword ptr [{manager}], {cur}",
            "4:",
            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "mov {succ}, 1",
            "jmp 5f",

            "7:",
            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "xor {succ:e}, {succ:e}",
            "jmp 5f",

            ".long 0x53053053",
            "6:",
            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "xor {succ:e}, {succ:e}",

            "5:",

            rseq = in(reg) rseq,
            manager = in(reg) manager_base,
            expected = in(reg) expected,
            next_off = in(reg) next_offset,
            cur = out(reg) _,
            succ = out(reg) success,
            tmp = out(reg) _,
            rseq_cs_off = const RSEQ_CS_OFF,
            options(nostack),
        );
    }

    success != 0
}

/// Publish a slab onto the tail of a slab manager's list.
///
/// `manager_base` points at a `{ head: u64, tail: u64 }` pair. If the list
/// is empty, `slab` becomes both head and tail; otherwise `tail.next =
/// slab` and `tail = slab`. `slab`'s own `next` field (at `next_offset`
/// from its base) must already be null (callers clear it before
/// publishing, per the distilled spec's `free`/`allocate` slow paths).
/// This section cannot meaningfully fail the caller's way — it always
/// either commits or aborts; on abort the caller simply retries with the
/// same arguments (the slab has not been linked anywhere yet, so retrying
/// is always safe).
///
/// # Safety
///
/// Same single-writer requirements as [`manager_cas_advance_head`]. `slab`
/// must not currently be reachable from any manager list.
#[inline(never)]
pub unsafe fn manager_publish_tail(
    rseq: *mut Rseq,
    manager_base: *mut u64,
    slab: *mut u8,
    next_offset: u64,
) -> bool {
    let success: u64;

    unsafe {
        asm!(
            ".pushsection __rseq_cs, \"aw\"",
            ".balign 32",
            "77:",
            ".long 0",
            ".long 0",
            ".quad 3f",
            ".quad (4f - 3f)",
            ".quad 6f",
            ".popsection",

            "lea {tmp}, [rip + 77b]",
            "mov qword ptr [{rseq} + {rseq_cs_off}], {tmp}",

            "3:",
            "mov {tail}, qword ptr [{manager} + 8]",
            "test {tail}, {tail}",
            "je 8f",

            // non-empty: tail.next = slab; tail = slab
            "mov qword ptr [{tail} + {next_off}], {slab}",
            "mov qword ptr [{manager} + 8], {slab}",
            "jmp 4f",

            "8:",
            // empty: head = tail = slab
            "mov qword ptr [{manager}], {slab}",
            "mov qword ptr [{manager} + 8], {slab}",

            "4:",
            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "mov {succ}, 1",
            "jmp 5f",

            ".long 0x53053053",
            "6:",
            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "xor {succ:e}, {succ:e}",

            "5:",

            rseq = in(reg) rseq,
            manager = in(reg) manager_base,
            slab = in(reg) slab,
            next_off = in(reg) next_offset,
            tail = out(reg) _,
            succ = out(reg) success,
            tmp = out(reg) _,
            rseq_cs_off = const RSEQ_CS_OFF,
            options(nostack),
        );
    }

    success != 0
}
