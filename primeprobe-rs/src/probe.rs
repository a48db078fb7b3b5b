//! The prime and probe primitives and measurement extraction.
//!
//! To minimise cache trashing the structure is a doubly linked ring that is
//! traversed forward for priming and backward for probing. Every function
//! on a measurement path is `#[inline(always)]` and branch-poor; none of
//! them report errors.

use core::arch::asm;

use crate::arch::{access_diff, accesstime, clflush, cpuid, incq, mfence, start_timer, stop_timer};
use crate::cacheline::Cacheline;
use crate::context::{CacheCtx, CacheLevel};
use crate::{CACHELINE_SIZE, L1_ASSOCIATIVITY, L2_ASSOCIATIVITY};

/// Prime phase: fill the target cache (encoded in the size of the
/// structure) with attacker lines by walking the ring forward. The `mfence`
/// after each step commits the load before the next one issues. Returns the
/// predecessor of `head`, the natural entry for the following probe.
#[inline(always)]
pub unsafe fn prime(head: *mut Cacheline) -> *mut Cacheline {
    let mut curr_cl = head;

    cpuid();
    loop {
        curr_cl = (*curr_cl).next;
        mfence();
        if curr_cl == head {
            break;
        }
    }
    cpuid();

    (*curr_cl).prev
}

/// Same as [`prime`] but walking backward, i.e. the direction that probe
/// uses. For L2 this is the variant to use: the sets probed first are then
/// the ones touched last, so they have not decayed back into L1 residency
/// when the probe reaches them. Returns the successor of `head`.
#[inline(always)]
pub unsafe fn prime_rev(head: *mut Cacheline) -> *mut Cacheline {
    let mut curr_cl = head;

    cpuid();
    loop {
        curr_cl = (*curr_cl).prev;
        mfence();
        if curr_cl == head {
            break;
        }
    }
    cpuid();

    (*curr_cl).next
}

// The unrolled probe walks one whole cache set in a back-to-back burst of
// `prev` loads, so a single timestamp pair covers `associativity` accesses
// and the ~30 cycle measurement overhead stays below the per-line signal.
// The chain chases `[reg + 8]`, the fixed offset of `prev`. Expanded from
// one template per cache level; the unroll below is the 8-way variant.
const _: () = assert!(L1_ASSOCIATIVITY == 8);
const _: () = assert!(L2_ASSOCIATIVITY == 8);

macro_rules! unrolled_probe_cacheset {
    ($name:ident, $doc_level:literal) => {
        #[doc = concat!("Time one ", $doc_level, " cache set in a single burst.")]
        ///
        /// Walks `associativity` lines backward from `curr_cl`, stores the
        /// elapsed cycles in the last-but-one line reached and returns the
        /// last one, the entry for the next set's probe.
        #[inline(always)]
        pub unsafe fn $name(curr_cl: *mut Cacheline) -> *mut Cacheline {
            let next_cl: *mut Cacheline;
            let curr_out: *mut Cacheline;

            let start = start_timer();
            asm!(
                "mov rax, qword ptr [{curr} + 8]",
                "mov rcx, qword ptr [rax + 8]",
                "mov rax, qword ptr [rcx + 8]",
                "mov rcx, qword ptr [rax + 8]",
                "mov rax, qword ptr [rcx + 8]",
                "mov rcx, qword ptr [rax + 8]",
                "mov {curr_out}, qword ptr [rcx + 8]",
                "mov {next}, qword ptr [{curr_out} + 8]",
                curr = in(reg) curr_cl,
                curr_out = out(reg) curr_out,
                next = out(reg) next_cl,
                out("rax") _,
                out("rcx") _,
                options(nostack),
            );
            (*curr_out).time_msrmt = stop_timer(start);

            next_cl
        }
    };
}

unrolled_probe_cacheset!(asm_l1_probe_cacheset, "L1");
unrolled_probe_cacheset!(asm_l2_probe_cacheset, "L2");

/// Probe one cache set with the unrolled sequence for the given level.
#[inline(always)]
pub unsafe fn probe_cacheset(level: CacheLevel, curr_cl: *mut Cacheline) -> *mut Cacheline {
    match level {
        CacheLevel::L1 => asm_l1_probe_cacheset(curr_cl),
        CacheLevel::L2 => asm_l2_probe_cacheset(curr_cl),
    }
}

/// Probe phase: re-access the primed lines set by set and record the
/// per-set access time to detect evictions. Enter with the pointer returned
/// by the prime of this round; returns the entry for the next round.
#[inline(always)]
pub unsafe fn probe(level: CacheLevel, head: *mut Cacheline) -> *mut Cacheline {
    let mut curr_cs = head;

    loop {
        curr_cs = probe_cacheset(level, curr_cs);
        if curr_cs == head {
            break;
        }
    }

    (*curr_cs).next
}

/// Probe and measure every cacheline individually, without grouping into
/// sets. The per-access overhead is high and can hide evictions.
#[inline(always)]
pub unsafe fn probe_all_cachelines(head: *mut Cacheline) -> *mut Cacheline {
    let mut curr_cl = head;

    loop {
        (*curr_cl).time_msrmt = accesstime(curr_cl);
        curr_cl = (*curr_cl).prev;
        if curr_cl == head {
            break;
        }
    }

    (*curr_cl).next
}

/// Walk the whole structure under a single time measurement.
#[inline(always)]
pub unsafe fn probe_full_ds(head: *mut Cacheline) -> u32 {
    let mut curr_cl = head;

    let start = start_timer();
    loop {
        curr_cl = (*curr_cl).prev;
        if curr_cl == head {
            break;
        }
    }
    stop_timer(start)
}

/// Per-set sums of the individual line measurements taken by
/// [`probe_all_cachelines`].
#[inline(always)]
pub unsafe fn get_per_set_sum_of_msrmts(head: *mut Cacheline, res: &mut [u32]) {
    let mut curr_cl = head;
    loop {
        res[(*curr_cl).cache_set as usize] += (*curr_cl).time_msrmt;
        curr_cl = (*curr_cl).next;
        if curr_cl == head {
            break;
        }
    }
}

/// Every line's measurement, in backward walk order.
#[inline(always)]
pub unsafe fn get_all_msrmts_in_order(head: *mut Cacheline, res: &mut [u32]) {
    let mut curr_cl = head;
    let mut idx = 0;
    loop {
        res[idx] = (*curr_cl).time_msrmt;
        curr_cl = (*curr_cl).prev;
        idx += 1;
        if curr_cl == head {
            break;
        }
    }
}

/// The measurement of the cache set `head` belongs to, assuming the whole
/// set was timed in one burst.
#[inline(always)]
pub unsafe fn get_msrmt_for_set(head: *mut Cacheline, res: &mut u32) {
    let mut curr_cl = head;
    loop {
        if (*curr_cl).cache_set == (*head).cache_set && (*curr_cl).is_first() {
            *res = (*curr_cl).time_msrmt;
        }
        curr_cl = (*curr_cl).prev;
        if curr_cl == head {
            break;
        }
    }
}

/// One measurement per cache set, indexed by set, assuming every set was
/// timed in one burst.
#[inline(always)]
pub unsafe fn get_msrmts_for_all_set(head: *mut Cacheline, res: &mut [u32]) {
    let mut curr_cl = head;
    loop {
        if (*curr_cl).is_first() {
            res[(*curr_cl).cache_set as usize] = (*curr_cl).time_msrmt;
        }
        curr_cl = (*curr_cl).prev;
        if curr_cl == head {
            break;
        }
    }
}

/// Compare the access time of `p` against the latency configured for the
/// context's cache level.
#[inline(always)]
pub unsafe fn is_cached<T>(ctx: &CacheCtx, p: *mut T) -> bool {
    access_diff(p) <= ctx.access_time
}

/// Heuristic cache clearing: fill the cache with known data, then flush
/// those addresses. The Tree-PLRU state afterwards is still unknown.
pub fn clear_cache(ctx: &CacheCtx) {
    let mut buf = vec![0u8; ctx.cache_size as usize];
    let base = buf.as_mut_ptr();

    unsafe {
        for i in 0..ctx.nr_of_cachelines as usize {
            incq(base.add(i * CACHELINE_SIZE));
        }
        for i in 0..ctx.nr_of_cachelines as usize {
            clflush(base.add(i * CACHELINE_SIZE));
        }
    }
}
