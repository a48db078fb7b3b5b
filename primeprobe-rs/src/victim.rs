//! Victims for testing Prime+Probe attacks: a single attacker-controlled
//! line in a chosen cache set, plus the access helpers that mimic a victim
//! process touching it.

use crate::alloc::PagePool;
use crate::arch::{clflush, mfence, readq};
use crate::builder::prepare_cache_set_ds;
use crate::cacheline::Cacheline;
use crate::context::{remove_page_offset, Addressing, CacheCtx};
use crate::probe::is_cached;

/// A single cache line in a chosen set. Owns its backing page(s); dropping
/// it releases them.
pub struct VictimLine {
    line: *mut Cacheline,
    #[allow(dead_code)]
    pool: PagePool,
}

impl VictimLine {
    pub fn line(&self) -> *mut Cacheline {
        self.line
    }

    /// Free the backing page(s).
    pub fn release(self) {}
}

/// Materialise one cache line in `target_set`, to mimic the access of a
/// single line by a victim. With unprivileged physical construction the
/// target set is only accurate modulo `CACHE_GROUP_SIZE`.
pub fn prepare_victim(ctx: &CacheCtx, target_set: u32) -> VictimLine {
    let ds = prepare_cache_set_ds(ctx, &[target_set]);
    let (victim_cl, mut pool) = ds.into_parts();

    // The other lines of the set are unused; under physical addressing each
    // lives on its own page, so their pages can be freed one by one.
    if ctx.addressing == Addressing::Physical {
        let mut bases: Vec<*mut u8> = vec![];
        unsafe {
            let mut curr_cl = (*victim_cl).next;
            while curr_cl != victim_cl {
                bases.push(remove_page_offset(curr_cl));
                curr_cl = (*curr_cl).next;
            }
        }
        pool.release_bases(&bases);
    }

    VictimLine {
        line: victim_cl,
        pool,
    }
}

/// Basic victim: a single pointer access, fenced against earlier memory
/// traffic.
#[inline(always)]
pub unsafe fn victim_access<T>(p: *const T) {
    mfence();
    readq(p);
}

/// Explicitly flush a pointer from all cache levels.
#[inline(always)]
pub unsafe fn victim_clflush<T>(p: *const T) {
    clflush(p);
}

/// Repeated accesses, in case some replacement prioritisation would
/// otherwise age the line out.
#[inline(always)]
pub unsafe fn victim_loop<T>(p: *const T, nr: u32) {
    for _ in 0..nr {
        victim_access(p);
    }
}

/// Access until the measured latency matches the context's cache level.
#[inline(always)]
pub unsafe fn victim_access_until_cached<T>(ctx: &CacheCtx, p: *mut T) {
    while !is_cached(ctx, p) {}
}
