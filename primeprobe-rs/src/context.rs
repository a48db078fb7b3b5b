//! Cache level descriptors and set-index arithmetic.

use crate::pagemap::get_phys_addr;
use crate::{
    CACHELINE_SIZE, L1_ACCESS_TIME, L1_ADDRESSING, L1_ASSOCIATIVITY, L1_SETS, L2_ACCESS_TIME,
    L2_ADDRESSING, L2_ASSOCIATIVITY, L2_SETS, PAGE_SIZE,
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CacheLevel {
    L1,
    L2,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Addressing {
    Virtual,
    Physical,
}

/// Geometry of one cache level, filled from the device configuration.
/// Immutable after creation.
#[derive(Clone, Debug)]
pub struct CacheCtx {
    pub level: CacheLevel,
    pub addressing: Addressing,

    pub sets: u32,
    pub associativity: u32,
    pub access_time: u32,
    pub nr_of_cachelines: u32,
    pub set_size: u32,
    pub cache_size: u32,
}

impl CacheCtx {
    pub fn new(level: CacheLevel) -> CacheCtx {
        let (addressing, sets, associativity, access_time) = match level {
            CacheLevel::L1 => (L1_ADDRESSING, L1_SETS, L1_ASSOCIATIVITY, L1_ACCESS_TIME),
            CacheLevel::L2 => (L2_ADDRESSING, L2_SETS, L2_ASSOCIATIVITY, L2_ACCESS_TIME),
        };

        CacheCtx {
            level,
            addressing,
            sets,
            associativity,
            access_time,
            nr_of_cachelines: sets * associativity,
            set_size: CACHELINE_SIZE as u32 * associativity,
            cache_size: sets * CACHELINE_SIZE as u32 * associativity,
        }
    }
}

/// Mask selecting the set-index bits of an address for a cache with the
/// given number of sets.
#[inline(always)]
pub fn set_mask(sets: u32) -> usize {
    ((sets as usize * CACHELINE_SIZE) - 1) ^ (CACHELINE_SIZE - 1)
}

#[inline(always)]
fn cache_set_helper(sets: u32, addr: usize) -> u16 {
    ((addr & set_mask(sets)) / CACHELINE_SIZE) as u16
}

/// Cache set of `p` under virtual indexing.
#[inline(always)]
pub fn virt_cache_set<T>(ctx: &CacheCtx, p: *const T) -> u16 {
    cache_set_helper(ctx.sets, p as usize)
}

/// Cache set of `p` under physical indexing. Aborts if the privilege probe
/// succeeded earlier but translation fails now.
pub fn phys_cache_set<T>(ctx: &CacheCtx, p: *const T) -> u16 {
    let paddr = get_phys_addr(p as usize).expect(
        "virtual to physical address translation failed, might be due to insufficient privileges",
    );
    cache_set_helper(ctx.sets, paddr)
}

/// Cache set of `p`, taking the context's addressing mode into account.
pub fn cache_set<T>(ctx: &CacheCtx, p: *const T) -> u16 {
    match ctx.addressing {
        Addressing::Virtual => virt_cache_set(ctx, p),
        Addressing::Physical => phys_cache_set(ctx, p),
    }
}

/// Clear the set-index bits of `p`.
#[inline(always)]
pub fn remove_cache_set<T>(ctx: &CacheCtx, p: *const T) -> *mut u8 {
    (p as usize & !set_mask(ctx.sets)) as *mut u8
}

/// Base of the page containing `p`.
#[inline(always)]
pub fn remove_page_offset<T>(p: *const T) -> *mut u8 {
    (p as usize & !(PAGE_SIZE - 1)) as *mut u8
}

/// Ceiled number of cache lines spanned by `size` bytes, clamped to the
/// structure size.
pub fn spanned_cache_lines(ctx: &CacheCtx, size: usize) -> u32 {
    let spanned = ((size + CACHELINE_SIZE - 1) / CACHELINE_SIZE) as u32;
    spanned.min(ctx.nr_of_cachelines)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn l1_ctx_derived_fields() {
        let ctx = CacheCtx::new(CacheLevel::L1);
        assert_eq!(ctx.addressing, Addressing::Virtual);
        assert_eq!(ctx.nr_of_cachelines, 512);
        assert_eq!(ctx.set_size, 512);
        assert_eq!(ctx.cache_size, 32 * 1024);
    }

    #[test]
    fn l2_ctx_derived_fields() {
        let ctx = CacheCtx::new(CacheLevel::L2);
        assert_eq!(ctx.addressing, Addressing::Physical);
        assert_eq!(ctx.nr_of_cachelines, 4096);
        assert_eq!(ctx.cache_size, 256 * 1024);
    }

    #[test]
    fn set_index_arithmetic() {
        let ctx = CacheCtx::new(CacheLevel::L1);
        // Bits 6..11 select the set for 64 sets of 64-byte lines.
        assert_eq!(set_mask(64), 0xfc0);
        assert_eq!(virt_cache_set(&ctx, (33usize * 64) as *const u8), 33);
        assert_eq!(
            virt_cache_set(&ctx, (PAGE_SIZE + 33 * 64) as *const u8),
            33
        );
    }

    #[test]
    fn page_offset_removal() {
        let p = (3 * PAGE_SIZE + 1234) as *const u8;
        assert_eq!(remove_page_offset(p) as usize, 3 * PAGE_SIZE);
    }

    #[test]
    fn spanned_lines_clamped() {
        let ctx = CacheCtx::new(CacheLevel::L1);
        assert_eq!(spanned_cache_lines(&ctx, 1), 1);
        assert_eq!(spanned_cache_lines(&ctx, 129), 3);
        assert_eq!(spanned_cache_lines(&ctx, 10 * 1024 * 1024), 512);
    }
}
