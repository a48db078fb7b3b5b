//! Prime+Probe attacks on the L1 and L2 data caches of x86-64 CPUs.
//!
//! The library builds a memory layout whose address-to-set mapping is known
//! to the attacker even for physically indexed caches and an unprivileged
//! process, and exposes prime/probe primitives that traverse that layout
//! with minimal measurement noise.
//!
//! Typical round: `prime` fills the target cache with attacker lines, the
//! victim runs, `probe` re-accesses the lines set by set and times each set
//! in a single burst. Evicted sets show the next-level access latency.

#[cfg(not(all(target_arch = "x86_64", target_os = "linux")))]
compile_error!("primeprobe-rs relies on x86-64 timing instructions and the Linux pagemap");

pub mod alloc;
pub mod arch;
pub mod builder;
pub mod cacheline;
pub mod context;
pub mod pagemap;
pub mod probe;
pub mod util;
pub mod victim;

pub use alloc::PagePool;
pub use arch::{access_diff, accesstime, accesstime_overhead};
pub use builder::{prepare_cache_ds, prepare_cache_set_ds, cache_ds_sanity_check, CacheDs};
pub use cacheline::{
    cache_ds_len, cl_insert, cl_remove, cl_replace, Cacheline, FLAG_CACHE_GROUP_INIT,
    FLAG_FIRST, FLAG_LAST,
};
pub use context::{
    cache_set, remove_cache_set, remove_page_offset, spanned_cache_lines, virt_cache_set,
    Addressing, CacheCtx, CacheLevel,
};
pub use pagemap::{can_translate, get_phys_addr};
pub use probe::{
    clear_cache, get_all_msrmts_in_order, get_msrmt_for_set, get_msrmts_for_all_set,
    get_per_set_sum_of_msrmts, is_cached, prime, prime_rev, probe, probe_all_cachelines,
    probe_full_ds,
};
pub use victim::{
    prepare_victim, victim_access, victim_access_until_cached, victim_clflush, victim_loop,
    VictimLine,
};

// Device configuration. The cache geometry below must match the attacked
// machine; the values are for a 4-core Ivy Bridge part (i5-3470-class).

pub const PAGE_SIZE: usize = 4096;
pub const PROCESSOR_FREQ: u64 = 2_900_000_000;

pub const CACHELINE_SIZE: usize = 64;
/// Number of consecutive cache sets covered by the cachelines of one page.
pub const CACHE_GROUP_SIZE: usize = PAGE_SIZE / CACHELINE_SIZE;

pub const L1_ADDRESSING: Addressing = Addressing::Virtual;
pub const L1_SETS: u32 = 64;
pub const L1_ASSOCIATIVITY: u32 = 8;
pub const L1_ACCESS_TIME: u32 = 4;

pub const L2_ADDRESSING: Addressing = Addressing::Physical;
pub const L2_SETS: u32 = 512;
pub const L2_ASSOCIATIVITY: u32 = 8;
pub const L2_ACCESS_TIME: u32 = 12;

// L3 is not attacked directly; its access latency is the "miss" reference
// for L2 collision detection.
pub const L3_ACCESS_TIME: u32 = 30;

/// Repetitions of every timed traversal during collision detection.
pub const COLLISION_REP: usize = 100;

/// Sets the CPU affinity of the running process to the given core.
pub fn pin_to_cpu(cpu: usize) {
    unsafe {
        let mut cpuset: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut cpuset);
        libc::CPU_SET(cpu, &mut cpuset);
        assert!(
            libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &cpuset) >= 0
        );
    }
}

/// A heuristic to call before measurements so that machines without a fixed
/// clock settle at their maximal processor frequency.
pub fn prepare_measurement() {
    // Busy loop for ~2s.
    let mut i: u64 = 0;
    while std::hint::black_box(i) < 2 * PROCESSOR_FREQ {
        i += 1;
    }

    // Sample the timestamp counter a few times; the first reads after idling
    // are sometimes slower.
    for _ in 0..200 {
        arch::rdtsc();
    }

    // Make sure all previous work terminated.
    arch::cpuid();
}
