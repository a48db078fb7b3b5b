//! Artificial demo: a single cache line eviction between prime and probe.
//!
//! The attacker fills L1, touches one victim line in TARGET_SET, probes,
//! and records the per-set times. Averaged over the samples, the target
//! set stands out by the L2-L1 latency difference.

use std::env;
use std::process::exit;

use cache_attacker::{print_banner, print_line, print_results};
use primeprobe_rs::*;

// Pin the process to a CPU. To reduce noise, this CPU can be isolated.
const CPU_NUMBER: usize = 1;
// Set targeted by the eviction that this demo measures.
const TARGET_SET: u32 = 33;

// The demo attacks L1; for L2 switch the level and prime with `prime_rev`.
const TARGET_CACHE: CacheLevel = CacheLevel::L1;
const MSRMTS_PER_SAMPLE: usize = L1_SETS as usize;

fn usage(prog: &str) -> ! {
    eprintln!("Usage: {prog} <samples>");
    exit(1);
}

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        usage(&args[0]);
    }
    let sample_cnt: usize = args[1].parse().unwrap_or_else(|_| usage(&args[0]));

    print_line("Initial attacker preparation");
    print_line(&format!("Number of samples: {sample_cnt}"));
    print_line(&format!("Measurements per sample: {MSRMTS_PER_SAMPLE}"));

    // Cache descriptor and the full Prime+Probe structure. For unprivileged
    // L2 attacks the build can take a while.
    let ctx = CacheCtx::new(TARGET_CACHE);
    let cache_ds = prepare_cache_ds(&ctx);

    let mut res = vec![0u32; sample_cnt * MSRMTS_PER_SAMPLE];

    // The victim used to access one line of the targeted set.
    let victim = prepare_victim(&ctx, TARGET_SET);
    print_line(&format!("Legend: target set: {TARGET_SET}"));

    pin_to_cpu(CPU_NUMBER);

    print_banner("Start cache attack(s)");

    prepare_measurement();

    let mut curr_head = cache_ds.entry();
    for i in 0..sample_cnt {
        unsafe {
            curr_head = prime(curr_head);
            // Access a cache line in the target cache set.
            victim_access(victim.line());
            let next_head = probe(TARGET_CACHE, curr_head);

            get_msrmts_for_all_set(
                curr_head,
                &mut res[i * MSRMTS_PER_SAMPLE..(i + 1) * MSRMTS_PER_SAMPLE],
            );
            curr_head = next_head;
        }
    }

    print_banner("Stop cache attack(s)");

    print_line("Output cache attack data");
    print_results(&res, sample_cnt, MSRMTS_PER_SAMPLE);

    cache_ds.release();
    victim.release();
}
