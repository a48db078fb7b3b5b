//! Shared output helpers for the demo attackers. The per-sample format is
//! what the offline post-processing scripts parse.

use std::io::Write;

const BANNER_LEN: usize = 60;
const BANNER: &str =
    "################################################################";

/// Print a message centered in a banner.
pub fn print_banner(msg: &str) {
    let left_pad = (BANNER_LEN - msg.len() + 1) / 2;
    let right_pad = (BANNER_LEN - msg.len()) / 2;

    println!("{BANNER}");
    println!("# {:>width$}{:rpad$} #", msg, "", width = left_pad + msg.len(), rpad = right_pad);
    println!("{BANNER}");
    std::io::stdout().flush().unwrap();
}

/// Prefixed single line, flushed immediately.
pub fn print_line(msg: &str) {
    println!("#### {msg}");
    std::io::stdout().flush().unwrap();
}

/// Dump the measurement samples, one line of per-set times per sample.
pub fn print_results(res: &[u32], sample_cnt: usize, sets_per_sample: usize) {
    let mut out = String::new();
    for i in 0..sample_cnt {
        print_line(&format!("Sample number {i}:"));

        out.clear();
        for j in 0..sets_per_sample {
            out.push_str(&format!("{:3} ", res[i * sets_per_sample + j]));
        }
        println!("{out}");
    }
    std::io::stdout().flush().unwrap();
}

/// Print a byte string as hex.
pub fn print_hex(bytes: &[u8]) {
    for b in bytes {
        print!("{b:02x}");
    }
    std::io::stdout().flush().unwrap();
}
