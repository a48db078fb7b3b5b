//! Small helpers: permutations for the randomised topology and statistics
//! for collision detection.

use rand::{thread_rng, Rng};

/// Random permutation of `arr` (Fisher-Yates). The swap index is drawn from
/// `0..i` rather than `0..=i`, matching the behaviour the measurement
/// results were calibrated against.
pub fn random_perm(arr: &mut [u32]) {
    let mut rng = thread_rng();

    for i in (1..arr.len()).rev() {
        let swap_idx = rng.gen_range(0..i);
        arr.swap(i, swap_idx);
    }
}

/// A random permutation of the indices `0, 1, ..., len-1`.
pub fn gen_random_indices(len: usize) -> Vec<u32> {
    let mut arr: Vec<u32> = (0..len as u32).collect();
    random_perm(&mut arr);
    arr
}

/// Fill `arr` with random bytes.
pub fn gen_rand_bytes(arr: &mut [u8]) {
    thread_rng().fill(arr);
}

pub fn is_in_arr(elem: u32, arr: &[u32]) -> bool {
    arr.contains(&elem)
}

/// Running mean, avoiding overflow on long measurement series.
pub fn get_avg(arr: &[u32]) -> f64 {
    let mut avg = 0f64;
    for (i, &v) in arr.iter().enumerate() {
        avg = (i as f64 * avg + v as f64) / (i + 1) as f64;
    }
    avg
}

pub fn get_min(arr: &[u32]) -> u32 {
    arr.iter().copied().min().unwrap_or(u32::MAX)
}

pub fn get_max(arr: &[u32]) -> u32 {
    arr.iter().copied().max().unwrap_or(0)
}
