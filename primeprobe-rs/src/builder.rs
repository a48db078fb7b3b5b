//! Construction of the Prime+Probe data structure.
//!
//! The result of every builder is the same: a single ring of cache sets,
//! where each set is a randomised ring of `associativity` cachelines that
//! all map to it. What differs is how set membership is established:
//! virtually indexed caches expose it in the address bits, physically
//! indexed ones require either the kernel's page-frame map (privileged) or
//! timing-based collision detection (unprivileged).

use std::ptr::null_mut;

use crate::alloc::PagePool;
use crate::arch::readq;
use crate::cacheline::{cl_insert, cl_replace, Cacheline, FLAG_CACHE_GROUP_INIT, FLAG_FIRST, FLAG_LAST};
use crate::context::{remove_page_offset, virt_cache_set, Addressing, CacheCtx};
use crate::pagemap::can_translate;
use crate::probe::{prime_rev, probe_full_ds};
use crate::util::{gen_random_indices, get_avg, get_min, is_in_arr};
use crate::{CACHE_GROUP_SIZE, COLLISION_REP, L2_ACCESS_TIME, L3_ACCESS_TIME};

/// A built Prime+Probe structure. `entry` is an opaque handle into the ring;
/// the pool owns all backing pages and frees each exactly once on drop.
pub struct CacheDs {
    entry: *mut Cacheline,
    pool: PagePool,
}

impl CacheDs {
    pub fn entry(&self) -> *mut Cacheline {
        self.entry
    }

    /// Free all backing pages.
    pub fn release(self) {}

    pub(crate) fn into_parts(self) -> (*mut Cacheline, PagePool) {
        (self.entry, self.pool)
    }
}

/// Initialise the complete structure for the given context: one line per
/// (set, way) pair of the attacked cache.
pub fn prepare_cache_ds(ctx: &CacheCtx) -> CacheDs {
    let (cl_ptr_arr, pool) = allocate_cache_ds(ctx);

    let entry = unsafe { build_cache_ds(ctx, &cl_ptr_arr) };
    assert!(
        unsafe { cache_ds_sanity_check(ctx, entry) },
        "built cache structure failed the sanity check (wrong geometry configured?)"
    );

    CacheDs { entry, pool }
}

/// Initialise a structure covering only the given cache sets, stitched in
/// the given order.
pub fn prepare_cache_set_ds(ctx: &CacheCtx, sets: &[u32]) -> CacheDs {
    let CacheDs { entry, mut pool } = prepare_cache_ds(ctx);

    let mut first_cl_in_sets: Vec<*mut Cacheline> = vec![null_mut(); ctx.sets as usize];
    let mut last_cl_in_sets: Vec<*mut Cacheline> = vec![null_mut(); ctx.sets as usize];

    // The cache groups that stay in use; pages of all other groups are
    // released below, since their lines drop out of the ring.
    let mut cache_groups: Vec<u32> = Vec::with_capacity(sets.len());
    for &set in sets {
        if !is_in_arr(set / CACHE_GROUP_SIZE as u32, &cache_groups) {
            cache_groups.push(set / CACHE_GROUP_SIZE as u32);
        }
    }

    let mut to_del_cls: *mut Cacheline = null_mut();
    let mut curr_cl = entry;

    unsafe {
        loop {
            let next_cl = (*curr_cl).next;

            if (*curr_cl).is_first() {
                first_cl_in_sets[(*curr_cl).cache_set as usize] = curr_cl;
            }
            if (*curr_cl).is_last() {
                last_cl_in_sets[(*curr_cl).cache_set as usize] = curr_cl;
            }

            if ctx.addressing == Addressing::Physical
                && !is_in_arr((*curr_cl).cache_set as u32 / CACHE_GROUP_SIZE as u32, &cache_groups)
            {
                cl_insert(to_del_cls, curr_cl);
                to_del_cls = curr_cl;
            }

            curr_cl = next_cl;
            if curr_cl == entry {
                break;
            }
        }

        // Stitch the requested sets into a ring of their own.
        for i in 0..sets.len() {
            let last = last_cl_in_sets[sets[i] as usize];
            let first = first_cl_in_sets[sets[(i + 1) % sets.len()] as usize];
            (*last).next = first;
            (*first).prev = last;
        }
        let entry = first_cl_in_sets[sets[0] as usize];

        if ctx.addressing == Addressing::Physical {
            release_cachelines(&mut pool, to_del_cls);
        }

        CacheDs { entry, pool }
    }
}

/// Free the pages backing a transient ring of cachelines, deduplicating
/// page bases so each page is freed once.
unsafe fn release_cachelines(pool: &mut PagePool, cache_ds: *mut Cacheline) {
    if cache_ds.is_null() {
        return;
    }

    let mut bases: Vec<*mut u8> = vec![];
    let mut curr_cl = cache_ds;
    loop {
        let base = remove_page_offset(curr_cl);
        if !bases.contains(&base) {
            bases.push(base);
        }
        curr_cl = (*curr_cl).next;
        if curr_cl == cache_ds {
            break;
        }
    }

    pool.release_bases(&bases);
}

/// Allocate one line per (set, way) pair and tag each with its set.
fn allocate_cache_ds(ctx: &CacheCtx) -> (Vec<*mut Cacheline>, PagePool) {
    let mut pool = PagePool::new();
    let mut cl_ptr_arr: Vec<*mut Cacheline> =
        Vec::with_capacity(ctx.nr_of_cachelines as usize);

    match ctx.addressing {
        Addressing::Virtual => {
            // One consecutive chunk suffices: the set-index bits of a cache
            // no larger than page_size * associativity never cross the page
            // boundary.
            let cl_arr = pool.map_block(ctx.cache_size as usize) as *mut Cacheline;
            for i in 0..ctx.nr_of_cachelines as usize {
                unsafe {
                    let cl = cl_arr.add(i);
                    (*cl).cache_set = virt_cache_set(ctx, cl);
                    cl_ptr_arr.push(cl);
                }
            }
        }
        Addressing::Physical => {
            allocate_cache_ds_phys(ctx, &mut pool, &mut cl_ptr_arr);
        }
    }

    (cl_ptr_arr, pool)
}

/// Physically indexed allocation: either ask the kernel for the physical
/// set of every candidate (privileged), or infer set membership with
/// Prime+Probe collision measurements (unprivileged).
fn allocate_cache_ds_phys(ctx: &CacheCtx, pool: &mut PagePool, cl_ptr_arr: &mut Vec<*mut Cacheline>) {
    let mut cls_to_del: Vec<*mut u8> = vec![];

    if can_translate() {
        allocate_cache_ds_phys_priv(ctx, pool, cl_ptr_arr, &mut cls_to_del);
    } else {
        unsafe { allocate_cache_ds_phys_unpriv(ctx, pool, cl_ptr_arr, &mut cls_to_del) };
    }

    pool.release_bases(&cls_to_del);
}

/// With privileges, collision detection reduces to counting lines per
/// physical set. A page is accepted or rejected as a whole: its
/// `CACHE_GROUP_SIZE` lines land in consecutive sets of one cache group, so
/// accepting it bumps every one of those sets by one way.
fn allocate_cache_ds_phys_priv(
    ctx: &CacheCtx,
    pool: &mut PagePool,
    cl_ptr_arr: &mut Vec<*mut Cacheline>,
    cls_to_del: &mut Vec<*mut u8>,
) {
    let mut cnt_lines_per_set = vec![0u32; ctx.sets as usize];

    while cl_ptr_arr.len() < ctx.nr_of_cachelines as usize {
        let cl_candidates = pool.map_page();

        let first_set = crate::context::phys_cache_set(ctx, cl_candidates);
        if cnt_lines_per_set[first_set as usize] < ctx.associativity {
            for i in 0..CACHE_GROUP_SIZE {
                unsafe {
                    let cl = cl_candidates.add(i);
                    (*cl).cache_set = crate::context::phys_cache_set(ctx, cl);
                    cl_ptr_arr.push(cl);
                    cnt_lines_per_set[(*cl).cache_set as usize] += 1;
                }
            }
        } else {
            cls_to_del.push(cl_candidates as *mut u8);
        }
    }
}

/// Without privileges, set membership is inferred: at most `associativity`
/// lines of one physical set fit into the cache, so a candidate that pushes
/// a known group of lines over that limit shares their set. Candidate rings
/// are kept per intra-page offset, because the page-offset bits pin the set
/// modulo `CACHE_GROUP_SIZE`.
unsafe fn allocate_cache_ds_phys_unpriv(
    ctx: &CacheCtx,
    pool: &mut PagePool,
    cl_ptr_arr: &mut Vec<*mut Cacheline>,
    cls_to_del: &mut Vec<*mut u8>,
) {
    let mut cache_set_ds_ptrs: Vec<*mut Cacheline> = vec![null_mut(); CACHE_GROUP_SIZE];
    let mut cache_set_ds_lens: Vec<u32> = vec![0; CACHE_GROUP_SIZE];

    let mut cache_group: u32 = 0;
    let mut repeated_collisions = 0;

    while cl_ptr_arr.len() < ctx.nr_of_cachelines as usize {
        // Sometimes only pages of one parity (after dividing by the page
        // offset) get returned, which starves the search. After three
        // all-collision pages in a row, allocate double pages: the extra
        // page shifts the parity of subsequent allocations.
        let cl_candidates = if repeated_collisions >= 3 {
            repeated_collisions = 0;
            pool.map_double_page()
        } else {
            pool.map_page()
        };

        let collisions =
            find_collisions(ctx, cl_candidates, &cache_set_ds_ptrs, &cache_set_ds_lens);

        if collisions == CACHE_GROUP_SIZE as u32 {
            // Every line of this page collides: useless for membership, but
            // it hands us a known extra line of an already-full set, which
            // identifies that set's members.
            repeated_collisions += 1;

            let cl_candidate_set = (*cl_candidates).cache_set as usize % CACHE_GROUP_SIZE;
            identify_cache_sets(
                ctx,
                cl_candidates,
                cache_set_ds_ptrs[cl_candidate_set],
                cache_set_ds_lens[cl_candidate_set],
                &mut cache_group,
            );

            cls_to_del.push(cl_candidates as *mut u8);
        } else {
            repeated_collisions = 0;

            for i in 0..CACHE_GROUP_SIZE {
                let cl_candidate = cl_candidates.add(i);
                let cl_candidate_set = (*cl_candidate).cache_set as usize % CACHE_GROUP_SIZE;

                cl_ptr_arr.push(cl_candidate);

                // Keep the temporary per-offset ring for later collision
                // tests. A fresh head still has null links, so the insert
                // degenerates to a singleton ring.
                if cache_set_ds_ptrs[cl_candidate_set].is_null() {
                    cache_set_ds_ptrs[cl_candidate_set] = cl_candidate;
                }
                cl_insert((*cache_set_ds_ptrs[cl_candidate_set]).prev, cl_candidate);

                cache_set_ds_lens[cl_candidate_set] += 1;
            }
        }
    }

    finish_identifying_groups(ctx, pool, &cache_set_ds_ptrs, cls_to_del, &mut cache_group);
}

/// Count how many lines of a candidate page collide with the current rings.
/// Also tags every line with its intra-page set offset.
unsafe fn find_collisions(
    ctx: &CacheCtx,
    cl_candidates: *mut Cacheline,
    cache_set_ds_ptrs: &[*mut Cacheline],
    cache_set_ds_lens: &[u32],
) -> u32 {
    let mut collisions = 0;

    for i in 0..CACHE_GROUP_SIZE {
        let cl_candidate = cl_candidates.add(i);

        // The page-offset bits of the virtual address are also physical, so
        // the cache set modulo CACHE_GROUP_SIZE is already correct.
        let cl_candidate_set = virt_cache_set(ctx, cl_candidate) as usize % CACHE_GROUP_SIZE;
        (*cl_candidate).cache_set = cl_candidate_set as u16;

        // With at most as many lines as ways there is trivially no
        // collision.
        if cache_set_ds_lens[cl_candidate_set] > ctx.associativity
            && has_collision(
                ctx,
                cl_candidate,
                cache_set_ds_ptrs[cl_candidate_set],
                cache_set_ds_lens[cl_candidate_set],
            )
        {
            collisions += 1;
        }
    }

    collisions
}

/// Decide with Prime+Probe whether `cl_candidate` maps to the same physical
/// set as `associativity` members of the ring. Every rotation start of the
/// ring is tried, since the traversal time depends on the entry point;
/// rotations that do not contain the colliding lines early enough stay
/// clean, so up to `len - associativity` non-collisions are expected even
/// for a true collider.
unsafe fn has_collision(
    ctx: &CacheCtx,
    cl_candidate: *mut Cacheline,
    cache_set_ds: *mut Cacheline,
    cache_set_ds_len: u32,
) -> bool {
    let mut time = [0u32; COLLISION_REP];
    let mut collisions_overall: u32 = 0;
    let mut cl_head = cache_set_ds;

    loop {
        // Baseline: the fastest clean traversal of the current ring.
        for t in time.iter_mut() {
            readq(cl_candidate);
            prime_rev(cl_head);
            *t = probe_full_ds(cl_head);
        }
        let baseline_time = get_min(&time);

        cl_replace(cl_candidate, cl_head);

        for t in time.iter_mut() {
            prime_rev(cl_candidate);
            *t = probe_full_ds(cl_candidate);
        }

        // The mean is compared so that a few outliers cannot mask a true
        // collision, while the baseline uses the most optimistic clean run.
        if get_avg(&time) >= (baseline_time + L3_ACCESS_TIME - L2_ACCESS_TIME) as f64 {
            collisions_overall += 1;
        }

        cl_replace(cl_head, cl_candidate);
        cl_head = (*cl_head).next;
        if cl_head == cache_set_ds {
            break;
        }
    }

    collisions_overall >= cache_set_ds_len - ctx.associativity
}

/// Use a known colliding line to identify the other members of its physical
/// set: swap each uncategorised ring line out, the collider in, and test
/// whether the swapped-out line now collides. When exactly `associativity`
/// lines are found, their pages form the next cache group.
unsafe fn identify_cache_sets(
    ctx: &CacheCtx,
    coll_cl: *mut Cacheline,
    cache_set_ds: *mut Cacheline,
    cache_set_ds_len: u32,
    cache_group: &mut u32,
) {
    let mut identified_cls: Vec<*mut Cacheline> = Vec::with_capacity(ctx.associativity as usize);
    let mut identified_cls_idx: u32 = 0;

    let mut curr_cl = cache_set_ds;
    let mut head_cl = coll_cl;

    loop {
        if !(*curr_cl).is_cache_group_init() {
            cl_replace(coll_cl, curr_cl);
            let found_collision = has_collision(ctx, curr_cl, head_cl, cache_set_ds_len);
            cl_replace(curr_cl, coll_cl);

            if found_collision {
                if identified_cls_idx < ctx.associativity {
                    identified_cls.push(remove_page_offset(curr_cl) as *mut Cacheline);
                }
                identified_cls_idx += 1;
            }
        }
        curr_cl = (*curr_cl).next;
        head_cl = cache_set_ds;
        if curr_cl == cache_set_ds {
            break;
        }
    }

    // Commit only an exact match; over-identification means the timing
    // lied and the group assignment would be wrong.
    if identified_cls_idx == ctx.associativity {
        for &page in identified_cls.iter() {
            for j in 0..CACHE_GROUP_SIZE {
                let cl = page.add(j);
                (*cl).cache_set = (*cache_group * CACHE_GROUP_SIZE as u32
                    + virt_cache_set(ctx, cl) as u32 % CACHE_GROUP_SIZE as u32)
                    as u16;
                (*cl).flags |= FLAG_CACHE_GROUP_INIT;
            }
        }

        *cache_group += 1;
    }
}

/// Allocate further collider pages until every cache group has been
/// identified.
unsafe fn finish_identifying_groups(
    ctx: &CacheCtx,
    pool: &mut PagePool,
    cache_set_ds_ptrs: &[*mut Cacheline],
    cls_to_del: &mut Vec<*mut u8>,
    cache_group: &mut u32,
) {
    while *cache_group < ctx.sets / CACHE_GROUP_SIZE as u32 {
        let cl_candidates = pool.map_page();

        let cl_candidate_set = virt_cache_set(ctx, cl_candidates) as usize % CACHE_GROUP_SIZE;

        identify_cache_sets(
            ctx,
            cl_candidates,
            cache_set_ds_ptrs[cl_candidate_set],
            CACHE_GROUP_SIZE as u32,
            cache_group,
        );

        cls_to_del.push(cl_candidates as *mut u8);
    }
}

/// Verify that every cache set is present with exactly `associativity`
/// lines. Returns `true` when the structure is sound.
pub unsafe fn cache_ds_sanity_check(ctx: &CacheCtx, head: *mut Cacheline) -> bool {
    let mut line_cnt_arr = vec![0u32; ctx.sets as usize];
    let mut curr_cl = head;

    loop {
        curr_cl = (*curr_cl).next;
        line_cnt_arr[(*curr_cl).cache_set as usize] += 1;
        if curr_cl == head {
            break;
        }
    }

    line_cnt_arr.iter().all(|&cnt| cnt == ctx.associativity)
}

/// Link the tagged lines into the final randomised two-level topology:
///
/// ```text
/// set A <-> set B <-> ... <-> set X <-> set A
/// ```
///
/// where the sets appear in a random order and each set is a ring of its
/// `associativity` lines in a random order.
unsafe fn build_cache_ds(ctx: &CacheCtx, cl_ptr_arr: &[*mut Cacheline]) -> *mut Cacheline {
    let set_len = ctx.associativity as usize;

    // Bucketise by set: sorted[set * set_len ..][..set_len] holds set's lines.
    let mut cl_ptr_arr_sorted: Vec<*mut Cacheline> =
        vec![null_mut(); ctx.nr_of_cachelines as usize];
    let mut idx_per_set = vec![0usize; ctx.sets as usize];

    for &cl in cl_ptr_arr {
        let set = (*cl).cache_set as usize;
        cl_ptr_arr_sorted[set * set_len + idx_per_set[set]] = cl;
        idx_per_set[set] += 1;
    }

    // Randomised ring per set.
    for set in 0..ctx.sets as usize {
        build_randomized_list_for_cache_set(
            &cl_ptr_arr_sorted[set * set_len..(set + 1) * set_len],
        );
    }

    // Relink the sets among each other in a random order.
    let idx_map = gen_random_indices(ctx.sets as usize);

    let mut curr_cl = (*cl_ptr_arr_sorted[idx_map[0] as usize * set_len]).prev;
    for i in 0..ctx.sets as usize {
        let first_of_next = cl_ptr_arr_sorted[idx_map[(i + 1) % ctx.sets as usize] as usize * set_len];
        (*curr_cl).next = first_of_next;
        let next_cl = (*first_of_next).prev;
        (*first_of_next).prev = curr_cl;
        curr_cl = next_cl;
    }

    cl_ptr_arr_sorted[idx_map[0] as usize * set_len]
}

/// Randomised ring of the lines of one cache set. The line in bucket slot 0
/// becomes the set's entry (FIRST), its ring predecessor the exit (LAST).
unsafe fn build_randomized_list_for_cache_set(cacheline_ptr_arr: &[*mut Cacheline]) {
    let len = cacheline_ptr_arr.len();
    let idx_map = gen_random_indices(len);

    for i in 0..len {
        let curr_cl = cacheline_ptr_arr[idx_map[i] as usize];
        (*curr_cl).next = cacheline_ptr_arr[idx_map[(i + 1) % len] as usize];
        (*curr_cl).prev = cacheline_ptr_arr[idx_map[(len - 1 + i) % len] as usize];

        // cache_set was tagged by the allocation path already.
        (*curr_cl).time_msrmt = 0;

        if curr_cl == cacheline_ptr_arr[0] {
            (*curr_cl).flags = FLAG_FIRST;
            (*(*curr_cl).prev).flags = FLAG_LAST;
        }
    }
}
