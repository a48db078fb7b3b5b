//! The cacheline record and its intrusive list operations.
//!
//! One record is exactly one hardware cache line, so that touching the
//! record touches exactly one line of the attacked cache. Records are linked
//! into a two-level ring (lines within a set, sets among each other) that
//! prime and probe traverse by pointer chasing.

use crate::CACHELINE_SIZE;

/// Offset of `next` inside [`Cacheline`], relied upon by the unrolled
/// probe assembly.
pub const CL_NEXT_OFFSET: usize = 0;
/// Offset of `prev` inside [`Cacheline`].
pub const CL_PREV_OFFSET: usize = 8;

pub const FLAG_FIRST: u16 = 1 << 0;
pub const FLAG_LAST: u16 = 1 << 1;
/// The physical cache set of this line has been confirmed (unprivileged
/// builder only).
pub const FLAG_CACHE_GROUP_INIT: u16 = 1 << 2;

/// One attacker-owned cache line.
///
/// `next` and `prev` must stay at offsets 0 and 8: the probe assembly
/// follows the list by offset, not by field name.
#[repr(C, align(64))]
pub struct Cacheline {
    pub next: *mut Cacheline,
    pub prev: *mut Cacheline,

    pub cache_set: u16,
    pub flags: u16,
    pub time_msrmt: u32,

    // Fills the record up to one hardware cache line.
    pub padding: [u8; CACHELINE_SIZE - 24],
}

const _: () = assert!(core::mem::size_of::<Cacheline>() == CACHELINE_SIZE);
const _: () = assert!(core::mem::align_of::<Cacheline>() == CACHELINE_SIZE);
const _: () = assert!(core::mem::offset_of!(Cacheline, next) == CL_NEXT_OFFSET);
const _: () = assert!(core::mem::offset_of!(Cacheline, prev) == CL_PREV_OFFSET);

impl Cacheline {
    #[inline(always)]
    pub fn is_first(&self) -> bool {
        self.flags & FLAG_FIRST != 0
    }

    #[inline(always)]
    pub fn is_last(&self) -> bool {
        self.flags & FLAG_LAST != 0
    }

    #[inline(always)]
    pub fn is_cache_group_init(&self) -> bool {
        self.flags & FLAG_CACHE_GROUP_INIT != 0
    }
}

/// Insert `new_cl` after `last_cl`. A null `last_cl` makes `new_cl` a
/// singleton ring.
pub unsafe fn cl_insert(last_cl: *mut Cacheline, new_cl: *mut Cacheline) {
    if last_cl.is_null() {
        (*new_cl).next = new_cl;
        (*new_cl).prev = new_cl;
    } else {
        (*new_cl).next = (*last_cl).next;
        (*new_cl).prev = last_cl;
        (*(*last_cl).next).prev = new_cl;
        (*last_cl).next = new_cl;
    }
}

/// Unlink `cl` from its ring. Must not be called once the neighbours have
/// been freed.
pub unsafe fn cl_remove(cl: *mut Cacheline) {
    if !(*cl).prev.is_null() {
        (*(*cl).prev).next = (*cl).next;
    }
    if !(*cl).next.is_null() {
        (*(*cl).next).prev = (*cl).prev;
    }
}

/// `new_cl` takes over `old_cl`'s neighbours. `old_cl` is detached but its
/// own links are left dangling; collision testing uses this transiently and
/// reverts it with a second `cl_replace`.
pub unsafe fn cl_replace(new_cl: *mut Cacheline, old_cl: *mut Cacheline) {
    (*(*old_cl).next).prev = new_cl;
    (*(*old_cl).prev).next = new_cl;

    (*new_cl).next = (*old_cl).next;
    (*new_cl).prev = (*old_cl).prev;
}

/// Length of a ring in cachelines, walking backwards. Diagnostics only.
pub unsafe fn cache_ds_len(cache_ds: *mut Cacheline) -> u32 {
    let mut cnt = 0;
    let mut curr_cl = cache_ds;

    loop {
        if curr_cl.is_null() {
            break;
        }
        cnt += 1;
        curr_cl = (*curr_cl).prev;
        if curr_cl == cache_ds {
            break;
        }
    }

    cnt
}
