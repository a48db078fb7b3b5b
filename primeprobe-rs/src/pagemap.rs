//! Virtual to physical address translation via `/proc/self/pagemap`.
//!
//! Entry format per Documentation/vm/pagemap.txt: bits 0-53 hold the page
//! frame number, bit 63 the present bit. Since Linux 4.0 the PFN is zeroed
//! for processes without CAP_SYS_ADMIN, which is how we detect that the
//! privileged builder cannot be used.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use crate::PAGE_SIZE;

/// One parsed `/proc/self/pagemap` entry.
#[derive(Clone, Copy, Debug)]
pub struct PagemapEntry(pub u64);

impl PagemapEntry {
    const NUM_BYTES: usize = 8;

    pub fn present(&self) -> bool {
        self.0 & (1 << 63) != 0
    }

    pub fn swapped(&self) -> bool {
        self.0 & (1 << 62) != 0
    }

    pub fn file_page(&self) -> bool {
        self.0 & (1 << 61) != 0
    }

    pub fn soft_dirty(&self) -> bool {
        self.0 & (1 << 54) != 0
    }

    pub fn pfn(&self) -> u64 {
        self.0 & ((1 << 54) - 1)
    }
}

/// Resolve a virtual address of the current process to a physical address.
pub fn get_phys_addr(vaddr: usize) -> Result<usize, &'static str> {
    let mut f = File::open("/proc/self/pagemap")
        .map_err(|_| "couldn't open /proc/self/pagemap")?;

    let vpn = vaddr / PAGE_SIZE;
    f.seek(SeekFrom::Start((vpn * PagemapEntry::NUM_BYTES) as u64))
        .map_err(|_| "couldn't seek in /proc/self/pagemap")?;

    let mut buf = [0u8; PagemapEntry::NUM_BYTES];
    f.read_exact(&mut buf)
        .map_err(|_| "couldn't read pagemap entry")?;
    let entry = PagemapEntry(u64::from_le_bytes(buf));

    if !entry.present() {
        return Err("pagemap entry not present");
    }
    if entry.pfn() == 0 {
        // Insufficient rights, the entry only holds unprivileged info.
        return Err("pagemap PFN hidden, insufficient privileges");
    }

    Ok(entry.pfn() as usize * PAGE_SIZE + vaddr % PAGE_SIZE)
}

/// Check whether privileges suffice for address translation, by translating
/// a known-valid local address.
pub fn can_translate() -> bool {
    let probe: usize = 0;
    get_phys_addr(&probe as *const usize as usize).is_ok()
}
