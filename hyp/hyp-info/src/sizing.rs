//! # Donated pool carve-out sizes
//!
//! Each helper provisions the worst case, so that bootstrap can never run out
//! of page-table pages halfway through mapping. Everything is computed from
//! the host-reported memory regions and must be reproducible by the host,
//! which needs the same numbers to size the pool it donates.

use crate::memory::{
    FIRST_LEVEL, HOST_S2_PGD_EXTRA_PAGES, LAST_LEVEL, MAX_VMS, MMIO_VA_SIZE, PAGE_SIZE,
    PRIVATE_VA_SIZE, PROXY_MAILBOX_PAGES, PTRS_PER_TABLE,
};
use hyp_memory_addresses::PhysRange;

/// Upper bound of table pages needed to map `nr_pages` pages at page granularity.
#[must_use]
pub const fn pgtable_max_pages(mut nr_pages: u64) -> u64 {
    let mut total = 0;
    let mut level = FIRST_LEVEL;
    while level <= LAST_LEVEL {
        nr_pages = nr_pages.div_ceil(PTRS_PER_TABLE);
        total += nr_pages;
        level += 1;
    }
    total
}

/// Table pages needed to cover every memory region at page granularity.
#[must_use]
pub fn pgtable_total_pages(memory: &[PhysRange]) -> u64 {
    memory
        .iter()
        .map(|r| pgtable_max_pages(r.size() / PAGE_SIZE))
        .sum()
}

/// Table pages for the guardian's own stage-1 table: all memory plus the private VA window.
#[must_use]
pub fn guardian_pgtable_pages(memory: &[PhysRange]) -> u64 {
    pgtable_total_pages(memory) + pgtable_max_pages(PRIVATE_VA_SIZE / PAGE_SIZE)
}

/// Table pages for the host's stage-2 table: all memory, concatenated roots and MMIO.
#[must_use]
pub fn host_s2_pgtable_pages(memory: &[PhysRange]) -> u64 {
    pgtable_total_pages(memory) + HOST_S2_PGD_EXTRA_PAGES + pgtable_max_pages(MMIO_VA_SIZE / PAGE_SIZE)
}

/// Pages needed to hold one `entry_size`-byte descriptor for every page of memory.
#[must_use]
pub fn vmemmap_pages(memory: &[PhysRange], entry_size: usize) -> u64 {
    let descriptors: u64 = memory.iter().map(|r| r.size() / PAGE_SIZE).sum();
    (descriptors * entry_size as u64).div_ceil(PAGE_SIZE)
}

/// Pages holding `MAX_VMS` slots of `slot_size` bytes.
#[must_use]
pub const fn vm_table_pages(slot_size: usize) -> u64 {
    (MAX_VMS as u64 * slot_size as u64).div_ceil(PAGE_SIZE)
}

/// Pages of the external proxy service: a TX and an RX mailbox.
#[must_use]
pub const fn proxy_pages() -> u64 {
    2 * PROXY_MAILBOX_PAGES
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyp_memory_addresses::PhysicalAddress;

    #[test]
    fn pgtable_max_pages_counts_every_level() {
        assert_eq!(pgtable_max_pages(0), 0);
        assert_eq!(pgtable_max_pages(1), 4);
        assert_eq!(pgtable_max_pages(512), 4);
        assert_eq!(pgtable_max_pages(513), 2 + 1 + 1 + 1);
        // 1 GiB worth of 4 KiB pages: 512 leaf tables, then 1 per upper level.
        assert_eq!(pgtable_max_pages(262_144), 512 + 1 + 1 + 1);
    }

    #[test]
    fn carve_outs_for_a_64_mib_machine() {
        let memory = [PhysRange::new(PhysicalAddress::new(0x4000_0000), 64 << 20).unwrap()];
        assert_eq!(pgtable_total_pages(&memory), 32 + 1 + 1 + 1);
        assert_eq!(guardian_pgtable_pages(&memory), 35 + 515);
        assert_eq!(host_s2_pgtable_pages(&memory), 35 + 16 + 515);
        assert_eq!(vmemmap_pages(&memory, 16), 64);
        assert_eq!(vm_table_pages(16), 1);
        assert_eq!(proxy_pages(), 2);
    }
}
