use crate::entry::PageTableEntry;
use hyp_info::memory::PTRS_PER_TABLE;

const ENTRIES: usize = PTRS_PER_TABLE as usize;

/// One translation table: a 4 KiB page of 512 descriptors.
#[doc(alias = "pgd")]
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; ENTRIES],
}

const _: () = assert!(size_of::<PageTable>() == 4096);

impl PageTable {
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageTableEntry::new(); ENTRIES],
        }
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, index: usize) -> PageTableEntry {
        self.entries[index]
    }

    #[inline]
    pub const fn set(&mut self, index: usize, entry: PageTableEntry) {
        self.entries[index] = entry;
    }

    #[inline]
    pub const fn zero(&mut self) {
        *self = Self::zeroed();
    }

    /// Number of valid descriptors.
    #[must_use]
    pub fn valid_entries(&self) -> usize {
        self.entries.iter().filter(|e| e.valid()).count()
    }
}
