//! # Table refcount fixup
//!
//! Pages handed out by the early allocator carry no reference counts. Once
//! the pool takes over, [`fix_hyp_pgtable_refcnt`] walks the guardian table
//! and gives every table page one reference per valid descriptor it holds.

use crate::pool::HypPool;
use hyp_memory_addresses::{VirtRange, VirtualAddress};
use hyp_pgtable::{EntryRef, GuardianPageTable, Level, PgtableError, PhysMapper, Visitor, WalkFlags};

/// Takes one reference on a table page for every valid descriptor it holds.
///
/// The early allocator keeps no counts, so once the pool owns the table
/// pages their counts are rebuilt from the finished table.
pub struct RefcountFixup<'p, 'a> {
    pool: &'p mut HypPool<'a>,
    entries: u64,
}

impl<'p, 'a> RefcountFixup<'p, 'a> {
    pub const fn new(pool: &'p mut HypPool<'a>) -> Self {
        Self { pool, entries: 0 }
    }

    fn count(&mut self, entry: EntryRef) -> Result<(), PgtableError> {
        if entry.entry.valid() {
            self.pool.get_page(entry.entry_pa)?;
            self.entries += 1;
        }
        Ok(())
    }
}

impl Visitor for RefcountFixup<'_, '_> {
    type Error = PgtableError;

    fn flags(&self) -> WalkFlags {
        WalkFlags::new().with_leaf(true).with_table_post(true)
    }

    fn visit_leaf(&mut self, entry: EntryRef, _level: Level) -> Result<(), PgtableError> {
        self.count(entry)
    }

    fn visit_table_post(&mut self, entry: EntryRef, _level: Level) -> Result<(), PgtableError> {
        self.count(entry)
    }
}

/// Rebuild table-page reference counts of `table` in `pool`.
///
/// Returns the number of valid descriptors found.
///
/// # Errors
/// Any walk failure, or a table page the pool does not track.
pub fn fix_hyp_pgtable_refcnt<M: PhysMapper>(
    table: &GuardianPageTable<'_, M>,
    pool: &mut HypPool<'_>,
) -> Result<u64, PgtableError> {
    let all = VirtRange::new(VirtualAddress::zero(), table.va_limit())
        .ok_or(PgtableError::InvalidArgument("va_bits"))?;
    let mut fixup = RefcountFixup::new(pool);
    table.walk(all, &mut fixup)?;
    log::debug!("refcount fixup: {} valid descriptors", fixup.entries);
    Ok(fixup.entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::early::EarlyAllocator;
    use crate::phys_mapper::{SimulatedMemory, phys_slice_mut};
    use crate::vmemmap::{PageDescriptor, Vmemmap};
    use hyp_info::memory::PAGE_SIZE;
    use hyp_memory_addresses::{PhysRange, PhysicalAddress};
    use hyp_pgtable::{LinearMap, MapAttrs, Protection};

    #[test]
    fn rebuilt_counts_match_the_table() {
        let memory = [PhysRange::from_pages(PhysicalAddress::new(0x4000_0000), 64).unwrap()];
        let mem = SimulatedMemory::new(&memory);

        // Pages 0..1 hold the vmemmap, tables come from the rest.
        let vmemmap_range = PhysRange::from_pages(memory[0].start(), 1).unwrap();
        let mut early = EarlyAllocator::new();
        early.init(memory[0]).unwrap();
        early.alloc_contiguous(1).unwrap();

        let mut table =
            GuardianPageTable::init_radix(&mem, &mut early, LinearMap::new(0x80_0000_0000), 40).unwrap();
        let data = PhysRange::from_pages(PhysicalAddress::new(0x4003_0000), 3).unwrap();
        table
            .map_phys(&mut early, data, MapAttrs::owned(Protection::ReadWrite))
            .unwrap();
        let reserved = early.pages_used();
        assert_eq!(reserved, 1 + 4);

        let descriptors: &mut [PageDescriptor] =
            unsafe { phys_slice_mut(&mem, vmemmap_range.start(), (PAGE_SIZE / 16) as usize) };
        let mut vmemmap = Vmemmap::new(descriptors, &memory).unwrap();
        vmemmap.init();
        let mut pool = HypPool::init(vmemmap, memory[0].start().pfn(), 64, reserved).unwrap();

        assert_eq!(fix_hyp_pgtable_refcnt(&table, &mut pool), Ok(6));
        let root = table.root().base();
        assert_eq!(pool.page_count(root), Ok(2));
        let leaf_table = PhysicalAddress::new(root.as_u64() + 3 * PAGE_SIZE);
        assert_eq!(pool.page_count(leaf_table), Ok(4));
        assert_eq!(pool.free_pages(), 64 - reserved);
    }
}
