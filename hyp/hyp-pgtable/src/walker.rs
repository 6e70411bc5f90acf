//! # Table walks
//!
//! A walk visits every descriptor whose VA span intersects a range, in
//! ascending VA order. What happens at each descriptor is up to a
//! [`Visitor`]; the walker only decides which callbacks to run based on
//! [`WalkFlags`].

use crate::entry::{EntryKind, PageTableEntry};
use crate::error::PgtableError;
use crate::level::Level;
use crate::table::PageTable;
use crate::PhysMapper;
use bitfield_struct::bitfield;
use hyp_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};

/// Which callbacks a walk runs.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct WalkFlags {
    /// Visit every non-table descriptor, valid or not.
    pub leaf: bool,
    /// Visit each table descriptor before descending into it.
    pub table_pre: bool,
    /// Visit each table descriptor after its subtree has been walked.
    pub table_post: bool,
    #[bits(5)]
    __reserved: u8,
}

/// A descriptor together with where it was found.
#[derive(Debug, Copy, Clone)]
pub struct EntryRef {
    pub entry: PageTableEntry,
    /// Physical address of the descriptor itself, inside its table page.
    pub entry_pa: PhysicalAddress,
    /// First VA covered by the descriptor.
    pub va: VirtualAddress,
}

impl EntryRef {
    /// The table page holding this descriptor.
    #[inline]
    #[must_use]
    pub const fn table(&self) -> PhysicalPage<Size4K> {
        self.entry_pa.page::<Size4K>()
    }
}

/// Callbacks of a table walk.
///
/// A visitor error aborts the walk at the current descriptor and is returned
/// unchanged; whatever the visitor already did stays done.
pub trait Visitor {
    type Error: From<PgtableError>;

    fn flags(&self) -> WalkFlags;

    fn visit_leaf(&mut self, _entry: EntryRef, _level: Level) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Decide whether to descend into the table `entry` points at.
    ///
    /// Runs before the child page is read, so a visitor walking a table it
    /// does not trust can refuse children that are not table pages. Returning
    /// `false` skips the subtree and its post visit.
    fn visit_table_pre(&mut self, _entry: EntryRef, _level: Level) -> Result<bool, Self::Error> {
        Ok(true)
    }

    fn visit_table_post(&mut self, _entry: EntryRef, _level: Level) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Walk the subtree rooted at `table` (a table at `level`) over `[start, end)`.
pub(crate) fn walk_table<M: PhysMapper, V: Visitor>(
    mapper: &M,
    table: PhysicalPage<Size4K>,
    level: Level,
    start: u64,
    end: u64,
    visitor: &mut V,
) -> Result<(), V::Error> {
    let flags = visitor.flags();
    let granule = level.granule();
    // SAFETY: `table` is the root, or a table descriptor's child the visitor
    // accepted in `visit_table_pre`.
    let tbl: &PageTable = unsafe { mapper.phys_to_mut(table.base()) };

    let mut va = start;
    while va < end {
        let base = va & !(granule - 1);
        let next = base.saturating_add(granule).min(end);
        let idx = level.index(va);
        let entry = tbl.get(idx);
        let r = EntryRef {
            entry,
            entry_pa: PhysicalAddress::new(table.base().as_u64() + idx as u64 * 8),
            va: VirtualAddress::new(base),
        };

        match entry.kind(level) {
            EntryKind::Table(child) => {
                let Some(child_level) = level.next() else {
                    return Err(PgtableError::WalkFailure { va: r.va, level }.into());
                };
                if flags.table_pre() && !visitor.visit_table_pre(r, level)? {
                    va = next;
                    continue;
                }
                walk_table(mapper, child, child_level, va, next, visitor)?;
                if flags.table_post() {
                    visitor.visit_table_post(r, level)?;
                }
            }
            EntryKind::Reserved => {
                return Err(PgtableError::WalkFailure { va: r.va, level }.into());
            }
            EntryKind::Invalid | EntryKind::Block | EntryKind::Page => {
                if flags.leaf() {
                    visitor.visit_leaf(r, level)?;
                }
            }
        }
        va = next;
    }
    Ok(())
}
