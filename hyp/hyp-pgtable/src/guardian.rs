//! # The guardian's stage-1 table
//!
//! A handle to one radix tree of [`PageTable`]s. Mutations take the
//! [`FrameAlloc`] that supplies table pages and tracks their reference counts,
//! so the same code runs on top of the early bump allocator during bootstrap
//! and the refcounted pool afterwards.
//!
//! ## Reference counting
//!
//! Every table page carries one reference for each valid descriptor it holds.
//! Installing a descriptor calls [`FrameAlloc::get_page`] on the table page
//! holding it; clearing one calls [`FrameAlloc::put_page`]. A non-root table
//! whose count drops back to its base reference is unlinked and released.
//!
//! ## Conflicts
//!
//! Mapping over an existing leaf is allowed only when the new descriptor is
//! identical to it. A different output address, protection or ownership
//! state is a [`PgtableError::MappingConflict`]; ownership changes go
//! through [`GuardianPageTable::unmap`] first. Splitting a block is never
//! done implicitly.

use crate::entry::{EntryKind, MapAttrs, PageTableEntry, Protection};
use crate::error::PgtableError;
use crate::level::Level;
use crate::linear_map::LinearMap;
use crate::table::PageTable;
use crate::walker::{Visitor, walk_table};
use crate::{FrameAlloc, PhysMapper};
use hyp_memory_addresses::{
    PageSize, PhysRange, PhysicalAddress, PhysicalPage, Size4K, VirtRange, VirtualAddress,
};

/// Handle to the guardian's page table.
pub struct GuardianPageTable<'m, M: PhysMapper> {
    root: PhysicalPage<Size4K>,
    start_level: Level,
    va_bits: u8,
    linear: LinearMap,
    mapper: &'m M,
}

/// A leaf found by [`GuardianPageTable::get_leaf`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Leaf {
    pub entry: PageTableEntry,
    pub level: Level,
    /// Physical address `va` translates to.
    pub pa: PhysicalAddress,
}

impl<'m, M: PhysMapper> GuardianPageTable<'m, M> {
    /// Allocate and zero a root table for a VA space of `va_bits` bits.
    ///
    /// # Errors
    /// [`PgtableError::InvalidArgument`] for unsupported VA widths,
    /// [`PgtableError::OutOfMemory`] if the root cannot be allocated.
    pub fn init_radix<A: FrameAlloc>(
        mapper: &'m M,
        alloc: &mut A,
        linear: LinearMap,
        va_bits: u8,
    ) -> Result<Self, PgtableError> {
        let start_level =
            Level::start_for_va_bits(va_bits).ok_or(PgtableError::InvalidArgument("va_bits"))?;
        let root = alloc.alloc_4k().ok_or(PgtableError::OutOfMemory)?;
        // SAFETY: freshly allocated table page.
        unsafe { table_mut(mapper, root) }.zero();
        log::debug!("guardian page table root at {root:?}, start level {start_level}");
        Ok(Self {
            root,
            start_level,
            va_bits,
            linear,
            mapper,
        })
    }

    /// View an existing table.
    ///
    /// # Errors
    /// [`PgtableError::InvalidArgument`] for unsupported VA widths.
    pub fn from_root(
        mapper: &'m M,
        root: PhysicalPage<Size4K>,
        linear: LinearMap,
        va_bits: u8,
    ) -> Result<Self, PgtableError> {
        let start_level =
            Level::start_for_va_bits(va_bits).ok_or(PgtableError::InvalidArgument("va_bits"))?;
        Ok(Self {
            root,
            start_level,
            va_bits,
            linear,
            mapper,
        })
    }

    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalPage<Size4K> {
        self.root
    }

    #[inline]
    #[must_use]
    pub const fn start_level(&self) -> Level {
        self.start_level
    }

    #[inline]
    #[must_use]
    pub const fn va_bits(&self) -> u8 {
        self.va_bits
    }

    #[inline]
    #[must_use]
    pub const fn linear(&self) -> LinearMap {
        self.linear
    }

    /// Exclusive upper bound of addressable VAs.
    #[inline]
    #[must_use]
    pub const fn va_limit(&self) -> u64 {
        1 << self.va_bits
    }

    /// Map `[va, va + size)` to `[pa, pa + size)` using the largest leaves
    /// both alignments allow.
    ///
    /// # Errors
    /// - [`PgtableError::InvalidArgument`] for unaligned or out-of-range input.
    /// - [`PgtableError::MappingConflict`] when an existing leaf disagrees.
    /// - [`PgtableError::OutOfMemory`] when a table page cannot be allocated.
    pub fn map<A: FrameAlloc>(
        &mut self,
        alloc: &mut A,
        va: VirtualAddress,
        pa: PhysicalAddress,
        size: u64,
        attrs: MapAttrs,
    ) -> Result<(), PgtableError> {
        let end = self.check_range(va, size)?;
        if !pa.is_aligned::<Size4K>() || pa.checked_add(size).is_none() {
            return Err(PgtableError::InvalidArgument("physical range"));
        }
        log::trace!("map {va:?}+{size:#x} -> {pa:?} {attrs:?}");
        self.map_range(alloc, self.root, self.start_level, va.as_u64(), end, pa.as_u64(), attrs)
    }

    /// Map a range of the linear map; the physical side follows from [`LinearMap`].
    ///
    /// # Errors
    /// As [`map`](Self::map).
    pub fn map_region<A: FrameAlloc>(
        &mut self,
        alloc: &mut A,
        range: VirtRange,
        attrs: MapAttrs,
    ) -> Result<(), PgtableError> {
        let pa = self.linear.virt_to_phys(range.start());
        self.map(alloc, range.start(), pa, range.size(), attrs)
    }

    /// Map `range` into the linear map.
    ///
    /// # Errors
    /// As [`map`](Self::map).
    pub fn map_phys<A: FrameAlloc>(
        &mut self,
        alloc: &mut A,
        range: PhysRange,
        attrs: MapAttrs,
    ) -> Result<(), PgtableError> {
        let va = self.linear.phys_to_virt(range.start());
        self.map(alloc, va, range.start(), range.size(), attrs)
    }

    /// Map `range` executable at VA == PA.
    ///
    /// # Errors
    /// As [`map`](Self::map).
    pub fn identity_map_range<A: FrameAlloc>(
        &mut self,
        alloc: &mut A,
        range: PhysRange,
    ) -> Result<(), PgtableError> {
        let va = VirtualAddress::new(range.start().as_u64());
        self.map(
            alloc,
            va,
            range.start(),
            range.size(),
            MapAttrs::owned(Protection::Execute),
        )
    }

    /// Remove every leaf in `[va, va + size)` and release tables left empty.
    ///
    /// # Errors
    /// [`PgtableError::InvalidArgument`] if the range cuts through a block.
    pub fn unmap<A: FrameAlloc>(
        &mut self,
        alloc: &mut A,
        va: VirtualAddress,
        size: u64,
    ) -> Result<(), PgtableError> {
        let end = self.check_range(va, size)?;
        log::trace!("unmap {va:?}+{size:#x}");
        self.unmap_range(alloc, self.root, self.start_level, va.as_u64(), end)
    }

    /// The leaf translating `va`, if any.
    ///
    /// # Errors
    /// [`PgtableError::WalkFailure`] on a reserved encoding along the path.
    pub fn get_leaf(&self, va: VirtualAddress) -> Result<Option<Leaf>, PgtableError> {
        if va.as_u64() >= self.va_limit() {
            return Err(PgtableError::InvalidArgument("va beyond VA space"));
        }
        let mut table = self.root;
        let mut level = self.start_level;
        loop {
            // SAFETY: `table` is the root or came from a table descriptor.
            let entry = unsafe { table_mut(self.mapper, table) }.get(level.index(va.as_u64()));
            match entry.kind(level) {
                EntryKind::Invalid => return Ok(None),
                EntryKind::Reserved => return Err(PgtableError::WalkFailure { va, level }),
                EntryKind::Block | EntryKind::Page => {
                    let offset = va.as_u64() & (level.granule() - 1);
                    let pa = PhysicalAddress::new(entry.output_address().as_u64() | offset);
                    return Ok(Some(Leaf { entry, level, pa }));
                }
                EntryKind::Table(child) => {
                    let Some(next) = level.next() else {
                        return Err(PgtableError::WalkFailure { va, level });
                    };
                    table = child;
                    level = next;
                }
            }
        }
    }

    /// Walk every descriptor intersecting `range`.
    ///
    /// # Errors
    /// [`PgtableError::InvalidArgument`] if the range exceeds the VA space,
    /// [`PgtableError::WalkFailure`] on a reserved encoding, or whatever the
    /// visitor returns.
    pub fn walk<V: Visitor>(&self, range: VirtRange, visitor: &mut V) -> Result<(), V::Error> {
        if range.end().as_u64() > self.va_limit() {
            return Err(PgtableError::InvalidArgument("walk beyond VA space").into());
        }
        walk_table(
            self.mapper,
            self.root,
            self.start_level,
            range.start().as_u64(),
            range.end().as_u64(),
            visitor,
        )
    }

    fn check_range(&self, va: VirtualAddress, size: u64) -> Result<u64, PgtableError> {
        if !va.is_aligned::<Size4K>() || !size.is_multiple_of(Size4K::SIZE) {
            return Err(PgtableError::InvalidArgument("unaligned range"));
        }
        let end = va
            .as_u64()
            .checked_add(size)
            .ok_or(PgtableError::InvalidArgument("range overflows"))?;
        if end > self.va_limit() {
            return Err(PgtableError::InvalidArgument("range beyond VA space"));
        }
        Ok(end)
    }

    #[allow(clippy::too_many_arguments)]
    fn map_range<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        table: PhysicalPage<Size4K>,
        level: Level,
        start: u64,
        end: u64,
        phys_start: u64,
        attrs: MapAttrs,
    ) -> Result<(), PgtableError> {
        // SAFETY: `table` is the root or came from a table descriptor.
        let tbl = unsafe { table_mut(self.mapper, table) };
        let granule = level.granule();

        let mut va = start;
        while va < end {
            let next = (va & !(granule - 1)).saturating_add(granule).min(end);
            let pa = phys_start + (va - start);
            let idx = level.index(va);
            let old = tbl.get(idx);
            let at = VirtualAddress::new(va);

            let whole = va % granule == 0 && next - va == granule && pa % granule == 0;
            if whole && level.allows_leaf() {
                let new = PageTableEntry::leaf(PhysicalAddress::new(pa), level, attrs);
                match old.kind(level) {
                    EntryKind::Invalid => {
                        alloc.get_page(table.base())?;
                        tbl.set(idx, new);
                    }
                    EntryKind::Block | EntryKind::Page => {
                        if old != new {
                            return Err(PgtableError::MappingConflict { va: at, level });
                        }
                    }
                    EntryKind::Table(child) => {
                        let child_level = level
                            .next()
                            .ok_or(PgtableError::WalkFailure { va: at, level })?;
                        self.map_range(alloc, child, child_level, va, next, pa, attrs)?;
                    }
                    EntryKind::Reserved => {
                        return Err(PgtableError::WalkFailure { va: at, level });
                    }
                }
            } else {
                let child_level = level
                    .next()
                    .ok_or(PgtableError::InvalidArgument("unaligned leaf"))?;
                let child = match old.kind(level) {
                    EntryKind::Table(child) => child,
                    EntryKind::Invalid => {
                        let child = alloc.alloc_4k().ok_or(PgtableError::OutOfMemory)?;
                        // SAFETY: freshly allocated table page.
                        unsafe { table_mut(self.mapper, child) }.zero();
                        alloc.get_page(table.base())?;
                        tbl.set(idx, PageTableEntry::next_table(child));
                        child
                    }
                    EntryKind::Block | EntryKind::Page => {
                        return Err(PgtableError::MappingConflict { va: at, level });
                    }
                    EntryKind::Reserved => {
                        return Err(PgtableError::WalkFailure { va: at, level });
                    }
                };
                self.map_range(alloc, child, child_level, va, next, pa, attrs)?;
            }
            va = next;
        }
        Ok(())
    }

    fn unmap_range<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        table: PhysicalPage<Size4K>,
        level: Level,
        start: u64,
        end: u64,
    ) -> Result<(), PgtableError> {
        // SAFETY: `table` is the root or came from a table descriptor.
        let tbl = unsafe { table_mut(self.mapper, table) };
        let granule = level.granule();

        let mut va = start;
        while va < end {
            let next = (va & !(granule - 1)).saturating_add(granule).min(end);
            let idx = level.index(va);
            let at = VirtualAddress::new(va);
            match tbl.get(idx).kind(level) {
                EntryKind::Invalid => {}
                EntryKind::Block | EntryKind::Page => {
                    if va % granule != 0 || next - va != granule {
                        return Err(PgtableError::InvalidArgument("unmap splits a block"));
                    }
                    tbl.set(idx, PageTableEntry::new());
                    alloc.put_page(table.base())?;
                }
                EntryKind::Table(child) => {
                    let child_level = level
                        .next()
                        .ok_or(PgtableError::WalkFailure { va: at, level })?;
                    self.unmap_range(alloc, child, child_level, va, next)?;
                    if alloc.page_count(child.base()) == 1 {
                        tbl.set(idx, PageTableEntry::new());
                        alloc.put_page(table.base())?;
                        alloc.put_page(child.base())?;
                    }
                }
                EntryKind::Reserved => return Err(PgtableError::WalkFailure { va: at, level }),
            }
            va = next;
        }
        Ok(())
    }
}

/// # Safety
/// `table` must hold a translation table the caller may mutate.
#[inline]
unsafe fn table_mut<'a, M: PhysMapper>(mapper: &M, table: PhysicalPage<Size4K>) -> &'a mut PageTable {
    unsafe { mapper.phys_to_mut::<PageTable>(table.base()) }
}
