//! # Per-page metadata
//!
//! The vmemmap holds one [`PageDescriptor`] for every page of every memory
//! region the host reported, indexed region by region in the order the
//! regions were given. It lives in pages carved from the donated pool.

use crate::error::AllocError;
use bitfield_struct::bitfield;
use hyp_info::memory::PAGE_SIZE;
use hyp_memory_addresses::{PhysRange, PhysicalAddress};
use hyp_pgtable::{InvalidPageState, PageState};

/// Free-list link meaning "none".
pub const NO_PAGE: u32 = u32::MAX;

/// The party a page belongs to, as registered in the host's stage-2 table.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OwnerId {
    Host = 0,
    Guardian = 1,
    /// Belongs to neither; the host loses all access.
    Protected = 2,
}

impl OwnerId {
    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::Host),
            1 => Some(Self::Guardian),
            2 => Some(Self::Protected),
            _ => None,
        }
    }
}

/// Packed ownership bits of a [`PageDescriptor`].
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct PageMeta {
    /// [`OwnerId`] registered with the host.
    #[bits(2)]
    pub owner: u8,
    /// Cached host-side [`PageState`].
    #[bits(2)]
    pub host_state: u8,
    /// The page heads a block on a pool free list.
    pub free: bool,
    /// The host donated the page to the guardian, which may hand it back.
    pub donated: bool,
    #[bits(2)]
    __reserved: u8,
}

/// Metadata of one physical page.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PageDescriptor {
    pub refcount: u16,
    /// Buddy order of the block this page heads.
    pub order: u8,
    pub meta: PageMeta,
    /// Free-list links (vmemmap indices).
    pub next: u32,
    pub prev: u32,
    __pad: u32,
}

const _: () = assert!(size_of::<PageDescriptor>() == 16);

impl PageDescriptor {
    /// A host-owned, unreferenced page.
    pub const INIT: Self = Self {
        refcount: 0,
        order: 0,
        meta: PageMeta::new(),
        next: NO_PAGE,
        prev: NO_PAGE,
        __pad: 0,
    };

    /// # Errors
    /// Fails if the cached state holds the reserved encoding.
    #[inline]
    pub fn host_state(&self) -> Result<PageState, InvalidPageState> {
        PageState::try_from(self.meta.host_state())
    }

    #[inline]
    pub const fn set_host_state(&mut self, state: PageState) {
        self.meta.set_host_state(state.into_bits());
    }

    #[inline]
    #[must_use]
    pub const fn owner(&self) -> Option<OwnerId> {
        OwnerId::from_bits(self.meta.owner())
    }

    #[inline]
    pub const fn set_owner(&mut self, owner: OwnerId) {
        self.meta.set_owner(owner as u8);
    }
}

/// Size of one vmemmap entry, for [`hyp_info::sizing::vmemmap_pages`].
pub const DESCRIPTOR_SIZE: usize = size_of::<PageDescriptor>();

/// View over the vmemmap pages.
pub struct Vmemmap<'a> {
    pages: &'a mut [PageDescriptor],
    memory: &'a [PhysRange],
}

impl<'a> Vmemmap<'a> {
    /// Wrap `pages`, which must hold a descriptor for every page of `memory`.
    ///
    /// # Errors
    /// [`AllocError::InvalidArgument`] if `pages` is too short.
    pub fn new(pages: &'a mut [PageDescriptor], memory: &'a [PhysRange]) -> Result<Self, AllocError> {
        let needed: u64 = memory.iter().map(|r| r.size() / PAGE_SIZE).sum();
        if (pages.len() as u64) < needed {
            return Err(AllocError::InvalidArgument("vmemmap too small"));
        }
        Ok(Self { pages, memory })
    }

    /// Reset every descriptor to [`PageDescriptor::INIT`].
    pub fn init(&mut self) {
        self.pages.fill(PageDescriptor::INIT);
    }

    #[must_use]
    pub const fn memory(&self) -> &'a [PhysRange] {
        self.memory
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.pages.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Index of the descriptor covering `pa`, or `None` if `pa` is not memory.
    #[must_use]
    pub fn index_of(&self, pa: PhysicalAddress) -> Option<usize> {
        let mut base = 0u64;
        for region in self.memory {
            if let Some(off) = pa.checked_offset_from(region.start()).filter(|_| region.contains(pa)) {
                return usize::try_from(base + off / PAGE_SIZE).ok();
            }
            base += region.size() / PAGE_SIZE;
        }
        None
    }

    /// Base address of the page described by `idx`.
    #[must_use]
    pub fn address_of(&self, idx: usize) -> Option<PhysicalAddress> {
        let mut idx = idx as u64;
        for region in self.memory {
            let pages = region.size() / PAGE_SIZE;
            if idx < pages {
                return region.start().checked_add(idx * PAGE_SIZE);
            }
            idx -= pages;
        }
        None
    }

    #[inline]
    #[must_use]
    pub fn is_memory(&self, pa: PhysicalAddress) -> bool {
        self.index_of(pa).is_some()
    }

    #[inline]
    #[must_use]
    pub fn get(&self, idx: usize) -> &PageDescriptor {
        &self.pages[idx]
    }

    #[inline]
    pub fn get_mut(&mut self, idx: usize) -> &mut PageDescriptor {
        &mut self.pages[idx]
    }

    /// # Errors
    /// [`AllocError::NotTracked`] if `pa` is not memory.
    pub fn descriptor(&self, pa: PhysicalAddress) -> Result<&PageDescriptor, AllocError> {
        let idx = self.index_of(pa).ok_or(AllocError::NotTracked(pa))?;
        Ok(&self.pages[idx])
    }

    /// # Errors
    /// [`AllocError::NotTracked`] if `pa` is not memory.
    pub fn descriptor_mut(&mut self, pa: PhysicalAddress) -> Result<&mut PageDescriptor, AllocError> {
        let idx = self.index_of(pa).ok_or(AllocError::NotTracked(pa))?;
        Ok(&mut self.pages[idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptors_are_indexed_region_by_region() {
        let memory = [
            PhysRange::from_pages(PhysicalAddress::new(0x4000_0000), 4).unwrap(),
            PhysRange::from_pages(PhysicalAddress::new(0x8000_0000), 2).unwrap(),
        ];
        let mut backing = [PageDescriptor::INIT; 6];
        let mut vmemmap = Vmemmap::new(&mut backing, &memory).unwrap();
        vmemmap.init();

        assert_eq!(vmemmap.index_of(PhysicalAddress::new(0x4000_3fff)), Some(3));
        assert_eq!(vmemmap.index_of(PhysicalAddress::new(0x8000_1000)), Some(5));
        assert_eq!(vmemmap.index_of(PhysicalAddress::new(0x4000_4000)), None);
        assert_eq!(vmemmap.address_of(4), Some(PhysicalAddress::new(0x8000_0000)));
        assert_eq!(vmemmap.address_of(6), None);

        let d = vmemmap.descriptor_mut(PhysicalAddress::new(0x8000_0000)).unwrap();
        d.set_owner(OwnerId::Guardian);
        d.set_host_state(PageState::SharedBorrowed);
        assert_eq!(vmemmap.get(4).owner(), Some(OwnerId::Guardian));
        assert_eq!(vmemmap.get(4).host_state(), Ok(PageState::SharedBorrowed));
        assert_eq!(vmemmap.get(0).owner(), Some(OwnerId::Host));
    }

    #[test]
    fn too_small_a_backing_is_refused() {
        let memory = [PhysRange::from_pages(PhysicalAddress::new(0x4000_0000), 4).unwrap()];
        let mut backing = [PageDescriptor::INIT; 3];
        assert!(Vmemmap::new(&mut backing, &memory).is_err());
    }
}
