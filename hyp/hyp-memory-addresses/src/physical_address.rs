use crate::address_wrapper::{address_wrapper, page_wrapper};
use crate::{PageSize, Pfn, Size4K};
use core::marker::PhantomData;

/// Physical memory address: RAM the host donates or lends, or MMIO.
///
/// Kept apart from [`VirtualAddress`](super::VirtualAddress) so a table
/// builder cannot hand one where the other is expected.
///
/// ### Examples
/// ```rust
/// # use hyp_memory_addresses::*;
/// let pa = PhysicalAddress::new(0x0000_0010_2000_0042);
/// assert_eq!(pa.page::<Size4K>().base().as_u64(), 0x0000_0010_2000_0000);
/// assert_eq!(pa.page_offset::<Size4K>(), 0x42);
/// assert_eq!(pa.pfn().as_u64(), 0x0000_0010_2000_0042 >> 12);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u64);

/// Base of a physical page of size `S`.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage<S: PageSize> {
    base: u64,
    _size: PhantomData<S>,
}

address_wrapper!(PhysicalAddress, PhysicalPage, "PA");
page_wrapper!(PhysicalPage, PhysicalAddress, "PhysicalPage");

impl PhysicalAddress {
    /// Frame number of the 4 KiB page containing this address.
    #[inline]
    #[must_use]
    pub const fn pfn(self) -> Pfn {
        Pfn::new(self.0 >> Size4K::SHIFT)
    }
}

impl PhysicalPage<Size4K> {
    #[inline]
    #[must_use]
    pub const fn pfn(self) -> Pfn {
        self.base().pfn()
    }
}
