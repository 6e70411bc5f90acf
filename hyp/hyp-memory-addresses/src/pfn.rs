use crate::{PageSize, PhysicalAddress, PhysicalPage, Size4K};
use core::fmt;

/// Page frame number: a physical address shifted right by the 4 KiB page shift.
///
/// The host hands pages to the guardian by PFN; converting back with
/// [`Pfn::checked_phys`] rejects frame numbers whose byte address would not fit.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Pfn(u64);

impl Pfn {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Base physical address of this frame, or `None` if it overflows.
    #[inline]
    #[must_use]
    pub const fn checked_phys(self) -> Option<PhysicalAddress> {
        if self.0 > (u64::MAX >> Size4K::SHIFT) {
            return None;
        }
        Some(PhysicalAddress::new(self.0 << Size4K::SHIFT))
    }

    #[inline]
    #[must_use]
    pub const fn checked_page(self) -> Option<PhysicalPage<Size4K>> {
        match self.checked_phys() {
            Some(pa) => Some(pa.page::<Size4K>()),
            None => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, n: u64) -> Option<Self> {
        match self.0.checked_add(n) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Debug for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pfn({:#x})", self.0)
    }
}

impl fmt::Display for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
