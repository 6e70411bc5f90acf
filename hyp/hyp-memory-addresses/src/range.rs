use crate::{PageSize, PhysicalAddress, Size4K, VirtualAddress};
use core::fmt;

mod sealed {
    pub trait Sealed {}
    impl Sealed for crate::PhysicalAddress {}
    impl Sealed for crate::VirtualAddress {}
}

/// Address types a [`Range`] can be built over.
pub trait RangeAddress: sealed::Sealed + Copy + Ord + fmt::Debug {
    fn raw(self) -> u64;
    fn from_raw(v: u64) -> Self;
}

impl RangeAddress for PhysicalAddress {
    #[inline]
    fn raw(self) -> u64 {
        self.as_u64()
    }

    #[inline]
    fn from_raw(v: u64) -> Self {
        Self::new(v)
    }
}

impl RangeAddress for VirtualAddress {
    #[inline]
    fn raw(self) -> u64 {
        self.as_u64()
    }

    #[inline]
    fn from_raw(v: u64) -> Self {
        Self::new(v)
    }
}

/// Half-open address range `[start, end)`.
///
/// Constructors reject ranges whose end would overflow, so `end` is always
/// representable and `start <= end` holds.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Range<A: RangeAddress> {
    start: A,
    end: A,
}

/// A range of physical memory.
pub type PhysRange = Range<PhysicalAddress>;

/// A range of guardian virtual addresses.
pub type VirtRange = Range<VirtualAddress>;

impl<A: RangeAddress> Range<A> {
    /// `[start, start + size)`, or `None` if the end overflows.
    #[inline]
    #[must_use]
    pub fn new(start: A, size: u64) -> Option<Self> {
        let end = start.raw().checked_add(size)?;
        Some(Self {
            start,
            end: A::from_raw(end),
        })
    }

    /// `[start, end)`, or `None` if `end < start`.
    #[inline]
    #[must_use]
    pub fn from_bounds(start: A, end: A) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    /// `[start, start + n * 4 KiB)`.
    #[inline]
    #[must_use]
    pub fn from_pages(start: A, n_pages: u64) -> Option<Self> {
        Self::new(start, n_pages.checked_mul(Size4K::SIZE)?)
    }

    #[inline]
    #[must_use]
    pub const fn start(&self) -> A {
        self.start
    }

    #[inline]
    #[must_use]
    pub const fn end(&self) -> A {
        self.end
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> u64 {
        self.end.raw() - self.start.raw()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Number of 4 KiB pages, rounding a partial trailing page up.
    #[inline]
    #[must_use]
    pub fn page_count(&self) -> u64 {
        self.size().div_ceil(Size4K::SIZE)
    }

    /// Both ends sit on a boundary of `S`.
    #[inline]
    #[must_use]
    pub fn is_aligned<S: PageSize>(&self) -> bool {
        (self.start.raw() | self.end.raw()) & (S::SIZE - 1) == 0
    }

    #[inline]
    #[must_use]
    pub fn contains(&self, addr: A) -> bool {
        self.start <= addr && addr < self.end
    }

    /// `other` lies entirely within `self`. An empty `other` is contained
    /// when its start lies within `[start, end]`.
    #[inline]
    #[must_use]
    pub fn contains_range(&self, other: &Self) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    #[inline]
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Iterate the base address of each 4 KiB page in the range.
    pub fn pages(&self) -> impl Iterator<Item = A> + use<A> {
        let start = self.start.raw() & !(Size4K::SIZE - 1);
        let end = self.end.raw();
        (start..end).step_by(4096).map(A::from_raw)
    }
}

impl<A: RangeAddress> fmt::Debug for Range<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}..{:?})", self.start, self.end)
    }
}
