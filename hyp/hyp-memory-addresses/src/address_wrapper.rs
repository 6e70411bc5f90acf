/// Generates the API shared by [`PhysicalAddress`](crate::PhysicalAddress)
/// and [`VirtualAddress`](crate::VirtualAddress). The two differ only in
/// which address space they name.
macro_rules! address_wrapper {
    ($name:ident, $page:ident, $tag:literal) => {
        impl $name {
            #[inline]
            #[must_use]
            pub const fn zero() -> Self {
                Self(0)
            }

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

            /// The `S` page containing this address.
            #[inline]
            #[must_use]
            pub const fn page<S: $crate::PageSize>(self) -> $page<S> {
                $page::<S>::from_addr(self)
            }

            /// Low bits below the `S` boundary.
            #[inline]
            #[must_use]
            pub const fn page_offset<S: $crate::PageSize>(self) -> u64 {
                self.0 & (S::SIZE - 1)
            }

            #[inline]
            #[must_use]
            pub const fn align_down<S: $crate::PageSize>(self) -> Self {
                Self(self.0 & !(S::SIZE - 1))
            }

            /// `None` if rounding up would wrap.
            #[inline]
            #[must_use]
            pub const fn checked_align_up<S: $crate::PageSize>(self) -> Option<Self> {
                match self.0.checked_add(S::SIZE - 1) {
                    Some(v) => Some(Self(v & !(S::SIZE - 1))),
                    None => None,
                }
            }

            #[inline]
            #[must_use]
            pub const fn is_aligned<S: $crate::PageSize>(self) -> bool {
                self.page_offset::<S>() == 0
            }

            #[inline]
            #[must_use]
            pub const fn checked_add(self, rhs: u64) -> Option<Self> {
                match self.0.checked_add(rhs) {
                    Some(v) => Some(Self(v)),
                    None => None,
                }
            }

            #[inline]
            #[must_use]
            pub const fn checked_sub(self, rhs: u64) -> Option<Self> {
                match self.0.checked_sub(rhs) {
                    Some(v) => Some(Self(v)),
                    None => None,
                }
            }

            /// Byte distance `self - origin`, or `None` if `origin` lies above `self`.
            #[inline]
            #[must_use]
            pub const fn checked_offset_from(self, origin: Self) -> Option<u64> {
                self.0.checked_sub(origin.0)
            }
        }

        impl core::fmt::Debug for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, concat!($tag, "(0x{:016X})"), self.0)
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "0x{:016X}", self.0)
            }
        }

        impl From<u64> for $name {
            #[inline]
            fn from(v: u64) -> Self {
                Self(v)
            }
        }

        impl<S: $crate::PageSize> From<$page<S>> for $name {
            #[inline]
            fn from(page: $page<S>) -> Self {
                page.base()
            }
        }
    };
}

/// Page-base counterpart of [`address_wrapper`]. The base is stored raw and
/// its low `S::SHIFT` bits are always zero.
macro_rules! page_wrapper {
    ($page:ident, $addr:ident, $tag:literal) => {
        impl<S: $crate::PageSize> $page<S> {
            /// The page containing `a`.
            #[inline]
            #[must_use]
            pub const fn from_addr(a: $addr) -> Self {
                Self {
                    base: a.0 & !(S::SIZE - 1),
                    _size: core::marker::PhantomData,
                }
            }

            /// `None` unless `a` already sits on an `S` boundary.
            #[inline]
            #[must_use]
            pub const fn try_from_aligned(a: $addr) -> Option<Self> {
                if a.is_aligned::<S>() {
                    Some(Self::from_addr(a))
                } else {
                    None
                }
            }

            #[inline]
            #[must_use]
            pub const fn base(self) -> $addr {
                $addr(self.base)
            }
        }

        impl<S: $crate::PageSize> core::fmt::Display for $page<S> {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "0x{:016X}/{}", self.base, S::NAME)
            }
        }

        impl<S: $crate::PageSize> core::fmt::Debug for $page<S> {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, concat!($tag, "<{}>({:#018X})"), S::NAME, self.base)
            }
        }
    };
}

pub(crate) use address_wrapper;
pub(crate) use page_wrapper;
