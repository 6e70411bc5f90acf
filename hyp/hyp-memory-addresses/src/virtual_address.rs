use crate::PageSize;
use crate::address_wrapper::{address_wrapper, page_wrapper};
use core::marker::PhantomData;

/// Virtual address in the guardian's own translation regime.
///
/// ### Examples
/// ```rust
/// # use hyp_memory_addresses::*;
/// let va = VirtualAddress::new(0x0000_8000_0000_1234);
/// assert_eq!(va.page::<Size4K>().base().as_u64(), 0x0000_8000_0000_1000);
/// assert!(va.checked_add(u64::MAX).is_none());
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

/// Base of a virtual page of size `S`.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage<S: PageSize> {
    base: u64,
    _size: PhantomData<S>,
}

address_wrapper!(VirtualAddress, VirtualPage, "VA");
page_wrapper!(VirtualPage, VirtualAddress, "VirtualPage");
