//! # Physical and Virtual Address Types
//!
//! Strongly typed wrappers for raw memory addresses, page bases, page frame
//! numbers and address ranges used by the guardian's allocators and page
//! table code.
//!
//! ## Overview
//!
//! The guardian handles two address spaces at once: physical addresses the
//! host donates or lends, and the guardian's own virtual addresses produced by
//! its page tables. Mixing the two up is silent and catastrophic, so every
//! address is wrapped:
//!
//! | Concept | Generic | Description |
//! |----------|----------|-------------|
//! | [`PhysicalAddress`] / [`PhysicalPage<S>`] | [`S: PageSize`](PageSize) | Physical memory. |
//! | [`VirtualAddress`] / [`VirtualPage<S>`] | [`S: PageSize`](PageSize) | Guardian virtual memory. |
//! | [`Pfn`] | | Page frame number (physical address >> 12). |
//! | [`PhysRange`] / [`VirtRange`] | | Half-open `[start, end)` ranges. |
//!
//! ## Checked arithmetic
//!
//! None of the wrappers implement `Add<u64>`. Displacements go through
//! `checked_add` / `checked_sub` / `checked_offset_from`, which return `None`
//! on overflow. Several inputs (pool base, CPU region bases, PFNs for share
//! requests) come from the untrusted host and must never wrap.
//!
//! ## Granules
//!
//! The three mapping granules of a 4 KiB-granule regime are marker types
//! implementing [`PageSize`]:
//!
//! - [`Size4K`]: level-3 pages
//! - [`Size2M`]: level-2 blocks
//! - [`Size1G`]: level-1 blocks
//!
//! ```rust
//! # use hyp_memory_addresses::*;
//! let pa = PhysicalAddress::new(0x4020_1234);
//! assert_eq!(pa.page::<Size2M>().base().as_u64(), 0x4020_0000);
//! assert_eq!(pa.page_offset::<Size2M>(), 0x1234);
//!
//! let pool = PhysRange::from_pages(PhysicalAddress::new(0x4000_0000), 4096).unwrap();
//! assert_eq!(pool.page_count(), 4096);
//! assert!(pool.is_aligned::<Size2M>());
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod address_wrapper;
mod page_size;
mod pfn;
mod physical_address;
mod range;
mod virtual_address;

pub use page_size::{PageSize, Size1G, Size2M, Size4K};
pub use pfn::Pfn;
pub use physical_address::{PhysicalAddress, PhysicalPage};
pub use range::{PhysRange, Range, RangeAddress, VirtRange};
pub use virtual_address::{VirtualAddress, VirtualPage};
