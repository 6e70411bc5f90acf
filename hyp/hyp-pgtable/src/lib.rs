//! # Guardian Page Tables
//!
//! The guardian's stage-1 translation table for a 4 KiB granule: descriptor
//! encoding, a generic walker, and the map/unmap operations used both during
//! bootstrap and afterwards.
//!
//! ## VA layout
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  L0   |  L1   |  L2   |  L3   | Offset |
//! ```
//!
//! Narrower VA spaces drop upper levels: the root is at
//! [`Level::start_for_va_bits`]. Levels 1 and 2 may hold 1 GiB / 2 MiB blocks,
//! level 3 holds 4 KiB pages.
//!
//! ## Ownership bits
//!
//! Bits 55–56 of every leaf carry a [`PageState`]. They do not affect
//! translation; they are how the guardian remembers whether it owns, shares
//! or borrows the page behind a mapping.
//!
//! ## Memory access
//!
//! Table pages are reached through a [`PhysMapper`]; table pages are obtained
//! and reference-counted through a [`FrameAlloc`]. Both are supplied by the
//! caller, which lets the same code run on the early bump allocator, on the
//! final pool, and in host-side tests.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod entry;
mod error;
mod guardian;
mod level;
mod linear_map;
mod private_va;
mod table;
mod walker;

pub use entry::{EntryKind, InvalidPageState, MapAttrs, PageState, PageTableEntry, Protection};
pub use error::PgtableError;
pub use guardian::{GuardianPageTable, Leaf};
pub use level::Level;
pub use linear_map::LinearMap;
pub use private_va::PrivateVaRange;
pub use table::PageTable;
pub use walker::{EntryRef, Visitor, WalkFlags};

use hyp_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// Supplies table pages and tracks their reference counts.
///
/// The early bump allocator only implements [`alloc_4k`](Self::alloc_4k);
/// reference counting starts once the pool allocator takes over.
pub trait FrameAlloc {
    /// Allocate one 4 KiB frame. Contents are unspecified; the table code zeroes it.
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>>;

    /// Take a reference on the page containing `pa`.
    ///
    /// # Errors
    /// Implementation specific; the page must be tracked by the allocator.
    fn get_page(&mut self, _pa: PhysicalAddress) -> Result<(), PgtableError> {
        Ok(())
    }

    /// Drop a reference on the page containing `pa`, releasing it at zero.
    ///
    /// # Errors
    /// [`PgtableError::RefcountUnderflow`] if the count is already zero.
    fn put_page(&mut self, _pa: PhysicalAddress) -> Result<(), PgtableError> {
        Ok(())
    }

    /// Current reference count of the page containing `pa`, or 0 when untracked.
    fn page_count(&self, _pa: PhysicalAddress) -> u32 {
        0
    }
}

/// Makes physical memory accessible to the guardian.
///
/// # Safety
/// - `pa` must be mapped writable in the current address space for `&mut T`.
/// - Lifetime `'a` is chosen by the caller; the mapping must outlive it.
/// - `T` must match the bytes at `pa` and no other reference may alias them.
pub trait PhysMapper {
    /// Convert a physical address to a mutable reference in the current address space.
    ///
    /// # Safety
    /// See the trait documentation.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;
}
