//! # Guardian Memory Allocation
//!
//! Page allocation for the guardian, in the two phases bootstrap goes
//! through:
//!
//! ```text
//! bootstrap                          finalize
//! ┌─────────────────────────┐        ┌───────────────────────────────┐
//! │ EarlyAllocator          │ pages  │ HypPool (buddy, refcounted)   │
//! │  bump over donated pool ├───────►│  reserved = pages_used()      │
//! │  no refcounts           │  used  │  free lists in the Vmemmap    │
//! └─────────────────────────┘        └───────────────────────────────┘
//! ```
//!
//! * [`early`]: the bump allocator that carves the pool and feeds the
//!   page-table builder.
//! * [`vmemmap`]: one [`PageDescriptor`](vmemmap::PageDescriptor) per page
//!   of memory, holding refcount, buddy order and ownership bits.
//! * [`pool`]: the buddy allocator that takes over after bootstrap.
//! * [`fix_hyp_pgtable_refcnt`]: rebuilds the table-page reference counts
//!   the early allocator could not keep.
//! * [`phys_mapper`]: [`PhysMapper`](hyp_pgtable::PhysMapper)
//!   implementations.
//!
//! Both allocators implement [`FrameAlloc`](hyp_pgtable::FrameAlloc), so
//! the guardian page table is built and later extended through the same
//! interface.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(feature = "std")]
extern crate std;

pub mod early;
mod error;
mod fixup;
pub mod phys_mapper;
pub mod pool;
pub mod vmemmap;

pub use error::AllocError;
pub use fixup::{RefcountFixup, fix_hyp_pgtable_refcnt};
