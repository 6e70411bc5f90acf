//! # Guardian Configuration and Boot Interface
//!
//! The single source of truth for the guardian's fixed layout constants, the
//! sizes of the regions carved from the donated pool, and the parameters the
//! host passes to the entry call.
//!
//! * [`memory`]: compile-time constants (granule, table geometry, allocator
//!   orders, VM table capacity) with `const` assertions.
//! * [`sizing`]: worst-case carve-out formulas. The host must compute the
//!   same numbers to size the pool it donates.
//! * [`boot`]: [`BootParams`](boot::BootParams) and its validation.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
pub mod sizing;
