//! # Guardian synchronization primitives
//!
//! Bootstrap runs on one CPU, but once the host releases the others every
//! ownership transition races with every other one. Two locks cover that:
//!
//! * [`SpinLock`]: the global lock around the guardian page table and the
//!   ownership tracker.
//! * [`RwSpinLock`]: the per-VM table, read on every VM lookup and written
//!   only when VMs come and go.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod rw_lock;
mod spin_lock;

pub use rw_lock::{RwSpinLock, RwSpinLockReadGuard, RwSpinLockWriteGuard};
pub use spin_lock::{SpinLock, SpinLockGuard};
