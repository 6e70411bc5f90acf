//! # Guardian Bootstrap
//!
//! Brings up the guardian: a small hypervisor that sits below the host
//! kernel and owns memory the host can no longer touch. The host donates a
//! pool and calls the entry point; the guardian builds its own page table
//! out of the pool, takes ownership of the pages it maps, and hands control
//! back.
//!
//! ```text
//!  host ──► bootstrap() ──► [CPUs switch tables] ──► finalize() ──► enter_host()
//!            steps 1-2                                steps 3-8       rc, release
//! ```
//!
//! The host side is reached through the traits in [`host`]; nothing here
//! depends on the architecture beyond the descriptor format of
//! [`hyp_pgtable`].
//!
//! After a successful bootstrap, [`Guardian`] serves the page-ownership
//! transitions the host may request.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod api;
mod bootstrap;
mod error;
pub mod host;
pub mod ownership;
pub mod vm_table;

pub use api::Guardian;
pub use bootstrap::{
    BootstrapContext, PoolLayout, Transition, boot_guardian, bootstrap, enter_host,
};
pub use error::Error;
pub use host::{ExternalServices, HostContext, HostStage2, HostTable};
pub use ownership::{OwnershipFixup, OwnershipTracker};
pub use vm_table::{VmHandle, VmInfo, VmSlot, VmTable};
