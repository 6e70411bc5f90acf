//! Collaborators owned by the host side of the boundary.
//!
//! The guardian drives them but does not implement them: the host's stage-2
//! table manager, the external proxy services, and the per-CPU channel used
//! to hand control back.

use crate::error::Error;
use hyp_alloc::vmemmap::OwnerId;
use hyp_memory_addresses::{PhysRange, PhysicalPage, Size4K};

/// Root of the host's stage-2 table.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HostTable {
    pub root: PhysicalPage<Size4K>,
    /// Input (intermediate physical) address width.
    pub ipa_bits: u8,
}

/// The host's stage-2 translation, as far as ownership is concerned.
pub trait HostStage2 {
    /// Set up the host table using pages from `scratch`.
    ///
    /// # Errors
    /// Implementation specific.
    fn prepare(&mut self, scratch: PhysRange) -> Result<(), Error>;

    /// Record `owner` for every page of `range`; anything but
    /// [`OwnerId::Host`] removes the host's access.
    ///
    /// # Errors
    /// Implementation specific; bootstrap aborts on any error.
    fn set_owner(&mut self, range: PhysRange, owner: OwnerId) -> Result<(), Error>;

    /// The host table, once [`prepare`](Self::prepare) has run.
    fn table(&self) -> Option<HostTable>;
}

impl<H: HostStage2 + ?Sized> HostStage2 for &mut H {
    fn prepare(&mut self, scratch: PhysRange) -> Result<(), Error> {
        (**self).prepare(scratch)
    }

    fn set_owner(&mut self, range: PhysRange, owner: OwnerId) -> Result<(), Error> {
        (**self).set_owner(range, owner)
    }

    fn table(&self) -> Option<HostTable> {
        (**self).table()
    }
}

/// Cross-boundary services brought up last (the proxy mailboxes).
pub trait ExternalServices {
    /// # Errors
    /// Implementation specific.
    fn init(&mut self, scratch: PhysRange) -> Result<(), Error>;
}

/// The channel bootstrap hands control back through.
pub trait HostContext {
    /// Write the result code to the host's return register.
    fn set_return_code(&mut self, code: i32);

    /// Let the parked secondary CPUs run guardian code.
    fn release_cpus(&mut self);
}
