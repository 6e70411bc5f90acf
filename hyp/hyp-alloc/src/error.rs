use hyp_memory_addresses::PhysicalAddress;
use hyp_pgtable::PgtableError;

/// Failures of the early and final allocators.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    #[error("allocator is already initialized")]
    AlreadyInitialized,
    #[error("out of memory")]
    OutOfMemory,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The address is not covered by the vmemmap.
    #[error("{0:?} is not tracked")]
    NotTracked(PhysicalAddress),
    #[error("reference count underflow on {0:?}")]
    RefcountUnderflow(PhysicalAddress),
    #[error("reference count overflow on {0:?}")]
    RefcountOverflow(PhysicalAddress),
}

impl From<AllocError> for PgtableError {
    fn from(e: AllocError) -> Self {
        match e {
            AllocError::OutOfMemory => Self::OutOfMemory,
            AllocError::RefcountUnderflow(pa) => Self::RefcountUnderflow(pa),
            AllocError::AlreadyInitialized => Self::InvalidArgument("allocator already initialized"),
            AllocError::InvalidArgument(what) => Self::InvalidArgument(what),
            AllocError::NotTracked(_) => Self::InvalidArgument("page not tracked"),
            AllocError::RefcountOverflow(_) => Self::InvalidArgument("refcount overflow"),
        }
    }
}
