use hyp_alloc::AllocError;
use hyp_info::boot::BootParamsError;
use hyp_pgtable::{InvalidPageState, PgtableError};

/// Every failure the guardian reports to the host.
///
/// Bootstrap treats all of them as fatal; there is no kind-specific recovery.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, thiserror::Error)]
pub enum Error {
    #[error("out of memory")]
    OutOfMemory,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("conflicting mapping")]
    MappingConflict,
    /// A page state outside the defined set, or a transition the state
    /// machine does not permit.
    #[error("ownership inconsistency")]
    OwnershipInconsistency,
    #[error("page-table walk failed")]
    WalkFailure,
    /// The page is still referenced by guardian mappings.
    #[error("page busy")]
    Busy,
}

impl Error {
    /// Negative errno-style code written to the host's return register.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::OutOfMemory => -12,
            Self::InvalidArgument => -22,
            Self::MappingConflict => -17,
            Self::OwnershipInconsistency => -1,
            Self::WalkFailure => -14,
            Self::Busy => -16,
        }
    }
}

impl From<PgtableError> for Error {
    fn from(e: PgtableError) -> Self {
        match e {
            PgtableError::OutOfMemory => Self::OutOfMemory,
            PgtableError::InvalidArgument(_) => Self::InvalidArgument,
            PgtableError::MappingConflict { .. } => Self::MappingConflict,
            PgtableError::WalkFailure { .. } => Self::WalkFailure,
            PgtableError::RefcountUnderflow(_) => Self::OwnershipInconsistency,
        }
    }
}

impl From<AllocError> for Error {
    fn from(e: AllocError) -> Self {
        match e {
            AllocError::OutOfMemory => Self::OutOfMemory,
            AllocError::AlreadyInitialized | AllocError::InvalidArgument(_) => Self::InvalidArgument,
            AllocError::NotTracked(_)
            | AllocError::RefcountUnderflow(_)
            | AllocError::RefcountOverflow(_) => Self::OwnershipInconsistency,
        }
    }
}

impl From<InvalidPageState> for Error {
    fn from(_: InvalidPageState) -> Self {
        Self::OwnershipInconsistency
    }
}

impl From<BootParamsError> for Error {
    fn from(_: BootParamsError) -> Self {
        Self::InvalidArgument
    }
}
