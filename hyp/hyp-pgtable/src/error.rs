use crate::level::Level;
use hyp_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Failures of page-table construction and traversal.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PgtableError {
    #[error("out of page-table pages")]
    OutOfMemory,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// An existing mapping disagrees with the requested one in more than the
    /// software state bits, or would need a block split.
    #[error("conflicting mapping at {va:?} ({level})")]
    MappingConflict { va: VirtualAddress, level: Level },
    /// A descriptor uses an encoding reserved at its level.
    #[error("malformed descriptor at {va:?} ({level})")]
    WalkFailure { va: VirtualAddress, level: Level },
    #[error("reference count underflow on {0:?}")]
    RefcountUnderflow(PhysicalAddress),
}
