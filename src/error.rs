use crate::bucket::BrickId;

/// Errors returned by distribution and volume operations.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum VolumeError {
    /// Bad table-size exponent, zero capacity, duplicate or unknown brick
    /// reference. Rejected before any mutation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// Scratch or result allocation failed. Partially built scratch state is
    /// dropped; the live distribution state is untouched.
    #[error("allocation failed")]
    OutOfMemory,

    /// A remaining brick would be filled beyond its capacity by the
    /// requested operation. Nothing was mutated.
    #[error("brick {brick}: capacity {capacity} below required {required}")]
    InsufficientCapacity {
        brick: BrickId,
        capacity: u64,
        required: u64,
    },

    /// Another structural volume operation is in flight. Retry later.
    #[error("volume is busy")]
    Busy,

    /// Space reservation on the destination brick failed. This is a normal,
    /// recoverable outcome: the caller decides whether to retry with backoff
    /// or abort the volume operation.
    #[error("out of space on brick {0}")]
    OutOfSpace(BrickId),

    /// Fatal tree or storage collaborator failure. The operation is aborted
    /// and the last published state remains authoritative.
    #[error("structural error: {0}")]
    Structural(String),

    /// Page read or other I/O failure during migration. Pinned resources
    /// have been unwound; chunks committed earlier remain committed.
    #[error("i/o error: {0}")]
    Io(String),
}

pub type VolumeResult<T> = Result<T, VolumeError>;

impl From<std::collections::TryReserveError> for VolumeError {
    fn from(_: std::collections::TryReserveError) -> Self {
        VolumeError::OutOfMemory
    }
}
