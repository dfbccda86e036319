use containers::Bytes32;
use thiserror::Error;

/// Failures of the block store.
///
/// Every variant is fatal for the loop except `OutOfOrderBlock`, which leaves
/// the repository unchanged; even that one stops the loop so restart-time
/// reconciliation can rebuild a consistent view.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("batch does not extend the repository tip: expected parent {expected:?}, found {found:?}")]
    OutOfOrderBlock { expected: Bytes32, found: Bytes32 },

    #[error("no common ancestor with the best chain within {max} blocks (walked {depth})")]
    ReorgDepthExceeded { depth: u64, max: u64 },

    #[error("block {0:?} on the repository tip's ancestry is missing")]
    MissingBlock(Bytes32),

    #[error("{0:?} is not a stored ancestor of the repository tip")]
    InvalidTip(Bytes32),

    #[error("block payload does not hash to its position {0:?}")]
    PositionMismatch(Bytes32),

    #[error("repository I/O error: {0}")]
    RepositoryIo(String),

    #[error(transparent)]
    Fjall(#[from] fjall::Error),

    #[error("failed to encode or decode stored data: {0}")]
    Codec(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;
