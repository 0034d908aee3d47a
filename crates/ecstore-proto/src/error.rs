/// Error types for the erasure-coded backend.
///
/// A single enum covers every failure the core can surface: shard I/O
/// errors recorded per-shard in read results, planner failures, codec
/// failures, and hash-info validation failures. The enum is
/// serde-serializable so errors travel inside sub-op replies unchanged.

use serde::{Deserialize, Serialize};

/// Unified error type for all ecstore operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
pub enum EcError {
    #[error("I/O error")]
    Io,
    #[error("no object found")]
    NoObject,
    #[error("not enough shards available to decode")]
    InsufficientShards,
    #[error("erasure code decode failed")]
    DecodeFailed,
    #[error("erasure code encode failed")]
    EncodeFailed,
    #[error("hash info attribute is corrupt")]
    HashInfoCorrupt,
    #[error("hash info size does not match object size")]
    HashInfoMismatch,
    #[error("requested range not present")]
    OutOfRange,
    #[error("invalid parameters")]
    InvalidParams,
    #[error("network error between shards")]
    NetworkError,
    #[error("shard read returned short")]
    ShortRead,
    #[error("operation not supported")]
    NoSupport,
    #[error("request has a stale epoch")]
    StaleEpoch,
    #[error("backend is shutting down")]
    Shutdown,
}

/// Result type alias for ecstore operations.
pub type EcResult<T> = Result<T, EcError>;

impl From<std::io::Error> for EcError {
    fn from(_: std::io::Error) -> Self {
        EcError::Io
    }
}
