//! Freshet error abstractions.

use thiserror::Error;

// Error messages.
pub const ERR_WAL_APPEND: &str = "error appending record to write-ahead log";
pub const ERR_WAL_READ: &str = "error reading record from write-ahead log";

/// Ingestion error variants.
#[derive(Debug, Error)]
pub enum IngestError {
    /// A registration arrived for a stream id outside the declared input set.
    #[error("unknown input stream id {0}")]
    UnknownStreamId(u32),
    /// The block store or WAL could not satisfy the requested durability.
    #[error("block durability could not be satisfied: {0}")]
    StoreUnavailable(String),
    /// The coordinator endpoint could not be reached or did not reply in time.
    #[error("receiver tracker unavailable: {0}")]
    TrackerUnavailable(String),
    /// A lifecycle method was called on a component which is already running.
    #[error("{0} has already been started")]
    AlreadyStarted(&'static str),
    /// A lifecycle method was called on a component which is not running.
    #[error("{0} has not been started")]
    NotStarted(&'static str),
    /// WAL replay encountered a malformed record outside of the log tail.
    #[error("write-ahead log corruption in segment {segment} at offset {offset}")]
    RecoveryCorruption { segment: String, offset: u64 },
}

/// The error type used to indicate that a system shutdown is required.
#[derive(Debug, Error)]
#[error("fatal error: {0}")]
pub struct ShutdownError(#[from] pub anyhow::Error);

/// A result type where the error is a `ShutdownError`.
pub type ShutdownResult<T> = ::std::result::Result<T, ShutdownError>;
