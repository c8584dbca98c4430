//! Error types for recall-core.
//!
//! The taxonomy mirrors the durability contract of the store:
//!
//! - [`Error::Validation`]: bad input, rejected before any durable write.
//! - [`Error::Lock`]: contention; `LockError::Timeout` is the explicit
//!   backpressure signal. Safe to retry.
//! - [`Error::Wal`]: durability could not be confirmed; the in-memory
//!   state is guaranteed unchanged. Safe to retry.
//! - [`Error::Corruption`]: checksum/structure mismatch. Non-fatal during
//!   recovery (the trusted prefix is recovered); fatal only when zero
//!   usable state remains where prior data was expected.
//!
//! The core never retries internally; retry policy belongs to the caller,
//! which knows how long it can afford to wait. Capacity overflow is not
//! an error at all; it is resolved by eviction.

use thiserror::Error;

use crate::lock::LockError;
use crate::snapshot::SnapshotError;
use crate::wal::WalError;

/// Result type alias using the library's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for recall-core.
#[derive(Error, Debug)]
pub enum Error {
    /// Input rejected before any durable write.
    #[error("validation error: {0}")]
    Validation(String),

    /// Lock acquisition failed (contention or I/O on the lock file).
    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    /// WAL append or maintenance failed; in-memory state unchanged.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// Snapshot store failure.
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// Persistent state is damaged beyond best-effort recovery.
    #[error("corruption detected: {detail}")]
    Corruption { detail: String },

    /// I/O errors outside the WAL/snapshot/lock paths.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the operation is safe to retry without corrective action.
    ///
    /// Lock timeouts and unconfirmed WAL writes leave the store unchanged,
    /// so the same call can simply be issued again. Validation and
    /// corruption errors need intervention first.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Lock(LockError::Timeout { .. }) | Self::Wal(_) => true,
            Self::Lock(_)
            | Self::Validation(_)
            | Self::Snapshot(_)
            | Self::Corruption { .. }
            | Self::Io(_)
            | Self::Json(_) => false,
        }
    }

    /// Shorthand for a validation failure.
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}
