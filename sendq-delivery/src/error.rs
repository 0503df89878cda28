//! Typed error handling for delivery operations.
//!
//! Send failures are split into:
//! - Permanent failures (invalid recipient, rejected message) - don't retry
//! - Temporary failures (network, timeout, deferral) - retry with backoff
//! - System errors - internal problems, retried like temporary failures
//!
//! Store and lock errors are separate because they are loop-level rather than
//! item-level failures.

use std::{io, path::PathBuf};

use sendq_common::UnknownStatus;
use thiserror::Error;

/// Error returned by a sender adapter for a single send attempt.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Permanent failure that should not be retried.
    #[error("Permanent failure: {0}")]
    Permanent(#[from] PermanentError),

    /// Temporary failure that can be retried with backoff.
    #[error("Temporary failure: {0}")]
    Temporary(#[from] TemporaryError),

    /// System-level error (I/O, internal errors, etc.).
    #[error("System error: {0}")]
    System(#[from] SystemError),
}

/// Permanent errors that should not be retried.
#[derive(Debug, Error)]
pub enum PermanentError {
    /// Recipient address is syntactically invalid or unknown to the provider.
    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    /// Recipient domain has no mail host.
    #[error("Unknown domain: {0}")]
    UnknownDomain(String),

    /// The message was rejected (policy violation, content, size).
    #[error("Message rejected: {0}")]
    MessageRejected(String),
}

/// Temporary errors that should be retried with exponential backoff.
#[derive(Debug, Error)]
pub enum TemporaryError {
    /// Could not reach the transport.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The send attempt exceeded its timeout.
    #[error("Send timed out after {0} seconds")]
    Timeout(u64),

    /// The transport deferred the message.
    #[error("Deferred: {0}")]
    Deferred(String),
}

/// System-level errors that indicate internal problems.
#[derive(Debug, Error)]
pub enum SystemError {
    /// I/O error talking to the transport.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The send task panicked or was aborted.
    #[error("Send task failed: {0}")]
    TaskFailed(String),

    /// Other internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeliveryError {
    /// Returns `true` if this error is temporary and should be retried.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }

    /// Returns `true` if this error is permanent and should not be retried.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    /// Returns `true` if this is a system error.
    #[must_use]
    pub const fn is_system(&self) -> bool {
        matches!(self, Self::System(_))
    }
}

/// Errors from the queue, tracking and run-history tables.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The database could not be reached or the statement failed.
    #[error("Store unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),

    /// A row held a value this version does not understand.
    #[error("Invalid stored data: {0}")]
    InvalidData(String),

    /// The caller asked for something the store refuses to do.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<UnknownStatus> for StoreError {
    fn from(error: UnknownStatus) -> Self {
        Self::InvalidData(error.to_string())
    }
}

/// Errors from the process lock.
///
/// Contention is not an error: `acquire` returns `false` instead.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Lock file {path} could not be used: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
