//! # Error Handling for cloudstore
//!
//! This module defines the error types used throughout the crate. We use a single
//! error enum ([`Error`]) to represent all possible failure modes, which keeps
//! signatures simple for library users.
//!
//! ## Rust Pattern: thiserror
//!
//! We use the `thiserror` crate to derive `std::error::Error` implementations.
//! This provides:
//! - Automatic `Display` implementation from the `#[error(...)]` attributes
//! - Automatic `From` implementations from the `#[from]` attributes
//! - Proper error source chaining via `#[source]`
//!
//! ## Error Categories
//!
//! | Category | Examples | Typical Response |
//! |----------|----------|------------------|
//! | Transient | deadline exceeded, unavailable, contention | Retried internally with backoff |
//! | Precondition | Missing id, unsupported op in a transaction | Fix the call; never retried |
//! | Terminal | Retries exhausted, stream failed, batch failed | Surface once to the caller |
//! | Internal | Bad config, I/O, JSON | Log and investigate |
//!
//! ## Transient Classification
//!
//! The remote store reports failures as free-form messages. A failure is
//! transient when its message contains (case-insensitively) one of the
//! signatures in [`TRANSIENT_SIGNATURES`]. Wrapper variants delegate to the
//! error they wrap, so classification survives context being added.

use std::time::Duration;

use thiserror::Error;

/// Message fragments that mark a remote failure as worth retrying.
pub const TRANSIENT_SIGNATURES: &[&str] = &[
    "deadline exceeded",
    "deadline_exceeded",
    "unavailable",
    "unknown",
    "rst_stream",
    "goaway",
    "contention",
    "timeout",
    "timed out",
];

/// Message fragments that mark a failure as a transaction contention abort.
pub const CONTENTION_SIGNATURES: &[&str] = &["contention", "aborted"];

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in cloudstore operations.
///
/// # Example
///
/// ```rust,ignore
/// use cloudstore::{Error, Result};
///
/// fn example(store: &CloudStore) -> Result<()> {
///     match store.save_batch(&table, rows, &opts).await {
///         Err(e) if e.is_precondition() => { /* caller bug */ }
///         other => other?,
///     }
///     Ok(())
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Remote Errors (may be transient)
    // =========================================================================

    /// The remote store rejected or failed a call.
    ///
    /// Whether this is retried depends on the message, see [`Error::is_transient`].
    #[error("remote error: {message}")]
    Remote {
        /// Message reported by the remote store
        message: String,
    },

    /// A single remote attempt did not finish within its timeout.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// Name of the operation that timed out
        operation: String,
        /// The per-attempt timeout that elapsed
        after: Duration,
    },

    // =========================================================================
    // Precondition Errors (never retried)
    // =========================================================================

    /// A row passed to a save had neither a key nor an `id` field.
    ///
    /// Raised before any network call, so nothing from the batch was written.
    #[error("Cannot save \"{table}\" entity without \"id\"")]
    MissingId {
        /// Table the row was destined for
        table: String,
    },

    /// An operation that cannot run inside a transaction was queued in one.
    #[error("DBOperation not supported: {op}")]
    UnsupportedOperation {
        /// Name of the rejected operation
        op: String,
    },

    // =========================================================================
    // Terminal Errors (surface once per logical operation)
    // =========================================================================

    /// A retried operation failed on every attempt.
    #[error("{operation} failed after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        /// Name of the retried operation
        operation: String,
        /// Number of attempts made
        attempts: u32,
        /// The error from the last attempt
        #[source]
        source: Box<Error>,
    },

    /// A save or delete chunk could not be written.
    #[error("{operation} on table '{table}' failed for a batch of {rows} row(s): {source}")]
    BatchFailed {
        /// `saveBatch` or `deleteByIds`
        operation: String,
        /// Target table
        table: String,
        /// Number of rows in the whole batch
        rows: usize,
        /// Cause of the chunk failure
        #[source]
        source: Box<Error>,
    },

    /// A streaming scan stopped because a page could not be fetched.
    #[error("stream over '{table}' failed after {rows_retrieved} row(s): {source}")]
    StreamFailed {
        /// Table being scanned
        table: String,
        /// Rows received from the store before the failure, delivered or not
        rows_retrieved: usize,
        /// Cause of the failure
        #[source]
        source: Box<Error>,
    },

    // =========================================================================
    // Internal Errors (Log and investigate)
    // =========================================================================

    /// Configuration values failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// JSON (de)serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Reading a config file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal invariant violated or a background task died.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a [`Error::Remote`] with the given message.
    pub fn remote(message: impl Into<String>) -> Self {
        Error::Remote {
            message: message.into(),
        }
    }

    /// Returns the innermost error, skipping wrapper variants.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::RetriesExhausted { source, .. }
            | Error::BatchFailed { source, .. }
            | Error::StreamFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Whether retrying the same call could succeed.
    pub fn is_transient(&self) -> bool {
        match self.root_cause() {
            Error::Timeout { .. } => true,
            Error::Remote { message } => matches_any(message, TRANSIENT_SIGNATURES),
            _ => false,
        }
    }

    /// Whether the failure was a transaction aborted by contention.
    pub fn is_contention(&self) -> bool {
        match self.root_cause() {
            Error::Remote { message } => matches_any(message, CONTENTION_SIGNATURES),
            _ => false,
        }
    }

    /// Whether the caller violated a precondition.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self.root_cause(),
            Error::MissingId { .. } | Error::UnsupportedOperation { .. }
        )
    }
}

fn matches_any(message: &str, signatures: &[&str]) -> bool {
    let lower = message.to_lowercase();
    signatures.iter().any(|sig| lower.contains(sig))
}

/// Result type alias for cloudstore operations.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
