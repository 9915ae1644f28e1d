//! # Error Handling for Chronicles
//!
//! This module defines the error types used throughout Chronicles. We use a
//! single error enum ([`Error`]) to represent all failure modes, plus a small
//! classifier ([`ErrorKind`]) that the HTTP boundary uses to pick a status
//! code and decide how much detail a caller is allowed to see.
//!
//! ## Error Categories
//!
//! | Kind | Examples | Caller sees | Typical Response |
//! |------|----------|-------------|------------------|
//! | Validation | Missing identity, empty namespace, bad JSON | The message verbatim | Fix the request, never retry |
//! | Storage | SQLite error, deadline expired, writer gone | Generic message | Back off; reads may be retried |
//! | Internal | Entropy or clock unavailable, bad config | Generic message | Log and investigate |
//!
//! ## Retrying Appends
//!
//! Appends are **not** idempotent. Retrying an append that failed with a
//! storage error after the store actually committed it creates a second entry
//! with a new id. Scans are safe to retry.

use std::time::Duration;

use thiserror::Error;

use crate::types::EntryId;

/// Message shown to callers for every non-validation failure.
pub const GENERIC_FAILURE_MESSAGE: &str = "internal server error";

/// Status answered when the store fails its health check.
pub const HEALTH_FAILURE_STATUS: u16 = 424;

// =============================================================================
// Validation Errors
// =============================================================================

/// Structural or semantic problems with an append request.
///
/// Rules are evaluated in the order the variants are declared; the first
/// violation wins. Validation always happens before a transaction is opened,
/// so a request rejected here has no side effects.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Neither `keycloak_id` nor `client_id` was supplied.
    #[error("missing identity: expected either keycloak_id or client_id to be set")]
    MissingIdentity,

    /// Both `keycloak_id` and `client_id` were supplied.
    #[error("ambiguous identity: expected only one of keycloak_id or client_id to be set")]
    AmbiguousIdentity,

    /// `namespace` was empty.
    #[error("expected namespace to not be empty")]
    EmptyNamespace,

    /// `client_event_type` was empty.
    #[error("expected client_event_type to not be empty")]
    EmptyEventType,

    /// `data` was present but is not valid JSON.
    #[error("expected data to be a valid json: {0}")]
    InvalidData(String),

    /// A batch item's `offset` moves its timestamp outside the representable range.
    #[error("offset of {0}ms is out of range")]
    OffsetOutOfRange(i64),
}

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in Chronicles operations.
///
/// # Example
///
/// ```rust
/// use chronicles::{Error, ErrorKind, ValidationError};
///
/// let err = Error::from(ValidationError::AmbiguousIdentity);
/// assert_eq!(err.kind(), ErrorKind::Validation);
/// assert_eq!(err.kind().status_code(), 400);
/// ```
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Validation (caller-fixable)
    // =========================================================================

    /// The request was rejected before touching the store.
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),

    // =========================================================================
    // Storage (persistence layer failed)
    // =========================================================================

    /// SQLite operation failed.
    ///
    /// # When This Happens
    ///
    /// - Database file is locked by another process past the busy timeout
    /// - Disk is full
    /// - A constraint was violated (e.g. an id collision)
    /// - SQL syntax error (indicates a bug in Chronicles)
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Schema version mismatch, or the database could not be initialized.
    #[error("schema error: {0}")]
    Schema(String),

    /// The caller's deadline expired before the store answered.
    ///
    /// Any transaction that was open for this request has been rolled back
    /// (or will never be committed, when the writer notices the caller left).
    #[error("deadline of {after:?} exceeded during {operation}")]
    Timeout {
        /// Which operation timed out (`append`, `scan`, `health check`, ...)
        operation: &'static str,
        /// The deadline that was applied
        after: Duration,
    },

    /// The transaction body panicked. The transaction was rolled back before
    /// this error was produced.
    #[error("transaction body panicked: {0}")]
    TransactionPanicked(String),

    /// A writer or reader thread is no longer running.
    #[error("storage worker unavailable: {0}")]
    Unavailable(String),

    /// The health check could not reach the store.
    ///
    /// Storage-kind, but the boundary answers "failed dependency" rather than
    /// a plain server error; see [`Error::status_code`].
    #[error("health check failed: {0}")]
    Unhealthy(#[source] Box<Error>),

    /// A batch append stopped part way through.
    ///
    /// # Partial Progress
    ///
    /// Each batch item commits in its own transaction. Items before `index`
    /// are durable and their ids are listed in `committed`; the failing item
    /// and everything after it were never written. Callers must not blindly
    /// retry the whole batch.
    #[error("batch append failed at item {index} after {} committed: {source}", committed.len())]
    Batch {
        /// Zero-based position of the failing item
        index: usize,
        /// Ids of the items that were committed before the failure
        committed: Vec<EntryId>,
        /// Why the item failed
        #[source]
        source: Box<Error>,
    },

    // =========================================================================
    // Internal (generator or unexpected fault)
    // =========================================================================

    /// The identifier generator could not read its clock or entropy source.
    #[error("id generation failed: {0}")]
    IdGeneration(String),

    /// Configuration could not be loaded.
    #[error("config error: {0}")]
    Config(String),
}

// =============================================================================
// Classification
// =============================================================================

/// The three caller-visible error classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Caller input is invalid. Safe to describe verbatim, never retried.
    Validation,
    /// The persistence layer failed. Reads may be retried.
    Storage,
    /// Generator or unexpected fault.
    Internal,
}

impl ErrorKind {
    /// HTTP status the boundary layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::Validation => 400,
            ErrorKind::Storage | ErrorKind::Internal => 500,
        }
    }
}

impl Error {
    /// Classifies this error. A batch failure takes the kind of its cause.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::Sqlite(_)
            | Error::Schema(_)
            | Error::Timeout { .. }
            | Error::TransactionPanicked(_)
            | Error::Unavailable(_)
            | Error::Unhealthy(_) => ErrorKind::Storage,
            Error::Batch { source, .. } => source.kind(),
            Error::IdGeneration(_) | Error::Config(_) => ErrorKind::Internal,
        }
    }

    /// HTTP status the boundary layer should answer with.
    ///
    /// Same as [`ErrorKind::status_code`], except that a failed health check
    /// is 424 (failed dependency).
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Unhealthy(_) => HEALTH_FAILURE_STATUS,
            _ => self.kind().status_code(),
        }
    }

    /// The message that may be shown to an API caller.
    ///
    /// Validation errors are returned verbatim; everything else collapses to
    /// [`GENERIC_FAILURE_MESSAGE`] so internal details never leak.
    pub fn public_message(&self) -> String {
        match self {
            Error::Validation(e) => e.to_string(),
            Error::Batch { index, source, .. } if source.kind() == ErrorKind::Validation => {
                format!("append_requests[{index}]: {}", source.public_message())
            }
            _ => GENERIC_FAILURE_MESSAGE.to_string(),
        }
    }

    /// Returns the validation error behind this error, if any.
    pub fn as_validation(&self) -> Option<&ValidationError> {
        match self {
            Error::Validation(e) => Some(e),
            Error::Batch { source, .. } => source.as_validation(),
            _ => None,
        }
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
