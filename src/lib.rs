//! # Chronicles - Event Ingestion Log
//!
//! Chronicles records client-side and server-side analytics events in an
//! append-only log and lets consumers read them back in order. It provides:
//!
//! - **Append**: validate an event, stamp it with a sortable id and the
//!   observation time, store it durably in its own transaction
//! - **Batch append**: many events sharing one anchor time, each offset by
//!   the caller, appended one transaction at a time
//! - **Scan**: cursor-paginated forward reads with set filters and an
//!   identity-kind filter
//! - **Identity separation**: self-declared client ids can never collide
//!   with verified user ids
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Async API Layer                          │
//! │           (append, append_batch, scan, health_check)            │
//! └───────────────┬─────────────────────────────────┬───────────────┘
//!                 │                                 │
//!                 ▼                                 ▼
//! ┌───────────────────────────────┐  ┌──────────────────────────────┐
//! │         Writer Thread          │  │        Reader Pool           │
//! │  ┌──────────┐ ┌─────────────┐  │  │  read-only connections,      │
//! │  │ Identity │ │ Id generator│  │  │  one per thread              │
//! │  │ rules    │ │ (monotonic) │  │  │                              │
//! │  └──────────┘ └─────────────┘  │  │                              │
//! │  scoped transaction per entry  │  │                              │
//! └───────────────┬───────────────┘  └──────────────┬───────────────┘
//!                 └────────────────┬────────────────┘
//!                                  ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         SQLite (WAL)                            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Append-only**: committed entries are never modified or deleted
//! 2. **Total order**: ids from one process are unique and strictly
//!    increasing; scans return entries in ascending id order
//! 3. **No partial entries**: an append either commits one whole row or
//!    nothing, including when the transaction body panics
//! 4. **Identity separation**: `user_id` starts with `client:` iff it came
//!    from a self-declared `client_id`
//!
//! ## Module Organization
//!
//! - [`error`]: Error enum and the caller-facing classifier
//! - [`config`]: Runtime configuration and environment overrides
//! - [`schema`]: SQLite DDL and database initialization
//! - [`types`]: Entry model and request/response shapes
//! - [`id`]: Sortable entry id generation
//! - [`identity`]: Request validation and `user_id` normalization
//! - [`transaction`]: Scoped transactions with rollback on error and panic
//! - [`writer`]: The writer thread
//! - [`reader`]: Scan queries and the reader pool
//! - [`api`]: Async API (main entry point)

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for Chronicles operations.
///
/// A single error enum plus [`ErrorKind`](error::ErrorKind), which tells the
/// HTTP boundary which status to answer with and whether the message may be
/// shown to the caller.
pub mod error;

/// Runtime configuration.
pub mod config;

/// SQLite schema definitions and database initialization.
///
/// This module contains the DDL statements for all tables and the logic
/// to initialize a new database or verify an existing one.
pub mod schema;

/// Domain types: entries, append and scan requests, responses.
pub mod types;

/// Sortable, unique entry identifiers.
pub mod id;

/// Append request validation and identity normalization.
pub mod identity;

/// Scoped transactions.
///
/// Every write goes through [`in_transaction`](transaction::in_transaction),
/// which commits on success and rolls back on error or panic.
pub mod transaction;

/// The single writer thread.
///
/// Owns the read-write connection and the id generator. Each append and each
/// batch item runs in its own transaction, guarded by the caller's deadline.
pub mod writer;

/// Read operations for Chronicles.
///
/// This module provides the scan query and the pooled reader threads. It
/// ensures readers always see the latest committed data via WAL mode.
pub mod reader;

/// Async API for Chronicles.
///
/// The main entry point is [`Chronicles`](api::Chronicles).
pub mod api;

// =============================================================================
// Re-exports
// =============================================================================

pub use api::Chronicles;
pub use config::Config;
pub use error::{
    Error, ErrorKind, Result, ValidationError, GENERIC_FAILURE_MESSAGE, HEALTH_FAILURE_STATUS,
};
pub use schema::Database;
pub use types::{
    AppendOffsetRequest, AppendRequest, AppendResponse, AppendsRequest, AppendsResponse, Entry,
    EntryId, IdentityFilter, RequestContext, ScanRequest, ScanResponse, CLIENT_USER_ID_PREFIX,
    DEFAULT_SCAN_LIMIT,
};
