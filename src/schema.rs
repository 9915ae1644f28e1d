//! # SQLite Schema for Chronicles
//!
//! This module defines the database schema and handles initialization.
//!
//! ## Table Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Schema Overview                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  entries (WITHOUT ROWID)                 chronicles_metadata             │
//! │  ┌───────────────────────────┐           ┌─────────────────┐            │
//! │  │ id (PK, sortable text)    │           │ key (PK)        │            │
//! │  │ created_at (unix ms)      │           │ value           │            │
//! │  │ ip_addr, user_agent       │           └─────────────────┘            │
//! │  │ namespace        ───────┐ │                                          │
//! │  │ client_event_type ──────┤ │  secondary indexes:                      │
//! │  │ user_id          ───────┘ │  (namespace, id), (user_id, id),         │
//! │  │ client_* correlation ids  │  (client_event_type, id)                 │
//! │  │ data (JSON text)          │                                          │
//! │  └───────────────────────────┘                                          │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Decisions
//!
//! ### Why `WITHOUT ROWID`?
//!
//! The generated `id` is the only order the log has. Clustering the table on
//! it makes the scan `WHERE id > ? ORDER BY id LIMIT ?` a plain range walk of
//! the primary B-tree, with no rowid indirection.
//!
//! ### Why CHECK constraints?
//!
//! Validation happens before a transaction opens, but the table repeats the
//! non-empty invariants so that no code path can ever commit a row without a
//! namespace, event type or user id.

use std::time::Duration;

use rusqlite::Connection;
use tracing::{debug, info};

use crate::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version. Increment when making breaking schema changes.
const SCHEMA_VERSION: i32 = 1;

/// Default time a connection waits on a locked database before failing.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// DDL Statements
// =============================================================================

/// The `entries` table is the log itself.
///
/// # Columns
///
/// - `id`: Generated sortable id (primary key, total order of the log)
/// - `created_at`: Unix timestamp in milliseconds (anchor time + batch offset)
/// - `ip_addr`, `user_agent`: Captured from the transport layer
/// - `namespace`: Logical partition (which product emitted the event)
/// - `client_event_*`, `client_flow_*`, `client_session_id`: Caller correlation
/// - `user_id`: Verified id, or `client:` + self-declared id
/// - `data`: Raw JSON text, already validated
const CREATE_ENTRIES: &str = r#"
CREATE TABLE IF NOT EXISTS entries (
    id                TEXT PRIMARY KEY NOT NULL,
    created_at        INTEGER NOT NULL,
    ip_addr           TEXT NOT NULL,
    user_agent        TEXT NOT NULL,
    namespace         TEXT NOT NULL CHECK (namespace <> ''),
    client_event_id   TEXT,
    client_event_type TEXT NOT NULL CHECK (client_event_type <> ''),
    client_flow_id    TEXT,
    client_flow_type  TEXT,
    client_session_id TEXT,
    user_id           TEXT NOT NULL CHECK (user_id <> ''),
    data              TEXT
) WITHOUT ROWID
"#;

/// Secondary indexes for filtered scans.
///
/// Each index ends in `id` so a filtered scan can still walk in id order and
/// stop after `LIMIT` rows.
const CREATE_ENTRIES_NAMESPACE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS entries_namespace_id
ON entries(namespace, id)
"#;

const CREATE_ENTRIES_USER_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS entries_user_id_id
ON entries(user_id, id)
"#;

const CREATE_ENTRIES_EVENT_TYPE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS entries_client_event_type_id
ON entries(client_event_type, id)
"#;

/// Metadata table for schema versioning.
const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS chronicles_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

// =============================================================================
// Database Wrapper
// =============================================================================

/// A SQLite connection with the Chronicles schema applied.
///
/// `Database` owns its `Connection`; dropping it closes the connection.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens a database file, creating and initializing it if necessary.
    ///
    /// # Errors
    ///
    /// - `Error::Sqlite` if the file can't be opened or created
    /// - `Error::Schema` if the schema version doesn't match
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use chronicles::Database;
    ///
    /// let db = Database::open("chronicles.db")?;
    /// # Ok::<(), chronicles::Error>(())
    /// ```
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Self::open_with_busy_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Like [`Database::open`], with an explicit lock wait bound.
    pub fn open_with_busy_timeout(path: impl AsRef<std::path::Path>, busy_timeout: Duration) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "opening database");
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Creates an in-memory database for testing.
    ///
    /// In-memory databases are private to their connection, so they only work
    /// with the synchronous [`writer`](crate::writer) and
    /// [`reader`](crate::reader) functions, not with the threaded
    /// [`Chronicles`](crate::Chronicles) handle.
    ///
    /// ```rust
    /// use chronicles::Database;
    ///
    /// let db = Database::open_in_memory()?;
    /// # Ok::<(), chronicles::Error>(())
    /// ```
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Creates tables, verifies the schema version and sets pragmas.
    fn initialize(&mut self) -> Result<()> {
        // WAL: readers see the last committed state without blocking the writer.
        // The pragma answers with the resulting mode ("memory" for in-memory databases).
        let mode: String = self.conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        debug!(%mode, "journal mode set");
        self.conn.execute_batch("PRAGMA synchronous = NORMAL")?;

        self.conn.execute_batch(CREATE_METADATA)?;
        self.conn.execute_batch(CREATE_ENTRIES)?;
        self.conn.execute_batch(CREATE_ENTRIES_NAMESPACE_INDEX)?;
        self.conn.execute_batch(CREATE_ENTRIES_USER_INDEX)?;
        self.conn.execute_batch(CREATE_ENTRIES_EVENT_TYPE_INDEX)?;

        self.verify_or_set_version()?;

        Ok(())
    }

    /// Verifies the schema version, or sets it if this is a new database.
    fn verify_or_set_version(&mut self) -> Result<()> {
        let existing: Option<String> = match self.conn.query_row(
            "SELECT value FROM chronicles_metadata WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        ) {
            Ok(v) => Some(v),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(e.into()),
        };

        match existing {
            None => {
                info!(version = SCHEMA_VERSION, "initializing new database");
                self.conn.execute(
                    "INSERT INTO chronicles_metadata (key, value) VALUES ('schema_version', ?)",
                    [SCHEMA_VERSION.to_string()],
                )?;
            }
            Some(v) if v.parse::<i32>().ok() == Some(SCHEMA_VERSION) => {}
            Some(v) => {
                return Err(Error::Schema(format!(
                    "schema version mismatch: database has version {v}, but this build requires {SCHEMA_VERSION}"
                )));
            }
        }

        Ok(())
    }

    /// Consumes the wrapper and returns the initialized connection.
    pub fn into_connection(self) -> Connection {
        self.conn
    }

    /// Returns a reference to the underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

// =============================================================================
// Tests
// =============================================================================
