//! # Entry Reader
//!
//! Scans run on a pool of reader threads, each with its own read-only SQLite
//! connection. WAL mode lets them see the latest committed state without ever
//! blocking the writer.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Reader Pool                                │
//! │                                                                  │
//! │  ┌─────────┐  ┌─────────┐  ┌─────────┐  ┌─────────┐            │
//! │  │Reader 1 │  │Reader 2 │  │Reader 3 │  │Reader N │            │
//! │  │(thread) │  │(thread) │  │(thread) │  │(thread) │            │
//! │  └────┬────┘  └────┬────┘  └────┬────┘  └────┬────┘            │
//! │       └────────────┴─────┬──────┴────────────┘                  │
//! │                   Read-only SQLite                               │
//! │                     connections                                  │
//! └──────────────────────────┬──────────────────────────────────────┘
//!                            ▼
//!                    ┌─────────────┐
//!                    │   SQLite    │
//!                    │   (WAL)     │
//!                    └─────────────┘
//! ```
//!
//! ## Query Shape
//!
//! Every scan is one statement of the form
//!
//! ```sql
//! SELECT ... FROM entries
//! WHERE id > ?                          -- cursor, when set
//!   AND namespace IN (?, ?)             -- each non-empty filter set
//!   AND substr(user_id, 1, length(?)) = ?   -- identity kind, when set
//! ORDER BY id ASC
//! LIMIT ?
//! ```
//!
//! All values are bound as parameters; nothing caller-supplied is spliced
//! into the SQL text. The identity test is a byte-wise prefix comparison
//! rather than `LIKE`, which SQLite evaluates case-insensitively.

use std::sync::{Arc, Mutex};

use chrono::DateTime;
use rusqlite::types::{Type, Value};
use rusqlite::{params_from_iter, Connection, Row};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::error::Result;
use crate::types::{Entry, EntryId, IdentityFilter, ScanRequest, CLIENT_USER_ID_PREFIX};

const SELECT_ENTRIES: &str = "SELECT id, created_at, ip_addr, user_agent, namespace, \
     client_event_id, client_event_type, client_flow_id, client_flow_type, \
     client_session_id, user_id, data FROM entries";

// =============================================================================
// Request Types
// =============================================================================

/// Request type for read operations.
pub enum ReadRequest {
    /// Run a scan with an already-resolved limit.
    Scan {
        request: ScanRequest,
        limit: usize,
        response: oneshot::Sender<Result<Vec<Entry>>>,
    },
    /// Stop one reader thread.
    Shutdown,
}

// =============================================================================
// Direct Read Functions
// =============================================================================

/// Runs a filtered, cursor-paginated forward scan.
///
/// Returns at most `limit` entries with ids strictly greater than the cursor,
/// in ascending id order. No matches is an empty vec, not an error.
pub fn scan(conn: &Connection, request: &ScanRequest, limit: usize) -> Result<Vec<Entry>> {
    let (sql, values) = build_scan_query(request, limit);

    let mut stmt = conn.prepare_cached(&sql)?;
    let entries = stmt
        .query_map(params_from_iter(values), row_to_entry)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    debug!(returned = entries.len(), limit, "scan complete");
    Ok(entries)
}

/// Runs `SELECT 1` on the connection.
pub fn ping(conn: &Connection) -> Result<()> {
    conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
    Ok(())
}

/// Builds the scan statement and its positional parameters.
fn build_scan_query(request: &ScanRequest, limit: usize) -> (String, Vec<Value>) {
    let mut clauses: Vec<String> = Vec::new();
    let mut values: Vec<Value> = Vec::new();

    if let Some(cursor) = request.cursor() {
        clauses.push("id > ?".to_string());
        values.push(Value::Text(cursor.to_string()));
    }

    for (column, set) in [
        ("namespace", &request.namespaces),
        ("user_id", &request.user_ids),
        ("client_event_type", &request.event_types),
    ] {
        if set.is_empty() {
            continue;
        }
        let placeholders = vec!["?"; set.len()].join(", ");
        clauses.push(format!("{column} IN ({placeholders})"));
        values.extend(set.iter().cloned().map(Value::Text));
    }

    match request.identity_filter() {
        IdentityFilter::Any => {}
        IdentityFilter::Verified => {
            clauses.push("substr(user_id, 1, length(?)) <> ?".to_string());
            values.push(Value::Text(CLIENT_USER_ID_PREFIX.to_string()));
            values.push(Value::Text(CLIENT_USER_ID_PREFIX.to_string()));
        }
        IdentityFilter::Client => {
            clauses.push("substr(user_id, 1, length(?)) = ?".to_string());
            values.push(Value::Text(CLIENT_USER_ID_PREFIX.to_string()));
            values.push(Value::Text(CLIENT_USER_ID_PREFIX.to_string()));
        }
    }

    let mut sql = String::from(SELECT_ENTRIES);
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY id ASC LIMIT ?");
    values.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));

    (sql, values)
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<Entry> {
    let created_ms: i64 = row.get(1)?;
    let created_at = DateTime::from_timestamp_millis(created_ms).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            Type::Integer,
            format!("created_at {created_ms} out of range").into(),
        )
    })?;

    Ok(Entry {
        id: EntryId::new(row.get::<_, String>(0)?),
        created_at,
        ip_addr: row.get(2)?,
        user_agent: row.get(3)?,
        namespace: row.get(4)?,
        client_event_id: row.get(5)?,
        client_event_type: row.get(6)?,
        client_flow_id: row.get(7)?,
        client_flow_type: row.get(8)?,
        client_session_id: row.get(9)?,
        user_id: row.get(10)?,
        data: row.get(11)?,
    })
}

// =============================================================================
// Reader Loop
// =============================================================================

/// Pooled reader loop.
///
/// All reader threads share one receiver behind a mutex; whichever thread is
/// free takes the next request. Each thread blocks on its own connection, so
/// scans run in parallel.
pub fn run_reader_pooled(conn: Connection, rx: Arc<Mutex<mpsc::Receiver<ReadRequest>>>) {
    loop {
        let request = {
            // A poisoned lock only means another reader panicked while waiting;
            // the receiver itself is still consistent.
            let mut guard = rx.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.blocking_recv()
        };

        match request {
            Some(ReadRequest::Scan {
                request,
                limit,
                response,
            }) => {
                if response.is_closed() {
                    continue;
                }
                let _ = response.send(scan(&conn, &request, limit));
            }
            Some(ReadRequest::Shutdown) | None => break,
        }
    }
    info!("reader stopped");
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::schema::Database;
    use crate::types::{AppendRequest, RequestContext};
    use crate::writer::EntryWriter;

    /// An in-memory database seeded through the real write path.
    ///
    /// In-memory databases are private to one connection, so scans borrow
    /// the writer's.
    struct Fixture {
        writer: EntryWriter,
    }

    impl Fixture {
        fn new() -> Self {
            let db = Database::open_in_memory().unwrap();
            Self {
                writer: EntryWriter::new(db.into_connection()),
            }
        }

        fn append(&mut self, request: AppendRequest) -> EntryId {
            self.writer
                .append(&request, &RequestContext::new("127.0.0.1", "ua"), Utc::now(), || Ok(()))
                .unwrap()
        }

        fn scan(&self, request: &ScanRequest, limit: usize) -> Vec<Entry> {
            scan(self.writer.connection(), request, limit).unwrap()
        }
    }

    fn ids(entries: &[Entry]) -> Vec<EntryId> {
        entries.iter().map(|e| e.id.clone()).collect()
    }

    #[test]
    fn test_scan_empty_store() {
        let fixture = Fixture::new();
        assert!(fixture.scan(&ScanRequest::default(), 500).is_empty());
    }

    #[test]
    fn test_scan_pages_with_cursor() {
        let mut fixture = Fixture::new();
        let a = fixture.append(AppendRequest::new("ns", "t").with_keycloak_id("u1"));
        let b = fixture.append(AppendRequest::new("ns", "t").with_keycloak_id("u1"));
        let c = fixture.append(AppendRequest::new("ns", "t").with_keycloak_id("u1"));

        let first = fixture.scan(&ScanRequest::default(), 2);
        assert_eq!(ids(&first), vec![a, b.clone()]);

        let second = fixture.scan(&ScanRequest::default().after(b.as_str()), 2);
        assert_eq!(ids(&second), vec![c.clone()]);

        let third = fixture.scan(&ScanRequest::default().after(c.as_str()), 2);
        assert!(third.is_empty());
    }

    #[test]
    fn test_scan_set_filters_are_and_combined() {
        let mut fixture = Fixture::new();
        let web_click = fixture.append(AppendRequest::new("web", "click").with_keycloak_id("u1"));
        let _web_view = fixture.append(AppendRequest::new("web", "view").with_keycloak_id("u1"));
        let mobile_click = fixture.append(AppendRequest::new("mobile", "click").with_keycloak_id("u2"));
        let _tv_click = fixture.append(AppendRequest::new("tv", "click").with_keycloak_id("u1"));

        let request = ScanRequest::default()
            .with_namespaces(["web", "mobile"])
            .with_event_types(["click"]);
        assert_eq!(ids(&fixture.scan(&request, 500)), vec![web_click.clone(), mobile_click]);

        let request = ScanRequest::default()
            .with_namespaces(["web", "mobile"])
            .with_event_types(["click"])
            .with_user_ids(["u1"]);
        assert_eq!(ids(&fixture.scan(&request, 500)), vec![web_click]);
    }

    #[test]
    fn test_scan_identity_filter() {
        let mut fixture = Fixture::new();
        let verified = fixture.append(AppendRequest::new("ns", "t").with_keycloak_id("u1"));
        let client = fixture.append(AppendRequest::new("ns", "t").with_client_id("abc"));
        // Upper-case lookalike of the prefix is still a verified id.
        let lookalike = fixture.append(AppendRequest::new("ns", "t").with_keycloak_id("CLIENT:x"));

        let only_verified = fixture.scan(&ScanRequest::default().with_identity(IdentityFilter::Verified), 500);
        assert_eq!(ids(&only_verified), vec![verified.clone(), lookalike.clone()]);

        let only_client = fixture.scan(&ScanRequest::default().with_identity(IdentityFilter::Client), 500);
        assert_eq!(ids(&only_client), vec![client.clone()]);
        assert_eq!(only_client[0].user_id, "client:abc");

        let all = fixture.scan(&ScanRequest::default(), 500);
        assert_eq!(ids(&all), vec![verified, client, lookalike]);
    }

    #[test]
    fn test_scan_filter_values_are_bound_not_spliced() {
        let mut fixture = Fixture::new();
        fixture.append(AppendRequest::new("ns", "t").with_keycloak_id("u1"));

        let request = ScanRequest::default().with_namespaces(["ns') OR 1=1 --"]);
        assert!(fixture.scan(&request, 500).is_empty());
    }

    #[test]
    fn test_scan_round_trips_fields() {
        let mut fixture = Fixture::new();
        let id = fixture.append(
            AppendRequest::new("ns", "purchase")
                .with_client_id("abc")
                .with_flow("f-1", "checkout")
                .with_data(r#"{"amount": 12.5}"#),
        );

        let entries = fixture.scan(&ScanRequest::default(), 500);
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.id, id);
        assert_eq!(entry.ip_addr, "127.0.0.1");
        assert_eq!(entry.client_flow_type.as_deref(), Some("checkout"));
        assert_eq!(entry.client_event_id, None);
        assert_eq!(entry.data.as_deref(), Some(r#"{"amount": 12.5}"#));
    }

    #[test]
    fn test_build_scan_query_without_filters() {
        let (sql, values) = build_scan_query(&ScanRequest::default(), 10);
        assert!(!sql.contains("WHERE"));
        assert!(sql.ends_with("ORDER BY id ASC LIMIT ?"));
        assert_eq!(values, vec![Value::Integer(10)]);
    }

    #[test]
    fn test_ping() {
        let db = Database::open_in_memory().unwrap();
        assert!(ping(db.connection()).is_ok());
    }
}
