#![allow(dead_code)]

use std::path::{Path, PathBuf};

use chronicles::{AppendRequest, Chronicles, Config, Entry, EntryId, RequestContext, ScanRequest};
use rusqlite::{Connection, OpenFlags};

pub fn create_temp_db_path(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    (dir, path)
}

/// Opens a store in a fresh temp dir. Keep the `TempDir` alive for the test.
pub async fn open_temp_store(name: &str) -> (Chronicles, tempfile::TempDir) {
    let (dir, path) = create_temp_db_path(name);
    let config = Config::new(path).with_reader_threads(2);
    let db = Chronicles::open(config).await.expect("open store");
    (db, dir)
}

pub fn open_read_only(path: &Path) -> Connection {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .expect("open read-only connection")
}

pub fn count_entries(path: &Path) -> i64 {
    open_read_only(path)
        .query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))
        .expect("count entries")
}

pub fn ctx() -> RequestContext {
    RequestContext::new("203.0.113.9", "integration-test/1.0")
}

pub fn verified(namespace: &str, event_type: &str, user: &str) -> AppendRequest {
    AppendRequest::new(namespace, event_type).with_keycloak_id(user)
}

pub fn client(namespace: &str, event_type: &str, device: &str) -> AppendRequest {
    AppendRequest::new(namespace, event_type).with_client_id(device)
}

pub async fn scan_all(db: &Chronicles) -> Vec<Entry> {
    db.scan(ScanRequest::default().with_limit(100_000))
        .await
        .expect("scan")
        .entries
}

pub fn ids(entries: &[Entry]) -> Vec<EntryId> {
    entries.iter().map(|e| e.id.clone()).collect()
}
