//! Transaction Rollback Tests
//!
//! A failed append never leaves a row or an open transaction behind:
//! - errors inside the transaction body roll back
//! - panics inside the transaction body roll back and become storage errors
//! - expired deadlines stop the commit
//! - the store keeps serving afterwards

mod common;

use std::time::Duration;

use chronicles::transaction::in_transaction;
use chronicles::{
    AppendOffsetRequest, AppendsRequest, Chronicles, Config, Database, Error, ErrorKind, ScanRequest,
    GENERIC_FAILURE_MESSAGE, HEALTH_FAILURE_STATUS,
};

#[test]
fn panic_in_body_leaves_no_row_and_no_open_transaction() {
    let (_dir, path) = common::create_temp_db_path("panic.db");
    let mut conn = Database::open(&path).unwrap().into_connection();

    let result: chronicles::Result<()> = in_transaction(&mut conn, |tx| {
        tx.execute(
            "INSERT INTO entries (id, created_at, ip_addr, user_agent, namespace, client_event_type, user_id)
             VALUES ('01J0000000000000000000000A', 0, '', '', 'ns', 't', 'u1')",
            [],
        )
        .unwrap();
        panic!("fault injected after insert");
    });

    let err = result.unwrap_err();
    assert!(matches!(err, Error::TransactionPanicked(ref msg) if msg == "fault injected after insert"));
    assert_eq!(err.kind(), ErrorKind::Storage);
    assert_eq!(err.public_message(), GENERIC_FAILURE_MESSAGE);

    assert!(conn.is_autocommit());
    assert_eq!(common::count_entries(&path), 0);
}

#[test]
fn constraint_failure_rolls_back_whole_body() {
    let (_dir, path) = common::create_temp_db_path("constraint.db");
    let mut conn = Database::open(&path).unwrap().into_connection();

    let result: chronicles::Result<()> = in_transaction(&mut conn, |tx| {
        tx.execute(
            "INSERT INTO entries (id, created_at, ip_addr, user_agent, namespace, client_event_type, user_id)
             VALUES ('01J0000000000000000000000A', 0, '', '', 'ns', 't', 'u1')",
            [],
        )?;
        // Same primary key.
        tx.execute(
            "INSERT INTO entries (id, created_at, ip_addr, user_agent, namespace, client_event_type, user_id)
             VALUES ('01J0000000000000000000000A', 0, '', '', 'ns', 't', 'u1')",
            [],
        )?;
        Ok(())
    });

    assert!(matches!(result, Err(Error::Sqlite(_))));
    assert_eq!(common::count_entries(&path), 0);
}

#[tokio::test]
async fn expired_deadline_commits_nothing_and_store_recovers() {
    let (dir, path) = common::create_temp_db_path("deadline.db");
    let db = chronicles::Chronicles::open_path(&path).await.unwrap();

    let late = common::ctx().with_timeout(Duration::ZERO);
    let err = db
        .append(&late, common::verified("ns", "late", "u1"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }));
    assert_eq!(err.public_message(), GENERIC_FAILURE_MESSAGE);

    let err = db
        .append_batch(
            &late,
            chronicles::AppendsRequest::new(vec![chronicles::AppendOffsetRequest::new(
                0,
                common::verified("ns", "late-batch", "u1"),
            )]),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Storage);

    let on_time = db
        .append(&common::ctx(), common::verified("ns", "on-time", "u1"))
        .await
        .unwrap();

    let entries = common::scan_all(&db).await;
    assert_eq!(common::ids(&entries), vec![on_time.id]);

    db.shutdown().await;
    assert_eq!(common::count_entries(&path), 1);
    drop(dir);
}

#[tokio::test]
async fn health_check_reports_storage_failure_after_shutdown() {
    let (db, _dir) = common::open_temp_store("health.db").await;
    db.health_check().await.unwrap();

    let handle = db.clone();
    db.shutdown().await;

    let err = handle.health_check().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Storage);
    assert_eq!(err.status_code(), HEALTH_FAILURE_STATUS);
    assert_eq!(err.public_message(), GENERIC_FAILURE_MESSAGE);
}

#[tokio::test]
async fn health_check_is_not_queued_behind_scans() {
    let (_dir, path) = common::create_temp_db_path("health_backlog.db");
    let config = Config::new(&path)
        .with_reader_threads(1)
        .with_health_timeout(Duration::from_millis(500));
    let db = Chronicles::open(config).await.unwrap();

    let items = (0..2000)
        .map(|i| AppendOffsetRequest::new(i, common::verified("ns", "t", "u1")))
        .collect();
    let ctx = common::ctx().with_timeout(Duration::from_secs(60));
    db.append_batch(&ctx, AppendsRequest::new(items)).await.unwrap();

    // Full scans pile up in front of the single reader thread.
    let scans: Vec<_> = (0..200)
        .map(|_| {
            let db = db.clone();
            tokio::spawn(async move {
                db.scan_with_timeout(ScanRequest::default().with_limit(5000), Duration::from_secs(60))
                    .await
            })
        })
        .collect();
    tokio::task::yield_now().await;

    db.health_check().await.unwrap();

    for scan in scans {
        assert_eq!(scan.await.unwrap().unwrap().entries.len(), 2000);
    }
    db.shutdown().await;
}

#[tokio::test]
async fn reopen_keeps_committed_entries() {
    let (_dir, path) = common::create_temp_db_path("reopen.db");

    let db = chronicles::Chronicles::open_path(&path).await.unwrap();
    let first = db.append(&common::ctx(), common::verified("ns", "t", "u1")).await.unwrap().id;
    db.shutdown().await;

    // A fresh generator only orders after older ids from a later millisecond.
    tokio::time::sleep(Duration::from_millis(5)).await;

    let db = chronicles::Chronicles::open_path(&path).await.unwrap();
    let second = db.append(&common::ctx(), common::verified("ns", "t", "u1")).await.unwrap().id;
    assert!(second > first, "a restarted generator still sorts after earlier ids");

    let entries = common::scan_all(&db).await;
    assert_eq!(common::ids(&entries), vec![first, second]);
    db.shutdown().await;
}
