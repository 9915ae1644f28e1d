//! # Async API for Chronicles
//!
//! This module provides [`Chronicles`], the public async handle. It wraps the
//! synchronous writer and reader with Tokio channels so that async callers
//! never block on SQLite.
//!
//! ## The SQLite Challenge
//!
//! SQLite's `Connection` uses `RefCell` internally, making it `!Sync`. We
//! can't share one across tasks, even behind an `Arc`. Instead every
//! connection lives on its own OS thread and async code sends it requests:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Tokio Runtime                             │
//! │                                                              │
//! │  task1 ─┐                                  ┌─ task4          │
//! │  task2 ─┼─ mpsc (writes)    mpsc (reads) ──┼─ task5          │
//! │  task3 ─┘       │                 │        └─ task6          │
//! └─────────────────┼─────────────────┼──────────────────────────┘
//!                   ▼                 ▼
//!        ┌──────────────────┐  ┌──────────────────────────┐
//!        │ chronicles-writer│  │ chronicles-reader-0..N   │
//!        │ read-write conn  │  │ read-only conns (WAL)    │
//!        │ + id generator   │  │                          │
//!        └──────────────────┘  └──────────────────────────┘
//! ```
//!
//! ## Deadlines
//!
//! Every call runs under a deadline: the per-request
//! [`RequestContext::timeout`], or [`Config::request_timeout`]. When it
//! expires the caller gets `Error::Timeout` and the writer refuses to commit
//! anything on that request's behalf (see [`writer`](crate::writer)).
//!
//! ## Logging
//!
//! Each operation runs in a `tracing` span. Rejected requests are logged at
//! `warn`, storage and internal failures at `error` with full detail; callers
//! only ever see [`Error::public_message`].

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{Connection, OpenFlags};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{error, info, instrument, warn};

use crate::config::Config;
use crate::error::{Error, ErrorKind, Result};
use crate::identity::normalize;
use crate::reader::{self, ReadRequest};
use crate::schema::Database;
use crate::types::{
    AppendRequest, AppendResponse, AppendsRequest, AppendsResponse, RequestContext, ScanRequest,
    ScanResponse,
};
use crate::writer::{spawn_writer, Deadline, WriterHandle};

// =============================================================================
// Chronicles - The Main Async Handle
// =============================================================================

/// The main async handle for Chronicles operations.
///
/// # Thread Safety
///
/// `Chronicles` is `Clone`, `Send`, and `Sync`. All clones share the same
/// writer thread and reader pool.
///
/// # Example
///
/// ```rust,no_run
/// use chronicles::{AppendRequest, Chronicles, Config, RequestContext, ScanRequest};
///
/// # async fn example() -> chronicles::Result<()> {
/// let db = Chronicles::open(Config::new("chronicles.db")).await?;
///
/// let ctx = RequestContext::new("10.0.0.1", "curl/8.4");
/// let appended = db
///     .append(&ctx, AppendRequest::new("web", "click").with_client_id("abc"))
///     .await?;
///
/// let page = db.scan(ScanRequest::default().with_limit(100)).await?;
/// assert_eq!(page.entries[0].id, appended.id);
///
/// db.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Chronicles {
    /// Handle to the writer thread.
    writer: WriterHandle,

    /// Channel to the reader pool.
    read_tx: mpsc::Sender<ReadRequest>,

    /// Writer and reader threads, joined on shutdown.
    threads: Arc<Mutex<Vec<JoinHandle<()>>>>,

    /// Number of reader threads in the pool.
    reader_count: usize,

    config: Arc<Config>,
}

impl Chronicles {
    /// Opens (or creates) the store described by `config`.
    ///
    /// # Errors
    ///
    /// - `Error::Config` if the config is unusable
    /// - `Error::Sqlite` / `Error::Schema` if the database can't be opened
    /// - `Error::Unavailable` if a worker thread can't be spawned
    pub async fn open(config: Config) -> Result<Self> {
        config.validate()?;

        let db = Database::open_with_busy_timeout(&config.db_path, config.busy_timeout)?;
        let (writer, writer_thread) = spawn_writer(db.into_connection(), config.channel_size)?;

        let reader_count = config.effective_reader_threads();
        let (read_tx, read_rx) = mpsc::channel(config.channel_size);
        let read_rx = Arc::new(std::sync::Mutex::new(read_rx));

        let mut threads = Vec::with_capacity(reader_count + 1);
        threads.push(writer_thread);

        // Each reader opens its own read-only connection to the same file.
        for i in 0..reader_count {
            let conn = open_read_only(&config.db_path, config.busy_timeout)?;
            let rx = Arc::clone(&read_rx);
            let handle = thread::Builder::new()
                .name(format!("chronicles-reader-{i}"))
                .spawn(move || reader::run_reader_pooled(conn, rx))
                .map_err(|e| Error::Unavailable(format!("failed to spawn reader thread: {e}")))?;
            threads.push(handle);
        }

        info!(path = %config.db_path.display(), readers = reader_count, "chronicles opened");

        Ok(Self {
            writer,
            read_tx,
            threads: Arc::new(Mutex::new(threads)),
            reader_count,
            config: Arc::new(config),
        })
    }

    /// Opens the store at `path` with default settings.
    pub async fn open_path(path: impl Into<PathBuf>) -> Result<Self> {
        Self::open(Config::new(path)).await
    }

    /// Returns the number of reader threads in the pool.
    pub fn reader_count(&self) -> usize {
        self.reader_count
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Appends one entry and returns its id.
    ///
    /// `created_at` is the moment this call was made. Appends are not
    /// idempotent: retrying after an ambiguous failure may store a second
    /// entry.
    ///
    /// # Errors
    ///
    /// - `Error::Validation` if the request breaks an identity or field rule;
    ///   nothing is written
    /// - `Error::Timeout` if the deadline expires; nothing is committed
    /// - other storage errors after the transaction has been rolled back
    #[instrument(skip_all, fields(namespace = %request.namespace, event_type = %request.client_event_type))]
    pub async fn append(&self, ctx: &RequestContext, request: AppendRequest) -> Result<AppendResponse> {
        // Rejected before queueing, so a busy writer can't turn it into a timeout.
        normalize(&request)
            .map_err(Error::from)
            .inspect_err(|e| log_failure("append", e))?;

        let observed_at = Utc::now();
        let deadline = Deadline::after("append", self.budget(ctx));

        let result = with_deadline(
            deadline,
            self.writer.append(request, ctx.clone(), observed_at, deadline),
        )
        .await;

        result
            .map(|id| AppendResponse { id })
            .inspect_err(|e| log_failure("append", e))
    }

    /// Appends a batch of entries sharing one anchor time.
    ///
    /// Item `i` gets `created_at = now + append_requests[i].offset` ms. Items
    /// are appended in order, each in its own transaction. The batch is not
    /// atomic: on failure the items before the failing one stay committed and
    /// the error is an `Error::Batch` listing their ids.
    ///
    /// An empty batch returns an empty id list without touching the store.
    #[instrument(skip_all, fields(items = request.append_requests.len()))]
    pub async fn append_batch(&self, ctx: &RequestContext, request: AppendsRequest) -> Result<AppendsResponse> {
        let items = request.append_requests;
        if items.is_empty() {
            return Ok(AppendsResponse::default());
        }

        let now = Utc::now();
        let deadline = Deadline::after("append batch", self.budget(ctx));

        let result = with_deadline(
            deadline,
            self.writer.append_batch(items, ctx.clone(), now, deadline),
        )
        .await;

        result
            .map(|ids| AppendsResponse { ids })
            .inspect_err(|e| log_failure("append batch", e))
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Returns entries after the request's cursor, in ascending id order,
    /// under the configured request timeout.
    ///
    /// Scans have no side effects and are safe to retry.
    pub async fn scan(&self, request: ScanRequest) -> Result<ScanResponse> {
        self.scan_with_timeout(request, self.config.request_timeout).await
    }

    /// Like [`scan`](Self::scan), with an explicit deadline.
    #[instrument(skip_all, fields(cursor = request.cursor().unwrap_or(""), limit = ?request.limit))]
    pub async fn scan_with_timeout(&self, request: ScanRequest, timeout: Duration) -> Result<ScanResponse> {
        let limit = request.effective_limit(self.config.default_scan_limit);
        let deadline = Deadline::after("scan", timeout);
        let (response_tx, response_rx) = oneshot::channel();

        let round_trip = async {
            self.read_tx
                .send(ReadRequest::Scan {
                    request,
                    limit,
                    response: response_tx,
                })
                .await
                .map_err(|_| Error::Unavailable("reader pool has shut down".to_string()))?;

            response_rx
                .await
                .map_err(|_| Error::Unavailable("reader dropped response channel".to_string()))?
        };

        with_deadline(deadline, round_trip)
            .await
            .map(|entries| ScanResponse { entries })
            .inspect_err(|e| log_failure("scan", e))
    }

    /// Verifies that the store can still run a statement.
    ///
    /// Pings on a fresh read-only connection instead of going through the
    /// reader queue, so a scan backlog doesn't read as an unhealthy store.
    /// Fails with `Error::Unhealthy` (the boundary answers "failed
    /// dependency") if the store doesn't answer within
    /// [`Config::health_timeout`] or the handle has been shut down.
    pub async fn health_check(&self) -> Result<()> {
        let deadline = Deadline::after("health check", self.config.health_timeout);
        let stopped = self.read_tx.is_closed() || self.writer.is_closed();
        let path = self.config.db_path.clone();
        let busy_timeout = self.config.busy_timeout;

        let round_trip = async move {
            if stopped {
                return Err(Error::Unavailable("store has shut down".to_string()));
            }
            tokio::task::spawn_blocking(move || {
                let conn = open_read_only(&path, busy_timeout)?;
                reader::ping(&conn)
            })
            .await
            .map_err(|e| Error::Unavailable(format!("health check task failed: {e}")))?
        };

        with_deadline(deadline, round_trip)
            .await
            .map_err(|source| Error::Unhealthy(Box::new(source)))
            .inspect_err(|e| log_failure("health check", e))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Shuts down the store gracefully.
    ///
    /// 1. Tells the writer to stop after the requests already queued
    /// 2. Sends a shutdown signal to every reader thread
    /// 3. Waits for all threads; their connections close as they exit
    ///
    /// Other clones of this handle fail with `Error::Unavailable` afterwards.
    pub async fn shutdown(self) {
        self.writer.shutdown().await;
        for _ in 0..self.reader_count {
            let _ = self.read_tx.send(ReadRequest::Shutdown).await;
        }

        let threads = std::mem::take(&mut *self.threads.lock().await);
        let joined = tokio::task::spawn_blocking(move || {
            threads
                .into_iter()
                .filter_map(|handle| handle.join().err())
                .count()
        })
        .await;

        match joined {
            Ok(0) => info!("chronicles shut down"),
            Ok(panicked) => error!(panicked, "worker threads panicked before shutdown"),
            Err(e) => error!(error = %e, "failed to join worker threads"),
        }
    }

    fn budget(&self, ctx: &RequestContext) -> Duration {
        ctx.timeout.unwrap_or(self.config.request_timeout)
    }
}

fn open_read_only(path: &Path, busy_timeout: Duration) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.busy_timeout(busy_timeout)?;
    Ok(conn)
}

/// Awaits `round_trip`, turning an elapsed deadline into `Error::Timeout`.
async fn with_deadline<T>(deadline: Deadline, round_trip: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(deadline.budget(), round_trip).await {
        Ok(result) => result,
        Err(_) => Err(deadline.exceeded()),
    }
}

fn log_failure(operation: &'static str, err: &Error) {
    match err.kind() {
        ErrorKind::Validation => warn!(operation, error = %err, "request rejected"),
        ErrorKind::Storage | ErrorKind::Internal => {
            error!(operation, kind = ?err.kind(), error = %err, "request failed")
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
