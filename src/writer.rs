//! # Entry Writer
//!
//! All writes go through one dedicated thread that owns the read-write SQLite
//! connection and the [`IdGenerator`]. Async callers talk to it over a bounded
//! channel and get their answer back on a oneshot.
//!
//! ```text
//!   append() ─┐                          ┌──────────────────────────────┐
//!   append() ─┼── mpsc::Sender ─────────▶│  chronicles-writer thread    │
//!   batch()  ─┘   (bounded)              │                              │
//!        ▲                               │  normalize → id → BEGIN      │
//!        │                               │  INSERT → guard → COMMIT     │
//!        └──────── oneshot reply ◀───────│                              │
//!                                        └──────────────────────────────┘
//! ```
//!
//! ## One Transaction per Entry
//!
//! Every append, and every item of a batch, is its own immediate transaction.
//! A batch is therefore **not** atomic: when item *k* fails, items before it
//! stay committed and the caller gets [`Error::Batch`] listing their ids.
//!
//! ## Deadlines
//!
//! The caller wraps the round trip in `tokio::time::timeout`. That alone can't
//! stop a write the writer has already started, so the writer runs a guard
//! right before `BEGIN` and again right before `COMMIT`:
//!
//! - the [`Deadline`] has expired, or
//! - the reply channel is closed (the caller stopped waiting)
//!
//! Either one turns into `Error::Timeout` inside the transaction body, which
//! rolls the insert back. A timed-out append has therefore never been
//! committed, unless the deadline fired between `COMMIT` and the reply.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use rusqlite::{params, Connection, Transaction};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{Error, Result, ValidationError};
use crate::id::IdGenerator;
use crate::identity::normalize;
use crate::transaction::in_transaction;
use crate::types::{AppendOffsetRequest, AppendRequest, Entry, EntryId, RequestContext};

const INSERT_ENTRY: &str = r#"
INSERT INTO entries (
    id, created_at, ip_addr, user_agent, namespace,
    client_event_id, client_event_type, client_flow_id, client_flow_type,
    client_session_id, user_id, data
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
"#;

// =============================================================================
// Deadline
// =============================================================================

/// The point in time after which a request must not commit anything.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    operation: &'static str,
    budget: Duration,
    /// `None` when `now + budget` overflows; such a deadline never expires.
    expires_at: Option<Instant>,
}

impl Deadline {
    /// Starts a deadline of `budget` from now.
    pub fn after(operation: &'static str, budget: Duration) -> Self {
        Self {
            operation,
            budget,
            expires_at: Instant::now().checked_add(budget),
        }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }

    /// The error reported when this deadline is missed.
    pub fn exceeded(&self) -> Error {
        Error::Timeout {
            operation: self.operation,
            after: self.budget,
        }
    }

    /// `Err(Timeout)` if the deadline has passed.
    pub fn check(&self) -> Result<()> {
        if self.is_expired() {
            Err(self.exceeded())
        } else {
            Ok(())
        }
    }
}

// =============================================================================
// Request Types
// =============================================================================

/// A write request sent to the writer thread.
pub enum WriteRequest {
    /// One entry.
    Append {
        request: AppendRequest,
        context: RequestContext,
        observed_at: DateTime<Utc>,
        deadline: Deadline,
        response: oneshot::Sender<Result<EntryId>>,
    },

    /// Several entries sharing one anchor time, each in its own transaction.
    AppendBatch {
        items: Vec<AppendOffsetRequest>,
        context: RequestContext,
        now: DateTime<Utc>,
        deadline: Deadline,
        response: oneshot::Sender<Result<Vec<EntryId>>>,
    },

    /// Stop the writer thread.
    Shutdown,
}

// =============================================================================
// Entry Writer
// =============================================================================

/// Owns the write connection and the id generator.
///
/// This is the synchronous core of the write path. It runs on the writer
/// thread in production; tests drive it directly.
pub struct EntryWriter {
    conn: Connection,
    ids: IdGenerator,
}

impl EntryWriter {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn,
            ids: IdGenerator::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Validates, stamps and durably stores one entry.
    ///
    /// `guard` runs before the transaction opens and again after the insert,
    /// right before commit. If it fails the insert is rolled back and its
    /// error is returned.
    ///
    /// # Errors
    ///
    /// - `Error::Validation` before anything is written
    /// - `Error::IdGeneration` if no id could be produced
    /// - `Error::Sqlite` / `Error::TransactionPanicked` after rollback
    /// - whatever `guard` returned, after rollback
    pub fn append<G>(
        &mut self,
        request: &AppendRequest,
        context: &RequestContext,
        observed_at: DateTime<Utc>,
        guard: G,
    ) -> Result<EntryId>
    where
        G: Fn() -> Result<()>,
    {
        let identity = normalize(request)?;
        guard()?;

        let entry = Entry {
            id: self.ids.next()?,
            created_at: observed_at,
            ip_addr: context.ip_addr.clone(),
            user_agent: context.user_agent.clone(),
            namespace: request.namespace.clone(),
            client_event_id: request.client_event_id.clone(),
            client_event_type: request.client_event_type.clone(),
            client_flow_id: request.client_flow_id.clone(),
            client_flow_type: request.client_flow_type.clone(),
            client_session_id: request.client_session_id.clone(),
            user_id: identity.user_id,
            data: request.data.clone(),
        };

        in_transaction(&mut self.conn, |tx| {
            insert_entry(tx, &entry)?;
            guard()
        })?;

        debug!(id = %entry.id, namespace = %entry.namespace, "entry committed");
        Ok(entry.id)
    }

    /// Appends each item in order, stopping at the first failure.
    ///
    /// Item `i` gets `created_at = now + items[i].offset` milliseconds.
    ///
    /// # Errors
    ///
    /// `Error::Batch` with the failing index and the ids committed before it.
    pub fn append_batch<G>(
        &mut self,
        items: &[AppendOffsetRequest],
        context: &RequestContext,
        now: DateTime<Utc>,
        guard: G,
    ) -> Result<Vec<EntryId>>
    where
        G: Fn() -> Result<()>,
    {
        let mut committed = Vec::with_capacity(items.len());

        for (index, item) in items.iter().enumerate() {
            let outcome = offset_time(now, item.offset)
                .and_then(|observed_at| self.append(&item.append, context, observed_at, &guard));

            match outcome {
                Ok(id) => committed.push(id),
                Err(source) => {
                    return Err(Error::Batch {
                        index,
                        committed,
                        source: Box::new(source),
                    });
                }
            }
        }

        Ok(committed)
    }
}

/// `now` shifted by `offset_ms`, which may be negative.
pub fn offset_time(now: DateTime<Utc>, offset_ms: i64) -> Result<DateTime<Utc>> {
    TimeDelta::try_milliseconds(offset_ms)
        .and_then(|delta| now.checked_add_signed(delta))
        .ok_or_else(|| ValidationError::OffsetOutOfRange(offset_ms).into())
}

fn insert_entry(tx: &Transaction<'_>, entry: &Entry) -> Result<()> {
    let mut stmt = tx.prepare_cached(INSERT_ENTRY)?;
    stmt.execute(params![
        entry.id.as_str(),
        entry.created_at.timestamp_millis(),
        entry.ip_addr,
        entry.user_agent,
        entry.namespace,
        entry.client_event_id,
        entry.client_event_type,
        entry.client_flow_id,
        entry.client_flow_type,
        entry.client_session_id,
        entry.user_id,
        entry.data,
    ])?;
    Ok(())
}

/// Fails when the deadline has passed or nobody is waiting for the reply.
fn commit_guard<T>(deadline: &Deadline, response: &oneshot::Sender<T>) -> Result<()> {
    if response.is_closed() {
        return Err(deadline.exceeded());
    }
    deadline.check()
}

// =============================================================================
// Writer Handle
// =============================================================================

/// Async handle to the writer thread.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<WriteRequest>,
}

impl WriterHandle {
    /// Sends one append and waits for the writer's answer.
    pub async fn append(
        &self,
        request: AppendRequest,
        context: RequestContext,
        observed_at: DateTime<Utc>,
        deadline: Deadline,
    ) -> Result<EntryId> {
        let (response_tx, response_rx) = oneshot::channel();

        self.tx
            .send(WriteRequest::Append {
                request,
                context,
                observed_at,
                deadline,
                response: response_tx,
            })
            .await
            .map_err(|_| Error::Unavailable("writer has shut down".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::Unavailable("writer dropped response".to_string()))?
    }

    /// Sends a batch and waits for the writer's answer.
    pub async fn append_batch(
        &self,
        items: Vec<AppendOffsetRequest>,
        context: RequestContext,
        now: DateTime<Utc>,
        deadline: Deadline,
    ) -> Result<Vec<EntryId>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let (response_tx, response_rx) = oneshot::channel();

        self.tx
            .send(WriteRequest::AppendBatch {
                items,
                context,
                now,
                deadline,
                response: response_tx,
            })
            .await
            .map_err(|_| Error::Unavailable("writer has shut down".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::Unavailable("writer dropped response".to_string()))?
    }

    /// True once the writer thread has stopped receiving.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Asks the writer thread to stop after the requests already queued.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(WriteRequest::Shutdown).await;
    }
}

// =============================================================================
// Writer Loop
// =============================================================================

/// Serves write requests until `Shutdown` arrives or every sender is gone.
///
/// Runs on the dedicated writer thread and blocks it between requests.
pub fn run_writer(mut writer: EntryWriter, mut rx: mpsc::Receiver<WriteRequest>) {
    while let Some(request) = rx.blocking_recv() {
        match request {
            WriteRequest::Append {
                request,
                context,
                observed_at,
                deadline,
                response,
            } => {
                if response.is_closed() {
                    warn!("caller stopped waiting before append started");
                    continue;
                }
                let result = writer.append(&request, &context, observed_at, || commit_guard(&deadline, &response));
                let _ = response.send(result);
            }
            WriteRequest::AppendBatch {
                items,
                context,
                now,
                deadline,
                response,
            } => {
                if response.is_closed() {
                    warn!(items = items.len(), "caller stopped waiting before batch started");
                    continue;
                }
                let result = writer.append_batch(&items, &context, now, || commit_guard(&deadline, &response));
                let _ = response.send(result);
            }
            WriteRequest::Shutdown => break,
        }
    }
    info!("writer stopped");
}

/// Spawns the writer on a dedicated thread.
///
/// Returns the handle for submitting requests and the thread's join handle.
pub fn spawn_writer(conn: Connection, channel_size: usize) -> Result<(WriterHandle, JoinHandle<()>)> {
    let (tx, rx) = mpsc::channel(channel_size);
    let writer = EntryWriter::new(conn);

    let join = thread::Builder::new()
        .name("chronicles-writer".to_string())
        .spawn(move || run_writer(writer, rx))
        .map_err(|e| Error::Unavailable(format!("failed to spawn writer thread: {e}")))?;

    Ok((WriterHandle { tx }, join))
}

// =============================================================================
// Tests
// =============================================================================
