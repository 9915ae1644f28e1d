//! # Scoped Transactions
//!
//! Every write runs through [`in_transaction`], which guarantees that a
//! transaction is never left open, whatever way the body exits:
//!
//! ```text
//!            BEGIN IMMEDIATE
//!                  │
//!          ┌───────┴────────┐
//!          │   body(&tx)    │
//!          └───────┬────────┘
//!      ┌───────────┼──────────────┐
//!      ▼           ▼              ▼
//!   Ok(v)       Err(e)         panic
//!   COMMIT      ROLLBACK       ROLLBACK
//!   → Ok(v)     → Err(e)       → Err(TransactionPanicked)
//! ```
//!
//! `rusqlite::Transaction` already rolls back when dropped; the explicit
//! rollback calls here make the outcome visible in logs and keep the writer
//! connection usable after a panic.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::{error, warn};

use crate::error::{Error, Result};

/// Runs `body` inside an immediate transaction and commits if it returns `Ok`.
///
/// # Errors
///
/// - whatever `body` returned, after rolling back
/// - `Error::TransactionPanicked` if `body` panicked, after rolling back
/// - `Error::Sqlite` if `BEGIN` or `COMMIT` failed (a failed commit is rolled
///   back when the transaction is dropped)
pub fn in_transaction<T, F>(conn: &mut Connection, body: F) -> Result<T>
where
    F: FnOnce(&Transaction<'_>) -> Result<T>,
{
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(&tx)));

    match outcome {
        Ok(Ok(value)) => {
            tx.commit()?;
            Ok(value)
        }
        Ok(Err(e)) => {
            if let Err(rollback_err) = tx.rollback() {
                warn!(error = %rollback_err, cause = %e, "rollback failed after error");
            }
            Err(e)
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            if let Err(rollback_err) = tx.rollback() {
                error!(error = %rollback_err, panic = %message, "rollback failed after panic");
            }
            Err(Error::TransactionPanicked(message))
        }
    }
}

/// Extracts the message from a panic payload.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// =============================================================================
// Tests
// =============================================================================
