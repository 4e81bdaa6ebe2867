//! Write transactions with bounded retry on contention.

use std::time::Duration;

use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::warn;

use crate::error::{BrainError, Result};

use super::Brain;

/// Upper bound for a single backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_millis(500);

/// Retry budget for write transactions.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    /// Run `f` inside `BEGIN IMMEDIATE`, retrying busy/locked failures with
    /// exponential backoff. The closure may run more than once.
    pub(crate) fn run<T, F>(&self, conn: &mut Connection, mut f: F) -> Result<T>
    where
        F: FnMut(&Transaction<'_>) -> Result<T>,
    {
        let attempts = self.attempts.max(1);
        let mut backoff = self.initial_backoff;

        for attempt in 1..=attempts {
            match run_once(conn, &mut f) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_contention() => {
                    if attempt == attempts {
                        break;
                    }
                    warn!(
                        "Write contended (attempt {}/{}), retrying in {:?}",
                        attempt, attempts, backoff
                    );
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(e) => return Err(e),
            }
        }

        Err(BrainError::Concurrency { attempts })
    }
}

fn run_once<T, F>(conn: &mut Connection, f: &mut F) -> Result<T>
where
    F: FnMut(&Transaction<'_>) -> Result<T>,
{
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}

impl Brain {
    /// Execute a function within an immediate write transaction.
    ///
    /// All operations within the closure are executed atomically; if the
    /// closure returns an error, all changes are rolled back.
    pub(crate) fn write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnMut(&Transaction<'_>) -> Result<T>,
    {
        if self.read_only {
            return Err(BrainError::ReadOnly);
        }
        let mut conn = self.conn.lock();
        self.retry.run(&mut conn, f)
    }
}
