//! Binding to the relational engine: connection pool and the transactional
//! seam every store operation goes through.
//!
//! SQLite's single-writer locking makes every transaction serializable;
//! write transactions open with `BEGIN IMMEDIATE` so the write lock is
//! taken up front and lock upgrades cannot deadlock. Lock contention
//! surfaces as `SQLITE_BUSY` / `SQLITE_LOCKED`, the engine's analogue of a
//! serialization failure, and is retried with bounded attempts and
//! jittered exponential backoff. The closure is re-run from scratch on
//! every attempt, so all transaction-scoped state must live inside it.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use r2d2_sqlite::SqliteConnectionManager;
use rand::Rng;
use rusqlite::{Transaction, TransactionBehavior};

use crate::errors::{Result, StoreError};

/// Connection pool type accepted by `Store::with_pool`.
pub type Pool = r2d2::Pool<SqliteConnectionManager>;

const MAX_ATTEMPTS: u32 = 5;
const BASE_BACKOFF: Duration = Duration::from_millis(10);

/// Cooperative cancellation flag shared between a caller and in-flight
/// operations. Once cancelled, the next transaction boundary aborts with
/// [`StoreError::Cancelled`] and the database rolls the attempt back.
#[derive(Clone, Default, Debug)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub(crate) struct Db {
    pool: Pool,
    cancel: Option<CancelToken>,
}

impl Db {
    pub(crate) fn new(pool: Pool, cancel: Option<CancelToken>) -> Self {
        Db { pool, cancel }
    }

    /// Builds a pool over a database file, applying per-connection pragmas.
    pub(crate) fn open_pool(path: &Path) -> Result<Pool> {
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            // WAL lets readers proceed under a writer; harmless where
            // unsupported (the pragma then reports the current mode).
            conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            // short in-engine wait; longer contention falls through to the
            // jittered retry loop
            conn.busy_timeout(Duration::from_millis(250))?;
            Ok(())
        });
        Ok(r2d2::Pool::builder().build(manager)?)
    }

    /// Runs `body` inside a serializable read-write transaction.
    ///
    /// The transaction either commits as a whole or leaves the database
    /// unchanged. On a busy/locked failure the body is re-run (up to
    /// [`MAX_ATTEMPTS`]) after a jittered backoff.
    pub(crate) fn write<T>(&self, mut body: impl FnMut(&Transaction) -> Result<T>) -> Result<T> {
        self.run(TransactionBehavior::Immediate, &mut body)
    }

    /// Runs `body` inside a read-only transaction, with the same retry
    /// behavior as [`Db::write`].
    pub(crate) fn read<T>(&self, mut body: impl FnMut(&Transaction) -> Result<T>) -> Result<T> {
        self.run(TransactionBehavior::Deferred, &mut body)
    }

    fn run<T>(
        &self,
        behavior: TransactionBehavior,
        body: &mut dyn FnMut(&Transaction) -> Result<T>,
    ) -> Result<T> {
        let mut attempt = 0;
        loop {
            self.check_cancelled()?;

            let result = self.attempt(behavior, body);
            match result {
                Err(ref err) if is_serialization_failure(err) && attempt + 1 < MAX_ATTEMPTS => {
                    let backoff = backoff_with_jitter(attempt);
                    warn!(
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "database busy, retrying transaction"
                    );
                    std::thread::sleep(backoff);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn attempt<T>(
        &self,
        behavior: TransactionBehavior,
        body: &mut dyn FnMut(&Transaction) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.pool.get()?;
        let txn = conn.transaction_with_behavior(behavior)?;
        let out = body(&txn)?;
        // cancellation observed mid-flight aborts before making the
        // transaction's effects durable
        self.check_cancelled()?;
        txn.commit()?;
        Ok(out)
    }

    fn check_cancelled(&self) -> Result<()> {
        match &self.cancel {
            Some(token) if token.is_cancelled() => Err(StoreError::Cancelled),
            _ => Ok(()),
        }
    }
}

/// Whether the error is the engine's serialization-failure analogue.
fn is_serialization_failure(err: &StoreError) -> bool {
    match err {
        StoreError::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
            e.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ),
        _ => false,
    }
}

fn backoff_with_jitter(attempt: u32) -> Duration {
    let base = BASE_BACKOFF * 2u32.pow(attempt);
    base + Duration::from_micros(rand::thread_rng().gen_range(0..base.as_micros() as u64))
}

/// Maps a primary-key violation to `on_conflict`, passing other errors
/// through. Used where a constraint violation carries domain meaning.
pub(crate) fn constraint_to<T>(
    result: rusqlite::Result<T>,
    on_conflict: impl FnOnce() -> StoreError,
) -> Result<T> {
    match result {
        Ok(v) => Ok(v),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(on_conflict())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_token_aborts_before_work() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Db::open_pool(&dir.path().join("db.sqlite")).unwrap();
        let token = CancelToken::new();
        token.cancel();
        let db = Db::new(pool, Some(token));

        let ran = std::cell::Cell::new(false);
        let err = db
            .write(|_| {
                ran.set(true);
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::Cancelled));
        assert!(!ran.get());
    }

    #[test]
    fn write_transaction_rolls_back_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Db::open_pool(&dir.path().join("db.sqlite")).unwrap();
        let db = Db::new(pool, None);

        db.write(|txn| {
            txn.execute_batch("CREATE TABLE t (x INTEGER)")?;
            Ok(())
        })
        .unwrap();

        let err: Result<()> = db.write(|txn| {
            txn.execute("INSERT INTO t (x) VALUES (1)", [])?;
            Err(StoreError::Cancelled)
        });
        assert!(err.is_err());

        let count: i64 = db
            .read(|txn| {
                Ok(txn.query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 0);
    }
}
