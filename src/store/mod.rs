//! Durable state backed by SQLite.
//!
//! One connection serves the whole process, guarded by an async mutex. The
//! job store, trigger store, tenant record source and fire log all share it.
//! `in_transaction` is the scheduling hand-off primitive: hooks registered
//! inside the closure run only after the transaction commits, and every
//! write issued outside a closure commits independently of its caller.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::Mutex;

use crate::types::JobId;

mod jobs;
mod records;
mod triggers;

pub use jobs::{JobStore, StatusCounts};
pub use records::{MemoryTenantRecords, SqliteTenantRecords, TenantRecordSource};
pub use triggers::TriggerStore;

/// Errors produced by the durable stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("job not found: {0}")]
    NotFound(JobId),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Sqlite(e.to_string())
    }
}

type CommitHook = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Hooks registered inside a transaction, invoked iff it commits.
#[derive(Default)]
pub struct TxHooks {
    hooks: Vec<CommitHook>,
}

impl TxHooks {
    /// Run `hook` after a successful commit. Skipped entirely on rollback.
    /// Hooks are infallible futures; anything that can go wrong inside one
    /// must be absorbed into durable job state, never propagated.
    pub fn after_commit<F>(&mut self, hook: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.hooks.push(Box::pin(hook));
    }

    fn take(&mut self) -> Vec<CommitHook> {
        std::mem::take(&mut self.hooks)
    }
}

/// Shared SQLite handle.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Arc<Self>, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Sqlite(format!("create dir: {e}")))?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Self::init_schema(&conn)?;
        Ok(Arc::new(Self {
            conn: Mutex::new(conn),
        }))
    }

    /// Open an in-memory database (useful for tests).
    pub fn open_in_memory() -> Result<Arc<Self>, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Self::init_schema(&conn)?;
        Ok(Arc::new(Self {
            conn: Mutex::new(conn),
        }))
    }

    /// Default database path: `$XDG_DATA_HOME/dispatchd/jobs.db`.
    pub fn default_path() -> std::path::PathBuf {
        let base = dirs::data_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
        base.join("dispatchd").join("jobs.db")
    }

    fn init_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            );

            INSERT OR IGNORE INTO schema_version (version) VALUES (1);

            CREATE TABLE IF NOT EXISTS jobs (
                id              TEXT PRIMARY KEY,
                client_id       TEXT NOT NULL,
                schedule_type   TEXT NOT NULL,
                cron_expression TEXT,
                time_zone       TEXT NOT NULL DEFAULT 'UTC',
                start_time      TEXT,
                next_fire_time  TEXT,
                status          TEXT NOT NULL,
                run_count       INTEGER NOT NULL DEFAULT 0,
                failure_count   INTEGER NOT NULL DEFAULT 0,
                last_error      TEXT,
                created_at      TEXT NOT NULL,
                updated_at      TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_client_id ON jobs(client_id);
            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);

            CREATE TABLE IF NOT EXISTS triggers (
                job_id          TEXT PRIMARY KEY,
                next_fire_at    TEXT NOT NULL,
                cron_expression TEXT,
                time_zone       TEXT NOT NULL,
                paused          INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (job_id) REFERENCES jobs(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_triggers_next_fire ON triggers(next_fire_at);

            CREATE TABLE IF NOT EXISTS tenant_records (
                id        TEXT PRIMARY KEY,
                client_id TEXT NOT NULL,
                payload   TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tenant_records_client ON tenant_records(client_id);

            CREATE TABLE IF NOT EXISTS fire_log (
                fire_id           TEXT PRIMARY KEY,
                job_id            TEXT NOT NULL,
                scheduled_for     TEXT NOT NULL,
                started_at        TEXT NOT NULL,
                completed_at      TEXT,
                outcome           TEXT NOT NULL,
                error             TEXT,
                records_published INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (job_id) REFERENCES jobs(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_fire_log_job_id ON fire_log(job_id);
            CREATE INDEX IF NOT EXISTS idx_fire_log_started ON fire_log(started_at);",
        )?;
        Ok(())
    }

    /// Run `f` against the connection. Single statements issued here commit
    /// on their own, independent of any caller's transaction.
    pub(crate) async fn with<T: Send>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError> + Send,
    ) -> Result<T, StoreError> {
        let conn = self.conn.lock().await;
        f(&conn)
    }

    /// Run `f` inside a transaction. On success the transaction commits and
    /// every hook registered via [`TxHooks::after_commit`] is awaited (with
    /// the connection lock released, so hooks may touch the store). On error
    /// the transaction rolls back and hooks are dropped unrun.
    pub async fn in_transaction<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send,
        F: FnOnce(&rusqlite::Transaction<'_>, &mut TxHooks) -> Result<T, StoreError> + Send,
    {
        let mut hooks = TxHooks::default();
        let out = {
            let mut conn = self.conn.lock().await;
            let tx = conn.transaction()?;
            let out = f(&tx, &mut hooks)?;
            tx.commit()?;
            out
        };
        for hook in hooks.take() {
            hook.await;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn schema_initializes_idempotently() {
        let db = Database::open_in_memory().unwrap();
        // Re-running the batch must not fail.
        db.with(|conn| Database::init_schema(conn)).await.unwrap();
    }

    #[tokio::test]
    async fn commit_hook_runs_after_commit() {
        let db = Database::open_in_memory().unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        db.in_transaction(move |tx, hooks| {
            tx.execute(
                "INSERT INTO tenant_records (id, client_id, payload) VALUES ('r1', 'c1', '{}')",
                [],
            )?;
            hooks.after_commit(async move {
                flag.store(true, Ordering::SeqCst);
            });
            Ok(())
        })
        .await
        .unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn rollback_skips_hooks_and_writes() {
        let db = Database::open_in_memory().unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let result: Result<(), StoreError> = db
            .in_transaction(move |tx, hooks| {
                tx.execute(
                    "INSERT INTO tenant_records (id, client_id, payload) VALUES ('r1', 'c1', '{}')",
                    [],
                )?;
                hooks.after_commit(async move {
                    flag.store(true, Ordering::SeqCst);
                });
                Err(StoreError::Serialization("boom".to_string()))
            })
            .await;
        assert!(result.is_err());
        assert!(!ran.load(Ordering::SeqCst));

        let count: i64 = db
            .with(|conn| {
                conn.query_row("SELECT COUNT(*) FROM tenant_records", [], |row| row.get(0))
                    .map_err(Into::into)
            })
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn hooks_can_reopen_the_store() {
        let db = Database::open_in_memory().unwrap();
        let db_for_hook = db.clone();
        db.in_transaction(move |tx, hooks| {
            tx.execute(
                "INSERT INTO tenant_records (id, client_id, payload) VALUES ('r1', 'c1', '{}')",
                [],
            )?;
            hooks.after_commit(async move {
                // Would deadlock if the connection lock were still held.
                db_for_hook
                    .with(|conn| {
                        conn.execute(
                            "INSERT INTO tenant_records (id, client_id, payload) \
                             VALUES ('r2', 'c1', '{}')",
                            [],
                        )
                        .map_err(Into::into)
                        .map(|_| ())
                    })
                    .await
                    .unwrap();
            });
            Ok(())
        })
        .await
        .unwrap();

        let count: i64 = db
            .with(|conn| {
                conn.query_row("SELECT COUNT(*) FROM tenant_records", [], |row| row.get(0))
                    .map_err(Into::into)
            })
            .await
            .unwrap();
        assert_eq!(count, 2);
    }
}
