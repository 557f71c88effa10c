//! SQLite database layer for the Flowgate run state store.
//!
//! Uses rusqlite with WAL mode for concurrent read performance.
//! All database operations are executed via `tokio::task::spawn_blocking`
//! to avoid blocking the async runtime. The connection sits behind a mutex,
//! so every call is serialized and never observes a half-applied write.

use rusqlite::{Connection, Transaction};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::EngineError;

/// Thread-safe handle to the SQLite database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a SQLite database at the given path.
    pub fn open(db_path: &str) -> Result<Self, EngineError> {
        if db_path == ":memory:" {
            return Self::open_in_memory();
        }

        let path = Path::new(db_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(db_path)
            .map_err(|e| EngineError::Database(format!("Failed to open database: {}", e)))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| EngineError::Database(format!("Failed to set pragmas: {}", e)))?;
        // Other processes may hold the write lock while renewing leases.
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(|e| EngineError::Database(format!("Failed to set busy timeout: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;

        tracing::info!("[Database] SQLite database opened at: {}", db_path);
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, EngineError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| EngineError::Database(format!("Failed to open in-memory db: {}", e)))?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| EngineError::Database(format!("Failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;
        Ok(db)
    }

    /// Default on-disk location: `~/.flowgate/flowgate.db`.
    pub fn default_path() -> String {
        dirs::home_dir()
            .map(|home| home.join(".flowgate").join("flowgate.db"))
            .unwrap_or_else(|| Path::new("flowgate.db").to_path_buf())
            .to_string_lossy()
            .to_string()
    }

    /// Execute a closure with access to the database connection.
    /// Automatically handles locking and error conversion.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| EngineError::Database(format!("Lock poisoned: {}", e)))?;
        f(&conn).map_err(|e| EngineError::Database(e.to_string()))
    }

    /// Execute a closure with access to the database connection (async-friendly).
    pub async fn with_conn_async<F, T>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.with_conn(f))
            .await
            .map_err(|e| EngineError::Database(format!("Task join error: {}", e)))?
    }

    /// Run a closure inside a single transaction. The transaction commits
    /// only when the closure returns `Ok`.
    pub async fn with_tx_async<F, T>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, rusqlite::Error> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = db
                .conn
                .lock()
                .map_err(|e| EngineError::Database(format!("Lock poisoned: {}", e)))?;
            let tx = conn
                .transaction()
                .map_err(|e| EngineError::Database(e.to_string()))?;
            let value = f(&tx).map_err(|e| EngineError::Database(e.to_string()))?;
            tx.commit()
                .map_err(|e| EngineError::Database(e.to_string()))?;
            Ok(value)
        })
        .await
        .map_err(|e| EngineError::Database(format!("Task join error: {}", e)))?
    }

    /// Create all tables if they don't exist.
    fn initialize_tables(&self) -> Result<(), EngineError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS workflow_definitions (
                    id              TEXT PRIMARY KEY,
                    source          TEXT NOT NULL,
                    updated_at      INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS workflow_runs (
                    id              TEXT PRIMARY KEY,
                    definition_id   TEXT NOT NULL,
                    definition_source TEXT NOT NULL DEFAULT '',
                    task            TEXT NOT NULL,
                    status          TEXT NOT NULL DEFAULT 'pending',
                    context         TEXT NOT NULL DEFAULT '{}',
                    loop_counts     TEXT NOT NULL DEFAULT '{}',
                    agent_overrides TEXT NOT NULL DEFAULT '{}',
                    current_step    TEXT,
                    last_error      TEXT,
                    stop_requested  INTEGER NOT NULL DEFAULT 0,
                    archived        INTEGER NOT NULL DEFAULT 0,
                    lease_owner     TEXT,
                    lease_expires_at INTEGER,
                    created_at      INTEGER NOT NULL,
                    updated_at      INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_workflow_runs_definition ON workflow_runs(definition_id);
                CREATE INDEX IF NOT EXISTS idx_workflow_runs_archived ON workflow_runs(archived, created_at);

                CREATE TABLE IF NOT EXISTS step_results (
                    run_id          TEXT NOT NULL REFERENCES workflow_runs(id) ON DELETE CASCADE,
                    step_id         TEXT NOT NULL,
                    status          TEXT NOT NULL DEFAULT 'pending',
                    attempt         INTEGER NOT NULL DEFAULT 1,
                    input           TEXT NOT NULL DEFAULT '',
                    output          TEXT NOT NULL DEFAULT '',
                    error           TEXT,
                    metadata        TEXT NOT NULL DEFAULT '{}',
                    started_at      INTEGER,
                    ended_at        INTEGER,
                    PRIMARY KEY (run_id, step_id)
                );

                CREATE TABLE IF NOT EXISTS feedback_history (
                    id              INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id          TEXT NOT NULL REFERENCES workflow_runs(id) ON DELETE CASCADE,
                    step_id         TEXT NOT NULL,
                    loop_number     INTEGER NOT NULL,
                    action          TEXT NOT NULL,
                    feedback        TEXT NOT NULL DEFAULT '',
                    created_at      INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_feedback_history_run ON feedback_history(run_id, id);
                ",
            )?;

            // Columns added after the first schema; ALTER fails once they exist.
            let _ = conn.execute(
                "ALTER TABLE workflow_runs ADD COLUMN definition_source TEXT NOT NULL DEFAULT ''",
                [],
            );
            let _ = conn.execute("ALTER TABLE workflow_runs ADD COLUMN lease_owner TEXT", []);
            let _ = conn.execute(
                "ALTER TABLE workflow_runs ADD COLUMN lease_expires_at INTEGER",
                [],
            );
            Ok(())
        })
    }
}
