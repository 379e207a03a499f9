//! Durable storage for the execution core.
//!
//! `rusqlite` backs every table this crate owns. Every blocking call is
//! wrapped in `tokio::task::spawn_blocking`, the same shape used elsewhere
//! in this crate to keep blocking child-process I/O off the async runtime.

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// A shared, cloneable handle to the single sqlite connection backing the
/// execution core. `rusqlite::Connection` is `!Sync`, so access is
/// serialized behind a `Mutex` and every call site must hop through
/// `spawn_blocking` — the pool-of-one is deliberate: the core's own
/// concurrency comes from multiple async workers, not from parallel DB
/// connections.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("opening database at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        apply_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open a private in-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        apply_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on a blocking-pool thread.
    ///
    /// This is the one seam every component module calls through; it keeps
    /// `rusqlite`'s synchronous API from blocking a tokio worker thread.
    pub async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().expect("db connection mutex poisoned");
            f(&guard).map_err(anyhow::Error::from)
        })
        .await
        .context("database task panicked")?
    }
}

/// Idempotent schema creation. No migration framework yet: the crate is
/// young enough that `CREATE TABLE IF NOT EXISTS` carries the whole
/// history.
fn apply_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS tool (
            id                     TEXT PRIMARY KEY,
            name                   TEXT NOT NULL,
            name_lower             TEXT NOT NULL UNIQUE,
            version                TEXT,
            command_template       TEXT NOT NULL,
            sandbox_spec           TEXT,
            post_install_command   TEXT,
            status                 TEXT NOT NULL DEFAULT 'UNINSTALLED',
            pinned_manifest        TEXT,
            installation_log       TEXT,
            enabled                INTEGER NOT NULL DEFAULT 1,
            run_count              INTEGER NOT NULL DEFAULT 0,
            favourited_count       INTEGER NOT NULL DEFAULT 0,
            created_at             TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS param_spec (
            id          TEXT PRIMARY KEY,
            tool_id     TEXT NOT NULL REFERENCES tool(id) ON DELETE CASCADE,
            position    INTEGER NOT NULL,
            name        TEXT NOT NULL,
            kind        TEXT NOT NULL,
            required    INTEGER NOT NULL,
            default_value TEXT,
            options     TEXT,
            multiple    INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS target_spec (
            id            TEXT PRIMARY KEY,
            tool_id       TEXT NOT NULL REFERENCES tool(id) ON DELETE CASCADE,
            position      INTEGER NOT NULL,
            path_template TEXT NOT NULL,
            kind          TEXT NOT NULL,
            required      INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS setup_file (
            id                TEXT PRIMARY KEY,
            tool_id           TEXT NOT NULL REFERENCES tool(id) ON DELETE CASCADE,
            position          INTEGER NOT NULL,
            name              TEXT NOT NULL,
            content_template  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS run (
            id                TEXT PRIMARY KEY,
            tool_id           TEXT NOT NULL REFERENCES tool(id),
            owner_id          TEXT NOT NULL,
            tags              TEXT NOT NULL DEFAULT '[]',
            params            TEXT NOT NULL,
            input_file_ids    TEXT NOT NULL DEFAULT '[]',
            command           TEXT NOT NULL,
            pinned_manifest   TEXT,
            status            TEXT NOT NULL DEFAULT 'PENDING',
            stdout            TEXT NOT NULL DEFAULT '',
            job_handle         TEXT,
            email_on_completion INTEGER NOT NULL DEFAULT 0,
            shared            INTEGER NOT NULL DEFAULT 0,
            created_at        TEXT NOT NULL,
            started_at        TEXT,
            finished_at       TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_run_status ON run(status);
        CREATE INDEX IF NOT EXISTS idx_run_owner ON run(owner_id);

        CREATE TABLE IF NOT EXISTS file (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL,
            file_type   TEXT NOT NULL,
            size        INTEGER NOT NULL,
            location    TEXT NOT NULL,
            owner_id    TEXT NOT NULL,
            run_id      TEXT REFERENCES run(id),
            saved       INTEGER NOT NULL DEFAULT 0,
            parent_id   TEXT REFERENCES file(id),
            tags        TEXT NOT NULL DEFAULT '[]',
            created_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_file_owner ON file(owner_id);
        CREATE INDEX IF NOT EXISTS idx_file_run ON file(run_id);

        CREATE TABLE IF NOT EXISTS job (
            id          TEXT PRIMARY KEY,
            kind        TEXT NOT NULL,
            ref_id      TEXT NOT NULL,
            command     TEXT,
            status      TEXT NOT NULL DEFAULT 'QUEUED',
            created_at  TEXT NOT NULL,
            claimed_at  TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_job_status_created ON job(status, created_at);

        -- At most one row per tool_id: held by whichever SANDBOX_OP job is
        -- currently installing/uninstalling that tool's sandbox. See
        -- sandbox.rs's begin/end.
        CREATE TABLE IF NOT EXISTS sandbox_op_lock (
            tool_id  TEXT PRIMARY KEY,
            job_id   TEXT NOT NULL
        );
        "#,
    )
}
