//! Durable FIFO job queue carrying `RUN` and `SANDBOX_OP` jobs.
//!
//! Backed by the same `rusqlite` database as everything else rather than a
//! separate broker: at-most-one dispatch, FIFO ordering and non-blocking
//! submission all fall out of a plain `job` table for free. Claiming is
//! done inside a `BEGIN IMMEDIATE` transaction rather than relying on
//! `UPDATE ... RETURNING`, since the bundled sqlite version pinned by this
//! crate predates `RETURNING` being consistently available — see
//! DESIGN.md.

use crate::db::Db;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The two kinds of work the queue carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobKind {
    Run,
    SandboxOp,
}

impl JobKind {
    fn as_str(&self) -> &'static str {
        match self {
            JobKind::Run => "RUN",
            JobKind::SandboxOp => "SANDBOX_OP",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "SANDBOX_OP" => JobKind::SandboxOp,
            _ => JobKind::Run,
        }
    }
}

/// A claimed unit of work. `ref_id` is the run id or tool id the job
/// concerns; `command` is only populated for `RUN` jobs (re-enqueue by
/// Recovery reuses the Run's stored `command`, but the Supervisor always
/// re-reads the authoritative row before acting on it).
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub ref_id: String,
    pub command: Option<String>,
}

/// Durable FIFO queue handle.
#[derive(Clone)]
pub struct JobQueue {
    db: Db,
}

impl JobQueue {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Enqueue a job. Never blocks on a consumer — this is a plain insert.
    pub async fn enqueue(
        &self,
        kind: JobKind,
        ref_id: String,
        command: Option<String>,
    ) -> anyhow::Result<String> {
        let job_id = Uuid::new_v4().to_string();
        let kind_str = kind.as_str();
        let now = Utc::now().to_rfc3339();
        let id = job_id.clone();
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO job (id, kind, ref_id, command, status, created_at)
                     VALUES (?1, ?2, ?3, ?4, 'QUEUED', ?5)",
                    params![id, kind_str, ref_id, command, now],
                )
            })
            .await?;
        Ok(job_id)
    }

    /// Atomically claim the oldest still-queued job, if any. Uses
    /// `BEGIN IMMEDIATE` to take the write lock up front, so two workers
    /// racing on the same row can never both see it as `QUEUED`.
    pub async fn claim_next(&self) -> anyhow::Result<Option<Job>> {
        self.db.with_conn(claim_next_tx).await
    }

    /// Mark a job done (success or failure both end the job's queue
    /// lifecycle; retriability is a Run/Tool-level concern, not the
    /// queue's — the queue itself never retries).
    pub async fn complete(&self, job_id: &str) -> anyhow::Result<()> {
        let job_id = job_id.to_string();
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE job SET status = 'DONE' WHERE id = ?1",
                    params![job_id],
                )
            })
            .await?;
        Ok(())
    }
}

fn claim_next_tx(conn: &Connection) -> rusqlite::Result<Option<Job>> {
    conn.execute_batch("BEGIN IMMEDIATE")?;

    let row = conn
        .query_row(
            "SELECT id, kind, ref_id, command FROM job
             WHERE status = 'QUEUED' ORDER BY created_at ASC LIMIT 1",
            [],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            },
        )
        .optional();

    let row = match row {
        Ok(r) => r,
        Err(e) => {
            conn.execute_batch("ROLLBACK")?;
            return Err(e);
        }
    };

    let Some((id, kind, ref_id, command)) = row else {
        conn.execute_batch("COMMIT")?;
        return Ok(None);
    };

    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE job SET status = 'CLAIMED', claimed_at = ?1 WHERE id = ?2",
        params![now, id],
    )?;
    conn.execute_batch("COMMIT")?;

    Ok(Some(Job {
        id,
        kind: JobKind::parse(&kind),
        ref_id,
        command,
    }))
}
