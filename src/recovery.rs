//! Recovery: reconciles durable state with reality once,
//! before the worker pool accepts its first job.
//!
//! A `RUNNING` run implies a worker that no longer exists — its child is not
//! ours to reclaim, so it is marked `CANCELLED` with a diagnostic. A
//! `PENDING` run implies work that was queued but never claimed (or whose
//! job handle was lost); it is simply re-enqueued.

use crate::db::Db;
use crate::queue::{JobKind, JobQueue};
use chrono::Utc;
use rusqlite::params;
use tracing::info;

const RESTART_DIAGNOSTIC: &str = "Run was cancelled due to server restart.";

/// Run the startup reconciliation sweep. Idempotent: running it twice with
/// no intervening activity is a no-op the second time, since by then no run
/// is left `RUNNING` or `PENDING` without a fresh job.
pub async fn recover(db: &Db, queue: &JobQueue) -> anyhow::Result<()> {
    let cancelled = cancel_orphaned_running(db).await?;
    let requeued = requeue_pending(db, queue).await?;
    info!(cancelled, requeued, "recovery sweep complete");
    Ok(())
}

async fn cancel_orphaned_running(db: &Db) -> anyhow::Result<usize> {
    let now = Utc::now().to_rfc3339();
    let count = db
        .with_conn(move |conn| {
            conn.execute(
                "UPDATE run SET
                    status = 'CANCELLED',
                    finished_at = ?1,
                    stdout = stdout || char(10) || char(10) || ?2
                 WHERE status = 'RUNNING'",
                params![now, RESTART_DIAGNOSTIC],
            )
        })
        .await?;
    Ok(count)
}

async fn requeue_pending(db: &Db, queue: &JobQueue) -> anyhow::Result<usize> {
    let pending_ids: Vec<(String, String)> = db
        .with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id, command FROM run WHERE status = 'PENDING'")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect()
        })
        .await?;

    let mut requeued = 0;
    for (run_id, command) in pending_ids {
        let job_id = queue
            .enqueue(JobKind::Run, run_id.clone(), Some(command))
            .await?;
        let run_id_for_update = run_id.clone();
        db.with_conn(move |conn| {
            conn.execute(
                "UPDATE run SET job_handle = ?1 WHERE id = ?2",
                params![job_id, run_id_for_update],
            )
        })
        .await?;
        requeued += 1;
    }
    Ok(requeued)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RunStatus;

    async fn insert_run_with_status(db: &Db, id: &str, status: &str) {
        let id = id.to_string();
        let status = status.to_string();
        db.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO tool (id, name, name_lower, command_template, status, created_at)
                 VALUES ('tool-1', 'noop', 'noop', 'true', 'INSTALLED', '2026-01-01T00:00:00Z')
                 ON CONFLICT(id) DO NOTHING",
                [],
            )?;
            conn.execute(
                "INSERT INTO run (id, tool_id, owner_id, tags, params, input_file_ids, command, status, stdout, created_at)
                 VALUES (?1, 'tool-1', 'user-1', '[]', '{}', '[]', 'true', ?2, '', '2026-01-01T00:00:00Z')",
                params![id, status],
            )
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn running_becomes_cancelled_with_diagnostic() {
        let db = Db::open_in_memory().unwrap();
        let queue = JobQueue::new(db.clone());
        insert_run_with_status(&db, "run-running", "RUNNING").await;

        recover(&db, &queue).await.unwrap();

        let (status, stdout): (String, String) = db
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT status, stdout FROM run WHERE id = 'run-running'",
                    [],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
            })
            .await
            .unwrap();
        assert_eq!(RunStatus::parse(&status), RunStatus::Cancelled);
        assert!(stdout.contains("Run was cancelled due to server restart."));
    }

    #[tokio::test]
    async fn pending_is_requeued_exactly_once() {
        let db = Db::open_in_memory().unwrap();
        let queue = JobQueue::new(db.clone());
        insert_run_with_status(&db, "run-pending", "PENDING").await;

        recover(&db, &queue).await.unwrap();

        let job = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(job.ref_id, "run-pending");
        assert!(queue.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn terminal_runs_are_left_untouched() {
        let db = Db::open_in_memory().unwrap();
        let queue = JobQueue::new(db.clone());
        insert_run_with_status(&db, "run-done", "COMPLETED").await;

        recover(&db, &queue).await.unwrap();

        assert!(queue.claim_next().await.unwrap().is_none());
    }
}
