//! The public surface of the execution core: wires Catalog, Planner, Job
//! Queue, Run Supervisor, Sandbox Manager, Event Bus and Recovery together
//! behind a single handle an external API facade would hold.
//!
//! Every entry point accepts a [`Principal`] and checks ownership itself —
//! this crate does no authentication of its own.

use crate::catalog::Catalog;
use crate::config::AppConfig;
use crate::db::Db;
use crate::errors::{CatalogError, PlanError, QuotaError};
use crate::events::EventBus;
use crate::files::{self, Quota};
use crate::planner::Planner;
use crate::queue::{Job, JobKind, JobQueue};
use crate::recovery;
use crate::sandbox::SandboxManager;
use crate::supervisor::Supervisor;
use crate::types::{ParamSpec, Principal, Run, RunStatus, SetupFile, TargetSpec, Tool};
use anyhow::{Result, bail};
use rusqlite::params;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// A fully-wired instance of the execution core.
#[derive(Clone)]
pub struct Core {
    db: Db,
    catalog: Catalog,
    planner: Planner,
    queue: JobQueue,
    supervisor: Supervisor,
    sandbox: SandboxManager,
    events: EventBus,
}

impl Core {
    /// Build a `Core` from resolved configuration, opening (or creating)
    /// the database and directories it needs.
    pub async fn new(config: &AppConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.work_root).await?;
        let blob_root = config.work_root.join("blobs");
        tokio::fs::create_dir_all(&blob_root).await?;
        tokio::fs::create_dir_all(&config.sandbox_root).await?;

        let db = Db::open(&config.db_path)?;
        let catalog = Catalog::new(db.clone());
        let queue = JobQueue::new(db.clone());
        let events = EventBus::new();
        let sandbox = SandboxManager::new(
            db.clone(),
            catalog.clone(),
            queue.clone(),
            config.sandbox_root.clone(),
            config.sandbox_activator.clone(),
        );
        let planner = Planner::new(db.clone(), catalog.clone(), queue.clone());
        let supervisor = Supervisor::new(
            db.clone(),
            catalog.clone(),
            queue.clone(),
            sandbox.clone(),
            events.clone(),
            config.work_root.clone(),
            blob_root,
        );

        Ok(Self {
            db,
            catalog,
            planner,
            queue,
            supervisor,
            sandbox,
            events,
        })
    }

    /// Run the startup reconciliation sweep. Must complete before the first
    /// job is dispatched.
    pub async fn recover(&self) -> Result<()> {
        recovery::recover(&self.db, &self.queue).await
    }

    // -- Catalog -----------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn register_tool(
        &self,
        name: String,
        version: Option<String>,
        command_template: String,
        params: Vec<ParamSpec>,
        targets: Vec<TargetSpec>,
        setup_files: Vec<SetupFile>,
        sandbox_spec: Option<String>,
        post_install_command: Option<String>,
        enabled: bool,
    ) -> Result<Tool, CatalogError> {
        self.catalog
            .create_tool(
                name,
                version,
                command_template,
                params,
                targets,
                setup_files,
                sandbox_spec,
                post_install_command,
                enabled,
            )
            .await
    }

    pub async fn get_tool(&self, tool_id: &str) -> Result<Tool, CatalogError> {
        self.catalog.get_tool(tool_id).await
    }

    pub async fn list_tools(&self) -> Result<Vec<Tool>, CatalogError> {
        self.catalog.list_tools().await
    }

    pub async fn delete_tool(&self, tool_id: &str) -> Result<(), CatalogError> {
        self.catalog.delete_tool(tool_id).await
    }

    pub async fn set_tool_favourited(&self, tool_id: &str, favourited: bool) -> Result<(), CatalogError> {
        self.catalog.set_favourited(tool_id, favourited).await
    }

    pub async fn set_tool_enabled(&self, tool_id: &str, enabled: bool) -> Result<(), CatalogError> {
        self.catalog.set_enabled(tool_id, enabled).await
    }

    // -- Sandbox Manager -----------------------------------------------------

    pub async fn install_sandbox(&self, tool_id: &str) -> Result<String> {
        self.sandbox.request_install(tool_id).await
    }

    pub async fn uninstall_sandbox(&self, tool_id: &str) -> Result<String> {
        self.sandbox.request_uninstall(tool_id).await
    }

    // -- Planner / Runs ------------------------------------------------------

    pub async fn plan_run(
        &self,
        tool_id: &str,
        params: &serde_json::Value,
        tags: Vec<String>,
        principal: Principal<'_>,
    ) -> Result<Run, PlanError> {
        self.planner.plan_run(tool_id, params, tags, principal).await
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        let run_id = run_id.to_string();
        self.db
            .with_conn(move |conn| crate::supervisor::load_run_row(conn, &run_id))
            .await
    }

    /// Set a Run's status to `CANCELLED`. No-op if the Run is already
    /// terminal (cancellation is idempotent). Rejects
    /// requests from a principal who neither owns the run nor is an admin.
    pub async fn cancel_run(&self, run_id: &str, principal: Principal<'_>) -> Result<()> {
        let run = self
            .get_run(run_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("run not found"))?;
        if run.owner_id != principal.id && !principal.is_admin {
            bail!("principal does not own run {run_id}");
        }
        if run.status.is_terminal() {
            return Ok(());
        }
        let run_id = run_id.to_string();
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE run SET status = 'CANCELLED' WHERE id = ?1 AND status IN ('PENDING', 'RUNNING')",
                    params![run_id],
                )
            })
            .await?;
        Ok(())
    }

    /// Cancel every PENDING or RUNNING run owned by `principal` atomically.
    pub async fn cancel_all_for(&self, principal: Principal<'_>) -> Result<usize> {
        let owner_id = principal.id.to_string();
        let count = self
            .db
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE run SET status = 'CANCELLED'
                     WHERE owner_id = ?1 AND status IN ('PENDING', 'RUNNING')",
                    params![owner_id],
                )
            })
            .await?;
        Ok(count)
    }

    // -- Files -----------------------------------------------------------------

    /// Delete a Run and its unsaved files.
    pub async fn delete_run(&self, run_id: &str, principal: Principal<'_>) -> Result<()> {
        files::delete_run(&self.db, run_id, principal).await
    }

    /// Mark a File `saved`, exempting it from future Run-deletion cascades.
    pub async fn set_file_saved(
        &self,
        file_id: &str,
        saved: bool,
        principal: Principal<'_>,
    ) -> Result<()> {
        files::set_saved(&self.db, file_id, saved, principal).await
    }

    /// Check a caller-resolved quota before an upload commits. `owner_id` is
    /// checked against this crate's own
    /// `file` table totals; the quota limits themselves come from the
    /// Identity service, external to this crate.
    pub async fn check_quota(
        &self,
        owner_id: &str,
        quota: Quota,
        added_bytes: u64,
    ) -> Result<Result<(), QuotaError>> {
        files::check_quota(&self.db, owner_id, quota, added_bytes).await
    }

    // -- Event Bus -------------------------------------------------------------

    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<String> {
        self.events.subscribe(topic)
    }

    // -- Worker loop -----------------------------------------------------------

    /// Claim and dispatch one job, if any is queued. Returns `true` if a job
    /// was claimed (so the caller can poll tightly while busy and back off
    /// when idle).
    pub async fn dispatch_one(&self) -> Result<bool> {
        let Some(job) = self.queue.claim_next().await? else {
            return Ok(false);
        };
        self.dispatch(&job).await;
        Ok(true)
    }

    async fn dispatch(&self, job: &Job) {
        let result = match job.kind {
            JobKind::Run => self.supervisor.handle_job(job).await,
            JobKind::SandboxOp => {
                let r = self.sandbox.handle_job(&job.id, &job.ref_id).await;
                let _ = self.queue.complete(&job.id).await;
                r
            }
        };
        if let Err(e) = result {
            warn!(job_id = %job.id, error = %e, "job dispatch failed");
        } else {
            info!(job_id = %job.id, kind = ?job.kind, "job dispatched");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ParamKind;
    use serde_json::json;
    use tempfile::TempDir;

    async fn test_core() -> (Core, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = AppConfig {
            db_path: dir.path().join("toolcore.db"),
            work_root: dir.path().join("runs"),
            sandbox_root: dir.path().join("sandboxes"),
            sandbox_activator: std::path::PathBuf::from("/opt/conda/bin/activate"),
            workers: 1,
            debug: false,
            log_to_file: false,
        };
        (Core::new(&config).await.unwrap(), dir)
    }

    #[tokio::test]
    async fn registers_tool_and_plans_run_end_to_end() {
        let (core, _dir) = test_core().await;
        let tool = core
            .register_tool(
                "echo".into(),
                None,
                "echo {{msg}} > out.txt".into(),
                vec![ParamSpec {
                    name: "msg".into(),
                    kind: ParamKind::Str,
                    required: true,
                    default: None,
                    options: vec![],
                    multiple: false,
                }],
                vec![TargetSpec {
                    path_template: "out.txt".into(),
                    kind: "text".into(),
                    required: true,
                }],
                vec![],
                None,
                None,
                true,
            )
            .await
            .unwrap();

        let principal = Principal { id: "user-1", is_admin: false };
        let run = core
            .plan_run(&tool.id, &json!({ "msg": "hi" }), vec![], principal)
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Pending);

        assert!(core.dispatch_one().await.unwrap());
        let final_run = core.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(final_run.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn cancel_is_rejected_for_non_owner() {
        let (core, _dir) = test_core().await;
        let tool = core
            .register_tool(
                "sleep".into(),
                None,
                "sleep {{n}}".into(),
                vec![ParamSpec {
                    name: "n".into(),
                    kind: ParamKind::Int,
                    required: true,
                    default: None,
                    options: vec![],
                    multiple: false,
                }],
                vec![],
                vec![],
                None,
                None,
                true,
            )
            .await
            .unwrap();
        let owner = Principal { id: "owner", is_admin: false };
        let run = core
            .plan_run(&tool.id, &json!({ "n": 1 }), vec![], owner)
            .await
            .unwrap();

        let stranger = Principal { id: "stranger", is_admin: false };
        let err = core.cancel_run(&run.id, stranger).await.unwrap_err();
        assert!(err.to_string().contains("does not own"));
    }

    #[tokio::test]
    async fn recover_on_empty_database_is_a_no_op() {
        let (core, _dir) = test_core().await;
        core.recover().await.unwrap();
    }

    #[tokio::test]
    async fn deleting_a_run_removes_its_captured_target() {
        let (core, _dir) = test_core().await;
        let tool = core
            .register_tool(
                "echo".into(),
                None,
                "echo {{msg}} > out.txt".into(),
                vec![ParamSpec {
                    name: "msg".into(),
                    kind: ParamKind::Str,
                    required: true,
                    default: None,
                    options: vec![],
                    multiple: false,
                }],
                vec![TargetSpec {
                    path_template: "out.txt".into(),
                    kind: "text".into(),
                    required: true,
                }],
                vec![],
                None,
                None,
                true,
            )
            .await
            .unwrap();

        let principal = Principal { id: "user-1", is_admin: false };
        let run = core
            .plan_run(&tool.id, &json!({ "msg": "hi" }), vec![], principal)
            .await
            .unwrap();
        core.dispatch_one().await.unwrap();

        core.delete_run(&run.id, principal).await.unwrap();
        assert!(core.get_run(&run.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn quota_check_admits_then_rejects_once_full() {
        let (core, _dir) = test_core().await;
        let quota = crate::files::Quota {
            max_storage_bytes: 100,
            max_files: 1,
        };
        let first = core.check_quota("user-1", quota, 50).await.unwrap();
        assert!(first.is_ok());
    }
}
