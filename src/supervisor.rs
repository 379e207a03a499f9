//! Run Supervisor — the heart of the system. One worker owns one Run
//! end-to-end: prepares its working directory, launches the child process
//! group, streams output, honours cancellation, captures declared targets,
//! and finalises the terminal state.
//!
//! Every child is launched into its own session/process group
//! (`setsid()` in a `pre_exec` hook) so cancellation can terminate the whole
//! group with `libc::killpg` rather than just the immediate child, catching
//! any descendants it spawned. Each Run gets one long-lived child supervised
//! for its full lifetime rather than a pool of reusable shells, because a
//! Run's child must be individually and durably cancellable.

use crate::catalog::Catalog;
use crate::db::Db;
use crate::errors::SupervisorError;
use crate::events::EventBus;
use crate::files::insert_owned_file;
use crate::path_security::validate_path;
use crate::queue::{Job, JobQueue};
use crate::sandbox::SandboxManager;
use crate::template::{RenderContext, RenderValue, render};
use crate::types::{File, Run, RunStatus};
use chrono::Utc;
use rusqlite::{OptionalExtension, params};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{info, warn};

const CANCELLATION_POLL_INTERVAL: Duration = Duration::from_secs(1);
const CANCELLATION_GRACE_PERIOD: Duration = Duration::from_secs(3);

/// Owns the full lifecycle of Run execution.
#[derive(Clone)]
pub struct Supervisor {
    db: Db,
    catalog: Catalog,
    queue: JobQueue,
    sandbox: SandboxManager,
    events: EventBus,
    work_root: PathBuf,
    blob_root: PathBuf,
}

impl Supervisor {
    pub fn new(
        db: Db,
        catalog: Catalog,
        queue: JobQueue,
        sandbox: SandboxManager,
        events: EventBus,
        work_root: PathBuf,
        blob_root: PathBuf,
    ) -> Self {
        Self {
            db,
            catalog,
            queue,
            sandbox,
            events,
            work_root,
            blob_root,
        }
    }

    /// Handle one claimed `RUN` job end to end. Never panics on a Run-level
    /// failure: every error path below ends in a terminal `Run` status
    /// rather than propagating, preferring a crisp terminal state over
    /// partial progress.
    pub async fn handle_job(&self, job: &Job) -> anyhow::Result<()> {
        let run_id = job.ref_id.clone();
        self.run(&run_id).await;
        self.queue.complete(&job.id).await
    }

    async fn run(&self, run_id: &str) {
        // Step 1: claim.
        let Some(mut run) = self.load_run(run_id).await else {
            warn!(run_id, "run vanished before claim");
            return;
        };
        if run.status != RunStatus::Pending {
            return;
        }

        let tool = match self.catalog.get_tool(&run.tool_id).await {
            Ok(t) => t,
            Err(e) => {
                self.fail(&mut run, &format!("tool lookup failed: {e}")).await;
                return;
            }
        };

        run.status = RunStatus::Running;
        run.started_at = Some(Utc::now());
        if run.pinned_manifest.is_none() {
            run.pinned_manifest = tool.pinned_manifest.clone();
        }
        if let Err(e) = self.persist_claim(&run).await {
            warn!(run_id, error = %e, "failed to persist claim");
            return;
        }
        self.events.publish_status(run_id, RunStatus::Running.as_str());

        // Step 2: sandbox check.
        if tool.sandbox_spec.is_some()
            && tool.status != crate::types::SandboxStatus::Installed
        {
            self.fail(&mut run, "tool environment not available").await;
            return;
        }

        // Step 3: working directory.
        let work_dir = self.work_root.join(run_id);
        if let Err(e) = tokio::fs::create_dir(&work_dir).await {
            self.fail(&mut run, &format!("working directory already exists or could not be created: {e}"))
                .await;
            return;
        }

        let outcome = self.run_in_workdir(&mut run, &tool, &work_dir).await;

        // Step 12: always remove the working directory, regardless of exit path.
        if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
            warn!(run_id, error = %e, "failed to remove working directory");
        }

        if let Err(e) = outcome {
            warn!(run_id, error = %e, "run ended with a supervision error");
        }
    }

    /// Steps 4-11: everything that happens inside the working directory.
    async fn run_in_workdir(
        &self,
        run: &mut Run,
        tool: &crate::types::Tool,
        work_dir: &Path,
    ) -> Result<(), SupervisorError> {
        // Step 4: stage inputs.
        if let Err(e) = self.stage_inputs(run, work_dir).await {
            self.fail(run, &e.to_string()).await;
            return Err(e);
        }

        // Step 5: render and write setup files.
        if let Err(e) = self.write_setup_files(run, tool, work_dir).await {
            self.fail(run, &e.to_string()).await;
            return Err(e);
        }

        // Step 6: compose the final command.
        let mut composite = String::new();
        if tool.sandbox_spec.is_some() {
            composite.push_str(&self.sandbox.activation_fragment(&tool.id));
            composite.push_str(" && ");
        }
        composite.push_str("set -euo pipefail; ");
        composite.push_str(&run.command);

        // Step 7: spawn in a new process group/session.
        let mut child = match spawn_composite(&composite, work_dir) {
            Ok(c) => c,
            Err(e) => {
                self.fail(run, &format!("failed to spawn child process: {e}")).await;
                return Err(SupervisorError::Spawn(e));
            }
        };
        let pid = child.id();
        info!(run_id = %run.id, pid, "run child spawned");

        // Steps 8-9: supervise, stream, poll for cancellation, wait.
        let exit_status = self.supervise(run, &mut child).await?;

        // Step 10: classify.
        if exit_status.was_cancelled {
            self.transition(run, RunStatus::Cancelled, None).await;
            return Ok(());
        }
        if !exit_status.success {
            self.transition(
                run,
                RunStatus::Failed,
                Some(format!("child exited with status {:?}", exit_status.code)),
            )
            .await;
            return Ok(());
        }

        // Step 11: capture targets.
        let mut missing = Vec::new();
        for target in &tool.targets {
            if let Err(name) = self.capture_target(run, target, work_dir).await {
                if target.required {
                    missing.push(name);
                }
            }
        }

        if !missing.is_empty() {
            let diagnostic = missing
                .iter()
                .map(|m| format!("Target file '{m}' does not exist!"))
                .collect::<Vec<_>>()
                .join("\n");
            self.transition(run, RunStatus::Failed, Some(diagnostic)).await;
        } else {
            self.transition(run, RunStatus::Completed, None).await;
        }
        Ok(())
    }

    async fn stage_inputs(&self, run: &Run, work_dir: &Path) -> Result<(), SupervisorError> {
        for file_id in &run.input_file_ids {
            let file_id = file_id.clone();
            let row: Option<(String, String)> = self
                .db
                .with_conn(move |conn| {
                    conn.query_row(
                        "SELECT name, location FROM file WHERE id = ?1",
                        params![file_id],
                        |r| Ok((r.get(0)?, r.get(1)?)),
                    )
                    .optional()
                })
                .await
                .map_err(|_| SupervisorError::Staging {
                    name: "<unknown>".into(),
                    source: std::io::Error::other("file lookup failed"),
                })?;
            let Some((name, location)) = row else {
                continue;
            };
            let link_path = work_dir.join(&name);
            validate_path(&link_path, work_dir)
                .await
                .map_err(|_| SupervisorError::Staging {
                    name: name.clone(),
                    source: std::io::Error::other("path escapes the run's working directory"),
                })?;
            tokio::fs::symlink(&location, &link_path)
                .await
                .map_err(|source| SupervisorError::Staging { name, source })?;
        }
        Ok(())
    }

    async fn write_setup_files(
        &self,
        run: &Run,
        tool: &crate::types::Tool,
        work_dir: &Path,
    ) -> Result<(), SupervisorError> {
        let ctx = render_context_from_params(&run.params);
        for setup in &tool.setup_files {
            let path = work_dir.join(&setup.name);
            validate_path(&path, work_dir)
                .await
                .map_err(|_| SupervisorError::SetupCollision(setup.name.clone()))?;
            if tokio::fs::symlink_metadata(&path).await.is_ok() {
                return Err(SupervisorError::SetupCollision(setup.name.clone()));
            }
            let content = render(&setup.content_template, &ctx)
                .map_err(|_| SupervisorError::SetupCollision(setup.name.clone()))?;
            tokio::fs::write(&path, content)
                .await
                .map_err(|source| SupervisorError::Staging {
                    name: setup.name.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Three cooperating tasks joined in a single structured scope: log
    /// pump, cancellation poll, wait-for-exit.
    async fn supervise(
        &self,
        run: &Run,
        child: &mut Child,
    ) -> Result<ExitOutcome, SupervisorError> {
        let pid = child.id().ok_or_else(|| {
            SupervisorError::Spawn(std::io::Error::other("child has no pid"))
        })?;
        let stdout = child.stdout.take();

        let log_pump = self.pump_logs(run.id.clone(), stdout);
        let cancel_poll = self.poll_cancellation(run.id.clone(), pid);

        tokio::pin!(log_pump);
        tokio::pin!(cancel_poll);
        let mut log_pump_done = false;

        // `child.wait()` is re-created fresh each loop iteration (cheap: it
        // just parks on the child's exit notification) rather than pinned
        // alongside the other two tasks, since `log_pump`/`cancel_poll` must
        // keep their internal state across iterations but `wait` has none —
        // and pre-pinning it would hold `child` mutably borrowed for the
        // whole loop, conflicting with the explicit `child.wait()` call in
        // the cancellation branch below.
        let mut was_cancelled = false;
        let status = loop {
            tokio::select! {
                _ = &mut log_pump, if !log_pump_done => { log_pump_done = true; }
                cancelled = &mut cancel_poll => {
                    if cancelled {
                        was_cancelled = true;
                        break child.wait().await.map_err(SupervisorError::Io)?;
                    }
                }
                status = child.wait() => {
                    break status.map_err(SupervisorError::Io)?;
                }
            }
        };

        Ok(ExitOutcome {
            success: status.success(),
            was_cancelled,
            code: status.code(),
        })
    }

    async fn pump_logs(&self, run_id: String, stdout: Option<tokio::process::ChildStdout>) {
        let db = self.db.clone();
        let events = self.events.clone();
        if let Some(stdout) = stdout {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                append_stdout_line(&db, &run_id, &line).await;
                events.publish_log(&run_id, &line);
            }
        }
    }

    /// Poll the Run's durable status once per second; on observing
    /// `CANCELLED`, SIGTERM the process group, wait out the grace period,
    /// then SIGKILL. Resolves to whether cancellation was observed.
    async fn poll_cancellation(&self, run_id: String, pid: u32) -> bool {
        loop {
            tokio::time::sleep(CANCELLATION_POLL_INTERVAL).await;
            let status = self.load_status(&run_id).await;
            if status == Some(RunStatus::Cancelled) {
                unsafe {
                    libc::killpg(pid as i32, libc::SIGTERM);
                }
                tokio::time::sleep(CANCELLATION_GRACE_PERIOD).await;
                unsafe {
                    libc::killpg(pid as i32, libc::SIGKILL);
                }
                return true;
            }
        }
    }

    async fn capture_target(
        &self,
        run: &Run,
        target: &crate::types::TargetSpec,
        work_dir: &Path,
    ) -> Result<(), String> {
        let ctx = render_context_from_params(&run.params);
        let rel_path = render(&target.path_template, &ctx).map_err(|_| target.path_template.clone())?;
        let abs_path = work_dir.join(&rel_path);
        // A target path_template may embed a parameter value; make sure the
        // rendered path still resolves inside the working directory before
        // trusting it.
        let abs_path = match validate_path(&abs_path, work_dir).await {
            Ok(p) => p,
            Err(_) => return Err(rel_path),
        };
        if !tokio::fs::try_exists(&abs_path).await.unwrap_or(false) {
            return Err(rel_path);
        }

        let size = tokio::fs::metadata(&abs_path).await.map(|m| m.len()).unwrap_or(0);
        let file_id = File::new_id();
        let blob_path = self.blob_root.join(&file_id);
        if tokio::fs::copy(&abs_path, &blob_path).await.is_err() {
            return Err(rel_path);
        }

        let file = File {
            id: file_id,
            name: rel_path
                .rsplit('/')
                .next()
                .unwrap_or(&rel_path)
                .to_string(),
            file_type: target.kind.clone(),
            size,
            location: blob_path.display().to_string(),
            owner_id: run.owner_id.clone(),
            run_id: Some(run.id.clone()),
            saved: false,
            parent_id: None,
            tags: run.tags.clone(),
            created_at: Utc::now(),
        };
        let _ = insert_owned_file(&self.db, &file).await;
        Ok(())
    }

    async fn load_run(&self, run_id: &str) -> Option<Run> {
        let run_id = run_id.to_string();
        self.db
            .with_conn(move |conn| load_run_row(conn, &run_id))
            .await
            .ok()
            .flatten()
    }

    async fn load_status(&self, run_id: &str) -> Option<RunStatus> {
        let run_id = run_id.to_string();
        self.db
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT status FROM run WHERE id = ?1",
                    params![run_id],
                    |r| r.get::<_, String>(0),
                )
                .optional()
            })
            .await
            .ok()
            .flatten()
            .map(|s| RunStatus::parse(&s))
    }

    async fn persist_claim(&self, run: &Run) -> anyhow::Result<()> {
        let id = run.id.clone();
        let started_at = run.started_at.map(|t| t.to_rfc3339());
        let pinned_manifest = run.pinned_manifest.clone();
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE run SET status = 'RUNNING', started_at = ?1, pinned_manifest = COALESCE(pinned_manifest, ?2) WHERE id = ?3",
                    params![started_at, pinned_manifest, id],
                )
            })
            .await?;
        Ok(())
    }

    async fn fail(&self, run: &mut Run, diagnostic: &str) {
        self.transition(run, RunStatus::Failed, Some(diagnostic.to_string())).await;
    }

    /// Apply a terminal transition: append a diagnostic line to `stdout` if
    /// given, set `finished_at`, persist, then broadcast.
    async fn transition(&self, run: &mut Run, status: RunStatus, diagnostic: Option<String>) {
        run.status = status;
        run.finished_at = Some(Utc::now());
        if let Some(d) = &diagnostic {
            if !run.stdout.is_empty() {
                run.stdout.push('\n');
            }
            run.stdout.push('\n');
            run.stdout.push_str(d);
        }

        let id = run.id.clone();
        let status_str = status.as_str();
        let finished_at = run.finished_at.map(|t| t.to_rfc3339());
        let stdout = run.stdout.clone();
        let _ = self
            .db
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE run SET status = ?1, finished_at = ?2, stdout = ?3 WHERE id = ?4",
                    params![status_str, finished_at, stdout, id],
                )
            })
            .await;

        self.events.publish_status(&run.id, status.as_str());
    }
}

struct ExitOutcome {
    success: bool,
    was_cancelled: bool,
    code: Option<i32>,
}

fn render_context_from_params(params: &serde_json::Value) -> RenderContext {
    let mut ctx = RenderContext::new();
    if let serde_json::Value::Object(map) = params {
        for (k, v) in map {
            let rv = match v {
                serde_json::Value::String(s) => RenderValue::Quoted(s.clone()),
                serde_json::Value::Array(items) => RenderValue::QuotedList(
                    items
                        .iter()
                        .map(|i| i.as_str().unwrap_or_default().to_string())
                        .collect(),
                ),
                other => RenderValue::Raw(other.to_string()),
            };
            ctx.insert(k.clone(), rv);
        }
    }
    ctx
}

/// Spawn `composite` via `/bin/bash -c` in a brand new session (and thus
/// process group). stderr is redirected onto stdout inside the shell (`2>&1`)
/// so the two streams collapse into the single pipe `pump_logs` drains, which
/// is what keeps child-emission order intact and keeps a chatty stderr writer
/// from blocking on a full pipe while nothing is reading it.
fn spawn_composite(composite: &str, work_dir: &Path) -> std::io::Result<Child> {
    let mut command = Command::new("/bin/bash");
    command
        .arg("-c")
        .arg(format!("{composite} 2>&1"))
        .current_dir(work_dir)
        .env_clear()
        .env("PATH", std::env::var("PATH").unwrap_or_default())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());
    #[cfg(unix)]
    unsafe {
        use tokio::process::CommandExt;
        command.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    command.spawn()
}

async fn append_stdout_line(db: &Db, run_id: &str, line: &str) {
    let run_id_owned = run_id.to_string();
    let line_owned = line.to_string();
    if let Err(e) = db
        .with_conn(move |conn| {
            conn.execute(
                "UPDATE run SET stdout = stdout || ?1 || char(10) WHERE id = ?2",
                params![line_owned, run_id_owned],
            )
        })
        .await
    {
        warn!(run_id, error = %e, "failed to persist stdout line for run");
    }
}

pub(crate) fn load_run_row(conn: &rusqlite::Connection, run_id: &str) -> rusqlite::Result<Option<Run>> {
    conn.query_row(
        "SELECT id, tool_id, owner_id, tags, params, input_file_ids, command, pinned_manifest,
                status, stdout, job_handle, email_on_completion, shared, created_at, started_at, finished_at
         FROM run WHERE id = ?1",
        params![run_id],
        |row| {
            let tags: String = row.get(3)?;
            let input_file_ids: String = row.get(5)?;
            let params_str: String = row.get(4)?;
            let created_at: String = row.get(13)?;
            let started_at: Option<String> = row.get(14)?;
            let finished_at: Option<String> = row.get(15)?;
            Ok(Run {
                id: row.get(0)?,
                tool_id: row.get(1)?,
                owner_id: row.get(2)?,
                tags: serde_json::from_str(&tags).unwrap_or_default(),
                params: serde_json::from_str(&params_str).unwrap_or(serde_json::Value::Null),
                input_file_ids: serde_json::from_str(&input_file_ids).unwrap_or_default(),
                command: row.get(6)?,
                pinned_manifest: row.get(7)?,
                status: RunStatus::parse(&row.get::<_, String>(8)?),
                stdout: row.get(9)?,
                job_handle: row.get(10)?,
                email_on_completion: row.get(11)?,
                shared: row.get(12)?,
                created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
                    .map(|d| d.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
                started_at: started_at.and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok().map(|d| d.with_timezone(&Utc))),
                finished_at: finished_at.and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok().map(|d| d.with_timezone(&Utc))),
            })
        },
    )
    .optional()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::Planner;
    use crate::types::{ParamKind, ParamSpec, Principal, TargetSpec};
    use serde_json::json;
    use tempfile::TempDir;

    async fn harness() -> (Supervisor, Catalog, Planner, TempDir, TempDir) {
        let db = Db::open_in_memory().unwrap();
        let catalog = Catalog::new(db.clone());
        let queue = JobQueue::new(db.clone());
        let sandbox = SandboxManager::new(
            db.clone(),
            catalog.clone(),
            queue.clone(),
            PathBuf::from("/opt/sandboxes"),
            PathBuf::from("/opt/conda/bin/activate"),
        );
        let events = EventBus::new();
        let work_root = TempDir::new().unwrap();
        let blob_root = TempDir::new().unwrap();
        let planner = Planner::new(db.clone(), catalog.clone(), queue.clone());
        let supervisor = Supervisor::new(
            db,
            catalog.clone(),
            queue,
            sandbox,
            events,
            work_root.path().to_path_buf(),
            blob_root.path().to_path_buf(),
        );
        (supervisor, catalog, planner, work_root, blob_root)
    }

    #[tokio::test]
    async fn happy_path_echo_completes_and_captures_target() {
        let (supervisor, catalog, planner, _work_root, _blob_root) = harness().await;
        let tool = catalog
            .create_tool(
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
        let run = planner
            .plan_run(&tool.id, &json!({ "msg": "hello world" }), vec![], principal)
            .await
            .unwrap();

        supervisor.run(&run.id).await;

        let final_run = supervisor.load_run(&run.id).await.unwrap();
        assert_eq!(final_run.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn missing_required_target_fails_with_diagnostic() {
        let (supervisor, catalog, planner, _work_root, _blob_root) = harness().await;
        let tool = catalog
            .create_tool(
                "noop".into(),
                None,
                "true".into(),
                vec![],
                vec![TargetSpec {
                    path_template: "missing.out".into(),
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
        let run = planner.plan_run(&tool.id, &json!({}), vec![], principal).await.unwrap();

        supervisor.run(&run.id).await;

        let final_run = supervisor.load_run(&run.id).await.unwrap();
        assert_eq!(final_run.status, RunStatus::Failed);
        assert!(final_run.stdout.contains("Target file 'missing.out' does not exist!"));
    }

    #[tokio::test]
    async fn cancel_mid_flight_is_observed_within_poll_plus_grace() {
        let (supervisor, catalog, planner, _work_root, _blob_root) = harness().await;
        let tool = catalog
            .create_tool(
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
        let principal = Principal { id: "user-1", is_admin: false };
        let run = planner.plan_run(&tool.id, &json!({ "n": 60 }), vec![], principal).await.unwrap();

        let run_id = run.id.clone();
        let db = supervisor.db.clone();
        let cancel_after = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let _ = db
                .with_conn(move |conn| {
                    conn.execute(
                        "UPDATE run SET status = 'CANCELLED' WHERE id = ?1",
                        params![run_id],
                    )
                })
                .await;
        });

        let start = std::time::Instant::now();
        supervisor.run(&run.id).await;
        cancel_after.await.unwrap();

        let final_run = supervisor.load_run(&run.id).await.unwrap();
        assert_eq!(final_run.status, RunStatus::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn staged_input_with_traversal_name_is_rejected() {
        let (supervisor, catalog, planner, work_root, _blob_root) = harness().await;
        let tool = catalog
            .create_tool(
                "cat-file".into(),
                None,
                "cat {{input}}".into(),
                vec![ParamSpec {
                    name: "input".into(),
                    kind: ParamKind::File,
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

        // A file row whose stored name escapes the working directory. Real
        // uploads never produce this (the API facade owns `File.name`), but
        // this crate must not trust it blindly at the boundary.
        let db = supervisor.db.clone();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO file (id, name, file_type, size, location, owner_id, saved, tags, created_at)
                 VALUES ('file-evil', '../escape.txt', 'text', 4, '/tmp/somewhere', 'user-1', 0, '[]', '2026-01-01T00:00:00Z')",
                [],
            )
        })
        .await
        .unwrap();

        let principal = Principal { id: "user-1", is_admin: false };
        let run = planner
            .plan_run(&tool.id, &json!({ "input": "file-evil" }), vec![], principal)
            .await
            .unwrap();

        supervisor.run(&run.id).await;

        let final_run = supervisor.load_run(&run.id).await.unwrap();
        assert_eq!(final_run.status, RunStatus::Failed);
        assert!(!work_root.path().join("escape.txt").exists());
    }

    #[tokio::test]
    async fn child_self_terminating_with_sigterm_is_failed_not_cancelled() {
        let (supervisor, catalog, planner, _work_root, _blob_root) = harness().await;
        let tool = catalog
            .create_tool(
                "self-kill".into(),
                None,
                "kill -TERM $$".into(),
                vec![],
                vec![],
                vec![],
                None,
                None,
                true,
            )
            .await
            .unwrap();
        let principal = Principal { id: "user-1", is_admin: false };
        let run = planner.plan_run(&tool.id, &json!({}), vec![], principal).await.unwrap();

        // Nobody ever writes status=CANCELLED here, so even though the
        // child dies from a SIGTERM it sent itself, classification must not
        // infer cancellation from the exit signal alone.
        supervisor.run(&run.id).await;

        let final_run = supervisor.load_run(&run.id).await.unwrap();
        assert_eq!(final_run.status, RunStatus::Failed);
    }
}
