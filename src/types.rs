//! The data model shared by every component: `Tool`, `ParamSpec`,
//! `TargetSpec`, `Run`, `File`, and the caller-supplied `Principal`.
//!
//! Relationships that would otherwise cycle (`Run <-> File <-> Run`,
//! `Tool <-> Run`) are expressed as plain foreign-key ids, navigated by
//! query rather than by pointer — no lifetime cycles, no optimistic-lock
//! surprises.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The caller-resolved identity every public `Core` entry point trusts.
/// Authentication and session handling live entirely outside this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal<'a> {
    pub id: &'a str,
    pub is_admin: bool,
}

/// A tool's dependency-sandbox lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SandboxStatus {
    Uninstalled,
    Installing,
    Installed,
    Uninstalling,
    Failed,
}

impl SandboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxStatus::Uninstalled => "UNINSTALLED",
            SandboxStatus::Installing => "INSTALLING",
            SandboxStatus::Installed => "INSTALLED",
            SandboxStatus::Uninstalling => "UNINSTALLING",
            SandboxStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "INSTALLING" => SandboxStatus::Installing,
            "INSTALLED" => SandboxStatus::Installed,
            "UNINSTALLING" => SandboxStatus::Uninstalling,
            "FAILED" => SandboxStatus::Failed,
            _ => SandboxStatus::Uninstalled,
        }
    }
}

/// A parameter's declared type. `FILE` resolves to one or more owned `File`s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamKind {
    Str,
    Int,
    Float,
    Bool,
    Enum,
    File,
}

impl ParamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamKind::Str => "STR",
            ParamKind::Int => "INT",
            ParamKind::Float => "FLOAT",
            ParamKind::Bool => "BOOL",
            ParamKind::Enum => "ENUM",
            ParamKind::File => "FILE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "STR" => ParamKind::Str,
            "INT" => ParamKind::Int,
            "FLOAT" => ParamKind::Float,
            "BOOL" => ParamKind::Bool,
            "ENUM" => ParamKind::Enum,
            "FILE" => ParamKind::File,
            _ => return None,
        })
    }
}

/// One declared parameter of a `Tool`, in its declaration-order position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub required: bool,
    pub default: Option<serde_json::Value>,
    pub options: Vec<String>,
    pub multiple: bool,
}

/// One declared output of a `Tool`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetSpec {
    pub path_template: String,
    pub kind: String,
    pub required: bool,
}

/// A setup file rendered into the working directory before the child runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupFile {
    pub name: String,
    pub content_template: String,
}

/// A catalog entry: identity, command template, parameter/target schema,
/// optional dependency sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub id: String,
    pub name: String,
    pub version: Option<String>,
    pub command_template: String,
    pub params: Vec<ParamSpec>,
    pub targets: Vec<TargetSpec>,
    pub setup_files: Vec<SetupFile>,
    pub sandbox_spec: Option<String>,
    pub post_install_command: Option<String>,
    pub status: SandboxStatus,
    pub pinned_manifest: Option<String>,
    pub installation_log: Option<String>,
    pub enabled: bool,
    pub run_count: i64,
    pub favourited_count: i64,
    pub created_at: DateTime<Utc>,
}

impl Tool {
    pub fn new_id() -> String {
        Uuid::new_v4().to_string()
    }
}

/// A run's lifecycle state. Transitions only flow PENDING -> RUNNING ->
/// {COMPLETED, FAILED, CANCELLED}, or PENDING -> CANCELLED directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "PENDING",
            RunStatus::Running => "RUNNING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
            RunStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "RUNNING" => RunStatus::Running,
            "COMPLETED" => RunStatus::Completed,
            "FAILED" => RunStatus::Failed,
            "CANCELLED" => RunStatus::Cancelled,
            _ => RunStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

/// One execution of a `Tool`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub tool_id: String,
    pub owner_id: String,
    pub tags: Vec<String>,
    pub params: serde_json::Value,
    pub input_file_ids: Vec<String>,
    pub command: String,
    pub pinned_manifest: Option<String>,
    pub status: RunStatus,
    pub stdout: String,
    pub job_handle: Option<String>,
    pub email_on_completion: bool,
    pub shared: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new_id() -> String {
        Uuid::new_v4().to_string()
    }
}

/// Metadata for one blob on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct File {
    pub id: String,
    pub name: String,
    pub file_type: String,
    pub size: u64,
    pub location: String,
    pub owner_id: String,
    pub run_id: Option<String>,
    pub saved: bool,
    pub parent_id: Option<String>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl File {
    pub fn new_id() -> String {
        Uuid::new_v4().to_string()
    }
}
