//! Error kinds shared across the execution core.
//!
//! Each component gets its own variant set so callers can match on the
//! specific failure without losing the underlying cause.

use thiserror::Error;

/// Errors raised while validating and rendering a run.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("parameter '{0}' is required but was not provided")]
    MissingRequired(String),
    #[error("parameter '{name}' could not be parsed as {kind}: {value}")]
    InvalidParam {
        name: String,
        kind: &'static str,
        value: String,
    },
    #[error("parameter '{name}' value '{value}' is not one of the declared options")]
    InvalidEnum { name: String, value: String },
    #[error("file parameter '{0}' expects exactly one file id")]
    FileArityMismatch(String),
    #[error("file {0} was not found")]
    FileNotFound(String),
    #[error("file {file} is not owned by the requesting principal")]
    Forbidden { file: String },
    #[error("tool '{0}' is disabled")]
    ToolDisabled(String),
    #[error("tool '{0}' is not installed")]
    ToolNotReady(String),
    #[error("tool '{0}' was not found")]
    ToolNotFound(String),
    #[error(transparent)]
    Storage(#[from] rusqlite::Error),
}

/// Errors raised while the Catalog validates a Tool definition on write.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("a tool named '{0}' already exists (case-insensitive)")]
    DuplicateName(String),
    #[error("enum parameter '{0}' must declare at least one option")]
    EnumWithoutOptions(String),
    #[error("tool '{0}' cannot be deleted while a sandbox operation is in flight")]
    SandboxBusy(String),
    #[error("tool '{0}' was not found")]
    NotFound(String),
    #[error(transparent)]
    Storage(#[from] rusqlite::Error),
}

/// Errors surfaced by the Run Supervisor while executing a single run.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("working directory already exists for run {0}")]
    WorkDirCollision(String),
    #[error("failed to stage input file '{name}': {source}")]
    Staging {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("setup file '{0}' collides with a staged input file")]
    SetupCollision(String),
    #[error("failed to spawn child process: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("required target '{0}' does not exist")]
    TargetMissing(String),
    #[error("tool environment not available")]
    SandboxNotInstalled,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Storage(#[from] rusqlite::Error),
}

/// Errors surfaced by the Sandbox Manager (install/uninstall/pin).
#[derive(Debug, Error)]
pub enum SandboxManagerError {
    #[error("installation failed: {0}")]
    InstallFailed(String),
    #[error("sandbox removal failed: {0}")]
    RemoveFailed(String),
    #[error("pin failed: {0}")]
    PinFailed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Storage(#[from] rusqlite::Error),
}

/// A crisp file-ingress quota failure.
#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("storing {added} more bytes would exceed the {limit} byte quota for this user")]
    StorageExceeded { added: u64, limit: u64 },
    #[error("adding {added} more files would exceed the {limit} file quota for this user")]
    FileCountExceeded { added: u64, limit: u64 },
}
