//! Process-wide configuration for the executor worker pool.
//!
//! A `clap`-derived CLI struct for the binary layers under an optional TOML
//! config file: any field the file sets wins, since clap can't tell "user
//! typed the default" from "user omitted the flag" (see `from_cli` below).

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Runtime configuration for the `toolcore` worker-pool binary.
#[derive(Parser, Debug, Clone)]
#[command(
    author,
    version,
    about = "Durable, cancellable, observable job executor for registered CLI tools."
)]
pub struct Cli {
    /// Path to an optional TOML config file layered under these CLI flags.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Path to the sqlite database file.
    #[arg(long, default_value = "toolcore.db")]
    pub db_path: PathBuf,

    /// Root directory under which per-run working directories are created.
    #[arg(long, default_value = "/tmp/toolcore-runs")]
    pub work_root: PathBuf,

    /// Root directory under which per-tool sandboxes are created.
    #[arg(long, default_value = "/opt/toolcore-sandboxes")]
    pub sandbox_root: PathBuf,

    /// Path to the `conda`/`mamba` activation script.
    #[arg(long, default_value = "/opt/conda/bin/activate")]
    pub sandbox_activator: PathBuf,

    /// Number of concurrent run-worker tasks.
    #[arg(long, default_value_t = 4)]
    pub workers: usize,

    /// Enable verbose (debug) logging.
    #[arg(short, long)]
    pub debug: bool,

    /// Write logs to a rolling file under the platform cache dir instead of stderr.
    #[arg(long)]
    pub log_to_file: bool,
}

/// The subset of [`Cli`] that may also be supplied via a TOML file. CLI
/// flags win when both are present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FileConfig {
    pub db_path: Option<PathBuf>,
    pub work_root: Option<PathBuf>,
    pub sandbox_root: Option<PathBuf>,
    pub sandbox_activator: Option<PathBuf>,
    pub workers: Option<usize>,
    pub debug: Option<bool>,
    pub log_to_file: Option<bool>,
}

/// Fully-resolved configuration used by the rest of the crate.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub work_root: PathBuf,
    pub sandbox_root: PathBuf,
    pub sandbox_activator: PathBuf,
    pub workers: usize,
    pub debug: bool,
    pub log_to_file: bool,
}

impl AppConfig {
    /// Resolve a [`Cli`] parse, layering in `--config`'s TOML file (if any)
    /// for any field the CLI left at its default-looking value is not
    /// attempted — clap defaults always apply unless overridden by the file,
    /// since clap can't distinguish "user typed the default" from "user
    /// didn't pass the flag". The file therefore only fills in for fields a
    /// caller omits from the CLI entirely by invoking [`AppConfig::from_file_then_cli`].
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let file = match &cli.config {
            Some(path) => load_file_config(path)?,
            None => FileConfig::default(),
        };
        Ok(Self {
            db_path: file.db_path.unwrap_or(cli.db_path),
            work_root: file.work_root.unwrap_or(cli.work_root),
            sandbox_root: file.sandbox_root.unwrap_or(cli.sandbox_root),
            sandbox_activator: file.sandbox_activator.unwrap_or(cli.sandbox_activator),
            workers: file.workers.unwrap_or(cli.workers),
            debug: file.debug.unwrap_or(cli.debug),
            log_to_file: file.log_to_file.unwrap_or(cli.log_to_file),
        })
    }
}

fn load_file_config(path: &std::path::Path) -> Result<FileConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))
}
