//! Centralized logging initialization for the executor process.
//!
//! A single `init_logging` call configures a `tracing` subscriber driven by
//! `RUST_LOG`, optionally writing to a daily rolling file instead of
//! stderr.

use anyhow::Result;
use directories::ProjectDirs;
use std::io::stderr;
use std::sync::Once;
use tracing_subscriber::{EnvFilter, fmt::layer, prelude::*};

static INIT: Once = Once::new();

/// Initialize a `trace`-level stderr subscriber for tests.
pub fn init_test_logging() {
    init_logging("trace", false).expect("failed to initialize test logging");
}

/// Initialize the process-wide logging subscriber.
///
/// When `log_to_file` is true, logs go to a daily-rolling file under the
/// platform cache directory; otherwise they go to stderr with ANSI colors.
pub fn init_logging(log_level: &str, log_to_file: bool) -> Result<()> {
    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("{log_level},toolcore=debug")));

        if log_to_file
            && let Some(proj_dirs) = ProjectDirs::from("com", "ToolCore", "toolcore")
        {
            let log_dir = proj_dirs.cache_dir();
            if std::fs::create_dir_all(log_dir).is_ok() {
                let file_appender = tracing_appender::rolling::daily(log_dir, "toolcore.log");
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(layer().with_writer(non_blocking).with_ansi(false))
                    .init();

                // Leaked intentionally so buffered logs still flush at process exit.
                Box::leak(Box::new(guard));
                return;
            }
        }

        tracing_subscriber::registry()
            .with(env_filter)
            .with(layer().with_writer(stderr).with_ansi(true))
            .init();
    });

    Ok(())
}
