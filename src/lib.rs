//! # Toolcore
//!
//! The execution core of a multi-user service that lets administrators
//! register external command-line tools and lets users launch parameterised,
//! long-running runs of those tools. This crate is a durable, cancellable,
//! observable job executor: it validates parameters against a declared tool
//! schema, prepares an isolated per-run working directory, activates a
//! per-tool dependency sandbox, supervises the child process to completion
//! or cancellation, captures declared output artifacts, and recovers cleanly
//! across process restarts.
//!
//! Everything outside the core — HTTP endpoints, authentication, file CRUD,
//! statistics, AI summarisation — is an external collaborator. This crate
//! exposes a plain async API on [`core::Core`] that such a collaborator
//! would call, accepting a [`types::Principal`] at every entry point rather
//! than doing any authentication of its own.
//!
//! ## Modules
//!
//! - **`catalog`**: persistent store of tool definitions.
//! - **`planner`**: validates parameters, resolves files, renders commands.
//! - **`queue`**: durable FIFO carrying `RUN` and `SANDBOX_OP` jobs.
//! - **`supervisor`**: launches and monitors run child processes.
//! - **`files`**: Run/File ownership invariants (cascade delete, quotas).
//! - **`sandbox`**: creates/removes per-tool dependency environments.
//! - **`events`**: topic-keyed pub/sub fan-out for log lines and status.
//! - **`recovery`**: reconciles durable state with reality at startup.
//! - **`core`**: wires the above into the crate's public API surface.

pub mod catalog;
pub mod config;
pub mod core;
pub mod db;
pub mod errors;
pub mod events;
pub mod files;
pub mod logging;
pub mod path_security;
pub mod planner;
pub mod queue;
pub mod recovery;
pub mod sandbox;
pub mod supervisor;
pub mod template;
pub mod types;

pub use core::Core;
pub use types::Principal;
