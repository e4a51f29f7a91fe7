//! vigil: a parallel test execution engine.
//!
//! Test files are discovered per project, grouped by execution environment
//! and handed to worker pools. Workers stream structured results back into
//! a shared state store; in watch mode only the files affected by a change
//! are run again.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Projects**: configuration scopes that discover test files ([`project`])
//! - **Environment classification**: per-file environment and transform mode ([`environment`])
//! - **Pools**: bounded worker pools and the drivers built on them ([`pool`])
//! - **State**: the authoritative task tree store ([`state`])
//! - **Orchestrator**: run lifecycle, cancellation and caching ([`orchestrator`])
//! - **Watch loop**: dependency-driven reruns ([`watch`])
//! - **Report**: reporters and run summaries ([`report`])
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use vigil::config::load_config;
//! use vigil::orchestrator::{Orchestrator, RunOptions};
//! use vigil::report::ConsoleReporter;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("vigil.toml"))?;
//!     let orchestrator = Orchestrator::new(
//!         config,
//!         std::env::current_dir()?,
//!         RunOptions::default(),
//!         Arc::new(ConsoleReporter::new(false)),
//!     )?;
//!     let summary = orchestrator.start(&[]).await?;
//!     std::process::exit(summary.exit_code());
//! }
//! ```

pub mod cache;
pub mod config;
pub mod environment;
pub mod graph;
pub mod orchestrator;
pub mod pool;
pub mod project;
pub mod report;
pub mod rpc;
pub mod state;
pub mod watch;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use orchestrator::{CancelReason, Orchestrator, OrchestratorError, RunOptions};
pub use pool::{CustomPool, WorkerRuntime};
pub use project::{Project, Spec};
pub use report::{Reporter, RunSummary};
pub use state::StateManager;
pub use watch::WatchLoop;
