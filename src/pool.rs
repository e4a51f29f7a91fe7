//! Pool drivers and dispatch.
//!
//! This module turns a list of [`Spec`]s into work on worker pools:
//!
//! ```text
//!                        ┌────────────────────┐
//!   specs ──classify──►  │   PoolDispatcher   │  one driver per pool name, created lazily
//!                        └─────────┬──────────┘
//!               ┌──────────────────┼───────────────────┐
//!               ▼                  ▼                   ▼
//!        PoolDriver::Forks  PoolDriver::Threads  PoolDriver::Custom ...
//!               │                  │
//!               ▼                  ▼
//!          WorkerPool          WorkerPool      bounded by max_workers
//!               │                  │
//!               ▼                  ▼
//!        ProcessWorker       ThreadWorker      one unit at a time each
//! ```
//!
//! Drivers run concurrently. Infrastructure errors from any of them are
//! combined into one [`PoolError::Aggregate`] once every driver settled, so
//! results of unaffected drivers still reach the state store.

pub mod driver;
pub mod session;
pub mod worker;
pub mod workers;

#[cfg(test)]
pub(crate) mod testing;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{
    ConfigError, PoolName, PoolsConfig, VigilConfig, WorkerCommandConfig, resolve_max_workers,
    resolve_memory_limit, resolve_min_workers,
};
use crate::environment::{ClassifiedSpec, EnvironmentError, classify_spec};
use crate::orchestrator::cancel::CancelSignal;
use crate::project::Spec;
use crate::rpc::{RpcError, RpcHandler};
use crate::state::{SharedState, TestError};

pub use driver::PoolDriver;
pub use worker::{ProcessWorkerProvider, ThreadWorkerProvider, Worker, WorkerProvider, WorkerRuntime};
pub use workers::{UnitPolicy, WorkerPool};

/// Result type for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Infrastructure failures while running tests.
///
/// Test failures are not errors: they arrive as task results.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    #[error("Worker transport error: {0}")]
    Transport(#[from] RpcError),

    #[error("Worker {worker_id} exited unexpectedly while running {files}")]
    WorkerExited { worker_id: u64, files: String },

    #[error("Worker {worker_id} failed: {}", error.message)]
    WorkerFailed { worker_id: u64, error: TestError },

    #[error("Worker {worker_id} did not stop within {timeout_ms}ms after cancel")]
    CancelTimeout { worker_id: u64, timeout_ms: u64 },

    #[error("Pool {0} needs an in-process worker runtime, none was registered")]
    NoRuntime(PoolName),

    #[error("Pool {0} has no worker command configured")]
    NoCommand(PoolName),

    #[error("Unknown custom pool: {0}")]
    UnknownPool(String),

    #[error("Pool {0} is closed")]
    Closed(PoolName),

    #[error(transparent)]
    Environment(#[from] EnvironmentError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Custom pool error: {0}")]
    Other(#[from] anyhow::Error),

    #[error("{message} ({} errors)", errors.len())]
    Aggregate { message: String, errors: Vec<PoolError> },
}

impl PoolError {
    /// Combines `errors` into one outcome.
    ///
    /// No errors is success, a single error is returned as is, and several
    /// errors become one [`PoolError::Aggregate`]. Nested aggregates are
    /// flattened so an aggregate never contains another.
    pub fn combine(message: impl Into<String>, errors: Vec<PoolError>) -> PoolResult<()> {
        let mut flat = Vec::with_capacity(errors.len());
        let mut queue: Vec<PoolError> = errors.into_iter().rev().collect();
        while let Some(error) = queue.pop() {
            match error {
                PoolError::Aggregate { errors, .. } => queue.extend(errors.into_iter().rev()),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => Ok(()),
            1 => Err(flat.remove(0)),
            _ => Err(PoolError::Aggregate {
                message: message.into(),
                errors: flat,
            }),
        }
    }

    /// Serializable form, used to tag files and record unhandled errors.
    pub fn to_test_error(&self) -> TestError {
        match self {
            PoolError::WorkerFailed { error, .. } => error.clone(),
            PoolError::Aggregate { message, errors } => TestError::aggregate(
                message.clone(),
                errors.iter().map(PoolError::to_test_error).collect(),
            ),
            other => {
                let mut error = TestError::new(other.to_string());
                error.name = Some("PoolError".to_string());
                error
            }
        }
    }
}

/// Sizing shared by every pool of an orchestrator.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_workers: usize,
    pub min_workers: usize,

    /// Bytes after which vm-isolated workers are recycled.
    pub memory_limit: u64,

    /// Time a worker gets to stop after cancel or terminate.
    pub teardown_timeout: Duration,
}

impl PoolSettings {
    /// Derives settings from the configuration and the current machine.
    pub fn from_config(config: &VigilConfig, watch: bool) -> Result<Self, ConfigError> {
        let max_workers = resolve_max_workers(config, num_cpus::get(), watch);
        let min_workers = resolve_min_workers(config, max_workers);
        let memory_limit = resolve_memory_limit(
            config.memory_limit.as_ref(),
            worker::total_memory(),
            max_workers,
            watch,
        )?;
        debug!(
            "Pool settings: max_workers={} min_workers={} memory_limit={}",
            max_workers, min_workers, memory_limit
        );
        Ok(Self {
            max_workers,
            min_workers,
            memory_limit,
            teardown_timeout: Duration::from_millis(config.teardown_timeout_ms),
        })
    }

    /// Fixed worker count without a memory limit.
    pub fn fixed(max_workers: usize) -> Self {
        Self {
            max_workers,
            min_workers: max_workers,
            memory_limit: u64::MAX,
            teardown_timeout: workers::DEFAULT_TEARDOWN_TIMEOUT,
        }
    }
}

/// Everything a driver needs from the run it is part of.
#[derive(Clone)]
pub struct RunContext {
    pub state: SharedState,
    pub handler: Arc<dyn RpcHandler>,
    pub cancel: CancelSignal,

    /// Modules whose cached transforms workers must discard.
    pub invalidated: Vec<PathBuf>,

    pub provided_context: HashMap<String, Value>,
}

/// A pool implemented outside this crate, selected by its name.
///
/// Custom pools receive classified specs and report through
/// `ctx.handler` exactly like built-in workers do.
#[async_trait]
pub trait CustomPool: Send + Sync {
    fn name(&self) -> &str;

    async fn run_tests(&self, specs: &[ClassifiedSpec], ctx: &RunContext) -> anyhow::Result<()>;

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Routes specs to pool drivers.
pub struct PoolDispatcher {
    settings: PoolSettings,
    pools: PoolsConfig,
    workspace_root: PathBuf,
    runtime: Option<Arc<dyn WorkerRuntime>>,
    custom: HashMap<String, Arc<dyn CustomPool>>,
    drivers: Mutex<HashMap<PoolName, Arc<PoolDriver>>>,
}

impl PoolDispatcher {
    pub fn new(settings: PoolSettings, pools: PoolsConfig, workspace_root: PathBuf) -> Self {
        Self {
            settings,
            pools,
            workspace_root,
            runtime: None,
            custom: HashMap::new(),
            drivers: Mutex::new(HashMap::new()),
        }
    }

    /// Registers the in-process runtime used by `threads` and `vm-threads`.
    pub fn set_runtime(&mut self, runtime: Arc<dyn WorkerRuntime>) {
        self.runtime = Some(runtime);
    }

    /// Registers a custom pool under [`CustomPool::name`].
    pub fn register_custom_pool(&mut self, pool: Arc<dyn CustomPool>) {
        self.custom.insert(pool.name().to_string(), pool);
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Runs `specs` and waits until every driver settled.
    ///
    /// Specs that cannot be classified, or whose pool cannot be created,
    /// are tagged as failed in the state store and reported in the
    /// returned error.
    pub async fn run_tests(&self, specs: &[Spec], ctx: &RunContext) -> PoolResult<()> {
        let mut errors = Vec::new();

        let classified = futures::future::join_all(specs.iter().map(classify_spec)).await;
        let mut groups: Vec<(PoolName, Vec<ClassifiedSpec>)> = Vec::new();
        for (spec, result) in specs.iter().zip(classified) {
            let classified = match result {
                Ok(classified) => classified,
                Err(e) => {
                    warn!("Failed to classify {}: {}", spec.path.display(), e);
                    let error = PoolError::from(e);
                    ctx.state.with(|state| {
                        state.fail_files(
                            spec.project.name(),
                            spec.project.root(),
                            std::slice::from_ref(&spec.path),
                            &error.to_test_error(),
                        )
                    });
                    errors.push(error);
                    continue;
                }
            };
            let pool = spec.project.pool_for(&spec.path);
            match groups.iter_mut().find(|(name, _)| *name == pool) {
                Some((_, group)) => group.push(classified),
                None => groups.push((pool, vec![classified])),
            }
        }

        let runs = groups.into_iter().map(|(name, specs)| async move {
            let driver = match self.driver(&name).await {
                Ok(driver) => driver,
                Err(e) => {
                    let test_error = e.to_test_error();
                    ctx.state.with(|state| {
                        for spec in &specs {
                            state.fail_files(
                                spec.spec.project.name(),
                                spec.spec.project.root(),
                                std::slice::from_ref(&spec.spec.path),
                                &test_error,
                            );
                        }
                    });
                    return Err(e);
                }
            };
            debug!("Dispatching {} file(s) to pool {}", specs.len(), name);
            driver.run_tests(specs, ctx).await
        });

        for result in futures::future::join_all(runs).await {
            if let Err(e) = result {
                errors.push(e);
            }
        }

        PoolError::combine("Pools failed", errors)
    }

    async fn driver(&self, name: &PoolName) -> PoolResult<Arc<PoolDriver>> {
        let mut drivers = self.drivers.lock().await;
        if let Some(driver) = drivers.get(name) {
            return Ok(Arc::clone(driver));
        }
        let driver = Arc::new(self.create_driver(name)?);
        info!("Created pool {} (max {} workers)", name, self.settings.max_workers);
        drivers.insert(name.clone(), Arc::clone(&driver));
        Ok(driver)
    }

    fn create_driver(&self, name: &PoolName) -> PoolResult<PoolDriver> {
        let pool = |provider: Arc<dyn WorkerProvider>| {
            WorkerPool::new(name.clone(), provider, self.settings.clone())
        };
        let driver = match name {
            PoolName::Forks => PoolDriver::Forks(pool(self.process_provider(name, &self.pools.forks)?)),
            PoolName::VmForks => {
                let command = if self.pools.vm_forks.command.is_some() {
                    &self.pools.vm_forks
                } else {
                    &self.pools.forks
                };
                PoolDriver::VmForks(pool(self.process_provider(name, command)?))
            }
            PoolName::Browser => {
                PoolDriver::Browser(pool(self.process_provider(name, &self.pools.browser)?))
            }
            PoolName::Typecheck => {
                PoolDriver::Typecheck(pool(self.process_provider(name, &self.pools.typecheck)?))
            }
            PoolName::Threads => PoolDriver::Threads(pool(self.thread_provider(name)?)),
            PoolName::VmThreads => PoolDriver::VmThreads(pool(self.thread_provider(name)?)),
            PoolName::Custom(custom) => PoolDriver::Custom(
                self.custom
                    .get(custom)
                    .cloned()
                    .ok_or_else(|| PoolError::UnknownPool(custom.clone()))?,
            ),
        };
        Ok(driver)
    }

    fn process_provider(
        &self,
        name: &PoolName,
        config: &WorkerCommandConfig,
    ) -> PoolResult<Arc<dyn WorkerProvider>> {
        let command = config
            .command
            .as_deref()
            .ok_or_else(|| PoolError::NoCommand(name.clone()))?;
        Ok(Arc::new(ProcessWorkerProvider::new(
            command,
            config.env.clone(),
            self.workspace_root.clone(),
        )?))
    }

    fn thread_provider(&self, name: &PoolName) -> PoolResult<Arc<dyn WorkerProvider>> {
        let runtime = self
            .runtime
            .clone()
            .ok_or_else(|| PoolError::NoRuntime(name.clone()))?;
        Ok(Arc::new(ThreadWorkerProvider::new(runtime)))
    }

    /// Drops idle workers beyond `min_workers` in every pool.
    pub async fn trim(&self) {
        let drivers: Vec<_> = self.drivers.lock().await.values().cloned().collect();
        for driver in drivers {
            driver.trim().await;
        }
    }

    /// Closes every driver. Safe to call more than once.
    pub async fn close(&self) {
        let drivers: Vec<_> = self.drivers.lock().await.drain().map(|(_, d)| d).collect();
        for driver in drivers {
            if let Err(e) = driver.close().await {
                warn!("Failed to close pool {}: {}", driver.name(), e);
            }
        }
    }
}
