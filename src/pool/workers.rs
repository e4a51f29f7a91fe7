//! Bounded-concurrency worker pool.
//!
//! The [`WorkerPool`] holds idle workers between units and limits how many
//! units run at once. Every pool driver wraps one.
//!
//! ```text
//!  run(unit) ──► acquire permit ──► take idle worker / spawn ──► session::run_unit
//!                 (max_workers)                                        │
//!                                                    ┌─────────────────┴──────────────┐
//!                                                    ▼                                ▼
//!                                  reuse && under memory limit          isolated / over limit / error
//!                                        back to idle                       terminate worker
//! ```
//!
//! Errors are scored here: when the run is being cancelled the unit's files
//! are recorded as cancelled, otherwise they are tagged with the error and
//! the error is returned to the driver. A worker that outlives the teardown
//! timeout after a cancel leaves a timeout cause behind.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

use super::session::{self, Unit};
use super::worker::{Worker, WorkerProvider};
use super::{PoolError, PoolResult, PoolSettings, RunContext};
use crate::config::PoolName;

/// How a unit's worker is treated once the unit is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitPolicy {
    /// Return the worker to the idle set instead of terminating it.
    pub reuse: bool,

    /// Terminate the worker if it reports more memory than the pool limit.
    pub recycle_on_memory: bool,
}

impl UnitPolicy {
    pub const ISOLATED: UnitPolicy = UnitPolicy {
        reuse: false,
        recycle_on_memory: false,
    };

    pub const SHARED: UnitPolicy = UnitPolicy {
        reuse: true,
        recycle_on_memory: false,
    };

    pub const VM: UnitPolicy = UnitPolicy {
        reuse: true,
        recycle_on_memory: true,
    };
}

/// A pool of workers with at most `max_workers` units in flight.
pub struct WorkerPool {
    name: PoolName,
    provider: Arc<dyn WorkerProvider>,
    settings: PoolSettings,
    permits: Semaphore,
    idle: Mutex<Vec<Worker>>,
    next_worker_id: AtomicU64,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    closed: AtomicBool,
}

impl WorkerPool {
    pub fn new(name: PoolName, provider: Arc<dyn WorkerProvider>, settings: PoolSettings) -> Self {
        let permits = Semaphore::new(settings.max_workers.max(1));
        Self {
            name,
            provider,
            settings,
            permits,
            idle: Mutex::new(Vec::new()),
            next_worker_id: AtomicU64::new(1),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &PoolName {
        &self.name
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Highest number of units that were in flight at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Number of idle workers.
    pub async fn idle_count(&self) -> usize {
        self.idle.lock().await.len()
    }

    /// Runs one unit, waiting for a free slot first.
    ///
    /// Units reaching the pool after the run was cancelled are not started;
    /// their files are recorded as cancelled.
    pub async fn run(&self, unit: Unit, ctx: &RunContext, policy: UnitPolicy) -> PoolResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PoolError::Closed(self.name.clone()));
        }

        let _permit = tokio::select! {
            permit = self.permits.acquire() => permit.map_err(|_| PoolError::Closed(self.name.clone()))?,
            _ = ctx.cancel.cancelled() => {
                self.cancel_unit(&unit, ctx);
                return Ok(());
            }
        };
        if ctx.cancel.is_cancelled() {
            self.cancel_unit(&unit, ctx);
            return Ok(());
        }

        let mut worker = match self.idle.lock().await.pop() {
            Some(worker) => worker,
            None => {
                let id = self.next_worker_id.fetch_add(1, Ordering::SeqCst);
                match self.provider.spawn(id).await {
                    Ok(worker) => worker,
                    Err(e) => return self.score_error(e, &unit, ctx),
                }
            }
        };

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);

        let result = session::run_unit(&mut worker, &unit, ctx, self.settings.teardown_timeout).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(()) => {
                let over_limit = policy.recycle_on_memory
                    && worker
                        .memory_usage()
                        .is_some_and(|used| used > self.settings.memory_limit);
                if over_limit {
                    debug!(
                        "Recycling worker {} of pool {}: memory limit {} exceeded",
                        worker.id(),
                        self.name,
                        self.settings.memory_limit
                    );
                }
                if policy.reuse && !over_limit && !self.closed.load(Ordering::SeqCst) {
                    self.idle.lock().await.push(worker);
                } else {
                    self.terminate_worker(worker, ctx, &unit).await;
                }
                Ok(())
            }
            Err(e) => {
                self.terminate_worker(worker, ctx, &unit).await;
                self.score_error(e, &unit, ctx)
            }
        }
    }

    fn cancel_unit(&self, unit: &Unit, ctx: &RunContext) {
        ctx.state.with(|state| {
            state.cancel_files(unit.project.name(), unit.project.root(), &unit.files)
        });
    }

    fn score_error(&self, error: PoolError, unit: &Unit, ctx: &RunContext) -> PoolResult<()> {
        if ctx.cancel.is_cancelled() {
            if let PoolError::CancelTimeout { worker_id, timeout_ms } = &error {
                let cause = format!(
                    "Worker {} of pool {} ignored cancellation for {}ms while running {}",
                    worker_id,
                    self.name,
                    timeout_ms,
                    unit.describe()
                );
                warn!("{}", cause);
                ctx.state.with(|state| state.add_timeout_cause(cause));
            } else {
                debug!("Pool {}: {} (run cancelled)", self.name, error);
            }
            self.cancel_unit(unit, ctx);
            return Ok(());
        }
        warn!("Pool {}: {}", self.name, error);
        let test_error = error.to_test_error();
        ctx.state.with(|state| {
            state.fail_files(unit.project.name(), unit.project.root(), &unit.files, &test_error)
        });
        Err(error)
    }

    async fn terminate_worker(&self, worker: Worker, ctx: &RunContext, unit: &Unit) {
        let id = worker.id();
        match tokio::time::timeout(self.settings.teardown_timeout, worker.terminate()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to terminate worker {}: {}", id, e),
            Err(_) => {
                let cause = format!(
                    "Failed to terminate worker {} while running {}",
                    id,
                    unit.describe()
                );
                warn!("{}", cause);
                ctx.state.with(|state| state.add_timeout_cause(cause));
            }
        }
    }

    /// Terminates every idle worker so the next unit starts fresh.
    pub async fn recycle(&self) {
        let workers = std::mem::take(&mut *self.idle.lock().await);
        self.terminate_all(workers).await;
    }

    /// Terminates idle workers beyond `min_workers`.
    pub async fn trim(&self) {
        let surplus = {
            let mut idle = self.idle.lock().await;
            let keep = self.settings.min_workers.min(idle.len());
            idle.split_off(keep)
        };
        self.terminate_all(surplus).await;
    }

    /// Terminates all idle workers and rejects further units. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.recycle().await;
    }

    async fn terminate_all(&self, workers: Vec<Worker>) {
        for worker in workers {
            let id = worker.id();
            match tokio::time::timeout(self.settings.teardown_timeout, worker.terminate()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Failed to terminate worker {}: {}", id, e),
                Err(_) => warn!(
                    "Worker {} did not terminate within {:?}",
                    id,
                    self.settings.teardown_timeout
                ),
            }
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("max_workers", &self.settings.max_workers)
            .finish()
    }
}

/// Default wait for a worker to exit.
pub const DEFAULT_TEARDOWN_TIMEOUT: Duration = Duration::from_secs(10);
