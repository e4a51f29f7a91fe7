//! Pool drivers.
//!
//! A [`PoolDriver`] decides how classified specs become units on its
//! [`WorkerPool`]:
//!
//! | Driver | Units | Worker reuse |
//! |--------|-------|--------------|
//! | forks, threads (isolated project) | one per file | never |
//! | forks, threads (batched project) | one per environment/options group | within a group |
//! | vm-threads, vm-forks | one per file | until the memory limit is hit |
//! | browser, typecheck | one per project | yes |
//! | custom | decided by the [`CustomPool`] | n/a |
//!
//! Batched groups are submitted in environment priority order (see
//! [`ENVIRONMENT_PRIORITY`](crate::environment::ENVIRONMENT_PRIORITY)) and
//! the pool is recycled before each group, so one environment never leaks
//! into the next.

use std::sync::Arc;

use tracing::debug;

use super::session::Unit;
use super::workers::{UnitPolicy, WorkerPool};
use super::{CustomPool, PoolError, PoolResult, RunContext};
use crate::config::PoolName;
use crate::environment::{ClassifiedSpec, group_by_environment, split_by_options};

/// One driver per pool name.
pub enum PoolDriver {
    Forks(WorkerPool),
    Threads(WorkerPool),
    VmThreads(WorkerPool),
    VmForks(WorkerPool),
    Browser(WorkerPool),
    Typecheck(WorkerPool),
    Custom(Arc<dyn CustomPool>),
}

impl PoolDriver {
    pub fn name(&self) -> PoolName {
        match self {
            PoolDriver::Custom(pool) => PoolName::Custom(pool.name().to_string()),
            PoolDriver::Forks(pool)
            | PoolDriver::Threads(pool)
            | PoolDriver::VmThreads(pool)
            | PoolDriver::VmForks(pool)
            | PoolDriver::Browser(pool)
            | PoolDriver::Typecheck(pool) => pool.name().clone(),
        }
    }

    fn pool(&self) -> Option<&WorkerPool> {
        match self {
            PoolDriver::Custom(_) => None,
            PoolDriver::Forks(pool)
            | PoolDriver::Threads(pool)
            | PoolDriver::VmThreads(pool)
            | PoolDriver::VmForks(pool)
            | PoolDriver::Browser(pool)
            | PoolDriver::Typecheck(pool) => Some(pool),
        }
    }

    /// Runs `specs` and returns once each of them has a final result or the
    /// run was cancelled.
    pub async fn run_tests(&self, specs: Vec<ClassifiedSpec>, ctx: &RunContext) -> PoolResult<()> {
        let name = self.name();
        let errors = match self {
            PoolDriver::Forks(pool) | PoolDriver::Threads(pool) => {
                let (isolated, batched): (Vec<_>, Vec<_>) =
                    specs.into_iter().partition(|s| s.spec.project.is_isolated());
                let (a, b) = tokio::join!(
                    run_isolated(pool, isolated, ctx),
                    run_batched(pool, batched, ctx)
                );
                a.into_iter().chain(b).collect()
            }
            PoolDriver::VmThreads(pool) | PoolDriver::VmForks(pool) => {
                run_per_file(pool, specs, ctx, UnitPolicy::VM).await
            }
            PoolDriver::Browser(pool) | PoolDriver::Typecheck(pool) => {
                run_per_project(pool, specs, ctx).await
            }
            PoolDriver::Custom(pool) => run_custom(pool.as_ref(), specs, ctx).await,
        };
        PoolError::combine(format!("Pool {} failed", name), errors)
    }

    /// Drops surplus idle workers.
    pub async fn trim(&self) {
        if let Some(pool) = self.pool() {
            pool.trim().await;
        }
    }

    /// Terminates every worker. Idempotent.
    pub async fn close(&self) -> PoolResult<()> {
        match self {
            PoolDriver::Custom(pool) => pool.close().await.map_err(PoolError::Other),
            _ => {
                if let Some(pool) = self.pool() {
                    pool.close().await;
                }
                Ok(())
            }
        }
    }
}

fn unit_for(pool: &WorkerPool, group: Vec<ClassifiedSpec>) -> Option<Unit> {
    let first = group.first()?;
    Some(Unit {
        pool: pool.name().clone(),
        project: Arc::clone(&first.spec.project),
        environment: first.environment.clone(),
        files: group.into_iter().map(|s| s.spec.path).collect(),
    })
}

/// One fresh worker per file. Files are queued environment by environment.
async fn run_isolated(pool: &WorkerPool, specs: Vec<ClassifiedSpec>, ctx: &RunContext) -> Vec<PoolError> {
    let units: Vec<Unit> = group_by_environment(specs)
        .into_iter()
        .flat_map(|(_, group)| group)
        .filter_map(|spec| unit_for(pool, vec![spec]))
        .collect();
    run_concurrently(pool, units, ctx, UnitPolicy::ISOLATED).await
}

/// One unit per `(environment, project, options)` group, submitted in
/// priority order with the pool recycled in between.
async fn run_batched(pool: &WorkerPool, specs: Vec<ClassifiedSpec>, ctx: &RunContext) -> Vec<PoolError> {
    let mut errors = Vec::new();
    for (environment, group) in group_by_environment(specs) {
        for batch in split_by_options(group) {
            let Some(unit) = unit_for(pool, batch) else {
                continue;
            };
            debug!(
                "Pool {}: batch of {} file(s) in {}",
                pool.name(),
                unit.files.len(),
                environment
            );
            pool.recycle().await;
            if let Err(e) = pool.run(unit, ctx, UnitPolicy::SHARED).await {
                errors.push(e);
            }
        }
    }
    errors
}

async fn run_per_file(
    pool: &WorkerPool,
    specs: Vec<ClassifiedSpec>,
    ctx: &RunContext,
    policy: UnitPolicy,
) -> Vec<PoolError> {
    let units = specs
        .into_iter()
        .filter_map(|spec| unit_for(pool, vec![spec]))
        .collect();
    run_concurrently(pool, units, ctx, policy).await
}

async fn run_per_project(pool: &WorkerPool, specs: Vec<ClassifiedSpec>, ctx: &RunContext) -> Vec<PoolError> {
    let mut groups: Vec<(String, Vec<ClassifiedSpec>)> = Vec::new();
    for spec in specs {
        let project = spec.spec.project_name().to_string();
        match groups.iter_mut().find(|(name, _)| *name == project) {
            Some((_, group)) => group.push(spec),
            None => groups.push((project, vec![spec])),
        }
    }
    let units = groups
        .into_iter()
        .filter_map(|(_, group)| unit_for(pool, group))
        .collect();
    run_concurrently(pool, units, ctx, UnitPolicy::SHARED).await
}

async fn run_concurrently(
    pool: &WorkerPool,
    units: Vec<Unit>,
    ctx: &RunContext,
    policy: UnitPolicy,
) -> Vec<PoolError> {
    futures::future::join_all(units.into_iter().map(|unit| pool.run(unit, ctx, policy)))
        .await
        .into_iter()
        .filter_map(Result::err)
        .collect()
}

async fn run_custom(pool: &dyn CustomPool, specs: Vec<ClassifiedSpec>, ctx: &RunContext) -> Vec<PoolError> {
    let Err(e) = pool.run_tests(&specs, ctx).await else {
        return Vec::new();
    };
    let error = PoolError::Other(e);
    ctx.state.with(|state| {
        for spec in &specs {
            let paths = std::slice::from_ref(&spec.spec.path);
            if ctx.cancel.is_cancelled() {
                state.cancel_files(spec.spec.project.name(), spec.spec.project.root(), paths);
            } else {
                state.fail_files(
                    spec.spec.project.name(),
                    spec.spec.project.root(),
                    paths,
                    &error.to_test_error(),
                );
            }
        }
    });
    if ctx.cancel.is_cancelled() {
        Vec::new()
    } else {
        vec![error]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProjectConfig;
    use crate::orchestrator::cancel::CancelReason;
    use crate::pool::PoolSettings;
    use crate::pool::testing::{FakeRuntime, classified, context, project_at};
    use crate::pool::worker::ThreadWorkerProvider;
    use crate::state::TaskState;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::Duration;

    fn threads(runtime: Arc<FakeRuntime>, max_workers: usize) -> PoolDriver {
        PoolDriver::Threads(WorkerPool::new(
            PoolName::Threads,
            Arc::new(ThreadWorkerProvider::new(runtime)),
            PoolSettings::fixed(max_workers),
        ))
    }

    fn batched_project() -> Arc<crate::project::Project> {
        project_at(
            "unit",
            Path::new("/work"),
            ProjectConfig {
                isolate: false,
                ..Default::default()
            },
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_batched_groups_follow_environment_priority() {
        let runtime = Arc::new(FakeRuntime::default());
        let driver = threads(Arc::clone(&runtime), 4);
        let project = batched_project();
        let ctx = context(&project);

        let specs = vec![
            classified(&project, "dom.test.ts", "jsdom"),
            classified(&project, "plain.test.ts", "node"),
            classified(&project, "happy.test.ts", "happy-dom"),
            classified(&project, "plain2.test.ts", "node"),
        ];
        driver.run_tests(specs, &ctx).await.unwrap();

        let units = runtime.units();
        let order: Vec<_> = units.iter().map(|u| u.environment.as_str()).collect();
        assert_eq!(order, vec!["node", "jsdom", "happy-dom"]);
        assert_eq!(units[0].files.len(), 2);

        // The pool is recycled between groups.
        let workers: HashSet<_> = units.iter().map(|u| u.worker_id).collect();
        assert_eq!(workers.len(), 3);
        driver.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_batched_groups_split_by_options() {
        let runtime = Arc::new(FakeRuntime::default());
        let driver = threads(Arc::clone(&runtime), 1);
        let project = batched_project();
        let ctx = context(&project);

        let mut with_options = classified(&project, "b.test.ts", "jsdom");
        with_options.environment.options = Some(serde_json::json!({ "url": "http://x" }));
        let specs = vec![classified(&project, "a.test.ts", "jsdom"), with_options];
        driver.run_tests(specs, &ctx).await.unwrap();

        assert_eq!(runtime.units().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_isolated_files_run_in_parallel_within_capacity() {
        let runtime = Arc::new(FakeRuntime::with_delay(Duration::from_millis(40)));
        let driver = threads(Arc::clone(&runtime), 2);
        let project = project_at("unit", Path::new("/work"), ProjectConfig::default());
        let ctx = context(&project);

        let specs = vec![
            classified(&project, "a.test.ts", "node"),
            classified(&project, "b.test.ts", "jsdom"),
            classified(&project, "c.test.ts", "node"),
        ];
        driver.run_tests(specs, &ctx).await.unwrap();

        assert!(runtime.peak() <= 2);
        assert_eq!(runtime.units().len(), 3);
        let state = ctx.state.lock();
        assert_eq!(state.file_count(), 3);
        assert_eq!(state.counts().passed, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_crashing_files_are_failed_and_aggregated() {
        let runtime = Arc::new(FakeRuntime::failing(&["/work/a.test.ts", "/work/b.test.ts"]));
        let driver = threads(runtime, 2);
        let project = project_at("unit", Path::new("/work"), ProjectConfig::default());
        let ctx = context(&project);

        let specs = vec![
            classified(&project, "a.test.ts", "node"),
            classified(&project, "b.test.ts", "node"),
            classified(&project, "c.test.ts", "node"),
        ];
        let result = driver.run_tests(specs, &ctx).await;
        let Err(PoolError::Aggregate { errors, .. }) = result else {
            panic!("expected an aggregate error");
        };
        assert_eq!(errors.len(), 2);

        let state = ctx.state.lock();
        assert_eq!(state.get_failed_filepaths().len(), 2);
        assert_eq!(state.file_count(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_scores_in_flight_files_as_skipped() {
        let runtime = Arc::new(FakeRuntime {
            wait_for_cancel: true,
            ..Default::default()
        });
        let driver = threads(runtime, 2);
        let project = project_at("unit", Path::new("/work"), ProjectConfig::default());
        let ctx = context(&project);

        let specs = vec![
            classified(&project, "a.test.ts", "node"),
            classified(&project, "b.test.ts", "node"),
            classified(&project, "c.test.ts", "node"),
        ];
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel(CancelReason::KeyboardInput);
        });
        driver.run_tests(specs, &ctx).await.unwrap();

        let state = ctx.state.lock();
        assert!(state.get_failed_filepaths().is_empty());
        assert_eq!(state.file_count(), 3);
        for file in state.get_files(None) {
            assert_eq!(file.task.result.map(|r| r.state), Some(TaskState::Skip));
        }
    }

    struct Recording {
        seen: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl CustomPool for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        async fn run_tests(&self, specs: &[ClassifiedSpec], _ctx: &RunContext) -> anyhow::Result<()> {
            let mut seen = self.seen.lock().unwrap();
            seen.extend(specs.iter().map(|s| s.spec.path.display().to_string()));
            if self.fail {
                anyhow::bail!("custom pool exploded");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_custom_pool_receives_specs_and_errors_fail_files() {
        let project = project_at("unit", Path::new("/work"), ProjectConfig::default());
        let ctx = context(&project);

        let pool = Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
            fail: true,
        });
        let driver = PoolDriver::Custom(pool.clone());
        assert_eq!(driver.name(), PoolName::Custom("recording".to_string()));

        let result = driver
            .run_tests(vec![classified(&project, "a.test.ts", "node")], &ctx)
            .await;
        assert!(matches!(result, Err(PoolError::Other(_))));
        assert_eq!(*pool.seen.lock().unwrap(), vec!["/work/a.test.ts".to_string()]);
        assert_eq!(ctx.state.lock().get_failed_filepaths().len(), 1);
        driver.close().await.unwrap();
    }
}
