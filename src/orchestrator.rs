//! Run lifecycle.
//!
//! The [`Orchestrator`] owns everything that outlives a single run: the
//! projects, the state store, the import graphs, the caches and the pool
//! dispatcher. Runs are strictly serialized:
//!
//! ```text
//!            start / rerun_files / rerun_failed / change_*
//!                              │
//!                              ▼
//!                     wait for the run lock ◄──── previous run still settling
//!                              │
//!   Idle ──────────────────► Running ──────────────────► Idle
//!                              │  ▲                        ▲
//!                       cancel │  │ pools drained          │ cache write, coverage,
//!                              ▼  │                        │ teardown, summary
//!                          Cancelling ─────────────────────┘
//! ```
//!
//! # Execution Flow
//!
//! 1. **Discovery**: each active project globs its test files
//! 2. **Filtering**: project filter, changed-file gate and shard
//! 3. **Setup**: global setup commands of every touched project, once
//! 4. **Sequencing**: failed and slow files first (see [`sequencer`])
//! 5. **Dispatch**: the [`PoolDispatcher`] runs the specs
//! 6. **Finalize**: results cache, coverage report, teardown, [`RunSummary`]
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
//!
//!     let summary = orchestrator.start(&[]).await?;
//!     orchestrator.close().await;
//!     std::process::exit(summary.exit_code());
//! }
//! ```

pub mod cancel;
pub mod handler;
pub mod sequencer;

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::cache::{ResultsCache, StatsCache};
use crate::config::{Config, ConfigError};
use crate::graph::ProjectGraphs;
use crate::pool::{CustomPool, PoolDispatcher, PoolError, PoolSettings, RunContext, WorkerRuntime};
use crate::project::{Project, Spec, build_projects};
use crate::report::{CoverageProvider, Reporter, RunSummary};
use crate::state::SharedState;

pub use cancel::{CancelReason, CancelSignal, RunControl, RunPhase};
pub use handler::RunHandler;
pub use sequencer::{Sequencer, Shard};

/// Key of the test name pattern in the context handed to workers.
pub const TEST_NAME_PATTERN_KEY: &str = "testNamePattern";

/// Result type for orchestrator operations.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Errors that end a run without a summary.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// No test file matched. `exit_code` honors `pass_with_no_tests`.
    #[error("No test files found")]
    NoTests { exit_code: i32 },

    #[error("Global setup of project {project:?} failed: {message}")]
    GlobalSetup { project: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Filters and mode of an orchestrator. Mutated by the `change_*` methods.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Watch mode: keep setup alive between runs and tolerate empty runs
    /// behind a changed-file gate.
    pub watch: bool,

    /// Substrings a test file's relative path must contain.
    pub filters: Vec<String>,

    /// Names of the projects to run. Empty means all.
    pub project_filter: Vec<String>,

    /// Forwarded to workers, which only run matching tests.
    pub test_name_pattern: Option<String>,

    /// Only run these files.
    pub changed: Option<Vec<PathBuf>>,

    pub shard: Option<Shard>,
}

type RunGuard<'a> = tokio::sync::MutexGuard<'a, ()>;

/// Coordinates runs over a set of projects.
pub struct Orchestrator {
    config: Config,
    workspace_root: PathBuf,
    projects: Vec<Arc<Project>>,
    state: SharedState,
    graphs: ProjectGraphs,
    dispatcher: PoolDispatcher,
    reporter: Arc<dyn Reporter>,
    coverage: Option<Arc<dyn CoverageProvider>>,
    options: Mutex<RunOptions>,
    run_lock: tokio::sync::Mutex<()>,
    run_counter: AtomicU64,
    control: RunControl,
    setup_done: tokio::sync::Mutex<BTreeSet<String>>,
    results: Mutex<ResultsCache>,
    stats: Mutex<StatsCache>,
    first_run: AtomicBool,
    closed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Orchestrator {
    /// Creates an orchestrator for `config`.
    ///
    /// `workspace_root` must be absolute. Projects are built and their globs
    /// compiled here, so configuration errors surface before any run.
    pub fn new(
        config: Config,
        workspace_root: PathBuf,
        options: RunOptions,
        reporter: Arc<dyn Reporter>,
    ) -> OrchestratorResult<Self> {
        let projects = build_projects(config.resolved_projects(), &workspace_root, &config.vigil.pool)?;
        let settings = PoolSettings::from_config(&config.vigil, options.watch)?;
        let dispatcher = PoolDispatcher::new(settings, config.pools.clone(), workspace_root.clone());

        let results = if config.cache.enabled {
            ResultsCache::load(&workspace_root.join(&config.cache.dir))
        } else {
            ResultsCache::default()
        };

        let orchestrator = Self {
            config,
            workspace_root,
            projects,
            state: SharedState::new(),
            graphs: ProjectGraphs::new(),
            dispatcher,
            reporter,
            coverage: None,
            options: Mutex::new(options),
            run_lock: tokio::sync::Mutex::new(()),
            run_counter: AtomicU64::new(0),
            control: RunControl::new(),
            setup_done: tokio::sync::Mutex::new(BTreeSet::new()),
            results: Mutex::new(results),
            stats: Mutex::new(StatsCache::default()),
            first_run: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        };
        orchestrator.validate_project_filter(&lock(&orchestrator.options).project_filter)?;
        Ok(orchestrator)
    }

    /// Registers the in-process runtime for the `threads` and `vm-threads`
    /// pools.
    pub fn with_runtime(mut self, runtime: Arc<dyn WorkerRuntime>) -> Self {
        self.dispatcher.set_runtime(runtime);
        self
    }

    pub fn with_coverage(mut self, coverage: Arc<dyn CoverageProvider>) -> Self {
        self.coverage = Some(coverage);
        self
    }

    pub fn register_custom_pool(&mut self, pool: Arc<dyn CustomPool>) {
        self.dispatcher.register_custom_pool(pool);
    }

    /// Calls `listener` whenever a run is cancelled, by [`cancel`](Self::cancel)
    /// or by reaching the bail threshold.
    pub fn on_cancel(&self, listener: impl Fn(&CancelReason) + Send + Sync + 'static) {
        self.control.on_cancel(listener);
    }

    pub async fn init(&self) {
        self.reporter.on_init(&self.projects).await;
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub fn projects(&self) -> &[Arc<Project>] {
        &self.projects
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub fn graphs(&self) -> &ProjectGraphs {
        &self.graphs
    }

    pub fn reporter(&self) -> &Arc<dyn Reporter> {
        &self.reporter
    }

    pub fn phase(&self) -> RunPhase {
        self.control.phase()
    }

    /// Number of runs started so far.
    pub fn run_count(&self) -> u64 {
        self.run_counter.load(Ordering::SeqCst)
    }

    pub fn options(&self) -> RunOptions {
        lock(&self.options).clone()
    }

    fn validate_project_filter(&self, names: &[String]) -> Result<(), ConfigError> {
        match names
            .iter()
            .find(|name| !self.projects.iter().any(|p| p.name() == name.as_str()))
        {
            Some(unknown) => Err(ConfigError::UnknownProject(unknown.clone())),
            None => Ok(()),
        }
    }

    /// Projects selected by the project filter.
    pub fn active_projects(&self) -> Vec<Arc<Project>> {
        let filter = lock(&self.options).project_filter.clone();
        self.projects
            .iter()
            .filter(|p| filter.is_empty() || filter.iter().any(|name| name == p.name()))
            .cloned()
            .collect()
    }

    /// Discovers the specs matching `filters` and the active options.
    pub async fn collect_specs(&self, filters: &[String]) -> OrchestratorResult<Vec<Spec>> {
        let options = self.options();
        let mut specs = Vec::new();
        for project in self.active_projects() {
            for path in project.glob_test_files(filters).await? {
                specs.push(Spec::new(Arc::clone(&project), path));
            }
        }

        if let Some(changed) = &options.changed {
            specs.retain(|spec| changed.contains(&spec.path));
        }
        if let Some(shard) = options.shard {
            specs = shard.apply(specs);
        }
        debug!("Collected {} spec(s)", specs.len());
        Ok(specs)
    }

    /// Discovers test files and runs them.
    ///
    /// # Errors
    ///
    /// - [`OrchestratorError::NoTests`] when nothing matched, unless watch
    ///   mode waits behind a changed-file gate
    /// - [`OrchestratorError::GlobalSetup`] when a setup command failed
    pub async fn start(&self, filters: &[String]) -> OrchestratorResult<RunSummary> {
        let guard = self.run_lock.lock().await;
        self.start_locked(&guard, filters).await
    }

    async fn start_locked(&self, guard: &RunGuard<'_>, filters: &[String]) -> OrchestratorResult<RunSummary> {
        lock(&self.options).filters = filters.to_vec();
        let specs = self.collect_specs(filters).await?;
        if specs.is_empty() {
            return self.no_tests().await;
        }
        self.run_specs(guard, specs, Vec::new(), true).await
    }

    async fn no_tests(&self) -> OrchestratorResult<RunSummary> {
        let options = self.options();
        let pass_with_no_tests = self.config.vigil.pass_with_no_tests;
        if options.watch && options.changed.is_some() {
            info!("No affected test files, waiting for changes");
            let summary = RunSummary {
                run_id: self.run_count(),
                no_tests: true,
                pass_with_no_tests: true,
                ..Default::default()
            };
            self.reporter.on_run_end(&summary).await;
            return Ok(summary);
        }
        Err(OrchestratorError::NoTests {
            exit_code: if pass_with_no_tests { 0 } else { 1 },
        })
    }

    /// Reruns exactly `files`, without rediscovering the whole workspace.
    ///
    /// Each file runs once per active project that claims it. `invalidated`
    /// lists modules whose cached transforms workers must drop.
    pub async fn rerun_files(
        &self,
        files: &[PathBuf],
        trigger: Option<&Path>,
        invalidated: Vec<PathBuf>,
    ) -> OrchestratorResult<RunSummary> {
        let guard = self.run_lock.lock().await;
        self.rerun_locked(&guard, files, trigger, invalidated).await
    }

    async fn rerun_locked(
        &self,
        guard: &RunGuard<'_>,
        files: &[PathBuf],
        trigger: Option<&Path>,
        invalidated: Vec<PathBuf>,
    ) -> OrchestratorResult<RunSummary> {
        let mut specs = Vec::new();
        for project in self.active_projects() {
            for file in files {
                if project.is_test_file(file) {
                    specs.push(Spec::new(Arc::clone(&project), file.clone()));
                }
            }
        }
        self.reporter.on_watcher_rerun(files, trigger).await;
        if specs.is_empty() {
            debug!("Nothing to rerun for {} file(s)", files.len());
            return Ok(RunSummary {
                run_id: self.run_count(),
                no_tests: true,
                pass_with_no_tests: true,
                ..Default::default()
            });
        }
        self.run_specs(guard, specs, invalidated, false).await
    }

    /// Reruns every file that has a failure recorded.
    pub async fn rerun_failed(&self) -> OrchestratorResult<RunSummary> {
        let guard = self.run_lock.lock().await;
        let files = self.state.lock().get_failed_filepaths();
        self.rerun_locked(&guard, &files, None, Vec::new()).await
    }

    /// Changes the test name pattern and reruns the full file list.
    pub async fn change_name_pattern(&self, pattern: Option<String>) -> OrchestratorResult<RunSummary> {
        let guard = self.run_lock.lock().await;
        let filters = {
            let mut options = lock(&self.options);
            options.test_name_pattern = pattern;
            options.filters.clone()
        };
        self.start_locked(&guard, &filters).await
    }

    /// Changes the project filter and reruns the full file list.
    pub async fn change_project_filter(&self, projects: Vec<String>) -> OrchestratorResult<RunSummary> {
        self.validate_project_filter(&projects)?;
        let guard = self.run_lock.lock().await;
        let filters = {
            let mut options = lock(&self.options);
            options.project_filter = projects;
            options.filters.clone()
        };
        self.start_locked(&guard, &filters).await
    }

    /// Cancels the current run.
    ///
    /// Drivers stop handing out units and in-flight files are scored as
    /// cancelled. The run itself still settles normally; callers awaiting
    /// it get its summary.
    pub async fn cancel(&self, reason: CancelReason) {
        if !self.control.cancel(reason.clone()) {
            return;
        }
        info!("Cancelling run: {}", reason);
        self.reporter.on_cancel(&reason).await;
    }

    /// Cancels the current run, waits for it, runs pending teardowns and
    /// terminates every worker. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel(CancelReason::Shutdown).await;
        let _guard = self.run_lock.lock().await;
        self.global_teardown().await;
        self.dispatcher.close().await;
        debug!("Orchestrator closed after {} run(s)", self.run_count());
    }

    /// Purges a deleted file from the state store, graphs and caches.
    pub fn remove_file(&self, path: &Path) -> bool {
        let removed = self.state.with(|state| state.delete_file(path));
        self.graphs.remove_file(path);
        let mut was_test = false;
        for project in &self.projects {
            was_test |= project.remove_test_file(path);
        }
        let relative = path.strip_prefix(&self.workspace_root).unwrap_or(path);
        lock(&self.results).remove_path(relative);
        lock(&self.stats).remove_path(relative);
        removed || was_test
    }

    /// Runs `specs`. Callers hold the run lock from before they composed
    /// the spec list.
    async fn run_specs(
        &self,
        _guard: &RunGuard<'_>,
        specs: Vec<Spec>,
        invalidated: Vec<PathBuf>,
        all_tests_run: bool,
    ) -> OrchestratorResult<RunSummary> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(OrchestratorError::Pool(PoolError::Closed(self.config.vigil.pool.clone())));
        }

        let run_id = self.run_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let started = Instant::now();
        let signal = self.control.begin();
        info!("Run {}: {} file(s)", run_id, specs.len());

        let result = self
            .execute(run_id, specs, invalidated, all_tests_run, &signal)
            .await;
        self.control.finish();
        let result = result?;

        let summary = self.summary(run_id, started, signal.reason());
        self.reporter.on_run_end(&summary).await;
        Ok(summary)
    }

    async fn execute(
        &self,
        run_id: u64,
        specs: Vec<Spec>,
        invalidated: Vec<PathBuf>,
        all_tests_run: bool,
        signal: &CancelSignal,
    ) -> OrchestratorResult<()> {
        if self.first_run.swap(false, Ordering::SeqCst)
            && let Some(coverage) = &self.coverage
            && let Err(e) = coverage.clean().await
        {
            warn!("Failed to clean coverage: {}", e);
        }

        self.global_setup(&specs).await?;

        self.state.with(|state| {
            state.clear_errors();
            for (project, paths) in group_by_project(&specs) {
                state.clear_files(project.name(), project.root(), &paths);
            }
        });

        let specs = self.sequence(specs).await;
        self.reporter.on_run_start(&specs).await;

        let handler = RunHandler::new(
            self.state.clone(),
            self.graphs.clone(),
            self.projects.clone(),
            Arc::clone(&self.reporter),
            self.control.clone(),
            signal.clone(),
            self.config.vigil.bail,
        );
        let mut provided_context = self.config.vigil.provide.clone();
        if let Some(pattern) = &lock(&self.options).test_name_pattern {
            provided_context.insert(
                TEST_NAME_PATTERN_KEY.to_string(),
                serde_json::Value::String(pattern.clone()),
            );
        }
        let ctx = RunContext {
            state: self.state.clone(),
            handler: Arc::new(handler),
            cancel: signal.clone(),
            invalidated,
            provided_context,
        };

        if let Err(e) = self.dispatcher.run_tests(&specs, &ctx).await {
            error!("Run {} finished with pool errors: {}", run_id, e);
            self.state
                .with(|state| state.catch_error(e.to_test_error(), "Unhandled Error"));
        }

        self.update_cache();

        if let Some(coverage) = &self.coverage
            && let Err(e) = coverage.report_coverage(all_tests_run).await
        {
            warn!("Failed to report coverage: {}", e);
        }

        if !self.options().watch {
            self.global_teardown().await;
        }
        self.dispatcher.trim().await;
        Ok(())
    }

    async fn sequence(&self, specs: Vec<Spec>) -> Vec<Spec> {
        let mut stats = std::mem::take(&mut *lock(&self.stats));
        let files: Vec<(&str, &Path)> = specs.iter().map(|s| (s.project_name(), s.path.as_path())).collect();
        stats.populate(&self.workspace_root, files).await;

        let results = lock(&self.results).clone();
        let sorted = Sequencer::new(&results, &stats, &self.workspace_root, &self.config.vigil.sequence)
            .sort(specs);
        *lock(&self.stats) = stats;
        sorted
    }

    fn update_cache(&self) {
        if !self.config.cache.enabled {
            return;
        }
        let file_results = self.state.lock().file_results();
        let mut results = lock(&self.results);
        results.update_results(file_results.into_iter().map(|(project, path, duration, failed)| {
            let relative = path
                .strip_prefix(&self.workspace_root)
                .map(Path::to_path_buf)
                .unwrap_or(path);
            (project, relative, duration, failed)
        }));
        let cache_dir = self.workspace_root.join(&self.config.cache.dir);
        if let Err(e) = results.save(&cache_dir) {
            warn!("Failed to save results cache: {}", e);
        }
    }

    fn summary(&self, run_id: u64, started: Instant, cancelled: Option<CancelReason>) -> RunSummary {
        let state = self.state.lock();
        let counts = state.counts();
        RunSummary {
            run_id,
            files: counts.files,
            passed: counts.passed,
            failed: counts.failed,
            skipped: counts.skipped,
            failed_files: state.get_failed_files(),
            unhandled_errors: state.get_unhandled_errors().to_vec(),
            timeout_causes: state.get_timeout_causes(),
            cancelled,
            no_tests: false,
            pass_with_no_tests: self.config.vigil.pass_with_no_tests,
            duration: started.elapsed(),
        }
    }

    async fn global_setup(&self, specs: &[Spec]) -> OrchestratorResult<()> {
        let mut done = self.setup_done.lock().await;
        for (project, _) in group_by_project(specs) {
            if done.contains(project.name()) {
                continue;
            }
            for command in &project.config().global_setup {
                info!("Running global setup of {:?}: {}", project.name(), command);
                run_hook(&project, command).await.map_err(|e| OrchestratorError::GlobalSetup {
                    project: project.name().to_string(),
                    message: format!("{:#}", e),
                })?;
            }
            done.insert(project.name().to_string());
        }
        Ok(())
    }

    async fn global_teardown(&self) {
        let projects = std::mem::take(&mut *self.setup_done.lock().await);
        let timeout = std::time::Duration::from_millis(self.config.vigil.teardown_timeout_ms);
        for name in projects {
            let Some(project) = self.projects.iter().find(|p| p.name() == name) else {
                continue;
            };
            for command in &project.config().global_teardown {
                debug!("Running global teardown of {:?}: {}", name, command);
                match tokio::time::timeout(timeout, run_hook(project, command)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("Global teardown of {:?} failed: {:#}", name, e),
                    Err(_) => {
                        let cause = format!(
                            "Global teardown of {:?} did not finish within {:?}: {}",
                            name, timeout, command
                        );
                        warn!("{}", cause);
                        self.state.with(|state| state.add_timeout_cause(cause));
                    }
                }
            }
        }
    }
}

/// Groups specs by project, keeping first-seen order.
fn group_by_project(specs: &[Spec]) -> Vec<(Arc<Project>, Vec<PathBuf>)> {
    let mut groups: Vec<(Arc<Project>, Vec<PathBuf>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for spec in specs {
        match index.get(spec.project_name()) {
            Some(&i) => groups[i].1.push(spec.path.clone()),
            None => {
                index.insert(spec.project_name().to_string(), groups.len());
                groups.push((Arc::clone(&spec.project), vec![spec.path.clone()]));
            }
        }
    }
    groups
}

/// Runs a setup or teardown command through `sh -c` in the project root.
async fn run_hook(project: &Project, command: &str) -> anyhow::Result<()> {
    use anyhow::Context;

    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(project.root())
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("Failed to spawn {:?}", command))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("{:?} exited with {}: {}", command, output.status, stderr.trim());
    }
    Ok(())
}
