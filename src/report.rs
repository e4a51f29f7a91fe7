//! Run reporting.
//!
//! Reporters observe a run through the [`Reporter`] trait. Every hook has a
//! no-op default so a reporter only implements what it renders. The
//! orchestrator calls the hooks in this order:
//!
//! ```text
//! on_init ─► on_run_start ─► (on_collected | on_task_update | on_user_console_log)* ─► on_run_end
//!                 ▲                                                                        │
//!                 └──── on_watcher_rerun ◄── on_test_removed? ◄── file change ◄────────────┘
//! ```
//!
//! [`RunSummary`] is computed from the state store at the end of every run
//! and decides the process exit code.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::orchestrator::cancel::CancelReason;
use crate::project::{Project, Spec};
use crate::state::{FileTask, Task, TaskKind, TaskState, TaskUpdate, TestError, UserConsoleLog};

/// Aggregated outcome of one run.
///
/// # Exit Codes
///
/// | Code | Meaning |
/// |------|---------|
/// | 0 | All tests passed, or no tests with `pass_with_no_tests` |
/// | 1 | Failures, unhandled errors, or no tests found |
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// Monotonic id of the run.
    pub run_id: u64,

    /// Number of file records in the state store.
    pub files: usize,

    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,

    /// `(project, path)` of files containing a failure.
    pub failed_files: Vec<(String, PathBuf)>,

    pub unhandled_errors: Vec<TestError>,

    /// Workers that could not be stopped in time.
    pub timeout_causes: Vec<String>,

    /// Set when the run was cancelled.
    pub cancelled: Option<CancelReason>,

    /// No test file matched the filters.
    pub no_tests: bool,

    pub pass_with_no_tests: bool,

    pub duration: Duration,
}

impl RunSummary {
    /// Returns `true` if the run was successful.
    ///
    /// # Example
    ///
    /// ```
    /// use vigil::report::RunSummary;
    ///
    /// let summary = RunSummary {
    ///     files: 3,
    ///     passed: 12,
    ///     skipped: 1,
    ///     ..Default::default()
    /// };
    ///
    /// assert!(summary.success());
    /// assert_eq!(summary.exit_code(), 0);
    /// ```
    pub fn success(&self) -> bool {
        if self.no_tests {
            return self.pass_with_no_tests;
        }
        self.failed == 0 && self.failed_files.is_empty() && self.unhandled_errors.is_empty()
    }

    /// Returns an appropriate process exit code for this summary.
    pub fn exit_code(&self) -> i32 {
        if self.success() { 0 } else { 1 }
    }
}

/// Observer of run events.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Called once when the orchestrator is created.
    async fn on_init(&self, _projects: &[Arc<Project>]) {}

    /// Called when the specs of a run are known, before dispatch.
    async fn on_run_start(&self, _specs: &[Spec]) {}

    /// Called when a worker reports collected task trees.
    async fn on_collected(&self, _files: &[FileTask]) {}

    /// Called for every batch of task updates.
    async fn on_task_update(&self, _packs: &[TaskUpdate]) {}

    /// Called for console output of user code.
    async fn on_user_console_log(&self, _log: &UserConsoleLog) {}

    /// Called when a run is cancelled.
    async fn on_cancel(&self, _reason: &CancelReason) {}

    /// Called when a run has settled.
    async fn on_run_end(&self, _summary: &RunSummary) {}

    /// Called when watch mode starts waiting for changes.
    async fn on_watcher_start(&self) {}

    /// Called before watch mode reruns `files` because `trigger` changed.
    async fn on_watcher_rerun(&self, _files: &[PathBuf], _trigger: Option<&Path>) {}

    /// Called when a test file was deleted.
    async fn on_test_removed(&self, _path: &Path) {}
}

/// A reporter that does nothing (for testing or when output is not needed).
pub struct NullReporter;

#[async_trait]
impl Reporter for NullReporter {}

/// A reporter that combines multiple reporters.
pub struct MultiReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    /// Create a new multi-reporter.
    pub fn new() -> Self {
        Self {
            reporters: Vec::new(),
        }
    }

    /// Add a reporter to the multi-reporter.
    pub fn with_reporter<R: Reporter + 'static>(mut self, reporter: R) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }
}

impl Default for MultiReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Reporter for MultiReporter {
    async fn on_init(&self, projects: &[Arc<Project>]) {
        for reporter in &self.reporters {
            reporter.on_init(projects).await;
        }
    }

    async fn on_run_start(&self, specs: &[Spec]) {
        for reporter in &self.reporters {
            reporter.on_run_start(specs).await;
        }
    }

    async fn on_collected(&self, files: &[FileTask]) {
        for reporter in &self.reporters {
            reporter.on_collected(files).await;
        }
    }

    async fn on_task_update(&self, packs: &[TaskUpdate]) {
        for reporter in &self.reporters {
            reporter.on_task_update(packs).await;
        }
    }

    async fn on_user_console_log(&self, log: &UserConsoleLog) {
        for reporter in &self.reporters {
            reporter.on_user_console_log(log).await;
        }
    }

    async fn on_cancel(&self, reason: &CancelReason) {
        for reporter in &self.reporters {
            reporter.on_cancel(reason).await;
        }
    }

    async fn on_run_end(&self, summary: &RunSummary) {
        for reporter in &self.reporters {
            reporter.on_run_end(summary).await;
        }
    }

    async fn on_watcher_start(&self) {
        for reporter in &self.reporters {
            reporter.on_watcher_start().await;
        }
    }

    async fn on_watcher_rerun(&self, files: &[PathBuf], trigger: Option<&Path>) {
        for reporter in &self.reporters {
            reporter.on_watcher_rerun(files, trigger).await;
        }
    }

    async fn on_test_removed(&self, path: &Path) {
        for reporter in &self.reporters {
            reporter.on_test_removed(path).await;
        }
    }
}

/// Optional coverage collection around runs.
#[async_trait]
pub trait CoverageProvider: Send + Sync {
    /// Removes results of previous runs. Called before the first run.
    async fn clean(&self) -> anyhow::Result<()>;

    /// Writes the coverage report. `all_tests_run` is false for partial
    /// reruns in watch mode.
    async fn report_coverage(&self, all_tests_run: bool) -> anyhow::Result<()>;
}

#[derive(Default)]
struct ConsoleProgress {
    bar: Option<indicatif::ProgressBar>,
    tests: HashMap<String, String>,
    finished: std::collections::HashSet<String>,
}

/// Console reporter that shows progress in the terminal.
pub struct ConsoleReporter {
    progress: Mutex<ConsoleProgress>,
    verbose: bool,
}

impl ConsoleReporter {
    /// Create a new console reporter.
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: Mutex::new(ConsoleProgress::default()),
            verbose,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ConsoleProgress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn collect_tests(task: &Task, names: &mut HashMap<String, String>, prefix: &str) {
    let name = if prefix.is_empty() {
        task.name.clone()
    } else {
        format!("{} > {}", prefix, task.name)
    };
    if task.kind == TaskKind::Test {
        names.insert(task.id.clone(), name.clone());
    }
    for child in &task.children {
        collect_tests(child, names, &name);
    }
}

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn on_run_start(&self, specs: &[Spec]) {
        println!("Running {} test files", specs.len());

        let pb = indicatif::ProgressBar::new(0);
        pb.set_style(
            indicatif::ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} tests")
                .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );

        let mut progress = self.lock();
        progress.tests.clear();
        progress.finished.clear();
        progress.bar = Some(pb);
    }

    async fn on_collected(&self, files: &[FileTask]) {
        let mut progress = self.lock();
        let before = progress.tests.len();
        for file in files {
            collect_tests(&file.task, &mut progress.tests, "");
        }
        let added = progress.tests.len().saturating_sub(before);
        if let Some(pb) = progress.bar.as_ref() {
            pb.inc_length(added as u64);
        }
    }

    async fn on_task_update(&self, packs: &[TaskUpdate]) {
        let mut progress = self.lock();
        for pack in packs {
            let Some(state) = pack.result.as_ref().map(|r| r.state) else {
                continue;
            };
            if !matches!(state, TaskState::Pass | TaskState::Fail | TaskState::Skip | TaskState::Todo) {
                continue;
            }
            let Some(name) = progress.tests.get(&pack.id).cloned() else {
                continue;
            };
            if !progress.finished.insert(pack.id.clone()) {
                continue;
            }

            let status = match state {
                TaskState::Pass => console::style("PASS").green(),
                TaskState::Fail => console::style("FAIL").red(),
                _ => console::style("SKIP").yellow(),
            };
            if let Some(pb) = progress.bar.as_ref() {
                pb.inc(1);
                if self.verbose || state == TaskState::Fail {
                    pb.println(format!("{} {}", status, name));
                }
            }
        }
    }

    async fn on_user_console_log(&self, log: &UserConsoleLog) {
        if !self.verbose {
            return;
        }
        let progress = self.lock();
        match progress.bar.as_ref() {
            Some(pb) => pb.println(log.content.trim_end()),
            None => println!("{}", log.content.trim_end()),
        }
    }

    async fn on_cancel(&self, reason: &CancelReason) {
        println!("{}", console::style(format!("Cancelling run ({})", reason)).yellow());
    }

    async fn on_run_end(&self, summary: &RunSummary) {
        if let Some(pb) = self.lock().bar.take() {
            pb.finish_and_clear();
        }

        println!();
        println!("Test Results:");
        println!("  Files:   {}", summary.files);
        println!("  Passed:  {}", console::style(summary.passed).green());
        println!("  Failed:  {}", console::style(summary.failed).red());
        println!("  Skipped: {}", console::style(summary.skipped).yellow());

        if !summary.unhandled_errors.is_empty() {
            println!(
                "  Errors:  {}",
                console::style(summary.unhandled_errors.len()).red().bold()
            );
        }

        println!("  Duration: {:?}", summary.duration);

        if summary.no_tests {
            println!();
            let message = console::style("No test files found.");
            if summary.pass_with_no_tests {
                println!("{}", message.yellow());
            } else {
                println!("{}", message.red().bold());
            }
            return;
        }

        if summary.success() {
            println!();
            println!("{}", console::style("All tests passed!").green().bold());
        } else {
            println!();
            println!("{}", console::style("Some tests failed.").red().bold());

            if !summary.failed_files.is_empty() {
                println!();
                println!("Failed files:");
                for (project, path) in &summary.failed_files {
                    if project.is_empty() {
                        println!("  - {}", path.display());
                    } else {
                        println!("  - [{}] {}", project, path.display());
                    }
                }
            }

            for error in &summary.unhandled_errors {
                println!();
                println!(
                    "{} {}",
                    console::style(error.kind.as_deref().unwrap_or("Error")).red().bold(),
                    error.message
                );
                if let Some(stack) = &error.stack {
                    println!("{}", console::style(stack).dim());
                }
            }
        }

        for cause in &summary.timeout_causes {
            println!("{}", console::style(cause).dim());
        }
    }

    async fn on_watcher_start(&self) {
        println!();
        println!("{}", console::style("Waiting for file changes...").dim());
    }

    async fn on_watcher_rerun(&self, files: &[PathBuf], trigger: Option<&Path>) {
        match trigger {
            Some(trigger) => println!(
                "{} {} ({} files)",
                console::style("Rerunning:").cyan(),
                trigger.display(),
                files.len()
            ),
            None => println!("{} {} files", console::style("Rerunning").cyan(), files.len()),
        }
    }

    async fn on_test_removed(&self, path: &Path) {
        println!("{} {}", console::style("Removed").dim(), path.display());
    }
}
