//! Dependency watch loop.
//!
//! File system events are turned into a set of dirty test files, collected
//! while events keep arriving, and handed to
//! [`Orchestrator::rerun_files`] once the workspace has been quiet for
//! `watch.debounce_ms`.
//!
//! | Event | Effect |
//! |-------|--------|
//! | unlink | purge the file everywhere, drop it from the pending set |
//! | add | test file of some project: rerun it; otherwise handled as a change |
//! | change | force-rerun glob: every known test file; otherwise walk importers |
//!
//! The importer walk starts at the modules loaded from the changed file and
//! follows the reverse-import edges reported by workers:
//!
//! ```text
//!   util.ts ◄── math.ts ◄── math.test.ts      change util.ts
//!      ▲                                       → dirty {math.test.ts, api.test.ts}
//!      └─────── api.ts ◄── api.test.ts
//! ```
//!
//! Test files and trigger-pattern files end the walk. Every module is
//! visited at most once per event, so import cycles terminate.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use globset::GlobSet;
use notify::event::{EventKind, ModifyKind};
use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ConfigError;
use crate::graph::ModuleGraph;
use crate::orchestrator::Orchestrator;
use crate::project::{build_set, normalize};

/// A file system event, already reduced to what the loop cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Add(PathBuf),
    Change(PathBuf),
    Unlink(PathBuf),
}

impl WatchEvent {
    pub fn path(&self) -> &Path {
        match self {
            WatchEvent::Add(path) | WatchEvent::Change(path) | WatchEvent::Unlink(path) => path,
        }
    }

    /// Maps a `notify` event to loop events. Access events are dropped.
    ///
    /// Renames are reported per path: a path that still exists was added,
    /// one that no longer does was removed.
    pub fn from_notify(event: notify::Event) -> Vec<WatchEvent> {
        let make: fn(PathBuf) -> WatchEvent = match event.kind {
            EventKind::Create(_) => WatchEvent::Add,
            EventKind::Remove(_) => WatchEvent::Unlink,
            EventKind::Modify(ModifyKind::Name(_)) => {
                return event
                    .paths
                    .into_iter()
                    .map(|path| {
                        if path.exists() {
                            WatchEvent::Add(path)
                        } else {
                            WatchEvent::Unlink(path)
                        }
                    })
                    .collect();
            }
            EventKind::Modify(_) => WatchEvent::Change,
            _ => return Vec::new(),
        };
        event.paths.into_iter().map(make).collect()
    }
}

/// Files to rerun plus modules whose cached transforms must be dropped.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DirtySet {
    pub files: BTreeSet<PathBuf>,
    pub invalidated: BTreeSet<PathBuf>,
}

impl DirtySet {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn extend(&mut self, other: DirtySet) {
        self.files.extend(other.files);
        self.invalidated.extend(other.invalidated);
    }
}

#[derive(Default)]
struct Pending {
    dirty: DirtySet,
    trigger: Option<PathBuf>,
}

struct Trigger {
    set: GlobSet,
    tests: Vec<PathBuf>,
}

/// Reruns affected test files after file system changes.
pub struct WatchLoop {
    orchestrator: Arc<Orchestrator>,
    force_rerun: GlobSet,
    ignore: GlobSet,
    triggers: Vec<Trigger>,
    debounce: Duration,
    pending: Mutex<Pending>,
    timer: Mutex<Option<JoinHandle<()>>>,
    generation: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl WatchLoop {
    /// Compiles the `[watch]` globs of the orchestrator's configuration.
    pub fn new(orchestrator: Arc<Orchestrator>) -> Result<Arc<Self>, ConfigError> {
        let watch = &orchestrator.config().watch;
        let force_rerun = build_set("watch.force_rerun_triggers", &watch.force_rerun_triggers)?;
        let ignore = build_set("watch.ignore", &watch.ignore)?;
        let root = orchestrator.workspace_root();
        let triggers = watch
            .trigger_patterns
            .iter()
            .map(|pattern| {
                Ok(Trigger {
                    set: build_set("watch.trigger_patterns", std::slice::from_ref(&pattern.glob))?,
                    tests: pattern.tests.iter().map(|t| normalize(&root.join(t))).collect(),
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        let debounce = Duration::from_millis(watch.debounce_ms);

        Ok(Arc::new(Self {
            orchestrator,
            force_rerun,
            ignore,
            triggers,
            debounce,
            pending: Mutex::new(Pending::default()),
            timer: Mutex::new(None),
            generation: AtomicU64::new(0),
        }))
    }

    fn relative<'a>(&self, path: &'a Path) -> &'a Path {
        path.strip_prefix(self.orchestrator.workspace_root()).unwrap_or(path)
    }

    /// Whether events for `path` are dropped.
    pub fn is_ignored(&self, path: &Path) -> bool {
        self.ignore.is_match(self.relative(path))
    }

    fn trigger_tests(&self, path: &Path) -> Option<Vec<PathBuf>> {
        let relative = self.relative(path);
        let tests: Vec<PathBuf> = self
            .triggers
            .iter()
            .filter(|trigger| trigger.set.is_match(relative))
            .flat_map(|trigger| trigger.tests.iter().cloned())
            .collect();
        if tests.is_empty() { None } else { Some(tests) }
    }

    /// Currently pending dirty files.
    pub fn pending(&self) -> DirtySet {
        lock(&self.pending).dirty.clone()
    }

    /// Applies one event to the pending set and (re)starts the debounce
    /// timer when something became dirty.
    pub async fn handle(self: &Arc<Self>, event: WatchEvent) {
        let path = normalize(event.path());
        if self.is_ignored(&path) {
            return;
        }
        debug!("Watch event: {:?}", event);

        let dirty = match event {
            WatchEvent::Unlink(_) => {
                self.unlink(&path).await;
                return;
            }
            WatchEvent::Add(_) => self.add(&path).await,
            WatchEvent::Change(_) => self.dirty_files(&path),
        };
        if dirty.is_empty() {
            debug!("{} affects no test file", path.display());
            return;
        }

        {
            let mut pending = lock(&self.pending);
            pending.dirty.extend(dirty);
            pending.trigger = Some(path);
        }
        self.schedule();
    }

    async fn unlink(&self, path: &Path) {
        lock(&self.pending).dirty.files.remove(path);
        if self.orchestrator.remove_file(path) {
            info!("Test file removed: {}", path.display());
            self.orchestrator.reporter().on_test_removed(path).await;
        }
    }

    async fn add(&self, path: &Path) -> DirtySet {
        let projects = self.orchestrator.projects();
        let content = if projects.iter().any(|p| p.needs_source(path)) {
            tokio::fs::read_to_string(path).await.ok()
        } else {
            None
        };

        let mut matched = false;
        for project in projects {
            if project.matches_test_glob(path, || content.clone()) {
                project.mark_test_file(path);
                matched = true;
            }
        }
        if !matched {
            return self.dirty_files(path);
        }
        DirtySet {
            files: BTreeSet::from([path.to_path_buf()]),
            invalidated: BTreeSet::new(),
        }
    }

    /// Test files affected by a change of `path`.
    pub fn dirty_files(&self, path: &Path) -> DirtySet {
        let mut dirty = DirtySet::default();
        let projects = self.orchestrator.projects();

        if self.force_rerun.is_match(self.relative(path)) {
            info!("{} matches a force-rerun trigger, rerunning everything", path.display());
            for project in projects {
                dirty.files.extend(project.test_files());
            }
            return dirty;
        }

        let graphs = self.orchestrator.graphs().lock();
        let mut referenced = false;
        for project in projects {
            let Some(graph) = graphs.get(project.name()) else {
                continue;
            };
            let mut work = graph.modules_by_file(path);
            if work.is_empty() {
                continue;
            }
            referenced = true;

            let mut visited = HashSet::new();
            while let Some(module) = work.pop() {
                if !visited.insert(module) {
                    continue;
                }
                let Some(file) = graph.file(module) else {
                    continue;
                };
                if project.is_test_file(file) {
                    dirty.files.insert(file.to_path_buf());
                    continue;
                }
                if let Some(tests) = self.trigger_tests(file) {
                    dirty.files.extend(tests);
                    continue;
                }
                work.extend(graph.importers(module));
            }
        }
        drop(graphs);

        if referenced {
            dirty.invalidated.insert(path.to_path_buf());
        } else {
            if projects.iter().any(|p| p.is_test_file(path)) {
                dirty.files.insert(path.to_path_buf());
            }
            if let Some(tests) = self.trigger_tests(path) {
                dirty.files.extend(tests);
            }
        }
        dirty
    }

    /// Restarts the debounce timer.
    fn schedule(self: &Arc<Self>) {
        let generation = self.generation.load(Ordering::SeqCst);
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(this.debounce).await;
            this.fire(generation);
        });
        if let Some(previous) = lock(&self.timer).replace(handle) {
            previous.abort();
        }
    }

    fn fire(self: &Arc<Self>, generation: u64) {
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!("Dropping rerun scheduled by watch session {}", generation);
            return;
        }
        let Pending { dirty, trigger } = std::mem::take(&mut *lock(&self.pending));
        if dirty.is_empty() {
            return;
        }

        let orchestrator = Arc::clone(&self.orchestrator);
        tokio::spawn(async move {
            let files: Vec<PathBuf> = dirty.files.into_iter().collect();
            let invalidated = dirty.invalidated.into_iter().collect();
            info!("Rerunning {} file(s)", files.len());
            if let Err(e) = orchestrator.rerun_files(&files, trigger.as_deref(), invalidated).await {
                warn!("Failed to rerun tests: {}", e);
            }
            orchestrator.reporter().on_watcher_start().await;
        });
    }

    /// Drops pending work and invalidates timers of the previous session.
    pub fn restart(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(timer) = lock(&self.timer).take() {
            timer.abort();
        }
        *lock(&self.pending) = Pending::default();
    }

    /// Watches the workspace root until the event stream ends.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    for event in WatchEvent::from_notify(event) {
                        let _ = tx.send(event);
                    }
                }
                Err(e) => warn!("File watcher error: {}", e),
            }
        })
        .context("Failed to create file watcher")?;

        let root = self.orchestrator.workspace_root().to_path_buf();
        watcher
            .watch(&root, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch {}", root.display()))?;
        info!("Watching {} for changes", root.display());
        self.orchestrator.reporter().on_watcher_start().await;

        while let Some(event) = rx.recv().await {
            self.handle(event).await;
        }
        Ok(())
    }
}

impl Drop for WatchLoop {
    fn drop(&mut self) {
        if let Some(timer) = lock(&self.timer).take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, PoolName, ProjectConfig, TriggerPattern};
    use crate::orchestrator::RunOptions;
    use crate::pool::testing::FakeRuntime;
    use crate::report::{NullReporter, Reporter};
    use async_trait::async_trait;
    use tempfile::TempDir;

    fn config() -> Config {
        let mut config = Config::default();
        config.vigil.pool = PoolName::Threads;
        config.vigil.max_workers = Some(1);
        config.cache.enabled = false;
        config.projects = vec![ProjectConfig {
            name: "unit".to_string(),
            ..Default::default()
        }];
        config
    }

    fn watch_loop(config: Config) -> Arc<WatchLoop> {
        watch_loop_at(config, Path::new("/work"))
    }

    fn watch_loop_at(config: Config, root: &Path) -> Arc<WatchLoop> {
        let orchestrator = Orchestrator::new(
            config,
            root.to_path_buf(),
            RunOptions {
                watch: true,
                ..Default::default()
            },
            Arc::new(NullReporter),
        )
        .unwrap();
        WatchLoop::new(Arc::new(orchestrator)).unwrap()
    }

    fn imports(watch: &WatchLoop, importer: &str, imported: &[&str]) {
        let imported: Vec<PathBuf> = imported.iter().map(|p| Path::new("/work").join(p)).collect();
        watch
            .orchestrator
            .graphs()
            .record_imports("unit", &Path::new("/work").join(importer), &imported);
    }

    fn files(dirty: &DirtySet) -> Vec<String> {
        dirty
            .files
            .iter()
            .map(|p| p.strip_prefix("/work").unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_transitive_importers_are_dirty() {
        let watch = watch_loop(config());
        imports(&watch, "math.test.ts", &["math.ts"]);
        imports(&watch, "math.ts", &["util.ts"]);
        imports(&watch, "api.test.ts", &["api.ts"]);
        imports(&watch, "api.ts", &["util.ts"]);
        imports(&watch, "other.test.ts", &["other.ts"]);

        let dirty = watch.dirty_files(Path::new("/work/util.ts"));
        assert_eq!(files(&dirty), vec!["api.test.ts", "math.test.ts"]);
        assert!(dirty.invalidated.contains(Path::new("/work/util.ts")));
    }

    #[test]
    fn test_import_cycle_terminates() {
        let watch = watch_loop(config());
        imports(&watch, "a.ts", &["b.ts"]);
        imports(&watch, "b.ts", &["a.ts"]);
        imports(&watch, "a.test.ts", &["a.ts"]);

        let dirty = watch.dirty_files(Path::new("/work/b.ts"));
        assert_eq!(files(&dirty), vec!["a.test.ts"]);

        imports(&watch, "a.test.ts", &[]);
        let dirty = watch.dirty_files(Path::new("/work/a.ts"));
        assert!(dirty.is_empty());
    }

    #[tokio::test]
    async fn test_unrelated_change_schedules_nothing() {
        let watch = watch_loop(config());
        imports(&watch, "a.test.ts", &["a.ts"]);

        watch.handle(WatchEvent::Change(PathBuf::from("/work/README.md"))).await;
        assert!(watch.pending().is_empty());
        assert!(lock(&watch.timer).is_none());
    }

    #[test]
    fn test_changed_test_file_outside_graph_is_dirty() {
        let watch = watch_loop(config());
        let dirty = watch.dirty_files(Path::new("/work/src/new.test.ts"));
        assert_eq!(files(&dirty), vec!["src/new.test.ts"]);
        assert!(dirty.invalidated.is_empty());
    }

    #[test]
    fn test_force_rerun_marks_every_test_file() {
        let watch = watch_loop(config());
        let project = &watch.orchestrator.projects()[0];
        project.mark_test_file(Path::new("/work/a.test.ts"));
        project.mark_test_file(Path::new("/work/b.test.ts"));

        let dirty = watch.dirty_files(Path::new("/work/package.json"));
        assert_eq!(files(&dirty), vec!["a.test.ts", "b.test.ts"]);
    }

    #[test]
    fn test_trigger_pattern_maps_to_tests() {
        let mut config = config();
        config.watch.trigger_patterns = vec![TriggerPattern {
            glob: "fixtures/**/*.json".to_string(),
            tests: vec![PathBuf::from("fixtures.test.ts")],
        }];
        let watch = watch_loop(config);

        let dirty = watch.dirty_files(Path::new("/work/fixtures/users/alice.json"));
        assert_eq!(files(&dirty), vec!["fixtures.test.ts"]);
    }

    #[tokio::test]
    async fn test_ignored_paths_are_dropped() {
        let watch = watch_loop(config());
        watch
            .handle(WatchEvent::Add(PathBuf::from("/work/node_modules/x/a.test.ts")))
            .await;
        assert!(watch.pending().is_empty());
    }

    #[tokio::test]
    async fn test_added_in_source_test_is_detected_by_content() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::write(root.join("src/math.ts"), "if (import.meta.vigil) {}").unwrap();
        std::fs::write(root.join("src/plain.ts"), "export const x = 1").unwrap();

        let mut config = config();
        config.projects[0].include_source = vec!["src/**/*.ts".to_string()];
        let watch = watch_loop_at(config, root);

        watch.handle(WatchEvent::Add(root.join("src/plain.ts"))).await;
        assert!(watch.pending().is_empty());

        watch.handle(WatchEvent::Add(root.join("src/math.ts"))).await;
        assert_eq!(
            watch.pending().files.into_iter().collect::<Vec<_>>(),
            vec![root.join("src/math.ts")]
        );
        assert!(watch.orchestrator.projects()[0].test_files().contains(&root.join("src/math.ts")));
    }

    #[tokio::test]
    async fn test_unlink_purges_pending_and_known_files() {
        let watch = watch_loop(config());
        let project = &watch.orchestrator.projects()[0];
        project.mark_test_file(Path::new("/work/a.test.ts"));
        lock(&watch.pending)
            .dirty
            .files
            .insert(PathBuf::from("/work/a.test.ts"));

        watch.handle(WatchEvent::Unlink(PathBuf::from("/work/a.test.ts"))).await;
        assert!(watch.pending().is_empty());
        assert!(project.test_files().is_empty());
    }

    #[tokio::test]
    async fn test_stale_generation_does_not_fire() {
        let watch = watch_loop(config());
        watch.handle(WatchEvent::Change(PathBuf::from("/work/a.test.ts"))).await;
        assert_eq!(files(&watch.pending()), vec!["a.test.ts"]);

        watch.restart();
        watch.fire(0);
        assert!(watch.pending().is_empty());
    }

    #[derive(Default)]
    struct Reruns(Mutex<Vec<Vec<PathBuf>>>);

    #[async_trait]
    impl Reporter for Reruns {
        async fn on_watcher_rerun(&self, files: &[PathBuf], _trigger: Option<&Path>) {
            lock(&self.0).push(files.to_vec());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_burst_of_events_collapses_into_one_rerun() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        for name in ["a.test.ts", "b.test.ts"] {
            std::fs::write(root.join(name), "").unwrap();
        }
        let mut config = config();
        config.watch.debounce_ms = 20;
        let reruns = Arc::new(Reruns::default());
        let orchestrator = Orchestrator::new(
            config,
            root.to_path_buf(),
            RunOptions {
                watch: true,
                ..Default::default()
            },
            reruns.clone(),
        )
        .unwrap()
        .with_runtime(Arc::new(FakeRuntime::default().rooted(root)));
        let watch = WatchLoop::new(Arc::new(orchestrator)).unwrap();

        watch.handle(WatchEvent::Change(root.join("a.test.ts"))).await;
        watch.handle(WatchEvent::Change(root.join("b.test.ts"))).await;
        watch.handle(WatchEvent::Change(root.join("a.test.ts"))).await;

        for _ in 0..100 {
            if watch.orchestrator.run_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let reruns = lock(&reruns.0).clone();
        assert_eq!(reruns, vec![vec![root.join("a.test.ts"), root.join("b.test.ts")]]);
        assert_eq!(watch.orchestrator.run_count(), 1);
    }

    #[test]
    fn test_rename_maps_by_existence() {
        let dir = TempDir::new().unwrap();
        let kept = dir.path().join("new.ts");
        std::fs::write(&kept, "").unwrap();
        let gone = dir.path().join("old.ts");

        let event = notify::Event::new(EventKind::Modify(ModifyKind::Name(
            notify::event::RenameMode::Both,
        )))
        .add_path(gone.clone())
        .add_path(kept.clone());
        assert_eq!(
            WatchEvent::from_notify(event),
            vec![WatchEvent::Unlink(gone), WatchEvent::Add(kept)]
        );
    }
}
