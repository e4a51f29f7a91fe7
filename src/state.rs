//! Authoritative in-memory store of files, task trees and unhandled errors.
//!
//! Workers never hand over task objects to be stored as-is. A worker first
//! reports the collected tree for a file ([`StateManager::collect_files`]),
//! then streams `(id, result, meta)` updates that are merged by id
//! ([`StateManager::update_tasks`]). Tasks are kept in an arena keyed by
//! their stable id; a file record points at its root task.
//!
//! ```text
//! files_map: path ──► [FileRecord { project: "a", root }, FileRecord { project: "b", root }]
//!                                                  │
//! tasks:     id ──► TaskNode { kind, name, children, result, meta }
//! ```
//!
//! At most one record exists per `(project, path)`. Re-collecting a file
//! replaces that project's record and leaves the other projects' records
//! for the same path untouched.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Error code that turns an error into a skipped task instead of an
/// unhandled error.
pub const PENDING_CODE: &str = "VIGIL_PENDING";

/// Stable task identifier.
pub type TaskId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    File,
    Suite,
    Test,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Queued,
    Run,
    Pass,
    Fail,
    Skip,
    Todo,
}

/// Result of a task as reported by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub state: TaskState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<TestError>,
}

impl TaskResult {
    pub fn new(state: TaskState) -> Self {
        Self {
            state,
            duration_ms: None,
            errors: Vec::new(),
        }
    }
}

/// A serialized error from a worker or from the coordinator itself.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TestError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,

    /// Machine-readable code, e.g. [`PENDING_CODE`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    /// Task the error belongs to, used by pending errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,

    /// Error category, e.g. `Unhandled Error`. Set by [`StateManager::catch_error`].
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Constituent errors when this is an aggregate.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<TestError>,
}

impl TestError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn aggregate(message: impl Into<String>, errors: Vec<TestError>) -> Self {
        Self {
            name: Some("AggregateError".to_string()),
            message: message.into(),
            errors,
            ..Default::default()
        }
    }

    pub fn is_aggregate(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// A node in a file's task tree, as sent by workers and returned by
/// [`StateManager::get_files`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub kind: TaskKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,

    #[serde(default)]
    pub meta: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Task>,
}

/// The root task of a file plus its owning project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileTask {
    pub project_name: String,
    pub filepath: PathBuf,
    #[serde(flatten)]
    pub task: Task,
}

/// One `(id, result, meta)` update streamed by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub id: TaskId,

    #[serde(default)]
    pub result: Option<TaskResult>,

    #[serde(default)]
    pub meta: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// Console output produced by user code inside a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserConsoleLog {
    pub content: String,
    pub stream: LogStream,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
}

/// Builds the stable id of a file task from its project and relative path.
pub fn file_task_id(project_name: &str, relative: &Path) -> TaskId {
    let mut hasher = Sha256::new();
    hasher.update(relative.to_string_lossy().as_bytes());
    hasher.update([0]);
    hasher.update(project_name.as_bytes());
    let digest = hasher.finalize();
    digest[..5].iter().map(|b| format!("{b:02x}")).collect()
}

/// Creates an empty file task for `path`.
pub fn create_file_task(project_name: &str, root: &Path, path: &Path) -> FileTask {
    let relative = path.strip_prefix(root).unwrap_or(path);
    FileTask {
        project_name: project_name.to_string(),
        filepath: path.to_path_buf(),
        task: Task {
            id: file_task_id(project_name, relative),
            name: relative.to_string_lossy().into_owned(),
            kind: TaskKind::File,
            result: None,
            meta: Map::new(),
            children: Vec::new(),
        },
    }
}

#[derive(Debug, Clone)]
struct TaskNode {
    name: String,
    kind: TaskKind,
    children: Vec<TaskId>,
    result: Option<TaskResult>,
    meta: Map<String, Value>,
}

#[derive(Debug, Clone)]
struct FileRecord {
    project_name: String,
    root: TaskId,
    logs: Vec<UserConsoleLog>,
}

/// Counts derived from the current state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TestCounts {
    pub files: usize,
    pub failed_files: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// The store itself. Not synchronized; see [`SharedState`].
#[derive(Debug, Default)]
pub struct StateManager {
    files_map: HashMap<PathBuf, Vec<FileRecord>>,
    tasks: HashMap<TaskId, TaskNode>,
    errors: Vec<TestError>,
    timeout_causes: BTreeSet<String>,
    orphan_logs: Vec<UserConsoleLog>,
}

impl StateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores collected file trees, replacing each project's previous record
    /// for the same path. Logs captured before collection are kept.
    pub fn collect_files(&mut self, files: Vec<FileTask>) {
        for file in files {
            let records = self.files_map.entry(file.filepath.clone()).or_default();
            let mut logs = Vec::new();
            let mut removed = Vec::new();
            records.retain(|record| {
                if record.project_name == file.project_name {
                    logs = record.logs.clone();
                    removed.push(record.root.clone());
                    false
                } else {
                    true
                }
            });
            records.push(FileRecord {
                project_name: file.project_name.clone(),
                root: file.task.id.clone(),
                logs,
            });
            for root in removed {
                self.remove_subtree(&root);
            }
            self.insert_subtree(file.task);
        }
    }

    fn insert_subtree(&mut self, task: Task) {
        let mut stack = vec![task];
        while let Some(task) = stack.pop() {
            let children = task.children.iter().map(|c| c.id.clone()).collect();
            self.tasks.insert(
                task.id,
                TaskNode {
                    name: task.name,
                    kind: task.kind,
                    children,
                    result: task.result,
                    meta: task.meta,
                },
            );
            stack.extend(task.children);
        }
    }

    fn remove_subtree(&mut self, root: &TaskId) {
        let mut stack = vec![root.clone()];
        while let Some(id) = stack.pop() {
            if let Some(node) = self.tasks.remove(&id) {
                stack.extend(node.children);
            }
        }
    }

    fn build_task(&self, id: &TaskId) -> Option<Task> {
        let node = self.tasks.get(id)?;
        Some(Task {
            id: id.clone(),
            name: node.name.clone(),
            kind: node.kind,
            result: node.result.clone(),
            meta: node.meta.clone(),
            children: node
                .children
                .iter()
                .filter_map(|child| self.build_task(child))
                .collect(),
        })
    }

    /// Merges streamed updates by task id. Unknown ids are ignored; later
    /// updates overwrite earlier ones.
    pub fn update_tasks(&mut self, updates: Vec<TaskUpdate>) {
        for update in updates {
            if let Some(node) = self.tasks.get_mut(&update.id) {
                node.result = update.result;
                node.meta = update.meta;
            }
        }
    }

    /// Returns the current result of a task.
    pub fn task_result(&self, id: &str) -> Option<&TaskResult> {
        self.tasks.get(id).and_then(|node| node.result.as_ref())
    }

    /// Records an unhandled error of category `kind`.
    ///
    /// Aggregates are unpacked into their constituents. A [`PENDING_CODE`]
    /// error marks its task as skipped instead of being recorded.
    pub fn catch_error(&mut self, error: TestError, kind: &str) {
        let mut queue = vec![error];
        while let Some(mut error) = queue.pop() {
            if error.is_aggregate() {
                queue.extend(error.errors.drain(..).rev());
                continue;
            }
            if error.code.as_deref() == Some(PENDING_CODE) {
                if let Some(node) = error.task_id.as_ref().and_then(|id| self.tasks.get_mut(id)) {
                    let result = node.result.get_or_insert_with(|| TaskResult::new(TaskState::Skip));
                    result.state = TaskState::Skip;
                }
                continue;
            }
            error.kind = Some(kind.to_string());
            self.errors.push(error);
        }
    }

    /// Replaces the records of `project_name` for `paths` with empty queued
    /// file tasks.
    pub fn clear_files(&mut self, project_name: &str, root: &Path, paths: &[PathBuf]) {
        let files = paths
            .iter()
            .map(|path| {
                let mut file = create_file_task(project_name, root, path);
                file.task.result = Some(TaskResult::new(TaskState::Queued));
                file
            })
            .collect();
        self.collect_files(files);
    }

    /// Removes every record for `path`, across all projects.
    pub fn delete_file(&mut self, path: &Path) -> bool {
        let Some(records) = self.files_map.remove(path) else {
            return false;
        };
        for record in records {
            self.remove_subtree(&record.root);
        }
        true
    }

    /// Marks files as cancelled: their records are replaced by skipped
    /// file tasks.
    pub fn cancel_files(&mut self, project_name: &str, root: &Path, paths: &[PathBuf]) {
        let files = paths
            .iter()
            .map(|path| {
                let mut file = create_file_task(project_name, root, path);
                file.task.result = Some(TaskResult::new(TaskState::Skip));
                file
            })
            .collect();
        self.collect_files(files);
    }

    /// Tags files with an infrastructure error. Files that were already
    /// collected keep their tree; their root result becomes a failure.
    pub fn fail_files(&mut self, project_name: &str, root: &Path, paths: &[PathBuf], error: &TestError) {
        for path in paths {
            let existing = self
                .files_map
                .get(path)
                .and_then(|records| records.iter().find(|r| r.project_name == project_name))
                .map(|record| record.root.clone());

            let root_id = match existing {
                Some(id) => id,
                None => {
                    let file = create_file_task(project_name, root, path);
                    let id = file.task.id.clone();
                    self.collect_files(vec![file]);
                    id
                }
            };
            if let Some(node) = self.tasks.get_mut(&root_id) {
                let result = node.result.get_or_insert_with(|| TaskResult::new(TaskState::Fail));
                result.state = TaskState::Fail;
                result.errors.push(error.clone());
            }
        }
    }

    /// Attaches a console log to the file owning its task.
    pub fn add_user_log(&mut self, log: UserConsoleLog) {
        let owner = log
            .task_id
            .as_ref()
            .and_then(|id| self.owning_file(id))
            .and_then(|(path, project)| {
                self.files_map
                    .get_mut(&path)?
                    .iter_mut()
                    .find(|record| record.project_name == project)
            });
        match owner {
            Some(record) => record.logs.push(log),
            None => self.orphan_logs.push(log),
        }
    }

    fn owning_file(&self, id: &TaskId) -> Option<(PathBuf, String)> {
        self.files_map.iter().find_map(|(path, records)| {
            records
                .iter()
                .find(|record| self.subtree_contains(&record.root, id))
                .map(|record| (path.clone(), record.project_name.clone()))
        })
    }

    fn subtree_contains(&self, root: &TaskId, id: &TaskId) -> bool {
        let mut stack = vec![root];
        while let Some(current) = stack.pop() {
            if current == id {
                return true;
            }
            if let Some(node) = self.tasks.get(current) {
                stack.extend(node.children.iter());
            }
        }
        false
    }

    /// Returns file trees, all of them or only those for `paths`.
    pub fn get_files(&self, paths: Option<&[PathBuf]>) -> Vec<FileTask> {
        let mut files = Vec::new();
        let mut collect = |path: &PathBuf, records: &Vec<FileRecord>| {
            for record in records {
                if let Some(task) = self.build_task(&record.root) {
                    files.push(FileTask {
                        project_name: record.project_name.clone(),
                        filepath: path.clone(),
                        task,
                    });
                }
            }
        };
        match paths {
            Some(paths) => {
                for path in paths {
                    if let Some(records) = self.files_map.get(path) {
                        collect(path, records);
                    }
                }
            }
            None => {
                let mut keys: Vec<_> = self.files_map.keys().collect();
                keys.sort();
                for path in keys {
                    collect(path, &self.files_map[path]);
                }
            }
        }
        files
    }

    /// Paths of every file with at least one record.
    pub fn get_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<_> = self.files_map.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Number of records, counting one per `(project, path)`.
    pub fn file_count(&self) -> usize {
        self.files_map.values().map(Vec::len).sum()
    }

    /// Whether `(project, path)` has a record.
    pub fn has_file(&self, project_name: &str, path: &Path) -> bool {
        self.files_map
            .get(path)
            .is_some_and(|records| records.iter().any(|r| r.project_name == project_name))
    }

    /// `(project, path)` of every file whose tree contains a failure.
    pub fn get_failed_files(&self) -> Vec<(String, PathBuf)> {
        let mut failed = Vec::new();
        for (path, records) in &self.files_map {
            for record in records {
                if self.subtree_failed(&record.root) {
                    failed.push((record.project_name.clone(), path.clone()));
                }
            }
        }
        failed.sort();
        failed
    }

    /// Paths of files whose tree contains a failure.
    pub fn get_failed_filepaths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<_> = self.get_failed_files().into_iter().map(|(_, path)| path).collect();
        paths.sort();
        paths.dedup();
        paths
    }

    fn subtree_failed(&self, root: &TaskId) -> bool {
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let Some(node) = self.tasks.get(id) else {
                continue;
            };
            if node.result.as_ref().is_some_and(|r| r.state == TaskState::Fail) {
                return true;
            }
            stack.extend(node.children.iter());
        }
        false
    }

    /// Number of failed test tasks across every file.
    pub fn get_count_of_failed_tests(&self) -> usize {
        self.tasks
            .values()
            .filter(|node| node.kind == TaskKind::Test)
            .filter(|node| node.result.as_ref().is_some_and(|r| r.state == TaskState::Fail))
            .count()
    }

    pub fn get_unhandled_errors(&self) -> &[TestError] {
        &self.errors
    }

    pub fn clear_errors(&mut self) {
        self.errors.clear();
    }

    /// Records why a worker could not be terminated in time.
    pub fn add_timeout_cause(&mut self, cause: impl Into<String>) {
        self.timeout_causes.insert(cause.into());
    }

    pub fn get_timeout_causes(&self) -> Vec<String> {
        self.timeout_causes.iter().cloned().collect()
    }

    /// Logs of every file, plus logs that could not be attributed.
    pub fn get_logs(&self) -> Vec<UserConsoleLog> {
        let mut logs: Vec<_> = self
            .files_map
            .values()
            .flat_map(|records| records.iter())
            .flat_map(|record| record.logs.iter().cloned())
            .collect();
        logs.extend(self.orphan_logs.iter().cloned());
        logs
    }

    /// Pass, fail and skip counts over tests and files.
    pub fn counts(&self) -> TestCounts {
        let mut counts = TestCounts {
            files: self.file_count(),
            failed_files: self.get_failed_files().len(),
            ..Default::default()
        };
        for node in self.tasks.values().filter(|n| n.kind == TaskKind::Test) {
            match node.result.as_ref().map(|r| r.state) {
                Some(TaskState::Pass) => counts.passed += 1,
                Some(TaskState::Fail) => counts.failed += 1,
                Some(TaskState::Skip | TaskState::Todo) => counts.skipped += 1,
                _ => {}
            }
        }
        counts
    }

    /// Duration and failure flag per `(project, path)`, for the results cache.
    pub fn file_results(&self) -> Vec<(String, PathBuf, f64, bool)> {
        let mut results = Vec::new();
        for (path, records) in &self.files_map {
            for record in records {
                let duration = self
                    .tasks
                    .get(&record.root)
                    .and_then(|node| node.result.as_ref())
                    .and_then(|r| r.duration_ms)
                    .unwrap_or_default();
                results.push((
                    record.project_name.clone(),
                    path.clone(),
                    duration,
                    self.subtree_failed(&record.root),
                ));
            }
        }
        results
    }

    /// Ids of every known task. Used to check that ids are unique.
    pub fn task_ids(&self) -> HashSet<TaskId> {
        self.tasks.keys().cloned().collect()
    }
}

/// A cloneable handle to a [`StateManager`] shared by the orchestrator,
/// pool drivers and RPC handlers.
///
/// The lock is never held across an await point.
#[derive(Debug, Clone, Default)]
pub struct SharedState {
    inner: Arc<Mutex<StateManager>>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the state. A poisoned lock is recovered, the state stays
    /// usable after a panicking reporter.
    pub fn lock(&self) -> MutexGuard<'_, StateManager> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` with the state locked.
    pub fn with<R>(&self, f: impl FnOnce(&mut StateManager) -> R) -> R {
        f(&mut self.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_task(id: &str, state: Option<TaskState>) -> Task {
        Task {
            id: id.to_string(),
            name: id.to_string(),
            kind: TaskKind::Test,
            result: state.map(TaskResult::new),
            meta: Map::new(),
            children: Vec::new(),
        }
    }

    fn file(project: &str, path: &str, children: Vec<Task>) -> FileTask {
        let mut file = create_file_task(project, Path::new("/work"), Path::new(path));
        file.task.children = children;
        file
    }

    fn update(id: &str, state: TaskState) -> TaskUpdate {
        TaskUpdate {
            id: id.to_string(),
            result: Some(TaskResult::new(state)),
            meta: Map::new(),
        }
    }

    #[test]
    fn test_file_task_id_is_stable() {
        let a = file_task_id("unit", Path::new("src/a.test.ts"));
        assert_eq!(a, file_task_id("unit", Path::new("src/a.test.ts")));
        assert_ne!(a, file_task_id("e2e", Path::new("src/a.test.ts")));
        assert_eq!(a.len(), 10);
    }

    #[test]
    fn test_later_update_wins() {
        let mut state = StateManager::new();
        state.collect_files(vec![file("a", "/work/a.test.ts", vec![test_task("t1", None)])]);

        state.update_tasks(vec![update("t1", TaskState::Fail)]);
        state.update_tasks(vec![update("t1", TaskState::Pass)]);
        assert_eq!(state.task_result("t1").unwrap().state, TaskState::Pass);

        state.update_tasks(vec![update("t1", TaskState::Pass), update("t1", TaskState::Fail)]);
        assert_eq!(state.task_result("t1").unwrap().state, TaskState::Fail);
    }

    #[test]
    fn test_update_never_creates_tasks() {
        let mut state = StateManager::new();
        state.update_tasks(vec![update("ghost", TaskState::Pass)]);
        assert!(state.task_result("ghost").is_none());
        assert!(state.task_ids().is_empty());
    }

    #[test]
    fn test_recollection_replaces_only_same_project() {
        let mut state = StateManager::new();
        state.collect_files(vec![
            file("a", "/work/x.test.ts", vec![test_task("a1", Some(TaskState::Fail))]),
            file("b", "/work/x.test.ts", vec![test_task("b1", Some(TaskState::Pass))]),
        ]);
        assert_eq!(state.file_count(), 2);

        state.collect_files(vec![file("a", "/work/x.test.ts", vec![test_task("a2", None)])]);
        assert_eq!(state.file_count(), 2);
        assert!(state.task_result("a1").is_none());
        assert!(!state.task_ids().contains("a1"));
        assert_eq!(state.task_result("b1").unwrap().state, TaskState::Pass);

        let files = state.get_files(None);
        let a = files.iter().find(|f| f.project_name == "a").unwrap();
        assert_eq!(a.task.children[0].id, "a2");
    }

    #[test]
    fn test_catch_error_unpacks_aggregates_and_pending() {
        let mut state = StateManager::new();
        state.collect_files(vec![file("a", "/work/a.test.ts", vec![test_task("t1", Some(TaskState::Run))])]);

        let pending = TestError {
            code: Some(PENDING_CODE.to_string()),
            task_id: Some("t1".to_string()),
            ..TestError::new("pending")
        };
        let nested = TestError::aggregate("inner", vec![TestError::new("two"), TestError::new("three")]);
        state.catch_error(
            TestError::aggregate("outer", vec![TestError::new("one"), nested, pending]),
            "Unhandled Error",
        );

        let messages: Vec<_> = state
            .get_unhandled_errors()
            .iter()
            .map(|e| e.message.as_str())
            .collect();
        assert_eq!(messages, vec!["one", "two", "three"]);
        assert!(state.get_unhandled_errors().iter().all(|e| !e.is_aggregate()));
        assert!(
            state
                .get_unhandled_errors()
                .iter()
                .all(|e| e.kind.as_deref() == Some("Unhandled Error"))
        );
        assert_eq!(state.task_result("t1").unwrap().state, TaskState::Skip);
    }

    #[test]
    fn test_failed_filepaths_and_counts() {
        let mut state = StateManager::new();
        state.collect_files(vec![
            file("a", "/work/a.test.ts", vec![test_task("a1", Some(TaskState::Fail)), test_task("a2", Some(TaskState::Pass))]),
            file("a", "/work/b.test.ts", vec![test_task("b1", Some(TaskState::Pass))]),
        ]);
        assert_eq!(state.get_failed_filepaths(), vec![PathBuf::from("/work/a.test.ts")]);
        assert_eq!(state.get_count_of_failed_tests(), 1);

        let counts = state.counts();
        assert_eq!(counts.files, 2);
        assert_eq!(counts.failed_files, 1);
        assert_eq!(counts.passed, 2);
        assert_eq!(counts.failed, 1);
    }

    #[test]
    fn test_clear_cancel_fail_and_delete() {
        let mut state = StateManager::new();
        let root = Path::new("/work");
        let paths = vec![PathBuf::from("/work/a.test.ts"), PathBuf::from("/work/b.test.ts")];

        state.clear_files("a", root, &paths);
        assert_eq!(state.file_count(), 2);
        let files = state.get_files(Some(&paths[..1]));
        assert_eq!(files[0].task.result.as_ref().unwrap().state, TaskState::Queued);

        state.cancel_files("a", root, &paths[..1]);
        let files = state.get_files(Some(&paths[..1]));
        assert_eq!(files[0].task.result.as_ref().unwrap().state, TaskState::Skip);
        assert!(state.get_failed_filepaths().is_empty());

        state.fail_files("a", root, &paths[1..], &TestError::new("worker exited"));
        assert_eq!(state.get_failed_filepaths(), vec![paths[1].clone()]);
        assert_eq!(state.file_count(), 2);

        assert!(state.delete_file(&paths[1]));
        assert!(!state.delete_file(&paths[1]));
        assert_eq!(state.file_count(), 1);
    }

    #[test]
    fn test_logs_follow_file_records() {
        let mut state = StateManager::new();
        let a = file("a", "/work/a.test.ts", Vec::new());
        let root_id = a.task.id.clone();
        state.collect_files(vec![a]);

        state.add_user_log(UserConsoleLog {
            content: "hello".to_string(),
            stream: LogStream::Stdout,
            task_id: Some(root_id),
        });
        state.add_user_log(UserConsoleLog {
            content: "stray".to_string(),
            stream: LogStream::Stderr,
            task_id: None,
        });

        // Re-collection keeps the logs of the previous record.
        state.collect_files(vec![file("a", "/work/a.test.ts", Vec::new())]);
        let logs: Vec<_> = state.get_logs().into_iter().map(|l| l.content).collect();
        assert_eq!(logs, vec!["hello", "stray"]);
    }

    #[test]
    fn test_shared_state_recovers_from_poison() {
        let shared = SharedState::new();
        let clone = shared.clone();
        let _ = std::thread::spawn(move || {
            let _guard = clone.lock();
            panic!("reporter panicked");
        })
        .join();
        shared.with(|state| state.add_timeout_cause("worker 1"));
        assert_eq!(shared.lock().get_timeout_causes(), vec!["worker 1".to_string()]);
    }
}
