//! In-process fakes shared by pool and orchestrator tests.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::RunContext;
use super::session::Unit;
use super::worker::WorkerRuntime;
use crate::config::{PoolName, ProjectConfig};
use crate::environment::{ClassifiedSpec, EnvironmentDescriptor};
use crate::graph::ProjectGraphs;
use crate::orchestrator::cancel::RunControl;
use crate::orchestrator::handler::RunHandler;
use crate::project::{Project, Spec};
use crate::report::NullReporter;
use crate::rpc::{RunPayload, WorkerEndpoint};
use crate::state::{
    SharedState, Task, TaskKind, TaskResult, TaskState, TaskUpdate, TestError, create_file_task,
};

/// What the fake runtime saw for one unit.
#[derive(Debug, Clone)]
pub struct RecordedUnit {
    pub worker_id: u64,
    pub environment: String,
    pub files: Vec<PathBuf>,
}

/// A [`WorkerRuntime`] that "runs" every file as one passing test.
///
/// Files listed in `fail` make the worker report an infrastructure error,
/// files listed in `failing_tests` get a failed test. With
/// `wait_for_cancel` every file blocks until the coordinator cancels, then
/// is reported as skipped.
pub struct FakeRuntime {
    pub root: PathBuf,
    pub delay: Duration,
    pub memory: Option<u64>,
    pub fail: Vec<PathBuf>,
    pub failing_tests: Vec<PathBuf>,
    pub wait_for_cancel: bool,
    pub(crate) in_flight: AtomicUsize,
    pub(crate) peak: AtomicUsize,
    pub(crate) units: Mutex<Vec<RecordedUnit>>,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/work"),
            delay: Duration::ZERO,
            memory: None,
            fail: Vec::new(),
            failing_tests: Vec::new(),
            wait_for_cancel: false,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            units: Mutex::new(Vec::new()),
        }
    }
}

impl FakeRuntime {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn failing(files: &[&str]) -> Self {
        Self {
            fail: files.iter().map(PathBuf::from).collect(),
            ..Default::default()
        }
    }

    pub fn rooted(mut self, root: &Path) -> Self {
        self.root = root.to_path_buf();
        self
    }

    /// Highest number of units running at the same time.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn units(&self) -> Vec<RecordedUnit> {
        self.units.lock().unwrap().clone()
    }

    pub fn test_id(file_id: &str) -> String {
        format!("{file_id}_0")
    }

    async fn run_files(&self, payload: &RunPayload, endpoint: &mut WorkerEndpoint) -> Result<(), TestError> {
        if let Some(bad) = payload.files.iter().find(|f| self.fail.contains(f)) {
            return Err(TestError::new(format!("worker crashed on {}", bad.display())));
        }

        let files: Vec<_> = payload
            .files
            .iter()
            .map(|path| {
                let mut file = create_file_task(&payload.project_name, &self.root, path);
                file.task.children.push(Task {
                    id: Self::test_id(&file.task.id),
                    name: "works".to_string(),
                    kind: TaskKind::Test,
                    result: None,
                    meta: Default::default(),
                    children: Vec::new(),
                });
                file
            })
            .collect();
        endpoint.collected(files.clone()).map_err(|e| TestError::new(e.to_string()))?;

        for file in files {
            if self.wait_for_cancel {
                while endpoint.cancel_requested().is_none() {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            } else if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            let state = if endpoint.cancel_requested().is_some() {
                TaskState::Skip
            } else if self.failing_tests.contains(&file.filepath) {
                TaskState::Fail
            } else {
                TaskState::Pass
            };
            let mut result = TaskResult::new(state);
            result.duration_ms = Some(1.0);
            let packs = vec![
                TaskUpdate {
                    id: Self::test_id(&file.task.id),
                    result: Some(result.clone()),
                    meta: Default::default(),
                },
                TaskUpdate {
                    id: file.task.id.clone(),
                    result: Some(result),
                    meta: Default::default(),
                },
            ];
            endpoint.task_update(packs).map_err(|e| TestError::new(e.to_string()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl WorkerRuntime for FakeRuntime {
    async fn run(&self, payload: RunPayload, endpoint: &mut WorkerEndpoint) -> Result<(), TestError> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        self.units.lock().unwrap().push(RecordedUnit {
            worker_id: payload.worker_id,
            environment: payload.environment.name.clone(),
            files: payload.files.clone(),
        });

        let result = self.run_files(&payload, endpoint).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn memory_usage(&self) -> Option<u64> {
        self.memory
    }
}

pub fn project(name: &str) -> Arc<Project> {
    project_at(name, Path::new("/work"), ProjectConfig::default())
}

pub fn project_at(name: &str, root: &Path, config: ProjectConfig) -> Arc<Project> {
    let config = ProjectConfig {
        name: name.to_string(),
        ..config
    };
    Arc::new(Project::new(config, root, &PoolName::Threads).unwrap())
}

/// A run context whose handler writes into a fresh state store.
pub fn context(project: &Arc<Project>) -> RunContext {
    let state = SharedState::new();
    let control = RunControl::new();
    let cancel = control.begin();
    let handler = RunHandler::new(
        state.clone(),
        ProjectGraphs::new(),
        vec![Arc::clone(project)],
        Arc::new(NullReporter),
        control,
        cancel.clone(),
        0,
    );
    RunContext {
        state,
        handler: Arc::new(handler),
        cancel,
        invalidated: Vec::new(),
        provided_context: Default::default(),
    }
}

pub fn descriptor(environment: &str) -> EnvironmentDescriptor {
    EnvironmentDescriptor {
        name: environment.to_string(),
        transform_mode: None,
        options: None,
    }
}

pub fn unit(project: &Arc<Project>, files: &[&str], environment: &str) -> Unit {
    Unit {
        pool: PoolName::Threads,
        project: Arc::clone(project),
        files: files.iter().map(|f| project.root().join(f)).collect(),
        environment: descriptor(environment),
    }
}

pub fn classified(project: &Arc<Project>, file: &str, environment: &str) -> ClassifiedSpec {
    ClassifiedSpec {
        spec: Spec::new(Arc::clone(project), project.root().join(file)),
        environment: descriptor(environment),
    }
}
