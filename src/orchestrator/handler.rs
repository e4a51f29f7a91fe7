//! Coordinator side of the worker RPC boundary.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::cancel::{CancelReason, CancelSignal, RunControl};
use crate::graph::ProjectGraphs;
use crate::project::{Project, normalize};
use crate::report::Reporter;
use crate::rpc::{RpcHandler, WorkerRequest, WorkerResponse};
use crate::state::{FileTask, SharedState, TaskUpdate, TestError, UserConsoleLog};

/// Applies worker traffic of one run to the state store, the import graphs
/// and the reporter.
///
/// Workers never touch the state directly; everything they report goes
/// through here. When `bail` is non-zero the run is cancelled through
/// `control` with [`CancelReason::TestFailure`] once that many tests failed.
pub struct RunHandler {
    state: SharedState,
    graphs: ProjectGraphs,
    projects: Vec<Arc<Project>>,
    reporter: Arc<dyn Reporter>,
    control: RunControl,
    cancel: CancelSignal,
    bail: usize,
}

impl RunHandler {
    /// `cancel` is the signal `control` armed for this run.
    pub fn new(
        state: SharedState,
        graphs: ProjectGraphs,
        projects: Vec<Arc<Project>>,
        reporter: Arc<dyn Reporter>,
        control: RunControl,
        cancel: CancelSignal,
        bail: usize,
    ) -> Self {
        Self {
            state,
            graphs,
            projects,
            reporter,
            control,
            cancel,
            bail,
        }
    }

    fn project(&self, name: &str) -> Option<&Arc<Project>> {
        self.projects.iter().find(|p| p.name() == name)
    }

    async fn check_bail(&self) {
        if self.bail == 0 || self.cancel.is_cancelled() {
            return;
        }
        let failed = self.state.lock().get_count_of_failed_tests();
        if failed >= self.bail && self.control.cancel(CancelReason::TestFailure) {
            info!("Bailing out after {} failed test(s)", failed);
            self.reporter.on_cancel(&CancelReason::TestFailure).await;
        }
    }

    async fn read_test_file(&self, project: &str, id: &Path) -> Option<String> {
        let project = self.project(project)?;
        let id = normalize(id);
        let known = project.test_files().contains(&id) || self.state.lock().has_file(project.name(), &id);
        if !known {
            debug!("Refusing to read {}: not a test file", id.display());
            return None;
        }
        match tokio::fs::read_to_string(&id).await {
            Ok(content) => Some(content),
            Err(e) => {
                warn!("Failed to read test file {}: {}", id.display(), e);
                None
            }
        }
    }

    async fn save_snapshot(&self, project: &str, id: &Path, content: &str) -> WorkerResponse {
        let Some(project) = self.project(project) else {
            return WorkerResponse::Error {
                message: format!("unknown project {:?}", project),
            };
        };
        let path = normalize(&project.root().join(id));
        if !path.starts_with(project.root()) {
            return WorkerResponse::Error {
                message: format!(
                    "snapshot path {} is outside of project root {}",
                    path.display(),
                    project.root().display()
                ),
            };
        }
        if let Some(parent) = path.parent()
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            return WorkerResponse::Error {
                message: format!("failed to create {}: {}", parent.display(), e),
            };
        }
        match tokio::fs::write(&path, content).await {
            Ok(()) => WorkerResponse::Saved,
            Err(e) => WorkerResponse::Error {
                message: format!("failed to write {}: {}", path.display(), e),
            },
        }
    }
}

/// Maps `dir/file.ext` to `dir/__snapshots__/file.ext.snap`.
pub fn resolve_snapshot_path(test_path: &Path) -> PathBuf {
    let file_name = test_path
        .file_name()
        .map(|name| format!("{}.snap", name.to_string_lossy()))
        .unwrap_or_else(|| "snapshot.snap".to_string());
    test_path
        .parent()
        .unwrap_or_else(|| Path::new(""))
        .join("__snapshots__")
        .join(file_name)
}

#[async_trait]
impl RpcHandler for RunHandler {
    async fn on_collected(&self, project: &str, mut files: Vec<FileTask>) {
        for file in &mut files {
            if file.project_name != project {
                warn!(
                    "Worker of project {:?} reported {} as {:?}",
                    project,
                    file.filepath.display(),
                    file.project_name
                );
                file.project_name = project.to_string();
            }
        }
        if let Some(project) = self.project(project) {
            for file in &files {
                project.mark_test_file(&file.filepath);
            }
        }
        self.state.with(|state| state.collect_files(files.clone()));
        self.reporter.on_collected(&files).await;
    }

    async fn on_task_update(&self, packs: Vec<TaskUpdate>) {
        self.state.with(|state| state.update_tasks(packs.clone()));
        self.reporter.on_task_update(&packs).await;
        self.check_bail().await;
    }

    async fn on_user_console_log(&self, log: UserConsoleLog) {
        self.state.with(|state| state.add_user_log(log.clone()));
        self.reporter.on_user_console_log(&log).await;
    }

    async fn on_unhandled_error(&self, error: TestError, kind: String) {
        debug!("Unhandled {} from worker: {}", kind, error.message);
        self.state.with(|state| state.catch_error(error, &kind));
    }

    async fn on_module_imports(&self, project: &str, importer: PathBuf, imports: Vec<PathBuf>) {
        self.graphs.record_imports(project, &importer, &imports);
    }

    async fn handle_request(&self, project: &str, request: WorkerRequest) -> WorkerResponse {
        match request {
            WorkerRequest::GetFiles => WorkerResponse::Files {
                files: self.state.lock().get_files(None),
            },
            WorkerRequest::GetPaths => WorkerResponse::Paths {
                paths: self.state.lock().get_paths(),
            },
            WorkerRequest::ResolveSnapshotPath { test_path } => WorkerResponse::SnapshotPath {
                path: resolve_snapshot_path(&test_path),
            },
            WorkerRequest::ReadTestFile { id } => WorkerResponse::TestFile {
                content: self.read_test_file(project, &id).await,
            },
            WorkerRequest::SaveSnapshotFile { id, content } => {
                self.save_snapshot(project, &id, &content).await
            }
        }
    }
}
