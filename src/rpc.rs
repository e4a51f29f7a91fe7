//! Typed coordinator ↔ worker messaging.
//!
//! The boundary has three shapes of traffic:
//!
//! | Direction | Kind | Messages |
//! |-----------|------|----------|
//! | worker → coordinator | event | `collected`, `task_update`, `user_console_log`, `unhandled_error`, `module_imports`, `finished` |
//! | worker → coordinator | request | `get_files`, `get_paths`, `resolve_snapshot_path`, `read_test_file`, `save_snapshot_file` |
//! | coordinator → worker | event | `run`, `response`, `cancel` |
//!
//! Requests carry a numeric id that the coordinator echoes in its
//! `response`. Every message is a serde-tagged enum so the same types work
//! over an in-process channel and over JSON lines on a pipe.
//!
//! ```text
//!   coordinator                                worker
//!  ┌───────────┐   CoordinatorMessage::Run    ┌──────────────┐
//!  │  Channel  │ ───────────────────────────► │WorkerEndpoint│
//!  │           │ ◄─────────────────────────── │              │
//!  └───────────┘   WorkerMessage::*           └──────────────┘
//! ```
//!
//! [`duplex`] creates both ends over `tokio::sync::mpsc`. Process-backed
//! workers pump the worker end through stdio (see
//! [`crate::pool::worker`]).

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::PoolName;
use crate::environment::EnvironmentDescriptor;
use crate::orchestrator::cancel::CancelReason;
use crate::state::{FileTask, TaskUpdate, TestError, UserConsoleLog};

/// Errors on the RPC boundary.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The other end went away.
    #[error("rpc channel closed")]
    Closed,

    /// A response did not match the request kind.
    #[error("unexpected rpc response: {0}")]
    UnexpectedResponse(String),
}

pub type RpcResult<T> = std::result::Result<T, RpcError>;

/// Start-of-unit payload sent to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunPayload {
    pub pool: PoolName,

    /// Serialized project configuration.
    pub config: Value,

    /// Absolute paths of the files to run, in order.
    pub files: Vec<PathBuf>,

    /// Modules whose cached transform must be discarded before running.
    #[serde(default)]
    pub invalidated_module_ids: Vec<PathBuf>,

    pub environment: EnvironmentDescriptor,

    pub worker_id: u64,

    pub project_name: String,

    #[serde(default)]
    pub provided_context: HashMap<String, Value>,
}

/// Messages sent by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Collected {
        files: Vec<FileTask>,
    },
    TaskUpdate {
        packs: Vec<TaskUpdate>,
    },
    UserConsoleLog {
        log: UserConsoleLog,
    },
    UnhandledError {
        error: TestError,
        kind: String,
    },
    /// `importer` imports each of `imports`. Feeds the watch-mode graph.
    ModuleImports {
        importer: PathBuf,
        imports: Vec<PathBuf>,
    },
    Request {
        id: u64,
        request: WorkerRequest,
    },
    /// The current unit is done. `error` is set when the worker itself
    /// failed, as opposed to a test failing.
    Finished {
        #[serde(default)]
        memory_usage: Option<u64>,
        #[serde(default)]
        error: Option<TestError>,
    },
}

/// Requests a worker may make while running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum WorkerRequest {
    GetFiles,
    GetPaths,
    ResolveSnapshotPath { test_path: PathBuf },
    ReadTestFile { id: PathBuf },
    SaveSnapshotFile { id: PathBuf, content: String },
}

/// Replies to [`WorkerRequest`]s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerResponse {
    Files { files: Vec<FileTask> },
    Paths { paths: Vec<PathBuf> },
    SnapshotPath { path: PathBuf },
    TestFile { content: Option<String> },
    Saved,
    Error { message: String },
}

/// Messages sent by the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorMessage {
    Run(RunPayload),
    Response { id: u64, response: WorkerResponse },
    Cancel { reason: CancelReason },
}

/// Creates a connected pair of endpoints.
pub fn duplex() -> (Channel, WorkerEndpoint) {
    let (to_worker, from_coordinator) = mpsc::unbounded_channel();
    let (to_coordinator, from_worker) = mpsc::unbounded_channel();
    (
        Channel {
            tx: to_worker,
            rx: from_worker,
        },
        WorkerEndpoint {
            tx: to_coordinator,
            rx: from_coordinator,
            pending: VecDeque::new(),
            next_request_id: 0,
            cancelled: None,
        },
    )
}

/// Coordinator end of a worker connection.
#[derive(Debug)]
pub struct Channel {
    tx: mpsc::UnboundedSender<CoordinatorMessage>,
    rx: mpsc::UnboundedReceiver<WorkerMessage>,
}

impl Channel {
    pub fn send(&self, message: CoordinatorMessage) -> RpcResult<()> {
        self.tx.send(message).map_err(|_| RpcError::Closed)
    }

    /// Next message from the worker; `None` once the worker is gone.
    pub async fn recv(&mut self) -> Option<WorkerMessage> {
        self.rx.recv().await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Worker end of a connection.
///
/// [`request`](Self::request) waits for the matching response; anything
/// else that arrives meanwhile is queued for [`recv`](Self::recv). Cancel
/// notifications are also remembered so a worker can poll
/// [`cancel_requested`](Self::cancel_requested) between tests.
#[derive(Debug)]
pub struct WorkerEndpoint {
    tx: mpsc::UnboundedSender<WorkerMessage>,
    rx: mpsc::UnboundedReceiver<CoordinatorMessage>,
    pending: VecDeque<CoordinatorMessage>,
    next_request_id: u64,
    cancelled: Option<CancelReason>,
}

impl WorkerEndpoint {
    pub fn send(&self, message: WorkerMessage) -> RpcResult<()> {
        self.tx.send(message).map_err(|_| RpcError::Closed)
    }

    /// Next message from the coordinator; `None` once it hung up.
    pub async fn recv(&mut self) -> Option<CoordinatorMessage> {
        let message = match self.pending.pop_front() {
            Some(message) => Some(message),
            None => self.rx.recv().await,
        };
        if let Some(CoordinatorMessage::Cancel { reason }) = &message {
            self.cancelled = Some(reason.clone());
        }
        message
    }

    /// Sends a request and waits for its response.
    pub async fn request(&mut self, request: WorkerRequest) -> RpcResult<WorkerResponse> {
        self.next_request_id += 1;
        let id = self.next_request_id;
        self.send(WorkerMessage::Request { id, request })?;

        loop {
            match self.rx.recv().await {
                Some(CoordinatorMessage::Response { id: got, response }) if got == id => {
                    return Ok(response);
                }
                Some(CoordinatorMessage::Cancel { reason }) => {
                    self.cancelled = Some(reason.clone());
                    self.pending.push_back(CoordinatorMessage::Cancel { reason });
                }
                Some(other) => self.pending.push_back(other),
                None => return Err(RpcError::Closed),
            }
        }
    }

    /// Whether a cancel notification arrived, without waiting.
    pub fn cancel_requested(&mut self) -> Option<CancelReason> {
        while let Ok(message) = self.rx.try_recv() {
            if let CoordinatorMessage::Cancel { reason } = &message {
                self.cancelled = Some(reason.clone());
            }
            self.pending.push_back(message);
        }
        self.cancelled.clone()
    }

    /// Forgets a previous cancel notification. Called when a new unit starts.
    pub fn reset_cancel(&mut self) {
        self.cancelled = None;
        self.pending
            .retain(|message| !matches!(message, CoordinatorMessage::Cancel { .. }));
    }

    pub fn collected(&self, files: Vec<FileTask>) -> RpcResult<()> {
        self.send(WorkerMessage::Collected { files })
    }

    pub fn task_update(&self, packs: Vec<TaskUpdate>) -> RpcResult<()> {
        self.send(WorkerMessage::TaskUpdate { packs })
    }

    pub fn finished(&self, memory_usage: Option<u64>, error: Option<TestError>) -> RpcResult<()> {
        self.send(WorkerMessage::Finished { memory_usage, error })
    }

    /// Content of a test file, `None` if the coordinator refused to serve it.
    pub async fn read_test_file(&mut self, id: PathBuf) -> RpcResult<Option<String>> {
        match self.request(WorkerRequest::ReadTestFile { id }).await? {
            WorkerResponse::TestFile { content } => Ok(content),
            other => Err(RpcError::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    pub async fn resolve_snapshot_path(&mut self, test_path: PathBuf) -> RpcResult<PathBuf> {
        match self.request(WorkerRequest::ResolveSnapshotPath { test_path }).await? {
            WorkerResponse::SnapshotPath { path } => Ok(path),
            other => Err(RpcError::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    /// Splits the endpoint into its raw halves. Used by transports that
    /// pump messages through another medium.
    pub(crate) fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedSender<WorkerMessage>,
        mpsc::UnboundedReceiver<CoordinatorMessage>,
    ) {
        (self.tx, self.rx)
    }
}

/// Coordinator-side handling of worker traffic for one project.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    /// Files collected by a worker running a unit of `project`.
    async fn on_collected(&self, project: &str, files: Vec<FileTask>);

    async fn on_task_update(&self, packs: Vec<TaskUpdate>);

    async fn on_user_console_log(&self, log: UserConsoleLog);

    async fn on_unhandled_error(&self, error: TestError, kind: String);

    async fn on_module_imports(&self, project: &str, importer: PathBuf, imports: Vec<PathBuf>);

    async fn handle_request(&self, project: &str, request: WorkerRequest) -> WorkerResponse;
}

/// Routes one event to `handler`. Requests are answered through `channel`.
pub async fn dispatch(
    handler: &dyn RpcHandler,
    channel: &Channel,
    project: &str,
    message: WorkerMessage,
) -> RpcResult<()> {
    match message {
        WorkerMessage::Collected { files } => handler.on_collected(project, files).await,
        WorkerMessage::TaskUpdate { packs } => handler.on_task_update(packs).await,
        WorkerMessage::UserConsoleLog { log } => handler.on_user_console_log(log).await,
        WorkerMessage::UnhandledError { error, kind } => {
            handler.on_unhandled_error(error, kind).await
        }
        WorkerMessage::ModuleImports { importer, imports } => {
            handler.on_module_imports(project, importer, imports).await
        }
        WorkerMessage::Request { id, request } => {
            let response = handler.handle_request(project, request).await;
            channel.send(CoordinatorMessage::Response { id, response })?;
        }
        WorkerMessage::Finished { .. } => {}
    }
    Ok(())
}
