//! Worker transports.
//!
//! A [`Worker`] is one live execution context: a child process or an
//! in-process thread. The coordinator only ever talks to it through an
//! [`rpc::Channel`](crate::rpc::Channel), so pools and sessions do not care
//! which transport is underneath.
//!
//! | Provider | Pools | Transport | Memory |
//! |----------|-------|-----------|--------|
//! | [`ProcessWorkerProvider`] | forks, vm-forks, browser, typecheck | JSON lines over stdio | RSS via `sysinfo` |
//! | [`ThreadWorkerProvider`] | threads, vm-threads | `tokio::sync::mpsc` | reported by the runtime |
//!
//! # Process protocol
//!
//! The worker command is spawned with piped stdio. Every line written to
//! its stdin is a JSON [`CoordinatorMessage`]; every line it prints on stdout
//! that parses as a [`WorkerMessage`] is protocol traffic. Any other stdout
//! line, and every stderr line, is forwarded as user console output.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{PoolError, PoolResult};
use crate::rpc::{self, Channel, CoordinatorMessage, RunPayload, WorkerEndpoint, WorkerMessage};
use crate::state::{LogStream, TestError, UserConsoleLog};

/// An in-process test runtime driven by the thread transport.
///
/// `run` executes one unit of work. It reports collection and results
/// through `endpoint` and may poll
/// [`WorkerEndpoint::cancel_requested`] between tests. Returning an error
/// marks the unit as an infrastructure failure; test failures are reported
/// as task updates instead.
#[async_trait]
pub trait WorkerRuntime: Send + Sync {
    async fn run(&self, payload: RunPayload, endpoint: &mut WorkerEndpoint) -> Result<(), TestError>;

    /// Memory currently held by this runtime, in bytes.
    fn memory_usage(&self) -> Option<u64> {
        None
    }
}

enum WorkerHandle {
    Process {
        child: Child,
        pumps: Vec<JoinHandle<()>>,
    },
    Thread(JoinHandle<()>),
}

/// One live worker.
pub struct Worker {
    id: u64,
    channel: Channel,
    handle: WorkerHandle,
    units: usize,
    memory_usage: Option<u64>,
}

impl Worker {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn send(&self, message: CoordinatorMessage) -> rpc::RpcResult<()> {
        self.channel.send(message)
    }

    pub async fn recv(&mut self) -> Option<WorkerMessage> {
        self.channel.recv().await
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Number of units this worker completed.
    pub fn units(&self) -> usize {
        self.units
    }

    /// Records the end of a unit and the memory reported with it.
    pub fn finish_unit(&mut self, memory_usage: Option<u64>) {
        self.units += 1;
        self.memory_usage = memory_usage.or_else(|| self.sample_memory());
    }

    /// Last known memory usage in bytes.
    pub fn memory_usage(&self) -> Option<u64> {
        self.memory_usage
    }

    fn sample_memory(&self) -> Option<u64> {
        match &self.handle {
            WorkerHandle::Process { child, .. } => child.id().and_then(process_memory),
            WorkerHandle::Thread(_) => None,
        }
    }

    /// Stops the worker and waits for it to exit.
    pub async fn terminate(self) -> PoolResult<()> {
        let Worker { id, channel, handle, .. } = self;
        // Closing the channel ends the worker's receive loop.
        drop(channel);
        match handle {
            WorkerHandle::Process { mut child, pumps } => {
                if let Err(e) = child.kill().await {
                    debug!("Worker {} already exited: {}", id, e);
                }
                for pump in pumps {
                    pump.abort();
                }
                Ok(())
            }
            WorkerHandle::Thread(handle) => handle
                .await
                .map_err(|e| PoolError::Spawn(format!("worker thread {} panicked: {}", id, e))),
        }
    }
}

/// Factory for workers of one pool.
#[async_trait]
pub trait WorkerProvider: Send + Sync {
    async fn spawn(&self, id: u64) -> PoolResult<Worker>;
}

/// Spawns workers as child processes speaking JSON lines over stdio.
///
/// # Example
///
/// ```no_run
/// use vigil::pool::worker::{ProcessWorkerProvider, WorkerProvider};
/// use std::collections::HashMap;
///
/// # async fn example() -> anyhow::Result<()> {
/// let provider = ProcessWorkerProvider::new(
///     "node ./vigil-worker.mjs --pool forks",
///     HashMap::new(),
///     std::env::current_dir()?,
/// )?;
/// let worker = provider.spawn(1).await?;
/// worker.terminate().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ProcessWorkerProvider {
    program: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    working_dir: PathBuf,
    session_id: String,
}

impl ProcessWorkerProvider {
    /// Creates a provider from a shell-style command line.
    pub fn new(command: &str, env: HashMap<String, String>, working_dir: PathBuf) -> PoolResult<Self> {
        let mut parts = shell_words::split(command)
            .map_err(|e| PoolError::Spawn(format!("invalid worker command {:?}: {}", command, e)))?
            .into_iter();
        let program = parts
            .next()
            .ok_or_else(|| PoolError::Spawn("worker command is empty".to_string()))?;
        Ok(Self {
            program,
            args: parts.collect(),
            env,
            working_dir,
            session_id: format!("vigil-{}", uuid::Uuid::new_v4()),
        })
    }

    /// Id shared by every worker this provider spawns, exported to workers
    /// as `VIGIL_SESSION_ID`.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

enum OutputLine {
    Stdout(String),
    Stderr(String),
}

#[async_trait]
impl WorkerProvider for ProcessWorkerProvider {
    async fn spawn(&self, id: u64) -> PoolResult<Worker> {
        let mut process = tokio::process::Command::new(&self.program);
        process.args(&self.args);
        process.current_dir(&self.working_dir);
        process.env("VIGIL_WORKER_ID", id.to_string());
        process.env("VIGIL_SESSION_ID", &self.session_id);
        for (key, value) in &self.env {
            process.env(key, value);
        }
        process.stdin(Stdio::piped());
        process.stdout(Stdio::piped());
        process.stderr(Stdio::piped());
        process.kill_on_drop(true);

        let mut child = process
            .spawn()
            .map_err(|e| PoolError::Spawn(format!("{}: {}", self.program, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PoolError::Spawn("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PoolError::Spawn("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| PoolError::Spawn("stderr not captured".to_string()))?;

        let (channel, endpoint) = rpc::duplex();
        let (to_coordinator, from_coordinator) = endpoint.into_parts();

        let writer = tokio::spawn(write_messages(id, stdin, from_coordinator));

        let stdout_stream = tokio_stream::wrappers::LinesStream::new(BufReader::new(stdout).lines())
            .map(|line: Result<String, std::io::Error>| OutputLine::Stdout(line.unwrap_or_default()));
        let stderr_stream = tokio_stream::wrappers::LinesStream::new(BufReader::new(stderr).lines())
            .map(|line: Result<String, std::io::Error>| OutputLine::Stderr(line.unwrap_or_default()));
        let combined = stream::select(stdout_stream, stderr_stream);
        let pid = child.id();
        let reader = tokio::spawn(read_messages(id, pid, combined, to_coordinator));

        debug!("Spawned worker {} ({} {:?})", id, self.program, self.args);

        Ok(Worker {
            id,
            channel,
            handle: WorkerHandle::Process {
                child,
                pumps: vec![writer, reader],
            },
            units: 0,
            memory_usage: None,
        })
    }
}

async fn write_messages(
    id: u64,
    mut stdin: tokio::process::ChildStdin,
    mut messages: mpsc::UnboundedReceiver<CoordinatorMessage>,
) {
    while let Some(message) = messages.recv().await {
        let mut line = match serde_json::to_string(&message) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to serialize message for worker {}: {}", id, e);
                continue;
            }
        };
        line.push('\n');
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            debug!("Worker {} stdin closed: {}", id, e);
            break;
        }
        if let Err(e) = stdin.flush().await {
            debug!("Worker {} stdin closed: {}", id, e);
            break;
        }
    }
}

async fn read_messages<S>(id: u64, pid: Option<u32>, mut lines: S, tx: mpsc::UnboundedSender<WorkerMessage>)
where
    S: futures::Stream<Item = OutputLine> + Unpin,
{
    while let Some(line) = lines.next().await {
        let message = match line {
            OutputLine::Stdout(text) => match serde_json::from_str::<WorkerMessage>(&text) {
                Ok(WorkerMessage::Finished { memory_usage: None, error }) => WorkerMessage::Finished {
                    memory_usage: pid.and_then(process_memory),
                    error,
                },
                Ok(message) => message,
                Err(_) => console_log(text, LogStream::Stdout),
            },
            OutputLine::Stderr(text) => console_log(text, LogStream::Stderr),
        };
        if tx.send(message).is_err() {
            break;
        }
    }
    debug!("Worker {} output closed", id);
}

fn console_log(content: String, stream: LogStream) -> WorkerMessage {
    WorkerMessage::UserConsoleLog {
        log: UserConsoleLog {
            content,
            stream,
            task_id: None,
        },
    }
}

/// Resident memory of a process in bytes.
pub fn process_memory(pid: u32) -> Option<u64> {
    let mut system = sysinfo::System::new();
    let pid = sysinfo::Pid::from_u32(pid);
    system.refresh_process(pid);
    system.process(pid).map(|process| process.memory())
}

/// Total memory of the machine in bytes.
pub fn total_memory() -> u64 {
    let mut system = sysinfo::System::new();
    system.refresh_memory();
    system.total_memory()
}

/// Runs a [`WorkerRuntime`] on a dedicated blocking thread.
#[derive(Clone)]
pub struct ThreadWorkerProvider {
    runtime: Arc<dyn WorkerRuntime>,
}

impl ThreadWorkerProvider {
    pub fn new(runtime: Arc<dyn WorkerRuntime>) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl WorkerProvider for ThreadWorkerProvider {
    async fn spawn(&self, id: u64) -> PoolResult<Worker> {
        let (channel, endpoint) = rpc::duplex();
        let runtime = Arc::clone(&self.runtime);
        let handle = tokio::runtime::Handle::current();
        let join = tokio::task::spawn_blocking(move || handle.block_on(serve(runtime, endpoint)));

        Ok(Worker {
            id,
            channel,
            handle: WorkerHandle::Thread(join),
            units: 0,
            memory_usage: None,
        })
    }
}

async fn serve(runtime: Arc<dyn WorkerRuntime>, mut endpoint: WorkerEndpoint) {
    while let Some(message) = endpoint.recv().await {
        match message {
            CoordinatorMessage::Run(payload) => {
                endpoint.reset_cancel();
                let error = runtime.run(payload, &mut endpoint).await.err();
                if endpoint.finished(runtime.memory_usage(), error).is_err() {
                    break;
                }
            }
            // Between units there is nothing to cancel.
            CoordinatorMessage::Cancel { .. } | CoordinatorMessage::Response { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolName;
    use crate::environment::EnvironmentDescriptor;

    struct Echo;

    #[async_trait]
    impl WorkerRuntime for Echo {
        async fn run(&self, payload: RunPayload, endpoint: &mut WorkerEndpoint) -> Result<(), TestError> {
            if payload.files.is_empty() {
                return Err(TestError::new("no files"));
            }
            endpoint
                .task_update(Vec::new())
                .map_err(|e| TestError::new(e.to_string()))
        }

        fn memory_usage(&self) -> Option<u64> {
            Some(42)
        }
    }

    fn payload(files: Vec<PathBuf>) -> RunPayload {
        RunPayload {
            pool: PoolName::Threads,
            config: serde_json::Value::Null,
            files,
            invalidated_module_ids: Vec::new(),
            environment: EnvironmentDescriptor {
                name: "node".to_string(),
                transform_mode: None,
                options: None,
            },
            worker_id: 1,
            project_name: String::new(),
            provided_context: HashMap::new(),
        }
    }

    #[test]
    fn test_process_command_is_split_with_shell_rules() {
        let provider =
            ProcessWorkerProvider::new("node 'my worker.mjs' --pool forks", HashMap::new(), PathBuf::from("."))
                .unwrap();
        assert_eq!(provider.program, "node");
        assert_eq!(provider.args, vec!["my worker.mjs", "--pool", "forks"]);
        assert!(provider.session_id().starts_with("vigil-"));
        assert_eq!(provider.clone().session_id(), provider.session_id());

        assert!(ProcessWorkerProvider::new("", HashMap::new(), PathBuf::from(".")).is_err());
        assert!(ProcessWorkerProvider::new("node 'open", HashMap::new(), PathBuf::from(".")).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_thread_worker_runs_units_until_closed() {
        let provider = ThreadWorkerProvider::new(Arc::new(Echo));
        let mut worker = provider.spawn(7).await.unwrap();
        assert_eq!(worker.id(), 7);

        worker
            .send(CoordinatorMessage::Run(payload(vec![PathBuf::from("/a.test.ts")])))
            .unwrap();
        assert_eq!(
            worker.recv().await,
            Some(WorkerMessage::TaskUpdate { packs: Vec::new() })
        );
        assert_eq!(
            worker.recv().await,
            Some(WorkerMessage::Finished {
                memory_usage: Some(42),
                error: None
            })
        );

        worker.send(CoordinatorMessage::Run(payload(Vec::new()))).unwrap();
        let Some(WorkerMessage::Finished { error: Some(error), .. }) = worker.recv().await else {
            panic!("expected a failed unit");
        };
        assert_eq!(error.message, "no files");

        worker.terminate().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_worker_forwards_non_protocol_output() {
        let script = r#"echo 'hello from worker'; echo '{"type":"finished","memory_usage":7}'"#;
        let provider = ProcessWorkerProvider::new(
            &format!("sh -c {}", shell_words::quote(script)),
            HashMap::new(),
            std::env::temp_dir(),
        )
        .unwrap();
        let mut worker = provider.spawn(1).await.unwrap();

        let mut messages = Vec::new();
        while let Some(message) = worker.recv().await {
            messages.push(message);
        }
        assert!(messages.contains(&WorkerMessage::Finished {
            memory_usage: Some(7),
            error: None
        }));
        assert!(messages.iter().any(|m| matches!(
            m,
            WorkerMessage::UserConsoleLog { log } if log.content == "hello from worker"
        )));
        worker.terminate().await.unwrap();
    }
}
