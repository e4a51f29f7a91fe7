//! One unit of work on one worker.
//!
//! [`run_unit`] sends the run payload, then pumps worker traffic into the
//! run's [`RpcHandler`](crate::rpc::RpcHandler) until the worker reports
//! `finished`. While it waits it also watches the run's cancel signal: the
//! first time it fires a `cancel` notification is forwarded to the worker,
//! and the worker gets `teardown_timeout` to wind down before the unit is
//! abandoned.

use std::path::PathBuf;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use super::worker::Worker;
use super::{PoolError, PoolResult, RunContext};
use crate::config::PoolName;
use crate::environment::EnvironmentDescriptor;
use crate::orchestrator::cancel::CancelReason;
use crate::project::Project;
use crate::rpc::{self, CoordinatorMessage, RunPayload, WorkerMessage};

/// Files of one project sharing an environment, executed by one worker.
#[derive(Debug, Clone)]
pub struct Unit {
    pub pool: PoolName,
    pub project: std::sync::Arc<Project>,
    pub files: Vec<PathBuf>,
    pub environment: EnvironmentDescriptor,
}

impl Unit {
    /// Comma-separated file list for diagnostics.
    pub fn describe(&self) -> String {
        self.files
            .iter()
            .map(|f| f.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn payload(&self, worker_id: u64, ctx: &RunContext) -> RunPayload {
        RunPayload {
            pool: self.pool.clone(),
            config: serde_json::to_value(self.project.config()).unwrap_or_default(),
            files: self.files.clone(),
            invalidated_module_ids: ctx.invalidated.clone(),
            environment: self.environment.clone(),
            worker_id,
            project_name: self.project.name().to_string(),
            provided_context: ctx.provided_context.clone(),
        }
    }
}

enum Event {
    Cancel,
    Deadline,
    Message(Option<WorkerMessage>),
}

/// Runs `unit` on `worker` and waits for it to finish.
///
/// # Errors
///
/// - [`PoolError::WorkerExited`] if the worker hangs up before `finished`
/// - [`PoolError::WorkerFailed`] if `finished` carries an error
/// - [`PoolError::CancelTimeout`] if a cancelled worker does not finish
///   within `teardown_timeout`
pub async fn run_unit(
    worker: &mut Worker,
    unit: &Unit,
    ctx: &RunContext,
    teardown_timeout: Duration,
) -> PoolResult<()> {
    let worker_id = worker.id();
    let project_name = unit.project.name().to_string();

    debug!(
        "Worker {} running {} file(s) in {} ({})",
        worker_id,
        unit.files.len(),
        unit.environment.name,
        unit.pool
    );

    worker
        .send(CoordinatorMessage::Run(unit.payload(worker_id, ctx)))
        .map_err(|_| PoolError::WorkerExited {
            worker_id,
            files: unit.describe(),
        })?;

    let mut deadline: Option<Instant> = None;
    loop {
        let event = tokio::select! {
            _ = ctx.cancel.cancelled(), if deadline.is_none() => Event::Cancel,
            _ = sleep_until(deadline), if deadline.is_some() => Event::Deadline,
            message = worker.recv() => Event::Message(message),
        };

        match event {
            Event::Cancel => {
                let reason = ctx.cancel.reason().unwrap_or(CancelReason::Unknown);
                debug!("Forwarding cancel ({}) to worker {}", reason, worker_id);
                // A closed channel surfaces as WorkerExited on the next recv.
                let _ = worker.send(CoordinatorMessage::Cancel { reason });
                deadline = Some(Instant::now() + teardown_timeout);
            }
            Event::Deadline => {
                return Err(PoolError::CancelTimeout {
                    worker_id,
                    timeout_ms: teardown_timeout.as_millis() as u64,
                });
            }
            Event::Message(None) => {
                return Err(PoolError::WorkerExited {
                    worker_id,
                    files: unit.describe(),
                });
            }
            Event::Message(Some(WorkerMessage::Finished { memory_usage, error })) => {
                worker.finish_unit(memory_usage);
                return match error {
                    Some(error) => Err(PoolError::WorkerFailed { worker_id, error }),
                    None => Ok(()),
                };
            }
            Event::Message(Some(message)) => {
                rpc::dispatch(ctx.handler.as_ref(), worker.channel(), &project_name, message).await?;
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
