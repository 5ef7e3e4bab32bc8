//! Receiver task launching.
//!
//! The cluster scheduler is an external collaborator reached through the
//! [`TaskLauncher`] seam. [`LocalTaskLauncher`] schedules within the current
//! process, which is how local mode and tests run.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::receiver::ReceiverTask;

/// The worker-side entrypoint invoked once per receiver task.
pub type RunReceiverFn = Arc<dyn Fn(ReceiverTask) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A scheduler which runs one long task per receiver on a chosen node.
#[async_trait]
pub trait TaskLauncher: Send + Sync + 'static {
    /// Block until at least `min` workers are registered with the scheduler.
    ///
    /// Workers which have not yet registered are invisible to placement, so
    /// launching before enough are live would co-locate all receivers on one
    /// node.
    async fn await_live_workers(&self, min: usize) -> Result<()>;

    /// Run one long-lived task per receiver, returning once all have completed.
    async fn run_job(&self, tasks: Vec<ReceiverTask>, run: RunReceiverFn) -> Result<()>;

    /// Whether this launcher schedules within the current process.
    fn is_local(&self) -> bool {
        false
    }
}

/// Runs every receiver task inside the current process.
#[derive(Default)]
pub struct LocalTaskLauncher;

#[async_trait]
impl TaskLauncher for LocalTaskLauncher {
    async fn await_live_workers(&self, _min: usize) -> Result<()> {
        Ok(())
    }

    async fn run_job(&self, tasks: Vec<ReceiverTask>, run: RunReceiverFn) -> Result<()> {
        let handles: Vec<_> = tasks
            .into_iter()
            .map(|task| (task.stream_id, tokio::spawn(run(task))))
            .collect();
        for (stream_id, handle) in handles {
            match handle.await {
                Ok(Ok(())) => (),
                Ok(Err(err)) => tracing::error!(error = ?err, stream_id, "receiver task finished with error"),
                Err(err) => tracing::error!(error = ?err, stream_id, "error joining receiver task"),
            }
        }
        Ok(())
    }

    fn is_local(&self) -> bool {
        true
    }
}
