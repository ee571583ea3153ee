//! Worker loop: dequeue, lease, execute, report.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::error::{DatabaseError, QueueError};
use crate::executor::{ExecutorRegistry, TaskExecutor};
use crate::scheduler::{Dispatcher, Lease, Outcome};

/// Shared dependencies for worker execution.
#[derive(Clone)]
pub struct WorkerDeps {
    pub dispatcher: Arc<Dispatcher>,
    pub registry: Arc<ExecutorRegistry>,
    /// Applied when the job carries no timeout of its own.
    pub default_timeout: Option<Duration>,
}

/// Aborts the execution task if the worker itself is torn down.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// One execution unit of the pool.
pub struct Worker {
    id: usize,
    deps: WorkerDeps,
}

impl Worker {
    pub fn new(id: usize, deps: WorkerDeps) -> Self {
        Self { id, deps }
    }

    fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.deps.dispatcher
    }

    /// Run until the queue is closed.
    pub async fn run(self) {
        tracing::debug!(worker = self.id, "Worker started");

        loop {
            let job_id = match self.dispatcher().queue().dequeue().await {
                Ok(job_id) => job_id,
                Err(QueueError::Closed) => break,
            };
            if let Err(e) = self.process(job_id).await {
                tracing::error!(
                    worker = self.id,
                    job_id = %job_id,
                    error = %e,
                    "Failed to process job"
                );
            }
        }

        tracing::debug!(worker = self.id, "Worker stopped");
    }

    async fn process(&self, job_id: Uuid) -> Result<(), DatabaseError> {
        let Some(lease) = self.dispatcher().lease(job_id).await? else {
            return Ok(());
        };

        let Some(executor) = self.deps.registry.resolve(&lease.job().job_type).await else {
            tracing::error!(
                worker = self.id,
                job_id = %job_id,
                job_type = %lease.job().job_type,
                "No executor registered"
            );
            self.dispatcher().report(lease, Outcome::ExecutorMissing).await?;
            return Ok(());
        };

        match self.execute(executor, &lease).await {
            Some(outcome) => {
                self.dispatcher().report(lease, outcome).await?;
            }
            None => {
                // Crashed or reclaimed; nothing to report.
            }
        }
        Ok(())
    }

    /// Run the executor in its own task so a panic cannot take the worker
    /// down. Returns `None` if the execution crashed or the stale sweep
    /// reclaimed the lease; in both cases the task is gone on return.
    async fn execute(&self, executor: Arc<dyn TaskExecutor>, lease: &Lease) -> Option<Outcome> {
        let job = lease.job();
        let payload = job.payload.clone();
        let ctx = lease.context();
        let timeout = job.timeout().or(self.deps.default_timeout);

        tracing::info!(
            worker = self.id,
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempt(),
            "Executing job"
        );

        let handle = tokio::spawn(async move { executor.execute(payload, &ctx).await });
        let _abort = AbortOnDrop(handle.abort_handle());

        let finished = async move {
            match timeout {
                Some(limit) => tokio::time::timeout(limit, handle).await.map_err(|_| limit),
                None => Ok(handle.await),
            }
        };

        let joined = tokio::select! {
            finished = finished => match finished {
                Ok(joined) => joined,
                Err(limit) => {
                    tracing::warn!(
                        worker = self.id,
                        job_id = %job.id,
                        timeout_ms = limit.as_millis() as u64,
                        "Job execution timed out"
                    );
                    return Some(Outcome::TimedOut(limit));
                }
            },
            _ = lease.reclaimed() => {
                tracing::warn!(
                    worker = self.id,
                    job_id = %job.id,
                    "Lease reclaimed by stale sweep; abandoning execution"
                );
                return None;
            }
        };

        match joined {
            Ok(Ok(value)) => Some(Outcome::Succeeded(value)),
            Ok(Err(err)) => Some(Outcome::Failed(err)),
            Err(e) => {
                tracing::error!(
                    worker = self.id,
                    job_id = %job.id,
                    error = %e,
                    "Execution crashed; leaving job for stale lease recovery"
                );
                None
            }
        }
    }
}
