//! Job API: the façade external callers use.
//!
//! `JobService` owns the process-scoped runtime of the job system: the queue,
//! the dispatcher, the worker pool and the stale-lease sweep. It is built
//! once at startup, started with [`JobService::start`] and torn down with
//! [`JobService::shutdown`].

use std::sync::Arc;

use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::JobsConfig;
use crate::error::{DatabaseError, Error, JobError, QueueError, Result};
use crate::executor::ExecutorRegistry;
use crate::job::{Job, JobFilter, JobStatusView, JobSummary, NewJob};
use crate::queue::JobQueue;
use crate::scheduler::{CancelOutcome, Dispatcher, JobEvent, spawn_stale_lease_sweep};
use crate::store::JobStore;
use crate::worker::{WorkerDeps, WorkerPool};

/// Background tasks owned by a started service.
struct Running {
    pool: WorkerPool,
    sweep: JoinHandle<()>,
    sweep_shutdown: CancellationToken,
}

/// Entry point for submitting and observing jobs.
pub struct JobService {
    config: JobsConfig,
    registry: Arc<ExecutorRegistry>,
    dispatcher: Arc<Dispatcher>,
    running: Mutex<Option<Running>>,
}

impl JobService {
    pub fn new(
        config: JobsConfig,
        store: Arc<dyn JobStore>,
        registry: Arc<ExecutorRegistry>,
    ) -> Self {
        let queue = Arc::new(JobQueue::new());
        let dispatcher = Arc::new(Dispatcher::new(
            store,
            queue,
            config.retry.clone(),
            config.stale_threshold,
        ));
        Self {
            config,
            registry,
            dispatcher,
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &JobsConfig {
        &self.config
    }

    /// Validate configuration, rebuild the queue from the store and start
    /// the workers and the stale-lease sweep. Calling it twice is a no-op.
    pub async fn start(&self) -> Result<()> {
        self.config.validate()?;

        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }
        if self.dispatcher.queue().is_closed() {
            return Err(QueueError::Closed.into());
        }
        if self.registry.count().await == 0 {
            tracing::warn!("Starting job service with no executors registered");
        }

        self.dispatcher.recover().await?;

        let pool = WorkerPool::spawn(
            self.config.worker_count,
            WorkerDeps {
                dispatcher: self.dispatcher.clone(),
                registry: self.registry.clone(),
                default_timeout: self.config.job_timeout,
            },
        );
        let sweep_shutdown = CancellationToken::new();
        let sweep = spawn_stale_lease_sweep(
            self.dispatcher.clone(),
            self.config.sweep_interval,
            sweep_shutdown.clone(),
        );

        tracing::info!(
            workers = self.config.worker_count,
            job_types = ?self.registry.job_types().await,
            "Job service started"
        );
        *running = Some(Running {
            pool,
            sweep,
            sweep_shutdown,
        });
        Ok(())
    }

    /// Close the queue and let in-flight jobs drain.
    ///
    /// Workers get `shutdown_grace` to finish their current attempt. After
    /// that, executors are signalled to cancel and the remaining workers are
    /// aborted; their jobs stay `running` until a later stale-lease sweep
    /// reclaims them. Jobs still queued stay `queued` in the store.
    pub async fn shutdown(&self) {
        self.dispatcher.queue().close();

        let Some(mut running) = self.running.lock().await.take() else {
            return;
        };
        running.sweep_shutdown.cancel();

        if !running.pool.drain(self.config.shutdown_grace).await {
            let signalled = self.dispatcher.cancel_active();
            tracing::warn!(
                in_flight = signalled,
                grace_secs = self.config.shutdown_grace.as_secs(),
                "Grace period elapsed; cancelling in-flight jobs"
            );
            running.pool.abort().await;
        }
        if let Err(e) = running.sweep.await {
            tracing::warn!(error = %e, "Stale lease sweep ended abnormally");
        }
        tracing::info!("Job service stopped");
    }

    /// Submit a job. Fails with `InvalidJobType` (and stores nothing) when no
    /// executor is registered for the job type.
    pub async fn submit(&self, new: NewJob) -> Result<Uuid> {
        if !self.registry.has(&new.job_type).await {
            return Err(JobError::InvalidJobType {
                job_type: new.job_type,
            }
            .into());
        }

        let job = Job::from_new(new, self.config.default_max_retries);
        let job = self.dispatcher.store().insert(&job).await?;
        tracing::info!(
            job_id = %job.id,
            job_type = %job.job_type,
            priority = job.priority,
            "Job submitted"
        );

        // The record exists now; the periodic sweep picks up a job whose
        // enqueue failed.
        if let Err(e) = self.dispatcher.enqueue_new(&job).await {
            tracing::error!(job_id = %job.id, error = %e, "Failed to enqueue submitted job");
        }
        Ok(job.id)
    }

    /// Current state of a job, including its result or error.
    pub async fn get_status(&self, job_id: Uuid) -> Result<JobStatusView> {
        let job = self
            .dispatcher
            .store()
            .get(job_id)
            .await
            .map_err(not_found(job_id))?;
        Ok(job.into())
    }

    pub async fn cancel(&self, job_id: Uuid) -> Result<CancelOutcome> {
        self.dispatcher
            .cancel(job_id)
            .await
            .map_err(not_found(job_id))
    }

    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<JobSummary>> {
        let jobs = self.dispatcher.store().list(filter).await?;
        Ok(jobs.iter().map(JobSummary::from).collect())
    }

    /// Stream of status transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.dispatcher.subscribe()
    }

    /// Jobs waiting in the queue, ready or backing off.
    pub fn queue_depth(&self) -> usize {
        self.dispatcher.queue().len()
    }
}

fn not_found(job_id: Uuid) -> impl FnOnce(DatabaseError) -> Error {
    move |e| match e {
        DatabaseError::NotFound { .. } => JobError::NotFound { id: job_id }.into(),
        other => other.into(),
    }
}
