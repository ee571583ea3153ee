//! The dispatcher is the single writer of job status.
//!
//! Every transition of the job state machine goes through here: enqueue
//! after submission, leasing by a worker, outcome handling (complete, retry
//! with backoff, fail), cancellation, restart recovery and stale-lease
//! reclamation. Store writes are conditional (expected status, expected
//! lease) so concurrent actors cannot clobber each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{DatabaseError, JobError};
use crate::executor::{ExecutionContext, ExecutionError};
use crate::job::{Job, JobFilter, JobStatus, JobUpdate};
use crate::queue::JobQueue;
use crate::scheduler::backoff::RetryPolicy;
use crate::store::JobStore;

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const CANCEL_ATTEMPTS: usize = 3;

/// Broadcast on every status transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobEvent {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub retry_count: u32,
}

impl From<&Job> for JobEvent {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            retry_count: job.retry_count,
        }
    }
}

/// How one attempt ended, as reported by a worker.
#[derive(Debug)]
pub enum Outcome {
    Succeeded(serde_json::Value),
    Failed(ExecutionError),
    /// No executor is registered for the job type.
    ExecutorMissing,
    TimedOut(Duration),
}

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The job had not started; it was removed from the queue and failed.
    Cancelled,
    /// The job is running; intent was recorded and the executor signalled.
    CancellationRequested,
    /// The job had already completed or failed.
    AlreadyTerminal,
}

struct ActiveLease {
    lease_id: Uuid,
    token: CancellationToken,
    reclaim: CancellationToken,
}

type ActiveLeases = Arc<Mutex<HashMap<Uuid, ActiveLease>>>;

fn lock_active(active: &ActiveLeases) -> MutexGuard<'_, HashMap<Uuid, ActiveLease>> {
    active.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Exclusive claim on a `running` job held by one worker.
///
/// Dropping a lease without reporting an outcome leaves the job `running`
/// in the store; the stale sweep reclaims it once the lease ages out. The
/// sweep also reclaims leases that are still held but have outlived the
/// stale threshold, after which [`Lease::reclaimed`] resolves.
pub struct Lease {
    job: Job,
    lease_id: Uuid,
    token: CancellationToken,
    reclaim: CancellationToken,
    active: ActiveLeases,
}

impl Lease {
    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn lease_id(&self) -> Uuid {
        self.lease_id
    }

    /// Context for the executor invocation of this attempt.
    pub fn context(&self) -> ExecutionContext {
        ExecutionContext::new(self.job.id, self.job.attempt(), self.token.clone())
    }

    /// Resolves once the stale sweep has taken this lease away. Any outcome
    /// reported afterwards is discarded.
    pub async fn reclaimed(&self) {
        self.reclaim.cancelled().await
    }

    pub fn is_reclaimed(&self) -> bool {
        self.reclaim.is_cancelled()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        release(&self.active, self.job.id, self.lease_id);
    }
}

/// Forget a lease, unless a newer one for the same job replaced it.
fn release(active: &ActiveLeases, job_id: Uuid, lease_id: Uuid) {
    let mut active = lock_active(active);
    if active
        .get(&job_id)
        .is_some_and(|entry| entry.lease_id == lease_id)
    {
        active.remove(&job_id);
    }
}

/// A failed attempt, normalized from the different ways an attempt can end.
struct Failure {
    message: String,
    retriable: bool,
}

/// Coordinates the store, the queue and the workers.
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    queue: Arc<JobQueue>,
    retry: RetryPolicy,
    stale_threshold: Duration,
    events: broadcast::Sender<JobEvent>,
    active: ActiveLeases,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<JobQueue>,
        retry: RetryPolicy,
        stale_threshold: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            queue,
            retry,
            stale_threshold,
            events,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Subscribe to status transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    fn emit(&self, job: &Job) {
        // No subscribers is fine.
        let _ = self.events.send(JobEvent::from(job));
    }

    /// Number of leases currently held by workers of this process.
    pub fn active_count(&self) -> usize {
        lock_active(&self.active).len()
    }

    /// Apply a transition, refusing moves the state machine does not allow.
    async fn transition(
        &self,
        job: &Job,
        update: JobUpdate,
    ) -> Result<Job, DatabaseError> {
        if let Some(target) = update.status
            && !job.status.can_transition_to(target)
        {
            return Err(DatabaseError::Conflict {
                id: job.id,
                reason: format!("illegal transition {} -> {}", job.status, target),
            });
        }
        let updated = self.store.update(job.id, &update).await?;
        self.emit(&updated);
        Ok(updated)
    }

    /// Move a freshly inserted job to `queued` and make it visible to workers.
    pub async fn enqueue_new(&self, job: &Job) -> Result<(), DatabaseError> {
        let update = JobUpdate {
            status: Some(JobStatus::Queued),
            expect_status: vec![JobStatus::Pending],
            ..Default::default()
        };
        let queued = match self.transition(job, update).await {
            Ok(queued) => queued,
            Err(DatabaseError::Conflict { reason, .. }) => {
                // Cancelled (or already leased) between insert and enqueue.
                debug!(job_id = %job.id, %reason, "Skipped enqueue of new job");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if !self.queue.enqueue(queued.id, queued.priority, queued.seq) {
            debug!(job_id = %queued.id, "Queue closed; job left queued for recovery");
        }
        Ok(())
    }

    /// Try to take the lease on a dequeued job.
    ///
    /// Returns `None` when the job is no longer leasable (cancelled, leased
    /// elsewhere, or gone).
    pub async fn lease(&self, job_id: Uuid) -> Result<Option<Lease>, DatabaseError> {
        let job = match self.store.get(job_id).await {
            Ok(job) => job,
            Err(DatabaseError::NotFound { .. }) => {
                warn!(job_id = %job_id, "Dequeued job no longer exists");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        if !job.status.is_leasable() {
            debug!(job_id = %job_id, status = %job.status, "Dequeued job not leasable");
            return Ok(None);
        }

        let now = Utc::now();
        let lease_id = Uuid::new_v4();
        let update = JobUpdate {
            status: Some(JobStatus::Running),
            started_at: Some(now),
            leased_at: Some(now),
            lease_id: Some(Some(lease_id)),
            run_after: Some(None),
            expect_status: vec![JobStatus::Pending, JobStatus::Queued],
            ..Default::default()
        };

        // Registered before the job becomes visible as `running`, so a
        // concurrent cancel always finds the token.
        let token = CancellationToken::new();
        let reclaim = CancellationToken::new();
        lock_active(&self.active).insert(
            job_id,
            ActiveLease {
                lease_id,
                token: token.clone(),
                reclaim: reclaim.clone(),
            },
        );
        let job = match self.transition(&job, update).await {
            Ok(job) => job,
            Err(DatabaseError::Conflict { reason, .. }) => {
                release(&self.active, job_id, lease_id);
                debug!(job_id = %job_id, %reason, "Lost lease race");
                return Ok(None);
            }
            Err(e) => {
                release(&self.active, job_id, lease_id);
                return Err(e);
            }
        };

        debug!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempt(),
            "Job leased"
        );

        Ok(Some(Lease {
            job,
            lease_id,
            token,
            reclaim,
            active: self.active.clone(),
        }))
    }

    /// Record the outcome of an attempt and release the lease.
    ///
    /// Returns the updated job, or `None` if the lease had already been
    /// reclaimed and the outcome was discarded.
    pub async fn report(
        &self,
        lease: Lease,
        outcome: Outcome,
    ) -> Result<Option<Job>, DatabaseError> {
        let job = &lease.job;
        let result = match outcome {
            Outcome::Succeeded(value) => {
                let now = Utc::now();
                let update = JobUpdate {
                    status: Some(JobStatus::Completed),
                    result: Some(value),
                    completed_at: Some(now),
                    lease_id: Some(None),
                    expect_status: vec![JobStatus::Running],
                    expect_lease: Some(lease.lease_id),
                    ..Default::default()
                };
                self.transition(job, update).await.inspect(|done| {
                    info!(
                        job_id = %done.id,
                        job_type = %done.job_type,
                        attempt = job.attempt(),
                        "Job completed"
                    );
                })
            }
            Outcome::Failed(err) => {
                let failure = Failure {
                    message: err.message,
                    retriable: err.retriable,
                };
                self.fail_attempt(job, Some(lease.lease_id), failure, lease.token.is_cancelled())
                    .await
            }
            Outcome::ExecutorMissing => {
                let failure = Failure {
                    message: JobError::ExecutorNotFound {
                        job_type: job.job_type.clone(),
                    }
                    .to_string(),
                    retriable: false,
                };
                self.fail_attempt(job, Some(lease.lease_id), failure, lease.token.is_cancelled())
                    .await
            }
            Outcome::TimedOut(timeout) => {
                let failure = Failure {
                    message: JobError::Timeout { timeout }.to_string(),
                    retriable: true,
                };
                self.fail_attempt(job, Some(lease.lease_id), failure, lease.token.is_cancelled())
                    .await
            }
        };

        match result {
            Ok(job) => Ok(Some(job)),
            Err(DatabaseError::Conflict { reason, .. }) => {
                warn!(job_id = %job.id, %reason, "Lease lost; discarding attempt outcome");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Route a failed attempt to retry or terminal failure.
    async fn fail_attempt(
        &self,
        job: &Job,
        lease_id: Option<Uuid>,
        failure: Failure,
        token_cancelled: bool,
    ) -> Result<Job, DatabaseError> {
        // Cancellation may have been recorded by another process.
        let cancelled = token_cancelled || self.store.get(job.id).await?.cancel_requested;
        if cancelled {
            info!(job_id = %job.id, reason = %failure.message, "Cancelled job ended its attempt");
            return self
                .fail_terminal(job, lease_id, JobError::Cancelled.to_string())
                .await;
        }

        if failure.retriable && job.can_retry() {
            return self.schedule_retry(job, lease_id, &failure.message).await;
        }

        if failure.retriable {
            warn!(
                job_id = %job.id,
                job_type = %job.job_type,
                retry_count = job.retry_count,
                error = %failure.message,
                "Retries exhausted"
            );
        } else {
            warn!(
                job_id = %job.id,
                job_type = %job.job_type,
                error = %failure.message,
                "Job failed permanently"
            );
        }
        self.fail_terminal(job, lease_id, failure.message).await
    }

    async fn schedule_retry(
        &self,
        job: &Job,
        lease_id: Option<Uuid>,
        message: &str,
    ) -> Result<Job, DatabaseError> {
        let delay = self.retry.delay_for(job.retry_count);
        let run_after = if delay.is_zero() {
            None
        } else {
            chrono::Duration::from_std(delay)
                .ok()
                .map(|d| Utc::now() + d)
        };
        let update = JobUpdate {
            status: Some(JobStatus::Queued),
            retry_count: Some(job.retry_count + 1),
            run_after: Some(run_after),
            lease_id: Some(None),
            expect_status: vec![JobStatus::Running],
            expect_lease: lease_id,
            ..Default::default()
        };
        let queued = self.transition(job, update).await?;

        warn!(
            job_id = %queued.id,
            job_type = %queued.job_type,
            retry_count = queued.retry_count,
            max_retries = queued.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %message,
            "Job attempt failed; retry scheduled"
        );
        self.queue.enqueue_at(
            queued.id,
            queued.priority,
            queued.seq,
            Some(Instant::now() + delay),
        );
        Ok(queued)
    }

    async fn fail_terminal(
        &self,
        job: &Job,
        lease_id: Option<Uuid>,
        message: String,
    ) -> Result<Job, DatabaseError> {
        let update = JobUpdate {
            status: Some(JobStatus::Failed),
            error_message: Some(message),
            completed_at: Some(Utc::now()),
            lease_id: Some(None),
            run_after: Some(None),
            expect_status: vec![JobStatus::Running],
            expect_lease: lease_id,
            ..Default::default()
        };
        self.transition(job, update).await
    }

    /// Cancel a job.
    ///
    /// Jobs that have not started are removed from the queue and failed at
    /// once. Running jobs only get the intent recorded and their executor
    /// signalled. Repeating the call is harmless.
    pub async fn cancel(&self, job_id: Uuid) -> Result<CancelOutcome, DatabaseError> {
        for _ in 0..CANCEL_ATTEMPTS {
            let job = self.store.get(job_id).await?;
            match job.status {
                JobStatus::Completed | JobStatus::Failed => {
                    return Ok(CancelOutcome::AlreadyTerminal);
                }
                JobStatus::Pending | JobStatus::Queued => {
                    let update = JobUpdate {
                        status: Some(JobStatus::Failed),
                        error_message: Some(JobError::Cancelled.to_string()),
                        completed_at: Some(Utc::now()),
                        cancel_requested: Some(true),
                        run_after: Some(None),
                        expect_status: vec![JobStatus::Pending, JobStatus::Queued],
                        ..Default::default()
                    };
                    match self.transition(&job, update).await {
                        Ok(_) => {
                            self.queue.remove(job_id);
                            info!(job_id = %job_id, "Job cancelled before dispatch");
                            return Ok(CancelOutcome::Cancelled);
                        }
                        // Leased in the meantime; take the running path.
                        Err(DatabaseError::Conflict { .. }) => continue,
                        Err(e) => return Err(e),
                    }
                }
                JobStatus::Running => {
                    if !job.cancel_requested {
                        let update = JobUpdate {
                            cancel_requested: Some(true),
                            expect_status: vec![JobStatus::Running],
                            ..Default::default()
                        };
                        match self.store.update(job_id, &update).await {
                            Ok(_) => {}
                            Err(DatabaseError::Conflict { .. }) => continue,
                            Err(e) => return Err(e),
                        }
                    }
                    if let Some(entry) = lock_active(&self.active).get(&job_id) {
                        entry.token.cancel();
                    }
                    info!(job_id = %job_id, "Cancellation requested for running job");
                    return Ok(CancelOutcome::CancellationRequested);
                }
            }
        }
        Err(DatabaseError::Conflict {
            id: job_id,
            reason: "job changed state during cancellation".to_string(),
        })
    }

    /// Rebuild the queue from the store after a restart.
    ///
    /// Every `pending` or `queued` job is enqueued again in submission order;
    /// a remaining backoff delay is honoured. Returns the number recovered.
    pub async fn recover(&self) -> Result<usize, DatabaseError> {
        let filter = JobFilter::default()
            .status(JobStatus::Pending)
            .status(JobStatus::Queued);
        let jobs = self.store.list(&filter).await?;
        let recovered = self.requeue(jobs).await?;

        info!(recovered, "Recovered queued jobs from store");
        Ok(recovered)
    }

    /// Enqueue `pending` jobs whose submission never reached the queue.
    ///
    /// A job is `pending` only between insert and enqueue, so one seen here
    /// was stranded by a failed enqueue. When this races the submitter, the
    /// side that loses the `pending -> queued` write skips the job.
    pub async fn enqueue_stranded(&self) -> Result<usize, DatabaseError> {
        let jobs = self
            .store
            .list(&JobFilter::default().status(JobStatus::Pending))
            .await?;
        if jobs.is_empty() {
            return Ok(0);
        }
        let enqueued = self.requeue(jobs).await?;
        if enqueued > 0 {
            warn!(enqueued, "Enqueued stranded pending jobs");
        }
        Ok(enqueued)
    }

    async fn requeue(&self, jobs: Vec<Job>) -> Result<usize, DatabaseError> {
        let mut requeued = 0;
        for job in jobs {
            let job = if job.status == JobStatus::Pending {
                let update = JobUpdate {
                    status: Some(JobStatus::Queued),
                    expect_status: vec![JobStatus::Pending],
                    ..Default::default()
                };
                match self.transition(&job, update).await {
                    Ok(job) => job,
                    Err(DatabaseError::Conflict { .. }) => continue,
                    Err(e) => return Err(e),
                }
            } else {
                job
            };

            let not_before = remaining_delay(job.run_after, Utc::now()).map(|d| Instant::now() + d);
            if self
                .queue
                .enqueue_at(job.id, job.priority, job.seq, not_before)
            {
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    /// Reclaim `running` jobs whose lease is older than the stale threshold.
    ///
    /// Each reclaimed lease counts as a failed, retriable attempt. When the
    /// lease is still held by a worker of this process, that worker is told
    /// to abandon the execution. Returns the number of jobs reclaimed.
    pub async fn sweep_stale_leases(&self) -> Result<usize, DatabaseError> {
        let running = self
            .store
            .list(&JobFilter::default().status(JobStatus::Running))
            .await?;
        if running.is_empty() {
            return Ok(0);
        }

        let now = Utc::now();
        let cutoff = stale_cutoff(now, self.stale_threshold);
        let mut reclaimed = 0;
        for job in running {
            let Some(leased_at) = job.leased_at.or(job.started_at) else {
                continue;
            };
            if leased_at > cutoff {
                continue;
            }

            let local = lock_active(&self.active)
                .get(&job.id)
                .filter(|entry| Some(entry.lease_id) == job.lease_id)
                .map(|entry| entry.reclaim.clone());

            warn!(
                job_id = %job.id,
                job_type = %job.job_type,
                leased_at = %leased_at,
                held_locally = local.is_some(),
                "Reclaiming stale lease"
            );
            let failure = Failure {
                message: format!("lease expired after {:?}", self.stale_threshold),
                retriable: true,
            };
            match self.fail_attempt(&job, job.lease_id, failure, false).await {
                Ok(_) => {
                    if let Some(reclaim) = local {
                        reclaim.cancel();
                    }
                    reclaimed += 1;
                }
                Err(DatabaseError::Conflict { reason, .. }) => {
                    debug!(job_id = %job.id, %reason, "Stale lease resolved concurrently");
                }
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "Failed to reclaim stale lease");
                }
            }
        }

        if reclaimed > 0 {
            info!(reclaimed, "Stale lease sweep finished");
        }
        Ok(reclaimed)
    }

    /// Fire the cancellation token of every lease held in this process.
    pub fn cancel_active(&self) -> usize {
        let active = lock_active(&self.active);
        for entry in active.values() {
            entry.token.cancel();
        }
        active.len()
    }
}

fn remaining_delay(run_after: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<Duration> {
    run_after.and_then(|at| (at - now).to_std().ok())
}

fn stale_cutoff(now: DateTime<Utc>, threshold: Duration) -> DateTime<Utc> {
    match chrono::Duration::from_std(threshold) {
        Ok(threshold) => now.checked_sub_signed(threshold).unwrap_or(DateTime::<Utc>::MIN_UTC),
        Err(_) => DateTime::<Utc>::MIN_UTC,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::NewJob;
    use crate::store::MemoryJobStore;

    struct Fixture {
        dispatcher: Dispatcher,
        store: Arc<MemoryJobStore>,
        queue: Arc<JobQueue>,
    }

    fn fixture(stale_threshold: Duration) -> Fixture {
        fixture_with(RetryPolicy::immediate(), stale_threshold)
    }

    fn fixture_with(retry: RetryPolicy, stale_threshold: Duration) -> Fixture {
        let store = Arc::new(MemoryJobStore::new());
        let queue = Arc::new(JobQueue::new());
        let dispatcher = Dispatcher::new(store.clone(), queue.clone(), retry, stale_threshold);
        Fixture {
            dispatcher,
            store,
            queue,
        }
    }

    async fn submit(f: &Fixture, new: NewJob) -> Job {
        let job = f.store.insert(&Job::from_new(new, 3)).await.unwrap();
        f.dispatcher.enqueue_new(&job).await.unwrap();
        job
    }

    async fn lease_next(f: &Fixture) -> Lease {
        let id = f.queue.dequeue().await.unwrap();
        f.dispatcher.lease(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_success_completes_job() {
        let f = fixture(Duration::from_secs(300));
        let job = submit(&f, NewJob::new("echo", serde_json::json!(1))).await;
        assert_eq!(f.store.get(job.id).await.unwrap().status, JobStatus::Queued);

        let lease = lease_next(&f).await;
        let running = f.store.get(job.id).await.unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert!(running.started_at.is_some());
        assert_eq!(f.dispatcher.active_count(), 1);

        let done = f
            .dispatcher
            .report(lease, Outcome::Succeeded(serde_json::json!("ok")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.result, Some(serde_json::json!("ok")));
        assert!(done.error_message.is_none());
        assert!(done.completed_at.is_some());
        assert!(done.lease_id.is_none());
        assert_eq!(f.dispatcher.active_count(), 0);
    }

    #[tokio::test]
    async fn test_retriable_failure_requeues() {
        let f = fixture(Duration::from_secs(300));
        let job = submit(&f, NewJob::new("flaky", serde_json::Value::Null).max_retries(1)).await;

        let lease = lease_next(&f).await;
        let retried = f
            .dispatcher
            .report(lease, Outcome::Failed(ExecutionError::retriable("503")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(retried.status, JobStatus::Queued);
        assert_eq!(retried.retry_count, 1);
        assert!(retried.error_message.is_none());
        assert!(f.queue.contains(job.id));

        let lease = lease_next(&f).await;
        assert_eq!(lease.job().attempt(), 2);
        let failed = f
            .dispatcher
            .report(lease, Outcome::Failed(ExecutionError::retriable("503")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.retry_count, 1);
        assert_eq!(failed.error_message.as_deref(), Some("503"));
        assert!(f.queue.is_empty());
    }

    #[tokio::test]
    async fn test_executor_missing_does_not_consume_retry() {
        let f = fixture(Duration::from_secs(300));
        submit(&f, NewJob::new("ghost", serde_json::Value::Null)).await;

        let lease = lease_next(&f).await;
        let failed = f
            .dispatcher
            .report(lease, Outcome::ExecutorMissing)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.retry_count, 0);
        assert!(failed.error_message.unwrap().contains("ghost"));
    }

    #[tokio::test]
    async fn test_timeout_is_retriable() {
        let f = fixture(Duration::from_secs(300));
        submit(&f, NewJob::new("slow", serde_json::Value::Null)).await;

        let lease = lease_next(&f).await;
        let retried = f
            .dispatcher
            .report(lease, Outcome::TimedOut(Duration::from_millis(10)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(retried.status, JobStatus::Queued);
        assert_eq!(retried.retry_count, 1);
    }

    #[tokio::test]
    async fn test_cancel_queued_job() {
        let f = fixture(Duration::from_secs(300));
        let job = submit(&f, NewJob::new("echo", serde_json::Value::Null)).await;

        let outcome = f.dispatcher.cancel(job.id).await.unwrap();
        assert_eq!(outcome, CancelOutcome::Cancelled);
        assert!(f.queue.is_empty());

        let cancelled = f.store.get(job.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Failed);
        assert!(cancelled.error_message.unwrap().contains("cancelled"));
        assert!(cancelled.completed_at.is_some());
        assert!(cancelled.started_at.is_none());

        assert_eq!(
            f.dispatcher.cancel(job.id).await.unwrap(),
            CancelOutcome::AlreadyTerminal
        );
    }

    #[tokio::test]
    async fn test_cancel_running_job_signals_executor() {
        let f = fixture(Duration::from_secs(300));
        let job = submit(&f, NewJob::new("echo", serde_json::Value::Null)).await;
        let lease = lease_next(&f).await;
        let ctx = lease.context();

        assert_eq!(
            f.dispatcher.cancel(job.id).await.unwrap(),
            CancelOutcome::CancellationRequested
        );
        assert!(ctx.is_cancelled());
        assert!(f.store.get(job.id).await.unwrap().cancel_requested);
        assert_eq!(
            f.dispatcher.cancel(job.id).await.unwrap(),
            CancelOutcome::CancellationRequested
        );

        // A retriable failure after cancellation is terminal.
        let failed = f
            .dispatcher
            .report(lease, Outcome::Failed(ExecutionError::retriable("interrupted")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("Job cancelled"));
    }

    #[tokio::test]
    async fn test_success_wins_over_cancellation() {
        let f = fixture(Duration::from_secs(300));
        let job = submit(&f, NewJob::new("echo", serde_json::Value::Null)).await;
        let lease = lease_next(&f).await;
        f.dispatcher.cancel(job.id).await.unwrap();

        let done = f
            .dispatcher
            .report(lease, Outcome::Succeeded(serde_json::json!(1)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancel_unknown_job() {
        let f = fixture(Duration::from_secs(300));
        let err = f.dispatcher.cancel(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_recover_rebuilds_queue_in_order() {
        let f = fixture(Duration::from_secs(300));
        // Inserted but never enqueued, as after a crash.
        let low = f
            .store
            .insert(&Job::from_new(NewJob::new("echo", serde_json::Value::Null), 3))
            .await
            .unwrap();
        let high = f
            .store
            .insert(&Job::from_new(
                NewJob::new("echo", serde_json::Value::Null).priority(9),
                3,
            ))
            .await
            .unwrap();

        assert_eq!(f.dispatcher.recover().await.unwrap(), 2);
        assert_eq!(f.store.get(low.id).await.unwrap().status, JobStatus::Queued);
        assert_eq!(f.queue.dequeue().await.unwrap(), high.id);
        assert_eq!(f.queue.dequeue().await.unwrap(), low.id);
    }

    #[tokio::test]
    async fn test_stale_lease_reclaimed() {
        let f = fixture(Duration::from_millis(10));
        let job = submit(&f, NewJob::new("echo", serde_json::Value::Null)).await;
        let lease = lease_next(&f).await;

        // Fresh lease: left alone.
        assert_eq!(f.dispatcher.sweep_stale_leases().await.unwrap(), 0);

        // Dropped without a report, as after a crashed execution.
        drop(lease);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(f.dispatcher.sweep_stale_leases().await.unwrap(), 1);

        let reclaimed = f.store.get(job.id).await.unwrap();
        assert_eq!(reclaimed.status, JobStatus::Queued);
        assert_eq!(reclaimed.retry_count, 1);
        assert!(f.queue.contains(job.id));
    }

    #[tokio::test]
    async fn test_stale_lease_held_locally_is_reclaimed() {
        let f = fixture(Duration::from_millis(10));
        let job = submit(&f, NewJob::new("hang", serde_json::Value::Null)).await;
        let lease = lease_next(&f).await;
        assert!(!lease.is_reclaimed());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(f.dispatcher.sweep_stale_leases().await.unwrap(), 1);
        assert!(lease.is_reclaimed());
        tokio::time::timeout(Duration::from_secs(1), lease.reclaimed())
            .await
            .unwrap();

        let reclaimed = f.store.get(job.id).await.unwrap();
        assert_eq!(reclaimed.status, JobStatus::Queued);
        assert_eq!(reclaimed.retry_count, 1);
        assert!(reclaimed.lease_id.is_none());

        // The abandoned attempt can no longer write its outcome.
        let outcome = f
            .dispatcher
            .report(lease, Outcome::Succeeded(serde_json::json!(1)))
            .await
            .unwrap();
        assert!(outcome.is_none());
        assert_eq!(f.store.get(job.id).await.unwrap().status, JobStatus::Queued);
        assert_eq!(f.dispatcher.active_count(), 0);
    }

    #[tokio::test]
    async fn test_backoff_survives_restart() {
        let retry = RetryPolicy {
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(1),
            jitter: false,
        };
        let f = fixture_with(retry.clone(), Duration::from_secs(300));
        let job = submit(&f, NewJob::new("flaky", serde_json::Value::Null)).await;

        let lease = lease_next(&f).await;
        let before = Utc::now();
        let retried = f
            .dispatcher
            .report(lease, Outcome::Failed(ExecutionError::retriable("503")))
            .await
            .unwrap()
            .unwrap();
        let run_after = retried.run_after.expect("backoff persisted");
        assert!(run_after >= before + chrono::Duration::milliseconds(150));
        assert_eq!(f.store.get(job.id).await.unwrap().run_after, Some(run_after));

        // A fresh process over the same store.
        let queue = Arc::new(JobQueue::new());
        let restarted = Dispatcher::new(
            f.store.clone(),
            queue.clone(),
            retry,
            Duration::from_secs(300),
        );
        let restarted_at = Instant::now();
        assert_eq!(restarted.recover().await.unwrap(), 1);
        assert!(queue.contains(job.id));

        let early = tokio::time::timeout(Duration::from_millis(50), queue.dequeue()).await;
        assert!(early.is_err(), "job dequeued before its backoff elapsed");

        let got = tokio::time::timeout(Duration::from_secs(2), queue.dequeue())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, job.id);
        assert!(restarted_at.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_enqueue_stranded_pending_job() {
        let f = fixture(Duration::from_secs(300));
        // Inserted, but the enqueue that should follow never happened.
        let job = f
            .store
            .insert(&Job::from_new(NewJob::new("echo", serde_json::Value::Null), 3))
            .await
            .unwrap();
        assert!(f.queue.is_empty());

        assert_eq!(f.dispatcher.enqueue_stranded().await.unwrap(), 1);
        assert_eq!(f.store.get(job.id).await.unwrap().status, JobStatus::Queued);
        assert_eq!(f.queue.dequeue().await.unwrap(), job.id);

        // Already queued jobs are not touched again.
        assert_eq!(f.dispatcher.enqueue_stranded().await.unwrap(), 0);
    }

    /// Delegates to a memory store, failing updates on demand.
    struct FailingUpdates {
        inner: MemoryJobStore,
        fail: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl JobStore for FailingUpdates {
        async fn insert(&self, job: &Job) -> Result<Job, DatabaseError> {
            self.inner.insert(job).await
        }

        async fn get(&self, id: Uuid) -> Result<Job, DatabaseError> {
            self.inner.get(id).await
        }

        async fn update(&self, id: Uuid, update: &JobUpdate) -> Result<Job, DatabaseError> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(DatabaseError::Query("disk I/O error".to_string()));
            }
            self.inner.update(id, update).await
        }

        async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, DatabaseError> {
            self.inner.list(filter).await
        }
    }

    #[tokio::test]
    async fn test_failed_cancel_keeps_job_queued() {
        let store = Arc::new(FailingUpdates {
            inner: MemoryJobStore::new(),
            fail: std::sync::atomic::AtomicBool::new(false),
        });
        let queue = Arc::new(JobQueue::new());
        let dispatcher = Dispatcher::new(
            store.clone(),
            queue.clone(),
            RetryPolicy::immediate(),
            Duration::from_secs(300),
        );
        let job = store
            .insert(&Job::from_new(NewJob::new("echo", serde_json::Value::Null), 3))
            .await
            .unwrap();
        dispatcher.enqueue_new(&job).await.unwrap();

        store.fail.store(true, std::sync::atomic::Ordering::SeqCst);
        let err = dispatcher.cancel(job.id).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Query(_)));
        assert_eq!(store.get(job.id).await.unwrap().status, JobStatus::Queued);
        assert!(queue.contains(job.id));

        store.fail.store(false, std::sync::atomic::Ordering::SeqCst);
        assert_eq!(dispatcher.cancel(job.id).await.unwrap(), CancelOutcome::Cancelled);
        assert!(!queue.contains(job.id));
    }

    #[tokio::test]
    async fn test_late_report_after_reclaim_is_discarded() {
        let f = fixture(Duration::from_millis(10));
        let job = submit(&f, NewJob::new("echo", serde_json::Value::Null)).await;
        let lease = lease_next(&f).await;
        let lease_id = lease.lease_id();

        // Simulate another process reclaiming the lease.
        f.store
            .update(
                job.id,
                &JobUpdate {
                    status: Some(JobStatus::Queued),
                    lease_id: Some(None),
                    retry_count: Some(1),
                    expect_lease: Some(lease_id),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let outcome = f
            .dispatcher
            .report(lease, Outcome::Succeeded(serde_json::json!(1)))
            .await
            .unwrap();
        assert!(outcome.is_none());
        assert_eq!(f.store.get(job.id).await.unwrap().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn test_events_follow_transitions() {
        let f = fixture(Duration::from_secs(300));
        let mut events = f.dispatcher.subscribe();
        let job = submit(&f, NewJob::new("echo", serde_json::Value::Null)).await;
        let lease = lease_next(&f).await;
        f.dispatcher
            .report(lease, Outcome::Succeeded(serde_json::Value::Null))
            .await
            .unwrap();

        let statuses: Vec<JobStatus> = (0..3)
            .map(|_| events.try_recv().unwrap())
            .inspect(|event| assert_eq!(event.job_id, job.id))
            .map(|event| event.status)
            .collect();
        assert_eq!(
            statuses,
            vec![JobStatus::Queued, JobStatus::Running, JobStatus::Completed]
        );
    }

    #[test]
    fn test_remaining_delay() {
        let now = Utc::now();
        assert_eq!(remaining_delay(None, now), None);
        assert_eq!(remaining_delay(Some(now - chrono::Duration::seconds(5)), now), None);
        let left = remaining_delay(Some(now + chrono::Duration::seconds(5)), now).unwrap();
        assert_eq!(left, Duration::from_secs(5));
    }
}
