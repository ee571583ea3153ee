//! Job record and the value types that flow through the store and API.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::JobStatus;

/// Default retry budget for a submitted job.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// A unit of asynchronous work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID, immutable.
    pub id: Uuid,
    /// Submission sequence assigned by the store on insert (FIFO tie-break).
    pub seq: i64,
    /// Selects the executor.
    pub job_type: String,
    /// Current status. Written only by the dispatcher.
    pub status: JobStatus,
    /// Higher is dispatched first.
    pub priority: i32,
    /// Opaque executor input.
    pub payload: serde_json::Value,
    /// Executor output once completed.
    pub result: Option<serde_json::Value>,
    /// Failure description once failed.
    pub error_message: Option<String>,
    /// Failed attempts that were retried.
    pub retry_count: u32,
    /// Retry budget.
    pub max_retries: u32,
    /// Submitting user, for querying only.
    pub owner: Option<String>,
    /// Per-job execution timeout in milliseconds.
    pub timeout_ms: Option<u64>,
    /// Cancellation was requested while running.
    pub cancel_requested: bool,
    /// Identity of the current lease, if running.
    pub lease_id: Option<Uuid>,
    /// Not dispatchable before this instant (retry backoff).
    pub run_after: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// First dispatch. Never reset.
    pub started_at: Option<DateTime<Utc>>,
    /// Start of the current (or most recent) lease.
    pub leased_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Build a pending job record from a submission.
    pub fn from_new(new: NewJob, default_max_retries: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            seq: 0,
            job_type: new.job_type,
            status: JobStatus::Pending,
            priority: new.priority,
            payload: new.payload,
            result: None,
            error_message: None,
            retry_count: 0,
            max_retries: new.max_retries.unwrap_or(default_max_retries),
            owner: new.owner,
            timeout_ms: new.timeout.map(|t| t.as_millis() as u64),
            cancel_requested: false,
            lease_id: None,
            run_after: None,
            created_at: now,
            started_at: None,
            leased_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    /// Per-job timeout, if one was set at submission.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Whether another failed attempt may be retried.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// 1-based attempt number of the current lease.
    pub fn attempt(&self) -> u32 {
        self.retry_count + 1
    }
}

/// A submission request.
///
/// ```
/// use async_jobs::job::NewJob;
///
/// let job = NewJob::new("transcription", serde_json::json!({"file": "a.wav"}))
///     .priority(5)
///     .max_retries(2)
///     .owner("user-1");
/// assert_eq!(job.priority, 5);
/// ```
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    /// `None` uses the configured default.
    pub max_retries: Option<u32>,
    pub owner: Option<String>,
    /// `None` uses the configured default.
    pub timeout: Option<Duration>,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            priority: 0,
            max_retries: None,
            owner: None,
            timeout: None,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Partial update of a job, applied atomically by the store.
///
/// `None` fields are left untouched. `expect_status` and `expect_lease` are
/// preconditions: when they do not hold the store rejects the whole update
/// with `DatabaseError::Conflict`.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub retry_count: Option<u32>,
    /// Applied only when the stored value is still unset.
    pub started_at: Option<DateTime<Utc>>,
    pub leased_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub run_after: Option<Option<DateTime<Utc>>>,
    pub lease_id: Option<Option<Uuid>>,
    pub cancel_requested: Option<bool>,
    /// Current status must be one of these (empty: any).
    pub expect_status: Vec<JobStatus>,
    /// Current lease must be exactly this one.
    pub expect_lease: Option<Uuid>,
}

impl JobUpdate {
    /// Check the preconditions against the current record.
    pub fn check(&self, job: &Job) -> Result<(), String> {
        if !self.expect_status.is_empty() && !self.expect_status.contains(&job.status) {
            return Err(format!(
                "status is {}, expected one of {:?}",
                job.status, self.expect_status
            ));
        }
        if let Some(lease) = self.expect_lease
            && job.lease_id != Some(lease)
        {
            return Err(format!("lease {lease} no longer held"));
        }
        Ok(())
    }

    /// Apply the field set to a record. Preconditions are not re-checked.
    pub fn apply(&self, job: &mut Job, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(result) = &self.result {
            job.result = Some(result.clone());
        }
        if let Some(message) = &self.error_message {
            job.error_message = Some(message.clone());
        }
        if let Some(count) = self.retry_count {
            job.retry_count = count;
        }
        if job.started_at.is_none() {
            job.started_at = self.started_at;
        }
        if let Some(at) = self.leased_at {
            job.leased_at = Some(at);
        }
        if let Some(at) = self.completed_at {
            job.completed_at = Some(at);
        }
        if let Some(run_after) = self.run_after {
            job.run_after = run_after;
        }
        if let Some(lease) = self.lease_id {
            job.lease_id = lease;
        }
        if let Some(flag) = self.cancel_requested {
            job.cancel_requested = flag;
        }
        job.updated_at = now;
    }
}

/// Query filter for `list`.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub owner: Option<String>,
    /// Any of these statuses (empty: all).
    pub statuses: Vec<JobStatus>,
    pub job_type: Option<String>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// In-process evaluation, mirrors the SQL `WHERE` clause.
    pub fn matches(&self, job: &Job) -> bool {
        if let Some(owner) = &self.owner
            && job.owner.as_deref() != Some(owner.as_str())
        {
            return false;
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&job.status) {
            return false;
        }
        if let Some(job_type) = &self.job_type
            && &job.job_type != job_type
        {
            return false;
        }
        true
    }
}

/// Row returned by `JobService::list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: Uuid,
    pub job_type: String,
    pub status: JobStatus,
    pub priority: i32,
    pub owner: Option<String>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            job_type: job.job_type.clone(),
            status: job.status,
            priority: job.priority,
            owner: job.owner.clone(),
            retry_count: job.retry_count,
            created_at: job.created_at,
            completed_at: job.completed_at,
        }
    }
}

/// Snapshot returned by `JobService::get_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub id: Uuid,
    pub status: JobStatus,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<Job> for JobStatusView {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            status: job.status,
            result: job.result,
            error_message: job.error_message,
            retry_count: job.retry_count,
            max_retries: job.max_retries,
            cancel_requested: job.cancel_requested,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
        }
    }
}
