//! Task executors, the pluggable capability that performs a job's work.
//!
//! The core never implements business logic; it resolves one executor per
//! `job_type` and calls [`TaskExecutor::execute`] with the job payload.

pub mod builtin;
pub mod registry;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use registry::ExecutorRegistry;

/// Failure reported by an executor.
///
/// `retriable` is the only signal the dispatcher uses to choose between a
/// retry and giving up.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ExecutionError {
    pub retriable: bool,
    pub message: String,
}

impl ExecutionError {
    /// A transient failure, eligible for retry.
    pub fn retriable(message: impl Into<String>) -> Self {
        Self {
            retriable: true,
            message: message.into(),
        }
    }

    /// A permanent failure; the job fails on this attempt.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            retriable: false,
            message: message.into(),
        }
    }

    /// The payload could not be decoded. Never retried.
    pub fn malformed_payload(err: impl std::fmt::Display) -> Self {
        Self::fatal(format!("malformed payload: {err}"))
    }
}

/// Per-attempt context handed to an executor.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub job_id: Uuid,
    /// 1-based attempt number.
    pub attempt: u32,
    cancellation: CancellationToken,
}

impl ExecutionContext {
    pub fn new(job_id: Uuid, attempt: u32, cancellation: CancellationToken) -> Self {
        Self {
            job_id,
            attempt,
            cancellation,
        }
    }

    /// Poll for a cancellation request. Cancellation is cooperative: the
    /// executor decides whether and when to stop.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }
}

/// The executor contract, one implementation per job type.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run one attempt of a job.
    async fn execute(
        &self,
        payload: serde_json::Value,
        ctx: &ExecutionContext,
    ) -> Result<serde_json::Value, ExecutionError>;
}
