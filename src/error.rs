//! Error types for the job system.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Configuration-related errors. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Executor already registered for job type {job_type}")]
    DuplicateExecutor { job_type: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Conflicting update on {id}: {reason}")]
    Conflict { id: Uuid, reason: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    pub(crate) fn job_not_found(id: Uuid) -> Self {
        Self::NotFound {
            entity: "job".to_string(),
            id: id.to_string(),
        }
    }
}

/// Job-related errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("No executor registered for job type {job_type}")]
    InvalidJobType { job_type: String },

    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Executor not found for job type {job_type}")]
    ExecutorNotFound { job_type: String },

    #[error("Job timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Job cancelled")]
    Cancelled,
}

/// Priority queue signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Queue is closed")]
    Closed,
}

/// Result type alias for the job system.
pub type Result<T> = std::result::Result<T, Error>;
