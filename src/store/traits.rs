//! The `JobStore` trait, the persistence boundary of the job system.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::job::{Job, JobFilter, JobUpdate};

/// Durable keyed storage for job records.
///
/// Every `update` is atomic per job: preconditions are evaluated and the
/// field set is applied as one step, so concurrent readers never observe a
/// partial write and a conflicting writer gets `DatabaseError::Conflict`.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job. Returns the stored record, including the
    /// submission sequence assigned by the store.
    async fn insert(&self, job: &Job) -> Result<Job, DatabaseError>;

    /// Fetch a job by ID. Fails with `DatabaseError::NotFound`.
    async fn get(&self, id: Uuid) -> Result<Job, DatabaseError>;

    /// Apply a partial update and return the resulting record.
    ///
    /// Fails with `NotFound` for an unknown ID and `Conflict` when the
    /// update's preconditions do not hold.
    async fn update(&self, id: Uuid, update: &JobUpdate) -> Result<Job, DatabaseError>;

    /// List jobs matching the filter, in submission order.
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, DatabaseError>;
}
