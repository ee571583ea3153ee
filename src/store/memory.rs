//! In-memory `JobStore`: a `RwLock<HashMap>` behind the same contract as
//! the libSQL backend. Nothing survives the process.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::job::{Job, JobFilter, JobUpdate};
use crate::store::traits::JobStore;

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, Job>,
    next_seq: i64,
}

/// In-process job store.
#[derive(Default)]
pub struct MemoryJobStore {
    inner: RwLock<Inner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &Job) -> Result<Job, DatabaseError> {
        let mut inner = self.inner.write().await;
        if inner.jobs.contains_key(&job.id) {
            return Err(DatabaseError::Constraint(format!("job {} already exists", job.id)));
        }
        inner.next_seq += 1;
        let mut stored = job.clone();
        stored.seq = inner.next_seq;
        inner.jobs.insert(stored.id, stored.clone());
        debug!(job_id = %stored.id, seq = stored.seq, "Job inserted");
        Ok(stored)
    }

    async fn get(&self, id: Uuid) -> Result<Job, DatabaseError> {
        self.inner
            .read()
            .await
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| DatabaseError::job_not_found(id))
    }

    async fn update(&self, id: Uuid, update: &JobUpdate) -> Result<Job, DatabaseError> {
        let mut inner = self.inner.write().await;
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| DatabaseError::job_not_found(id))?;
        update
            .check(job)
            .map_err(|reason| DatabaseError::Conflict { id, reason })?;
        update.apply(job, Utc::now());
        Ok(job.clone())
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, DatabaseError> {
        let inner = self.inner.read().await;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.seq);
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{DEFAULT_MAX_RETRIES, JobStatus, NewJob};

    fn make_job(owner: &str) -> Job {
        Job::from_new(
            NewJob::new("echo", serde_json::json!({})).owner(owner),
            DEFAULT_MAX_RETRIES,
        )
    }

    #[tokio::test]
    async fn insert_assigns_increasing_seq() {
        let store = MemoryJobStore::new();
        let a = store.insert(&make_job("alice")).await.unwrap();
        let b = store.insert(&make_job("alice")).await.unwrap();
        assert!(a.seq < b.seq);
    }

    #[tokio::test]
    async fn duplicate_insert_rejected() {
        let store = MemoryJobStore::new();
        let job = make_job("alice");
        store.insert(&job).await.unwrap();
        assert!(store.insert(&job).await.is_err());
    }

    #[tokio::test]
    async fn get_and_update_not_found() {
        let store = MemoryJobStore::new();
        let id = Uuid::new_v4();
        assert!(matches!(
            store.get(id).await,
            Err(DatabaseError::NotFound { .. })
        ));
        assert!(matches!(
            store.update(id, &JobUpdate::default()).await,
            Err(DatabaseError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn conditional_update_conflicts() {
        let store = MemoryJobStore::new();
        let job = store.insert(&make_job("alice")).await.unwrap();

        let lease = JobUpdate {
            status: Some(JobStatus::Running),
            expect_status: vec![JobStatus::Pending, JobStatus::Queued],
            ..Default::default()
        };
        store.update(job.id, &lease).await.unwrap();
        let second = store.update(job.id, &lease).await;
        assert!(matches!(second, Err(DatabaseError::Conflict { .. })));
    }

    #[tokio::test]
    async fn list_filters_and_orders() {
        let store = MemoryJobStore::new();
        let first = store.insert(&make_job("alice")).await.unwrap();
        store.insert(&make_job("bob")).await.unwrap();
        let third = store.insert(&make_job("alice")).await.unwrap();

        let alice = store
            .list(&JobFilter::default().owner("alice"))
            .await
            .unwrap();
        assert_eq!(
            alice.iter().map(|j| j.id).collect::<Vec<_>>(),
            vec![first.id, third.id]
        );

        let limited = store.list(&JobFilter::default().limit(1)).await.unwrap();
        assert_eq!(limited.len(), 1);
    }
}
