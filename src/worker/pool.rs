//! Fixed-size worker pool.

use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;

use crate::worker::{Worker, WorkerDeps};

/// `W` workers pulling from the shared queue.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `count` workers. They run until the queue is closed.
    pub fn spawn(count: usize, deps: WorkerDeps) -> Self {
        let handles = (0..count)
            .map(|id| tokio::spawn(Worker::new(id, deps.clone()).run()))
            .collect();
        tracing::info!(workers = count, "Worker pool started");
        Self { handles }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Wait up to `grace` for every worker to exit. Returns `true` when the
    /// pool drained in time.
    pub async fn drain(&mut self, grace: Duration) -> bool {
        let drained = tokio::time::timeout(grace, join_all(self.handles.iter_mut()))
            .await
            .is_ok();
        if drained {
            self.handles.clear();
            tracing::info!("Worker pool drained");
        } else {
            // Handles that completed during the wait must not be polled again.
            self.handles.retain(|handle| !handle.is_finished());
        }
        drained
    }

    /// Abort whatever is still running and wait for the tasks to go away.
    pub async fn abort(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
        let aborted = self.handles.len();
        join_all(self.handles.drain(..)).await;
        if aborted > 0 {
            tracing::warn!(aborted, "Aborted workers still running after grace period");
        }
    }
}
