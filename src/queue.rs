//! In-memory priority queue feeding ready jobs to workers.
//!
//! Ordering: priority descending, then submission sequence ascending.
//! Entries can carry a not-before instant (retry backoff); they stay
//! invisible to `dequeue` until it passes. The queue is a cache of the
//! store's `pending`/`queued` jobs and is rebuilt from it on startup.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::QueueError;

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueEntry {
    job_id: Uuid,
    priority: i32,
    seq: i64,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then lower seq first.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct QueueState {
    ready: BinaryHeap<QueueEntry>,
    delayed: Vec<(Instant, QueueEntry)>,
    members: HashSet<Uuid>,
    closed: bool,
}

impl QueueState {
    /// Move delayed entries whose time has come into the ready heap.
    fn promote_due(&mut self, now: Instant) {
        let mut i = 0;
        while i < self.delayed.len() {
            if self.delayed[i].0 <= now {
                let (_, entry) = self.delayed.swap_remove(i);
                self.ready.push(entry);
            } else {
                i += 1;
            }
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.iter().map(|(at, _)| *at).min()
    }
}

/// Priority queue of job IDs with blocking `dequeue`.
pub struct JobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a job that is ready now. Returns `false` if the job is already
    /// queued or the queue is closed.
    pub fn enqueue(&self, job_id: Uuid, priority: i32, seq: i64) -> bool {
        self.enqueue_at(job_id, priority, seq, None)
    }

    /// Add a job that becomes visible at `not_before` (or now if `None`).
    pub fn enqueue_at(
        &self,
        job_id: Uuid,
        priority: i32,
        seq: i64,
        not_before: Option<Instant>,
    ) -> bool {
        let entry = QueueEntry {
            job_id,
            priority,
            seq,
        };
        {
            let mut state = self.lock();
            if state.closed || !state.members.insert(job_id) {
                return false;
            }
            match not_before {
                Some(at) if at > Instant::now() => state.delayed.push((at, entry)),
                _ => state.ready.push(entry),
            }
        }
        debug!(job_id = %job_id, priority, seq, delayed = not_before.is_some(), "Job enqueued");
        self.notify.notify_one();
        true
    }

    /// Take the highest-priority ready job, waiting until one is available.
    ///
    /// Returns `QueueError::Closed` once the queue has been closed.
    pub async fn dequeue(&self) -> Result<Uuid, QueueError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before inspecting state so a concurrent
            // enqueue or close cannot slip between the check and the wait.
            notified.as_mut().enable();

            let next_due = {
                let mut state = self.lock();
                if state.closed {
                    return Err(QueueError::Closed);
                }
                state.promote_due(Instant::now());
                if let Some(entry) = state.ready.pop() {
                    state.members.remove(&entry.job_id);
                    if !state.ready.is_empty() {
                        self.notify.notify_one();
                    }
                    return Ok(entry.job_id);
                }
                state.next_due()
            };

            match next_due {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Remove a job before dispatch. Returns `true` if it was queued.
    pub fn remove(&self, job_id: Uuid) -> bool {
        let mut state = self.lock();
        if !state.members.remove(&job_id) {
            return false;
        }
        state.ready.retain(|e| e.job_id != job_id);
        state.delayed.retain(|(_, e)| e.job_id != job_id);
        debug!(job_id = %job_id, "Job removed from queue");
        true
    }

    /// Check whether a job is currently queued (ready or delayed).
    pub fn contains(&self, job_id: Uuid) -> bool {
        self.lock().members.contains(&job_id)
    }

    /// Close the queue. Every blocked and future `dequeue` returns `Closed`.
    pub fn close(&self) {
        let dropped = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.members.len()
        };
        info!(remaining = dropped, "Job queue closed");
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of queued jobs, ready and delayed.
    pub fn len(&self) -> usize {
        self.lock().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}
