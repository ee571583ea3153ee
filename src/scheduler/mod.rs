//! Scheduler — state transitions, retry policy and stale-lease recovery.

pub mod backoff;
pub mod dispatcher;
pub mod sweep;

pub use backoff::RetryPolicy;
pub use dispatcher::{CancelOutcome, Dispatcher, JobEvent, Lease, Outcome};
pub use sweep::spawn_stale_lease_sweep;
