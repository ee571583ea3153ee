//! Job model: the record, its state machine and query types.

pub mod model;
pub mod state;

pub use model::{
    DEFAULT_MAX_RETRIES, Job, JobFilter, JobStatusView, JobSummary, JobUpdate, NewJob,
};
pub use state::JobStatus;
