//! Async Jobs — durable priority job processing with retries.

pub mod config;
pub mod error;
pub mod executor;
pub mod job;
pub mod queue;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod worker;

pub use config::JobsConfig;
pub use error::{Error, Result};
pub use service::JobService;
