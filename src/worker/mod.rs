//! Worker system — a fixed pool of execution units.
//!
//! - `worker` — dequeue, lease, execute, report loop
//! - `pool` — spawns and drains `W` workers

pub mod pool;
pub mod worker;

pub use pool::WorkerPool;
pub use worker::{Worker, WorkerDeps};
