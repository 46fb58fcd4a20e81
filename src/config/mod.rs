//! Configuration models for the scheduler and its worker pool.

pub mod scheduler;

pub use scheduler::{SchedulerConfig, WorkerPoolConfig};
