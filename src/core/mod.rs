//! Core scheduling components: facade, queue, pool, and timer.

pub mod error;
pub mod main_queue;
pub mod scheduler;
pub mod session;
pub mod task;
pub mod timer;
pub mod worker_pool;

pub use error::{AppResult, SchedulerError};
pub use main_queue::{DrainReport, QueueStats};
pub use scheduler::{HostOwner, Scheduler, SchedulerState, SchedulerStats};
pub use session::{SessionId, SessionLookup};
pub use task::Task;
pub use timer::ScheduledHandle;
pub use worker_pool::{PoolStats, SubmitDisposition, WorkerPool};
