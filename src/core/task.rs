//! The task unit and panic containment shared by every execution site.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::error;

/// An opaque unit of work. No identity, no priority, no dependencies.
///
/// A task is exclusively owned by the queue, pool, or timer holding it until
/// it is executed exactly once, then discarded.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Run a task with its failure isolated.
///
/// A panicking task is caught and logged with the execution site that ran it;
/// the panic never propagates to, or terminates, the executing thread.
/// Returns `false` if the task panicked.
pub(crate) fn run_isolated(task: Task, site: &'static str) -> bool {
    match catch_unwind(AssertUnwindSafe(task)) {
        Ok(()) => true,
        Err(payload) => {
            error!(
                site,
                panic = panic_message(payload.as_ref()),
                "task panicked; continuing with the next task"
            );
            false
        }
    }
}

/// Best-effort extraction of a panic payload message.
fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}
