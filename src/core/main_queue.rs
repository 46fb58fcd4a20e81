//! Main-loop task queue: unbounded, multi-producer, single-consumer, FIFO.
//!
//! Producers on any thread enqueue without blocking; the single consumer is
//! the budgeted drain, which must only ever run on the host loop thread. The
//! channel preserves insertion order globally across producers, which is the
//! execution order contract.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::warn;

use super::task::{run_isolated, Task};

/// Budget above which a drain is treated as a shutdown flush for warning
/// purposes: overruns are always reported, regardless of backlog depth.
const SHUTDOWN_WARN_BUDGET: Duration = Duration::from_secs(1);

/// Lock-free counters for main-loop queue statistics.
#[derive(Debug, Default)]
pub(crate) struct QueueCounters {
    pub submitted: AtomicU64,
    pub executed: AtomicU64,
    pub failed: AtomicU64,
}

/// Snapshot of main-loop queue activity.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    /// Tasks enqueued since construction.
    pub submitted: u64,
    /// Tasks executed by the drain (including ones that panicked).
    pub executed: u64,
    /// Executed tasks that panicked.
    pub failed: u64,
    /// Tasks currently queued.
    pub pending: usize,
}

/// Outcome of a single drain call.
#[derive(Debug, Clone, Copy, Default)]
pub struct DrainReport {
    /// Tasks executed during this call (including ones that panicked).
    pub executed: u64,
    /// Executed tasks that panicked.
    pub failed: u64,
    /// Tasks still queued when the call returned.
    pub pending: usize,
    /// Wall-clock time the call spent executing tasks.
    pub elapsed: Duration,
}

/// Cloneable producer handle onto the main-loop queue.
///
/// Used by the facade and by the timer service to enqueue from any thread;
/// the send never blocks.
#[derive(Clone)]
pub(crate) struct MainLoopHandle {
    tx: Sender<Task>,
    counters: Arc<QueueCounters>,
}

impl MainLoopHandle {
    /// Enqueue a task. Non-blocking from any thread.
    pub fn push(&self, task: Task) {
        // An unbounded channel only errors when the receiver is gone, which
        // cannot happen while the owning queue is alive.
        if self.tx.send(task).is_ok() {
            self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// The main-loop task queue and its budgeted drain.
pub(crate) struct MainLoopQueue {
    tx: Sender<Task>,
    rx: Receiver<Task>,
    counters: Arc<QueueCounters>,
    /// Backlog depth above which a budget overrun is worth an operator warning.
    high_water: usize,
}

impl MainLoopQueue {
    pub fn new(high_water: usize) -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            counters: Arc::new(QueueCounters::default()),
            high_water,
        }
    }

    /// A producer handle for cross-thread submission.
    pub fn handle(&self) -> MainLoopHandle {
        MainLoopHandle {
            tx: self.tx.clone(),
            counters: Arc::clone(&self.counters),
        }
    }

    /// Tasks currently queued.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            executed: self.counters.executed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            pending: self.pending(),
        }
    }

    /// Pop and execute queued tasks in FIFO order until the queue is empty or
    /// elapsed time exceeds `budget`.
    ///
    /// The budget is checked after each task: an in-flight task is never
    /// aborted, only no further task is started. Each task's failure is
    /// isolated. Must only be called from the host loop thread.
    pub fn drain(&self, budget: Duration) -> DrainReport {
        let start = Instant::now();
        let mut executed = 0u64;
        let mut failed = 0u64;

        while let Ok(task) = self.rx.try_recv() {
            if !run_isolated(task, "main-loop") {
                failed += 1;
            }
            executed += 1;

            if start.elapsed() > budget {
                let pending = self.rx.len();
                // Only warn when significantly overloaded, or when flushing
                // under the large shutdown budget.
                if pending > self.high_water || budget > SHUTDOWN_WARN_BUDGET {
                    warn!(
                        pending,
                        budget_ms = u64::try_from(budget.as_millis()).unwrap_or(u64::MAX),
                        "main-loop drain budget exceeded; deferring remaining tasks"
                    );
                }
                break;
            }
        }

        self.counters.executed.fetch_add(executed, Ordering::Relaxed);
        self.counters.failed.fetch_add(failed, Ordering::Relaxed);

        DrainReport {
            executed,
            failed,
            pending: self.rx.len(),
            elapsed: start.elapsed(),
        }
    }
}
