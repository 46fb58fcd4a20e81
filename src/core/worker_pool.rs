//! Bounded worker pool for background tasks, with elastic but capped sizing.
//!
//! Core workers are resident and block on the backlog channel while idle.
//! When a submission finds the backlog full, the pool grows by one surplus
//! worker up to the configured maximum; surplus workers exit after sitting
//! idle for the configured timeout, shrinking back toward the core size.
//!
//! # Back-pressure
//!
//! When the backlog is full and the pool is already at its maximum size, the
//! task is executed **synchronously on the submitting thread**. This trades
//! submitter latency for guaranteed eventual execution and bounds memory, at
//! the cost of running "background" work on an arbitrary caller thread.
//! Callers that must never block should check [`SubmitDisposition`].
//!
//! # Design Principles
//!
//! - **No polling**: workers block on channel recv; surplus workers use a
//!   timed recv so idle shrink needs no extra bookkeeping thread
//! - **Clean shutdown**: dropping the sender lets workers drain the backlog
//!   and exit naturally; joins are bounded by a shared deadline

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::WorkerPoolConfig;

use super::task::{run_isolated, Task};

/// Where a submitted background task ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitDisposition {
    /// The task was queued for a worker thread.
    Queued,
    /// The backlog was saturated at maximum size; the task was executed
    /// synchronously on the submitting thread before this call returned.
    CallerRan,
    /// The pool is shut down; the task was dropped.
    Rejected,
}

/// Lock-free counters for pool statistics.
#[derive(Debug, Default)]
struct PoolCounters {
    submitted: AtomicU64,
    active: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    caller_ran: AtomicU64,
    rejected: AtomicU64,
}

/// Snapshot of pool utilization and activity.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    /// Worker threads currently alive (core + surplus).
    pub live_workers: usize,
    /// Tasks waiting in the backlog.
    pub backlog: usize,
    /// Tasks accepted (queued or caller-ran).
    pub submitted: u64,
    /// Tasks currently executing on workers.
    pub active: u64,
    /// Tasks finished (including ones that panicked).
    pub completed: u64,
    /// Finished tasks that panicked.
    pub failed: u64,
    /// Tasks executed on the submitting thread via the overflow policy.
    pub caller_ran: u64,
    /// Tasks dropped because the pool was shut down.
    pub rejected: u64,
}

/// Worker pool with dedicated OS threads for background work.
pub struct WorkerPool {
    config: WorkerPoolConfig,

    /// Task sender. `None` after shutdown so workers drain and exit.
    task_tx: Mutex<Option<Sender<Task>>>,
    /// Kept to hand clones to surplus workers and to read backlog depth.
    task_rx: Receiver<Task>,

    live_workers: Arc<AtomicUsize>,
    counters: Arc<PoolCounters>,
    shutdown: Arc<AtomicBool>,

    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_seq: AtomicUsize,
}

impl WorkerPool {
    /// Create a pool and start its resident core workers.
    ///
    /// # Errors
    ///
    /// Returns [`crate::core::SchedulerError::InvalidConfig`] if the
    /// configuration is invalid.
    pub fn new(config: WorkerPoolConfig) -> Result<Self, super::SchedulerError> {
        config
            .validate()
            .map_err(super::SchedulerError::InvalidConfig)?;

        let (task_tx, task_rx) = bounded::<Task>(config.backlog_capacity);
        let live_workers = Arc::new(AtomicUsize::new(0));
        let counters = Arc::new(PoolCounters::default());
        let shutdown = Arc::new(AtomicBool::new(false));

        let pool = Self {
            config,
            task_tx: Mutex::new(Some(task_tx)),
            task_rx,
            live_workers,
            counters,
            shutdown,
            workers: Mutex::new(Vec::new()),
            worker_seq: AtomicUsize::new(0),
        };

        for _ in 0..pool.config.core_workers {
            pool.live_workers.fetch_add(1, Ordering::SeqCst);
            let handle = pool.spawn_core_worker();
            pool.workers.lock().push(handle);
        }

        info!(
            core_workers = pool.config.core_workers,
            max_workers = pool.config.max_workers,
            backlog_capacity = pool.config.backlog_capacity,
            "worker pool initialized"
        );

        Ok(pool)
    }

    /// Submit a background task.
    ///
    /// Never blocks on the backlog: a full backlog either grows the pool (up
    /// to `max_workers`) or falls back to running the task on the calling
    /// thread. See the module docs for the back-pressure tradeoff.
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) -> SubmitDisposition {
        self.submit_boxed(Box::new(task))
    }

    /// Boxed-task entry point shared with the facade and the timer service.
    pub(crate) fn submit_boxed(&self, task: Task) -> SubmitDisposition {
        if self.shutdown.load(Ordering::Acquire) {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return SubmitDisposition::Rejected;
        }

        // Clone the sender out of the brief lock so a caller-runs fallback
        // never executes user code while holding it.
        let tx = {
            let guard = self.task_tx.lock();
            match guard.as_ref() {
                Some(tx) => tx.clone(),
                None => {
                    self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                    return SubmitDisposition::Rejected;
                }
            }
        };

        match tx.try_send(task) {
            Ok(()) => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                SubmitDisposition::Queued
            }
            Err(TrySendError::Full(task)) => match self.try_grow_with(task) {
                Ok(()) => {
                    self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                    SubmitDisposition::Queued
                }
                Err(task) => self.caller_run(task),
            },
            Err(TrySendError::Disconnected(task)) => {
                drop(task);
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                SubmitDisposition::Rejected
            }
        }
    }

    /// Overflow policy: execute on the submitting thread.
    fn caller_run(&self, task: Task) -> SubmitDisposition {
        warn!(
            backlog_capacity = self.config.backlog_capacity,
            max_workers = self.config.max_workers,
            "background backlog saturated at max workers; running task on the submitting thread"
        );
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        self.counters.caller_ran.fetch_add(1, Ordering::Relaxed);
        if !run_isolated(task, "background-caller-runs") {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.counters.completed.fetch_add(1, Ordering::Relaxed);
        SubmitDisposition::CallerRan
    }

    /// Try to add one surplus worker that takes `task` as its first unit of
    /// work. Hands the task back once `max_workers` are already live.
    fn try_grow_with(&self, task: Task) -> Result<(), Task> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(task);
        }
        let max = self.config.max_workers;
        if self
            .live_workers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max).then_some(n + 1)
            })
            .is_err()
        {
            return Err(task);
        }
        let handle = self.spawn_surplus_worker(task);
        self.workers.lock().push(handle);
        Ok(())
    }

    fn spawn_surplus_worker(&self, first_task: Task) -> JoinHandle<()> {
        let worker_id = self.worker_seq.fetch_add(1, Ordering::Relaxed);
        let task_rx = self.task_rx.clone();
        let live_workers = Arc::clone(&self.live_workers);
        let counters = Arc::clone(&self.counters);
        let idle_timeout = self.config.idle_timeout();
        debug!(worker_id, "growing pool with surplus worker");
        thread::Builder::new()
            .name(format!("tw-worker-{worker_id}"))
            .spawn(move || {
                counters.active.fetch_add(1, Ordering::Relaxed);
                if !run_isolated(first_task, "background") {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                }
                counters.active.fetch_sub(1, Ordering::Relaxed);
                counters.completed.fetch_add(1, Ordering::Relaxed);
                worker_loop(worker_id, false, &task_rx, idle_timeout, &counters);
                live_workers.fetch_sub(1, Ordering::SeqCst);
            })
            .expect("failed to spawn worker thread")
    }

    fn spawn_core_worker(&self) -> JoinHandle<()> {
        let worker_id = self.worker_seq.fetch_add(1, Ordering::Relaxed);
        let task_rx = self.task_rx.clone();
        let live_workers = Arc::clone(&self.live_workers);
        let counters = Arc::clone(&self.counters);
        let idle_timeout = self.config.idle_timeout();
        thread::Builder::new()
            .name(format!("tw-worker-{worker_id}"))
            .spawn(move || {
                worker_loop(worker_id, true, &task_rx, idle_timeout, &counters);
                live_workers.fetch_sub(1, Ordering::SeqCst);
            })
            .expect("failed to spawn worker thread")
    }

    /// Current pool statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            live_workers: self.live_workers.load(Ordering::SeqCst),
            backlog: self.task_rx.len(),
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            active: self.counters.active.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            caller_ran: self.counters.caller_ran.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }

    /// Worker threads currently alive.
    #[must_use]
    pub fn live_workers(&self) -> usize {
        self.live_workers.load(Ordering::SeqCst)
    }

    /// Shut down the pool, waiting up to `wait` in total for workers to
    /// finish the backlog and exit.
    ///
    /// Dropping the sender lets each worker drain remaining queued tasks and
    /// exit naturally. Workers that outlive the shared deadline are detached
    /// rather than allowed to hang the caller. Idempotent.
    pub fn shutdown(&self, wait: Duration) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        info!("shutting down worker pool");
        {
            let mut task_tx = self.task_tx.lock();
            *task_tx = None;
        }

        let deadline = Instant::now() + wait;
        let mut workers = self.workers.lock();
        let total = workers.len();
        let mut detached = 0usize;

        for (idx, worker) in workers.drain(..).enumerate() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let (done_tx, done_rx) = bounded(1);
            // Join on a helper thread so the wait ceiling holds even for a
            // worker stuck in a long task; on timeout both are detached.
            thread::spawn(move || {
                let clean = worker.join().is_ok();
                let _ = done_tx.send(clean);
            });
            match done_rx.recv_timeout(remaining) {
                Ok(true) => debug!(worker = idx, "worker joined"),
                Ok(false) => warn!(worker = idx, "worker had panicked"),
                Err(_) => {
                    detached += 1;
                    warn!(worker = idx, "worker did not stop within the shutdown window; detaching");
                }
            }
        }

        if detached > 0 {
            warn!(detached, total, "worker pool stopped with detached workers");
        } else {
            info!(total, "worker pool shut down");
        }
    }

    /// Non-blocking shutdown signal used by `Drop` paths: stops intake and
    /// unblocks idle workers without joining anything.
    pub(crate) fn signal_shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            let mut task_tx = self.task_tx.lock();
            *task_tx = None;
            debug!("worker pool dropped without explicit shutdown; workers detached");
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Never join in Drop; explicit shutdown() is the graceful path.
        self.signal_shutdown();
    }
}

fn worker_loop(
    worker_id: usize,
    core: bool,
    task_rx: &Receiver<Task>,
    idle_timeout: Duration,
    counters: &PoolCounters,
) {
    debug!(worker_id, core, "worker thread started");
    loop {
        let task = if core {
            // Resident worker: sleep until work arrives or the sender drops.
            match task_rx.recv() {
                Ok(task) => task,
                Err(_) => break,
            }
        } else {
            // Surplus worker: exit after sitting idle, shrinking the pool.
            match task_rx.recv_timeout(idle_timeout) {
                Ok(task) => task,
                Err(RecvTimeoutError::Timeout) => {
                    debug!(worker_id, "surplus worker idle timeout; exiting");
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        };

        counters.active.fetch_add(1, Ordering::Relaxed);
        if !run_isolated(task, "background") {
            counters.failed.fetch_add(1, Ordering::Relaxed);
        }
        counters.active.fetch_sub(1, Ordering::Relaxed);
        counters.completed.fetch_add(1, Ordering::Relaxed);
    }
    debug!(worker_id, "worker thread exiting");
}
