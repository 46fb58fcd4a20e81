//! The scheduler facade: single entry point, one-instance invariant, and the
//! staged shutdown protocol.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;

use super::error::SchedulerError;
use super::main_queue::{DrainReport, MainLoopHandle, MainLoopQueue, QueueStats};
use super::session::{SessionId, SessionLookup};
use super::timer::{ScheduledHandle, TimerService, TimerTarget};
use super::worker_pool::{PoolStats, WorkerPool};

/// One live scheduler per process, released at the end of `shutdown()`.
static SCHEDULER_ACTIVE: AtomicBool = AtomicBool::new(false);
/// The owner token is claimed at most once per process.
static OWNER_CLAIMED: AtomicBool = AtomicBool::new(false);

const RUNNING: u8 = 0;
const SHUTTING_DOWN: u8 = 1;
const TERMINATED: u8 = 2;

/// Lifecycle of a scheduler instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Accepting submissions and drain calls.
    Running,
    /// `shutdown()` is in progress; submissions are dropped.
    ShuttingDown,
    /// Shutdown finished; a new scheduler may be constructed.
    Terminated,
}

/// Capability token identifying the host application's bootstrap routine.
///
/// Exactly one `HostOwner` can be claimed per process. Only a holder of the
/// token can construct a [`Scheduler`], which replaces the hidden-singleton
/// pattern with an explicit ownership proof: keep the token in your bootstrap
/// code and pass the constructed scheduler to consumers by injection.
#[derive(Debug)]
pub struct HostOwner {
    _private: (),
}

impl HostOwner {
    /// Claim the process-wide owner token.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::OwnerClaimed`] if the token was already
    /// claimed; this is a fatal configuration error, not a recoverable one.
    pub fn claim() -> Result<Self, SchedulerError> {
        if OWNER_CLAIMED.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::OwnerClaimed);
        }
        Ok(Self { _private: () })
    }
}

/// Aggregate scheduler statistics.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerStats {
    /// Current lifecycle state.
    pub state: SchedulerState,
    /// Main-loop queue activity.
    pub main_loop: QueueStats,
    /// Worker pool activity.
    pub pool: PoolStats,
    /// Submissions silently dropped because the scheduler was shutting down.
    pub dropped_tasks: u64,
}

/// The task scheduler.
///
/// Funnels cross-thread work back onto the host loop, runs background work on
/// a bounded pool, fires wall-clock timers, and shuts down deterministically.
/// Construct exactly one via [`Scheduler::new`] with the bootstrap-held
/// [`HostOwner`]; pass the `Arc` to consumers explicitly.
///
/// The host must call [`Scheduler::tick`] (or
/// [`Scheduler::drain_main_loop`]) once per host tick from the loop thread,
/// and [`Scheduler::shutdown`] exactly once during teardown, also from the
/// loop thread, since the final flush executes main-loop tasks in place.
pub struct Scheduler {
    config: SchedulerConfig,
    state: AtomicU8,
    queue: MainLoopQueue,
    main: MainLoopHandle,
    pool: Arc<WorkerPool>,
    timer: TimerService,
    dropped: AtomicU64,
}

impl Scheduler {
    /// Construct the process's scheduler.
    ///
    /// # Errors
    ///
    /// - [`SchedulerError::InvalidConfig`] if `config` fails validation.
    /// - [`SchedulerError::AlreadyRunning`] if another scheduler is live; the
    ///   existing instance is left fully functional.
    pub fn new(_owner: &HostOwner, config: SchedulerConfig) -> Result<Arc<Self>, SchedulerError> {
        config.validate().map_err(SchedulerError::InvalidConfig)?;

        if SCHEDULER_ACTIVE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SchedulerError::AlreadyRunning);
        }

        let queue = MainLoopQueue::new(config.backlog_warn_threshold);
        let main = queue.handle();
        let pool = match WorkerPool::new(config.worker_pool.clone()) {
            Ok(pool) => Arc::new(pool),
            Err(err) => {
                SCHEDULER_ACTIVE.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };
        let timer = TimerService::new(main.clone(), Arc::clone(&pool));

        info!(
            tick_budget_ms = config.tick_budget_ms,
            core_workers = config.worker_pool.core_workers,
            max_workers = config.worker_pool.max_workers,
            "scheduler started"
        );

        Ok(Arc::new(Self {
            config,
            state: AtomicU8::new(RUNNING),
            queue,
            main,
            pool,
            timer,
            dropped: AtomicU64::new(0),
        }))
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SchedulerState {
        match self.state.load(Ordering::Acquire) {
            RUNNING => SchedulerState::Running,
            SHUTTING_DOWN => SchedulerState::ShuttingDown,
            _ => SchedulerState::Terminated,
        }
    }

    fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == RUNNING
    }

    /// Record a submission that raced shutdown. Dropping silently is the
    /// contract: such submissions are best-effort by definition.
    fn drop_submission(&self, op: &'static str) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        debug!(op, "submission during shutdown dropped");
    }

    /// Enqueue `task` for execution on the host loop thread, roughly on the
    /// next tick. Non-blocking from any thread. Dropped silently if the
    /// scheduler is shutting down.
    pub fn submit_main_loop(&self, task: impl FnOnce() + Send + 'static) {
        if !self.is_running() {
            self.drop_submission("submit_main_loop");
            return;
        }
        self.main.push(Box::new(task));
    }

    /// Execute `task` on the worker pool, off the host loop thread.
    ///
    /// May grow the pool up to its configured maximum. When the backlog is
    /// saturated at maximum size, the task runs synchronously on the calling
    /// thread before this returns (see [`crate::core::worker_pool`] for the
    /// tradeoff). Dropped silently if the scheduler is shutting down.
    pub fn submit_background(&self, task: impl FnOnce() + Send + 'static) {
        if !self.is_running() {
            self.drop_submission("submit_background");
            return;
        }
        let _ = self.pool.submit_boxed(Box::new(task));
    }

    /// Run `task` on the host loop thread after `delay` of wall-clock time.
    ///
    /// Returns `None` if the scheduler is already shutting down.
    pub fn schedule_main_loop_after(
        &self,
        delay: Duration,
        task: impl FnOnce() + Send + 'static,
    ) -> Option<ScheduledHandle> {
        if !self.is_running() {
            self.drop_submission("schedule_main_loop_after");
            return None;
        }
        Some(
            self.timer
                .schedule_once(TimerTarget::MainLoop, delay, Box::new(task)),
        )
    }

    /// Run `task` on the worker pool after `delay` of wall-clock time.
    ///
    /// Returns `None` if the scheduler is already shutting down.
    pub fn schedule_background_after(
        &self,
        delay: Duration,
        task: impl FnOnce() + Send + 'static,
    ) -> Option<ScheduledHandle> {
        if !self.is_running() {
            self.drop_submission("schedule_background_after");
            return None;
        }
        Some(
            self.timer
                .schedule_once(TimerTarget::Background, delay, Box::new(task)),
        )
    }

    /// Run `task` on the host loop thread at a fixed wall-clock rate: first
    /// after `initial_delay`, then every `period` until the handle is
    /// cancelled or the scheduler terminates.
    ///
    /// Returns `None` if `period` is zero (a zero-period repeat would be
    /// permanently due, flooding the queue) or if the scheduler is already
    /// shutting down.
    pub fn schedule_main_loop_every(
        &self,
        initial_delay: Duration,
        period: Duration,
        task: impl Fn() + Send + Sync + 'static,
    ) -> Option<ScheduledHandle> {
        if period.is_zero() {
            warn!(op = "schedule_main_loop_every", "zero period rejected");
            return None;
        }
        if !self.is_running() {
            self.drop_submission("schedule_main_loop_every");
            return None;
        }
        Some(self.timer.schedule_repeating(
            TimerTarget::MainLoop,
            initial_delay,
            period,
            Arc::new(task),
        ))
    }

    /// Run `task` on the worker pool at a fixed wall-clock rate.
    ///
    /// Returns `None` if `period` is zero or if the scheduler is already
    /// shutting down.
    pub fn schedule_background_every(
        &self,
        initial_delay: Duration,
        period: Duration,
        task: impl Fn() + Send + Sync + 'static,
    ) -> Option<ScheduledHandle> {
        if period.is_zero() {
            warn!(op = "schedule_background_every", "zero period rejected");
            return None;
        }
        if !self.is_running() {
            self.drop_submission("schedule_background_every");
            return None;
        }
        Some(self.timer.schedule_repeating(
            TimerTarget::Background,
            initial_delay,
            period,
            Arc::new(task),
        ))
    }

    /// Run `task` on the host loop thread only if `id` still resolves to a
    /// live session at execution time.
    ///
    /// The lookup happens immediately before the task runs, on the loop
    /// thread, never at capture time, so a session that disappears between
    /// submission and execution is skipped instead of dangling.
    pub fn run_if_present<L, F>(&self, directory: &Arc<L>, id: SessionId, task: F)
    where
        L: SessionLookup,
        F: FnOnce(L::Handle) + Send + 'static,
    {
        let directory = Arc::clone(directory);
        self.submit_main_loop(move || match directory.resolve(id) {
            Some(handle) => task(handle),
            None => debug!(session = %id, "session gone before task ran; skipping"),
        });
    }

    /// Drain hook: execute queued main-loop tasks under the configured tick
    /// budget. Call once per host tick from the loop thread.
    pub fn tick(&self) -> DrainReport {
        self.drain_main_loop(self.config.tick_budget())
    }

    /// Execute queued main-loop tasks in FIFO order until the queue is empty
    /// or `budget` elapses. The budget never aborts an in-flight task; it
    /// only stops further tasks from starting. No-op once shutdown begins
    /// (the shutdown sequence performs its own final flush).
    ///
    /// Must only be called from the host loop thread.
    pub fn drain_main_loop(&self, budget: Duration) -> DrainReport {
        if !self.is_running() {
            return DrainReport::default();
        }
        self.queue.drain(budget)
    }

    /// Shut down the scheduler. Idempotent; later calls are no-ops.
    ///
    /// Stages, each with a hard wait ceiling so shutdown always completes:
    /// 1. stop accepting submissions and gate the drain hook;
    /// 2. stop the timer service (bounded wait, detach on timeout);
    /// 3. stop the worker pool, letting it flush its backlog (bounded wait);
    /// 4. one final main-loop drain under the large shutdown budget, flushing
    ///    everything steps 2-3 handed off;
    /// 5. release the process-wide instance guard.
    ///
    /// Call from the host loop thread during teardown: step 4 executes
    /// main-loop tasks on the calling thread.
    pub fn shutdown(&self) {
        if self
            .state
            .compare_exchange(RUNNING, SHUTTING_DOWN, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        info!("scheduler shutdown started");
        self.timer.shutdown(self.config.timer_stop_wait());
        self.pool.shutdown(self.config.pool_stop_wait());

        let report = self.queue.drain(self.config.shutdown_drain_budget());
        if report.pending > 0 {
            warn!(
                pending = report.pending,
                "shutdown drain budget exhausted with tasks still queued; discarding them"
            );
        }

        self.state.store(TERMINATED, Ordering::SeqCst);
        SCHEDULER_ACTIVE.store(false, Ordering::SeqCst);
        info!(flushed = report.executed, "scheduler shutdown complete");
    }

    /// Aggregate statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            state: self.state(),
            main_loop: self.queue.stats(),
            pool: self.pool.stats(),
            dropped_tasks: self.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // Signal everything to stop but never join in Drop; explicit
        // shutdown() is the graceful path.
        if self.state.load(Ordering::SeqCst) != TERMINATED {
            self.timer.signal_stop();
            self.pool.signal_shutdown();
            SCHEDULER_ACTIVE.store(false, Ordering::SeqCst);
            debug!("scheduler dropped without explicit shutdown; threads detached");
        }
    }
}
