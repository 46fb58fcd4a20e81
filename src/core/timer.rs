//! Real-time timer service: wall-clock delayed and fixed-rate callbacks.
//!
//! A single dedicated thread sleeps until the earliest registered deadline
//! (`Condvar::wait_until`, no polling) and, on firing, immediately hands the
//! callback off to the main-loop queue or the worker pool. The timer thread
//! never runs user code inline, so one slow callback cannot delay the others.
//!
//! Delays are based on wall-clock time, not host ticks: they stay correct
//! even when the host loop is running slow or fast.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::bounded;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use super::main_queue::MainLoopHandle;
use super::task::Task;
use super::worker_pool::WorkerPool;

/// Deadline clamp for delays too large for `Instant` arithmetic. Thirty
/// years out is "never" for any host process while staying safely inside
/// the platform's representable range.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// A cancellable reference to a pending or repeating timer registration.
///
/// Cancellation prevents any future firing. A firing that has already handed
/// its task off to the main-loop queue or the worker pool cannot be
/// retracted; that task will still run once.
#[derive(Debug, Clone)]
pub struct ScheduledHandle {
    cancelled: Arc<AtomicBool>,
}

impl ScheduledHandle {
    fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    fn already_cancelled() -> Self {
        let handle = Self::new();
        handle.cancel();
        handle
    }

    /// Prevent any future firing of this registration.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether this registration has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Where a fired callback is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerTarget {
    /// Hand off to the main-loop queue.
    MainLoop,
    /// Hand off to the worker pool.
    Background,
}

enum TimerJob {
    Once(Task),
    Every(Arc<dyn Fn() + Send + Sync + 'static>),
}

struct TimerEntry {
    seq: u64,
    deadline: Instant,
    period: Option<Duration>,
    target: TimerTarget,
    job: TimerJob,
    cancelled: Arc<AtomicBool>,
}

// BinaryHeap is a max-heap; order entries so the earliest deadline is on top.
impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct TimerState {
    heap: BinaryHeap<TimerEntry>,
    stopped: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    tick: Condvar,
}

/// The timer service: one thread, one deadline heap.
pub(crate) struct TimerService {
    shared: Arc<TimerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
    seq: AtomicU64,
}

impl TimerService {
    /// Start the timer thread with handles to both dispatch targets.
    pub fn new(main: MainLoopHandle, pool: Arc<WorkerPool>) -> Self {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                heap: BinaryHeap::new(),
                stopped: false,
            }),
            tick: Condvar::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("tw-timer".into())
            .spawn(move || timer_loop(&thread_shared, &main, &pool))
            .expect("failed to spawn timer thread");

        Self {
            shared,
            thread: Mutex::new(Some(handle)),
            seq: AtomicU64::new(0),
        }
    }

    /// Register a one-shot callback `delay` of wall-clock time from now.
    pub fn schedule_once(
        &self,
        target: TimerTarget,
        delay: Duration,
        task: Task,
    ) -> ScheduledHandle {
        self.register(target, delay, None, TimerJob::Once(task))
    }

    /// Register a fixed-rate callback: first firing after `initial_delay`,
    /// then every `period` until cancelled or the service stops.
    ///
    /// A zero period would make the entry permanently due, pinning the timer
    /// thread and flooding the dispatch target; such registrations are
    /// rejected as dead on arrival.
    pub fn schedule_repeating(
        &self,
        target: TimerTarget,
        initial_delay: Duration,
        period: Duration,
        callback: Arc<dyn Fn() + Send + Sync + 'static>,
    ) -> ScheduledHandle {
        if period.is_zero() {
            warn!("repeating registration with a zero period rejected");
            return ScheduledHandle::already_cancelled();
        }
        self.register(target, initial_delay, Some(period), TimerJob::Every(callback))
    }

    fn register(
        &self,
        target: TimerTarget,
        delay: Duration,
        period: Option<Duration>,
        job: TimerJob,
    ) -> ScheduledHandle {
        let handle = ScheduledHandle::new();
        let now = Instant::now();
        let entry = TimerEntry {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            // A pathological delay that overflows Instant arithmetic clamps
            // to a far-future deadline instead of panicking.
            deadline: now.checked_add(delay).unwrap_or(now + FAR_FUTURE),
            period,
            target,
            job,
            cancelled: Arc::clone(&handle.cancelled),
        };

        let mut state = self.shared.state.lock();
        if state.stopped {
            // Racing a shutdown; the registration will never fire.
            return ScheduledHandle::already_cancelled();
        }
        state.heap.push(entry);
        drop(state);
        self.shared.tick.notify_one();
        handle
    }

    /// Pending registrations (cancelled entries included until they pop).
    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.shared.state.lock().heap.len()
    }

    /// Stop the service: discard pending registrations, wake the thread, and
    /// wait up to `wait` for it to exit; detach on timeout. Idempotent.
    pub fn shutdown(&self, wait: Duration) {
        {
            let mut state = self.shared.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
            state.heap.clear();
        }
        self.shared.tick.notify_all();

        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            let (done_tx, done_rx) = bounded(1);
            thread::spawn(move || {
                let clean = handle.join().is_ok();
                let _ = done_tx.send(clean);
            });
            match done_rx.recv_timeout(wait) {
                Ok(true) => info!("timer service stopped"),
                Ok(false) => warn!("timer thread had panicked"),
                Err(_) => warn!("timer thread did not stop within the shutdown window; detaching"),
            }
        }
    }

    /// Non-blocking stop signal used by `Drop` paths.
    pub fn signal_stop(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
            state.heap.clear();
        }
        self.shared.tick.notify_all();
        debug!("timer service signalled to stop without join");
    }
}

fn timer_loop(shared: &TimerShared, main: &MainLoopHandle, pool: &Arc<WorkerPool>) {
    debug!("timer thread started");
    loop {
        // Collect everything due under the lock; dispatch outside it so a
        // caller-runs overflow in the pool cannot block registrations.
        let due = {
            let mut state = shared.state.lock();
            loop {
                if state.stopped {
                    debug!("timer thread exiting");
                    return;
                }

                let now = Instant::now();
                let mut due = Vec::new();
                loop {
                    let is_due = state.heap.peek().is_some_and(|e| e.deadline <= now);
                    if !is_due {
                        break;
                    }
                    if let Some(entry) = state.heap.pop() {
                        if !entry.cancelled.load(Ordering::Acquire) {
                            due.push(entry);
                        }
                    }
                }
                if !due.is_empty() {
                    break due;
                }

                match state.heap.peek().map(|e| e.deadline) {
                    Some(next) => {
                        let _ = shared.tick.wait_until(&mut state, next);
                    }
                    None => shared.tick.wait(&mut state),
                }
            }
        };

        for entry in due {
            fire(entry, shared, main, pool);
        }
    }
}

/// Hand one fired entry off to its target and, for fixed-rate entries,
/// reinsert at `deadline + period` (a timer that fell behind fires
/// back-to-back until caught up).
fn fire(mut entry: TimerEntry, shared: &TimerShared, main: &MainLoopHandle, pool: &Arc<WorkerPool>) {
    match entry.job {
        TimerJob::Once(task) => dispatch(entry.target, task, main, pool),
        TimerJob::Every(ref callback) => {
            let callback_run = Arc::clone(callback);
            dispatch(entry.target, Box::new(move || callback_run()), main, pool);
            if let Some(period) = entry.period {
                entry.deadline = entry
                    .deadline
                    .checked_add(period)
                    .unwrap_or_else(|| Instant::now() + FAR_FUTURE);
                let mut state = shared.state.lock();
                if !state.stopped && !entry.cancelled.load(Ordering::Acquire) {
                    state.heap.push(entry);
                }
            }
        }
    }
}

fn dispatch(target: TimerTarget, task: Task, main: &MainLoopHandle, pool: &Arc<WorkerPool>) {
    match target {
        TimerTarget::MainLoop => main.push(task),
        // A rejection here means the pool is already shutting down; the
        // firing is dropped, matching submit-during-shutdown semantics.
        TimerTarget::Background => {
            let _ = pool.submit_boxed(task);
        }
    }
}
