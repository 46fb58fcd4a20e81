//! Integration tests for the scheduler facade.
//!
//! These tests validate the scheduler's externally observable contracts:
//! - FIFO main-loop ordering across concurrent producers
//! - Thread-identity invariants (main-loop vs background)
//! - Budgeted draining that defers the remainder
//! - The staged shutdown protocol and its flush
//! - The one-instance guard and the owner token
//! - Back-pressure fallback onto the submitting thread
//!
//! The one-instance guard is process-wide, so every test that constructs a
//! scheduler serializes on a shared mutex and the single claimable
//! `HostOwner` is shared through a `OnceLock`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use tickwork::config::{SchedulerConfig, WorkerPoolConfig};
use tickwork::core::{HostOwner, Scheduler, SchedulerError, SchedulerState, SessionId, SessionLookup};
use uuid::Uuid;

// ============================================================================
// HELPERS
// ============================================================================

fn owner() -> &'static HostOwner {
    static OWNER: OnceLock<HostOwner> = OnceLock::new();
    OWNER.get_or_init(|| {
        tickwork::util::init_tracing();
        HostOwner::claim().expect("token claimed once for the test process")
    })
}

/// Scheduler construction is process-exclusive; serialize the tests that do it.
fn serial() -> MutexGuard<'static, ()> {
    static SERIAL: Mutex<()> = Mutex::new(());
    SERIAL.lock()
}

fn test_config() -> SchedulerConfig {
    SchedulerConfig::new()
        .with_timer_stop_wait_ms(2_000)
        .with_pool_stop_wait_ms(5_000)
}

/// Drain repeatedly (as the host tick hook would) until the queue is empty
/// or the deadline passes.
fn drain_until_empty(scheduler: &Scheduler, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        let report = scheduler.drain_main_loop(Duration::from_millis(50));
        if report.pending == 0 && report.executed == 0 {
            thread::sleep(Duration::from_millis(2));
            if scheduler.stats().main_loop.pending == 0 {
                return;
            }
        }
    }
}

fn wait_for(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

// ============================================================================
// ORDERING AND THREAD IDENTITY
// ============================================================================

#[test]
fn fifo_order_is_preserved_across_producers() {
    let _guard = serial();
    let scheduler = Scheduler::new(owner(), test_config()).expect("construct");

    let executed: Arc<Mutex<Vec<(usize, usize, ThreadId)>>> = Arc::new(Mutex::new(Vec::new()));
    let producers = 4;
    let per_producer = 200;

    let mut handles = Vec::new();
    for producer in 0..producers {
        let scheduler = Arc::clone(&scheduler);
        let executed = Arc::clone(&executed);
        handles.push(thread::spawn(move || {
            for seq in 0..per_producer {
                let executed = Arc::clone(&executed);
                scheduler.submit_main_loop(move || {
                    executed.lock().push((producer, seq, thread::current().id()));
                });
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    drain_until_empty(&scheduler, Duration::from_secs(10));

    let executed = executed.lock();
    assert_eq!(executed.len(), producers * per_producer);

    // Every task ran on the drain thread.
    let drain_thread = thread::current().id();
    assert!(executed.iter().all(|&(_, _, tid)| tid == drain_thread));

    // Per-producer submission order survives into execution order.
    for producer in 0..producers {
        let seqs: Vec<usize> = executed
            .iter()
            .filter(|&&(p, _, _)| p == producer)
            .map(|&(_, seq, _)| seq)
            .collect();
        assert_eq!(seqs, (0..per_producer).collect::<Vec<_>>());
    }
    drop(executed);

    scheduler.shutdown();
}

#[test]
fn background_tasks_never_run_on_the_drain_thread() {
    let _guard = serial();
    let scheduler = Scheduler::new(owner(), test_config()).expect("construct");

    let main_thread: Arc<Mutex<Option<ThreadId>>> = Arc::new(Mutex::new(None));
    let background_thread: Arc<Mutex<Option<ThreadId>>> = Arc::new(Mutex::new(None));

    let slot = Arc::clone(&main_thread);
    scheduler.submit_main_loop(move || {
        *slot.lock() = Some(thread::current().id());
    });
    let slot = Arc::clone(&background_thread);
    scheduler.submit_background(move || {
        *slot.lock() = Some(thread::current().id());
    });

    scheduler.tick();
    assert!(wait_for(
        || background_thread.lock().is_some(),
        Duration::from_secs(5)
    ));

    let here = thread::current().id();
    assert_eq!(main_thread.lock().unwrap(), here);
    assert_ne!(background_thread.lock().unwrap(), here);

    scheduler.shutdown();
}

// ============================================================================
// BUDGETED DRAINING
// ============================================================================

#[test]
fn budget_defers_the_remainder_to_later_ticks() {
    let _guard = serial();
    let scheduler = Scheduler::new(owner(), test_config()).expect("construct");

    // 500 tasks of ~1ms against a 25ms budget: a single drain call must
    // execute only a small slice and leave the rest queued.
    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..500 {
        let done = Arc::clone(&done);
        scheduler.submit_main_loop(move || {
            thread::sleep(Duration::from_millis(1));
            done.fetch_add(1, Ordering::SeqCst);
        });
    }

    let report = scheduler.drain_main_loop(Duration::from_millis(25));
    println!(
        "single 25ms drain: executed={} pending={} elapsed={:?}",
        report.executed, report.pending, report.elapsed
    );
    assert!(report.executed >= 2, "budget allows more than one 1ms task");
    assert!(
        report.executed <= 250,
        "a 25ms budget cannot run half of 500ms of work"
    );
    assert!(report.pending >= 250);
    assert_eq!(
        report.executed as usize + report.pending,
        500,
        "nothing is lost, only deferred"
    );

    // Shutdown's final flush executes the remainder.
    scheduler.shutdown();
    assert_eq!(done.load(Ordering::SeqCst), 500);
}

// ============================================================================
// SHUTDOWN
// ============================================================================

#[test]
fn nothing_runs_after_shutdown_returns() {
    let _guard = serial();
    let scheduler = Scheduler::new(owner(), test_config()).expect("construct");
    scheduler.shutdown();
    assert_eq!(scheduler.state(), SchedulerState::Terminated);

    let ran = Arc::new(AtomicUsize::new(0));
    let bump = |ran: &Arc<AtomicUsize>| {
        let ran = Arc::clone(ran);
        move || {
            ran.fetch_add(1, Ordering::SeqCst);
        }
    };

    scheduler.submit_main_loop(bump(&ran));
    scheduler.submit_background(bump(&ran));
    assert!(scheduler
        .schedule_main_loop_after(Duration::from_millis(1), bump(&ran))
        .is_none());
    assert!(scheduler
        .schedule_background_every(Duration::from_millis(1), Duration::from_millis(1), {
            let ran = Arc::clone(&ran);
            move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }
        })
        .is_none());

    // The drain hook is gated off; nothing can execute anymore.
    thread::sleep(Duration::from_millis(50));
    let report = scheduler.drain_main_loop(Duration::from_secs(1));
    assert_eq!(report.executed, 0);
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(scheduler.stats().dropped_tasks, 4);

    // Idempotent.
    scheduler.shutdown();
}

#[test]
fn shutdown_flushes_queued_main_loop_tasks() {
    let _guard = serial();
    let scheduler = Scheduler::new(owner(), test_config()).expect("construct");

    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..50 {
        let done = Arc::clone(&done);
        scheduler.submit_main_loop(move || {
            done.fetch_add(1, Ordering::SeqCst);
        });
    }

    // Never drained during normal operation; the final shutdown drain must
    // flush everything.
    scheduler.shutdown();
    assert_eq!(done.load(Ordering::SeqCst), 50);
}

#[test]
fn shutdown_flushes_background_backlog() {
    let _guard = serial();
    let config = test_config().with_worker_pool(
        WorkerPoolConfig::new()
            .with_core_workers(1)
            .with_max_workers(1)
            .with_backlog_capacity(64),
    );
    let scheduler = Scheduler::new(owner(), config).expect("construct");

    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..20 {
        let done = Arc::clone(&done);
        scheduler.submit_background(move || {
            thread::sleep(Duration::from_millis(1));
            done.fetch_add(1, Ordering::SeqCst);
        });
    }

    scheduler.shutdown();
    assert_eq!(done.load(Ordering::SeqCst), 20);
}

// ============================================================================
// TIMERS
// ============================================================================

#[test]
fn delayed_main_loop_task_fires_after_the_wall_clock_delay() {
    let _guard = serial();
    let scheduler = Scheduler::new(owner(), test_config()).expect("construct");

    let ran_at: Arc<Mutex<Option<(Instant, ThreadId)>>> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&ran_at);
    let start = Instant::now();
    let handle = scheduler
        .schedule_main_loop_after(Duration::from_millis(30), move || {
            *slot.lock() = Some((Instant::now(), thread::current().id()));
        })
        .expect("scheduler is running");
    assert!(!handle.is_cancelled());

    // Tick like a host loop until the task lands and runs.
    assert!(wait_for(
        || {
            scheduler.tick();
            ran_at.lock().is_some()
        },
        Duration::from_secs(5)
    ));

    let (fired_at, fired_on) = ran_at.lock().unwrap();
    assert!(fired_at.duration_since(start) >= Duration::from_millis(30));
    assert_eq!(fired_on, thread::current().id());

    scheduler.shutdown();
}

#[test]
fn repeating_schedule_cancelled_after_two_firings_runs_exactly_twice() {
    let _guard = serial();
    let scheduler = Scheduler::new(owner(), test_config()).expect("construct");

    let (fired_tx, fired_rx) = crossbeam_channel::unbounded();
    let count = Arc::new(AtomicUsize::new(0));

    let c = Arc::clone(&count);
    let handle = scheduler
        .schedule_background_every(Duration::from_millis(50), Duration::from_millis(150), move || {
            c.fetch_add(1, Ordering::SeqCst);
            let _ = fired_tx.send(());
        })
        .expect("scheduler is running");

    // Observe two firings, then cancel well before the third.
    fired_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("first firing");
    fired_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("second firing");
    handle.cancel();

    // Far past where the third firing would have been.
    assert!(
        fired_rx.recv_timeout(Duration::from_millis(400)).is_err(),
        "no third firing after cancellation"
    );
    assert_eq!(count.load(Ordering::SeqCst), 2);

    scheduler.shutdown();
}

#[test]
fn zero_period_repeating_schedule_is_rejected() {
    let _guard = serial();
    let scheduler = Scheduler::new(owner(), test_config()).expect("construct");

    let ran = Arc::new(AtomicUsize::new(0));
    let r = Arc::clone(&ran);
    assert!(scheduler
        .schedule_main_loop_every(Duration::ZERO, Duration::ZERO, move || {
            r.fetch_add(1, Ordering::SeqCst);
        })
        .is_none());
    let r = Arc::clone(&ran);
    assert!(scheduler
        .schedule_background_every(Duration::from_millis(1), Duration::ZERO, move || {
            r.fetch_add(1, Ordering::SeqCst);
        })
        .is_none());

    // A permanently-due repeat would flood the unbounded queue with
    // thousands of entries in this window; nothing may be enqueued at all.
    thread::sleep(Duration::from_millis(100));
    let stats = scheduler.stats();
    assert_eq!(stats.main_loop.pending, 0);
    assert_eq!(stats.main_loop.submitted, 0);
    scheduler.tick();
    assert_eq!(ran.load(Ordering::SeqCst), 0);

    scheduler.shutdown();
}

// ============================================================================
// ONE-INSTANCE GUARD
// ============================================================================

#[test]
fn second_construction_fails_and_leaves_the_first_functional() {
    let _guard = serial();
    let first = Scheduler::new(owner(), test_config()).expect("construct");

    match Scheduler::new(owner(), test_config()) {
        Err(SchedulerError::AlreadyRunning) => {}
        Err(other) => panic!("expected AlreadyRunning, got {other:?}"),
        Ok(_) => panic!("second construction must fail while the first is live"),
    }

    // The first instance is untouched by the failed construction.
    let ran = Arc::new(AtomicUsize::new(0));
    let r = Arc::clone(&ran);
    first.submit_main_loop(move || {
        r.fetch_add(1, Ordering::SeqCst);
    });
    first.tick();
    assert_eq!(ran.load(Ordering::SeqCst), 1);

    // Shutdown releases the guard for a future scheduler.
    first.shutdown();
    let second = Scheduler::new(owner(), test_config()).expect("construct after release");
    second.shutdown();
}

#[test]
fn invalid_config_is_rejected_at_construction() {
    let _guard = serial();
    let config = test_config().with_tick_budget_ms(0);
    match Scheduler::new(owner(), config) {
        Err(SchedulerError::InvalidConfig(msg)) => assert!(msg.contains("tick_budget_ms")),
        Err(other) => panic!("expected InvalidConfig, got {other:?}"),
        Ok(_) => panic!("a zero tick budget must be rejected"),
    }

    // The failed construction must not leak the instance guard.
    let scheduler = Scheduler::new(owner(), test_config()).expect("construct");
    scheduler.shutdown();
}

#[test]
fn dropping_an_unshutdown_scheduler_releases_the_guard() {
    let _guard = serial();
    let scheduler = Scheduler::new(owner(), test_config()).expect("construct");
    drop(scheduler);

    let next = Scheduler::new(owner(), test_config()).expect("construct after drop");
    next.shutdown();
}

// ============================================================================
// BACK-PRESSURE
// ============================================================================

#[test]
fn saturated_pool_runs_the_overflow_task_on_the_submitter() {
    let _guard = serial();
    let config = test_config().with_worker_pool(
        WorkerPoolConfig::new()
            .with_core_workers(2)
            .with_max_workers(2)
            .with_backlog_capacity(1),
    );
    let scheduler = Scheduler::new(owner(), config).expect("construct");

    let release = Arc::new(AtomicBool::new(false));
    let blocker = |release: &Arc<AtomicBool>| {
        let release = Arc::clone(release);
        move || {
            while !release.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(2));
            }
        }
    };

    // Occupy both workers, then the single backlog slot.
    scheduler.submit_background(blocker(&release));
    scheduler.submit_background(blocker(&release));
    assert!(wait_for(
        || scheduler.stats().pool.active == 2,
        Duration::from_secs(5)
    ));
    scheduler.submit_background(blocker(&release));

    // The 4th long-running task cannot be queued or given a new worker: it
    // must run synchronously on this thread before submit returns.
    let ran_on: Arc<Mutex<Option<ThreadId>>> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&ran_on);
    let start = Instant::now();
    scheduler.submit_background(move || {
        thread::sleep(Duration::from_millis(150));
        *slot.lock() = Some(thread::current().id());
    });
    let elapsed = start.elapsed();

    assert!(
        elapsed >= Duration::from_millis(150),
        "submit returned before the overflow task completed ({elapsed:?})"
    );
    assert_eq!(ran_on.lock().unwrap(), thread::current().id());
    assert_eq!(scheduler.stats().pool.caller_ran, 1);

    release.store(true, Ordering::Release);
    scheduler.shutdown();
}

// ============================================================================
// SESSION-GUARDED EXECUTION
// ============================================================================

struct TestDirectory {
    sessions: Mutex<HashMap<SessionId, String>>,
}

impl SessionLookup for TestDirectory {
    type Handle = String;

    fn resolve(&self, id: SessionId) -> Option<String> {
        self.sessions.lock().get(&id).cloned()
    }
}

#[test]
fn run_if_present_resolves_at_execution_time() {
    let _guard = serial();
    let scheduler = Scheduler::new(owner(), test_config()).expect("construct");

    let alive = Uuid::new_v4();
    let departed = Uuid::new_v4();
    let directory = Arc::new(TestDirectory {
        sessions: Mutex::new(HashMap::from([
            (alive, "alice".to_string()),
            (departed, "bob".to_string()),
        ])),
    });

    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let s = Arc::clone(&seen);
    scheduler.run_if_present(&directory, alive, move |handle| {
        s.lock().push(handle);
    });
    let s = Arc::clone(&seen);
    scheduler.run_if_present(&directory, departed, move |handle| {
        s.lock().push(handle);
    });

    // "bob" disconnects after submission but before execution: the lookup
    // happens when the task runs, so the guarded task is skipped.
    directory.sessions.lock().remove(&departed);
    scheduler.tick();

    assert_eq!(*seen.lock(), vec!["alice".to_string()]);

    scheduler.shutdown();
}
