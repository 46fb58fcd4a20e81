//! # Tickwork
//!
//! A budgeted task scheduler for host applications built around a strict
//! single-threaded main loop.
//!
//! Many embedding hosts (game servers, simulation loops, plugin platforms)
//! run a cooperative tick loop that no other thread may touch. Library code
//! still needs to do real work: offload I/O to background threads, fire
//! callbacks after wall-clock delays, and funnel results safely back onto the
//! loop thread. Tickwork provides exactly that, without ever stalling the
//! host beyond a fixed per-tick time budget.
//!
//! ## Core Problem Solved
//!
//! - **Lag protection**: main-loop tasks are drained under a strict time
//!   budget (25 ms per tick by default), so a flood of queued work defers to
//!   later ticks instead of freezing the host.
//! - **Real-time scheduling**: delayed and repeating tasks fire on wall-clock
//!   time, independent of the host's variable tick rate.
//! - **Bounded background execution**: an elastic worker pool with a capped
//!   thread count and a bounded backlog; overflow runs on the submitting
//!   thread rather than growing without bound.
//! - **Deterministic shutdown**: every stage has a hard wait ceiling, so a
//!   hung task cannot prevent process exit.
//!
//! ## Key Features
//!
//! - **One instance per process**: construction takes a [`core::HostOwner`]
//!   capability token held by the host's bootstrap routine; a second live
//!   scheduler is a configuration error.
//! - **FIFO main-loop queue**: unbounded, multi-producer, drained only on the
//!   host loop thread, globally ordered across producers.
//! - **Failure isolation**: a panicking task is caught and logged at its
//!   execution site; it never takes down a worker, the timer, or the drain.
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use tickwork::config::SchedulerConfig;
//! use tickwork::core::{HostOwner, Scheduler};
//!
//! // Bootstrap (once per process)
//! let owner = HostOwner::claim()?;
//! let scheduler = Scheduler::new(&owner, SchedulerConfig::default())?;
//!
//! // From any thread
//! scheduler.submit_main_loop(|| println!("on the host loop"));
//! scheduler.submit_background(|| expensive_io());
//! let handle = scheduler
//!     .schedule_main_loop_every(Duration::from_secs(1), Duration::from_secs(1), || poll_state());
//!
//! // Host tick hook, called once per tick
//! scheduler.tick();
//!
//! // Host teardown
//! scheduler.shutdown();
//! ```
//!
//! For complete examples, see:
//! - `tests/scheduler_test.rs` - Full integration tests
//! - `README.md` - Comprehensive documentation

#![deny(warnings)]
#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Core scheduling components: facade, queue, pool, and timer.
pub mod core;
/// Configuration models for the scheduler and its worker pool.
pub mod config;
/// Shared utilities.
pub mod util;
