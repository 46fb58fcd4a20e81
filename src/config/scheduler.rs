//! Scheduler and worker pool configuration structures.

use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::core::AppResult;

/// Environment variable holding an optional JSON configuration override.
const CONFIG_ENV_VAR: &str = "TICKWORK_CONFIG";

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Resident worker threads, kept alive while the pool runs.
    pub core_workers: usize,
    /// Hard cap on worker threads, core plus surplus.
    pub max_workers: usize,
    /// Idle time after which a surplus worker exits, shrinking the pool
    /// back toward the core size.
    pub idle_timeout_secs: u64,
    /// Bounded backlog capacity. A full backlog grows the pool up to
    /// `max_workers`, then falls back to running tasks on the submitter.
    pub backlog_capacity: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            core_workers: 2,
            max_workers: num_cpus::get().clamp(2, 8),
            idle_timeout_secs: 60,
            backlog_capacity: 1024,
        }
    }
}

impl WorkerPoolConfig {
    /// Default configuration: 2 core workers, max bounded by available
    /// parallelism (2..=8), 60 s idle timeout, backlog of 1024.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the resident worker count.
    #[must_use]
    pub const fn with_core_workers(mut self, count: usize) -> Self {
        self.core_workers = count;
        self
    }

    /// Set the maximum worker count.
    #[must_use]
    pub const fn with_max_workers(mut self, count: usize) -> Self {
        self.max_workers = count;
        self
    }

    /// Set the surplus worker idle timeout in seconds.
    #[must_use]
    pub const fn with_idle_timeout_secs(mut self, secs: u64) -> Self {
        self.idle_timeout_secs = secs;
        self
    }

    /// Set the bounded backlog capacity.
    #[must_use]
    pub const fn with_backlog_capacity(mut self, capacity: usize) -> Self {
        self.backlog_capacity = capacity;
        self
    }

    /// Surplus worker idle timeout.
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Validate pool configuration values.
    ///
    /// # Errors
    ///
    /// Returns a message describing the first invalid value.
    pub fn validate(&self) -> Result<(), String> {
        if self.core_workers == 0 {
            return Err("core_workers must be greater than 0".into());
        }
        if self.max_workers < self.core_workers {
            return Err(format!(
                "max_workers ({}) must be at least core_workers ({})",
                self.max_workers, self.core_workers
            ));
        }
        if self.backlog_capacity == 0 {
            return Err("backlog_capacity must be greater than 0".into());
        }
        if self.idle_timeout_secs == 0 {
            return Err("idle_timeout_secs must be greater than 0".into());
        }
        Ok(())
    }
}

/// Root scheduler configuration.
///
/// Defaults mirror the budgets the scheduler is designed around: a 25 ms
/// drain budget per tick (half of a 50 ms tick, leaving room for the host's
/// own work) and a 10 s final flush at shutdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Wall-clock budget for each normal drain call, in milliseconds.
    pub tick_budget_ms: u64,
    /// Budget for the single final drain during shutdown, in milliseconds.
    pub shutdown_drain_budget_ms: u64,
    /// Wait ceiling for the timer service to stop at shutdown, in
    /// milliseconds.
    pub timer_stop_wait_ms: u64,
    /// Wait ceiling for the worker pool to stop at shutdown, in
    /// milliseconds.
    pub pool_stop_wait_ms: u64,
    /// Main-loop backlog depth above which a budget overrun is logged.
    pub backlog_warn_threshold: usize,
    /// Worker pool configuration.
    pub worker_pool: WorkerPoolConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_budget_ms: 25,
            shutdown_drain_budget_ms: 10_000,
            timer_stop_wait_ms: 5_000,
            pool_stop_wait_ms: 10_000,
            backlog_warn_threshold: 1_000,
            worker_pool: WorkerPoolConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Default configuration. See the type docs for the budget values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-tick drain budget in milliseconds.
    #[must_use]
    pub const fn with_tick_budget_ms(mut self, ms: u64) -> Self {
        self.tick_budget_ms = ms;
        self
    }

    /// Set the final shutdown drain budget in milliseconds.
    #[must_use]
    pub const fn with_shutdown_drain_budget_ms(mut self, ms: u64) -> Self {
        self.shutdown_drain_budget_ms = ms;
        self
    }

    /// Set the timer stop wait ceiling in milliseconds.
    #[must_use]
    pub const fn with_timer_stop_wait_ms(mut self, ms: u64) -> Self {
        self.timer_stop_wait_ms = ms;
        self
    }

    /// Set the pool stop wait ceiling in milliseconds.
    #[must_use]
    pub const fn with_pool_stop_wait_ms(mut self, ms: u64) -> Self {
        self.pool_stop_wait_ms = ms;
        self
    }

    /// Set the main-loop backlog warning threshold.
    #[must_use]
    pub const fn with_backlog_warn_threshold(mut self, depth: usize) -> Self {
        self.backlog_warn_threshold = depth;
        self
    }

    /// Replace the worker pool configuration.
    #[must_use]
    pub fn with_worker_pool(mut self, pool: WorkerPoolConfig) -> Self {
        self.worker_pool = pool;
        self
    }

    /// Per-tick drain budget.
    #[must_use]
    pub const fn tick_budget(&self) -> Duration {
        Duration::from_millis(self.tick_budget_ms)
    }

    /// Final shutdown drain budget.
    #[must_use]
    pub const fn shutdown_drain_budget(&self) -> Duration {
        Duration::from_millis(self.shutdown_drain_budget_ms)
    }

    /// Timer service stop wait ceiling.
    #[must_use]
    pub const fn timer_stop_wait(&self) -> Duration {
        Duration::from_millis(self.timer_stop_wait_ms)
    }

    /// Worker pool stop wait ceiling.
    #[must_use]
    pub const fn pool_stop_wait(&self) -> Duration {
        Duration::from_millis(self.pool_stop_wait_ms)
    }

    /// Validate all configuration values.
    ///
    /// # Errors
    ///
    /// Returns a message describing the first invalid value.
    pub fn validate(&self) -> Result<(), String> {
        if self.tick_budget_ms == 0 {
            return Err("tick_budget_ms must be greater than 0".into());
        }
        if self.shutdown_drain_budget_ms < self.tick_budget_ms {
            return Err("shutdown_drain_budget_ms must be at least tick_budget_ms".into());
        }
        if self.backlog_warn_threshold == 0 {
            return Err("backlog_warn_threshold must be greater than 0".into());
        }
        self.worker_pool
            .validate()
            .map_err(|e| format!("worker_pool invalid: {e}"))?;
        Ok(())
    }

    /// Parse scheduler configuration from a JSON string and validate.
    ///
    /// # Errors
    ///
    /// Returns a message for either a parse failure or a validation failure.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load configuration from the environment.
    ///
    /// Reads `.env` if present, then an optional JSON override from
    /// `TICKWORK_CONFIG`. Falls back to defaults when the variable is unset.
    ///
    /// # Errors
    ///
    /// Fails when the variable is set but does not parse or validate.
    pub fn from_env() -> AppResult<Self> {
        let _ = dotenvy::dotenv();
        match std::env::var(CONFIG_ENV_VAR) {
            Ok(raw) => Self::from_json_str(&raw)
                .map_err(|e| anyhow::anyhow!(e))
                .with_context(|| format!("{CONFIG_ENV_VAR} is set but invalid")),
            Err(std::env::VarError::NotPresent) => Ok(Self::default()),
            Err(err) => Err(err).with_context(|| format!("{CONFIG_ENV_VAR} is not valid unicode")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(SchedulerConfig::default().validate().is_ok());
        let pool = WorkerPoolConfig::default();
        assert!(pool.validate().is_ok());
        assert!(pool.max_workers >= pool.core_workers);
    }

    #[test]
    fn rejects_zero_budget() {
        let cfg = SchedulerConfig::new().with_tick_budget_ms(0);
        assert!(cfg.validate().unwrap_err().contains("tick_budget_ms"));
    }

    #[test]
    fn rejects_shutdown_budget_below_tick_budget() {
        let cfg = SchedulerConfig::new()
            .with_tick_budget_ms(100)
            .with_shutdown_drain_budget_ms(50);
        assert!(cfg
            .validate()
            .unwrap_err()
            .contains("shutdown_drain_budget_ms"));
    }

    #[test]
    fn rejects_max_below_core() {
        let pool = WorkerPoolConfig::new()
            .with_core_workers(4)
            .with_max_workers(2);
        assert!(pool.validate().unwrap_err().contains("max_workers"));

        let cfg = SchedulerConfig::new().with_worker_pool(pool);
        assert!(cfg.validate().unwrap_err().contains("worker_pool invalid"));
    }

    #[test]
    fn parses_partial_json_with_defaults() {
        let cfg = SchedulerConfig::from_json_str(
            r#"{"tick_budget_ms": 40, "worker_pool": {"core_workers": 1, "max_workers": 2}}"#,
        )
        .unwrap();
        assert_eq!(cfg.tick_budget_ms, 40);
        assert_eq!(cfg.worker_pool.core_workers, 1);
        assert_eq!(cfg.worker_pool.max_workers, 2);
        // Unspecified fields keep their defaults.
        assert_eq!(cfg.shutdown_drain_budget_ms, 10_000);
        assert_eq!(cfg.worker_pool.backlog_capacity, 1024);
    }

    #[test]
    fn from_json_rejects_invalid_values() {
        let err = SchedulerConfig::from_json_str(r#"{"tick_budget_ms": 0}"#).unwrap_err();
        assert!(err.contains("tick_budget_ms"));

        let err = SchedulerConfig::from_json_str("not json").unwrap_err();
        assert!(err.contains("parse error"));
    }

    #[test]
    fn from_env_honors_the_override_variable() {
        // The only test touching this process-wide variable.
        std::env::set_var(CONFIG_ENV_VAR, r#"{"tick_budget_ms": 40}"#);
        let cfg = SchedulerConfig::from_env().unwrap();
        assert_eq!(cfg.tick_budget_ms, 40);

        std::env::set_var(CONFIG_ENV_VAR, r#"{"tick_budget_ms": 0}"#);
        let err = SchedulerConfig::from_env().unwrap_err();
        let chain = format!("{err:#}");
        assert!(chain.contains(CONFIG_ENV_VAR));
        assert!(chain.contains("tick_budget_ms"));

        std::env::remove_var(CONFIG_ENV_VAR);
        let cfg = SchedulerConfig::from_env().unwrap();
        assert_eq!(cfg.tick_budget_ms, 25);
    }

    #[test]
    fn json_round_trip_preserves_values() {
        let cfg = SchedulerConfig::new()
            .with_tick_budget_ms(30)
            .with_backlog_warn_threshold(500);
        let json = serde_json::to_string(&cfg).unwrap();
        let parsed = SchedulerConfig::from_json_str(&json).unwrap();
        assert_eq!(parsed.tick_budget_ms, 30);
        assert_eq!(parsed.backlog_warn_threshold, 500);
    }
}
