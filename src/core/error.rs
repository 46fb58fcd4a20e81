//! Error types for scheduler operations.

use thiserror::Error;

/// Errors produced at scheduler construction time.
///
/// These are configuration errors: fatal, not recoverable, intended to fail
/// fast during host startup. Task execution failures never surface here;
/// they are contained at the execution site.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A scheduler is already live in this process.
    #[error("a scheduler is already running in this process; shut it down before constructing another")]
    AlreadyRunning,
    /// The host owner token has already been claimed.
    #[error("the host owner token has already been claimed for this process")]
    OwnerClaimed,
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
