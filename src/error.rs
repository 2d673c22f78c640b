//! # Error types used by the daemon.
//!
//! [`DaemonError`] covers fatal daemon-level failures: anything that prevents
//! the daemon from reaching (or staying in) its accept loop. Task-level
//! failures never surface here; they deactivate the affected task with a
//! recorded reason instead.

use std::path::PathBuf;

use thiserror::Error;

/// Fatal daemon-level failures.
///
/// Any of these aborts startup or tears down the accept loop. Per-task and
/// per-connection errors are handled locally and never become a `DaemonError`.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum DaemonError {
    /// The HOME environment variable is missing, so the cache root cannot
    /// be located.
    #[error("failed to read HOME env var")]
    HomeNotSet,

    /// Creating or emptying a piece of the cache directory layout failed.
    #[error("failed to prepare {}: {source}", path.display())]
    CacheLayout {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A path in the cache directory exists but has the wrong type.
    #[error("{} exists but is not a {expected}", path.display())]
    CachePathKind { path: PathBuf, expected: &'static str },

    /// The message log file could not be created.
    #[error("failed to create message log file: {0}")]
    MessageLog(#[source] std::io::Error),

    /// The TCP listener could not be bound.
    #[error("failed to bind listener: {0}")]
    Bind(#[source] std::io::Error),

    /// The accept loop failed for a reason other than shutdown.
    #[error("server failure: {0}")]
    Accept(#[source] std::io::Error),
}

impl DaemonError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            DaemonError::HomeNotSet => "home_not_set",
            DaemonError::CacheLayout { .. } => "cache_layout",
            DaemonError::CachePathKind { .. } => "cache_path_kind",
            DaemonError::MessageLog(_) => "message_log",
            DaemonError::Bind(_) => "bind",
            DaemonError::Accept(_) => "accept",
        }
    }
}
