//! Error types for the launcher.

use std::time::Duration;

use crate::hypervisor::HypervisorError;

pub type LauncherResult<T> = Result<T, LauncherError>;

/// Launcher error type covering all fatal and reportable failure modes.
#[derive(Debug, thiserror::Error)]
pub enum LauncherError {
    #[error("config: {0}")]
    Config(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),

    #[error("command service: {0}")]
    CommandService(String),

    #[error("watchdog: {0}")]
    Heartbeat(String),

    #[error("signal: {0}")]
    Signal(String),

    #[error("timed out after {timeout:?} waiting for {what}")]
    Timeout {
        what: &'static str,
        timeout: Duration,
    },

    #[error("supervisor: {0}")]
    Supervisor(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl LauncherError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}
