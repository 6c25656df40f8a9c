//! Grace-period-aware monitor for the VM process.
//!
//! ```text
//!            trigger file seen              deadline passed, process alive
//! Watching ───────────────────► GraceArmed ───────────────────────────────► Done (callback: GracePeriodExpired)
//!    │                              │
//!    │ process gone                 │ process gone
//!    ▼                              ▼
//!  Done (no callback)             Done (no callback)
//!
//! cancellation in Watching or GraceArmed ─► Done (callback: Cancelled)
//! ```
//!
//! The shutdown callback is an `FnOnce`, so it runs at most once per monitor.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use nix::unistd::Pid;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::constants;
use crate::process::ProcessTable;

/// Why the shutdown callback was invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// The grace period after a shutdown request elapsed with the process
    /// still running; the VM should be forced down.
    GracePeriodExpired,
    /// The launcher was asked to stop; the VM should be shut down.
    Cancelled,
}

/// How a monitor run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorOutcome {
    /// The process went away on its own.
    Exited,
    /// The process never appeared within the start timeout.
    NeverStarted,
    /// The grace period expired and the callback was invoked.
    GracePeriodExpired,
    /// Cancellation fired and the callback was invoked.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MonitorState {
    Watching,
    GraceArmed { deadline: Instant },
}

pub struct ProcessMonitor {
    command_prefix: String,
    trigger_file: PathBuf,
    processes: Arc<dyn ProcessTable>,
    grace_period: Duration,
    start_timeout: Duration,
    poll_interval: Duration,
}

impl ProcessMonitor {
    pub fn new(
        command_prefix: impl Into<String>,
        trigger_file: PathBuf,
        processes: Arc<dyn ProcessTable>,
    ) -> Self {
        Self {
            command_prefix: command_prefix.into(),
            trigger_file,
            processes,
            grace_period: Duration::from_secs(constants::GRACE_PERIOD_SECS),
            start_timeout: Duration::from_secs(constants::DOMAIN_START_TIMEOUT_SECS),
            poll_interval: Duration::from_millis(constants::MONITOR_POLL_INTERVAL_MS),
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// How long a process that has not been seen yet may stay absent.
    pub fn with_start_timeout(mut self, start_timeout: Duration) -> Self {
        self.start_timeout = start_timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Watch the process until it exits, the grace period after a shutdown
    /// request expires, or `cancel` fires.
    ///
    /// `on_shutdown` receives the process if it is currently known.
    pub async fn run<F, Fut>(self, cancel: &CancellationToken, on_shutdown: F) -> MonitorOutcome
    where
        F: FnOnce(Option<Pid>, ShutdownReason) -> Fut,
        Fut: Future<Output = ()>,
    {
        let started = Instant::now();
        let mut state = MonitorState::Watching;
        let mut last_seen: Option<Pid> = None;

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let pid = self.processes.find(&self.command_prefix).or(last_seen);
                    info!(pid = ?pid, "stop requested, shutting down VM process");
                    on_shutdown(pid, ShutdownReason::Cancelled).await;
                    return MonitorOutcome::Cancelled;
                }
                _ = ticker.tick() => {}
            }

            let Some(pid) = self.processes.find(&self.command_prefix) else {
                if last_seen.is_some() {
                    info!(prefix = %self.command_prefix, "VM process exited");
                    return MonitorOutcome::Exited;
                }
                if started.elapsed() >= self.start_timeout {
                    warn!(
                        prefix = %self.command_prefix,
                        timeout = ?self.start_timeout,
                        "VM process never appeared"
                    );
                    return MonitorOutcome::NeverStarted;
                }
                continue;
            };
            if last_seen != Some(pid) {
                debug!(%pid, "VM process located");
            }
            last_seen = Some(pid);

            match state {
                MonitorState::Watching => {
                    if self.trigger_file.exists() {
                        let deadline = Instant::now() + self.grace_period;
                        info!(
                            %pid,
                            grace_period = ?self.grace_period,
                            "graceful shutdown requested, grace period started"
                        );
                        state = MonitorState::GraceArmed { deadline };
                    }
                }
                MonitorState::GraceArmed { deadline } => {
                    if Instant::now() >= deadline {
                        warn!(%pid, "grace period expired, forcing VM shutdown");
                        on_shutdown(Some(pid), ShutdownReason::GracePeriodExpired).await;
                        return MonitorOutcome::GracePeriodExpired;
                    }
                }
            }
        }
    }
}
