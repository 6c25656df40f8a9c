//! Fork supervisor: the parent half of the launcher.
//!
//! The supervisor re-executes the launcher as a child (with `--no-fork`),
//! relays termination signals to it and waits for it to exit. Once the child
//! is gone it sweeps the process table for a leftover VM process, sends it
//! SIGTERM and waits a bounded time for it to disappear, so the VM never
//! outlives its launcher.
//!
//! Signal handling follows the usual init pattern: `sigaction` handlers only
//! record the signal in an atomic bit set, and a short-tick loop forwards
//! every signal recorded since the previous tick.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::constants;
use crate::error::{LauncherError, LauncherResult};
use crate::process::{self, ProcFs, ProcessTable};

/// Signals received and not yet forwarded, one bit per signal number.
static PENDING_SIGNALS: AtomicU32 = AtomicU32::new(0);

/// Forwarding order within one tick; SIGTERM goes last.
const RELAYED_SIGNALS: [libc::c_int; 4] = [libc::SIGHUP, libc::SIGINT, libc::SIGQUIT, libc::SIGTERM];

extern "C" fn record_signal(sig: libc::c_int) {
    if (0..32).contains(&sig) {
        PENDING_SIGNALS.fetch_or(1 << sig, Ordering::SeqCst);
    }
}

/// The relayed signals whose bits are set in `mask`, in forwarding order.
fn pending_signals(mask: u32) -> Vec<Signal> {
    RELAYED_SIGNALS
        .into_iter()
        .filter(|sig| mask & (1 << sig) != 0)
        .filter_map(|sig| Signal::try_from(sig).ok())
        .collect()
}

/// Installed relay handlers; the previous dispositions come back on drop.
struct RelayHandlers {
    previous: Vec<(libc::c_int, libc::sigaction)>,
}

impl RelayHandlers {
    fn install() -> LauncherResult<Self> {
        PENDING_SIGNALS.store(0, Ordering::SeqCst);
        let mut handlers = Self {
            previous: Vec::with_capacity(RELAYED_SIGNALS.len()),
        };
        for sig in RELAYED_SIGNALS {
            // SAFETY: a zeroed sigaction is valid; handler and flags are set below.
            let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
            action.sa_sigaction = record_signal as *const () as libc::sighandler_t;
            action.sa_flags = libc::SA_RESTART;
            // SAFETY: zeroed storage for the previous action.
            let mut old: libc::sigaction = unsafe { std::mem::zeroed() };
            // SAFETY: both pointers refer to initialized sigaction values.
            let rc = unsafe { libc::sigaction(sig, &action, &mut old) };
            if rc != 0 {
                return Err(LauncherError::Signal(format!(
                    "install handler for signal {sig}: {}",
                    std::io::Error::last_os_error()
                )));
            }
            handlers.previous.push((sig, old));
        }
        Ok(handlers)
    }
}

impl Drop for RelayHandlers {
    fn drop(&mut self) {
        for (sig, old) in &self.previous {
            // SAFETY: `old` was filled in by a successful sigaction call.
            unsafe {
                libc::sigaction(*sig, old, std::ptr::null_mut());
            }
        }
    }
}

pub struct ForkSupervisor {
    program: PathBuf,
    args: Vec<OsString>,
    command_prefix: String,
    processes: Arc<dyn ProcessTable>,
    sweep_interval: Duration,
    sweep_timeout: Duration,
}

impl ForkSupervisor {
    pub fn new(
        program: impl Into<PathBuf>,
        args: impl IntoIterator<Item = impl Into<OsString>>,
        command_prefix: impl Into<String>,
    ) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            command_prefix: command_prefix.into(),
            processes: Arc::new(ProcFs::new()),
            sweep_interval: Duration::from_secs(constants::SWEEP_POLL_INTERVAL_SECS),
            sweep_timeout: Duration::from_secs(constants::SWEEP_TIMEOUT_SECS),
        }
    }

    /// Supervise a copy of the running executable with the same arguments.
    pub fn for_current_exe(command_prefix: impl Into<String>) -> LauncherResult<Self> {
        let program = std::env::current_exe()
            .map_err(|e| LauncherError::io("resolve current executable", e))?;
        Ok(Self::new(program, std::env::args_os().skip(1), command_prefix))
    }

    pub fn with_process_table(mut self, processes: Arc<dyn ProcessTable>) -> Self {
        self.processes = processes;
        self
    }

    pub fn with_sweep(mut self, interval: Duration, timeout: Duration) -> Self {
        self.sweep_interval = interval;
        self.sweep_timeout = timeout;
        self
    }

    /// Run the child to completion and sweep up after it.
    ///
    /// Returns the child's exit code, or 1 when it was killed by a signal or
    /// its status could not be collected.
    pub fn run(self) -> LauncherResult<i32> {
        let handlers = RelayHandlers::install()?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(constants::NO_FORK_FLAG)
            .spawn()
            .map_err(|e| {
                LauncherError::Supervisor(format!("spawn {}: {e}", self.program.display()))
            })?;
        let pid = i32::try_from(child.id())
            .map(Pid::from_raw)
            .map_err(|e| LauncherError::Supervisor(format!("child pid: {e}")))?;
        info!(%pid, program = %self.program.display(), "launcher child started");

        let code = relay_until_exit(&mut child, pid);
        drop(handlers);
        info!(%pid, code, "launcher child exited");

        self.sweep()?;
        Ok(code)
    }

    /// SIGTERM a leftover VM process and wait for it to go away.
    fn sweep(&self) -> LauncherResult<()> {
        let Some(pid) = self.processes.find(&self.command_prefix) else {
            debug!(prefix = %self.command_prefix, "no leftover VM process");
            return Ok(());
        };
        info!(%pid, "terminating leftover VM process");
        process::send_signal(pid, Signal::SIGTERM)
            .map_err(|e| LauncherError::Supervisor(e.to_string()))?;

        let deadline = Instant::now() + self.sweep_timeout;
        loop {
            std::thread::sleep(self.sweep_interval);
            if self.processes.find(&self.command_prefix).is_none() {
                info!(%pid, "leftover VM process gone");
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!(%pid, timeout = ?self.sweep_timeout, "leftover VM process still running");
                return Ok(());
            }
        }
    }
}

/// Forward recorded signals to the child until it exits; returns its code.
fn relay_until_exit(child: &mut Child, pid: Pid) -> i32 {
    let tick = Duration::from_millis(constants::SUPERVISOR_TICK_MS);
    loop {
        for signal in pending_signals(PENDING_SIGNALS.swap(0, Ordering::SeqCst)) {
            info!(%pid, %signal, "forwarding signal to launcher child");
            if let Err(e) = process::send_signal(pid, signal) {
                warn!(error = %e, "signal forwarding failed");
            }
        }

        match child.try_wait() {
            Ok(Some(status)) => return status.code().unwrap_or(1),
            Ok(None) => {}
            Err(e) => {
                warn!(%pid, error = %e, "cannot collect launcher child status");
                return 1;
            }
        }
        std::thread::sleep(tick);
    }
}
