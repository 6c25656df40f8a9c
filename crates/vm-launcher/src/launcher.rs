//! Lifecycle orchestration for one VM.
//!
//! Startup runs strictly in order and any failure aborts the launcher:
//! directories, hypervisor connection, domain manager, command service (and
//! its liveness check), watchdog, stale trigger cleanup, event bridge, signal
//! handling, readiness marker. The launcher then waits for the domain to be
//! defined, monitors the VM process and finally drives the VM down and waits
//! for the deletion to be confirmed.
//!
//! Two cancellation tokens are in play. `stop` ends the background workers
//! (watchdog, command service, event bridge) and is cancelled on every exit
//! path. `signalled` is a child of `stop` that OS signals cancel; it is what
//! the domain wait and the process monitor observe, so a signal shuts the VM
//! down without tearing the workers down first.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cmd_server::{self, CommandClient, CommandServer};
use crate::config::LauncherConfig;
use crate::error::{LauncherError, LauncherResult};
use crate::events::{self, DeletionConfirmation, EventBridge, EventFeed};
use crate::heartbeat;
use crate::hypervisor::{HypervisorBackend, HypervisorConnection, VmTerminator};
use crate::monitor::{ProcessMonitor, ShutdownReason};
use crate::notify::Notifier;
use crate::paths::{self, SharePaths};
use crate::process::{self, ProcessTable};

/// External collaborators, constructed once by the caller and shared with
/// every component that needs them.
#[derive(Clone)]
pub struct Collaborators {
    pub backend: Arc<dyn HypervisorBackend>,
    pub notifier: Arc<dyn Notifier>,
    pub processes: Arc<dyn ProcessTable>,
}

pub struct Launcher {
    config: LauncherConfig,
    collaborators: Collaborators,
    command_client: Option<CommandClient>,
}

impl Launcher {
    pub fn new(config: LauncherConfig, collaborators: Collaborators) -> Self {
        Self {
            config,
            collaborators,
            command_client: None,
        }
    }

    /// Check command service readiness through `client` instead of a client
    /// for the socket the launcher binds.
    pub fn with_command_client(mut self, client: CommandClient) -> Self {
        self.command_client = Some(client);
        self
    }

    /// Run until the VM is gone or a signal asks the launcher to stop.
    pub async fn run(self) -> LauncherResult<()> {
        self.run_with(os_signals).await
    }

    /// Like [`Launcher::run`], with the signal source supplied by the caller.
    ///
    /// `install_signals` is called once at the point in startup where signal
    /// handling is set up. The future it returns resolves with the name of
    /// the first signal received.
    pub async fn run_with<F, S>(self, install_signals: F) -> LauncherResult<()>
    where
        F: FnOnce() -> LauncherResult<S>,
        S: Future<Output = &'static str> + Send + 'static,
    {
        info!(vm = %self.config.vm, uid = %self.config.vm.uid, "starting launcher");
        paths::provision_directories(&self.config)?;

        let connection = self.collaborators.backend.connect(&self.config.vm).await?;
        let result = self.run_connected(connection.clone(), install_signals).await;
        connection.close().await;

        match &result {
            Ok(()) => info!(vm = %self.config.vm, "launcher exited"),
            Err(e) => error!(vm = %self.config.vm, error = %e, "launcher failed"),
        }
        result
    }

    async fn run_connected<F, S>(
        &self,
        connection: Arc<dyn HypervisorConnection>,
        install_signals: F,
    ) -> LauncherResult<()>
    where
        F: FnOnce() -> LauncherResult<S>,
        S: Future<Output = &'static str> + Send + 'static,
    {
        let config = &self.config;
        let share = SharePaths::new(config.share_dir.clone());

        let manager = self.collaborators.backend.domain_manager(&connection)?;
        let terminator = Arc::new(VmTerminator::new(manager, config.vm.clone()));

        let stop = CancellationToken::new();
        let _stop_on_exit = stop.clone().drop_guard();
        let signalled = stop.child_token();

        // --- command service ---
        let server = CommandServer::bind(share.command_socket(&config.vm.uid), terminator.clone())?;
        let client = self
            .command_client
            .clone()
            .unwrap_or_else(|| CommandClient::new(server.socket_path().to_path_buf()));
        let server_task = server.spawn(stop.clone());
        cmd_server::wait_until_ready(
            &client,
            config.command_ready_interval,
            config.command_ready_timeout,
        )
        .await?;

        // --- watchdog ---
        let mut watchdog = heartbeat::start(
            share.watchdog_file(&config.vm),
            config.watchdog_interval,
            stop.clone(),
        )?;

        let trigger = share.shutdown_trigger(&config.vm);
        clear_shutdown_trigger(&trigger)?;

        // --- domain events ---
        let EventBridge {
            feed,
            deletion,
            tasks: bridge_tasks,
        } = events::register(
            connection,
            self.collaborators.notifier.clone(),
            stop.clone(),
        );

        // --- signals ---
        let signals = install_signals()?;
        let relay_stop = stop.clone();
        let relay_signalled = signalled.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = relay_stop.cancelled() => {}
                name = signals => {
                    info!(signal = name, "received signal, shutting down");
                    relay_signalled.cancel();
                }
            }
        });

        mark_ready(&config.readiness_file)?;

        let lifecycle = self.supervise(feed, deletion, terminator, trigger, &signalled);
        tokio::pin!(lifecycle);
        let (result, watchdog_finished) = tokio::select! {
            result = &mut lifecycle => (result, false),
            exit = &mut watchdog => (Err(watchdog_exit(exit)), true),
        };

        stop.cancel();
        if !watchdog_finished {
            match watchdog.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "watchdog ended with error"),
                Err(e) => warn!(error = %e, "watchdog task failed"),
            }
        }
        if let Err(e) = server_task.await {
            warn!(error = %e, "command service task failed");
        }
        for task in bridge_tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "event bridge task failed");
            }
        }
        result
    }

    /// Wait for the domain, watch its process, then drive it down.
    async fn supervise(
        &self,
        mut feed: EventFeed,
        deletion: DeletionConfirmation,
        terminator: Arc<VmTerminator>,
        trigger: PathBuf,
        signalled: &CancellationToken,
    ) -> LauncherResult<()> {
        let config = &self.config;

        let Some(domain) = feed
            .wait_for_domain_uuid(config.domain_start_timeout, signalled)
            .await?
        else {
            info!("no domain to supervise");
            return Ok(());
        };
        info!(domain = %domain.name, uuid = %domain.uuid, "supervising domain");

        let monitor = ProcessMonitor::new(
            config.vm_command_prefix.clone(),
            trigger,
            self.collaborators.processes.clone(),
        )
        .with_grace_period(config.grace_period)
        .with_start_timeout(config.domain_start_timeout);

        let shutdown_terminator = terminator.clone();
        let outcome = monitor
            .run(signalled, move |pid, reason| async move {
                shutdown_vm(&shutdown_terminator, pid, reason).await;
            })
            .await;
        info!(?outcome, "VM process monitor finished");

        if let Err(e) = terminator.kill().await {
            warn!(error = %e, "final VM kill failed");
        }
        match deletion.wait(config.final_notify_timeout).await {
            Ok(()) => info!("domain deletion confirmed"),
            Err(e) => warn!(error = %e, "domain deletion not confirmed"),
        }
        Ok(())
    }
}

/// Stop the VM through the hypervisor, falling back to SIGTERM.
async fn shutdown_vm(terminator: &VmTerminator, pid: Option<Pid>, reason: ShutdownReason) {
    info!(?reason, pid = ?pid, "shutting down VM");
    let Err(e) = terminator.kill().await else {
        return;
    };
    warn!(error = %e, "hypervisor stop failed, falling back to SIGTERM");
    match pid {
        Some(pid) => {
            if let Err(e) = process::send_signal(pid, Signal::SIGTERM) {
                error!(%pid, error = %e, "failed to signal VM process");
            }
        }
        None => warn!("VM process not found, nothing to signal"),
    }
}

fn watchdog_exit(exit: Result<LauncherResult<()>, JoinError>) -> LauncherError {
    match exit {
        Ok(Err(e)) => e,
        Ok(Ok(())) => LauncherError::Heartbeat("worker stopped unexpectedly".into()),
        Err(e) => LauncherError::Internal(format!("watchdog task: {e}")),
    }
}

fn clear_shutdown_trigger(trigger: &Path) -> LauncherResult<()> {
    match std::fs::remove_file(trigger) {
        Ok(()) => {
            info!(path = %trigger.display(), "removed stale shutdown trigger");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(LauncherError::io(
            format!("remove {}", trigger.display()),
            e,
        )),
    }
}

fn mark_ready(readiness_file: &Path) -> LauncherResult<()> {
    if let Some(parent) = readiness_file.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| LauncherError::io(format!("create {}", parent.display()), e))?;
    }
    std::fs::File::create(readiness_file)
        .map_err(|e| LauncherError::io(format!("create {}", readiness_file.display()), e))?;
    info!(path = %readiness_file.display(), "marked as ready");
    Ok(())
}

/// Register handlers for the signals that stop the launcher.
fn os_signals() -> LauncherResult<impl Future<Output = &'static str> + Send + 'static> {
    let install = |kind: SignalKind, name: &str| {
        signal(kind).map_err(|e| LauncherError::Signal(format!("install {name} handler: {e}")))
    };
    let mut interrupt = install(SignalKind::interrupt(), "SIGINT")?;
    let mut hangup = install(SignalKind::hangup(), "SIGHUP")?;
    let mut terminate = install(SignalKind::terminate(), "SIGTERM")?;
    let mut quit = install(SignalKind::quit(), "SIGQUIT")?;
    debug!("signal handlers installed");

    Ok(async move {
        tokio::select! {
            _ = interrupt.recv() => "SIGINT",
            _ = hangup.recv() => "SIGHUP",
            _ = terminate.recv() => "SIGTERM",
            _ = quit.recv() => "SIGQUIT",
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clearing_missing_trigger_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        clear_shutdown_trigger(&dir.path().join("default_vm1")).unwrap();
    }

    #[test]
    fn clearing_removes_stale_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let trigger = dir.path().join("default_vm1");
        std::fs::write(&trigger, b"").unwrap();

        clear_shutdown_trigger(&trigger).unwrap();
        assert!(!trigger.exists());
    }

    #[test]
    fn mark_ready_creates_marker() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("run").join("health");

        mark_ready(&marker).unwrap();
        assert!(marker.exists());
    }

    #[test]
    fn watchdog_exit_reasons() {
        let err = watchdog_exit(Ok(Err(LauncherError::Heartbeat("disk full".into()))));
        assert!(err.to_string().contains("disk full"));

        let err = watchdog_exit(Ok(Ok(())));
        assert!(matches!(err, LauncherError::Heartbeat(_)));
    }

    #[tokio::test]
    async fn os_signals_install() {
        let signals = os_signals().unwrap();
        let waited = tokio::time::timeout(std::time::Duration::from_millis(20), signals).await;
        assert!(waited.is_err(), "no signal was sent");
    }
}
