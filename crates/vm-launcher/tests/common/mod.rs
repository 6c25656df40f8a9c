//! In-memory collaborators for driving a [`Launcher`] end to end.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nix::unistd::Pid;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use vm_launcher::cmd_server::CommandClient;
use vm_launcher::events::NotificationEvent;
use vm_launcher::hypervisor::{
    DomainManager, HypervisorBackend, HypervisorConnection, HypervisorError, RawDomainEvent,
};
use vm_launcher::notify::{Notifier, NotifyError};
use vm_launcher::{Collaborators, Launcher, LauncherConfig, LauncherResult, VmIdentity};

pub const DOMAIN: &str = "default_vm1";
pub const VM_PID: i32 = 4_000_001;

pub fn vm() -> VmIdentity {
    VmIdentity {
        namespace: "default".into(),
        name: "vm1".into(),
        uid: "uid-1".into(),
    }
}

pub fn defined(uuid: &str) -> RawDomainEvent {
    RawDomainEvent {
        domain_name: DOMAIN.into(),
        uuid: Some(uuid.into()),
        event: "Defined".into(),
        detail: "Added".into(),
    }
}

pub fn undefined() -> RawDomainEvent {
    RawDomainEvent {
        domain_name: DOMAIN.into(),
        uuid: None,
        event: "Undefined".into(),
        detail: "Removed".into(),
    }
}

/// Replays injected events; each dispatch drains until the injector closes.
pub struct FakeConnection {
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<RawDomainEvent>>,
    closed: AtomicBool,
}

#[async_trait]
impl HypervisorConnection for FakeConnection {
    async fn dispatch_events(
        &self,
        sink: &mpsc::UnboundedSender<RawDomainEvent>,
    ) -> Result<(), HypervisorError> {
        let mut events = self.events.lock().await;
        match events.recv().await {
            Some(event) => {
                let _ = sink.send(event);
                Ok(())
            }
            None => Err(HypervisorError::Dispatch("injector gone".into())),
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Stopping the domain kills the VM process and reports the undefine.
pub struct FakeManager {
    pub stops: AtomicUsize,
    alive: Arc<AtomicBool>,
    injector: mpsc::UnboundedSender<RawDomainEvent>,
}

#[async_trait]
impl DomainManager for FakeManager {
    async fn stop(&self, _vm: &VmIdentity) -> Result<(), HypervisorError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.alive.store(false, Ordering::SeqCst);
        let _ = self.injector.send(undefined());
        Ok(())
    }
}

pub struct FakeBackend {
    connection: Arc<FakeConnection>,
    manager: Arc<FakeManager>,
    fail_connect: bool,
}

#[async_trait]
impl HypervisorBackend for FakeBackend {
    async fn connect(
        &self,
        _vm: &VmIdentity,
    ) -> Result<Arc<dyn HypervisorConnection>, HypervisorError> {
        if self.fail_connect {
            return Err(HypervisorError::Connection("hypervisor socket missing".into()));
        }
        Ok(self.connection.clone())
    }

    fn domain_manager(
        &self,
        _connection: &Arc<dyn HypervisorConnection>,
    ) -> Result<Arc<dyn DomainManager>, HypervisorError> {
        Ok(self.manager.clone())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub seen: Mutex<Vec<NotificationEvent>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        self.seen.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// A launcher wired to fakes, with scratch directories and test timings.
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub config: LauncherConfig,
    pub injector: mpsc::UnboundedSender<RawDomainEvent>,
    pub alive: Arc<AtomicBool>,
    pub connection: Arc<FakeConnection>,
    pub manager: Arc<FakeManager>,
    pub notifier: Arc<RecordingNotifier>,
    fail_connect: bool,
    command_client: Option<CommandClient>,
    signal_tx: Option<oneshot::Sender<()>>,
    signal_rx: Option<oneshot::Receiver<()>>,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let config = LauncherConfig {
            vm: vm(),
            share_dir: root.join("share"),
            private_dir: root.join("private"),
            ephemeral_disk_dir: root.join("ephemeral"),
            readiness_file: root.join("health"),
            hypervisor_uri: "test:///default".into(),
            vm_command_prefix: "qemu-system".into(),
            domain_start_timeout: Duration::from_secs(5),
            watchdog_interval: Duration::from_secs(1),
            grace_period: Duration::from_secs(1),
            command_ready_interval: Duration::from_millis(100),
            command_ready_timeout: Duration::from_secs(2),
            final_notify_timeout: Duration::from_secs(3),
        };

        let (injector, events) = mpsc::unbounded_channel();
        let alive = Arc::new(AtomicBool::new(true));
        let connection = Arc::new(FakeConnection {
            events: tokio::sync::Mutex::new(events),
            closed: AtomicBool::new(false),
        });
        let manager = Arc::new(FakeManager {
            stops: AtomicUsize::new(0),
            alive: alive.clone(),
            injector: injector.clone(),
        });
        let (signal_tx, signal_rx) = oneshot::channel();

        Self {
            dir,
            config,
            injector,
            alive,
            connection,
            manager,
            notifier: Arc::new(RecordingNotifier::default()),
            fail_connect: false,
            command_client: None,
            signal_tx: Some(signal_tx),
            signal_rx: Some(signal_rx),
        }
    }

    pub fn failing_connect(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    /// Check readiness against a socket nobody listens on.
    pub fn unanswered_command_service(mut self) -> Self {
        let elsewhere = self.dir.path().join("elsewhere.sock");
        self.command_client = Some(CommandClient::new(elsewhere));
        self
    }

    pub fn readiness_file(&self) -> &Path {
        &self.config.readiness_file
    }

    pub fn watchdog_file(&self) -> PathBuf {
        self.config.share_dir.join("watchdog-files").join(DOMAIN)
    }

    pub fn trigger_file(&self) -> PathBuf {
        self.config
            .share_dir
            .join("graceful-shutdown-trigger")
            .join(DOMAIN)
    }

    pub fn socket(&self) -> PathBuf {
        self.config.share_dir.join("uid-1.sock")
    }

    pub fn inject(&self, event: RawDomainEvent) {
        self.injector.send(event).unwrap();
    }

    pub fn stops(&self) -> usize {
        self.manager.stops.load(Ordering::SeqCst)
    }

    pub fn connection_closed(&self) -> bool {
        self.connection.closed.load(Ordering::SeqCst)
    }

    pub fn notified(&self) -> Vec<NotificationEvent> {
        self.notifier.seen.lock().unwrap().clone()
    }

    /// Deliver the (single) termination signal to the running launcher.
    pub fn send_signal(&mut self) {
        if let Some(tx) = self.signal_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Start the launcher on the current runtime.
    pub fn spawn(&mut self) -> JoinHandle<LauncherResult<()>> {
        let alive = self.alive.clone();
        let processes = move |_: &str| alive.load(Ordering::SeqCst).then(|| Pid::from_raw(VM_PID));
        let backend = Arc::new(FakeBackend {
            connection: self.connection.clone(),
            manager: self.manager.clone(),
            fail_connect: self.fail_connect,
        });
        let collaborators = Collaborators {
            backend,
            notifier: self.notifier.clone(),
            processes: Arc::new(processes),
        };
        let mut launcher = Launcher::new(self.config.clone(), collaborators);
        if let Some(client) = self.command_client.clone() {
            launcher = launcher.with_command_client(client);
        }

        let signal_rx = self.signal_rx.take().unwrap();
        tokio::spawn(launcher.run_with(move || {
            Ok(async move {
                if signal_rx.await.is_err() {
                    std::future::pending::<()>().await;
                }
                "SIGTERM"
            })
        }))
    }
}

/// Poll until `path` exists.
pub async fn wait_for_file(path: &Path, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !path.exists() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "{} did not appear within {timeout:?}",
            path.display()
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Await the launcher with an upper bound.
pub async fn finish(handle: JoinHandle<LauncherResult<()>>) -> LauncherResult<()> {
    tokio::time::timeout(Duration::from_secs(20), handle)
        .await
        .expect("launcher did not finish")
        .unwrap()
}
