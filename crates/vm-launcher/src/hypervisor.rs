//! Hypervisor-facing collaborator traits and the shared VM terminator.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info};

use crate::command::CommandError;
use crate::config::VmIdentity;

#[derive(Debug, thiserror::Error)]
pub enum HypervisorError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("connection: {0}")]
    Connection(String),

    #[error("event dispatch: {0}")]
    Dispatch(String),

    #[error("domain {domain}: {detail}")]
    Domain { domain: String, detail: String },
}

/// Lifecycle event as reported by the hypervisor, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDomainEvent {
    pub domain_name: String,
    /// Present once the domain is defined.
    pub uuid: Option<String>,
    /// Event kind, e.g. `Defined`, `Started`, `Undefined`.
    pub event: String,
    /// Event detail, e.g. `Added`, `Booted`, `Removed`.
    pub detail: String,
}

/// An open connection to the hypervisor.
#[async_trait]
pub trait HypervisorConnection: Send + Sync {
    /// Run the event-dispatch pump, pushing every observed lifecycle event of
    /// the watched domain into `sink`. Returns when dispatch stops; callers
    /// loop on it.
    async fn dispatch_events(
        &self,
        sink: &mpsc::UnboundedSender<RawDomainEvent>,
    ) -> Result<(), HypervisorError>;

    /// Release the connection.
    async fn close(&self) {}
}

/// Domain-manager facade.
#[async_trait]
pub trait DomainManager: Send + Sync {
    /// Stop the VM's domain. Must be idempotent: stopping a domain that is
    /// already gone succeeds.
    async fn stop(&self, vm: &VmIdentity) -> Result<(), HypervisorError>;
}

/// Connects to the hypervisor and builds the domain manager on top of it.
#[async_trait]
pub trait HypervisorBackend: Send + Sync {
    async fn connect(
        &self,
        vm: &VmIdentity,
    ) -> Result<Arc<dyn HypervisorConnection>, HypervisorError>;

    fn domain_manager(
        &self,
        connection: &Arc<dyn HypervisorConnection>,
    ) -> Result<Arc<dyn DomainManager>, HypervisorError>;
}

/// The single kill operation shared by the grace-escalation path, the final
/// shutdown path and the command socket.
///
/// Once a stop request has succeeded, later calls return immediately.
/// Concurrent callers queue on `stopping`, so the manager sees one stop at a
/// time.
pub struct VmTerminator {
    manager: Arc<dyn DomainManager>,
    vm: VmIdentity,
    stopping: Mutex<()>,
    requested: AtomicBool,
}

impl VmTerminator {
    pub fn new(manager: Arc<dyn DomainManager>, vm: VmIdentity) -> Self {
        Self {
            manager,
            vm,
            stopping: Mutex::new(()),
            requested: AtomicBool::new(false),
        }
    }

    pub async fn kill(&self) -> Result<(), HypervisorError> {
        let _stopping = self.stopping.lock().await;
        if self.requested.load(Ordering::SeqCst) {
            debug!(vm = %self.vm, "kill already requested");
            return Ok(());
        }
        self.manager.stop(&self.vm).await?;
        self.requested.store(true, Ordering::SeqCst);
        info!(vm = %self.vm, "VM kill requested");
        Ok(())
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}
