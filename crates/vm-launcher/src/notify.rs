use async_trait::async_trait;
use tracing::info;

use crate::config::VmIdentity;
use crate::events::NotificationEvent;

#[derive(Debug, thiserror::Error)]
#[error("notify: {0}")]
pub struct NotifyError(pub String);

/// Receiver of decoded domain events, normally the node-level agent.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), NotifyError>;
}

/// Notifier that records every event in the log and always succeeds.
pub struct LogNotifier {
    vm: VmIdentity,
}

impl LogNotifier {
    pub fn new(vm: VmIdentity) -> Self {
        Self { vm }
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        match event {
            NotificationEvent::Added(domain) => {
                info!(vm = %self.vm, domain = %domain.name, uuid = %domain.uuid, "domain defined");
            }
            NotificationEvent::Deleted => info!(vm = %self.vm, "domain deleted"),
            NotificationEvent::Other { event, detail } => {
                info!(vm = %self.vm, event = %event, detail = %detail, "domain event");
            }
        }
        Ok(())
    }
}
