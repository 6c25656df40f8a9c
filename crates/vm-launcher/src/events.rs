//! Bridge from the hypervisor's pushed lifecycle events to the launcher.
//!
//! [`register`] spawns two tasks. The pump keeps the hypervisor's dispatch
//! primitive running, retrying after failures until shutdown. The forwarder
//! decodes each raw event once, hands it to the [`Notifier`], and pushes
//! state transitions into a bounded [`EventFeed`]. A transition enters the
//! feed even when the notifier fails to take it. Once a Deleted event has
//! been delivered to the notifier the [`DeletionConfirmation`] resolves.
//! Every event after Deleted is dropped.
//!
//! Only transitions (the first Added and the Deleted) enter the feed. The
//! launcher stops reading the feed once the domain is known, and a feed full
//! of unread events would otherwise stall the forwarder before it could
//! deliver the Deleted notification.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::constants;
use crate::error::{LauncherError, LauncherResult};
use crate::hypervisor::{HypervisorConnection, RawDomainEvent};
use crate::notify::Notifier;

/// The VM's domain as known to the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Domain {
    pub name: String,
    pub uuid: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DomainState {
    #[default]
    Unknown,
    Added,
    Deleted,
}

impl fmt::Display for DomainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DomainState::Unknown => "unknown",
            DomainState::Added => "added",
            DomainState::Deleted => "deleted",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationEvent {
    Added(Domain),
    Deleted,
    Other { event: String, detail: String },
}

/// Decode a raw hypervisor event.
///
/// `Defined` events carrying a UUID become [`NotificationEvent::Added`] and
/// `Undefined` events become [`NotificationEvent::Deleted`].
pub fn decode(raw: &RawDomainEvent) -> NotificationEvent {
    match (raw.event.as_str(), raw.uuid.as_deref()) {
        ("Defined", Some(uuid)) if !uuid.is_empty() => NotificationEvent::Added(Domain {
            name: raw.domain_name.clone(),
            uuid: uuid.to_string(),
        }),
        ("Undefined", _) => NotificationEvent::Deleted,
        _ => NotificationEvent::Other {
            event: raw.event.clone(),
            detail: raw.detail.clone(),
        },
    }
}

/// Receiving side of the bounded event feed.
pub struct EventFeed {
    rx: mpsc::Receiver<NotificationEvent>,
}

impl EventFeed {
    /// Wait for the domain to be defined.
    ///
    /// Returns `Ok(None)` when the domain is deleted before it was ever added
    /// or when `cancel` fires, and a timeout error when nothing arrives
    /// within `timeout`.
    pub async fn wait_for_domain_uuid(
        &mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> LauncherResult<Option<Domain>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("stop requested while waiting for the domain");
                    return Ok(None);
                }
                event = self.rx.recv() => match event {
                    Some(NotificationEvent::Added(domain)) => {
                        info!(domain = %domain.name, uuid = %domain.uuid, "domain detected");
                        return Ok(Some(domain));
                    }
                    Some(NotificationEvent::Deleted) => {
                        info!("domain deleted before it was defined");
                        return Ok(None);
                    }
                    // the forwarder feeds transitions only
                    Some(NotificationEvent::Other { .. }) => continue,
                    None => {
                        return Err(LauncherError::Internal(
                            "event feed closed while waiting for the domain".into(),
                        ));
                    }
                },
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(LauncherError::Timeout {
                        what: "domain to be defined",
                        timeout,
                    });
                }
            }
        }
    }
}

/// Resolves once the Deleted event has been delivered to the notifier.
pub struct DeletionConfirmation {
    rx: oneshot::Receiver<()>,
}

impl DeletionConfirmation {
    pub async fn wait(self, timeout: Duration) -> LauncherResult<()> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(LauncherError::Internal(
                "event bridge stopped before the deletion was confirmed".into(),
            )),
            Err(_) => Err(LauncherError::Timeout {
                what: "domain deletion notification",
                timeout,
            }),
        }
    }
}

/// Handles returned by [`register`].
pub struct EventBridge {
    pub feed: EventFeed,
    pub deletion: DeletionConfirmation,
    pub tasks: Vec<JoinHandle<()>>,
}

/// Start pumping hypervisor events until `shutdown` fires.
pub fn register(
    connection: Arc<dyn HypervisorConnection>,
    notifier: Arc<dyn Notifier>,
    shutdown: CancellationToken,
) -> EventBridge {
    let (raw_tx, raw_rx) = mpsc::unbounded_channel();
    let (feed_tx, feed_rx) = mpsc::channel(constants::EVENT_FEED_CAPACITY);
    let (deleted_tx, deleted_rx) = oneshot::channel();

    let pump = tokio::spawn(pump_events(connection, raw_tx, shutdown.clone()));
    let forwarder = tokio::spawn(forward_events(raw_rx, notifier, feed_tx, deleted_tx, shutdown));

    EventBridge {
        feed: EventFeed { rx: feed_rx },
        deletion: DeletionConfirmation { rx: deleted_rx },
        tasks: vec![pump, forwarder],
    }
}

async fn pump_events(
    connection: Arc<dyn HypervisorConnection>,
    sink: mpsc::UnboundedSender<RawDomainEvent>,
    shutdown: CancellationToken,
) {
    let retry_delay = Duration::from_secs(constants::EVENT_RETRY_DELAY_SECS);
    loop {
        let result = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            result = connection.dispatch_events(&sink) => result,
        };
        match result {
            Ok(()) => tokio::task::yield_now().await,
            Err(e) => {
                error!(error = %e, "event dispatch failed, retrying");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(retry_delay) => {}
                }
            }
        }
    }
    debug!("event pump stopped");
}

async fn forward_events(
    mut raw: mpsc::UnboundedReceiver<RawDomainEvent>,
    notifier: Arc<dyn Notifier>,
    feed: mpsc::Sender<NotificationEvent>,
    deleted: oneshot::Sender<()>,
    shutdown: CancellationToken,
) {
    let mut state = DomainState::Unknown;
    let mut deleted = Some(deleted);

    loop {
        let raw_event = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            event = raw.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        if state == DomainState::Deleted {
            debug!(event = %raw_event.event, "dropping event after deletion");
            continue;
        }

        let event = decode(&raw_event);
        let delivered = match notifier.notify(&event).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, event = ?event, "failed to deliver domain event");
                false
            }
        };

        let transition = match (&event, state) {
            (NotificationEvent::Added(_), DomainState::Unknown) => Some(DomainState::Added),
            (NotificationEvent::Deleted, _) => Some(DomainState::Deleted),
            _ => None,
        };
        let Some(next) = transition else {
            continue;
        };
        debug!(from = %state, to = %next, "domain state changed");
        state = next;

        // The launcher's final wait is for the handler to learn of the
        // deletion, so an undelivered Deleted leaves the confirmation pending.
        if next == DomainState::Deleted
            && delivered
            && let Some(tx) = deleted.take()
        {
            let _ = tx.send(());
        }
        if feed.send(event).await.is_err() {
            debug!("event feed receiver dropped");
        }
    }
    debug!("event forwarder stopped");
}
