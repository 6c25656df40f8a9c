//! `virsh`-backed hypervisor adapter.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::command::{self, CommandError};
use crate::config::VmIdentity;
use crate::constants;
use crate::hypervisor::{
    DomainManager, HypervisorBackend, HypervisorConnection, HypervisorError, RawDomainEvent,
};

pub struct VirshBackend {
    uri: String,
}

impl VirshBackend {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }

    fn virsh(&self) -> Result<PathBuf, HypervisorError> {
        which::which("virsh")
            .map_err(|e| HypervisorError::Connection(format!("virsh not found: {e}")))
    }
}

#[async_trait]
impl HypervisorBackend for VirshBackend {
    async fn connect(
        &self,
        vm: &VmIdentity,
    ) -> Result<Arc<dyn HypervisorConnection>, HypervisorError> {
        let virsh = self.virsh()?;
        let program = virsh.to_string_lossy().into_owned();
        let version = command::exec_timeout(
            &program,
            &["-c", &self.uri, "version"],
            Duration::from_secs(constants::HYPERVISOR_CONNECT_TIMEOUT_SECS),
        )
        .await
            .map_err(|e| HypervisorError::Connection(e.to_string()))?;
        info!(uri = %self.uri, version = %version.lines().next().unwrap_or_default(), "connected to hypervisor");

        Ok(Arc::new(VirshConnection {
            program,
            uri: self.uri.clone(),
            domain_name: vm.domain_name(),
        }))
    }

    fn domain_manager(
        &self,
        _connection: &Arc<dyn HypervisorConnection>,
    ) -> Result<Arc<dyn DomainManager>, HypervisorError> {
        let virsh = self.virsh()?;
        Ok(Arc::new(VirshDomainManager {
            program: virsh.to_string_lossy().into_owned(),
            uri: self.uri.clone(),
        }))
    }
}

pub struct VirshConnection {
    program: String,
    uri: String,
    domain_name: String,
}

impl VirshConnection {
    async fn domain_uuid(&self) -> Result<String, CommandError> {
        command::exec(&self.program, &["-c", &self.uri, "domuuid", &self.domain_name]).await
    }
}

#[async_trait]
impl HypervisorConnection for VirshConnection {
    async fn dispatch_events(
        &self,
        sink: &mpsc::UnboundedSender<RawDomainEvent>,
    ) -> Result<(), HypervisorError> {
        let mut child = Command::new(&self.program)
            .args(["-c", &self.uri, "event", "--all", "--event", "lifecycle", "--loop"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HypervisorError::Dispatch(format!("spawn virsh event: {e}")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HypervisorError::Dispatch("virsh event has no stdout".into()))?;
        debug!(domain = %self.domain_name, "event stream opened");

        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| HypervisorError::Dispatch(format!("read virsh event: {e}")))?
        {
            let Some((domain, event, detail)) = parse_event_line(&line) else {
                continue;
            };
            if domain != self.domain_name {
                continue;
            }
            let uuid = if event == "Defined" {
                match self.domain_uuid().await {
                    Ok(uuid) => Some(uuid),
                    Err(e) => {
                        warn!(error = %e, "failed to resolve domain uuid");
                        None
                    }
                }
            } else {
                None
            };
            let raw = RawDomainEvent {
                domain_name: domain.to_string(),
                uuid,
                event: event.to_string(),
                detail: detail.to_string(),
            };
            if sink.send(raw).is_err() {
                return Ok(());
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| HypervisorError::Dispatch(format!("wait virsh event: {e}")))?;
        Err(HypervisorError::Dispatch(format!(
            "virsh event exited with {status}"
        )))
    }
}

/// Parse a `virsh event` lifecycle line into `(domain, event, detail)`.
///
/// Accepts both `for domain 'name': Defined Added` and the older unquoted
/// `for domain name: Defined Added` forms.
fn parse_event_line(line: &str) -> Option<(&str, &str, &str)> {
    let rest = line.trim().strip_prefix("event 'lifecycle' for domain ")?;
    let (domain, rest) = match rest.strip_prefix('\'') {
        Some(quoted) => {
            let end = quoted.find("':")?;
            (quoted.get(..end)?, quoted.get(end + 2..)?)
        }
        None => {
            let end = rest.find(':')?;
            (rest.get(..end)?, rest.get(end + 1..)?)
        }
    };
    let mut words = rest.split_whitespace();
    let event = words.next()?;
    let detail = words.next().unwrap_or_default();
    Some((domain, event, detail))
}

pub struct VirshDomainManager {
    program: String,
    uri: String,
}

impl VirshDomainManager {
    async fn run_tolerating_missing(
        &self,
        action: &str,
        domain: &str,
    ) -> Result<(), HypervisorError> {
        match command::exec(&self.program, &["-c", &self.uri, action, domain]).await {
            Ok(_) => {
                info!(domain, action, "domain action completed");
                Ok(())
            }
            Err(e) if is_missing_domain(&e.detail) => {
                debug!(domain, action, "domain already gone");
                Ok(())
            }
            Err(e) => Err(HypervisorError::Domain {
                domain: domain.to_string(),
                detail: e.to_string(),
            }),
        }
    }
}

#[async_trait]
impl DomainManager for VirshDomainManager {
    async fn stop(&self, vm: &VmIdentity) -> Result<(), HypervisorError> {
        let domain = vm.domain_name();
        self.run_tolerating_missing("destroy", &domain).await?;
        self.run_tolerating_missing("undefine", &domain).await
    }
}

/// Whether a virsh error means the domain is already stopped or removed.
fn is_missing_domain(detail: &str) -> bool {
    let detail = detail.to_ascii_lowercase();
    ["domain not found", "failed to get domain", "domain is not running", "not running"]
        .iter()
        .any(|needle| detail.contains(needle))
}
