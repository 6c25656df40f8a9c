//! Command service on the launcher's Unix socket.
//!
//! One JSON request per line, one JSON response per line:
//!
//! ```text
//! -> {"command":"ping"}
//! <- {"ok":true}
//! -> {"command":"kill"}
//! <- {"ok":false,"error":"domain default_vm1: ..."}
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::constants;
use crate::error::{LauncherError, LauncherResult};
use crate::hypervisor::VmTerminator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Request {
    Ping,
    Kill,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
        }
    }
}

pub struct CommandServer {
    socket_path: PathBuf,
    listener: UnixListener,
    terminator: Arc<VmTerminator>,
}

impl CommandServer {
    /// Bind the socket, replacing a stale one left by an earlier run.
    pub fn bind(socket_path: PathBuf, terminator: Arc<VmTerminator>) -> LauncherResult<Self> {
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| LauncherError::io(format!("create {}", parent.display()), e))?;
        }
        match std::fs::remove_file(&socket_path) {
            Ok(()) => debug!(path = %socket_path.display(), "removed stale command socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(LauncherError::io(
                    format!("remove stale socket {}", socket_path.display()),
                    e,
                ));
            }
        }
        let listener = UnixListener::bind(&socket_path)
            .map_err(|e| LauncherError::io(format!("bind {}", socket_path.display()), e))?;
        info!(path = %socket_path.display(), "command service listening");
        Ok(Self {
            socket_path,
            listener,
            terminator,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Serve until `shutdown` fires, then remove the socket.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    accepted = self.listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            let terminator = self.terminator.clone();
                            let shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, terminator, shutdown).await {
                                    debug!(error = %e, "command connection ended");
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "command socket accept failed"),
                    },
                }
            }
            if let Err(e) = std::fs::remove_file(&self.socket_path)
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!(path = %self.socket_path.display(), error = %e, "failed to remove command socket");
            }
            info!("command service stopped");
        })
    }
}

async fn serve_connection(
    stream: UnixStream,
    terminator: Arc<VmTerminator>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    loop {
        let line = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Ok(()),
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(&line) {
            Ok(Request::Ping) => Response::ok(),
            Ok(Request::Kill) => {
                info!("kill requested over command socket");
                match terminator.kill().await {
                    Ok(()) => Response::ok(),
                    Err(e) => Response::failed(e.to_string()),
                }
            }
            Err(e) => Response::failed(format!("invalid request: {e}")),
        };

        let mut payload = serde_json::to_vec(&response).map_err(std::io::Error::other)?;
        payload.push(b'\n');
        write.write_all(&payload).await?;
    }
}

/// Client side of the command socket. Each request, including the wait for
/// its response, is bounded by the client's timeout.
#[derive(Debug, Clone)]
pub struct CommandClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl CommandClient {
    pub fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            timeout: Duration::from_secs(constants::COMMAND_CALL_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn ping(&self) -> LauncherResult<()> {
        self.call(Request::Ping).await
    }

    pub async fn kill(&self) -> LauncherResult<()> {
        self.call(Request::Kill).await
    }

    async fn call(&self, request: Request) -> LauncherResult<()> {
        tokio::time::timeout(self.timeout, self.exchange(request))
            .await
            .map_err(|_| LauncherError::Timeout {
                what: "command service response",
                timeout: self.timeout,
            })?
    }

    async fn exchange(&self, request: Request) -> LauncherResult<()> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            LauncherError::CommandService(format!("connect {}: {e}", self.socket_path.display()))
        })?;
        let (read, mut write) = stream.into_split();

        let mut payload = serde_json::to_vec(&request)
            .map_err(|e| LauncherError::Internal(format!("encode request: {e}")))?;
        payload.push(b'\n');
        write
            .write_all(&payload)
            .await
            .map_err(|e| LauncherError::CommandService(format!("send: {e}")))?;

        let mut lines = BufReader::new(read).lines();
        let line = lines
            .next_line()
            .await
            .map_err(|e| LauncherError::CommandService(format!("receive: {e}")))?
            .ok_or_else(|| LauncherError::CommandService("connection closed".into()))?;
        let response: Response = serde_json::from_str(&line)
            .map_err(|e| LauncherError::CommandService(format!("decode response: {e}")))?;

        if response.ok {
            Ok(())
        } else {
            Err(LauncherError::CommandService(
                response.error.unwrap_or_else(|| "request failed".into()),
            ))
        }
    }
}

/// Ping the command service every `interval` until it answers, starting
/// immediately. Fails once `timeout` has passed without an answer.
pub async fn wait_until_ready(
    client: &CommandClient,
    interval: Duration,
    timeout: Duration,
) -> LauncherResult<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match tokio::time::timeout_at(deadline, client.ping()).await {
            Ok(Ok(())) => {
                debug!("command service answered ping");
                return Ok(());
            }
            Ok(Err(e)) => debug!(error = %e, "command service not ready yet"),
            Err(_) => break,
        }
        if tokio::time::Instant::now() + interval > deadline {
            break;
        }
        tokio::time::sleep(interval).await;
    }
    Err(LauncherError::Timeout {
        what: "command service",
        timeout,
    })
}
