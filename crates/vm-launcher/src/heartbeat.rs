//! Watchdog heartbeat: periodic rewrite of the liveness file.
//!
//! The first write happens in [`start`], before the worker is spawned, so an
//! unwritable watchdog file fails startup. After that every write failure
//! ends the worker with an error; the launcher races the worker against the
//! VM lifecycle and treats an early exit as fatal. An external health check
//! reads the file's age, so a failed write must never go unnoticed.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace};

use crate::error::{LauncherError, LauncherResult};

/// Write the current UTC time to the watchdog file.
pub fn touch(path: &Path) -> LauncherResult<()> {
    let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    std::fs::write(path, stamp)
        .map_err(|e| LauncherError::Heartbeat(format!("write {}: {e}", path.display())))
}

/// Create the watchdog file and spawn the refresh loop.
pub fn start(
    path: PathBuf,
    interval: Duration,
    shutdown: CancellationToken,
) -> LauncherResult<JoinHandle<LauncherResult<()>>> {
    touch(&path)?;
    info!(path = %path.display(), "watchdog file created");
    Ok(tokio::spawn(heartbeat_loop(path, interval, shutdown)))
}

/// Refresh the watchdog file every `interval` until `shutdown` is cancelled.
pub async fn heartbeat_loop(
    path: PathBuf,
    interval: Duration,
    shutdown: CancellationToken,
) -> LauncherResult<()> {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!("watchdog stopped");
                return Ok(());
            }
            _ = ticker.tick() => {
                if let Err(e) = touch(&path) {
                    error!(error = %e, "watchdog update failed");
                    return Err(e);
                }
                trace!("watchdog file updated");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_secs(5);

    #[test]
    fn touch_writes_rfc3339_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("default_vm1");

        touch(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(&content).is_ok(), "content: {content}");
    }

    #[tokio::test]
    async fn start_fails_when_file_cannot_be_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing-dir").join("default_vm1");

        let err = start(path, INTERVAL, CancellationToken::new()).unwrap_err();
        assert!(err.to_string().contains("watchdog"), "error was: {err}");
    }

    #[tokio::test(start_paused = true)]
    async fn refreshes_every_interval_until_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("default_vm1");
        let shutdown = CancellationToken::new();

        let handle = start(path.clone(), INTERVAL, shutdown.clone()).unwrap();
        assert!(path.exists(), "initial write happens before start returns");

        for _ in 0..3 {
            std::fs::remove_file(&path).unwrap();
            tokio::time::sleep(INTERVAL + Duration::from_millis(10)).await;
            assert!(path.exists(), "file rewritten within one interval");
        }

        shutdown.cancel();
        handle.await.unwrap().unwrap();

        std::fs::remove_file(&path).unwrap();
        tokio::time::sleep(INTERVAL * 3).await;
        assert!(!path.exists(), "no writes after cancellation");
    }

    #[tokio::test(start_paused = true)]
    async fn write_failure_after_start_ends_the_worker() {
        let dir = tempfile::tempdir().unwrap();
        let watchdog_dir = dir.path().join("watchdog-files");
        std::fs::create_dir_all(&watchdog_dir).unwrap();
        let path = watchdog_dir.join("default_vm1");
        let shutdown = CancellationToken::new();

        let handle = start(path, INTERVAL, shutdown.clone()).unwrap();
        std::fs::remove_dir_all(&watchdog_dir).unwrap();

        let result = tokio::time::timeout(INTERVAL * 2, handle).await.unwrap().unwrap();
        assert!(result.is_err());
        assert!(!shutdown.is_cancelled());
    }
}
