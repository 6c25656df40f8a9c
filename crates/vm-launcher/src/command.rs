use std::time::Duration;

use tokio::process::Command;
use tracing::trace;

/// Error from a failed external command.
#[derive(Debug, thiserror::Error)]
#[error("command failed: {command}\n{detail}")]
pub struct CommandError {
    pub command: String,
    pub detail: String,
}

/// Run `program` with `args` (no shell) and return its trimmed stdout.
///
/// A non-zero exit turns into a [`CommandError`] carrying trimmed stderr.
pub async fn exec(program: &str, args: &[&str]) -> Result<String, CommandError> {
    let command = render(program, args);
    trace!(cmd = %command, "exec");

    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| CommandError {
            command: command.clone(),
            detail: e.to_string(),
        })?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(CommandError {
            command,
            detail: if stderr.is_empty() {
                format!("exited with {}", output.status)
            } else {
                stderr
            },
        })
    }
}

/// [`exec`] bounded by `timeout`; the child is killed when the budget runs out.
pub async fn exec_timeout(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<String, CommandError> {
    tokio::time::timeout(timeout, exec(program, args))
        .await
        .unwrap_or_else(|_| {
            Err(CommandError {
                command: render(program, args),
                detail: format!("timed out after {timeout:?}"),
            })
        })
}

fn render(program: &str, args: &[&str]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{program} {}", args.join(" "))
    }
}
