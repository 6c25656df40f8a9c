//! Process-table lookups and signalling.
//!
//! The VM process is never held as a handle: every lookup rescans the process
//! table for a command name starting with a known prefix.

use std::path::PathBuf;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::debug;

use crate::error::{LauncherError, LauncherResult};

/// Lookup of live processes by command-name prefix.
pub trait ProcessTable: Send + Sync {
    /// Find a live (non-zombie) process whose command name starts with `prefix`.
    fn find(&self, prefix: &str) -> Option<Pid>;
}

impl<F> ProcessTable for F
where
    F: Fn(&str) -> Option<Pid> + Send + Sync,
{
    fn find(&self, prefix: &str) -> Option<Pid> {
        self(prefix)
    }
}

/// [`ProcessTable`] backed by `/proc/<pid>/stat`.
pub struct ProcFs {
    root: PathBuf,
}

impl ProcFs {
    pub fn new() -> Self {
        Self {
            root: PathBuf::from("/proc"),
        }
    }

    #[cfg(test)]
    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for ProcFs {
    fn find(&self, prefix: &str) -> Option<Pid> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(root = %self.root.display(), error = %e, "cannot read process table");
                return None;
            }
        };
        let own_pid = std::process::id();

        let mut matches: Vec<i32> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| entry.file_name().to_str()?.parse::<i32>().ok())
            .filter(|pid| u32::try_from(*pid).is_ok_and(|pid| pid != own_pid))
            .filter(|pid| {
                let Ok(stat) = std::fs::read_to_string(self.root.join(pid.to_string()).join("stat"))
                else {
                    return false;
                };
                parse_stat(&stat)
                    .is_some_and(|(comm, state)| state != 'Z' && comm.starts_with(prefix))
            })
            .collect();
        matches.sort_unstable();
        matches.first().copied().map(Pid::from_raw)
    }
}

/// Extract `(comm, state)` from a `/proc/<pid>/stat` line.
///
/// `comm` may itself contain spaces and parentheses, so it spans from the
/// first `(` to the last `)`.
fn parse_stat(stat: &str) -> Option<(&str, char)> {
    let open = stat.find('(')?;
    let close = stat.rfind(')')?;
    let comm = stat.get(open + 1..close)?;
    let state = stat.get(close + 1..)?.trim_start().chars().next()?;
    Some((comm, state))
}

/// Send `signal` to `pid`. A process that is already gone is not an error.
pub fn send_signal(pid: Pid, signal: Signal) -> LauncherResult<()> {
    match kill(pid, signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(LauncherError::Signal(format!("{signal} to pid {pid}: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_stat(root: &std::path::Path, pid: i32, comm: &str, state: char) {
        let dir = root.join(pid.to_string());
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("stat"),
            format!("{pid} ({comm}) {state} 1 {pid} {pid} 0 -1 4194560 0 0"),
        )
        .unwrap();
    }

    #[test]
    fn parse_stat_handles_spaces_and_parens_in_comm() {
        let (comm, state) = parse_stat("42 (qemu (x) y) S 1 42").unwrap();
        assert_eq!(comm, "qemu (x) y");
        assert_eq!(state, 'S');
    }

    #[test]
    fn parse_stat_rejects_garbage() {
        assert!(parse_stat("").is_none());
        assert!(parse_stat("42 qemu S").is_none());
        assert!(parse_stat("42 (qemu)").is_none());
    }

    #[test]
    fn find_matches_prefix() {
        let dir = tempfile::tempdir().unwrap();
        write_stat(dir.path(), 100, "bash", 'S');
        write_stat(dir.path(), 200, "qemu-system-x86", 'S');

        let table = ProcFs::with_root(dir.path().to_path_buf());
        assert_eq!(table.find("qemu-system"), Some(Pid::from_raw(200)));
        assert_eq!(table.find("virtqemud"), None);
    }

    #[test]
    fn find_skips_zombies() {
        let dir = tempfile::tempdir().unwrap();
        write_stat(dir.path(), 300, "qemu-system-x86", 'Z');

        let table = ProcFs::with_root(dir.path().to_path_buf());
        assert_eq!(table.find("qemu-system"), None);
    }

    #[test]
    fn find_returns_lowest_matching_pid() {
        let dir = tempfile::tempdir().unwrap();
        write_stat(dir.path(), 900, "qemu-system-x86", 'R');
        write_stat(dir.path(), 400, "qemu-system-aar", 'S');

        let table = ProcFs::with_root(dir.path().to_path_buf());
        assert_eq!(table.find("qemu-system"), Some(Pid::from_raw(400)));
    }

    #[test]
    fn find_ignores_non_pid_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("self")).unwrap();
        std::fs::write(dir.path().join("uptime"), b"1.0 1.0").unwrap();
        std::fs::create_dir_all(dir.path().join("555")).unwrap();

        let table = ProcFs::with_root(dir.path().to_path_buf());
        assert_eq!(table.find(""), None);
    }

    #[test]
    fn find_on_missing_root_is_none() {
        let table = ProcFs::with_root(PathBuf::from("/nonexistent/proc"));
        assert_eq!(table.find("qemu-system"), None);
    }

    #[test]
    fn real_proc_has_no_bogus_process() {
        assert_eq!(ProcFs::new().find("no-such-command-7d1e"), None);
    }

    #[test]
    fn closures_are_process_tables() {
        let table = |prefix: &str| (prefix == "qemu").then(|| Pid::from_raw(7));
        assert_eq!(table.find("qemu"), Some(Pid::from_raw(7)));
        assert_eq!(table.find("other"), None);
    }
}
