use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::{LauncherConfig, VmIdentity};
use crate::error::{LauncherError, LauncherResult};

/// Paths in the directory shared with the cluster handler.
pub struct SharePaths {
    share_dir: PathBuf,
}

impl SharePaths {
    pub fn new(share_dir: PathBuf) -> Self {
        Self { share_dir }
    }

    pub fn share_dir(&self) -> &Path {
        &self.share_dir
    }

    /// Command socket, `<shareDir>/<uid>.sock`.
    pub fn command_socket(&self, uid: &str) -> PathBuf {
        self.share_dir.join(format!("{uid}.sock"))
    }

    pub fn watchdog_dir(&self) -> PathBuf {
        self.share_dir.join("watchdog-files")
    }

    pub fn watchdog_file(&self, vm: &VmIdentity) -> PathBuf {
        self.watchdog_dir().join(file_key(vm))
    }

    pub fn shutdown_trigger_dir(&self) -> PathBuf {
        self.share_dir.join("graceful-shutdown-trigger")
    }

    pub fn shutdown_trigger(&self, vm: &VmIdentity) -> PathBuf {
        self.shutdown_trigger_dir().join(file_key(vm))
    }
}

/// Launcher-private directories.
pub struct PrivatePaths {
    private_dir: PathBuf,
}

impl PrivatePaths {
    pub fn new(private_dir: PathBuf) -> Self {
        Self { private_dir }
    }

    pub fn vm_dir(&self, uid: &str) -> PathBuf {
        self.private_dir.join(uid)
    }

    pub fn disks_dir(&self) -> PathBuf {
        self.private_dir.join("vm-disks")
    }
}

/// Ephemeral disk data directories.
pub struct EphemeralDiskPaths {
    base_dir: PathBuf,
}

impl EphemeralDiskPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn cloud_init(&self) -> PathBuf {
        self.base_dir.join("cloud-init-data")
    }

    pub fn registry_disk(&self) -> PathBuf {
        self.base_dir.join("registry-disk-data")
    }

    pub fn disk_data(&self) -> PathBuf {
        self.base_dir.join("disk-data")
    }
}

/// Heartbeat and trigger files are keyed by `<namespace>_<name>`.
fn file_key(vm: &VmIdentity) -> String {
    format!("{}_{}", vm.namespace, vm.name)
}

/// Create every directory the launcher and its collaborators write into.
pub fn provision_directories(config: &LauncherConfig) -> LauncherResult<()> {
    let share = SharePaths::new(config.share_dir.clone());
    let private = PrivatePaths::new(config.private_dir.clone());
    let ephemeral = EphemeralDiskPaths::new(config.ephemeral_disk_dir.clone());

    let dirs = [
        share.share_dir().to_path_buf(),
        share.watchdog_dir(),
        share.shutdown_trigger_dir(),
        private.vm_dir(&config.vm.uid),
        private.disks_dir(),
        ephemeral.cloud_init(),
        ephemeral.registry_disk(),
        ephemeral.disk_data(),
    ];
    for dir in &dirs {
        std::fs::create_dir_all(dir)
            .map_err(|e| LauncherError::io(format!("create {}", dir.display()), e))?;
        debug!(dir = %dir.display(), "directory ready");
    }
    Ok(())
}
