use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use crate::constants;
use crate::error::{LauncherError, LauncherResult};

/// Identity of the supervised VM within the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmIdentity {
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

impl VmIdentity {
    /// Hypervisor domain name, `<namespace>_<name>`.
    pub fn domain_name(&self) -> String {
        format!("{}_{}", self.namespace, self.name)
    }
}

impl fmt::Display for VmIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Args, Debug, Clone)]
pub struct LauncherArgs {
    /// Name of the VM
    #[arg(long)]
    pub name: String,
    /// Namespace of the VM
    #[arg(long)]
    pub namespace: String,
    /// UID of the VM
    #[arg(long)]
    pub uid: String,
    /// Directory shared with the cluster handler
    #[arg(long, default_value = constants::DEFAULT_SHARE_DIR)]
    pub share_dir: PathBuf,
    /// Launcher-private state directory
    #[arg(long, default_value = constants::DEFAULT_PRIVATE_DIR)]
    pub private_dir: PathBuf,
    /// Base directory for ephemeral disk data
    #[arg(long, default_value = constants::DEFAULT_EPHEMERAL_DISK_DIR)]
    pub ephemeral_disk_dir: PathBuf,
    /// The pod looks for this file to decide the launcher is initialized
    #[arg(long, default_value = constants::DEFAULT_READINESS_FILE)]
    pub readiness_file: PathBuf,
    /// Seconds to wait for the VM domain to be defined
    #[arg(long, default_value_t = constants::DOMAIN_START_TIMEOUT_SECS)]
    pub qemu_timeout_secs: u64,
    /// Seconds between watchdog file updates
    #[arg(long, default_value_t = constants::WATCHDOG_INTERVAL_SECS)]
    pub watchdog_interval_secs: u64,
    /// Grace period to observe before forcing the VM process down
    #[arg(long, default_value_t = constants::GRACE_PERIOD_SECS)]
    pub grace_period_secs: u64,
    /// Hypervisor connection URI
    #[arg(long, default_value = constants::DEFAULT_HYPERVISOR_URI)]
    pub hypervisor_uri: String,
    /// Command-name prefix of the VM process
    #[arg(long, default_value = constants::DEFAULT_VM_COMMAND_PREFIX)]
    pub vm_command_prefix: String,
}

/// Validated launcher configuration.
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    pub vm: VmIdentity,
    pub share_dir: PathBuf,
    pub private_dir: PathBuf,
    pub ephemeral_disk_dir: PathBuf,
    pub readiness_file: PathBuf,
    pub hypervisor_uri: String,
    pub vm_command_prefix: String,
    pub domain_start_timeout: Duration,
    pub watchdog_interval: Duration,
    pub grace_period: Duration,
    pub command_ready_interval: Duration,
    pub command_ready_timeout: Duration,
    pub final_notify_timeout: Duration,
}

impl LauncherConfig {
    pub fn from_args(args: LauncherArgs) -> LauncherResult<Self> {
        validate_identifier("name", &args.name)?;
        validate_identifier("namespace", &args.namespace)?;
        validate_identifier("uid", &args.uid)?;
        if args.watchdog_interval_secs == 0 {
            return Err(LauncherError::Config(
                "watchdog interval must be at least one second".into(),
            ));
        }
        if args.grace_period_secs == 0 {
            return Err(LauncherError::Config(
                "grace period must be at least one second".into(),
            ));
        }
        if args.vm_command_prefix.is_empty() {
            return Err(LauncherError::Config(
                "vm command prefix must not be empty".into(),
            ));
        }

        Ok(Self {
            vm: VmIdentity {
                namespace: args.namespace,
                name: args.name,
                uid: args.uid,
            },
            share_dir: args.share_dir,
            private_dir: args.private_dir,
            ephemeral_disk_dir: args.ephemeral_disk_dir,
            readiness_file: args.readiness_file,
            hypervisor_uri: args.hypervisor_uri,
            vm_command_prefix: args.vm_command_prefix,
            domain_start_timeout: Duration::from_secs(args.qemu_timeout_secs),
            watchdog_interval: Duration::from_secs(args.watchdog_interval_secs),
            grace_period: Duration::from_secs(args.grace_period_secs),
            command_ready_interval: Duration::from_secs(constants::COMMAND_READY_INTERVAL_SECS),
            command_ready_timeout: Duration::from_secs(constants::COMMAND_READY_TIMEOUT_SECS),
            final_notify_timeout: Duration::from_secs(constants::FINAL_NOTIFY_TIMEOUT_SECS),
        })
    }
}

/// Identifiers end up in file names, so they must be non-empty single path
/// components.
fn validate_identifier(field: &str, value: &str) -> LauncherResult<()> {
    if value.is_empty() || value.contains('/') || value == "." || value == ".." {
        return Err(LauncherError::Config(format!(
            "invalid {field} '{value}': must be a non-empty name without '/'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        args: LauncherArgs,
    }

    fn parse(extra: &[&str]) -> Result<LauncherArgs, clap::Error> {
        let base = ["vm-launcher", "--name", "vm1", "--namespace", "default", "--uid", "1234"];
        TestCli::try_parse_from(base.iter().chain(extra)).map(|cli| cli.args)
    }

    #[test]
    fn defaults_applied() {
        let config = LauncherConfig::from_args(parse(&[]).unwrap()).unwrap();
        assert_eq!(config.share_dir, PathBuf::from("/var/run/vm-launcher"));
        assert_eq!(config.readiness_file, PathBuf::from("/tmp/health"));
        assert_eq!(config.vm_command_prefix, "qemu-system");
        assert_eq!(config.domain_start_timeout, Duration::from_secs(180));
        assert_eq!(config.watchdog_interval, Duration::from_secs(5));
        assert_eq!(config.grace_period, Duration::from_secs(30));
        assert_eq!(config.command_ready_timeout, Duration::from_secs(15));
        assert_eq!(config.final_notify_timeout, Duration::from_secs(30));
    }

    #[test]
    fn overrides_applied() {
        let args = parse(&[
            "--grace-period-secs",
            "10",
            "--watchdog-interval-secs",
            "2",
            "--share-dir",
            "/tmp/share",
        ])
        .unwrap();
        let config = LauncherConfig::from_args(args).unwrap();
        assert_eq!(config.grace_period, Duration::from_secs(10));
        assert_eq!(config.watchdog_interval, Duration::from_secs(2));
        assert_eq!(config.share_dir, PathBuf::from("/tmp/share"));
    }

    #[test]
    fn identity_from_args() {
        let config = LauncherConfig::from_args(parse(&[]).unwrap()).unwrap();
        assert_eq!(config.vm.domain_name(), "default_vm1");
        assert_eq!(config.vm.to_string(), "default/vm1");
        assert_eq!(config.vm.uid, "1234");
    }

    #[test]
    fn missing_name_rejected_by_parser() {
        let result = TestCli::try_parse_from(["vm-launcher", "--namespace", "ns", "--uid", "u"]);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_path_like_identifiers() {
        let mut args = parse(&[]).unwrap();
        args.name = "../evil".into();
        assert!(LauncherConfig::from_args(args).is_err());

        let mut args = parse(&[]).unwrap();
        args.uid = String::new();
        assert!(LauncherConfig::from_args(args).is_err());
    }

    #[test]
    fn rejects_zero_intervals() {
        let args = parse(&["--watchdog-interval-secs", "0"]).unwrap();
        assert!(LauncherConfig::from_args(args).is_err());

        let args = parse(&["--grace-period-secs", "0"]).unwrap();
        assert!(LauncherConfig::from_args(args).is_err());
    }
}
