//! Constants.

// ---------------------------------------------------------------------------
// Defaults for command-line flags
// ---------------------------------------------------------------------------

/// Directory shared with the cluster handler (sockets, watchdog and trigger files).
pub const DEFAULT_SHARE_DIR: &str = "/var/run/vm-launcher";

/// Launcher-private state, one subdirectory per VM uid.
pub const DEFAULT_PRIVATE_DIR: &str = "/var/run/vm-launcher-private";

/// Base directory for ephemeral disk data.
pub const DEFAULT_EPHEMERAL_DISK_DIR: &str = "/var/run/libvirt/ephemeral-disk";

/// The pod readiness check looks for this file.
pub const DEFAULT_READINESS_FILE: &str = "/tmp/health";

/// Hypervisor connection URI.
pub const DEFAULT_HYPERVISOR_URI: &str = "qemu:///system";

/// Command-name prefix of the VM process.
pub const DEFAULT_VM_COMMAND_PREFIX: &str = "qemu-system";

/// How long to wait for the domain to be defined, in seconds.
pub const DOMAIN_START_TIMEOUT_SECS: u64 = 180;

/// Watchdog file refresh interval in seconds.
pub const WATCHDOG_INTERVAL_SECS: u64 = 5;

/// Grace period between a shutdown request and forcing the VM down, in seconds.
pub const GRACE_PERIOD_SECS: u64 = 30;

// ---------------------------------------------------------------------------
// Fixed timings
// ---------------------------------------------------------------------------

/// Process monitor poll interval in milliseconds.
pub const MONITOR_POLL_INTERVAL_MS: u64 = 500;

/// Command service liveness check interval in seconds.
pub const COMMAND_READY_INTERVAL_SECS: u64 = 1;

/// Command service liveness check budget in seconds.
pub const COMMAND_READY_TIMEOUT_SECS: u64 = 15;

/// Budget for one command socket request and its response, in seconds.
pub const COMMAND_CALL_TIMEOUT_SECS: u64 = 10;

/// Budget for the hypervisor version check at connect time, in seconds.
pub const HYPERVISOR_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Wait for the final delete notification, in seconds.
pub const FINAL_NOTIFY_TIMEOUT_SECS: u64 = 30;

/// Delay before re-running a failed hypervisor event dispatch, in seconds.
pub const EVENT_RETRY_DELAY_SECS: u64 = 1;

/// Capacity of the decoded domain event feed.
pub const EVENT_FEED_CAPACITY: usize = 10;

/// Fork supervisor cleanup sweep poll interval in seconds.
pub const SWEEP_POLL_INTERVAL_SECS: u64 = 1;

/// Fork supervisor cleanup sweep budget in seconds.
pub const SWEEP_TIMEOUT_SECS: u64 = 10;

/// Fork supervisor loop tick in milliseconds.
pub const SUPERVISOR_TICK_MS: u64 = 100;

/// Flag appended to the child's arguments so it runs the launcher directly.
pub const NO_FORK_FLAG: &str = "--no-fork";
