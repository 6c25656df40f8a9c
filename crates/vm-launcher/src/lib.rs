//! Per-VM launcher: supervises one hypervisor-managed VM on a cluster node.
//!
//! The binary runs in two roles. Without `--no-fork` it is the
//! [`supervisor::ForkSupervisor`], which re-executes itself as a child and
//! sweeps the VM process once that child is gone. With `--no-fork` it is the
//! [`launcher::Launcher`], which sequences startup, watches the VM process and
//! drives shutdown.

pub mod cmd_server;
pub mod command;
pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod hypervisor;
pub mod launcher;
pub mod monitor;
pub mod notify;
pub mod paths;
pub mod process;
pub mod supervisor;
pub mod virsh;

pub use config::{LauncherArgs, LauncherConfig, VmIdentity};
pub use error::{LauncherError, LauncherResult};
pub use launcher::{Collaborators, Launcher};
pub use supervisor::ForkSupervisor;
