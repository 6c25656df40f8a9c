use std::fmt;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use vm_launcher::launcher::Collaborators;
use vm_launcher::notify::LogNotifier;
use vm_launcher::process::ProcFs;
use vm_launcher::virsh::VirshBackend;
use vm_launcher::{ForkSupervisor, Launcher, LauncherArgs, LauncherConfig, LauncherResult};

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        write!(
            w,
            "[{:02}:{:02}:{:03}]",
            total_secs / 60,
            total_secs % 60,
            d.subsec_millis()
        )
    }
}

#[derive(Parser)]
#[command(name = "vm-launcher", version, about = "Supervise one VM on this node")]
struct Cli {
    #[command(flatten)]
    launcher: LauncherArgs,

    /// Run the launcher directly instead of under the fork supervisor
    #[arg(long)]
    no_fork: bool,

    /// Also write logs to a daily-rotated file in this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

/// Initialize tracing with a tee writer (stderr + rolling log file).
///
/// The returned guard must live until exit so buffered lines are flushed.
fn init_tracing_with_file(
    log_dir: &Path,
    prefix: &str,
) -> Result<tracing_appender::non_blocking::WorkerGuard, Box<dyn std::error::Error>> {
    std::fs::create_dir_all(log_dir).map_err(|e| format!("create {}: {e}", log_dir.display()))?;

    let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(prefix)
        .filename_suffix("log")
        .max_log_files(7)
        .build(log_dir)?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let writer = std::io::stderr.and(non_blocking);

    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_writer(writer)
        .with_ansi(false)
        .init();

    Ok(guard)
}

fn init_tracing_stderr() {
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_writer(std::io::stderr)
        .init();
}

fn run_launcher(config: LauncherConfig) -> LauncherResult<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| vm_launcher::LauncherError::io("build tokio runtime", e))?;

    let collaborators = Collaborators {
        backend: Arc::new(VirshBackend::new(config.hypervisor_uri.clone())),
        notifier: Arc::new(LogNotifier::new(config.vm.clone())),
        processes: Arc::new(ProcFs::new()),
    };
    runtime.block_on(Launcher::new(config, collaborators).run())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match LauncherConfig::from_args(cli.launcher) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let role = if cli.no_fork { "" } else { "supervisor-" };
    let prefix = format!("vm-launcher-{role}{}", config.vm.domain_name());
    let _guard = match &cli.log_dir {
        Some(dir) => match init_tracing_with_file(dir, &prefix) {
            Ok(guard) => Some(guard),
            Err(e) => {
                init_tracing_stderr();
                tracing::warn!("file logging unavailable, using stderr only: {e}");
                None
            }
        },
        None => {
            init_tracing_stderr();
            None
        }
    };

    if cli.no_fork {
        return match run_launcher(config) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("error: {e}");
                ExitCode::FAILURE
            }
        };
    }

    let supervised = ForkSupervisor::for_current_exe(config.vm_command_prefix.clone())
        .and_then(ForkSupervisor::run);
    match supervised {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
