mod config_cmd;
mod device_cmd;
mod onboard_cmd;
mod runtime;
mod terminal_output;

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use keystone_config::{config_dir, config_file_path, load_and_prepare, KeystoneConfig};
use keystone_core::TrustError;
use keystone_trust::TrustManager;

use config_cmd::ConfigCmd;
use device_cmd::DeviceCmd;
use onboard_cmd::OnboardCmd;
use terminal_output::{note_error, note_success, note_warn};

#[derive(Parser, Debug)]
#[command(name = "keystone")]
#[command(about = "Keystone: device onboarding and trust store administration")]
#[command(version)]
struct Cli {
    /// Config file (default: ~/.keystone/keystone.yaml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage onboarding certificates
    #[command(subcommand)]
    Onboard(OnboardCmd),
    /// Manage registered devices
    #[command(subcommand)]
    Device(DeviceCmd),
    /// Resolve operations left pending by an interrupted process
    Recover {
        /// Keep sweeping every `recovery.sweep_interval_secs`
        #[arg(long)]
        watch: bool,
    },
    /// Inspect or initialise configuration
    #[command(subcommand)]
    Config(ConfigCmd),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let stdout = std::io::stdout();
    if let Err(e) = run(cli, &mut stdout.lock()).await {
        note_error(&format!("{e:#}"));
        std::process::exit(exit_code(&e));
    }
}

/// 2 for requests rejected by validation, 1 for everything else.
fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<TrustError>() {
        Some(e) if e.is_validation() => 2,
        _ => 1,
    }
}

async fn run(cli: Cli, out: &mut impl Write) -> Result<()> {
    let path = cli
        .config
        .unwrap_or_else(|| config_file_path(&config_dir()));
    let config = load_and_prepare(&path).await?;
    runtime::init_logging(&config)?;

    if let Commands::Config(cmd) = cli.command {
        return config_cmd::run(cmd, &config, &path, out).await;
    }

    let manager = runtime::open_manager(&config).await?;
    dispatch(&manager, cli.command, &config, &path, out).await
}

async fn dispatch(
    manager: &TrustManager,
    command: Commands,
    config: &KeystoneConfig,
    path: &Path,
    out: &mut impl Write,
) -> Result<()> {
    match command {
        Commands::Onboard(cmd) => onboard_cmd::run(manager, cmd, out).await,
        Commands::Device(cmd) => device_cmd::run(manager, cmd, out).await,
        Commands::Recover { watch } => {
            let report = manager.recover().await?;
            if report.deferred > 0 {
                note_warn(&format!(
                    "{} operation(s) are still within the grace period",
                    report.deferred
                ));
            }
            if report.unresolved > 0 {
                note_warn(&format!("{} operation(s) could not be resolved", report.unresolved));
            }
            note_success(
                out,
                &format!(
                    "Rolled back {}, completed {}, discarded {}",
                    report.rolled_back, report.completed, report.discarded
                ),
            )?;
            if watch {
                out.flush()?;
                manager.run_recovery_sweeps().await;
            }
            Ok(())
        }
        Commands::Config(cmd) => config_cmd::run(cmd, config, path, out).await,
    }
}
