//! `keystone device`: registered devices, their configs and telemetry.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use keystone_core::{DeviceConfig, TelemetryKind};
use keystone_trust::TrustManager;
use tracing::debug;
use uuid::Uuid;

use crate::runtime::read_certificate;
use crate::terminal_output::{note_success, render_table};

#[derive(Subcommand, Debug)]
pub enum DeviceCmd {
    /// Register a device certificate
    Add {
        cert: PathBuf,
        /// Onboarding certificate the device presented
        #[arg(long)]
        onboard: Option<PathBuf>,
        /// Serial the device presented
        #[arg(long, default_value = "")]
        serial: String,
    },
    /// List registered device UUIDs
    List,
    /// Show what is stored about a device
    Get {
        uuid: Uuid,
        #[arg(long)]
        pem: bool,
    },
    /// Remove a device and its streams
    Remove { uuid: Uuid },
    /// Remove every device
    Clear {
        #[arg(long)]
        yes: bool,
    },
    /// Print a device config with its hash, or replace it from a JSON file
    Config {
        uuid: Uuid,
        #[arg(long)]
        set: Option<PathBuf>,
    },
    /// Print the log stream
    Logs(StreamArgs),
    /// Print the info stream
    Info(StreamArgs),
    /// Print the metrics stream
    Metrics(StreamArgs),
}

#[derive(clap::Args, Debug)]
pub struct StreamArgs {
    uuid: Uuid,
    /// Keep polling for new entries
    #[arg(short, long)]
    follow: bool,
    /// Poll interval in milliseconds when following
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,
}

pub async fn run(manager: &TrustManager, cmd: DeviceCmd, out: &mut impl Write) -> Result<()> {
    match cmd {
        DeviceCmd::Add {
            cert,
            onboard,
            serial,
        } => {
            let cert = read_certificate(&cert).await?;
            let onboard = match onboard {
                Some(path) => Some(read_certificate(&path).await?),
                None => None,
            };
            if let Some(onboard) = &onboard {
                manager.onboard_check(onboard, &serial).await?;
            }
            let uuid = manager
                .device_register(&cert, onboard.as_ref(), &serial)
                .await?;
            writeln!(out, "{uuid}")?;
        }
        DeviceCmd::List => {
            let mut uuids = manager.device_list().await?;
            uuids.sort();
            for uuid in uuids {
                writeln!(out, "{uuid}")?;
            }
        }
        DeviceCmd::Get { uuid, pem } => {
            let details = manager.device_get(uuid).await?;
            let rows = vec![vec![
                uuid.to_string(),
                details.cert.common_name().to_string(),
                details
                    .onboard
                    .as_ref()
                    .map(|c| c.common_name().to_string())
                    .unwrap_or_else(|| "-".into()),
                details.serial.clone().unwrap_or_else(|| "-".into()),
            ]];
            write!(out, "{}", render_table(&["UUID", "CN", "ONBOARD", "SERIAL"], &rows))?;
            if pem {
                write!(out, "{}", details.cert.to_pem())?;
            }
        }
        DeviceCmd::Remove { uuid } => {
            manager.device_remove(uuid).await?;
            note_success(out, &format!("Removed {uuid}"))?;
        }
        DeviceCmd::Clear { yes } => {
            if !yes {
                bail!("refusing to remove every device without --yes");
            }
            manager.device_clear().await?;
            note_success(out, "Removed all devices")?;
        }
        DeviceCmd::Config { uuid, set: None } => {
            let response = manager.get_config_response(uuid).await?;
            writeln!(out, "{}", serde_json::to_string_pretty(&response)?)?;
        }
        DeviceCmd::Config {
            uuid,
            set: Some(path),
        } => {
            let raw = tokio::fs::read(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let config: DeviceConfig = serde_json::from_slice(&raw)
                .with_context(|| format!("parsing device config {}", path.display()))?;
            manager.set_config(uuid, &config).await?;
            note_success(out, &format!("Stored config for {uuid}"))?;
        }
        DeviceCmd::Logs(args) => print_stream(manager, TelemetryKind::Logs, args, out).await?,
        DeviceCmd::Info(args) => print_stream(manager, TelemetryKind::Info, args, out).await?,
        DeviceCmd::Metrics(args) => print_stream(manager, TelemetryKind::Metrics, args, out).await?,
    }
    Ok(())
}

async fn print_stream(
    manager: &TrustManager,
    kind: TelemetryKind,
    args: StreamArgs,
    out: &mut impl Write,
) -> Result<()> {
    let mut reader = manager.reader(kind, args.uuid);
    debug!(stream = reader.stream(), follow = args.follow, "Reading telemetry");
    loop {
        while let Some(line) = reader.next_line().await? {
            out.write_all(line.as_bytes())?;
        }
        out.flush()?;
        if !args.follow {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(args.interval_ms)).await;
    }
}
