//! `keystone onboard`: onboarding certificate administration.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Subcommand;
use keystone_trust::TrustManager;

use crate::runtime::read_certificate;
use crate::terminal_output::{note_success, render_table};

#[derive(Subcommand, Debug)]
pub enum OnboardCmd {
    /// Register (or replace) an onboarding certificate and its serials
    Add {
        /// PEM file holding the onboarding certificate
        cert: PathBuf,
        /// Accepted serial; repeat for more, `*` accepts any
        #[arg(short, long = "serial", required = true)]
        serials: Vec<String>,
    },
    /// Check whether a certificate may onboard a device with a serial
    Check { cert: PathBuf, serial: String },
    /// List onboarding certificate Common Names
    List,
    /// Show an onboarding certificate and its serials
    Get {
        cn: String,
        /// Print the certificate PEM as well
        #[arg(long)]
        pem: bool,
    },
    /// Remove one onboarding certificate
    Remove { cn: String },
    /// Remove every onboarding certificate
    Clear {
        #[arg(long)]
        yes: bool,
    },
}

pub async fn run(manager: &TrustManager, cmd: OnboardCmd, out: &mut impl Write) -> Result<()> {
    match cmd {
        OnboardCmd::Add { cert, serials } => {
            let cert = read_certificate(&cert).await?;
            manager.onboard_register(&cert, &serials).await?;
            note_success(
                out,
                &format!("Registered {} with {} serial(s)", cert.common_name(), serials.len()),
            )?;
        }
        OnboardCmd::Check { cert, serial } => {
            let cert = read_certificate(&cert).await?;
            manager.onboard_check(&cert, &serial).await?;
            note_success(out, &format!("{} may onboard serial {serial}", cert.common_name()))?;
        }
        OnboardCmd::List => {
            for cn in manager.onboard_list().await? {
                writeln!(out, "{cn}")?;
            }
        }
        OnboardCmd::Get { cn, pem } => {
            let record = manager.onboard_get(&cn).await?;
            let rows = vec![vec![cn.clone(), record.serials.join(",")]];
            write!(out, "{}", render_table(&["CN", "SERIALS"], &rows))?;
            if pem {
                write!(out, "{}", record.cert.to_pem())?;
            }
        }
        OnboardCmd::Remove { cn } => {
            manager.onboard_remove(&cn).await?;
            note_success(out, &format!("Removed {cn}"))?;
        }
        OnboardCmd::Clear { yes } => {
            if !yes {
                bail!("refusing to remove every onboarding certificate without --yes");
            }
            manager.onboard_clear().await?;
            note_success(out, "Removed all onboarding certificates")?;
        }
    }
    Ok(())
}
