//! `keystone config`: inspect or initialise the config file.

use std::io::Write;
use std::path::Path;

use anyhow::{bail, Result};
use clap::Subcommand;
use keystone_config::{apply_all_defaults, redact, write_config, KeystoneConfig};

use crate::terminal_output::note_success;

#[derive(Subcommand, Debug)]
pub enum ConfigCmd {
    /// Print the effective config with secrets masked
    Show,
    /// Write a config file holding every default
    Init {
        #[arg(long)]
        force: bool,
    },
}

pub async fn run(
    cmd: ConfigCmd,
    config: &KeystoneConfig,
    path: &Path,
    out: &mut impl Write,
) -> Result<()> {
    match cmd {
        ConfigCmd::Show => {
            let value = serde_json::to_value(config)?;
            write!(out, "{}", serde_yaml::to_string(&redact(&value))?)?;
        }
        ConfigCmd::Init { force } => {
            if path.exists() && !force {
                bail!("{} already exists; pass --force to overwrite", path.display());
            }
            write_config(&apply_all_defaults(KeystoneConfig::default()), path).await?;
            note_success(out, &format!("Wrote {}", path.display()))?;
        }
    }
    Ok(())
}
