//! `keystone-config`: Keystone runtime configuration.
//!
//! Provides:
//! - Typed config schema (store, cache, telemetry, recovery, logging)
//! - YAML read/write
//! - `${ENV_VAR}` substitution and `KEYSTONE_*` overrides
//! - Config redaction for safe display
//! - Default value application
//! - Validation report

pub mod defaults;
pub mod env;
pub mod io;
pub mod redact;
pub mod schema;
pub mod validation;

pub use defaults::apply_all_defaults;
pub use env::{
    apply_env_overrides, apply_env_overrides_with, collect_referenced_vars, resolve_env_vars,
    resolve_env_vars_with, MissingEnvVarError,
};
pub use io::{config_dir, config_file_path, load_config, load_config_value, write_config};
pub use redact::redact;
pub use schema::KeystoneConfig;
pub use validation::{validate, ConfigValidationError, ValidationReport};

use anyhow::{bail, Context, Result};
use std::path::Path;

/// Load a config file, substitute env vars, apply overrides and defaults, and
/// validate.
///
/// This is the main entry point for loading a config at runtime. Validation
/// errors abort; warnings are logged.
pub async fn load_and_prepare(path: &Path) -> Result<KeystoneConfig> {
    let value = load_config_value(path).await?;

    let value = resolve_env_vars(&value).context("Failed to resolve env vars in config")?;

    let config: KeystoneConfig = serde_json::from_value(value)
        .with_context(|| format!("Invalid config at: {}", path.display()))?;

    let config = apply_env_overrides(config)?;
    let config = apply_all_defaults(config);

    let report = validate(&config);
    for warning in &report.warnings {
        tracing::warn!(path = %warning.path, message = %warning.message, "Config warning");
    }
    if let Some(first) = report.errors.first() {
        for error in &report.errors {
            tracing::error!(path = %error.path, message = %error.message, "Config error");
        }
        bail!("{first} ({} error(s) in total)", report.errors.len());
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn invalid_file_aborts_loading() {
        let dir = std::env::temp_dir().join(format!("keystone-prepare-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("keystone.yaml");
        std::fs::write(&path, "telemetry:\n  read_batch: 0\n").unwrap();

        let err = load_and_prepare(&path).await.unwrap_err().to_string();
        assert!(err.contains("read_batch"), "{err}");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn file_values_survive_preparation() {
        let dir = std::env::temp_dir().join(format!("keystone-prepare-ok-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("keystone.yaml");
        std::fs::write(&path, "telemetry:\n  logs_cap: 500\nrecovery:\n  sweep_on_start: false\n").unwrap();

        let cfg = load_and_prepare(&path).await.unwrap();
        assert_eq!(cfg.telemetry.as_ref().unwrap().logs_cap, Some(500));
        assert!(!cfg.sweep_on_start());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
