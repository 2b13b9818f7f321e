//! Config file read/write.

use crate::schema::KeystoneConfig;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Default config file name within the config directory.
const CONFIG_FILE_NAME: &str = "keystone.yaml";

/// Resolve the Keystone config directory.
/// Priority: `KEYSTONE_CONFIG_DIR` env > `~/.keystone/` > `./.keystone`
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("KEYSTONE_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .map(|home| home.join(".keystone"))
        .unwrap_or_else(|| PathBuf::from(".keystone"))
}

/// Resolve the full path to the main config file.
pub fn config_file_path(config_dir: &Path) -> PathBuf {
    config_dir.join(CONFIG_FILE_NAME)
}

/// Load and parse the config as a raw YAML value tree.
///
/// Returns an empty mapping if the file doesn't exist.
pub async fn load_config_value(path: &Path) -> Result<serde_json::Value> {
    if !path.exists() {
        debug!(path = %path.display(), "Config file does not exist; using defaults");
        return Ok(serde_json::Value::Object(Default::default()));
    }

    let raw = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    if raw.trim().is_empty() {
        return Ok(serde_json::Value::Object(Default::default()));
    }
    let value: serde_json::Value = serde_yaml::from_str(&raw)
        .with_context(|| format!("Failed to parse config YAML at: {}", path.display()))?;

    info!(path = %path.display(), "Loaded config");
    Ok(value)
}

/// Load and parse the config without substitution or defaults.
pub async fn load_config(path: &Path) -> Result<KeystoneConfig> {
    let value = load_config_value(path).await?;
    serde_json::from_value(value)
        .with_context(|| format!("Invalid config at: {}", path.display()))
}

/// Write config to disk atomically (write to temp file, rename).
pub async fn write_config(config: &KeystoneConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.with_context(|| {
            format!("Failed to create config directory: {}", parent.display())
        })?;
    }

    let yaml = serde_yaml::to_string(config).context("Failed to serialize config to YAML")?;

    let tmp_path = path.with_extension("yaml.tmp");
    fs::write(&tmp_path, yaml.as_bytes())
        .await
        .with_context(|| format!("Failed to write temp config: {}", tmp_path.display()))?;

    fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("Failed to rename temp config to: {}", path.display()))?;

    info!(path = %path.display(), "Wrote config");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defaults::apply_all_defaults;

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("keystone-config-{}-{name}", std::process::id()))
            .join(CONFIG_FILE_NAME)
    }

    #[tokio::test]
    async fn missing_file_loads_as_default() {
        let cfg = load_config(&scratch("missing")).await.unwrap();
        assert_eq!(cfg, KeystoneConfig::default());
    }

    #[tokio::test]
    async fn write_then_load_round_trip() {
        let path = scratch("roundtrip");
        let cfg = apply_all_defaults(KeystoneConfig::default());
        write_config(&cfg, &path).await.unwrap();
        assert_eq!(load_config(&path).await.unwrap(), cfg);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn empty_file_is_default() {
        let path = scratch("empty");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "").unwrap();
        assert_eq!(load_config(&path).await.unwrap(), KeystoneConfig::default());
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
