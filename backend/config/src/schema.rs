//! Keystone runtime configuration schema.
//!
//! Every section and field is optional in the file; `defaults::apply_all_defaults`
//! fills in what was left out.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the Keystone trust backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeystoneConfig {
    /// Backing store connection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreConfig>,

    /// Trust cache behaviour
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheConfig>,

    /// Telemetry stream limits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telemetry: Option<TelemetryConfig>,

    /// Startup recovery of interrupted operations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery: Option<RecoveryConfig>,

    /// Logging configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// `redis://[password@]host[:port][/db]` or `memory://`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Seconds a trust snapshot stays fresh; 0 refreshes on every call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TelemetryConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs_cap: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info_cap: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_cap: Option<usize>,
    /// Entries fetched per reader page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_batch: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecoveryConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sweep_on_start: Option<bool>,
    /// Pending markers younger than this are left for their owner to finish.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grace_secs: Option<u64>,
    /// Period of the background sweep run by `keystone recover --watch`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sweep_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `keystone_trust=debug`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    /// Directory for rolling NDJSON logs; console only when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
    /// JSON console output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json: Option<bool>,
}

// ---------------------------------------------------------------------------
// Accessors over a defaulted config
// ---------------------------------------------------------------------------

impl KeystoneConfig {
    pub fn store_url(&self) -> &str {
        self.store
            .as_ref()
            .and_then(|s| s.url.as_deref())
            .unwrap_or(crate::defaults::DEFAULT_STORE_URL)
    }

    pub fn cache_timeout_secs(&self) -> u64 {
        self.cache
            .as_ref()
            .and_then(|c| c.timeout_secs)
            .unwrap_or(crate::defaults::DEFAULT_CACHE_TIMEOUT_SECS)
    }

    pub fn sweep_on_start(&self) -> bool {
        self.recovery
            .as_ref()
            .and_then(|r| r.sweep_on_start)
            .unwrap_or(true)
    }

    pub fn log_level(&self) -> &str {
        self.logging
            .as_ref()
            .and_then(|l| l.level.as_deref())
            .unwrap_or(crate::defaults::DEFAULT_LOG_LEVEL)
    }

    pub fn log_dir(&self) -> Option<&str> {
        self.logging.as_ref().and_then(|l| l.dir.as_deref())
    }

    pub fn log_json(&self) -> bool {
        self.logging.as_ref().and_then(|l| l.json).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partial_yaml() {
        let yaml = "store:\n  url: redis://cache:6379/1\ncache:\n  timeout_secs: 30\n";
        let cfg: KeystoneConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.store_url(), "redis://cache:6379/1");
        assert_eq!(cfg.cache_timeout_secs(), 30);
        assert!(cfg.telemetry.is_none());
        assert!(cfg.sweep_on_start());
    }

    #[test]
    fn rejects_unknown_keys() {
        let yaml = "store:\n  uri: redis://cache\n";
        assert!(serde_yaml::from_str::<KeystoneConfig>(yaml).is_err());
    }
}
