//! Config validation with path-qualified messages.

use crate::schema::KeystoneConfig;
use thiserror::Error;
use url::Url;

/// A config validation error with field path and message.
#[derive(Debug, Error)]
#[error("Config validation error at '{path}': {message}")]
pub struct ConfigValidationError {
    pub path: String,
    pub message: String,
}

/// All errors and warnings found in one pass.
#[derive(Debug, Default)]
pub struct ValidationReport {
    pub errors: Vec<ConfigValidationError>,
    pub warnings: Vec<ConfigValidationError>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ConfigValidationError {
            path: path.into(),
            message: message.into(),
        });
    }

    fn warn(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ConfigValidationError {
            path: path.into(),
            message: message.into(),
        });
    }
}

/// Validate the config and return a report of all errors and warnings.
pub fn validate(config: &KeystoneConfig) -> ValidationReport {
    let mut report = ValidationReport::default();
    validate_store(config, &mut report);
    validate_telemetry(config, &mut report);
    validate_cache(config, &mut report);
    validate_recovery(config, &mut report);
    report
}

fn validate_store(config: &KeystoneConfig, report: &mut ValidationReport) {
    let Some(raw) = config.store.as_ref().and_then(|s| s.url.as_deref()) else {
        return;
    };
    let url = match Url::parse(raw) {
        Ok(url) => url,
        Err(e) => {
            report.error("store.url", format!("Not a URL: {e}"));
            return;
        }
    };
    match url.scheme() {
        "redis" => {
            let db = url.path().trim_start_matches('/');
            if !db.is_empty() && db.parse::<u32>().is_err() {
                report.error("store.url", format!("Database '{db}' must be a number"));
            }
        }
        "memory" => report.warn(
            "store.url",
            "In-memory store keeps nothing across restarts",
        ),
        other => report.error(
            "store.url",
            format!("Unsupported store scheme '{other}'. Use 'redis' or 'memory'"),
        ),
    }
}

fn validate_telemetry(config: &KeystoneConfig, report: &mut ValidationReport) {
    let Some(telemetry) = &config.telemetry else { return };
    for (name, cap) in [
        ("logs_cap", telemetry.logs_cap),
        ("info_cap", telemetry.info_cap),
        ("metrics_cap", telemetry.metrics_cap),
    ] {
        if cap == Some(0) {
            report.warn(
                format!("telemetry.{name}"),
                "A cap of 0 leaves the stream unbounded",
            );
        }
    }
    if telemetry.read_batch == Some(0) {
        report.error("telemetry.read_batch", "read_batch must be >= 1");
    }
}

fn validate_cache(config: &KeystoneConfig, report: &mut ValidationReport) {
    let Some(secs) = config.cache.as_ref().and_then(|c| c.timeout_secs) else {
        return;
    };
    if secs > 3600 {
        report.warn(
            "cache.timeout_secs",
            format!("Trust changes made by other processes may go unseen for up to {secs}s"),
        );
    }
}

fn validate_recovery(config: &KeystoneConfig, report: &mut ValidationReport) {
    if config.recovery.as_ref().and_then(|r| r.sweep_interval_secs) == Some(0) {
        report.error("recovery.sweep_interval_secs", "sweep_interval_secs must be >= 1");
    }
}
