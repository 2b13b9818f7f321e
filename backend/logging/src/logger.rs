//! Structured Logger
//!
//! Wraps `tracing` with a console layer and an optional daily-rolling NDJSON
//! file, with `RUST_LOG` taking precedence over the configured level.

use std::path::Path;

use anyhow::Context;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const LOG_FILE_PREFIX: &str = "keystone.log";

/// Console output style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl LogFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        }
    }
}

/// Initialize the global logger.
///
/// Console output goes to stderr so command output on stdout stays clean.
/// With `log_dir` set, NDJSON is also written to `keystone.log.YYYY-MM-DD`.
/// Calling this twice is harmless; the second subscriber is dropped.
pub fn init_logger(log_dir: Option<&Path>, level: &str, format: LogFormat) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("invalid log level {level:?}"))?;

    let console_layer = match format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_ansi(true)
            .boxed(),
    };

    let file_layer = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating log directory {}", dir.display()))?;
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE_PREFIX);
            Some(
                fmt::layer()
                    .json()
                    .with_writer(appender)
                    .with_ansi(false),
            )
        }
        None => None,
    };

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_garbage_level() {
        std::env::remove_var("RUST_LOG");
        assert!(init_logger(None, "keystone=loud", LogFormat::Pretty).is_err());
    }

    #[test]
    fn creates_log_directory() {
        let dir = std::env::temp_dir().join(format!("keystone-log-{}", std::process::id()));
        init_logger(Some(&dir), "warn", LogFormat::Json).unwrap();
        assert!(dir.is_dir());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
