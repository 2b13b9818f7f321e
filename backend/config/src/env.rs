//! Environment handling for config values.
//!
//! Two passes run at load time:
//! - `${VAR}` references inside string values are substituted. Only uppercase
//!   `[A-Z_][A-Z0-9_]*` names are matched and `$${VAR}` escapes to a literal
//!   `${VAR}`.
//! - `KEYSTONE_*` variables override individual fields.

use anyhow::{bail, Context, Result};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;
use std::collections::HashMap;

use crate::schema::{CacheConfig, KeystoneConfig, LoggingConfig, StoreConfig};

pub const ENV_STORE_URL: &str = "KEYSTONE_STORE_URL";
pub const ENV_CACHE_TIMEOUT: &str = "KEYSTONE_CACHE_TIMEOUT";
pub const ENV_LOG_LEVEL: &str = "KEYSTONE_LOG_LEVEL";

/// An optional leading `$` marks the escape form.
static ENV_VAR_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\$?)\$\{([A-Z_][A-Z0-9_]*)\}").unwrap());

/// Error returned for missing env vars.
#[derive(Debug, thiserror::Error)]
#[error("Missing env var \"{var_name}\" referenced at config path: {config_path}")]
pub struct MissingEnvVarError {
    pub var_name: String,
    pub config_path: String,
}

/// Substitute `${VAR}` references in a config JSON value tree from the
/// process environment. Unset or empty variables are an error.
pub fn resolve_env_vars(value: &Value) -> Result<Value> {
    substitute_value(value, &std::env::vars().collect(), "")
}

/// Substitute env vars using a provided map.
pub fn resolve_env_vars_with(value: &Value, env: &HashMap<String, String>) -> Result<Value> {
    substitute_value(value, env, "")
}

fn substitute_value(value: &Value, env: &HashMap<String, String>, path: &str) -> Result<Value> {
    match value {
        Value::String(s) => Ok(Value::String(substitute_string(s, env, path)?)),
        Value::Array(arr) => arr
            .iter()
            .enumerate()
            .map(|(i, v)| substitute_value(v, env, &format!("{path}[{i}]")))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut result = serde_json::Map::new();
            for (k, v) in map {
                let child_path = if path.is_empty() {
                    k.clone()
                } else {
                    format!("{path}.{k}")
                };
                result.insert(k.clone(), substitute_value(v, env, &child_path)?);
            }
            Ok(Value::Object(result))
        }
        other => Ok(other.clone()),
    }
}

fn substitute_string(s: &str, env: &HashMap<String, String>, path: &str) -> Result<String> {
    if !s.contains('$') {
        return Ok(s.to_string());
    }

    let mut missing: Option<MissingEnvVarError> = None;
    let substituted = ENV_VAR_PATTERN.replace_all(s, |caps: &Captures| {
        let var_name = &caps[2];
        if !caps[1].is_empty() {
            return format!("${{{var_name}}}");
        }
        match env.get(var_name) {
            Some(val) if !val.is_empty() => val.clone(),
            _ => {
                missing.get_or_insert_with(|| MissingEnvVarError {
                    var_name: var_name.to_string(),
                    config_path: path.to_string(),
                });
                String::new()
            }
        }
    });

    if let Some(err) = missing {
        bail!(err);
    }
    Ok(substituted.into_owned())
}

/// Env var names referenced anywhere in a config value tree, sorted.
pub fn collect_referenced_vars(value: &Value) -> Vec<String> {
    let mut vars = Vec::new();
    collect_vars_recursive(value, &mut vars);
    vars.sort();
    vars.dedup();
    vars
}

fn collect_vars_recursive(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            for caps in ENV_VAR_PATTERN.captures_iter(s) {
                if caps[1].is_empty() {
                    out.push(caps[2].to_string());
                }
            }
        }
        Value::Array(arr) => arr.iter().for_each(|v| collect_vars_recursive(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_vars_recursive(v, out)),
        _ => {}
    }
}

/// Apply `KEYSTONE_*` overrides from the process environment.
pub fn apply_env_overrides(config: KeystoneConfig) -> Result<KeystoneConfig> {
    apply_env_overrides_with(config, &std::env::vars().collect())
}

pub fn apply_env_overrides_with(
    mut config: KeystoneConfig,
    env: &HashMap<String, String>,
) -> Result<KeystoneConfig> {
    let set = |name: &str| env.get(name).filter(|v| !v.is_empty());

    if let Some(url) = set(ENV_STORE_URL) {
        config.store.get_or_insert_with(StoreConfig::default).url = Some(url.clone());
    }
    if let Some(raw) = set(ENV_CACHE_TIMEOUT) {
        let secs: u64 = raw
            .trim()
            .parse()
            .with_context(|| format!("{ENV_CACHE_TIMEOUT} must be whole seconds, got {raw:?}"))?;
        config.cache.get_or_insert_with(CacheConfig::default).timeout_secs = Some(secs);
    }
    if let Some(level) = set(ENV_LOG_LEVEL) {
        config.logging.get_or_insert_with(LoggingConfig::default).level = Some(level.clone());
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn substitutes_nested_var() {
        let v = json!({"store": {"url": "redis://${REDIS_PASSWORD}@cache:6379"}});
        let result = resolve_env_vars_with(&v, &env(&[("REDIS_PASSWORD", "hunter2")])).unwrap();
        assert_eq!(result["store"]["url"], "redis://hunter2@cache:6379");
    }

    #[test]
    fn error_names_var_and_path() {
        let v = json!({"logging": {"dir": "${LOG_ROOT}/keystone"}});
        let err = resolve_env_vars_with(&v, &HashMap::new()).unwrap_err().to_string();
        assert!(err.contains("LOG_ROOT"));
        assert!(err.contains("logging.dir"));
    }

    #[test]
    fn escaped_reference_is_kept_literally() {
        let v = json!({"k": "$${NOT_A_VAR} and ${A}"});
        let result = resolve_env_vars_with(&v, &env(&[("A", "x")])).unwrap();
        assert_eq!(result["k"], "${NOT_A_VAR} and x");
        assert_eq!(collect_referenced_vars(&v), vec!["A".to_string()]);
    }

    #[test]
    fn overrides_replace_file_values() {
        let cfg = KeystoneConfig {
            store: Some(StoreConfig {
                url: Some("redis://file:6379".into()),
            }),
            ..Default::default()
        };
        let cfg = apply_env_overrides_with(
            cfg,
            &env(&[
                (ENV_STORE_URL, "memory://"),
                (ENV_CACHE_TIMEOUT, "15"),
                (ENV_LOG_LEVEL, "debug"),
            ]),
        )
        .unwrap();
        assert_eq!(cfg.store_url(), "memory://");
        assert_eq!(cfg.cache_timeout_secs(), 15);
        assert_eq!(cfg.log_level(), "debug");
    }

    #[test]
    fn malformed_timeout_override_is_an_error() {
        let result = apply_env_overrides_with(
            KeystoneConfig::default(),
            &env(&[(ENV_CACHE_TIMEOUT, "soon")]),
        );
        assert!(result.is_err());
    }
}
