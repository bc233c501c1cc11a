//! Configuration loading with TOML file + environment overrides
//!
//! Resolution priority for every value: command line → environment variable →
//! TOML config file → compiled default. The CLI layer lives in each binary;
//! this module handles the env/TOML/default tiers.

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Top-level TOML configuration file model
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TomlConfig {
    /// Path to the SQLite database file
    pub database: Option<String>,
    /// HTTP listen port
    pub port: Option<u16>,
    /// External messaging platform settings
    #[serde(default)]
    pub platform: PlatformConfig,
    /// Backlog processor settings
    #[serde(default)]
    pub backlog: BacklogConfig,
    /// Expected stage → tag pairs checked (log-only) against the directory
    #[serde(default)]
    pub expected_tags: Vec<ExpectedTag>,
}

/// External platform (ManyChat-compatible API) settings
#[derive(Debug, Clone, Deserialize)]
pub struct PlatformConfig {
    pub base_url: Option<String>,
    pub api_token: Option<String>,
    /// Minimum spacing between outbound API calls, milliseconds
    pub rate_limit_ms: Option<u64>,
    /// Maximum attempts for a single request (transient failures)
    pub max_attempts: Option<u32>,
    /// Settling delay between tag-remove and tag-add phases, milliseconds
    pub settle_delay_ms: Option<u64>,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_token: None,
            rate_limit_ms: None,
            max_attempts: None,
            settle_delay_ms: None,
        }
    }
}

/// Backlog processor settings
#[derive(Debug, Clone, Deserialize)]
pub struct BacklogConfig {
    /// Records fetched per sweep batch
    pub batch_size: Option<u32>,
    /// Retry budget before a record is permanently failed
    pub max_retry: Option<u32>,
    /// Seconds between backlog sweeps
    pub interval_secs: Option<u64>,
    /// Courtesy delay between individual records, milliseconds
    pub record_delay_ms: Option<u64>,
    /// Delay between batches within one sweep, milliseconds
    pub batch_delay_ms: Option<u64>,
}

impl Default for BacklogConfig {
    fn default() -> Self {
        Self {
            batch_size: None,
            max_retry: None,
            interval_secs: None,
            record_delay_ms: None,
            batch_delay_ms: None,
        }
    }
}

/// A stage → tag pair the operator expects the directory to contain.
/// Mismatches are logged, never auto-corrected.
#[derive(Debug, Clone, Deserialize)]
pub struct ExpectedTag {
    pub stage: String,
    pub tag: String,
}

/// Locate the config file: explicit path (from CLI), then `AUTOCRED_CONFIG`,
/// then `./autocred.toml` if present.
pub fn resolve_config_path(cli_arg: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var("AUTOCRED_CONFIG") {
        return Some(PathBuf::from(path));
    }

    let default = PathBuf::from("autocred.toml");
    if default.exists() {
        return Some(default);
    }

    None
}

/// Load the TOML config file, or defaults when no file is found.
pub fn load_config(path: Option<&Path>) -> Result<TomlConfig> {
    match resolve_config_path(path) {
        Some(path) => {
            let content = std::fs::read_to_string(&path).map_err(|e| {
                Error::Config(format!("Cannot read config file {}: {}", path.display(), e))
            })?;
            let config: TomlConfig = toml::from_str(&content).map_err(|e| {
                Error::Config(format!("Invalid config file {}: {}", path.display(), e))
            })?;
            info!("Configuration loaded from {}", path.display());
            Ok(config)
        }
        None => {
            info!("No config file found, using defaults");
            Ok(TomlConfig::default())
        }
    }
}

/// Resolve a string value with env-over-TOML priority, warning when both are
/// set (potential misconfiguration).
pub fn resolve_string(
    name: &str,
    env_var: &str,
    toml_value: Option<&String>,
) -> Option<String> {
    let env_value = std::env::var(env_var).ok().filter(|v| !v.is_empty());

    if env_value.is_some() && toml_value.is_some() {
        warn!(
            "{} set in both environment ({}) and config file; using environment",
            name, env_var
        );
    }

    env_value.or_else(|| toml_value.cloned())
}
