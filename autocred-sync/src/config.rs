//! Configuration resolution for autocred-sync
//!
//! Resolves runtime settings with CLI → environment → TOML → default priority.
//! Platform credentials come from `AUTOCRED_PLATFORM_TOKEN` /
//! `AUTOCRED_PLATFORM_BASE_URL` or the `[platform]` section of the config file.

use autocred_common::config::{resolve_string, ExpectedTag, TomlConfig};
use autocred_common::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_PORT: u16 = 5810;
const DEFAULT_DATABASE: &str = "autocred.db";
const DEFAULT_RATE_LIMIT_MS: u64 = 10;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_SETTLE_DELAY_MS: u64 = 1000;
const DEFAULT_BATCH_SIZE: u32 = 10;
const DEFAULT_MAX_RETRY: u32 = 3;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
const DEFAULT_RECORD_DELAY_MS: u64 = 200;
const DEFAULT_BATCH_DELAY_MS: u64 = 1000;

/// Fully resolved runtime settings
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub database: PathBuf,
    pub port: u16,
    pub platform: PlatformSettings,
    pub backlog: BacklogSettings,
    pub expected_tags: Vec<ExpectedTag>,
}

/// External platform client settings
#[derive(Debug, Clone)]
pub struct PlatformSettings {
    pub base_url: String,
    pub api_token: String,
    /// Minimum spacing between dispatched API calls
    pub rate_limit: Duration,
    /// Attempt budget for one request (transient failures)
    pub max_attempts: u32,
    /// Delay between the tag-remove and tag-add phases
    pub settle_delay: Duration,
}

/// Backlog processor settings
#[derive(Debug, Clone)]
pub struct BacklogSettings {
    pub batch_size: u32,
    pub max_retry: u32,
    pub sweep_interval: Duration,
    pub record_delay: Duration,
    pub batch_delay: Duration,
}

impl SyncSettings {
    /// Resolve settings from CLI overrides + loaded TOML + environment.
    pub fn resolve(
        toml: &TomlConfig,
        cli_database: Option<&str>,
        cli_port: Option<u16>,
    ) -> Result<Self> {
        let database = cli_database
            .map(str::to_string)
            .or_else(|| std::env::var("AUTOCRED_DATABASE").ok())
            .or_else(|| toml.database.clone())
            .unwrap_or_else(|| DEFAULT_DATABASE.to_string());

        let port = cli_port
            .or_else(|| {
                std::env::var("AUTOCRED_PORT")
                    .ok()
                    .and_then(|p| p.parse().ok())
            })
            .or(toml.port)
            .unwrap_or(DEFAULT_PORT);

        let base_url = resolve_string(
            "platform base URL",
            "AUTOCRED_PLATFORM_BASE_URL",
            toml.platform.base_url.as_ref(),
        )
        .ok_or_else(|| {
            Error::Config(
                "Platform base URL not configured. Set AUTOCRED_PLATFORM_BASE_URL or \
                 [platform] base_url in the config file."
                    .to_string(),
            )
        })?;

        let api_token = resolve_string(
            "platform API token",
            "AUTOCRED_PLATFORM_TOKEN",
            toml.platform.api_token.as_ref(),
        )
        .ok_or_else(|| {
            Error::Config(
                "Platform API token not configured. Set AUTOCRED_PLATFORM_TOKEN or \
                 [platform] api_token in the config file."
                    .to_string(),
            )
        })?;

        Ok(Self {
            database: PathBuf::from(database),
            port,
            platform: PlatformSettings {
                base_url,
                api_token,
                rate_limit: Duration::from_millis(
                    toml.platform.rate_limit_ms.unwrap_or(DEFAULT_RATE_LIMIT_MS),
                ),
                max_attempts: toml.platform.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
                settle_delay: Duration::from_millis(
                    toml.platform
                        .settle_delay_ms
                        .unwrap_or(DEFAULT_SETTLE_DELAY_MS),
                ),
            },
            backlog: BacklogSettings {
                batch_size: toml.backlog.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
                max_retry: toml.backlog.max_retry.unwrap_or(DEFAULT_MAX_RETRY),
                sweep_interval: Duration::from_secs(
                    toml.backlog
                        .interval_secs
                        .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS),
                ),
                record_delay: Duration::from_millis(
                    toml.backlog.record_delay_ms.unwrap_or(DEFAULT_RECORD_DELAY_MS),
                ),
                batch_delay: Duration::from_millis(
                    toml.backlog.batch_delay_ms.unwrap_or(DEFAULT_BATCH_DELAY_MS),
                ),
            },
            expected_tags: toml.expected_tags.clone(),
        })
    }
}
