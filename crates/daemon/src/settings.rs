//! Daemon configuration
//!
//! Layered: built-in defaults, then a TOML file, then `FLOWLINE_*`
//! environment variables (`__` separates nested keys, e.g.
//! `FLOWLINE_RETRY__MAX_RETRIES=5`).

use anyhow::{Context, Result};
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File};
use directories::ProjectDirs;
use flowline_core::{RateLimitConfig, RetryConfig};
use serde::Deserialize;
use std::path::PathBuf;

/// Env var naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "FLOWLINE_CONFIG";

const ENV_PREFIX: &str = "FLOWLINE";
const CONFIG_FILE_NAME: &str = "flowline.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FlowlineConfig {
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    /// Fallback filter when `RUST_LOG` is unset
    pub log_level: String,
    pub log_format: LogFormat,
    /// Optional daily-rolling log file, in addition to stderr
    pub log_file: Option<PathBuf>,
}

impl Default for FlowlineConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            log_level: "info".to_string(),
            log_format: LogFormat::default(),
            log_file: None,
        }
    }
}

/// Load configuration from the config file and process environment
pub fn load() -> Result<FlowlineConfig> {
    let mut builder = Config::builder();

    match std::env::var_os(CONFIG_PATH_ENV) {
        Some(path) => {
            builder = builder.add_source(File::from(PathBuf::from(path)).required(true));
        }
        None => {
            if let Some(dirs) = ProjectDirs::from("dev", "flowline", "flowline") {
                let path = dirs.config_dir().join(CONFIG_FILE_NAME);
                builder = builder.add_source(File::from(path).required(false));
            }
        }
    }

    resolve(builder.add_source(environment()))
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

fn resolve(builder: ConfigBuilder<DefaultState>) -> Result<FlowlineConfig> {
    let config: FlowlineConfig = builder
        .build()
        .context("Failed to read configuration")?
        .try_deserialize()
        .context("Invalid configuration")?;

    config.rate_limit.validate()?;
    config.retry.validate()?;
    Ok(config)
}
