// Runtime configuration, read from the environment (and a `.env` file if present)

use crate::error::{AtlasError, Result};
use chrono_tz::Tz;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_BIND: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub bind: String,
    pub port: u16,
    pub request_timeout: Duration,
    pub timezone: Tz,
    pub static_dir: Option<PathBuf>,
    pub log_level: tracing::Level,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: Self::default_data_dir(),
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_PORT,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            timezone: Tz::UTC,
            static_dir: None,
            log_level: tracing::Level::INFO,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(dir) = lookup("ATLAS_DATA_DIR").filter(|v| !v.is_empty()) {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(bind) = lookup("ATLAS_BIND").filter(|v| !v.is_empty()) {
            config.bind = bind;
        }
        if let Some(port) = lookup("ATLAS_PORT") {
            config.port = port
                .parse()
                .map_err(|e| AtlasError::Config(format!("ATLAS_PORT '{}': {}", port, e)))?;
        }
        if let Some(secs) = lookup("ATLAS_REQUEST_TIMEOUT_SECS") {
            let secs: u64 = secs.parse().map_err(|e| {
                AtlasError::Config(format!("ATLAS_REQUEST_TIMEOUT_SECS '{}': {}", secs, e))
            })?;
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(tz) = lookup("ATLAS_TIMEZONE") {
            config.timezone = Tz::from_str(&tz)
                .map_err(|e| AtlasError::Config(format!("ATLAS_TIMEZONE '{}': {}", tz, e)))?;
        }
        if let Some(dir) = lookup("ATLAS_STATIC_DIR").filter(|v| !v.is_empty()) {
            config.static_dir = Some(PathBuf::from(dir));
        }
        if let Some(level) = lookup("ATLAS_LOG_LEVEL") {
            config.log_level = tracing::Level::from_str(&level)
                .map_err(|e| AtlasError::Config(format!("ATLAS_LOG_LEVEL '{}': {}", level, e)))?;
        }

        Ok(config)
    }

    fn default_data_dir() -> PathBuf {
        let mut path = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push("gtfs_atlas");
        path
    }
}
