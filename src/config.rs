//! Configuration file parser for ~/.config/feedbower/config.toml.
//!
//! The config file is optional: a missing or empty file yields
//! `Config::default()`. Unknown top-level keys are accepted and logged as
//! warnings.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::feed::{FetchConfig, DEFAULT_USER_AGENT, MAX_FEED_SIZE};
use crate::util::{
    Cidr, CidrParseError, SecurityPolicy, DEFAULT_ALLOWED_PORTS, DEFAULT_BLOCKED_HOSTS,
    DEFAULT_BLOCKED_NETWORKS,
};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0} bytes (max 1 MB)")]
    TooLarge(u64),

    #[error("Invalid blocked network in [security]: {0}")]
    InvalidNetwork(#[from] CidrParseError),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database file. Defaults to `feedbower.db` next to the config file.
    pub database_path: Option<PathBuf>,
    pub fetch: FetchSettings,
    pub security: SecuritySettings,
    pub scheduler: SchedulerSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchSettings {
    pub timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub max_body_bytes: usize,
    pub max_redirects: usize,
    pub user_agent: String,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            read_timeout_secs: 10,
            max_body_bytes: MAX_FEED_SIZE,
            max_redirects: 5,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecuritySettings {
    pub blocked_hosts: Vec<String>,
    /// CIDR notation, e.g. `"10.0.0.0/8"`
    pub blocked_networks: Vec<String>,
    /// Ports at or below 1024 that may still be used explicitly
    pub allowed_ports: Vec<u16>,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            blocked_hosts: DEFAULT_BLOCKED_HOSTS.iter().map(|h| h.to_string()).collect(),
            blocked_networks: DEFAULT_BLOCKED_NETWORKS
                .iter()
                .map(|n| n.to_string())
                .collect(),
            allowed_ports: DEFAULT_ALLOWED_PORTS.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub politeness_delay_ms: u64,
    /// Minutes between runs in `serve` mode
    pub interval_minutes: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            politeness_delay_ms: 500,
            interval_minutes: 60,
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: &'static [&'static str] =
        &["database_path", "fetch", "security", "scheduler"];

    /// Load configuration from a TOML file.
    ///
    /// - Missing or blank file → `Ok(Config::default())`
    /// - Larger than 1 MB → `Err(ConfigError::TooLarge)`, checked before reading
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown top-level keys → accepted, logged as warnings
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let Some(content) = read_bounded(path, Self::MAX_FILE_SIZE)? else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        };
        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is blank, using defaults");
            return Ok(Self::default());
        }

        let table: toml::Table = content.parse()?;
        table
            .keys()
            .filter(|key| !Self::KNOWN_KEYS.contains(&key.as_str()))
            .for_each(|key| tracing::warn!(key = %key, "Unknown config key ignored"));

        let config: Config = toml::Value::Table(table).try_into()?;
        tracing::info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Builds the URL security policy.
    ///
    /// # Errors
    ///
    /// `ConfigError::InvalidNetwork` if any `blocked_networks` entry is not
    /// valid CIDR. The whole config is rejected rather than dropping the entry.
    pub fn security_policy(&self) -> Result<SecurityPolicy, ConfigError> {
        let blocked_networks = self
            .security
            .blocked_networks
            .iter()
            .map(|n| n.parse::<Cidr>())
            .collect::<Result<Vec<_>, _>>()?;

        Ok(SecurityPolicy {
            blocked_hosts: self.security.blocked_hosts.clone(),
            blocked_networks,
            allowed_ports: self.security.allowed_ports.clone(),
            max_redirects: self.fetch.max_redirects,
        })
    }

    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            timeout: Duration::from_secs(self.fetch.timeout_secs),
            read_timeout: Duration::from_secs(self.fetch.read_timeout_secs),
            max_body_bytes: self.fetch.max_body_bytes,
            user_agent: self.fetch.user_agent.clone(),
        }
    }

    pub fn politeness_delay(&self) -> Duration {
        Duration::from_millis(self.scheduler.politeness_delay_ms)
    }

    pub fn run_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.interval_minutes.max(1) * 60)
    }

    /// `database_path`, or `feedbower.db` inside `config_dir`.
    pub fn database_path_or(&self, config_dir: &Path) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| config_dir.join("feedbower.db"))
    }
}

/// Reads `path` unless it is missing (`None`) or longer than `max` bytes.
fn read_bounded(path: &Path, max: u64) -> Result<Option<String>, ConfigError> {
    let not_found = |e: &std::io::Error| e.kind() == std::io::ErrorKind::NotFound;
    let len = match std::fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if not_found(&e) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > max {
        return Err(ConfigError::TooLarge(len));
    }
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        // Removed after the size check
        Err(e) if not_found(&e) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

// ============================================================================
// Tests
// ============================================================================
