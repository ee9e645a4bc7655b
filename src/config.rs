use anyhow::{bail, Context, Result};
use dirs::config_dir;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::store::RepoStore;

/// Main configuration structure for repowatch
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// GitHub account whose repositories are watched
    #[serde(default)]
    pub account: String,

    /// Time between poll cycles ("20", "20s", "5m", "1h", "1d")
    #[serde(default = "default_interval")]
    pub interval: String,

    /// What a failed upstream fetch does to the daemon
    #[serde(default)]
    pub on_fetch_error: ErrorPolicy,

    /// Tracked set storage
    #[serde(default)]
    pub store: StoreConfig,

    /// GitHub API settings
    #[serde(default)]
    pub github: GitHubConfig,

    /// Metrics endpoint
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Reaction to a failed listing or summary fetch
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    /// Log, abandon the current cycle, try again next interval
    #[default]
    Skip,
    /// Stop the daemon and exit with the error
    Abort,
}

/// Tracked set storage configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// SQLite database file
    #[serde(default = "default_store_path")]
    pub path: String,
}

/// GitHub API configuration
#[derive(Debug, Deserialize, Clone)]
pub struct GitHubConfig {
    /// API root, overridable for GitHub Enterprise or tests
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Optional token to lift the anonymous rate limit
    #[serde(default)]
    pub token: Option<String>,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

/// Metrics endpoint configuration
#[derive(Debug, Deserialize, Clone)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address for `GET /metrics`
    #[serde(default = "default_metrics_bind")]
    pub bind: String,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String, // "info"
}

/// Values supplied on the command line or through the environment.
/// Anything set here wins over the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub account: Option<String>,
    pub interval: Option<String>,
    pub db_path: Option<String>,
    pub metrics_bind: Option<String>,
    pub token: Option<String>,
}

// Default value functions
fn default_interval() -> String {
    "20s".to_string()
}
fn default_true() -> bool {
    true
}
fn default_store_path() -> String {
    RepoStore::default_db_path().to_string_lossy().into_owned()
}
fn default_api_base() -> String {
    "https://api.github.com".to_string()
}
fn default_user_agent() -> String {
    format!("repowatch/{}", env!("CARGO_PKG_VERSION"))
}
fn default_timeout() -> u64 {
    30
}
fn default_metrics_bind() -> String {
    "0.0.0.0:2112".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

// Default implementations
impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            token: None,
            user_agent: default_user_agent(),
            timeout: default_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            bind: default_metrics_bind(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            account: String::new(),
            interval: default_interval(),
            on_fetch_error: ErrorPolicy::default(),
            store: StoreConfig::default(),
            github: GitHubConfig::default(),
            metrics: MetricsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Parse duration strings like "20", "30s", "5m", "1h", "2d"
pub fn parse_duration(duration_str: &str) -> Result<Duration> {
    let duration_str = duration_str.trim().to_lowercase();

    let (value, unit_secs) = if let Some(value) = duration_str.strip_suffix('s') {
        (value.parse::<u64>().context("Invalid seconds value")?, 1)
    } else if let Some(value) = duration_str.strip_suffix('m') {
        (value.parse::<u64>().context("Invalid minutes value")?, 60)
    } else if let Some(value) = duration_str.strip_suffix('h') {
        (value.parse::<u64>().context("Invalid hours value")?, 3600)
    } else if let Some(value) = duration_str.strip_suffix('d') {
        (value.parse::<u64>().context("Invalid days value")?, 86400)
    } else {
        // Bare numbers are seconds
        let value = duration_str
            .parse::<u64>()
            .context("Invalid duration format. Use format like '20', '30s', '5m', '1h'")?;
        (value, 1)
    };

    let secs = value
        .checked_mul(unit_secs)
        .with_context(|| format!("Interval too large: {}", duration_str))?;
    Ok(Duration::from_secs(secs))
}

impl Config {
    /// Load the default config file if there is one, otherwise defaults
    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            tracing::debug!("No configuration at {:?}, using defaults", config_path);
            let mut config = Self::default();
            config.expand_paths()?;
            Ok(config)
        }
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        // Expand environment variables in paths
        config.expand_paths()?;

        Ok(config)
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("repowatch").join("config.yml"))
    }

    /// Expand `~` and environment variables in configuration paths
    pub fn expand_paths(&mut self) -> Result<()> {
        self.store.path = shellexpand::full(&self.store.path)
            .context("Failed to expand store path")?
            .into_owned();

        Ok(())
    }

    /// Layer command line and environment values over the file values
    pub fn apply_overrides(&mut self, overrides: Overrides) -> Result<()> {
        if let Some(account) = overrides.account {
            self.account = account;
        }
        if let Some(interval) = overrides.interval {
            self.interval = interval;
        }
        if let Some(path) = overrides.db_path {
            self.store.path = path;
            self.expand_paths()?;
        }
        if let Some(bind) = overrides.metrics_bind {
            self.metrics.bind = bind;
        }
        if let Some(token) = overrides.token.filter(|t| !t.is_empty()) {
            self.github.token = Some(token);
        }
        Ok(())
    }

    /// Poll interval as a [`Duration`]
    pub fn interval_duration(&self) -> Result<Duration> {
        let interval = parse_duration(&self.interval)
            .with_context(|| format!("Invalid poll interval: {}", self.interval))?;
        if interval.is_zero() {
            bail!("Poll interval must be greater than zero");
        }
        Ok(interval)
    }

    /// Metrics listen address
    pub fn metrics_addr(&self) -> Result<SocketAddr> {
        self.metrics
            .bind
            .parse()
            .with_context(|| format!("Invalid metrics bind address: {}", self.metrics.bind))
    }

    /// Check everything the daemon needs before it starts
    pub fn validate(&self) -> Result<()> {
        if self.account.trim().is_empty() {
            bail!(
                "No account configured. Pass --account, set REPOWATCH_ACCOUNT, \
                 or add `account:` to the config file"
            );
        }
        self.interval_duration()?;
        if self.metrics.enabled {
            self.metrics_addr()?;
        }
        Ok(())
    }
}
