//! Configuration loading and validation.
//!
//! Campaigner reads a single human-owned `config.toml` with three sections:
//! - `[delivery]`: concurrency, rate, quota, retry and circuit-breaker knobs
//! - `[provider]`: transactional email provider endpoint and sender identity
//! - `[storage]`: SQLite path for delivery outcomes and quota windows
//!
//! Every field has a default, so an empty file is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::delivery::circuit_breaker::CircuitScope;
use crate::delivery::quota::QuotaPeriod;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Delivery engine tuning.
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Provider endpoint and sender identity.
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Persistence settings.
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Delivery engine settings shared by every campaign run.
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Number of concurrent delivery workers.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Sustained provider calls per minute.
    #[serde(default = "default_rate_per_minute")]
    pub rate_per_minute: u32,

    /// Token bucket capacity (instantaneous burst allowance).
    #[serde(default = "default_rate_burst")]
    pub rate_burst: u32,

    /// Longest a worker waits for a rate-limiter slot before giving up.
    #[serde(default = "default_rate_limit_max_wait")]
    pub rate_limit_max_wait_seconds: u64,

    /// Hard ceiling on sends per quota window.
    #[serde(default = "default_daily_quota")]
    pub daily_quota: u32,

    /// Length of the quota window.
    #[serde(default)]
    pub quota_period: QuotaPeriod,

    /// Maximum attempts per message, including the first.
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,

    /// Backoff before the first retry, in seconds.
    #[serde(default = "default_base_backoff")]
    pub base_backoff_seconds: f64,

    /// Upper bound on any single backoff delay, in seconds.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_seconds: f64,

    /// Consecutive transient failures that trip a breaker.
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,

    /// Failures older than this no longer count towards the threshold.
    #[serde(default = "default_circuit_failure_window")]
    pub circuit_failure_window_seconds: u64,

    /// How long an open breaker rejects calls before probing.
    #[serde(default = "default_circuit_cooldown")]
    pub circuit_cooldown_seconds: u64,

    /// Whether breakers are shared per provider or per recipient domain.
    #[serde(default)]
    pub circuit_scope: CircuitScope,

    /// How many times a message may be deferred by an open breaker.
    #[serde(default = "default_circuit_max_deferrals")]
    pub circuit_max_deferrals: u32,

    /// Timeout for a single provider call.
    #[serde(default = "default_send_timeout")]
    pub send_timeout_seconds: u64,

    /// Synthesize successful outcomes without calling the provider.
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            rate_per_minute: default_rate_per_minute(),
            rate_burst: default_rate_burst(),
            rate_limit_max_wait_seconds: default_rate_limit_max_wait(),
            daily_quota: default_daily_quota(),
            quota_period: QuotaPeriod::default(),
            max_retry_attempts: default_max_retry_attempts(),
            base_backoff_seconds: default_base_backoff(),
            max_backoff_seconds: default_max_backoff(),
            circuit_failure_threshold: default_circuit_failure_threshold(),
            circuit_failure_window_seconds: default_circuit_failure_window(),
            circuit_cooldown_seconds: default_circuit_cooldown(),
            circuit_scope: CircuitScope::default(),
            circuit_max_deferrals: default_circuit_max_deferrals(),
            send_timeout_seconds: default_send_timeout(),
            dry_run: false,
        }
    }
}

impl DeliveryConfig {
    /// Refill rate of the token bucket in tokens per second.
    pub fn rate_per_second(&self) -> f64 {
        f64::from(self.rate_per_minute) / 60.0
    }

    /// Maximum rate-limiter wait as a [`Duration`].
    pub fn rate_limit_max_wait(&self) -> Duration {
        Duration::from_secs(self.rate_limit_max_wait_seconds)
    }

    /// Provider call timeout as a [`Duration`].
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_seconds)
    }

    /// Breaker cool-down as a [`Duration`].
    pub fn circuit_cooldown(&self) -> Duration {
        Duration::from_secs(self.circuit_cooldown_seconds)
    }

    /// Breaker failure window as a [`Duration`].
    pub fn circuit_failure_window(&self) -> Duration {
        Duration::from_secs(self.circuit_failure_window_seconds)
    }

    /// Check delivery settings for values that would make a run meaningless.
    ///
    /// Returns one human-readable message per problem; empty means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.concurrency == 0 {
            errors.push("delivery.concurrency must be > 0".to_owned());
        }
        if self.rate_per_minute == 0 {
            errors.push("delivery.rate_per_minute must be > 0".to_owned());
        }
        if self.rate_burst == 0 {
            errors.push("delivery.rate_burst must be > 0".to_owned());
        }
        if self.daily_quota == 0 {
            errors.push("delivery.daily_quota must be > 0".to_owned());
        }
        if self.max_retry_attempts == 0 {
            errors.push("delivery.max_retry_attempts must be >= 1".to_owned());
        }
        if !self.base_backoff_seconds.is_finite() || self.base_backoff_seconds < 0.0 {
            errors.push("delivery.base_backoff_seconds must be a non-negative number".to_owned());
        }
        if !self.max_backoff_seconds.is_finite() || self.max_backoff_seconds < 0.0 {
            errors.push("delivery.max_backoff_seconds must be a non-negative number".to_owned());
        }
        if self.base_backoff_seconds > self.max_backoff_seconds {
            errors.push(
                "delivery.base_backoff_seconds must not exceed delivery.max_backoff_seconds"
                    .to_owned(),
            );
        }
        if self.circuit_failure_threshold == 0 {
            errors.push("delivery.circuit_failure_threshold must be > 0".to_owned());
        }
        if self.send_timeout_seconds == 0 {
            errors.push("delivery.send_timeout_seconds must be > 0".to_owned());
        }
        errors
    }
}

/// Provider endpoint and sender identity.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Base URL of the provider API (without the `/emails` suffix).
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Name of the credential holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Sender address.
    #[serde(default = "default_from_email")]
    pub from_email: String,

    /// Sender display name.
    #[serde(default = "default_from_name")]
    pub from_name: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            from_email: default_from_email(),
            from_name: default_from_name(),
        }
    }
}

impl ProviderConfig {
    /// Formatted `From` header value, e.g. `No Reply <noreply@example.com>`.
    pub fn from_header(&self) -> String {
        format!("{} <{}>", self.from_name, self.from_email)
    }
}

/// Persistence settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    /// SQLite database path. Defaults to `~/.campaigner/campaigner.db`.
    #[serde(default)]
    pub db_path: Option<PathBuf>,
}

impl Config {
    /// Full preflight check: delivery settings plus provider identity.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = self.delivery.validate();

        if url::Url::parse(&self.provider.base_url).is_err() {
            errors.push(format!(
                "provider.base_url is not a valid URL: {:?}",
                self.provider.base_url
            ));
        }
        if self.provider.api_key_env.trim().is_empty() {
            errors.push("provider.api_key_env is missing".to_owned());
        }
        if self.provider.from_email.trim().is_empty() {
            errors.push("provider.from_email is missing".to_owned());
        } else if !self.provider.from_email.contains('@') {
            errors.push("provider.from_email must be an email address".to_owned());
        }
        if self.provider.from_name.trim().is_empty() {
            errors.push("provider.from_name is missing".to_owned());
        }
        errors
    }
}

// Default value functions for serde

fn default_concurrency() -> usize {
    5
}
fn default_rate_per_minute() -> u32 {
    120
}
fn default_rate_burst() -> u32 {
    10
}
fn default_rate_limit_max_wait() -> u64 {
    60
}
fn default_daily_quota() -> u32 {
    1000
}
fn default_max_retry_attempts() -> u32 {
    3
}
fn default_base_backoff() -> f64 {
    1.0
}
fn default_max_backoff() -> f64 {
    60.0
}
fn default_circuit_failure_threshold() -> u32 {
    5
}
fn default_circuit_failure_window() -> u64 {
    60
}
fn default_circuit_cooldown() -> u64 {
    30
}
fn default_circuit_max_deferrals() -> u32 {
    5
}
fn default_send_timeout() -> u64 {
    30
}
fn default_base_url() -> String {
    "https://api.resend.com".to_owned()
}
fn default_api_key_env() -> String {
    "RESEND_API_KEY".to_owned()
}
fn default_from_email() -> String {
    "noreply@example.com".to_owned()
}
fn default_from_name() -> String {
    "No Reply".to_owned()
}

/// Resolved runtime paths under the config directory.
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    /// Root directory (`~/.campaigner`).
    pub root: PathBuf,
    /// `config.toml` location.
    pub config_toml: PathBuf,
    /// `.env` credentials file.
    pub env_file: PathBuf,
    /// Default SQLite database.
    pub db_file: PathBuf,
    /// Log directory.
    pub logs_dir: PathBuf,
}

impl RuntimePaths {
    /// Derive all paths from a root directory.
    pub fn from_root(root: PathBuf) -> Self {
        Self {
            config_toml: root.join("config.toml"),
            env_file: root.join(".env"),
            db_file: root.join("campaigner.db"),
            logs_dir: root.join("logs"),
            root,
        }
    }

    /// Database path honouring the `[storage]` override.
    pub fn db_path(&self, storage: &StorageConfig) -> PathBuf {
        storage
            .db_path
            .clone()
            .unwrap_or_else(|| self.db_file.clone())
    }
}

/// Parse configuration from a TOML string.
///
/// # Errors
///
/// Returns an error if the TOML is malformed or has wrongly-typed fields.
pub fn parse_config(contents: &str) -> anyhow::Result<Config> {
    toml::from_str(contents).map_err(|e| anyhow::anyhow!("failed to parse config: {e}"))
}

/// Load configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config at {}: {e}", path.display()))?;
    toml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config at {}: {e}", path.display()))
}

/// Load `config.toml` from the default location, or defaults if it does not exist.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_default_config() -> anyhow::Result<Config> {
    let paths = runtime_paths()?;
    if paths.config_toml.exists() {
        load_config(&paths.config_toml)
    } else {
        Ok(Config::default())
    }
}

/// Resolve the default config directory (`~/.campaigner/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".campaigner"))
}

/// Resolve all runtime paths under [`config_dir`].
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn runtime_paths() -> anyhow::Result<RuntimePaths> {
    Ok(RuntimePaths::from_root(config_dir()?))
}
