use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Errors raised while reading or validating configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    MissingVar(&'static str),
    #[error("invalid value for {key}: '{value}' ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("configuration errors:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
}

/// Configuration for the proxy. Immutable once loaded.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Port the proxy listens on (default: 8000)
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Host name of the service traffic is forwarded to
    pub target_service: String,

    /// Port of the service traffic is forwarded to
    pub target_port: u16,

    /// Seconds without traffic before the project is stopped (default: 24h)
    #[serde(default = "default_sleep_timeout")]
    pub sleep_timeout_secs: u64,

    /// Seconds between idle checks, also used by the loading page to poll
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    /// Path prefix for the proxy's own endpoints
    #[serde(default = "default_endpoint_prefix")]
    pub endpoint_prefix: String,

    /// Containers carrying this label are never started or stopped
    #[serde(default = "default_exclusion_label")]
    pub exclusion_label: String,

    /// Docker endpoint override, e.g. unix:///var/run/docker.sock
    pub docker_host: Option<String>,

    /// Compose project to manage. Discovered from our own container when unset.
    pub project_name: Option<String>,

    /// Path requested on the target to confirm the application answers
    #[serde(default = "default_probe_path")]
    pub probe_path: String,

    /// Timeout for the application probe in milliseconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Seconds docker waits between SIGTERM and SIGKILL when stopping a member
    #[serde(default = "default_stop_grace_period")]
    pub stop_grace_period_secs: u64,

    /// Maximum idle upstream connections kept open (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle upstream connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

// Default value functions
fn default_proxy_port() -> u16 {
    8000
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_sleep_timeout() -> u64 {
    86400 // 24 hours
}

fn default_check_interval() -> u64 {
    5
}

fn default_endpoint_prefix() -> String {
    "sleep-proxy".to_string()
}

fn default_exclusion_label() -> String {
    "sleep-proxy.exclude".to_string()
}

fn default_probe_path() -> String {
    "/".to_string()
}

fn default_probe_timeout() -> u64 {
    2000
}

fn default_stop_grace_period() -> u64 {
    10
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    ///
    /// Empty values are treated as unset, matching how compose files usually
    /// pass optional variables through.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let target_service = get("TARGET_SERVICE").ok_or(ConfigError::MissingVar("TARGET_SERVICE"))?;
        let target_port = get("TARGET_PORT").ok_or(ConfigError::MissingVar("TARGET_PORT"))?;

        let mut config = Config {
            proxy_port: parse_or("PROXY_PORT", get("PROXY_PORT"), default_proxy_port())?,
            bind: get("BIND_ADDRESS").unwrap_or_else(default_bind_address),
            target_service,
            target_port: parse_or("TARGET_PORT", Some(target_port), 0)?,
            sleep_timeout_secs: parse_or("SLEEP_TIMEOUT", get("SLEEP_TIMEOUT"), default_sleep_timeout())?,
            check_interval_secs: parse_or("CHECK_INTERVAL", get("CHECK_INTERVAL"), default_check_interval())?,
            endpoint_prefix: get("ENDPOINT_PREFIX").unwrap_or_else(default_endpoint_prefix),
            exclusion_label: get("EXCLUSION_LABEL").unwrap_or_else(default_exclusion_label),
            docker_host: get("DOCKER_HOST"),
            project_name: get("PROJECT_NAME"),
            probe_path: get("PROBE_PATH").unwrap_or_else(default_probe_path),
            probe_timeout_ms: parse_or("PROBE_TIMEOUT_MS", get("PROBE_TIMEOUT_MS"), default_probe_timeout())?,
            stop_grace_period_secs: parse_or(
                "STOP_GRACE_PERIOD",
                get("STOP_GRACE_PERIOD"),
                default_stop_grace_period(),
            )?,
            pool_max_idle_per_host: parse_or(
                "POOL_MAX_IDLE_PER_HOST",
                get("POOL_MAX_IDLE_PER_HOST"),
                default_pool_max_idle_per_host(),
            )?,
            pool_idle_timeout_secs: parse_or(
                "POOL_IDLE_TIMEOUT",
                get("POOL_IDLE_TIMEOUT"),
                default_pool_idle_timeout(),
            )?,
        };

        config.normalize();
        config.validate()?;
        Ok(config)
    }

    fn normalize(&mut self) {
        self.endpoint_prefix = self.endpoint_prefix.trim_matches('/').to_string();
        if !self.probe_path.starts_with('/') {
            self.probe_path.insert(0, '/');
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.target_service.trim().is_empty() {
            errors.push("target_service must not be empty".to_string());
        }
        if self.target_port == 0 {
            errors.push("target_port must be a non-zero port".to_string());
        }
        if self.sleep_timeout_secs == 0 {
            errors.push("sleep_timeout_secs must be greater than zero".to_string());
        }
        if self.check_interval_secs == 0 {
            errors.push("check_interval_secs must be greater than zero".to_string());
        }
        if self.probe_timeout_ms == 0 {
            errors.push("probe_timeout_ms must be greater than zero".to_string());
        }
        if self.endpoint_prefix.is_empty() {
            errors.push("endpoint_prefix must not be empty".to_string());
        } else if self.endpoint_prefix == "static" {
            errors.push("endpoint_prefix 'static' collides with bundled assets".to_string());
        }
        if self.exclusion_label.trim().is_empty() {
            errors.push("exclusion_label must not be empty".to_string());
        }

        if !errors.is_empty() {
            return Err(ConfigError::Invalid(errors));
        }

        Ok(())
    }

    pub fn sleep_timeout(&self) -> Duration {
        Duration::from_secs(self.sleep_timeout_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_secs(self.stop_grace_period_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }

    /// `host:port` of the proxied service
    pub fn target_authority(&self) -> String {
        format!("{}:{}", self.target_service, self.target_port)
    }
}

fn parse_or<T>(key: &'static str, value: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key,
            value: raw,
            reason: e.to_string(),
        }),
    }
}
