//! Runtime configuration.
//!
//! Loaded from YAML and overlaid by `CAPRT_*` environment variables:
//!
//! ```yaml
//! failure_threshold: 5
//! circuit_cooldown_secs: 60
//! rate_limit_window_secs: 60
//! cache_ttl_secs: 3600
//! sweep_interval_secs: 300
//! retry_base_delay_ms: 1000
//! default_timeout_ms: 30000
//! max_retry_count: 5
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid value for {key}: '{value}'")]
    InvalidEnv { key: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Tunables of the resilience pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Consecutive failures that open a circuit
    pub failure_threshold: u32,
    /// How long an open circuit stays open after the last failure
    pub circuit_cooldown_secs: u64,
    /// Span of the sliding rate-limit window
    pub rate_limit_window_secs: u64,
    /// Lifetime of a cached output
    pub cache_ttl_secs: u64,
    /// Period of the background cache/window sweep
    pub sweep_interval_secs: u64,
    /// First retry delay; doubles on every further attempt
    pub retry_base_delay_ms: u64,
    /// Timeout used when a capability declares no time estimate
    pub default_timeout_ms: u64,
    /// Upper bound applied to a caller's `retry_count`
    pub max_retry_count: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            circuit_cooldown_secs: 60,
            rate_limit_window_secs: 60,
            cache_ttl_secs: 3600,
            sweep_interval_secs: 300,
            retry_base_delay_ms: 1000,
            default_timeout_ms: 30_000,
            max_retry_count: 5,
        }
    }
}

impl RuntimeConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Defaults overlaid by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().apply_env()
    }

    /// Overlay `CAPRT_*` variables from the process environment.
    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_overrides(std::env::vars())
    }

    /// Overlay `CAPRT_*` key/value pairs. Unknown keys are ignored.
    pub fn apply_overrides<I, K, V>(mut self, vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let (key, value) = (key.as_ref(), value.as_ref().trim());
            match key {
                "CAPRT_FAILURE_THRESHOLD" => self.failure_threshold = parse(key, value)?,
                "CAPRT_CIRCUIT_COOLDOWN_SECS" => self.circuit_cooldown_secs = parse(key, value)?,
                "CAPRT_RATE_LIMIT_WINDOW_SECS" => {
                    self.rate_limit_window_secs = parse(key, value)?
                }
                "CAPRT_CACHE_TTL_SECS" => self.cache_ttl_secs = parse(key, value)?,
                "CAPRT_SWEEP_INTERVAL_SECS" => self.sweep_interval_secs = parse(key, value)?,
                "CAPRT_RETRY_BASE_DELAY_MS" => self.retry_base_delay_ms = parse(key, value)?,
                "CAPRT_DEFAULT_TIMEOUT_MS" => self.default_timeout_ms = parse(key, value)?,
                "CAPRT_MAX_RETRY_COUNT" => self.max_retry_count = parse(key, value)?,
                _ => {}
            }
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::Invalid("failure_threshold must be at least 1".into()));
        }
        if self.rate_limit_window_secs == 0 {
            return Err(ConfigError::Invalid("rate_limit_window_secs must be positive".into()));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid("sweep_interval_secs must be positive".into()));
        }
        if self.default_timeout_ms == 0 {
            return Err(ConfigError::Invalid("default_timeout_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn circuit_cooldown(&self) -> Duration {
        Duration::from_secs(self.circuit_cooldown_secs)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidEnv {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.circuit_cooldown(), Duration::from_secs(60));
        assert_eq!(config.cache_ttl(), Duration::from_secs(3600));
        assert_eq!(config.sweep_interval(), Duration::from_secs(300));
        assert_eq!(config.retry_base_delay(), Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = RuntimeConfig::from_yaml_str("cache_ttl_secs: 120\nmax_retry_count: 2\n").unwrap();
        assert_eq!(config.cache_ttl_secs, 120);
        assert_eq!(config.max_retry_count, 2);
        assert_eq!(config.failure_threshold, 5);
    }

    #[test]
    fn test_invalid_yaml_values() {
        assert!(matches!(
            RuntimeConfig::from_yaml_str("failure_threshold: 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            RuntimeConfig::from_yaml_str("failure_threshold: many"),
            Err(ConfigError::Yaml(_))
        ));
    }

    #[test]
    fn test_from_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "circuit_cooldown_secs: 30").unwrap();
        writeln!(file, "retry_base_delay_ms: 250").unwrap();
        let config = RuntimeConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(config.circuit_cooldown(), Duration::from_secs(30));
        assert_eq!(config.retry_base_delay(), Duration::from_millis(250));

        assert!(matches!(
            RuntimeConfig::from_yaml_file("/nonexistent/caprt.yaml"),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let config = RuntimeConfig::default()
            .apply_overrides([
                ("CAPRT_CACHE_TTL_SECS", "60"),
                ("CAPRT_FAILURE_THRESHOLD", " 3 "),
                ("HOME", "/root"),
            ])
            .unwrap();
        assert_eq!(config.cache_ttl_secs, 60);
        assert_eq!(config.failure_threshold, 3);

        let err = RuntimeConfig::default()
            .apply_overrides([("CAPRT_DEFAULT_TIMEOUT_MS", "soon")])
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid value for CAPRT_DEFAULT_TIMEOUT_MS: 'soon'");
    }
}
