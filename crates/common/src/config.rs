use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{RatekeeperError, RatekeeperResult};

/// Top-level configuration: a default limit, limiter tuning, and optional
/// per-endpoint overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub default: RateLimitConfig,
    #[serde(default)]
    pub limiter: LimiterConfig,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

/// Token bucket parameters for one limiter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Tokens granted per second of elapsed time.
    #[serde(default = "default_token_rate")]
    pub token_rate: f64,
    /// Bucket capacity, also the grant for a newly seen key.
    #[serde(default = "default_burst_size")]
    pub burst_size: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            token_rate: default_token_rate(),
            burst_size: default_burst_size(),
        }
    }
}

/// Settings shared by every limiter: eviction cadence and the retry bound
/// of the allow protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterConfig {
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Buckets without an allowed request for this long are evicted.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Compare-and-swap attempts before a request is denied.
    #[serde(default = "default_max_cas_retries")]
    pub max_cas_retries: u32,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
            idle_timeout_secs: default_idle_timeout(),
            max_cas_retries: default_max_cas_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub name: String,
    pub path_prefix: String,
    /// Falls back to [`AppConfig::default`] when absent.
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

// Default value helpers
fn default_token_rate() -> f64 {
    10.0
}
fn default_burst_size() -> u64 {
    20
}
fn default_sweep_interval() -> u64 {
    5 * 60
}
fn default_idle_timeout() -> u64 {
    60 * 60
}
fn default_max_cas_retries() -> u32 {
    100
}

impl AppConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> RatekeeperResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(content: &str) -> RatekeeperResult<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Limit that applies to `endpoint`, falling back to the default.
    pub fn limit_for(&self, endpoint: &EndpointConfig) -> RateLimitConfig {
        endpoint.rate_limit.unwrap_or(self.default)
    }

    /// Validate the configuration for consistency.
    pub fn validate(&self) -> RatekeeperResult<()> {
        validate_limit("default", &self.default)?;

        if self.limiter.sweep_interval_secs == 0 {
            return Err(RatekeeperError::Config(
                "limiter.sweep_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.limiter.max_cas_retries == 0 {
            return Err(RatekeeperError::Config(
                "limiter.max_cas_retries must be greater than zero".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for endpoint in &self.endpoints {
            if endpoint.name.is_empty() {
                return Err(RatekeeperError::Config(format!(
                    "endpoint with path_prefix '{}' has an empty name",
                    endpoint.path_prefix
                )));
            }
            if !names.insert(endpoint.name.as_str()) {
                return Err(RatekeeperError::Config(format!(
                    "duplicate endpoint name '{}'",
                    endpoint.name
                )));
            }
            if endpoint.path_prefix.is_empty() {
                return Err(RatekeeperError::Config(format!(
                    "endpoint '{}' has an empty path_prefix",
                    endpoint.name
                )));
            }
            if let Some(ref limit) = endpoint.rate_limit {
                validate_limit(&endpoint.name, limit)?;
            }
        }

        Ok(())
    }
}

fn validate_limit(scope: &str, limit: &RateLimitConfig) -> RatekeeperResult<()> {
    if limit.token_rate.is_nan() || limit.token_rate < 0.0 {
        return Err(RatekeeperError::Config(format!(
            "{scope}: token_rate must be a non-negative number, got {}",
            limit.token_rate
        )));
    }
    Ok(())
}
