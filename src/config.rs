use crate::config_validator::ConfigValidator;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::{Validate, ValidationError};

/// Default number of compare-and-set rounds `allow_exact` tries before giving up.
pub const DEFAULT_MAX_CAS_ATTEMPTS: u32 = 8;

/// Rate, interval and burst shared by every bucket of one limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct LimiterConfig {
    /// Permits granted per `interval`
    #[validate(range(min = 1, message = "rate must be greater than 0"))]
    pub rate: i64,

    /// Window over which `rate` permits accrue, e.g. `"1s"`
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "validate_interval"))]
    pub interval: Duration,

    /// Maximum permits a bucket may hold
    #[validate(range(min = 1, message = "burst must be greater than 0"))]
    pub burst: i64,

    #[serde(default = "default_max_cas_attempts")]
    #[validate(range(min = 1, message = "max_cas_attempts must be greater than 0"))]
    pub max_cas_attempts: u32,
}

fn default_max_cas_attempts() -> u32 {
    DEFAULT_MAX_CAS_ATTEMPTS
}

fn validate_interval(interval: &Duration) -> std::result::Result<(), ValidationError> {
    if interval.is_zero() {
        return Err(ValidationError::new("interval_zero")
            .with_message("interval must be greater than 0".into()));
    }
    if i64::try_from(interval.as_nanos()).is_err() {
        return Err(ValidationError::new("interval_overflow")
            .with_message("interval must fit in i64 nanoseconds".into()));
    }
    Ok(())
}

impl LimiterConfig {
    pub fn new(rate: i64, interval: Duration, burst: i64) -> Self {
        Self {
            rate,
            interval,
            burst,
            max_cas_attempts: DEFAULT_MAX_CAS_ATTEMPTS,
        }
    }

    pub fn with_max_cas_attempts(mut self, attempts: u32) -> Self {
        self.max_cas_attempts = attempts;
        self
    }

    /// Validate every field, mapping failures to `Error::InvalidConfiguration`.
    pub fn validate_config(&self) -> Result<()> {
        self.validate()
            .map_err(|e| Error::InvalidConfiguration(e.to_string()))
    }

    /// `interval` in nanoseconds, saturating at `i64::MAX`.
    pub fn interval_ns(&self) -> i64 {
        i64::try_from(self.interval.as_nanos()).unwrap_or(i64::MAX)
    }
}

/// Connection settings for the Redis-backed stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    /// Prefix prepended to every bucket key, e.g. `"ratelimit:"`
    #[serde(default)]
    pub namespace: Option<String>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            namespace: None,
        }
    }
}

impl RedisConfig {
    pub fn validate_config(&self) -> Result<()> {
        ConfigValidator::validate_redis_url(&self.url)?;
        if let Some(namespace) = &self.namespace {
            ConfigValidator::validate_namespace(namespace)?;
        }
        Ok(())
    }
}
