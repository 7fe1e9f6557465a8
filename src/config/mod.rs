//! Session configuration.
//!
//! Settings are layered: built-in defaults, then an optional TOML file,
//! then environment variables prefixed with `REELFORGE__` using `__` as the
//! section separator (`REELFORGE__RATE_LIMIT__MAX_REQUESTS_PER_MINUTE=30`).

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::budget::BudgetPolicy;
use crate::pipeline::PipelineConfig;
use crate::rate_limit::RateLimitConfig;
use crate::retry::RetryConfig;
use crate::timeout::TimeoutConfig;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "REELFORGE";

/// Errors from loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Everything a session needs to start.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub budget: BudgetPolicy,
    pub timeout: TimeoutConfig,
    pub pipeline: PipelineConfig,
}

impl SessionConfig {
    /// Load defaults, then `path` (if given), then environment overrides,
    /// and validate the result.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: SessionConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document without consulting the environment.
    pub fn from_toml(source: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig = config::Config::builder()
            .add_source(config::File::from_str(source, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rate_limit.max_requests_per_minute == 0 {
            return Err(ConfigError::invalid(
                "rate_limit.max_requests_per_minute",
                "must be greater than zero",
            ));
        }
        if self.rate_limit.max_concurrent_requests == 0 {
            return Err(ConfigError::invalid(
                "rate_limit.max_concurrent_requests",
                "must be greater than zero",
            ));
        }
        if self.rate_limit.burst == Some(0) {
            return Err(ConfigError::invalid("rate_limit.burst", "must be greater than zero"));
        }
        if self.retry.max_retries == 0 {
            return Err(ConfigError::invalid("retry.max_retries", "must allow at least one attempt"));
        }
        if self.retry.exponential_base.is_nan() || self.retry.exponential_base < 1.0 {
            return Err(ConfigError::invalid("retry.exponential_base", "must be at least 1.0"));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::invalid(
                "retry.base_delay_ms",
                "must not exceed retry.max_delay_ms",
            ));
        }
        if self.budget.limit.is_nan() || self.budget.limit < 0.0 {
            return Err(ConfigError::invalid("budget.limit", "must not be negative"));
        }
        for (field, value) in [
            ("budget.warning_threshold", self.budget.warning_threshold),
            ("budget.critical_threshold", self.budget.critical_threshold),
        ] {
            if value.is_nan() || value <= 0.0 || value > 1.0 {
                return Err(ConfigError::invalid(field, "must be in (0, 1]"));
            }
        }
        if self.budget.warning_threshold > self.budget.critical_threshold {
            return Err(ConfigError::invalid(
                "budget.warning_threshold",
                "must not exceed budget.critical_threshold",
            ));
        }
        if self.timeout.request_timeout_ms == 0 {
            return Err(ConfigError::invalid("timeout.request_timeout_ms", "must be greater than zero"));
        }
        if self.pipeline.max_scenes == 0 {
            return Err(ConfigError::invalid("pipeline.max_scenes", "must be greater than zero"));
        }
        Ok(())
    }
}
