//! Filler configuration using Figment
//!
//! Configuration is layered, highest precedence last:
//! 1. Built-in defaults
//! 2. A TOML file (optional)
//! 3. Environment variables prefixed with `EVENT_MODEL_`
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! EVENT_MODEL_RETRY__MAX_ATTEMPTS=5
//! EVENT_MODEL_RETRY__INITIAL_BACKOFF=10ms
//! EVENT_MODEL_HANDLER_CACHE_CAPACITY=8
//! EVENT_MODEL_FAIL_FAST=false
//! ```
//!
//! A matching TOML file:
//!
//! ```toml
//! coerce = "force_array"
//! fill_or_fail = true
//! handler_cache_capacity = 8
//!
//! [retry]
//! max_attempts = 5
//! initial_backoff = "10ms"
//! max_backoff = "1s"
//! max_elapsed = "30s"
//!
//! [root_map]
//! "/old/mount" = "/new/mount"
//! ```

use crate::cache::HandlerPool;
use crate::handler::CoercionRegistry;
use crate::retry::RetryPolicy;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "EVENT_MODEL_";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Retry budget for handler construction and invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Growth factor between delays
    pub multiplier: f64,
    /// Upper bound on any single delay
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Overall time budget, unlimited when absent
    #[serde(with = "humantime_serde")]
    pub max_elapsed: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            initial_backoff: policy.initial_backoff,
            multiplier: policy.multiplier,
            max_backoff: policy.max_backoff,
            max_elapsed: policy.max_elapsed,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        RetryPolicy {
            max_attempts: config.max_attempts,
            initial_backoff: config.initial_backoff,
            multiplier: config.multiplier,
            max_backoff: config.max_backoff,
            max_elapsed: config.max_elapsed,
        }
    }
}

/// Settings for fillers, including the ones a run router creates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FillerConfig {
    /// Retry budget for handlers
    pub retry: RetryConfig,
    /// Bound on cached handler instances; unbounded when absent
    pub handler_cache_capacity: Option<usize>,
    /// Name of the coercion applied to resolved payloads
    pub coerce: String,
    /// Fail on the first unresolvable field instead of leaving it pending
    pub fail_fast: bool,
    /// Run router: fail on a spec with no handler instead of passing the document through
    pub fill_or_fail: bool,
    /// Replacement roots for Resources whose data has moved
    pub root_map: HashMap<String, String>,
}

impl Default for FillerConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            handler_cache_capacity: None,
            coerce: default_coerce(),
            fail_fast: true,
            fill_or_fail: false,
            root_map: HashMap::new(),
        }
    }
}

fn default_coerce() -> String {
    CoercionRegistry::AS_IS.to_string()
}

impl FillerConfig {
    /// Load defaults, then `path` if given, then environment overrides.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file cannot be parsed or validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        Self::from_figment(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Extract and validate from a caller-assembled figment.
    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract().map_err(ConfigError::LoadError)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - At least one attempt is allowed
    /// - The backoff multiplier does not shrink delays
    /// - The initial backoff does not exceed the maximum
    /// - A handler cache capacity, if given, is at least 1
    /// - The coercion name is not empty
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }

        if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            return Err(ConfigError::ValidationError(format!(
                "Invalid retry.multiplier {}. Must be >= 1.0",
                self.retry.multiplier
            )));
        }

        if self.retry.initial_backoff > self.retry.max_backoff {
            return Err(ConfigError::ValidationError(format!(
                "retry.initial_backoff ({:?}) exceeds retry.max_backoff ({:?})",
                self.retry.initial_backoff, self.retry.max_backoff
            )));
        }

        if self.handler_cache_capacity == Some(0) {
            return Err(ConfigError::ValidationError(
                "handler_cache_capacity must be at least 1".to_string(),
            ));
        }

        if self.coerce.is_empty() {
            return Err(ConfigError::ValidationError(
                "coerce cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// The retry settings as a [`RetryPolicy`].
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.retry)
    }

    /// A fresh handler pool sized by `handler_cache_capacity`.
    pub fn handler_pool(&self) -> HandlerPool {
        match self.handler_cache_capacity.and_then(NonZeroUsize::new) {
            Some(capacity) => HandlerPool::bounded(capacity),
            None => HandlerPool::unbounded(),
        }
    }
}
