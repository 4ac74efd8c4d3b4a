//! Core configuration
//!
//! Defaults carry the documented values; YAML files override defaults and
//! `REWEAVE_*` environment variables override both. Invalid values surface
//! at load time, never at use.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::validator::DEFAULT_MAX_AGENT_ADDS;

/// Configuration load failure
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid value for {var}: {detail}")]
    Env { var: String, detail: String },
}

/// Per-minute admission limits (three independent gates)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Service-wide requests per minute
    pub global_per_minute: u64,
    /// Per-user requests per minute
    pub user_per_minute: u64,
    /// Tier: workflows with no agent nodes
    pub simple_per_minute: u64,
    /// Tier: workflows with 1-2 agent nodes
    pub standard_per_minute: u64,
    /// Tier: workflows with 3+ agent nodes
    pub heavy_per_minute: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            global_per_minute: 1000,
            user_per_minute: 200,
            simple_per_minute: 100,
            standard_per_minute: 20,
            heavy_per_minute: 5,
        }
    }
}

/// Bounded backoff for transient hot-store failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 3,
            base_backoff_ms: 50,
        }
    }
}

/// Top-level core configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub rate: RateLimitConfig,
    pub retry: RetryConfig,
    pub limits: PolicyConfig,
}

/// Policy knobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Layer B cap on agent nodes added per patch
    pub max_agent_adds_per_patch: usize,
    /// TTL on `run:status:{run_id}` in seconds
    pub status_ttl_secs: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        PolicyConfig {
            max_agent_adds_per_patch: DEFAULT_MAX_AGENT_ADDS,
            status_ttl_secs: 24 * 60 * 60,
        }
    }
}

impl CoreConfig {
    /// Parse a YAML override document on top of defaults
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Apply `REWEAVE_*` environment overrides on top of `self`
    pub fn apply_env(mut self) -> Result<Self, ConfigError> {
        fn parse<T: std::str::FromStr>(var: &str) -> Result<Option<T>, ConfigError>
        where
            T::Err: std::fmt::Display,
        {
            match std::env::var(var) {
                Ok(raw) => raw.parse::<T>().map(Some).map_err(|e| ConfigError::Env {
                    var: var.to_string(),
                    detail: e.to_string(),
                }),
                Err(_) => Ok(None),
            }
        }

        if let Some(v) = parse("REWEAVE_GLOBAL_PER_MINUTE")? {
            self.rate.global_per_minute = v;
        }
        if let Some(v) = parse("REWEAVE_USER_PER_MINUTE")? {
            self.rate.user_per_minute = v;
        }
        if let Some(v) = parse("REWEAVE_MAX_AGENT_ADDS")? {
            self.limits.max_agent_adds_per_patch = v;
        }
        if let Some(v) = parse("REWEAVE_STATUS_TTL_SECS")? {
            self.limits.status_ttl_secs = v;
        }
        if let Some(v) = parse("REWEAVE_RETRY_MAX_ATTEMPTS")? {
            self.retry.max_attempts = v;
        }
        Ok(self)
    }

    /// Defaults, then YAML (when provided), then environment
    pub fn load(yaml: Option<&str>) -> Result<Self, ConfigError> {
        let base = match yaml {
            Some(doc) => Self::from_yaml_str(doc)?,
            None => Self::default(),
        };
        base.apply_env()
    }
}
