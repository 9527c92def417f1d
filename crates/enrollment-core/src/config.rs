//! Enrollment configuration.
//!
//! Options are fixed for the lifetime of a DIF membership. They can be read
//! from JSON (camelCase keys) or from a DIF policy-parameter map, which also
//! accepts the older `...InMs` key names.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("declaredDeadIntervalMs ({dead}) must be longer than watchdogPeriodMs ({period})")]
    DeadIntervalTooShort { dead: u64, period: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentConfig {
    /// Failure timer armed in every wait state
    #[serde(default = "default_enroll_timeout")]
    pub enroll_timeout_ms: u64,

    /// How often the watchdog probes enrolled neighbors
    #[serde(default = "default_watchdog_period")]
    pub watchdog_period_ms: u64,

    /// Silence after which an enrolled neighbor is declared dead
    #[serde(default = "default_declared_dead_interval")]
    pub declared_dead_interval_ms: u64,

    /// Period of the background enroller loop (0 disables it)
    #[serde(default = "default_neighbors_enroller_period")]
    pub neighbors_enroller_period_ms: u64,

    /// Enrollment attempts per neighbor before it is removed
    #[serde(default = "default_max_enrollment_retries")]
    pub max_enrollment_retries: u32,

    /// Enroller side: let the joining member start before an explicit start
    #[serde(default = "default_true")]
    pub grant_early_start: bool,

    /// Enrollee side: abort if the enroller withholds early start
    #[serde(default = "default_true")]
    pub abort_without_early_start: bool,
}

fn default_enroll_timeout() -> u64 {
    10_000
}

fn default_watchdog_period() -> u64 {
    30_000
}

fn default_declared_dead_interval() -> u64 {
    120_000
}

fn default_neighbors_enroller_period() -> u64 {
    10_000
}

fn default_max_enrollment_retries() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

impl Default for EnrollmentConfig {
    fn default() -> Self {
        Self {
            enroll_timeout_ms: default_enroll_timeout(),
            watchdog_period_ms: default_watchdog_period(),
            declared_dead_interval_ms: default_declared_dead_interval(),
            neighbors_enroller_period_ms: default_neighbors_enroller_period(),
            max_enrollment_retries: default_max_enrollment_retries(),
            grant_early_start: true,
            abort_without_early_start: true,
        }
    }
}

impl EnrollmentConfig {
    pub fn enroll_timeout(&self) -> Duration {
        Duration::from_millis(self.enroll_timeout_ms)
    }

    pub fn watchdog_period(&self) -> Duration {
        Duration::from_millis(self.watchdog_period_ms)
    }

    /// None when the background enroller is disabled.
    pub fn neighbors_enroller_period(&self) -> Option<Duration> {
        (self.neighbors_enroller_period_ms > 0)
            .then(|| Duration::from_millis(self.neighbors_enroller_period_ms))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enroll_timeout_ms == 0 {
            return Err(ConfigError::Zero("enrollTimeoutMs"));
        }
        if self.watchdog_period_ms == 0 {
            return Err(ConfigError::Zero("watchdogPeriodMs"));
        }
        if self.declared_dead_interval_ms <= self.watchdog_period_ms {
            return Err(ConfigError::DeadIntervalTooShort {
                dead: self.declared_dead_interval_ms,
                period: self.watchdog_period_ms,
            });
        }
        Ok(())
    }

    /// Build from DIF policy parameters. Missing keys keep their defaults.
    pub fn from_params(params: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for (key, value) in params {
            match key.as_str() {
                "enrollTimeoutMs" | "enrollTimeoutInMs" => {
                    config.enroll_timeout_ms = parse(key, value)?;
                }
                "watchdogPeriodMs" | "watchdogPeriodInMs" => {
                    config.watchdog_period_ms = parse(key, value)?;
                }
                "declaredDeadIntervalMs" | "declaredDeadIntervalInMs" => {
                    config.declared_dead_interval_ms = parse(key, value)?;
                }
                "neighborsEnrollerPeriodMs" | "neighborsEnrollerPeriodInMs" => {
                    config.neighbors_enroller_period_ms = parse(key, value)?;
                }
                "maxEnrollmentRetries" => {
                    config.max_enrollment_retries = parse(key, value)?;
                }
                "grantEarlyStart" => {
                    config.grant_early_start = parse(key, value)?;
                }
                "abortWithoutEarlyStart" => {
                    config.abort_without_early_start = parse(key, value)?;
                }
                other => {
                    tracing::debug!("Ignoring unknown enrollment parameter {}", other);
                }
            }
        }

        Ok(config)
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
