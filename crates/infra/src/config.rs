//! Process configuration read from `STOCKWISE_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use stockwise_inventory::DEFAULT_SAFETY_FACTOR;

use crate::retry::RetryPolicy;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryConfig {
    /// Threads consuming the order-events channel.
    pub worker_count: usize,
    pub replenishment_interval: Duration,
    pub estimator_timeout: Duration,
    pub reservation_timeout: Duration,
    pub safety_factor: f64,
    /// How long processed event ids are kept for deduplication.
    pub processed_event_retention: Duration,
    pub max_delivery_attempts: u32,
    /// First backoff after a retryable failure; doubles per attempt.
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// Trigger a replenishment check when a saga reservation hits a shortage.
    pub auto_replenish_on_shortage: bool,
    /// Apply compensation messages from other services. Leave off when the
    /// saga runs in this process, since it already refunds locally.
    pub consume_compensation_channel: bool,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            replenishment_interval: Duration::from_secs(3600),
            estimator_timeout: Duration::from_millis(2000),
            reservation_timeout: Duration::from_millis(5000),
            safety_factor: DEFAULT_SAFETY_FACTOR,
            processed_event_retention: Duration::from_secs(168 * 3600),
            max_delivery_attempts: 5,
            retry_base_delay: Duration::from_millis(200),
            retry_max_delay: Duration::from_secs(30),
            auto_replenish_on_shortage: false,
            consume_compensation_channel: false,
        }
    }
}

impl InventoryConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let mut cfg = defaults.clone();

        cfg.worker_count = parse(&lookup, "STOCKWISE_WORKERS", defaults.worker_count)?;
        if cfg.worker_count == 0 {
            return Err(invalid("STOCKWISE_WORKERS", "0", "must be at least 1"));
        }

        cfg.replenishment_interval = Duration::from_secs(parse(
            &lookup,
            "STOCKWISE_REPLENISH_INTERVAL_SECS",
            defaults.replenishment_interval.as_secs(),
        )?);
        if cfg.replenishment_interval.is_zero() {
            return Err(invalid("STOCKWISE_REPLENISH_INTERVAL_SECS", "0", "must be positive"));
        }

        cfg.estimator_timeout = Duration::from_millis(parse(
            &lookup,
            "STOCKWISE_ESTIMATOR_TIMEOUT_MS",
            defaults.estimator_timeout.as_millis() as u64,
        )?);
        cfg.reservation_timeout = Duration::from_millis(parse(
            &lookup,
            "STOCKWISE_RESERVATION_TIMEOUT_MS",
            defaults.reservation_timeout.as_millis() as u64,
        )?);

        cfg.safety_factor = parse(&lookup, "STOCKWISE_SAFETY_FACTOR", defaults.safety_factor)?;
        if !cfg.safety_factor.is_finite() || cfg.safety_factor < 1.0 {
            return Err(invalid(
                "STOCKWISE_SAFETY_FACTOR",
                &cfg.safety_factor.to_string(),
                "must be a finite number >= 1.0",
            ));
        }

        let retention_hours: u64 = parse(
            &lookup,
            "STOCKWISE_EVENT_RETENTION_HOURS",
            defaults.processed_event_retention.as_secs() / 3600,
        )?;
        cfg.processed_event_retention = Duration::from_secs(retention_hours * 3600);

        cfg.max_delivery_attempts = parse(
            &lookup,
            "STOCKWISE_MAX_DELIVERY_ATTEMPTS",
            defaults.max_delivery_attempts,
        )?;
        if cfg.max_delivery_attempts == 0 {
            return Err(invalid("STOCKWISE_MAX_DELIVERY_ATTEMPTS", "0", "must be at least 1"));
        }

        cfg.retry_base_delay = Duration::from_millis(parse(
            &lookup,
            "STOCKWISE_RETRY_BASE_MS",
            defaults.retry_base_delay.as_millis() as u64,
        )?);
        cfg.retry_max_delay = Duration::from_millis(parse(
            &lookup,
            "STOCKWISE_RETRY_MAX_MS",
            defaults.retry_max_delay.as_millis() as u64,
        )?);
        if cfg.retry_max_delay < cfg.retry_base_delay {
            return Err(invalid(
                "STOCKWISE_RETRY_MAX_MS",
                &cfg.retry_max_delay.as_millis().to_string(),
                "must not be below STOCKWISE_RETRY_BASE_MS",
            ));
        }

        cfg.auto_replenish_on_shortage = parse_bool(
            &lookup,
            "STOCKWISE_AUTO_REPLENISH",
            defaults.auto_replenish_on_shortage,
        )?;
        cfg.consume_compensation_channel = parse_bool(
            &lookup,
            "STOCKWISE_CONSUME_COMPENSATION",
            defaults.consume_compensation_channel,
        )?;

        Ok(cfg)
    }

    /// Backoff shared by the worker pools and the replenishment scheduler.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_delivery_attempts, self.retry_base_delay, self.retry_max_delay)
    }
}

fn invalid(key: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(key, &raw, &e.to_string())),
    }
}

fn parse_bool<F>(lookup: &F, key: &'static str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "" => Ok(default),
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(invalid(key, &raw, "expected a boolean")),
        },
    }
}
