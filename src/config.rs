use crate::domain::Decimal;
use crate::settlement::{MonitorConfig, RetryConfig, SchedulerConfig, ValidationConfig};
use chrono_tz::Tz;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    /// Settlement zone for users the store does not know.
    pub default_timezone: Tz,
    pub scheduler_check_interval_secs: u64,
    pub scheduler_max_concurrent: usize,
    pub settlement_timeout_secs: u64,
    pub monitor_check_interval_secs: u64,
    pub monitor_alert_threshold_secs: u64,
    pub monitor_enabled: bool,
    pub retry_max_retries: u32,
    pub retry_backoff_secs: Vec<u64>,
    pub validation_pnl_min: Decimal,
    pub validation_pnl_max: Decimal,
    pub validation_max_trade_count: i64,
    pub validation_unrealized_diff: Decimal,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_map(std::env::vars().collect())
    }

    pub fn from_env_map(env_map: HashMap<String, String>) -> Result<Self, ConfigError> {
        let database_path = env_map
            .get("DATABASE_PATH")
            .cloned()
            .ok_or_else(|| ConfigError::MissingEnv("DATABASE_PATH".to_string()))?;

        let tz_name = env_map
            .get("DEFAULT_TIMEZONE")
            .map(|s| s.as_str())
            .unwrap_or("Asia/Kolkata");
        let default_timezone = tz_name.parse::<Tz>().map_err(|_| {
            ConfigError::InvalidValue(
                "DEFAULT_TIMEZONE".to_string(),
                format!("unknown timezone {}", tz_name),
            )
        })?;

        let monitor_enabled = match env_map
            .get("MONITOR_ENABLED")
            .map(|s| s.to_lowercase())
            .as_deref()
            .unwrap_or("true")
        {
            "true" | "1" | "yes" => true,
            "false" | "0" | "no" => false,
            other => {
                return Err(ConfigError::InvalidValue(
                    "MONITOR_ENABLED".to_string(),
                    format!("must be true or false, got {}", other),
                ))
            }
        };

        let retry_backoff_secs = parse_backoff(
            env_map
                .get("RETRY_BACKOFF_SECS")
                .map(|s| s.as_str())
                .unwrap_or("5,15,45"),
        )?;

        let scheduler_max_concurrent: usize =
            parse_or(&env_map, "SCHEDULER_MAX_CONCURRENT", 5, "must be a valid usize")?;
        if scheduler_max_concurrent == 0 {
            return Err(ConfigError::InvalidValue(
                "SCHEDULER_MAX_CONCURRENT".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        Ok(Config {
            database_path,
            default_timezone,
            scheduler_check_interval_secs: parse_or(
                &env_map,
                "SCHEDULER_CHECK_INTERVAL_SECS",
                60,
                "must be a valid u64",
            )?,
            scheduler_max_concurrent,
            settlement_timeout_secs: parse_or(
                &env_map,
                "SETTLEMENT_TIMEOUT_SECS",
                300,
                "must be a valid u64",
            )?,
            monitor_check_interval_secs: parse_or(
                &env_map,
                "MONITOR_CHECK_INTERVAL_SECS",
                900,
                "must be a valid u64",
            )?,
            monitor_alert_threshold_secs: parse_or(
                &env_map,
                "MONITOR_ALERT_THRESHOLD_SECS",
                3600,
                "must be a valid u64",
            )?,
            monitor_enabled,
            retry_max_retries: parse_or(&env_map, "RETRY_MAX_RETRIES", 3, "must be a valid u32")?,
            retry_backoff_secs,
            validation_pnl_min: parse_or(
                &env_map,
                "VALIDATION_PNL_MIN",
                Decimal::from_i64(-10_000),
                "must be a decimal",
            )?,
            validation_pnl_max: parse_or(
                &env_map,
                "VALIDATION_PNL_MAX",
                Decimal::from_i64(10_000),
                "must be a decimal",
            )?,
            validation_max_trade_count: parse_or(
                &env_map,
                "VALIDATION_MAX_TRADE_COUNT",
                500,
                "must be a valid i64",
            )?,
            validation_unrealized_diff: parse_or(
                &env_map,
                "VALIDATION_UNREALIZED_DIFF",
                Decimal::from_i64(100),
                "must be a decimal",
            )?,
        })
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            check_interval: Duration::from_secs(self.scheduler_check_interval_secs),
            max_concurrent: self.scheduler_max_concurrent,
            settlement_timeout: Duration::from_secs(self.settlement_timeout_secs),
            default_timezone: self.default_timezone,
        }
    }

    pub fn monitor(&self) -> MonitorConfig {
        MonitorConfig {
            check_interval: Duration::from_secs(self.monitor_check_interval_secs),
            alert_threshold: Duration::from_secs(self.monitor_alert_threshold_secs),
            enabled: self.monitor_enabled,
        }
    }

    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.retry_max_retries,
            backoff: self
                .retry_backoff_secs
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
        }
    }

    pub fn validation(&self) -> ValidationConfig {
        ValidationConfig {
            pnl_min: self.validation_pnl_min,
            pnl_max: self.validation_pnl_max,
            max_trade_count: self.validation_max_trade_count,
            unrealized_diff: self.validation_unrealized_diff,
        }
    }
}

fn parse_or<T: FromStr>(
    env_map: &HashMap<String, String>,
    key: &str,
    default: T,
    expected: &str,
) -> Result<T, ConfigError> {
    match env_map.get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidValue(key.to_string(), expected.to_string())),
    }
}

/// Comma-separated seconds, e.g. `5,15,45`.
fn parse_backoff(raw: &str) -> Result<Vec<u64>, ConfigError> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u64>().map_err(|_| {
                ConfigError::InvalidValue(
                    "RETRY_BACKOFF_SECS".to_string(),
                    format!("must be comma-separated seconds, got {}", raw),
                )
            })
        })
        .collect()
}
