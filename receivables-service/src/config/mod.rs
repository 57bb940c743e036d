//! Configuration module for receivables-service.

use crate::services::balance::{RecomputePolicies, RecomputePolicy};
use crate::services::ledger::LedgerSettings;
use chrono::NaiveTime;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ReceivablesConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub recurring: RecurringConfig,
    pub ledger: LedgerConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl DatabaseConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

#[derive(Debug, Clone)]
pub struct RecurringConfig {
    pub enabled: bool,
    /// Wall-clock time (UTC) of the daily run.
    pub run_at: NaiveTime,
    pub max_per_run: Option<usize>,
}

impl Default for RecurringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            run_at: NaiveTime::MIN,
            max_per_run: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub draft_update_policy: RecomputePolicy,
    pub batch_update_policy: RecomputePolicy,
    pub number_allocation_retries: u32,
}

/// Parse `HH:MM` or `HH:MM:SS`.
pub fn parse_run_at(value: &str) -> Result<NaiveTime, AppError> {
    let value = value.trim();
    NaiveTime::parse_from_str(value, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M:%S"))
        .map_err(|e| {
            AppError::ConfigError(anyhow::anyhow!(
                "RECURRING_RUN_AT '{}' is not a time of day: {}",
                value,
                e
            ))
        })
}

/// Parse one setting. A malformed value is an error, never the default.
pub fn parse_setting<T>(key: &str, value: &str) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value.trim().parse().map_err(|e| {
        AppError::ConfigError(anyhow::anyhow!("{} '{}' is invalid: {}", key, value, e))
    })
}

/// Upper bound on successors per recurring run. Must be at least one.
pub fn parse_max_per_run(value: &str) -> Result<usize, AppError> {
    match parse_setting("RECURRING_MAX_PER_RUN", value)? {
        0 => Err(AppError::ConfigError(anyhow::anyhow!(
            "RECURRING_MAX_PER_RUN must be at least 1"
        ))),
        max => Ok(max),
    }
}

/// The variable's value, or `None` when it is unset or blank.
fn env_value(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env_value(key) {
        Some(value) => parse_setting(key, &value),
        None => Ok(default),
    }
}

impl ReceivablesConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let run_at = match env_value("RECURRING_RUN_AT") {
            Some(value) => parse_run_at(&value)?,
            None => NaiveTime::MIN,
        };
        let max_per_run = env_value("RECURRING_MAX_PER_RUN")
            .map(|value| parse_max_per_run(&value))
            .transpose()?;

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "receivables-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 10)?,
                min_connections: env_parse("DATABASE_MIN_CONNECTIONS", 2)?,
                acquire_timeout_secs: env_parse("DATABASE_ACQUIRE_TIMEOUT_SECS", 30)?,
            },
            recurring: RecurringConfig {
                enabled: env_parse("RECURRING_ENABLED", true)?,
                run_at,
                max_per_run,
            },
            ledger: LedgerConfig {
                draft_update_policy: match env_value("DRAFT_UPDATE_POLICY") {
                    Some(value) => value.parse()?,
                    None => RecomputePolicy::Replace,
                },
                batch_update_policy: match env_value("BATCH_UPDATE_POLICY") {
                    Some(value) => value.parse()?,
                    None => RecomputePolicy::BatchLocal,
                },
                number_allocation_retries: env_parse("NUMBER_ALLOCATION_RETRIES", 3)?,
            },
        })
    }

    /// Ledger tunables derived from this configuration.
    pub fn ledger_settings(&self) -> Result<LedgerSettings, AppError> {
        Ok(LedgerSettings {
            policies: RecomputePolicies::new(
                self.ledger.draft_update_policy,
                self.ledger.batch_update_policy,
            )?,
            number_allocation_retries: self.ledger.number_allocation_retries,
            recurring_max_per_run: self.recurring.max_per_run,
        })
    }
}
