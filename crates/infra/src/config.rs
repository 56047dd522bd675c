//! Engine configuration.
//!
//! Every knob has a default. Environment values that are missing fall back
//! silently; values that are present but unparsable fall back with a warning.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use stockledger_core::BusinessCalendar;

pub const ENV_BUSINESS_UTC_OFFSET: &str = "STOCKLEDGER_BUSINESS_UTC_OFFSET";
pub const ENV_CONNECTOR_TIMEOUT_MS: &str = "STOCKLEDGER_CONNECTOR_TIMEOUT_MS";
pub const ENV_MAX_CONFLICT_RETRIES: &str = "STOCKLEDGER_MAX_CONFLICT_RETRIES";
pub const ENV_CONSISTENCY_INTERVAL_SECS: &str = "STOCKLEDGER_CONSISTENCY_INTERVAL_SECS";
pub const ENV_DEFAULT_PAGE_SIZE: &str = "STOCKLEDGER_DEFAULT_PAGE_SIZE";
pub const ENV_MAX_PAGE_SIZE: &str = "STOCKLEDGER_MAX_PAGE_SIZE";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key}: cannot parse {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("{key} must be greater than zero")]
    Zero { key: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Offset used to classify instants into business dates.
    pub business_offset: BusinessCalendar,
    /// Upper bound on one external connector call.
    pub connector_timeout: Duration,
    /// Reload-and-retry attempts after a stale stream version.
    pub max_conflict_retries: u32,
    pub consistency_check_interval: Duration,
    pub default_page_size: usize,
    pub max_page_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            business_offset: BusinessCalendar::utc(),
            connector_timeout: Duration::from_millis(10_000),
            max_conflict_retries: 3,
            consistency_check_interval: Duration::from_secs(300),
            default_page_size: 50,
            max_page_size: 1000,
        }
    }
}

impl EngineConfig {
    /// Load from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through an arbitrary key lookup, falling back per key.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let mut config = Self {
            business_offset: or_default(
                ENV_BUSINESS_UTC_OFFSET,
                parse_offset(ENV_BUSINESS_UTC_OFFSET, lookup(ENV_BUSINESS_UTC_OFFSET)),
                defaults.business_offset,
            ),
            connector_timeout: or_default(
                ENV_CONNECTOR_TIMEOUT_MS,
                parse_positive::<u64>(ENV_CONNECTOR_TIMEOUT_MS, lookup(ENV_CONNECTOR_TIMEOUT_MS))
                    .map(|v| v.map(Duration::from_millis)),
                defaults.connector_timeout,
            ),
            max_conflict_retries: or_default(
                ENV_MAX_CONFLICT_RETRIES,
                parse_value(ENV_MAX_CONFLICT_RETRIES, lookup(ENV_MAX_CONFLICT_RETRIES)),
                defaults.max_conflict_retries,
            ),
            consistency_check_interval: or_default(
                ENV_CONSISTENCY_INTERVAL_SECS,
                parse_positive::<u64>(ENV_CONSISTENCY_INTERVAL_SECS, lookup(ENV_CONSISTENCY_INTERVAL_SECS))
                    .map(|v| v.map(Duration::from_secs)),
                defaults.consistency_check_interval,
            ),
            default_page_size: or_default(
                ENV_DEFAULT_PAGE_SIZE,
                parse_positive(ENV_DEFAULT_PAGE_SIZE, lookup(ENV_DEFAULT_PAGE_SIZE)),
                defaults.default_page_size,
            ),
            max_page_size: or_default(
                ENV_MAX_PAGE_SIZE,
                parse_positive(ENV_MAX_PAGE_SIZE, lookup(ENV_MAX_PAGE_SIZE)),
                defaults.max_page_size,
            ),
        };

        if config.default_page_size > config.max_page_size {
            tracing::warn!(
                default_page_size = config.default_page_size,
                max_page_size = config.max_page_size,
                "default page size exceeds maximum; clamping"
            );
            config.default_page_size = config.max_page_size;
        }
        config
    }

    pub fn with_business_offset(mut self, calendar: BusinessCalendar) -> Self {
        self.business_offset = calendar;
        self
    }

    pub fn with_connector_timeout(mut self, timeout: Duration) -> Self {
        self.connector_timeout = timeout;
        self
    }

    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }
}

fn or_default<T>(key: &'static str, parsed: Result<Option<T>, ConfigError>, default: T) -> T {
    match parsed {
        Ok(Some(value)) => value,
        Ok(None) => default,
        Err(e) => {
            tracing::warn!(key, error = %e, "invalid configuration value; using default");
            default
        }
    }
}

fn parse_value<T>(key: &'static str, raw: Option<String>) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = raw else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|e| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        })
}

fn parse_positive<T>(key: &'static str, raw: Option<String>) -> Result<Option<T>, ConfigError>
where
    T: FromStr + Default + PartialEq,
    T::Err: std::fmt::Display,
{
    match parse_value::<T>(key, raw)? {
        Some(v) if v == T::default() => Err(ConfigError::Zero { key }),
        other => Ok(other),
    }
}

fn parse_offset(key: &'static str, raw: Option<String>) -> Result<Option<BusinessCalendar>, ConfigError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    BusinessCalendar::parse(raw.trim())
        .map(Some)
        .map_err(|e| ConfigError::Invalid {
            key,
            value: raw,
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        assert_eq!(EngineConfig::from_lookup(|_| None), EngineConfig::default());
    }

    #[test]
    fn values_are_read() {
        let config = EngineConfig::from_lookup(lookup(&[
            (ENV_BUSINESS_UTC_OFFSET, "+05:30"),
            (ENV_CONNECTOR_TIMEOUT_MS, "250"),
            (ENV_MAX_CONFLICT_RETRIES, "0"),
            (ENV_CONSISTENCY_INTERVAL_SECS, "60"),
            (ENV_DEFAULT_PAGE_SIZE, "20"),
            (ENV_MAX_PAGE_SIZE, "200"),
        ]));

        assert_eq!(config.business_offset.offset().local_minus_utc(), 19_800);
        assert_eq!(config.connector_timeout, Duration::from_millis(250));
        assert_eq!(config.max_conflict_retries, 0);
        assert_eq!(config.consistency_check_interval, Duration::from_secs(60));
        assert_eq!(config.default_page_size, 20);
        assert_eq!(config.max_page_size, 200);
    }

    #[test]
    fn invalid_values_fall_back_per_key() {
        let config = EngineConfig::from_lookup(lookup(&[
            (ENV_BUSINESS_UTC_OFFSET, "India"),
            (ENV_CONNECTOR_TIMEOUT_MS, "0"),
            (ENV_MAX_CONFLICT_RETRIES, "-1"),
            (ENV_DEFAULT_PAGE_SIZE, "25"),
        ]));

        let defaults = EngineConfig::default();
        assert_eq!(config.business_offset, defaults.business_offset);
        assert_eq!(config.connector_timeout, defaults.connector_timeout);
        assert_eq!(config.max_conflict_retries, defaults.max_conflict_retries);
        assert_eq!(config.default_page_size, 25);
    }

    #[test]
    fn default_page_size_is_clamped_to_max() {
        let config = EngineConfig::from_lookup(lookup(&[
            (ENV_DEFAULT_PAGE_SIZE, "500"),
            (ENV_MAX_PAGE_SIZE, "100"),
        ]));
        assert_eq!(config.default_page_size, 100);
    }

    #[test]
    fn strict_parsers_report_errors() {
        assert_eq!(
            parse_positive::<usize>(ENV_MAX_PAGE_SIZE, Some("0".to_string())),
            Err(ConfigError::Zero {
                key: ENV_MAX_PAGE_SIZE
            })
        );
        assert!(matches!(
            parse_value::<u32>(ENV_MAX_CONFLICT_RETRIES, Some("lots".to_string())),
            Err(ConfigError::Invalid { .. })
        ));
        assert_eq!(parse_value::<u32>(ENV_MAX_CONFLICT_RETRIES, None), Ok(None));
    }
}
