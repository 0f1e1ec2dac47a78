//! Engine configuration, read from the environment.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use orderdesk_orders::numbering::DEFAULT_ORDER_NUMBER_WIDTH;

use crate::rate_limit::RateLimitPolicy;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Postgres connection string; `None` means the in-memory store.
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub order_number_width: usize,
    /// Order creation and preview, per tenant and actor.
    pub create_rate_limit: RateLimitPolicy,
    /// Note creation, per tenant, actor and order.
    pub note_rate_limit: RateLimitPolicy,
    /// Give stock back when an order is marked returned.
    pub restock_on_return: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            db_max_connections: 10,
            order_number_width: DEFAULT_ORDER_NUMBER_WIDTH,
            create_rate_limit: RateLimitPolicy::new(
                30,
                Duration::from_secs(60),
                Duration::from_millis(1000),
            ),
            note_rate_limit: RateLimitPolicy::new(
                60,
                Duration::from_secs(300),
                Duration::from_millis(1000),
            ),
            restock_on_return: false,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let database_url = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty());
        if database_url.is_none() {
            warn!("DATABASE_URL not set, falling back to in-memory storage");
        }

        let order_number_width: usize = read(
            &lookup,
            "ORDERDESK_ORDER_NUMBER_WIDTH",
            defaults.order_number_width,
        )?;
        if order_number_width < 4 {
            return Err(ConfigError::Invalid {
                key: "ORDERDESK_ORDER_NUMBER_WIDTH",
                value: order_number_width.to_string(),
                reason: "must be at least 4".to_string(),
            });
        }

        Ok(Self {
            database_url,
            db_max_connections: read(
                &lookup,
                "ORDERDESK_DB_MAX_CONNECTIONS",
                defaults.db_max_connections,
            )?,
            order_number_width,
            create_rate_limit: read_policy(
                &lookup,
                [
                    "ORDERDESK_CREATE_RATE_MAX",
                    "ORDERDESK_CREATE_RATE_WINDOW_SECS",
                    "ORDERDESK_CREATE_RATE_MIN_INTERVAL_MS",
                ],
                defaults.create_rate_limit,
            )?,
            note_rate_limit: read_policy(
                &lookup,
                [
                    "ORDERDESK_NOTE_RATE_MAX",
                    "ORDERDESK_NOTE_RATE_WINDOW_SECS",
                    "ORDERDESK_NOTE_RATE_MIN_INTERVAL_MS",
                ],
                defaults.note_rate_limit,
            )?,
            restock_on_return: read(
                &lookup,
                "ORDERDESK_RESTOCK_ON_RETURN",
                defaults.restock_on_return,
            )?,
        })
    }
}

fn read<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + core::fmt::Debug,
    T::Err: core::fmt::Display,
{
    match lookup(key) {
        None => {
            debug!(key, ?default, "using default");
            Ok(default)
        }
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw,
            reason: e.to_string(),
        }),
    }
}

fn read_policy<F>(
    lookup: &F,
    [max_key, window_key, interval_key]: [&'static str; 3],
    default: RateLimitPolicy,
) -> Result<RateLimitPolicy, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let max: u32 = read(lookup, max_key, default.max)?;
    let window_secs: u64 = read(lookup, window_key, default.window.as_secs())?;
    let interval_ms: u64 = read(
        lookup,
        interval_key,
        u64::try_from(default.min_interval.as_millis()).unwrap_or(u64::MAX),
    )?;
    if max == 0 || window_secs == 0 {
        return Err(ConfigError::Invalid {
            key: if max == 0 { max_key } else { window_key },
            value: "0".to_string(),
            reason: "must be positive".to_string(),
        });
    }
    Ok(RateLimitPolicy::new(
        max,
        Duration::from_secs(window_secs),
        Duration::from_millis(interval_ms),
    ))
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
    fn unset_keys_keep_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.create_rate_limit.max, 30);
        assert_eq!(config.note_rate_limit.window, Duration::from_secs(300));
        assert!(!config.restock_on_return);
    }

    #[test]
    fn values_are_read_from_the_environment() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/orderdesk"),
            ("ORDERDESK_ORDER_NUMBER_WIDTH", "8"),
            ("ORDERDESK_CREATE_RATE_MAX", "5"),
            ("ORDERDESK_CREATE_RATE_MIN_INTERVAL_MS", "0"),
            ("ORDERDESK_RESTOCK_ON_RETURN", "true"),
        ]))
        .unwrap();

        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/orderdesk"));
        assert_eq!(config.order_number_width, 8);
        assert_eq!(config.create_rate_limit.max, 5);
        assert_eq!(config.create_rate_limit.min_interval, Duration::ZERO);
        assert!(config.restock_on_return);
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = EngineConfig::from_lookup(lookup(&[("ORDERDESK_NOTE_RATE_MAX", "lots")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "ORDERDESK_NOTE_RATE_MAX", .. }));

        let err = EngineConfig::from_lookup(lookup(&[("ORDERDESK_ORDER_NUMBER_WIDTH", "2")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "ORDERDESK_ORDER_NUMBER_WIDTH", .. }));
    }
}
