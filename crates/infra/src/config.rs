//! Worker configuration from environment variables.

use std::collections::HashMap;
use std::time::Duration;

use tracing::warn;

use herald_core::Destination;

use crate::dedupe::DEFAULT_LEASE_TTL;
use crate::dispatch::DispatchConfig;
use crate::rate_limit::{MAX_WINDOW, RateLimitConfig};

/// Prefix of the per-destination rate variables, e.g. `POSTER_RATE_LINKEDIN=1`.
pub const RATE_PREFIX: &str = "POSTER_RATE_";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub database_url: String,
    /// Enables the Redis dedupe guard when set.
    pub redis_url: Option<String>,
    pub claim_window: Duration,
    pub batch_limit: usize,
    pub rate_limits: RateLimitConfig,
    pub claim_timeout: Duration,
    pub publish_timeout: Duration,
    pub dedupe_ttl: Duration,
    /// Repeat the run on this interval instead of exiting after one.
    pub run_interval: Option<Duration>,
    pub dry_run_destinations: Vec<Destination>,
    pub apply_schema: bool,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let get = |key: &str| {
            vars.get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
        };

        let database_url = get("DATABASE_URL")
            .ok_or(ConfigError::Missing("DATABASE_URL"))?
            .to_string();

        let batch_limit = match get("HERALD_BATCH_LIMIT") {
            Some(raw) => {
                let n: i64 = parse("HERALD_BATCH_LIMIT", raw)?;
                usize::try_from(n).ok().filter(|n| *n > 0).unwrap_or(50)
            }
            None => 50,
        };

        let rate_window = match get("HERALD_RATE_WINDOW_MS") {
            Some(raw) => {
                let window = Duration::from_millis(parse("HERALD_RATE_WINDOW_MS", raw)?);
                if window.is_zero() || window > MAX_WINDOW {
                    return Err(invalid("HERALD_RATE_WINDOW_MS", raw));
                }
                window
            }
            None => Duration::from_secs(1),
        };

        Ok(Self {
            database_url,
            redis_url: get("REDIS_URL").map(str::to_string),
            claim_window: positive_secs(get("HERALD_CLAIM_WINDOW_SECS"), "HERALD_CLAIM_WINDOW_SECS", 15 * 60)?,
            batch_limit,
            rate_limits: rate_limits(&vars, rate_window),
            claim_timeout: positive_secs(get("HERALD_CLAIM_TIMEOUT_SECS"), "HERALD_CLAIM_TIMEOUT_SECS", 30)?,
            publish_timeout: positive_secs(
                get("HERALD_PUBLISH_TIMEOUT_SECS"),
                "HERALD_PUBLISH_TIMEOUT_SECS",
                30,
            )?,
            dedupe_ttl: secs(
                get("HERALD_DEDUPE_TTL_SECS"),
                "HERALD_DEDUPE_TTL_SECS",
                DEFAULT_LEASE_TTL.as_secs(),
            )?,
            run_interval: get("HERALD_RUN_INTERVAL_SECS")
                .map(|raw| positive_secs(Some(raw), "HERALD_RUN_INTERVAL_SECS", 0))
                .transpose()?,
            dry_run_destinations: get("HERALD_DRY_RUN_DESTINATIONS")
                .map(|raw| {
                    raw.split(',')
                        .filter_map(|d| d.parse::<Destination>().ok())
                        .collect()
                })
                .unwrap_or_default(),
            apply_schema: match get("HERALD_APPLY_SCHEMA") {
                Some(raw) => flag("HERALD_APPLY_SCHEMA", raw)?,
                None => false,
            },
        })
    }

    pub fn dispatch(&self) -> DispatchConfig {
        DispatchConfig {
            window: self.claim_window,
            batch_limit: self.batch_limit,
            claim_timeout: self.claim_timeout,
            publish_timeout: self.publish_timeout,
        }
    }
}

fn invalid(key: &str, raw: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: raw.to_string(),
    }
}

fn parse<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.parse().map_err(|_| invalid(key, raw))
}

fn secs(raw: Option<&str>, key: &str, default: u64) -> Result<Duration, ConfigError> {
    let secs = match raw {
        Some(raw) => parse(key, raw)?,
        None => default,
    };
    Ok(Duration::from_secs(secs))
}

/// Like [`secs`], but an explicit zero is an error.
fn positive_secs(raw: Option<&str>, key: &str, default: u64) -> Result<Duration, ConfigError> {
    let duration = secs(raw, key, default)?;
    match raw {
        Some(raw) if duration.is_zero() => Err(invalid(key, raw)),
        _ => Ok(duration),
    }
}

fn flag(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, raw)),
    }
}

/// Defaults overlaid with every valid `POSTER_RATE_*` entry. Bad values keep
/// the default and log a warning.
fn rate_limits(vars: &HashMap<String, String>, window: Duration) -> RateLimitConfig {
    let mut config = RateLimitConfig::default().with_window(window);
    for (key, raw) in vars {
        let Some(name) = key.strip_prefix(RATE_PREFIX) else {
            continue;
        };
        let capacity = match raw.trim().parse::<i64>() {
            Ok(n) if n > 0 => u32::try_from(n).unwrap_or(u32::MAX),
            _ => {
                warn!(key = %key, value = %raw, "ignoring invalid rate limit");
                continue;
            }
        };
        if name.eq_ignore_ascii_case("default") {
            config.default_capacity = capacity;
        } else if !name.is_empty() {
            config = config.with_capacity(name, capacity);
        }
    }
    config
}
