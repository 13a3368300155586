//! Environment-backed runtime configuration for the sync runtime.

use std::{
    env,
    error::Error,
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use backend_core::RetryPolicy;

const DEFAULT_DATA_DIR_ROOT: &str = "./.pikachat-sync-store";
const DURABLE_CACHE_FILENAME: &str = "cache.sqlite3";

const DEFAULT_IDLE_INTERVAL_MS: u64 = 30_000;
const DEFAULT_RETRY_BASE_MS: u64 = 2_000;
const DEFAULT_RETRY_MAX_MS: u64 = 60_000;
const DEFAULT_MIN_START_INTERVAL_MS: u64 = 3_000;
const DEFAULT_WATCHDOG_CEILING_MS: u64 = 60_000;
const DEFAULT_LIVE_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_LOAD_LIMIT: usize = 50;
const DEFAULT_PAGINATION_PASSES: u32 = 3;
const DEFAULT_PAGINATION_LIMIT_CAP: u16 = 100;
const DEFAULT_HISTORY_MAX_EVENTS: usize = 500;
const DEFAULT_BACKFILL_MAX_EVENTS: usize = 20;
const DEFAULT_TIMELINE_MAX_ITEMS: usize = 1_200;
const DEFAULT_MAX_TIMELINES: usize = 64;
const DEFAULT_RATE_WINDOW_MS: u64 = 5_000;
const DEFAULT_RATE_THRESHOLD: u32 = 10;
const DEFAULT_RATE_COOLDOWN_MS: u64 = 10_000;
const DEFAULT_SERVER_COOLDOWN_MS: u64 = 30_000;
const DEFAULT_MAX_SERVER_COOLDOWN_MS: u64 = 600_000;
const DEFAULT_TOKEN_GUARD_MS: u64 = 120_000;
const DEFAULT_REFRESH_COOLDOWN_MS: u64 = 5_000;
const DEFAULT_REFRESH_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_REFRESH_PAUSE_MS: u64 = 300_000;
const DEFAULT_HEARTBEAT_IDLE_MS: u64 = 240_000;
const DEFAULT_PROBE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_BULK_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_CACHE_SWEEP_EVERY: u32 = 20;

/// Sync coordinator scheduling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Delay between successful cycles.
    pub idle_interval: Duration,
    pub retry_base: Duration,
    pub retry_max: Duration,
    /// Minimum time between two loop starts.
    pub min_start_interval: Duration,
    /// A cycle running longer than this is force-reset.
    pub watchdog_ceiling: Duration,
    /// Long-poll timeout sent with live sync requests.
    pub live_timeout: Duration,
    /// Successful cycles between durable cache sweeps. Zero disables sweeping.
    pub cache_sweep_every: u32,
    pub max_timelines: usize,
}

impl CoordinatorConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_base.as_millis() as u64,
            self.retry_max.as_millis() as u64,
        )
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            idle_interval: Duration::from_millis(DEFAULT_IDLE_INTERVAL_MS),
            retry_base: Duration::from_millis(DEFAULT_RETRY_BASE_MS),
            retry_max: Duration::from_millis(DEFAULT_RETRY_MAX_MS),
            min_start_interval: Duration::from_millis(DEFAULT_MIN_START_INTERVAL_MS),
            watchdog_ceiling: Duration::from_millis(DEFAULT_WATCHDOG_CEILING_MS),
            live_timeout: Duration::from_millis(DEFAULT_LIVE_TIMEOUT_MS),
            cache_sweep_every: DEFAULT_CACHE_SWEEP_EVERY,
            max_timelines: DEFAULT_MAX_TIMELINES,
        }
    }
}

/// Message loader strategy bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderConfig {
    pub default_limit: usize,
    /// Maximum incremental pagination pages per load.
    pub pagination_passes: u32,
    pub pagination_limit_cap: u16,
    /// Upper bound on events pulled by the full history fetch.
    pub history_max_events: usize,
    /// Upper bound on related events fetched by backfill.
    pub backfill_max_events: usize,
    pub timeline_max_items: usize,
    /// Attempt one join per room when pagination is forbidden.
    pub auto_join_on_forbidden: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            default_limit: DEFAULT_LOAD_LIMIT,
            pagination_passes: DEFAULT_PAGINATION_PASSES,
            pagination_limit_cap: DEFAULT_PAGINATION_LIMIT_CAP,
            history_max_events: DEFAULT_HISTORY_MAX_EVENTS,
            backfill_max_events: DEFAULT_BACKFILL_MAX_EVENTS,
            timeline_max_items: DEFAULT_TIMELINE_MAX_ITEMS,
            auto_join_on_forbidden: false,
        }
    }
}

/// Credential, heartbeat and rate-limit governance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GovernorConfig {
    pub rate_window: Duration,
    /// Requests allowed per endpoint inside one window.
    pub rate_threshold: u32,
    pub rate_cooldown: Duration,
    /// Cooldown applied when the server throttles without a hint.
    pub server_cooldown: Duration,
    /// Ceiling for server-provided retry hints.
    pub max_server_cooldown: Duration,
    /// Refresh when the token expires within this window.
    pub token_guard: Duration,
    pub refresh_cooldown: Duration,
    pub refresh_max_attempts: u32,
    /// Pause after `refresh_max_attempts` consecutive failures.
    pub refresh_pause: Duration,
    pub heartbeat_idle: Duration,
    pub probe_timeout: Duration,
    pub bulk_timeout: Duration,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            rate_window: Duration::from_millis(DEFAULT_RATE_WINDOW_MS),
            rate_threshold: DEFAULT_RATE_THRESHOLD,
            rate_cooldown: Duration::from_millis(DEFAULT_RATE_COOLDOWN_MS),
            server_cooldown: Duration::from_millis(DEFAULT_SERVER_COOLDOWN_MS),
            max_server_cooldown: Duration::from_millis(DEFAULT_MAX_SERVER_COOLDOWN_MS),
            token_guard: Duration::from_millis(DEFAULT_TOKEN_GUARD_MS),
            refresh_cooldown: Duration::from_millis(DEFAULT_REFRESH_COOLDOWN_MS),
            refresh_max_attempts: DEFAULT_REFRESH_MAX_ATTEMPTS,
            refresh_pause: Duration::from_millis(DEFAULT_REFRESH_PAUSE_MS),
            heartbeat_idle: Duration::from_millis(DEFAULT_HEARTBEAT_IDLE_MS),
            probe_timeout: Duration::from_millis(DEFAULT_PROBE_TIMEOUT_MS),
            bulk_timeout: Duration::from_millis(DEFAULT_BULK_TIMEOUT_MS),
        }
    }
}

/// Runtime configuration for the whole sync stack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncConfig {
    /// Optional fixed data dir override for the durable cache.
    pub data_dir_override: Option<PathBuf>,
    pub coordinator: CoordinatorConfig,
    pub loader: LoaderConfig,
    pub governor: GovernorConfig,
}

impl SyncConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let data_dir_override =
            optional_trimmed_env("PIKACHAT_DATA_DIR", &mut lookup).map(PathBuf::from);

        let coordinator = CoordinatorConfig {
            idle_interval: parse_ms(
                "PIKACHAT_SYNC_IDLE_INTERVAL_MS",
                DEFAULT_IDLE_INTERVAL_MS,
                &mut lookup,
            )?,
            retry_base: parse_ms(
                "PIKACHAT_SYNC_RETRY_BASE_MS",
                DEFAULT_RETRY_BASE_MS,
                &mut lookup,
            )?,
            retry_max: parse_ms("PIKACHAT_SYNC_RETRY_MAX_MS", DEFAULT_RETRY_MAX_MS, &mut lookup)?,
            min_start_interval: parse_ms(
                "PIKACHAT_SYNC_MIN_START_INTERVAL_MS",
                DEFAULT_MIN_START_INTERVAL_MS,
                &mut lookup,
            )?,
            watchdog_ceiling: parse_ms(
                "PIKACHAT_SYNC_WATCHDOG_CEILING_MS",
                DEFAULT_WATCHDOG_CEILING_MS,
                &mut lookup,
            )?,
            live_timeout: parse_ms(
                "PIKACHAT_SYNC_LIVE_TIMEOUT_MS",
                DEFAULT_LIVE_TIMEOUT_MS,
                &mut lookup,
            )?,
            cache_sweep_every: parse_with_default(
                "PIKACHAT_CACHE_SWEEP_EVERY",
                DEFAULT_CACHE_SWEEP_EVERY,
                &mut lookup,
            )?,
            max_timelines: parse_with_default(
                "PIKACHAT_MAX_TIMELINES",
                DEFAULT_MAX_TIMELINES,
                &mut lookup,
            )?,
        };

        let loader = LoaderConfig {
            default_limit: parse_with_default(
                "PIKACHAT_LOAD_LIMIT",
                DEFAULT_LOAD_LIMIT,
                &mut lookup,
            )?,
            pagination_passes: parse_with_default(
                "PIKACHAT_PAGINATION_PASSES",
                DEFAULT_PAGINATION_PASSES,
                &mut lookup,
            )?,
            pagination_limit_cap: parse_with_default(
                "PIKACHAT_PAGINATION_LIMIT_CAP",
                DEFAULT_PAGINATION_LIMIT_CAP,
                &mut lookup,
            )?,
            history_max_events: parse_with_default(
                "PIKACHAT_HISTORY_MAX_EVENTS",
                DEFAULT_HISTORY_MAX_EVENTS,
                &mut lookup,
            )?,
            backfill_max_events: parse_with_default(
                "PIKACHAT_BACKFILL_MAX_EVENTS",
                DEFAULT_BACKFILL_MAX_EVENTS,
                &mut lookup,
            )?,
            timeline_max_items: parse_with_default(
                "PIKACHAT_TIMELINE_MAX_ITEMS",
                DEFAULT_TIMELINE_MAX_ITEMS,
                &mut lookup,
            )?,
            auto_join_on_forbidden: parse_bool(
                "PIKACHAT_AUTO_JOIN_ON_FORBIDDEN",
                false,
                &mut lookup,
            )?,
        };

        let governor = GovernorConfig {
            rate_window: parse_ms("PIKACHAT_RATE_WINDOW_MS", DEFAULT_RATE_WINDOW_MS, &mut lookup)?,
            rate_threshold: parse_with_default(
                "PIKACHAT_RATE_THRESHOLD",
                DEFAULT_RATE_THRESHOLD,
                &mut lookup,
            )?,
            rate_cooldown: parse_ms(
                "PIKACHAT_RATE_COOLDOWN_MS",
                DEFAULT_RATE_COOLDOWN_MS,
                &mut lookup,
            )?,
            server_cooldown: parse_ms(
                "PIKACHAT_SERVER_COOLDOWN_MS",
                DEFAULT_SERVER_COOLDOWN_MS,
                &mut lookup,
            )?,
            max_server_cooldown: parse_ms(
                "PIKACHAT_MAX_SERVER_COOLDOWN_MS",
                DEFAULT_MAX_SERVER_COOLDOWN_MS,
                &mut lookup,
            )?,
            token_guard: parse_ms("PIKACHAT_TOKEN_GUARD_MS", DEFAULT_TOKEN_GUARD_MS, &mut lookup)?,
            refresh_cooldown: parse_ms(
                "PIKACHAT_REFRESH_COOLDOWN_MS",
                DEFAULT_REFRESH_COOLDOWN_MS,
                &mut lookup,
            )?,
            refresh_max_attempts: parse_with_default(
                "PIKACHAT_REFRESH_MAX_ATTEMPTS",
                DEFAULT_REFRESH_MAX_ATTEMPTS,
                &mut lookup,
            )?,
            refresh_pause: parse_ms(
                "PIKACHAT_REFRESH_PAUSE_MS",
                DEFAULT_REFRESH_PAUSE_MS,
                &mut lookup,
            )?,
            heartbeat_idle: parse_ms(
                "PIKACHAT_HEARTBEAT_IDLE_MS",
                DEFAULT_HEARTBEAT_IDLE_MS,
                &mut lookup,
            )?,
            probe_timeout: parse_ms(
                "PIKACHAT_PROBE_TIMEOUT_MS",
                DEFAULT_PROBE_TIMEOUT_MS,
                &mut lookup,
            )?,
            bulk_timeout: parse_ms(
                "PIKACHAT_BULK_TIMEOUT_MS",
                DEFAULT_BULK_TIMEOUT_MS,
                &mut lookup,
            )?,
        };

        require_positive("PIKACHAT_LOAD_LIMIT", loader.default_limit as u64)?;
        require_positive("PIKACHAT_TIMELINE_MAX_ITEMS", loader.timeline_max_items as u64)?;
        require_positive("PIKACHAT_MAX_TIMELINES", coordinator.max_timelines as u64)?;
        require_positive("PIKACHAT_RATE_THRESHOLD", u64::from(governor.rate_threshold))?;
        require_positive(
            "PIKACHAT_REFRESH_MAX_ATTEMPTS",
            u64::from(governor.refresh_max_attempts),
        )?;
        if governor.max_server_cooldown < governor.server_cooldown {
            return Err(ConfigError::InvalidValue {
                key: "PIKACHAT_MAX_SERVER_COOLDOWN_MS",
                value: governor.max_server_cooldown.as_millis().to_string(),
                reason: "must not be below PIKACHAT_SERVER_COOLDOWN_MS".to_owned(),
            });
        }
        if coordinator.retry_max < coordinator.retry_base {
            return Err(ConfigError::InvalidValue {
                key: "PIKACHAT_SYNC_RETRY_MAX_MS",
                value: coordinator.retry_max.as_millis().to_string(),
                reason: "must not be below PIKACHAT_SYNC_RETRY_BASE_MS".to_owned(),
            });
        }

        Ok(Self {
            data_dir_override,
            coordinator,
            loader,
            governor,
        })
    }

    /// Resolve the durable cache file for one account.
    pub fn durable_cache_path(&self, homeserver: &str, user_id: &str) -> PathBuf {
        self.data_dir_override
            .clone()
            .unwrap_or_else(|| default_data_dir(homeserver, user_id))
            .join(DURABLE_CACHE_FILENAME)
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_with_default<T, F>(key: &'static str, default: T, lookup: &mut F) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    value.parse::<T>().map_err(|err| ConfigError::InvalidValue {
        key,
        value,
        reason: err.to_string(),
    })
}

fn parse_ms<F>(key: &'static str, default_ms: u64, lookup: &mut F) -> Result<Duration, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    parse_with_default(key, default_ms, lookup).map(Duration::from_millis)
}

fn parse_bool<F>(key: &'static str, default: bool, lookup: &mut F) -> Result<bool, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value,
            reason: "expected a boolean".to_owned(),
        }),
    }
}

fn require_positive(key: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key,
            value: "0".to_owned(),
            reason: "must be at least 1".to_owned(),
        });
    }
    Ok(())
}

fn default_data_dir(homeserver: &str, user_id: &str) -> PathBuf {
    let root = Path::new(DEFAULT_DATA_DIR_ROOT);
    root.join(format!("hs-{}", slugify_component(homeserver, 64)))
        .join(format!("user-{}", slugify_component(user_id, 64)))
}

fn slugify_component(input: &str, max_len: usize) -> String {
    let mut out = String::with_capacity(input.len().min(max_len));
    let mut last_was_sep = false;
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
        if out.len() >= max_len {
            break;
        }
    }

    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "default".to_owned()
    } else {
        trimmed.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from_pairs(pairs: &[(&str, &str)]) -> Result<SyncConfig, ConfigError> {
        let map = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect::<HashMap<_, _>>();
        SyncConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let cfg = config_from_pairs(&[]).expect("config should parse");
        assert_eq!(cfg, SyncConfig::default());
        assert_eq!(cfg.coordinator.idle_interval, Duration::from_secs(30));
        assert_eq!(cfg.governor.token_guard, Duration::from_secs(120));
        assert_eq!(cfg.loader.pagination_passes, 3);
        assert!(!cfg.loader.auto_join_on_forbidden);
    }

    #[test]
    fn parses_tuning_overrides() {
        let cfg = config_from_pairs(&[
            ("PIKACHAT_RATE_THRESHOLD", "3"),
            ("PIKACHAT_RATE_WINDOW_MS", "5000"),
            ("PIKACHAT_PAGINATION_LIMIT_CAP", " 80 "),
            ("PIKACHAT_AUTO_JOIN_ON_FORBIDDEN", "yes"),
            ("PIKACHAT_SYNC_IDLE_INTERVAL_MS", "1000"),
        ])
        .expect("config should parse");

        assert_eq!(cfg.governor.rate_threshold, 3);
        assert_eq!(cfg.loader.pagination_limit_cap, 80);
        assert!(cfg.loader.auto_join_on_forbidden);
        assert_eq!(cfg.coordinator.idle_interval, Duration::from_secs(1));
    }

    #[test]
    fn rejects_invalid_numeric_values() {
        let err = config_from_pairs(&[("PIKACHAT_LOAD_LIMIT", "abc")])
            .expect_err("invalid limit should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "PIKACHAT_LOAD_LIMIT",
                ..
            }
        ));

        let err = config_from_pairs(&[("PIKACHAT_RATE_THRESHOLD", "0")])
            .expect_err("zero threshold should fail");
        assert!(err.to_string().contains("must be at least 1"));
    }

    #[test]
    fn rejects_retry_max_below_base() {
        let err = config_from_pairs(&[
            ("PIKACHAT_SYNC_RETRY_BASE_MS", "5000"),
            ("PIKACHAT_SYNC_RETRY_MAX_MS", "1000"),
        ])
        .expect_err("inverted retry bounds should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "PIKACHAT_SYNC_RETRY_MAX_MS",
                ..
            }
        ));
    }

    #[test]
    fn derives_durable_cache_path_per_account() {
        let cfg = config_from_pairs(&[]).expect("config should parse");
        let a = cfg.durable_cache_path("https://matrix.example.org", "@alice:example.org");
        let expected = Path::new("./.pikachat-sync-store")
            .join("hs-https_matrix_example_org")
            .join("user-alice_example_org")
            .join("cache.sqlite3");
        assert_eq!(a, expected);

        let fixed = config_from_pairs(&[("PIKACHAT_DATA_DIR", "/tmp/pika")])
            .expect("config should parse");
        assert_eq!(
            fixed.durable_cache_path("https://other.example.org", "@bob:example.org"),
            Path::new("/tmp/pika/cache.sqlite3")
        );
    }

    #[test]
    fn bool_parsing_rejects_garbage() {
        let err = config_from_pairs(&[("PIKACHAT_AUTO_JOIN_ON_FORBIDDEN", "maybe")])
            .expect_err("garbage bool should fail");
        assert!(err.to_string().contains("expected a boolean"));
    }
}
