// Copyright (C) 2026 Novita Labs
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.
//!
//! A single immutable [`Config`] is constructed once at startup and passed
//! by reference through [`crate::app::AppContext`]. No other module reads
//! environment variables directly.

use std::time::Duration;

/// Control-plane configuration, resolved once at process startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Upstream provider API key (`NOVITA_API_KEY`).
    pub novita_api_key: String,
    /// Upstream provider base URL.
    pub novita_api_base_url: String,
    /// Default outbound webhook URL, used when an instance's config omits one.
    pub webhook_url: Option<String>,
    /// Default outbound webhook HMAC secret.
    pub webhook_secret: Option<String>,
    /// Default region code used when a create intent doesn't specify one.
    pub default_region: String,
    /// Poll interval for `MONITOR_INSTANCE`/`MONITOR_STARTUP`.
    pub instance_poll_interval: Duration,
    /// Max retry attempts for the upstream adapter and webhook dispatcher.
    pub max_retry_attempts: u32,
    /// Per-request timeout for the upstream adapter.
    pub request_timeout: Duration,
    /// Max wait for a start operation before declaring `startup_failed`.
    pub startup_max_wait: Duration,
    /// Whether the migration scheduler is enabled.
    pub migration_enabled: bool,
    /// Migration sweep interval.
    pub migration_interval: Duration,
    /// Migration eligibility window (1h–168h).
    pub migration_eligibility_interval: Duration,
    /// Max concurrent migrations per sweep.
    pub migration_max_concurrent: usize,
    /// If true, migration sweeps plan but do not mutate.
    pub migration_dry_run: bool,
    /// Whether the periodic (non-startup) sync is enabled.
    pub sync_enable_automatic_sync: bool,
    /// Periodic sync interval (5–1440 minutes).
    pub sync_interval: Duration,
    /// Whether obsolete instances are removed immediately vs. retained.
    pub sync_remove_obsolete_instances: bool,
    /// Retention window for obsolete instances (1–365 days).
    pub sync_obsolete_instance_retention: Duration,
    /// Redis-compatible store connection URL.
    pub store_url: Option<String>,
    /// Whether to fall back to the in-memory store if the external one is
    /// unreachable at startup.
    pub store_enable_fallback: bool,
}

impl Config {
    /// Load configuration from environment variables, applying the
    /// defaults documented in the specification.
    pub fn from_env() -> Result<Self, ConfigError> {
        let novita_api_key =
            std::env::var("NOVITA_API_KEY").map_err(|_| ConfigError::Missing("NOVITA_API_KEY"))?;

        let novita_api_base_url = env_or("NOVITA_API_BASE_URL", "https://api.novita.ai");

        let instance_poll_interval =
            Duration::from_secs(env_parse("INSTANCE_POLL_INTERVAL", 30)?);
        let max_retry_attempts = env_parse("MAX_RETRY_ATTEMPTS", 3)?;
        let request_timeout = Duration::from_millis(env_parse("REQUEST_TIMEOUT", 30_000)?);
        let startup_max_wait = Duration::from_millis(env_parse("STARTUP_MAX_WAIT_MS", 1_200_000)?);

        let migration_enabled = env_parse_bool("MIGRATION_ENABLED", false)?;
        let migration_interval =
            Duration::from_secs(env_parse::<u64>("MIGRATION_INTERVAL_MINUTES", 15)? * 60);
        let migration_eligibility_hours: u64 =
            env_parse("MIGRATION_ELIGIBILITY_INTERVAL_HOURS", 4)?;
        if !(1..=168).contains(&migration_eligibility_hours) {
            return Err(ConfigError::Invalid(
                "MIGRATION_ELIGIBILITY_INTERVAL_HOURS",
                "must be between 1 and 168",
            ));
        }
        let migration_eligibility_interval = Duration::from_secs(migration_eligibility_hours * 3600);
        let migration_max_concurrent = env_parse("MIGRATION_MAX_CONCURRENT", 5)?;
        let migration_dry_run = env_parse_bool("MIGRATION_DRY_RUN", false)?;

        let sync_enable_automatic_sync = env_parse_bool("SYNC_ENABLE_AUTOMATIC_SYNC", false)?;
        let sync_interval_minutes: u64 = env_parse("SYNC_INTERVAL_MINUTES", 30)?;
        if !(5..=1440).contains(&sync_interval_minutes) {
            return Err(ConfigError::Invalid(
                "SYNC_INTERVAL_MINUTES",
                "must be between 5 and 1440",
            ));
        }
        let sync_interval = Duration::from_secs(sync_interval_minutes * 60);
        let sync_remove_obsolete_instances =
            env_parse_bool("SYNC_REMOVE_OBSOLETE_INSTANCES", false)?;
        let retention_days: u64 = env_parse("SYNC_OBSOLETE_INSTANCE_RETENTION_DAYS", 7)?;
        if !(1..=365).contains(&retention_days) {
            return Err(ConfigError::Invalid(
                "SYNC_OBSOLETE_INSTANCE_RETENTION_DAYS",
                "must be between 1 and 365",
            ));
        }
        let sync_obsolete_instance_retention = Duration::from_secs(retention_days * 86400);

        Ok(Self {
            novita_api_key,
            novita_api_base_url,
            webhook_url: std::env::var("WEBHOOK_URL").ok(),
            webhook_secret: std::env::var("WEBHOOK_SECRET").ok(),
            default_region: env_or("DEFAULT_REGION", "CN-HK-01"),
            instance_poll_interval,
            max_retry_attempts,
            request_timeout,
            startup_max_wait,
            migration_enabled,
            migration_interval,
            migration_eligibility_interval,
            migration_max_concurrent,
            migration_dry_run,
            sync_enable_automatic_sync,
            sync_interval,
            sync_remove_obsolete_instances,
            sync_obsolete_instance_retention,
            store_url: std::env::var("STORE_URL").ok(),
            store_enable_fallback: env_parse_bool("STORE_ENABLE_FALLBACK", true)?,
        })
    }

    /// Build a config with the same defaults `from_env` would apply,
    /// without touching the environment. Used by other modules' tests.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            novita_api_key: "test-key".to_string(),
            novita_api_base_url: "https://api.novita.test".to_string(),
            webhook_url: None,
            webhook_secret: None,
            default_region: "CN-HK-01".to_string(),
            instance_poll_interval: Duration::from_secs(30),
            max_retry_attempts: 3,
            request_timeout: Duration::from_secs(30),
            startup_max_wait: Duration::from_millis(1_200_000),
            migration_enabled: false,
            migration_interval: Duration::from_secs(15 * 60),
            migration_eligibility_interval: Duration::from_secs(4 * 3600),
            migration_max_concurrent: 5,
            migration_dry_run: false,
            sync_enable_automatic_sync: false,
            sync_interval: Duration::from_secs(30 * 60),
            sync_remove_obsolete_instances: false,
            sync_obsolete_instance_retention: Duration::from_secs(7 * 86400),
            store_url: None,
            store_enable_fallback: true,
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr + ToString,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid(key, "must be a valid number")),
        Err(_) => Ok(default),
    }
}

fn env_parse_bool(key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            _ => Err(ConfigError::Invalid(key, "must be a boolean")),
        },
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_env() {
        for key in [
            "NOVITA_API_KEY",
            "NOVITA_API_BASE_URL",
            "MIGRATION_ELIGIBILITY_INTERVAL_HOURS",
            "SYNC_INTERVAL_MINUTES",
        ] {
            unsafe { std::env::remove_var(key) };
        }
    }

    #[test]
    fn missing_api_key_is_an_error() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("NOVITA_API_KEY")));
    }

    #[test]
    fn defaults_apply_when_unset() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        unsafe { std::env::set_var("NOVITA_API_KEY", "test-key") };
        let config = Config::from_env().unwrap();
        assert_eq!(config.default_region, "CN-HK-01");
        assert_eq!(config.instance_poll_interval, Duration::from_secs(30));
        assert_eq!(config.migration_max_concurrent, 5);
        unsafe { std::env::remove_var("NOVITA_API_KEY") };
    }

    #[test]
    fn out_of_range_eligibility_window_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        unsafe {
            std::env::set_var("NOVITA_API_KEY", "test-key");
            std::env::set_var("MIGRATION_ELIGIBILITY_INTERVAL_HOURS", "200");
        }
        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("MIGRATION_ELIGIBILITY_INTERVAL_HOURS", _)
        ));
        unsafe {
            std::env::remove_var("NOVITA_API_KEY");
            std::env::remove_var("MIGRATION_ELIGIBILITY_INTERVAL_HOURS");
        }
    }
}
