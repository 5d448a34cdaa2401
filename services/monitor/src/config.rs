//! Monitor configuration.
//!
//! Everything is env-driven. Quota shape, retry attempts and collaborator
//! credentials have no defaults: their absence aborts startup.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use slotwatch_pacing::QuotaScope;
use thiserror::Error;

/// Calls a refresh cycle issues (locations, options, coefficients).
pub const REFRESH_CALL_COST: u32 = 3;

pub const DEFAULT_ALLOCATION_API_URL: &str = "https://supplies-api.wildberries.ru";
pub const DEFAULT_TELEGRAM_API_URL: &str = "https://api.telegram.org";
pub const DEFAULT_SHEETS_API_URL: &str = "https://sheets.googleapis.com";

/// Startup configuration errors. Always fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Credential that never shows up in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Where watched data sets come from.
#[derive(Debug, Clone)]
pub enum SourceConfig {
    /// Spreadsheet read through the Sheets values API.
    Sheets {
        api_url: String,
        spreadsheet_url: String,
        api_key: Secret,
    },
    /// Local JSON file with the same shape.
    File { path: PathBuf },
}

/// Monitor configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Calls allowed per window.
    pub quota_per_window: u32,

    /// Attempts per remote call (first try included).
    pub max_attempts: u32,

    /// Window duration; also the pacing baseline.
    pub window: Duration,

    pub quota_scope: QuotaScope,

    /// Per-attempt request timeout.
    pub request_timeout: Duration,

    /// Pause after a failed cycle.
    pub failure_backoff: Duration,

    /// How long to wait for loops to stop before forcing exit.
    pub shutdown_grace: Duration,

    /// Coefficient ceiling for data sets that do not carry one.
    pub max_coefficient: f64,

    pub allocation_api_url: String,
    pub allocation_api_key: Secret,

    pub telegram_api_url: String,
    pub telegram_bot_token: Secret,

    pub source: SourceConfig,

    /// Subscriber store path.
    pub subscriptions_path: PathBuf,

    /// Pause between two pushes of the same batch.
    pub send_spacing: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let quota_per_window: u32 = parse_required(&get, "SLOTWATCH_QUOTA_PER_WINDOW")?;
        if quota_per_window == 0 {
            return Err(invalid("SLOTWATCH_QUOTA_PER_WINDOW", "must be greater than zero"));
        }

        let max_attempts: u32 = parse_required(&get, "SLOTWATCH_MAX_ATTEMPTS")?;
        if max_attempts == 0 {
            return Err(invalid("SLOTWATCH_MAX_ATTEMPTS", "must be greater than zero"));
        }

        let quota_scope = match get("SLOTWATCH_QUOTA_SCOPE") {
            Some(raw) => raw
                .parse::<QuotaScope>()
                .map_err(|e| invalid("SLOTWATCH_QUOTA_SCOPE", e.to_string()))?,
            None => QuotaScope::Shared,
        };
        if quota_scope == QuotaScope::Shared && quota_per_window < REFRESH_CALL_COST {
            return Err(invalid(
                "SLOTWATCH_QUOTA_PER_WINDOW",
                format!("a shared quota must allow at least {REFRESH_CALL_COST} calls per window"),
            ));
        }

        let window_secs: u64 = parse_optional(&get, "SLOTWATCH_INTERVAL_SECS")?.unwrap_or(60);
        if window_secs == 0 {
            return Err(invalid("SLOTWATCH_INTERVAL_SECS", "must be greater than zero"));
        }

        let request_timeout_secs: u64 =
            parse_optional(&get, "SLOTWATCH_REQUEST_TIMEOUT_SECS")?.unwrap_or(30);
        if request_timeout_secs == 0 {
            return Err(invalid("SLOTWATCH_REQUEST_TIMEOUT_SECS", "must be greater than zero"));
        }
        let failure_backoff_secs: u64 =
            parse_optional(&get, "SLOTWATCH_FAILURE_BACKOFF_SECS")?.unwrap_or(10);
        if failure_backoff_secs == 0 {
            return Err(invalid("SLOTWATCH_FAILURE_BACKOFF_SECS", "must be greater than zero"));
        }
        let shutdown_grace_secs: u64 =
            parse_optional(&get, "SLOTWATCH_SHUTDOWN_GRACE_SECS")?.unwrap_or(3);
        let send_spacing_ms: u64 =
            parse_optional(&get, "SLOTWATCH_SEND_SPACING_MS")?.unwrap_or(100);

        let max_coefficient: f64 =
            parse_optional(&get, "SLOTWATCH_MAX_COEFFICIENT")?.unwrap_or(1.0);
        if !max_coefficient.is_finite() || max_coefficient < 0.0 {
            return Err(invalid("SLOTWATCH_MAX_COEFFICIENT", "must be a non-negative number"));
        }

        let allocation_api_key = get("WB_API_KEY")
            .map(Secret::new)
            .ok_or(ConfigError::Missing("WB_API_KEY"))?;
        let allocation_api_url =
            get("WB_API_URL").unwrap_or_else(|| DEFAULT_ALLOCATION_API_URL.to_string());

        let telegram_bot_token = get("TELEGRAM_BOT_TOKEN")
            .map(Secret::new)
            .ok_or(ConfigError::Missing("TELEGRAM_BOT_TOKEN"))?;
        let telegram_api_url =
            get("TELEGRAM_API_URL").unwrap_or_else(|| DEFAULT_TELEGRAM_API_URL.to_string());

        let source = match get("SLOTWATCH_SOURCE_FILE") {
            Some(path) => SourceConfig::File {
                path: PathBuf::from(path),
            },
            None => {
                let spreadsheet_url = get("GOOGLE_SHEETS_URL")
                    .ok_or(ConfigError::Missing("GOOGLE_SHEETS_URL"))?;
                let api_key = get("GOOGLE_API_KEY")
                    .map(Secret::new)
                    .ok_or(ConfigError::Missing("GOOGLE_API_KEY"))?;
                SourceConfig::Sheets {
                    api_url: get("GOOGLE_SHEETS_API_URL")
                        .unwrap_or_else(|| DEFAULT_SHEETS_API_URL.to_string()),
                    spreadsheet_url,
                    api_key,
                }
            }
        };

        let subscriptions_path = get("SLOTWATCH_SUBSCRIPTIONS_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("subscriptions.json"));

        let log_level = get("SLOTWATCH_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            quota_per_window,
            max_attempts,
            window: Duration::from_secs(window_secs),
            quota_scope,
            request_timeout: Duration::from_secs(request_timeout_secs.max(1)),
            failure_backoff: Duration::from_secs(failure_backoff_secs),
            shutdown_grace: Duration::from_secs(shutdown_grace_secs),
            max_coefficient,
            allocation_api_url,
            allocation_api_key,
            telegram_api_url,
            telegram_bot_token,
            source,
            subscriptions_path,
            send_spacing: Duration::from_millis(send_spacing_ms),
            log_level,
        })
    }

    /// Override the window duration (CLI `--interval`).
    pub fn with_window_secs(mut self, secs: u64) -> Result<Self, ConfigError> {
        if secs == 0 {
            return Err(invalid("--interval", "must be greater than zero"));
        }
        self.window = Duration::from_secs(secs);
        Ok(self)
    }
}

fn invalid(var: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        var,
        reason: reason.into(),
    }
}

fn parse_required<T, G>(get: &G, var: &'static str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    parse_optional(get, var)?.ok_or(ConfigError::Missing(var))
}

fn parse_optional<T, G>(get: &G, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    get(var)
        .map(|raw| raw.parse::<T>().map_err(|e| invalid(var, e.to_string())))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashMap;

    fn base_env() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("SLOTWATCH_QUOTA_PER_WINDOW", "6"),
            ("SLOTWATCH_MAX_ATTEMPTS", "3"),
            ("WB_API_KEY", "wb-key"),
            ("TELEGRAM_BOT_TOKEN", "123:abc"),
            ("SLOTWATCH_SOURCE_FILE", "/tmp/datasets.json"),
        ])
    }

    fn load(env: &HashMap<&'static str, &'static str>) -> Result<Config, ConfigError> {
        Config::from_lookup(|key| env.get(key).map(|v| v.to_string()))
    }

    #[test]
    fn test_defaults() {
        let config = load(&base_env()).unwrap();
        assert_eq!(config.quota_per_window, 6);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.window, Duration::from_secs(60));
        assert_eq!(config.quota_scope, QuotaScope::Shared);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.shutdown_grace, Duration::from_secs(3));
        assert_eq!(config.send_spacing, Duration::from_millis(100));
        assert_eq!(config.allocation_api_url, DEFAULT_ALLOCATION_API_URL);
        assert!(matches!(config.source, SourceConfig::File { .. }));
    }

    #[test]
    fn test_missing_required_settings_are_fatal() {
        for var in [
            "SLOTWATCH_QUOTA_PER_WINDOW",
            "SLOTWATCH_MAX_ATTEMPTS",
            "WB_API_KEY",
            "TELEGRAM_BOT_TOKEN",
        ] {
            let mut env = base_env();
            env.remove(var);
            match load(&env) {
                Err(ConfigError::Missing(missing)) => assert_eq!(missing, var),
                other => panic!("expected missing {var}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_sheets_source_requires_credentials() {
        let mut env = base_env();
        env.remove("SLOTWATCH_SOURCE_FILE");
        env.insert("GOOGLE_SHEETS_URL", "https://docs.google.com/spreadsheets/d/abc/edit");
        assert!(matches!(
            load(&env),
            Err(ConfigError::Missing("GOOGLE_API_KEY"))
        ));

        env.insert("GOOGLE_API_KEY", "g-key");
        let config = load(&env).unwrap();
        assert!(matches!(config.source, SourceConfig::Sheets { .. }));
    }

    #[test]
    fn test_rejects_bad_numbers() {
        let mut env = base_env();
        env.insert("SLOTWATCH_MAX_ATTEMPTS", "three");
        assert!(matches!(
            load(&env),
            Err(ConfigError::Invalid {
                var: "SLOTWATCH_MAX_ATTEMPTS",
                ..
            })
        ));
    }

    #[rstest]
    #[case("SLOTWATCH_INTERVAL_SECS")]
    #[case("SLOTWATCH_REQUEST_TIMEOUT_SECS")]
    #[case("SLOTWATCH_FAILURE_BACKOFF_SECS")]
    fn test_rejects_zero_durations(#[case] var: &'static str) {
        let mut env = base_env();
        env.insert(var, "0");
        match load(&env) {
            Err(ConfigError::Invalid { var: got, .. }) => assert_eq!(got, var),
            other => panic!("expected invalid {var}, got {other:?}"),
        }
    }

    #[test]
    fn test_shared_quota_must_cover_refresh() {
        let mut env = base_env();
        env.insert("SLOTWATCH_QUOTA_PER_WINDOW", "2");
        assert!(load(&env).is_err());

        env.insert("SLOTWATCH_QUOTA_SCOPE", "per-endpoint");
        let config = load(&env).unwrap();
        assert_eq!(config.quota_scope, QuotaScope::PerEndpoint);
    }

    #[test]
    fn test_secret_is_redacted() {
        let config = load(&base_env()).unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("wb-key"));
        assert!(!debug.contains("123:abc"));
    }

    #[test]
    fn test_interval_override() {
        let config = load(&base_env()).unwrap().with_window_secs(120).unwrap();
        assert_eq!(config.window, Duration::from_secs(120));
        assert!(load(&base_env()).unwrap().with_window_secs(0).is_err());
    }
}
