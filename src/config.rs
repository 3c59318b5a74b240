//! Configuration types.

use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::outreach::dispatch::DEFAULT_WAIT_DAYS;
use crate::outreach::retry::RetryPolicy;

/// Interval tickers for the in-process scheduler. `None` disables a ticker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleConfig {
    pub warmup_interval: Option<Duration>,
    pub followup_interval: Option<Duration>,
    pub reconcile_interval: Option<Duration>,
}

impl ScheduleConfig {
    pub fn is_enabled(&self) -> bool {
        self.warmup_interval.is_some()
            || self.followup_interval.is_some()
            || self.reconcile_interval.is_some()
    }
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct OutreachConfig {
    /// libSQL database file.
    pub db_path: String,
    /// HTTP listen port.
    pub port: u16,
    /// Shared secret for trigger and operator routes (`x-cron-secret`).
    pub cron_secret: SecretString,
    /// Shared secret for lead submission (request body `secret`).
    pub submission_secret: SecretString,
    /// Follow-up wait when a call does not pass one.
    pub followup_wait_days: f64,
    /// How long a claimed recipient stays reserved for an in-flight send.
    pub claim_lease: Duration,
    pub retry: RetryPolicy,
    pub schedule: ScheduleConfig,
}

impl OutreachConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from any key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let required = |key: &str| get(key).ok_or_else(|| ConfigError::MissingEnvVar(key.into()));

        let followup_wait_days: f64 =
            parse_or(get("OUTREACH_FOLLOWUP_WAIT_DAYS"), "OUTREACH_FOLLOWUP_WAIT_DAYS", DEFAULT_WAIT_DAYS)?;
        if !followup_wait_days.is_finite() || followup_wait_days < 0.0 {
            return Err(ConfigError::InvalidValue {
                key: "OUTREACH_FOLLOWUP_WAIT_DAYS".into(),
                message: "must be a non-negative number of days".into(),
            });
        }

        let defaults = RetryPolicy::default();
        let max_attempts: u32 =
            parse_or(get("OUTREACH_RETRY_ATTEMPTS"), "OUTREACH_RETRY_ATTEMPTS", defaults.max_attempts)?;
        if max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "OUTREACH_RETRY_ATTEMPTS".into(),
                message: "must be at least 1".into(),
            });
        }
        let base_ms: u64 = parse_or(
            get("OUTREACH_RETRY_BASE_MS"),
            "OUTREACH_RETRY_BASE_MS",
            defaults.base_delay.as_millis() as u64,
        )?;

        Ok(Self {
            db_path: get("OUTREACH_DB_PATH").unwrap_or_else(|| "./data/outreach.db".to_string()),
            port: parse_or(get("OUTREACH_PORT"), "OUTREACH_PORT", 8080)?,
            cron_secret: SecretString::from(required("CRON_SECRET")?),
            submission_secret: SecretString::from(required("SUBMISSION_SECRET")?),
            followup_wait_days,
            claim_lease: Duration::from_secs(parse_or(
                get("OUTREACH_CLAIM_LEASE_SECS"),
                "OUTREACH_CLAIM_LEASE_SECS",
                300,
            )?),
            retry: RetryPolicy {
                max_attempts,
                base_delay: Duration::from_millis(base_ms),
            },
            schedule: ScheduleConfig {
                warmup_interval: interval(get("OUTREACH_WARMUP_INTERVAL_SECS"), "OUTREACH_WARMUP_INTERVAL_SECS")?,
                followup_interval: interval(
                    get("OUTREACH_FOLLOWUP_INTERVAL_SECS"),
                    "OUTREACH_FOLLOWUP_INTERVAL_SECS",
                )?,
                reconcile_interval: interval(
                    get("OUTREACH_RECONCILE_INTERVAL_SECS"),
                    "OUTREACH_RECONCILE_INTERVAL_SECS",
                )?,
            },
        })
    }
}

fn parse_or<T>(value: Option<String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.into(),
            message: format!("{raw:?}: {e}"),
        }),
    }
}

fn interval(value: Option<String>, key: &str) -> Result<Option<Duration>, ConfigError> {
    let Some(raw) = value else {
        return Ok(None);
    };
    match parse_or::<u64>(Some(raw), key, 0)? {
        0 => Err(ConfigError::InvalidValue {
            key: key.into(),
            message: "interval must be greater than zero".into(),
        }),
        secs => Ok(Some(Duration::from_secs(secs))),
    }
}
