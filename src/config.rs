//! Configuration types, built from environment variables.

use secrecy::SecretString;

use crate::error::ConfigError;

/// IMAP connection settings.
#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    /// Mailbox folder to poll.
    pub folder: String,
}

impl ImapConfig {
    /// Build config from environment variables.
    ///
    /// `COURTBOOK_IMAP_HOST` is required; everything else has a default.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = std::env::var("COURTBOOK_IMAP_HOST")
            .map_err(|_| ConfigError::MissingEnvVar("COURTBOOK_IMAP_HOST".into()))?;

        let port: u16 = read_parsed("COURTBOOK_IMAP_PORT", 993)?;

        let username = std::env::var("COURTBOOK_USERNAME").unwrap_or_default();
        let password =
            SecretString::from(std::env::var("COURTBOOK_PASSWORD").unwrap_or_default());

        let folder =
            std::env::var("COURTBOOK_FOLDER").unwrap_or_else(|_| "INBOX".to_string());

        Ok(Self {
            host,
            port,
            username,
            password,
            folder,
        })
    }
}

/// Poll loop settings.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Idle interval between poll cycles.
    pub poll_interval_secs: u64,
    /// Consecutive cycle failures tolerated before the loop gives up.
    pub max_retries: u32,
    /// Fixed backoff after a failed cycle.
    pub retry_backoff_secs: u64,
    /// Width of the freshness window in seconds. A message whose age is in
    /// `[0, freshness_secs]` is a candidate; more than `freshness_secs` in
    /// the future it is discarded as skewed.
    pub freshness_secs: i64,
    /// Capacity of the dispatched-fingerprint ledger.
    pub ledger_capacity: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            max_retries: 3,
            retry_backoff_secs: 10,
            freshness_secs: 60,
            ledger_capacity: 100,
        }
    }
}

impl PollerConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            poll_interval_secs: read_parsed(
                "COURTBOOK_POLL_INTERVAL_SECS",
                defaults.poll_interval_secs,
            )?,
            max_retries: read_parsed("COURTBOOK_MAX_RETRIES", defaults.max_retries)?,
            retry_backoff_secs: read_parsed(
                "COURTBOOK_RETRY_BACKOFF_SECS",
                defaults.retry_backoff_secs,
            )?,
            freshness_secs: read_parsed("COURTBOOK_FRESHNESS_SECS", defaults.freshness_secs)?,
            ledger_capacity: read_parsed("COURTBOOK_LEDGER_CAPACITY", defaults.ledger_capacity)?,
        })
    }
}

/// Read an env var and parse it, returning `default` when unset.
/// A set-but-unparseable value is a hard error rather than a silent default.
fn read_parsed<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("cannot parse {raw:?}"),
        }),
        Err(_) => Ok(default),
    }
}
