//! Run configuration.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! environment variables. A missing file yields `Config::default()`; unknown
//! keys in the file are ignored with a warning.
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::notify::DEFAULT_EMAIL_STATUS;

pub const DEFAULT_FEED_URL: &str = "https://mikekirkup.com/rss.xml";
pub const DEFAULT_API_URL: &str = "https://api.buttondown.email/v1/emails";
/// Upper bound for `max_retries`; backoff doubles per retry.
pub const MAX_NOTIFY_RETRIES: u32 = 10;

pub const ENV_FEED_URL: &str = "RSS_FEED_URL";
pub const ENV_API_KEY: &str = "BUTTONDOWN_API_KEY";
pub const ENV_API_URL: &str = "NEWSLETTER_API_URL";
pub const ENV_AUTH_SCHEME: &str = "NEWSLETTER_AUTH_SCHEME";
pub const ENV_WINDOW_HOURS: &str = "RECENCY_WINDOW_HOURS";
pub const ENV_NOTIFY_DELAY_MS: &str = "NOTIFY_DELAY_MS";
pub const ENV_MAX_RETRIES: &str = "NOTIFY_MAX_RETRIES";
pub const ENV_RETRY_BASE_DELAY_MS: &str = "NOTIFY_RETRY_BASE_DELAY_MS";
pub const ENV_LEDGER_PATH: &str = "SENT_POSTS_FILE";
pub const ENV_EMAIL_STATUS: &str = "NEWSLETTER_EMAIL_STATUS";
pub const ENV_FOOTER: &str = "NEWSLETTER_FOOTER";
pub const ENV_USER_AGENT: &str = "FEED_USER_AGENT";

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is not set; the newsletter API credential is required")]
    MissingCredential(&'static str),

    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },

    #[error("Invalid URL for {key}: {reason}")]
    InvalidUrl { key: &'static str, reason: String },

    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration
// ============================================================================

/// Settings for one poll-and-notify run.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
/// `api_key` is masked in `Debug` output.
#[derive(Deserialize)]
#[serde(default)]
pub struct Config {
    /// RSS 2.0 feed to poll.
    pub feed_url: String,

    /// Newsletter API credential. Required for every run.
    #[serde(deserialize_with = "deserialize_secret")]
    pub api_key: Option<SecretString>,

    /// Endpoint that creates (and sends) an email.
    pub api_url: String,

    /// Authorization scheme placed before the key (`Token` for Buttondown).
    pub auth_scheme: String,

    /// Posts older than this many hours are never sent.
    pub window_hours: u64,

    /// Pause between consecutive notifications.
    pub notify_delay_ms: u64,

    /// Retries after the first attempt, for 429/5xx responses only.
    pub max_retries: u32,

    /// First retry waits this long; each further retry doubles it.
    pub retry_base_delay_ms: u64,

    /// JSON file holding already-sent guids.
    pub ledger_path: PathBuf,

    /// `status` field of the email payload.
    pub email_status: String,

    /// Italic line appended below each email.
    pub footer: String,

    /// User-Agent for the feed request and API calls.
    pub user_agent: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            feed_url: DEFAULT_FEED_URL.to_string(),
            api_key: None,
            api_url: DEFAULT_API_URL.to_string(),
            auth_scheme: "Token".to_string(),
            window_hours: 2,
            notify_delay_ms: 2000,
            max_retries: 3,
            retry_base_delay_ms: 1000,
            ledger_path: PathBuf::from("sent-posts.json"),
            email_status: DEFAULT_EMAIL_STATUS.to_string(),
            footer: "You're receiving this because you subscribed to Mike Kirkup's blog updates."
                .to_string(),
            user_agent: concat!("rss-newsletter/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("feed_url", &self.feed_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("api_url", &self.api_url)
            .field("auth_scheme", &self.auth_scheme)
            .field("window_hours", &self.window_hours)
            .field("notify_delay_ms", &self.notify_delay_ms)
            .field("max_retries", &self.max_retries)
            .field("retry_base_delay_ms", &self.retry_base_delay_ms)
            .field("ledger_path", &self.ledger_path)
            .field("email_status", &self.email_status)
            .field("footer", &self.footer)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.filter(|s| !s.trim().is_empty()).map(SecretString::from))
}

const KNOWN_KEYS: [&str; 12] = [
    "feed_url",
    "api_key",
    "api_url",
    "auth_scheme",
    "window_hours",
    "notify_delay_ms",
    "max_retries",
    "retry_base_delay_ms",
    "ledger_path",
    "email_status",
    "footer",
    "user_agent",
];

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        Ok(toml::from_str(content)?)
    }

    /// Overlay values from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Overlay values from an arbitrary variable lookup.
    ///
    /// Unset and blank variables leave the current value in place.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get(ENV_FEED_URL) {
            self.feed_url = v.trim().to_string();
        }
        if let Some(v) = get(ENV_API_KEY) {
            self.api_key = Some(SecretString::from(v.trim().to_string()));
        }
        if let Some(v) = get(ENV_API_URL) {
            self.api_url = v.trim().to_string();
        }
        if let Some(v) = get(ENV_AUTH_SCHEME) {
            self.auth_scheme = v.trim().to_string();
        }
        if let Some(v) = parse_var(&get, ENV_WINDOW_HOURS)? {
            self.window_hours = v;
        }
        if let Some(v) = parse_var(&get, ENV_NOTIFY_DELAY_MS)? {
            self.notify_delay_ms = v;
        }
        if let Some(v) = parse_var(&get, ENV_MAX_RETRIES)? {
            self.max_retries = v;
        }
        if let Some(v) = parse_var(&get, ENV_RETRY_BASE_DELAY_MS)? {
            self.retry_base_delay_ms = v;
        }
        if let Some(v) = get(ENV_LEDGER_PATH) {
            self.ledger_path = PathBuf::from(v);
        }
        if let Some(v) = get(ENV_EMAIL_STATUS) {
            self.email_status = v;
        }
        if let Some(v) = get(ENV_FOOTER) {
            self.footer = v;
        }
        if let Some(v) = get(ENV_USER_AGENT) {
            self.user_agent = v;
        }
        Ok(())
    }

    /// Checks values that would otherwise fail later in the run.
    ///
    /// The credential is checked separately by [`Config::require_api_key`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_http_url("feed_url", &self.feed_url)?;
        validate_http_url("api_url", &self.api_url)?;
        if self.window_hours == 0 {
            return Err(ConfigError::InvalidValue {
                key: "window_hours",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_retries > MAX_NOTIFY_RETRIES {
            return Err(ConfigError::InvalidValue {
                key: "max_retries",
                reason: format!("must be at most {MAX_NOTIFY_RETRIES}"),
            });
        }
        if self.auth_scheme.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "auth_scheme",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// The API credential, or `MissingCredential`.
    pub fn require_api_key(&self) -> Result<&SecretString, ConfigError> {
        self.api_key
            .as_ref()
            .filter(|k| !k.expose_secret().trim().is_empty())
            .ok_or(ConfigError::MissingCredential(ENV_API_KEY))
    }

    pub fn window(&self) -> chrono::TimeDelta {
        i64::try_from(self.window_hours)
            .ok()
            .and_then(chrono::TimeDelta::try_hours)
            .unwrap_or(chrono::TimeDelta::MAX)
    }

    pub fn notify_delay(&self) -> Duration {
        Duration::from_millis(self.notify_delay_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

fn parse_var<T, G>(get: &G, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    get(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| ConfigError::InvalidValue {
                    key,
                    reason: format!("'{}': {}", raw.trim(), e),
                })
        })
        .transpose()
}

fn validate_http_url(key: &'static str, value: &str) -> Result<(), ConfigError> {
    let url = Url::parse(value).map_err(|e| ConfigError::InvalidUrl {
        key,
        reason: e.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(ConfigError::InvalidUrl {
            key,
            reason: format!("unsupported scheme '{scheme}' (only http/https allowed)"),
        }),
    }
}

// ============================================================================
// Tests
// ============================================================================
