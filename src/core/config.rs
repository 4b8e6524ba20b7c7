//! Session configuration.
//!
//! Loads from environment variables (with an optional `.env` file) or is
//! built programmatically from [`SessionConfig::default`].

use std::env;
use std::str::FromStr;
use std::time::Duration;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use thiserror::Error;
use url::Url;

use super::types::{SessionError, TransportConfig};

pub const DEFAULT_URL: &str = "ws://127.0.0.1:1018/client-ws";

const ENV_URL: &str = "SESSION_WS_URL";
const ENV_BASE_DELAY_MS: &str = "SESSION_WS_BASE_DELAY_MS";
const ENV_MAX_DELAY_MS: &str = "SESSION_WS_MAX_DELAY_MS";
const ENV_MAX_RECONNECT_ATTEMPTS: &str = "SESSION_WS_MAX_RECONNECT_ATTEMPTS";
const ENV_HEARTBEAT_INTERVAL_MS: &str = "SESSION_WS_HEARTBEAT_INTERVAL_MS";
const ENV_OUTBOUND_CAPACITY: &str = "SESSION_WS_OUTBOUND_CAPACITY";

/// Configuration errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),

    #[error("Invalid websocket url: {0}")]
    InvalidUrl(String),
}

impl From<ConfigError> for SessionError {
    fn from(err: ConfigError) -> Self {
        SessionError::InvalidConfig(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Base endpoint; the token is appended as a `token` query parameter.
    pub url: Url,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_reconnect_attempts: u32,
    /// Zero disables the heartbeat.
    pub heartbeat_interval: Duration,
    /// Frames queued for the socket writer before `send` starts dropping.
    pub outbound_capacity: usize,
    pub transport: TransportConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            url: Url::parse(DEFAULT_URL).expect("default url is valid"),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_reconnect_attempts: 10,
            heartbeat_interval: Duration::from_secs(25),
            outbound_capacity: 256,
            transport: TransportConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Defaults pointed at `url`.
    pub fn new(url: &str) -> Result<Self, ConfigError> {
        let config = Self {
            url: parse_ws_url(url)?,
            ..Self::default()
        };
        Ok(config)
    }

    #[must_use]
    pub fn with_backoff(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    #[must_use]
    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    #[must_use]
    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity;
        self
    }

    /// Load from the process environment, reading `.env` first if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load from an arbitrary key lookup. Missing keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup(ENV_URL) {
            config.url = parse_ws_url(&url)?;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_BASE_DELAY_MS)? {
            config.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_MAX_DELAY_MS)? {
            config.max_delay = Duration::from_millis(ms);
        }
        if let Some(attempts) = parse_var::<u32>(&lookup, ENV_MAX_RECONNECT_ATTEMPTS)? {
            config.max_reconnect_attempts = attempts;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_HEARTBEAT_INTERVAL_MS)? {
            config.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(capacity) = parse_var::<usize>(&lookup, ENV_OUTBOUND_CAPACITY)? {
            config.outbound_capacity = capacity;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_scheme(&self.url)?;
        if self.base_delay > self.max_delay {
            return Err(ConfigError::InvalidValue(
                ENV_BASE_DELAY_MS,
                format!(
                    "base delay {:?} exceeds max delay {:?}",
                    self.base_delay, self.max_delay
                ),
            ));
        }
        if self.outbound_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                ENV_OUTBOUND_CAPACITY,
                "must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// The endpoint with `token` set as its (only) `token` query parameter.
    ///
    /// The token is percent-encoded as a URI component, so a space becomes
    /// `%20` rather than `+`. Other query pairs are kept as they were.
    pub fn endpoint_with_token(&self, token: &str) -> Url {
        let mut url = self.url.clone();
        let mut query = url
            .query()
            .unwrap_or_default()
            .split('&')
            .filter(|pair| !pair.is_empty() && pair.split('=').next() != Some("token"))
            .collect::<Vec<_>>()
            .join("&");
        if !query.is_empty() {
            query.push('&');
        }
        query.push_str("token=");
        query.extend(utf8_percent_encode(token, URI_COMPONENT));
        url.set_query(Some(&query));
        url
    }
}

/// Everything except the characters a URI component leaves unescaped.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Url without query or fragment, safe to log.
pub fn redact_url(url: &Url) -> String {
    let mut redacted = url.clone();
    redacted.set_query(None);
    redacted.set_fragment(None);
    redacted.to_string()
}

fn parse_ws_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|err| ConfigError::InvalidUrl(format!("{raw}: {err}")))?;
    check_scheme(&url)?;
    Ok(url)
}

fn check_scheme(url: &Url) -> Result<(), ConfigError> {
    match url.scheme() {
        "ws" | "wss" => Ok(()),
        other => Err(ConfigError::InvalidUrl(format!(
            "unsupported scheme `{other}`, expected ws or wss"
        ))),
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|err| ConfigError::InvalidValue(key, format!("{raw:?}: {err}"))),
    }
}
