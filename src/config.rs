//! Global configuration parsing, validation, and credential loading.

use std::collections::HashSet;
use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::auth::{Credentials, User};
use crate::{AppError, Result};

/// Keychain service under which requester credentials are stored.
pub const KEYRING_SERVICE: &str = "duplex-watchdog";

/// Connection endpoints shared by both binaries.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TransportConfig {
    /// Host the responder binds to and the requester connects to.
    #[serde(default = "default_host")]
    pub host: String,
    /// TCP port for the framed duplex transport.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Port for the HTTP liveness probe; disabled when absent.
    #[serde(default)]
    pub http_port: Option<u16>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            http_port: None,
        }
    }
}

/// Reply cadence and client fan-out for channel interactions.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ChannelConfig {
    /// Delay between consecutive replies on a duplex session.
    #[serde(default = "default_interval_ms")]
    pub reply_interval_ms: u64,
    /// Upper bound on replies per session; unbounded when absent.
    #[serde(default)]
    pub reply_limit: Option<u64>,
    /// Number of concurrent duplex clients the requester launches.
    #[serde(default = "default_client_count")]
    pub client_count: u32,
    /// Delay between launching consecutive duplex clients.
    #[serde(default = "default_interval_ms")]
    pub client_launch_interval_ms: u64,
    /// Elements sent by the requester on `channel-stream`.
    #[serde(default = "default_stream_length")]
    pub stream_length: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            reply_interval_ms: default_interval_ms(),
            reply_limit: None,
            client_count: default_client_count(),
            client_launch_interval_ms: default_interval_ms(),
            stream_length: default_stream_length(),
        }
    }
}

/// How the responder learns the requester's health.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum WatchdogMode {
    /// Subscribe to the requester's `health` stream, resubscribing if it
    /// ends without a stop.
    #[default]
    Subscribe,
    /// Issue one `health.poll` request per poll interval.
    Poll,
}

/// Watchdog cadence and the initiator's stop threshold.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct WatchdogConfig {
    /// Subscription or polling.
    #[serde(default)]
    pub mode: WatchdogMode,
    /// Interval between health observations.
    #[serde(default = "default_interval_ms")]
    pub poll_interval_ms: u64,
    /// Elapsed seconds after which the initiator reports `stopped`.
    #[serde(default = "default_stop_after_seconds")]
    pub stop_after_seconds: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            mode: WatchdogMode::default(),
            poll_interval_ms: default_interval_ms(),
            stop_after_seconds: default_stop_after_seconds(),
        }
    }
}

/// Requester identity. The password is never read from TOML.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RequesterConfig {
    /// Username presented on the `auth` route.
    #[serde(default)]
    pub username: Option<String>,
    /// Password loaded at runtime from keychain or environment.
    #[serde(skip)]
    pub password: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    8181
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_client_count() -> u32 {
    1
}

fn default_stream_length() -> u64 {
    10
}

fn default_stop_after_seconds() -> u64 {
    3
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Connection endpoints.
    #[serde(default)]
    pub transport: TransportConfig,
    /// Channel cadence and fan-out.
    #[serde(default)]
    pub channel: ChannelConfig,
    /// Watchdog cadence and threshold.
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    /// Requester identity.
    #[serde(default)]
    pub requester: RequesterConfig,
    /// Users the responder accepts credentials for.
    #[serde(default)]
    pub users: Vec<User>,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the requester password from OS keychain with env-var fallback.
    ///
    /// Only runs when `requester.username` is configured; the password is
    /// optional otherwise.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if a username is configured but neither
    /// keychain nor env var provides a password.
    pub async fn load_credentials(&mut self) -> Result<()> {
        if self.requester.username.is_some() {
            self.requester.password =
                Some(load_credential("requester_password", "DUPLEX_REQUESTER_PASSWORD").await?);
        }
        Ok(())
    }

    /// Requester credentials when both halves are available.
    #[must_use]
    pub fn requester_credentials(&self) -> Option<Credentials> {
        match (&self.requester.username, &self.requester.password) {
            (Some(username), Some(password)) => {
                Some(Credentials::new(username.clone(), password.clone()))
            }
            _ => None,
        }
    }

    /// Socket address of the framed transport.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if host and port do not form an address.
    pub fn transport_addr(&self) -> Result<SocketAddr> {
        let raw = format!("{}:{}", self.transport.host, self.transport.port);
        raw.parse()
            .map_err(|err| AppError::Config(format!("invalid transport address '{raw}': {err}")))
    }

    /// Socket address of the HTTP liveness probe, when enabled.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if host and port do not form an address.
    pub fn probe_addr(&self) -> Result<Option<SocketAddr>> {
        let Some(port) = self.transport.http_port else {
            return Ok(None);
        };
        let raw = format!("{}:{port}", self.transport.host);
        raw.parse()
            .map(Some)
            .map_err(|err| AppError::Config(format!("invalid probe address '{raw}': {err}")))
    }

    /// Delay between consecutive duplex replies.
    #[must_use]
    pub fn reply_interval(&self) -> Duration {
        Duration::from_millis(self.channel.reply_interval_ms)
    }

    /// Delay between launching duplex clients.
    #[must_use]
    pub fn client_launch_interval(&self) -> Duration {
        Duration::from_millis(self.channel.client_launch_interval_ms)
    }

    /// Interval between health observations.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog.poll_interval_ms)
    }

    /// Elapsed time after which health reports `stopped`.
    #[must_use]
    pub fn stop_after(&self) -> Duration {
        Duration::from_secs(self.watchdog.stop_after_seconds)
    }

    fn validate(&self) -> Result<()> {
        if self.channel.reply_interval_ms == 0 {
            return Err(AppError::Config(
                "channel.reply_interval_ms must be greater than zero".into(),
            ));
        }

        if self.channel.client_count == 0 {
            return Err(AppError::Config(
                "channel.client_count must be greater than zero".into(),
            ));
        }

        if self.watchdog.poll_interval_ms == 0 {
            return Err(AppError::Config(
                "watchdog.poll_interval_ms must be greater than zero".into(),
            ));
        }

        let mut seen = HashSet::new();
        for user in &self.users {
            if !seen.insert(user.username.as_str()) {
                return Err(AppError::Config(format!(
                    "duplicate user '{}'",
                    user.username
                )));
            }
            if !user.has_valid_digest() {
                return Err(AppError::Config(format!(
                    "user '{}' password_sha256 must be 64 hex characters",
                    user.username
                )));
            }
        }

        Ok(())
    }
}

/// Load a single credential from OS keychain with env-var fallback.
async fn load_credential(keyring_key: &str, env_key: &str) -> Result<String> {
    let key = keyring_key.to_owned();

    // keyring is synchronous I/O.
    let keychain_result = tokio::task::spawn_blocking(move || {
        keyring::Entry::new(KEYRING_SERVICE, &key).and_then(|entry| entry.get_password())
    })
    .await
    .map_err(|err| AppError::Config(format!("keychain task panicked: {err}")))?;

    match keychain_result {
        Ok(value) if !value.is_empty() => return Ok(value),
        Ok(_) => {
            warn!(key = keyring_key, "keychain entry is empty, trying env var");
        }
        Err(err) => {
            warn!(
                key = keyring_key,
                ?err,
                "keychain lookup failed, trying env var"
            );
        }
    }

    match env::var(env_key) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(AppError::Config(format!(
            "credential {keyring_key} not found in keychain or {env_key} env var"
        ))),
    }
}
