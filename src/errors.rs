//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Frame encoding or decoding failure.
    Codec(String),
    /// Failure while opening or driving a connection.
    Transport(String),
    /// The connection closed before the exchange finished.
    Disconnected(String),
    /// The peer answered with an error frame.
    Remote(String),
    /// An application handler failed.
    Handler(String),
    /// No handler matches the destination, or a destination variable is invalid.
    Route(String),
    /// Missing or rejected credentials.
    Unauthorized(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Codec(msg) => write!(f, "codec: {msg}"),
            Self::Transport(msg) => write!(f, "transport: {msg}"),
            Self::Disconnected(msg) => write!(f, "disconnected: {msg}"),
            Self::Remote(msg) => write!(f, "remote: {msg}"),
            Self::Handler(msg) => write!(f, "handler: {msg}"),
            Self::Route(msg) => write!(f, "route: {msg}"),
            Self::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl AppError {
    /// Message text without the category prefix.
    ///
    /// Used when an error crosses the wire in an `error` frame, so the peer
    /// sees the original message rather than a doubly prefixed one.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Config(msg)
            | Self::Codec(msg)
            | Self::Transport(msg)
            | Self::Disconnected(msg)
            | Self::Remote(msg)
            | Self::Handler(msg)
            | Self::Route(msg)
            | Self::Unauthorized(msg)
            | Self::Io(msg) => msg,
        }
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(format!("malformed json: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
