//! Frame types for the duplex wire protocol.
//!
//! # Wire format
//!
//! ```json
//! {"type":"setup","route":"connect","metadata":{"auth":{"username":"jay","password":"pw"}}}
//! {"type":"request_stream","stream_id":1,"route":"health","metadata":{},"payload":"STARTED?"}
//! {"type":"next","stream_id":1,"payload":{"state":"started","observed_at":"..."}}
//! {"type":"complete","stream_id":1}
//! {"type":"error","stream_id":3,"code":"application_error","message":"Something bad happened"}
//! {"type":"cancel","stream_id":1}
//! ```
//!
//! The connecting peer allocates odd stream ids, the accepting peer even
//! ids. Stream id `0` is reserved for connection-level errors.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::Credentials;
use crate::AppError;

/// Identifies one interaction within a connection.
pub type StreamId = u32;

/// Stream id used for connection-level errors.
pub const CONNECTION_STREAM_ID: StreamId = 0;

/// The four interaction models.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Interaction {
    /// One request, one reply.
    RequestResponse,
    /// One request, no reply.
    FireAndForget,
    /// One request, a stream of replies.
    RequestStream,
    /// A stream of requests, a stream of replies.
    RequestChannel,
}

/// Out-of-band data attached to a request or setup.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Metadata {
    /// Credentials authenticating this request or connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Credentials>,
    /// Free-form string headers.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

impl Metadata {
    /// Attach credentials.
    #[must_use]
    pub fn with_auth(mut self, credentials: Credentials) -> Self {
        self.auth = Some(credentials);
        self
    }

    /// Attach a header, replacing any previous value under `name`.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Look up a header.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// Connection-opening frame sent once by the connecting peer.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SetupFrame {
    /// Setup route dispatched on the accepting side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    /// Connection-level metadata.
    #[serde(default)]
    pub metadata: Metadata,
}

/// Body shared by every request frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestFrame {
    /// Stream this request opens.
    pub stream_id: StreamId,
    /// Destination route on the receiving peer.
    pub route: String,
    /// Request metadata.
    #[serde(default)]
    pub metadata: Metadata,
    /// Request payload (first element for channels).
    #[serde(default)]
    pub payload: Value,
}

/// Error category carried by an `error` frame.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// A handler failed.
    ApplicationError,
    /// Authentication or authorization refused the request.
    Rejected,
    /// No handler for the destination, or a malformed destination.
    Invalid,
    /// The connection is being torn down.
    ConnectionError,
}

impl ErrorCode {
    /// Wire category for a local error.
    #[must_use]
    pub fn for_error(err: &AppError) -> Self {
        match err {
            AppError::Unauthorized(_) => Self::Rejected,
            AppError::Route(_) => Self::Invalid,
            AppError::Disconnected(_) | AppError::Transport(_) => Self::ConnectionError,
            _ => Self::ApplicationError,
        }
    }

    /// Local error for a received `error` frame.
    #[must_use]
    pub fn into_error(self, message: String) -> AppError {
        match self {
            Self::ApplicationError => AppError::Remote(message),
            Self::Rejected => AppError::Unauthorized(message),
            Self::Invalid => AppError::Route(message),
            Self::ConnectionError => AppError::Disconnected(message),
        }
    }
}

/// One protocol frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Connection setup.
    Setup(SetupFrame),
    /// Opens a request/response exchange.
    RequestResponse(RequestFrame),
    /// One-way request.
    FireAndForget(RequestFrame),
    /// Opens a reply stream.
    RequestStream(RequestFrame),
    /// Opens a bidirectional stream.
    RequestChannel(RequestFrame),
    /// One element on a stream.
    Next {
        /// Target stream.
        stream_id: StreamId,
        /// Element.
        payload: Value,
    },
    /// The sender's half of the stream is finished.
    Complete {
        /// Target stream.
        stream_id: StreamId,
    },
    /// The stream failed.
    Error {
        /// Target stream, or [`CONNECTION_STREAM_ID`].
        stream_id: StreamId,
        /// Failure category.
        code: ErrorCode,
        /// Human-readable message.
        message: String,
    },
    /// The receiver wants no further elements.
    Cancel {
        /// Target stream.
        stream_id: StreamId,
    },
}

impl Frame {
    /// Wrap a request body in the frame for `interaction`.
    #[must_use]
    pub fn request(interaction: Interaction, body: RequestFrame) -> Self {
        match interaction {
            Interaction::RequestResponse => Self::RequestResponse(body),
            Interaction::FireAndForget => Self::FireAndForget(body),
            Interaction::RequestStream => Self::RequestStream(body),
            Interaction::RequestChannel => Self::RequestChannel(body),
        }
    }

    /// Split a request frame into its interaction and body.
    #[must_use]
    pub fn into_request(self) -> Option<(Interaction, RequestFrame)> {
        match self {
            Self::RequestResponse(body) => Some((Interaction::RequestResponse, body)),
            Self::FireAndForget(body) => Some((Interaction::FireAndForget, body)),
            Self::RequestStream(body) => Some((Interaction::RequestStream, body)),
            Self::RequestChannel(body) => Some((Interaction::RequestChannel, body)),
            _ => None,
        }
    }

    /// Build an `error` frame from a local error.
    #[must_use]
    pub fn error(stream_id: StreamId, err: &AppError) -> Self {
        Self::Error {
            stream_id,
            code: ErrorCode::for_error(err),
            message: err.message().to_owned(),
        }
    }

    /// Stream the frame addresses; `None` for `setup`.
    #[must_use]
    pub fn stream_id(&self) -> Option<StreamId> {
        match self {
            Self::Setup(_) => None,
            Self::RequestResponse(body)
            | Self::FireAndForget(body)
            | Self::RequestStream(body)
            | Self::RequestChannel(body) => Some(body.stream_id),
            Self::Next { stream_id, .. }
            | Self::Complete { stream_id }
            | Self::Error { stream_id, .. }
            | Self::Cancel { stream_id } => Some(*stream_id),
        }
    }
}
