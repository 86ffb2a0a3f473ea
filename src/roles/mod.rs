//! Role adapters: the route tables and operations of each binary.
//!
//! - [`responder`]: serves the demo routes, runs one duplex session per
//!   bidirectional request, and watches the requester's health.
//! - [`initiator`]: serves the health routes the responder calls back
//!   into, and drives every interaction from the requester side.

pub mod initiator;
pub mod responder;

/// Health stream served by the initiator.
pub const HEALTH_ROUTE: &str = "health";
/// Per-session health poll served by the initiator.
pub const HEALTH_POLL_ROUTE: &str = "health.poll";

/// Templated request/response route; `{id}` is an integer.
pub const REQUEST_RESPONSE_ROUTE: &str = "responder-request-response.{id}";
/// Upper-casing channel.
pub const CHANNEL_STREAM_ROUTE: &str = "responder-channel-stream";
/// Logged, unanswered requests.
pub const FIRE_FORGET_ROUTE: &str = "responder-fire-forget";
/// Duplex session route.
pub const BIDIRECTIONAL_ROUTE: &str = "responder-channel-bidirectional";
/// Always fails.
pub const ERROR_ROUTE: &str = "error";
/// Greets the authenticated caller.
pub const AUTH_ROUTE: &str = "auth";
/// Setup route naming the connecting user.
pub const CONNECT_SETUP_ROUTE: &str = "connect";

/// Metadata header logged by the request/response route.
pub const CUSTOM_HEADER: &str = "custom-header";
