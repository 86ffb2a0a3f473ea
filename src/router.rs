//! Route table mapping destinations to handlers.
//!
//! Routes are either exact (`"auth"`) or templated with dot-separated
//! destination variables (`"responder-request-response.{id}"`). Exact
//! routes win over templates; templates are tried in registration order.
//!
//! Any handler kind can answer any interaction:
//!
//! | Handler        | request/response | stream / channel       | fire-and-forget |
//! |----------------|------------------|------------------------|-----------------|
//! | response       | its value        | one element            | value dropped   |
//! | stream         | first element    | every element          | drained         |
//! | channel        | first element    | every element          | drained         |
//! | fire-and-forget| empty reply      | completes empty        | runs            |

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::stream::{self, BoxStream};
use futures_util::{FutureExt, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::auth::Principal;
use crate::protocol::frame::{Interaction, Metadata, SetupFrame, StreamId};
use crate::transport::requester::Requester;
use crate::{AppError, Result};

/// Replies produced by a handler.
pub type ReplyStream = BoxStream<'static, Result<Value>>;

/// Elements received from the peer on a channel.
pub type InboundStream = BoxStream<'static, Value>;

type ResponseFn = dyn Fn(Request) -> BoxFuture<'static, Result<Value>> + Send + Sync;
type FireFn = dyn Fn(Request) -> BoxFuture<'static, ()> + Send + Sync;
type StreamFn = dyn Fn(Request) -> ReplyStream + Send + Sync;
type ChannelFn = dyn Fn(Request, InboundStream) -> ReplyStream + Send + Sync;
type SetupFn = dyn Fn(&SetupFrame, Option<&Principal>, &Requester) + Send + Sync;

/// An inbound request as seen by a handler.
pub struct Request {
    /// Stream the request arrived on.
    pub stream_id: StreamId,
    /// Interaction the peer asked for.
    pub interaction: Interaction,
    /// Concrete destination, variables already substituted.
    pub route: String,
    /// Destination variables captured from a templated route.
    pub vars: HashMap<String, String>,
    /// Request metadata.
    pub metadata: Metadata,
    /// Request payload.
    pub payload: Value,
    /// Authenticated caller, if any.
    pub principal: Option<Principal>,
    /// Handle for issuing requests back to the peer.
    pub peer: Requester,
}

impl Request {
    /// Raw destination variable.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Route` when the route captured no such variable.
    pub fn var(&self, name: &str) -> Result<&str> {
        self.vars
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| AppError::Route(format!("missing destination variable '{name}'")))
    }

    /// Destination variable parsed into `T`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Route` when missing or unparsable.
    pub fn parse_var<T: FromStr>(&self, name: &str) -> Result<T> {
        let raw = self.var(name)?;
        raw.parse().map_err(|_| {
            AppError::Route(format!("invalid destination variable '{name}': '{raw}'"))
        })
    }

    /// Payload decoded into `T`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Codec` when the payload does not match `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// Payload rendered as text: strings verbatim, anything else as JSON.
    #[must_use]
    pub fn payload_text(&self) -> String {
        payload_text(&self.payload)
    }
}

/// Render a payload as text: strings verbatim, anything else as JSON.
#[must_use]
pub fn payload_text(payload: &Value) -> String {
    match payload {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// A registered handler.
#[derive(Clone)]
pub enum Handler {
    /// Single reply.
    Response(Arc<ResponseFn>),
    /// No reply.
    FireAndForget(Arc<FireFn>),
    /// Reply stream.
    Stream(Arc<StreamFn>),
    /// Reply stream fed by an inbound stream.
    Channel(Arc<ChannelFn>),
}

/// What invoking a handler produced.
pub enum Invocation {
    /// Replies to forward to the peer.
    Replies(ReplyStream),
    /// Work with no replies.
    Detached(BoxFuture<'static, ()>),
}

impl Handler {
    /// Call the handler.
    ///
    /// `inbound` is only consulted by channel handlers; when absent the
    /// request payload becomes the sole inbound element.
    #[must_use]
    pub fn invoke(&self, request: Request, inbound: Option<InboundStream>) -> Invocation {
        match self {
            Self::Response(f) => Invocation::Replies(f(request).into_stream().boxed()),
            Self::FireAndForget(f) => Invocation::Detached(f(request)),
            Self::Stream(f) => Invocation::Replies(f(request)),
            Self::Channel(f) => {
                let inbound = inbound.unwrap_or_else(|| {
                    stream::once(std::future::ready(request.payload.clone())).boxed()
                });
                Invocation::Replies(f(request, inbound))
            }
        }
    }
}

/// Result of resolving a destination.
#[derive(Clone)]
pub struct Resolved {
    /// Handler to invoke.
    pub handler: Handler,
    /// Captured destination variables.
    pub vars: HashMap<String, String>,
    /// Whether an authenticated principal is required.
    pub requires_auth: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Var(String),
}

/// A dot-separated route template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePattern {
    raw: String,
    segments: Vec<Segment>,
}

impl RoutePattern {
    /// Parse a template such as `"orders.{id}"`.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let segments = raw
            .split('.')
            .map(|segment| {
                segment
                    .strip_prefix('{')
                    .and_then(|s| s.strip_suffix('}'))
                    .map_or_else(
                        || Segment::Literal(segment.to_owned()),
                        |name| Segment::Var(name.to_owned()),
                    )
            })
            .collect();
        Self {
            raw: raw.to_owned(),
            segments,
        }
    }

    /// Whether the template captures variables.
    #[must_use]
    pub fn is_templated(&self) -> bool {
        self.segments.iter().any(|s| matches!(s, Segment::Var(_)))
    }

    /// Match a concrete route, returning captured variables.
    #[must_use]
    pub fn matches(&self, route: &str) -> Option<HashMap<String, String>> {
        let parts: Vec<&str> = route.split('.').collect();
        if parts.len() != self.segments.len() {
            return None;
        }

        let mut vars = HashMap::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(lit) if lit == part => {}
                Segment::Literal(_) => return None,
                Segment::Var(_) if part.is_empty() => return None,
                Segment::Var(name) => {
                    vars.insert(name.clone(), part.to_owned());
                }
            }
        }
        Some(vars)
    }

    /// Template text as registered.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// Route table built once at startup.
#[derive(Clone, Default)]
pub struct Router {
    exact: HashMap<String, Handler>,
    templates: Vec<(RoutePattern, Handler)>,
    secured: HashSet<String>,
    setup: HashMap<String, Arc<SetupFn>>,
}

impl Router {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(mut self, route: &str, handler: Handler) -> Self {
        let pattern = RoutePattern::parse(route);
        if pattern.is_templated() {
            self.templates.retain(|(p, _)| p.as_str() != route);
            self.templates.push((pattern, handler));
        } else {
            self.exact.insert(route.to_owned(), handler);
        }
        self
    }

    /// Register a single-reply handler.
    #[must_use]
    pub fn response<F, Fut>(self, route: &str, f: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.insert(route, Handler::Response(Arc::new(move |req| f(req).boxed())))
    }

    /// Register a no-reply handler.
    #[must_use]
    pub fn fire_and_forget<F, Fut>(self, route: &str, f: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.insert(route, Handler::FireAndForget(Arc::new(move |req| f(req).boxed())))
    }

    /// Register a reply-stream handler.
    #[must_use]
    pub fn stream<F, S>(self, route: &str, f: F) -> Self
    where
        F: Fn(Request) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Value>> + Send + 'static,
    {
        self.insert(route, Handler::Stream(Arc::new(move |req| f(req).boxed())))
    }

    /// Register a bidirectional handler.
    #[must_use]
    pub fn channel<F, S>(self, route: &str, f: F) -> Self
    where
        F: Fn(Request, InboundStream) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Value>> + Send + 'static,
    {
        self.insert(
            route,
            Handler::Channel(Arc::new(move |req, inbound| f(req, inbound).boxed())),
        )
    }

    /// Register a callback for `setup` frames naming `route`.
    #[must_use]
    pub fn on_setup<F>(mut self, route: &str, f: F) -> Self
    where
        F: Fn(&SetupFrame, Option<&Principal>, &Requester) + Send + Sync + 'static,
    {
        self.setup.insert(route.to_owned(), Arc::new(f));
        self
    }

    /// Require an authenticated principal on `route` (exact or template text).
    #[must_use]
    pub fn require_auth(mut self, route: &str) -> Self {
        self.secured.insert(route.to_owned());
        self
    }

    /// Number of registered request routes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.exact.len() + self.templates.len()
    }

    /// Whether no request routes are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve a concrete destination.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Route` when nothing matches.
    pub fn resolve(&self, route: &str) -> Result<Resolved> {
        if let Some(handler) = self.exact.get(route) {
            return Ok(Resolved {
                handler: handler.clone(),
                vars: HashMap::new(),
                requires_auth: self.secured.contains(route),
            });
        }

        self.templates
            .iter()
            .find_map(|(pattern, handler)| {
                pattern.matches(route).map(|vars| Resolved {
                    handler: handler.clone(),
                    vars,
                    requires_auth: self.secured.contains(pattern.as_str()),
                })
            })
            .ok_or_else(|| AppError::Route(format!("no handler for destination '{route}'")))
    }

    /// Setup callback registered for `route`.
    #[must_use]
    pub fn setup_handler(&self, route: &str) -> Option<Arc<SetupFn>> {
        self.setup.get(route).cloned()
    }
}
