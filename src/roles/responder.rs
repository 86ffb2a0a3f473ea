//! Responder route table.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    AUTH_ROUTE, BIDIRECTIONAL_ROUTE, CHANNEL_STREAM_ROUTE, CONNECT_SETUP_ROUTE, CUSTOM_HEADER,
    ERROR_ROUTE, FIRE_FORGET_ROUTE, HEALTH_POLL_ROUTE, HEALTH_ROUTE, REQUEST_RESPONSE_ROUTE,
};
use crate::auth::Principal;
use crate::config::{GlobalConfig, WatchdogMode};
use crate::duplex::{DuplexSession, TimedSequence, Watchdog};
use crate::models::health::HealthState;
use crate::models::message::Message;
use crate::protocol::frame::{Metadata, SetupFrame};
use crate::router::{payload_text, InboundStream, Request, Router};
use crate::transport::Requester;
use crate::{AppError, Result};

/// Message returned by the `error` route.
pub const ERROR_MESSAGE: &str = "Something bad happened";

/// Tunables for the responder's duplex sessions.
#[derive(Debug, Clone)]
pub struct ResponderSettings {
    /// Delay between replies.
    pub reply_interval: Duration,
    /// Replies per session before it completes on its own.
    pub reply_limit: Option<u64>,
    /// How the requester's health is observed.
    pub watchdog_mode: WatchdogMode,
    /// Poll cadence in [`WatchdogMode::Poll`]; resubscribe delay in
    /// [`WatchdogMode::Subscribe`].
    pub poll_interval: Duration,
}

impl ResponderSettings {
    /// Settings taken from the loaded configuration.
    #[must_use]
    pub fn from_config(config: &GlobalConfig) -> Self {
        Self {
            reply_interval: config.reply_interval(),
            reply_limit: config.channel.reply_limit,
            watchdog_mode: config.watchdog.mode,
            poll_interval: config.poll_interval(),
        }
    }
}

impl Default for ResponderSettings {
    fn default() -> Self {
        Self::from_config(&GlobalConfig::default())
    }
}

/// Build the responder's route table.
#[must_use]
pub fn responder_router(settings: ResponderSettings) -> Router {
    let settings = Arc::new(settings);

    Router::new()
        .response(REQUEST_RESPONSE_ROUTE, greet_with_id)
        .channel(CHANNEL_STREAM_ROUTE, shout)
        .fire_and_forget(FIRE_FORGET_ROUTE, log_fire_and_forget)
        .stream(BIDIRECTIONAL_ROUTE, move |request| open_session(&settings, &request))
        .response(ERROR_ROUTE, |_request| async {
            Err::<Value, _>(AppError::Handler(ERROR_MESSAGE.into()))
        })
        .response(AUTH_ROUTE, greet_principal)
        .require_auth(AUTH_ROUTE)
        .on_setup(CONNECT_SETUP_ROUTE, log_connection)
}

async fn greet_with_id(request: Request) -> Result<Value> {
    let id: i64 = request.parse_var("id")?;
    match request.metadata.header(CUSTOM_HEADER) {
        Some(header) => info!(id, header, "received custom header"),
        None => debug!(id, "no custom header"),
    }
    let greeting = format!("Hello {} with id of {id}", request.payload_text());
    info!(id, %greeting, "request-response");
    Ok(Value::String(greeting))
}

fn shout(_request: Request, inbound: InboundStream) -> impl Stream<Item = Result<Value>> {
    inbound.map(|element| {
        let text = payload_text(&element);
        info!(element = %text, "channel element received");
        Ok(Value::String(text.to_uppercase()))
    })
}

async fn log_fire_and_forget(request: Request) {
    info!(payload = %request.payload_text(), "fire-and-forget received");
}

async fn greet_principal(request: Request) -> Result<Value> {
    let principal = request
        .principal
        .ok_or_else(|| AppError::Unauthorized("access denied".into()))?;
    info!(username = %principal.username, "authenticated request");
    Ok(Value::String(format!("Hi there {}", principal.username)))
}

fn log_connection(_setup: &SetupFrame, principal: Option<&Principal>, _peer: &Requester) {
    let name = principal.map_or("anonymous", |p| p.username.as_str());
    info!("Connection established for {name}");
}

/// Start a duplex session answering one bidirectional request.
fn open_session(
    settings: &ResponderSettings,
    request: &Request,
) -> DuplexSession<impl Stream<Item = Result<Value>> + Send + Unpin> {
    let session_id = Uuid::new_v4().to_string();
    let greeting = request.payload_text();
    info!(session_id = %session_id, %greeting, "duplex session requested");

    let replies = {
        let session_id = session_id.clone();
        let mut sequence = 0u64;
        TimedSequence::new(
            move || -> Result<Value> {
                let text = format!("Hello {greeting} @ {}", Utc::now().to_rfc3339());
                let message = Message::new(session_id.clone(), sequence, Value::String(text));
                sequence += 1;
                Ok(serde_json::to_value(message)?)
            },
            settings.reply_interval,
        )
        .limit(settings.reply_limit)
    };

    let watchdog = requester_health(settings, &request.peer, &session_id);
    DuplexSession::new(session_id, replies, watchdog).on_disconnect(request.peer.closed())
}

/// Watch the requester's health over the same connection.
fn requester_health(settings: &ResponderSettings, peer: &Requester, session_id: &str) -> Watchdog {
    let peer = peer.clone();
    let session_id = session_id.to_owned();

    match settings.watchdog_mode {
        WatchdogMode::Subscribe => {
            let retry_after = settings.poll_interval;
            Watchdog::subscribe(async_stream::stream! {
                // Runs until the watchdog takes a stop and drops this stream.
                loop {
                    let opened = peer
                        .request_stream(
                            HEALTH_ROUTE,
                            Metadata::default(),
                            Value::String(session_id.clone()),
                        )
                        .await;
                    match opened {
                        Ok(mut updates) => {
                            while let Some(update) = updates.next().await {
                                yield update.and_then(decode_health);
                            }
                        }
                        Err(err) => {
                            yield Err(err);
                        }
                    }
                    if peer.is_closed() {
                        break;
                    }
                    warn!(
                        session_id = %session_id,
                        "health subscription ended without a stop, resubscribing"
                    );
                    tokio::time::sleep(retry_after).await;
                }
            })
        }
        WatchdogMode::Poll => Watchdog::polling(
            move || {
                let peer = peer.clone();
                let session_id = session_id.clone();
                async move {
                    let state = peer
                        .request_response(
                            HEALTH_POLL_ROUTE,
                            Metadata::default(),
                            Value::String(session_id),
                        )
                        .await?;
                    decode_health(state)
                }
            },
            settings.poll_interval,
        ),
    }
}

fn decode_health(raw: Value) -> Result<HealthState> {
    Ok(serde_json::from_value(raw)?)
}
