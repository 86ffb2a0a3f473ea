//! Initiator side: health routes and the requester's operations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::{
    AUTH_ROUTE, BIDIRECTIONAL_ROUTE, CHANNEL_STREAM_ROUTE, CUSTOM_HEADER, ERROR_ROUTE,
    FIRE_FORGET_ROUTE, HEALTH_POLL_ROUTE, HEALTH_ROUTE,
};
use crate::auth::Credentials;
use crate::config::GlobalConfig;
use crate::duplex::{ticks, TimedSequence};
use crate::models::health::HealthState;
use crate::models::message::Message;
use crate::protocol::frame::Metadata;
use crate::router::{payload_text, Router};
use crate::transport::Requester;
use crate::{AppError, Result};

/// Substituted for the `error` route's failure.
pub const ERROR_FALLBACK: &str = "error returned from service";

/// Idle window after which an unobserved session is evicted.
pub const DEFAULT_EVICT_AFTER: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
struct Tracked {
    started: Instant,
    last_seen: Instant,
}

/// Process-local health source.
///
/// Reports `stopped` once `stop_after` has elapsed since a session was
/// first observed. Sessions are keyed by id, so a resubscription or a
/// switch to polling keeps the original clock. A session is forgotten
/// once it has been told to stop, or once nothing has observed it for
/// the eviction window.
#[derive(Debug)]
pub struct HealthMonitor {
    stop_after: Duration,
    evict_after: Duration,
    sessions: Mutex<HashMap<String, Tracked>>,
}

impl HealthMonitor {
    /// Monitor stopping sessions after `stop_after`.
    #[must_use]
    pub fn new(stop_after: Duration) -> Self {
        Self {
            stop_after,
            evict_after: DEFAULT_EVICT_AFTER,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Evict sessions not observed within `idle`.
    #[must_use]
    pub fn evict_after(mut self, idle: Duration) -> Self {
        self.evict_after = idle;
        self
    }

    /// Verdict for a session first observed at `started`.
    ///
    /// `stopped` once the elapsed time reaches `stop_after`.
    #[must_use]
    pub fn evaluate(&self, started: Instant) -> HealthState {
        if started.elapsed() >= self.stop_after {
            HealthState::stopped()
        } else {
            HealthState::started()
        }
    }

    /// Lock the session table, dropping idle entries first.
    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Tracked>> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        sessions.retain(|session_id, tracked| {
            let live = now.duration_since(tracked.last_seen) < self.evict_after;
            if !live {
                debug!(session_id = %session_id, "evicting idle health session");
            }
            live
        });
        sessions
    }

    /// Start the clock for `session_id` unless it is already running.
    pub fn track(&self, session_id: &str) {
        let now = Instant::now();
        self.sessions()
            .entry(session_id.to_owned())
            .and_modify(|tracked| tracked.last_seen = now)
            .or_insert(Tracked {
                started: now,
                last_seen: now,
            });
    }

    /// Verdict for one observation of `session_id`.
    #[must_use]
    pub fn poll(&self, session_id: &str) -> HealthState {
        let now = Instant::now();
        let mut sessions = self.sessions();
        let tracked = sessions
            .entry(session_id.to_owned())
            .or_insert(Tracked {
                started: now,
                last_seen: now,
            });
        tracked.last_seen = now;
        let state = self.evaluate(tracked.started);
        if state.is_stopped() {
            sessions.remove(session_id);
        }
        state
    }

    /// Sessions currently being observed.
    #[must_use]
    pub fn tracked_sessions(&self) -> usize {
        self.sessions().len()
    }

    /// One verdict for `session_id` per `interval`.
    #[must_use]
    pub fn watch(
        self: &Arc<Self>,
        session_id: &str,
        interval: Duration,
    ) -> impl Stream<Item = Result<HealthState>> {
        let monitor = Arc::clone(self);
        let session_id = session_id.to_owned();
        monitor.track(&session_id);
        TimedSequence::new(
            move || -> Result<HealthState> { Ok(monitor.poll(&session_id)) },
            interval,
        )
    }
}

/// Build the initiator's route table.
#[must_use]
pub fn initiator_router(monitor: Arc<HealthMonitor>, interval: Duration) -> Router {
    let polled = Arc::clone(&monitor);

    Router::new()
        .stream(HEALTH_ROUTE, move |request| {
            let session_id = request.payload_text();
            info!(session_id = %session_id, "health subscription opened");
            monitor
                .watch(&session_id, interval)
                .map(|state| -> Result<Value> { Ok(serde_json::to_value(state?)?) })
        })
        .response(HEALTH_POLL_ROUTE, move |request| {
            let session_id = request.payload_text();
            let state = polled.poll(&session_id);
            debug!(session_id = %session_id, state = ?state.state, "health polled");
            std::future::ready(serde_json::to_value(state).map_err(AppError::from))
        })
}

/// Requester-side tunables.
#[derive(Debug, Clone)]
pub struct InitiatorSettings {
    /// Elements sent on the channel stream.
    pub stream_length: u64,
    /// Delay between channel stream elements.
    pub stream_interval: Duration,
    /// Duplex clients launched by [`Initiator::launch_clients`].
    pub client_count: u32,
    /// Delay between client launches.
    pub client_launch_interval: Duration,
}

impl InitiatorSettings {
    /// Settings taken from the loaded configuration.
    #[must_use]
    pub fn from_config(config: &GlobalConfig) -> Self {
        Self {
            stream_length: config.channel.stream_length,
            stream_interval: config.reply_interval(),
            client_count: config.channel.client_count,
            client_launch_interval: config.client_launch_interval(),
        }
    }
}

impl Default for InitiatorSettings {
    fn default() -> Self {
        Self::from_config(&GlobalConfig::default())
    }
}

/// Drives every interaction against a connected responder.
#[derive(Debug, Clone)]
pub struct Initiator {
    peer: Requester,
    settings: InitiatorSettings,
}

impl Initiator {
    /// Wrap a connection to the responder.
    #[must_use]
    pub fn new(peer: Requester, settings: InitiatorSettings) -> Self {
        Self { peer, settings }
    }

    /// The underlying connection.
    #[must_use]
    pub fn peer(&self) -> &Requester {
        &self.peer
    }

    /// Request/response against `responder-request-response.{id}`.
    ///
    /// # Errors
    ///
    /// Returns the responder's error or a transport error.
    pub async fn request_response(&self, id: i64, payload: &str) -> Result<String> {
        let metadata = Metadata::default().with_header(CUSTOM_HEADER, Uuid::new_v4().to_string());
        let reply = self
            .peer
            .request_response(
                &format!("responder-request-response.{id}"),
                metadata,
                Value::String(payload.to_owned()),
            )
            .await?;
        Ok(payload_text(&reply))
    }

    /// Call the authenticated `auth` route with `credentials` in metadata.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Unauthorized` when the responder rejects them.
    pub async fn authenticate(&self, credentials: Credentials) -> Result<String> {
        let reply = self
            .peer
            .request_response(AUTH_ROUTE, Metadata::default().with_auth(credentials), Value::Null)
            .await?;
        Ok(payload_text(&reply))
    }

    /// Send a random id to the fire-and-forget route; returns the id sent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Disconnected` if the connection is gone.
    pub async fn fire_and_forget(&self) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        self.peer
            .fire_and_forget(
                FIRE_FORGET_ROUTE,
                Metadata::default(),
                Value::String(id.clone()),
            )
            .await?;
        Ok(id)
    }

    /// Stream random ids through the upper-casing channel.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Disconnected` if the connection is gone.
    pub fn channel_stream(&self) -> Result<impl Stream<Item = Result<String>>> {
        let outbound = TimedSequence::new(
            || -> Result<Value> { Ok(Value::String(Uuid::new_v4().to_string())) },
            self.settings.stream_interval,
        )
        .with_limit(self.settings.stream_length)
        .filter_map(|id: Result<Value>| std::future::ready(id.ok()));

        let replies = self
            .peer
            .request_channel(CHANNEL_STREAM_ROUTE, Metadata::default(), outbound)?;
        Ok(replies.map(|reply| reply.map(|value| payload_text(&value))))
    }

    /// Open one duplex session greeting as `Client #<client_id>`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Disconnected` if the connection is gone.
    pub async fn greetings(&self, client_id: u32) -> Result<impl Stream<Item = Result<Message>>> {
        let replies = self
            .peer
            .request_stream(
                BIDIRECTIONAL_ROUTE,
                Metadata::default(),
                Value::String(format!("Client #{client_id}")),
            )
            .await?;
        Ok(replies.map(|reply| -> Result<Message> { Ok(serde_json::from_value(reply?)?) }))
    }

    /// Launch the configured number of duplex clients, one per launch
    /// interval, merging their replies.
    ///
    /// Dropping the returned stream cancels every client.
    pub fn launch_clients(&self) -> impl Stream<Item = (u32, Result<Message>)> {
        let (tx, mut rx) = mpsc::channel(32);
        let initiator = self.clone();

        tokio::spawn(
            async move {
                let mut launches = ticks(initiator.settings.client_launch_interval);
                for client_id in 1..=initiator.settings.client_count {
                    if client_id > 1 {
                        tokio::select! {
                            () = tx.closed() => return,
                            _ = launches.next() => {}
                        }
                    }
                    info!(client_id, "launching client");
                    let client = initiator.clone();
                    let tx = tx.clone();
                    tokio::spawn(
                        async move {
                            let mut replies = match client.greetings(client_id).await {
                                Ok(replies) => Box::pin(replies),
                                Err(err) => {
                                    let _ = tx.send((client_id, Err(err))).await;
                                    return;
                                }
                            };
                            while let Some(reply) = replies.next().await {
                                if tx.send((client_id, reply)).await.is_err() {
                                    debug!(client_id, "consumer gone, cancelling client");
                                    return;
                                }
                            }
                            info!(client_id, "client session closed");
                        }
                        .instrument(info_span!("client", client_id)),
                    );
                }
            }
            .instrument(info_span!("launcher")),
        );

        async_stream::stream! {
            while let Some(item) = rx.recv().await {
                yield item;
            }
        }
    }

    /// Call the failing route, substituting [`ERROR_FALLBACK`].
    pub async fn error_with_fallback(&self) -> String {
        match self
            .peer
            .request_response(ERROR_ROUTE, Metadata::default(), Value::Null)
            .await
        {
            Ok(reply) => payload_text(&reply),
            Err(err) => {
                warn!(%err, "error route failed, using fallback");
                ERROR_FALLBACK.to_owned()
            }
        }
    }
}
