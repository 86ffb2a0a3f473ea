//! Duplex session coordinator.
//!
//! A [`DuplexSession`] races a reply sequence against a [`Watchdog`] and
//! yields replies until one of these happens:
//!
//! - the watchdog reports `stopped` (closes as [`CloseReason::Stopped`]),
//! - the reply sequence runs out or fails,
//! - the transport disconnects,
//! - a [`SessionHandle`] cancels it, or the session is dropped.
//!
//! Every close drops both the reply sequence and the watchdog, which stops
//! their timers and any in-flight health call. The watchdog is polled
//! before the replies on every wake-up, so a stop signal that is ready at
//! the same instant as a reply always wins and that reply is never handed
//! out.

use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{ready, Context, Poll};

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::watchdog::Watchdog;
use crate::models::session::{CloseReason, SessionStatus};
use crate::Result;

#[derive(Debug)]
struct HandleInner {
    id: String,
    status: AtomicU8,
    reason: OnceLock<CloseReason>,
    cancel: CancellationToken,
}

/// Shared view of one session's lifecycle.
///
/// Cheap to clone; observers may keep it after the session itself is gone.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    inner: Arc<HandleInner>,
}

impl SessionHandle {
    fn new(id: String) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id,
                status: AtomicU8::new(SessionStatus::Open.as_u8()),
                reason: OnceLock::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Session identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Current lifecycle status.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        SessionStatus::from_u8(self.inner.status.load(Ordering::Acquire))
    }

    /// Why the session closed, once it has.
    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.reason.get().copied()
    }

    /// Whether the session has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.status() == SessionStatus::Closed
    }

    /// Ask the session to stop emitting.
    ///
    /// Returns `false`, and does nothing, when the session is already
    /// closed.
    pub fn cancel(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        self.inner.cancel.cancel();
        true
    }

    fn transition(&self, next: SessionStatus) -> bool {
        self.inner
            .status
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                SessionStatus::from_u8(raw)
                    .can_transition_to(next)
                    .then_some(next.as_u8())
            })
            .is_ok()
    }

    /// Record the close reason and move to `Closed`. First caller wins.
    fn finish(&self, reason: CloseReason) -> bool {
        if self.inner.reason.set(reason).is_err() {
            return false;
        }
        self.transition(SessionStatus::Closed);
        true
    }
}

/// Reply sequence gated by a watchdog.
///
/// Implements [`Stream`]: `Ok` items are replies, an `Err` is a reply
/// generator failure (after which the session is closed), and the stream
/// ends when the session closes for any other reason.
pub struct DuplexSession<S> {
    handle: SessionHandle,
    replies: Option<S>,
    watchdog: Option<Watchdog>,
    cancelled: BoxFuture<'static, ()>,
    disconnected: Option<BoxFuture<'static, ()>>,
    delivered: u64,
}

impl<S> DuplexSession<S> {
    /// Open a session racing `replies` against `watchdog`.
    pub fn new(id: impl Into<String>, replies: S, watchdog: Watchdog) -> Self {
        let handle = SessionHandle::new(id.into());
        let cancelled = handle.inner.cancel.clone().cancelled_owned().boxed();
        debug!(session_id = handle.id(), "session opened");
        Self {
            handle,
            replies: Some(replies),
            watchdog: Some(watchdog),
            cancelled,
            disconnected: None,
            delivered: 0,
        }
    }

    /// Close the session as `Disconnected` when `token` is cancelled.
    #[must_use]
    pub fn on_disconnect(mut self, token: CancellationToken) -> Self {
        self.disconnected = Some(token.cancelled_owned().boxed());
        self
    }

    /// Lifecycle handle for this session.
    #[must_use]
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Session identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        self.handle.id()
    }

    /// Replies handed to the consumer so far.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    fn close(&mut self, reason: CloseReason) {
        self.replies = None;
        self.watchdog = None;
        if self.handle.finish(reason) {
            info!(
                session_id = self.handle.id(),
                ?reason,
                delivered = self.delivered,
                "session closed"
            );
        }
    }
}

impl<S, T> Stream for DuplexSession<S>
where
    S: Stream<Item = Result<T>> + Unpin,
{
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.handle.is_closed() {
            return Poll::Ready(None);
        }

        if this.cancelled.poll_unpin(cx).is_ready() {
            this.close(CloseReason::Cancelled);
            return Poll::Ready(None);
        }

        if let Some(disconnected) = this.disconnected.as_mut() {
            if disconnected.poll_unpin(cx).is_ready() {
                this.close(CloseReason::Disconnected);
                return Poll::Ready(None);
            }
        }

        if let Some(watchdog) = this.watchdog.as_mut() {
            match watchdog.poll_next_unpin(cx) {
                Poll::Ready(Some(state)) => {
                    this.handle.transition(SessionStatus::Terminating);
                    debug!(
                        session_id = this.handle.id(),
                        observed_at = %state.observed_at,
                        "stop signal observed"
                    );
                    this.close(CloseReason::Stopped);
                    return Poll::Ready(None);
                }
                Poll::Ready(None) => {
                    debug!(session_id = this.handle.id(), "watchdog ended without a stop");
                    this.watchdog = None;
                }
                Poll::Pending => {}
            }
        }

        let Some(replies) = this.replies.as_mut() else {
            this.close(CloseReason::Completed);
            return Poll::Ready(None);
        };

        match ready!(replies.poll_next_unpin(cx)) {
            Some(Ok(reply)) => {
                this.delivered += 1;
                Poll::Ready(Some(Ok(reply)))
            }
            Some(Err(err)) => {
                warn!(session_id = this.handle.id(), %err, "reply generator failed");
                this.close(CloseReason::Failed);
                Poll::Ready(Some(Err(err)))
            }
            None => {
                this.close(CloseReason::Completed);
                Poll::Ready(None)
            }
        }
    }
}

impl<S> Drop for DuplexSession<S> {
    fn drop(&mut self) {
        if !self.handle.is_closed() {
            self.close(CloseReason::Cancelled);
        }
    }
}

impl<S> std::fmt::Debug for DuplexSession<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplexSession")
            .field("id", &self.handle.id())
            .field("status", &self.handle.status())
            .field("delivered", &self.delivered)
            .finish_non_exhaustive()
    }
}
