//! Health watchdog: surfaces the first `stopped` verdict, nothing else.
//!
//! A watchdog is fed either by polling a health check on a fixed cadence
//! or by subscribing to a stream of verdicts the peer pushes. Either way a
//! failed observation is logged and skipped; it never ends the watchdog.
//! A watchdog whose source dries up without reporting `stopped` simply
//! never fires.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::stream::{self, BoxStream};
use futures_util::{Stream, StreamExt};
use tracing::{debug, warn};

use super::timed::ticks;
use crate::models::health::HealthState;
use crate::Result;

/// Yields at most one item: the first `stopped` observation.
pub struct Watchdog {
    inner: BoxStream<'static, HealthState>,
}

impl Watchdog {
    /// Call `check` every `interval` until it reports `stopped`.
    ///
    /// `check` may be a remote call. Only one check is in flight at a time;
    /// the next tick is scheduled after the previous check returns.
    pub fn polling<F, Fut>(mut check: F, interval: Duration) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<HealthState>> + Send + 'static,
    {
        let inner = async_stream::stream! {
            let mut ticks = ticks(interval);
            while let Some(Ok(tick)) = ticks.next().await {
                match check().await {
                    Ok(state) if state.is_stopped() => {
                        debug!(tick, "watchdog observed stop");
                        yield state;
                        break;
                    }
                    Ok(_) => debug!(tick, "watchdog: still started"),
                    Err(err) => warn!(tick, %err, "health check failed, skipping poll"),
                }
            }
        };
        Self {
            inner: inner.boxed(),
        }
    }

    /// Watch a pushed stream of verdicts.
    pub fn subscribe<S>(health: S) -> Self
    where
        S: Stream<Item = Result<HealthState>> + Send + 'static,
    {
        let inner = health
            .filter_map(|observed| {
                std::future::ready(match observed {
                    Ok(state) if state.is_stopped() => Some(state),
                    Ok(_) => None,
                    Err(err) => {
                        warn!(%err, "health update failed, ignoring");
                        None
                    }
                })
            })
            .take(1);
        Self {
            inner: inner.boxed(),
        }
    }

    /// A watchdog that never fires.
    #[must_use]
    pub fn never() -> Self {
        Self {
            inner: stream::pending().boxed(),
        }
    }
}

impl Stream for Watchdog {
    type Item = HealthState;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<HealthState>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl std::fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchdog").finish_non_exhaustive()
    }
}
