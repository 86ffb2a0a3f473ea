//! Fixed-delay value sequence.

use std::future::Future;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use futures_util::Stream;
use tokio::time::{Instant, Sleep};

use crate::Result;

/// Lazily generated values separated by a fixed delay.
///
/// The first value is produced one `interval` after the sequence is first
/// polled, each later value one `interval` after the previous one was
/// handed out. The generator runs only when a tick fires, so a consumer
/// that stops polling (or drops the sequence) stops both the timer and the
/// generator.
///
/// A generator error is yielded once and ends the sequence.
pub struct TimedSequence<G> {
    generator: G,
    interval: Duration,
    sleep: Option<Pin<Box<Sleep>>>,
    remaining: Option<u64>,
    finished: bool,
}

impl<G> TimedSequence<G> {
    /// Unbounded sequence calling `generator` every `interval`.
    #[must_use]
    pub fn new(generator: G, interval: Duration) -> Self {
        Self {
            generator,
            interval,
            sleep: None,
            remaining: None,
            finished: false,
        }
    }

    /// Stop after `limit` values; `None` keeps the sequence unbounded.
    #[must_use]
    pub fn limit(mut self, limit: Option<u64>) -> Self {
        self.remaining = limit;
        self
    }

    /// Stop after `limit` values.
    #[must_use]
    pub fn with_limit(self, limit: u64) -> Self {
        self.limit(Some(limit))
    }

    /// Delay between values.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

/// Counter sequence `0, 1, 2, ...` ticking every `interval`.
#[must_use]
pub fn ticks(interval: Duration) -> TimedSequence<impl FnMut() -> Result<u64> + Send + Unpin> {
    let mut next = 0u64;
    TimedSequence::new(
        move || {
            let tick = next;
            next += 1;
            Ok(tick)
        },
        interval,
    )
}

impl<T, G> Stream for TimedSequence<G>
where
    G: FnMut() -> Result<T> + Unpin,
{
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished || this.remaining == Some(0) {
            return Poll::Ready(None);
        }

        let interval = this.interval;
        let sleep = this
            .sleep
            .get_or_insert_with(|| Box::pin(tokio::time::sleep(interval)));
        ready!(sleep.as_mut().poll(cx));

        match (this.generator)() {
            Ok(value) => {
                if let Some(remaining) = this.remaining.as_mut() {
                    *remaining -= 1;
                }
                sleep.as_mut().reset(Instant::now() + interval);
                Poll::Ready(Some(Ok(value)))
            }
            Err(err) => {
                this.finished = true;
                this.sleep = None;
                Poll::Ready(Some(Err(err)))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.finished {
            return (0, Some(0));
        }
        match self.remaining.map(usize::try_from) {
            Some(Ok(n)) => (0, Some(n)),
            _ => (0, None),
        }
    }
}
