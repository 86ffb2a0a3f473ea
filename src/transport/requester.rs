//! Outbound side of a connection.
//!
//! A [`Requester`] is a cheap, cloneable handle onto one connection. Every
//! interaction allocates a fresh stream id, registers a slot in the
//! connection's stream table, and sends the opening frame through the
//! writer task. Replies are routed back to the slot by the reader task.
//!
//! Dropping a [`ResponseStream`] before it finishes sends `cancel` to the
//! peer, so an abandoned subscription never leaves a producer running on
//! the other side.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::protocol::frame::{Frame, Interaction, Metadata, RequestFrame, StreamId};
use crate::{AppError, Result};

/// Buffered signals per stream before the reader task waits on the consumer.
pub(crate) const STREAM_BUFFER: usize = 32;

/// What the reader task hands to a stream's consumer.
#[derive(Debug)]
pub(crate) enum Signal {
    Next(Value),
    Complete,
    Error(AppError),
}

/// Per-stream routing entry.
#[derive(Debug, Default)]
pub(crate) struct StreamSlot {
    /// Where inbound `next`/`complete`/`error` frames go.
    pub(crate) inbound: Option<mpsc::Sender<Signal>>,
    /// Stops whatever this side is producing on the stream.
    pub(crate) producer: Option<CancellationToken>,
}

/// State shared by a connection's tasks and every [`Requester`] clone.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) outbound: mpsc::Sender<Frame>,
    pub(crate) streams: Mutex<HashMap<StreamId, StreamSlot>>,
    next_id: AtomicU32,
    pub(crate) closed: CancellationToken,
}

impl Shared {
    pub(crate) fn new(
        outbound: mpsc::Sender<Frame>,
        first_id: StreamId,
        closed: CancellationToken,
    ) -> Self {
        Self {
            outbound,
            streams: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(first_id),
            closed,
        }
    }

    pub(crate) fn table(&self) -> std::sync::MutexGuard<'_, HashMap<StreamId, StreamSlot>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn allocate(&self) -> StreamId {
        self.next_id.fetch_add(2, Ordering::Relaxed)
    }

    pub(crate) async fn send(&self, frame: Frame) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(AppError::Disconnected("connection closed".into()));
        }
        self.outbound
            .send(frame)
            .await
            .map_err(|_| AppError::Disconnected("connection closed".into()))
    }

    /// Best-effort send from synchronous contexts such as `Drop`.
    pub(crate) fn send_detached(&self, frame: Frame) {
        match self.outbound.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(frame)) => {
                if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                    let outbound = self.outbound.clone();
                    runtime.spawn(async move {
                        let _ = outbound.send(frame).await;
                    });
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Remove a stream's slot, cancelling any local producer on it.
    pub(crate) fn release(&self, stream_id: StreamId) -> Option<StreamSlot> {
        let slot = self.table().remove(&stream_id);
        if let Some(token) = slot.as_ref().and_then(|s| s.producer.as_ref()) {
            token.cancel();
        }
        slot
    }

    /// Tear down every stream after the connection ends.
    pub(crate) fn shutdown(&self) {
        self.closed.cancel();
        let slots: Vec<StreamSlot> = self.table().drain().map(|(_, slot)| slot).collect();
        for slot in slots {
            if let Some(token) = slot.producer {
                token.cancel();
            }
            // Dropping `slot.inbound` ends each consumer with `Disconnected`.
        }
    }
}

/// Handle for issuing requests to the peer of one connection.
#[derive(Debug, Clone)]
pub struct Requester {
    shared: Arc<Shared>,
}

impl Requester {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Token cancelled when the connection closes for any reason.
    #[must_use]
    pub fn closed(&self) -> CancellationToken {
        self.shared.closed.clone()
    }

    /// Whether the connection has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        self.shared.closed.cancel();
    }

    /// Number of streams currently registered on the connection.
    #[must_use]
    pub fn open_streams(&self) -> usize {
        self.shared.table().len()
    }

    /// Request/response: one request, one reply.
    ///
    /// # Errors
    ///
    /// Returns the peer's error, or `AppError::Disconnected` if the
    /// connection closes first. A peer that completes without a value
    /// yields `Value::Null`.
    pub async fn request_response(
        &self,
        route: &str,
        metadata: Metadata,
        payload: Value,
    ) -> Result<Value> {
        let mut replies = self
            .open(Interaction::RequestResponse, route, metadata, payload)
            .await?;
        match replies.next().await {
            Some(result) => result,
            None => Ok(Value::Null),
        }
    }

    /// Fire-and-forget: one request, no reply.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Disconnected` if the frame cannot be queued.
    pub async fn fire_and_forget(
        &self,
        route: &str,
        metadata: Metadata,
        payload: Value,
    ) -> Result<()> {
        let stream_id = self.shared.allocate();
        debug!(stream_id, route, "fire-and-forget");
        self.shared
            .send(Frame::FireAndForget(RequestFrame {
                stream_id,
                route: route.to_owned(),
                metadata,
                payload,
            }))
            .await
    }

    /// Request/stream: one request, a stream of replies.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Disconnected` if the request cannot be queued.
    pub async fn request_stream(
        &self,
        route: &str,
        metadata: Metadata,
        payload: Value,
    ) -> Result<ResponseStream> {
        self.open(Interaction::RequestStream, route, metadata, payload)
            .await
    }

    /// Request/channel: a stream of requests, a stream of replies.
    ///
    /// The first element of `outbound` travels on the `request_channel`
    /// frame, so the request is only sent once `outbound` yields. The
    /// remaining elements follow as `next` frames and `complete` closes the
    /// outbound half. Dropping the returned stream, or a `cancel` from the
    /// peer, stops the outbound forwarding.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Disconnected` if the connection is already closed.
    pub fn request_channel<S>(
        &self,
        route: &str,
        metadata: Metadata,
        outbound: S,
    ) -> Result<ResponseStream>
    where
        S: Stream<Item = Value> + Send + 'static,
    {
        if self.is_closed() {
            return Err(AppError::Disconnected("connection closed".into()));
        }

        let stream_id = self.shared.allocate();
        let producer = self.shared.closed.child_token();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        self.shared.table().insert(
            stream_id,
            StreamSlot {
                inbound: Some(tx),
                producer: Some(producer.clone()),
            },
        );

        let shared = Arc::clone(&self.shared);
        let route = route.to_owned();
        tokio::spawn(async move {
            let mut outbound = Box::pin(outbound);
            let first = tokio::select! {
                () = producer.cancelled() => return,
                first = outbound.next() => first,
            };
            let exhausted = first.is_none();
            let opened = shared
                .send(Frame::RequestChannel(RequestFrame {
                    stream_id,
                    route,
                    metadata,
                    payload: first.unwrap_or(Value::Null),
                }))
                .await;
            if opened.is_err() {
                return;
            }
            if exhausted {
                let _ = shared.send(Frame::Complete { stream_id }).await;
                return;
            }

            loop {
                tokio::select! {
                    biased;
                    () = producer.cancelled() => {
                        debug!(stream_id, "channel outbound cancelled");
                        break;
                    }
                    item = outbound.next() => {
                        let frame = match item {
                            Some(payload) => Frame::Next { stream_id, payload },
                            None => Frame::Complete { stream_id },
                        };
                        let last = matches!(frame, Frame::Complete { .. });
                        if shared.send(frame).await.is_err() || last {
                            break;
                        }
                    }
                }
            }
        });

        Ok(ResponseStream::new(
            stream_id,
            rx,
            Arc::clone(&self.shared),
            false,
        ))
    }

    async fn open(
        &self,
        interaction: Interaction,
        route: &str,
        metadata: Metadata,
        payload: Value,
    ) -> Result<ResponseStream> {
        let stream_id = self.shared.allocate();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        self.shared.table().insert(
            stream_id,
            StreamSlot {
                inbound: Some(tx),
                producer: None,
            },
        );

        // Built before sending so a failed send still releases the slot.
        let replies = ResponseStream::new(
            stream_id,
            rx,
            Arc::clone(&self.shared),
            interaction == Interaction::RequestResponse,
        );

        debug!(stream_id, route, ?interaction, "opening stream");
        self.shared
            .send(Frame::request(
                interaction,
                RequestFrame {
                    stream_id,
                    route: route.to_owned(),
                    metadata,
                    payload,
                },
            ))
            .await?;

        Ok(replies)
    }
}

/// Replies to a request issued through a [`Requester`].
///
/// Yields `Ok` for each `next`, one `Err` for an `error` frame or a lost
/// connection, and ends on `complete`.
#[derive(Debug)]
pub struct ResponseStream {
    stream_id: StreamId,
    rx: mpsc::Receiver<Signal>,
    shared: Arc<Shared>,
    single: bool,
    done: bool,
}

impl ResponseStream {
    fn new(
        stream_id: StreamId,
        rx: mpsc::Receiver<Signal>,
        shared: Arc<Shared>,
        single: bool,
    ) -> Self {
        Self {
            stream_id,
            rx,
            shared,
            single,
            done: false,
        }
    }

    /// Stream id on the connection.
    #[must_use]
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    fn finish(&mut self) {
        self.done = true;
        self.shared.release(self.stream_id);
    }
}

impl Stream for ResponseStream {
    type Item = Result<Value>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }

        match self.rx.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Signal::Next(value))) => {
                if self.single {
                    self.finish();
                }
                Poll::Ready(Some(Ok(value)))
            }
            Poll::Ready(Some(Signal::Complete)) => {
                self.finish();
                Poll::Ready(None)
            }
            Poll::Ready(Some(Signal::Error(err))) => {
                self.finish();
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                self.finish();
                Poll::Ready(Some(Err(AppError::Disconnected(
                    "connection closed before the stream completed".into(),
                ))))
            }
        }
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.shared.release(self.stream_id);
        if !self.shared.closed.is_cancelled() {
            debug!(stream_id = self.stream_id, "response stream dropped, cancelling");
            self.shared.send_detached(Frame::Cancel {
                stream_id: self.stream_id,
            });
        }
    }
}
