//! Connection driver: reader task, writer task, and inbound dispatch.
//!
//! # Frame routing
//!
//! | Inbound frame        | Action                                              |
//! |----------------------|-----------------------------------------------------|
//! | `setup`              | resolve connection principal, run setup callback    |
//! | `request_*`          | resolve route, spawn a task running the handler     |
//! | `next`               | forward to the stream's consumer (awaits capacity)  |
//! | `complete`/`error`   | forward, then drop the stream's inbound half        |
//! | `cancel`             | stop this side's producer for the stream            |
//!
//! When the reader sees EOF or an unrecoverable error, every producer on
//! the connection is cancelled and every pending consumer ends with
//! [`AppError::Disconnected`].

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::requester::{Requester, Shared, Signal, StreamSlot, STREAM_BUFFER};
use crate::auth::{Principal, UserStore};
use crate::protocol::codec::FrameCodec;
use crate::protocol::frame::{
    ErrorCode, Frame, Interaction, RequestFrame, SetupFrame, StreamId, CONNECTION_STREAM_ID,
};
use crate::router::{InboundStream, Invocation, ReplyStream, Request, Router};
use crate::{AppError, Result};

/// Outbound frames buffered before senders wait on the writer.
const OUTBOUND_BUFFER: usize = 256;

/// Which end of the connection this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Opened the connection; allocates odd stream ids and sends `setup`.
    Connector,
    /// Accepted the connection; allocates even stream ids.
    Acceptor,
}

impl Side {
    fn first_stream_id(self) -> StreamId {
        match self {
            Self::Connector => 1,
            Self::Acceptor => 2,
        }
    }

    /// Whether `stream_id` was allocated by the peer.
    fn is_peer_stream(self, stream_id: StreamId) -> bool {
        stream_id != CONNECTION_STREAM_ID
            && (stream_id % 2 == 1) == matches!(self, Self::Acceptor)
    }
}

/// What a connection serves to its peer.
#[derive(Clone, Default)]
pub struct ConnectionContext {
    /// Routes the peer may call.
    pub router: Arc<Router>,
    /// Accounts for resolving credentials; `None` rejects any credentials.
    pub users: Option<Arc<UserStore>>,
}

impl ConnectionContext {
    /// Context serving `router` without authentication.
    #[must_use]
    pub fn new(router: Router) -> Self {
        Self {
            router: Arc::new(router),
            users: None,
        }
    }

    /// Attach an account store.
    #[must_use]
    pub fn with_users(mut self, users: UserStore) -> Self {
        self.users = Some(Arc::new(users));
        self
    }

    fn authenticate(&self, credentials: &crate::auth::Credentials) -> Result<Principal> {
        match self.users {
            Some(ref users) => users.authenticate(credentials),
            None => Err(AppError::Unauthorized(
                "authentication is not configured".into(),
            )),
        }
    }
}

/// Start the reader and writer tasks for an established byte stream.
///
/// The connection lives until the peer disconnects, an unrecoverable
/// error occurs, [`Requester::close`] is called, or `parent` is cancelled.
pub fn spawn_connection<S>(
    io: S,
    side: Side,
    ctx: ConnectionContext,
    parent: &CancellationToken,
) -> Requester
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(io);
    let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
    let closed = parent.child_token();
    let shared = Arc::new(Shared::new(tx, side.first_stream_id(), closed.clone()));

    tokio::spawn(
        run_writer(writer, rx, closed.clone()).instrument(info_span!("conn_writer", ?side)),
    );
    tokio::spawn(
        run_reader(reader, side, ctx, Arc::clone(&shared))
            .instrument(info_span!("conn_reader", ?side)),
    );

    Requester::new(shared)
}

/// Connect to `addr`, send `setup`, and start serving `ctx` to the peer.
///
/// # Errors
///
/// Returns `AppError::Transport` if the TCP connection fails, or
/// `AppError::Disconnected` if `setup` cannot be queued.
pub async fn connect(
    addr: SocketAddr,
    setup: SetupFrame,
    ctx: ConnectionContext,
    parent: &CancellationToken,
) -> Result<Requester> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|err| AppError::Transport(format!("failed to connect to {addr}: {err}")))?;
    if let Err(err) = stream.set_nodelay(true) {
        debug!(%addr, %err, "failed to set TCP_NODELAY");
    }
    info!(%addr, "connected");

    let requester = spawn_connection(stream, Side::Connector, ctx, parent);
    requester.shared().send(Frame::Setup(setup)).await?;
    Ok(requester)
}

/// Writer task: serialises queued frames onto the socket.
///
/// Queued frames are flushed before the task honours cancellation, so an
/// `error` frame sent right before closing still reaches the peer.
async fn run_writer<W>(writer: W, mut rx: mpsc::Receiver<Frame>, closed: CancellationToken)
where
    W: AsyncWrite + Send,
{
    let mut framed = Box::pin(FramedWrite::new(writer, FrameCodec::new()));

    loop {
        tokio::select! {
            biased;

            frame = rx.recv() => {
                let Some(frame) = frame else {
                    debug!("outbound channel closed, stopping writer");
                    break;
                };
                if let Err(err) = framed.send(frame).await {
                    warn!(%err, "write failed, closing connection");
                    closed.cancel();
                    break;
                }
            }

            () = closed.cancelled() => {
                debug!("connection closed, stopping writer");
                break;
            }
        }
    }

    let _ = framed.close().await;
}

/// Reader task: decodes frames and routes them until the connection ends.
async fn run_reader<R>(reader: R, side: Side, ctx: ConnectionContext, shared: Arc<Shared>)
where
    R: AsyncRead + Send,
{
    let mut framed = Box::pin(FramedRead::new(reader, FrameCodec::new()));
    let mut dispatcher = Dispatcher {
        side,
        ctx,
        shared: Arc::clone(&shared),
        principal: None,
        setup_seen: false,
    };

    loop {
        tokio::select! {
            biased;

            () = shared.closed.cancelled() => {
                debug!("connection closed locally");
                break;
            }

            item = framed.next() => {
                match item {
                    None => {
                        info!("peer disconnected");
                        break;
                    }
                    Some(Err(err)) => {
                        warn!(%err, "read failed, closing connection");
                        break;
                    }
                    Some(Ok(frame)) => {
                        if let Err(err) = dispatcher.handle(frame).await {
                            warn!(%err, "protocol violation, closing connection");
                            break;
                        }
                    }
                }
            }
        }
    }

    shared.shutdown();
}

/// Per-connection inbound state owned by the reader task.
struct Dispatcher {
    side: Side,
    ctx: ConnectionContext,
    shared: Arc<Shared>,
    principal: Option<Principal>,
    setup_seen: bool,
}

impl Dispatcher {
    async fn handle(&mut self, frame: Frame) -> Result<()> {
        let first = !self.setup_seen;
        self.setup_seen = true;

        match frame {
            Frame::Setup(setup) => self.handle_setup(&setup, first).await,
            Frame::Next { stream_id, payload } => {
                self.forward(stream_id, Signal::Next(payload), false).await;
                Ok(())
            }
            Frame::Complete { stream_id } => {
                self.forward(stream_id, Signal::Complete, true).await;
                Ok(())
            }
            Frame::Error {
                stream_id: CONNECTION_STREAM_ID,
                code,
                message,
            } => Err(code.into_error(message)),
            Frame::Error {
                stream_id,
                code,
                message,
            } => {
                self.forward(stream_id, Signal::Error(code.into_error(message)), true)
                    .await;
                Ok(())
            }
            Frame::Cancel { stream_id } => {
                let token = self
                    .shared
                    .table()
                    .get(&stream_id)
                    .and_then(|slot| slot.producer.clone());
                match token {
                    Some(token) => {
                        debug!(stream_id, "peer cancelled stream");
                        token.cancel();
                    }
                    None => debug!(stream_id, "cancel for unknown stream ignored"),
                }
                Ok(())
            }
            request => {
                if let Some((interaction, body)) = request.into_request() {
                    self.handle_request(interaction, body).await;
                }
                Ok(())
            }
        }
    }

    async fn handle_setup(&mut self, setup: &SetupFrame, first: bool) -> Result<()> {
        if self.side == Side::Connector || !first {
            let err = AppError::Transport("unexpected setup frame".into());
            let _ = self.shared.send(Frame::error(CONNECTION_STREAM_ID, &err)).await;
            return Err(err);
        }

        if let Some(ref credentials) = setup.metadata.auth {
            match self.ctx.authenticate(credentials) {
                Ok(principal) => {
                    info!(username = %principal.username, "setup authenticated");
                    self.principal = Some(principal);
                }
                Err(err) => {
                    warn!(username = %credentials.username, "setup rejected");
                    let _ = self.shared.send(Frame::error(CONNECTION_STREAM_ID, &err)).await;
                    return Err(err);
                }
            }
        }

        if let Some(ref route) = setup.route {
            match self.ctx.router.setup_handler(route) {
                Some(handler) => {
                    let peer = Requester::new(Arc::clone(&self.shared));
                    handler(setup, self.principal.as_ref(), &peer);
                }
                None => debug!(route, "no setup handler registered"),
            }
        }

        Ok(())
    }

    /// Hand a signal to the stream's consumer.
    ///
    /// Awaits channel capacity, so a slow consumer stalls this reader and,
    /// through it, the peer's writes.
    async fn forward(&self, stream_id: StreamId, signal: Signal, terminal: bool) {
        let sender = {
            let mut table = self.shared.table();
            let sender = if terminal {
                table.get_mut(&stream_id).and_then(|slot| slot.inbound.take())
            } else {
                table.get(&stream_id).and_then(|slot| slot.inbound.clone())
            };
            if terminal
                && table
                    .get(&stream_id)
                    .is_some_and(|slot| slot.inbound.is_none() && slot.producer.is_none())
            {
                table.remove(&stream_id);
            }
            sender
        };

        match sender {
            Some(sender) => {
                if sender.send(signal).await.is_err() {
                    debug!(stream_id, "consumer gone, dropping frame");
                }
            }
            None => debug!(stream_id, "frame for unknown stream ignored"),
        }
    }

    async fn handle_request(&mut self, interaction: Interaction, body: RequestFrame) {
        let stream_id = body.stream_id;
        let replies_expected = interaction != Interaction::FireAndForget;

        if !self.side.is_peer_stream(stream_id) || self.shared.table().contains_key(&stream_id) {
            warn!(stream_id, "invalid or duplicate stream id");
            if replies_expected {
                let err = AppError::Route(format!("invalid stream id {stream_id}"));
                let _ = self.shared.send(Frame::error(stream_id, &err)).await;
            }
            return;
        }

        match self.prepare(interaction, body) {
            Ok(prepared) => prepared.spawn(),
            Err(err) => {
                warn!(stream_id, %err, "request refused");
                if replies_expected {
                    let _ = self.shared.send(Frame::error(stream_id, &err)).await;
                }
            }
        }
    }

    /// Resolve route and principal, register the stream, and invoke the handler.
    fn prepare(&self, interaction: Interaction, body: RequestFrame) -> Result<Prepared> {
        let RequestFrame {
            stream_id,
            route,
            metadata,
            payload,
        } = body;

        let resolved = self.ctx.router.resolve(&route)?;

        let principal = match metadata.auth {
            Some(ref credentials) => Some(self.ctx.authenticate(credentials)?),
            None => self.principal.clone(),
        };
        if resolved.requires_auth && principal.is_none() {
            return Err(AppError::Unauthorized("access denied".into()));
        }

        // Fire-and-forget work outlives the connection that delivered it.
        let producer = if interaction == Interaction::FireAndForget {
            CancellationToken::new()
        } else {
            self.shared.closed.child_token()
        };
        let inbound = if interaction == Interaction::FireAndForget {
            None
        } else {
            let (tx, rx) = if interaction == Interaction::RequestChannel {
                let (tx, rx) = mpsc::channel(STREAM_BUFFER);
                (Some(tx), Some(rx))
            } else {
                (None, None)
            };
            self.shared.table().insert(
                stream_id,
                StreamSlot {
                    inbound: tx,
                    producer: Some(producer.clone()),
                },
            );
            rx.map(|rx| inbound_stream(payload.clone(), rx))
        };

        let request = Request {
            stream_id,
            interaction,
            route: route.clone(),
            vars: resolved.vars,
            metadata,
            payload,
            principal,
            peer: Requester::new(Arc::clone(&self.shared)),
        };

        Ok(Prepared {
            stream_id,
            interaction,
            route,
            invocation: resolved.handler.invoke(request, inbound),
            producer,
            shared: Arc::clone(&self.shared),
        })
    }
}

/// Elements the peer sends on a channel, starting with the request payload.
fn inbound_stream(first: Value, rx: mpsc::Receiver<Signal>) -> InboundStream {
    let rest = futures_util::stream::unfold(rx, |mut rx| async move {
        match rx.recv().await {
            Some(Signal::Next(value)) => Some((value, rx)),
            Some(Signal::Error(err)) => {
                warn!(%err, "channel inbound failed");
                None
            }
            Some(Signal::Complete) | None => None,
        }
    });
    futures_util::stream::once(std::future::ready(first))
        .chain(rest)
        .boxed()
}

/// A resolved request ready to run.
struct Prepared {
    stream_id: StreamId,
    interaction: Interaction,
    route: String,
    invocation: Invocation,
    producer: CancellationToken,
    shared: Arc<Shared>,
}

impl Prepared {
    fn spawn(self) {
        let span = info_span!(
            "request",
            stream_id = self.stream_id,
            route = %self.route,
            interaction = ?self.interaction
        );
        tokio::spawn(self.run().instrument(span));
    }

    async fn run(self) {
        let Self {
            stream_id,
            interaction,
            invocation,
            producer,
            shared,
            ..
        } = self;

        match (interaction, invocation) {
            (Interaction::FireAndForget, Invocation::Detached(work)) => {
                tokio::select! {
                    () = producer.cancelled() => {}
                    () = work => {}
                }
            }
            (Interaction::FireAndForget, Invocation::Replies(replies)) => {
                drain(replies, &producer).await;
            }
            (_, Invocation::Detached(work)) => {
                tokio::select! {
                    () = producer.cancelled() => {}
                    () = work => {
                        let _ = shared.send(Frame::Complete { stream_id }).await;
                    }
                }
                shared.release(stream_id);
            }
            (Interaction::RequestResponse, Invocation::Replies(replies)) => {
                emit(stream_id, replies, &producer, &shared, Some(1)).await;
                shared.release(stream_id);
            }
            (_, Invocation::Replies(replies)) => {
                emit(stream_id, replies, &producer, &shared, None).await;
                // Tell the peer to stop feeding a channel we no longer read.
                let still_reading = shared
                    .release(stream_id)
                    .is_some_and(|slot| slot.inbound.is_some());
                if still_reading && !shared.closed.is_cancelled() {
                    let _ = shared.send(Frame::Cancel { stream_id }).await;
                }
            }
        }
    }
}

/// Forward replies to the peer until exhausted, failed, limited, or cancelled.
async fn emit(
    stream_id: StreamId,
    mut replies: ReplyStream,
    producer: &CancellationToken,
    shared: &Shared,
    limit: Option<usize>,
) {
    let mut sent = 0usize;

    loop {
        if limit.is_some_and(|limit| sent >= limit) {
            let _ = shared.send(Frame::Complete { stream_id }).await;
            return;
        }

        let item = tokio::select! {
            biased;
            () = producer.cancelled() => {
                debug!(stream_id, "producer cancelled");
                return;
            }
            item = replies.next() => item,
        };

        let frame = match item {
            Some(Ok(payload)) => Frame::Next { stream_id, payload },
            Some(Err(err)) => {
                error!(stream_id, %err, "handler failed");
                if shared.send(Frame::error(stream_id, &err)).await.is_err() {
                    debug!(stream_id, "connection closed before error was sent");
                }
                return;
            }
            None => {
                let _ = shared.send(Frame::Complete { stream_id }).await;
                return;
            }
        };

        if shared.send(frame).await.is_err() {
            return;
        }
        sent += 1;
    }
}

/// Run a reply stream to completion for a fire-and-forget caller.
async fn drain(mut replies: ReplyStream, producer: &CancellationToken) {
    loop {
        tokio::select! {
            biased;
            () = producer.cancelled() => return,
            item = replies.next() => match item {
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    error!(%err, "fire-and-forget handler failed");
                    return;
                }
                None => return,
            },
        }
    }
}
