//! TCP accept loop.
//!
//! Every accepted socket becomes an [`Side::Acceptor`] connection serving
//! the shared [`ConnectionContext`]. Connections are children of the
//! server's cancellation token, so cancelling the server closes them all.

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::connection::{spawn_connection, ConnectionContext, Side};
use crate::{AppError, Result};

/// Bind a listener on `addr`.
///
/// # Errors
///
/// Returns `AppError::Transport` if the address cannot be bound.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|err| AppError::Transport(format!("failed to bind {addr}: {err}")))
}

/// Spawn the accept loop on an already bound listener.
pub fn spawn_server(
    listener: TcpListener,
    ctx: ConnectionContext,
    ct: CancellationToken,
) -> JoinHandle<()> {
    let local = listener
        .local_addr()
        .map_or_else(|_| "unknown".to_owned(), |addr| addr.to_string());
    info!(addr = %local, "responder listening");

    tokio::spawn(
        async move {
            loop {
                tokio::select! {
                    () = ct.cancelled() => {
                        info!("server shutting down");
                        break;
                    }
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                if let Err(err) = stream.set_nodelay(true) {
                                    debug!(%peer, %err, "failed to set TCP_NODELAY");
                                }
                                info!(%peer, "connection accepted");
                                let requester =
                                    spawn_connection(stream, Side::Acceptor, ctx.clone(), &ct);
                                let closed = requester.closed();
                                tokio::spawn(async move {
                                    closed.cancelled().await;
                                    info!(%peer, "connection closed");
                                });
                            }
                            Err(err) => warn!(%err, "accept failed"),
                        }
                    }
                }
            }
        }
        .instrument(info_span!("server", addr = %local)),
    )
}
