//! Framed, multiplexed duplex transport over TCP.
//!
//! Each connection owns a reader task that dispatches inbound frames and a
//! writer task that serialises outbound ones. Both peers are symmetric:
//! the connecting side serves a route table too, so the accepting side can
//! call back into it on the same connection.
//!
//! - `connection`: reader/writer tasks, inbound request dispatch, `connect`.
//! - `requester`: cloneable handle for issuing the four interaction kinds.
//! - `server`: accept loop.

pub mod connection;
pub mod requester;
pub mod server;

pub use connection::{connect, spawn_connection, ConnectionContext, Side};
pub use requester::{Requester, ResponseStream};
