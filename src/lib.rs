#![forbid(unsafe_code)]

//! Requester/responder pair exchanging duplex sessions over a framed,
//! multiplexed TCP transport, each session ended by the requester's
//! health watchdog.

pub mod auth;
pub mod config;
pub mod duplex;
pub mod errors;
pub mod models;
pub mod probe;
pub mod protocol;
pub mod roles;
pub mod router;
pub mod transport;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
