//! Domain model module declarations.

pub mod health;
pub mod message;
pub mod session;
