//! Duplex-session-with-watchdog primitive.
//!
//! - [`timed`]: fixed-delay value sequences.
//! - [`watchdog`]: reduces a health source to its first `stopped` verdict.
//! - [`session`]: races replies against the watchdog.

pub mod session;
pub mod timed;
pub mod watchdog;

pub use session::{DuplexSession, SessionHandle};
pub use timed::{ticks, TimedSequence};
pub use watchdog::Watchdog;
