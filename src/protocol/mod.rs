//! Wire protocol for the duplex transport.
//!
//! Frames are single-line JSON objects separated by `\n`. Both peers speak
//! the same protocol; either may open streams on the other.
//!
//! - `frame`: frame, metadata and error-code types.
//! - `codec`: [`LinesCodec`](tokio_util::codec::LinesCodec)-based framing that
//!   decodes straight into [`Frame`](frame::Frame) values.

pub mod codec;
pub mod frame;
