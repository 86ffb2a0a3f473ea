//! NDJSON frame codec.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a maximum line length and
//! decodes each line straight into a [`Frame`]. Use [`FrameCodec`] with
//! [`tokio_util::codec::FramedRead`] and [`tokio_util::codec::FramedWrite`].

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};
use tracing::warn;

use super::frame::Frame;
use crate::{AppError, Result};

/// Maximum line length accepted by the frame codec: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// NDJSON codec producing and consuming [`Frame`]s.
///
/// # Decoder
///
/// Blank lines and lines that are not a valid frame are logged and skipped;
/// one bad frame from a peer does not end the connection. Lines longer than
/// [`MAX_LINE_BYTES`] return [`AppError::Codec`], which the connection
/// treats as fatal because the stream can no longer be resynchronised
/// cheaply.
///
/// # Encoder
///
/// Frames are serialised compactly and terminated by `\n`.
#[derive(Debug)]
pub struct FrameCodec {
    lines: LinesCodec,
}

impl FrameCodec {
    /// Create a codec with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_BYTES)
    }

    /// Create a codec with a custom line limit.
    #[must_use]
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_length),
        }
    }

    fn parse(line: &str) -> Option<Frame> {
        if line.trim().is_empty() {
            return None;
        }
        match serde_json::from_str(line) {
            Ok(frame) => Some(frame),
            Err(err) => {
                warn!(error = %err, raw_line = %line, "skipping malformed frame");
                None
            }
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        while let Some(line) = self.lines.decode(src).map_err(map_codec_error)? {
            if let Some(frame) = Self::parse(&line) {
                return Ok(Some(frame));
            }
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        while let Some(line) = self.lines.decode_eof(src).map_err(map_codec_error)? {
            if let Some(frame) = Self::parse(&line) {
                return Ok(Some(frame));
            }
        }
        Ok(None)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = AppError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<()> {
        let line = serde_json::to_string(&item)?;
        // LinesCodec enforces the limit on decode only.
        self.lines.encode(line, dst).map_err(map_codec_error)
    }
}

fn map_codec_error(e: LinesCodecError) -> AppError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            AppError::Codec("line too long: exceeded frame size limit".into())
        }
        LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
    }
}
