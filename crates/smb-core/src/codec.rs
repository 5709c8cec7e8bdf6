//! Envelope framing on a byte stream.
//!
//! The default codec uses header framing:
//! ```text
//! Content-Length: <length>\r\n
//! \r\n
//! <JSON payload>
//! ```

use std::io::{self, BufRead, Read, Write};

use thiserror::Error;

use crate::envelope::Envelope;

const CONTENT_LENGTH: &str = "Content-Length:";
const MAX_HEADER_LINE_BYTES: u64 = 8 * 1024;

/// Encodes envelopes onto, and decodes them from, a byte stream.
///
/// Implementations are shared between the dispatch thread and every writer,
/// so they hold no per-stream state.
pub trait Codec: Send + Sync + 'static {
    /// Writes one envelope as a single frame.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] when encoding fails or the stream rejects the
    /// write.
    fn write_envelope(&self, writer: &mut dyn Write, envelope: &Envelope)
    -> Result<(), CodecError>;

    /// Reads the next envelope.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly between frames.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] when the stream fails or a frame is malformed.
    fn read_envelope(&self, reader: &mut dyn BufRead) -> Result<Option<Envelope>, CodecError>;
}

/// Errors raised while framing envelopes.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The underlying stream failed.
    #[error("stream error: {0}")]
    Io(#[from] io::Error),
    /// A frame header block ended without a `Content-Length` header.
    #[error("frame is missing a Content-Length header")]
    MissingContentLength,
    /// A header line ran past the line limit without a terminator.
    #[error("frame header line exceeds {max} bytes")]
    HeaderLineTooLong {
        /// Longest accepted header line.
        max: u64,
    },
    /// A header line could not be parsed.
    #[error("invalid frame header: {line}")]
    InvalidHeader {
        /// Offending header line.
        line: String,
    },
    /// The frame exceeds the configured size limit.
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge {
        /// Announced or encoded frame size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },
    /// The payload was not a valid envelope.
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),
}

impl CodecError {
    /// Whether the error came from the stream rather than the frame contents.
    #[must_use]
    pub const fn is_io(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

/// JSON envelopes behind a `Content-Length` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramedJsonCodec {
    max_frame_bytes: usize,
}

impl FramedJsonCodec {
    /// Builds a codec that rejects frames above `max_frame_bytes`.
    #[must_use]
    pub const fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }

    /// Configured frame size limit.
    #[must_use]
    pub const fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    const fn check_size(&self, size: usize) -> Result<(), CodecError> {
        if size > self.max_frame_bytes {
            return Err(CodecError::FrameTooLarge {
                size,
                max: self.max_frame_bytes,
            });
        }
        Ok(())
    }

    /// Reads header lines up to the blank separator.
    ///
    /// Returns `Ok(None)` when the stream ends before any header byte. Each
    /// line is read through a bounded window so a peer cannot grow the
    /// buffer before a length has been announced.
    fn read_headers(&self, reader: &mut dyn BufRead) -> Result<Option<usize>, CodecError> {
        let mut content_length: Option<usize> = None;
        let mut seen_header = false;

        loop {
            let mut line = String::new();
            let bytes_read = (&mut *reader)
                .take(MAX_HEADER_LINE_BYTES)
                .read_line(&mut line)?;
            if bytes_read == 0 {
                if seen_header {
                    return Err(CodecError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed while reading frame headers",
                    )));
                }
                return Ok(None);
            }
            seen_header = true;
            if !line.ends_with('\n')
                && u64::try_from(bytes_read).is_ok_and(|read| read >= MAX_HEADER_LINE_BYTES)
            {
                return Err(CodecError::HeaderLineTooLong {
                    max: MAX_HEADER_LINE_BYTES,
                });
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                break;
            }

            if let Some(value) = trimmed.strip_prefix(CONTENT_LENGTH) {
                let length = value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| CodecError::InvalidHeader {
                        line: trimmed.to_owned(),
                    })?;
                self.check_size(length)?;
                content_length = Some(length);
            }
        }

        content_length
            .map(Some)
            .ok_or(CodecError::MissingContentLength)
    }
}

impl Default for FramedJsonCodec {
    fn default() -> Self {
        Self::new(smb_config::DEFAULT_MAX_FRAME_BYTES)
    }
}

impl Codec for FramedJsonCodec {
    fn write_envelope(
        &self,
        writer: &mut dyn Write,
        envelope: &Envelope,
    ) -> Result<(), CodecError> {
        let payload = serde_json::to_vec(envelope)?;
        self.check_size(payload.len())?;
        let header = format!("{CONTENT_LENGTH} {}\r\n\r\n", payload.len());
        writer.write_all(header.as_bytes())?;
        writer.write_all(&payload)?;
        Ok(())
    }

    fn read_envelope(&self, reader: &mut dyn BufRead) -> Result<Option<Envelope>, CodecError> {
        let Some(length) = self.read_headers(reader)? else {
            return Ok(None);
        };
        let mut payload = vec![0_u8; length];
        reader.read_exact(&mut payload)?;
        let envelope = serde_json::from_slice(&payload)?;
        Ok(Some(envelope))
    }
}
