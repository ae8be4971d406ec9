//! Frame codec for the Hub wire protocol.
//!
//! Frame format:
//! ```text
//! Content-Length: <N>\r\n
//! \r\n
//! <N bytes of UTF-8 JSON>
//! ```
//! Only `Content-Length` is interpreted; any other header lines are ignored.
//! Malformed input never ends the stream:
//! - a header block without a parseable length is discarded up to and
//!   including its blank-line separator
//! - a header that declares more than the frame cap is discarded together
//!   with the body bytes it announces
//! - a header block that grows past [`MAX_HEADER_BYTES`] without a separator
//!   is discarded up to the next separator

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Blank line separating the header block from the body.
pub const HEADER_SEPARATOR: &[u8] = b"\r\n\r\n";

/// Default cap on a single payload (16 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Cap on a header block, separator excluded.
pub const MAX_HEADER_BYTES: usize = 8 * 1024;

/// Stateful `Content-Length` framing codec.
///
/// Used with `FramedRead`/`FramedWrite`: the decoder accumulates partial input
/// in the framed buffer and yields one payload per complete frame.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_bytes: usize,
    /// Body bytes of a rejected frame still to be dropped.
    skip_body: usize,
    /// Prefix of the buffer already searched for a separator.
    scanned: usize,
    /// Inside an overlong header block; drop everything up to its separator.
    discarding_header: bool,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_frame_bytes(DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            skip_body: 0,
            scanned: 0,
            discarding_header: false,
        }
    }

    fn reset(&mut self) {
        self.skip_body = 0;
        self.scanned = 0;
        self.discarding_header = false;
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> std::io::Result<Option<Bytes>> {
        loop {
            if self.skip_body > 0 {
                let n = self.skip_body.min(src.len());
                src.advance(n);
                self.skip_body -= n;
                if self.skip_body > 0 {
                    return Ok(None);
                }
            }

            // A separator may straddle the previous scan boundary.
            let from = self
                .scanned
                .min(src.len())
                .saturating_sub(HEADER_SEPARATOR.len() - 1);
            let Some(sep) = find_separator(&src[from..]).map(|pos| from + pos) else {
                if src.len() > MAX_HEADER_BYTES {
                    if !self.discarding_header {
                        tracing::warn!(len = src.len(), "Frame header too long, resynchronizing");
                    }
                    // Keep a tail that could begin a separator.
                    let keep = HEADER_SEPARATOR.len() - 1;
                    src.advance(src.len() - keep);
                    self.discarding_header = true;
                    self.scanned = keep;
                } else {
                    self.scanned = src.len();
                }
                return Ok(None);
            };
            let body_start = sep + HEADER_SEPARATOR.len();
            self.scanned = 0;

            if self.discarding_header || sep > MAX_HEADER_BYTES {
                self.discarding_header = false;
                src.advance(body_start);
                continue;
            }

            let Some(len) = parse_content_length(&src[..sep]) else {
                tracing::debug!(discarded = body_start, "Malformed frame header, resynchronizing");
                src.advance(body_start);
                continue;
            };

            if len > self.max_frame_bytes {
                tracing::warn!(
                    len,
                    max = self.max_frame_bytes,
                    "Frame too large, discarding"
                );
                src.advance(body_start);
                self.skip_body = len;
                continue;
            }

            if src.len() < body_start + len {
                // The header stays buffered; resume the search at its separator.
                self.scanned = sep;
                src.reserve(body_start + len - src.len());
                return Ok(None);
            }

            src.advance(body_start);
            return Ok(Some(src.split_to(len).freeze()));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> std::io::Result<Option<Bytes>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                if !src.is_empty() {
                    tracing::debug!(remaining = src.len(), "Discarding partial frame at EOF");
                    src.clear();
                }
                self.reset();
                Ok(None)
            }
        }
    }
}

impl<T: AsRef<[u8]>> Encoder<T> for FrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> std::io::Result<()> {
        let payload = item.as_ref();
        let header = format!("Content-Length: {}\r\n\r\n", payload.len());
        dst.reserve(header.len() + payload.len());
        dst.put_slice(header.as_bytes());
        dst.put_slice(payload);
        Ok(())
    }
}

/// Encode one payload as a complete frame.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    // Encoding into a BytesMut cannot fail.
    let _ = FrameCodec::new().encode(payload, &mut buf);
    buf.to_vec()
}

fn find_separator(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_SEPARATOR.len())
        .position(|window| window == HEADER_SEPARATOR)
}

fn parse_content_length(header: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(header).ok()?;
    text.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse::<usize>().ok()
        } else {
            None
        }
    })
}
