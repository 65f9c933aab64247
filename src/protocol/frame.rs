//! Incremental reader for `Content-Length` framed messages.
//!
//! Wire format:
//! ```text
//! Content-Length: <length>\r\n
//! <other headers, ignored>\r\n
//! \r\n
//! <length bytes of UTF-8 JSON>
//! ```
//!
//! The reader is a two-state machine:
//! - `Headers`: accumulate until the first CRLFCRLF, then parse the length
//! - `Body`: wait until the declared number of bytes is buffered
//!
//! Chunk boundaries may fall anywhere (mid-header, mid-terminator, mid-body);
//! all partial state is carried in the reader itself.

use bytes::{Bytes, BytesMut};

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const CONTENT_LENGTH: &[u8] = b"Content-Length";

/// Reason reported when a header block has no usable length.
pub const MALFORMED_CONTENT_LENGTH: &str = "missing or malformed Content-Length";

/// One unit extracted from the byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete frame: raw header block (without terminator) and body.
    Message { headers: Bytes, body: Bytes },
    /// A header block whose `Content-Length` was absent or unparsable.
    /// The block has already been discarded; reading resumes after it.
    Malformed { reason: &'static str },
}

#[derive(Debug)]
enum State {
    Headers,
    Body { headers: Bytes, remaining: usize },
}

/// Turns arbitrarily chunked bytes into [`Frame`]s.
///
/// Owns its buffer; nothing is shared between readers.
#[derive(Debug)]
pub struct FrameReader {
    buffer: BytesMut,
    state: State,
    /// Bytes of `buffer` already searched for the header terminator.
    scanned: usize,
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReader {
    pub fn new() -> Self {
        Self::with_capacity(8 * 1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            state: State::Headers,
            scanned: 0,
        }
    }

    /// Append a chunk and return every frame it completes, in stream order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one() {
            frames.push(frame);
        }
        frames
    }

    /// Number of bytes held back waiting for more input.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// True when a frame has been started but not finished.
    pub fn has_partial_frame(&self) -> bool {
        !self.buffer.is_empty() || matches!(self.state, State::Body { .. })
    }

    fn try_extract_one(&mut self) -> Option<Frame> {
        match std::mem::replace(&mut self.state, State::Headers) {
            State::Headers => {
                let end = self.find_terminator()?;
                let block = self.buffer.split_to(end + HEADER_TERMINATOR.len()).freeze();
                self.scanned = 0;
                let headers = block.slice(..end);

                match parse_content_length(&headers) {
                    Some(0) => Some(Frame::Message {
                        headers,
                        body: Bytes::new(),
                    }),
                    Some(remaining) => {
                        self.state = State::Body { headers, remaining };
                        self.try_extract_one()
                    }
                    None => {
                        log::warn!(
                            target: "dapwire::frame",
                            "Discarding header block without usable Content-Length: {:?}",
                            String::from_utf8_lossy(&headers)
                        );
                        Some(Frame::Malformed {
                            reason: MALFORMED_CONTENT_LENGTH,
                        })
                    }
                }
            }
            State::Body { headers, remaining } => {
                if self.buffer.len() < remaining {
                    self.state = State::Body { headers, remaining };
                    return None;
                }
                let body = self.buffer.split_to(remaining).freeze();
                Some(Frame::Message { headers, body })
            }
        }
    }

    /// Locate the first CRLFCRLF, resuming where the previous scan stopped.
    fn find_terminator(&mut self) -> Option<usize> {
        // Back up so a terminator split across chunks is still found.
        let start = self.scanned.saturating_sub(HEADER_TERMINATOR.len() - 1);
        let found = self.buffer[start..]
            .windows(HEADER_TERMINATOR.len())
            .position(|window| window == HEADER_TERMINATOR)
            .map(|offset| start + offset);
        if found.is_none() {
            self.scanned = self.buffer.len();
        }
        found
    }
}

/// Find the first `Content-Length` field and parse its value.
///
/// Field names match case-insensitively; whitespace around the value is
/// ignored. Only the first matching field is considered.
fn parse_content_length(headers: &[u8]) -> Option<usize> {
    for line in headers.split(|b| *b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let Some(colon) = line.iter().position(|b| *b == b':') else {
            continue;
        };
        if !line[..colon].trim_ascii().eq_ignore_ascii_case(CONTENT_LENGTH) {
            continue;
        }
        let value = line[colon + 1..].trim_ascii();
        // Plain decimal only; `parse` alone would also take a leading `+`.
        if value.is_empty() || !value.iter().all(u8::is_ascii_digit) {
            return None;
        }
        return std::str::from_utf8(value).ok()?.parse::<usize>().ok();
    }
    None
}

/// Frame a serialized body for the wire.
pub fn encode_frame(body: &[u8]) -> Vec<u8> {
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    let mut out = Vec::with_capacity(header.len() + body.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(body);
    out
}
