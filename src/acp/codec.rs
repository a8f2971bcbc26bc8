//! Frame codec: splits a byte stream into JSON-RPC messages.
//!
//! Two framings are supported:
//! - `Newline`: one JSON value per line.
//! - `ContentLength`: an LSP-style header block (`Content-Length: <n>`) ended
//!   by a blank line, followed by exactly `n` bytes of JSON.
//!
//! Unconsumed bytes stay in the buffer until the next read, so the decoded
//! sequence does not depend on where reads split the stream. Frames that are
//! recognised but do not hold a valid message are logged and skipped; the
//! decoder never returns an error for bad input.

use std::fmt;
use std::str::FromStr;

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use crate::acp::error::AcpError;
use crate::acp::message::Message;

/// Give up on a header block that grows past this without terminating.
const MAX_HEADER_LEN: usize = 8 * 1024;

/// Largest payload a `Content-Length` header may announce.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// How messages are delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Framing {
    #[default]
    Newline,
    ContentLength,
}

impl fmt::Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Framing::Newline => write!(f, "newline"),
            Framing::ContentLength => write!(f, "content-length"),
        }
    }
}

impl FromStr for Framing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "newline" | "ndjson" | "lines" => Ok(Framing::Newline),
            "content-length" | "header" | "lsp" => Ok(Framing::ContentLength),
            other => Err(format!(
                "invalid framing '{other}' (expected 'newline' or 'content-length')"
            )),
        }
    }
}

/// Stateful encoder/decoder for one direction of one transport.
#[derive(Debug, Default)]
pub struct FrameCodec {
    framing: Framing,
    /// Payload length announced by a header whose body has not fully arrived.
    pending_len: Option<usize>,
}

impl FrameCodec {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            pending_len: None,
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Decode every complete message currently in `buf`.
    ///
    /// Returns the messages plus the number of bytes consumed; a trailing
    /// partial frame is left in `buf` for the next call.
    pub fn decode_available(&mut self, buf: &mut BytesMut) -> (Vec<Message>, usize) {
        let before = buf.len();
        let mut messages = Vec::new();
        while let Some(message) = self.next_message(buf) {
            messages.push(message);
        }
        (messages, before - buf.len())
    }

    fn next_message(&mut self, buf: &mut BytesMut) -> Option<Message> {
        loop {
            let frame = match self.framing {
                Framing::Newline => next_line(buf)?,
                Framing::ContentLength => self.next_payload(buf)?,
            };
            if let Some(message) = parse_frame(&frame) {
                return Some(message);
            }
        }
    }

    /// Split off the next header-delimited payload, if it is complete.
    fn next_payload(&mut self, buf: &mut BytesMut) -> Option<BytesMut> {
        loop {
            if let Some(len) = self.pending_len {
                if buf.len() < len {
                    return None;
                }
                self.pending_len = None;
                return Some(buf.split_to(len));
            }

            let Some((header_len, separator_len)) = find_header_end(buf) else {
                if buf.len() > MAX_HEADER_LEN {
                    tracing::warn!(
                        bytes = buf.len(),
                        "discarding unterminated header block"
                    );
                    buf.clear();
                }
                return None;
            };

            let block = buf.split_to(header_len + separator_len);
            match parse_content_length(&block[..header_len]) {
                Some(len) if len <= MAX_FRAME_LEN => self.pending_len = Some(len),
                Some(len) => tracing::warn!(
                    len,
                    max = MAX_FRAME_LEN,
                    "discarding header block announcing an oversized frame"
                ),
                None => tracing::warn!(
                    header = %String::from_utf8_lossy(&block[..header_len]),
                    "discarding header block without a valid Content-Length"
                ),
            }
        }
    }
}

/// Split off the next newline-terminated line (without the terminator).
fn next_line(buf: &mut BytesMut) -> Option<BytesMut> {
    let pos = buf.iter().position(|b| *b == b'\n')?;
    let mut line = buf.split_to(pos + 1);
    line.truncate(pos);
    Some(line)
}

/// Locate the blank line ending a header block.
///
/// Returns `(header_len, separator_len)`. Accepts `\r\n\r\n` and bare `\n\n`,
/// whichever comes first.
fn find_header_end(buf: &[u8]) -> Option<(usize, usize)> {
    let crlf = find(buf, b"\r\n\r\n").map(|pos| (pos, 4));
    let lf = find(buf, b"\n\n").map(|pos| (pos, 2));
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn parse_content_length(header: &[u8]) -> Option<usize> {
    let text = String::from_utf8_lossy(header);
    text.lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
}

/// Parse one frame body. Blank and malformed frames yield `None`.
fn parse_frame(frame: &[u8]) -> Option<Message> {
    let trimmed = frame.trim_ascii();
    if trimmed.is_empty() {
        return None;
    }
    match Message::from_slice(trimmed) {
        Ok(message) => {
            tracing::trace!(frame = %String::from_utf8_lossy(trimmed), "decoded frame");
            Some(message)
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                frame = %String::from_utf8_lossy(trimmed),
                "dropping malformed frame"
            );
            None
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = AcpError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, AcpError> {
        Ok(self.next_message(src))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>, AcpError> {
        if let Some(message) = self.next_message(src) {
            return Ok(Some(message));
        }
        if src.is_empty() {
            return Ok(None);
        }
        // A final line without a trailing newline is still a frame.
        let rest = src.split();
        if self.framing == Framing::Newline {
            return Ok(parse_frame(&rest));
        }
        tracing::warn!(bytes = rest.len(), "discarding truncated frame at end of stream");
        self.pending_len = None;
        Ok(None)
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = AcpError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), AcpError> {
        let payload = item.to_bytes()?;
        match self.framing {
            Framing::Newline => {
                dst.reserve(payload.len() + 1);
                dst.put_slice(&payload);
                dst.put_u8(b'\n');
            }
            Framing::ContentLength => {
                let header = format!("Content-Length: {}\r\n\r\n", payload.len());
                dst.reserve(header.len() + payload.len());
                dst.put_slice(header.as_bytes());
                dst.put_slice(&payload);
            }
        }
        Ok(())
    }
}
