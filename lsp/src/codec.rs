//! JSON-RPC framing codec for LSP communication.
//!
//! LSP uses `Content-Length: N\r\n\r\n{json}` framing over stdin/stdout.
//! This module provides [`FrameReader`] and [`FrameWriter`], each
//! operation bounded by a caller-supplied timeout.
//!
//! The reader keeps every partially received byte in its own buffer, so a
//! pending [`FrameReader::next_frame`] can be dropped (for example when
//! it loses a `select!` against the liveness channel) without losing data.

use std::time::Duration;

use futures_util::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{IoOp, LspError};

/// The only header this client understands.
const HEADER_PREFIX: &[u8] = b"Content-Length: ";

/// Upper bound on the header text after the prefix: the decimal length
/// plus the `\r\n\r\n` terminator.
pub const MAX_HEADER_TAIL: usize = 23;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Maximum body size (16 MiB) to prevent unbounded memory allocation.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// Encode `msg` as one complete frame.
pub fn encode_frame(msg: &serde_json::Value) -> Result<Vec<u8>, LspError> {
    let body = serde_json::to_vec(msg)
        .map_err(|e| LspError::protocol(format!("serializing frame: {e}")))?;
    let mut frame = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode exactly one frame occupying all of `bytes`.
///
/// A length field that disagrees with the number of bytes that follow is
/// a protocol error.
pub fn decode_frame(bytes: &[u8]) -> Result<serde_json::Value, LspError> {
    let Some(header) = parse_header(bytes)? else {
        return Err(LspError::protocol("incomplete frame header"));
    };
    let actual = bytes.len() - header.body_start;
    if actual != header.content_length {
        return Err(LspError::protocol(format!(
            "Content-Length {} does not match {actual} body bytes",
            header.content_length
        )));
    }
    parse_body(&bytes[header.body_start..])
}

struct FrameHeader {
    body_start: usize,
    content_length: usize,
}

/// Parse the header at the start of `buf`.
///
/// `Ok(None)` means more bytes are needed.
fn parse_header(buf: &[u8]) -> Result<Option<FrameHeader>, LspError> {
    let seen = buf.len().min(HEADER_PREFIX.len());
    // The spelling on the wire is fixed, but accept any ASCII case.
    if !buf[..seen].eq_ignore_ascii_case(&HEADER_PREFIX[..seen]) {
        return Err(LspError::protocol("expected Content-Length header"));
    }
    if buf.len() < HEADER_PREFIX.len() {
        return Ok(None);
    }

    let tail = &buf[HEADER_PREFIX.len()..];
    let window = &tail[..tail.len().min(MAX_HEADER_TAIL)];
    let Some(pos) = window
        .windows(HEADER_TERMINATOR.len())
        .position(|w| w == HEADER_TERMINATOR)
    else {
        if tail.len() >= MAX_HEADER_TAIL {
            return Err(LspError::protocol(format!(
                "frame header exceeds {MAX_HEADER_TAIL} bytes"
            )));
        }
        return Ok(None);
    };

    let digits = &tail[..pos];
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(LspError::protocol(format!(
            "invalid Content-Length value {:?}",
            String::from_utf8_lossy(digits)
        )));
    }
    // At most 19 ASCII digits fit in the window; parse cannot fail on
    // content, only on overflow.
    let content_length: usize = std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| LspError::protocol("Content-Length out of range"))?;
    if content_length > MAX_FRAME_BYTES {
        return Err(LspError::protocol(format!(
            "Content-Length {content_length} exceeds maximum {MAX_FRAME_BYTES}"
        )));
    }

    Ok(Some(FrameHeader {
        body_start: HEADER_PREFIX.len() + pos + HEADER_TERMINATOR.len(),
        content_length,
    }))
}

fn parse_body(body: &[u8]) -> Result<serde_json::Value, LspError> {
    serde_json::from_slice(body).map_err(|e| LspError::protocol(format!("parsing frame body: {e}")))
}

/// Reads JSON-RPC frames from an async reader.
pub struct FrameReader<R> {
    reader: R,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
        }
    }

    /// Read the next frame, failing with [`LspError::Timeout`] if it does
    /// not complete within `timeout`.
    ///
    /// After a timeout the stream position is unspecified; callers treat
    /// it as fatal to the session.
    pub async fn read_frame(&mut self, timeout: Duration) -> Result<serde_json::Value, LspError> {
        tokio::time::timeout(timeout, self.next_frame())
            .await
            .map_err(|_| LspError::Timeout {
                op: IoOp::ReadFrame,
                after: timeout,
            })?
    }

    /// Read the next frame without a deadline. Cancel-safe.
    pub async fn next_frame(&mut self) -> Result<serde_json::Value, LspError> {
        loop {
            if let Some(frame) = self.take_buffered()? {
                return Ok(frame);
            }
            self.fill().await?;
        }
    }

    /// Return a frame only if it can be completed from bytes that are
    /// already available, never waiting for more.
    ///
    /// A partial frame stays buffered for the next call.
    pub fn try_read_now(&mut self) -> Result<Option<serde_json::Value>, LspError> {
        loop {
            if let Some(frame) = self.take_buffered()? {
                return Ok(Some(frame));
            }
            match self.fill().now_or_never() {
                Some(result) => result?,
                None => return Ok(None),
            }
        }
    }

    fn take_buffered(&mut self) -> Result<Option<serde_json::Value>, LspError> {
        let Some(header) = parse_header(&self.buf)? else {
            return Ok(None);
        };
        let end = header.body_start + header.content_length;
        if self.buf.len() < end {
            return Ok(None);
        }
        let value = parse_body(&self.buf[header.body_start..end]);
        self.buf.drain(..end);
        value.map(Some)
    }

    async fn fill(&mut self) -> Result<(), LspError> {
        self.buf.reserve(READ_CHUNK);
        let n = self.reader.read_buf(&mut self.buf).await?;
        if n == 0 {
            if self.buf.is_empty() {
                return Err(LspError::Disconnected);
            }
            return Err(LspError::protocol(format!(
                "unexpected EOF with {} bytes of a partial frame buffered",
                self.buf.len()
            )));
        }
        Ok(())
    }
}

/// Writes JSON-RPC frames to an async writer.
///
/// Serializes JSON and prepends the `Content-Length` header.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write a frame, retrying partial writes until everything is sent or
    /// `timeout` elapses.
    pub async fn write_frame(
        &mut self,
        msg: &serde_json::Value,
        timeout: Duration,
    ) -> Result<(), LspError> {
        let frame = encode_frame(msg)?;
        let write = async {
            self.writer.write_all(&frame).await?;
            self.writer.flush().await?;
            Ok::<(), std::io::Error>(())
        };
        tokio::time::timeout(timeout, write)
            .await
            .map_err(|_| LspError::Timeout {
                op: IoOp::WriteFrame,
                after: timeout,
            })?
            .map_err(LspError::from)
    }
}
