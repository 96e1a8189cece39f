//! Bounded capture of a child's output stream.
//!
//! Keeps the first `limit` bytes of a stream and stops reading there; the rest
//! stays in the pipe. Whether the child had more to say is decided by one
//! extra byte, read the way the [`OverflowCheck`] asks.

use crate::error::{RunnerError, StdioStream};
use std::fmt;
use std::io;
use std::os::fd::OwnedFd;
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;

const READ_CHUNK_SIZE: usize = 8192;

/// A prefix-keeping buffer with a fixed maximum size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureBuffer {
    bytes: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl CaptureBuffer {
    /// Create an empty buffer that keeps at most `limit` bytes
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(limit.min(READ_CHUNK_SIZE)),
            limit,
            truncated: false,
        }
    }

    /// Append `data`, dropping whatever does not fit.
    pub fn write(&mut self, data: &[u8]) {
        let room = self.remaining();
        if data.len() > room {
            self.truncated = true;
        }
        self.bytes.extend_from_slice(&data[..data.len().min(room)]);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[must_use]
    pub const fn limit(&self) -> usize {
        self.limit
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.limit - self.bytes.len()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.bytes.len() >= self.limit
    }

    /// Check if the stream carried more bytes than were kept
    #[must_use]
    pub const fn was_truncated(&self) -> bool {
        self.truncated
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl fmt::Display for CaptureBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.bytes))
    }
}

/// How a capture that reached its limit looks for further output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OverflowCheck {
    /// Only a byte already sitting in the pipe counts; never waits.
    Pending,
    /// Wait for one more byte or end of stream. Only for runs whose body does
    /// nothing but capture, so the child makes progress on its own.
    AwaitNext,
}

/// Read up to `limit` bytes from the read end of an output pipe.
///
/// Returns as soon as the limit is reached. Consumes `read_end`; it is closed
/// when this returns.
pub(crate) async fn capture_descriptor(
    read_end: OwnedFd,
    limit: usize,
    stream: StdioStream,
    overflow: OverflowCheck,
) -> Result<CaptureBuffer, RunnerError> {
    let read_error = |source: io::Error| RunnerError::Read { stream, source };
    let mut receiver = pipe::Receiver::from_owned_fd(read_end).map_err(read_error)?;
    let mut buffer = CaptureBuffer::new(limit);
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];

    while !buffer.is_full() {
        let want = chunk.len().min(buffer.remaining());
        match receiver.read(&mut chunk[..want]).await {
            Ok(0) => return Ok(buffer),
            Ok(n) => buffer.write(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(read_error(e)),
        }
    }

    let mut next = [0u8; 1];
    loop {
        let attempt = match overflow {
            OverflowCheck::Pending => receiver.try_read(&mut next),
            OverflowCheck::AwaitNext => receiver.read(&mut next).await,
        };
        match attempt {
            Ok(n) => {
                buffer.write(&next[..n]);
                break;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(read_error(e)),
        }
    }

    if buffer.was_truncated() {
        tracing::debug!(%stream, limit, "captured output truncated at limit");
    }
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_capture_buffer_basic() {
        let mut buffer = CaptureBuffer::new(10);
        buffer.write(b"hello");
        assert_eq!(buffer.to_string(), "hello");
        assert_eq!(buffer.len(), 5);
        assert_eq!(buffer.remaining(), 5);
        assert!(!buffer.is_empty());
        assert!(!buffer.was_truncated());
    }

    #[test]
    fn test_capture_buffer_keeps_prefix() {
        let mut buffer = CaptureBuffer::new(10);
        buffer.write(b"hello");
        buffer.write(b"world");
        buffer.write(b"!");

        assert_eq!(buffer.len(), 10);
        assert_eq!(buffer.to_string(), "helloworld");
        assert!(buffer.is_full());
        assert!(buffer.was_truncated());
    }

    #[test]
    fn test_capture_buffer_exact_capacity() {
        let mut buffer = CaptureBuffer::new(10);
        buffer.write(b"1234567890");
        assert!(buffer.is_full());
        assert!(!buffer.was_truncated());
    }

    #[test]
    fn test_capture_buffer_zero_limit() {
        let mut buffer = CaptureBuffer::new(0);
        assert!(buffer.is_full());
        buffer.write(b"x");
        assert!(buffer.is_empty());
        assert!(buffer.was_truncated());
    }

    #[test]
    fn test_capture_buffer_invalid_utf8() {
        let mut buffer = CaptureBuffer::new(10);
        buffer.write(&[0xFF, 0xFE, 0xFD]);
        assert!(!buffer.to_string().is_empty());
        assert_eq!(buffer.into_bytes(), vec![0xFF, 0xFE, 0xFD]);
    }

    fn pipe_with(contents: &[u8]) -> OwnedFd {
        let (reader, mut writer) = std::io::pipe().unwrap();
        writer.write_all(contents).unwrap();
        drop(writer);
        OwnedFd::from(reader)
    }

    #[tokio::test]
    async fn test_capture_under_limit_returns_everything() {
        let buffer = capture_descriptor(
            pipe_with(b"hello\n"),
            64,
            StdioStream::StandardOutput,
            OverflowCheck::Pending,
        )
        .await
            .unwrap();
        assert_eq!(buffer.as_bytes(), b"hello\n");
        assert!(!buffer.was_truncated());
    }

    #[tokio::test]
    async fn test_capture_over_limit_stops_at_limit() {
        let buffer = capture_descriptor(
            pipe_with(&[b'x'; 100]),
            10,
            StdioStream::StandardError,
            OverflowCheck::AwaitNext,
        )
        .await
            .unwrap();
        assert_eq!(buffer.len(), 10);
        assert!(buffer.was_truncated());
    }

    #[tokio::test]
    async fn test_capture_exactly_limit_is_not_truncated() {
        let buffer = capture_descriptor(
            pipe_with(&[b'y'; 32]),
            32,
            StdioStream::StandardOutput,
            OverflowCheck::AwaitNext,
        )
        .await
            .unwrap();
        assert_eq!(buffer.len(), 32);
        assert!(!buffer.was_truncated());
    }

    #[tokio::test]
    async fn test_capture_at_limit_does_not_wait_for_open_writer() {
        let (reader, mut writer) = std::io::pipe().unwrap();
        writer.write_all(b"abcd").unwrap();

        let buffer = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            capture_descriptor(
                OwnedFd::from(reader),
                4,
                StdioStream::StandardOutput,
                OverflowCheck::Pending,
            ),
        )
        .await
        .expect("capture returns once the limit is reached")
        .unwrap();
        assert_eq!(buffer.as_bytes(), b"abcd");
        assert!(!buffer.was_truncated());
        drop(writer);
    }

    #[tokio::test]
    async fn test_pending_byte_past_limit_marks_truncation() {
        let (reader, mut writer) = std::io::pipe().unwrap();
        writer.write_all(b"abcde").unwrap();

        let buffer = capture_descriptor(
            OwnedFd::from(reader),
            4,
            StdioStream::StandardOutput,
            OverflowCheck::Pending,
        )
        .await
        .unwrap();
        assert_eq!(buffer.as_bytes(), b"abcd");
        assert!(buffer.was_truncated());
        drop(writer);
    }
}
