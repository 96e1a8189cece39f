//! Single-pass asynchronous byte sequence over a child's output pipe.

use crate::error::{RunnerError, StdioStream};
use futures::Stream;
use std::future::poll_fn;
use std::io;
use std::os::fd::OwnedFd;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::net::unix::pipe;

/// Bytes requested from the descriptor per refill.
pub const ASYNC_BYTES_CHUNK_SIZE: usize = 16384;

enum Source {
    Pending(OwnedFd),
    Open(pipe::Receiver),
    Closed,
}

/// Forward-only stream of the bytes a child writes to a collected stream.
///
/// Each refill reads until [`ASYNC_BYTES_CHUNK_SIZE`] bytes have arrived or
/// the child closes its end. A refill that comes back short marks the
/// sequence finished once its bytes are yielded; an empty refill ends it at
/// once. The sequence is not restartable, and the descriptor is closed as
/// soon as the end is reached or the value is dropped.
///
/// Before every refill the run's cancellation flag is checked; a cancelled
/// run yields [`RunnerError::Cancelled`] and then ends.
pub struct AsyncBytes {
    source: Source,
    stream: StdioStream,
    cancelled: Arc<AtomicBool>,
    buffer: Box<[u8]>,
    start: usize,
    end: usize,
    filled: usize,
    refilling: bool,
    finished: bool,
}

impl std::fmt::Debug for AsyncBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncBytes")
            .field("stream", &self.stream)
            .field("buffered", &(self.end - self.start))
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl AsyncBytes {
    pub(crate) fn new(read_end: OwnedFd, stream: StdioStream, cancelled: Arc<AtomicBool>) -> Self {
        Self {
            source: Source::Pending(read_end),
            stream,
            cancelled,
            buffer: vec![0u8; ASYNC_BYTES_CHUNK_SIZE].into_boxed_slice(),
            start: 0,
            end: 0,
            filled: 0,
            refilling: false,
            finished: false,
        }
    }

    /// The next byte, or `None` at the end of the stream.
    pub async fn next_byte(&mut self) -> Option<Result<u8, RunnerError>> {
        poll_fn(|cx| Pin::new(&mut *self).poll_next(cx)).await
    }

    /// Everything currently buffered, refilling first if the buffer is empty.
    pub async fn next_chunk(&mut self) -> Option<Result<Vec<u8>, RunnerError>> {
        poll_fn(|cx| match ready!(self.poll_fill(cx)) {
            Some(Ok(())) => {
                let chunk = self.buffer[self.start..self.end].to_vec();
                self.start = self.end;
                Poll::Ready(Some(Ok(chunk)))
            }
            Some(Err(e)) => Poll::Ready(Some(Err(e))),
            None => Poll::Ready(None),
        })
        .await
    }

    fn finish(&mut self) {
        self.finished = true;
        self.refilling = false;
        self.source = Source::Closed;
    }

    /// Ready with `Some(Ok(()))` once at least one byte is buffered, `None` at the end.
    fn poll_fill(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<(), RunnerError>>> {
        loop {
            if self.start < self.end {
                return Poll::Ready(Some(Ok(())));
            }
            if self.finished {
                return Poll::Ready(None);
            }

            if !self.refilling {
                if self.cancelled.load(Ordering::Acquire) {
                    self.finish();
                    return Poll::Ready(Some(Err(RunnerError::Cancelled)));
                }
                self.refilling = true;
                self.filled = 0;
            }

            self.source = match std::mem::replace(&mut self.source, Source::Closed) {
                Source::Pending(fd) => match pipe::Receiver::from_owned_fd(fd) {
                    Ok(receiver) => Source::Open(receiver),
                    Err(source) => return Poll::Ready(Some(Err(self.read_failed(source)))),
                },
                other => other,
            };
            let Source::Open(receiver) = &mut self.source else {
                self.finish();
                return Poll::Ready(None);
            };

            let mut read_buf = ReadBuf::new(&mut self.buffer[self.filled..]);
            match ready!(Pin::new(receiver).poll_read(cx, &mut read_buf)) {
                Ok(()) => {
                    let n = read_buf.filled().len();
                    self.filled += n;
                    if n == 0 {
                        // Short refill: yield what arrived, then end.
                        let filled = self.filled;
                        self.finish();
                        self.start = 0;
                        self.end = filled;
                    } else if self.filled == self.buffer.len() {
                        self.refilling = false;
                        self.start = 0;
                        self.end = self.filled;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(source) => return Poll::Ready(Some(Err(self.read_failed(source)))),
            }
        }
    }

    fn read_failed(&mut self, source: io::Error) -> RunnerError {
        self.finish();
        RunnerError::Read {
            stream: self.stream,
            source,
        }
    }
}

impl Stream for AsyncBytes {
    type Item = Result<u8, RunnerError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match ready!(this.poll_fill(cx)) {
            Some(Ok(())) => {
                let byte = this.buffer[this.start];
                this.start += 1;
                Poll::Ready(Some(Ok(byte)))
            }
            Some(Err(e)) => Poll::Ready(Some(Err(e))),
            None => Poll::Ready(None),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let buffered = self.end - self.start;
        if self.finished {
            (buffered, Some(buffered))
        } else {
            (buffered, None)
        }
    }
}
