//! Serialized writer over the parent's end of the child's standard input.

use crate::error::{RunnerError, StdioStream};
use crate::io::close_descriptor;
use futures::{Stream, StreamExt};
use std::os::fd::OwnedFd;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::pipe;
use tokio::sync::Mutex;

#[derive(Debug)]
enum WriterState {
    /// Write end not yet registered with the runtime.
    Pending(OwnedFd),
    Open(pipe::Sender),
    Finished,
}

/// Writes bytes to a running child's standard input.
///
/// Clones share one lock and one descriptor: a write holds the lock until
/// all of its bytes are in the pipe, so concurrent producers never interleave.
/// [`finish`](Self::finish) closes the descriptor; the child then sees EOF and
/// every later write fails with [`RunnerError::WriterFinished`].
#[derive(Debug, Clone)]
pub struct StandardInputWriter {
    state: Arc<Mutex<WriterState>>,
}

impl StandardInputWriter {
    pub(crate) fn new(write_end: OwnedFd) -> Self {
        Self {
            state: Arc::new(Mutex::new(WriterState::Pending(write_end))),
        }
    }

    /// Write all of `bytes`, returning how many were written.
    pub async fn write(&self, bytes: impl AsRef<[u8]>) -> Result<usize, RunnerError> {
        let bytes = bytes.as_ref();
        let mut state = self.state.lock().await;
        if matches!(*state, WriterState::Pending(_)) {
            let pending = std::mem::replace(&mut *state, WriterState::Finished);
            *state = open(pending)?;
        }
        let WriterState::Open(sender) = &mut *state else {
            return Err(RunnerError::WriterFinished);
        };
        sender
            .write_all(bytes)
            .await
            .map_err(|source| RunnerError::Write { source })?;
        Ok(bytes.len())
    }

    pub async fn write_str(&self, text: &str) -> Result<usize, RunnerError> {
        self.write(text.as_bytes()).await
    }

    /// Drain `stream` and write its bytes as one serialized write.
    pub async fn write_stream<S>(&self, stream: S) -> Result<usize, RunnerError>
    where
        S: Stream<Item = u8>,
    {
        let bytes: Vec<u8> = stream.collect().await;
        self.write(bytes).await
    }

    /// Close the descriptor. Calling it again is a no-op.
    pub async fn finish(&self) -> Result<(), RunnerError> {
        let mut state = self.state.lock().await;
        close_state(&mut state)
    }

    /// Close without waiting for an in-flight write. If a write holds the
    /// lock, the descriptor is released when the last clone is dropped.
    pub(crate) fn close_immediately(&self) -> Result<(), RunnerError> {
        match self.state.try_lock() {
            Ok(mut state) => close_state(&mut state),
            Err(_) => {
                tracing::debug!("standard input writer busy; deferring close to drop");
                Ok(())
            }
        }
    }
}

fn open(state: WriterState) -> Result<WriterState, RunnerError> {
    match state {
        WriterState::Pending(fd) => pipe::Sender::from_owned_fd(fd)
            .map(WriterState::Open)
            .map_err(|source| RunnerError::Write { source }),
        other => Ok(other),
    }
}

fn close_state(state: &mut WriterState) -> Result<(), RunnerError> {
    let cleanup = |source: std::io::Error| RunnerError::Cleanup {
        stream: StdioStream::StandardInput,
        source,
    };
    match std::mem::replace(state, WriterState::Finished) {
        WriterState::Finished => Ok(()),
        WriterState::Pending(fd) => close_descriptor(fd).map_err(cleanup),
        WriterState::Open(sender) => {
            let fd = sender.into_nonblocking_fd().map_err(cleanup)?;
            close_descriptor(fd).map_err(cleanup)
        }
    }
}
