//! Zero-capacity byte conduit between a blocking writer and an async reader.
//!
//! [`pipe`] returns a connected [`PipeWriter`] / [`PipeReader`] pair. Each
//! write hands its bytes to the reader as one chunk and blocks the writing
//! thread until the reader has taken it, so at most one write's worth of data
//! is ever held by the conduit.
//!
//! - Closing the writer ends the reader's stream after the last chunk.
//! - Closing the writer with an error makes the reader yield that error.
//! - Closing the reader fails blocked and future writes with `BrokenPipe`.
//!
//! Both ends close on drop and closing is idempotent; the first close wins.
//! A writer dropped during a panic closes with an error. A [`PipeCloser`] closes
//! one end from elsewhere, e.g. after the end itself moved into another task.
//!
//! The writer blocks its thread; drive it from a blocking context such as
//! `tokio::task::spawn_blocking`, never from inside an async task.

use bytes::Bytes;
use futures::Stream;
use parking_lot::{Condvar, Mutex};
use std::io::{self, Write};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

#[derive(Debug)]
enum WriteState {
    Open,
    Closed,
    Failed(io::ErrorKind, String),
}

#[derive(Debug)]
struct State {
    chunk: Option<Bytes>,
    /// Chunks taken by the reader so far
    delivered: u64,
    write: WriteState,
    read_closed: bool,
    reader_waker: Option<Waker>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    taken: Condvar,
}

impl Shared {
    fn close_write(&self, outcome: WriteState) {
        let mut state = self.state.lock();
        if !matches!(state.write, WriteState::Open) {
            return;
        }
        state.write = outcome;
        // a pending write is abandoned, not delivered
        state.chunk = None;
        let waker = state.reader_waker.take();
        drop(state);
        self.taken.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn close_read(&self) {
        let mut state = self.state.lock();
        if state.read_closed {
            return;
        }
        state.read_closed = true;
        state.chunk = None;
        state.reader_waker = None;
        drop(state);
        self.taken.notify_all();
    }
}

fn broken_pipe(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, msg)
}

/// Create a connected conduit.
pub fn pipe() -> (PipeReader, PipeWriter) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            chunk: None,
            delivered: 0,
            write: WriteState::Open,
            read_closed: false,
            reader_waker: None,
        }),
        taken: Condvar::new(),
    });
    (
        PipeReader {
            shared: shared.clone(),
        },
        PipeWriter { shared },
    )
}

/// Writing half of a conduit. Implements blocking [`std::io::Write`].
#[derive(Debug)]
pub struct PipeWriter {
    shared: Arc<Shared>,
}

impl PipeWriter {
    /// End the stream; the reader sees end-of-stream after the last chunk.
    pub fn close(&self) {
        self.shared.close_write(WriteState::Closed);
    }

    /// End the stream with an error the reader will yield.
    pub fn close_with_error(&self, err: &io::Error) {
        self.shared
            .close_write(WriteState::Failed(err.kind(), err.to_string()));
    }

    pub fn closer(&self) -> PipeCloser {
        PipeCloser {
            shared: self.shared.clone(),
            side: Side::Write,
        }
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut state = self.shared.state.lock();
        if !matches!(state.write, WriteState::Open) {
            return Err(broken_pipe("write on closed conduit"));
        }
        if state.read_closed {
            return Err(broken_pipe("conduit closed by reader"));
        }

        state.chunk = Some(Bytes::copy_from_slice(buf));
        let ticket = state.delivered;
        if let Some(waker) = state.reader_waker.take() {
            waker.wake();
        }

        loop {
            // delivery counts even if the reader closed right after taking it
            if state.delivered != ticket {
                return Ok(buf.len());
            }
            if state.read_closed {
                return Err(broken_pipe("conduit closed by reader"));
            }
            if !matches!(state.write, WriteState::Open) {
                return Err(broken_pipe("write on closed conduit"));
            }
            self.shared.taken.wait(&mut state);
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.shared.close_write(WriteState::Failed(
                io::ErrorKind::Other,
                "conduit writer panicked".to_string(),
            ));
        } else {
            self.close();
        }
    }
}

/// Reading half of a conduit: a stream of the chunks written to it.
#[derive(Debug)]
pub struct PipeReader {
    shared: Arc<Shared>,
}

impl PipeReader {
    /// Stop reading; blocked and future writes fail with `BrokenPipe`.
    pub fn close(&self) {
        self.shared.close_read();
    }

    pub fn closer(&self) -> PipeCloser {
        PipeCloser {
            shared: self.shared.clone(),
            side: Side::Read,
        }
    }
}

impl Stream for PipeReader {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut state = self.shared.state.lock();
        if state.read_closed {
            return Poll::Ready(None);
        }
        if let Some(chunk) = state.chunk.take() {
            state.delivered = state.delivered.wrapping_add(1);
            drop(state);
            self.shared.taken.notify_all();
            return Poll::Ready(Some(Ok(chunk)));
        }
        if let WriteState::Failed(kind, msg) = &state.write {
            return Poll::Ready(Some(Err(io::Error::new(*kind, msg.clone()))));
        }
        if matches!(state.write, WriteState::Closed) {
            return Poll::Ready(None);
        }
        state.reader_waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Debug, Clone, Copy)]
enum Side {
    Read,
    Write,
}

/// Closes one end of a conduit without owning it.
#[derive(Debug, Clone)]
pub struct PipeCloser {
    shared: Arc<Shared>,
    side: Side,
}

impl PipeCloser {
    pub fn close(&self) {
        match self.side {
            Side::Read => self.shared.close_read(),
            Side::Write => self.shared.close_write(WriteState::Closed),
        }
    }

    /// Close with an error. On the read side this is the same as [`close`](Self::close).
    pub fn close_with_error(&self, err: &io::Error) {
        match self.side {
            Side::Read => self.shared.close_read(),
            Side::Write => self
                .shared
                .close_write(WriteState::Failed(err.kind(), err.to_string())),
        }
    }
}
