//! Capability interface over a bidirectional byte stream.
//!
//! The connection engine talks to the substrate only through [`Transport`],
//! so a TCP socket, a Unix domain socket (see [`crate::socket`]) and the
//! in-memory [`crate::simulator`] are interchangeable.
//!
//! Transports never block in `send` or `receive`: when the substrate is not
//! ready they report a would-block status and the caller decides whether to
//! wait in [`Transport::poll`].  This lets the engine multiplex reading and
//! writing on one full-duplex stream.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::buffer::BufferWithFds;

/// Which readiness a caller is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    Readable,
    Writable,
    ReadAndWritable,
}

impl PollMode {
    pub fn wants_read(self) -> bool {
        matches!(self, Self::Readable | Self::ReadAndWritable)
    }

    pub fn wants_write(self) -> bool {
        matches!(self, Self::Writable | Self::ReadAndWritable)
    }
}

/// Result of [`Transport::poll`].  Both flags are clear after a timeout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

impl Readiness {
    /// `true` when at least one of the states asked for by `mode` is ready.
    pub fn satisfies(self, mode: PollMode) -> bool {
        (mode.wants_read() && self.readable) || (mode.wants_write() && self.writable)
    }
}

/// Outcome of [`Transport::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Every remaining byte (and every descriptor) was handed to the substrate.
    Complete,
    /// The substrate filled up after `sent` bytes.  The buffer's cursor has
    /// been advanced past them; call `send` again with the same buffer.
    WouldBlock { sent: usize },
}

/// Outcome of [`Transport::receive`].
#[derive(Debug)]
pub enum ReceiveStatus {
    /// Bytes and the descriptors that arrived with them.
    Data(BufferWithFds),
    /// Nothing available right now.
    WouldBlock,
}

/// Errors that can arise from transport operations.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Underlying I/O error from the OS.  A peer that closed the stream shows
    /// up as [`io::ErrorKind::UnexpectedEof`].
    #[error("stream I/O error: {0}")]
    Io(#[from] io::Error),
    /// Descriptors were attached but the substrate cannot carry them.
    #[error("this transport cannot pass file descriptors")]
    FdPassingUnsupported,
    /// More descriptors than the substrate accepts in one message.
    #[error("{count} file descriptors exceed the per-message limit of {limit}")]
    TooManyFds { count: usize, limit: usize },
    /// Descriptors with no bytes left to carry them.
    #[error("{count} file descriptors have no payload to travel with")]
    FdsWithoutPayload { count: usize },
}

/// A non-blocking byte stream that may also carry file descriptors.
///
/// Implementations must keep descriptors atomic with their payload: a
/// successful `send` or `receive` never moves bytes without the descriptors
/// attached to them, or descriptors without bytes.
pub trait Transport: Send + Sync {
    /// Block until the stream is ready per `mode`, or until `timeout` passes
    /// (`None` waits indefinitely).
    fn poll(&self, mode: PollMode, timeout: Option<Duration>) -> io::Result<Readiness>;

    /// Write as much of `buf` as possible without blocking.
    ///
    /// Progress is recorded in `buf` itself, so a retry after
    /// [`SendStatus::WouldBlock`] resumes at the right byte and never re-sends
    /// descriptors.
    fn send(&self, buf: &mut BufferWithFds) -> Result<SendStatus, StreamError>;

    /// Read up to `max_len` bytes and any descriptors without blocking.
    fn receive(&self, max_len: usize) -> Result<ReceiveStatus, StreamError>;

    /// Whether [`send`](Self::send) accepts buffers with descriptors.
    fn supports_fds(&self) -> bool;

    /// Shut both directions down, waking anyone blocked in `poll`.
    fn shutdown(&self) -> io::Result<()>;
}

/// The error a transport reports when the peer closed the stream.
pub(crate) fn peer_closed() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by peer")
}

/// Descriptors ride on the first byte written with them, so a buffer that
/// still holds descriptors must still hold bytes.
pub(crate) fn check_payload(buf: &BufferWithFds) -> Result<(), StreamError> {
    if buf.remaining().is_empty() && !buf.fds().is_empty() {
        return Err(StreamError::FdsWithoutPayload {
            count: buf.fds().len(),
        });
    }
    Ok(())
}
