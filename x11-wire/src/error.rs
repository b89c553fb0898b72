//! The error type surfaced by the connection engine.

use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::packet::FramingError;
use crate::sequence::SequenceNumber;
use crate::transport::StreamError;

/// Errors returned by [`crate::connection::Connection`].
///
/// `Clone` so that one fatal failure can be handed to every waiter.
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    /// The substrate failed; fatal.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),
    /// Outbound: the request was rejected before queueing.
    /// Inbound: the server broke framing; fatal.
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),
    /// Descriptors were attached but the transport cannot carry them.
    #[error("this connection cannot pass file descriptors")]
    FdPassingUnsupported,
    /// More descriptors than one request may carry.
    #[error("{count} file descriptors exceed the per-request limit of {limit}")]
    TooManyFds { count: usize, limit: usize },
    /// Descriptors were attached to a request without bytes.
    #[error("{count} file descriptors attached to an empty request")]
    FdsWithoutPayload { count: usize },
    /// No outstanding reply-expecting request has this sequence number.
    #[error("sequence number {0} has no pending reply")]
    NotPending(SequenceNumber),
    /// The connection was closed earlier.
    #[error("connection is closed")]
    Closed,
}

impl ConnectionError {
    /// `true` for a clean close by the peer.
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }
}

impl From<io::Error> for ConnectionError {
    fn from(e: io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

impl From<StreamError> for ConnectionError {
    fn from(e: StreamError) -> Self {
        match e {
            StreamError::Io(e) => Self::from(e),
            StreamError::FdPassingUnsupported => Self::FdPassingUnsupported,
            StreamError::TooManyFds { count, limit } => Self::TooManyFds { count, limit },
            StreamError::FdsWithoutPayload { count } => Self::FdsWithoutPayload { count },
        }
    }
}
