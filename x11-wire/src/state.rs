//! Connection and per-request state types.
//!
//! Transitions are not implemented here; they live in [`crate::connection`].
//! The diagrams below list every legal one.
//!
//! ```text
//!  OPEN ──I/O error / framing error / shutdown──▶ CLOSED
//! ```
//!
//! A reply-expecting request moves through:
//!
//! ```text
//!  SENT ──bytes written──▶ AWAITING_REPLY ──reply/error──▶ RESOLVED ──taken──▶ (removed)
//!    │                          │
//!    └───────fatal error────────┴──────────────────────▶ CLOSED(err) ──taken──▶ (removed)
//!    │                          │
//!    └────────discard───────────┴──────────────────────▶ DISCARDED ──answer──▶ (removed)
//! ```

use std::fmt;

use crate::error::ConnectionError;
use crate::packet::ReplyOrError;

// ---------------------------------------------------------------------------
// ConnectionState
// ---------------------------------------------------------------------------

/// Whether the connection can still carry traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Requests may be sent and responses are being read.
    #[default]
    Open,
    /// A fatal error or an explicit shutdown ended the connection.  Nothing
    /// touches the transport any more.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => f.write_str("open"),
            Self::Closed => f.write_str("closed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Per-request state
// ---------------------------------------------------------------------------

/// What to do with the answer to a request nobody will wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardMode {
    /// Drop the reply but deliver an error to the event queue.
    DiscardReply,
    /// Drop both reply and error.
    DiscardReplyAndError,
}

/// Internal bookkeeping for one reply-expecting request.
#[derive(Debug)]
pub(crate) enum RequestState {
    /// Queued; some bytes may still be waiting in the output buffer.
    Sent,
    /// Fully written; the answer has not arrived yet.
    AwaitingReply,
    /// Answered; waiting for someone to take the result.
    Resolved(ReplyOrError),
    /// The connection died first.  Taken once, as `Err`.
    Closed(ConnectionError),
    /// The caller gave up on the answer.
    Discarded(DiscardMode),
}

impl RequestState {
    pub(crate) fn status(&self) -> RequestStatus {
        match self {
            Self::Sent => RequestStatus::Sent,
            Self::AwaitingReply => RequestStatus::AwaitingReply,
            Self::Resolved(_) => RequestStatus::Resolved,
            Self::Closed(_) => RequestStatus::Closed,
            Self::Discarded(_) => RequestStatus::Discarded,
        }
    }

    /// `true` once a waiter would not block on this entry.
    pub(crate) fn is_settled(&self) -> bool {
        matches!(self, Self::Resolved(_) | Self::Closed(_))
    }
}

/// Public snapshot of a request's progress, see
/// [`crate::connection::Connection::request_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Sent,
    AwaitingReply,
    Resolved,
    Closed,
    Discarded,
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Sent => "sent",
            Self::AwaitingReply => "awaiting reply",
            Self::Resolved => "resolved",
            Self::Closed => "closed",
            Self::Discarded => "discarded",
        };
        f.write_str(s)
    }
}

/// How far [`crate::connection::Connection::poll_for_event`] may go to find
/// an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventPoll {
    /// Only look at events already read.
    #[default]
    QueueOnly,
    /// Also do one non-blocking read if the queue is empty.
    ReadIfReady,
}
