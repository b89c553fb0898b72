//! Sequence-number bookkeeping for one connection.
//!
//! The server numbers every request it processes and stamps replies, errors
//! and events with the low 16 bits of that number.  [`SequenceTracker`]
//! keeps the full 64-bit counter on our side and maps the truncated wire
//! value back to the request it belongs to.
//!
//! # Protocol contract
//!
//! - Every request consumes exactly one sequence number, whether or not it
//!   produces a reply.  The first request after connection setup is 1.
//! - Only requests that can produce a reply are *pending*; they are kept in
//!   increasing order.
//! - The server processes requests in order, so replies and errors arrive in
//!   non-decreasing sequence order.  Matching relies on this: when several
//!   pending numbers share the same low 16 bits, the oldest one is the one
//!   being answered.  Numbers that were already answered are no longer
//!   pending and can never be matched again, however the low bits alias.
//!
//! This module only manages state; all socket I/O is the caller's
//! responsibility.

use std::collections::VecDeque;

/// Full, never-wrapping sequence number.
pub type SequenceNumber = u64;

/// Number of distinct values the wire can express (16 bits).
const WIRE_SPAN: u64 = 1 << 16;
const WIRE_MASK: u64 = WIRE_SPAN - 1;

/// Extends wire sequence numbers and matches them to pending requests.
///
/// ```text
///  last_received         pending…         last_sent
///        │             │    │    │            │
///  ──────┼─────────────┼────┼────┼────────────┼──────▶ sequence space
/// ```
#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    /// Highest number handed to a request so far.
    last_sent: SequenceNumber,
    /// Highest number seen on any inbound message.
    last_received: SequenceNumber,
    /// Reply-expecting requests not yet answered, oldest first.
    pending: VecDeque<SequenceNumber>,
}

impl SequenceTracker {
    /// A tracker for a fresh connection: the first request gets number 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// A tracker whose first request gets `last + 1`.
    ///
    /// Used when a handshake collaborator already spent sequence numbers, and
    /// to exercise wraparound without issuing billions of requests.
    pub fn starting_after(last: SequenceNumber) -> Self {
        Self {
            last_sent: last,
            last_received: last,
            pending: VecDeque::new(),
        }
    }

    /// Consume the next sequence number for a new request.
    ///
    /// When `expects_reply` is set the number becomes pending until
    /// [`match_response`](Self::match_response) claims it.
    pub fn next_request(&mut self, expects_reply: bool) -> SequenceNumber {
        self.last_sent += 1;
        if expects_reply {
            self.pending.push_back(self.last_sent);
        }
        self.last_sent
    }

    /// Claim the pending request answered by a reply or error carrying
    /// `wire` in its header.
    ///
    /// Returns the smallest pending number whose low 16 bits equal `wire` and
    /// removes it, or `None` when no pending request matches.
    pub fn match_response(&mut self, wire: u16) -> Option<SequenceNumber> {
        let idx = self
            .pending
            .iter()
            .position(|&seq| seq & WIRE_MASK == u64::from(wire))?;
        let seq = self.pending.remove(idx)?;
        self.observe(seq);
        Some(seq)
    }

    /// Widen the wire sequence of an event or unchecked error.
    ///
    /// Picks the smallest full number not below the last one received whose
    /// low bits match, stepping back a wrap if that would lie beyond the last
    /// request sent.
    pub fn extend(&self, wire: u16) -> SequenceNumber {
        let base = self.last_received;
        let mut full = (base & !WIRE_MASK) | u64::from(wire);
        if full < base {
            full += WIRE_SPAN;
        }
        if full > self.last_sent && full >= WIRE_SPAN {
            full -= WIRE_SPAN;
        }
        full
    }

    /// Record that an inbound message carried `seq`.
    pub fn observe(&mut self, seq: SequenceNumber) {
        self.last_received = self.last_received.max(seq);
    }

    pub fn is_pending(&self, seq: SequenceNumber) -> bool {
        self.pending.contains(&seq)
    }

    /// Number of reply-expecting requests still unanswered.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Highest number handed out so far (0 before the first request).
    pub fn last_sent(&self) -> SequenceNumber {
        self.last_sent
    }

    /// Highest number seen on an inbound message.
    pub fn last_received(&self) -> SequenceNumber {
        self.last_received
    }
}

/// Low 16 bits of a full sequence number, as they appear on the wire.
pub fn wire_sequence(seq: SequenceNumber) -> u16 {
    (seq & WIRE_MASK) as u16
}
