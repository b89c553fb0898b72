//! Outbound request queue.
//!
//! [`Sender`] holds requests that have been assigned a sequence number but
//! whose bytes have not all reached the transport yet.  It does **not** decide
//! when to write; [`crate::connection::Connection`] calls [`Sender::write_some`]
//! and owns the blocking and polling policy.
//!
//! # Contract
//! - Requests leave in the order they were pushed, which is sequence order.
//! - A request's descriptors travel with its first transmitted chunk.
//! - A partially written request stays at the front; the next call resumes
//!   at the byte where the transport stopped.

use std::collections::VecDeque;

use crate::buffer::BufferWithFds;
use crate::sequence::SequenceNumber;
use crate::transport::{SendStatus, StreamError, Transport};

// ---------------------------------------------------------------------------
// OutboundRequest
// ---------------------------------------------------------------------------

/// A request waiting for the transport.
#[derive(Debug)]
struct OutboundRequest {
    seq: SequenceNumber,
    buffer: BufferWithFds,
}

// ---------------------------------------------------------------------------
// Sender
// ---------------------------------------------------------------------------

/// Ordered write queue with resumable progress.
#[derive(Debug, Default)]
pub struct Sender {
    queue: VecDeque<OutboundRequest>,
    /// Bytes still to be written across the whole queue.
    queued_bytes: usize,
    /// Highest sequence number whose bytes have all been written.
    written_through: SequenceNumber,
}

impl Sender {
    /// An empty queue.  `written_through` starts at the last sequence number
    /// consumed before the queue existed.
    pub fn new(written_through: SequenceNumber) -> Self {
        Self {
            queue: VecDeque::new(),
            queued_bytes: 0,
            written_through,
        }
    }

    /// Append a request.
    pub fn push(&mut self, seq: SequenceNumber, buffer: BufferWithFds) {
        debug_assert!(
            self.queue.back().map_or(seq > self.written_through, |r| seq > r.seq),
            "requests must be queued in sequence order"
        );
        self.queued_bytes += buffer.remaining().len();
        self.queue.push_back(OutboundRequest { seq, buffer });
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of requests not completely written.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    pub fn written_through(&self) -> SequenceNumber {
        self.written_through
    }

    /// Drop everything still queued, closing any descriptors it holds.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.queued_bytes = 0;
    }

    /// Write as much of the queue as the transport takes without blocking.
    ///
    /// Returns `Ok(true)` once the queue is empty, `Ok(false)` if the
    /// transport would block first.  On `Err` the queue is left as it was at
    /// the failure; the caller is expected to give up on the connection.
    pub fn write_some<T>(&mut self, stream: &T) -> Result<bool, StreamError>
    where
        T: Transport + ?Sized,
    {
        while let Some(front) = self.queue.front_mut() {
            let before = front.buffer.remaining().len();
            match stream.send(&mut front.buffer)? {
                SendStatus::Complete => {
                    self.queued_bytes -= before;
                    self.written_through = front.seq;
                    log::trace!("[conn] → #{} written ({} bytes)", front.seq, front.buffer.len());
                    self.queue.pop_front();
                }
                SendStatus::WouldBlock { sent } => {
                    self.queued_bytes -= sent;
                    log::trace!(
                        "[conn] → #{} blocked, {} bytes left",
                        front.seq,
                        front.buffer.remaining().len()
                    );
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}
