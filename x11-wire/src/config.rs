//! Engine tunables.

use crate::sequence::SequenceNumber;
use crate::socket::MAX_FDS_PER_MESSAGE;

/// Adjustable parameters of a [`crate::connection::Connection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Largest single read from the transport.
    pub read_chunk_size: usize,
    /// Inbound messages declaring more bytes than this are a framing error.
    pub max_packet_len: usize,
    /// Most descriptors one request may carry.  Values above
    /// [`MAX_FDS_PER_MESSAGE`] are capped when the connection is built.
    pub max_fds_per_request: usize,
    /// Sequence number already consumed before the engine took over (by the
    /// connection setup, for instance).  The first request gets this plus 1.
    pub initial_sequence: SequenceNumber,
    /// Check each request's length field against its byte count before
    /// queueing it.
    pub validate_requests: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: 4096,
            max_packet_len: 64 << 20,
            max_fds_per_request: MAX_FDS_PER_MESSAGE,
            initial_sequence: 0,
            validate_requests: true,
        }
    }
}
