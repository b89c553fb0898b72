//! Framing: the fixed-size header of every message exchanged with the server.
//!
//! This module is responsible for:
//! - Classifying an inbound message as a reply, an error or an event.
//! - Extracting its wire sequence number and total length from the first
//!   [`HEADER_LEN`] bytes, before the rest of the message is available.
//! - Checking that an outbound request's byte length agrees with its header.
//!
//! Nothing past the header is interpreted.  No I/O happens here.
//!
//! # Inbound layout
//!
//! Multi-byte integers use the byte order negotiated at connection setup,
//! which the client always picks to match the host, so they are read in
//! native order.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  Response type|    Detail     |         Sequence number       |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |          Extra length (replies / generic events, 4-byte units)|
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                       24 more header bytes                    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                       Extra data ...                          |
//! ```
//!
//! Response type 0 is an error, 1 a reply, anything else an event (the high
//! bit flags events produced by `SendEvent`).  Errors and ordinary events are
//! exactly [`HEADER_LEN`] bytes; replies and generic events carry
//! `4 × extra length` more.
//!
//! # Outbound layout
//!
//! ```text
//! | Major opcode  |     Detail    |   Length (4-byte units, u16)  |
//! |        Big-request length (u32), present when Length == 0     |
//! ```

use thiserror::Error;

use crate::buffer::BufferWithFds;
use crate::sequence::SequenceNumber;

/// Byte length of every inbound message header.
pub const HEADER_LEN: usize = 32;

// Byte offsets within an inbound header.
const OFF_TYPE: usize = 0;
const OFF_DETAIL: usize = 1;
const OFF_SEQUENCE: usize = 2;
const OFF_LENGTH: usize = 4;

// Byte offsets within an outbound request.
const OFF_REQUEST_LENGTH: usize = 2;
const OFF_BIG_REQUEST_LENGTH: usize = 4;

/// Response-type values with framing significance.
pub mod codes {
    /// An error for some earlier request.
    pub const ERROR: u8 = 0;
    /// A reply to some earlier request.
    pub const REPLY: u8 = 1;
    /// The only core event that carries no sequence number.
    pub const KEYMAP_NOTIFY: u8 = 11;
    /// Extension event with a variable length, framed like a reply.
    pub const GENERIC_EVENT: u8 = 35;
    /// Set on events the server relays on behalf of a `SendEvent` request.
    pub const SEND_EVENT_MASK: u8 = 0x80;
}

/// Classification of an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Reply,
    Error,
    Event,
}

/// Decoded fixed header of an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub kind: PacketKind,
    /// Raw first byte (error code lives in `detail` for errors).
    pub response_type: u8,
    /// Second byte: error code for errors, event detail for events.
    pub detail: u8,
    /// Low 16 bits of the sequence number, absent for `KeymapNotify`.
    pub sequence: Option<u16>,
    /// Total message length in bytes, header included.
    pub total_len: usize,
}

impl Header {
    /// Parse the first [`HEADER_LEN`] bytes of an inbound message.
    ///
    /// Returns [`Err`] if:
    /// - `buf` is shorter than [`HEADER_LEN`], or
    /// - the declared total length exceeds `max_len`.
    pub fn parse(buf: &[u8], max_len: usize) -> Result<Self, FramingError> {
        if buf.len() < HEADER_LEN {
            return Err(FramingError::TooShort { len: buf.len() });
        }

        let response_type = buf[OFF_TYPE];
        let detail = buf[OFF_DETAIL];
        let code = response_type & !codes::SEND_EVENT_MASK;
        let kind = match response_type {
            codes::ERROR => PacketKind::Error,
            codes::REPLY => PacketKind::Reply,
            _ => PacketKind::Event,
        };

        let sequence = if kind == PacketKind::Event && code == codes::KEYMAP_NOTIFY {
            None
        } else {
            Some(u16::from_ne_bytes([buf[OFF_SEQUENCE], buf[OFF_SEQUENCE + 1]]))
        };

        let variable = kind == PacketKind::Reply || code == codes::GENERIC_EVENT;
        let total_len = if variable {
            let words = u32::from_ne_bytes([
                buf[OFF_LENGTH],
                buf[OFF_LENGTH + 1],
                buf[OFF_LENGTH + 2],
                buf[OFF_LENGTH + 3],
            ]);
            // u32 words × 4 does not fit usize on 32-bit targets.
            let extra = usize::try_from(u64::from(words) * 4).unwrap_or(usize::MAX);
            HEADER_LEN.saturating_add(extra)
        } else {
            HEADER_LEN
        };

        if total_len > max_len {
            return Err(FramingError::TooLarge {
                declared: total_len,
                max: max_len,
            });
        }

        Ok(Self {
            kind,
            response_type,
            detail,
            sequence,
            total_len,
        })
    }
}

/// A complete inbound message: parsed header plus the raw bytes and any
/// descriptors that arrived with its first byte.
#[derive(Debug)]
pub struct Packet {
    pub header: Header,
    pub buffer: BufferWithFds,
}

/// What a reply-expecting request resolved to.
#[derive(Debug)]
pub enum ReplyOrError {
    Reply(BufferWithFds),
    Error(BufferWithFds),
}

impl ReplyOrError {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Raw bytes of the reply or error.
    pub fn bytes(&self) -> &[u8] {
        match self {
            Self::Reply(buf) | Self::Error(buf) => buf.bytes(),
        }
    }

    pub fn into_buffer(self) -> BufferWithFds {
        match self {
            Self::Reply(buf) | Self::Error(buf) => buf,
        }
    }
}

/// An unsolicited message: a real event, or an error for a request that was
/// sent without expecting a reply.
#[derive(Debug)]
pub struct Event {
    /// Last request the server had processed when it generated this event.
    ///
    /// For diagnostics only; events are not ordered by it.
    pub sequence: SequenceNumber,
    pub buffer: BufferWithFds,
}

impl Event {
    /// Event code with the `SendEvent` flag stripped (0 for errors).
    pub fn code(&self) -> u8 {
        self.buffer.bytes()[OFF_TYPE] & !codes::SEND_EVENT_MASK
    }

    /// `true` for errors of requests sent without a reply.
    pub fn is_error(&self) -> bool {
        self.buffer.bytes()[OFF_TYPE] == codes::ERROR
    }

    /// `true` if the server relayed this event for a `SendEvent` request.
    pub fn is_sent_event(&self) -> bool {
        self.buffer.bytes()[OFF_TYPE] & codes::SEND_EVENT_MASK != 0
    }
}

/// Check that an outbound request's byte length matches its header.
///
/// Returns [`Err`] if:
/// - the request is shorter than 4 bytes,
/// - its length is not a multiple of 4, or
/// - the declared length (or big-request length when the 16-bit field is
///   zero) disagrees with the byte count.
pub fn validate_request(bytes: &[u8]) -> Result<(), FramingError> {
    if bytes.len() < 4 {
        return Err(FramingError::TooShort { len: bytes.len() });
    }
    if bytes.len() % 4 != 0 {
        return Err(FramingError::Unaligned { len: bytes.len() });
    }

    let short =
        u16::from_ne_bytes([bytes[OFF_REQUEST_LENGTH], bytes[OFF_REQUEST_LENGTH + 1]]);
    let declared_words = if short != 0 {
        u64::from(short)
    } else {
        if bytes.len() < 8 {
            return Err(FramingError::TooShort { len: bytes.len() });
        }
        u64::from(u32::from_ne_bytes([
            bytes[OFF_BIG_REQUEST_LENGTH],
            bytes[OFF_BIG_REQUEST_LENGTH + 1],
            bytes[OFF_BIG_REQUEST_LENGTH + 2],
            bytes[OFF_BIG_REQUEST_LENGTH + 3],
        ]))
    };

    let declared = declared_words * 4;
    if declared != bytes.len() as u64 {
        return Err(FramingError::LengthMismatch {
            declared,
            actual: bytes.len(),
        });
    }
    Ok(())
}

/// Framing violations.  Inbound ones are fatal to the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    /// Fewer bytes than the fixed header requires.
    #[error("{len} bytes is too short for a message header")]
    TooShort { len: usize },
    /// Requests are padded to 4-byte units.
    #[error("request length {len} is not a multiple of 4")]
    Unaligned { len: usize },
    /// The header's length field disagrees with the byte count.
    #[error("header declares {declared} bytes but the buffer holds {actual}")]
    LengthMismatch { declared: u64, actual: usize },
    /// The declared length exceeds the configured maximum.
    #[error("message declares {declared} bytes, limit is {max}")]
    TooLarge { declared: usize, max: usize },
    /// A reply arrived for a sequence number nobody is waiting on.
    #[error("reply with wire sequence {sequence} matches no pending request")]
    UnsolicitedReply { sequence: u16 },
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 1 << 20;

    fn header(response_type: u8, seq: u16, extra_words: u32) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[OFF_TYPE] = response_type;
        buf[OFF_SEQUENCE..OFF_SEQUENCE + 2].copy_from_slice(&seq.to_ne_bytes());
        buf[OFF_LENGTH..OFF_LENGTH + 4].copy_from_slice(&extra_words.to_ne_bytes());
        buf
    }

    fn request(opcode: u8, words: u16, total: usize) -> Vec<u8> {
        let mut buf = vec![0u8; total];
        buf[0] = opcode;
        buf[OFF_REQUEST_LENGTH..OFF_REQUEST_LENGTH + 2].copy_from_slice(&words.to_ne_bytes());
        buf
    }

    #[test]
    fn reply_length_includes_extra_words() {
        let h = Header::parse(&header(codes::REPLY, 7, 3), MAX).unwrap();
        assert_eq!(h.kind, PacketKind::Reply);
        assert_eq!(h.sequence, Some(7));
        assert_eq!(h.total_len, HEADER_LEN + 12);
    }

    #[test]
    fn error_is_fixed_size_even_with_garbage_length() {
        let h = Header::parse(&header(codes::ERROR, 9, 0xdead_beef), MAX).unwrap();
        assert_eq!(h.kind, PacketKind::Error);
        assert_eq!(h.sequence, Some(9));
        assert_eq!(h.total_len, HEADER_LEN);
    }

    #[test]
    fn ordinary_event_is_fixed_size() {
        // Expose event, length bytes are event payload here.
        let h = Header::parse(&header(12, 40, 99), MAX).unwrap();
        assert_eq!(h.kind, PacketKind::Event);
        assert_eq!(h.total_len, HEADER_LEN);
    }

    #[test]
    fn generic_event_is_variable_length() {
        let h = Header::parse(&header(codes::GENERIC_EVENT, 1, 2), MAX).unwrap();
        assert_eq!(h.kind, PacketKind::Event);
        assert_eq!(h.total_len, HEADER_LEN + 8);
    }

    #[test]
    fn send_event_flag_keeps_event_framing() {
        let h = Header::parse(&header(codes::GENERIC_EVENT | codes::SEND_EVENT_MASK, 1, 2), MAX)
            .unwrap();
        assert_eq!(h.kind, PacketKind::Event);
        assert_eq!(h.total_len, HEADER_LEN + 8);
    }

    #[test]
    fn keymap_notify_has_no_sequence() {
        let h = Header::parse(&header(codes::KEYMAP_NOTIFY, 0x1234, 0), MAX).unwrap();
        assert_eq!(h.sequence, None);
    }

    #[test]
    fn short_header_is_rejected() {
        assert_eq!(
            Header::parse(&[1u8; HEADER_LEN - 1], MAX),
            Err(FramingError::TooShort { len: HEADER_LEN - 1 })
        );
    }

    #[test]
    fn oversized_reply_is_rejected() {
        let err = Header::parse(&header(codes::REPLY, 1, u32::MAX), MAX).unwrap_err();
        assert!(matches!(err, FramingError::TooLarge { max: MAX, .. }), "{err:?}");
    }

    #[test]
    fn validate_accepts_consistent_request() {
        assert_eq!(validate_request(&request(43, 1, 4)), Ok(()));
        assert_eq!(validate_request(&request(1, 8, 32)), Ok(()));
    }

    #[test]
    fn validate_rejects_mismatched_length() {
        assert_eq!(
            validate_request(&request(1, 2, 4)),
            Err(FramingError::LengthMismatch {
                declared: 8,
                actual: 4
            })
        );
    }

    #[test]
    fn validate_rejects_unaligned_and_short() {
        assert_eq!(validate_request(&[0u8; 2]), Err(FramingError::TooShort { len: 2 }));
        assert_eq!(validate_request(&[0u8; 6]), Err(FramingError::Unaligned { len: 6 }));
    }

    #[test]
    fn validate_big_request() {
        let mut buf = request(72, 0, 16);
        buf[OFF_BIG_REQUEST_LENGTH..OFF_BIG_REQUEST_LENGTH + 4]
            .copy_from_slice(&4u32.to_ne_bytes());
        assert_eq!(validate_request(&buf), Ok(()));

        buf[OFF_BIG_REQUEST_LENGTH..OFF_BIG_REQUEST_LENGTH + 4]
            .copy_from_slice(&5u32.to_ne_bytes());
        assert!(matches!(
            validate_request(&buf),
            Err(FramingError::LengthMismatch { declared: 20, .. })
        ));
    }

    #[test]
    fn event_accessors() {
        let mut bytes = header(codes::GENERIC_EVENT | codes::SEND_EVENT_MASK, 0, 0).to_vec();
        let ev = Event {
            sequence: 3,
            buffer: BufferWithFds::from_bytes(bytes.clone()),
        };
        assert_eq!(ev.code(), codes::GENERIC_EVENT);
        assert!(ev.is_sent_event());
        assert!(!ev.is_error());

        bytes[OFF_TYPE] = codes::ERROR;
        let err = Event {
            sequence: 3,
            buffer: BufferWithFds::from_bytes(bytes),
        };
        assert!(err.is_error());
    }
}
