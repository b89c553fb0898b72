//! Inbound message reassembly.
//!
//! The transport hands over bytes in whatever chunks the kernel produced.
//! [`Receiver`] stitches them back into complete messages:
//! - Buffering a partial header until all [`HEADER_LEN`] bytes are in.
//! - Parsing the header to learn the message length.
//! - Buffering the body until the message is complete.
//! - Attaching received descriptors to the right message.
//!
//! Descriptors arriving with a chunk belong to the message in progress at the
//! chunk's first byte (a new message if nothing is in progress).  The server
//! only sends descriptors with replies, and a reply's descriptors always
//! arrive with its first byte.
//!
//! The [`Receiver`] does **not** classify or route messages; that is
//! [`crate::connection::Connection`]'s job.

use std::mem;
use std::os::fd::OwnedFd;

use crate::buffer::BufferWithFds;
use crate::packet::{FramingError, Header, Packet, HEADER_LEN};

/// Reassembly state for the read side of one connection.
#[derive(Debug)]
pub struct Receiver {
    /// Bytes of the message in progress.
    partial: Vec<u8>,
    /// Parsed header of the message in progress, once complete.
    header: Option<Header>,
    /// Descriptors for the message in progress.
    fds: Vec<OwnedFd>,
    max_packet_len: usize,
}

impl Receiver {
    /// A receiver that rejects messages declaring more than `max_packet_len`
    /// bytes.
    pub fn new(max_packet_len: usize) -> Self {
        Self {
            partial: Vec::with_capacity(HEADER_LEN),
            header: None,
            fds: Vec::new(),
            max_packet_len,
        }
    }

    /// Consume one received chunk and return every message it completed.
    ///
    /// A framing error leaves the receiver in an unspecified state; the
    /// stream cannot be resynchronised after one.
    pub fn feed(&mut self, chunk: BufferWithFds) -> Result<Vec<Packet>, FramingError> {
        let (bytes, fds) = chunk.into_parts();
        self.fds.extend(fds);

        let mut packets = Vec::new();
        let mut input = bytes.as_slice();
        loop {
            let need = self.header.map_or(HEADER_LEN, |h| h.total_len);
            let take = (need - self.partial.len()).min(input.len());
            self.partial.extend_from_slice(&input[..take]);
            input = &input[take..];
            if self.partial.len() < need {
                break;
            }

            match self.header {
                None => {
                    let header = Header::parse(&self.partial, self.max_packet_len)?;
                    self.partial.reserve(header.total_len - HEADER_LEN);
                    self.header = Some(header);
                }
                Some(header) => {
                    self.header = None;
                    let bytes = mem::replace(&mut self.partial, Vec::with_capacity(HEADER_LEN));
                    packets.push(Packet {
                        header,
                        buffer: BufferWithFds::new(bytes, mem::take(&mut self.fds)),
                    });
                    if input.is_empty() {
                        break;
                    }
                }
            }
        }
        Ok(packets)
    }

    /// Bytes of an incomplete message held back.
    pub fn buffered_len(&self) -> usize {
        self.partial.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{codes, PacketKind};
    use std::fs::File;

    const MAX: usize = 1 << 20;

    fn message(response_type: u8, seq: u16, extra_words: u32) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_LEN + extra_words as usize * 4];
        buf[0] = response_type;
        buf[2..4].copy_from_slice(&seq.to_ne_bytes());
        buf[4..8].copy_from_slice(&extra_words.to_ne_bytes());
        buf
    }

    fn dev_null() -> OwnedFd {
        OwnedFd::from(File::open("/dev/null").unwrap())
    }

    #[test]
    fn several_messages_in_one_chunk() {
        let mut rx = Receiver::new(MAX);
        let mut bytes = message(codes::REPLY, 1, 2);
        bytes.extend(message(12, 1, 0));
        bytes.extend(message(codes::ERROR, 2, 0));

        let packets = rx.feed(bytes.into()).unwrap();
        let kinds: Vec<_> = packets.iter().map(|p| p.header.kind).collect();
        assert_eq!(kinds, [PacketKind::Reply, PacketKind::Event, PacketKind::Error]);
        assert_eq!(packets[0].buffer.len(), HEADER_LEN + 8);
        assert_eq!(rx.buffered_len(), 0);
    }

    #[test]
    fn byte_at_a_time() {
        let mut rx = Receiver::new(MAX);
        let bytes = message(codes::REPLY, 5, 3);
        let mut packets = Vec::new();
        for b in &bytes {
            packets.extend(rx.feed(vec![*b].into()).unwrap());
        }
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].buffer.bytes(), &bytes[..]);
        assert_eq!(packets[0].header.sequence, Some(5));
    }

    #[test]
    fn split_inside_the_body() {
        let mut rx = Receiver::new(MAX);
        let bytes = message(codes::REPLY, 5, 4);
        assert!(rx.feed(bytes[..40].to_vec().into()).unwrap().is_empty());
        assert_eq!(rx.buffered_len(), 40);
        let packets = rx.feed(bytes[40..].to_vec().into()).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].buffer.len(), HEADER_LEN + 16);
    }

    #[test]
    fn descriptors_attach_to_message_in_progress() {
        let mut rx = Receiver::new(MAX);
        let first = message(codes::REPLY, 1, 1);
        let second = message(codes::REPLY, 2, 0);

        // Chunk starts mid-way through `first` and carries two descriptors.
        assert!(rx.feed(first[..10].to_vec().into()).unwrap().is_empty());
        let mut rest = first[10..].to_vec();
        rest.extend(&second);
        let packets = rx
            .feed(BufferWithFds::new(rest, vec![dev_null(), dev_null()]))
            .unwrap();

        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].buffer.fds().len(), 2);
        assert!(packets[1].buffer.fds().is_empty());
    }

    #[test]
    fn oversized_message_is_a_framing_error() {
        let mut rx = Receiver::new(HEADER_LEN + 4);
        let err = rx.feed(message(codes::REPLY, 1, 2).into()).unwrap_err();
        assert!(matches!(err, FramingError::TooLarge { .. }));
    }
}
