//! The unit of I/O: a byte payload plus the file descriptors travelling with it.
//!
//! A [`BufferWithFds`] is handed to a [`crate::transport::Transport`] for
//! sending and is produced by one when receiving.  It carries a write cursor so
//! that a send interrupted by a would-block condition resumes at the correct
//! byte offset, and it gives up its descriptors exactly once: they travel with
//! the first chunk of the payload that reaches the kernel and are never
//! re-sent on retry.
//!
//! Descriptors are held as [`OwnedFd`], so every failure path closes them by
//! drop and a received descriptor has exactly one owner.

use std::os::fd::OwnedFd;

/// Contiguous bytes plus zero or more descriptors, consumed in order.
#[derive(Debug, Default)]
pub struct BufferWithFds {
    bytes: Vec<u8>,
    /// Number of leading bytes already handed to the transport.
    offset: usize,
    fds: Vec<OwnedFd>,
}

impl BufferWithFds {
    /// Build a buffer from a payload and its descriptors.
    ///
    /// Descriptors keep the order given here, both on the wire and at the
    /// receiving side.
    pub fn new(bytes: Vec<u8>, fds: Vec<OwnedFd>) -> Self {
        Self {
            bytes,
            offset: 0,
            fds,
        }
    }

    /// Build a buffer without descriptors.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self::new(bytes, Vec::new())
    }

    /// The complete payload, including bytes already sent.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Total payload length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Bytes not yet handed to the transport.
    pub fn remaining(&self) -> &[u8] {
        &self.bytes[self.offset..]
    }

    /// Mark `n` more bytes as transmitted.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the number of remaining bytes.
    pub fn advance(&mut self, n: usize) {
        assert!(
            n <= self.bytes.len() - self.offset,
            "advance({n}) past the end of a buffer with {} bytes left",
            self.bytes.len() - self.offset
        );
        self.offset += n;
    }

    /// `true` once every byte has been transmitted.
    pub fn is_complete(&self) -> bool {
        self.offset == self.bytes.len()
    }

    /// Descriptors still attached to this buffer.
    pub fn fds(&self) -> &[OwnedFd] {
        &self.fds
    }

    /// Detach all descriptors, leaving the buffer without any.
    ///
    /// Transports call this once the descriptors have reached the kernel so a
    /// later retry of the same buffer cannot send them twice.
    pub fn take_fds(&mut self) -> Vec<OwnedFd> {
        std::mem::take(&mut self.fds)
    }

    /// Split into the full payload and the remaining descriptors.
    pub fn into_parts(self) -> (Vec<u8>, Vec<OwnedFd>) {
        (self.bytes, self.fds)
    }
}

impl From<Vec<u8>> for BufferWithFds {
    fn from(bytes: Vec<u8>) -> Self {
        Self::from_bytes(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::os::fd::AsRawFd;

    fn dev_null() -> OwnedFd {
        OwnedFd::from(File::open("/dev/null").expect("open /dev/null"))
    }

    #[test]
    fn advance_moves_the_cursor() {
        let mut buf = BufferWithFds::from_bytes(vec![1, 2, 3, 4, 5]);
        assert_eq!(buf.remaining(), &[1, 2, 3, 4, 5]);

        buf.advance(2);
        assert_eq!(buf.remaining(), &[3, 4, 5]);
        assert_eq!(buf.bytes(), &[1, 2, 3, 4, 5]);
        assert!(!buf.is_complete());

        buf.advance(3);
        assert!(buf.remaining().is_empty());
        assert!(buf.is_complete());
    }

    #[test]
    #[should_panic(expected = "past the end")]
    fn advance_past_end_panics() {
        let mut buf = BufferWithFds::from_bytes(vec![0; 4]);
        buf.advance(5);
    }

    #[test]
    fn take_fds_preserves_order_and_empties() {
        let fds = vec![dev_null(), dev_null(), dev_null()];
        let raw: Vec<_> = fds.iter().map(|fd| fd.as_raw_fd()).collect();

        let mut buf = BufferWithFds::new(vec![0; 4], fds);
        let taken = buf.take_fds();

        assert_eq!(taken.iter().map(|fd| fd.as_raw_fd()).collect::<Vec<_>>(), raw);
        assert!(buf.fds().is_empty());
        assert!(buf.take_fds().is_empty(), "descriptors must leave only once");
    }

    #[test]
    fn empty_buffer_is_complete() {
        let buf = BufferWithFds::default();
        assert!(buf.is_empty());
        assert!(buf.is_complete());
    }
}
