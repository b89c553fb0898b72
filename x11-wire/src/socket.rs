//! The default transport: a TCP or Unix domain socket.
//!
//! [`DefaultStream`] implements [`Transport`] over the two substrates an X
//! server listens on.  All protocol logic lives elsewhere; this module owns
//! only byte and descriptor I/O.
//!
//! - Unix sockets carry descriptors as `SCM_RIGHTS` ancillary data, attached
//!   to the first chunk of the payload that reaches the kernel.
//! - TCP cannot carry descriptors; sending a buffer that has some fails with
//!   [`StreamError::FdPassingUnsupported`] before anything is written.
//!
//! The socket is switched to non-blocking mode on construction.  Short reads
//! and writes are looped over internally until the buffer is done or the
//! socket would block.

use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};

use crate::address::Address;
use crate::buffer::BufferWithFds;
use crate::transport::{
    check_payload, peer_closed, PollMode, Readiness, ReceiveStatus, SendStatus, StreamError,
    Transport,
};

/// Most descriptors the kernel accepts in one message (Linux `SCM_MAX_FD`).
pub const MAX_FDS_PER_MESSAGE: usize = 253;

#[cfg(any(target_os = "linux", target_os = "android"))]
fn send_flags() -> MsgFlags {
    MsgFlags::MSG_NOSIGNAL
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn send_flags() -> MsgFlags {
    MsgFlags::empty()
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn recv_flags() -> MsgFlags {
    MsgFlags::MSG_CMSG_CLOEXEC
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn recv_flags() -> MsgFlags {
    MsgFlags::empty()
}

/// A connected, non-blocking stream socket.
#[derive(Debug)]
pub enum DefaultStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl DefaultStream {
    /// Connect to `address` and prepare the socket for the engine.
    ///
    /// The stream is returned straight after the substrate connect; the
    /// connection setup exchange is left to the caller.
    pub fn connect(address: &Address) -> Result<Self, StreamError> {
        let stream = match address {
            Address::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port))?;
                stream.set_nodelay(true)?;
                Self::from_tcp(stream)?
            }
            Address::Unix(path) => Self::from_unix(UnixStream::connect(path)?)?,
        };
        log::debug!("[stream] connected to {address}");
        Ok(stream)
    }

    /// Adopt an already-connected TCP socket.
    pub fn from_tcp(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self::Tcp(stream))
    }

    /// Adopt an already-connected Unix socket, e.g. one end of a socket pair
    /// handed over by whoever spawned the server.
    pub fn from_unix(stream: UnixStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self::Unix(stream))
    }
}

impl AsFd for DefaultStream {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Self::Tcp(s) => s.as_fd(),
            Self::Unix(s) => s.as_fd(),
        }
    }
}

impl Transport for DefaultStream {
    fn poll(&self, mode: PollMode, timeout: Option<Duration>) -> io::Result<Readiness> {
        let mut events = PollFlags::empty();
        if mode.wants_read() {
            events |= PollFlags::POLLIN;
        }
        if mode.wants_write() {
            events |= PollFlags::POLLOUT;
        }
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let wait = match deadline {
                None => PollTimeout::NONE,
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    PollTimeout::from(u16::try_from(left.as_millis()).unwrap_or(u16::MAX))
                }
            };
            let mut fds = [PollFd::new(self.as_fd(), events)];
            match poll(&mut fds, wait) {
                Ok(0) => {
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        return Ok(Readiness::default());
                    }
                }
                Ok(_) => {
                    let revents = fds[0].revents().unwrap_or(PollFlags::empty());
                    // Let the next read or write report what went wrong.
                    let broken = revents
                        .intersects(PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL);
                    return Ok(Readiness {
                        readable: revents.contains(PollFlags::POLLIN) || broken,
                        writable: revents.contains(PollFlags::POLLOUT) || broken,
                    });
                }
                Err(Errno::EINTR) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn send(&self, buf: &mut BufferWithFds) -> Result<SendStatus, StreamError> {
        match self {
            Self::Tcp(stream) => send_tcp(stream, buf),
            Self::Unix(stream) => send_unix(stream, buf),
        }
    }

    fn receive(&self, max_len: usize) -> Result<ReceiveStatus, StreamError> {
        let max_len = max_len.max(1);
        match self {
            Self::Tcp(stream) => receive_tcp(stream, max_len),
            Self::Unix(stream) => receive_unix(stream, max_len),
        }
    }

    fn supports_fds(&self) -> bool {
        matches!(self, Self::Unix(_))
    }

    fn shutdown(&self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.shutdown(Shutdown::Both),
            Self::Unix(s) => s.shutdown(Shutdown::Both),
        }
    }
}

// ---------------------------------------------------------------------------
// TCP
// ---------------------------------------------------------------------------

fn send_tcp(stream: &TcpStream, buf: &mut BufferWithFds) -> Result<SendStatus, StreamError> {
    if !buf.fds().is_empty() {
        return Err(StreamError::FdPassingUnsupported);
    }
    let mut writer = stream;
    let mut sent = 0;
    while !buf.is_complete() {
        match writer.write(buf.remaining()) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
            Ok(n) => {
                buf.advance(n);
                sent += n;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Ok(SendStatus::WouldBlock { sent });
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(SendStatus::Complete)
}

fn receive_tcp(stream: &TcpStream, max_len: usize) -> Result<ReceiveStatus, StreamError> {
    let mut reader = stream;
    let mut data = vec![0u8; max_len];
    loop {
        match reader.read(&mut data) {
            Ok(0) => return Err(peer_closed().into()),
            Ok(n) => {
                data.truncate(n);
                return Ok(ReceiveStatus::Data(BufferWithFds::from_bytes(data)));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReceiveStatus::WouldBlock),
            Err(e) => return Err(e.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Unix domain socket
// ---------------------------------------------------------------------------

fn send_unix(stream: &UnixStream, buf: &mut BufferWithFds) -> Result<SendStatus, StreamError> {
    check_payload(buf)?;
    if buf.fds().len() > MAX_FDS_PER_MESSAGE {
        return Err(StreamError::TooManyFds {
            count: buf.fds().len(),
            limit: MAX_FDS_PER_MESSAGE,
        });
    }

    let mut sent = 0;
    while !buf.is_complete() {
        let raw: Vec<RawFd> = buf.fds().iter().map(AsRawFd::as_raw_fd).collect();
        let rights = [ControlMessage::ScmRights(&raw)];
        let cmsgs: &[ControlMessage<'_>] = if raw.is_empty() { &[] } else { &rights };
        let iov = [IoSlice::new(buf.remaining())];

        match sendmsg::<()>(stream.as_raw_fd(), &iov, cmsgs, send_flags(), None) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
            Ok(n) => {
                buf.advance(n);
                sent += n;
                // The kernel holds its own references now; close ours.
                let passed = buf.take_fds();
                if !passed.is_empty() {
                    log::trace!("[stream] passed {} fd(s) with {n} bytes", passed.len());
                }
            }
            Err(Errno::EINTR) => {}
            Err(Errno::EAGAIN) => return Ok(SendStatus::WouldBlock { sent }),
            Err(e) => return Err(io::Error::from(e).into()),
        }
    }
    Ok(SendStatus::Complete)
}

fn receive_unix(stream: &UnixStream, max_len: usize) -> Result<ReceiveStatus, StreamError> {
    let mut data = vec![0u8; max_len];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; MAX_FDS_PER_MESSAGE]);

    loop {
        let (bytes, fds, truncated) = {
            let mut iov = [IoSliceMut::new(&mut data)];
            let msg = match recvmsg::<()>(
                stream.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buffer),
                recv_flags(),
            ) {
                Ok(msg) => msg,
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => return Ok(ReceiveStatus::WouldBlock),
                Err(e) => return Err(io::Error::from(e).into()),
            };

            let mut fds = Vec::new();
            for cmsg in msg.cmsgs().map_err(io::Error::from)? {
                if let ControlMessageOwned::ScmRights(raw) = cmsg {
                    for fd in raw {
                        // SAFETY: SCM_RIGHTS hands us freshly installed
                        // descriptors that nothing else owns.
                        fds.push(unsafe { OwnedFd::from_raw_fd(fd) });
                    }
                }
            }
            (msg.bytes, fds, msg.flags.contains(MsgFlags::MSG_CTRUNC))
        };

        if truncated {
            // Whatever did arrive is closed by dropping `fds`.
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "ancillary data truncated, file descriptors were lost",
            )
            .into());
        }
        if bytes == 0 && fds.is_empty() {
            return Err(peer_closed().into());
        }

        data.truncate(bytes);
        if !fds.is_empty() {
            log::trace!("[stream] received {} fd(s) with {bytes} bytes", fds.len());
        }
        return Ok(ReceiveStatus::Data(BufferWithFds::new(data, fds)));
    }
}
