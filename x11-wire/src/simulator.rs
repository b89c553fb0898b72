//! In-memory transport for deterministic testing.
//!
//! Real sockets rarely produce the awkward cases the engine must handle.
//! [`pair`] returns a client-side [`SimulatedStream`] implementing
//! [`Transport`] and a [`SimulatedPeer`] that plays the server, with a
//! configurable fault model:
//!
//! | Fault            | Description                                        |
//! |------------------|----------------------------------------------------|
//! | Short reads      | `receive` returns random chunks of at most         |
//! |                  | `max_read_chunk` bytes.                            |
//! | Short writes     | `send` accepts random chunks of at most            |
//! |                  | `max_write_chunk` bytes.                           |
//! | Back-pressure    | `send` would block once `write_capacity` bytes are |
//! |                  | waiting for the peer.                              |
//! | I/O failure      | [`SimulatedPeer::inject_error`] fails every later   |
//! |                  | transport call.                                    |
//! | No fd passing    | `fd_passing: false` behaves like TCP.              |
//!
//! Chunk sizes come from a seeded RNG so a failing test is reproducible.
//!
//! Descriptors travel like `SCM_RIGHTS`: attached to the first byte of the
//! write that carried them, and a read never crosses into the next write's
//! bytes, so they are delivered with the chunk starting at that byte.

use std::collections::VecDeque;
use std::io;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::buffer::BufferWithFds;
use crate::transport::{
    check_payload, peer_closed, PollMode, Readiness, ReceiveStatus, SendStatus, StreamError,
    Transport,
};

/// Configuration for the fault model.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Seed for chunk-size selection.
    pub seed: u64,
    /// Largest chunk one `receive` returns.
    pub max_read_chunk: usize,
    /// Largest chunk one internal write step accepts.
    pub max_write_chunk: usize,
    /// Bytes the client may have in flight before `send` would block.
    pub write_capacity: usize,
    /// Whether descriptors may be attached.
    pub fd_passing: bool,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        // No faults: a transparent in-memory socket pair.
        Self {
            seed: 0,
            max_read_chunk: 64 * 1024,
            max_write_chunk: 64 * 1024,
            write_capacity: 1 << 20,
            fd_passing: true,
        }
    }
}

impl SimulatorConfig {
    /// Tiny random chunks in both directions and little buffer space.
    pub fn short_io(seed: u64) -> Self {
        Self {
            seed,
            max_read_chunk: 7,
            max_write_chunk: 5,
            write_capacity: 64,
            fd_passing: true,
        }
    }
}

/// Bytes written in one call plus the descriptors attached to their first
/// byte.
#[derive(Debug)]
struct Segment {
    bytes: Vec<u8>,
    offset: usize,
    fds: Vec<OwnedFd>,
}

impl Segment {
    fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }
}

#[derive(Debug)]
struct Wire {
    /// Peer → client.
    inbound: VecDeque<Segment>,
    /// Client → peer.
    outbound: VecDeque<Segment>,
    outbound_len: usize,
    injected: Option<io::ErrorKind>,
    peer_closed: bool,
    client_closed: bool,
    rng: StdRng,
}

impl Wire {
    fn readable(&self) -> bool {
        !self.inbound.is_empty() || self.peer_closed || self.client_closed || self.injected.is_some()
    }

    fn writable(&self, capacity: usize) -> bool {
        self.outbound_len < capacity || self.peer_closed || self.client_closed || self.injected.is_some()
    }

    fn check_failed(&self) -> Result<(), StreamError> {
        match self.injected {
            Some(kind) => Err(io::Error::new(kind, "injected failure").into()),
            None => Ok(()),
        }
    }
}

#[derive(Debug)]
struct Shared {
    config: SimulatorConfig,
    wire: Mutex<Wire>,
    changed: Condvar,
    send_calls: AtomicUsize,
    receive_calls: AtomicUsize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Wire> {
        self.wire.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait on the condition variable until `deadline`.  Returns `false` once
    /// it has passed.
    fn wait<'a>(&self, wire: MutexGuard<'a, Wire>, deadline: Instant) -> (MutexGuard<'a, Wire>, bool) {
        let now = Instant::now();
        if now >= deadline {
            return (wire, false);
        }
        let (wire, _) = self
            .changed
            .wait_timeout(wire, deadline - now)
            .unwrap_or_else(PoisonError::into_inner);
        (wire, true)
    }
}

/// Create a connected simulator pair.
pub fn pair(config: SimulatorConfig) -> (SimulatedStream, SimulatedPeer) {
    let wire = Wire {
        inbound: VecDeque::new(),
        outbound: VecDeque::new(),
        outbound_len: 0,
        injected: None,
        peer_closed: false,
        client_closed: false,
        rng: StdRng::seed_from_u64(config.seed),
    };
    let shared = Arc::new(Shared {
        config,
        wire: Mutex::new(wire),
        changed: Condvar::new(),
        send_calls: AtomicUsize::new(0),
        receive_calls: AtomicUsize::new(0),
    });
    (
        SimulatedStream {
            shared: Arc::clone(&shared),
        },
        SimulatedPeer { shared },
    )
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

/// The client end; hand it to [`crate::connection::Connection`].
#[derive(Debug)]
pub struct SimulatedStream {
    shared: Arc<Shared>,
}

impl Transport for SimulatedStream {
    fn poll(&self, mode: PollMode, timeout: Option<Duration>) -> io::Result<Readiness> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let capacity = self.shared.config.write_capacity;
        let mut wire = self.shared.lock();
        loop {
            let ready = Readiness {
                readable: wire.readable(),
                writable: wire.writable(capacity),
            };
            if ready.satisfies(mode) {
                return Ok(ready);
            }
            wire = match deadline {
                None => self
                    .shared
                    .changed
                    .wait(wire)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => match self.shared.wait(wire, deadline) {
                    (wire, true) => wire,
                    (_, false) => return Ok(Readiness::default()),
                },
            };
        }
    }

    fn send(&self, buf: &mut BufferWithFds) -> Result<SendStatus, StreamError> {
        self.shared.send_calls.fetch_add(1, Ordering::SeqCst);
        let config = &self.shared.config;
        let mut wire = self.shared.lock();
        wire.check_failed()?;
        if !buf.fds().is_empty() && !config.fd_passing {
            return Err(StreamError::FdPassingUnsupported);
        }
        check_payload(buf)?;
        if wire.peer_closed || wire.client_closed {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe).into());
        }

        let mut sent = 0;
        while !buf.is_complete() {
            let space = config.write_capacity.saturating_sub(wire.outbound_len);
            if space == 0 {
                self.shared.changed.notify_all();
                return Ok(SendStatus::WouldBlock { sent });
            }
            let chunk = wire.rng.random_range(1..=config.max_write_chunk.max(1));
            let n = chunk.min(space).min(buf.remaining().len());
            let bytes = buf.remaining()[..n].to_vec();
            buf.advance(n);
            wire.outbound.push_back(Segment {
                bytes,
                offset: 0,
                fds: buf.take_fds(),
            });
            wire.outbound_len += n;
            sent += n;
        }
        self.shared.changed.notify_all();
        Ok(SendStatus::Complete)
    }

    fn receive(&self, max_len: usize) -> Result<ReceiveStatus, StreamError> {
        self.shared.receive_calls.fetch_add(1, Ordering::SeqCst);
        let max_read_chunk = self.shared.config.max_read_chunk.max(1);
        let mut wire = self.shared.lock();
        wire.check_failed()?;
        if wire.client_closed {
            return Err(peer_closed().into());
        }

        if wire.inbound.is_empty() {
            if wire.peer_closed {
                return Err(peer_closed().into());
            }
            return Ok(ReceiveStatus::WouldBlock);
        }

        let wire = &mut *wire;
        let chunk = wire.rng.random_range(1..=max_read_chunk);
        let Some(segment) = wire.inbound.front_mut() else {
            return Ok(ReceiveStatus::WouldBlock);
        };

        let n = chunk.min(max_len.max(1)).min(segment.remaining());
        let bytes = segment.bytes[segment.offset..segment.offset + n].to_vec();
        let fds = std::mem::take(&mut segment.fds);
        segment.offset += n;
        if segment.remaining() == 0 {
            wire.inbound.pop_front();
        }
        Ok(ReceiveStatus::Data(BufferWithFds::new(bytes, fds)))
    }

    fn supports_fds(&self) -> bool {
        self.shared.config.fd_passing
    }

    fn shutdown(&self) -> io::Result<()> {
        self.shared.lock().client_closed = true;
        self.shared.changed.notify_all();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Server side
// ---------------------------------------------------------------------------

/// The server end, driven directly by tests.
#[derive(Debug, Clone)]
pub struct SimulatedPeer {
    shared: Arc<Shared>,
}

impl SimulatedPeer {
    /// Queue bytes for the client.
    pub fn write(&self, bytes: &[u8]) {
        self.write_with_fds(bytes, Vec::new());
    }

    /// Queue bytes for the client with descriptors attached to the first one.
    pub fn write_with_fds(&self, bytes: &[u8], fds: Vec<OwnedFd>) {
        self.shared.lock().inbound.push_back(Segment {
            bytes: bytes.to_vec(),
            offset: 0,
            fds,
        });
        self.shared.changed.notify_all();
    }

    /// Read exactly `len` bytes the client sent, with every descriptor that
    /// arrived with them.
    ///
    /// Fails with [`io::ErrorKind::TimedOut`] if they do not show up in
    /// time, or [`io::ErrorKind::UnexpectedEof`] if the client shut down.
    pub fn read_exact(&self, len: usize, timeout: Duration) -> io::Result<BufferWithFds> {
        let deadline = Instant::now() + timeout;
        let mut bytes = Vec::with_capacity(len);
        let mut fds = Vec::new();
        let mut wire = self.shared.lock();

        loop {
            let before = bytes.len();
            while bytes.len() < len {
                let Some(segment) = wire.outbound.front_mut() else {
                    break;
                };
                let n = (len - bytes.len()).min(segment.remaining());
                bytes.extend_from_slice(&segment.bytes[segment.offset..segment.offset + n]);
                fds.append(&mut segment.fds);
                segment.offset += n;
                if segment.remaining() == 0 {
                    wire.outbound.pop_front();
                }
            }
            wire.outbound_len -= bytes.len() - before;
            if bytes.len() > before {
                // Room for the client to write more.
                self.shared.changed.notify_all();
            }
            if bytes.len() == len {
                return Ok(BufferWithFds::new(bytes, fds));
            }
            if wire.client_closed {
                return Err(peer_closed());
            }

            let (guard, in_time) = self.shared.wait(wire, deadline);
            wire = guard;
            if !in_time {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("wanted {len} bytes, got {}", bytes.len()),
                ));
            }
        }
    }

    /// Read one complete request, using its length field.
    pub fn read_request(&self, timeout: Duration) -> io::Result<BufferWithFds> {
        let head = self.read_exact(4, timeout)?;
        let words = u16::from_ne_bytes([head.bytes()[2], head.bytes()[3]]);
        let (mut bytes, mut fds) = head.into_parts();

        let total = if words == 0 {
            let big = self.read_exact(4, timeout)?;
            let b = big.bytes();
            let total = u32::from_ne_bytes([b[0], b[1], b[2], b[3]]) as usize * 4;
            let (more, more_fds) = big.into_parts();
            bytes.extend(more);
            fds.extend(more_fds);
            total
        } else {
            usize::from(words) * 4
        };

        if total > bytes.len() {
            let rest = self.read_exact(total - bytes.len(), timeout)?;
            let (more, more_fds) = rest.into_parts();
            bytes.extend(more);
            fds.extend(more_fds);
        }
        Ok(BufferWithFds::new(bytes, fds))
    }

    /// Bytes sent by the client and not read yet.
    pub fn pending_len(&self) -> usize {
        self.shared.lock().outbound_len
    }

    /// Make every later client transport call fail with `kind`.
    pub fn inject_error(&self, kind: io::ErrorKind) {
        self.shared.lock().injected = Some(kind);
        self.shared.changed.notify_all();
    }

    /// Close the server side; the client sees end-of-stream once it has read
    /// everything already queued.
    pub fn close(&self) {
        self.shared.lock().peer_closed = true;
        self.shared.changed.notify_all();
    }

    /// `true` once the client shut its end down.
    pub fn client_closed(&self) -> bool {
        self.shared.lock().client_closed
    }

    /// Number of [`Transport::send`] calls the client made.
    pub fn send_calls(&self) -> usize {
        self.shared.send_calls.load(Ordering::SeqCst)
    }

    /// Number of [`Transport::receive`] calls the client made.
    pub fn receive_calls(&self) -> usize {
        self.shared.receive_calls.load(Ordering::SeqCst)
    }
}
