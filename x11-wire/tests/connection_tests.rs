//! Integration tests for the connection engine.
//!
//! Every test drives a [`Connection`] over the in-memory simulator.  The
//! `SimulatedPeer` plays the server: it reads requests, counts them to know
//! their sequence numbers (the server numbers every request it processes),
//! and writes hand-built replies, errors and events back.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use x11_wire::packet::{codes, HEADER_LEN};
use x11_wire::sequence::wire_sequence;
use x11_wire::simulator::{self, SimulatedPeer, SimulatedStream, SimulatorConfig};
use x11_wire::transport::{PollMode, Readiness, ReceiveStatus, SendStatus, StreamError};
use x11_wire::{
    BufferWithFds, Connection, ConnectionConfig, ConnectionError, DiscardMode, EventPoll,
    RequestStatus, SequenceNumber, Transport,
};

const TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn connect(config: SimulatorConfig) -> (Connection<SimulatedStream>, SimulatedPeer) {
    let (stream, peer) = simulator::pair(config);
    (Connection::new(stream), peer)
}

/// A 4-byte request with the given opcode.
fn request(opcode: u8) -> BufferWithFds {
    let mut bytes = vec![opcode, 0, 0, 0];
    bytes[2..4].copy_from_slice(&1u16.to_ne_bytes());
    BufferWithFds::from_bytes(bytes)
}

/// A reply for `seq` carrying `marker` in its body.
fn reply(seq: SequenceNumber, marker: u64) -> Vec<u8> {
    let mut buf = vec![0u8; HEADER_LEN + 8];
    buf[0] = codes::REPLY;
    buf[2..4].copy_from_slice(&wire_sequence(seq).to_ne_bytes());
    buf[4..8].copy_from_slice(&2u32.to_ne_bytes());
    buf[HEADER_LEN..].copy_from_slice(&marker.to_ne_bytes());
    buf
}

fn marker(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[HEADER_LEN..HEADER_LEN + 8]);
    u64::from_ne_bytes(raw)
}

fn error(seq: SequenceNumber, code: u8) -> Vec<u8> {
    let mut buf = vec![0u8; HEADER_LEN];
    buf[0] = codes::ERROR;
    buf[1] = code;
    buf[2..4].copy_from_slice(&wire_sequence(seq).to_ne_bytes());
    buf
}

fn event(code: u8, last_processed: SequenceNumber) -> Vec<u8> {
    let mut buf = vec![0u8; HEADER_LEN];
    buf[0] = code;
    buf[2..4].copy_from_slice(&wire_sequence(last_processed).to_ne_bytes());
    buf
}

// ---------------------------------------------------------------------------
// Reply correlation
// ---------------------------------------------------------------------------

#[test]
fn replies_reach_waiters_issued_out_of_order() {
    let (conn, peer) = connect(SimulatorConfig::default());
    let a = conn.send_request(request(43), true).unwrap().unwrap();
    let b = conn.send_request(request(43), true).unwrap().unwrap();
    peer.write(&reply(a, 0xa));
    peer.write(&reply(b, 0xb));

    assert_eq!(marker(conn.wait_for_reply(b).unwrap().bytes()), 0xb);
    assert_eq!(marker(conn.wait_for_reply(a).unwrap().bytes()), 0xa);
}

#[test]
fn replies_arriving_two_then_one_still_match() {
    let (conn, peer) = connect(SimulatorConfig::default());
    let a = conn.send_request(request(43), true).unwrap().unwrap();
    let b = conn.send_request(request(43), true).unwrap().unwrap();
    peer.write(&reply(b, 0xb));
    peer.write(&reply(a, 0xa));

    assert_eq!(marker(conn.wait_for_reply(a).unwrap().bytes()), 0xa);
    assert_eq!(marker(conn.wait_for_reply(b).unwrap().bytes()), 0xb);
}

#[test]
fn wait_issued_after_the_reply_arrived() {
    let (conn, peer) = connect(SimulatorConfig::default());
    let seq = conn.send_request(request(43), true).unwrap().unwrap();
    peer.write(&reply(seq, 7));

    // Pull the reply in through an unrelated call.
    assert!(conn.poll_for_event(EventPoll::ReadIfReady).unwrap().is_none());
    assert_eq!(conn.request_status(seq), Some(RequestStatus::Resolved));

    peer.inject_error(io::ErrorKind::ConnectionReset);
    assert_eq!(marker(conn.wait_for_reply(seq).unwrap().bytes()), 7);
}

#[test]
fn void_requests_consume_numbers() {
    let (conn, peer) = connect(SimulatorConfig::default());
    assert_eq!(conn.send_request(request(10), false).unwrap(), None);
    assert_eq!(conn.send_request(request(10), false).unwrap(), None);
    let seq = conn.send_request(request(43), true).unwrap().unwrap();
    assert_eq!(seq, 3);

    for _ in 0..3 {
        peer.read_request(TIMEOUT).unwrap();
    }
    peer.write(&reply(3, 3));
    assert_eq!(marker(conn.wait_for_reply(seq).unwrap().bytes()), 3);
    assert_eq!(conn.last_sequence_received(), 3);
}

#[test]
fn timeout_keeps_the_request_pending() {
    let (conn, peer) = connect(SimulatorConfig::default());
    let seq = conn.send_request(request(43), true).unwrap().unwrap();

    let started = std::time::Instant::now();
    assert!(conn
        .wait_for_reply_timeout(seq, Duration::from_millis(30))
        .unwrap()
        .is_none());
    assert!(started.elapsed() >= Duration::from_millis(30));
    assert_eq!(conn.request_status(seq), Some(RequestStatus::AwaitingReply));

    peer.write(&reply(seq, 1));
    assert_eq!(marker(conn.wait_for_reply(seq).unwrap().bytes()), 1);
}

// ---------------------------------------------------------------------------
// Events and unchecked errors
// ---------------------------------------------------------------------------

#[test]
fn events_interleaved_with_replies_stay_separate() {
    let (conn, peer) = connect(SimulatorConfig::short_io(11));
    let void = conn.send_request(request(10), false).unwrap();
    assert_eq!(void, None);
    let a = conn.send_request(request(43), true).unwrap().unwrap();
    let b = conn.send_request(request(43), true).unwrap().unwrap();

    peer.write(&event(12, 1));
    peer.write(&error(1, 3)); // for the void request
    peer.write(&reply(a, 0xa));
    peer.write(&event(28, a));
    peer.write(&reply(b, 0xb));
    peer.write(&event(codes::KEYMAP_NOTIFY, 0));

    assert_eq!(marker(conn.wait_for_reply(b).unwrap().bytes()), 0xb);
    assert_eq!(marker(conn.wait_for_reply(a).unwrap().bytes()), 0xa);

    let mut events = Vec::new();
    while let Some(ev) = conn
        .wait_for_event_timeout(Duration::from_millis(200))
        .unwrap()
    {
        events.push(ev);
        if events.len() == 4 {
            break;
        }
    }
    let kinds: Vec<_> = events.iter().map(|e| e.code()).collect();
    assert_eq!(kinds, [12, 0, 28, codes::KEYMAP_NOTIFY]);
    assert!(events[1].is_error());
    assert_eq!(events[1].sequence, 1);
    assert_eq!(events[2].sequence, a);
    assert!(conn.poll_for_event(EventPoll::ReadIfReady).unwrap().is_none());
}

#[test]
fn wait_for_event_blocks_until_one_arrives() {
    let (conn, peer) = connect(SimulatorConfig::default());
    let conn = Arc::new(conn);
    let waiter = {
        let conn = Arc::clone(&conn);
        thread::spawn(move || conn.wait_for_event())
    };
    thread::sleep(Duration::from_millis(20));
    peer.write(&event(33, 0));
    let ev = waiter.join().unwrap().unwrap();
    assert_eq!(ev.code(), 33);
    assert!(!ev.is_sent_event());
}

// ---------------------------------------------------------------------------
// Failure
// ---------------------------------------------------------------------------

#[test]
fn injected_io_error_fails_every_waiter() {
    let (conn, peer) = connect(SimulatorConfig::default());
    let conn = Arc::new(conn);
    let seqs: Vec<_> = (0..3)
        .map(|_| conn.send_request(request(43), true).unwrap().unwrap())
        .collect();

    let waiters: Vec<_> = seqs
        .iter()
        .map(|&seq| {
            let conn = Arc::clone(&conn);
            thread::spawn(move || conn.wait_for_reply(seq))
        })
        .collect();
    thread::sleep(Duration::from_millis(20));
    peer.inject_error(io::ErrorKind::ConnectionReset);

    for waiter in waiters {
        match waiter.join().unwrap() {
            Err(ConnectionError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
            other => panic!("expected the injected error, got {other:?}"),
        }
    }
    assert!(conn.is_closed());

    let calls = peer.send_calls();
    assert!(matches!(
        conn.send_request(request(43), true),
        Err(ConnectionError::Closed)
    ));
    assert!(matches!(conn.flush(), Err(ConnectionError::Closed)));
    assert_eq!(peer.send_calls(), calls, "a closed connection must not write");
}

#[test]
fn peer_close_is_reported_as_eof() {
    let (conn, peer) = connect(SimulatorConfig::default());
    let seq = conn.send_request(request(43), true).unwrap().unwrap();
    peer.write(&event(12, 0));
    peer.close();

    let err = conn.wait_for_reply(seq).unwrap_err();
    assert!(err.is_eof(), "{err:?}");
    assert_eq!(conn.drain_events().len(), 1);
    assert!(matches!(conn.wait_for_event(), Err(ConnectionError::Closed)));
}

/// Simulated stream whose writes can be made to fail without waking a
/// thread parked in `poll`, as when only the send side of a socket breaks.
struct BreakableWrites {
    stream: SimulatedStream,
    broken: AtomicBool,
}

impl Transport for BreakableWrites {
    fn poll(&self, mode: PollMode, timeout: Option<Duration>) -> io::Result<Readiness> {
        self.stream.poll(mode, timeout)
    }

    fn send(&self, buf: &mut BufferWithFds) -> Result<SendStatus, StreamError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe).into());
        }
        self.stream.send(buf)
    }

    fn receive(&self, max_len: usize) -> Result<ReceiveStatus, StreamError> {
        self.stream.receive(max_len)
    }

    fn supports_fds(&self) -> bool {
        self.stream.supports_fds()
    }

    fn shutdown(&self) -> io::Result<()> {
        self.stream.shutdown()
    }
}

#[test]
fn write_failure_wakes_a_blocked_reader() {
    let (stream, peer) = simulator::pair(SimulatorConfig::default());
    let conn = Arc::new(Connection::new(BreakableWrites {
        stream,
        broken: AtomicBool::new(false),
    }));
    let seq = conn.send_request(request(43), true).unwrap().unwrap();
    peer.read_request(TIMEOUT).unwrap();

    let (tx, rx) = mpsc::channel();
    {
        let conn = Arc::clone(&conn);
        thread::spawn(move || {
            let _ = tx.send(conn.wait_for_reply(seq));
        });
    }
    // Let the waiter settle into `poll` as the reader.
    thread::sleep(Duration::from_millis(50));

    conn.stream().broken.store(true, Ordering::SeqCst);
    match conn.send_request(request(10), false) {
        Err(ConnectionError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
        other => panic!("expected the write failure, got {other:?}"),
    }
    assert!(conn.is_closed());

    match rx.recv_timeout(TIMEOUT).expect("waiter still blocked after close") {
        Err(ConnectionError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
        other => panic!("expected the write failure, got {other:?}"),
    }
    assert!(peer.client_closed());
}

#[test]
fn closed_connection_reports_closed_for_every_number() {
    let (conn, _peer) = connect(SimulatorConfig::default());
    let seq = conn.send_request(request(43), true).unwrap().unwrap();
    conn.shutdown().unwrap();

    for _ in 0..2 {
        assert!(matches!(conn.wait_for_reply(seq), Err(ConnectionError::Closed)));
    }
    assert!(matches!(conn.poll_for_reply(seq), Err(ConnectionError::Closed)));
    assert!(matches!(conn.wait_for_reply(999), Err(ConnectionError::Closed)));
    assert!(matches!(
        conn.wait_for_reply_timeout(999, Duration::from_millis(10)),
        Err(ConnectionError::Closed)
    ));
    assert!(matches!(
        conn.discard_reply(999, DiscardMode::DiscardReply),
        Err(ConnectionError::Closed)
    ));
}

#[test]
fn oversized_reply_is_fatal() {
    let (stream, peer) = simulator::pair(SimulatorConfig::default());
    let conn = Connection::with_config(
        stream,
        ConnectionConfig {
            max_packet_len: 64,
            ..ConnectionConfig::default()
        },
    );
    let seq = conn.send_request(request(43), true).unwrap().unwrap();
    let mut big = reply(seq, 0);
    big[4..8].copy_from_slice(&100u32.to_ne_bytes());
    peer.write(&big);

    assert!(matches!(
        conn.wait_for_reply(seq),
        Err(ConnectionError::Framing(_))
    ));
    assert!(conn.is_closed());
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[test]
fn concurrent_waiters_each_get_their_own_reply() {
    const THREADS: u64 = 8;
    const ROUNDS: u64 = 25;

    let (conn, peer) = connect(SimulatorConfig::short_io(42));
    let conn = Arc::new(conn);

    // The server answers every request, echoing its sequence number.
    let server = thread::spawn(move || {
        for seq in 1..=THREADS * ROUNDS {
            peer.read_request(TIMEOUT).unwrap();
            peer.write(&reply(seq, seq));
        }
    });

    let clients: Vec<_> = (0..THREADS)
        .map(|_| {
            let conn = Arc::clone(&conn);
            thread::spawn(move || {
                for _ in 0..ROUNDS {
                    let seq = conn.send_request(request(43), true).unwrap().unwrap();
                    let answer = conn.wait_for_reply(seq).unwrap();
                    assert_eq!(marker(answer.bytes()), seq);
                }
            })
        })
        .collect();

    for client in clients {
        client.join().unwrap();
    }
    server.join().unwrap();
    assert_eq!(conn.last_sequence_sent(), THREADS * ROUNDS);
}

#[test]
fn large_request_survives_back_pressure() {
    let config = SimulatorConfig {
        write_capacity: 64,
        max_write_chunk: 9,
        ..SimulatorConfig::default()
    };
    let (conn, peer) = connect(config);

    let words: u16 = 256;
    let mut bytes = vec![0u8; usize::from(words) * 4];
    bytes[0] = 98;
    bytes[2..4].copy_from_slice(&words.to_ne_bytes());
    for (i, b) in bytes.iter_mut().enumerate().skip(4) {
        *b = i as u8;
    }
    let expected = bytes.clone();

    // Only the first 64 bytes fit; the rest waits for a flush.
    let seq = conn
        .send_request(BufferWithFds::from_bytes(bytes), true)
        .unwrap()
        .unwrap();
    assert_eq!(conn.request_status(seq), Some(RequestStatus::Sent));

    let server = thread::spawn(move || {
        let got = peer.read_request(TIMEOUT).unwrap();
        assert_eq!(got.bytes(), &expected[..]);
        peer.write(&reply(1, 99));
    });
    assert_eq!(marker(conn.wait_for_reply(seq).unwrap().bytes()), 99);
    server.join().unwrap();
}

// ---------------------------------------------------------------------------
// Sequence wraparound
// ---------------------------------------------------------------------------

#[test]
fn numbering_continues_past_32_bits() {
    let start = u64::from(u32::MAX) - 2;
    let (stream, peer) = simulator::pair(SimulatorConfig::default());
    let conn = Connection::with_config(
        stream,
        ConnectionConfig {
            initial_sequence: start,
            ..ConnectionConfig::default()
        },
    );

    let seqs: Vec<_> = (0..5)
        .map(|_| conn.send_request(request(43), true).unwrap().unwrap())
        .collect();
    assert_eq!(seqs[0], start + 1);
    assert!(seqs.windows(2).all(|w| w[1] == w[0] + 1));
    assert!(seqs[4] > u64::from(u32::MAX));

    for &seq in &seqs {
        peer.write(&reply(seq, seq));
    }
    for &seq in seqs.iter().rev() {
        assert_eq!(marker(conn.wait_for_reply(seq).unwrap().bytes()), seq);
    }
}

#[test]
fn wire_alias_goes_to_the_pending_request() {
    let (conn, peer) = connect(SimulatorConfig::default());
    let stale = conn.send_request(request(43), true).unwrap().unwrap();
    peer.write(&reply(stale, 1));
    conn.wait_for_reply(stale).unwrap();

    // One full wire period later the low 16 bits repeat.
    for _ in 0..(1u64 << 16) - 1 {
        conn.send_request(request(10), false).unwrap();
        peer.read_request(TIMEOUT).unwrap();
    }
    let current = conn.send_request(request(43), true).unwrap().unwrap();
    assert_eq!(wire_sequence(current), wire_sequence(stale));
    assert_ne!(current, stale);

    peer.write(&reply(current, 2));
    assert_eq!(marker(conn.wait_for_reply(current).unwrap().bytes()), 2);
}
