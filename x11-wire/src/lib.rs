//! `x11-wire` — the transport and request/reply correlation core of an X11
//! client connection.
//!
//! # Architecture
//!
//! ```text
//!   caller threads / tasks
//!        │ send_request            wait_for_reply / poll_for_event
//!        ▼                                   ▲
//!  ┌─────────────────────────────────────────┴──────────┐
//!  │                    Connection                       │
//!  │  Sender (write queue) ─┐    ┌─ requests / events    │
//!  │  SequenceTracker ──────┤    ├─ Receiver (reassembly)│
//!  └────────────────────────┼────┼──────────────────────┘
//!                           │    │ bytes + fds
//!  ┌────────────────────────▼────┴─────┐
//!  │        Transport (trait)          │
//!  │  DefaultStream: TCP / Unix socket │
//!  │  SimulatedStream: in-memory       │
//!  └───────────────────────────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`transport`]   — capability trait every byte stream implements
//! - [`socket`]      — TCP / Unix socket transport with descriptor passing
//! - [`buffer`]      — bytes plus descriptors, with a resumable cursor
//! - [`packet`]      — 32-byte header framing and request validation
//! - [`receiver`]    — inbound byte stream to complete messages
//! - [`sender`]      — ordered outbound queue
//! - [`sequence`]    — sequence numbering and wire-sequence matching
//! - [`state`]       — connection and per-request state types
//! - [`connection`]  — the engine tying the above together
//! - [`session`]     — tokio facade over the engine
//! - [`address`]     — display strings to socket addresses
//! - [`config`]      — engine tunables
//! - [`error`]       — engine error type
//! - [`simulator`]   — fault-injecting in-memory transport for tests
//!
//! The connection setup exchange, authentication and request/reply encoding
//! are out of scope: a [`Connection`] is built from a stream whose setup is
//! already done, and moves opaque request and reply bytes.

pub mod address;
pub mod buffer;
pub mod config;
pub mod connection;
pub mod error;
pub mod packet;
pub mod receiver;
pub mod sender;
pub mod sequence;
pub mod session;
pub mod simulator;
pub mod socket;
pub mod state;
pub mod transport;

pub use buffer::BufferWithFds;
pub use config::ConnectionConfig;
pub use connection::Connection;
pub use error::ConnectionError;
pub use packet::{Event, ReplyOrError};
pub use sequence::SequenceNumber;
pub use session::{AsyncConnection, EventStream};
pub use socket::DefaultStream;
pub use state::{DiscardMode, EventPoll, RequestStatus};
pub use transport::Transport;
