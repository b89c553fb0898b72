//! Async facade over [`Connection`] for tokio callers.
//!
//! ```text
//!   task A: wait_for_reply(7).await ──┐
//!   task B: wait_for_reply(9).await ──┤  spawn_blocking: wait for readiness
//!   task C: events.recv().await ──────┤  (one of them drains the socket)
//!                                     ▼
//!                          Arc<Connection<S>>
//! ```
//!
//! Blocking engine calls run on tokio's blocking pool and only wait until
//! the wanted reply or event is *ready*; the value itself is taken back on
//! the calling task.  Dropping a waiting future therefore never loses a
//! reply: it stays in the connection for the next wait on the same number.
//!
//! # Usage
//!
//! ```ignore
//! let conn = AsyncConnection::new(Connection::new(stream));
//! let seq = conn.send_request(request, true)?.unwrap();
//! let reply = conn.wait_for_reply(seq).await?;
//!
//! let mut events = conn.events(64);
//! while let Ok(event) = events.recv().await {
//!     handle(event);
//! }
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::buffer::BufferWithFds;
use crate::connection::Connection;
use crate::error::ConnectionError;
use crate::packet::{Event, ReplyOrError};
use crate::sequence::SequenceNumber;
use crate::socket::DefaultStream;
use crate::state::EventPoll;
use crate::transport::Transport;

/// How long one blocking readiness wait of the event pump lasts before it
/// checks whether the stream was dropped.
const PUMP_SLICE: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// AsyncConnection
// ---------------------------------------------------------------------------

/// Shareable async handle; cloning is cheap.
#[derive(Debug)]
pub struct AsyncConnection<S: Transport + 'static = DefaultStream> {
    conn: Arc<Connection<S>>,
}

impl<S: Transport + 'static> Clone for AsyncConnection<S> {
    fn clone(&self) -> Self {
        Self {
            conn: Arc::clone(&self.conn),
        }
    }
}

impl<S: Transport + 'static> AsyncConnection<S> {
    pub fn new(conn: Connection<S>) -> Self {
        Self::from_arc(Arc::new(conn))
    }

    /// Share a connection that blocking code also uses.
    pub fn from_arc(conn: Arc<Connection<S>>) -> Self {
        Self { conn }
    }

    /// The wrapped engine, for the non-blocking accessors.
    pub fn connection(&self) -> &Arc<Connection<S>> {
        &self.conn
    }

    /// See [`Connection::send_request`].  Does not block, so it is safe to
    /// call directly from async code.
    pub fn send_request(
        &self,
        request: BufferWithFds,
        expects_reply: bool,
    ) -> Result<Option<SequenceNumber>, ConnectionError> {
        self.conn.send_request(request, expects_reply)
    }

    /// Write every queued request.
    pub async fn flush(&self) -> Result<(), ConnectionError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || conn.flush())
            .await
            .unwrap_or(Err(ConnectionError::Closed))
    }

    /// Wait for the reply or error to `seq`.
    pub async fn wait_for_reply(&self, seq: SequenceNumber) -> Result<ReplyOrError, ConnectionError> {
        self.wait_resolved(seq, None).await?;
        self.conn
            .poll_for_reply(seq)?
            .ok_or(ConnectionError::NotPending(seq))
    }

    /// Like [`wait_for_reply`](Self::wait_for_reply), giving up after
    /// `timeout`.  The request stays pending on `Ok(None)`.
    pub async fn wait_for_reply_timeout(
        &self,
        seq: SequenceNumber,
        timeout: Duration,
    ) -> Result<Option<ReplyOrError>, ConnectionError> {
        if !self.wait_resolved(seq, Some(Instant::now() + timeout)).await? {
            return Ok(None);
        }
        self.conn.poll_for_reply(seq)
    }

    async fn wait_resolved(
        &self,
        seq: SequenceNumber,
        deadline: Option<Instant>,
    ) -> Result<bool, ConnectionError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || conn.wait_for_resolution(seq, deadline))
            .await
            .unwrap_or(Err(ConnectionError::Closed))
    }

    /// Wait for the next event.
    pub async fn wait_for_event(&self) -> Result<Event, ConnectionError> {
        loop {
            if let Some(event) = self.conn.poll_for_event(EventPoll::QueueOnly)? {
                return Ok(event);
            }
            let conn = Arc::clone(&self.conn);
            tokio::task::spawn_blocking(move || conn.wait_for_event_ready(None))
                .await
                .unwrap_or(Err(ConnectionError::Closed))?;
        }
    }

    /// See [`Connection::poll_for_event`].
    pub fn poll_for_event(&self, mode: EventPoll) -> Result<Option<Event>, ConnectionError> {
        self.conn.poll_for_event(mode)
    }

    /// Feed events into a channel of `capacity` from a background task.
    ///
    /// The stream ends with one `Err` once the connection closes, after every
    /// event read before that.
    pub fn events(&self, capacity: usize) -> EventStream {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(event_pump(Arc::clone(&self.conn), tx));
        EventStream { rx, handle }
    }

    /// See [`Connection::shutdown`].
    pub fn shutdown(&self) -> Result<(), ConnectionError> {
        self.conn.shutdown()
    }
}

// ---------------------------------------------------------------------------
// EventStream
// ---------------------------------------------------------------------------

/// Handle returned by [`AsyncConnection::events`].
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::Receiver<Result<Event, ConnectionError>>,
    handle: JoinHandle<()>,
}

impl EventStream {
    /// Next event.  Returns [`ConnectionError::Closed`] once the pump is gone.
    pub async fn recv(&mut self) -> Result<Event, ConnectionError> {
        self.rx.recv().await.unwrap_or(Err(ConnectionError::Closed))
    }

    /// Stop the pump and wait for it to finish.  Events it had not delivered
    /// yet are dropped.
    pub async fn close(self) {
        // Dropping the receiver makes the pump's `closed()` branch fire.
        drop(self.rx);
        let _ = self.handle.await;
    }
}

// ---------------------------------------------------------------------------
// Background event pump
// ---------------------------------------------------------------------------

async fn event_pump<S: Transport + 'static>(
    conn: Arc<Connection<S>>,
    tx: mpsc::Sender<Result<Event, ConnectionError>>,
) {
    loop {
        // Hand over everything already queued.
        loop {
            match conn.poll_for_event(EventPoll::QueueOnly) {
                Ok(Some(event)) => {
                    if tx.send(Ok(event)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    log::debug!("[session] event pump stopping: {e}");
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        }

        let waiter = Arc::clone(&conn);
        let ready = tokio::task::spawn_blocking(move || {
            waiter.wait_for_event_ready(Some(Instant::now() + PUMP_SLICE))
        });

        tokio::select! {
            _ = tx.closed() => {
                log::debug!("[session] event stream dropped");
                return;
            }
            result = ready => {
                if let Err(e) = result.unwrap_or(Err(ConnectionError::Closed)) {
                    // Queued events still go out first; the next poll reports
                    // the close once they are gone.
                    log::trace!("[session] readiness wait ended: {e}");
                }
            }
        }
    }
}
