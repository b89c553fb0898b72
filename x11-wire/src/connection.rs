//! The connection engine.
//!
//! A [`Connection`] owns everything one client connection needs after the
//! setup exchange:
//! - the [`Transport`] carrying bytes and descriptors;
//! - the outbound [`Sender`] queue;
//! - the inbound [`Receiver`] reassembly buffer;
//! - the [`SequenceTracker`] and the map of reply-expecting requests;
//! - the queue of events (and errors of requests sent without a reply).
//!
//! Every method takes `&self`; share the connection between threads through
//! an [`Arc`](std::sync::Arc).
//!
//! # Locking
//!
//! Two mutexes, always taken in this order:
//!
//! 1. `writer`: the outbound queue.  Held only for non-blocking writes, so
//!    [`Connection::send_request`] never waits behind a blocked flush.
//! 2. `inner`: everything else.
//!
//! Neither is held across a blocking `poll`.
//!
//! Sequence numbers are assigned with both held, so queue order is sequence
//! order.
//!
//! # Reading
//!
//! At most one thread reads at a time.  A waiter that finds nobody reading
//! sets `reading`, drops `inner` while it blocks in `poll`, then relocks to
//! read, dispatch everything that arrived and wake all other waiters.  The
//! others sleep on `reader_done` and re-check their condition when woken;
//! whoever wakes first and still needs data becomes the next reader.
//!
//! # Failure
//!
//! An I/O error or an inbound framing error closes the connection.  Every
//! unanswered request then carries that error, and every later operation
//! fails with [`ConnectionError::Closed`] without touching the transport.
//! Events already read stay available through [`Connection::drain_events`].

use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::{Duration, Instant};

use crate::buffer::BufferWithFds;
use crate::config::ConnectionConfig;
use crate::error::ConnectionError;
use crate::packet::{validate_request, Event, FramingError, Packet, PacketKind, ReplyOrError};
use crate::receiver::Receiver;
use crate::sender::Sender;
use crate::sequence::{SequenceNumber, SequenceTracker};
use crate::socket::{DefaultStream, MAX_FDS_PER_MESSAGE};
use crate::state::{ConnectionState, DiscardMode, EventPoll, RequestState, RequestStatus};
use crate::transport::{PollMode, ReceiveStatus, Transport};

/// Most chunks one read pass takes before yielding the lock.
const MAX_CHUNKS_PER_READ: usize = 64;

// ---------------------------------------------------------------------------
// Inner
// ---------------------------------------------------------------------------

/// State guarded by `Connection::inner`.
#[derive(Debug)]
struct Inner {
    state: ConnectionState,
    tracker: SequenceTracker,
    requests: BTreeMap<SequenceNumber, RequestState>,
    events: VecDeque<Event>,
    receiver: Receiver,
    /// Someone is blocked in `poll` on behalf of everyone.
    reading: bool,
    /// Highest sequence number already moved out of `Sent`.
    written_through: SequenceNumber,
}

impl Inner {
    fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    fn ensure_open(&self) -> Result<(), ConnectionError> {
        if self.is_closed() {
            Err(ConnectionError::Closed)
        } else {
            Ok(())
        }
    }

    /// Move requests whose bytes are all on the wire to `AwaitingReply`.
    fn mark_written(&mut self, through: SequenceNumber) {
        if through <= self.written_through {
            return;
        }
        let from = self.written_through + 1;
        for state in self.requests.range_mut(from..=through).map(|(_, s)| s) {
            if matches!(state, RequestState::Sent) {
                *state = RequestState::AwaitingReply;
            }
        }
        self.written_through = through;
    }

    /// Take the answer to `seq` if it is there.
    fn take_reply(&mut self, seq: SequenceNumber) -> Result<Option<ReplyOrError>, ConnectionError> {
        match self.requests.remove(&seq) {
            Some(RequestState::Resolved(reply)) => Ok(Some(reply)),
            Some(RequestState::Closed(err)) => Err(err),
            Some(discarded @ RequestState::Discarded(_)) => {
                self.requests.insert(seq, discarded);
                Err(ConnectionError::NotPending(seq))
            }
            Some(waiting) => {
                self.requests.insert(seq, waiting);
                self.ensure_open().map(|()| None)
            }
            None => {
                self.ensure_open()?;
                Err(ConnectionError::NotPending(seq))
            }
        }
    }

    /// `Some(())` once taking `seq` would not block.
    fn reply_ready(&self, seq: SequenceNumber) -> Result<Option<()>, ConnectionError> {
        match self.requests.get(&seq) {
            Some(state) if state.is_settled() => Ok(Some(())),
            Some(RequestState::Discarded(_)) | None => {
                self.ensure_open()?;
                Err(ConnectionError::NotPending(seq))
            }
            Some(_) => self.ensure_open().map(|()| None),
        }
    }

    fn next_event(&mut self) -> Result<Option<Event>, ConnectionError> {
        match self.events.pop_front() {
            Some(event) => Ok(Some(event)),
            None => self.ensure_open().map(|()| None),
        }
    }

    fn event_ready(&self) -> Result<Option<()>, ConnectionError> {
        if self.events.is_empty() {
            self.ensure_open().map(|()| None)
        } else {
            Ok(Some(()))
        }
    }

    /// Route one complete inbound message.
    fn dispatch(&mut self, packet: Packet) -> Result<(), ConnectionError> {
        let Packet { header, buffer } = packet;
        let wire = header.sequence;

        match header.kind {
            PacketKind::Event => {
                let sequence = self.extend_and_observe(wire);
                log::trace!(
                    "[conn] ← event {} (seq {sequence}, {} bytes)",
                    header.response_type,
                    buffer.len()
                );
                self.events.push_back(Event { sequence, buffer });
            }
            PacketKind::Reply => {
                let wire = wire.unwrap_or_default();
                let seq = self
                    .tracker
                    .match_response(wire)
                    .ok_or(FramingError::UnsolicitedReply { sequence: wire })?;
                log::debug!("[conn] ← reply #{seq} ({} bytes, {} fds)", buffer.len(), buffer.fds().len());
                self.resolve(seq, ReplyOrError::Reply(buffer));
            }
            PacketKind::Error => match self.tracker.match_response(wire.unwrap_or_default()) {
                Some(seq) => {
                    log::debug!("[conn] ← error {} for #{seq}", header.detail);
                    self.resolve(seq, ReplyOrError::Error(buffer));
                }
                None => {
                    let sequence = self.extend_and_observe(wire);
                    log::debug!("[conn] ← unchecked error {} (seq {sequence})", header.detail);
                    self.events.push_back(Event { sequence, buffer });
                }
            },
        }
        Ok(())
    }

    fn extend_and_observe(&mut self, wire: Option<u16>) -> SequenceNumber {
        match wire {
            Some(wire) => {
                let sequence = self.tracker.extend(wire);
                self.tracker.observe(sequence);
                sequence
            }
            None => self.tracker.last_received(),
        }
    }

    fn resolve(&mut self, seq: SequenceNumber, answer: ReplyOrError) {
        match self.requests.remove(&seq) {
            Some(RequestState::Discarded(mode)) => {
                if answer.is_error() && mode == DiscardMode::DiscardReply {
                    self.events.push_back(Event {
                        sequence: seq,
                        buffer: answer.into_buffer(),
                    });
                }
            }
            Some(_) | None => {
                self.requests.insert(seq, RequestState::Resolved(answer));
            }
        }
    }

    /// Close the connection with `err`.  Returns `false` if it already was.
    fn close(&mut self, err: ConnectionError) -> bool {
        if self.is_closed() {
            return false;
        }
        log::warn!(
            "[conn] closing ({} requests unanswered, {} events queued, {} bytes partial): {err}",
            self.tracker.pending_len(),
            self.events.len(),
            self.receiver.buffered_len()
        );
        self.state = ConnectionState::Closed;
        self.requests
            .retain(|_, state| !matches!(state, RequestState::Discarded(_)));
        for state in self.requests.values_mut() {
            if !matches!(state, RequestState::Resolved(_)) {
                *state = RequestState::Closed(err.clone());
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// A client connection that correlates replies with requests.
#[derive(Debug)]
pub struct Connection<S: Transport = DefaultStream> {
    stream: S,
    config: ConnectionConfig,
    writer: Mutex<Sender>,
    inner: Mutex<Inner>,
    /// Signalled whenever a reader finishes a pass or the connection closes.
    reader_done: Condvar,
}

impl<S: Transport> Connection<S> {
    /// Wrap a stream whose setup exchange is complete, with default tunables.
    pub fn new(stream: S) -> Self {
        Self::with_config(stream, ConnectionConfig::default())
    }

    /// `max_fds_per_request` is capped at [`MAX_FDS_PER_MESSAGE`] so an
    /// oversized set is refused up front instead of failing at the socket.
    pub fn with_config(stream: S, mut config: ConnectionConfig) -> Self {
        if config.max_fds_per_request > MAX_FDS_PER_MESSAGE {
            log::debug!(
                "[conn] max_fds_per_request {} capped at {MAX_FDS_PER_MESSAGE}",
                config.max_fds_per_request
            );
            config.max_fds_per_request = MAX_FDS_PER_MESSAGE;
        }
        let inner = Inner {
            state: ConnectionState::Open,
            tracker: SequenceTracker::starting_after(config.initial_sequence),
            requests: BTreeMap::new(),
            events: VecDeque::new(),
            receiver: Receiver::new(config.max_packet_len),
            reading: false,
            written_through: config.initial_sequence,
        };
        Self {
            stream,
            writer: Mutex::new(Sender::new(config.initial_sequence)),
            inner: Mutex::new(inner),
            reader_done: Condvar::new(),
            config,
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_writer(&self) -> MutexGuard<'_, Sender> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_lock_writer(&self) -> Option<MutexGuard<'_, Sender>> {
        match self.writer.try_lock() {
            Ok(writer) => Some(writer),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    /// Close after a fatal error.  The transport is shut down too, so a
    /// reader parked in `poll` wakes up and sees the close.
    fn close_with(&self, inner: &mut Inner, err: ConnectionError) -> ConnectionError {
        if inner.close(err.clone()) {
            if let Err(e) = self.shutdown_stream() {
                log::debug!("[conn] transport shutdown after failure: {e}");
            }
            self.reader_done.notify_all();
        }
        err
    }

    fn shutdown_stream(&self) -> io::Result<()> {
        match self.stream.shutdown() {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Queue a request and return its sequence number if it expects a reply.
    ///
    /// Never blocks.  If nothing was queued before, the request is written
    /// immediately as far as the transport allows; otherwise it waits for the
    /// next [`flush`](Self::flush).
    ///
    /// Rejected without consuming a sequence number when descriptors are
    /// attached but cannot be passed, when there are more than
    /// [`ConnectionConfig::max_fds_per_request`], when descriptors come with
    /// no bytes to carry them, or when request validation is on and the
    /// length field disagrees with the byte count.
    pub fn send_request(
        &self,
        request: BufferWithFds,
        expects_reply: bool,
    ) -> Result<Option<SequenceNumber>, ConnectionError> {
        self.lock_inner().ensure_open()?;

        let fd_count = request.fds().len();
        if fd_count > 0 && !self.stream.supports_fds() {
            return Err(ConnectionError::FdPassingUnsupported);
        }
        if fd_count > 0 && request.is_empty() {
            return Err(ConnectionError::FdsWithoutPayload { count: fd_count });
        }
        if fd_count > self.config.max_fds_per_request {
            return Err(ConnectionError::TooManyFds {
                count: fd_count,
                limit: self.config.max_fds_per_request,
            });
        }
        if self.config.validate_requests {
            validate_request(request.bytes())?;
        }

        let mut writer = self.lock_writer();
        let seq = {
            let mut inner = self.lock_inner();
            inner.ensure_open()?;
            let seq = inner.tracker.next_request(expects_reply);
            if expects_reply {
                inner.requests.insert(seq, RequestState::Sent);
            }
            seq
        };
        log::trace!(
            "[conn] → #{seq} opcode {} ({} bytes, {fd_count} fds, reply: {expects_reply})",
            request.bytes().first().copied().unwrap_or_default(),
            request.len()
        );

        let was_empty = writer.is_empty();
        writer.push(seq, request);
        if was_empty {
            if let Err(err) = self.write_some(&mut writer) {
                self.lock_inner().requests.remove(&seq);
                return Err(err);
            }
        }
        Ok(expects_reply.then_some(seq))
    }

    /// One non-blocking pass over the write queue.  Returns `true` when it is
    /// empty.
    fn write_some(&self, writer: &mut Sender) -> Result<bool, ConnectionError> {
        let result = writer.write_some(&self.stream);
        let mut inner = self.lock_inner();
        inner.mark_written(writer.written_through());
        result.map_err(|e| {
            writer.clear();
            self.close_with(&mut inner, e.into())
        })
    }

    /// Write every queued request, blocking until the transport took them.
    pub fn flush(&self) -> Result<(), ConnectionError> {
        self.flush_until(None).map(drop)
    }

    /// Flush with an optional deadline.  `Ok(false)` on timeout.
    fn flush_until(&self, deadline: Option<Instant>) -> Result<bool, ConnectionError> {
        loop {
            {
                let mut writer = self.lock_writer();
                if self.lock_inner().is_closed() {
                    writer.clear();
                    return Err(ConnectionError::Closed);
                }
                if self.write_some(&mut writer)? {
                    return Ok(true);
                }
                log::trace!(
                    "[conn] flush waiting, {} requests ({} bytes) queued",
                    writer.len(),
                    writer.queued_bytes()
                );
            }
            let timeout = match remaining(deadline) {
                Some(Duration::ZERO) => return Ok(false),
                left => left,
            };
            self.wait_writable(timeout)?;
        }
    }

    /// Block until the socket is writable, reading meanwhile if nobody else
    /// is, so a server stuck writing to us cannot stall our writes.
    fn wait_writable(&self, timeout: Option<Duration>) -> Result<(), ConnectionError> {
        let claimed = {
            let mut inner = self.lock_inner();
            !std::mem::replace(&mut inner.reading, true)
        };
        if !claimed {
            return match self.stream.poll(PollMode::Writable, timeout) {
                Ok(_) => Ok(()),
                Err(e) => Err(self.close_with(&mut self.lock_inner(), e.into())),
            };
        }

        let polled = self.stream.poll(PollMode::ReadAndWritable, timeout);
        let mut inner = self.lock_inner();
        let outcome = match polled {
            Ok(ready) if ready.readable => self.read_available(&mut inner).map(drop),
            Ok(_) => Ok(()),
            Err(e) => Err(self.close_with(&mut inner, e.into())),
        };
        inner.reading = false;
        self.reader_done.notify_all();
        outcome
    }

    // -----------------------------------------------------------------------
    // Reading
    // -----------------------------------------------------------------------

    /// Read and dispatch whatever the transport has without blocking.
    /// Returns the number of messages dispatched.
    fn read_available(&self, inner: &mut Inner) -> Result<usize, ConnectionError> {
        let mut dispatched = 0;
        for _ in 0..MAX_CHUNKS_PER_READ {
            if inner.is_closed() {
                return Err(ConnectionError::Closed);
            }
            let chunk = match self.stream.receive(self.config.read_chunk_size) {
                Ok(ReceiveStatus::Data(chunk)) => chunk,
                Ok(ReceiveStatus::WouldBlock) => break,
                Err(e) => return Err(self.close_with(inner, e.into())),
            };
            let packets = match inner.receiver.feed(chunk) {
                Ok(packets) => packets,
                Err(e) => return Err(self.close_with(inner, e.into())),
            };
            for packet in packets {
                if let Err(e) = inner.dispatch(packet) {
                    return Err(self.close_with(inner, e));
                }
                dispatched += 1;
            }
        }
        Ok(dispatched)
    }

    /// Non-blocking write and read attempt, skipped for whichever side
    /// another thread is already driving.
    fn pump_nonblocking(&self) {
        if let Some(mut writer) = self.try_lock_writer() {
            if !writer.is_empty() {
                if let Err(e) = self.write_some(&mut writer) {
                    log::debug!("[conn] background write failed: {e}");
                }
            }
        }
        let mut inner = self.lock_inner();
        if inner.reading || inner.is_closed() {
            return;
        }
        if let Err(e) = self.read_available(&mut inner) {
            log::debug!("[conn] background read failed: {e}");
        }
        self.reader_done.notify_all();
    }

    /// Wait until `check` yields a value, reading on behalf of everyone when
    /// no other thread is.  `Ok(None)` once `deadline` passes.
    ///
    /// `check` must return `Err` when the connection is closed and it has
    /// nothing to hand out, or this would spin.
    fn wait_until<T>(
        &self,
        deadline: Option<Instant>,
        mut check: impl FnMut(&mut Inner) -> Result<Option<T>, ConnectionError>,
    ) -> Result<Option<T>, ConnectionError> {
        let mut inner = self.lock_inner();
        loop {
            if let Some(value) = check(&mut *inner)? {
                return Ok(Some(value));
            }
            inner.ensure_open()?;
            let timeout = match remaining(deadline) {
                Some(Duration::ZERO) => return Ok(None),
                left => left,
            };

            if inner.reading {
                inner = match timeout {
                    None => self
                        .reader_done
                        .wait(inner)
                        .unwrap_or_else(PoisonError::into_inner),
                    Some(left) => {
                        self.reader_done
                            .wait_timeout(inner, left)
                            .unwrap_or_else(PoisonError::into_inner)
                            .0
                    }
                };
                continue;
            }

            inner.reading = true;
            drop(inner);
            let polled = self.stream.poll(PollMode::Readable, timeout);
            inner = self.lock_inner();
            // Failures close the connection; `check` reports them.
            match polled {
                Ok(ready) if ready.readable => {
                    if let Err(e) = self.read_available(&mut inner) {
                        log::debug!("[conn] read failed: {e}");
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    self.close_with(&mut inner, e.into());
                }
            }
            inner.reading = false;
            self.reader_done.notify_all();
        }
    }

    /// Flush before waiting; a failure closes the connection and the wait
    /// then reports it.
    fn flush_before_wait(&self, deadline: Option<Instant>) {
        if let Err(e) = self.flush_until(deadline) {
            log::debug!("[conn] flush before wait failed: {e}");
        }
    }

    // -----------------------------------------------------------------------
    // Replies
    // -----------------------------------------------------------------------

    /// Block until the reply or error for `seq` arrives.
    pub fn wait_for_reply(&self, seq: SequenceNumber) -> Result<ReplyOrError, ConnectionError> {
        if let Some(reply) = self.lock_inner().take_reply(seq)? {
            return Ok(reply);
        }
        self.flush_before_wait(None);
        self.wait_until(None, |inner| inner.take_reply(seq))?
            .ok_or(ConnectionError::NotPending(seq))
    }

    /// Like [`wait_for_reply`](Self::wait_for_reply), giving up after
    /// `timeout`.  On `Ok(None)` the request stays pending and its answer is
    /// kept for a later call.
    pub fn wait_for_reply_timeout(
        &self,
        seq: SequenceNumber,
        timeout: Duration,
    ) -> Result<Option<ReplyOrError>, ConnectionError> {
        let deadline = Instant::now() + timeout;
        if let Some(reply) = self.lock_inner().take_reply(seq)? {
            return Ok(Some(reply));
        }
        self.flush_before_wait(Some(deadline));
        self.wait_until(Some(deadline), |inner| inner.take_reply(seq))
    }

    /// Return the answer to `seq` if it is already here, reading whatever the
    /// transport has without blocking.
    pub fn poll_for_reply(
        &self,
        seq: SequenceNumber,
    ) -> Result<Option<ReplyOrError>, ConnectionError> {
        if let Some(reply) = self.lock_inner().take_reply(seq)? {
            return Ok(Some(reply));
        }
        self.pump_nonblocking();
        self.lock_inner().take_reply(seq)
    }

    /// Give up on the answer to `seq`.
    pub fn discard_reply(
        &self,
        seq: SequenceNumber,
        mode: DiscardMode,
    ) -> Result<(), ConnectionError> {
        let mut inner = self.lock_inner();
        match inner.requests.remove(&seq) {
            None => {
                inner.ensure_open()?;
                return Err(ConnectionError::NotPending(seq));
            }
            Some(RequestState::Resolved(answer)) => {
                if answer.is_error() && mode == DiscardMode::DiscardReply {
                    inner.events.push_back(Event {
                        sequence: seq,
                        buffer: answer.into_buffer(),
                    });
                }
            }
            Some(RequestState::Closed(_)) => {}
            Some(_) => {
                // Still pending in the tracker: the answer must be matched
                // and dropped when it arrives.
                debug_assert!(inner.tracker.is_pending(seq));
                inner.requests.insert(seq, RequestState::Discarded(mode));
            }
        }
        log::trace!("[conn] #{seq} discarded ({mode:?})");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Next queued event, if any.
    ///
    /// With [`EventPoll::QueueOnly`] the transport is never touched.  With
    /// [`EventPoll::ReadIfReady`] an empty queue triggers one non-blocking
    /// read.  After the connection closed, queued events are still handed
    /// out; an empty queue then yields [`ConnectionError::Closed`].
    pub fn poll_for_event(&self, mode: EventPoll) -> Result<Option<Event>, ConnectionError> {
        if let Some(event) = self.lock_inner().next_event()? {
            return Ok(Some(event));
        }
        if mode == EventPoll::ReadIfReady {
            self.pump_nonblocking();
        }
        self.lock_inner().next_event()
    }

    /// Block until an event arrives.
    pub fn wait_for_event(&self) -> Result<Event, ConnectionError> {
        if let Some(event) = self.lock_inner().next_event()? {
            return Ok(event);
        }
        self.flush_before_wait(None);
        self.wait_until(None, Inner::next_event)?
            .ok_or(ConnectionError::Closed)
    }

    /// Like [`wait_for_event`](Self::wait_for_event), giving up after
    /// `timeout`.
    pub fn wait_for_event_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<Event>, ConnectionError> {
        let deadline = Instant::now() + timeout;
        if let Some(event) = self.lock_inner().next_event()? {
            return Ok(Some(event));
        }
        self.flush_before_wait(Some(deadline));
        self.wait_until(Some(deadline), Inner::next_event)
    }

    /// Take every queued event.  Works after the connection closed.
    pub fn drain_events(&self) -> Vec<Event> {
        self.lock_inner().events.drain(..).collect()
    }

    // -----------------------------------------------------------------------
    // Readiness waits for the async facade
    // -----------------------------------------------------------------------

    /// Block until the answer to `seq` can be taken without blocking, or
    /// `deadline` passes (`Ok(false)`).  Nothing is taken.
    pub(crate) fn wait_for_resolution(
        &self,
        seq: SequenceNumber,
        deadline: Option<Instant>,
    ) -> Result<bool, ConnectionError> {
        if self.lock_inner().reply_ready(seq)?.is_some() {
            return Ok(true);
        }
        self.flush_before_wait(deadline);
        Ok(self.wait_until(deadline, |inner| inner.reply_ready(seq))?.is_some())
    }

    /// Block until an event is queued, or `deadline` passes (`Ok(false)`).
    pub(crate) fn wait_for_event_ready(
        &self,
        deadline: Option<Instant>,
    ) -> Result<bool, ConnectionError> {
        if self.lock_inner().event_ready()?.is_some() {
            return Ok(true);
        }
        self.flush_before_wait(deadline);
        Ok(self.wait_until(deadline, |inner| inner.event_ready())?.is_some())
    }

    // -----------------------------------------------------------------------
    // Lifecycle and introspection
    // -----------------------------------------------------------------------

    /// Shut the transport down and close the connection.  Unanswered
    /// requests resolve with [`ConnectionError::Closed`].  Idempotent.
    pub fn shutdown(&self) -> Result<(), ConnectionError> {
        let mut inner = self.lock_inner();
        if inner.is_closed() {
            return Ok(());
        }
        log::debug!("[conn] shutdown requested");
        let result = self.shutdown_stream();
        if inner.close(ConnectionError::Closed) {
            self.reader_done.notify_all();
        }
        result.map_err(ConnectionError::from)
    }

    pub fn is_closed(&self) -> bool {
        self.lock_inner().is_closed()
    }

    /// Progress of the reply-expecting request `seq`, or `None` once its
    /// answer was taken (or it never expected one).
    pub fn request_status(&self, seq: SequenceNumber) -> Option<RequestStatus> {
        self.lock_inner().requests.get(&seq).map(RequestState::status)
    }

    /// Highest sequence number assigned so far.
    pub fn last_sequence_sent(&self) -> SequenceNumber {
        self.lock_inner().tracker.last_sent()
    }

    /// Highest sequence number seen on an inbound message.
    pub fn last_sequence_received(&self) -> SequenceNumber {
        self.lock_inner().tracker.last_received()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// The underlying transport.
    pub fn stream(&self) -> &S {
        &self.stream
    }
}

/// Time left until `deadline`, `None` for no deadline.
fn remaining(deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|d| d.saturating_duration_since(Instant::now()))
}
