//! A session: one center, its connections and its streams.
//!
//! [`Session`] is sans-I/O. The owner feeds socket bytes with
//! [`Session::receive`], writes whatever [`Session::poll_transmit`] returns,
//! reports drained sockets with [`Session::on_drained`], drives time through
//! [`Session::poll_timeout`] / [`Session::handle_timeout`] and runs the
//! deferred work queue once per loop iteration with
//! [`Session::run_deferred`].

use std::collections::{BTreeSet, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, warn};

use super::control::ControlMessage;
use super::stream::{Stream, StreamConfig, StreamMap};
use crate::center::{Center, CenterConfig, CenterStats};
use crate::core::{
    util::fmt_bytes, ConnectionError, RecordCipher, SessionError, StreamSource, CONTROL_STREAM_ID,
    DEFAULT_MSS, MAX_MSS, MIN_MSS, SESSION_OPEN_TIMEOUT, SESSION_SUSPEND_GRACE,
};
use crate::crypto::{
    AuthKey, KeyExchange, KeyExchangeConfig, RekeyMessage, Role, SessionId, SessionKey,
    SessionSecrets,
};
use crate::transport::{ConnId, Connection, ConnectionConfig, ConnectionPool, ConnectionStats};

/// Session tunables.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Negotiated MSS: stream payload size and connection backpressure
    /// threshold.
    pub mss: usize,
    /// How long a session without connections waits for one to come back.
    pub suspend_grace: Duration,
    /// How long a client waits for the server to confirm the session.
    pub open_timeout: Duration,
    /// Key exchange timing.
    pub key_exchange: KeyExchangeConfig,
    /// Center tunables.
    pub center: CenterConfig,
    /// Connection tunables.
    pub connection: ConnectionConfig,
    /// Timing applied to streams opened by the peer.
    pub stream: StreamConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mss: DEFAULT_MSS,
            suspend_grace: SESSION_SUSPEND_GRACE,
            open_timeout: SESSION_OPEN_TIMEOUT,
            key_exchange: KeyExchangeConfig::default(),
            center: CenterConfig::default(),
            connection: ConnectionConfig::default(),
            stream: StreamConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Set the MSS everywhere it applies, clamped so a full frame fits one
    /// record.
    pub fn with_mss(mut self, mss: usize) -> Self {
        let mss = mss.clamp(MIN_MSS, MAX_MSS);
        self.mss = mss;
        self.center.mss = mss;
        self.connection.mss = mss;
        self
    }

    /// Set the suspend grace period.
    pub fn with_suspend_grace(mut self, grace: Duration) -> Self {
        self.suspend_grace = grace;
        self
    }

    /// Set the open timeout.
    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    /// Set the key exchange interval.
    pub fn with_key_exchange_interval(mut self, interval: Duration) -> Self {
        self.key_exchange.interval = interval;
        self
    }

    /// Replace the center tunables (the MSS is kept).
    pub fn with_center(mut self, center: CenterConfig) -> Self {
        self.center = center.with_mss(self.mss);
        self
    }

    /// Replace the connection tunables (the MSS is kept).
    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = ConnectionConfig {
            mss: self.mss,
            ..connection
        };
        self
    }
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Client waiting for the server's confirmation.
    Opening,
    /// Carrying traffic.
    Active,
    /// Every connection is gone; waiting for one to come back.
    Suspended,
    /// Finished.
    Closed,
}

/// Something the owner of a session has to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The session is confirmed and carries traffic.
    Opened,
    /// The peer opened a stream.
    StreamOpened(u16),
    /// Bytes arrived on a stream.
    StreamData {
        /// Stream id.
        stream_id: u16,
        /// Bytes, in stream order unless the stream is capped.
        data: Bytes,
    },
    /// A stream finished.
    StreamClosed(u16),
    /// A client should dial another connection (loss or rotation).
    ConnectionWanted,
    /// A connection is gone; its socket can be dropped.
    ConnectionClosed(ConnId),
    /// A key exchange completed.
    KeyExchanged {
        /// Exchange sequence number.
        seq: u32,
    },
    /// The session closed, with the error that ended it if any.
    Closed(Option<SessionError>),
}

/// Work postponed to the next loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredTask {
    /// Deliver another batch of contiguous buffered frames.
    DrainReceived,
    /// Hand a stream's buffered bytes to the application.
    FlushStream(u16),
    /// Feed drained connections.
    Dispatch,
}

/// Counters of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SessionStats {
    /// Connection counters, summed over live and retired connections.
    pub connections: ConnectionStats,
    /// Center counters.
    pub center: CenterStats,
    /// Connections currently carrying traffic.
    pub live_connections: usize,
    /// Streams opened by either side.
    pub streams_opened: u64,
    /// Streams finished.
    pub streams_closed: u64,
    /// Key exchanges completed.
    pub key_exchanges: u32,
}

/// One multiplexed session.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    role: Role,
    config: SessionConfig,
    state: SessionState,
    opened: bool,
    auth_key: AuthKey,
    session_key: SessionKey,

    center: Center,
    pool: ConnectionPool,
    streams: StreamMap,
    key_exchange: KeyExchange,

    deferred: VecDeque<DeferredTask>,
    flush_scheduled: BTreeSet<u16>,
    dispatch_scheduled: bool,
    events: VecDeque<SessionEvent>,

    rotating: BTreeSet<ConnId>,
    open_deadline: Option<Instant>,
    suspended_at: Option<Instant>,
    retired: ConnectionStats,
    streams_opened: u64,
    streams_closed: u64,
}

impl Session {
    /// Create a session after its first handshake.
    ///
    /// A server session is active at once and confirms itself to the peer;
    /// a client session waits for that confirmation.
    pub fn new(
        role: Role,
        id: SessionId,
        secrets: SessionSecrets,
        config: SessionConfig,
        now: Instant,
    ) -> Self {
        let config = SessionConfig {
            center: config.center.clone().with_mss(config.mss),
            ..config
        };
        let mut session = Self {
            id,
            role,
            state: SessionState::Opening,
            opened: false,
            auth_key: secrets.auth_key,
            session_key: secrets.session_key,
            center: Center::new(config.center.clone(), now),
            pool: ConnectionPool::new(),
            streams: StreamMap::new(role, config.mss, now),
            key_exchange: KeyExchange::new(role, config.key_exchange.clone(), now),
            deferred: VecDeque::new(),
            flush_scheduled: BTreeSet::new(),
            dispatch_scheduled: false,
            events: VecDeque::new(),
            rotating: BTreeSet::new(),
            open_deadline: None,
            suspended_at: None,
            retired: ConnectionStats::default(),
            streams_opened: 0,
            streams_closed: 0,
            config,
        };
        info!(session = %id, ?role, mss = session.config.mss, "session created");
        match role {
            Role::Server => {
                session.mark_opened();
                session.send_control(ControlMessage::SessionOpened, now);
            }
            Role::Client => session.open_deadline = Some(now + session.config.open_timeout),
        }
        session
    }

    /// Session id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Our side.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Check if the session is closed.
    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// Check if the session is closed and every connection is gone.
    pub fn is_finished(&self) -> bool {
        self.is_closed() && self.pool.is_empty()
    }

    /// Secrets a fork handshake is checked against.
    pub fn secrets(&self) -> SessionSecrets {
        SessionSecrets {
            auth_key: self.auth_key.clone(),
            session_key: self.session_key.clone(),
        }
    }

    /// Current session key.
    pub fn session_key(&self) -> &SessionKey {
        &self.session_key
    }

    /// Reliability engine.
    pub fn center(&self) -> &Center {
        &self.center
    }

    /// Look up a stream.
    pub fn stream(&self, id: u16) -> Option<&Stream> {
        self.streams.get(id)
    }

    /// Ids of all connections, any phase.
    pub fn connection_ids(&self) -> Vec<ConnId> {
        self.pool.ids()
    }

    /// Counters of one attached connection.
    pub fn connection_stats(&self, conn: ConnId) -> Option<ConnectionStats> {
        self.pool.get(conn).map(|c| *c.stats())
    }

    /// Connections currently carrying traffic.
    pub fn live_connections(&self) -> usize {
        self.center.live_connections().len()
    }

    /// Counters.
    pub fn stats(&self) -> SessionStats {
        let mut connections = self.retired;
        for conn in self.pool.iter() {
            connections.absorb(conn.stats());
        }
        SessionStats {
            connections,
            center: *self.center.stats(),
            live_connections: self.live_connections(),
            streams_opened: self.streams_opened,
            streams_closed: self.streams_closed,
            key_exchanges: self.key_exchange.completed(),
        }
    }

    fn mark_opened(&mut self) {
        if self.opened {
            return;
        }
        self.opened = true;
        self.open_deadline = None;
        if self.state == SessionState::Opening {
            self.state = SessionState::Active;
        }
        info!(session = %self.id, "session open");
        self.events.push_back(SessionEvent::Opened);
    }

    // =========================================================================
    // Connections
    // =========================================================================

    /// Attach a connection that finished its handshake.
    pub fn add_connection(
        &mut self,
        cipher: Box<dyn RecordCipher>,
        now: Instant,
    ) -> Result<ConnId, SessionError> {
        if self.is_closed() {
            return Err(SessionError::SessionClosed);
        }
        let id = self.pool.allocate_id();
        self.pool
            .insert(Connection::new(id, cipher, self.config.connection.clone(), now));
        self.center.add_connection(id);

        if let Some(old) = self.rotating.pop_first() {
            debug!(session = %self.id, old = %old, new = %id, "replacing rotated connection");
            if let Some(conn) = self.pool.get_mut(old) {
                conn.close(now);
            }
            self.center.remove_connection(old);
        }
        if self.state == SessionState::Suspended {
            self.state = if self.opened {
                SessionState::Active
            } else {
                SessionState::Opening
            };
            self.suspended_at = None;
            info!(session = %self.id, "session resumed");
        }
        info!(
            session = %self.id,
            conn = %id,
            live = self.center.live_connections().len(),
            "connection added"
        );
        self.defer_dispatch();
        Ok(id)
    }

    /// Feed bytes read from a connection's socket.
    ///
    /// An error means the connection failed; it is reaped and a
    /// [`SessionEvent::ConnectionClosed`] follows.
    pub fn receive(
        &mut self,
        conn: ConnId,
        data: &[u8],
        now: Instant,
    ) -> Result<(), ConnectionError> {
        let Some(connection) = self.pool.get_mut(conn) else {
            return Err(ConnectionError::Closed);
        };
        let result = connection.receive(data, now, &mut self.center);
        self.center.process_inbound(now, &self.streams);
        self.route_delivered(now);
        if self.center.has_drain_backlog() {
            self.defer(DeferredTask::DrainReceived);
        }
        self.reap(now);
        self.defer_dispatch();
        result
    }

    /// The socket of `conn` wrote everything handed out so far.
    pub fn on_drained(&mut self, conn: ConnId) {
        if let Some(connection) = self.pool.get_mut(conn) {
            connection.on_drained();
            self.center.on_drained(conn);
            self.defer_dispatch();
        }
    }

    /// Next encrypted bytes to write to a socket.
    pub fn poll_transmit(&mut self, now: Instant) -> Option<(ConnId, Bytes)> {
        let mut failed = false;
        for id in self.pool.ids() {
            let Some(conn) = self.pool.get_mut(id) else {
                continue;
            };
            if !conn.wants_flush() {
                continue;
            }
            match conn.flush() {
                Ok(Some(bytes)) => return Some((id, bytes)),
                Ok(None) => {}
                Err(_) => failed = true,
            }
        }
        if failed || self.pool.iter().any(Connection::is_closed) {
            self.reap(now);
            self.defer_dispatch();
        }
        None
    }

    /// The socket of `conn` hit EOF or an error.
    pub fn connection_closed(&mut self, conn: ConnId, now: Instant) {
        if let Some(connection) = self.pool.get_mut(conn) {
            connection.abort();
            self.reap(now);
            self.defer_dispatch();
        }
    }

    fn reap(&mut self, now: Instant) {
        for id in self.pool.ids() {
            let Some(conn) = self.pool.get(id) else {
                continue;
            };
            let open = conn.is_open();
            let finished = conn.is_closed() && !conn.wants_flush();

            if !open && self.center.live_connections().contains(&id) {
                self.center.remove_connection(id);
                let replaced = self.rotating.remove(&id);
                if self.role == Role::Client && !self.is_closed() && !replaced {
                    self.events.push_back(SessionEvent::ConnectionWanted);
                }
            }
            if finished {
                if let Some(mut conn) = self.pool.remove(id) {
                    self.retired.absorb(conn.stats());
                    let error = conn.take_error();
                    debug!(
                        session = %self.id,
                        conn = %id,
                        read = %fmt_bytes(conn.stats().bytes_read),
                        written = %fmt_bytes(conn.stats().bytes_written),
                        error = ?error,
                        "connection removed"
                    );
                }
                self.rotating.remove(&id);
                self.events.push_back(SessionEvent::ConnectionClosed(id));
            }
        }

        let suspendable = matches!(self.state, SessionState::Opening | SessionState::Active);
        if suspendable && self.center.live_connections().is_empty() {
            warn!(
                session = %self.id,
                grace = ?self.config.suspend_grace,
                "all connections lost, suspending session"
            );
            self.state = SessionState::Suspended;
            self.suspended_at = Some(now);
        }
    }

    fn rotate_connections(&mut self, now: Instant) {
        if self.role != Role::Client || self.is_closed() {
            return;
        }
        for id in self.pool.open_ids() {
            let wants = self.pool.get(id).is_some_and(|c| c.wants_rotation(now));
            if wants && self.rotating.insert(id) {
                info!(session = %self.id, conn = %id, "connection due for rotation");
                self.events.push_back(SessionEvent::ConnectionWanted);
            }
        }
    }

    // =========================================================================
    // Streams
    // =========================================================================

    /// Open a stream. Its OPEN frame rides on the first data written.
    pub fn open_stream(&mut self, config: StreamConfig, now: Instant) -> Result<u16, SessionError> {
        if self.is_closed() {
            return Err(SessionError::SessionClosed);
        }
        let id = self.streams.allocate_id()?;
        self.streams.insert(Stream::new(id, config, now));
        self.streams_opened += 1;
        debug!(session = %self.id, stream = id, "stream opened");
        self.update_ready(id, now);
        self.defer_dispatch();
        Ok(id)
    }

    /// Write bytes to a stream.
    pub fn write(&mut self, stream_id: u16, data: &[u8], now: Instant) -> Result<(), SessionError> {
        if stream_id == CONTROL_STREAM_ID {
            return Err(SessionError::UnknownStream(stream_id));
        }
        let stream = self
            .streams
            .get_mut(stream_id)
            .ok_or(SessionError::UnknownStream(stream_id))?;
        if stream.config().capped && data.len() > MAX_MSS {
            return Err(SessionError::ChunkTooLarge {
                len: data.len(),
                max: MAX_MSS,
            });
        }
        if !stream.write(data, now) {
            return Err(SessionError::StreamClosed(stream_id));
        }
        self.update_ready(stream_id, now);
        self.defer_dispatch();
        Ok(())
    }

    /// Start the close handshake of a stream. Repeated calls are no-ops.
    pub fn close_stream(&mut self, stream_id: u16, now: Instant) -> Result<(), SessionError> {
        if stream_id == CONTROL_STREAM_ID {
            return Err(SessionError::UnknownStream(stream_id));
        }
        let stream = self
            .streams
            .get_mut(stream_id)
            .ok_or(SessionError::UnknownStream(stream_id))?;
        if stream.close(now) {
            self.update_ready(stream_id, now);
            self.defer_dispatch();
        }
        Ok(())
    }

    fn update_ready(&mut self, stream_id: u16, now: Instant) {
        let priority = self.streams.priority(stream_id, now);
        self.center.ready_write(stream_id, priority);
    }

    fn route_delivered(&mut self, now: Instant) {
        while let Some(frame) = self.center.poll_delivered() {
            let id = frame.stream_id;
            if id == CONTROL_STREAM_ID {
                self.on_control(&frame.data, now);
                continue;
            }
            if !self.streams.contains(id) {
                if !frame.flags.is_open() || self.is_closed() {
                    debug!(session = %self.id, stream = id, index = frame.index, "frame for unknown stream");
                    continue;
                }
                let config = StreamConfig::from_open_flags(frame.flags, &self.config.stream);
                self.streams.insert(Stream::accepted(id, config, now));
                self.streams_opened += 1;
                debug!(session = %self.id, stream = id, "stream opened by peer");
                self.events.push_back(SessionEvent::StreamOpened(id));
            }
            let Some(stream) = self.streams.get_mut(id) else {
                continue;
            };
            let was_open = stream.is_open();
            let buffered = stream.on_frame(frame, now);
            let peer_closed = was_open && !stream.is_open();
            if buffered && self.flush_scheduled.insert(id) {
                self.deferred.push_back(DeferredTask::FlushStream(id));
            }
            if peer_closed {
                self.update_ready(id, now);
                self.defer_dispatch();
            }
        }
        self.collect_closed_streams();
    }

    fn collect_closed_streams(&mut self) {
        for id in self.streams.closed_ids() {
            let Some(mut stream) = self.streams.remove(id) else {
                continue;
            };
            if let Some(data) = stream.take_received() {
                self.events
                    .push_back(SessionEvent::StreamData { stream_id: id, data });
            }
            self.flush_scheduled.remove(&id);
            self.center.ready_write(id, None);
            self.streams_closed += 1;
            self.events.push_back(SessionEvent::StreamClosed(id));
        }
    }

    // =========================================================================
    // Control stream
    // =========================================================================

    fn send_control(&mut self, msg: ControlMessage, now: Instant) {
        if let Some(stream) = self.streams.get_mut(CONTROL_STREAM_ID) {
            stream.write(&msg.encode(), now);
        }
        self.update_ready(CONTROL_STREAM_ID, now);
        self.defer_dispatch();
    }

    fn on_control(&mut self, data: &[u8], now: Instant) {
        match ControlMessage::decode(data) {
            Ok(ControlMessage::SessionOpened) => {
                if self.role == Role::Client {
                    self.mark_opened();
                }
            }
            Ok(ControlMessage::KeyExchange(msg)) => self.on_key_exchange(msg, now),
            Err(err) => warn!(session = %self.id, error = %err, "malformed control message"),
        }
    }

    fn on_key_exchange(&mut self, msg: RekeyMessage, now: Instant) {
        match self.key_exchange.handle(msg, &self.session_key, now) {
            Ok(step) => {
                if let Some(key) = step.new_key {
                    self.session_key = key;
                }
                if let Some(reply) = step.reply {
                    self.send_control(ControlMessage::KeyExchange(reply), now);
                }
                if step.completed {
                    let seq = self.key_exchange.seq();
                    info!(session = %self.id, seq, "key exchange completed");
                    self.events.push_back(SessionEvent::KeyExchanged { seq });
                }
            }
            Err(err) => self.fail(err.into(), now),
        }
    }

    // =========================================================================
    // Deferred work and timers
    // =========================================================================

    fn defer(&mut self, task: DeferredTask) {
        if !self.deferred.contains(&task) {
            self.deferred.push_back(task);
        }
    }

    fn defer_dispatch(&mut self) {
        if !self.dispatch_scheduled {
            self.dispatch_scheduled = true;
            self.deferred.push_back(DeferredTask::Dispatch);
        }
    }

    /// Check if deferred work is waiting.
    pub fn has_deferred(&self) -> bool {
        !self.deferred.is_empty()
    }

    /// Run the work deferred so far. Work deferred while running waits for
    /// the next call.
    pub fn run_deferred(&mut self, now: Instant) {
        let tasks: Vec<DeferredTask> = self.deferred.drain(..).collect();
        for task in tasks {
            match task {
                DeferredTask::DrainReceived => {
                    let more = self.center.drain_received(now);
                    self.route_delivered(now);
                    if more {
                        self.defer(DeferredTask::DrainReceived);
                    }
                    self.defer_dispatch();
                }
                DeferredTask::FlushStream(id) => {
                    self.flush_scheduled.remove(&id);
                    if let Some(data) = self.streams.get_mut(id).and_then(Stream::take_received) {
                        self.events
                            .push_back(SessionEvent::StreamData { stream_id: id, data });
                    }
                }
                DeferredTask::Dispatch => {
                    self.dispatch_scheduled = false;
                    self.dispatch(now);
                }
            }
        }
    }

    fn dispatch(&mut self, now: Instant) {
        if self.is_closed() {
            return;
        }
        self.center.dispatch(now, &mut self.pool, &mut self.streams);
        self.collect_closed_streams();
        if let Some(err) = self.center.poll_error() {
            self.fail(err, now);
        }
    }

    /// Earliest instant at which [`handle_timeout`](Self::handle_timeout)
    /// has work.
    pub fn poll_timeout(&self) -> Option<Instant> {
        let mut deadlines = vec![
            self.pool.poll_timeout(),
            self.streams.poll_timeout(),
            self.open_deadline,
            self.suspended_at.map(|at| at + self.config.suspend_grace),
        ];
        if !self.is_closed() {
            deadlines.push(self.center.poll_timeout());
        }
        if self.state == SessionState::Active {
            deadlines.push(self.key_exchange.poll_timeout());
        }
        deadlines.into_iter().flatten().min()
    }

    /// Run every timer that is due at `now`.
    pub fn handle_timeout(&mut self, now: Instant) {
        for conn in self.pool.iter_mut() {
            conn.handle_timeout(now);
        }
        self.rotate_connections(now);
        self.reap(now);
        if self.is_closed() {
            return;
        }

        if self.open_deadline.is_some_and(|deadline| now >= deadline) {
            self.fail(SessionError::OpenTimeout, now);
            return;
        }
        if self
            .suspended_at
            .is_some_and(|at| now >= at + self.config.suspend_grace)
        {
            self.fail(SessionError::SuspendExpired, now);
            return;
        }

        self.center.handle_timeout(now);
        if let Some(err) = self.center.poll_error() {
            self.fail(err, now);
            return;
        }

        let changed: Vec<u16> = self
            .streams
            .iter_mut()
            .filter_map(|stream| stream.handle_timeout(now).then(|| stream.id()))
            .collect();
        for id in changed {
            self.update_ready(id, now);
        }
        self.collect_closed_streams();

        if self.state == SessionState::Active {
            self.key_exchange.handle_timeout(now);
            if let Some(msg) = self.key_exchange.poll_start(now, self.center.ttl()) {
                self.send_control(ControlMessage::KeyExchange(msg), now);
            }
        }
        self.dispatch(now);
    }

    /// Next event for the owner.
    pub fn poll_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }

    // =========================================================================
    // Close
    // =========================================================================

    /// Close the session and every stream. Repeated calls are no-ops.
    pub fn close(&mut self, now: Instant) {
        self.shutdown(None, now);
    }

    fn fail(&mut self, err: SessionError, now: Instant) {
        warn!(session = %self.id, error = %err, "session failed");
        self.shutdown(Some(err), now);
    }

    fn shutdown(&mut self, reason: Option<SessionError>, now: Instant) {
        if self.is_closed() {
            return;
        }
        let stats = self.stats();
        info!(
            session = %self.id,
            read = %fmt_bytes(stats.connections.bytes_read),
            written = %fmt_bytes(stats.connections.bytes_written),
            streams = stats.streams_opened,
            "session closed"
        );
        self.state = SessionState::Closed;
        self.open_deadline = None;
        self.suspended_at = None;
        for stream in self.streams.iter_mut() {
            if stream.id() != CONTROL_STREAM_ID {
                stream.abort();
            }
        }
        self.collect_closed_streams();
        for conn in self.pool.iter_mut() {
            conn.close(now);
        }
        for id in self.center.live_connections().to_vec() {
            self.center.remove_connection(id);
        }
        self.rotating.clear();
        self.events.push_back(SessionEvent::Closed(reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CryptoError;

    struct Clear;

    impl RecordCipher for Clear {
        fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
            Ok(plaintext.to_vec())
        }

        fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
            Ok(ciphertext.to_vec())
        }
    }

    fn secrets() -> SessionSecrets {
        SessionSecrets {
            auth_key: AuthKey::from_bytes([1; 16]),
            session_key: SessionKey::from_bytes([2; 32]),
        }
    }

    fn session(role: Role, now: Instant) -> Session {
        Session::new(
            role,
            SessionId::from_bytes([7; 8]),
            secrets(),
            SessionConfig::default(),
            now,
        )
    }

    /// Two sessions joined by one in-memory connection pair.
    struct Pair {
        client: Session,
        server: Session,
        links: Vec<(ConnId, ConnId)>,
    }

    impl Pair {
        fn new(now: Instant) -> Self {
            let mut pair = Self {
                client: session(Role::Client, now),
                server: session(Role::Server, now),
                links: Vec::new(),
            };
            pair.link(now);
            pair
        }

        fn link(&mut self, now: Instant) {
            let c = self.client.add_connection(Box::new(Clear), now).unwrap();
            let s = self.server.add_connection(Box::new(Clear), now).unwrap();
            self.links.push((c, s));
        }

        fn pump(&mut self, now: Instant) {
            for _ in 0..64 {
                self.client.run_deferred(now);
                self.server.run_deferred(now);
                let mut moved = false;
                while let Some((conn, bytes)) = self.client.poll_transmit(now) {
                    moved = true;
                    if let Some((_, peer)) = self.links.iter().find(|(c, _)| *c == conn) {
                        let _ = self.server.receive(*peer, &bytes, now);
                    }
                    self.client.on_drained(conn);
                }
                while let Some((conn, bytes)) = self.server.poll_transmit(now) {
                    moved = true;
                    if let Some((peer, _)) = self.links.iter().find(|(_, s)| *s == conn) {
                        let _ = self.client.receive(*peer, &bytes, now);
                    }
                    self.server.on_drained(conn);
                }
                if !moved && !self.client.has_deferred() && !self.server.has_deferred() {
                    break;
                }
            }
        }
    }

    fn events(session: &mut Session) -> Vec<SessionEvent> {
        std::iter::from_fn(|| session.poll_event()).collect()
    }

    #[test]
    fn test_client_opens_on_confirmation() {
        let now = Instant::now();
        let mut pair = Pair::new(now);
        assert_eq!(pair.server.state(), SessionState::Active);
        assert_eq!(pair.client.state(), SessionState::Opening);

        pair.pump(now);
        assert_eq!(pair.client.state(), SessionState::Active);
        assert!(events(&mut pair.client).contains(&SessionEvent::Opened));
    }

    #[test]
    fn test_open_timeout_closes_client() {
        let now = Instant::now();
        let mut client = session(Role::Client, now);
        client.add_connection(Box::new(Clear), now).unwrap();
        let deadline = now + SESSION_OPEN_TIMEOUT;
        assert!(client.poll_timeout().is_some_and(|t| t <= deadline));
        client.handle_timeout(deadline);
        assert!(client.is_closed());
        assert!(events(&mut client)
            .contains(&SessionEvent::Closed(Some(SessionError::OpenTimeout))));
    }

    #[test]
    fn test_stream_data_and_close() {
        let now = Instant::now();
        let mut pair = Pair::new(now);
        pair.pump(now);
        events(&mut pair.server);

        let id = pair.client.open_stream(StreamConfig::default(), now).unwrap();
        assert_eq!(id, 2);
        pair.client.write(id, b"hello ", now).unwrap();
        pair.client.write(id, b"world", now).unwrap();
        pair.pump(now);

        let server_events = events(&mut pair.server);
        assert_eq!(server_events[0], SessionEvent::StreamOpened(2));
        let data: Vec<u8> = server_events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::StreamData { data, .. } => Some(data.to_vec()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(data, b"hello world");

        pair.client.close_stream(id, now).unwrap();
        pair.client.close_stream(id, now).unwrap();
        pair.pump(now);
        assert!(events(&mut pair.server).contains(&SessionEvent::StreamClosed(2)));
        assert!(events(&mut pair.client).contains(&SessionEvent::StreamClosed(2)));
        assert_eq!(
            pair.client.write(id, b"late", now),
            Err(SessionError::UnknownStream(2))
        );
    }

    #[test]
    fn test_write_to_control_stream_rejected() {
        let now = Instant::now();
        let mut client = session(Role::Client, now);
        assert_eq!(
            client.write(CONTROL_STREAM_ID, b"x", now),
            Err(SessionError::UnknownStream(0))
        );
    }

    #[test]
    fn test_mss_clamped_to_record_size() {
        assert_eq!(SessionConfig::default().with_mss(usize::MAX).mss, MAX_MSS);
        assert_eq!(SessionConfig::default().with_mss(1).connection.mss, MIN_MSS);
    }

    #[test]
    fn test_oversized_capped_write_is_rejected() {
        let now = Instant::now();
        let mut pair = Pair::new(now);
        pair.pump(now);
        events(&mut pair.server);

        let id = pair.client.open_stream(StreamConfig::default().capped(), now).unwrap();
        assert_eq!(
            pair.client.write(id, &vec![1; MAX_MSS + 1], now),
            Err(SessionError::ChunkTooLarge {
                len: MAX_MSS + 1,
                max: MAX_MSS,
            })
        );
        assert_eq!(
            pair.client.write(id, &vec![2; 70_000], now),
            Err(SessionError::ChunkTooLarge {
                len: 70_000,
                max: MAX_MSS,
            })
        );

        pair.client.write(id, &vec![3; MAX_MSS], now).unwrap();
        pair.pump(now);
        assert_eq!(pair.client.live_connections(), 1);
        assert_eq!(pair.server.live_connections(), 1);
        assert_eq!(pair.client.state(), SessionState::Active);

        let chunks: Vec<usize> = events(&mut pair.server)
            .iter()
            .filter_map(|e| match e {
                SessionEvent::StreamData { data, .. } => Some(data.len()),
                _ => None,
            })
            .collect();
        assert_eq!(chunks, vec![MAX_MSS]);
    }

    #[test]
    fn test_losing_all_connections_suspends_then_resumes() {
        let now = Instant::now();
        let mut pair = Pair::new(now);
        pair.pump(now);
        events(&mut pair.client);

        let (conn, _) = pair.links[0];
        pair.client.connection_closed(conn, now);
        assert_eq!(pair.client.state(), SessionState::Suspended);
        let ev = events(&mut pair.client);
        assert!(ev.contains(&SessionEvent::ConnectionWanted));
        assert!(ev.contains(&SessionEvent::ConnectionClosed(conn)));

        pair.client.add_connection(Box::new(Clear), now).unwrap();
        assert_eq!(pair.client.state(), SessionState::Active);
    }

    #[test]
    fn test_suspend_grace_expiry_closes() {
        let now = Instant::now();
        let mut pair = Pair::new(now);
        pair.pump(now);
        let (_, conn) = pair.links[0];
        pair.server.connection_closed(conn, now);
        assert_eq!(pair.server.state(), SessionState::Suspended);

        pair.server.handle_timeout(now + SESSION_SUSPEND_GRACE);
        assert!(pair.server.is_closed());
        assert!(pair.server.is_finished());
    }

    #[test]
    fn test_close_is_idempotent() {
        let now = Instant::now();
        let mut pair = Pair::new(now);
        pair.pump(now);
        let id = pair.client.open_stream(StreamConfig::default(), now).unwrap();
        events(&mut pair.client);

        pair.client.close(now);
        pair.client.close(now);
        let ev = events(&mut pair.client);
        assert_eq!(
            ev.iter()
                .filter(|e| matches!(e, SessionEvent::Closed(_)))
                .count(),
            1
        );
        assert!(ev.contains(&SessionEvent::StreamClosed(id)));
        assert!(pair.client.open_stream(StreamConfig::default(), now).is_err());

        // One CLOSE record went out; a second close queued nothing.
        assert!(pair.client.poll_transmit(now).is_some());
        assert!(pair.client.poll_transmit(now).is_none());
    }

    #[test]
    fn test_key_exchange_rotates_session_key() {
        let now = Instant::now();
        let config = SessionConfig::default().with_key_exchange_interval(Duration::from_secs(60));
        let mut client = Session::new(
            Role::Client,
            SessionId::from_bytes([7; 8]),
            secrets(),
            config.clone(),
            now,
        );
        let mut server = Session::new(
            Role::Server,
            SessionId::from_bytes([7; 8]),
            secrets(),
            config,
            now,
        );
        let mut pair = Pair {
            client,
            server,
            links: Vec::new(),
        };
        pair.link(now);
        pair.pump(now);

        let later = now + Duration::from_secs(60);
        pair.client.handle_timeout(later);
        pair.pump(later);

        assert_ne!(pair.client.session_key(), &secrets().session_key);
        assert_eq!(pair.client.session_key(), pair.server.session_key());
        assert!(events(&mut pair.client).contains(&SessionEvent::KeyExchanged { seq: 1 }));
        assert!(events(&mut pair.server).contains(&SessionEvent::KeyExchanged { seq: 1 }));
        assert_eq!(pair.client.stats().key_exchanges, 1);
    }
}
