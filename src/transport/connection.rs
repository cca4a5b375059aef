//! Connection state management.
//!
//! A [`Connection`] is the sans-I/O half of one TCP flow: it owns record
//! framing, the record cipher, liveness probing, the two-phase close and the
//! randomized expiry budget. Bytes move in through [`Connection::receive`] and
//! out through [`Connection::flush`]; the socket task only copies them.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;
use tracing::{debug, warn};

use super::frame::Frame;
use super::record::{encode_record, RecordReader, RecordType};
use super::timing::{jitter, RttEstimator};
use crate::core::{
    util::fmt_bytes, ConnectionError, FrameError, FrameSink, RecordCipher, CONNECTION_CLOSE_TIMEOUT,
    CONNECTION_EXPIRY_BYTES, CONNECTION_EXPIRY_TIME, CONN_CLOSE, CONN_CLOSE_ACK, CONN_PING,
    CONN_PING_ACK, CONN_PING_ACK_ACK, DATA_PHASE_PREFIX, DEFAULT_MSS, PING_IDLE, PING_TIMEOUT,
};

/// Arena handle of a connection. Ids are never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl ConnId {
    /// Raw id value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// Data transfer active.
    Open,
    /// CLOSE sent, waiting for CLOSE_ACK.
    Closing,
    /// Closed; only queued control records may still be flushed.
    Closed,
}

/// Per-connection tunables.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Backpressure threshold and stream payload size.
    pub mss: usize,
    /// Send a ping after this long without inbound traffic.
    pub ping_idle: Duration,
    /// Close if a ping is not answered within this.
    pub ping_timeout: Duration,
    /// Force-close if CLOSE is not acknowledged within this.
    pub close_timeout: Duration,
    /// Base lifetime, randomized per connection.
    pub expiry_time: Duration,
    /// Base data volume, randomized per connection.
    pub expiry_bytes: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            mss: DEFAULT_MSS,
            ping_idle: PING_IDLE,
            ping_timeout: PING_TIMEOUT,
            close_timeout: CONNECTION_CLOSE_TIMEOUT,
            expiry_time: CONNECTION_EXPIRY_TIME,
            expiry_bytes: CONNECTION_EXPIRY_BYTES,
        }
    }
}

/// Byte and frame counters of a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Wire bytes received.
    pub bytes_read: u64,
    /// Wire bytes handed to the socket.
    pub bytes_written: u64,
    /// Frames decoded.
    pub frames_read: u64,
    /// Frames queued.
    pub frames_written: u64,
}

impl ConnectionStats {
    /// Add another connection's counters into these.
    pub fn absorb(&mut self, other: &ConnectionStats) {
        self.bytes_read += other.bytes_read;
        self.bytes_written += other.bytes_written;
        self.frames_read += other.frames_read;
        self.frames_written += other.frames_written;
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingPing {
    seq: u32,
    sent_at: Instant,
}

/// One physical TCP flow participating in a session.
pub struct Connection {
    id: ConnId,
    config: ConnectionConfig,
    phase: ConnectionPhase,
    cipher: Box<dyn RecordCipher>,
    reader: RecordReader,

    queue: VecDeque<(RecordType, Bytes)>,
    queued_bytes: usize,
    outstanding_bytes: usize,
    prefix_written: bool,

    created_at: Instant,
    last_recv: Instant,
    rtt: RttEstimator,
    ping_seq: u32,
    ping: Option<PendingPing>,
    ping_ack: Option<PendingPing>,
    close_deadline: Option<Instant>,
    expires_at: Instant,
    expiry_bytes: u64,

    stats: ConnectionStats,
    error: Option<ConnectionError>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("phase", &self.phase)
            .field("queued_bytes", &self.queued_bytes)
            .field("outstanding_bytes", &self.outstanding_bytes)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Create a connection entering its data phase at `now`.
    pub fn new(
        id: ConnId,
        cipher: Box<dyn RecordCipher>,
        config: ConnectionConfig,
        now: Instant,
    ) -> Self {
        let expires_at = now + jitter(config.expiry_time, 0.75, 1.25);
        let expiry_bytes = (config.expiry_bytes as f64 * rand_factor()) as u64;
        Self {
            id,
            config,
            phase: ConnectionPhase::Open,
            cipher,
            reader: RecordReader::new(true),
            queue: VecDeque::new(),
            queued_bytes: 0,
            outstanding_bytes: 0,
            prefix_written: false,
            created_at: now,
            last_recv: now,
            rtt: RttEstimator::new(),
            ping_seq: 0,
            ping: None,
            ping_ack: None,
            close_deadline: None,
            expires_at,
            expiry_bytes,
            stats: ConnectionStats::default(),
            error: None,
        }
    }

    /// Arena id.
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Lifecycle state.
    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    /// Check if the connection accepts frames.
    pub fn is_open(&self) -> bool {
        self.phase == ConnectionPhase::Open
    }

    /// Check if the connection is closed.
    pub fn is_closed(&self) -> bool {
        self.phase == ConnectionPhase::Closed
    }

    /// Counters.
    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Ping RTT estimator.
    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    /// Negotiated MSS.
    pub fn mss(&self) -> usize {
        self.config.mss
    }

    /// Bytes queued or handed to the socket and not yet drained.
    pub fn pending_bytes(&self) -> usize {
        self.queued_bytes + self.outstanding_bytes
    }

    /// Check if another frame fits under the backpressure threshold.
    pub fn has_capacity(&self) -> bool {
        self.is_open() && self.pending_bytes() < self.config.mss
    }

    /// Check if nothing is queued or in the socket.
    pub fn is_drained(&self) -> bool {
        self.pending_bytes() == 0
    }

    /// Check if there are records waiting for [`flush`](Self::flush).
    pub fn wants_flush(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Take the error that closed this connection, if any.
    pub fn take_error(&mut self) -> Option<ConnectionError> {
        self.error.take()
    }

    /// Queue a frame. Returns `false` once the connection is over its
    /// backpressure threshold (or not open); the frame is only queued when
    /// the connection is open.
    pub fn write(&mut self, frame: &Frame) -> bool {
        if !self.is_open() {
            return false;
        }
        let body = frame.encode();
        self.queued_bytes += body.len();
        self.queue.push_back((RecordType::Frame, body));
        self.stats.frames_written += 1;
        self.has_capacity()
    }

    fn queue_control(&mut self, code: u8, seq: Option<u32>) {
        let mut body = BytesMut::with_capacity(5);
        body.put_u8(code);
        if let Some(seq) = seq {
            body.put_u32(seq);
        }
        self.queued_bytes += body.len();
        self.queue.push_back((RecordType::Control, body.freeze()));
    }

    /// Encrypt all queued records into one buffer for the socket.
    ///
    /// The returned bytes count as outstanding until
    /// [`on_drained`](Self::on_drained) is called.
    pub fn flush(&mut self) -> Result<Option<Bytes>, ConnectionError> {
        if self.queue.is_empty() {
            return Ok(None);
        }
        let mut out = BytesMut::with_capacity(self.queued_bytes + self.queue.len() * 32);
        if !self.prefix_written {
            out.put_slice(&DATA_PHASE_PREFIX);
            self.prefix_written = true;
        }
        while let Some((record_type, body)) = self.queue.pop_front() {
            let ciphertext = match self.cipher.encrypt(&body) {
                Ok(ciphertext) => ciphertext,
                Err(err) => return Err(self.fail(err.into())),
            };
            if let Err(err) = encode_record(record_type, &ciphertext, &mut out) {
                return Err(self.fail(err.into()));
            }
        }
        self.queued_bytes = 0;
        self.outstanding_bytes += out.len();
        self.stats.bytes_written += out.len() as u64;
        Ok(Some(out.freeze()))
    }

    /// The socket finished writing everything handed out by `flush`.
    pub fn on_drained(&mut self) {
        self.outstanding_bytes = 0;
    }

    /// Feed bytes read from the socket; decoded frames go to `sink`.
    pub fn receive<S: FrameSink + ?Sized>(
        &mut self,
        data: &[u8],
        now: Instant,
        sink: &mut S,
    ) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Ok(());
        }
        self.reader.push(data);
        self.last_recv = now;
        self.stats.bytes_read += data.len() as u64;

        loop {
            let record = match self.reader.next_record() {
                Ok(Some(record)) => record,
                Ok(None) => return Ok(()),
                Err(err) => return Err(self.fail(err.into())),
            };
            if let Err(err) = self.handle_record(record, now, sink) {
                return Err(self.fail(err));
            }
            if self.is_closed() {
                return Ok(());
            }
        }
    }

    fn handle_record<S: FrameSink + ?Sized>(
        &mut self,
        (record_type, body): (RecordType, Bytes),
        now: Instant,
        sink: &mut S,
    ) -> Result<(), ConnectionError> {
        match record_type {
            RecordType::Frame => {
                let plaintext = self.cipher.decrypt(&body)?;
                let frame = Frame::decode(Bytes::from(plaintext))?;
                self.stats.frames_read += 1;
                sink.on_frame(self.id, frame);
                Ok(())
            }
            RecordType::Control => {
                let plaintext = self.cipher.decrypt(&body)?;
                self.handle_control(&plaintext, now)
            }
            RecordType::Handshake => {
                Err(FrameError::InvalidRecordType(RecordType::Handshake.as_byte()).into())
            }
        }
    }

    fn handle_control(&mut self, body: &[u8], now: Instant) -> Result<(), ConnectionError> {
        let Some((&code, rest)) = body.split_first() else {
            return Err(FrameError::Truncated {
                expected: 1,
                actual: 0,
            }
            .into());
        };
        let seq = || -> Result<u32, ConnectionError> {
            let bytes: [u8; 4] = rest
                .try_into()
                .map_err(|_| FrameError::InvalidControl(code))?;
            Ok(u32::from_be_bytes(bytes))
        };

        match code {
            CONN_PING => {
                let seq = seq()?;
                self.ping_ack = Some(PendingPing { seq, sent_at: now });
                self.queue_control(CONN_PING_ACK, Some(seq));
            }
            CONN_PING_ACK => {
                let seq = seq()?;
                if let Some(ping) = self.ping.filter(|p| p.seq == seq) {
                    self.rtt.update(now.saturating_duration_since(ping.sent_at));
                    self.ping = None;
                    self.queue_control(CONN_PING_ACK_ACK, Some(seq));
                }
            }
            CONN_PING_ACK_ACK => {
                let seq = seq()?;
                if let Some(ack) = self.ping_ack.filter(|p| p.seq == seq) {
                    self.rtt.update(now.saturating_duration_since(ack.sent_at));
                    self.ping_ack = None;
                }
            }
            CONN_CLOSE => {
                debug!(conn = %self.id, "peer closed connection");
                self.queue_control(CONN_CLOSE_ACK, None);
                self.phase = ConnectionPhase::Closed;
            }
            CONN_CLOSE_ACK => {
                if self.phase == ConnectionPhase::Closing {
                    debug!(conn = %self.id, "close acknowledged");
                }
                self.phase = ConnectionPhase::Closed;
            }
            other => return Err(FrameError::InvalidControl(other).into()),
        }
        Ok(())
    }

    /// Start a graceful close. Repeated calls are no-ops.
    pub fn close(&mut self, now: Instant) {
        if self.phase != ConnectionPhase::Open {
            return;
        }
        debug!(
            conn = %self.id,
            read = %fmt_bytes(self.stats.bytes_read),
            written = %fmt_bytes(self.stats.bytes_written),
            "closing connection"
        );
        self.queue_control(CONN_CLOSE, None);
        self.phase = ConnectionPhase::Closing;
        self.close_deadline = Some(now + self.config.close_timeout);
    }

    /// Tear the connection down immediately (socket error or EOF).
    pub fn abort(&mut self) {
        self.phase = ConnectionPhase::Closed;
        self.queue.clear();
        self.queued_bytes = 0;
    }

    fn fail(&mut self, err: ConnectionError) -> ConnectionError {
        warn!(conn = %self.id, error = %err, "connection failed");
        self.abort();
        self.error = Some(err.clone());
        err
    }

    fn idle_timeout(&self) -> Duration {
        self.config.ping_idle.max(self.rtt.rto() * 4)
    }

    fn ping_deadline(&self, ping: &PendingPing) -> Instant {
        ping.sent_at + self.config.ping_timeout.max(self.rtt.rto() * 2)
    }

    /// Next instant at which [`handle_timeout`](Self::handle_timeout) has work.
    pub fn poll_timeout(&self) -> Option<Instant> {
        match self.phase {
            ConnectionPhase::Closed => None,
            ConnectionPhase::Closing => self.close_deadline,
            ConnectionPhase::Open => {
                let liveness = match &self.ping {
                    Some(ping) => self.ping_deadline(ping),
                    None => self.last_recv + self.idle_timeout(),
                };
                Some(liveness.min(self.expires_at))
            }
        }
    }

    /// Drive liveness, close and expiry timers.
    pub fn handle_timeout(&mut self, now: Instant) {
        match self.phase {
            ConnectionPhase::Closed => {}
            ConnectionPhase::Closing => {
                if self.close_deadline.is_some_and(|deadline| now >= deadline) {
                    debug!(conn = %self.id, "close not acknowledged, forcing");
                    self.abort();
                }
            }
            ConnectionPhase::Open => {
                if now >= self.expires_at {
                    debug!(conn = %self.id, "connection expired");
                    self.error = Some(ConnectionError::Expired);
                    self.close(now);
                    return;
                }
                match self.ping {
                    Some(ping) if now >= self.ping_deadline(&ping) => {
                        warn!(conn = %self.id, "ping timeout");
                        self.abort();
                        self.error = Some(ConnectionError::PingTimeout);
                    }
                    Some(_) => {}
                    None if now >= self.last_recv + self.idle_timeout() => {
                        self.ping_seq = self.ping_seq.wrapping_add(1);
                        self.ping = Some(PendingPing {
                            seq: self.ping_seq,
                            sent_at: now,
                        });
                        self.queue_control(CONN_PING, Some(self.ping_seq));
                    }
                    None => {}
                }
            }
        }
    }

    /// Check if the connection is past half its time or data budget and
    /// should be replaced by a fresh one.
    pub fn wants_rotation(&self, now: Instant) -> bool {
        if !self.is_open() {
            return false;
        }
        let half_life = self.expires_at.saturating_duration_since(self.created_at) / 2;
        let volume = self.stats.bytes_read + self.stats.bytes_written;
        now >= self.created_at + half_life || volume >= self.expiry_bytes / 2
    }
}

fn rand_factor() -> f64 {
    rand::thread_rng().gen_range(0.75..=1.25)
}

/// Arena of the connections of one session, keyed by [`ConnId`].
///
/// A frame remembers the id of the connection that carried it; once the
/// connection is removed every lookup of that id misses.
#[derive(Debug, Default)]
pub struct ConnectionPool {
    connections: BTreeMap<ConnId, Connection>,
    next_id: u64,
}

impl ConnectionPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a fresh id.
    pub fn allocate_id(&mut self) -> ConnId {
        self.next_id += 1;
        ConnId(self.next_id)
    }

    /// Add a connection.
    pub fn insert(&mut self, conn: Connection) {
        self.connections.insert(conn.id(), conn);
    }

    /// Remove a connection.
    pub fn remove(&mut self, id: ConnId) -> Option<Connection> {
        self.connections.remove(&id)
    }

    /// Look up a connection.
    pub fn get(&self, id: ConnId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    /// Look up a connection mutably.
    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    /// Check if an id is still live in the arena.
    pub fn contains(&self, id: ConnId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Number of connections, any phase.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Ids of all connections.
    pub fn ids(&self) -> Vec<ConnId> {
        self.connections.keys().copied().collect()
    }

    /// Ids of connections that accept frames.
    pub fn open_ids(&self) -> Vec<ConnId> {
        self.connections
            .values()
            .filter(|c| c.is_open())
            .map(Connection::id)
            .collect()
    }

    /// Iterate over connections.
    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    /// Iterate mutably over connections.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.connections.values_mut()
    }

    /// Earliest timer of any connection.
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.connections
            .values()
            .filter_map(Connection::poll_timeout)
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CryptoError;
    use crate::transport::{Action, StreamFlags, StreamFrame};

    struct Clear;

    impl RecordCipher for Clear {
        fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
            Ok(plaintext.to_vec())
        }

        fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
            Ok(ciphertext.to_vec())
        }
    }

    #[derive(Default)]
    struct Collect(Vec<(ConnId, Frame)>);

    impl FrameSink for Collect {
        fn on_frame(&mut self, conn: ConnId, frame: Frame) {
            self.0.push((conn, frame));
        }
    }

    fn pair(config: ConnectionConfig, now: Instant) -> (Connection, Connection) {
        let mut pool = ConnectionPool::new();
        let a = Connection::new(pool.allocate_id(), Box::new(Clear), config.clone(), now);
        let b = Connection::new(pool.allocate_id(), Box::new(Clear), config, now);
        (a, b)
    }

    /// Flush everything from `from` into `to`, returning frames `to` decoded.
    fn pump(from: &mut Connection, to: &mut Connection, now: Instant) -> Vec<Frame> {
        let mut sink = Collect::default();
        if let Some(bytes) = from.flush().unwrap() {
            to.receive(&bytes, now, &mut sink).unwrap();
            from.on_drained();
        }
        sink.0.into_iter().map(|(_, f)| f).collect()
    }

    fn data_frame(index: u32, len: usize) -> Frame {
        Frame::stream(
            index,
            StreamFrame::new(5, StreamFlags::NONE, index, Bytes::from(vec![7u8; len])),
        )
    }

    #[test]
    fn test_frames_cross_the_wire() {
        let now = Instant::now();
        let (mut a, mut b) = pair(ConnectionConfig::default(), now);

        assert!(a.write(&data_frame(1, 10)));
        assert!(a.write(&Frame::control(Action::Ack, Bytes::new())));
        let frames = pump(&mut a, &mut b, now);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], data_frame(1, 10));
        assert_eq!(frames[1].action, Action::Ack);
        assert_eq!(b.stats().frames_read, 2);
        assert_eq!(a.stats().bytes_written, b.stats().bytes_read);
    }

    #[test]
    fn test_backpressure_until_drained() {
        let now = Instant::now();
        let config = ConnectionConfig {
            mss: 100,
            ..Default::default()
        };
        let (mut a, _) = pair(config, now);

        assert!(a.write(&data_frame(1, 10)));
        assert!(!a.write(&data_frame(2, 200)));
        assert!(!a.has_capacity());

        a.flush().unwrap();
        assert!(!a.has_capacity());
        a.on_drained();
        assert!(a.has_capacity());
        assert!(a.is_drained());
    }

    #[test]
    fn test_ping_exchange_samples_rtt_on_both_sides() {
        let start = Instant::now();
        let (mut a, mut b) = pair(ConnectionConfig::default(), start);

        let idle = start + PING_IDLE + Duration::from_millis(1);
        // b hears from a just before the idle deadline, so only a pings.
        b.last_recv = idle;
        a.handle_timeout(idle);
        pump(&mut a, &mut b, idle);
        let later = idle + Duration::from_millis(40);
        pump(&mut b, &mut a, later);
        assert!(a.rtt().has_sample());
        assert!(a.ping.is_none());

        pump(&mut a, &mut b, later + Duration::from_millis(40));
        assert!(b.rtt().has_sample());
    }

    #[test]
    fn test_ping_timeout_closes() {
        let start = Instant::now();
        let (mut a, _) = pair(ConnectionConfig::default(), start);

        let idle = start + PING_IDLE + Duration::from_millis(1);
        a.handle_timeout(idle);
        assert!(a.ping.is_some());
        a.handle_timeout(idle + PING_TIMEOUT + Duration::from_secs(1));
        assert!(a.is_closed());
        assert!(matches!(a.take_error(), Some(ConnectionError::PingTimeout)));
    }

    #[test]
    fn test_close_handshake_is_idempotent() {
        let now = Instant::now();
        let (mut a, mut b) = pair(ConnectionConfig::default(), now);

        a.close(now);
        a.close(now);
        assert_eq!(a.phase(), ConnectionPhase::Closing);
        assert_eq!(a.queue.len(), 1);
        assert!(!a.write(&data_frame(1, 1)));

        pump(&mut a, &mut b, now);
        assert!(b.is_closed());
        pump(&mut b, &mut a, now);
        assert!(a.is_closed());
    }

    #[test]
    fn test_close_timeout_forces() {
        let now = Instant::now();
        let (mut a, _) = pair(ConnectionConfig::default(), now);
        a.close(now);
        a.handle_timeout(now + CONNECTION_CLOSE_TIMEOUT);
        assert!(a.is_closed());
    }

    #[test]
    fn test_malformed_record_is_fatal() {
        let now = Instant::now();
        let (_, mut b) = pair(ConnectionConfig::default(), now);
        let mut wire = DATA_PHASE_PREFIX.to_vec();
        // Frame record with a 3-byte body: shorter than a frame header.
        wire.extend_from_slice(&[0x17, 0x03, 0x03, 0x00, 0x03, 0, 0, 0]);
        let mut sink = Collect::default();
        let err = b.receive(&wire, now, &mut sink).unwrap_err();
        assert!(err.is_protocol_violation());
        assert!(b.is_closed());
    }

    #[test]
    fn test_rotation_budget() {
        let now = Instant::now();
        let config = ConnectionConfig {
            expiry_time: Duration::from_secs(100),
            ..Default::default()
        };
        let (a, _) = pair(config, now);
        assert!(!a.wants_rotation(now));
        // Randomized lifetime is at most 125s, so half of it is past by 63s.
        assert!(a.wants_rotation(now + Duration::from_secs(63)));
    }

    #[test]
    fn test_pool_ids_are_not_reused() {
        let now = Instant::now();
        let mut pool = ConnectionPool::new();
        let id = pool.allocate_id();
        pool.insert(Connection::new(id, Box::new(Clear), ConnectionConfig::default(), now));
        assert!(pool.contains(id));
        pool.remove(id);
        let next = pool.allocate_id();
        assert_ne!(id, next);
        assert!(pool.get(id).is_none());
    }
}
