//! Streams multiplexed over a session.
//!
//! A stream turns application writes into [`StreamFrame`]s on demand (the
//! center pulls them through [`StreamSource`]) and reassembles inbound frames
//! by per-stream index. Capped streams skip reassembly: every write is one
//! frame with index 0, delivered in arrival order.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::center::Priority;
use crate::core::{
    SessionError, StreamDirectory, StreamSource, CONTROL_STREAM_ID, DEFAULT_MSS,
    STREAM_ATTEMPT_DECAY, STREAM_CLOSE_TIMEOUT, STREAM_DECAY_WINDOW, STREAM_EXPIRY,
};
use crate::crypto::Role;
use crate::transport::{StreamFlags, StreamFrame};

/// Per-stream policy, fixed at creation.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    /// 0 is best-effort; anything else is served after every best-effort
    /// stream.
    pub priority: u8,
    /// One frame per write, no reassembly.
    pub capped: bool,
    /// Idle time after which the stream closes itself (`None`: never).
    pub expiry: Option<Duration>,
    /// How long a close waits for the peer's CLOSE.
    pub close_timeout: Duration,
    /// Time without progress after which the scheduling score drops to 0.
    pub decay_window: Duration,
    /// Score factor while a pulled write is outstanding.
    pub attempt_decay: f64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            priority: 0,
            capped: false,
            expiry: Some(STREAM_EXPIRY),
            close_timeout: STREAM_CLOSE_TIMEOUT,
            decay_window: STREAM_DECAY_WINDOW,
            attempt_decay: STREAM_ATTEMPT_DECAY,
        }
    }
}

impl StreamConfig {
    /// Set the priority class.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Make the stream capped.
    pub fn capped(mut self) -> Self {
        self.capped = true;
        self
    }

    /// Disable idle expiry.
    pub fn without_expiry(mut self) -> Self {
        self.expiry = None;
        self
    }

    /// Config of the session control stream.
    pub fn control() -> Self {
        Self::default().capped().without_expiry()
    }

    /// Hint bits carried by the OPEN frame.
    pub fn open_flags(&self) -> StreamFlags {
        let mut flags = StreamFlags::OPEN;
        if self.priority == 0 {
            flags = flags.with(StreamFlags::NONE_PRIORITY);
        }
        if self.capped {
            flags = flags.with(StreamFlags::CAPPED);
        }
        if self.expiry.is_none() {
            flags = flags.with(StreamFlags::NONE_EXPIRY);
        }
        flags
    }

    /// Policy of a stream opened by the peer, from its OPEN frame hints.
    /// Timing comes from `base`.
    pub fn from_open_flags(flags: StreamFlags, base: &StreamConfig) -> Self {
        Self {
            priority: if flags.contains(StreamFlags::NONE_PRIORITY) {
                0
            } else {
                base.priority.max(1)
            },
            capped: flags.contains(StreamFlags::CAPPED),
            expiry: if flags.contains(StreamFlags::NONE_EXPIRY) {
                None
            } else {
                base.expiry.or(Some(STREAM_EXPIRY))
            },
            close_timeout: base.close_timeout,
            decay_window: base.decay_window,
            attempt_decay: base.attempt_decay,
        }
    }
}

/// Lifecycle of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Data flows both ways.
    Open,
    /// A CLOSE was queued (locally or in answer to the peer).
    Closing,
    /// Close handshake finished or timed out.
    Closed,
}

/// One logical byte stream.
#[derive(Debug)]
pub struct Stream {
    id: u16,
    config: StreamConfig,
    state: StreamState,

    open_sent: bool,
    send_buf: BytesMut,
    chunks: VecDeque<Bytes>,
    send_index: u32,
    close_queued: bool,
    closing_since: Option<Instant>,
    close_sent_at: Option<Instant>,
    peer_closed: bool,
    /// Frames were pulled and the rest of the backlog is still queued.
    attempt_outstanding: bool,

    recv_index: u32,
    recv_pending: BTreeMap<u32, StreamFrame>,
    recv_buf: BytesMut,

    created_at: Instant,
    ready_since: Option<Instant>,
    last_progress: Instant,
    last_activity: Instant,
    bytes_read: u64,
    bytes_written: u64,
}

impl Stream {
    /// Stream opened by this side; the OPEN flag rides on its first frame.
    pub fn new(id: u16, config: StreamConfig, now: Instant) -> Self {
        Self {
            id,
            config,
            state: StreamState::Open,
            open_sent: false,
            send_buf: BytesMut::new(),
            chunks: VecDeque::new(),
            send_index: 0,
            close_queued: false,
            closing_since: None,
            close_sent_at: None,
            peer_closed: false,
            attempt_outstanding: false,
            recv_index: 1,
            recv_pending: BTreeMap::new(),
            recv_buf: BytesMut::new(),
            created_at: now,
            ready_since: None,
            last_progress: now,
            last_activity: now,
            bytes_read: 0,
            bytes_written: 0,
        }
    }

    /// Stream opened by the peer; no OPEN frame is owed.
    pub fn accepted(id: u16, config: StreamConfig, now: Instant) -> Self {
        let mut stream = Self::new(id, config, now);
        stream.open_sent = true;
        stream
    }

    /// Stream id.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Policy.
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Lifecycle state.
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Check if the stream accepts writes.
    pub fn is_open(&self) -> bool {
        self.state == StreamState::Open
    }

    /// Check if the stream is finished.
    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }

    /// Bytes delivered to the application.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Bytes accepted from the application.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Check if a frame is waiting to be pulled.
    pub fn has_pending(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        !self.open_sent
            || !self.send_buf.is_empty()
            || !self.chunks.is_empty()
            || (self.close_queued && self.close_sent_at.is_none())
    }

    fn pending_frames(&self, mss: usize) -> usize {
        let data = self.send_buf.len().div_ceil(mss.max(1)) + self.chunks.len();
        let close = usize::from(self.close_queued && self.close_sent_at.is_none());
        (data + close).max(usize::from(!self.open_sent))
    }

    /// Append application bytes. Returns `false` if the stream no longer
    /// accepts writes.
    pub fn write(&mut self, data: &[u8], now: Instant) -> bool {
        if !self.is_open() {
            return false;
        }
        if data.is_empty() {
            return true;
        }
        if !self.has_pending() {
            self.last_progress = now;
        }
        if self.config.capped {
            self.chunks.push_back(Bytes::copy_from_slice(data));
        } else {
            self.send_buf.extend_from_slice(data);
        }
        self.attempt_outstanding = false;
        self.bytes_written += data.len() as u64;
        self.last_activity = now;
        self.ready_since.get_or_insert(now);
        true
    }

    /// Queue the final CLOSE frame after everything already written.
    /// Repeated calls are no-ops.
    pub fn close(&mut self, now: Instant) -> bool {
        if self.state != StreamState::Open {
            return false;
        }
        debug!(stream = self.id, "closing stream");
        self.state = StreamState::Closing;
        self.close_queued = true;
        self.closing_since = Some(now);
        self.last_activity = now;
        self.ready_since.get_or_insert(now);
        true
    }

    fn next_index(&mut self) -> u32 {
        if self.config.capped {
            return 0;
        }
        self.send_index = self.send_index.wrapping_add(1);
        self.send_index
    }

    /// Materialize the next frame. Returns the frame and whether more
    /// remain.
    pub fn do_write(&mut self, now: Instant, mss: usize) -> Option<(StreamFrame, bool)> {
        if !self.has_pending() {
            self.ready_since = None;
            return None;
        }

        let mut flags = StreamFlags::NONE;
        if !self.open_sent {
            flags = self.config.open_flags();
            self.open_sent = true;
        }

        let data = if let Some(chunk) = self.chunks.pop_front() {
            chunk
        } else if !self.send_buf.is_empty() {
            let take = self.send_buf.len().min(mss.max(1));
            self.send_buf.split_to(take).freeze()
        } else {
            Bytes::new()
        };

        if data.is_empty() && self.close_queued && self.close_sent_at.is_none() {
            flags = flags.with(StreamFlags::CLOSE);
            self.close_sent_at = Some(now);
            if self.peer_closed {
                self.finish("closed by peer");
            }
        }

        let frame = StreamFrame::new(self.id, flags, self.next_index(), data);
        self.last_progress = now;
        self.last_activity = now;
        let more = self.has_pending();
        self.attempt_outstanding = more;
        self.ready_since = if more { Some(now) } else { None };
        trace!(
            stream = self.id,
            index = frame.index,
            len = frame.data.len(),
            more,
            "stream frame"
        );
        Some((frame, more))
    }

    /// Scheduling priority, `None` if nothing is waiting.
    ///
    /// Score is `pending_frames² / (1 + seconds waiting)`, scaled by the
    /// attempt decay while an earlier pull is still being served, and 0 once
    /// no progress was made for the decay window.
    pub fn priority(&self, now: Instant, mss: usize) -> Option<Priority> {
        if !self.has_pending() {
            return None;
        }
        let score = if now.saturating_duration_since(self.last_progress) >= self.config.decay_window
        {
            0.0
        } else {
            let frames = self.pending_frames(mss) as f64;
            let waiting = self
                .ready_since
                .map_or(0.0, |at| now.saturating_duration_since(at).as_secs_f64());
            let score = frames * frames / (1.0 + waiting);
            if self.attempt_outstanding {
                score * self.config.attempt_decay
            } else {
                score
            }
        };
        Some(if self.config.priority == 0 {
            Priority::best_effort(score)
        } else {
            Priority::low(score)
        })
    }

    /// Take an inbound frame. Returns `true` if new bytes are buffered for
    /// the application.
    pub fn on_frame(&mut self, frame: StreamFrame, now: Instant) -> bool {
        if self.is_closed() {
            return false;
        }
        self.last_activity = now;
        if self.config.capped || frame.index == 0 {
            return self.accept(frame);
        }
        if frame.index < self.recv_index || self.recv_pending.contains_key(&frame.index) {
            trace!(stream = self.id, index = frame.index, "duplicate stream frame");
            return false;
        }
        if frame.index > self.recv_index {
            // Early delivery ahead of a gap; hold until contiguous.
            self.recv_pending.insert(frame.index, frame);
            return false;
        }

        let mut delivered = self.accept(frame);
        self.recv_index += 1;
        while let Some(next) = self.recv_pending.remove(&self.recv_index) {
            delivered |= self.accept(next);
            self.recv_index += 1;
        }
        delivered
    }

    fn accept(&mut self, frame: StreamFrame) -> bool {
        let close = frame.flags.is_close();
        let delivered = !frame.data.is_empty();
        if delivered {
            self.bytes_read += frame.data.len() as u64;
            self.recv_buf.extend_from_slice(&frame.data);
        }
        if close {
            self.on_peer_close();
        }
        delivered
    }

    fn on_peer_close(&mut self) {
        if self.peer_closed {
            return;
        }
        self.peer_closed = true;
        match self.state {
            StreamState::Open => {
                debug!(stream = self.id, "peer closed stream");
                self.state = StreamState::Closing;
                self.close_queued = true;
                self.closing_since = Some(self.last_activity);
                self.ready_since.get_or_insert(self.last_activity);
            }
            StreamState::Closing if self.close_sent_at.is_some() => {
                self.finish("close acknowledged");
            }
            _ => {}
        }
    }

    fn finish(&mut self, reason: &'static str) {
        if self.state != StreamState::Closed {
            debug!(
                stream = self.id,
                read = self.bytes_read,
                written = self.bytes_written,
                reason,
                "stream closed"
            );
            self.state = StreamState::Closed;
            self.send_buf.clear();
            self.chunks.clear();
            self.ready_since = None;
        }
    }

    /// Take the bytes buffered for the application.
    pub fn take_received(&mut self) -> Option<Bytes> {
        if self.recv_buf.is_empty() {
            None
        } else {
            Some(self.recv_buf.split().freeze())
        }
    }

    /// Check if the peer has closed its side.
    pub fn is_peer_closed(&self) -> bool {
        self.peer_closed
    }

    /// Next instant [`handle_timeout`](Self::handle_timeout) has work.
    pub fn poll_timeout(&self) -> Option<Instant> {
        match self.state {
            StreamState::Closed => None,
            StreamState::Closing => self.close_deadline(),
            StreamState::Open => self.config.expiry.map(|expiry| self.last_activity + expiry),
        }
    }

    /// Drive idle expiry and the close timeout. Returns `true` if the
    /// stream changed state and may need scheduling.
    pub fn handle_timeout(&mut self, now: Instant) -> bool {
        match self.state {
            StreamState::Closed => false,
            StreamState::Closing => {
                if self.close_deadline().is_some_and(|at| now >= at) {
                    self.finish("close timed out");
                    true
                } else {
                    false
                }
            }
            StreamState::Open => match self.config.expiry {
                Some(expiry) if now >= self.last_activity + expiry => {
                    debug!(stream = self.id, idle = ?expiry, "stream expired");
                    self.close(now)
                }
                _ => false,
            },
        }
    }

    /// The close wait counts from the CLOSE frame, or from the close itself
    /// while that frame has not been pulled.
    fn close_deadline(&self) -> Option<Instant> {
        self.close_sent_at
            .or(self.closing_since)
            .map(|at| at + self.config.close_timeout)
    }

    /// Close without a handshake (session teardown).
    pub fn abort(&mut self) {
        self.finish("aborted");
    }

    /// Age of the stream.
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }
}

// =============================================================================
// Stream map
// =============================================================================

/// Streams of one session keyed by id.
#[derive(Debug)]
pub struct StreamMap {
    streams: BTreeMap<u16, Stream>,
    role: Role,
    next_id: u16,
    mss: usize,
}

impl StreamMap {
    /// Create a map holding only the control stream.
    pub fn new(role: Role, mss: usize, now: Instant) -> Self {
        let mut streams = BTreeMap::new();
        streams.insert(
            CONTROL_STREAM_ID,
            Stream::accepted(CONTROL_STREAM_ID, StreamConfig::control(), now),
        );
        Self {
            streams,
            role,
            next_id: first_id(role),
            mss: if mss == 0 { DEFAULT_MSS } else { mss },
        }
    }

    /// Payload bytes per frame.
    pub fn mss(&self) -> usize {
        self.mss
    }

    /// Change the payload size (after MSS negotiation).
    pub fn set_mss(&mut self, mss: usize) {
        if mss > 0 {
            self.mss = mss;
        }
    }

    /// Reserve the next free id of our parity.
    ///
    /// Servers use odd ids from 1, clients even ids from 2; 0 is the
    /// control stream.
    pub fn allocate_id(&mut self) -> Result<u16, SessionError> {
        for _ in 0..=u16::MAX / 2 {
            let id = self.next_id;
            self.next_id = match self.next_id.checked_add(2) {
                Some(next) => next,
                None => first_id(self.role),
            };
            if id != CONTROL_STREAM_ID && !self.streams.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(SessionError::StreamIdsExhausted)
    }

    /// Add a stream.
    pub fn insert(&mut self, stream: Stream) {
        self.streams.insert(stream.id(), stream);
    }

    /// Remove a stream.
    pub fn remove(&mut self, id: u16) -> Option<Stream> {
        self.streams.remove(&id)
    }

    /// Look up a stream.
    pub fn get(&self, id: u16) -> Option<&Stream> {
        self.streams.get(&id)
    }

    /// Look up a stream mutably.
    pub fn get_mut(&mut self, id: u16) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    /// Check if a stream exists, any state.
    pub fn contains(&self, id: u16) -> bool {
        self.streams.contains_key(&id)
    }

    /// Number of streams, control stream included.
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// Check if only the control stream is left.
    pub fn is_empty(&self) -> bool {
        self.streams.len() <= 1
    }

    /// Ids of all streams.
    pub fn ids(&self) -> Vec<u16> {
        self.streams.keys().copied().collect()
    }

    /// Ids of application streams in the closed state.
    pub fn closed_ids(&self) -> Vec<u16> {
        self.streams
            .values()
            .filter(|s| s.is_closed() && s.id() != CONTROL_STREAM_ID)
            .map(Stream::id)
            .collect()
    }

    /// Iterate mutably over streams.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Stream> {
        self.streams.values_mut()
    }

    /// Earliest timer of any stream.
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.streams.values().filter_map(Stream::poll_timeout).min()
    }
}

fn first_id(role: Role) -> u16 {
    match role {
        Role::Server => 1,
        Role::Client => 2,
    }
}

impl StreamDirectory for StreamMap {
    fn is_open(&self, stream_id: u16) -> bool {
        self.streams.get(&stream_id).is_some_and(|s| !s.is_closed())
    }
}

impl StreamSource for StreamMap {
    fn do_write(&mut self, stream_id: u16, now: Instant) -> Option<(StreamFrame, bool)> {
        let mss = self.mss;
        self.streams.get_mut(&stream_id)?.do_write(now, mss)
    }

    fn priority(&self, stream_id: u16, now: Instant) -> Option<Priority> {
        self.streams.get(&stream_id)?.priority(now, self.mss)
    }
}
