//! The per-session reliability and dispatch engine.
//!
//! Outbound frames move `pending -> in_flight -> (acked | pending again)`.
//! Inbound frames are ordered by index through the gap buffer. All timers are
//! driven by the owner through [`Center::poll_timeout`] and
//! [`Center::handle_timeout`]; nothing here touches a socket.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use super::reorder::{MissingTracker, ReorderBuffer, Slot};
use super::scheduler::{Priority, ReadyQueue};
use crate::core::{
    util::fmt_bytes, FrameSink, SessionError, StreamDirectory, StreamSource, ACK_INTERVAL,
    DEFAULT_INDEX_LIMIT, DEFAULT_MSS, DRAIN_BATCH, FRAME_HEADER_SIZE, INDEX_EPOCH_BIT, INDEX_MASK,
    MAX_RECV_WINDOW,
    MAX_SACK_INDICES, MAX_SEND_RETRIES, RESEND_REQUEUE_BATCH, RESEND_SCAN_INTERVAL,
    RESEND_SCAN_MAX_TTL, RESEND_TIMEOUT_FLOOR, RESORT_INTERVAL, TTL_STAMP_BURST_BYTES,
    TTL_STAMP_INTERVAL,
};
use crate::transport::{
    decode_boundary, decode_indices, encode_indices, jitter, Action, ConnId, Connection,
    ConnectionPool, Frame, FramePayload, StreamFrame, TtlEstimator, TtlStamp,
};

/// Center tunables.
#[derive(Debug, Clone)]
pub struct CenterConfig {
    /// Last index of an epoch; the next write starts an INDEX_RESET.
    pub index_limit: u32,
    /// Lower bound of the retransmission timeout.
    pub resend_timeout_floor: Duration,
    /// Retries of one frame before the session fails.
    pub max_send_retries: u32,
    /// Cadence of the explicit ACK frame.
    pub ack_interval: Duration,
    /// Cadence of the gap scan.
    pub resend_scan_interval: Duration,
    /// Gap scanning is off while the TTL is at or above this.
    pub resend_scan_max_ttl: Duration,
    /// Base TTL stamp interval (randomized).
    pub ttl_stamp_interval: Duration,
    /// Bytes sent that bring the next stamp forward.
    pub ttl_stamp_burst_bytes: u64,
    /// Buffered frames delivered per drain pass.
    pub drain_batch: usize,
    /// Ready-list re-sort cadence.
    pub resort_interval: Duration,
    /// Siblings requeued on a retransmission timeout.
    pub resend_requeue_batch: usize,
    /// Indices listed in a selective ACK.
    pub max_sack_indices: usize,
    /// Inbound indices further ahead than this are dropped.
    pub recv_window: u32,
    /// Negotiated MSS, bounds RESEND batches.
    pub mss: usize,
}

impl Default for CenterConfig {
    fn default() -> Self {
        Self {
            index_limit: DEFAULT_INDEX_LIMIT,
            resend_timeout_floor: RESEND_TIMEOUT_FLOOR,
            max_send_retries: MAX_SEND_RETRIES,
            ack_interval: ACK_INTERVAL,
            resend_scan_interval: RESEND_SCAN_INTERVAL,
            resend_scan_max_ttl: RESEND_SCAN_MAX_TTL,
            ttl_stamp_interval: TTL_STAMP_INTERVAL,
            ttl_stamp_burst_bytes: TTL_STAMP_BURST_BYTES,
            drain_batch: DRAIN_BATCH,
            resort_interval: RESORT_INTERVAL,
            resend_requeue_batch: RESEND_REQUEUE_BATCH,
            max_sack_indices: MAX_SACK_INDICES,
            recv_window: MAX_RECV_WINDOW,
            mss: DEFAULT_MSS,
        }
    }
}

impl CenterConfig {
    /// Set the epoch boundary (at most 31 bits).
    pub fn with_index_limit(mut self, limit: u32) -> Self {
        self.index_limit = limit.clamp(1, INDEX_MASK);
        self
    }

    /// Set the negotiated MSS.
    pub fn with_mss(mut self, mss: usize) -> Self {
        self.mss = mss;
        self
    }

    /// Indices that fit in one RESEND frame.
    pub fn resend_batch(&self) -> usize {
        (self.mss.saturating_sub(FRAME_HEADER_SIZE) / 4).max(1)
    }
}

/// Counters of a center.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CenterStats {
    /// Frames handed to connections (including resends).
    pub frames_sent: u64,
    /// Frames sent again after a timeout, RESEND or connection loss.
    pub frames_resent: u64,
    /// Frames decoded from any connection.
    pub frames_received: u64,
    /// Inbound frames dropped as already seen.
    pub duplicates: u64,
    /// Inbound frames dropped as too far ahead.
    pub out_of_window: u64,
    /// RESEND frames emitted.
    pub resend_requests: u64,
    /// Frame bytes handed to connections.
    pub bytes_sent: u64,
}

/// Transient send bookkeeping, kept next to the frame.
#[derive(Debug, Default)]
struct SendMeta {
    /// Connection that carried the last attempt.
    conn: Option<ConnId>,
    /// Connections that have carried this frame.
    used: Vec<ConnId>,
    send_time: Option<Instant>,
    resend_count: u32,
    send_timeout_count: u32,
    /// Peer reported it buffered; not subject to the timeout.
    sacked: bool,
}

#[derive(Debug)]
struct OutFrame {
    frame: Frame,
    meta: SendMeta,
}

impl OutFrame {
    fn new(frame: Frame) -> Self {
        Self {
            frame,
            meta: SendMeta::default(),
        }
    }
}

/// Outbound epoch switch in progress.
#[derive(Debug)]
struct IndexReset {
    boundary: u32,
    sent_at: Instant,
    /// New-epoch frames, already numbered from 1.
    wait: Vec<OutFrame>,
}

/// Reliability and dispatch engine of one session.
#[derive(Debug)]
pub struct Center {
    config: CenterConfig,
    epoch: Instant,

    send_index: u32,
    /// Epoch parity stamped on outbound indices.
    send_epoch: u32,
    acked_index: u32,
    pending: BTreeMap<u32, OutFrame>,
    in_flight: BTreeMap<u32, OutFrame>,
    resetting: Option<IndexReset>,
    control_out: VecDeque<Frame>,

    live: Vec<ConnId>,
    drained: VecDeque<ConnId>,
    ready: ReadyQueue,

    reorder: ReorderBuffer,
    missing: MissingTracker,
    inbox: VecDeque<(ConnId, Frame)>,
    delivered: VecDeque<StreamFrame>,
    drain_backlog: bool,
    peer_reset: Option<u32>,
    send_ack_index: u32,

    ttl: TtlEstimator,
    stamp_seq: u32,
    next_stamp: Instant,
    bytes_since_stamp: u64,
    next_ack: Instant,
    next_scan: Instant,

    error: Option<SessionError>,
    stats: CenterStats,
}

impl Center {
    /// Create a center at `now`.
    pub fn new(config: CenterConfig, now: Instant) -> Self {
        let next_stamp = now + jitter(config.ttl_stamp_interval, 0.1, 0.5);
        Self {
            reorder: ReorderBuffer::new(config.recv_window),
            next_ack: now + config.ack_interval,
            next_scan: now + config.resend_scan_interval,
            config,
            epoch: now,
            send_index: 1,
            send_epoch: 0,
            acked_index: 0,
            pending: BTreeMap::new(),
            in_flight: BTreeMap::new(),
            resetting: None,
            control_out: VecDeque::new(),
            live: Vec::new(),
            drained: VecDeque::new(),
            ready: ReadyQueue::new(),
            missing: MissingTracker::new(),
            inbox: VecDeque::new(),
            delivered: VecDeque::new(),
            drain_backlog: false,
            peer_reset: None,
            send_ack_index: 0,
            ttl: TtlEstimator::new(),
            stamp_seq: 0,
            next_stamp,
            bytes_since_stamp: 0,
            error: None,
            stats: CenterStats::default(),
        }
    }

    /// Configuration.
    pub fn config(&self) -> &CenterConfig {
        &self.config
    }

    /// Current latency estimate.
    pub fn ttl(&self) -> Duration {
        self.ttl.ttl()
    }

    /// Current retransmission timeout.
    pub fn resend_timeout(&self) -> Duration {
        self.ttl.resend_timeout(self.config.resend_timeout_floor)
    }

    /// Next outbound index of the current epoch.
    pub fn send_index(&self) -> u32 {
        self.send_index
    }

    /// Next inbound index expected in order.
    pub fn recv_index(&self) -> u32 {
        self.reorder.recv_index()
    }

    /// Counters.
    pub fn stats(&self) -> &CenterStats {
        &self.stats
    }

    /// Frames waiting for a connection.
    pub fn pending_len(&self) -> usize {
        self.pending.len() + self.resetting.as_ref().map_or(0, |r| r.wait.len())
    }

    /// Frames sent and not yet acknowledged.
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Check if every outbound frame has been acknowledged.
    pub fn is_flushed(&self) -> bool {
        self.pending_len() == 0
            && self.in_flight.is_empty()
            && self.control_out.is_empty()
            && self.ready.is_empty()
    }

    /// Connections currently carrying traffic.
    pub fn live_connections(&self) -> &[ConnId] {
        &self.live
    }

    /// Check if a stream is in the ready list.
    pub fn is_ready(&self, stream_id: u16) -> bool {
        self.ready.contains(stream_id)
    }

    // =========================================================================
    // Connections
    // =========================================================================

    /// Start using a connection; it counts as drained.
    pub fn add_connection(&mut self, id: ConnId) {
        if !self.live.contains(&id) {
            self.live.push(id);
            self.drained.push_back(id);
        }
    }

    /// Stop using a connection and requeue what it carried.
    pub fn remove_connection(&mut self, id: ConnId) {
        self.live.retain(|c| *c != id);
        self.drained.retain(|c| *c != id);
        let carried: Vec<u32> = self
            .in_flight
            .iter()
            .filter(|(_, out)| out.meta.conn == Some(id))
            .map(|(index, _)| *index)
            .collect();
        for index in &carried {
            self.requeue(*index);
        }
        if !carried.is_empty() {
            debug!(conn = %id, requeued = carried.len(), "requeued frames of lost connection");
        }
    }

    /// A connection finished writing and can take more frames.
    pub fn on_drained(&mut self, id: ConnId) {
        if self.live.contains(&id) && !self.drained.contains(&id) {
            self.drained.push_back(id);
        }
    }

    // =========================================================================
    // Outbound
    // =========================================================================

    /// Join (`Some`) or leave (`None`) the ready list.
    pub fn ready_write(&mut self, stream_id: u16, priority: Option<Priority>) {
        match priority {
            Some(priority) => self.ready.insert(stream_id, priority),
            None => {
                self.ready.remove(stream_id);
            }
        }
    }

    /// Queue a stream frame directly, bypassing the scheduler.
    pub fn write(&mut self, frame: StreamFrame, now: Instant) -> u32 {
        self.enqueue(Frame::stream(0, frame), now)
    }

    fn enqueue(&mut self, mut frame: Frame, now: Instant) -> u32 {
        if self.resetting.is_none() && self.send_index > self.config.index_limit {
            self.begin_reset(now);
        }
        if let Some(reset) = &mut self.resetting {
            let index = reset.wait.len() as u32 + 1;
            frame.index = index | (self.send_epoch ^ INDEX_EPOCH_BIT);
            reset.wait.push(OutFrame::new(frame));
            return index;
        }
        let index = self.send_index;
        self.send_index += 1;
        frame.index = index | self.send_epoch;
        self.pending.insert(index, OutFrame::new(frame));
        index
    }

    fn begin_reset(&mut self, now: Instant) {
        let boundary = self.send_index - 1;
        info!(boundary, "starting index epoch reset");
        self.resetting = Some(IndexReset {
            boundary,
            sent_at: now,
            wait: Vec::new(),
        });
        self.queue_reset_frame(Action::IndexReset, boundary | self.send_epoch);
    }

    fn queue_reset_frame(&mut self, action: Action, boundary: u32) {
        self.control_out.push_back(Frame::control(
            action,
            Bytes::copy_from_slice(&boundary.to_be_bytes()),
        ));
    }

    fn requeue(&mut self, index: u32) -> bool {
        match self.in_flight.remove(&index) {
            Some(mut out) => {
                out.meta.send_time = None;
                self.pending.insert(index, out);
                true
            }
            None => false,
        }
    }

    /// Hand frames to drained connections until either runs out.
    ///
    /// Control frames go first, then pending frames, and only then new
    /// frames pulled from the highest-priority ready stream.
    pub fn dispatch<S: StreamSource + ?Sized>(
        &mut self,
        now: Instant,
        pool: &mut ConnectionPool,
        source: &mut S,
    ) {
        if self.error.is_some() {
            return;
        }
        self.ready.resort(now, self.config.resort_interval, source);
        self.send_control(pool);

        let mut idle = Vec::new();
        while let Some(conn_id) = self.drained.pop_front() {
            let usable = self.live.contains(&conn_id)
                && pool.get(conn_id).is_some_and(Connection::has_capacity);
            if !usable {
                continue;
            }
            let index = match self.next_pending_for(conn_id) {
                Some(index) => index,
                None => match self.pull_from_streams(now, source) {
                    Some(index) => index,
                    None => {
                        idle.push(conn_id);
                        continue;
                    }
                },
            };
            if self.transmit(index, conn_id, now, pool) {
                self.drained.push_back(conn_id);
            }
        }
        self.drained.extend(idle);
    }

    fn skips(&self, used: &[ConnId], conn: ConnId) -> bool {
        used.contains(&conn) && self.live.iter().any(|c| !used.contains(c))
    }

    fn next_pending_for(&self, conn: ConnId) -> Option<u32> {
        self.pending
            .iter()
            .find(|(_, out)| !self.skips(&out.meta.used, conn))
            .map(|(index, _)| *index)
    }

    fn pull_from_streams<S: StreamSource + ?Sized>(
        &mut self,
        now: Instant,
        source: &mut S,
    ) -> Option<u32> {
        if self.resetting.is_some() {
            return None;
        }
        while let Some(stream_id) = self.ready.pop() {
            let Some((frame, more)) = source.do_write(stream_id, now) else {
                continue;
            };
            if more {
                if let Some(priority) = source.priority(stream_id, now) {
                    self.ready.insert(stream_id, priority);
                }
            }
            let index = self.enqueue(Frame::stream(0, frame), now);
            return if self.resetting.is_some() {
                None
            } else {
                Some(index)
            };
        }
        None
    }

    fn transmit(
        &mut self,
        index: u32,
        conn_id: ConnId,
        now: Instant,
        pool: &mut ConnectionPool,
    ) -> bool {
        let Some(conn) = pool.get_mut(conn_id) else {
            return false;
        };
        let Some(mut out) = self.pending.remove(&index) else {
            return conn.has_capacity();
        };
        if !out.meta.used.is_empty() {
            self.stats.frames_resent += 1;
            trace!(index, conn = %conn_id, attempt = out.meta.used.len() + 1, "resending frame");
        }
        out.frame.ack = self.reorder.wire_ack();
        self.send_ack_index = self.reorder.ack_index();
        if !out.meta.used.contains(&conn_id) {
            out.meta.used.push(conn_id);
        }
        out.meta.conn = Some(conn_id);
        out.meta.send_time = Some(now);
        out.meta.sacked = false;

        let len = out.frame.encoded_len() as u64;
        self.bytes_since_stamp += len;
        self.stats.bytes_sent += len;
        self.stats.frames_sent += 1;

        let capacity = conn.write(&out.frame);
        self.in_flight.insert(index, out);
        capacity
    }

    fn control_connection(&self, pool: &ConnectionPool) -> Option<ConnId> {
        self.drained
            .iter()
            .copied()
            .find(|id| pool.get(*id).is_some_and(Connection::is_open))
            .or_else(|| {
                self.live
                    .iter()
                    .filter_map(|id| pool.get(*id).filter(|c| c.is_open()))
                    .min_by_key(|c| c.pending_bytes())
                    .map(Connection::id)
            })
    }

    fn send_control(&mut self, pool: &mut ConnectionPool) {
        while let Some(mut frame) = self.control_out.pop_front() {
            let Some(conn_id) = self.control_connection(pool) else {
                self.control_out.push_front(frame);
                return;
            };
            let Some(conn) = pool.get_mut(conn_id) else {
                self.control_out.push_front(frame);
                return;
            };
            frame.ack = self.reorder.wire_ack();
            self.send_ack_index = self.reorder.ack_index();
            if !conn.write(&frame) {
                self.drained.retain(|c| *c != conn_id);
            }
        }
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    /// Order and deliver the frames collected through [`FrameSink`].
    pub fn process_inbound<D: StreamDirectory + ?Sized>(&mut self, now: Instant, directory: &D) {
        while let Some((conn, frame)) = self.inbox.pop_front() {
            self.receive(conn, frame, now, directory);
        }
    }

    fn receive<D: StreamDirectory + ?Sized>(
        &mut self,
        conn: ConnId,
        mut frame: Frame,
        now: Instant,
        directory: &D,
    ) {
        self.stats.frames_received += 1;
        self.apply_ack(frame.ack);

        if frame.is_unordered() {
            self.deliver(frame, now);
            return;
        }

        let slot = self.reorder.classify(frame.index);
        frame.index &= INDEX_MASK;
        let index = frame.index;
        match slot {
            Slot::Stale => {
                self.stats.duplicates += 1;
                trace!(index, conn = %conn, "dropping duplicate frame");
            }
            Slot::TooFar => {
                self.stats.out_of_window += 1;
                debug!(
                    index,
                    recv_index = self.reorder.recv_index(),
                    conn = %conn,
                    "dropping frame beyond receive window"
                );
            }
            Slot::Next => {
                self.missing.remove(index);
                self.reorder.advance();
                self.deliver(frame, now);
                self.drain_received(now);
            }
            Slot::Future => {
                if self.reorder.contains(index) {
                    self.stats.duplicates += 1;
                    return;
                }
                self.missing.remove(index);
                let early = frame
                    .stream_frame()
                    .filter(|sf| sf.flags.is_open() || directory.is_open(sf.stream_id))
                    .cloned();
                let delivered = early.is_some();
                if let Some(stream_frame) = early {
                    self.delivered.push_back(stream_frame);
                }
                self.reorder.insert(frame, delivered);
            }
        }
    }

    /// Deliver buffered frames that became contiguous, at most one batch.
    ///
    /// Returns `true` if more remain for another pass.
    pub fn drain_received(&mut self, now: Instant) -> bool {
        let mut drained = 0;
        while drained < self.config.drain_batch {
            let Some(entry) = self.reorder.pop_ready() else {
                break;
            };
            drained += 1;
            if !entry.delivered {
                self.deliver(entry.frame, now);
            }
        }
        self.check_peer_reset();
        self.drain_backlog = self.reorder.has_ready();
        self.drain_backlog
    }

    /// Check if contiguous frames wait for another drain pass.
    pub fn has_drain_backlog(&self) -> bool {
        self.drain_backlog
    }

    fn deliver(&mut self, frame: Frame, now: Instant) {
        let Frame {
            action, payload, ..
        } = frame;
        match payload {
            FramePayload::Stream(stream_frame) => self.delivered.push_back(stream_frame),
            FramePayload::Control(data) => self.handle_control(action, &data, now),
        }
    }

    /// Next stream frame for the session.
    pub fn poll_delivered(&mut self) -> Option<StreamFrame> {
        self.delivered.pop_front()
    }

    /// Strip the epoch bit from a peer-supplied index of our send space,
    /// `None` if it belongs to another epoch.
    fn own_index(&self, wire: u32) -> Option<u32> {
        (wire & INDEX_EPOCH_BIT == self.send_epoch).then_some(wire & INDEX_MASK)
    }

    fn apply_ack(&mut self, wire: u32) {
        let Some(ack) = self.own_index(wire) else {
            return;
        };
        if ack == 0 || ack <= self.acked_index || ack >= self.send_index {
            return;
        }
        self.acked_index = ack;
        self.in_flight = self.in_flight.split_off(&(ack + 1));
        self.pending = self.pending.split_off(&(ack + 1));
    }

    fn handle_control(&mut self, action: Action, data: &[u8], now: Instant) {
        let result = match action {
            Action::Stream => Ok(()),
            Action::Ack => decode_indices(action, data).map(|sack| self.apply_sack(&sack)),
            Action::Resend => decode_indices(action, data).map(|list| self.on_resend(&list)),
            Action::IndexReset => decode_boundary(action, data).map(|b| self.on_index_reset(b)),
            Action::IndexResetAck => {
                decode_boundary(action, data).map(|b| self.on_index_reset_ack(b))
            }
            Action::Ttl => TtlStamp::from_bytes(action, data).map(|stamp| {
                self.control_out
                    .push_back(Frame::control(Action::TtlAck, stamp.to_bytes()))
            }),
            Action::TtlAck => TtlStamp::from_bytes(action, data).map(|stamp| {
                match self.epoch.checked_add(Duration::from_micros(stamp.timestamp_us)) {
                    Some(sent) if sent <= now => {
                        self.ttl.update(now - sent);
                        trace!(seq = stamp.seq, ttl = ?self.ttl.ttl(), "ttl sample");
                    }
                    _ => debug!(seq = stamp.seq, "ignoring ttl echo from the future"),
                }
            }),
        };
        if let Err(err) = result {
            warn!(error = %err, "ignoring malformed control frame");
        }
    }

    fn apply_sack(&mut self, sack: &[u32]) {
        let own: Vec<u32> = sack.iter().filter_map(|wire| self.own_index(*wire)).collect();
        for index in own {
            if let Some(out) = self.in_flight.get_mut(&index) {
                out.meta.sacked = true;
            }
        }
    }

    fn on_resend(&mut self, list: &[u32]) {
        let own: Vec<u32> = list.iter().filter_map(|wire| self.own_index(*wire)).collect();
        let mut moved = 0;
        for index in own {
            let covered = self
                .in_flight
                .get(&index)
                .is_some_and(|out| self.live.iter().all(|c| out.meta.used.contains(c)));
            if !covered && self.requeue(index) {
                moved += 1;
            }
        }
        debug!(requested = list.len(), moved, "peer requested resend");
    }

    /// `wire` is the old epoch's last index tagged with that epoch's parity.
    fn on_index_reset(&mut self, wire: u32) {
        if wire & INDEX_EPOCH_BIT != self.reorder.epoch() {
            // Already switched: our ack was lost or this is a late copy.
            self.queue_reset_frame(Action::IndexResetAck, wire);
            return;
        }
        self.peer_reset = Some(wire);
        self.check_peer_reset();
    }

    fn check_peer_reset(&mut self) {
        let Some(wire) = self.peer_reset else {
            return;
        };
        let boundary = wire & INDEX_MASK;
        if u64::from(self.reorder.recv_index()) <= u64::from(boundary) {
            return;
        }
        info!(boundary, "peer index epoch reset");
        self.queue_reset_frame(Action::IndexResetAck, wire);
        self.reorder.reset();
        self.missing.clear();
        self.peer_reset = None;
        self.send_ack_index = 0;
    }

    fn on_index_reset_ack(&mut self, wire: u32) {
        let epoch = self.send_epoch;
        let Some(reset) = self.resetting.take_if(|r| (r.boundary | epoch) == wire) else {
            debug!(boundary = wire & INDEX_MASK, "unexpected index reset ack");
            return;
        };
        // Every old-epoch frame was delivered before the peer acknowledged.
        self.pending.clear();
        self.in_flight.clear();
        let rebased = reset.wait.len();
        for out in reset.wait {
            self.pending.insert(out.frame.index & INDEX_MASK, out);
        }
        self.send_epoch ^= INDEX_EPOCH_BIT;
        self.send_index = rebased as u32 + 1;
        self.acked_index = 0;
        info!(boundary = reset.boundary, rebased, "index epoch reset complete");
    }

    // =========================================================================
    // Timers
    // =========================================================================

    /// Take the fatal error, if the center failed.
    pub fn poll_error(&mut self) -> Option<SessionError> {
        self.error.take()
    }

    /// Check if the center failed.
    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }

    fn oldest_unsacked(&self) -> Option<(u32, Instant)> {
        self.in_flight
            .iter()
            .find(|(_, out)| !out.meta.sacked)
            .and_then(|(index, out)| out.meta.send_time.map(|t| (*index, t)))
    }

    /// Earliest instant at which [`handle_timeout`](Self::handle_timeout) has work.
    pub fn poll_timeout(&self) -> Option<Instant> {
        if self.error.is_some() {
            return None;
        }
        let rto = self.resend_timeout();
        let mut deadlines = Vec::with_capacity(6);
        if self.send_ack_index != self.reorder.ack_index() {
            deadlines.push(self.next_ack);
        }
        if !self.reorder.is_empty() && self.live.len() > 1 {
            deadlines.push(self.next_scan);
        }
        if !self.live.is_empty() {
            deadlines.push(self.next_stamp);
        }
        if let Some((_, sent)) = self.oldest_unsacked() {
            deadlines.push(sent + rto);
        }
        if let Some(reset) = &self.resetting {
            deadlines.push(reset.sent_at + rto);
        }
        if let Some(at) = self.ready.next_resort(self.config.resort_interval) {
            deadlines.push(at);
        }
        deadlines.into_iter().min()
    }

    /// Run every timer that is due at `now`.
    pub fn handle_timeout(&mut self, now: Instant) {
        if self.error.is_some() {
            return;
        }
        self.check_resend_timeout(now);
        if self.error.is_some() {
            return;
        }

        let rto = self.resend_timeout();
        if let Some(reset) = &mut self.resetting {
            if now >= reset.sent_at + rto {
                reset.sent_at = now;
                let boundary = reset.boundary;
                self.queue_reset_frame(Action::IndexReset, boundary | self.send_epoch);
            }
        }

        if now >= self.next_ack {
            self.next_ack = now + self.config.ack_interval;
            if self.send_ack_index != self.reorder.ack_index() {
                let sack = self.with_recv_epoch(self.reorder.buffered_indices(self.config.max_sack_indices));
                self.control_out
                    .push_back(Frame::control(Action::Ack, encode_indices(&sack)));
            }
        }

        if now >= self.next_scan {
            self.next_scan = now + self.config.resend_scan_interval;
            self.scan_missing(now);
        }

        if !self.live.is_empty()
            && (now >= self.next_stamp
                || self.bytes_since_stamp >= self.config.ttl_stamp_burst_bytes)
        {
            self.send_stamp(now);
        }
    }

    fn check_resend_timeout(&mut self, now: Instant) {
        let rto = self.resend_timeout();
        let Some((index, sent)) = self.oldest_unsacked() else {
            return;
        };
        if now < sent + rto {
            return;
        }
        let Some(out) = self.in_flight.get_mut(&index) else {
            return;
        };
        out.meta.send_timeout_count += 1;
        out.meta.resend_count += 1;
        let conn = out.meta.conn;
        let retries = out.meta.resend_count;
        let timeouts = out.meta.send_timeout_count;

        if retries >= self.config.max_send_retries {
            warn!(index, retries, "retransmission exhausted, failing session");
            self.error = Some(SessionError::RetransmitExhausted { index });
            return;
        }

        let alternative = self.live.iter().any(|c| Some(*c) != conn);
        if !alternative {
            out.meta.send_time = Some(now);
            return;
        }

        let siblings: Vec<u32> = self
            .in_flight
            .range(index..)
            .filter(|(_, o)| o.meta.conn == conn && !o.meta.sacked)
            .take(self.config.resend_requeue_batch)
            .map(|(i, _)| *i)
            .collect();
        for sibling in &siblings {
            self.requeue(*sibling);
        }
        debug!(index, timeouts, requeued = siblings.len(), rto = ?rto, "resend timeout");
    }

    /// Stamp receive-side indices with the current receive epoch.
    fn with_recv_epoch(&self, mut indices: Vec<u32>) -> Vec<u32> {
        let epoch = self.reorder.epoch();
        indices.iter_mut().for_each(|index| *index |= epoch);
        indices
    }

    fn scan_missing(&mut self, now: Instant) {
        if self.live.len() < 2 || self.ttl.ttl() >= self.config.resend_scan_max_ttl {
            return;
        }
        if self.reorder.is_empty() {
            self.missing.clear();
            return;
        }
        let batch = self.config.resend_batch();
        let missing = self.reorder.missing(batch * 4);
        self.missing.update(&missing, now);

        let threshold = self.resend_timeout();
        let window = (self.config.resend_scan_interval * 2).max(threshold * 2);
        let due = self.missing.due(now, threshold, window);
        if due.is_empty() {
            return;
        }
        debug!(count = due.len(), first = due[0], "requesting resend");
        for chunk in due.chunks(batch) {
            let wire = self.with_recv_epoch(chunk.to_vec());
            self.control_out
                .push_back(Frame::control(Action::Resend, encode_indices(&wire)));
            self.stats.resend_requests += 1;
        }
    }

    fn send_stamp(&mut self, now: Instant) {
        self.stamp_seq = self.stamp_seq.wrapping_add(1);
        let stamp = TtlStamp {
            timestamp_us: now.saturating_duration_since(self.epoch).as_micros() as u64,
            seq: self.stamp_seq,
        };
        if self.bytes_since_stamp > 0 {
            trace!(sent = %fmt_bytes(self.bytes_since_stamp), "ttl stamp");
        }
        self.control_out
            .push_back(Frame::control(Action::Ttl, stamp.to_bytes()));
        self.bytes_since_stamp = 0;
        self.next_stamp = now + jitter(self.config.ttl_stamp_interval, 0.5, 1.5);
    }
}

impl FrameSink for Center {
    fn on_frame(&mut self, conn: ConnId, frame: Frame) {
        self.inbox.push_back((conn, frame));
    }
}
