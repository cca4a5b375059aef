//! Property-based tests for xstream
//!
//! Uses proptest to verify codec and ordering invariants across large input
//! spaces.

use proptest::prelude::*;

// ============================================================================
// Frame Encoding/Decoding Properties
// ============================================================================

mod frame_properties {
    use super::*;
    use bytes::Bytes;
    use xstream::transport::{Action, Frame, StreamFlags, StreamFrame};

    fn control_action() -> impl Strategy<Value = Action> {
        prop_oneof![
            Just(Action::Ack),
            Just(Action::Resend),
            Just(Action::IndexReset),
            Just(Action::IndexResetAck),
            Just(Action::Ttl),
            Just(Action::TtlAck),
        ]
    }

    proptest! {
        /// Stream frames survive encode then decode unchanged
        #[test]
        fn stream_frame_roundtrip(
            index in any::<u32>(),
            ack in any::<u32>(),
            stream_id in any::<u16>(),
            flags in any::<u8>(),
            stream_index in any::<u32>(),
            data in prop::collection::vec(any::<u8>(), 0..2048),
        ) {
            let mut frame = Frame::stream(
                index,
                StreamFrame::new(stream_id, StreamFlags::from_byte(flags), stream_index, Bytes::from(data)),
            );
            frame.ack = ack;

            let encoded = frame.encode();
            prop_assert_eq!(encoded.len(), frame.encoded_len());
            let decoded = Frame::decode(encoded).unwrap();
            prop_assert_eq!(decoded, frame);
        }

        /// Control frames keep their action and raw payload
        #[test]
        fn control_frame_roundtrip(
            action in control_action(),
            ack in any::<u32>(),
            data in prop::collection::vec(any::<u8>(), 0..512),
        ) {
            let mut frame = Frame::control(action, Bytes::from(data.clone()));
            frame.ack = ack;

            let decoded = Frame::decode(frame.encode()).unwrap();
            prop_assert!(decoded.is_unordered());
            prop_assert_eq!(decoded.action, action);
            prop_assert_eq!(decoded.ack, ack);
            prop_assert_eq!(decoded.control_data(), &data[..]);
        }

        /// Truncated input is rejected, never misparsed
        #[test]
        fn truncated_frame_is_an_error(
            data in prop::collection::vec(any::<u8>(), 0..512),
            cut in 0usize..16,  // frame header plus stream header
        ) {
            let frame = Frame::stream(1, StreamFrame::new(2, StreamFlags::DATA, 1, Bytes::from(data)));
            let encoded = frame.encode();
            prop_assert!(Frame::decode(encoded.slice(..cut)).is_err());
        }
    }
}

// ============================================================================
// Record Framing Properties
// ============================================================================

mod record_properties {
    use super::*;
    use bytes::BytesMut;
    use xstream::core::DATA_PHASE_PREFIX;
    use xstream::transport::{encode_record, RecordReader, RecordType};

    proptest! {
        /// Records parse the same however the byte stream is split
        #[test]
        fn records_survive_any_chunking(
            bodies in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..600), 1..8),
            chunk in 1usize..97,
        ) {
            let mut wire = BytesMut::new();
            wire.extend_from_slice(&DATA_PHASE_PREFIX);
            for body in &bodies {
                encode_record(RecordType::Frame, body, &mut wire).unwrap();
            }

            let mut reader = RecordReader::new(true);
            let mut parsed = Vec::new();
            for piece in wire.chunks(chunk) {
                reader.push(piece);
                while let Some((record_type, body)) = reader.next_record().unwrap() {
                    prop_assert_eq!(record_type, RecordType::Frame);
                    parsed.push(body.to_vec());
                }
            }
            prop_assert_eq!(parsed, bodies);
            prop_assert_eq!(reader.buffered(), 0);
        }
    }
}

// ============================================================================
// Stream Ordering Properties
// ============================================================================

mod ordering_properties {
    use super::*;
    use std::collections::VecDeque;
    use std::time::Instant;

    use bytes::Bytes;
    use xstream::core::{CryptoError, RecordCipher};
    use xstream::crypto::{AuthKey, Role, SessionId, SessionKey, SessionSecrets};
    use xstream::session::{Session, SessionConfig, SessionEvent, StreamConfig};
    use xstream::transport::ConnId;

    struct Clear;

    impl RecordCipher for Clear {
        fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
            Ok(plaintext.to_vec())
        }

        fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
            Ok(ciphertext.to_vec())
        }
    }

    struct Link {
        client: ConnId,
        server: ConnId,
        up: VecDeque<Bytes>,
        down: VecDeque<Bytes>,
    }

    /// Move every byte between the sessions, delivering one queued chunk
    /// per step from a link picked by `schedule`.
    fn run(
        client: &mut Session,
        server: &mut Session,
        links: &mut [Link],
        schedule: &[u8],
        now: Instant,
    ) {
        for step in 0..100_000usize {
            client.run_deferred(now);
            server.run_deferred(now);
            while let Some((conn, bytes)) = client.poll_transmit(now) {
                if let Some(link) = links.iter_mut().find(|l| l.client == conn) {
                    link.up.push_back(bytes);
                }
                client.on_drained(conn);
            }
            while let Some((conn, bytes)) = server.poll_transmit(now) {
                if let Some(link) = links.iter_mut().find(|l| l.server == conn) {
                    link.down.push_back(bytes);
                }
                server.on_drained(conn);
            }

            let busy: Vec<usize> = (0..links.len())
                .filter(|i| !links[*i].up.is_empty() || !links[*i].down.is_empty())
                .collect();
            if busy.is_empty() {
                if !client.has_deferred() && !server.has_deferred() {
                    return;
                }
                continue;
            }
            let pick = busy[schedule[step % schedule.len()] as usize % busy.len()];
            let link = &mut links[pick];
            if let Some(bytes) = link.up.pop_front() {
                let _ = server.receive(link.server, &bytes, now);
            } else if let Some(bytes) = link.down.pop_front() {
                let _ = client.receive(link.client, &bytes, now);
            }
        }
        panic!("network did not settle");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        /// Stream bytes arrive in write order whatever order links deliver in
        #[test]
        fn stream_order_survives_link_interleaving(
            writes in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..3000), 1..6),
            link_count in 1usize..5,
            schedule in prop::collection::vec(any::<u8>(), 1..64),
        ) {
            let now = Instant::now();
            let id = SessionId::from_bytes([5; 8]);
            let secrets = SessionSecrets {
                auth_key: AuthKey::from_bytes([1; 16]),
                session_key: SessionKey::from_bytes([2; 32]),
            };
            let config = SessionConfig::default().with_mss(700);
            let mut client = Session::new(Role::Client, id, secrets.clone(), config.clone(), now);
            let mut server = Session::new(Role::Server, id, secrets, config, now);
            let mut links: Vec<Link> = (0..link_count)
                .map(|_| Link {
                    client: client.add_connection(Box::new(Clear), now).unwrap(),
                    server: server.add_connection(Box::new(Clear), now).unwrap(),
                    up: VecDeque::new(),
                    down: VecDeque::new(),
                })
                .collect();

            let stream = client.open_stream(StreamConfig::default(), now).unwrap();
            for data in &writes {
                client.write(stream, data, now).unwrap();
            }
            run(&mut client, &mut server, &mut links, &schedule, now);

            let received: Vec<u8> = std::iter::from_fn(|| server.poll_event())
                .filter_map(|event| match event {
                    SessionEvent::StreamData { stream_id, data } if stream_id == stream => {
                        Some(data.to_vec())
                    }
                    _ => None,
                })
                .flatten()
                .collect();
            prop_assert_eq!(received, writes.concat());
            prop_assert_eq!(server.center().stats().duplicates, 0);
        }
    }
}

// ============================================================================
// Index Epoch Properties
// ============================================================================

mod epoch_properties {
    use super::*;
    use std::time::Instant;

    use bytes::Bytes;
    use xstream::center::{Center, CenterConfig, Priority};
    use xstream::core::{CryptoError, FrameSink, RecordCipher, StreamDirectory, StreamSource};
    use xstream::transport::{
        Action, ConnId, Connection, ConnectionConfig, ConnectionPool, Frame, StreamFlags,
        StreamFrame,
    };

    const INDEX_LIMIT: u32 = 8;
    const LINKS: usize = 2;

    struct Clear;

    impl RecordCipher for Clear {
        fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
            Ok(plaintext.to_vec())
        }

        fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
            Ok(ciphertext.to_vec())
        }
    }

    /// No streams: frames are queued on the center directly.
    struct Idle;

    impl StreamSource for Idle {
        fn do_write(&mut self, _stream_id: u16, _now: Instant) -> Option<(StreamFrame, bool)> {
            None
        }

        fn priority(&self, _stream_id: u16, _now: Instant) -> Option<Priority> {
            None
        }
    }

    impl StreamDirectory for Idle {
        fn is_open(&self, _stream_id: u16) -> bool {
            false
        }
    }

    #[derive(Default)]
    struct Captured(Vec<(ConnId, Frame)>);

    impl FrameSink for Captured {
        fn on_frame(&mut self, conn: ConnId, frame: Frame) {
            self.0.push((conn, frame));
        }
    }

    /// One center and its connections; link `i` pairs `ids[i]` on both sides.
    struct Side {
        center: Center,
        pool: ConnectionPool,
        ids: Vec<ConnId>,
    }

    impl Side {
        fn new(now: Instant) -> Self {
            let config = CenterConfig::default().with_index_limit(INDEX_LIMIT);
            let mut center = Center::new(config, now);
            let mut pool = ConnectionPool::new();
            let mut ids = Vec::new();
            for _ in 0..LINKS {
                let id = pool.allocate_id();
                pool.insert(Connection::new(id, Box::new(Clear), ConnectionConfig::default(), now));
                center.add_connection(id);
                ids.push(id);
            }
            Self { center, pool, ids }
        }

        /// Dispatch until idle, returning the flushed bytes of each link.
        fn transmit(&mut self, now: Instant) -> Vec<(usize, Bytes)> {
            let mut out = Vec::new();
            for _ in 0..64 {
                self.center.dispatch(now, &mut self.pool, &mut Idle);
                let before = out.len();
                for (link, id) in self.ids.iter().enumerate() {
                    let conn = self.pool.get_mut(*id).unwrap();
                    if let Some(bytes) = conn.flush().unwrap() {
                        out.push((link, bytes));
                    }
                    conn.on_drained();
                    self.center.on_drained(*id);
                }
                if out.len() == before {
                    break;
                }
            }
            out
        }

        /// Decode bytes from the peer into frames without handing them on.
        fn capture(&mut self, wire: Vec<(usize, Bytes)>, now: Instant) -> Vec<(ConnId, Frame)> {
            let mut captured = Captured::default();
            for (link, bytes) in wire {
                let conn = self.pool.get_mut(self.ids[link]).unwrap();
                conn.receive(&bytes, now, &mut captured).unwrap();
            }
            captured.0
        }

        /// Feed bytes from the peer straight into the center.
        fn absorb(&mut self, wire: Vec<(usize, Bytes)>, now: Instant) {
            for (link, bytes) in wire {
                let conn = self.pool.get_mut(self.ids[link]).unwrap();
                conn.receive(&bytes, now, &mut self.center).unwrap();
            }
            self.center.process_inbound(now, &Idle);
        }

        fn deliver(&mut self, conn: ConnId, frame: Frame, now: Instant, out: &mut Vec<u32>) {
            self.center.on_frame(conn, frame);
            self.center.process_inbound(now, &Idle);
            while self.center.drain_received(now) {}
            out.extend(std::iter::from_fn(|| self.center.poll_delivered()).map(|f| f.index));
        }
    }

    /// Expand captured frames by `copies`: 0 sends once, 1 adds a second copy
    /// now, 2 holds a second copy back for `late`.
    fn duplicate(
        frames: Vec<(ConnId, Frame)>,
        copies: &[u8],
        late: &mut Vec<(ConnId, Frame)>,
    ) -> Vec<(ConnId, Frame)> {
        let mut out = Vec::new();
        for (i, (conn, frame)) in frames.into_iter().enumerate() {
            match copies[i % copies.len()] % 3 {
                1 => out.push((conn, frame.clone())),
                2 => late.push((conn, frame.clone())),
                _ => {}
            }
            out.push((conn, frame));
        }
        out
    }

    /// Take items in the order picked by `schedule`.
    fn shuffled<T>(mut items: Vec<T>, schedule: &[u8]) -> Vec<T> {
        let mut out = Vec::with_capacity(items.len());
        let mut step = 0;
        while !items.is_empty() {
            let pick = schedule[step % schedule.len()] as usize % items.len();
            out.push(items.remove(pick));
            step += 1;
        }
        out
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Each frame is delivered exactly once and in order across an index
        /// reset, whatever duplicates or late copies cross the links
        #[test]
        fn reset_survives_duplicates_and_late_copies(
            count in (INDEX_LIMIT + 1)..=(2 * INDEX_LIMIT),
            copies in prop::collection::vec(any::<u8>(), 1..32),
            schedule in prop::collection::vec(any::<u8>(), 1..64),
        ) {
            let now = Instant::now();
            let mut sender = Side::new(now);
            let mut receiver = Side::new(now);
            for i in 1..=count {
                sender.center.write(
                    StreamFrame::new(1, StreamFlags::NONE, i, Bytes::from(vec![i as u8])),
                    now,
                );
            }

            // Old epoch plus INDEX_RESET, shuffled with duplicates.
            let wire = sender.transmit(now);
            let old = receiver.capture(wire, now);
            prop_assert!(old.iter().any(|(_, f)| f.action == Action::IndexReset));
            let mut late = Vec::new();
            let mut delivered = Vec::new();
            for (conn, frame) in shuffled(duplicate(old, &copies, &mut late), &schedule) {
                receiver.deliver(conn, frame, now, &mut delivered);
            }
            prop_assert_eq!(receiver.center.recv_index(), 1);

            // INDEX_RESET_ACK switches the sender to the new epoch.
            let wire = receiver.transmit(now);
            sender.absorb(wire, now);
            prop_assert_eq!(sender.center.send_index(), count - INDEX_LIMIT + 1);

            // New epoch frames interleaved with late copies of the old one.
            let wire = sender.transmit(now);
            let mut next = receiver.capture(wire, now);
            next.append(&mut late);
            let mut rest = Vec::new();
            for (conn, frame) in shuffled(duplicate(next, &copies, &mut rest), &schedule) {
                receiver.deliver(conn, frame, now, &mut delivered);
            }
            for (conn, frame) in rest {
                receiver.deliver(conn, frame, now, &mut delivered);
            }

            prop_assert_eq!(delivered, (1..=count).collect::<Vec<u32>>());
            prop_assert_eq!(receiver.center.recv_index(), count - INDEX_LIMIT + 1);
        }
    }
}
