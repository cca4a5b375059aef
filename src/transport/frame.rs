//! Frame encoding and decoding.
//!
//! Two nested frame kinds travel inside every encrypted record:
//!
//! ```text
//! Frame (connection level, big-endian):
//! +--------+------------------+------------------+-----------------+
//! | Action | Index            | Ack              | Payload         |
//! | 1 byte | 4 bytes (BE32)   | 4 bytes (BE32)   | ...             |
//! +--------+------------------+------------------+-----------------+
//!
//! StreamFrame (payload of action 0):
//! +------------------+--------+------------------+-----------------+
//! | Stream ID        | Flag   | Index            | Data            |
//! | 2 bytes (BE16)   | 1 byte | 4 bytes (BE32)   | ...             |
//! +------------------+--------+------------------+-----------------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::core::{
    FrameError, ACTION_ACK, ACTION_INDEX_RESET, ACTION_INDEX_RESET_ACK, ACTION_RESEND,
    ACTION_STREAM, ACTION_TTL, ACTION_TTL_ACK, FLAG_CAPPED, FLAG_CLOSE, FLAG_DATA,
    FLAG_NONE_EXPIRY, FLAG_NONE_PRIORITY, FLAG_OPEN, FRAME_HEADER_SIZE,
    STREAM_FRAME_HEADER_SIZE, UNORDERED_INDEX,
};

/// Connection-level frame actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Action {
    /// Carries a StreamFrame.
    Stream = ACTION_STREAM,
    /// Cumulative acknowledgment, optionally listing buffered indices.
    Ack = ACTION_ACK,
    /// Request to resend the listed indices.
    Resend = ACTION_RESEND,
    /// Start of a new index epoch.
    IndexReset = ACTION_INDEX_RESET,
    /// Acknowledgment of a new index epoch.
    IndexResetAck = ACTION_INDEX_RESET_ACK,
    /// RTT stamp.
    Ttl = ACTION_TTL,
    /// RTT stamp echo.
    TtlAck = ACTION_TTL_ACK,
}

impl Action {
    /// Parse an action from a byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            ACTION_STREAM => Some(Self::Stream),
            ACTION_ACK => Some(Self::Ack),
            ACTION_RESEND => Some(Self::Resend),
            ACTION_INDEX_RESET => Some(Self::IndexReset),
            ACTION_INDEX_RESET_ACK => Some(Self::IndexResetAck),
            ACTION_TTL => Some(Self::Ttl),
            ACTION_TTL_ACK => Some(Self::TtlAck),
            _ => None,
        }
    }

    /// Convert the action to its byte representation.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// StreamFrame flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StreamFlags(u8);

impl StreamFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// Frame carries payload bytes.
    pub const DATA: Self = Self(FLAG_DATA);
    /// First frame of a stream.
    pub const OPEN: Self = Self(FLAG_OPEN);
    /// Stream close or close acknowledgment.
    pub const CLOSE: Self = Self(FLAG_CLOSE);
    /// Low-priority stream.
    pub const NONE_PRIORITY: Self = Self(FLAG_NONE_PRIORITY);
    /// Stream without per-stream reordering.
    pub const CAPPED: Self = Self(FLAG_CAPPED);
    /// Stream without idle expiry.
    pub const NONE_EXPIRY: Self = Self(FLAG_NONE_EXPIRY);

    /// Create flags from a raw byte.
    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    /// Get the raw byte value.
    pub fn as_byte(self) -> u8 {
        self.0
    }

    /// Check if every bit of `other` is set.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Return these flags with `other` added.
    pub fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Return these flags with `other` removed.
    pub fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Check if this frame opens a stream.
    pub fn is_open(self) -> bool {
        self.contains(Self::OPEN)
    }

    /// Check if this frame closes a stream.
    pub fn is_close(self) -> bool {
        self.contains(Self::CLOSE)
    }
}

/// Stream-addressed payload unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    /// Logical stream id.
    pub stream_id: u16,
    /// Flag bits.
    pub flags: StreamFlags,
    /// Per-stream sequence index; 0 bypasses per-stream reordering.
    pub index: u32,
    /// Payload bytes.
    pub data: Bytes,
}

impl StreamFrame {
    /// Create a new stream frame. The DATA flag follows `data`.
    pub fn new(stream_id: u16, flags: StreamFlags, index: u32, data: Bytes) -> Self {
        let flags = if data.is_empty() {
            flags.without(StreamFlags::DATA)
        } else {
            flags.with(StreamFlags::DATA)
        };
        Self {
            stream_id,
            flags,
            index,
            data,
        }
    }

    /// Size of this frame on the wire.
    pub fn encoded_len(&self) -> usize {
        STREAM_FRAME_HEADER_SIZE + self.data.len()
    }

    /// Append the wire form of this frame to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_u16(self.stream_id);
        buf.put_u8(self.flags.as_byte());
        buf.put_u32(self.index);
        buf.put_slice(&self.data);
    }

    /// Parse a stream frame from its wire form.
    pub fn decode(mut bytes: Bytes) -> Result<Self, FrameError> {
        if bytes.len() < STREAM_FRAME_HEADER_SIZE {
            return Err(FrameError::Truncated {
                expected: STREAM_FRAME_HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        let stream_id = bytes.get_u16();
        let flags = StreamFlags::from_byte(bytes.get_u8());
        let index = bytes.get_u32();
        Ok(Self {
            stream_id,
            flags,
            index,
            data: bytes,
        })
    }
}

/// Payload of a connection frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramePayload {
    /// Nested stream frame (action 0).
    Stream(StreamFrame),
    /// Raw control payload (any other action).
    Control(Bytes),
}

/// Connection-level reliability-tagged frame.
///
/// Only the wire fields live here; send/receive bookkeeping is kept by the
/// center next to the frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame action.
    pub action: Action,
    /// Per-direction sequence index, 0 for unordered control.
    pub index: u32,
    /// Cumulative highest contiguous index received from the peer.
    pub ack: u32,
    /// Payload.
    pub payload: FramePayload,
}

impl Frame {
    /// Create a frame carrying a stream frame.
    pub fn stream(index: u32, frame: StreamFrame) -> Self {
        Self {
            action: Action::Stream,
            index,
            ack: 0,
            payload: FramePayload::Stream(frame),
        }
    }

    /// Create an unordered control frame.
    pub fn control(action: Action, data: Bytes) -> Self {
        Self {
            action,
            index: UNORDERED_INDEX,
            ack: 0,
            payload: FramePayload::Control(data),
        }
    }

    /// Nested stream frame, if any.
    pub fn stream_frame(&self) -> Option<&StreamFrame> {
        match &self.payload {
            FramePayload::Stream(frame) => Some(frame),
            FramePayload::Control(_) => None,
        }
    }

    /// Raw control payload, empty for stream frames.
    pub fn control_data(&self) -> &[u8] {
        match &self.payload {
            FramePayload::Stream(_) => &[],
            FramePayload::Control(data) => data,
        }
    }

    /// Check if this frame bypasses index ordering.
    pub fn is_unordered(&self) -> bool {
        self.index == UNORDERED_INDEX
    }

    /// Size of this frame on the wire.
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE
            + match &self.payload {
                FramePayload::Stream(frame) => frame.encoded_len(),
                FramePayload::Control(data) => data.len(),
            }
    }

    /// Serialize the frame.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(self.action.as_byte());
        buf.put_u32(self.index);
        buf.put_u32(self.ack);
        match &self.payload {
            FramePayload::Stream(frame) => frame.encode_into(&mut buf),
            FramePayload::Control(data) => buf.put_slice(data),
        }
        buf.freeze()
    }

    /// Parse a frame from its decrypted wire form.
    pub fn decode(mut bytes: Bytes) -> Result<Self, FrameError> {
        if bytes.len() < FRAME_HEADER_SIZE {
            return Err(FrameError::Truncated {
                expected: FRAME_HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        let action_byte = bytes.get_u8();
        let action = Action::from_byte(action_byte).ok_or(FrameError::InvalidAction(action_byte))?;
        let index = bytes.get_u32();
        let ack = bytes.get_u32();

        let payload = if action == Action::Stream {
            if bytes.len() < STREAM_FRAME_HEADER_SIZE {
                return Err(FrameError::Truncated {
                    expected: FRAME_HEADER_SIZE + STREAM_FRAME_HEADER_SIZE,
                    actual: FRAME_HEADER_SIZE + bytes.len(),
                });
            }
            FramePayload::Stream(StreamFrame::decode(bytes)?)
        } else {
            FramePayload::Control(bytes)
        };

        Ok(Self {
            action,
            index,
            ack,
            payload,
        })
    }
}

/// Encode a list of indices (RESEND and selective ACK payloads).
pub fn encode_indices(indices: &[u32]) -> Bytes {
    let mut buf = BytesMut::with_capacity(indices.len() * 4);
    for index in indices {
        buf.put_u32(*index);
    }
    buf.freeze()
}

/// Decode a list of indices.
pub fn decode_indices(action: Action, mut data: &[u8]) -> Result<Vec<u32>, FrameError> {
    if data.len() % 4 != 0 {
        return Err(FrameError::InvalidControl(action.as_byte()));
    }
    let mut indices = Vec::with_capacity(data.len() / 4);
    while data.has_remaining() {
        indices.push(data.get_u32());
    }
    Ok(indices)
}

/// RTT stamp carried by TTL / TTL_ACK frames.
///
/// Wire format (12 bytes): timestamp in microseconds (BE64) followed by the
/// sequence number (BE32).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlStamp {
    /// Sender clock in microseconds when the stamp left.
    pub timestamp_us: u64,
    /// Monotonic stamp counter of the sender.
    pub seq: u32,
}

impl TtlStamp {
    /// Encoded size.
    pub const SIZE: usize = 12;

    /// Serialize the stamp.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u64(self.timestamp_us);
        buf.put_u32(self.seq);
        buf.freeze()
    }

    /// Parse a stamp.
    pub fn from_bytes(action: Action, mut data: &[u8]) -> Result<Self, FrameError> {
        if data.len() != Self::SIZE {
            return Err(FrameError::InvalidControl(action.as_byte()));
        }
        Ok(Self {
            timestamp_us: data.get_u64(),
            seq: data.get_u32(),
        })
    }
}

/// Decode the boundary index carried by INDEX_RESET / INDEX_RESET_ACK.
pub fn decode_boundary(action: Action, mut data: &[u8]) -> Result<u32, FrameError> {
    if data.len() != 4 {
        return Err(FrameError::InvalidControl(action.as_byte()));
    }
    Ok(data.get_u32())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_roundtrip() {
        for action in [
            Action::Stream,
            Action::Ack,
            Action::Resend,
            Action::IndexReset,
            Action::IndexResetAck,
            Action::Ttl,
            Action::TtlAck,
        ] {
            assert_eq!(Action::from_byte(action.as_byte()), Some(action));
        }
        assert_eq!(Action::from_byte(7), None);
        assert_eq!(Action::from_byte(0xff), None);
    }

    #[test]
    fn test_stream_flags() {
        let flags = StreamFlags::OPEN.with(StreamFlags::CAPPED);
        assert!(flags.is_open());
        assert!(flags.contains(StreamFlags::CAPPED));
        assert!(!flags.is_close());
        assert_eq!(flags.as_byte(), 0x22);
        assert_eq!(flags.without(StreamFlags::OPEN), StreamFlags::CAPPED);
    }

    #[test]
    fn test_stream_frame_data_flag_follows_payload() {
        let frame = StreamFrame::new(3, StreamFlags::OPEN, 1, Bytes::from_static(b"abc"));
        assert!(frame.flags.contains(StreamFlags::DATA));

        let frame = StreamFrame::new(3, StreamFlags::CLOSE.with(StreamFlags::DATA), 2, Bytes::new());
        assert!(!frame.flags.contains(StreamFlags::DATA));
    }

    #[test]
    fn test_frame_wire_layout() {
        let mut frame = Frame::stream(
            0x0102_0304,
            StreamFrame::new(0x0a0b, StreamFlags::OPEN, 9, Bytes::from_static(b"hi")),
        );
        frame.ack = 0x0506_0708;
        let wire = frame.encode();
        // action, index, ack | stream id, flags, stream index | data
        assert_eq!(
            hex::encode(&wire),
            concat!("00", "01020304", "05060708", "0a0b", "03", "00000009", "6869")
        );
        assert_eq!(wire.len(), frame.encoded_len());
        assert_eq!(Frame::decode(wire).unwrap(), frame);
    }

    #[test]
    fn test_control_frame_roundtrip() {
        let mut frame = Frame::control(Action::Resend, encode_indices(&[3, 7, 11]));
        frame.ack = 42;
        let decoded = Frame::decode(frame.encode()).unwrap();
        assert_eq!(decoded, frame);
        assert!(decoded.is_unordered());
        assert_eq!(
            decode_indices(Action::Resend, decoded.control_data()).unwrap(),
            vec![3, 7, 11]
        );
    }

    #[test]
    fn test_decode_truncated_header() {
        let err = Frame::decode(Bytes::from_static(&[0, 0, 0, 1])).unwrap_err();
        assert_eq!(
            err,
            FrameError::Truncated {
                expected: FRAME_HEADER_SIZE,
                actual: 4
            }
        );
    }

    #[test]
    fn test_decode_truncated_stream_frame() {
        let wire = Bytes::from_static(&[0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 1, 2]);
        assert!(matches!(
            Frame::decode(wire),
            Err(FrameError::Truncated { .. })
        ));
    }

    #[test]
    fn test_decode_invalid_action() {
        let wire = Bytes::from_static(&[9, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(Frame::decode(wire), Err(FrameError::InvalidAction(9)));
    }

    #[test]
    fn test_ttl_stamp_roundtrip() {
        let stamp = TtlStamp {
            timestamp_us: 123_456_789,
            seq: 17,
        };
        assert_eq!(TtlStamp::from_bytes(Action::Ttl, &stamp.to_bytes()).unwrap(), stamp);
        assert!(TtlStamp::from_bytes(Action::Ttl, &[1, 2, 3]).is_err());
    }

    #[test]
    fn test_indices_reject_ragged_payload() {
        assert_eq!(
            decode_indices(Action::Ack, &[0, 0, 1]),
            Err(FrameError::InvalidControl(ACTION_ACK))
        );
        assert!(decode_indices(Action::Ack, &[]).unwrap().is_empty());
    }
}
