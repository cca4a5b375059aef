//! Messages of the session control stream (stream 0).
//!
//! ```text
//! SessionOpened:        [0x01]
//! KeyExchangeStart:     [0x02][seq:4][public key:32]
//! KeyExchangeAck:       [0x03][seq:4][public key:32]
//! KeyExchangeConfirm:   [0x04][seq:4][mac:32]
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::core::FrameError;
use crate::crypto::RekeyMessage;

const TYPE_SESSION_OPENED: u8 = 0x01;
const TYPE_KEY_EXCHANGE_START: u8 = 0x02;
const TYPE_KEY_EXCHANGE_ACK: u8 = 0x03;
const TYPE_KEY_EXCHANGE_CONFIRM: u8 = 0x04;

const KEY_EXCHANGE_SIZE: usize = 1 + 4 + 32;

/// One control-stream message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Server accepted the session.
    SessionOpened,
    /// Key exchange step.
    KeyExchange(RekeyMessage),
}

impl ControlMessage {
    /// Serialize.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(KEY_EXCHANGE_SIZE);
        match self {
            ControlMessage::SessionOpened => buf.put_u8(TYPE_SESSION_OPENED),
            ControlMessage::KeyExchange(msg) => {
                let (kind, body) = match msg {
                    RekeyMessage::Start { public, .. } => (TYPE_KEY_EXCHANGE_START, public),
                    RekeyMessage::Ack { public, .. } => (TYPE_KEY_EXCHANGE_ACK, public),
                    RekeyMessage::Confirm { mac, .. } => (TYPE_KEY_EXCHANGE_CONFIRM, mac),
                };
                buf.put_u8(kind);
                buf.put_u32(msg.seq());
                buf.put_slice(body);
            }
        }
        buf.freeze()
    }

    /// Parse one message.
    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        let Some(&kind) = data.first() else {
            return Err(FrameError::Truncated {
                expected: 1,
                actual: 0,
            });
        };
        if kind == TYPE_SESSION_OPENED {
            return Ok(ControlMessage::SessionOpened);
        }
        if !matches!(
            kind,
            TYPE_KEY_EXCHANGE_START | TYPE_KEY_EXCHANGE_ACK | TYPE_KEY_EXCHANGE_CONFIRM
        ) {
            return Err(FrameError::InvalidControl(kind));
        }
        if data.len() != KEY_EXCHANGE_SIZE {
            return Err(FrameError::Truncated {
                expected: KEY_EXCHANGE_SIZE,
                actual: data.len(),
            });
        }
        let mut seq = [0u8; 4];
        seq.copy_from_slice(&data[1..5]);
        let seq = u32::from_be_bytes(seq);
        let mut body = [0u8; 32];
        body.copy_from_slice(&data[5..]);

        let msg = match kind {
            TYPE_KEY_EXCHANGE_START => RekeyMessage::Start { seq, public: body },
            TYPE_KEY_EXCHANGE_ACK => RekeyMessage::Ack { seq, public: body },
            _ => RekeyMessage::Confirm { seq, mac: body },
        };
        Ok(ControlMessage::KeyExchange(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_opened_is_one_byte() {
        let bytes = ControlMessage::SessionOpened.encode();
        assert_eq!(&bytes[..], &[TYPE_SESSION_OPENED]);
        assert_eq!(
            ControlMessage::decode(&bytes).unwrap(),
            ControlMessage::SessionOpened
        );
    }

    #[test]
    fn test_key_exchange_layout() {
        let msg = ControlMessage::KeyExchange(RekeyMessage::Ack {
            seq: 0x0102_0304,
            public: [9; 32],
        });
        let bytes = msg.encode();
        assert_eq!(bytes.len(), KEY_EXCHANGE_SIZE);
        assert_eq!(&bytes[..5], &[TYPE_KEY_EXCHANGE_ACK, 1, 2, 3, 4]);
        assert_eq!(ControlMessage::decode(&bytes).unwrap(), msg);

        let confirm = ControlMessage::KeyExchange(RekeyMessage::Confirm {
            seq: 7,
            mac: [1; 32],
        });
        assert_eq!(ControlMessage::decode(&confirm.encode()).unwrap(), confirm);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            ControlMessage::decode(&[]),
            Err(FrameError::Truncated { .. })
        ));
        assert_eq!(
            ControlMessage::decode(&[0x7f]),
            Err(FrameError::InvalidControl(0x7f))
        );
        assert!(matches!(
            ControlMessage::decode(&[TYPE_KEY_EXCHANGE_START, 0, 0]),
            Err(FrameError::Truncated { .. })
        ));
    }
}
