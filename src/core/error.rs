//! Error types for xstream.

use thiserror::Error;

/// Errors raised while decoding frames and records.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Input is shorter than the fixed header it must contain.
    #[error("frame truncated: expected at least {expected} bytes, got {actual}")]
    Truncated {
        /// Minimum expected size.
        expected: usize,
        /// Actual size received.
        actual: usize,
    },

    /// Unknown action byte.
    #[error("invalid frame action: 0x{0:02x}")]
    InvalidAction(u8),

    /// Control payload is malformed for its action.
    #[error("invalid control payload for action 0x{0:02x}")]
    InvalidControl(u8),

    /// Unknown record type byte.
    #[error("invalid record type: 0x{0:02x}")]
    InvalidRecordType(u8),

    /// Record body does not fit the 16-bit length field.
    #[error("record too large: {0} bytes")]
    RecordTooLarge(usize),
}

/// Errors in the crypto layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// AEAD encryption failed.
    #[error("AEAD encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (invalid tag or corrupted).
    #[error("AEAD decryption failed (invalid tag or corrupted)")]
    DecryptionFailed,

    /// Key derivation failed.
    #[error("key derivation failed")]
    KeyDerivationFailed,

    /// A hello signature did not verify.
    #[error("signature mismatch")]
    BadSignature,

    /// A hello timestamp is outside the accepted skew.
    #[error("stale hello timestamp")]
    StaleTimestamp,

    /// Handshake failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
}

/// Errors that end a single connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Malformed frame or record.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Record could not be decrypted.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Connection is closed.
    #[error("connection closed")]
    Closed,

    /// Liveness ping was not answered.
    #[error("ping timeout")]
    PingTimeout,

    /// Connection outlived its time or data budget.
    #[error("connection expired")]
    Expired,
}

impl ConnectionError {
    /// Check if this error must tear the connection down.
    ///
    /// Every connection error is fatal to its connection; the session
    /// continues over the remaining ones.
    pub fn is_fatal(&self) -> bool {
        true
    }

    /// Check if this error indicates a protocol violation by the peer.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, ConnectionError::Frame(_) | ConnectionError::Crypto(_))
    }
}

/// Errors in the session layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// No stream with this id.
    #[error("unknown stream: {0}")]
    UnknownStream(u16),

    /// Stream no longer accepts writes.
    #[error("stream closed: {0}")]
    StreamClosed(u16),

    /// Session is closed.
    #[error("session closed")]
    SessionClosed,

    /// A frame exceeded its retry ceiling.
    #[error("retransmission exhausted for index {index}")]
    RetransmitExhausted {
        /// Connection-level index of the frame.
        index: u32,
    },

    /// A capped write does not fit in one frame.
    #[error("write of {len} bytes exceeds the {max} byte frame limit")]
    ChunkTooLarge {
        /// Bytes written.
        len: usize,
        /// Largest single frame payload.
        max: usize,
    },

    /// Every stream id of this side is in use.
    #[error("stream ids exhausted")]
    StreamIdsExhausted,

    /// Persisted session record is unusable.
    #[error("session record error: {0}")]
    Persist(String),

    /// A key exchange message failed verification.
    #[error("key exchange failed: {0}")]
    KeyExchange(#[from] CryptoError),

    /// The server did not confirm the session in time.
    #[error("session open timed out")]
    OpenTimeout,

    /// No connection came back within the suspend grace period.
    #[error("session suspended too long")]
    SuspendExpired,
}

impl SessionError {
    /// Check if this error ends the whole session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::SessionClosed
                | SessionError::RetransmitExhausted { .. }
                | SessionError::KeyExchange(_)
                | SessionError::OpenTimeout
                | SessionError::SuspendExpired
        )
    }
}

/// Top-level xstream errors.
#[derive(Debug, Error)]
pub enum XStreamError {
    /// Frame error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Crypto error.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Connection error.
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Session error.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for xstream operations.
pub type Result<T> = std::result::Result<T, XStreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_session_errors() {
        assert!(SessionError::SessionClosed.is_fatal());
        assert!(SessionError::RetransmitExhausted { index: 7 }.is_fatal());
        assert!(!SessionError::UnknownStream(3).is_fatal());
        assert!(!SessionError::StreamClosed(3).is_fatal());
        assert!(!SessionError::ChunkTooLarge { len: 70_000, max: 65_503 }.is_fatal());
    }

    #[test]
    fn test_protocol_violations() {
        let err = ConnectionError::from(FrameError::InvalidAction(9));
        assert!(err.is_protocol_violation());
        assert!(err.is_fatal());
        assert!(!ConnectionError::PingTimeout.is_protocol_violation());
    }

    #[test]
    fn test_error_conversion() {
        let err: XStreamError = SessionError::UnknownStream(4).into();
        assert_eq!(err.to_string(), "session error: unknown stream: 4");
    }
}
