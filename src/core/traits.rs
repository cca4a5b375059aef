//! Seams between the xstream layers.
//!
//! These traits replace runtime event subscriptions: every edge of the
//! ownership tree (connection -> center, center -> streams, connection ->
//! cipher, client -> persistence) is one explicit trait wired at
//! construction time.

use std::time::Instant;

use super::error::CryptoError;
use crate::center::Priority;
use crate::transport::{ConnId, Frame, StreamFrame};

/// Receiver of frames decoded by a connection.
pub trait FrameSink {
    /// Called once per decoded frame, in wire order of `conn`.
    fn on_frame(&mut self, conn: ConnId, frame: Frame);
}

/// Lookup of live streams, used by the center to decide whether an
/// out-of-order frame may be handed over early.
pub trait StreamDirectory {
    /// Check if a stream with this id is currently open.
    fn is_open(&self, stream_id: u16) -> bool;
}

/// Producer side of the ready-stream scheduler.
pub trait StreamSource {
    /// Materialize the next frame of a ready stream.
    ///
    /// Returns the frame and whether the stream has more to send, or `None`
    /// if the stream produced nothing.
    fn do_write(&mut self, stream_id: u16, now: Instant) -> Option<(StreamFrame, bool)>;

    /// Current scheduling priority of a stream, `None` if it is gone.
    fn priority(&self, stream_id: u16, now: Instant) -> Option<Priority>;
}

/// Symmetric record protection of one connection.
///
/// Each direction keeps its own nonce sequence, so records must be
/// decrypted in the order they were encrypted.
pub trait RecordCipher: Send {
    /// Encrypt one record body.
    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Decrypt one record body.
    fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// Opaque key-value store for persisted session records.
pub trait SessionStore: Send + Sync {
    /// Load the blob stored under `key`.
    fn load(&self, key: &str) -> Option<Vec<u8>>;

    /// Store a blob under `key`, replacing any previous one.
    fn save(&self, key: &str, blob: &[u8]);

    /// Forget the blob stored under `key`.
    fn remove(&self, key: &str);
}
