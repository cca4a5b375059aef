//! Persisted session records.
//!
//! A client keeps the secrets of its session in a [`SessionStore`] so that a
//! restart within [`SESSION_RECORD_MAX_AGE`] can fork into the existing
//! server session instead of opening a new one.
//!
//! ```text
//! +---------+------------+----------+-------------+-----------+--------+-----+-----------+
//! | version | session id | auth key | session key | auth time | rekeyed| mss | timestamp |
//! |    1    |     8      |    16    |     32      |   8 BE    |   1    |  2  |   8 BE    |
//! +---------+------------+----------+-------------+-----------+--------+-----+-----------+
//! ```

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use md5::{Digest, Md5};
use tracing::debug;

use crate::core::{
    SessionError, SessionStore, AUTH_KEY_SIZE, KEY_SIZE, SESSION_ID_SIZE, SESSION_RECORD_MAX_AGE,
};
use crate::crypto::{AuthKey, SessionId, SessionKey};

const RECORD_VERSION: u8 = 1;

/// Store key of a client configuration: hex MD5 over host, port and key
/// settings.
pub fn fingerprint(host: &str, port: u16, crypto_key: &str, crypto_alg: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(host.as_bytes());
    hasher.update(port.to_be_bytes());
    hasher.update(crypto_key.as_bytes());
    hasher.update(crypto_alg.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// Secrets and parameters of a client session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    /// Session id assigned by the server.
    pub session_id: SessionId,
    /// Session auth key.
    pub auth_key: AuthKey,
    /// Current session key.
    pub session_key: SessionKey,
    /// Unix seconds of the last successful handshake.
    pub last_auth_time: u64,
    /// At least one key exchange completed.
    pub key_exchanged: bool,
    /// Negotiated MSS.
    pub mss: u16,
    /// Unix seconds the record was written.
    pub timestamp: u64,
}

impl SessionRecord {
    /// Encoded size.
    pub const SIZE: usize = 1 + SESSION_ID_SIZE + AUTH_KEY_SIZE + KEY_SIZE + 8 + 1 + 2 + 8;

    /// Serialize.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u8(RECORD_VERSION);
        buf.put_slice(self.session_id.as_bytes());
        buf.put_slice(self.auth_key.as_bytes());
        buf.put_slice(self.session_key.as_bytes());
        buf.put_u64(self.last_auth_time);
        buf.put_u8(u8::from(self.key_exchanged));
        buf.put_u16(self.mss);
        buf.put_u64(self.timestamp);
        buf.to_vec()
    }

    /// Parse.
    pub fn decode(mut data: &[u8]) -> Result<Self, SessionError> {
        if data.len() != Self::SIZE {
            return Err(SessionError::Persist(format!(
                "record of {} bytes, expected {}",
                data.len(),
                Self::SIZE
            )));
        }
        let version = data.get_u8();
        if version != RECORD_VERSION {
            return Err(SessionError::Persist(format!(
                "unknown record version {version}"
            )));
        }
        let mut session_id = [0u8; SESSION_ID_SIZE];
        data.copy_to_slice(&mut session_id);
        let mut auth_key = [0u8; AUTH_KEY_SIZE];
        data.copy_to_slice(&mut auth_key);
        let mut session_key = [0u8; KEY_SIZE];
        data.copy_to_slice(&mut session_key);
        Ok(Self {
            session_id: SessionId::from_bytes(session_id),
            auth_key: AuthKey::from_bytes(auth_key),
            session_key: SessionKey::from_bytes(session_key),
            last_auth_time: data.get_u64(),
            key_exchanged: data.get_u8() != 0,
            mss: data.get_u16(),
            timestamp: data.get_u64(),
        })
    }

    /// Check if the record is younger than `max_age` at `now` (Unix seconds).
    pub fn is_fresh(&self, now: u64, max_age: Duration) -> bool {
        now >= self.timestamp && now - self.timestamp < max_age.as_secs()
    }
}

/// Load the record under `key`; stale or corrupt records are removed.
pub fn load_record(store: &dyn SessionStore, key: &str, now: u64) -> Option<SessionRecord> {
    let blob = store.load(key)?;
    match SessionRecord::decode(&blob) {
        Ok(record) if record.is_fresh(now, SESSION_RECORD_MAX_AGE) => Some(record),
        Ok(record) => {
            debug!(session = %record.session_id, "dropping stale session record");
            store.remove(key);
            None
        }
        Err(err) => {
            debug!(error = %err, "dropping unreadable session record");
            store.remove(key);
            None
        }
    }
}

/// In-process [`SessionStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.blobs.lock().map_or(0, |blobs| blobs.len())
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionStore for MemoryStore {
    fn load(&self, key: &str) -> Option<Vec<u8>> {
        self.blobs.lock().ok()?.get(key).cloned()
    }

    fn save(&self, key: &str, blob: &[u8]) {
        if let Ok(mut blobs) = self.blobs.lock() {
            blobs.insert(key.to_string(), blob.to_vec());
        }
    }

    fn remove(&self, key: &str) {
        if let Ok(mut blobs) = self.blobs.lock() {
            blobs.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000;

    fn record() -> SessionRecord {
        SessionRecord {
            session_id: SessionId::from_bytes([1, 2, 3, 4, 5, 6, 7, 8]),
            auth_key: AuthKey::from_bytes([0xaa; AUTH_KEY_SIZE]),
            session_key: SessionKey::from_bytes([0xbb; KEY_SIZE]),
            last_auth_time: NOW - 10,
            key_exchanged: true,
            mss: 1400,
            timestamp: NOW,
        }
    }

    #[test]
    fn test_record_layout() {
        let bytes = record().encode();
        assert_eq!(bytes.len(), SessionRecord::SIZE);
        assert_eq!(bytes[0], RECORD_VERSION);
        assert_eq!(&bytes[1..9], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&bytes[bytes.len() - 8..], &NOW.to_be_bytes());
        assert_eq!(SessionRecord::decode(&bytes).unwrap(), record());
    }

    #[test]
    fn test_decode_rejects_bad_input() {
        assert!(SessionRecord::decode(&[1, 2, 3]).is_err());
        let mut bytes = record().encode();
        bytes[0] = 9;
        assert!(matches!(
            SessionRecord::decode(&bytes),
            Err(SessionError::Persist(_))
        ));
    }

    #[test]
    fn test_fingerprint_is_stable_hex() {
        let a = fingerprint("example.com", 443, "secret", "chacha20-poly1305");
        let b = fingerprint("example.com", 443, "secret", "chacha20-poly1305");
        let c = fingerprint("example.com", 444, "secret", "chacha20-poly1305");
        assert_eq!(a, b);
        assert_ne!(a, c);
        let mut input = b"example.com".to_vec();
        input.extend_from_slice(&443u16.to_be_bytes());
        input.extend_from_slice(b"secret");
        input.extend_from_slice(b"chacha20-poly1305");
        assert_eq!(a, hex::encode(Md5::digest(&input)));
    }

    #[test]
    fn test_load_drops_stale_records() {
        let store = MemoryStore::new();
        store.save("k", &record().encode());
        assert_eq!(load_record(&store, "k", NOW + 60), Some(record()));

        let week = SESSION_RECORD_MAX_AGE.as_secs();
        assert_eq!(load_record(&store, "k", NOW + week), None);
        assert!(store.is_empty());
    }

    #[test]
    fn test_load_drops_corrupt_records() {
        let store = MemoryStore::new();
        store.save("k", b"garbage");
        assert_eq!(load_record(&store, "k", NOW), None);
        assert!(store.load("k").is_none());
        assert_eq!(load_record(&store, "missing", NOW), None);
    }
}
