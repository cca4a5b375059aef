//! ChaCha20-Poly1305 record protection.
//!
//! Nonce layout (12 bytes): direction word (BE32) followed by a per-direction
//! record counter (BE64). TCP delivers records in order, so both ends keep
//! their counters in lockstep without sending them.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};

use super::kdf::ConnectionKeys;
use super::keys::{Role, SessionKey};
use crate::core::{CryptoError, RecordCipher};

/// Direction word of records written by the client.
const DIRECTION_CLIENT: u32 = 0x6378_6d31;
/// Direction word of records written by the server.
const DIRECTION_SERVER: u32 = 0x7378_6d31;

fn nonce(direction: u32, counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..4].copy_from_slice(&direction.to_be_bytes());
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

fn direction(role: Role) -> u32 {
    match role {
        Role::Client => DIRECTION_CLIENT,
        Role::Server => DIRECTION_SERVER,
    }
}

/// Record cipher of one connection.
pub struct ChaChaRecordCipher {
    send: ChaCha20Poly1305,
    recv: ChaCha20Poly1305,
    send_direction: u32,
    recv_direction: u32,
    send_counter: u64,
    recv_counter: u64,
}

impl ChaChaRecordCipher {
    /// Build the cipher for `role` from the connection keys.
    pub fn new(keys: &ConnectionKeys, role: Role) -> Self {
        let (send_key, recv_key) = match role {
            Role::Client => (&keys.client_to_server, &keys.server_to_client),
            Role::Server => (&keys.server_to_client, &keys.client_to_server),
        };
        Self {
            send: cipher(send_key),
            recv: cipher(recv_key),
            send_direction: direction(role),
            recv_direction: direction(role.peer()),
            send_counter: 0,
            recv_counter: 0,
        }
    }
}

fn cipher(key: &SessionKey) -> ChaCha20Poly1305 {
    ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()))
}

impl RecordCipher for ChaChaRecordCipher {
    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = nonce(self.send_direction, self.send_counter);
        let ciphertext = self
            .send
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;
        self.send_counter += 1;
        Ok(ciphertext)
    }

    fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = nonce(self.recv_direction, self.recv_counter);
        let plaintext = self
            .recv
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)?;
        self.recv_counter += 1;
        Ok(plaintext)
    }
}

/// One-shot seal with a single-use key (zero nonce).
pub fn seal_once(key: &SessionKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    cipher(key)
        .encrypt(Nonce::from_slice(&[0u8; 12]), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)
}

/// Open a [`seal_once`] box.
pub fn open_once(key: &SessionKey, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    cipher(key)
        .decrypt(Nonce::from_slice(&[0u8; 12]), ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AEAD_TAG_SIZE, KEY_SIZE};

    fn keys() -> ConnectionKeys {
        ConnectionKeys {
            client_to_server: SessionKey::from_bytes([1; KEY_SIZE]),
            server_to_client: SessionKey::from_bytes([2; KEY_SIZE]),
        }
    }

    #[test]
    fn test_records_decrypt_in_order() {
        let keys = keys();
        let mut client = ChaChaRecordCipher::new(&keys, Role::Client);
        let mut server = ChaChaRecordCipher::new(&keys, Role::Server);

        let first = client.encrypt(b"first").unwrap();
        let second = client.encrypt(b"second").unwrap();
        assert_eq!(first.len(), 5 + AEAD_TAG_SIZE);
        assert_eq!(server.decrypt(&first).unwrap(), b"first");
        assert_eq!(server.decrypt(&second).unwrap(), b"second");

        let reply = server.encrypt(b"reply").unwrap();
        assert_eq!(client.decrypt(&reply).unwrap(), b"reply");
    }

    #[test]
    fn test_out_of_order_record_fails() {
        let keys = keys();
        let mut client = ChaChaRecordCipher::new(&keys, Role::Client);
        let mut server = ChaChaRecordCipher::new(&keys, Role::Server);

        let _first = client.encrypt(b"first").unwrap();
        let second = client.encrypt(b"second").unwrap();
        assert_eq!(server.decrypt(&second), Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn test_reflected_record_fails() {
        let keys = keys();
        let mut client = ChaChaRecordCipher::new(&keys, Role::Client);
        let record = client.encrypt(b"echo").unwrap();
        assert!(client.decrypt(&record).is_err());
    }

    #[test]
    fn test_seal_once_roundtrip() {
        let key = SessionKey::from_bytes([3; KEY_SIZE]);
        let sealed = seal_once(&key, b"auth").unwrap();
        assert_eq!(open_once(&key, &sealed).unwrap(), b"auth");
        let other = SessionKey::from_bytes([4; KEY_SIZE]);
        assert!(open_once(&other, &sealed).is_err());
    }
}
