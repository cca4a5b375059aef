//! Key material and identities.

use std::fmt;

use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::core::{AUTH_KEY_SIZE, KEY_SIZE, PUBLIC_KEY_SIZE, SESSION_ID_SIZE};

/// Which end of the session we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Dialing side.
    Client,
    /// Accepting side.
    Server,
}

impl Role {
    /// The other end.
    pub fn peer(self) -> Self {
        match self {
            Role::Client => Role::Server,
            Role::Server => Role::Client,
        }
    }
}

/// Ephemeral X25519 keypair, one per connection handshake or key exchange.
pub struct EphemeralKeypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl EphemeralKeypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Public half.
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_SIZE] {
        *self.public.as_bytes()
    }

    /// Compute the DH shared secret with a remote public key.
    pub fn diffie_hellman(&self, remote_public: &[u8; PUBLIC_KEY_SIZE]) -> Zeroizing<[u8; 32]> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*remote_public));
        Zeroizing::new(*shared.as_bytes())
    }
}

impl fmt::Debug for EphemeralKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralKeypair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// 32-byte symmetric key, zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; KEY_SIZE]);

impl SessionKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Per-session authentication key chosen by the client.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct AuthKey([u8; AUTH_KEY_SIZE]);

impl AuthKey {
    /// Generate a new random auth key.
    pub fn generate() -> Self {
        let mut key = [0u8; AUTH_KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    /// Wrap raw bytes.
    pub fn from_bytes(bytes: [u8; AUTH_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; AUTH_KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthKey(..)")
    }
}

/// Key shared out of band by client and server configuration.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PresharedKey([u8; KEY_SIZE]);

impl PresharedKey {
    /// Derive from the configured passphrase and algorithm name.
    pub fn from_passphrase(passphrase: &str, algorithm: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(algorithm.as_bytes());
        hasher.update([0u8]);
        hasher.update(passphrase.as_bytes());
        Self(hasher.finalize().into())
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for PresharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PresharedKey(..)")
    }
}

/// Session ID - 64-bit random identifier assigned by the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub [u8; SESSION_ID_SIZE]);

impl SessionId {
    /// Generate a new random session ID.
    pub fn generate() -> Self {
        let mut id = [0u8; SESSION_ID_SIZE];
        OsRng.fill_bytes(&mut id);
        Self(id)
    }

    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; SESSION_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; SESSION_ID_SIZE] {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl AsRef<[u8]> for SessionId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ephemeral_dh_agrees() {
        let a = EphemeralKeypair::generate();
        let b = EphemeralKeypair::generate();
        assert_ne!(a.public_key(), b.public_key());
        assert_eq!(
            *a.diffie_hellman(&b.public_key()),
            *b.diffie_hellman(&a.public_key())
        );
    }

    #[test]
    fn test_session_id_generation() {
        let id1 = SessionId::generate();
        let id2 = SessionId::generate();
        assert_ne!(id1, id2);
        assert_eq!(id1.as_bytes().len(), SESSION_ID_SIZE);
    }

    #[test]
    fn test_session_id_display() {
        let id = SessionId::from_bytes([0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0xab, 0xff]);
        assert_eq!(id.to_string(), "010203040506abff");
    }

    #[test]
    fn test_preshared_key_depends_on_algorithm() {
        let a = PresharedKey::from_passphrase("secret", "chacha20-poly1305");
        let b = PresharedKey::from_passphrase("secret", "other");
        let c = PresharedKey::from_passphrase("secret", "chacha20-poly1305");
        assert_ne!(a.as_bytes(), b.as_bytes());
        assert_eq!(a.as_bytes(), c.as_bytes());
    }

    #[test]
    fn test_key_debug_is_redacted() {
        let key = SessionKey::from_bytes([7; KEY_SIZE]);
        assert_eq!(format!("{key:?}"), "SessionKey(..)");
        assert_eq!(format!("{:?}", AuthKey::generate()), "AuthKey(..)");
    }
}
