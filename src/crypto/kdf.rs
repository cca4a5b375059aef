//! Key derivation (HKDF-SHA256) and hello signatures (BLAKE2s MAC).

use blake2::digest::Mac;
use blake2::Blake2sMac256;
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

use super::keys::{AuthKey, PresharedKey, SessionKey};
use crate::core::{CryptoError, KEY_SIZE, SIGNATURE_SIZE};

const LABEL_KEY: &[u8] = b"xstream v1 key";
const LABEL_SESSION: &[u8] = b"xstream v1 session";
const LABEL_CONNECTION: &[u8] = b"xstream v1 connection";
const LABEL_SIGN_NEW: &[u8] = b"xstream v1 sign new";
const LABEL_SIGN_FORK: &[u8] = b"xstream v1 sign fork";
const LABEL_SEAL: &[u8] = b"xstream v1 seal";
const LABEL_REKEY: &[u8] = b"xstream v1 rekey";

/// Derive `len` bytes from `salt` bound to a time value.
pub fn derive_key(salt: &[u8], time: u64, len: usize) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(&time.to_be_bytes()), salt);
    let mut okm = Zeroizing::new(vec![0u8; len]);
    hk.expand(LABEL_KEY, &mut okm)
        .map_err(|_| CryptoError::KeyDerivationFailed)?;
    Ok(okm)
}

fn expand32(salt: &[u8], ikm: &[u8], info: &[&[u8]]) -> Result<[u8; KEY_SIZE], CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = [0u8; KEY_SIZE];
    hk.expand_multi_info(info, &mut okm)
        .map_err(|_| CryptoError::KeyDerivationFailed)?;
    Ok(okm)
}

/// Initial session key of a new session.
pub fn session_key(psk: &PresharedKey, auth_key: &AuthKey) -> Result<SessionKey, CryptoError> {
    expand32(psk.as_bytes(), auth_key.as_bytes(), &[LABEL_SESSION]).map(SessionKey::from_bytes)
}

/// Record keys of one connection, one per direction.
#[derive(Debug, Clone)]
pub struct ConnectionKeys {
    /// Key of records written by the client.
    pub client_to_server: SessionKey,
    /// Key of records written by the server.
    pub server_to_client: SessionKey,
}

/// Derive record keys from the handshake DH secret, salted with the
/// session key.
pub fn connection_keys(
    session_key: &SessionKey,
    dh_shared: &[u8; 32],
    auth_key: &AuthKey,
) -> Result<ConnectionKeys, CryptoError> {
    let mut ikm = Zeroizing::new([0u8; 32 + 16]);
    ikm[..32].copy_from_slice(dh_shared);
    ikm[32..].copy_from_slice(auth_key.as_bytes());

    let hk = Hkdf::<Sha256>::new(Some(session_key.as_bytes()), &ikm[..]);
    let mut okm = Zeroizing::new([0u8; KEY_SIZE * 2]);
    hk.expand(LABEL_CONNECTION, &mut okm[..])
        .map_err(|_| CryptoError::KeyDerivationFailed)?;

    let mut c2s = [0u8; KEY_SIZE];
    let mut s2c = [0u8; KEY_SIZE];
    c2s.copy_from_slice(&okm[..KEY_SIZE]);
    s2c.copy_from_slice(&okm[KEY_SIZE..]);
    Ok(ConnectionKeys {
        client_to_server: SessionKey::from_bytes(c2s),
        server_to_client: SessionKey::from_bytes(s2c),
    })
}

/// Key that signs hellos of a new session.
pub fn new_session_signing_key(psk: &PresharedKey) -> Result<SessionKey, CryptoError> {
    expand32(psk.as_bytes(), &[], &[LABEL_SIGN_NEW]).map(SessionKey::from_bytes)
}

/// Key that signs hellos of a fork connection.
pub fn fork_signing_key(psk: &PresharedKey, auth_key: &AuthKey) -> Result<SessionKey, CryptoError> {
    expand32(psk.as_bytes(), auth_key.as_bytes(), &[LABEL_SIGN_FORK]).map(SessionKey::from_bytes)
}

/// Key that seals the auth key inside a new-session hello.
pub fn sealing_key(psk: &PresharedKey, client_public: &[u8; 32]) -> Result<SessionKey, CryptoError> {
    expand32(psk.as_bytes(), client_public, &[LABEL_SEAL]).map(SessionKey::from_bytes)
}

/// Session key produced by a key exchange.
pub fn rekey(old: &SessionKey, dh_shared: &[u8; 32], seq: u32) -> Result<SessionKey, CryptoError> {
    expand32(old.as_bytes(), dh_shared, &[LABEL_REKEY, &seq.to_be_bytes()]).map(SessionKey::from_bytes)
}

/// BLAKE2s-256 MAC over a list of parts.
pub fn sign(key: &SessionKey, parts: &[&[u8]]) -> Result<[u8; SIGNATURE_SIZE], CryptoError> {
    let mut mac =
        Blake2sMac256::new_from_slice(key.as_bytes()).map_err(|_| CryptoError::KeyDerivationFailed)?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().into())
}

/// Verify a MAC produced by [`sign`] in constant time.
pub fn verify(key: &SessionKey, parts: &[&[u8]], signature: &[u8]) -> Result<(), CryptoError> {
    let mut mac =
        Blake2sMac256::new_from_slice(key.as_bytes()).map_err(|_| CryptoError::KeyDerivationFailed)?;
    for part in parts {
        mac.update(part);
    }
    mac.verify_slice(signature)
        .map_err(|_| CryptoError::BadSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_key_depends_on_time() {
        let a = derive_key(b"salt", 1, 32).unwrap();
        let b = derive_key(b"salt", 2, 32).unwrap();
        let c = derive_key(b"salt", 1, 16).unwrap();
        assert_ne!(*a, *b);
        assert_eq!(&a[..16], &c[..]);
    }

    #[test]
    fn test_connection_keys_are_directional() {
        let session = SessionKey::from_bytes([1; KEY_SIZE]);
        let auth = AuthKey::from_bytes([2; 16]);
        let keys = connection_keys(&session, &[3; 32], &auth).unwrap();
        assert_ne!(keys.client_to_server, keys.server_to_client);

        let other = connection_keys(&session, &[4; 32], &auth).unwrap();
        assert_ne!(keys.client_to_server, other.client_to_server);
    }

    #[test]
    fn test_sign_and_verify() {
        let key = SessionKey::from_bytes([9; KEY_SIZE]);
        let sig = sign(&key, &[b"hello".as_slice(), b"world".as_slice()]).unwrap();
        assert!(verify(&key, &[b"helloworld".as_slice()], &sig).is_ok());
        assert_eq!(
            verify(&key, &[b"hello".as_slice(), b"there".as_slice()], &sig),
            Err(CryptoError::BadSignature)
        );
    }

    #[test]
    fn test_rekey_changes_with_seq() {
        let old = SessionKey::from_bytes([5; KEY_SIZE]);
        let a = rekey(&old, &[6; 32], 1).unwrap();
        let b = rekey(&old, &[6; 32], 2).unwrap();
        assert_ne!(a, b);
        assert_ne!(a, old);
    }
}
