//! Connection handshake.
//!
//! A connection opens with one hello in each direction, carried in
//! handshake records before the data phase begins.
//!
//! ```text
//! ClientHello (119 bytes)
//! +--------+------+------------+-----------+------------+-------------+-----+-----------+
//! | "XSTM" | kind | session id | timestamp | ephemeral  | sealed auth | mss | signature |
//! |   4    |  1   |     8      |   8 BE    |     32     |     32      |  2  |    32     |
//! +--------+------+------------+-----------+------------+-------------+-----+-----------+
//!
//! ServerHello (78 bytes)
//! +--------+------------+------------+-----+-----------+
//! | "XSTM" | session id | ephemeral  | mss | signature |
//! |   4    |     8      |     32     |  2  |    32     |
//! +--------+------------+------------+-----+-----------+
//! ```
//!
//! A *new* hello seals a fresh auth key under the preshared key and is
//! signed with a key derived from it. A *fork* hello joins an existing
//! session: the sealed field is zero and the signature key also mixes in
//! the session's auth key. A *resume* hello is signed like a fork but asks
//! the server to restart the session state under the same id and secrets
//! (a client that lost its in-memory session). The server's signature additionally covers the
//! client's ephemeral key. Record keys of the connection come from the
//! ephemeral DH secret salted with the session key.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

use super::cipher::{open_once, seal_once, ChaChaRecordCipher};
use super::kdf::{self, ConnectionKeys};
use super::keys::{AuthKey, EphemeralKeypair, PresharedKey, Role, SessionId, SessionKey};
use crate::core::{
    CryptoError, AEAD_TAG_SIZE, AUTH_KEY_SIZE, HELLO_MAX_SKEW, MAX_MSS, MIN_MSS,
    PROTOCOL_MARKER, PUBLIC_KEY_SIZE, SESSION_ID_SIZE, SIGNATURE_SIZE,
};

const SEALED_AUTH_SIZE: usize = AUTH_KEY_SIZE + AEAD_TAG_SIZE;

/// Kind of connection a client hello opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelloKind {
    /// First connection of a new session.
    New,
    /// Additional connection joining an existing session.
    Fork,
    /// First connection of a restarted client reusing a persisted session.
    Resume,
}

impl HelloKind {
    fn as_byte(self) -> u8 {
        match self {
            HelloKind::New => 1,
            HelloKind::Fork => 2,
            HelloKind::Resume => 3,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, CryptoError> {
        match byte {
            1 => Ok(HelloKind::New),
            2 => Ok(HelloKind::Fork),
            3 => Ok(HelloKind::Resume),
            other => Err(malformed(format!("unknown hello kind {other}"))),
        }
    }
}

fn malformed(msg: impl Into<String>) -> CryptoError {
    CryptoError::HandshakeFailed(msg.into())
}

fn array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

// =============================================================================
// Hello messages
// =============================================================================

/// First message of a connection, client to server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    /// New session or fork.
    pub kind: HelloKind,
    /// Session to join or resume (zero for a new session).
    pub session_id: SessionId,
    /// Client wall clock, seconds since the Unix epoch.
    pub timestamp: u64,
    /// Client ephemeral public key.
    pub public: [u8; PUBLIC_KEY_SIZE],
    /// Auth key sealed under the preshared key (zero unless new).
    pub sealed_auth_key: [u8; SEALED_AUTH_SIZE],
    /// Client segment size.
    pub mss: u16,
    /// BLAKE2s MAC over every preceding field.
    pub signature: [u8; SIGNATURE_SIZE],
}

impl ClientHello {
    /// Wire size.
    pub const SIZE: usize =
        4 + 1 + SESSION_ID_SIZE + 8 + PUBLIC_KEY_SIZE + SEALED_AUTH_SIZE + 2 + SIGNATURE_SIZE;

    fn signed_part(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_slice(&PROTOCOL_MARKER);
        buf.put_u8(self.kind.as_byte());
        buf.put_slice(self.session_id.as_bytes());
        buf.put_u64(self.timestamp);
        buf.put_slice(&self.public);
        buf.put_slice(&self.sealed_auth_key);
        buf.put_u16(self.mss);
        buf
    }

    /// Serialize.
    pub fn encode(&self) -> Bytes {
        let mut buf = self.signed_part();
        buf.put_slice(&self.signature);
        buf.freeze()
    }

    /// Parse, checking only the layout.
    pub fn decode(data: &[u8]) -> Result<Self, CryptoError> {
        if data.len() != Self::SIZE {
            return Err(malformed(format!("client hello of {} bytes", data.len())));
        }
        if data[..4] != PROTOCOL_MARKER {
            return Err(malformed("bad protocol marker"));
        }
        let kind = HelloKind::from_byte(data[4])?;
        let mut at = 5;
        let session_id = SessionId::from_bytes(array(&data[at..]));
        at += SESSION_ID_SIZE;
        let timestamp = u64::from_be_bytes(array(&data[at..]));
        at += 8;
        let public = array(&data[at..]);
        at += PUBLIC_KEY_SIZE;
        let sealed_auth_key = array(&data[at..]);
        at += SEALED_AUTH_SIZE;
        let mss = u16::from_be_bytes(array(&data[at..]));
        at += 2;
        let signature = array(&data[at..]);
        Ok(Self {
            kind,
            session_id,
            timestamp,
            public,
            sealed_auth_key,
            mss,
            signature,
        })
    }
}

/// Server reply to a [`ClientHello`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    /// Session the connection belongs to.
    pub session_id: SessionId,
    /// Server ephemeral public key.
    pub public: [u8; PUBLIC_KEY_SIZE],
    /// Agreed segment size.
    pub mss: u16,
    /// MAC over every preceding field and the client ephemeral key.
    pub signature: [u8; SIGNATURE_SIZE],
}

impl ServerHello {
    /// Wire size.
    pub const SIZE: usize = 4 + SESSION_ID_SIZE + PUBLIC_KEY_SIZE + 2 + SIGNATURE_SIZE;

    fn signed_part(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_slice(&PROTOCOL_MARKER);
        buf.put_slice(self.session_id.as_bytes());
        buf.put_slice(&self.public);
        buf.put_u16(self.mss);
        buf
    }

    /// Serialize.
    pub fn encode(&self) -> Bytes {
        let mut buf = self.signed_part();
        buf.put_slice(&self.signature);
        buf.freeze()
    }

    /// Parse, checking only the layout.
    pub fn decode(data: &[u8]) -> Result<Self, CryptoError> {
        if data.len() != Self::SIZE {
            return Err(malformed(format!("server hello of {} bytes", data.len())));
        }
        if data[..4] != PROTOCOL_MARKER {
            return Err(malformed("bad protocol marker"));
        }
        let mut at = 4;
        let session_id = SessionId::from_bytes(array(&data[at..]));
        at += SESSION_ID_SIZE;
        let public = array(&data[at..]);
        at += PUBLIC_KEY_SIZE;
        let mss = u16::from_be_bytes(array(&data[at..]));
        at += 2;
        let signature = array(&data[at..]);
        Ok(Self {
            session_id,
            public,
            mss,
            signature,
        })
    }
}

// =============================================================================
// Outcome
// =============================================================================

/// Keys and parameters of a completed handshake.
#[derive(Debug)]
pub struct Established {
    /// Kind of hello that opened the connection.
    pub kind: HelloKind,
    /// Session the connection belongs to.
    pub session_id: SessionId,
    /// Session auth key.
    pub auth_key: AuthKey,
    /// Session key the connection keys were salted with.
    pub session_key: SessionKey,
    /// Record keys of this connection.
    pub keys: ConnectionKeys,
    /// Agreed segment size.
    pub mss: u16,
}

impl Established {
    /// Record cipher for our side of the connection.
    pub fn cipher(&self, role: Role) -> ChaChaRecordCipher {
        ChaChaRecordCipher::new(&self.keys, role)
    }
}

// =============================================================================
// Client side
// =============================================================================

/// Client half of one connection handshake.
#[derive(Debug)]
pub struct ClientHandshake {
    kind: HelloKind,
    psk: PresharedKey,
    ephemeral: EphemeralKeypair,
    auth_key: AuthKey,
    resume: Option<(SessionId, SessionKey)>,
    mss: u16,
}

impl ClientHandshake {
    /// Handshake that opens a new session with a fresh auth key.
    pub fn new_session(psk: PresharedKey, mss: u16) -> Self {
        Self {
            kind: HelloKind::New,
            psk,
            ephemeral: EphemeralKeypair::generate(),
            auth_key: AuthKey::generate(),
            resume: None,
            mss,
        }
    }

    /// Handshake that adds a connection to an existing session.
    pub fn fork(
        psk: PresharedKey,
        session_id: SessionId,
        auth_key: AuthKey,
        session_key: SessionKey,
        mss: u16,
    ) -> Self {
        Self {
            kind: HelloKind::Fork,
            psk,
            ephemeral: EphemeralKeypair::generate(),
            auth_key,
            resume: Some((session_id, session_key)),
            mss,
        }
    }

    /// Handshake that restarts a persisted session.
    pub fn resume(
        psk: PresharedKey,
        session_id: SessionId,
        auth_key: AuthKey,
        session_key: SessionKey,
        mss: u16,
    ) -> Self {
        Self {
            kind: HelloKind::Resume,
            ..Self::fork(psk, session_id, auth_key, session_key, mss)
        }
    }

    /// Kind of hello this handshake sends.
    pub fn kind(&self) -> HelloKind {
        self.kind
    }

    fn signing_key(&self) -> Result<SessionKey, CryptoError> {
        match self.kind {
            HelloKind::New => kdf::new_session_signing_key(&self.psk),
            HelloKind::Fork | HelloKind::Resume => {
                kdf::fork_signing_key(&self.psk, &self.auth_key)
            }
        }
    }

    /// Build the hello, stamped with `timestamp` (Unix seconds).
    pub fn hello(&self, timestamp: u64) -> Result<Bytes, CryptoError> {
        let public = self.ephemeral.public_key();
        let (session_id, sealed_auth_key) = match &self.resume {
            Some((id, _)) => (*id, [0u8; SEALED_AUTH_SIZE]),
            None => {
                let key = kdf::sealing_key(&self.psk, &public)?;
                let sealed = seal_once(&key, self.auth_key.as_bytes())?;
                (SessionId::from_bytes([0; SESSION_ID_SIZE]), array(&sealed))
            }
        };
        let mut hello = ClientHello {
            kind: self.kind(),
            session_id,
            timestamp,
            public,
            sealed_auth_key,
            mss: self.mss,
            signature: [0; SIGNATURE_SIZE],
        };
        hello.signature = kdf::sign(&self.signing_key()?, &[&hello.signed_part()[..]])?;
        Ok(hello.encode())
    }

    /// Verify the server reply and derive the connection keys.
    pub fn finish(self, reply: &[u8]) -> Result<Established, CryptoError> {
        let reply = ServerHello::decode(reply)?;
        let public = self.ephemeral.public_key();
        kdf::verify(
            &self.signing_key()?,
            &[&reply.signed_part()[..], &public[..]],
            &reply.signature,
        )?;

        let kind = self.kind();
        let session_key = match self.resume {
            Some((id, key)) => {
                if id != reply.session_id {
                    return Err(malformed("server answered for another session"));
                }
                key
            }
            None => kdf::session_key(&self.psk, &self.auth_key)?,
        };

        if !(MIN_MSS..=MAX_MSS).contains(&usize::from(reply.mss)) {
            return Err(malformed(format!("server mss {} out of range", reply.mss)));
        }

        let shared = self.ephemeral.diffie_hellman(&reply.public);
        let keys = kdf::connection_keys(&session_key, &shared, &self.auth_key)?;
        debug!(session = %reply.session_id, ?kind, mss = reply.mss, "handshake complete");
        Ok(Established {
            kind,
            session_id: reply.session_id,
            auth_key: self.auth_key,
            session_key,
            keys,
            mss: reply.mss,
        })
    }
}

// =============================================================================
// Server side
// =============================================================================

/// Session secrets the server keeps for fork lookups.
#[derive(Debug, Clone)]
pub struct SessionSecrets {
    /// Session auth key.
    pub auth_key: AuthKey,
    /// Current session key.
    pub session_key: SessionKey,
}

/// Answer a client hello.
///
/// `now` is the server wall clock in Unix seconds. `lookup` resolves the
/// secrets of an existing session for fork and resume hellos. Returns the encoded
/// reply and the established keys.
pub fn accept<F>(
    psk: &PresharedKey,
    hello: &[u8],
    now: u64,
    server_mss: u16,
    lookup: F,
) -> Result<(Bytes, Established), CryptoError>
where
    F: FnOnce(&SessionId) -> Option<SessionSecrets>,
{
    let hello = ClientHello::decode(hello)?;
    if now.abs_diff(hello.timestamp) > HELLO_MAX_SKEW.as_secs() {
        return Err(CryptoError::StaleTimestamp);
    }

    let (session_id, auth_key, session_key, signing_key) = match hello.kind {
        HelloKind::New => {
            let signing_key = kdf::new_session_signing_key(psk)?;
            kdf::verify(&signing_key, &[&hello.signed_part()[..]], &hello.signature)?;
            let sealing_key = kdf::sealing_key(psk, &hello.public)?;
            let opened = open_once(&sealing_key, &hello.sealed_auth_key)?;
            let auth_key = AuthKey::from_bytes(array(&opened));
            let session_key = kdf::session_key(psk, &auth_key)?;
            (SessionId::generate(), auth_key, session_key, signing_key)
        }
        HelloKind::Fork | HelloKind::Resume => {
            let secrets = lookup(&hello.session_id)
                .ok_or_else(|| malformed(format!("unknown session {}", hello.session_id)))?;
            let signing_key = kdf::fork_signing_key(psk, &secrets.auth_key)?;
            kdf::verify(&signing_key, &[&hello.signed_part()[..]], &hello.signature)?;
            (
                hello.session_id,
                secrets.auth_key,
                secrets.session_key,
                signing_key,
            )
        }
    };

    let mss = hello.mss.min(server_mss).min(MAX_MSS as u16);
    if usize::from(mss) < MIN_MSS {
        return Err(malformed(format!("mss {mss} below minimum")));
    }

    let ephemeral = EphemeralKeypair::generate();
    let mut reply = ServerHello {
        session_id,
        public: ephemeral.public_key(),
        mss,
        signature: [0; SIGNATURE_SIZE],
    };
    reply.signature = kdf::sign(&signing_key, &[&reply.signed_part()[..], &hello.public[..]])?;

    let shared = ephemeral.diffie_hellman(&hello.public);
    let keys = kdf::connection_keys(&session_key, &shared, &auth_key)?;
    debug!(session = %session_id, kind = ?hello.kind, mss, "accepted hello");

    Ok((
        reply.encode(),
        Established {
            kind: hello.kind,
            session_id,
            auth_key,
            session_key,
            keys,
            mss,
        },
    ))
}
