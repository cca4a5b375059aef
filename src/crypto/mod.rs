//! xstream - Crypto
//!
//! - **Keys**: session identity, auth key, preshared key, X25519 ephemerals
//! - **Handshake**: signed hellos that open or fork a session
//! - **Records**: ChaCha20-Poly1305 with per-direction counter nonces
//! - **Key exchange**: periodic session key rotation

mod cipher;
mod handshake;
pub mod kdf;
mod keys;
mod rekey;

pub use cipher::*;
pub use handshake::*;
pub use kdf::ConnectionKeys;
pub use keys::*;
pub use rekey::*;
