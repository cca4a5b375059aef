//! # xstream
//!
//! A multiplexed, encrypted, multi-connection stream transport over TCP.
//!
//! xstream carries many independent byte streams between a client and a
//! server over one or more TCP connections per session. It provides:
//!
//! - **Multiplexing**: ordered streams with priorities, sharing one session
//! - **Multi-path delivery**: frames are spread over every live connection,
//!   reordered, deduplicated and resent when a connection stalls or dies
//! - **Security**: ChaCha20-Poly1305 records, X25519 handshakes signed with a
//!   preshared key, periodic session key exchange
//! - **Mobility**: connections rotate and reconnect under a live session;
//!   clients can resume a persisted session after a restart
//!
//! ## Feature Flags
//!
//! - `net`: tokio TCP sockets and the session driver
//! - `client` (default): client API (implies `net`)
//! - `server` (default): server API (implies `net`)
//!
//! Without `net` the crate is sans-I/O: [`session::Session`] is driven by
//! feeding it bytes and instants.
//!
//! ## Modules
//!
//! - [`core`]: constants, error types and the traits between layers
//! - [`transport`]: frames, records, connections, RTT and sockets
//! - [`center`]: ordering, acknowledgement and resend across connections
//! - [`session`]: streams, sessions, control messages, persistence
//! - [`crypto`]: keys, handshake, record cipher, key exchange
//! - [`client`] / [`server`]: tokio APIs
//!
//! ## Example Usage
//!
//! ```rust
//! use std::time::Instant;
//! use xstream::prelude::*;
//!
//! let now = Instant::now();
//! let secrets = SessionSecrets {
//!     auth_key: AuthKey::generate(),
//!     session_key: SessionKey::from_bytes([7; 32]),
//! };
//! let mut session = Session::new(
//!     Role::Client,
//!     SessionId::generate(),
//!     secrets,
//!     SessionConfig::default(),
//!     now,
//! );
//!
//! let stream = session.open_stream(StreamConfig::default(), now)?;
//! session.write(stream, b"hello", now)?;
//! assert_eq!(session.state(), SessionState::Opening);
//! # Ok::<(), SessionError>(())
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module (always included)
pub mod core;

pub mod center;
pub mod crypto;
pub mod session;
pub mod transport;

// Client API (feature-gated)
#[cfg(feature = "client")]
#[cfg_attr(docsrs, doc(cfg(feature = "client")))]
pub mod client;

// Server API (feature-gated)
#[cfg(feature = "server")]
#[cfg_attr(docsrs, doc(cfg(feature = "server")))]
pub mod server;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::*;

    pub use crate::center::{Center, CenterConfig, CenterStats, Priority};
    pub use crate::crypto::{
        AuthKey, ClientHandshake, HelloKind, KeyExchangeConfig, PresharedKey, Role, SessionId,
        SessionKey, SessionSecrets,
    };
    pub use crate::session::{
        MemoryStore, Session, SessionConfig, SessionEvent, SessionRecord, SessionState,
        SessionStats, Stream, StreamConfig,
    };
    pub use crate::transport::{
        ConnId, Connection, ConnectionConfig, ConnectionStats, Frame, StreamFlags, StreamFrame,
    };

    #[cfg(feature = "net")]
    pub use crate::session::{spawn_session, SessionHandle};

    #[cfg(feature = "client")]
    pub use crate::client::{Client, ClientBuilder, ClientConfig, ClientError};

    #[cfg(feature = "server")]
    pub use crate::server::{IncomingSession, Server, ServerBuilder, ServerConfig, ServerError};
}

pub use crate::core::{Result, XStreamError};
pub use crate::session::{Session, SessionConfig, SessionEvent, StreamConfig};
