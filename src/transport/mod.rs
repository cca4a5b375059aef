//! xstream - Transport Layer
//!
//! Everything that concerns a single TCP flow:
//!
//! - **Frame encoding/decoding**: [`Frame`], [`StreamFrame`] and control payloads
//! - **Record framing**: TLS-record-shaped wrapper, [`RecordReader`]
//! - **Connection state machine**: [`Connection`], [`ConnectionPool`]
//! - **RTT estimation**: [`RttEstimator`] (RFC 6298) and [`TtlEstimator`]
//! - **Async sockets**: tokio TCP reader/writer tasks (feature `net`)
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Session / Streams                │
//! ├─────────────────────────────────────────┤
//! │        Center (ordering, resend)        │
//! ├─────────────────────────────────────────┤
//! │         Transport Layer                 │  ← This module
//! │   frames, records, ping, expiry         │
//! ├─────────────────────────────────────────┤
//! │              TCP                        │
//! └─────────────────────────────────────────┘
//! ```

mod connection;
mod frame;
mod record;
#[cfg(feature = "net")]
mod socket;
mod timing;

pub use connection::*;
pub use frame::*;
pub use record::*;
#[cfg(feature = "net")]
pub use socket::*;
pub use timing::{constants as timing_constants, jitter, RttEstimator, TtlEstimator};
