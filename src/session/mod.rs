//! xstream - Session Layer
//!
//! - **Streams**: ordered byte streams multiplexed over one center
//! - **Control**: session confirmation and key exchange on stream 0
//! - **Session**: connections, streams, timers and the deferred work queue
//! - **Persistence**: client session records for restart
//! - **Driver**: tokio task owning a session (feature `net`)

mod control;
mod persist;
#[cfg(feature = "net")]
mod runner;
#[allow(clippy::module_inception)]
mod session;
mod stream;

pub use control::*;
pub use persist::*;
#[cfg(feature = "net")]
pub use runner::*;
pub use session::*;
pub use stream::*;
