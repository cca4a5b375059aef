//! xstream - Server Library
//!
//! High-level API for xstream servers: accept loop, hello routing and the
//! session table.

#[allow(clippy::module_inception)]
mod server;
mod session;

pub use server::*;
pub use session::*;
