//! xstream - Client Library
//!
//! High-level API for xstream clients: one session over a pool of TCP
//! connections, with fork connections, redial and session persistence.

#[allow(clippy::module_inception)]
mod client;

pub use client::*;
