//! xstream - Center
//!
//! Ordered, multi-path reliable delivery for one session:
//!
//! - **Dispatch**: index assignment, pending/in-flight queues, connection choice
//! - **Reordering**: gap buffer, duplicate suppression, selective ACK, RESEND
//! - **Timing**: TTL stamps, retransmission timeout, index epoch reset
//! - **Scheduling**: priority list of streams that want to write

#[allow(clippy::module_inception)]
mod center;
mod reorder;
mod scheduler;

pub use center::*;
pub use reorder::*;
pub use scheduler::*;
