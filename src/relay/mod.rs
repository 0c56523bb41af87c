//! Relay engines
//!
//! - [`serve_tcp`]: accepts redirected TCP connections and relays each one
//!   through the two-buffer readiness state machine in [`relay_streams`].
//! - [`serve_udp`]: single-loop datagram relay over a bounded
//!   least-recently-used [`SessionTable`] of pseudo-sessions.
//!
//! Both obtain every outbound socket from the broker; neither creates
//! Internet sockets itself.

mod session;
mod tcp;
mod udp;

pub use session::{SessionTable, UdpSession, TABLE_CAPACITY};
pub use tcp::{connect_outbound, relay_streams, serve_tcp};
pub use udp::serve_udp;

/// Per-direction buffer capacity of the TCP relay state machine
pub const RELAY_BUFFER_SIZE: usize = 4096;
