//! Socket broker
//!
//! The broker insulates relay workers from creating outbound sockets
//! themselves, so that socket creation can happen under different ambient
//! permissions and namespace context than the relay loop.
//!
//! # Wire protocol
//!
//! Over a connection to the broker's well-known Unix-domain-socket path
//! (see [`crate::config::broker_socket_path`]):
//!
//! ```text
//! client → broker: 1 byte, requested socket type (1 = stream, 2 = datagram)
//! broker → client: 1 descriptor-bearing message (see crate::passfd)
//! ```
//!
//! The exchange repeats for as long as the client keeps the connection
//! open; a zero-byte read ends that connection's service loop. The type
//! codes are the Linux `SOCK_STREAM` / `SOCK_DGRAM` values.

mod client;
mod server;

pub use client::BrokerClient;
pub use server::BrokerServer;

/// Socket type requested from the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SocketKind {
    /// TCP outbound (`SOCK_STREAM`)
    Stream = 1,
    /// UDP outbound (`SOCK_DGRAM`)
    Datagram = 2,
}

impl SocketKind {
    /// Decode a request byte; `None` for anything that is not a known type.
    #[must_use]
    pub const fn from_wire(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Stream),
            2 => Some(Self::Datagram),
            _ => None,
        }
    }

    /// The request byte for this socket type.
    #[must_use]
    pub const fn wire(self) -> u8 {
        self as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_codes_match_linux_socket_types() {
        assert_eq!(SocketKind::Stream.wire(), libc::SOCK_STREAM as u8);
        assert_eq!(SocketKind::Datagram.wire(), libc::SOCK_DGRAM as u8);
    }

    #[test]
    fn test_wire_round_trip() {
        assert_eq!(SocketKind::from_wire(1), Some(SocketKind::Stream));
        assert_eq!(SocketKind::from_wire(2), Some(SocketKind::Datagram));
        assert_eq!(SocketKind::from_wire(0), None);
        assert_eq!(SocketKind::from_wire(3), None);
        assert_eq!(SocketKind::from_wire(255), None);
    }
}
