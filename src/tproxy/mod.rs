//! Kernel-facing socket plumbing for transparent relaying
//!
//! The relay depends on three Linux facilities, all consumed here and none
//! re-implemented:
//!
//! - `SO_ORIGINAL_DST` — recovers the pre-redirection destination of a TCP
//!   connection delivered by an iptables REDIRECT rule.
//! - `IP_TRANSPARENT` + `IP_RECVORIGDSTADDR` — lets the UDP listener stand
//!   in for arbitrary original destinations and receive each packet's
//!   original destination as ancillary data.
//! - `IP_TRANSPARENT` on short-lived reply sockets — lets a UDP reply be
//!   sent from the address the client originally targeted.
//!
//! All of this requires the process to run with `CAP_NET_ADMIN` and under
//! firewall rules that perform the actual redirection; setting those up is
//! out of scope.
//!
//! IPv4 only, matching the redirect facilities the relay is driven by.

mod socket;

pub use socket::{
    bind_redirect_listener, bind_transparent_udp, original_dst, recv_with_original_dst,
    reply_socket, IP_RECVORIGDSTADDR, IP_TRANSPARENT, SO_ORIGINAL_DST,
};
