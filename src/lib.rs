//! nsrelay: transparent traffic relay for user-namespace containers
//!
//! A namespaced process cannot create Internet sockets of its own; a broker
//! daemon (`socketd`) on the host side creates them on request and hands
//! them over a Unix socket via `SCM_RIGHTS`. Inside the namespace, firewall
//! rules redirect outbound TCP and UDP to loopback relay ports where
//! `nsrelay` recovers each flow's original destination, obtains an outbound
//! socket from the broker, and relays bytes transparently in both
//! directions.
//!
//! The library is split along those lines:
//!
//! - [`passfd`]: `SCM_RIGHTS` descriptor passing over Unix stream sockets.
//! - [`broker`]: the socket broker daemon and its client.
//! - [`tproxy`]: the kernel redirect plumbing (original-destination
//!   recovery, transparent binds, spoofed-source reply sockets).
//! - [`relay`]: the TCP state machine and the UDP pseudo-session engine.
//! - [`config`]: environment contract and argument parsing helpers.
//! - [`error`]: structured error types for every subsystem.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod broker;
pub mod config;
pub mod error;
pub mod passfd;
pub mod relay;
pub mod tproxy;

pub use broker::{BrokerClient, BrokerServer, SocketKind};
pub use config::{Protocol, RelayEnv};
pub use error::NsRelayError;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
