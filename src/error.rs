//! Error types for nsrelay
//!
//! Errors are grouped per subsystem. The policy is fail-fast: configuration
//! and protocol errors abort the owning process or worker, transient
//! would-block conditions are handled at the I/O call sites and never
//! surface here.

use std::io;
use std::net::SocketAddrV4;

use thiserror::Error;

/// Top-level error type for nsrelay
#[derive(Debug, Error)]
pub enum NsRelayError {
    /// Configuration errors (arguments, environment)
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Descriptor-passing protocol errors
    #[error("descriptor passing error: {0}")]
    PassFd(#[from] PassFdError),

    /// Socket broker errors
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Kernel redirect/transparent-socket errors
    #[error("tproxy error: {0}")]
    Tproxy(#[from] TproxyError),

    /// Relay loop errors
    #[error("relay error: {0}")]
    Relay(#[from] RelayError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Configuration-related errors
///
/// These are always reported before any socket is opened and exit the
/// process with status 1.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable is not set
    #[error("environment variable {name} is not set")]
    EnvMissing { name: &'static str },

    /// Port argument did not parse as a 16-bit port number
    #[error("bad port number '{value}'")]
    BadPort { value: String },

    /// Protocol argument was neither `tcp` nor `udp`
    #[error("protocol must be tcp or udp, not '{value}'")]
    UnknownProtocol { value: String },

    /// Wrong number of command-line arguments
    #[error("expected arguments: <tcp|udp> <port>")]
    BadArguments,
}

impl ConfigError {
    /// Config errors require user intervention; they are never recoverable.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Descriptor-passing channel errors
#[derive(Debug, Error)]
pub enum PassFdError {
    /// Message arrived without ancillary data
    #[error("no descriptor in message (ancillary data missing)")]
    MissingDescriptor,

    /// Ancillary data was not an SCM_RIGHTS message
    #[error("unexpected control message (level {level}, type {kind})")]
    WrongControlMessage { level: i32, kind: i32 },

    /// Control message buffer was truncated by the kernel
    #[error("control message truncated (MSG_CTRUNC)")]
    Truncated,

    /// Underlying sendmsg/recvmsg failure
    #[error("descriptor passing I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Socket broker errors
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Client sent a request byte that is not a known socket type
    #[error("bad socket type code {0:#04x}")]
    BadTypeCode(u8),

    /// Broker closed the connection instead of sending a descriptor
    #[error("broker closed the connection")]
    PeerClosed,

    /// Failed to create the requested socket
    #[error("failed to create socket: {0}")]
    SocketCreation(String),

    /// Failed to bind or listen on the broker socket path
    #[error("failed to bind broker socket at {path}: {reason}")]
    Bind { path: String, reason: String },

    /// Failed to connect to the broker socket path
    #[error("failed to connect to broker at {path}: {reason}")]
    Connect { path: String, reason: String },

    /// Descriptor transfer failed
    #[error(transparent)]
    PassFd(#[from] PassFdError),

    /// Underlying I/O failure
    #[error("broker I/O error: {0}")]
    Io(#[from] io::Error),
}

impl BrokerError {
    /// Protocol violations and connection errors end one connection only;
    /// setup failures take the daemon down.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::BadTypeCode(_) | Self::PeerClosed => true,
            Self::SocketCreation(_) | Self::Bind { .. } | Self::Connect { .. } => false,
            Self::PassFd(_) | Self::Io(_) => true,
        }
    }
}

/// Kernel-facing socket errors (redirect recovery, transparent sockets)
#[derive(Debug, Error)]
pub enum TproxyError {
    /// Failed to create a socket
    #[error("failed to create socket: {0}")]
    SocketCreation(String),

    /// Failed to set a socket option
    #[error("failed to set socket option {option}: {reason}")]
    SocketOption { option: &'static str, reason: String },

    /// Failed to bind to an address
    #[error("failed to bind to {addr}: {reason}")]
    Bind { addr: SocketAddrV4, reason: String },

    /// Failed to retrieve the original destination of a redirected flow
    #[error("failed to get original destination: {0}")]
    OriginalDst(String),

    /// IP_TRANSPARENT requires CAP_NET_ADMIN
    #[error("permission denied: transparent sockets require CAP_NET_ADMIN")]
    PermissionDenied,

    /// Underlying I/O failure
    #[error("tproxy I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TproxyError {
    /// Create a socket option error
    pub fn socket_option(option: &'static str, reason: impl Into<String>) -> Self {
        Self::SocketOption {
            option,
            reason: reason.into(),
        }
    }
}

/// Relay loop errors
#[derive(Debug, Error)]
pub enum RelayError {
    /// Accept failed on the relay listener
    #[error("accept failed: {0}")]
    Accept(String),

    /// Outbound connect to the recovered destination failed
    #[error("failed to connect to {addr}: {reason}")]
    Connect { addr: SocketAddrV4, reason: String },

    /// A readiness event named a session the table does not hold
    #[error("no session for ready descriptor (session table inconsistent)")]
    MissingSession,

    /// Underlying I/O failure in a relay worker
    #[error("relay I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Type alias for Result with NsRelayError
pub type Result<T> = std::result::Result<T, NsRelayError>;
