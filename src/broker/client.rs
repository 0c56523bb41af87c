//! Relay-side broker client
//!
//! A single broker connection shared by all workers of a relay process.
//! Requests must be serialized because each response descriptor belongs to
//! the most recent request byte; the internal mutex provides that ordering.

use std::io::Write;
use std::os::unix::io::OwnedFd;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Mutex;

use tracing::debug;

use super::SocketKind;
use crate::error::BrokerError;
use crate::passfd;

/// Client for the socket broker
#[derive(Debug)]
pub struct BrokerClient {
    stream: Mutex<UnixStream>,
}

impl BrokerClient {
    /// Connect to the broker at its well-known socket path.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Connect` if the socket is absent or refuses.
    pub fn connect(path: &Path) -> Result<Self, BrokerError> {
        let stream = UnixStream::connect(path).map_err(|e| BrokerError::Connect {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        debug!("connected to broker at {}", path.display());
        Ok(Self {
            stream: Mutex::new(stream),
        })
    }

    /// Request a fresh socket of `kind` and take ownership of its descriptor.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::PeerClosed` if the broker hung up instead of
    /// answering, or a `PassFdError` on a malformed reply.
    pub fn request(&self, kind: SocketKind) -> Result<OwnedFd, BrokerError> {
        // A panicked holder cannot have corrupted the stream itself, so a
        // poisoned lock is still usable.
        let mut stream = self
            .stream
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        stream.write_all(&[kind.wire()])?;
        match passfd::recv_fd(&stream)? {
            Some(fd) => Ok(fd),
            None => Err(BrokerError::PeerClosed),
        }
    }
}
