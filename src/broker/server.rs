//! Broker daemon: accept loop and per-connection service loop
//!
//! One task per accepted connection; connections are independent and share
//! no state. A protocol violation or I/O failure ends only the connection
//! it happened on - the accept loop and other connections keep running.
//! Bind/listen and accept failures are fatal to the daemon.

use std::io::Read;
use std::os::unix::io::AsFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use socket2::{Domain, Socket, Type};
use tokio::net::UnixListener;
use tracing::{debug, error, info};

use super::SocketKind;
use crate::error::BrokerError;
use crate::passfd;

/// Socket broker daemon
pub struct BrokerServer {
    socket_path: PathBuf,
}

impl BrokerServer {
    /// Create a broker that will listen at `socket_path`.
    #[must_use]
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    /// The path this broker listens on.
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the well-known socket path and serve connections forever.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Bind` if the socket path cannot be prepared or
    /// bound, and `BrokerError::Io` if `accept` fails. Per-connection
    /// failures are logged, not returned.
    pub async fn run(&self) -> Result<(), BrokerError> {
        let listener = self.bind()?;
        info!("broker listening on {}", self.socket_path.display());

        loop {
            let stream = match listener.accept().await {
                Ok((stream, _addr)) => stream,
                // An accept failure (fd exhaustion, listener gone) will not
                // heal by retrying; take the daemon down.
                Err(e) => {
                    error!("broker accept failed: {e}");
                    return Err(BrokerError::Io(e));
                }
            };

            let std_stream = match into_blocking(stream) {
                Ok(s) => s,
                Err(e) => {
                    error!("broker connection setup failed: {e}");
                    continue;
                }
            };

            // Descriptor transfer uses blocking sendmsg; keep each
            // connection's service loop off the async workers.
            tokio::task::spawn_blocking(move || {
                if let Err(e) = serve_connection(&std_stream) {
                    debug!("broker connection ended: {e}");
                }
            });
        }
    }

    fn bind(&self) -> Result<UnixListener, BrokerError> {
        let bind_err = |reason: String| BrokerError::Bind {
            path: self.socket_path.display().to_string(),
            reason,
        };

        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| bind_err(e.to_string()))?;
        }

        // A stale socket file from a previous run blocks bind.
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(|e| bind_err(e.to_string()))?;
        }

        UnixListener::bind(&self.socket_path).map_err(|e| bind_err(e.to_string()))
    }
}

/// Service loop for one broker connection: (type byte in) → (descriptor out),
/// until the peer closes or violates the protocol.
fn serve_connection(stream: &UnixStream) -> Result<(), BrokerError> {
    let mut reader = stream;
    loop {
        let mut code = [0u8; 1];
        let n = reader.read(&mut code)?;
        if n == 0 {
            debug!("broker client disconnected");
            return Ok(());
        }

        let kind = SocketKind::from_wire(code[0]).ok_or(BrokerError::BadTypeCode(code[0]))?;
        let sock = create_inet_socket(kind)?;
        passfd::send_fd(stream, sock.as_fd())?;
        // `sock` drops here: the broker keeps no copy of the descriptor.
    }
}

/// Manufacture a fresh Internet-family socket of the requested type.
fn create_inet_socket(kind: SocketKind) -> Result<Socket, BrokerError> {
    let ty = match kind {
        SocketKind::Stream => Type::STREAM,
        SocketKind::Datagram => Type::DGRAM,
    };

    Socket::new(Domain::IPV4, ty, None).map_err(|e| BrokerError::SocketCreation(e.to_string()))
}

fn into_blocking(stream: tokio::net::UnixStream) -> std::io::Result<UnixStream> {
    let std_stream = stream.into_std()?;
    std_stream.set_nonblocking(false)?;
    Ok(std_stream)
}
