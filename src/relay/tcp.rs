//! Redirected-TCP relay
//!
//! One worker task per accepted connection. The worker recovers the
//! original destination from the redirect metadata on the accepted socket,
//! connects a broker-obtained outbound socket to it, and runs the relay
//! state machine over the two streams until both directions are exhausted.
//!
//! # Relay state machine
//!
//! Each stream carries two interest flags, read and write, starting as
//! `{read: on, write: off}`. Each direction has one buffer with a write
//! cursor (unflushed start) and a fill cursor (end):
//!
//! - read-ready: receive at the fill cursor, clear read interest; a
//!   non-zero count arms write interest on the peer, a zero count is
//!   end-of-input and leaves read interest cleared for good.
//! - write-ready: send from the write cursor; once drained, reset the
//!   cursors, clear write interest, and re-arm read interest on the peer
//!   (unless the peer already reached end-of-input).
//!
//! One readiness event is handled per iteration, so bytes are forwarded in
//! the order received per direction. The worker ends when both interest
//! masks are empty; any other I/O error is fatal to the worker alone.

use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::sync::Arc;

use socket2::Socket;
use tokio::io::{Interest, Ready};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, error, info};

use super::RELAY_BUFFER_SIZE;
use crate::broker::{BrokerClient, SocketKind};
use crate::error::{NsRelayError, RelayError};
use crate::tproxy;

/// Accept redirected TCP connections on loopback `port` and relay each one
/// to its recovered original destination.
///
/// Runs until the listener fails; per-worker failures are logged and end
/// only that worker.
///
/// # Errors
///
/// Returns an error if the listener cannot be set up or `accept` fails.
pub async fn serve_tcp(port: u16, broker: Arc<BrokerClient>) -> Result<(), NsRelayError> {
    let listener = TcpListener::from_std(tproxy::bind_redirect_listener(port)?)?;
    info!("tcp relay listening on 127.0.0.1:{port}");

    loop {
        let (inbound, client_addr) = listener
            .accept()
            .await
            .map_err(|e| RelayError::Accept(e.to_string()))?;

        let broker = Arc::clone(&broker);
        tokio::spawn(async move {
            if let Err(e) = relay_connection(inbound, broker).await {
                error!("relay worker for {client_addr} failed: {e}");
            }
        });
    }
}

/// One TCP relay worker: destination recovery, outbound setup, relay loop.
async fn relay_connection(
    inbound: TcpStream,
    broker: Arc<BrokerClient>,
) -> Result<(), NsRelayError> {
    let dst = tproxy::original_dst(inbound.as_raw_fd())?;
    let fd = broker.request(SocketKind::Stream)?;
    let outbound = connect_outbound(fd, dst).await?;

    debug!("relaying to original destination {dst}");
    relay_streams(inbound, outbound).await?;
    Ok(())
}

/// Connect a broker-obtained stream descriptor to the recovered destination.
///
/// # Errors
///
/// Returns `RelayError::Connect` if the connect fails.
pub async fn connect_outbound(fd: OwnedFd, dst: SocketAddrV4) -> Result<TcpStream, RelayError> {
    let socket = Socket::from(fd);
    socket.set_nonblocking(true).map_err(RelayError::Io)?;

    let socket = TcpSocket::from_std_stream(socket.into());
    socket
        .connect(SocketAddr::V4(dst))
        .await
        .map_err(|e| RelayError::Connect {
            addr: dst,
            reason: e.to_string(),
        })
}

/// One direction's buffer: write cursor `start`, fill cursor `end`.
struct DirectionBuffer {
    buf: [u8; RELAY_BUFFER_SIZE],
    start: usize,
    end: usize,
}

impl DirectionBuffer {
    fn new() -> Self {
        Self {
            buf: [0; RELAY_BUFFER_SIZE],
            start: 0,
            end: 0,
        }
    }

    /// Remaining capacity behind the fill cursor.
    fn space(&mut self) -> &mut [u8] {
        &mut self.buf[self.end..]
    }

    /// Bytes received but not yet flushed.
    fn unflushed(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    fn advance_fill(&mut self, n: usize) {
        self.end += n;
    }

    /// Advance the write cursor; resets both cursors and returns true once
    /// the buffer is fully drained.
    fn advance_flush(&mut self, n: usize) -> bool {
        self.start += n;
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
            true
        } else {
            false
        }
    }
}

/// Interest flags of one descriptor
#[derive(Clone, Copy)]
struct InterestFlags {
    read: bool,
    write: bool,
}

impl InterestFlags {
    const fn armed(self) -> bool {
        self.read || self.write
    }

    fn interest(self) -> Interest {
        match (self.read, self.write) {
            (true, true) => Interest::READABLE | Interest::WRITABLE,
            (true, false) => Interest::READABLE,
            (false, true) => Interest::WRITABLE,
            // select! evaluates the expression even for a disabled branch;
            // a disarmed mask is never polled.
            (false, false) => Interest::READABLE,
        }
    }
}

enum Event {
    A(Ready),
    B(Ready),
}

/// Relay bytes between `a` and `b` until both directions have reached
/// end-of-input and been fully flushed.
///
/// End-of-input on one stream does not terminate the other direction; the
/// relay mirrors what each endpoint does with its write side and nothing
/// more.
///
/// # Errors
///
/// Returns the first unrecoverable I/O error; would-block conditions are
/// absorbed by re-polling readiness.
pub async fn relay_streams(a: TcpStream, b: TcpStream) -> Result<(), RelayError> {
    let mut a_to_b = DirectionBuffer::new();
    let mut b_to_a = DirectionBuffer::new();
    let mut a_flags = InterestFlags {
        read: true,
        write: false,
    };
    let mut b_flags = a_flags;
    let mut a_eof = false;
    let mut b_eof = false;

    while a_flags.armed() || b_flags.armed() {
        let event = tokio::select! {
            ready = a.ready(a_flags.interest()), if a_flags.armed() => Event::A(ready?),
            ready = b.ready(b_flags.interest()), if b_flags.armed() => Event::B(ready?),
        };

        match event {
            Event::A(ready) => advance_side(
                &a,
                ready,
                &mut a_flags,
                &mut b_flags,
                &mut a_to_b,
                &mut b_to_a,
                &mut a_eof,
                b_eof,
            )?,
            Event::B(ready) => advance_side(
                &b,
                ready,
                &mut b_flags,
                &mut a_flags,
                &mut b_to_a,
                &mut a_to_b,
                &mut b_eof,
                a_eof,
            )?,
        }
    }

    Ok(())
}

/// Advance one descriptor's state for a single readiness event.
///
/// `inbox` holds bytes read from `stream` (flowing toward the peer);
/// `outbox` holds bytes from the peer waiting to be written to `stream`.
#[allow(clippy::too_many_arguments)]
fn advance_side(
    stream: &TcpStream,
    ready: Ready,
    flags: &mut InterestFlags,
    peer_flags: &mut InterestFlags,
    inbox: &mut DirectionBuffer,
    outbox: &mut DirectionBuffer,
    eof: &mut bool,
    peer_eof: bool,
) -> Result<(), RelayError> {
    if ready.is_readable() && flags.read {
        match stream.try_read(inbox.space()) {
            Ok(0) => {
                // End-of-input: read interest stays cleared for good.
                *eof = true;
                flags.read = false;
            }
            Ok(n) => {
                inbox.advance_fill(n);
                flags.read = false;
                peer_flags.write = true;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(RelayError::Io(e)),
        }
    } else if ready.is_writable() && flags.write {
        match stream.try_write(outbox.unflushed()) {
            Ok(n) => {
                if outbox.advance_flush(n) {
                    flags.write = false;
                    if !peer_eof {
                        peer_flags.read = true;
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(RelayError::Io(e)),
        }
    }

    Ok(())
}
