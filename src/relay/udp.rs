//! Transparent UDP relay
//!
//! A single task owns the transparent listener and the pseudo-session
//! table. Each loop iteration waits for exactly one readable socket (the
//! listener first, then the session sockets in slot order) and handles one
//! datagram.
//!
//! Inbound datagrams are forwarded through the client's session socket to
//! the original destination recorded in the packet's ancillary data.
//! Replies arriving on a session socket are sent back through a short-lived
//! spoofed-source socket bound to the address the client originally talked
//! to, so the client sees the answer come from where it sent the question.
//!
//! Datagram delivery is best-effort end to end: a failed forward or reply
//! send is logged and the datagram dropped. Reply-socket setup failures
//! are fatal - they mean the capability or sysctl configuration is wrong
//! and every subsequent reply would fail the same way.

use std::future::poll_fn;
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::sync::Arc;
use std::task::Poll;

use socket2::Socket;
use tokio::io::Interest;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use super::session::SessionTable;
use crate::broker::{BrokerClient, SocketKind};
use crate::error::{NsRelayError, RelayError};
use crate::tproxy;

/// One datagram is relayed whole or not at all.
const DATAGRAM_BUFFER_SIZE: usize = 4096;

/// Which socket a loop iteration should service.
#[derive(Debug, PartialEq, Eq)]
enum UdpEvent {
    /// The transparent listener has a client datagram.
    Inbound,
    /// The session socket in this slot has a reply.
    Session(usize),
}

/// Relay transparently redirected UDP on loopback `port`.
///
/// Runs until the listener cannot be serviced; per-datagram failures are
/// logged and dropped.
///
/// # Errors
///
/// Returns an error if the listener cannot be set up or readiness polling
/// fails.
pub async fn serve_udp(port: u16, broker: Arc<BrokerClient>) -> Result<(), NsRelayError> {
    let listener = UdpSocket::from_std(tproxy::bind_transparent_udp(port)?)?;
    info!("udp relay listening on 127.0.0.1:{port}");

    let mut table = SessionTable::new();
    let mut buf = [0u8; DATAGRAM_BUFFER_SIZE];

    loop {
        match next_event(&listener, &table).await? {
            UdpEvent::Inbound => handle_inbound(&listener, &mut table, &broker, &mut buf).await?,
            UdpEvent::Session(idx) => handle_session_reply(&mut table, idx, &mut buf).await?,
        }
    }
}

/// Wait for one readable socket. The listener wins over any session so a
/// burst of replies cannot starve new clients.
async fn next_event(listener: &UdpSocket, table: &SessionTable) -> io::Result<UdpEvent> {
    poll_fn(|cx| {
        if listener.poll_recv_ready(cx)?.is_ready() {
            return Poll::Ready(Ok(UdpEvent::Inbound));
        }
        for (idx, session) in table.iter() {
            if session.socket.poll_recv_ready(cx)?.is_ready() {
                return Poll::Ready(Ok(UdpEvent::Session(idx)));
            }
        }
        Poll::Pending
    })
    .await
}

/// Service one client datagram: find or create its pseudo-session, then
/// forward to the original destination.
async fn handle_inbound(
    listener: &UdpSocket,
    table: &mut SessionTable,
    broker: &BrokerClient,
    buf: &mut [u8],
) -> Result<(), NsRelayError> {
    let raw = listener.as_raw_fd();
    let (len, client, original_dst) =
        match listener.try_io(Interest::READABLE, || {
            tproxy::recv_with_original_dst(raw, buf)
        }) {
            Ok(received) => received,
            // Readiness was stale; go back to waiting.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(RelayError::Io(e).into()),
        };

    let idx = match table.lookup(client) {
        Some(idx) => {
            table.touch(idx);
            idx
        }
        None => {
            let fd = broker.request(SocketKind::Datagram)?;
            let (idx, evicted) = table.insert(client, datagram_from_fd(fd)?);
            if let Some(evicted) = evicted {
                debug!("evicted udp pseudo-session for {}", evicted.client);
            }
            debug!("new udp pseudo-session for {client} in slot {idx}");
            idx
        }
    };

    if let Some(session) = table.get(idx) {
        if let Err(e) = session
            .socket
            .send_to(&buf[..len], SocketAddr::V4(original_dst))
            .await
        {
            warn!("udp forward from {client} to {original_dst} failed: {e}");
        }
    }
    Ok(())
}

/// Service one reply on a session socket and send it back to the client
/// from the address it originally targeted.
async fn handle_session_reply(
    table: &mut SessionTable,
    idx: usize,
    buf: &mut [u8],
) -> Result<(), NsRelayError> {
    table.touch(idx);
    let session = table.get(idx).ok_or(RelayError::MissingSession)?;

    let (len, from) = match session.socket.try_recv_from(buf) {
        Ok(received) => received,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
        Err(e) => return Err(RelayError::Io(e).into()),
    };
    let SocketAddr::V4(from) = from else {
        return Ok(());
    };

    send_reply(from, session.client, &buf[..len]).await
}

/// Wrap a broker-obtained datagram descriptor for the async loop.
fn datagram_from_fd(fd: OwnedFd) -> Result<UdpSocket, NsRelayError> {
    let socket = Socket::from(fd);
    socket.set_nonblocking(true).map_err(RelayError::Io)?;
    Ok(UdpSocket::from_std(socket.into())?)
}

/// Send one reply with a spoofed source. The socket lives for exactly one
/// datagram; closing it releases the bound address immediately.
///
/// Setup failures are returned: a reply socket that cannot be created or
/// bound (missing capability, non-local bind disabled) will fail for every
/// datagram, so the relay must not keep running. A failed send is logged
/// and the datagram dropped.
async fn send_reply(
    from: SocketAddrV4,
    client: SocketAddrV4,
    payload: &[u8],
) -> Result<(), NsRelayError> {
    let socket = UdpSocket::from_std(tproxy::reply_socket(from)?.into())?;
    if let Err(e) = socket.send_to(payload, SocketAddr::V4(client)).await {
        warn!("udp reply from {from} to {client} failed: {e}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    async fn sock() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    fn v4(addr: SocketAddr) -> SocketAddrV4 {
        match addr {
            SocketAddr::V4(a) => a,
            SocketAddr::V6(_) => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_next_event_reports_ready_session() {
        let listener = sock().await;
        let mut table = SessionTable::new();

        let session_socket = sock().await;
        let session_addr = session_socket.local_addr().unwrap();
        table.insert(SocketAddrV4::new([127, 0, 0, 1].into(), 40000), session_socket);

        let sender = sock().await;
        sender.send_to(b"reply", session_addr).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), next_event(&listener, &table))
            .await
            .expect("no event")
            .unwrap();
        assert_eq!(event, UdpEvent::Session(0));
    }

    #[tokio::test]
    async fn test_next_event_prefers_inbound() {
        let listener = sock().await;
        let listener_addr = listener.local_addr().unwrap();
        let mut table = SessionTable::new();

        let session_socket = sock().await;
        let session_addr = session_socket.local_addr().unwrap();
        table.insert(SocketAddrV4::new([127, 0, 0, 1].into(), 40001), session_socket);

        let sender = sock().await;
        sender.send_to(b"reply", session_addr).await.unwrap();
        sender.send_to(b"inbound", listener_addr).await.unwrap();

        // Give the datagrams a moment to land before polling.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let event = tokio::time::timeout(Duration::from_secs(5), next_event(&listener, &table))
            .await
            .expect("no event")
            .unwrap();
        assert_eq!(event, UdpEvent::Inbound);
    }

    #[tokio::test]
    async fn test_datagram_from_fd_is_usable() {
        let std_socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = std_socket.local_addr().unwrap();

        let socket = datagram_from_fd(OwnedFd::from(std_socket)).unwrap();
        assert_eq!(socket.local_addr().unwrap(), addr);

        let peer = sock().await;
        peer.send_to(b"ping", addr).await.unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = socket.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(v4(from), v4(peer.local_addr().unwrap()));
    }

    #[tokio::test]
    async fn test_session_reply_on_missing_slot() {
        let mut table = SessionTable::new();
        let mut buf = [0u8; DATAGRAM_BUFFER_SIZE];

        let err = handle_session_reply(&mut table, 3, &mut buf)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            NsRelayError::Relay(RelayError::MissingSession)
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_inbound_creates_session_and_forwards() {
        // Needs CAP_NET_ADMIN for the transparent listener.
        let listener = match tproxy::bind_transparent_udp(0) {
            Ok(socket) => UdpSocket::from_std(socket).unwrap(),
            Err(crate::error::TproxyError::PermissionDenied) => return,
            Err(e) => panic!("unexpected error: {e}"),
        };
        let listen_addr = v4(listener.local_addr().unwrap());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("socketd");
        let server = crate::broker::BrokerServer::new(&path);
        tokio::spawn(async move {
            let _ = server.run().await;
        });
        for _ in 0..200 {
            if path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let broker = BrokerClient::connect(&path).unwrap();

        let client = sock().await;
        client.send_to(b"hello", listen_addr).await.unwrap();

        let mut table = SessionTable::new();
        let event = tokio::time::timeout(Duration::from_secs(5), next_event(&listener, &table))
            .await
            .expect("client datagram never arrived")
            .unwrap();
        assert_eq!(event, UdpEvent::Inbound);

        let mut buf = [0u8; DATAGRAM_BUFFER_SIZE];
        handle_inbound(&listener, &mut table, &broker, &mut buf)
            .await
            .unwrap();

        assert_eq!(table.len(), 1);
        let session = table.get(0).unwrap();
        assert_eq!(session.client, v4(client.local_addr().unwrap()));

        // With no redirect rule in play the recovered destination is the
        // listener's own address, so the forwarded datagram loops straight
        // back to it.
        let mut forwarded = [0u8; 16];
        let (n, from) =
            tokio::time::timeout(Duration::from_secs(5), listener.recv_from(&mut forwarded))
                .await
                .expect("forward never arrived")
                .unwrap();
        assert_eq!(&forwarded[..n], b"hello");
        assert_eq!(
            v4(from).port(),
            v4(session.socket.local_addr().unwrap()).port()
        );
    }

    #[tokio::test]
    async fn test_reply_socket_setup_failure_surfaces() {
        let mut table = SessionTable::new();
        let session_socket = sock().await;
        let session_addr = session_socket.local_addr().unwrap();
        table.insert(SocketAddrV4::new([127, 0, 0, 1].into(), 45000), session_socket);

        let sender = sock().await;
        sender.send_to(b"reply", session_addr).await.unwrap();

        // Wait until the reply is actually readable so the handler reaches
        // the reply-socket path.
        let idle_listener = sock().await;
        let event =
            tokio::time::timeout(Duration::from_secs(5), next_event(&idle_listener, &table))
                .await
                .expect("reply never arrived")
                .unwrap();
        assert_eq!(event, UdpEvent::Session(0));

        // The spoofed bind targets the sender's own bound address: EPERM
        // unprivileged, EADDRINUSE with the capability. A setup problem
        // must surface as an error, not a dropped datagram.
        let mut buf = [0u8; DATAGRAM_BUFFER_SIZE];
        let err = handle_session_reply(&mut table, 0, &mut buf)
            .await
            .unwrap_err();
        assert!(matches!(err, NsRelayError::Tproxy(_)));
    }
}
