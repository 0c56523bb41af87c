//! End-to-end broker tests over a real Unix socket.
//!
//! Each test starts a `BrokerServer` on a temporary path, then talks to it
//! the way the relay does: one request byte per socket, replies carried as
//! `SCM_RIGHTS` descriptors.

use std::io::{Read, Write};
use std::net::SocketAddr;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use socket2::Socket;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use nsrelay::broker::{BrokerClient, BrokerServer, SocketKind};
use nsrelay::relay::{connect_outbound, relay_streams};

async fn start_broker() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("socketd");

    let server = BrokerServer::new(&path);
    tokio::spawn(async move {
        let _ = server.run().await;
    });

    wait_for_socket(&path).await;
    (dir, path)
}

async fn wait_for_socket(path: &Path) {
    for _ in 0..200 {
        if path.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("broker socket never appeared at {}", path.display());
}

#[tokio::test(flavor = "multi_thread")]
async fn handed_out_stream_socket_connects() {
    let (_dir, path) = start_broker().await;
    let client = BrokerClient::connect(&path).unwrap();

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let fd = client.request(SocketKind::Stream).unwrap();
    let socket = Socket::from(fd);
    socket.connect(&socket2::SockAddr::from(addr)).unwrap();
    let mut stream: std::net::TcpStream = socket.into();

    let (mut accepted, _) = listener.accept().unwrap();
    stream.write_all(b"through the broker").unwrap();

    accepted
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut buf = [0u8; 18];
    accepted.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"through the broker");
}

#[tokio::test(flavor = "multi_thread")]
async fn handed_out_datagram_socket_sends() {
    let (_dir, path) = start_broker().await;
    let client = BrokerClient::connect(&path).unwrap();

    let receiver = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    receiver
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let addr = receiver.local_addr().unwrap();

    let fd = client.request(SocketKind::Datagram).unwrap();
    let socket: std::net::UdpSocket = Socket::from(fd).into();
    socket.send_to(b"dgram", addr).unwrap();

    let mut buf = [0u8; 16];
    let (n, _) = receiver.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"dgram");
}

#[tokio::test(flavor = "multi_thread")]
async fn one_connection_serves_many_requests() {
    let (_dir, path) = start_broker().await;
    let client = BrokerClient::connect(&path).unwrap();

    for _ in 0..4 {
        let fd = client.request(SocketKind::Stream).unwrap();
        assert_eq!(Socket::from(fd).r#type().unwrap(), socket2::Type::STREAM);
    }
    let fd = client.request(SocketKind::Datagram).unwrap();
    assert_eq!(Socket::from(fd).r#type().unwrap(), socket2::Type::DGRAM);
}

#[tokio::test(flavor = "multi_thread")]
async fn bad_request_byte_ends_only_that_connection() {
    let (_dir, path) = start_broker().await;

    let mut raw = UnixStream::connect(&path).unwrap();
    raw.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    raw.write_all(&[0x7f]).unwrap();

    // The server drops the connection without a reply.
    let mut buf = [0u8; 1];
    assert_eq!(raw.read(&mut buf).unwrap(), 0);

    // And keeps accepting new ones.
    let client = BrokerClient::connect(&path).unwrap();
    let fd = client.request(SocketKind::Stream).unwrap();
    assert_eq!(Socket::from(fd).r#type().unwrap(), socket2::Type::STREAM);
}

#[tokio::test(flavor = "multi_thread")]
async fn relays_through_broker_obtained_socket() {
    let (_dir, path) = start_broker().await;
    let broker = BrokerClient::connect(&path).unwrap();

    let relay_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dest_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let SocketAddr::V4(dest_addr) = dest_listener.local_addr().unwrap() else {
        unreachable!()
    };

    let mut client = TcpStream::connect(relay_listener.local_addr().unwrap())
        .await
        .unwrap();
    let (inbound, _) = relay_listener.accept().await.unwrap();

    let fd = broker.request(SocketKind::Stream).unwrap();
    let outbound = connect_outbound(fd, dest_addr).await.unwrap();
    let (mut dest, _) = dest_listener.accept().await.unwrap();

    let relay = tokio::spawn(relay_streams(inbound, outbound));

    client.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
    client.shutdown().await.unwrap();

    let mut request = [0u8; 18];
    dest.read_exact(&mut request).await.unwrap();
    assert_eq!(&request, b"GET / HTTP/1.0\r\n\r\n");

    dest.write_all(b"HTTP/1.0 200 OK\r\n\r\n").await.unwrap();
    dest.shutdown().await.unwrap();

    let mut reply = [0u8; 19];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"HTTP/1.0 200 OK\r\n\r\n");

    tokio::time::timeout(Duration::from_secs(5), relay)
        .await
        .expect("relay did not terminate")
        .unwrap()
        .unwrap();
}
