//! Socket construction and original-destination recovery

use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::{AsRawFd, RawFd};

use socket2::{Domain, Socket, Type};
use tracing::debug;

use crate::error::TproxyError;

/// Linux kernel constant: `IP_TRANSPARENT` socket option (`SOL_IP` level).
/// Allows binding to non-local addresses and receiving redirected traffic.
pub const IP_TRANSPARENT: libc::c_int = 19;

/// Linux kernel constant: `SO_ORIGINAL_DST` (`SOL_IP` level).
/// Retrieves the original destination of a REDIRECTed TCP connection.
pub const SO_ORIGINAL_DST: libc::c_int = 80;

/// Linux kernel constant: `IP_RECVORIGDSTADDR` (`SOL_IP` level).
/// Delivers each UDP packet's original destination in ancillary data.
pub const IP_RECVORIGDSTADDR: libc::c_int = 20;

/// Hop limit for spoofed-source reply sockets.
const REPLY_TTL: u32 = 255;

/// Control message buffer size (enough for a `sockaddr_in`)
const CMSG_BUFFER_SIZE: usize = 64;

/// Bind the loopback listening socket for the TCP relay.
///
/// A plain stream socket with `SO_REUSEADDR`; the firewall layer is
/// responsible for redirecting intercepted traffic to this port. The socket
/// is returned non-blocking, ready for `tokio::net::TcpListener::from_std`.
///
/// # Errors
///
/// Returns `TproxyError` if socket creation, binding, or listen fails.
pub fn bind_redirect_listener(port: u16) -> Result<std::net::TcpListener, TproxyError> {
    let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, port);

    let socket = Socket::new(Domain::IPV4, Type::STREAM, None)
        .map_err(|e| TproxyError::SocketCreation(e.to_string()))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| TproxyError::socket_option("SO_REUSEADDR", e.to_string()))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| TproxyError::socket_option("O_NONBLOCK", e.to_string()))?;

    socket
        .bind(&SocketAddr::V4(addr).into())
        .map_err(|e| TproxyError::Bind {
            addr,
            reason: e.to_string(),
        })?;
    socket
        .listen(libc::SOMAXCONN)
        .map_err(|e| TproxyError::socket_option("listen", e.to_string()))?;

    debug!("redirect listener bound to {addr}");
    Ok(socket.into())
}

/// Bind the transparent datagram socket for the UDP relay.
///
/// `IP_TRANSPARENT` lets the socket appear as the original destination to
/// downstream sockets; `IP_RECVORIGDSTADDR` attaches each packet's original
/// destination as ancillary metadata. Returned non-blocking.
///
/// # Errors
///
/// Returns `TproxyError::PermissionDenied` without `CAP_NET_ADMIN`.
pub fn bind_transparent_udp(port: u16) -> Result<std::net::UdpSocket, TproxyError> {
    let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, port);

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, None)
        .map_err(|e| TproxyError::SocketCreation(e.to_string()))?;
    set_ip_option(&socket, IP_TRANSPARENT, "IP_TRANSPARENT")?;
    set_ip_option(&socket, IP_RECVORIGDSTADDR, "IP_RECVORIGDSTADDR")?;
    socket
        .set_reuse_address(true)
        .map_err(|e| TproxyError::socket_option("SO_REUSEADDR", e.to_string()))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| TproxyError::socket_option("O_NONBLOCK", e.to_string()))?;

    socket
        .bind(&SocketAddr::V4(addr).into())
        .map_err(|e| TproxyError::Bind {
            addr,
            reason: e.to_string(),
        })?;

    debug!("transparent udp socket bound to {addr}");
    Ok(socket.into())
}

/// Build a short-lived reply socket presenting `src` as its source address.
///
/// `IP_TRANSPARENT` allows binding to the non-local `src` (the address the
/// client originally targeted); the hop limit is pinned to 255. The caller
/// sends one datagram and drops the socket.
///
/// # Errors
///
/// Returns `TproxyError::PermissionDenied` without `CAP_NET_ADMIN`, or a
/// bind error if `ip_nonlocal_bind` is disabled.
pub fn reply_socket(src: SocketAddrV4) -> Result<Socket, TproxyError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, None)
        .map_err(|e| TproxyError::SocketCreation(e.to_string()))?;
    set_ip_option(&socket, IP_TRANSPARENT, "IP_TRANSPARENT")?;
    socket
        .set_reuse_address(true)
        .map_err(|e| TproxyError::socket_option("SO_REUSEADDR", e.to_string()))?;
    socket
        .set_ttl(REPLY_TTL)
        .map_err(|e| TproxyError::socket_option("IP_TTL", e.to_string()))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| TproxyError::socket_option("O_NONBLOCK", e.to_string()))?;

    socket
        .bind(&SocketAddr::V4(src).into())
        .map_err(|e| TproxyError::Bind {
            addr: src,
            reason: e.to_string(),
        })?;

    Ok(socket)
}

/// Set a boolean `SOL_IP` option, mapping `EPERM` to `PermissionDenied`.
#[allow(clippy::cast_possible_truncation)] // socklen_t is always u32
fn set_ip_option(
    socket: &Socket,
    option: libc::c_int,
    name: &'static str,
) -> Result<(), TproxyError> {
    let fd = socket.as_raw_fd();
    let one: libc::c_int = 1;

    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_IP,
            option,
            std::ptr::addr_of!(one).cast::<libc::c_void>(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };

    if ret != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EPERM) {
            return Err(TproxyError::PermissionDenied);
        }
        return Err(TproxyError::socket_option(name, err.to_string()));
    }

    Ok(())
}

/// Recover the original destination of a redirected TCP connection.
///
/// Only succeeds when the connection was actually redirected; on a direct
/// connection the kernel has no redirect metadata for the socket.
///
/// # Errors
///
/// Returns `TproxyError::OriginalDst` if the lookup fails.
#[allow(clippy::cast_possible_truncation)] // socklen_t is always u32
pub fn original_dst(fd: RawFd) -> Result<SocketAddrV4, TproxyError> {
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len: libc::socklen_t = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IP,
            SO_ORIGINAL_DST,
            std::ptr::addr_of_mut!(addr).cast::<libc::c_void>(),
            &mut len,
        )
    };

    if ret != 0 {
        let err = io::Error::last_os_error();
        return Err(TproxyError::OriginalDst(format!(
            "getsockopt SO_ORIGINAL_DST failed (not a redirected connection?): {err}"
        )));
    }

    let port = u16::from_be(addr.sin_port);
    let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
    Ok(SocketAddrV4::new(ip, port))
}

/// Receive one datagram plus the original destination from its ancillary
/// data.
///
/// Returns `(bytes_received, client_addr, original_dst)`. A `WouldBlock`
/// error is the normal "nothing there yet" signal on the non-blocking
/// listener; a missing or truncated control message is an error, since it
/// means the packet did not come through the redirect path.
#[allow(clippy::cast_possible_truncation)] // socklen_t is always u32
#[allow(clippy::cast_sign_loss)] // n is checked non-negative
#[allow(clippy::cast_ptr_alignment)] // CMSG_DATA alignment is handled by the kernel
pub fn recv_with_original_dst(
    fd: RawFd,
    buf: &mut [u8],
) -> io::Result<(usize, SocketAddrV4, SocketAddrV4)> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast::<libc::c_void>(),
        iov_len: buf.len(),
    };

    let mut src_addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut cmsg_buf = [0u8; CMSG_BUFFER_SIZE];

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = std::ptr::addr_of_mut!(src_addr).cast::<libc::c_void>();
    msg.msg_namelen = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast::<libc::c_void>();
    msg.msg_controllen = CMSG_BUFFER_SIZE as _;

    let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    if (msg.msg_flags & libc::MSG_CTRUNC) != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "control message truncated (MSG_CTRUNC)",
        ));
    }

    let src_port = u16::from_be(src_addr.sin_port);
    let src_ip = Ipv4Addr::from(u32::from_be(src_addr.sin_addr.s_addr));
    let src = SocketAddrV4::new(src_ip, src_port);

    let mut original_dst: Option<SocketAddrV4> = None;
    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    while !cmsg.is_null() {
        let cmsg_ref = unsafe { &*cmsg };
        if cmsg_ref.cmsg_level == libc::SOL_IP && cmsg_ref.cmsg_type == IP_RECVORIGDSTADDR {
            let addr_ptr = unsafe { libc::CMSG_DATA(cmsg) }.cast::<libc::sockaddr_in>();
            let addr = unsafe { &*addr_ptr };

            let dst_port = u16::from_be(addr.sin_port);
            let dst_ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            original_dst = Some(SocketAddrV4::new(dst_ip, dst_port));
            break;
        }
        cmsg = unsafe { libc::CMSG_NXTHDR(&msg, cmsg) };
    }

    let dst = original_dst.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "original destination not found in ancillary data",
        )
    })?;

    Ok((n as usize, src, dst))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(IP_TRANSPARENT, 19);
        assert_eq!(SO_ORIGINAL_DST, 80);
        assert_eq!(IP_RECVORIGDSTADDR, 20);
    }

    #[test]
    fn test_redirect_listener_binds_loopback() {
        let listener = bind_redirect_listener(0).unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn test_original_dst_fails_on_direct_connection() {
        // A connection that never went through the redirect layer has no
        // redirect metadata, so recovery must fail.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();

        let result = original_dst(accepted.as_raw_fd());
        assert!(matches!(result, Err(TproxyError::OriginalDst(_))));
        drop(client);
    }

    #[test]
    fn test_transparent_udp_without_cap() {
        // Succeeds with CAP_NET_ADMIN, PermissionDenied without.
        match bind_transparent_udp(0) {
            Ok(socket) => {
                assert!(socket.local_addr().unwrap().ip().is_loopback());
            }
            Err(TproxyError::PermissionDenied) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn test_reply_socket_without_cap() {
        let src = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 0);
        match reply_socket(src) {
            Ok(socket) => {
                assert_eq!(socket.ttl().unwrap(), REPLY_TTL);
            }
            Err(TproxyError::PermissionDenied) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
}
