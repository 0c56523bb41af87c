//! Descriptor-passing channel
//!
//! One open file descriptor per message over a connected Unix-domain socket,
//! carried as SCM_RIGHTS ancillary data alongside a single placeholder
//! payload byte. The kernel duplicates the descriptor into the receiving
//! process; the received [`OwnedFd`] is the receiver's sole handle and is
//! closed on drop on every exit path.
//!
//! The channel never interprets the descriptor's contents - the caller
//! assigns meaning.

use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::ptr;

use crate::error::PassFdError;

/// Transmit `fd` over `stream` as ancillary data plus one payload byte.
///
/// # Errors
///
/// Returns `PassFdError::Io` if the underlying `sendmsg` fails.
#[allow(clippy::cast_possible_truncation)] // CMSG sizes fit in u32
pub fn send_fd(stream: &UnixStream, fd: BorrowedFd<'_>) -> Result<(), PassFdError> {
    let payload = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };

    // CMSG_SPACE includes the cmsghdr header overhead.
    let fd_size = mem::size_of::<libc::c_int>();
    let cmsg_space = unsafe { libc::CMSG_SPACE(fd_size as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast::<libc::c_void>();
    msg.msg_controllen = cmsg_space as _;

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(fd_size as u32) as _;
        ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<libc::c_int>(), fd.as_raw_fd());
    }

    let n = unsafe { libc::sendmsg(stream.as_raw_fd(), &msg, 0) };
    if n < 0 {
        return Err(PassFdError::Io(io::Error::last_os_error()));
    }

    Ok(())
}

/// Block until one message arrives on `stream` and return its descriptor.
///
/// Returns `Ok(None)` on a zero-byte read, which callers must treat as
/// peer-closed.
///
/// # Errors
///
/// Returns a protocol error if the ancillary data is absent, truncated, or
/// not an SCM_RIGHTS message, and `PassFdError::Io` if `recvmsg` fails.
#[allow(clippy::cast_possible_truncation)] // CMSG sizes fit in u32
pub fn recv_fd(stream: &UnixStream) -> Result<Option<OwnedFd>, PassFdError> {
    let mut payload = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr().cast::<libc::c_void>(),
        iov_len: payload.len(),
    };

    let fd_size = mem::size_of::<libc::c_int>();
    let cmsg_space = unsafe { libc::CMSG_SPACE(fd_size as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast::<libc::c_void>();
    msg.msg_controllen = cmsg_space as _;

    let n = unsafe { libc::recvmsg(stream.as_raw_fd(), &mut msg, 0) };
    if n < 0 {
        return Err(PassFdError::Io(io::Error::last_os_error()));
    }
    if n == 0 {
        return Ok(None);
    }

    if (msg.msg_flags & libc::MSG_CTRUNC) != 0 {
        return Err(PassFdError::Truncated);
    }

    let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    if cmsg.is_null() {
        return Err(PassFdError::MissingDescriptor);
    }

    let (level, kind) = unsafe { ((*cmsg).cmsg_level, (*cmsg).cmsg_type) };
    if level != libc::SOL_SOCKET || kind != libc::SCM_RIGHTS {
        return Err(PassFdError::WrongControlMessage { level, kind });
    }

    let raw = unsafe { ptr::read_unaligned(libc::CMSG_DATA(cmsg).cast::<libc::c_int>()) };
    // The kernel installed `raw` into this process; we are its sole owner.
    Ok(Some(unsafe { OwnedFd::from_raw_fd(raw) }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::UdpSocket;
    use std::os::unix::io::AsFd;

    #[test]
    fn test_fd_round_trip() {
        let (tx, rx) = UnixStream::pair().unwrap();

        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let local = sock.local_addr().unwrap();
        send_fd(&tx, sock.as_fd()).unwrap();

        let received = recv_fd(&rx).unwrap().expect("expected a descriptor");
        let received_sock = UdpSocket::from(received);
        // Same open file description: same local address.
        assert_eq!(received_sock.local_addr().unwrap(), local);
    }

    #[test]
    fn test_transferred_fd_is_usable() {
        let (tx, rx) = UnixStream::pair().unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        let target = UdpSocket::bind("127.0.0.1:0").unwrap();
        send_fd(&tx, sender.as_fd()).unwrap();
        drop(sender);

        let received = UdpSocket::from(recv_fd(&rx).unwrap().unwrap());
        received
            .send_to(b"ping", target.local_addr().unwrap())
            .unwrap();

        let mut buf = [0u8; 16];
        let (n, _) = target.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
    }

    #[test]
    fn test_peer_closed_yields_none() {
        let (tx, rx) = UnixStream::pair().unwrap();
        drop(tx);
        assert!(recv_fd(&rx).unwrap().is_none());
    }

    #[test]
    fn test_plain_byte_is_protocol_violation() {
        let (mut tx, rx) = UnixStream::pair().unwrap();
        tx.write_all(&[0u8]).unwrap();
        let err = recv_fd(&rx).unwrap_err();
        assert!(matches!(err, PassFdError::MissingDescriptor));
    }
}
