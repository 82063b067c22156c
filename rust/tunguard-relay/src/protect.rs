//! Protected outbound sockets.
//!
//! Every relay socket is handed to the host's [`SocketProtector`] before it
//! connects, so its traffic bypasses the tunnel instead of looping back in.

use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};

use mio::net::{TcpStream, UdpSocket};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, warn};

use crate::error::{RelayError, Result};

/// Host hook excluding a socket from the tunnel's routing.
pub trait SocketProtector: Send + Sync {
    fn protect(&self, fd: RawFd) -> bool;
}

impl<F> SocketProtector for F
where
    F: Fn(RawFd) -> bool + Send + Sync,
{
    fn protect(&self, fd: RawFd) -> bool {
        self(fd)
    }
}

/// Protector for hosts whose routing already keeps relay sockets off the tunnel.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProtector;

impl SocketProtector for NoopProtector {
    fn protect(&self, _fd: RawFd) -> bool {
        true
    }
}

fn protected_socket(
    dest: SocketAddr,
    ty: Type,
    proto: Protocol,
    protector: &dyn SocketProtector,
) -> Result<Socket> {
    let socket = Socket::new(Domain::for_address(dest), ty, Some(proto))?;
    let fd = socket.as_raw_fd();
    if !protector.protect(fd) {
        warn!("Socket fd={} protection failed for {}", fd, dest);
        return Err(RelayError::ProtectFailed(fd));
    }
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Open a protected non-blocking TCP socket and start connecting to `dest`.
///
/// The connect completes later; the stream reports writable when it does.
pub fn connect_tcp(dest: SocketAddr, protector: &dyn SocketProtector) -> Result<TcpStream> {
    let socket = protected_socket(dest, Type::STREAM, Protocol::TCP, protector)?;
    socket.set_nodelay(true)?;
    match socket.connect(&SockAddr::from(dest)) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e.into()),
    }
    debug!("connecting fd={} to {}", socket.as_raw_fd(), dest);
    let std_stream: std::net::TcpStream = socket.into();
    Ok(TcpStream::from_std(std_stream))
}

/// Open a protected non-blocking UDP socket connected to `dest`.
pub fn connect_udp(dest: SocketAddr, protector: &dyn SocketProtector) -> Result<UdpSocket> {
    let socket = protected_socket(dest, Type::DGRAM, Protocol::UDP, protector)?;
    socket.connect(&SockAddr::from(dest))?;
    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket))
}
