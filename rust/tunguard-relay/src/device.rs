//! Tunnel device abstraction
//!
//! A tunnel carries whole IPv4 packets. Reads and writes never block. A read
//! returning `Ok(0)` delivered an empty packet; a closed tunnel reports
//! `ErrorKind::UnexpectedEof`.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

use mio::event::Source;
use mio::net::UnixDatagram;
use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};

/// A packet-oriented, non-blocking tunnel endpoint the event loop can poll.
pub trait Tunnel: Source + Send {
    /// Read one packet into `buf`. Fails with `UnexpectedEof` once the tunnel
    /// is closed.
    fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write_packet(&mut self, packet: &[u8]) -> io::Result<usize>;
}

/// TUN device file descriptor, typically handed over by the platform's VPN
/// service.
#[derive(Debug)]
pub struct TunFd {
    fd: OwnedFd,
}

impl TunFd {
    /// Take ownership of `fd` and switch it to non-blocking mode.
    pub fn new(fd: OwnedFd) -> io::Result<Self> {
        set_nonblocking(fd.as_raw_fd())?;
        Ok(Self { fd })
    }

    /// # Safety
    ///
    /// `fd` must be an open TUN descriptor not owned by anything else.
    pub unsafe fn from_raw_fd(fd: RawFd) -> io::Result<Self> {
        Self::new(OwnedFd::from_raw_fd(fd))
    }

    pub fn into_raw_fd(self) -> RawFd {
        self.fd.into_raw_fd()
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor we own; no memory is passed.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if flags & libc::O_NONBLOCK == 0 {
        // SAFETY: as above.
        let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

impl Tunnel for TunFd {
    fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: buf is valid for buf.len() writable bytes.
        let n = unsafe { libc::read(self.fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
        match n {
            n if n < 0 => Err(io::Error::last_os_error()),
            // a TUN device never yields empty packets; zero is end-of-file
            0 => Err(io::ErrorKind::UnexpectedEof.into()),
            n => Ok(n as usize),
        }
    }

    fn write_packet(&mut self, packet: &[u8]) -> io::Result<usize> {
        // SAFETY: packet is valid for packet.len() readable bytes.
        let n = unsafe { libc::write(self.fd.as_raw_fd(), packet.as_ptr().cast(), packet.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

impl Source for TunFd {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        SourceFd(&self.fd.as_raw_fd()).register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        SourceFd(&self.fd.as_raw_fd()).reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        SourceFd(&self.fd.as_raw_fd()).deregister(registry)
    }
}

/// Unix datagram tunnel. Datagram boundaries carry packet boundaries, which
/// suits hosts that proxy the TUN device over a socket pair. An empty datagram
/// is an empty packet, not end-of-file.
impl Tunnel for UnixDatagram {
    fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.recv(buf)
    }

    fn write_packet(&mut self, packet: &[u8]) -> io::Result<usize> {
        self.send(packet)
    }
}
