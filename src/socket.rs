use std::io;
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, SockAddr, Type};
use tracing::error;

/// RAII wrapper around one TCP socket descriptor.
///
/// The listening socket is owned by the acceptor and each connection socket
/// by its connection; nothing else ever closes these descriptors.
pub struct Socket {
    inner: socket2::Socket,
}

impl Socket {
    /// Create a non-blocking, close-on-exec stream socket for `addr`'s
    /// address family.
    pub fn new_nonblocking(addr: &SocketAddr) -> io::Result<Socket> {
        let domain = match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let inner = socket2::Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        inner.set_nonblocking(true)?;
        inner.set_cloexec(true)?;
        Ok(Socket { inner })
    }

    pub fn fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }

    pub fn bind_address(&self, addr: &SocketAddr) -> io::Result<()> {
        self.inner.bind(&SockAddr::from(*addr))
    }

    pub fn listen(&self) -> io::Result<()> {
        self.inner.listen(1024)
    }

    /// Accept one pending connection; the returned socket is non-blocking
    /// and close-on-exec.
    pub fn accept(&self) -> io::Result<(Socket, SocketAddr)> {
        let (accepted, addr) = self.inner.accept()?;
        accepted.set_nonblocking(true)?;
        let peer = addr.as_socket().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "accepted non-IP peer address")
        })?;
        Ok((Socket { inner: accepted }, peer))
    }

    /// Half-close: shut down the write side, leaving reads open.
    pub fn shutdown_write(&self) {
        if let Err(e) = self.inner.shutdown(Shutdown::Write) {
            error!("shutdown_write on fd {} failed: {e}", self.fd());
        }
    }

    /// Attempt to send `data` directly; short writes and `WouldBlock` are the
    /// caller's business.
    pub fn send(&self, data: &[u8]) -> io::Result<usize> {
        self.inner.send(data)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()?.as_socket().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "socket has non-IP local address")
        })
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()?.as_socket().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "socket has non-IP peer address")
        })
    }

    /// Pending SO_ERROR value, if any.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        self.inner.take_error()
    }

    pub fn set_tcp_no_delay(&self, on: bool) -> io::Result<()> {
        self.inner.set_nodelay(on)
    }

    pub fn set_reuse_addr(&self, on: bool) -> io::Result<()> {
        self.inner.set_reuse_address(on)
    }

    pub fn set_reuse_port(&self, on: bool) -> io::Result<()> {
        self.inner.set_reuse_port(on)
    }

    pub fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        self.inner.set_keepalive(on)
    }
}

impl From<socket2::Socket> for Socket {
    fn from(inner: socket2::Socket) -> Self {
        Socket { inner }
    }
}

impl From<std::net::TcpStream> for Socket {
    fn from(stream: std::net::TcpStream) -> Self {
        Socket {
            inner: socket2::Socket::from(stream),
        }
    }
}
