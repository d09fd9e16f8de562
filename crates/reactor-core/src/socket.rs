//! Thin owned wrapper over a raw IPv4 stream socket fd.
//!
//! Kept deliberately close to a syscall surface: `SocketHandle` exists to
//! guarantee single ownership (one `close` per fd) and to carry the option
//! toggles the reactor needs, not to abstract the socket API away.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::fd::RawFd;

use crate::error::{Error, Result};

/// Creates a non-blocking, close-on-exec IPv4 stream socket.
fn create_nonblocking() -> io::Result<RawFd> {
    let fd = unsafe {
        libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

fn sockaddr_in_from(addr: SocketAddrV4) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: addr.port().to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from_ne_bytes(addr.ip().octets()),
        },
        sin_zero: [0; 8],
    }
}

fn socket_addr_from(raw: &libc::sockaddr_in) -> SocketAddr {
    // `s_addr` holds the address octets in network byte order already; reading
    // them back as native-endian bytes (not as a big-endian integer) is what
    // reproduces the original octets regardless of host endianness.
    let ip = Ipv4Addr::from(raw.sin_addr.s_addr.to_ne_bytes());
    let port = u16::from_be(raw.sin_port);
    SocketAddr::V4(SocketAddrV4::new(ip, port))
}

/// An owned, non-blocking IPv4 stream socket. Closes its fd on drop.
#[derive(Debug)]
pub struct SocketHandle {
    fd: RawFd,
}

impl SocketHandle {
    /// Creates a fresh non-blocking, close-on-exec socket (the listening-socket path).
    pub fn new_nonblocking() -> Result<Self> {
        let fd = create_nonblocking().map_err(Error::SocketCreate)?;
        Ok(SocketHandle { fd })
    }

    /// Takes ownership of an fd that is already known non-blocking + cloexec
    /// (the `accept4` path, see `accept`).
    pub fn from_raw_fd(fd: RawFd) -> Self {
        SocketHandle { fd }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn bind(&self, addr: SocketAddrV4) -> Result<()> {
        let raw = sockaddr_in_from(addr);
        let rc = unsafe {
            libc::bind(
                self.fd,
                std::ptr::addr_of!(raw).cast(),
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(Error::Bind {
                addr: SocketAddr::V4(addr),
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    pub fn listen(&self, backlog: i32) -> Result<()> {
        let rc = unsafe { libc::listen(self.fd, backlog) };
        if rc != 0 {
            return Err(Error::Listen(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Accepts one pending connection, atomically setting non-blocking + cloexec
    /// on the returned fd. Returns `Ok(None)` on `EAGAIN`/`EWOULDBLOCK` (nothing
    /// pending); other errors (including `EMFILE`) are returned for the caller
    /// to log and continue, per the spec's accept error disposition.
    pub fn accept(&self) -> io::Result<Option<(SocketHandle, SocketAddr)>> {
        let mut raw: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let connfd = unsafe {
            libc::accept4(
                self.fd,
                std::ptr::addr_of_mut!(raw).cast(),
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if connfd < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EAGAIN) => Ok(None),
                _ => Err(err),
            };
        }
        Ok(Some((SocketHandle::from_raw_fd(connfd), socket_addr_from(&raw))))
    }

    pub fn shutdown_write(&self) -> io::Result<()> {
        let rc = unsafe { libc::shutdown(self.fd, libc::SHUT_WR) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// The local address this socket is bound to, via `getsockname`.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let mut raw: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let rc = unsafe { libc::getsockname(self.fd, std::ptr::addr_of_mut!(raw).cast(), &mut len) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(socket_addr_from(&raw))
    }

    fn set_bool_opt(&self, level: i32, name: i32, on: bool) -> io::Result<()> {
        let val: libc::c_int = i32::from(on);
        let rc = unsafe {
            libc::setsockopt(
                self.fd,
                level,
                name,
                std::ptr::addr_of!(val).cast(),
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn set_tcp_nodelay(&self, on: bool) -> io::Result<()> {
        self.set_bool_opt(libc::IPPROTO_TCP, libc::TCP_NODELAY, on)
    }

    pub fn set_reuse_addr(&self, on: bool) -> io::Result<()> {
        self.set_bool_opt(libc::SOL_SOCKET, libc::SO_REUSEADDR, on)
    }

    pub fn set_reuse_port(&self, on: bool) -> io::Result<()> {
        self.set_bool_opt(libc::SOL_SOCKET, libc::SO_REUSEPORT, on)
    }

    pub fn set_keepalive(&self, on: bool) -> io::Result<()> {
        self.set_bool_opt(libc::SOL_SOCKET, libc::SO_KEEPALIVE, on)
    }

    /// Reads the pending `SO_ERROR` value (used by `Connection::handle_error`).
    pub fn take_error(&self) -> io::Result<i32> {
        let mut val: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                std::ptr::addr_of_mut!(val).cast(),
                &mut len,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(val)
    }
}

impl Drop for SocketHandle {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
