//! Thin socket wrapper over the hooked syscalls.
//!
//! A [`Socket`] is registered with [`FdManager`] on creation, so inside an
//! [`IoManager`](crate::reactor::IoManager) coroutine its blocking-looking
//! operations suspend the coroutine instead of the thread. Outside the runtime
//! the fd is still non-blocking at the OS level and operations may fail with
//! `WouldBlock`.

pub mod server;

use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

use libc::{c_int, c_void, sockaddr, sockaddr_in, sockaddr_in6, sockaddr_storage, socklen_t};

use crate::fd::{FdManager, TimeoutKind};
use crate::hook::{self, originals::originals};
use crate::reactor::IoHandle;

pub use self::server::{ClientHandler, TcpServer};

fn cvt(ret: c_int) -> io::Result<c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn cvt_size(ret: libc::ssize_t) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

pub(crate) fn to_raw(addr: &SocketAddr) -> (sockaddr_storage, socklen_t) {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let raw = sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe { (&mut storage as *mut sockaddr_storage).cast::<sockaddr_in>().write(raw) };
            mem::size_of::<sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let raw = sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe { (&mut storage as *mut sockaddr_storage).cast::<sockaddr_in6>().write(raw) };
            mem::size_of::<sockaddr_in6>()
        }
    };
    (storage, len as socklen_t)
}

pub(crate) fn from_raw(storage: &sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let raw = unsafe { &*(storage as *const sockaddr_storage).cast::<sockaddr_in>() };
            let ip = Ipv4Addr::from(raw.sin_addr.s_addr.to_ne_bytes());
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(raw.sin_port))))
        }
        libc::AF_INET6 => {
            let raw = unsafe { &*(storage as *const sockaddr_storage).cast::<sockaddr_in6>() };
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(raw.sin6_addr.s6_addr),
                u16::from_be(raw.sin6_port),
                raw.sin6_flowinfo,
                raw.sin6_scope_id,
            )))
        }
        family => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported address family {family}"),
        )),
    }
}

/// An owned socket fd. Closed on drop.
#[derive(Debug)]
pub struct Socket {
    fd: AtomicI32,
    family: c_int,
}

impl Socket {
    /// A TCP socket matching the family of `addr`.
    pub fn tcp(addr: &SocketAddr) -> io::Result<Socket> {
        let family = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };
        Socket::new(family, libc::SOCK_STREAM, 0)
    }

    pub fn new(family: c_int, ty: c_int, protocol: c_int) -> io::Result<Socket> {
        let fd = cvt(unsafe { hook::socket(family, ty | libc::SOCK_CLOEXEC, protocol) })?;
        let socket = Socket::from_fd(fd, family);
        socket.set_option(libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
        if ty == libc::SOCK_STREAM {
            socket.set_option(libc::IPPROTO_TCP, libc::TCP_NODELAY, 1)?;
        }
        Ok(socket)
    }

    fn from_fd(fd: RawFd, family: c_int) -> Socket {
        FdManager::global().get(fd, true);
        Socket {
            fd: AtomicI32::new(fd),
            family,
        }
    }

    /// `-1` once closed.
    pub fn fd(&self) -> RawFd {
        self.fd.load(Ordering::Acquire)
    }

    pub fn family(&self) -> c_int {
        self.family
    }

    pub fn is_valid(&self) -> bool {
        self.fd() >= 0
    }

    fn set_option(&self, level: c_int, name: c_int, value: c_int) -> io::Result<()> {
        cvt(unsafe {
            (originals().setsockopt)(
                self.fd(),
                level,
                name,
                (&value as *const c_int).cast::<c_void>(),
                mem::size_of::<c_int>() as socklen_t,
            )
        })?;
        Ok(())
    }

    pub fn bind(&self, addr: &SocketAddr) -> io::Result<()> {
        let (storage, len) = to_raw(addr);
        cvt(unsafe {
            libc::bind(
                self.fd(),
                (&storage as *const sockaddr_storage).cast::<sockaddr>(),
                len,
            )
        })?;
        Ok(())
    }

    pub fn listen(&self, backlog: c_int) -> io::Result<()> {
        cvt(unsafe { libc::listen(self.fd(), backlog) })?;
        Ok(())
    }

    pub fn accept(&self) -> io::Result<Socket> {
        let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<sockaddr_storage>() as socklen_t;
        let fd = cvt(unsafe {
            hook::accept(
                self.fd(),
                (&mut storage as *mut sockaddr_storage).cast::<sockaddr>(),
                &mut len,
            )
        })?;
        Ok(Socket::from_fd(fd, self.family))
    }

    /// Connect, failing with `TimedOut` after `timeout_ms` (`None` waits until
    /// the kernel gives up).
    pub fn connect(&self, addr: &SocketAddr, timeout_ms: Option<u64>) -> io::Result<()> {
        let (storage, len) = to_raw(addr);
        cvt(unsafe {
            hook::connect_with_timeout(
                self.fd(),
                (&storage as *const sockaddr_storage).cast::<sockaddr>(),
                len,
                timeout_ms,
            )
        })?;
        Ok(())
    }

    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        cvt_size(unsafe {
            hook::send(self.fd(), buf.as_ptr().cast(), buf.len(), libc::MSG_NOSIGNAL)
        })
    }

    /// Send the whole buffer.
    pub fn send_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match self.send(buf)? {
                0 => return Err(io::ErrorKind::WriteZero.into()),
                n => buf = &buf[n..],
            }
        }
        Ok(())
    }

    /// `Ok(0)` means the peer closed the connection.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        cvt_size(unsafe { hook::recv(self.fd(), buf.as_mut_ptr().cast(), buf.len(), 0) })
    }

    fn set_timeout(&self, kind: TimeoutKind, ms: u64) -> io::Result<()> {
        if let Some(ctx) = FdManager::global().get(self.fd(), false) {
            ctx.set_timeout(kind, ms);
        }
        let tv = libc::timeval {
            tv_sec: (ms / 1000) as libc::time_t,
            tv_usec: ((ms % 1000) * 1000) as libc::suseconds_t,
        };
        let name = match kind {
            TimeoutKind::Recv => libc::SO_RCVTIMEO,
            TimeoutKind::Send => libc::SO_SNDTIMEO,
        };
        cvt(unsafe {
            (originals().setsockopt)(
                self.fd(),
                libc::SOL_SOCKET,
                name,
                (&tv as *const libc::timeval).cast::<c_void>(),
                mem::size_of::<libc::timeval>() as socklen_t,
            )
        })?;
        Ok(())
    }

    pub fn set_recv_timeout(&self, ms: u64) -> io::Result<()> {
        self.set_timeout(TimeoutKind::Recv, ms)
    }

    pub fn set_send_timeout(&self, ms: u64) -> io::Result<()> {
        self.set_timeout(TimeoutKind::Send, ms)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<sockaddr_storage>() as socklen_t;
        cvt(unsafe {
            libc::getsockname(
                self.fd(),
                (&mut storage as *mut sockaddr_storage).cast::<sockaddr>(),
                &mut len,
            )
        })?;
        from_raw(&storage)
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<sockaddr_storage>() as socklen_t;
        cvt(unsafe {
            libc::getpeername(
                self.fd(),
                (&mut storage as *mut sockaddr_storage).cast::<sockaddr>(),
                &mut len,
            )
        })?;
        from_raw(&storage)
    }

    /// Wake every coroutine parked on this socket in the current `IoManager`.
    pub fn cancel_all(&self) -> bool {
        match IoHandle::current() {
            Some(iom) => iom.cancel_all(self.fd()),
            None => false,
        }
    }

    /// Close the fd. Later calls are no-ops.
    pub fn close(&self) -> io::Result<()> {
        let fd = self.fd.swap(-1, Ordering::AcqRel);
        if fd < 0 {
            return Ok(());
        }
        cvt(unsafe { hook::close(fd) })?;
        Ok(())
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("Socket::drop close failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockaddr_conversion_keeps_address() {
        for text in ["127.0.0.1:8080", "[::1]:443", "[fe80::1%2]:9"] {
            let addr: SocketAddr = text.parse().unwrap();
            let (storage, _) = to_raw(&addr);
            assert_eq!(from_raw(&storage).unwrap(), addr);
        }
    }

    #[test]
    fn bind_reports_local_addr() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let sock = Socket::tcp(&addr).unwrap();
        sock.bind(&addr).unwrap();
        sock.listen(16).unwrap();
        let local = sock.local_addr().unwrap();
        assert_eq!(local.ip(), addr.ip());
        assert_ne!(local.port(), 0);

        let fd = sock.fd();
        assert!(FdManager::global().get(fd, false).unwrap().is_socket());
        sock.close().unwrap();
        assert!(!sock.is_valid());
        sock.close().unwrap();
    }
}
