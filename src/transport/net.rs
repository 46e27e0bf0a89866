//! Nonblocking socket plumbing.
//!
//! Thin libc wrappers for the few operations std does not expose:
//! creating listeners for arbitrary stream protocols, nonblocking
//! connect, source-port-range binds, and abortive close. Sockets are
//! handed back as `std::net` types so the event loop reads and writes
//! through the standard io traits.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::ops::RangeInclusive;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use tracing::warn;

const LISTEN_BACKLOG: libc::c_int = 64;

fn last_error() -> io::Error {
    io::Error::last_os_error()
}

fn new_socket(family: libc::c_int, protocol: libc::c_int) -> io::Result<OwnedFd> {
    let fd = unsafe {
        libc::socket(
            family,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            protocol,
        )
    };
    if fd < 0 {
        return Err(last_error());
    }
    // Safety: freshly created fd, owned here.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn set_opt(fd: RawFd, level: libc::c_int, opt: libc::c_int, value: libc::c_int) -> io::Result<()> {
    let rv = unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            (&value as *const libc::c_int).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rv != 0 {
        return Err(last_error());
    }
    Ok(())
}

/// Encode a socket address for bind/connect.
fn to_sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr = libc::in_addr {
                s_addr: u32::from(*v4.ip()).to_be(),
            };
            std::mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_addr = libc::in6_addr {
                s6_addr: v6.ip().octets(),
            };
            sin6.sin6_scope_id = v6.scope_id();
            std::mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

fn bind_fd(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let (storage, len) = to_sockaddr(addr);
    let rv = unsafe { libc::bind(fd, (&storage as *const libc::sockaddr_storage).cast(), len) };
    if rv != 0 {
        return Err(last_error());
    }
    Ok(())
}

/// Create a nonblocking dual-stack listener on `port` for the given
/// stream protocol (0 = TCP). Falls back to IPv4-only when the host has
/// no IPv6 support.
pub(crate) fn listen(protocol: libc::c_int, port: u16) -> io::Result<TcpListener> {
    let fd = match new_socket(libc::AF_INET6, protocol) {
        Ok(fd) => {
            // Dual-stack where the OS allows it; not fatal otherwise.
            let _ = set_opt(fd.as_raw_fd(), libc::IPPROTO_IPV6, libc::IPV6_V6ONLY, 0);
            set_opt(fd.as_raw_fd(), libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
            bind_fd(fd.as_raw_fd(), &SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port))?;
            fd
        }
        Err(_) => {
            let fd = new_socket(libc::AF_INET, protocol)?;
            set_opt(fd.as_raw_fd(), libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
            bind_fd(fd.as_raw_fd(), &SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))?;
            fd
        }
    };
    let rv = unsafe { libc::listen(fd.as_raw_fd(), LISTEN_BACKLOG) };
    if rv != 0 {
        return Err(last_error());
    }
    // Safety: transferring ownership of a listening stream socket.
    Ok(unsafe { TcpListener::from_raw_fd(std::os::fd::IntoRawFd::into_raw_fd(fd)) })
}

/// Start a nonblocking connect to `addr`, optionally binding the source
/// port from `port_range`. Returns once the connect is in flight; the
/// caller polls for writability and then checks `take_error`.
pub(crate) fn connect_nonblocking(
    protocol: libc::c_int,
    addr: SocketAddr,
    port_range: Option<&RangeInclusive<u16>>,
) -> io::Result<TcpStream> {
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = new_socket(family, protocol)?;

    if let Some(range) = port_range {
        bind_in_range(fd.as_raw_fd(), &addr, range);
    }

    let (storage, len) = to_sockaddr(&addr);
    let rv = unsafe { libc::connect(fd.as_raw_fd(), (&storage as *const libc::sockaddr_storage).cast(), len) };
    if rv != 0 {
        let err = last_error();
        if err.raw_os_error() != Some(libc::EINPROGRESS) {
            return Err(err);
        }
    }
    // Safety: transferring ownership of the connecting socket.
    Ok(unsafe { TcpStream::from_raw_fd(std::os::fd::IntoRawFd::into_raw_fd(fd)) })
}

/// Walk the configured source-port range. Exhaustion is logged and the
/// socket falls back to an ephemeral port rather than failing the
/// connection attempt.
fn bind_in_range(fd: RawFd, addr: &SocketAddr, range: &RangeInclusive<u16>) {
    let any: IpAddr = match addr {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    for port in range.clone() {
        match bind_fd(fd, &SocketAddr::new(any, port)) {
            Ok(()) => return,
            Err(e) if e.raw_os_error() == Some(libc::EADDRINUSE) => continue,
            Err(e) => {
                warn!(port, error = %e, "Source-port bind failed; using an ephemeral port");
                return;
            }
        }
    }
    warn!(
        start = *range.start(),
        end = *range.end(),
        "Source-port range exhausted; using an ephemeral port"
    );
}

/// Arrange for close to send an RST instead of flushing.
pub(crate) fn set_linger_zero(stream: &TcpStream) {
    let linger = libc::linger { l_onoff: 1, l_linger: 0 };
    unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            (&linger as *const libc::linger).cast(),
            std::mem::size_of::<libc::linger>() as libc::socklen_t,
        );
    }
}
