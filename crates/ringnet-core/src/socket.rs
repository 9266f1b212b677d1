//! Raw socket setup.
//!
//! `mio::net::{TcpListener, TcpStream}` cover accept/connect for the common
//! case, but this node needs keepalive tuning, `SO_LINGER`, and an
//! independent duplicate of each connected fd — none of which the mio
//! wrappers expose. Sockets are built with raw `libc` calls and only handed
//! to mio at the very end via `TcpStream::from_std` / `TcpListener::from_std`.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use crate::error::{Error, Result};

const KEEPALIVE_IDLE_SECS: libc::c_int = 10;
const KEEPALIVE_INTERVAL_SECS: libc::c_int = 10;
const KEEPALIVE_PROBES: libc::c_int = 3;
const LINGER_SECS: libc::c_int = 1;
const LISTEN_BACKLOG: libc::c_int = 10_240;

fn last_os_error() -> io::Error {
    io::Error::last_os_error()
}

fn sockaddr_from(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr { s_addr: u32::from_ne_bytes(v4.ip().octets()) },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr { s6_addr: v6.ip().octets() },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

fn new_raw_socket(addr: SocketAddr) -> io::Result<RawFd> {
    let domain = if addr.is_ipv4() { libc::AF_INET } else { libc::AF_INET6 };
    let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(last_os_error());
    }
    Ok(fd)
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(last_os_error());
    }
    Ok(())
}

fn setsockopt<T>(fd: RawFd, level: libc::c_int, name: libc::c_int, value: &T) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            value as *const T as *const libc::c_void,
            mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(last_os_error());
    }
    Ok(())
}

/// Applies the keepalive/linger/non-blocking tuning every peer-facing
/// socket needs, on both listener-accepted and outbound-connected fds.
pub fn configure_peer_socket(fd: RawFd) -> io::Result<()> {
    setsockopt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, &1i32)?;
    setsockopt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, &KEEPALIVE_IDLE_SECS)?;
    setsockopt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPINTVL, &KEEPALIVE_INTERVAL_SECS)?;
    setsockopt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPCNT, &KEEPALIVE_PROBES)?;
    let linger = libc::linger { l_onoff: 1, l_linger: LINGER_SECS };
    setsockopt(fd, libc::SOL_SOCKET, libc::SO_LINGER, &linger)?;
    set_nonblocking(fd)?;
    Ok(())
}

/// Creates a non-blocking listening socket bound to `addr`, ready to hand to
/// `mio::net::TcpListener::from_std`.
pub fn create_listening(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let fd = new_raw_socket(addr)?;
    setsockopt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, &1i32)?;
    let (storage, len) = sockaddr_from(addr);
    let rc = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if rc < 0 {
        let err = last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }
    if unsafe { libc::listen(fd, LISTEN_BACKLOG) } < 0 {
        let err = last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }
    set_nonblocking(fd)?;
    Ok(unsafe { std::net::TcpListener::from_raw_fd(fd) })
}

/// Connects to `addr`, blocking the calling thread for up to `timeout`
/// while the handshake completes, then applies peer tuning. This is the
/// bootstrap/reconnect path; the steady-state node never blocks here.
pub fn create_connecting(addr: SocketAddr, timeout: Duration) -> Result<std::net::TcpStream> {
    let fd = new_raw_socket(addr).map_err(|e| Error::Fatal(format!("socket(): {e}")))?;
    set_nonblocking(fd).map_err(|e| Error::Fatal(format!("fcntl(): {e}")))?;
    let (storage, len) = sockaddr_from(addr);
    let rc = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if rc < 0 {
        let err = last_os_error();
        if err.kind() != io::ErrorKind::WouldBlock && err.raw_os_error() != Some(libc::EINPROGRESS) {
            unsafe { libc::close(fd) };
            return Err(classify_connect_error(err));
        }
        let mut pfd = libc::pollfd { fd, events: libc::POLLOUT, revents: 0 };
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout.as_millis() as libc::c_int) };
        if rc == 0 {
            unsafe { libc::close(fd) };
            return Err(Error::Timeout);
        }
        if rc < 0 {
            let err = last_os_error();
            unsafe { libc::close(fd) };
            return Err(Error::Fatal(format!("poll(): {err}")));
        }
        let mut sock_err: libc::c_int = 0;
        let mut sock_err_len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut sock_err as *mut _ as *mut libc::c_void,
                &mut sock_err_len,
            )
        };
        if rc < 0 {
            let err = last_os_error();
            unsafe { libc::close(fd) };
            return Err(Error::Fatal(format!("getsockopt(SO_ERROR): {err}")));
        }
        if sock_err != 0 {
            let err = io::Error::from_raw_os_error(sock_err);
            unsafe { libc::close(fd) };
            return Err(classify_connect_error(err));
        }
    }
    configure_peer_socket(fd).map_err(|e| Error::Fatal(format!("configure_peer_socket(): {e}")))?;
    Ok(unsafe { std::net::TcpStream::from_raw_fd(fd) })
}

fn classify_connect_error(err: io::Error) -> Error {
    match err.raw_os_error() {
        Some(libc::ECONNREFUSED) => Error::ConnectionRefused,
        Some(libc::ETIMEDOUT) => Error::Timeout,
        _ => Error::Fatal(format!("connect(): {err}")),
    }
}

/// Duplicates a connected stream's file descriptor. The two fds share the
/// kernel's open file description — and so its read/write buffers and
/// shutdown state — letting the receive and send paths own one fd each
/// without contending on a single `TcpStream` handle.
pub fn dup_stream(stream: &std::net::TcpStream) -> io::Result<std::net::TcpStream> {
    let fd = unsafe { libc::dup(stream.as_raw_fd()) };
    if fd < 0 {
        return Err(last_os_error());
    }
    Ok(unsafe { std::net::TcpStream::from_raw_fd(fd) })
}

/// Takes ownership of a dup'd fd purely for `sendfile`'s `in_fd` argument,
/// closing it once the region has been fully transmitted or the peer is
/// torn down.
pub fn dup_owned_fd(fd: RawFd) -> io::Result<OwnedFd> {
    let dup = unsafe { libc::dup(fd) };
    if dup < 0 {
        return Err(last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(dup) })
}

/// Performs a single `sendfile` syscall, returning the number of bytes
/// transferred. `offset` is advanced by the kernel in place.
pub fn sendfile(out_fd: RawFd, in_fd: RawFd, offset: &mut libc::off_t, count: usize) -> io::Result<usize> {
    let rc = unsafe { libc::sendfile(out_fd, in_fd, offset, count) };
    if rc < 0 {
        return Err(last_os_error());
    }
    Ok(rc as usize)
}

/// Synchronous receive helper used only during bootstrap join, where the
/// node has not yet registered the peer with the scheduler. Polls in short
/// slices so `abort` can interrupt a stalled handshake.
pub fn blocking_recv_exact(
    fd: RawFd,
    buf: &mut [u8],
    poll_slice: Duration,
    overall_timeout: Duration,
    mut abort: impl FnMut() -> bool,
) -> Result<()> {
    let deadline = std::time::Instant::now() + overall_timeout;
    let mut filled = 0usize;
    while filled < buf.len() {
        if abort() {
            return Err(Error::Fatal("receive aborted".into()));
        }
        if std::time::Instant::now() >= deadline {
            return Err(Error::Timeout);
        }
        let mut pfd = libc::pollfd { fd, events: libc::POLLIN, revents: 0 };
        let rc = unsafe { libc::poll(&mut pfd, 1, poll_slice.as_millis() as libc::c_int) };
        if rc < 0 {
            return Err(Error::Fatal(format!("poll(): {}", last_os_error())));
        }
        if rc == 0 {
            continue;
        }
        let n = unsafe {
            libc::recv(fd, buf[filled..].as_mut_ptr().cast(), buf.len() - filled, 0)
        };
        if n == 0 {
            return Err(Error::ConnectionReset);
        }
        if n < 0 {
            let err = last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock || err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(Error::Fatal(format!("recv(): {err}")));
        }
        filled += n as usize;
    }
    Ok(())
}
