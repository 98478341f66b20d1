// Non-blocking TCP socket primitives over libc.
//
// Every descriptor created here is placed in non-blocking mode before it is
// returned, so the reactor loop never blocks inside a socket call. Outcomes
// that are part of normal operation (`WouldBlock`, `Eof`, `Broken`) are
// expressed as enum variants, not errors.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::cli::Endpoint;
use crate::error::{Result, TrafgenError};

/// Outcome of a non-blocking accept.
pub enum Accepted {
    Conn { fd: OwnedFd, peer: SocketAddrV4 },
    /// The accept queue is empty.
    WouldBlock,
}

/// Outcome of a non-blocking send.
#[derive(Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Sent(usize),
    /// The socket send buffer is full; wait for the next writable readiness.
    WouldBlock,
    /// Peer closed mid-send (EPIPE / ECONNRESET). Not a hard failure.
    Broken,
}

/// Outcome of a non-blocking receive.
#[derive(Debug, PartialEq, Eq)]
pub enum RecvOutcome {
    Data(usize),
    /// Orderly shutdown from the peer.
    Eof,
    /// No data buffered; wait for the next readable readiness.
    WouldBlock,
}

/// A bound, listening, non-blocking TCP socket with `SO_REUSEADDR` set.
pub struct Listener {
    fd: OwnedFd,
    local_port: u16,
}

impl Listener {
    pub fn bind(endpoint: Endpoint) -> Result<Listener> {
        let fd = tcp_socket()?;
        set_nonblocking(fd.as_raw_fd()).map_err(TrafgenError::Socket)?;
        set_reuse_addr(fd.as_raw_fd()).map_err(TrafgenError::Socket)?;

        let addr = sockaddr_from(endpoint.host, endpoint.port);
        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(TrafgenError::Bind(io::Error::last_os_error()));
        }

        let ret = unsafe { libc::listen(fd.as_raw_fd(), libc::SOMAXCONN) };
        if ret < 0 {
            return Err(TrafgenError::Socket(io::Error::last_os_error()));
        }

        // Re-read the bound port so callers binding port 0 learn the
        // ephemeral assignment.
        let local_port = bound_port(fd.as_raw_fd()).map_err(TrafgenError::Socket)?;

        Ok(Listener { fd, local_port })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Accept one pending connection, if any.
///
/// The accepted descriptor is switched to non-blocking mode before it is
/// handed to the caller; if that fails the descriptor is closed and the
/// error surfaced, so ownership never leaks.
pub fn accept_next(listener: &Listener) -> Result<Accepted> {
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

    let ret = unsafe {
        libc::accept(
            listener.as_raw_fd(),
            &mut addr as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut len,
        )
    };
    if ret < 0 {
        let err = io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(libc::EAGAIN) => Ok(Accepted::WouldBlock),
            _ => Err(TrafgenError::Socket(err)),
        };
    }

    let fd = unsafe { OwnedFd::from_raw_fd(ret) };
    set_nonblocking(fd.as_raw_fd()).map_err(TrafgenError::Socket)?;

    let peer = SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)),
        u16::from_be(addr.sin_port),
    );
    Ok(Accepted::Conn { fd, peer })
}

/// Create a non-blocking socket and start connecting to `endpoint`.
///
/// Returns the descriptor with the connect still in flight in the common
/// case (`EINPROGRESS`); the caller learns the final status from the first
/// writable readiness via [`socket_error`].
pub fn connect_start(endpoint: Endpoint) -> Result<OwnedFd> {
    let fd = tcp_socket()?;
    set_nonblocking(fd.as_raw_fd()).map_err(TrafgenError::Socket)?;

    let addr = sockaddr_from(endpoint.host, endpoint.port);
    let ret = unsafe {
        libc::connect(
            fd.as_raw_fd(),
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINPROGRESS) {
            return Err(TrafgenError::Socket(err));
        }
    }
    Ok(fd)
}

/// Fetch and clear the pending socket-level error (`SO_ERROR`).
///
/// Returns 0 when the socket is healthy.
pub fn socket_error(fd: RawFd) -> Result<i32> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if ret < 0 {
        return Err(TrafgenError::Socket(io::Error::last_os_error()));
    }
    Ok(err)
}

pub fn send_nonblock(fd: RawFd, data: &[u8]) -> Result<SendOutcome> {
    // MSG_NOSIGNAL: a broken pipe must come back as an errno, not SIGPIPE.
    let n = unsafe {
        libc::send(
            fd,
            data.as_ptr() as *const libc::c_void,
            data.len(),
            libc::MSG_NOSIGNAL,
        )
    };
    if n >= 0 {
        return Ok(SendOutcome::Sent(n as usize));
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EAGAIN) => Ok(SendOutcome::WouldBlock),
        Some(libc::EPIPE) | Some(libc::ECONNRESET) => Ok(SendOutcome::Broken),
        _ => Err(TrafgenError::Socket(err)),
    }
}

pub fn recv_nonblock(fd: RawFd, buf: &mut [u8]) -> Result<RecvOutcome> {
    let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
    if n > 0 {
        return Ok(RecvOutcome::Data(n as usize));
    }
    if n == 0 {
        return Ok(RecvOutcome::Eof);
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EAGAIN) => Ok(RecvOutcome::WouldBlock),
        _ => Err(TrafgenError::Socket(err)),
    }
}

fn tcp_socket() -> Result<OwnedFd> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(TrafgenError::Socket(io::Error::last_os_error()));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_reuse_addr(fd: RawFd) -> io::Result<()> {
    let yes: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &yes as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn bound_port(fd: RawFd) -> io::Result<u16> {
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockname(
            fd,
            &mut addr as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut len,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(u16::from_be(addr.sin_port))
}

fn sockaddr_from(host: Ipv4Addr, port: u16) -> libc::sockaddr_in {
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_port = port.to_be();
    addr.sin_addr.s_addr = u32::from(host).to_be();
    addr
}
