// Readiness reactor over epoll.
//
// Single-threaded, level-triggered. A descriptor is registered with an
// interest set, reported ready for as long as the condition holds, and must
// be unwatched before its owner closes it.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::error::{Result, TrafgenError};

/// Maximum number of events delivered per `wait` call.
pub const MAX_EVENTS: usize = 64;

/// A set of readiness interests for a watched descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u32);

impl Interest {
    /// Data can be read without blocking.
    pub const READABLE: Interest = Interest(libc::EPOLLIN as u32);
    /// Data can be written without blocking (also signals connect completion).
    pub const WRITABLE: Interest = Interest(libc::EPOLLOUT as u32);
    /// Peer hung up the whole connection.
    pub const PEER_HANGUP: Interest = Interest(libc::EPOLLHUP as u32);
    /// Error condition on the descriptor.
    pub const ERROR: Interest = Interest(libc::EPOLLERR as u32);
    /// Peer shut down its writing half (no more data will arrive).
    pub const READ_HANGUP: Interest = Interest(libc::EPOLLRDHUP as u32);

    pub fn contains(self, other: Interest) -> bool {
        self.0 & other.0 != 0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

/// One ready descriptor with the interests that fired.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub fd: RawFd,
    pub interest: Interest,
}

/// Outcome of a single `wait` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// `n` events were written to the output buffer (possibly 0 on timeout).
    Ready(usize),
    /// The wait was interrupted by a signal; re-check state and retry.
    Interrupted,
}

pub struct Reactor {
    epoll: OwnedFd,
    raw: [libc::epoll_event; MAX_EVENTS],
}

impl Reactor {
    pub fn new() -> Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(TrafgenError::Reactor(io::Error::last_os_error()));
        }
        Ok(Reactor {
            epoll: unsafe { OwnedFd::from_raw_fd(fd) },
            raw: [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS],
        })
    }

    /// Register `fd` with the given interest set.
    ///
    /// Fails if `fd` is already watched.
    pub fn watch(&self, fd: RawFd, interest: Interest) -> Result<()> {
        let mut ev = libc::epoll_event {
            events: interest.bits(),
            u64: fd as u64,
        };
        let ret = unsafe {
            libc::epoll_ctl(self.epoll.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut ev)
        };
        if ret < 0 {
            return Err(TrafgenError::Reactor(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Remove `fd` from the watch set. Must happen before `fd` is closed.
    pub fn unwatch(&self, fd: RawFd) -> Result<()> {
        let ret = unsafe {
            libc::epoll_ctl(
                self.epoll.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        };
        if ret < 0 {
            return Err(TrafgenError::Reactor(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Block until readiness, a timeout, or a signal.
    ///
    /// Ready events are appended to `out` (cleared first). A timeout of -1
    /// blocks indefinitely.
    pub fn wait(&mut self, out: &mut Vec<Event>, timeout_ms: i32) -> Result<Wait> {
        out.clear();
        let n = unsafe {
            libc::epoll_wait(
                self.epoll.as_raw_fd(),
                self.raw.as_mut_ptr(),
                MAX_EVENTS as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(Wait::Interrupted);
            }
            return Err(TrafgenError::Reactor(err));
        }
        for ev in &self.raw[..n as usize] {
            out.push(Event {
                fd: ev.u64 as RawFd,
                interest: Interest(ev.events),
            });
        }
        Ok(Wait::Ready(n as usize))
    }
}
