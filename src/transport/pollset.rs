//! Readiness polling with a self-pipe wakeup.
//!
//! Driver event loops block in `poll(2)` on their sockets plus the read
//! end of a pipe; any thread can interrupt the wait by writing a byte to
//! the other end. This is the portable selector-wakeup pattern; the fds
//! are owned, so nothing leaks on early return.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

pub(crate) const POLL_IN: i16 = libc::POLLIN;
pub(crate) const POLL_OUT: i16 = libc::POLLOUT;
pub(crate) const POLL_ERR: i16 = libc::POLLERR | libc::POLLHUP | libc::POLLNVAL;

/// Self-pipe wakeup for a poll loop.
#[derive(Debug)]
pub(crate) struct Waker {
    read_end: OwnedFd,
    write_end: OwnedFd,
}

impl Waker {
    pub(crate) fn new() -> io::Result<Self> {
        let mut fds = [0 as RawFd; 2];
        let rv = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if rv != 0 {
            return Err(io::Error::last_os_error());
        }
        // Safety: pipe2 returned two fresh fds we now own.
        unsafe {
            Ok(Self {
                read_end: OwnedFd::from_raw_fd(fds[0]),
                write_end: OwnedFd::from_raw_fd(fds[1]),
            })
        }
    }

    /// Interrupt the poll loop. A full pipe already guarantees a
    /// wakeup, so the result is ignored.
    pub(crate) fn wake(&self) {
        let byte = [1u8];
        unsafe {
            libc::write(self.write_end.as_raw_fd(), byte.as_ptr().cast(), 1);
        }
    }

    /// Discard queued wakeup bytes.
    pub(crate) fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe { libc::read(self.read_end.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
            if n <= 0 {
                break;
            }
        }
    }

    pub(crate) fn read_fd(&self) -> RawFd {
        self.read_end.as_raw_fd()
    }
}

/// Build a pollfd entry.
pub(crate) fn poll_fd(fd: RawFd, events: i16) -> libc::pollfd {
    libc::pollfd {
        fd,
        events,
        revents: 0,
    }
}

/// Wait for readiness. `None` blocks indefinitely. EINTR reports zero
/// ready fds; the caller's loop re-evaluates and polls again.
pub(crate) fn poll(fds: &mut [libc::pollfd], timeout: Option<Duration>) -> io::Result<usize> {
    let timeout_ms: libc::c_int = match timeout {
        None => -1,
        Some(t) => t.as_millis().min(i32::MAX as u128) as libc::c_int,
    };
    let rv = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
    if rv < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            return Ok(0);
        }
        return Err(err);
    }
    Ok(rv as usize)
}
