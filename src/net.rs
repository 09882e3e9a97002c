//! Cooperative network input/output.
//!
//! The transports follow one discipline: the socket is non-blocking, a
//! syscall is attempted, and on `EWOULDBLOCK` the calling fiber waits in
//! the reactor for readiness before retrying, bounded by the caller's
//! deadline. Called outside of a runtime, the wait degrades to a plain
//! `poll(2)` so the transports stay usable from ordinary threads.

use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::clock::Deadline;
use crate::error::{Error, Result};
use crate::fiber::sched::{current_ctx, WaitKind, WakeReason};

pub use crate::reactor::IoEvents;

pub mod pool;
pub mod tcp;
pub mod udp;
pub mod unix;

pub use pool::{ConnectionPool, Pooled};
pub use tcp::{TcpConnection, TcpListener};
pub use udp::UdpSocket;
pub use unix::{UnixConnection, UnixListener};

/// Waits until one of the requested events fires on the (non-blocking)
/// socket `fd`. Yields the current fiber.
pub fn wait_io(fd: RawFd, events: IoEvents, timeout: Duration) -> Result<()> {
    wait_io_deadline(fd, events, Deadline::after(timeout))
}

pub(crate) fn wait_io_deadline(fd: RawFd, events: IoEvents, deadline: Deadline) -> Result<()> {
    if deadline.expired() {
        // A zero timeout is a pure readiness probe; skip the scheduler.
        return poll_fallback(fd, events, Deadline::after(Duration::ZERO));
    }
    match current_ctx() {
        Some(ctx) => match ctx.suspend(WaitKind::Io { fd, events }, deadline)? {
            WakeReason::Ready => Ok(()),
            WakeReason::TimedOut => Err(Error::TimedOut),
            WakeReason::Interrupted => Err(Error::Interrupted),
        },
        None => poll_fallback(fd, events, deadline),
    }
}

/// Readiness wait for non-fiber threads.
fn poll_fallback(fd: RawFd, events: IoEvents, deadline: Deadline) -> Result<()> {
    let mut pollfd = libc::pollfd {
        fd,
        events: {
            let mut ev = 0i16;
            if events.contains(IoEvents::READ) {
                ev |= libc::POLLIN;
            }
            if events.contains(IoEvents::WRITE) {
                ev |= libc::POLLOUT;
            }
            ev
        },
        revents: 0,
    };
    loop {
        let timeout_ms = match deadline.remaining() {
            None => -1,
            Some(left) => left.as_millis().min(i32::MAX as u128) as i32,
        };
        let rc = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
        match rc {
            0 => return Err(Error::TimedOut),
            n if n > 0 => return Ok(()),
            _ => {
                let err = std::io::Error::last_os_error();
                if err.kind() != std::io::ErrorKind::Interrupted {
                    return Err(err.into());
                }
            }
        }
    }
}

/// Reads from a non-blocking fd, waiting for readability when needed.
pub(crate) fn read_fd(fd: RawFd, buf: &mut [u8], deadline: Deadline) -> Result<usize> {
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = std::io::Error::last_os_error();
        match err.kind() {
            std::io::ErrorKind::WouldBlock => {
                wait_io_deadline(fd, IoEvents::READ, deadline)?;
            }
            std::io::ErrorKind::Interrupted => {}
            _ => return Err(err.into()),
        }
    }
}

/// Writes to a non-blocking fd, waiting for writability when needed.
pub(crate) fn write_fd(fd: RawFd, buf: &[u8], deadline: Deadline) -> Result<usize> {
    loop {
        let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = std::io::Error::last_os_error();
        match err.kind() {
            std::io::ErrorKind::WouldBlock => {
                wait_io_deadline(fd, IoEvents::WRITE, deadline)?;
            }
            std::io::ErrorKind::Interrupted => {}
            _ => return Err(err.into()),
        }
    }
}

/// Bytes pending in the socket receive buffer (`FIONREAD`).
pub(crate) fn bytes_pending(fd: RawFd) -> usize {
    let mut n: libc::c_int = 0;
    let rc = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut n) };
    if rc < 0 {
        0
    } else {
        n.max(0) as usize
    }
}
