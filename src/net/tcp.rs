//! Fiber-aware TCP transport.
//!
//! A [`TcpConnection`] is a cheap clonable handle to one socket, so a
//! reader view and a writer view can coexist; the descriptor closes when
//! the last handle drops or on an explicit [`close`](ConnectionStream::close).
//! [`split`](TcpConnection::split) narrows two clones down to dedicated
//! reader/writer halves for handing to separate fibers.

use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use crate::clock::{Deadline, INFINITY};
use crate::error::{Error, Result};
use crate::net::{self, IoEvents};
use crate::stream::{ConnectionStream, InputStream, IoMode, OutputStream};

/// Socket descriptor shared by all handle clones; closed exactly once.
#[derive(Debug)]
struct TcpInner {
    fd: AtomicI32,
}

const CLOSED: i32 = -1;

impl TcpInner {
    fn fd(&self) -> Result<RawFd> {
        match self.fd.load(Ordering::Acquire) {
            CLOSED => Err(Error::Io(std::io::ErrorKind::NotConnected.into())),
            fd => Ok(fd),
        }
    }

    fn close(&self) {
        let fd = self.fd.swap(CLOSED, Ordering::AcqRel);
        if fd != CLOSED {
            unsafe { libc::close(fd) };
        }
    }
}

impl Drop for TcpInner {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Debug, Clone)]
pub struct TcpConnection {
    inner: Arc<TcpInner>,
    peer: Option<SocketAddr>,
    local: Option<SocketAddr>,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl TcpConnection {
    /// Opens a TCP connection to `host:port`, resolving the host and
    /// trying each address until one connects. Yields the current fiber
    /// while the connect is in flight.
    pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        Self::connect_from(host, port, None, timeout)
    }

    /// Like [`connect`](Self::connect), optionally binding the local side
    /// to a specific interface address first.
    pub fn connect_from(
        host: &str,
        port: u16,
        local: Option<std::net::IpAddr>,
        timeout: Duration,
    ) -> Result<Self> {
        let deadline = Deadline::after(timeout);
        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|e| Error::Io(e))?
            .collect();
        if addrs.is_empty() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("failed to resolve '{host}'"),
            )));
        }
        let mut last = None;
        for addr in addrs {
            match Self::connect_single(addr, local, deadline) {
                Ok(conn) => return Ok(conn),
                Err(e) => last = Some(e),
            }
        }
        Err(last.expect("at least one address was tried"))
    }

    fn connect_single(
        addr: SocketAddr,
        local: Option<std::net::IpAddr>,
        deadline: Deadline,
    ) -> Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        if let Some(ip) = local {
            socket.bind(&SocketAddr::new(ip, 0).into())?;
        }
        match socket.connect(&addr.into()) {
            Ok(()) => {}
            Err(e)
                if e.raw_os_error() == Some(libc::EINPROGRESS)
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                net::wait_io_deadline(socket.as_raw_fd(), IoEvents::WRITE, deadline)?;
                if let Some(err) = socket.take_error()? {
                    return Err(err.into());
                }
            }
            Err(e) => return Err(e.into()),
        }
        let local = socket.local_addr().ok().and_then(|a| a.as_socket());
        Ok(Self::from_raw(socket.into_raw_fd(), Some(addr), local))
    }

    /// Wraps an already-connected non-blocking socket.
    pub(crate) fn from_raw(
        fd: RawFd,
        peer: Option<SocketAddr>,
        local: Option<SocketAddr>,
    ) -> Self {
        Self {
            inner: Arc::new(TcpInner {
                fd: AtomicI32::new(fd),
            }),
            peer,
            local,
            read_timeout: INFINITY,
            write_timeout: INFINITY,
        }
    }

    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_timeout = timeout;
    }

    pub fn set_write_timeout(&mut self, timeout: Duration) {
        self.write_timeout = timeout;
    }

    pub fn set_nodelay(&self, nodelay: bool) -> Result<()> {
        self.setsockopt(libc::IPPROTO_TCP, libc::TCP_NODELAY, nodelay as libc::c_int)
    }

    pub fn set_keepalive(&self, keepalive: bool) -> Result<()> {
        self.setsockopt(libc::SOL_SOCKET, libc::SO_KEEPALIVE, keepalive as libc::c_int)
    }

    fn setsockopt(&self, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> Result<()> {
        let fd = self.inner.fd()?;
        let rc = unsafe {
            libc::setsockopt(
                fd,
                level,
                name,
                (&value as *const libc::c_int).cast(),
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    /// Splits the connection into a read half and a write half, each
    /// suitable for a separate fiber. The socket closes when both halves
    /// (and every other clone) are gone.
    pub fn split(self) -> (TcpReadHalf, TcpWriteHalf) {
        (TcpReadHalf(self.clone()), TcpWriteHalf(self))
    }

    fn fd(&self) -> Result<RawFd> {
        self.inner.fd()
    }
}

impl InputStream for TcpConnection {
    fn read(&mut self, buf: &mut [u8], mode: IoMode) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let fd = self.fd()?;
        let deadline = Deadline::after(self.read_timeout);
        match mode {
            IoMode::Once => net::read_fd(fd, buf, deadline),
            IoMode::All => {
                let mut done = 0;
                while done < buf.len() {
                    let n = net::read_fd(fd, &mut buf[done..], deadline)?;
                    if n == 0 {
                        return Err(crate::stream::unexpected_eof());
                    }
                    done += n;
                }
                Ok(done)
            }
            IoMode::Immediate => {
                let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
                if n >= 0 {
                    return Ok(n as usize);
                }
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::WouldBlock {
                    Ok(0)
                } else {
                    Err(err.into())
                }
            }
        }
    }

    fn least_size(&mut self) -> Result<u64> {
        let fd = self.fd()?;
        let pending = net::bytes_pending(fd);
        if pending > 0 {
            return Ok(pending as u64);
        }
        net::wait_io_deadline(fd, IoEvents::READ, Deadline::after(self.read_timeout))?;
        Ok(net::bytes_pending(fd) as u64)
    }

    fn data_available(&self) -> usize {
        match self.fd() {
            Ok(fd) => net::bytes_pending(fd),
            Err(_) => 0,
        }
    }

    fn wait_for_data(&mut self, timeout: Duration) -> Result<bool> {
        let fd = self.fd()?;
        if net::bytes_pending(fd) > 0 {
            return Ok(true);
        }
        match net::wait_io_deadline(fd, IoEvents::READ, Deadline::after(timeout)) {
            Ok(()) => Ok(true),
            Err(Error::TimedOut) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

impl OutputStream for TcpConnection {
    fn write(&mut self, buf: &[u8], mode: IoMode) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let fd = self.fd()?;
        let deadline = Deadline::after(self.write_timeout);
        match mode {
            IoMode::Once => net::write_fd(fd, buf, deadline),
            IoMode::All => {
                let mut done = 0;
                while done < buf.len() {
                    done += net::write_fd(fd, &buf[done..], deadline)?;
                }
                Ok(done)
            }
            IoMode::Immediate => {
                let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
                if n >= 0 {
                    return Ok(n as usize);
                }
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::WouldBlock {
                    Ok(0)
                } else {
                    Err(err.into())
                }
            }
        }
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Half-closes the write side so the peer observes end-of-stream.
    fn finalize(&mut self) -> Result<()> {
        let fd = self.fd()?;
        if unsafe { libc::shutdown(fd, libc::SHUT_WR) } < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::NotConnected {
                return Err(err.into());
            }
        }
        Ok(())
    }
}

impl ConnectionStream for TcpConnection {
    fn connected(&self) -> bool {
        self.fd().is_ok()
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close();
        Ok(())
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    fn try_clone(&self) -> Result<Box<dyn ConnectionStream + Send>> {
        Ok(Box::new(self.clone()))
    }
}

/// Read-only view of a split [`TcpConnection`].
#[derive(Debug)]
pub struct TcpReadHalf(TcpConnection);

impl InputStream for TcpReadHalf {
    fn read(&mut self, buf: &mut [u8], mode: IoMode) -> Result<usize> {
        self.0.read(buf, mode)
    }
    fn least_size(&mut self) -> Result<u64> {
        self.0.least_size()
    }
    fn data_available(&self) -> usize {
        self.0.data_available()
    }
    fn wait_for_data(&mut self, timeout: Duration) -> Result<bool> {
        self.0.wait_for_data(timeout)
    }
}

/// Write-only view of a split [`TcpConnection`].
#[derive(Debug)]
pub struct TcpWriteHalf(TcpConnection);

impl OutputStream for TcpWriteHalf {
    fn write(&mut self, buf: &[u8], mode: IoMode) -> Result<usize> {
        self.0.write(buf, mode)
    }
    fn flush(&mut self) -> Result<()> {
        self.0.flush()
    }
    fn finalize(&mut self) -> Result<()> {
        self.0.finalize()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Listener
////////////////////////////////////////////////////////////////////////////////

pub struct TcpListener {
    inner: std::net::TcpListener,
}

impl TcpListener {
    /// Binds a listening socket; port 0 requests an ephemeral port, the
    /// actual one is available via [`local_addr`](Self::local_addr).
    pub fn bind(addr: &str, port: u16) -> Result<Self> {
        let listener = std::net::TcpListener::bind((addr, port))?;
        listener.set_nonblocking(true)?;
        Ok(Self { inner: listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }

    /// Accepts the next incoming connection, suspending the fiber until
    /// one arrives.
    pub fn accept(&self) -> Result<TcpConnection> {
        loop {
            match self.inner.accept() {
                Ok((stream, peer)) => {
                    stream.set_nonblocking(true)?;
                    let local = stream.local_addr().ok();
                    return Ok(TcpConnection::from_raw(
                        stream.into_raw_fd(),
                        Some(peer),
                        local,
                    ));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    net::wait_io_deadline(
                        self.inner.as_raw_fd(),
                        IoEvents::READ,
                        Deadline::NEVER,
                    )?;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl std::fmt::Debug for TcpListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpListener")
            .field("local_addr", &self.inner.local_addr().ok())
            .finish()
    }
}
