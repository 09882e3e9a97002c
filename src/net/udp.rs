//! Fiber-aware UDP transport.

use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use crate::clock::{Deadline, INFINITY};
use crate::error::{Error, Result};
use crate::net::{self, IoEvents};

pub struct UdpSocket {
    inner: std::net::UdpSocket,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl UdpSocket {
    pub fn bind(addr: &str, port: u16) -> Result<Self> {
        let socket = std::net::UdpSocket::bind((addr, port))?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            inner: socket,
            read_timeout: INFINITY,
            write_timeout: INFINITY,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }

    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_timeout = timeout;
    }

    pub fn set_write_timeout(&mut self, timeout: Duration) {
        self.write_timeout = timeout;
    }

    /// Fixes the default destination for [`send`](Self::send) and filters
    /// inbound datagrams to that peer.
    pub fn connect<A: ToSocketAddrs>(&self, addr: A) -> Result<()> {
        Ok(self.inner.connect(addr)?)
    }

    pub fn send(&self, buf: &[u8]) -> Result<usize> {
        let deadline = Deadline::after(self.write_timeout);
        loop {
            match self.inner.send(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    net::wait_io_deadline(self.inner.as_raw_fd(), IoEvents::WRITE, deadline)?;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn send_to<A: ToSocketAddrs>(&self, buf: &[u8], addr: A) -> Result<usize> {
        let addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::usage("empty destination address"))?;
        let deadline = Deadline::after(self.write_timeout);
        loop {
            match self.inner.send_to(buf, addr) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    net::wait_io_deadline(self.inner.as_raw_fd(), IoEvents::WRITE, deadline)?;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let deadline = Deadline::after(self.read_timeout);
        loop {
            match self.inner.recv(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    net::wait_io_deadline(self.inner.as_raw_fd(), IoEvents::READ, deadline)?;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let deadline = Deadline::after(self.read_timeout);
        loop {
            match self.inner.recv_from(buf) {
                Ok(res) => return Ok(res),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    net::wait_io_deadline(self.inner.as_raw_fd(), IoEvents::READ, deadline)?;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl std::fmt::Debug for UdpSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpSocket")
            .field("local_addr", &self.inner.local_addr().ok())
            .finish()
    }
}
