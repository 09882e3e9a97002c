//! Fiber-aware UNIX domain stream sockets.
//!
//! Same handle model as TCP: a connection is a clonable descriptor
//! handle, closed when the last clone drops.

use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::os::unix::net as std_unix;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Deadline, INFINITY};
use crate::error::{Error, Result};
use crate::net::{self, IoEvents};
use crate::stream::{ConnectionStream, InputStream, IoMode, OutputStream};

#[derive(Debug)]
struct UnixInner {
    fd: AtomicI32,
}

const CLOSED: i32 = -1;

impl UnixInner {
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

impl Drop for UnixInner {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Debug, Clone)]
pub struct UnixConnection {
    inner: Arc<UnixInner>,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl UnixConnection {
    pub fn connect(path: &Path) -> Result<Self> {
        let stream = std_unix::UnixStream::connect(path)?;
        stream.set_nonblocking(true)?;
        Ok(Self::from_std(stream))
    }

    pub(crate) fn from_std(stream: std_unix::UnixStream) -> Self {
        Self {
            inner: Arc::new(UnixInner {
                fd: AtomicI32::new(stream.into_raw_fd()),
            }),
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

    fn fd(&self) -> Result<RawFd> {
        self.inner.fd()
    }
}

impl InputStream for UnixConnection {
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

impl OutputStream for UnixConnection {
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

impl ConnectionStream for UnixConnection {
    fn connected(&self) -> bool {
        self.fd().is_ok()
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close();
        Ok(())
    }

    fn try_clone(&self) -> Result<Box<dyn ConnectionStream + Send>> {
        Ok(Box::new(self.clone()))
    }
}

pub struct UnixListener {
    inner: std_unix::UnixListener,
    path: PathBuf,
}

impl UnixListener {
    /// Binds a listening socket at `path`, replacing a stale socket file
    /// left behind by a previous run.
    pub fn bind(path: &Path) -> Result<Self> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let listener = std_unix::UnixListener::bind(path)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            inner: listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn accept(&self) -> Result<UnixConnection> {
        loop {
            match self.inner.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(true)?;
                    return Ok(UnixConnection::from_std(stream));
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

impl Drop for UnixListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

impl std::fmt::Debug for UnixListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnixListener").field("path", &self.path).finish()
    }
}
