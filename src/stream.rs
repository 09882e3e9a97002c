//! Composable byte streams.
//!
//! Every byte source and sink in the crate speaks the same small contract
//! so transports, codecs and buffers can be stacked freely: a TCP
//! connection under a buffered reader under a chunked decoder under a
//! gzip decoder is just three wrappers, each owning its inner stream
//! exclusively. A wrapper closing closes its inner stream.
//!
//! The capability set is split into traits so adapters only implement
//! what they can honestly provide: [`InputStream`], [`OutputStream`],
//! full-duplex [`ConnectionStream`] and seekable [`RandomAccessStream`].
//! All blocking entry points suspend the calling fiber instead of the
//! thread.

use std::io;
use std::time::Duration;

use crate::error::{Error, Result};

pub mod buffered;
pub mod chunked;
pub mod counted;
pub mod memory;
pub mod pipe;
pub mod tls;
pub mod zlib;

pub use buffered::BufferedReader;
pub use chunked::{ChunkedReader, ChunkedWriter};
pub use counted::{CountedReader, CountedWriter};
pub use memory::MemoryStream;
pub use pipe::{pipe_pair, PipeStream, TaskPipe};

/// How much a single `read`/`write` call is allowed to block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    /// Process the whole buffer or fail.
    All,
    /// Perform at most one underlying operation; for reads that means at
    /// least one byte is returned unless the stream has ended.
    Once,
    /// Only touch data that is already buffered; never suspend.
    Immediate,
}

/// A readable byte stream.
pub trait InputStream {
    /// Reads into `buf` according to `mode`; returns the number of bytes
    /// read. `Ok(0)` means end-of-stream for [`IoMode::Once`] and "nothing
    /// buffered" for [`IoMode::Immediate`].
    fn read(&mut self, buf: &mut [u8], mode: IoMode) -> Result<usize>;

    /// The minimum number of bytes known to be readable without further
    /// blocking. Waits until at least one byte is present or the stream
    /// ends (then returns 0).
    fn least_size(&mut self) -> Result<u64>;

    /// `true` once the stream has definitely ended. May wait like
    /// [`least_size`](Self::least_size).
    fn empty(&mut self) -> Result<bool> {
        Ok(self.least_size()? == 0)
    }

    /// Bytes currently buffered inside this stream, readable without any
    /// blocking.
    fn data_available(&self) -> usize {
        0
    }

    /// A borrowed view of already-buffered bytes; consumes nothing and may
    /// be empty.
    fn peek(&mut self) -> Result<&[u8]> {
        Ok(&[])
    }

    /// Waits until data is readable or the stream ends. Returns `false`
    /// on timeout, never earlier than requested.
    fn wait_for_data(&mut self, timeout: Duration) -> Result<bool>;

    /// Fills `buf` completely, failing on a premature end-of-stream.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.read(buf, IoMode::All).map(drop)
    }

    /// Reads everything until end-of-stream into `out`.
    fn read_to_end(&mut self, out: &mut Vec<u8>) -> Result<()> {
        let mut chunk = [0u8; 8192];
        loop {
            let n = self.read(&mut chunk, IoMode::Once)?;
            if n == 0 {
                return Ok(());
            }
            out.extend_from_slice(&chunk[..n]);
        }
    }

    /// Discards exactly `n` bytes, failing on a premature end-of-stream.
    fn skip(&mut self, mut n: u64) -> Result<()> {
        let mut chunk = [0u8; 8192];
        while n > 0 {
            let want = chunk.len().min(n as usize);
            self.read(&mut chunk[..want], IoMode::All)?;
            n -= want as u64;
        }
        Ok(())
    }
}

/// A writable byte stream.
pub trait OutputStream {
    /// Writes from `buf` according to `mode`; returns the bytes consumed.
    fn write(&mut self, buf: &[u8], mode: IoMode) -> Result<usize>;

    /// Pushes buffered writes downstream.
    fn flush(&mut self) -> Result<()>;

    /// Signals end-of-stream downstream. Writers that frame their output
    /// (chunked transfer) emit their terminator here. Idempotent: calling
    /// it on an already-finalized stream is a no-op.
    fn finalize(&mut self) -> Result<()>;

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.write(buf, IoMode::All).map(drop)
    }
}

/// A full-duplex stream with connection semantics.
pub trait ConnectionStream: InputStream + OutputStream {
    /// `false` once either side closed the connection.
    fn connected(&self) -> bool;

    /// Releases the connection. Propagates to the inner stream for
    /// wrappers.
    fn close(&mut self) -> Result<()>;

    fn peer_addr(&self) -> Option<std::net::SocketAddr> {
        None
    }

    fn local_addr(&self) -> Option<std::net::SocketAddr> {
        None
    }

    /// A second handle to the same connection, so one fiber can hold a
    /// reader view while a writer view lives elsewhere. The concrete
    /// transports are cheap clonable handles; adapters that cannot share
    /// their state refuse.
    fn try_clone(&self) -> Result<Box<dyn ConnectionStream + Send>> {
        Err(Error::usage("this connection type cannot be cloned"))
    }
}

impl<S: ConnectionStream + ?Sized> ConnectionStream for Box<S> {
    fn connected(&self) -> bool {
        (**self).connected()
    }
    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
    fn peer_addr(&self) -> Option<std::net::SocketAddr> {
        (**self).peer_addr()
    }
    fn local_addr(&self) -> Option<std::net::SocketAddr> {
        (**self).local_addr()
    }
    fn try_clone(&self) -> Result<Box<dyn ConnectionStream + Send>> {
        (**self).try_clone()
    }
}

/// A stream over a random-access buffer: seekable with a known length.
pub trait RandomAccessStream: InputStream + OutputStream {
    fn size(&self) -> u64;
    fn seek(&mut self, pos: u64) -> Result<()>;
    fn position(&self) -> u64;
}

////////////////////////////////////////////////////////////////////////////////
// Trait-object plumbing
////////////////////////////////////////////////////////////////////////////////

impl<S: InputStream + ?Sized> InputStream for Box<S> {
    fn read(&mut self, buf: &mut [u8], mode: IoMode) -> Result<usize> {
        (**self).read(buf, mode)
    }
    fn least_size(&mut self) -> Result<u64> {
        (**self).least_size()
    }
    fn empty(&mut self) -> Result<bool> {
        (**self).empty()
    }
    fn data_available(&self) -> usize {
        (**self).data_available()
    }
    fn peek(&mut self) -> Result<&[u8]> {
        (**self).peek()
    }
    fn wait_for_data(&mut self, timeout: Duration) -> Result<bool> {
        (**self).wait_for_data(timeout)
    }
}

impl<S: OutputStream + ?Sized> OutputStream for Box<S> {
    fn write(&mut self, buf: &[u8], mode: IoMode) -> Result<usize> {
        (**self).write(buf, mode)
    }
    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
    fn finalize(&mut self) -> Result<()> {
        (**self).finalize()
    }
}

impl<S: InputStream + ?Sized> InputStream for &mut S {
    fn read(&mut self, buf: &mut [u8], mode: IoMode) -> Result<usize> {
        (**self).read(buf, mode)
    }
    fn least_size(&mut self) -> Result<u64> {
        (**self).least_size()
    }
    fn empty(&mut self) -> Result<bool> {
        (**self).empty()
    }
    fn data_available(&self) -> usize {
        (**self).data_available()
    }
    fn peek(&mut self) -> Result<&[u8]> {
        (**self).peek()
    }
    fn wait_for_data(&mut self, timeout: Duration) -> Result<bool> {
        (**self).wait_for_data(timeout)
    }
}

impl<S: OutputStream + ?Sized> OutputStream for &mut S {
    fn write(&mut self, buf: &[u8], mode: IoMode) -> Result<usize> {
        (**self).write(buf, mode)
    }
    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
    fn finalize(&mut self) -> Result<()> {
        (**self).finalize()
    }
}

////////////////////////////////////////////////////////////////////////////////
// std::io interop
////////////////////////////////////////////////////////////////////////////////

/// The transport-level "stream ended mid-read" error. A partial read at
/// eof is an I/O failure, not a protocol one.
pub(crate) fn unexpected_eof() -> Error {
    Error::Io(io::ErrorKind::UnexpectedEof.into())
}

/// Converts a crate error into an `io::Error` preserving enough shape to
/// round-trip back through [`from_io`].
pub(crate) fn to_io(e: Error) -> io::Error {
    match e {
        Error::Io(e) => e,
        Error::TimedOut => io::Error::new(io::ErrorKind::TimedOut, Error::TimedOut),
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

/// Recovers a crate error smuggled through the std::io layer.
pub(crate) fn from_io(e: io::Error) -> Error {
    if e.get_ref().map_or(false, |inner| inner.is::<Error>()) {
        let inner = e.into_inner().expect("checked above");
        return *inner.downcast::<Error>().expect("checked above");
    }
    if e.kind() == io::ErrorKind::TimedOut {
        return Error::TimedOut;
    }
    Error::Io(e)
}

/// Presents an [`InputStream`] as [`io::Read`] for codec layers built on
/// std::io (gzip, TLS record pumps).
pub(crate) struct ReadBridge<S>(pub S);

impl<S: InputStream> io::Read for ReadBridge<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf, IoMode::Once).map_err(to_io)
    }
}

/// Presents an [`OutputStream`] as [`io::Write`].
pub(crate) struct WriteBridge<S>(pub S);

impl<S: OutputStream> io::Write for WriteBridge<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf, IoMode::All).map_err(to_io)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush().map_err(to_io)
    }
}
