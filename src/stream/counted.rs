//! Fixed-length framing adapters.
//!
//! [`CountedReader`] exposes exactly `limit` bytes of its inner stream and
//! reports end-of-stream at the limit; an inner eof before the limit is a
//! transport error. [`CountedWriter`] refuses writes beyond the declared
//! length and fails `finalize` when fewer bytes were written, which is how
//! a short `Content-Length` body surfaces.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::stream::{InputStream, IoMode, OutputStream};

pub struct CountedReader<R> {
    inner: R,
    remaining: u64,
}

impl<R: InputStream> CountedReader<R> {
    pub fn new(inner: R, limit: u64) -> Self {
        Self {
            inner,
            remaining: limit,
        }
    }

    /// Bytes not yet consumed out of the declared length.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }
}

impl<R: InputStream> InputStream for CountedReader<R> {
    fn read(&mut self, buf: &mut [u8], mode: IoMode) -> Result<usize> {
        if self.remaining == 0 {
            if mode == IoMode::All && !buf.is_empty() {
                return Err(crate::stream::unexpected_eof());
            }
            return Ok(0);
        }
        let want = (buf.len() as u64).min(self.remaining) as usize;
        if mode == IoMode::All && (want as u64) < buf.len() as u64 {
            // The caller asks for more than the frame holds.
            return Err(crate::stream::unexpected_eof());
        }
        let n = self.inner.read(&mut buf[..want], mode)?;
        if n == 0 && mode == IoMode::Once {
            // Inner stream ended inside the frame.
            return Err(crate::stream::unexpected_eof());
        }
        self.remaining -= n as u64;
        Ok(n)
    }

    fn least_size(&mut self) -> Result<u64> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let inner = self.inner.least_size()?;
        if inner == 0 {
            return Err(crate::stream::unexpected_eof());
        }
        Ok(inner.min(self.remaining))
    }

    fn data_available(&self) -> usize {
        (self.inner.data_available() as u64).min(self.remaining) as usize
    }

    fn peek(&mut self) -> Result<&[u8]> {
        let remaining = self.remaining as usize;
        let view = self.inner.peek()?;
        let n = view.len().min(remaining);
        Ok(&view[..n])
    }

    fn wait_for_data(&mut self, timeout: Duration) -> Result<bool> {
        if self.remaining == 0 {
            return Ok(true);
        }
        self.inner.wait_for_data(timeout)
    }
}

pub struct CountedWriter<W> {
    inner: W,
    remaining: u64,
    finalized: bool,
}

impl<W: OutputStream> CountedWriter<W> {
    pub fn new(inner: W, limit: u64) -> Self {
        Self {
            inner,
            remaining: limit,
            finalized: false,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: OutputStream> OutputStream for CountedWriter<W> {
    fn write(&mut self, buf: &[u8], mode: IoMode) -> Result<usize> {
        if self.finalized {
            return Err(Error::usage("write after finalize"));
        }
        if buf.len() as u64 > self.remaining {
            return Err(Error::usage(
                "write exceeds the declared fixed length of the stream",
            ));
        }
        let n = self.inner.write(buf, mode)?;
        self.remaining -= n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }

    fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        if self.remaining > 0 {
            return Err(Error::usage(
                "stream finalized before the declared fixed length was written",
            ));
        }
        self.finalized = true;
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemoryStream;

    #[test]
    fn reader_stops_at_limit() {
        let mut r = CountedReader::new(MemoryStream::from_vec(b"abcdefgh".to_vec()), 5);
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"abcde");
        assert!(r.empty().unwrap());
        // Unread tail stays in the inner stream.
        assert_eq!(r.into_inner().data_available(), 3);
    }

    #[test]
    fn reader_rejects_short_inner() {
        let mut r = CountedReader::new(MemoryStream::from_vec(b"ab".to_vec()), 5);
        let mut buf = [0u8; 5];
        assert!(r.read(&mut buf, IoMode::All).is_err());
    }

    #[test]
    fn writer_enforces_exact_length() {
        let mut w = CountedWriter::new(MemoryStream::new(), 5);
        w.write_all(b"abc").unwrap();
        assert!(w.finalize().is_err());
        w.write_all(b"de").unwrap();
        w.finalize().unwrap();
        assert!(w.write_all(b"x").is_err());
        assert_eq!(w.into_inner().as_slice(), b"abcde");
    }
}
