//! A buffered reader adapter.
//!
//! Wraps any [`InputStream`] with a bounded internal buffer, turning
//! edge-style readiness into level-triggered reads and adding the
//! delimiter-oriented operations the protocol parsers need:
//! [`peek`](BufferedReader::peek), [`read_until`](BufferedReader::read_until)
//! and [`read_line`](BufferedReader::read_line).

use std::time::Duration;

use crate::error::{ProtocolError, Result};
use crate::stream::{InputStream, IoMode};

const DEFAULT_CAPACITY: usize = 8 * 1024;

pub struct BufferedReader<R> {
    inner: R,
    buf: Vec<u8>,
    pos: usize,
    end: usize,
    eof: bool,
}

impl<R: InputStream> BufferedReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_capacity(DEFAULT_CAPACITY, inner)
    }

    pub fn with_capacity(capacity: usize, inner: R) -> Self {
        Self {
            inner,
            buf: vec![0; capacity.max(64)],
            pos: 0,
            end: 0,
            eof: false,
        }
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Discards buffered bytes and returns the inner stream.
    pub fn into_inner(self) -> R {
        self.inner
    }

    #[inline]
    fn buffered(&self) -> usize {
        self.end - self.pos
    }

    fn compact(&mut self) {
        if self.pos > 0 {
            self.buf.copy_within(self.pos..self.end, 0);
            self.end -= self.pos;
            self.pos = 0;
        }
    }

    /// Pulls more bytes from the inner stream into the buffer, growing it
    /// up to `limit` bytes of buffered data. Returns the number of new
    /// bytes (0 at eof or, in `Immediate` mode, when nothing is pending).
    fn refill(&mut self, mode: IoMode, limit: usize) -> Result<usize> {
        if self.eof {
            return Ok(0);
        }
        self.compact();
        if self.end == self.buf.len() {
            let target = (self.buf.len() * 2).min(limit.max(self.buf.len()));
            if target <= self.buf.len() {
                return Ok(0);
            }
            self.buf.resize(target, 0);
        }
        let n = self.inner.read(&mut self.buf[self.end..], mode)?;
        self.end += n;
        if n == 0 && mode == IoMode::Once {
            self.eof = true;
        }
        Ok(n)
    }

    fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.buffered());
        self.pos += n;
    }

    /// Reads bytes up to and including the delimiter, returning them with
    /// the delimiter stripped. Fails with a protocol error when the
    /// delimiter does not occur within `max` bytes, and with
    /// `UnexpectedEof` when the stream ends first.
    pub fn read_until(&mut self, delim: &[u8], max: usize) -> Result<Vec<u8>> {
        debug_assert!(!delim.is_empty());
        let mut searched = 0;
        loop {
            let window = &self.buf[self.pos..self.end];
            if let Some(at) = find(window, delim, searched) {
                let mut line = Vec::with_capacity(at);
                line.extend_from_slice(&window[..at]);
                self.consume(at + delim.len());
                return Ok(line);
            }
            // Everything before the final delim.len()-1 bytes has been
            // ruled out; do not rescan it.
            searched = window.len().saturating_sub(delim.len() - 1);
            if searched > max {
                return Err(ProtocolError::LimitExceeded("delimiter not found").into());
            }
            if self.refill(IoMode::Once, max + delim.len())? == 0 {
                return Err(ProtocolError::UnexpectedEof.into());
            }
        }
    }

    /// Reads one line terminated by CRLF or a bare LF; the terminator is
    /// stripped.
    pub fn read_line(&mut self, max: usize) -> Result<String> {
        let mut line = self.read_until(b"\n", max)?;
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        String::from_utf8(line).map_err(|_| ProtocolError::InvalidHeader.into())
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    (from..=haystack.len() - needle.len()).find(|&i| &haystack[i..i + needle.len()] == needle)
}

impl<R: InputStream> InputStream for BufferedReader<R> {
    fn read(&mut self, buf: &mut [u8], mode: IoMode) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match mode {
            IoMode::All => {
                let have = self.buffered().min(buf.len());
                buf[..have].copy_from_slice(&self.buf[self.pos..self.pos + have]);
                self.consume(have);
                if have < buf.len() {
                    self.inner.read(&mut buf[have..], IoMode::All)?;
                }
                Ok(buf.len())
            }
            IoMode::Once => {
                if self.buffered() == 0 && self.refill(IoMode::Once, self.buf.len())? == 0 {
                    return Ok(0);
                }
                let n = self.buffered().min(buf.len());
                buf[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
                self.consume(n);
                Ok(n)
            }
            IoMode::Immediate => {
                if self.buffered() == 0 {
                    self.refill(IoMode::Immediate, self.buf.len())?;
                }
                let n = self.buffered().min(buf.len());
                buf[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
                self.consume(n);
                Ok(n)
            }
        }
    }

    fn least_size(&mut self) -> Result<u64> {
        if self.buffered() == 0 {
            self.refill(IoMode::Once, self.buf.len())?;
        }
        Ok(self.buffered() as u64)
    }

    fn data_available(&self) -> usize {
        self.buffered() + self.inner.data_available()
    }

    fn peek(&mut self) -> Result<&[u8]> {
        if self.buffered() == 0 {
            self.refill(IoMode::Immediate, self.buf.len())?;
        }
        Ok(&self.buf[self.pos..self.end])
    }

    fn wait_for_data(&mut self, timeout: Duration) -> Result<bool> {
        if self.buffered() > 0 {
            return Ok(true);
        }
        if self.eof {
            return Ok(true);
        }
        self.inner.wait_for_data(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemoryStream;

    fn reader(data: &[u8]) -> BufferedReader<MemoryStream> {
        BufferedReader::with_capacity(16, MemoryStream::from_vec(data.to_vec()))
    }

    #[test]
    fn read_until_strips_delimiter() {
        let mut r = reader(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(r.read_until(b"\r\n", 1024).unwrap(), b"GET / HTTP/1.1");
        assert_eq!(r.read_until(b"\r\n", 1024).unwrap(), b"Host: x");
        assert_eq!(r.read_until(b"\r\n", 1024).unwrap(), b"");
    }

    #[test]
    fn read_until_spans_refills() {
        // Delimiter far beyond the initial 16-byte capacity.
        let mut data = vec![b'a'; 100];
        data.extend_from_slice(b"\r\nrest");
        let mut r = reader(&data);
        assert_eq!(r.read_until(b"\r\n", 1024).unwrap(), vec![b'a'; 100]);
        let mut rest = [0u8; 4];
        r.read_exact(&mut rest).unwrap();
        assert_eq!(&rest, b"rest");
    }

    #[test]
    fn read_until_respects_max() {
        let mut r = reader(&[b'x'; 256]);
        assert!(r.read_until(b"\r\n", 64).is_err());
    }

    #[test]
    fn read_line_handles_bare_lf() {
        let mut r = reader(b"one\ntwo\r\n");
        assert_eq!(r.read_line(64).unwrap(), "one");
        assert_eq!(r.read_line(64).unwrap(), "two");
    }

    #[test]
    fn peek_does_not_consume() {
        let mut r = reader(b"abc");
        assert_eq!(r.peek().unwrap(), b"abc");
        let mut buf = [0u8; 3];
        r.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"abc");
    }
}
