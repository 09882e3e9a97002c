//! An in-memory stream over a growable byte buffer.

use std::time::Duration;

use crate::error::Result;
use crate::stream::{InputStream, IoMode, OutputStream, RandomAccessStream};

/// Reads consume from the current position; writes overwrite from the
/// current position and grow the buffer past its end. The end of the
/// buffer is the end of the stream.
#[derive(Debug, Default, Clone)]
pub struct MemoryStream {
    buf: Vec<u8>,
    pos: usize,
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(buf: Vec<u8>) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

impl InputStream for MemoryStream {
    fn read(&mut self, buf: &mut [u8], mode: IoMode) -> Result<usize> {
        let n = self.remaining().min(buf.len());
        if mode == IoMode::All && n < buf.len() {
            return Err(crate::stream::unexpected_eof());
        }
        buf[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn least_size(&mut self) -> Result<u64> {
        Ok(self.remaining() as u64)
    }

    fn data_available(&self) -> usize {
        self.remaining()
    }

    fn peek(&mut self) -> Result<&[u8]> {
        Ok(&self.buf[self.pos..])
    }

    fn wait_for_data(&mut self, _timeout: Duration) -> Result<bool> {
        Ok(true)
    }
}

impl OutputStream for MemoryStream {
    fn write(&mut self, buf: &[u8], _mode: IoMode) -> Result<usize> {
        let overwrite = self.remaining().min(buf.len());
        self.buf[self.pos..self.pos + overwrite].copy_from_slice(&buf[..overwrite]);
        self.buf.extend_from_slice(&buf[overwrite..]);
        self.pos += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        Ok(())
    }
}

impl RandomAccessStream for MemoryStream {
    fn size(&self) -> u64 {
        self.buf.len() as u64
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        if pos > self.buf.len() as u64 {
            return Err(crate::error::Error::usage("seek past the end of the buffer"));
        }
        self.pos = pos as usize;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.pos as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_seek_then_read() {
        let mut s = MemoryStream::new();
        s.write_all(b"hello world").unwrap();
        s.seek(6).unwrap();
        let mut buf = [0u8; 5];
        s.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"world");
        assert!(s.empty().unwrap());
    }

    #[test]
    fn overwrite_in_the_middle() {
        let mut s = MemoryStream::from_vec(b"abcdef".to_vec());
        s.seek(2).unwrap();
        s.write_all(b"XY").unwrap();
        assert_eq!(s.as_slice(), b"abXYef");
    }
}
