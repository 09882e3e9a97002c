//! HTTP/1 chunked transfer-coding adapters (RFC 7230 §4.1).
//!
//! The reader converts chunk frames into a plain byte stream terminating
//! on the zero chunk; chunk extensions and trailers are tolerated and
//! discarded. The writer emits each `write` as one chunk and writes the
//! terminating chunk on `finalize`, exactly once; forgetting to finalize
//! leaves the message unterminated on the wire.

use std::time::Duration;

use crate::error::{Error, ProtocolError, Result};
use crate::stream::{InputStream, IoMode, OutputStream};

const MAX_CHUNK_HEADER: usize = 1024;

pub struct ChunkedReader<R> {
    inner: R,
    /// Bytes left in the current chunk.
    remaining: u64,
    finished: bool,
    /// Between chunks the previous chunk's trailing CRLF is still pending.
    pending_crlf: bool,
}

impl<R: InputStream> ChunkedReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            remaining: 0,
            finished: false,
            pending_crlf: false,
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// `true` once the terminating zero chunk (and its trailers) have
    /// been consumed.
    pub fn finished(&self) -> bool {
        self.finished
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    fn read_header_line(&mut self) -> Result<Vec<u8>> {
        // One byte at a time: the bytes after the chunk header belong to
        // the caller, so no over-read is permitted here. The inner stream
        // is buffered in every protocol stack, which keeps this cheap.
        let mut line = Vec::with_capacity(16);
        loop {
            let mut byte = [0u8; 1];
            if self.inner.read(&mut byte, IoMode::Once)? == 0 {
                return Err(ProtocolError::UnexpectedEof.into());
            }
            if byte[0] == b'\n' {
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(line);
            }
            line.push(byte[0]);
            if line.len() > MAX_CHUNK_HEADER {
                return Err(ProtocolError::InvalidChunk("oversized chunk header").into());
            }
        }
    }

    /// Positions `remaining` at the next chunk's payload; detects the
    /// zero chunk and swallows any trailers.
    fn next_chunk(&mut self) -> Result<()> {
        if self.pending_crlf {
            let line = self.read_header_line()?;
            if !line.is_empty() {
                return Err(ProtocolError::InvalidChunk("missing chunk terminator").into());
            }
            self.pending_crlf = false;
        }
        let line = self.read_header_line()?;
        // Chunk extensions after ';' are tolerated and ignored.
        let size_part = match line.iter().position(|&b| b == b';') {
            Some(at) => &line[..at],
            None => &line[..],
        };
        let size_str = std::str::from_utf8(size_part)
            .map_err(|_| ProtocolError::InvalidChunk("non-ascii chunk size"))?
            .trim();
        let size = u64::from_str_radix(size_str, 16)
            .map_err(|_| ProtocolError::InvalidChunk("invalid chunk size"))?;
        if size == 0 {
            // Discard optional trailers up to the empty line.
            loop {
                let trailer = self.read_header_line()?;
                if trailer.is_empty() {
                    break;
                }
            }
            self.finished = true;
        } else {
            self.remaining = size;
        }
        Ok(())
    }

    fn ensure_chunk(&mut self) -> Result<bool> {
        while self.remaining == 0 {
            if self.finished {
                return Ok(false);
            }
            self.next_chunk()?;
        }
        Ok(true)
    }
}

impl<R: InputStream> InputStream for ChunkedReader<R> {
    fn read(&mut self, buf: &mut [u8], mode: IoMode) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match mode {
            IoMode::All => {
                let mut done = 0;
                while done < buf.len() {
                    if !self.ensure_chunk()? {
                        return Err(crate::stream::unexpected_eof());
                    }
                    let want = (buf.len() - done).min(self.remaining as usize);
                    self.inner.read(&mut buf[done..done + want], IoMode::All)?;
                    self.remaining -= want as u64;
                    if self.remaining == 0 {
                        self.pending_crlf = true;
                    }
                    done += want;
                }
                Ok(done)
            }
            IoMode::Once => {
                if !self.ensure_chunk()? {
                    return Ok(0);
                }
                let want = buf.len().min(self.remaining as usize);
                let n = self.inner.read(&mut buf[..want], IoMode::Once)?;
                if n == 0 {
                    return Err(ProtocolError::UnexpectedEof.into());
                }
                self.remaining -= n as u64;
                if self.remaining == 0 {
                    self.pending_crlf = true;
                }
                Ok(n)
            }
            IoMode::Immediate => {
                if self.remaining == 0 {
                    return Ok(0);
                }
                let want = buf.len().min(self.remaining as usize);
                let n = self.inner.read(&mut buf[..want], IoMode::Immediate)?;
                self.remaining -= n as u64;
                if self.remaining == 0 && n > 0 {
                    self.pending_crlf = true;
                }
                Ok(n)
            }
        }
    }

    fn least_size(&mut self) -> Result<u64> {
        if !self.ensure_chunk()? {
            return Ok(0);
        }
        let inner = self.inner.least_size()?;
        if inner == 0 {
            return Err(crate::stream::unexpected_eof());
        }
        Ok(self.remaining.min(inner))
    }

    fn data_available(&self) -> usize {
        (self.inner.data_available() as u64).min(self.remaining) as usize
    }

    fn wait_for_data(&mut self, timeout: Duration) -> Result<bool> {
        if self.finished || self.remaining > 0 && self.inner.data_available() > 0 {
            return Ok(true);
        }
        self.inner.wait_for_data(timeout)
    }
}

pub struct ChunkedWriter<W> {
    inner: W,
    finalized: bool,
}

impl<W: OutputStream> ChunkedWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            finalized: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: OutputStream> OutputStream for ChunkedWriter<W> {
    fn write(&mut self, buf: &[u8], _mode: IoMode) -> Result<usize> {
        if self.finalized {
            return Err(Error::usage("write after finalize"));
        }
        if buf.is_empty() {
            // A zero-length chunk would terminate the stream.
            return Ok(0);
        }
        let header = format!("{:x}\r\n", buf.len());
        self.inner.write_all(header.as_bytes())?;
        self.inner.write_all(buf)?;
        self.inner.write_all(b"\r\n")?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }

    fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;
        self.inner.write_all(b"0\r\n\r\n")?;
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemoryStream;

    #[test]
    fn writer_frames_and_terminates() {
        let mut w = ChunkedWriter::new(MemoryStream::new());
        w.write_all(b"hello").unwrap();
        w.write_all(b"!").unwrap();
        w.finalize().unwrap();
        w.finalize().unwrap(); // idempotent
        assert_eq!(
            w.into_inner().as_slice(),
            b"5\r\nhello\r\n1\r\n!\r\n0\r\n\r\n"
        );
    }

    #[test]
    fn reader_decodes_frames() {
        let wire = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n".to_vec();
        let mut r = ChunkedReader::new(MemoryStream::from_vec(wire));
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"Wikipedia");
        assert!(r.empty().unwrap());
    }

    #[test]
    fn reader_tolerates_extensions_and_trailers() {
        let wire = b"5;name=val\r\nhello\r\n0\r\nX-Trailer: 1\r\n\r\n".to_vec();
        let mut r = ChunkedReader::new(MemoryStream::from_vec(wire));
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello");
    }

    #[test]
    fn roundtrip_random_payload() {
        let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let mut w = ChunkedWriter::new(MemoryStream::new());
        for part in payload.chunks(1777) {
            w.write_all(part).unwrap();
        }
        w.finalize().unwrap();
        let mut r = ChunkedReader::new(MemoryStream::from_vec(w.into_inner().into_inner()));
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn reader_rejects_garbage_size() {
        let mut r = ChunkedReader::new(MemoryStream::from_vec(b"zz\r\nhello".to_vec()));
        let mut out = Vec::new();
        assert!(r.read_to_end(&mut out).is_err());
    }
}
