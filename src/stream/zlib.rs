//! Gzip and deflate codec adapters.
//!
//! Thin wrappers over `flate2`, bridged through the std::io shims so the
//! codec pulls from (and pushes into) fiber-blocking streams. The HTTP
//! "deflate" coding is the zlib-wrapped variant, which is what peers send
//! in practice.

use std::io::{Read, Write};
use std::time::Duration;

use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;

use crate::error::{Error, Result};
use crate::stream::{from_io, InputStream, IoMode, OutputStream, ReadBridge, WriteBridge};

macro_rules! decoder_stream {
    ($(#[$meta:meta])* $name:ident, $dec:ident) => {
        $(#[$meta])*
        pub struct $name<R: InputStream> {
            dec: $dec<ReadBridge<R>>,
            lookahead: Option<u8>,
            eof: bool,
        }

        impl<R: InputStream> $name<R> {
            pub fn new(inner: R) -> Self {
                Self {
                    dec: $dec::new(ReadBridge(inner)),
                    lookahead: None,
                    eof: false,
                }
            }

            pub fn into_inner(self) -> R {
                self.dec.into_inner().0
            }

            pub fn get_ref(&self) -> &R {
                &self.dec.get_ref().0
            }

            pub fn get_mut(&mut self) -> &mut R {
                &mut self.dec.get_mut().0
            }

            fn read_decoded(&mut self, buf: &mut [u8]) -> Result<usize> {
                let mut done = 0;
                if buf.is_empty() {
                    return Ok(0);
                }
                if let Some(b) = self.lookahead.take() {
                    buf[0] = b;
                    done = 1;
                }
                if done == buf.len() {
                    return Ok(done);
                }
                match self.dec.read(&mut buf[done..]) {
                    Ok(0) => {
                        self.eof = true;
                        Ok(done)
                    }
                    Ok(n) => Ok(done + n),
                    Err(e) => Err(from_io(e)),
                }
            }
        }

        impl<R: InputStream> InputStream for $name<R> {
            fn read(&mut self, buf: &mut [u8], mode: IoMode) -> Result<usize> {
                match mode {
                    IoMode::All => {
                        let mut done = 0;
                        while done < buf.len() {
                            let n = self.read_decoded(&mut buf[done..])?;
                            if n == 0 {
                                return Err(crate::stream::unexpected_eof());
                            }
                            done += n;
                        }
                        Ok(done)
                    }
                    IoMode::Once => self.read_decoded(buf),
                    // Decoded bytes are not buffered here beyond the
                    // lookahead byte.
                    IoMode::Immediate => {
                        if let Some(b) = self.lookahead.take() {
                            if !buf.is_empty() {
                                buf[0] = b;
                                return Ok(1);
                            }
                            self.lookahead = Some(b);
                        }
                        Ok(0)
                    }
                }
            }

            fn least_size(&mut self) -> Result<u64> {
                if self.lookahead.is_some() {
                    return Ok(1);
                }
                if self.eof {
                    return Ok(0);
                }
                let mut byte = [0u8; 1];
                if self.read_decoded(&mut byte)? == 0 {
                    return Ok(0);
                }
                self.lookahead = Some(byte[0]);
                Ok(1)
            }

            fn data_available(&self) -> usize {
                usize::from(self.lookahead.is_some())
            }

            fn wait_for_data(&mut self, timeout: Duration) -> Result<bool> {
                if self.lookahead.is_some() || self.eof {
                    return Ok(true);
                }
                self.dec.get_mut().0.wait_for_data(timeout)
            }
        }
    };
}

decoder_stream! {
    /// Decompresses a gzip-coded inner stream.
    GzipReader, GzDecoder
}
decoder_stream! {
    /// Decompresses a deflate(zlib)-coded inner stream.
    DeflateReader, ZlibDecoder
}

macro_rules! encoder_stream {
    ($(#[$meta:meta])* $name:ident, $enc:ident) => {
        $(#[$meta])*
        pub struct $name<W: OutputStream> {
            enc: $enc<WriteBridge<W>>,
            finalized: bool,
        }

        impl<W: OutputStream> $name<W> {
            pub fn new(inner: W) -> Self {
                Self {
                    enc: $enc::new(WriteBridge(inner), Compression::default()),
                    finalized: false,
                }
            }
        }

        impl<W: OutputStream> OutputStream for $name<W> {
            fn write(&mut self, buf: &[u8], _mode: IoMode) -> Result<usize> {
                if self.finalized {
                    return Err(Error::usage("write after finalize"));
                }
                self.enc.write_all(buf).map_err(from_io)?;
                Ok(buf.len())
            }

            fn flush(&mut self) -> Result<()> {
                self.enc.flush().map_err(from_io)?;
                self.enc.get_mut().0.flush()
            }

            fn finalize(&mut self) -> Result<()> {
                if self.finalized {
                    return Ok(());
                }
                self.finalized = true;
                self.enc.try_finish().map_err(from_io)?;
                self.enc.get_mut().0.finalize()
            }
        }
    };
}

encoder_stream! {
    /// Compresses into the gzip format.
    GzipWriter, GzEncoder
}
encoder_stream! {
    /// Compresses into the deflate(zlib) format.
    DeflateWriter, ZlibEncoder
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemoryStream;

    fn roundtrip_gzip(payload: &[u8]) -> Vec<u8> {
        let mut w = GzipWriter::new(MemoryStream::new());
        w.write_all(payload).unwrap();
        w.finalize().unwrap();
        let wire = w.enc.get_mut().0.clone().into_inner();
        let mut r = GzipReader::new(MemoryStream::from_vec(wire));
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn gzip_roundtrip() {
        let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 7) as u8 + b'a').collect();
        assert_eq!(roundtrip_gzip(&payload), payload);
    }

    #[test]
    fn gzip_roundtrip_empty() {
        assert_eq!(roundtrip_gzip(b""), b"");
    }

    #[test]
    fn deflate_roundtrip() {
        let payload = b"deflate me, deflate me, deflate me".repeat(100);
        let mut w = DeflateWriter::new(MemoryStream::new());
        w.write_all(&payload).unwrap();
        w.finalize().unwrap();
        let wire = w.enc.get_mut().0.clone().into_inner();
        let mut r = DeflateReader::new(MemoryStream::from_vec(wire));
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, payload);
    }
}
