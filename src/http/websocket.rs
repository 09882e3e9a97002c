//! WebSocket upgrade handshake and frame codec (RFC 6455).
//!
//! On the server side, [`handle_web_socket`] validates the upgrade
//! request, answers 101 and runs a session callback with a framed
//! [`WebSocket`] handle. Pings are answered automatically while
//! receiving; the close handshake exchanges a status code and UTF-8
//! reason. Client frames must be masked and server frames must not be;
//! violations are protocol errors.

use sha1::{Digest, Sha1};

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::{Error, ProtocolError, Result};
use crate::http::common::HeaderMap;
use crate::http::server::{HttpServerRequest, HttpServerResponse};
use crate::stream::{BufferedReader, InputStream, IoMode, OutputStream};

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The `Sec-WebSocket-Accept` digest for a client key: base64 of the
/// SHA-1 of the key concatenated with the protocol GUID.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    base64::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Server,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    fn from_bits(bits: u8) -> Result<Self> {
        Ok(match bits {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            _ => return Err(ProtocolError::InvalidFrame("reserved opcode").into()),
        })
    }

    fn bits(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
        }
    }

    fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

/// A received WebSocket message, after fragment reassembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
    /// An unsolicited pong (pings are answered internally).
    Pong(Vec<u8>),
    Close { code: Option<u16>, reason: String },
}

struct Frame {
    fin: bool,
    opcode: Opcode,
    payload: Vec<u8>,
}

const MAX_FRAME_PAYLOAD: u64 = 64 << 20;

fn read_frame(reader: &mut (impl InputStream + ?Sized), role: Role) -> Result<Frame> {
    let mut head = [0u8; 2];
    reader.read(&mut head, IoMode::All)?;
    if head[0] & 0x70 != 0 {
        return Err(ProtocolError::InvalidFrame("reserved bits set").into());
    }
    let fin = head[0] & 0x80 != 0;
    let opcode = Opcode::from_bits(head[0] & 0x0F)?;
    let masked = head[1] & 0x80 != 0;
    // Client-to-server frames must be masked, server-to-client ones must
    // not be.
    match role {
        Role::Server if !masked => {
            return Err(ProtocolError::InvalidFrame("unmasked client frame").into())
        }
        Role::Client if masked => {
            return Err(ProtocolError::InvalidFrame("masked server frame").into())
        }
        _ => {}
    }

    let len = match head[1] & 0x7F {
        126 => {
            let mut ext = [0u8; 2];
            reader.read(&mut ext, IoMode::All)?;
            u16::from_be_bytes(ext) as u64
        }
        127 => {
            let mut ext = [0u8; 8];
            reader.read(&mut ext, IoMode::All)?;
            u64::from_be_bytes(ext)
        }
        n => n as u64,
    };
    if opcode.is_control() && (!fin || len > 125) {
        return Err(ProtocolError::InvalidFrame("oversized or fragmented control frame").into());
    }
    if len > MAX_FRAME_PAYLOAD {
        return Err(ProtocolError::InvalidFrame("oversized frame").into());
    }

    let mask = if masked {
        let mut key = [0u8; 4];
        reader.read(&mut key, IoMode::All)?;
        Some(key)
    } else {
        None
    };

    let mut payload = vec![0u8; len as usize];
    if len > 0 {
        reader.read(&mut payload, IoMode::All)?;
    }
    if let Some(key) = mask {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= key[i % 4];
        }
    }
    Ok(Frame {
        fin,
        opcode,
        payload,
    })
}

fn write_frame(
    writer: &mut (impl OutputStream + ?Sized),
    opcode: Opcode,
    payload: &[u8],
    role: Role,
) -> Result<()> {
    let mut head = Vec::with_capacity(14);
    head.push(0x80 | opcode.bits());
    let mask_bit = if role == Role::Client { 0x80 } else { 0x00 };
    match payload.len() {
        n if n < 126 => head.push(mask_bit | n as u8),
        n if n <= u16::MAX as usize => {
            head.push(mask_bit | 126);
            head.extend_from_slice(&(n as u16).to_be_bytes());
        }
        n => {
            head.push(mask_bit | 127);
            head.extend_from_slice(&(n as u64).to_be_bytes());
        }
    }
    if role == Role::Client {
        let key = masking_key();
        head.extend_from_slice(&key);
        let mut masked = payload.to_vec();
        for (i, byte) in masked.iter_mut().enumerate() {
            *byte ^= key[i % 4];
        }
        writer.write_all(&head)?;
        writer.write_all(&masked)?;
    } else {
        writer.write_all(&head)?;
        writer.write_all(payload)?;
    }
    writer.flush()
}

/// Mask entropy; the mask exists to defeat proxy cache poisoning, not as
/// a cryptographic secret.
fn masking_key() -> [u8; 4] {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let counter = COUNTER.fetch_add(1, Ordering::Relaxed);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0);
    let mut x = nanos
        .wrapping_mul(0x9E37_79B9_7F4A_7C15)
        .wrapping_add(counter);
    x ^= x >> 33;
    x = x.wrapping_mul(0xFF51_AFD7_ED55_8CCD);
    x ^= x >> 29;
    (x as u32).to_be_bytes()
}

/// A framed WebSocket session over an established connection.
pub struct WebSocket<'a> {
    reader: &'a mut dyn InputStream,
    writer: Box<dyn OutputStream + Send>,
    role: Role,
    connected: bool,
    close_sent: bool,
}

impl<'a> WebSocket<'a> {
    pub(crate) fn new(
        reader: &'a mut dyn InputStream,
        writer: Box<dyn OutputStream + Send>,
        role: Role,
    ) -> Self {
        Self {
            reader,
            writer,
            role,
            connected: true,
            close_sent: false,
        }
    }

    /// `false` after the close handshake (or a transport failure).
    pub fn connected(&self) -> bool {
        self.connected
    }

    pub fn send_text(&mut self, text: &str) -> Result<()> {
        self.send_data(Opcode::Text, text.as_bytes())
    }

    pub fn send_binary(&mut self, data: &[u8]) -> Result<()> {
        self.send_data(Opcode::Binary, data)
    }

    pub fn ping(&mut self, payload: &[u8]) -> Result<()> {
        self.send_data(Opcode::Ping, payload)
    }

    fn send_data(&mut self, opcode: Opcode, payload: &[u8]) -> Result<()> {
        if !self.connected {
            return Err(Error::usage("send on a closed websocket"));
        }
        write_frame(&mut self.writer, opcode, payload, self.role)
    }

    /// Initiates (or completes) the close handshake.
    pub fn close(&mut self, code: u16, reason: &str) -> Result<()> {
        if !self.close_sent {
            self.close_sent = true;
            let mut payload = code.to_be_bytes().to_vec();
            payload.extend_from_slice(reason.as_bytes());
            write_frame(&mut self.writer, Opcode::Close, &payload, self.role)?;
        }
        Ok(())
    }

    /// Waits until a frame is readable. `false` on timeout.
    pub fn wait_for_data(&mut self, timeout: Duration) -> Result<bool> {
        self.reader.wait_for_data(timeout)
    }

    /// Receives the next message, reassembling fragments. Pings are
    /// answered with pongs internally and do not surface.
    pub fn receive(&mut self) -> Result<Message> {
        if !self.connected {
            return Err(Error::usage("receive on a closed websocket"));
        }
        let mut assembling: Option<(Opcode, Vec<u8>)> = None;
        loop {
            let frame = read_frame(self.reader, self.role)?;
            match frame.opcode {
                Opcode::Ping => {
                    write_frame(&mut self.writer, Opcode::Pong, &frame.payload, self.role)?;
                }
                Opcode::Pong => return Ok(Message::Pong(frame.payload)),
                Opcode::Close => {
                    let code = if frame.payload.len() >= 2 {
                        Some(u16::from_be_bytes([frame.payload[0], frame.payload[1]]))
                    } else {
                        None
                    };
                    let reason = String::from_utf8_lossy(
                        frame.payload.get(2..).unwrap_or_default(),
                    )
                    .into_owned();
                    // Echo the close if the peer initiated it.
                    if !self.close_sent {
                        self.close_sent = true;
                        let _ = write_frame(
                            &mut self.writer,
                            Opcode::Close,
                            &frame.payload,
                            self.role,
                        );
                    }
                    self.connected = false;
                    return Ok(Message::Close { code, reason });
                }
                Opcode::Text | Opcode::Binary => {
                    if assembling.is_some() {
                        return Err(
                            ProtocolError::InvalidFrame("data frame inside a fragment").into()
                        );
                    }
                    if frame.fin {
                        return finish_message(frame.opcode, frame.payload);
                    }
                    assembling = Some((frame.opcode, frame.payload));
                }
                Opcode::Continuation => {
                    let Some((opcode, mut buf)) = assembling.take() else {
                        return Err(
                            ProtocolError::InvalidFrame("continuation without a start").into()
                        );
                    };
                    buf.extend_from_slice(&frame.payload);
                    if frame.fin {
                        return finish_message(opcode, buf);
                    }
                    assembling = Some((opcode, buf));
                }
            }
        }
    }

    /// Receives a text message; anything else is a protocol error.
    pub fn receive_text(&mut self) -> Result<String> {
        match self.receive()? {
            Message::Text(s) => Ok(s),
            _ => Err(ProtocolError::InvalidFrame("expected a text message").into()),
        }
    }

    /// Receives a binary message; anything else is a protocol error.
    pub fn receive_binary(&mut self) -> Result<Vec<u8>> {
        match self.receive()? {
            Message::Binary(b) => Ok(b),
            _ => Err(ProtocolError::InvalidFrame("expected a binary message").into()),
        }
    }
}

fn finish_message(opcode: Opcode, payload: Vec<u8>) -> Result<Message> {
    match opcode {
        Opcode::Text => String::from_utf8(payload)
            .map(Message::Text)
            .map_err(|_| ProtocolError::InvalidFrame("invalid utf-8 in text message").into()),
        Opcode::Binary => Ok(Message::Binary(payload)),
        _ => unreachable!("only data opcodes are assembled"),
    }
}

////////////////////////////////////////////////////////////////////////////////
// Server upgrade
////////////////////////////////////////////////////////////////////////////////

/// Validates the upgrade request, emits `101 Switching Protocols` and
/// runs `session` with the framed socket. The connection closes when the
/// session returns.
pub fn handle_web_socket<F>(
    req: &mut HttpServerRequest<'_>,
    res: &mut HttpServerResponse,
    session: F,
) -> Result<()>
where
    F: FnOnce(&mut WebSocket<'_>) -> Result<()>,
{
    if !req.headers.has_token("upgrade", "websocket")
        || !req.headers.has_token("connection", "upgrade")
    {
        return Err(Error::status(400, "not a websocket upgrade request"));
    }
    match req.headers.get("sec-websocket-version") {
        Some("13") => {}
        _ => {
            res.set_header("Sec-WebSocket-Version", "13")?;
            return Err(Error::status(426, "unsupported websocket version"));
        }
    }
    let key = req
        .headers
        .get("sec-websocket-key")
        .ok_or_else(|| Error::status(400, "missing Sec-WebSocket-Key"))?
        .to_string();

    let mut headers = HeaderMap::new();
    headers.set("Upgrade", "websocket");
    headers.set("Connection", "Upgrade");
    headers.set("Sec-WebSocket-Accept", accept_key(&key));
    let writer: Box<dyn OutputStream + Send> = Box::new(res.switch_protocol(headers)?);

    let reader = req
        .upgrade_reader
        .take()
        .ok_or_else(|| Error::usage("connection is not upgradable"))?;
    let mut ws = WebSocket::new(reader, writer, Role::Server);
    let outcome = session(&mut ws);
    if ws.connected {
        let _ = ws.close(1000, "");
    }
    outcome
}

////////////////////////////////////////////////////////////////////////////////
// Client handshake
////////////////////////////////////////////////////////////////////////////////

/// Performs the client side of the upgrade over an established
/// connection, returning once the server switched protocols. The caller
/// then builds the socket with [`client_socket`].
pub fn client_handshake<R: InputStream>(
    reader: &mut BufferedReader<R>,
    writer: &mut (impl OutputStream + ?Sized),
    host: &str,
    path: &str,
) -> Result<()> {
    let key = base64::encode(masking_key_bytes());
    let request = format!(
        "GET {path} HTTP/1.1\r\nHost: {host}\r\nUpgrade: websocket\r\n\
         Connection: Upgrade\r\nSec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n"
    );
    writer.write_all(request.as_bytes())?;
    writer.flush()?;

    let status_line = reader.read_line(8 * 1024)?;
    let mut parts = status_line.split(' ');
    let _version = parts.next();
    if parts.next() != Some("101") {
        return Err(ProtocolError::BadUpgrade("server refused the upgrade").into());
    }
    let headers = crate::http::common::parse_header_block(reader, 8 * 1024)?;
    let expected = accept_key(&key);
    if headers.get("sec-websocket-accept") != Some(expected.as_str()) {
        return Err(ProtocolError::BadUpgrade("accept key mismatch").into());
    }
    Ok(())
}

fn masking_key_bytes() -> [u8; 16] {
    let mut out = [0u8; 16];
    for chunk in out.chunks_mut(4) {
        chunk.copy_from_slice(&masking_key());
    }
    out
}

/// Wraps an upgraded client connection into a framed socket.
pub fn client_socket<'a>(
    reader: &'a mut dyn InputStream,
    writer: Box<dyn OutputStream + Send>,
) -> WebSocket<'a> {
    WebSocket::new(reader, writer, Role::Client)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{MemoryStream, RandomAccessStream};

    #[test]
    fn accept_key_matches_rfc_example() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn frame_roundtrip_client_to_server() {
        let mut wire = MemoryStream::new();
        write_frame(&mut wire, Opcode::Text, b"hello", Role::Client).unwrap();
        wire.seek(0).unwrap();
        let frame = read_frame(&mut wire, Role::Server).unwrap();
        assert!(frame.fin);
        assert_eq!(frame.opcode, Opcode::Text);
        assert_eq!(frame.payload, b"hello");
    }

    #[test]
    fn server_frames_are_unmasked() {
        let mut wire = MemoryStream::new();
        write_frame(&mut wire, Opcode::Binary, &[1, 2, 3], Role::Server).unwrap();
        let bytes = wire.as_slice();
        assert_eq!(bytes[0], 0x82);
        assert_eq!(bytes[1], 3); // no mask bit
        wire.seek(0).unwrap();
        let frame = read_frame(&mut wire, Role::Client).unwrap();
        assert_eq!(frame.payload, [1, 2, 3]);
    }

    #[test]
    fn unmasked_client_frame_is_rejected() {
        let mut wire = MemoryStream::new();
        write_frame(&mut wire, Opcode::Text, b"x", Role::Server).unwrap();
        wire.seek(0).unwrap();
        assert!(read_frame(&mut wire, Role::Server).is_err());
    }

    #[test]
    fn extended_16bit_length() {
        let payload = vec![0xABu8; 300];
        let mut wire = MemoryStream::new();
        write_frame(&mut wire, Opcode::Binary, &payload, Role::Server).unwrap();
        wire.seek(0).unwrap();
        let frame = read_frame(&mut wire, Role::Client).unwrap();
        assert_eq!(frame.payload, payload);
    }

    #[test]
    fn reserved_bits_are_rejected() {
        let mut wire = MemoryStream::from_vec(vec![0xC1, 0x00]);
        assert!(read_frame(&mut wire, Role::Client).is_err());
    }
}
