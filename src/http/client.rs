//! The pooled HTTP/1.x client.
//!
//! Connections are keyed by (scheme, host, port, proxy) and kept alive
//! between requests up to a per-key cap; a reused connection gets a
//! best-effort liveness probe before the request is written, and a
//! transient transport failure on a reused connection is retried once on
//! a fresh one for idempotent methods only. Redirects are followed up to
//! the configured bound, rewriting the method per RFC 7231. An optional
//! cookie jar observes `Set-Cookie` on receive and contributes the
//! `Cookie` header on send.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use url::Url;

use crate::error::{Error, ProtocolError, Result};
use crate::http::common::{parse_header_block, HeaderMap, HttpVersion, Method};
use crate::http::cookie::{Cookie, CookieStore};
use crate::net::{ConnectionPool, Pooled, TcpConnection};
use crate::stream::tls::{build_client_config, TlsSettings, TlsStream};
use crate::stream::zlib::{DeflateReader, GzipReader};
use crate::stream::{
    BufferedReader, ChunkedReader, ChunkedWriter, ConnectionStream, CountedReader, InputStream,
    IoMode, OutputStream,
};

#[derive(Clone)]
pub struct HttpClientSettings {
    /// Redirects followed per request; 0 disables redirect handling.
    pub max_redirects: u32,
    /// Keep-alive lifetime hint for idle pooled connections.
    pub default_keep_alive_timeout: Duration,
    /// HTTP proxy to route plain-text requests through.
    pub proxy: Option<Url>,
    /// Local address to bind outgoing connections to.
    pub network_interface: Option<IpAddr>,
    pub cookie_jar: Option<Arc<dyn CookieStore>>,
    pub tls: TlsSettings,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Cap of concurrently open connections per pool key.
    pub max_connections_per_host: usize,
}

impl Default for HttpClientSettings {
    fn default() -> Self {
        Self {
            max_redirects: 10,
            default_keep_alive_timeout: Duration::from_secs(10),
            proxy: None,
            network_interface: None,
            cookie_jar: None,
            tls: TlsSettings::default(),
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            max_connections_per_host: 6,
        }
    }
}

impl std::fmt::Debug for HttpClientSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClientSettings")
            .field("max_redirects", &self.max_redirects)
            .field("proxy", &self.proxy)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    scheme: String,
    host: String,
    port: u16,
    proxy: Option<String>,
}

/// One pooled keep-alive connection.
pub(crate) struct ClientConn {
    reader: BufferedReader<Box<dyn ConnectionStream + Send>>,
    writer: Box<dyn ConnectionStream + Send>,
    /// Requests already served over this connection.
    served: u32,
}

/// An outgoing request under construction, configured inside the
/// callback of [`HttpClient::request`].
pub struct HttpClientRequest {
    pub headers: HeaderMap,
    body: RequestBody,
}

enum RequestBody {
    None,
    Bytes(Vec<u8>),
    Stream(Box<dyn InputStream + Send>, Option<u64>),
}

impl HttpClientRequest {
    fn new() -> Self {
        Self {
            headers: HeaderMap::new(),
            body: RequestBody::None,
        }
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.set(name, value);
    }

    /// A fully buffered request body, sent with `Content-Length` framing
    /// and re-sendable across redirects and retries.
    pub fn write_body(&mut self, data: &[u8]) {
        self.body = RequestBody::Bytes(data.to_vec());
    }

    /// A streaming body. With a known length it is sent counted,
    /// otherwise chunked on HTTP/1.1; either way it cannot be replayed
    /// for a redirect or retry.
    pub fn body_stream(&mut self, stream: Box<dyn InputStream + Send>, length: Option<u64>) {
        self.body = RequestBody::Stream(stream, length);
    }
}

pub struct HttpClient {
    settings: HttpClientSettings,
    pool: ConnectionPool<PoolKey, ClientConn>,
    tls_config: OnceCell<Arc<rustls::ClientConfig>>,
}

impl HttpClient {
    pub fn new(settings: HttpClientSettings) -> Self {
        let pool = ConnectionPool::new(settings.max_connections_per_host);
        Self {
            settings,
            pool,
            tls_config: OnceCell::new(),
        }
    }

    pub fn get(&self, url: &str) -> Result<HttpClientResponse> {
        self.request(Method::Get, url, |_| Ok(()))
    }

    pub fn post(&self, url: &str, body: &[u8], content_type: &str) -> Result<HttpClientResponse> {
        let content_type = content_type.to_string();
        let body = body.to_vec();
        self.request(Method::Post, url, move |req| {
            req.set_header("Content-Type", content_type);
            req.write_body(&body);
            Ok(())
        })
    }

    /// Issues a request; `configure` fills in headers and the body before
    /// anything is written to the wire.
    pub fn request(
        &self,
        method: Method,
        url: &str,
        configure: impl FnOnce(&mut HttpClientRequest) -> Result<()>,
    ) -> Result<HttpClientResponse> {
        let mut url = Url::parse(url)
            .map_err(|e| Error::Protocol(ProtocolError::InvalidUrl(e.to_string())))?;
        let mut method = method;
        let mut request = HttpClientRequest::new();
        configure(&mut request)?;

        let mut redirects_left = self.settings.max_redirects;
        loop {
            let mut response = self.request_once(&method, &url, &mut request)?;

            if !is_redirect(response.status) || self.settings.max_redirects == 0 {
                return Ok(response);
            }
            if redirects_left == 0 {
                return Err(Error::status(response.status, "redirect limit exceeded"));
            }
            let Some(location) = response.headers.get("location").map(str::to_string) else {
                return Ok(response);
            };
            let status = response.status;
            response.drain()?;
            drop(response);

            url = url
                .join(&location)
                .map_err(|e| Error::Protocol(ProtocolError::InvalidUrl(e.to_string())))?;
            redirects_left -= 1;

            // Method rewriting per RFC 7231: 303 always becomes GET, the
            // legacy 301/302 become GET for everything but HEAD, 307/308
            // preserve the method and require a replayable body.
            match status {
                307 | 308 => {
                    if matches!(request.body, RequestBody::Stream(..)) {
                        return Err(Error::status(
                            status,
                            "redirect requires re-sending a non-replayable body",
                        ));
                    }
                }
                _ => {
                    if method != Method::Head {
                        method = Method::Get;
                    }
                    request.body = RequestBody::None;
                    request.headers.remove("content-type");
                }
            }
        }
    }

    fn request_once(
        &self,
        method: &Method,
        url: &Url,
        request: &mut HttpClientRequest,
    ) -> Result<HttpClientResponse> {
        let key = self.pool_key(url)?;
        let mut retried = false;
        loop {
            let mut pooled = self
                .pool
                .borrow(key.clone(), || self.open_connection(url))?;
            let reused = pooled.served > 0;
            if reused && connection_looks_dead(&mut pooled) {
                pooled.discard();
                continue;
            }

            match self.exchange(&mut pooled, method, url, request) {
                Ok(parts) => return Ok(self.build_response(pooled, parts, method, url)),
                Err(e) => {
                    pooled.discard();
                    // One transparent retry on a fresh connection, but
                    // only when the failed connection was a reused one,
                    // the method is idempotent and the body replayable.
                    let replayable = !matches!(request.body, RequestBody::Stream(..));
                    if reused
                        && !retried
                        && method.is_idempotent()
                        && replayable
                        && e.is_transient_io()
                    {
                        retried = true;
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    fn pool_key(&self, url: &Url) -> Result<PoolKey> {
        let scheme = url.scheme().to_string();
        if scheme != "http" && scheme != "https" {
            return Err(Error::usage(format!("unsupported URL scheme: {scheme}")));
        }
        let host = url
            .host_str()
            .ok_or_else(|| Error::Protocol(ProtocolError::InvalidUrl("missing host".into())))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::Protocol(ProtocolError::InvalidUrl("missing port".into())))?;
        Ok(PoolKey {
            scheme,
            host,
            port,
            proxy: self.settings.proxy.as_ref().map(|p| p.to_string()),
        })
    }

    fn open_connection(&self, url: &Url) -> Result<ClientConn> {
        let tls = url.scheme() == "https";
        // Plain-text requests go through the configured proxy; TLS
        // connects directly (no CONNECT tunneling here).
        let (host, port) = match (&self.settings.proxy, tls) {
            (Some(proxy), false) => {
                let host = proxy
                    .host_str()
                    .ok_or_else(|| Error::usage("proxy URL without host"))?
                    .to_string();
                (host, proxy.port_or_known_default().unwrap_or(8080))
            }
            _ => {
                let host = url.host_str().expect("validated by pool_key").to_string();
                (host, url.port_or_known_default().expect("validated"))
            }
        };

        let mut conn = TcpConnection::connect_from(
            &host,
            port,
            self.settings.network_interface,
            self.settings.connect_timeout,
        )?;
        conn.set_read_timeout(self.settings.read_timeout);
        let _ = conn.set_nodelay(true);

        let conn: Box<dyn ConnectionStream + Send> = if tls {
            let config = self
                .tls_config
                .get_or_try_init(|| build_client_config(&self.settings.tls))?
                .clone();
            let server_name = url.host_str().expect("validated").to_string();
            Box::new(TlsStream::connect(conn, &server_name, config)?)
        } else {
            Box::new(conn)
        };

        let writer = conn.try_clone()?;
        Ok(ClientConn {
            reader: BufferedReader::new(conn),
            writer,
            served: 0,
        })
    }

    /// Writes the request and parses the response head.
    fn exchange(
        &self,
        conn: &mut ClientConn,
        method: &Method,
        url: &Url,
        request: &mut HttpClientRequest,
    ) -> Result<ResponseParts> {
        // Origin-form by default, absolute-form through a proxy.
        let use_proxy = self.settings.proxy.is_some() && url.scheme() == "http";
        let target = if use_proxy {
            url.to_string()
        } else {
            let mut t = url.path().to_string();
            if let Some(q) = url.query() {
                t.push('?');
                t.push_str(q);
            }
            t
        };

        let mut head = format!("{method} {target} HTTP/1.1\r\n");
        if !request.headers.contains("host") {
            let host = url.host_str().expect("validated");
            let host_value = match url.port() {
                Some(port) if default_port_for(url.scheme()) != Some(port) => {
                    format!("{host}:{port}")
                }
                _ => host.to_string(),
            };
            head.push_str(&format!("Host: {host_value}\r\n"));
        }
        if !request.headers.contains("user-agent") {
            head.push_str(concat!(
                "User-Agent: weft/",
                env!("CARGO_PKG_VERSION"),
                "\r\n"
            ));
        }
        if !request.headers.contains("accept-encoding") {
            head.push_str("Accept-Encoding: gzip, deflate\r\n");
        }
        if let Some(jar) = &self.settings.cookie_jar {
            if !request.headers.contains("cookie") {
                if let Some(cookie_header) = jar.cookie_header(url) {
                    head.push_str(&format!("Cookie: {cookie_header}\r\n"));
                }
            }
        }
        match &request.body {
            RequestBody::None => {
                if matches!(method, Method::Post | Method::Put | Method::Patch) {
                    head.push_str("Content-Length: 0\r\n");
                }
            }
            RequestBody::Bytes(data) => {
                head.push_str(&format!("Content-Length: {}\r\n", data.len()));
            }
            RequestBody::Stream(_, Some(len)) => {
                head.push_str(&format!("Content-Length: {len}\r\n"));
            }
            RequestBody::Stream(_, None) => {
                head.push_str("Transfer-Encoding: chunked\r\n");
            }
        }
        for (name, value) in request.headers.iter() {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        head.push_str("\r\n");
        conn.writer.write_all(head.as_bytes())?;

        match &mut request.body {
            RequestBody::None => {}
            RequestBody::Bytes(data) => conn.writer.write_all(data)?,
            RequestBody::Stream(stream, Some(_)) => {
                copy_stream(stream.as_mut(), &mut conn.writer)?;
            }
            RequestBody::Stream(stream, None) => {
                let mut chunked = ChunkedWriter::new(conn.writer.try_clone()?);
                copy_stream(stream.as_mut(), &mut chunked)?;
                chunked.finalize()?;
            }
        }
        conn.writer.flush()?;

        // Response head; 1xx interim responses are skipped.
        loop {
            let status_line = conn.reader.read_line(8 * 1024)?;
            let mut parts = status_line.splitn(3, ' ');
            let version = HttpVersion::parse(parts.next().unwrap_or(""))?;
            let status: u16 = parts
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or(ProtocolError::InvalidStatusLine)?;
            let headers = parse_header_block(&mut conn.reader, 64 * 1024)?;
            if (100..200).contains(&status) {
                continue;
            }
            return Ok(ResponseParts {
                version,
                status,
                headers,
            });
        }
    }

    fn build_response(
        &self,
        mut pooled: Pooled<PoolKey, ClientConn>,
        parts: ResponseParts,
        method: &Method,
        url: &Url,
    ) -> HttpClientResponse {
        if let Some(jar) = &self.settings.cookie_jar {
            for set_cookie in parts.headers.get_all("set-cookie") {
                match Cookie::parse_set_cookie(set_cookie) {
                    Ok(cookie) => jar.store(url, cookie),
                    Err(e) => log::debug!("ignoring malformed Set-Cookie: {e}"),
                }
            }
        }

        let keep_alive = match parts.version {
            HttpVersion::Http11 => !parts.headers.has_token("connection", "close"),
            HttpVersion::Http10 => parts.headers.has_token("connection", "keep-alive"),
        };
        let framing = response_framing(method, parts.status, &parts.headers);
        let keep_alive = keep_alive && framing != ClientBodyFraming::CloseDelimited;
        pooled.served += 1;

        let mut io = PooledIo {
            pooled: Some(pooled),
            complete: false,
            keep_alive,
        };
        let encoding = parts
            .headers
            .get("content-encoding")
            .map(|v| v.to_ascii_lowercase());
        let body = match framing {
            ClientBodyFraming::Empty => {
                io.complete = true;
                ResponseBody::Empty(NoBody(io))
            }
            ClientBodyFraming::Counted(n) => match encoding.as_deref() {
                Some("gzip") => ResponseBody::GzipCounted(GzipReader::new(CountedReader::new(io, n))),
                Some("deflate") => {
                    ResponseBody::DeflateCounted(DeflateReader::new(CountedReader::new(io, n)))
                }
                _ => ResponseBody::Counted(CountedReader::new(io, n)),
            },
            ClientBodyFraming::Chunked => match encoding.as_deref() {
                Some("gzip") => ResponseBody::GzipChunked(GzipReader::new(ChunkedReader::new(io))),
                Some("deflate") => {
                    ResponseBody::DeflateChunked(DeflateReader::new(ChunkedReader::new(io)))
                }
                _ => ResponseBody::Chunked(ChunkedReader::new(io)),
            },
            ClientBodyFraming::CloseDelimited => match encoding.as_deref() {
                Some("gzip") => ResponseBody::GzipClose(GzipReader::new(io)),
                Some("deflate") => ResponseBody::DeflateClose(DeflateReader::new(io)),
                _ => ResponseBody::Close(io),
            },
        };

        HttpClientResponse {
            status: parts.status,
            http_version: parts.version,
            headers: parts.headers,
            body,
        }
    }
}

fn default_port_for(scheme: &str) -> Option<u16> {
    match scheme {
        "http" => Some(80),
        "https" => Some(443),
        _ => None,
    }
}

fn copy_stream(
    from: &mut (impl InputStream + ?Sized),
    to: &mut (impl OutputStream + ?Sized),
) -> Result<u64> {
    let mut buf = [0u8; 8 * 1024];
    let mut total = 0;
    loop {
        let n = from.read(&mut buf, IoMode::Once)?;
        if n == 0 {
            return Ok(total);
        }
        to.write_all(&buf[..n])?;
        total += n as u64;
    }
}

struct ResponseParts {
    version: HttpVersion,
    status: u16,
    headers: HeaderMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientBodyFraming {
    Empty,
    Counted(u64),
    Chunked,
    CloseDelimited,
}

/// Body framing for a response, mirroring the request-side rules plus
/// the response-only cases (HEAD, 1xx/204/304, read-to-close).
fn response_framing(method: &Method, status: u16, headers: &HeaderMap) -> ClientBodyFraming {
    if *method == Method::Head || matches!(status, 204 | 304) || (100..200).contains(&status) {
        return ClientBodyFraming::Empty;
    }
    if headers
        .get("transfer-encoding")
        .map_or(false, |te| te.eq_ignore_ascii_case("chunked"))
    {
        return ClientBodyFraming::Chunked;
    }
    if let Some(cl) = headers.get("content-length") {
        if let Ok(n) = cl.trim().parse::<u64>() {
            return if n == 0 {
                ClientBodyFraming::Empty
            } else {
                ClientBodyFraming::Counted(n)
            };
        }
    }
    ClientBodyFraming::CloseDelimited
}

fn is_redirect(status: u16) -> bool {
    matches!(status, 301 | 302 | 303 | 307 | 308)
}

/// Best-effort half-closed probe: any readability on an idle keep-alive
/// connection means the server closed it or sent stray bytes.
fn connection_looks_dead(conn: &mut ClientConn) -> bool {
    if !conn.writer.connected() {
        return true;
    }
    if conn.reader.data_available() > 0 {
        return true;
    }
    matches!(conn.reader.wait_for_data(Duration::ZERO), Ok(true))
}

/// The transport handle inside a response body stack. Dropping it either
/// returns the connection to the pool (body fully consumed, keep-alive)
/// or closes it.
struct PooledIo {
    pooled: Option<Pooled<PoolKey, ClientConn>>,
    complete: bool,
    keep_alive: bool,
}

impl PooledIo {
    fn conn(&mut self) -> &mut ClientConn {
        self.pooled.as_mut().expect("connection present until drop")
    }
}

impl InputStream for PooledIo {
    fn read(&mut self, buf: &mut [u8], mode: IoMode) -> Result<usize> {
        let n = self.conn().reader.read(buf, mode)?;
        if n == 0 && mode == IoMode::Once {
            self.complete = true;
        }
        Ok(n)
    }

    fn least_size(&mut self) -> Result<u64> {
        let n = self.conn().reader.least_size()?;
        if n == 0 {
            self.complete = true;
        }
        Ok(n)
    }

    fn data_available(&self) -> usize {
        match &self.pooled {
            Some(p) => p.reader.data_available(),
            None => 0,
        }
    }

    fn peek(&mut self) -> Result<&[u8]> {
        self.conn().reader.peek()
    }

    fn wait_for_data(&mut self, timeout: Duration) -> Result<bool> {
        self.conn().reader.wait_for_data(timeout)
    }
}

impl Drop for PooledIo {
    fn drop(&mut self) {
        let Some(pooled) = self.pooled.take() else {
            return;
        };
        if self.complete && self.keep_alive {
            // Dropping the guard returns the connection to the idle set.
            drop(pooled);
        } else {
            pooled.discard();
        }
    }
}

/// A no-body response that still carries the connection return
/// semantics of [`PooledIo`] without ever touching the transport.
struct NoBody(PooledIo);

impl InputStream for NoBody {
    fn read(&mut self, buf: &mut [u8], mode: IoMode) -> Result<usize> {
        if mode == IoMode::All && !buf.is_empty() {
            return Err(crate::stream::unexpected_eof());
        }
        Ok(0)
    }

    fn least_size(&mut self) -> Result<u64> {
        Ok(0)
    }

    fn wait_for_data(&mut self, _timeout: Duration) -> Result<bool> {
        Ok(true)
    }
}

/// The response body stack. A concrete enum rather than a trait object
/// so completion can be queried when the response is dropped, which
/// decides whether the connection returns to the pool.
enum ResponseBody {
    Empty(NoBody),
    Counted(CountedReader<PooledIo>),
    Chunked(ChunkedReader<PooledIo>),
    Close(PooledIo),
    GzipCounted(GzipReader<CountedReader<PooledIo>>),
    GzipChunked(GzipReader<ChunkedReader<PooledIo>>),
    GzipClose(GzipReader<PooledIo>),
    DeflateCounted(DeflateReader<CountedReader<PooledIo>>),
    DeflateChunked(DeflateReader<ChunkedReader<PooledIo>>),
    DeflateClose(DeflateReader<PooledIo>),
}

impl ResponseBody {
    fn as_stream(&mut self) -> &mut dyn InputStream {
        match self {
            Self::Empty(s) => s,
            Self::Close(s) => s,
            Self::Counted(s) => s,
            Self::Chunked(s) => s,
            Self::GzipCounted(s) => s,
            Self::GzipChunked(s) => s,
            Self::GzipClose(s) => s,
            Self::DeflateCounted(s) => s,
            Self::DeflateChunked(s) => s,
            Self::DeflateClose(s) => s,
        }
    }

    /// Whether the wire framing of the body has been fully consumed.
    fn finished(&self) -> bool {
        match self {
            Self::Empty(_) => true,
            Self::Counted(c) => c.remaining() == 0,
            Self::Chunked(c) => c.finished(),
            Self::Close(io) => io.complete,
            Self::GzipCounted(g) => g.get_ref().remaining() == 0,
            Self::GzipChunked(g) => g.get_ref().finished(),
            Self::GzipClose(g) => g.get_ref().complete,
            Self::DeflateCounted(d) => d.get_ref().remaining() == 0,
            Self::DeflateChunked(d) => d.get_ref().finished(),
            Self::DeflateClose(d) => d.get_ref().complete,
        }
    }

    /// Flags the transport handle so its drop returns the connection.
    fn mark_complete(&mut self) {
        let io = match self {
            Self::Empty(s) => &mut s.0,
            Self::Close(s) => s,
            Self::Counted(s) => s.get_mut(),
            Self::Chunked(s) => s.get_mut(),
            Self::GzipCounted(g) => g.get_mut().get_mut(),
            Self::GzipChunked(g) => g.get_mut().get_mut(),
            Self::GzipClose(g) => g.get_mut(),
            Self::DeflateCounted(d) => d.get_mut().get_mut(),
            Self::DeflateChunked(d) => d.get_mut().get_mut(),
            Self::DeflateClose(d) => d.get_mut(),
        };
        io.complete = true;
    }
}

/// A fully parsed response head with a streaming body. Reading the body
/// to its end releases the underlying connection back into the pool;
/// dropping the response earlier closes it.
pub struct HttpClientResponse {
    pub status: u16,
    pub http_version: HttpVersion,
    pub headers: HeaderMap,
    body: ResponseBody,
}

impl HttpClientResponse {
    pub fn body(&mut self) -> &mut dyn InputStream {
        self.body.as_stream()
    }

    /// Reads the whole body, bounded by `max` bytes.
    pub fn read_body(&mut self, max: u64) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 8 * 1024];
        let stream = self.body.as_stream();
        loop {
            let n = stream.read(&mut chunk, IoMode::Once)?;
            if n == 0 {
                break;
            }
            if out.len() as u64 + n as u64 > max {
                return Err(ProtocolError::BodyTooLarge.into());
            }
            out.extend_from_slice(&chunk[..n]);
        }
        Ok(out)
    }

    /// Reads and discards the rest of the body so the connection can be
    /// reused.
    pub fn drain(&mut self) -> Result<()> {
        let mut sink = [0u8; 8 * 1024];
        let stream = self.body.as_stream();
        while stream.read(&mut sink, IoMode::Once)? > 0 {}
        Ok(())
    }
}

impl Drop for HttpClientResponse {
    fn drop(&mut self) {
        if self.body.finished() {
            self.body.mark_complete();
        }
    }
}

impl std::fmt::Debug for HttpClientResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClientResponse")
            .field("status", &self.status)
            .field("version", &self.http_version)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_statuses() {
        for s in [301, 302, 303, 307, 308] {
            assert!(is_redirect(s));
        }
        assert!(!is_redirect(200));
        assert!(!is_redirect(404));
    }

    #[test]
    fn head_and_no_content_have_empty_bodies() {
        let mut headers = HeaderMap::new();
        headers.set("Content-Length", "100");
        assert_eq!(
            response_framing(&Method::Head, 200, &headers),
            ClientBodyFraming::Empty
        );
        assert_eq!(
            response_framing(&Method::Get, 204, &HeaderMap::new()),
            ClientBodyFraming::Empty
        );
    }

    #[test]
    fn framing_priority() {
        let mut headers = HeaderMap::new();
        headers.set("Transfer-Encoding", "chunked");
        assert_eq!(
            response_framing(&Method::Get, 200, &headers),
            ClientBodyFraming::Chunked
        );
        let mut headers = HeaderMap::new();
        headers.set("Content-Length", "42");
        assert_eq!(
            response_framing(&Method::Get, 200, &headers),
            ClientBodyFraming::Counted(42)
        );
        assert_eq!(
            response_framing(&Method::Get, 200, &HeaderMap::new()),
            ClientBodyFraming::CloseDelimited
        );
    }

    #[test]
    fn default_ports() {
        assert_eq!(default_port_for("http"), Some(80));
        assert_eq!(default_port_for("https"), Some(443));
        assert_eq!(default_port_for("ftp"), None);
    }
}
