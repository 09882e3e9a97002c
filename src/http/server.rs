//! The HTTP/1.x server: settings, listener and per-connection dispatcher.
//!
//! A listener accepts a connection and hands it to one fiber, which owns
//! it for its whole keep-alive lifetime: parse one request, invoke the
//! user handler, finalize the response, drain whatever body the handler
//! left unread and loop for the next request. Every wait point inside
//! suspends the fiber, never the thread.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use url::Url;

use crate::clock;
use crate::error::{Error, ProtocolError, Result};
use crate::fiber::TaskHandle;
use crate::http::common::{parse_header_block, status_phrase, HeaderMap, HttpVersion, Method};
use crate::http::cookie::Cookie;
use crate::http::log::{write_access_log, AccessLogEntry};
use crate::http::multipart::{self, UploadedFile};
use crate::net::{TcpConnection, TcpListener, UnixListener};
use crate::runtime::Runtime;
use crate::stream::tls::{build_server_config, TlsSettings, TlsStream};
use crate::stream::zlib::{DeflateReader, GzipReader};
use crate::stream::{
    BufferedReader, ChunkedReader, ChunkedWriter, ConnectionStream, CountedReader, InputStream,
    IoMode, MemoryStream, OutputStream,
};

bitflags::bitflags! {
    /// Feature switches of the server; combined in
    /// [`HttpServerSettings::options`].
    pub struct HttpServerOptions: u16 {
        /// Serve multiple requests per connection.
        const KEEP_ALIVE = 1 << 0;
        /// Parse the request target into a URL.
        const PARSE_URL = 1 << 1;
        /// Decode the query string into name/value pairs.
        const PARSE_QUERY_STRING = 1 << 2;
        /// Decode the `Cookie` header.
        const PARSE_COOKIES = 1 << 3;
        /// Decode `application/x-www-form-urlencoded` bodies.
        const PARSE_FORM_BODY = 1 << 4;
        /// Decode `application/json` bodies.
        const PARSE_JSON_BODY = 1 << 5;
        /// Decode `multipart/form-data` bodies including file uploads.
        const PARSE_MULTI_PART_BODY = 1 << 6;
        /// Distribute connection fibers over the runtime's worker
        /// schedulers instead of the accepting scheduler.
        const DISTRIBUTE = 1 << 7;
        /// Include error detail in generated error pages.
        const ERROR_STACK_TRACES = 1 << 8;
    }
}

impl Default for HttpServerOptions {
    fn default() -> Self {
        HttpServerOptions::KEEP_ALIVE
            | HttpServerOptions::PARSE_URL
            | HttpServerOptions::PARSE_QUERY_STRING
            | HttpServerOptions::PARSE_COOKIES
            | HttpServerOptions::PARSE_FORM_BODY
            | HttpServerOptions::PARSE_JSON_BODY
    }
}

/// One address the server binds: an IP (with the shared port) or a UNIX
/// socket path.
#[derive(Debug, Clone)]
pub enum BindAddress {
    Ip(String),
    Unix(PathBuf),
}

/// Context handed to the error page handler.
#[derive(Debug, Clone)]
pub struct ErrorPageInfo {
    pub status: u16,
    pub message: String,
    /// Extra diagnostic detail; only populated when
    /// [`HttpServerOptions::ERROR_STACK_TRACES`] is set.
    pub detail: String,
}

pub type ErrorPageHandler =
    Arc<dyn Fn(&mut HttpServerResponse, &ErrorPageInfo) -> Result<()> + Send + Sync>;

/// Session persistence interface, consumed by web layers above this
/// crate.
pub trait SessionStore: Send + Sync {
    fn get(&self, session_id: &str, key: &str) -> Option<String>;
    fn set(&self, session_id: &str, key: &str, value: String);
    fn destroy(&self, session_id: &str);
}

#[derive(Clone)]
pub struct HttpServerSettings {
    pub bind_addresses: Vec<BindAddress>,
    /// TCP port; 0 binds an ephemeral port reported by
    /// [`HttpListener::bound_addresses`].
    pub port: u16,
    /// Virtual-host selector matched against the request `Host` header.
    pub host_name: String,
    pub tls: Option<TlsSettings>,
    pub options: HttpServerOptions,
    pub max_request_header_size: usize,
    pub max_request_size: u64,
    pub keep_alive_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub error_page_handler: Option<ErrorPageHandler>,
    /// Invoked with the peer address before dispatching; `true` rejects
    /// the request with a 403.
    pub reject_connection_predicate: Option<Arc<dyn Fn(&SocketAddr) -> bool + Send + Sync>>,
    pub session_store: Option<Arc<dyn SessionStore>>,
    /// Access log format (see [`crate::http::log`]); `None` disables the
    /// access log.
    pub access_log_format: Option<String>,
}

impl Default for HttpServerSettings {
    fn default() -> Self {
        Self {
            bind_addresses: vec![BindAddress::Ip("127.0.0.1".into())],
            port: 8080,
            host_name: String::new(),
            tls: None,
            options: HttpServerOptions::default(),
            max_request_header_size: 8 * 1024,
            max_request_size: 2 * 1024 * 1024,
            keep_alive_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(60),
            error_page_handler: None,
            reject_connection_predicate: None,
            session_store: None,
            access_log_format: None,
        }
    }
}

impl std::fmt::Debug for HttpServerSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServerSettings")
            .field("bind_addresses", &self.bind_addresses)
            .field("port", &self.port)
            .field("host_name", &self.host_name)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

pub type RequestHandler =
    Arc<dyn Fn(&mut HttpServerRequest<'_>, &mut HttpServerResponse) -> Result<()> + Send + Sync>;

struct VirtualHost {
    settings: HttpServerSettings,
    handler: RequestHandler,
}

/// An HTTP server definition: one primary host plus any number of
/// virtual hosts sharing its listeners.
pub struct HttpServer {
    hosts: Vec<VirtualHost>,
}

impl HttpServer {
    pub fn new<H>(settings: HttpServerSettings, handler: H) -> Self
    where
        H: Fn(&mut HttpServerRequest<'_>, &mut HttpServerResponse) -> Result<()>
            + Send
            + Sync
            + 'static,
    {
        Self {
            hosts: vec![VirtualHost {
                settings,
                handler: Arc::new(handler),
            }],
        }
    }

    /// Registers an additional virtual host, selected by its `host_name`
    /// against the request `Host` header. The primary host's bind
    /// addresses and listeners are shared.
    pub fn add_virtual_host<H>(&mut self, settings: HttpServerSettings, handler: H)
    where
        H: Fn(&mut HttpServerRequest<'_>, &mut HttpServerResponse) -> Result<()>
            + Send
            + Sync
            + 'static,
    {
        self.hosts.push(VirtualHost {
            settings,
            handler: Arc::new(handler),
        });
    }

    /// Binds every configured address and starts accepting. One fiber
    /// runs per listener, one per connection.
    pub fn listen(self, rt: &Runtime) -> Result<HttpListener> {
        let primary = &self.hosts[0].settings;
        let tls_config = match &primary.tls {
            Some(tls) => Some(build_server_config(tls)?),
            None => None,
        };
        let bind_addresses = primary.bind_addresses.clone();
        let port = primary.port;
        let hosts = Arc::new(self.hosts);

        let mut bound = Vec::new();
        let mut accept_fibers = Vec::new();
        for address in &bind_addresses {
            match address {
                BindAddress::Ip(ip) => {
                    let listener = TcpListener::bind(ip, port)?;
                    let local = listener.local_addr()?;
                    bound.push(local);
                    log::info!("listening for HTTP requests on {local}");
                    let hosts = Arc::clone(&hosts);
                    let tls_config = tls_config.clone();
                    let rt2 = rt.clone();
                    let fiber =
                        rt.spawn(move || accept_loop_tcp(listener, hosts, tls_config, rt2))?;
                    accept_fibers.push(fiber.task());
                }
                BindAddress::Unix(path) => {
                    let listener = UnixListener::bind(path)?;
                    log::info!("listening for HTTP requests on {}", path.display());
                    let hosts = Arc::clone(&hosts);
                    let rt2 = rt.clone();
                    let fiber = rt.spawn(move || accept_loop_unix(listener, hosts, rt2))?;
                    accept_fibers.push(fiber.task());
                }
            }
        }
        Ok(HttpListener {
            bound,
            accept_fibers,
        })
    }
}

/// Handle to a listening server; dropping it stops the accept loops.
pub struct HttpListener {
    bound: Vec<SocketAddr>,
    accept_fibers: Vec<TaskHandle>,
}

impl HttpListener {
    /// The actually bound TCP addresses (with ephemeral ports resolved).
    pub fn bound_addresses(&self) -> &[SocketAddr] {
        &self.bound
    }

    /// Stops accepting new connections; in-flight connections finish on
    /// their own.
    pub fn stop(&self) {
        for f in &self.accept_fibers {
            f.interrupt();
        }
    }
}

impl Drop for HttpListener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop_tcp(
    listener: TcpListener,
    hosts: Arc<Vec<VirtualHost>>,
    tls_config: Option<Arc<rustls::ServerConfig>>,
    rt: Runtime,
) {
    loop {
        let mut conn = match listener.accept() {
            Ok(conn) => conn,
            Err(Error::Interrupted) => return,
            Err(e) => {
                log::error!("failed to accept connection: {e}");
                continue;
            }
        };
        let settings = &hosts[0].settings;
        conn.set_read_timeout(settings.read_timeout);
        conn.set_write_timeout(settings.write_timeout);
        let _ = conn.set_nodelay(true);
        let hosts = Arc::clone(&hosts);
        let tls_config = tls_config.clone();
        let distribute = settings.options.contains(HttpServerOptions::DISTRIBUTE);
        let spawn_result = if distribute {
            rt.spawn_worker(move || serve_accepted(conn, hosts, tls_config))
        } else {
            rt.spawn(move || serve_accepted(conn, hosts, tls_config))
        };
        if let Err(e) = spawn_result {
            log::error!("failed to spawn connection fiber: {e}");
        }
    }
}

fn serve_accepted(
    conn: TcpConnection,
    hosts: Arc<Vec<VirtualHost>>,
    tls_config: Option<Arc<rustls::ServerConfig>>,
) {
    let peer = conn.peer_addr();
    match tls_config {
        Some(config) => match TlsStream::accept(conn, config) {
            Ok(tls) => serve_connection(Box::new(tls), hosts, true),
            Err(e) => log::debug!("TLS accept failed for {peer:?}: {e}"),
        },
        None => serve_connection(Box::new(conn), hosts, false),
    }
}

fn accept_loop_unix(listener: UnixListener, hosts: Arc<Vec<VirtualHost>>, rt: Runtime) {
    loop {
        let mut conn = match listener.accept() {
            Ok(conn) => conn,
            Err(Error::Interrupted) => return,
            Err(e) => {
                log::error!("failed to accept connection: {e}");
                continue;
            }
        };
        let settings = &hosts[0].settings;
        conn.set_read_timeout(settings.read_timeout);
        conn.set_write_timeout(settings.write_timeout);
        let hosts = Arc::clone(&hosts);
        if let Err(e) = rt.spawn(move || serve_connection(Box::new(conn), hosts, false)) {
            log::error!("failed to spawn connection fiber: {e}");
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Request
////////////////////////////////////////////////////////////////////////////////

pub(crate) type BoxedConn = Box<dyn ConnectionStream + Send>;
pub(crate) type ServerReader = BufferedReader<BoxedConn>;

/// A single parsed request, valid for the duration of one handler call.
pub struct HttpServerRequest<'a> {
    pub method: Method,
    pub http_version: HttpVersion,
    /// The raw request target as received (origin-form or absolute-form).
    pub request_target: String,
    /// Full request URL; requires [`HttpServerOptions::PARSE_URL`].
    pub url: Option<Url>,
    /// The path portion of the target, percent-encoded as received.
    pub path: String,
    /// Decoded query pairs; requires
    /// [`HttpServerOptions::PARSE_QUERY_STRING`].
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub peer_address: Option<SocketAddr>,
    /// Whether the request arrived over TLS.
    pub tls: bool,
    /// Decoded request cookies; requires
    /// [`HttpServerOptions::PARSE_COOKIES`].
    pub cookies: Vec<(String, String)>,
    /// Decoded form fields (urlencoded or multipart).
    pub form: HashMap<String, String>,
    /// Parsed JSON body; requires [`HttpServerOptions::PARSE_JSON_BODY`].
    pub json: Option<serde_json::Value>,
    /// Files uploaded through a multipart body.
    pub files: Vec<UploadedFile>,
    /// Parameters captured by router placeholders.
    pub params: HashMap<String, String>,
    body: Box<dyn InputStream + 'a>,
    pub(crate) upgrade_reader: Option<&'a mut ServerReader>,
}

impl<'a> HttpServerRequest<'a> {
    /// The request body stream (drained already when option-driven body
    /// parsing consumed it).
    pub fn body(&mut self) -> &mut dyn InputStream {
        &mut self.body
    }

    /// Reads the whole remaining body, bounded by `max` bytes.
    pub fn read_body(&mut self, max: u64) -> Result<Vec<u8>> {
        read_limited(&mut self.body, max)
    }

    pub fn host(&self) -> Option<&str> {
        self.headers.get("host")
    }

    /// A named parameter captured by the router.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// `true` when the client asked to switch protocols.
    pub fn is_upgrade(&self) -> bool {
        self.upgrade_reader.is_some()
    }
}

impl std::fmt::Debug for HttpServerRequest<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServerRequest")
            .field("method", &self.method)
            .field("target", &self.request_target)
            .field("version", &self.http_version)
            .finish_non_exhaustive()
    }
}

fn read_limited(body: &mut (impl InputStream + ?Sized), max: u64) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut chunk = [0u8; 8 * 1024];
    loop {
        let n = body.read(&mut chunk, IoMode::Once)?;
        if n == 0 {
            return Ok(out);
        }
        if out.len() as u64 + n as u64 > max {
            return Err(ProtocolError::BodyTooLarge.into());
        }
        out.extend_from_slice(&chunk[..n]);
    }
}

/// Bounds a reader by a cumulative byte budget; exceeding it is the
/// protocol error the server maps to 413. Used for chunked request
/// bodies whose size is unknown up front.
struct LimitedReader<R> {
    inner: R,
    remaining: u64,
}

impl<R: InputStream> LimitedReader<R> {
    fn new(inner: R, limit: u64) -> Self {
        Self {
            inner,
            remaining: limit,
        }
    }
}

impl<R: InputStream> InputStream for LimitedReader<R> {
    fn read(&mut self, buf: &mut [u8], mode: IoMode) -> Result<usize> {
        let n = self.inner.read(buf, mode)?;
        if n as u64 > self.remaining {
            return Err(ProtocolError::BodyTooLarge.into());
        }
        self.remaining -= n as u64;
        Ok(n)
    }

    fn least_size(&mut self) -> Result<u64> {
        self.inner.least_size()
    }

    fn data_available(&self) -> usize {
        self.inner.data_available()
    }

    fn wait_for_data(&mut self, timeout: Duration) -> Result<bool> {
        self.inner.wait_for_data(timeout)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Response
////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    HeadersMutable,
    HeadersCommitted,
    BodyClosed,
}

enum BodyState {
    /// Not yet decided; chosen when the headers commit.
    Unset,
    /// `Content-Length` framing with the bytes still owed.
    Counted(u64),
    Chunked(ChunkedWriter<BoxedConn>),
    /// HTTP/1.0 fallback: the body runs until the connection closes.
    CloseDelimited,
    Done,
}

/// The response under construction for one request.
///
/// The life of a response is a straight line: headers are mutable until
/// the first body write commits them, body writes are allowed until
/// finalization, and nothing is allowed after that. A 1xx status may be
/// sent while the headers are still mutable.
pub struct HttpServerResponse {
    pub status_code: u16,
    headers: HeaderMap,
    http_version: HttpVersion,
    cookies: Vec<Cookie>,
    conn: BoxedConn,
    phase: Phase,
    body: BodyState,
    head_request: bool,
    keep_alive_allowed: bool,
    keep_alive: bool,
    bytes_written: u64,
    pub(crate) upgraded: bool,
}

impl HttpServerResponse {
    fn new(
        conn: BoxedConn,
        http_version: HttpVersion,
        head_request: bool,
        keep_alive_allowed: bool,
    ) -> Self {
        Self {
            status_code: 200,
            headers: HeaderMap::new(),
            http_version,
            cookies: Vec::new(),
            conn,
            phase: Phase::HeadersMutable,
            body: BodyState::Unset,
            head_request,
            keep_alive_allowed,
            keep_alive: keep_alive_allowed,
            bytes_written: 0,
            upgraded: false,
        }
    }

    pub fn status(&mut self, code: u16) -> Result<()> {
        if self.phase != Phase::HeadersMutable {
            return Err(Error::usage("status change after headers were sent"));
        }
        self.status_code = code;
        Ok(())
    }

    /// Read access to the outgoing headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Sets a header, replacing previous values. Fails once the headers
    /// are committed.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) -> Result<()> {
        if self.phase != Phase::HeadersMutable {
            return Err(Error::usage("header mutation after headers were sent"));
        }
        self.headers.set(name, value);
        Ok(())
    }

    /// Appends a header without replacing existing values.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) -> Result<()> {
        if self.phase != Phase::HeadersMutable {
            return Err(Error::usage("header mutation after headers were sent"));
        }
        self.headers.add(name, value);
        Ok(())
    }

    pub fn set_cookie(&mut self, cookie: Cookie) -> Result<()> {
        if self.phase != Phase::HeadersMutable {
            return Err(Error::usage("cookie set after headers were sent"));
        }
        self.cookies.push(cookie);
        Ok(())
    }

    pub fn is_committed(&self) -> bool {
        self.phase != Phase::HeadersMutable
    }

    pub fn is_finalized(&self) -> bool {
        self.phase == Phase::BodyClosed
    }

    /// Bytes of response body emitted so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Whether the connection will be kept open after this exchange.
    pub fn keep_alive(&self) -> bool {
        self.keep_alive && !self.upgraded
    }

    /// Forces the connection to close after this exchange.
    pub fn set_connection_close(&mut self) {
        self.keep_alive = false;
    }

    /// Sends an informational 1xx status line without leaving the
    /// headers-mutable state.
    pub fn write_continue(&mut self) -> Result<()> {
        if self.phase != Phase::HeadersMutable {
            return Err(Error::usage("1xx status after headers were sent"));
        }
        let line = format!("{} 100 Continue\r\n\r\n", self.http_version);
        self.conn.write_all(line.as_bytes())?;
        self.conn.flush()
    }

    /// Writes the full body at once: sets `Content-Length` (and the
    /// content type when given), commits and finalizes.
    pub fn write_body(&mut self, data: &[u8], content_type: Option<&str>) -> Result<()> {
        if self.phase != Phase::HeadersMutable {
            return Err(Error::usage("write_body on a committed response"));
        }
        if let Some(ct) = content_type {
            self.headers.set("Content-Type", ct);
        }
        self.headers.set("Content-Length", data.len().to_string());
        self.commit_headers()?;
        self.write_body_bytes(data)?;
        self.finalize()
    }

    /// Commits a redirect response with the given status (301, 302, 303,
    /// 307 or 308) and an empty body.
    pub fn redirect(&mut self, location: &str, status: u16) -> Result<()> {
        if self.phase != Phase::HeadersMutable {
            return Err(Error::usage("redirect on a committed response"));
        }
        self.status_code = status;
        self.headers.set("Location", location);
        self.write_body(b"", None)
    }

    /// Writes a piece of the response body, committing the headers on the
    /// first call. Without a `Content-Length` header the body is sent
    /// chunked on HTTP/1.1 and connection-delimited on HTTP/1.0.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        match self.phase {
            Phase::HeadersMutable => self.commit_headers()?,
            Phase::HeadersCommitted => {}
            Phase::BodyClosed => return Err(Error::usage("write after finalize")),
        }
        self.write_body_bytes(data)?;
        Ok(())
    }

    fn write_body_bytes(&mut self, data: &[u8]) -> Result<usize> {
        let n = data.len();
        match &mut self.body {
            BodyState::Unset => return Err(Error::usage("body writer not yet set up")),
            BodyState::Done => return Err(Error::usage("write after finalize")),
            BodyState::Counted(remaining) => {
                if (n as u64) > *remaining {
                    return Err(Error::usage(
                        "response body exceeds the declared Content-Length",
                    ));
                }
                *remaining -= n as u64;
                if !self.head_request {
                    self.conn.write_all(data)?;
                }
            }
            BodyState::Chunked(w) => {
                if !self.head_request {
                    w.write_all(data)?;
                }
            }
            BodyState::CloseDelimited => {
                if !self.head_request {
                    self.conn.write_all(data)?;
                }
            }
        }
        self.bytes_written += n as u64;
        Ok(n)
    }

    /// Serializes the status line and header block and fixes the body
    /// framing.
    fn commit_headers(&mut self) -> Result<()> {
        debug_assert_eq!(self.phase, Phase::HeadersMutable);

        let content_length = match self.headers.get("content-length") {
            Some(v) => Some(
                v.parse::<u64>()
                    .map_err(|_| Error::usage("invalid Content-Length header"))?,
            ),
            None => None,
        };
        let body = match content_length {
            Some(n) => BodyState::Counted(n),
            None if no_body_status(self.status_code) => BodyState::Counted(0),
            None if self.http_version == HttpVersion::Http11 => {
                self.headers.set("Transfer-Encoding", "chunked");
                BodyState::Chunked(ChunkedWriter::new(self.conn.try_clone()?))
            }
            None => {
                // Connection-close framing is the only remaining way to
                // delimit the body.
                self.keep_alive = false;
                BodyState::CloseDelimited
            }
        };

        if !self.keep_alive_allowed {
            self.keep_alive = false;
        }
        if let Some(v) = self.headers.get("connection") {
            if v.to_ascii_lowercase().contains("close") {
                self.keep_alive = false;
            }
        }
        if !self.headers.contains("date") {
            self.headers
                .set("Date", httpdate::fmt_http_date(SystemTime::now()));
        }
        if !self.headers.contains("connection") {
            if self.keep_alive {
                if self.http_version == HttpVersion::Http10 {
                    self.headers.set("Connection", "keep-alive");
                }
            } else {
                self.headers.set("Connection", "close");
            }
        }

        let mut head = format!(
            "{} {} {}\r\n",
            self.http_version,
            self.status_code,
            status_phrase(self.status_code)
        );
        for (name, value) in self.headers.iter() {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        for cookie in &self.cookies {
            head.push_str("Set-Cookie: ");
            head.push_str(&cookie.to_set_cookie_string());
            head.push_str("\r\n");
        }
        head.push_str("\r\n");
        self.conn.write_all(head.as_bytes())?;

        self.body = body;
        self.phase = Phase::HeadersCommitted;
        Ok(())
    }

    /// Commits (if still mutable) and terminates the body framing. A
    /// `Content-Length` shortfall is an error that closes the connection.
    pub fn finalize(&mut self) -> Result<()> {
        if self.phase == Phase::BodyClosed {
            return Ok(());
        }
        if self.phase == Phase::HeadersMutable {
            if !self.headers.contains("content-length") {
                self.headers.set("Content-Length", "0");
            }
            self.commit_headers()?;
        }
        let body = std::mem::replace(&mut self.body, BodyState::Done);
        match body {
            BodyState::Counted(remaining) => {
                if remaining > 0 && !self.head_request {
                    self.keep_alive = false;
                    return Err(Error::usage(
                        "response finalized before the declared Content-Length was written",
                    ));
                }
            }
            BodyState::Chunked(mut w) => {
                w.finalize()?;
            }
            BodyState::Unset | BodyState::CloseDelimited | BodyState::Done => {}
        }
        self.conn.flush()?;
        self.phase = Phase::BodyClosed;
        Ok(())
    }

    /// Emits a `101 Switching Protocols` response and hands out a raw
    /// connection writer. Used by the WebSocket upgrade; the connection
    /// leaves the keep-alive loop afterwards.
    pub(crate) fn switch_protocol(&mut self, extra_headers: HeaderMap) -> Result<BoxedConn> {
        if self.phase != Phase::HeadersMutable {
            return Err(Error::usage("upgrade on a committed response"));
        }
        self.status_code = 101;
        for (name, value) in extra_headers.iter() {
            self.headers.set(name, value);
        }
        self.upgraded = true;
        self.keep_alive = false;

        let mut head = format!("{} 101 {}\r\n", self.http_version, status_phrase(101));
        for (name, value) in self.headers.iter() {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        head.push_str("\r\n");
        self.conn.write_all(head.as_bytes())?;
        self.conn.flush()?;
        self.phase = Phase::BodyClosed;
        self.body = BodyState::Done;
        self.conn.try_clone()
    }
}

impl std::fmt::Debug for HttpServerResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServerResponse")
            .field("status", &self.status_code)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

fn no_body_status(status: u16) -> bool {
    matches!(status, 204 | 304) || (100..200).contains(&status)
}

////////////////////////////////////////////////////////////////////////////////
// Dispatcher
////////////////////////////////////////////////////////////////////////////////

/// Serves every request arriving on one connection. The calling fiber
/// owns the connection until it closes.
pub(crate) fn serve_connection(conn: BoxedConn, hosts: Arc<Vec<VirtualHost>>, tls: bool) {
    let peer = conn.peer_addr();
    let write_conn = match conn.try_clone() {
        Ok(w) => w,
        Err(e) => {
            log::error!("connection cannot be served: {e}");
            return;
        }
    };
    let mut reader: ServerReader = BufferedReader::new(conn);
    let mut first = true;
    loop {
        match serve_one_request(&mut reader, &write_conn, &hosts, peer, tls, first) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                match &e {
                    Error::Io(_) | Error::TimedOut | Error::Interrupted => {
                        log::debug!("connection from {peer:?} ended: {e}")
                    }
                    other => log::debug!("closing connection from {peer:?}: {other}"),
                }
                break;
            }
        }
        first = false;
    }
    let mut conn = reader.into_inner();
    let _ = conn.close();
}

/// Returns `Ok(true)` to keep the connection for another request.
fn serve_one_request(
    reader: &mut ServerReader,
    write_conn: &BoxedConn,
    hosts: &Arc<Vec<VirtualHost>>,
    peer: Option<SocketAddr>,
    tls: bool,
    first: bool,
) -> Result<bool> {
    let primary = &hosts[0].settings;

    // Idle keep-alive wait between requests.
    if !first && !reader.wait_for_data(primary.keep_alive_timeout)? {
        return Ok(false);
    }
    if reader.least_size()? == 0 {
        // Peer closed between requests.
        return Ok(false);
    }

    let started = SystemTime::now();
    let start_clock = clock::now();

    let head = match parse_request_head(reader, primary) {
        Ok(head) => head,
        Err(e) => {
            emit_parse_error(write_conn, &e);
            return Err(e);
        }
    };

    // Virtual-host resolution by Host header; the primary host is the
    // fallback.
    let vhost = head
        .headers
        .get("host")
        .map(|h| h.split(':').next().unwrap_or(h).to_string())
        .and_then(|h| {
            hosts.iter().find(|v| {
                !v.settings.host_name.is_empty() && v.settings.host_name.eq_ignore_ascii_case(&h)
            })
        })
        .unwrap_or(&hosts[0]);
    let settings = &vhost.settings;

    let request_line = format!(
        "{} {} {}",
        head.method, head.request_target, head.http_version
    );
    let keep_alive_allowed = settings.options.contains(HttpServerOptions::KEEP_ALIVE)
        && match head.http_version {
            HttpVersion::Http11 => !head.headers.has_token("connection", "close"),
            HttpVersion::Http10 => head.headers.has_token("connection", "keep-alive"),
        };

    let mut res = HttpServerResponse::new(
        write_conn.try_clone()?,
        head.http_version,
        head.method == Method::Head,
        keep_alive_allowed,
    );

    // Connection-reject predicate.
    if let (Some(reject), Some(addr)) = (&settings.reject_connection_predicate, &peer) {
        if reject(addr) {
            render_error_page(
                &mut res,
                settings,
                &ErrorPageInfo {
                    status: 403,
                    message: "Connection denied.".into(),
                    detail: String::new(),
                },
            );
            let _ = res.finalize();
            return Ok(false);
        }
    }

    // Acknowledge 100-continue before anything reads the body.
    if head
        .headers
        .get("expect")
        .map_or(false, |v| v.eq_ignore_ascii_case("100-continue"))
        && head.framing != BodyFraming::Empty
    {
        res.write_continue()?;
    }

    let is_upgrade =
        head.headers.has_token("connection", "upgrade") && head.framing == BodyFraming::Empty;

    // Assemble the body reader stack; the upgrade path keeps the raw
    // reader instead.
    let (body, upgrade_reader): (Box<dyn InputStream + '_>, Option<&mut ServerReader>) =
        if is_upgrade {
            (Box::new(MemoryStream::new()), Some(reader))
        } else {
            let base: Box<dyn InputStream + '_> = match head.framing {
                BodyFraming::Empty => Box::new(MemoryStream::new()),
                BodyFraming::Counted(n) => Box::new(CountedReader::new(&mut *reader, n)),
                BodyFraming::Chunked => Box::new(LimitedReader::new(
                    ChunkedReader::new(&mut *reader),
                    settings.max_request_size,
                )),
            };
            let body: Box<dyn InputStream + '_> = match head
                .headers
                .get("content-encoding")
                .map(str::to_ascii_lowercase)
                .as_deref()
            {
                Some("gzip") => Box::new(GzipReader::new(base)),
                Some("deflate") => Box::new(DeflateReader::new(base)),
                _ => base,
            };
            (body, None)
        };

    let mut req = build_request(head, body, upgrade_reader, peer, tls, settings);

    // Option-driven eager body parsing. A transport failure while reading
    // the body aborts outright; only protocol-level failures get a page.
    if let Err(e) = parse_body_attributes(&mut req, settings) {
        if !e.is_transport() {
            let info = error_info(&e, settings);
            render_error_page(&mut res, settings, &info);
            let _ = res.finalize();
        }
        return Err(e);
    }

    // Hand over to the user handler.
    let outcome = (vhost.handler)(&mut req, &mut res);
    match outcome {
        Ok(()) => {
            if !res.is_committed() && !res.upgraded {
                render_error_page(
                    &mut res,
                    settings,
                    &ErrorPageInfo {
                        status: 404,
                        message: "Not Found".into(),
                        detail: String::new(),
                    },
                );
            }
        }
        Err(e) => {
            log::debug!("request handler signalled an error: {e}");
            if res.is_committed() || e.is_transport() {
                // Either the headers are already on the wire or the
                // connection itself failed: the in-flight response is
                // aborted, no error page is attempted.
                res.set_connection_close();
                if e.is_transport() {
                    return Err(e);
                }
            } else {
                let info = error_info(&e, settings);
                render_error_page(&mut res, settings, &info);
            }
        }
    }

    let finalize_ok = match res.finalize() {
        Ok(()) => true,
        Err(e) => {
            log::error!("failed to finalize response: {e}");
            false
        }
    };

    let keep = finalize_ok && res.keep_alive();
    // Drain whatever request body the handler left unread so the next
    // request starts at a frame boundary.
    if keep {
        let mut sink = [0u8; 8 * 1024];
        loop {
            match req.body.read(&mut sink, IoMode::Once) {
                Ok(0) => break,
                Ok(_) => {}
                Err(_) => return Ok(false),
            }
        }
    }

    if let Some(format) = &settings.access_log_format {
        write_access_log(
            format,
            &AccessLogEntry {
                peer,
                request_line: &request_line,
                path: &req.path,
                status: res.status_code,
                body_bytes: res.bytes_written(),
                started,
                duration: start_clock.elapsed(),
            },
        );
    }

    Ok(keep)
}

#[derive(Debug)]
struct RequestHead {
    method: Method,
    request_target: String,
    http_version: HttpVersion,
    headers: HeaderMap,
    framing: BodyFraming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyFraming {
    Empty,
    Counted(u64),
    Chunked,
}

fn parse_request_head(
    reader: &mut ServerReader,
    settings: &HttpServerSettings,
) -> Result<RequestHead> {
    // Tolerate a little leading empty-line noise before the request line.
    let mut request_line = String::new();
    for _ in 0..4 {
        request_line = reader.read_line(settings.max_request_header_size)?;
        if !request_line.is_empty() {
            break;
        }
    }
    if request_line.is_empty() {
        return Err(ProtocolError::InvalidRequestLine.into());
    }

    let mut parts = request_line.split(' ');
    let method = Method::parse(parts.next().unwrap_or(""))?;
    let target = parts.next().ok_or(ProtocolError::InvalidRequestLine)?;
    let version = HttpVersion::parse(parts.next().ok_or(ProtocolError::InvalidRequestLine)?)?;
    if parts.next().is_some() || target.is_empty() {
        return Err(ProtocolError::InvalidRequestLine.into());
    }

    let headers = parse_header_block(reader, settings.max_request_header_size)?;

    if version == HttpVersion::Http11 && !headers.contains("host") {
        return Err(ProtocolError::MissingHost.into());
    }

    let transfer_encoding = headers.get("transfer-encoding");
    let content_length = headers.get("content-length");
    let framing = match (transfer_encoding, content_length) {
        (Some(_), Some(_)) => return Err(ProtocolError::AmbiguousFraming.into()),
        (Some(te), None) => {
            if !te.eq_ignore_ascii_case("chunked") {
                return Err(ProtocolError::InvalidChunk("unsupported transfer coding").into());
            }
            BodyFraming::Chunked
        }
        (None, Some(cl)) => {
            let n: u64 = cl
                .trim()
                .parse()
                .map_err(|_| ProtocolError::InvalidContentLength)?;
            if n > settings.max_request_size {
                return Err(ProtocolError::BodyTooLarge.into());
            }
            if n == 0 {
                BodyFraming::Empty
            } else {
                BodyFraming::Counted(n)
            }
        }
        (None, None) => BodyFraming::Empty,
    };

    Ok(RequestHead {
        method,
        request_target: target.to_string(),
        http_version: version,
        headers,
        framing,
    })
}

fn build_request<'a>(
    head: RequestHead,
    body: Box<dyn InputStream + 'a>,
    upgrade_reader: Option<&'a mut ServerReader>,
    peer: Option<SocketAddr>,
    tls: bool,
    settings: &HttpServerSettings,
) -> HttpServerRequest<'a> {
    let options = settings.options;

    let (path, query_string) = match head.request_target.split_once('?') {
        Some((p, q)) => (p.to_string(), q.to_string()),
        None => (head.request_target.clone(), String::new()),
    };

    let url = if options.contains(HttpServerOptions::PARSE_URL) {
        if head.request_target.starts_with('/') {
            let scheme = if tls { "https" } else { "http" };
            let host = head.headers.get("host").unwrap_or("localhost");
            Url::parse(&format!("{scheme}://{host}{}", head.request_target)).ok()
        } else {
            Url::parse(&head.request_target).ok()
        }
    } else {
        None
    };

    // For absolute-form targets the path component comes from the URL.
    let path = if head.request_target.starts_with('/') {
        path
    } else {
        url.as_ref().map_or(path, |u| u.path().to_string())
    };

    let query = if options.contains(HttpServerOptions::PARSE_QUERY_STRING) {
        url::form_urlencoded::parse(query_string.as_bytes())
            .into_owned()
            .collect()
    } else {
        Vec::new()
    };

    let cookies = if options.contains(HttpServerOptions::PARSE_COOKIES) {
        head.headers
            .get_all("cookie")
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| {
                pair.trim()
                    .split_once('=')
                    .map(|(n, v)| (n.trim().to_string(), v.trim().to_string()))
            })
            .collect()
    } else {
        Vec::new()
    };

    HttpServerRequest {
        method: head.method,
        http_version: head.http_version,
        request_target: head.request_target,
        url,
        path,
        query,
        headers: head.headers,
        peer_address: peer,
        tls,
        cookies,
        form: HashMap::new(),
        json: None,
        files: Vec::new(),
        params: HashMap::new(),
        body,
        upgrade_reader,
    }
}

/// Consumes the body eagerly for the content types the option flags ask
/// for, leaving the parsed attributes on the request.
fn parse_body_attributes(
    req: &mut HttpServerRequest<'_>,
    settings: &HttpServerSettings,
) -> Result<()> {
    let options = settings.options;
    let content_type = req.headers.get("content-type").unwrap_or("").to_string();
    let limit = settings.max_request_size;

    if content_type.starts_with("application/x-www-form-urlencoded")
        && options.contains(HttpServerOptions::PARSE_FORM_BODY)
    {
        let data = read_limited(&mut req.body, limit)?;
        req.form = url::form_urlencoded::parse(&data).into_owned().collect();
    } else if content_type.starts_with("application/json")
        && options.contains(HttpServerOptions::PARSE_JSON_BODY)
    {
        let data = read_limited(&mut req.body, limit)?;
        if !data.is_empty() {
            req.json = Some(
                serde_json::from_slice(&data)
                    .map_err(|e| Error::status(400, format!("invalid JSON body: {e}")))?,
            );
        }
    } else if content_type.starts_with("multipart/form-data")
        && options.contains(HttpServerOptions::PARSE_MULTI_PART_BODY)
    {
        let boundary = multipart::boundary_from_content_type(&content_type)
            .ok_or_else(|| Error::status(400, "missing multipart boundary"))?;
        let parsed = multipart::parse(&mut req.body, &boundary, limit)?;
        req.form = parsed.fields;
        req.files = parsed.files;
    }
    Ok(())
}

fn error_info(e: &Error, settings: &HttpServerSettings) -> ErrorPageInfo {
    let with_detail = settings
        .options
        .contains(HttpServerOptions::ERROR_STACK_TRACES);
    match e {
        Error::Status { status, message } => ErrorPageInfo {
            status: *status,
            message: message.clone(),
            detail: String::new(),
        },
        Error::Protocol(p) => ErrorPageInfo {
            status: p.status_code(),
            message: p.to_string(),
            detail: String::new(),
        },
        // Transport errors never reach this point; what remains are
        // contract violations inside the handler.
        other => ErrorPageInfo {
            status: 500,
            message: "Internal Server Error".into(),
            detail: if with_detail {
                format!("{other:?}")
            } else {
                String::new()
            },
        },
    }
}

/// Renders an error response through the configured handler, falling
/// back to a minimal built-in page.
fn render_error_page(
    res: &mut HttpServerResponse,
    settings: &HttpServerSettings,
    info: &ErrorPageInfo,
) {
    if res.is_committed() {
        return;
    }
    let _ = res.status(info.status);
    if let Some(handler) = &settings.error_page_handler {
        match handler(res, info) {
            Ok(()) => return,
            Err(e) => log::error!("error page handler failed: {e}"),
        }
    }
    if res.is_committed() {
        return;
    }
    let mut body = format!(
        "<!DOCTYPE html>\n<html><head><title>{status} - {phrase}</title></head>\n\
         <body><h1>{status} - {phrase}</h1>\n<p>{message}</p>\n",
        status = info.status,
        phrase = status_phrase(info.status),
        message = info.message,
    );
    if !info.detail.is_empty() {
        body.push_str(&format!("<pre>{}</pre>\n", info.detail));
    }
    body.push_str("</body></html>\n");
    let _ = res.write_body(body.as_bytes(), Some("text/html; charset=UTF-8"));
}

/// Answers a request that failed to parse with the mapped status and
/// closes the connection.
fn emit_parse_error(write_conn: &BoxedConn, e: &Error) {
    let (status, message) = match e {
        Error::Protocol(p) => (p.status_code(), p.to_string()),
        _ => return,
    };
    let message = match e {
        Error::Protocol(ProtocolError::MissingHost) => "Missing Host header.".to_string(),
        _ => message,
    };
    let body = format!("{message}\n");
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=UTF-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        status_phrase(status),
        body.len(),
        body,
    );
    match write_conn.try_clone() {
        Ok(mut conn) => {
            let _ = conn.write_all(head.as_bytes());
            let _ = conn.flush();
        }
        Err(err) => log::debug!("cannot report parse error to peer: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::pipe_pair;

    fn parse_from(wire: &[u8]) -> Result<RequestHead> {
        let (mut ours, theirs) = pipe_pair(64 * 1024);
        ours.write_all(wire).unwrap();
        ours.finalize().unwrap();
        let mut reader: ServerReader = BufferedReader::new(Box::new(theirs));
        parse_request_head(&mut reader, &HttpServerSettings::default())
    }

    #[test]
    fn parses_simple_get() {
        let head = parse_from(b"GET /p?q=1 HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        assert_eq!(head.method, Method::Get);
        assert_eq!(head.request_target, "/p?q=1");
        assert_eq!(head.http_version, HttpVersion::Http11);
        assert_eq!(head.framing, BodyFraming::Empty);
    }

    #[test]
    fn missing_host_on_http11_is_rejected() {
        match parse_from(b"GET / HTTP/1.1\r\n\r\n") {
            Err(Error::Protocol(ProtocolError::MissingHost)) => {}
            other => panic!("expected MissingHost, got {other:?}"),
        }
    }

    #[test]
    fn host_optional_on_http10() {
        let head = parse_from(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        assert_eq!(head.http_version, HttpVersion::Http10);
    }

    #[test]
    fn te_and_cl_together_are_rejected() {
        let wire = b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\nContent-Length: 3\r\n\r\n";
        match parse_from(wire) {
            Err(Error::Protocol(ProtocolError::AmbiguousFraming)) => {}
            other => panic!("expected AmbiguousFraming, got {other:?}"),
        }
    }

    #[test]
    fn content_length_framing() {
        let head = parse_from(b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello").unwrap();
        assert_eq!(head.framing, BodyFraming::Counted(5));
    }

    #[test]
    fn chunked_framing() {
        let head =
            parse_from(b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n").unwrap();
        assert_eq!(head.framing, BodyFraming::Chunked);
    }

    #[test]
    fn oversized_declared_body_is_rejected() {
        let wire = b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 99999999999\r\n\r\n";
        match parse_from(wire) {
            Err(Error::Protocol(ProtocolError::BodyTooLarge)) => {}
            other => panic!("expected BodyTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn bad_version_is_rejected() {
        assert!(parse_from(b"GET / HTTP/2.0\r\nHost: x\r\n\r\n").is_err());
        assert!(parse_from(b"GET / FOO/1.1\r\nHost: x\r\n\r\n").is_err());
    }

    #[test]
    fn extra_request_line_parts_are_rejected() {
        assert!(parse_from(b"GET /  HTTP/1.1\r\nHost: x\r\n\r\n").is_err());
        assert!(parse_from(b"GET / HTTP/1.1 extra\r\nHost: x\r\n\r\n").is_err());
    }
}
