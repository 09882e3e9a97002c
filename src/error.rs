//! Error handling utils.
//!
//! Every fallible API in the crate returns [`Result`] with the crate-wide
//! [`Error`]. The variants are deliberately few and keyed to how callers
//! recover: suspension outcomes ([`Error::Interrupted`], [`Error::TimedOut`]),
//! transport failures ([`Error::Io`]), malformed peer bytes
//! ([`Error::Protocol`]), TLS failures ([`Error::Tls`]), the explicit
//! non-2xx signal a request handler may raise ([`Error::Status`]) and plain
//! API misuse ([`Error::Usage`]).

use std::io;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////
// Error
////////////////////////////////////////////////////////////////////////////////

/// Represents all error cases for all routines of the crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A suspending call was cancelled via [`TaskHandle::interrupt`].
    ///
    /// [`TaskHandle::interrupt`]: crate::fiber::TaskHandle::interrupt
    #[error("fiber was interrupted")]
    Interrupted,

    /// A suspending call exceeded its timeout.
    #[error("operation timed out")]
    TimedOut,

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("tls error: {0}")]
    Tls(String),

    /// An explicit non-2xx signal raised by a request handler. The server
    /// dispatcher recognizes this kind and renders it as a response while
    /// the response headers are still mutable.
    #[error("HTTP status {status}: {message}")]
    Status { status: u16, message: String },

    /// Contract violation: write after finalize, header mutation after
    /// commit, returning a non-borrowed pool item and the like.
    #[error("usage error: {0}")]
    Usage(String),

    /// A joined fiber terminated abnormally; re-raised by `join`.
    #[error("fiber failed: {0}")]
    Task(String),
}

impl Error {
    #[inline]
    pub fn usage(msg: impl Into<String>) -> Self {
        Self::Usage(msg.into())
    }

    #[inline]
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    /// Returns the name of the variant as it is spelled in the source code.
    pub const fn variant_name(&self) -> &'static str {
        match self {
            Self::Interrupted => "Interrupted",
            Self::TimedOut => "TimedOut",
            Self::Io(_) => "Io",
            Self::Protocol(_) => "Protocol",
            Self::Tls(_) => "Tls",
            Self::Status { .. } => "Status",
            Self::Usage(_) => "Usage",
            Self::Task(_) => "Task",
        }
    }

    /// `true` for errors which a borrowed-connection reuse is allowed to
    /// retry transparently on a fresh connection.
    pub(crate) fn is_transient_io(&self) -> bool {
        matches!(self, Self::Io(_)) || matches!(self, Self::Protocol(ProtocolError::UnexpectedEof))
    }

    /// `true` for transport-level failures. A response cannot be rendered
    /// onto a connection that failed at this level; the dispatcher aborts
    /// and closes instead of emitting an error page.
    pub(crate) fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::TimedOut | Self::Interrupted | Self::Tls(_)
        )
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Self::Tls(e.to_string())
    }
}

const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<Error>();
};

////////////////////////////////////////////////////////////////////////////////
// ProtocolError
////////////////////////////////////////////////////////////////////////////////

/// Malformed HTTP or WebSocket bytes, with the sub-reason preserved so the
/// server can map it to the right status code.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ProtocolError {
    #[error("invalid request line")]
    InvalidRequestLine,

    #[error("invalid status line")]
    InvalidStatusLine,

    #[error("unsupported HTTP version")]
    BadVersion,

    #[error("invalid header line")]
    InvalidHeader,

    #[error("request header section exceeds the configured limit")]
    HeadersTooLarge,

    #[error("request body exceeds the configured limit")]
    BodyTooLarge,

    #[error("missing Host header")]
    MissingHost,

    #[error("both Transfer-Encoding and Content-Length present")]
    AmbiguousFraming,

    #[error("invalid chunk framing: {0}")]
    InvalidChunk(&'static str),

    #[error("invalid content length")]
    InvalidContentLength,

    #[error("stream ended in the middle of a protocol element")]
    UnexpectedEof,

    #[error("protocol element exceeds the configured limit: {0}")]
    LimitExceeded(&'static str),

    #[error("invalid websocket handshake: {0}")]
    BadUpgrade(&'static str),

    #[error("invalid websocket frame: {0}")]
    InvalidFrame(&'static str),

    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

impl ProtocolError {
    /// The response status the server answers with when this error is
    /// raised while parsing a request.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::HeadersTooLarge => 431,
            Self::BodyTooLarge => 413,
            Self::BadVersion => 505,
            _ => 400,
        }
    }
}
