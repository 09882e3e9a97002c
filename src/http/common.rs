//! Shared HTTP wire-level types: methods, versions, header maps, status
//! phrases.

use std::fmt;

use crate::error::{ProtocolError, Result};
use crate::stream::{BufferedReader, InputStream};

////////////////////////////////////////////////////////////////////////////////
// Method
////////////////////////////////////////////////////////////////////////////////

/// Request methods, with extension methods carried verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
    Other(String),
}

impl Method {
    pub fn parse(token: &str) -> Result<Self> {
        if token.is_empty() || !token.bytes().all(is_tchar) {
            return Err(ProtocolError::InvalidRequestLine.into());
        }
        Ok(match token {
            "GET" => Self::Get,
            "HEAD" => Self::Head,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "DELETE" => Self::Delete,
            "CONNECT" => Self::Connect,
            "OPTIONS" => Self::Options,
            "TRACE" => Self::Trace,
            "PATCH" => Self::Patch,
            other => Self::Other(other.to_string()),
        })
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Connect => "CONNECT",
            Self::Options => "OPTIONS",
            Self::Trace => "TRACE",
            Self::Patch => "PATCH",
            Self::Other(s) => s,
        }
    }

    /// Methods a client may transparently retry on a fresh connection
    /// after a transient failure of a reused one.
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self,
            Self::Get | Self::Head | Self::Put | Self::Delete | Self::Options
        )
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_tchar(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

////////////////////////////////////////////////////////////////////////////////
// Version
////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
}

impl HttpVersion {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "HTTP/1.0" => Ok(Self::Http10),
            "HTTP/1.1" => Ok(Self::Http11),
            _ => Err(ProtocolError::BadVersion.into()),
        }
    }
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        })
    }
}

////////////////////////////////////////////////////////////////////////////////
// HeaderMap
////////////////////////////////////////////////////////////////////////////////

/// An ordered, case-insensitive header multimap.
///
/// Lookups ignore name case; iteration preserves insertion order,
/// duplicates and the exact spelling the setter used, which is also the
/// spelling emitted on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value for `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for `name` in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replaces every value of `name` with a single one, keeping the
    /// position of the first occurrence.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        let mut kept = None;
        let mut i = 0;
        while i < self.entries.len() {
            if self.entries[i].0.eq_ignore_ascii_case(&name) {
                if kept.is_none() {
                    kept = Some(i);
                    i += 1;
                } else {
                    self.entries.remove(i);
                }
            } else {
                i += 1;
            }
        }
        match kept {
            Some(i) => self.entries[i] = (name, value),
            None => self.entries.push((name, value)),
        }
    }

    /// Appends a value, keeping existing ones.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `true` when the comma-separated list under `name` contains
    /// `token`, compared case-insensitively. This is how `Connection`
    /// and `Upgrade` options are matched.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name).any(|v| {
            v.split(',')
                .any(|item| item.trim().eq_ignore_ascii_case(token))
        })
    }
}

////////////////////////////////////////////////////////////////////////////////
// Header block parsing
////////////////////////////////////////////////////////////////////////////////

/// Parses a `name: value` header block up to the empty line, unfolding
/// obs-fold continuations and stripping optional whitespace. The total
/// byte budget covers the whole block; exceeding it is the "too large"
/// protocol error the server maps to 431.
pub(crate) fn parse_header_block<R: InputStream>(
    reader: &mut BufferedReader<R>,
    max_total: usize,
) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    let mut budget = max_total;
    let mut pending: Option<(String, String)> = None;
    loop {
        let line = reader
            .read_line(budget)
            .map_err(|e| oversize(e))?;
        budget = budget
            .checked_sub(line.len() + 2)
            .ok_or(ProtocolError::HeadersTooLarge)?;
        if line.is_empty() {
            if let Some((name, value)) = pending.take() {
                headers.add(name, value);
            }
            return Ok(headers);
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            // obs-fold: the line continues the previous field value.
            match pending.as_mut() {
                Some((_, value)) => {
                    value.push(' ');
                    value.push_str(line.trim());
                }
                None => return Err(ProtocolError::InvalidHeader.into()),
            }
            continue;
        }
        if let Some((name, value)) = pending.take() {
            headers.add(name, value);
        }
        let (name, value) = line
            .split_once(':')
            .ok_or(ProtocolError::InvalidHeader)?;
        if name.is_empty() || name.ends_with(' ') || name.ends_with('\t') {
            return Err(ProtocolError::InvalidHeader.into());
        }
        pending = Some((name.to_string(), value.trim().to_string()));
    }
}

fn oversize(e: crate::error::Error) -> crate::error::Error {
    match e {
        crate::error::Error::Protocol(ProtocolError::LimitExceeded(_)) => {
            ProtocolError::HeadersTooLarge.into()
        }
        other => other,
    }
}

////////////////////////////////////////////////////////////////////////////////
// Status phrases
////////////////////////////////////////////////////////////////////////////////

/// The canonical reason phrase for a status code, `"Unknown"` for codes
/// without one.
pub fn status_phrase(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",
        102 => "Processing",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        203 => "Non-Authoritative Information",
        204 => "No Content",
        205 => "Reset Content",
        206 => "Partial Content",
        207 => "Multi-Status",
        226 => "IM Used",
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        305 => "Use Proxy",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        402 => "Payment Required",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        416 => "Range Not Satisfiable",
        417 => "Expectation Failed",
        421 => "Misdirected Request",
        426 => "Upgrade Required",
        428 => "Precondition Required",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        451 => "Unavailable For Legal Reasons",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        507 => "Insufficient Storage",
        511 => "Network Authentication Required",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemoryStream;

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut h = HeaderMap::new();
        h.add("Content-Type", "text/plain");
        assert_eq!(h.get("content-type"), Some("text/plain"));
        assert_eq!(h.get("CONTENT-TYPE"), Some("text/plain"));
    }

    #[test]
    fn duplicates_preserved_in_order() {
        let mut h = HeaderMap::new();
        h.add("Set-Cookie", "a=1");
        h.add("Set-Cookie", "b=2");
        let all: Vec<_> = h.get_all("set-cookie").collect();
        assert_eq!(all, ["a=1", "b=2"]);
    }

    #[test]
    fn set_replaces_all_values_in_place() {
        let mut h = HeaderMap::new();
        h.add("X-A", "1");
        h.add("X-B", "2");
        h.add("X-A", "3");
        h.set("x-a", "9");
        let names: Vec<_> = h.iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["x-a", "X-B"]);
        assert_eq!(h.get("X-A"), Some("9"));
    }

    #[test]
    fn connection_token_matching() {
        let mut h = HeaderMap::new();
        h.add("Connection", "keep-alive, Upgrade");
        assert!(h.has_token("connection", "upgrade"));
        assert!(h.has_token("connection", "keep-alive"));
        assert!(!h.has_token("connection", "close"));
    }

    #[test]
    fn parse_block_unfolds_and_strips() {
        let wire = b"Host: example.com\r\nX-Long: first\r\n second\r\nEmpty:\r\n\r\n".to_vec();
        let mut r = BufferedReader::new(MemoryStream::from_vec(wire));
        let h = parse_header_block(&mut r, 4096).unwrap();
        assert_eq!(h.get("host"), Some("example.com"));
        assert_eq!(h.get("x-long"), Some("first second"));
        assert_eq!(h.get("empty"), Some(""));
    }

    #[test]
    fn parse_block_rejects_oversize() {
        let mut wire = Vec::new();
        for i in 0..200 {
            wire.extend_from_slice(format!("X-Header-{i}: value\r\n").as_bytes());
        }
        wire.extend_from_slice(b"\r\n");
        let mut r = BufferedReader::new(MemoryStream::from_vec(wire));
        match parse_header_block(&mut r, 512) {
            Err(crate::error::Error::Protocol(ProtocolError::HeadersTooLarge)) => {}
            other => panic!("expected HeadersTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn parse_block_rejects_space_before_colon() {
        let wire = b"Bad Header : v\r\n\r\n".to_vec();
        let mut r = BufferedReader::new(MemoryStream::from_vec(wire));
        assert!(parse_header_block(&mut r, 4096).is_err());
    }

    #[test]
    fn unknown_status_phrase() {
        assert_eq!(status_phrase(200), "OK");
        assert_eq!(status_phrase(599), "Unknown");
    }
}
