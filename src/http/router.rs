//! URL router for the HTTP server.
//!
//! Routes are matched in registration order and the first match wins, so
//! an earlier route shadows a later one with the same pattern. Pattern
//! segments are matched literally and case-sensitively, except `:name`
//! which captures exactly one segment (URL-decoded into the request
//! parameters) and a trailing `*` which captures the remainder of the
//! path, including slashes and possibly empty.
//!
//! ```no_run
//! use weft::http::Router;
//!
//! let mut router = Router::new();
//! router.get("/users/:id", |req, res| {
//!     let id = req.param("id").unwrap_or_default().to_string();
//!     res.write_body(id.as_bytes(), Some("text/plain"))
//! });
//! router.get("/static/*", |req, res| {
//!     let rest = req.param("*").unwrap_or_default().to_string();
//!     res.write_body(rest.as_bytes(), Some("text/plain"))
//! });
//! ```
//!
//! A router is itself a request handler, so routers nest and plug
//! directly into [`HttpServer::new`](crate::http::HttpServer::new).

use std::collections::HashMap;

use crate::error::Result;
use crate::http::common::Method;
use crate::http::server::{HttpServerRequest, HttpServerResponse, RequestHandler};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
    Tail,
}

struct Route {
    method: Option<Method>,
    segments: Vec<Segment>,
    handler: RequestHandler,
}

#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a route; `method = None` matches any method.
    pub fn add<H>(&mut self, method: Option<Method>, pattern: &str, handler: H) -> &mut Self
    where
        H: Fn(&mut HttpServerRequest<'_>, &mut HttpServerResponse) -> Result<()>
            + Send
            + Sync
            + 'static,
    {
        self.routes.push(Route {
            method,
            segments: parse_pattern(pattern),
            handler: std::sync::Arc::new(handler),
        });
        self
    }

    pub fn get<H>(&mut self, pattern: &str, handler: H) -> &mut Self
    where
        H: Fn(&mut HttpServerRequest<'_>, &mut HttpServerResponse) -> Result<()>
            + Send
            + Sync
            + 'static,
    {
        self.add(Some(Method::Get), pattern, handler)
    }

    pub fn post<H>(&mut self, pattern: &str, handler: H) -> &mut Self
    where
        H: Fn(&mut HttpServerRequest<'_>, &mut HttpServerResponse) -> Result<()>
            + Send
            + Sync
            + 'static,
    {
        self.add(Some(Method::Post), pattern, handler)
    }

    pub fn put<H>(&mut self, pattern: &str, handler: H) -> &mut Self
    where
        H: Fn(&mut HttpServerRequest<'_>, &mut HttpServerResponse) -> Result<()>
            + Send
            + Sync
            + 'static,
    {
        self.add(Some(Method::Put), pattern, handler)
    }

    pub fn delete<H>(&mut self, pattern: &str, handler: H) -> &mut Self
    where
        H: Fn(&mut HttpServerRequest<'_>, &mut HttpServerResponse) -> Result<()>
            + Send
            + Sync
            + 'static,
    {
        self.add(Some(Method::Delete), pattern, handler)
    }

    /// Registers a route matching every method.
    pub fn any<H>(&mut self, pattern: &str, handler: H) -> &mut Self
    where
        H: Fn(&mut HttpServerRequest<'_>, &mut HttpServerResponse) -> Result<()>
            + Send
            + Sync
            + 'static,
    {
        self.add(None, pattern, handler)
    }

    /// Dispatches to the first matching route. A request no route claims
    /// is left untouched, which the server dispatcher answers with 404.
    pub fn handle(
        &self,
        req: &mut HttpServerRequest<'_>,
        res: &mut HttpServerResponse,
    ) -> Result<()> {
        for route in &self.routes {
            if let Some(method) = &route.method {
                if *method != req.method {
                    continue;
                }
            }
            if let Some(params) = match_path(&route.segments, &req.path) {
                req.params = params;
                return (route.handler)(req, res);
            }
        }
        Ok(())
    }
}

fn parse_pattern(pattern: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    for part in pattern.trim_start_matches('/').split('/') {
        if part == "*" {
            segments.push(Segment::Tail);
            break;
        } else if let Some(name) = part.strip_prefix(':') {
            segments.push(Segment::Param(name.to_string()));
        } else {
            segments.push(Segment::Literal(part.to_string()));
        }
    }
    segments
}

fn match_path(segments: &[Segment], path: &str) -> Option<HashMap<String, String>> {
    let path = path.strip_prefix('/').unwrap_or(path);
    let mut parts = path.split('/');
    let mut params = HashMap::new();

    let mut i = 0;
    loop {
        match segments.get(i) {
            Some(Segment::Tail) => {
                let rest: Vec<&str> = parts.collect();
                params.insert("*".to_string(), url_decode(&rest.join("/")));
                return Some(params);
            }
            Some(segment) => {
                let part = parts.next()?;
                match segment {
                    Segment::Literal(lit) => {
                        if lit != part {
                            return None;
                        }
                    }
                    Segment::Param(name) => {
                        params.insert(name.clone(), url_decode(part));
                    }
                    Segment::Tail => unreachable!(),
                }
            }
            None => {
                // The pattern is exhausted; the path must be too.
                if parts.next().is_some() {
                    return None;
                }
                return Some(params);
            }
        }
        i += 1;
    }
}

/// Percent-decodes one path segment; invalid escapes are kept verbatim.
fn url_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = &s[i + 1..i + 3];
            if let Ok(byte) = u8::from_str_radix(hex, 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params_for(pattern: &str, path: &str) -> Option<HashMap<String, String>> {
        match_path(&parse_pattern(pattern), path)
    }

    #[test]
    fn literal_match_is_exact_and_case_sensitive() {
        assert!(params_for("/a/b", "/a/b").is_some());
        assert!(params_for("/a/b", "/a/B").is_none());
        assert!(params_for("/a/b", "/a").is_none());
        assert!(params_for("/a/b", "/a/b/c").is_none());
    }

    #[test]
    fn named_param_captures_one_decoded_segment() {
        let params = params_for("/tag/:tag", "/tag/foo%2Fbar").unwrap();
        assert_eq!(params["tag"], "foo/bar");
        // An actual slash is a segment boundary and must not match.
        assert!(params_for("/tag/:tag", "/tag/foo/bar").is_none());
    }

    #[test]
    fn tail_captures_remainder_including_slashes() {
        let params = params_for("/static/*", "/static/css/site.css").unwrap();
        assert_eq!(params["*"], "css/site.css");
        let empty = params_for("/static/*", "/static/").unwrap();
        assert_eq!(empty["*"], "");
    }

    #[test]
    fn root_pattern() {
        assert!(params_for("/", "/").is_some());
        assert!(params_for("/", "/x").is_none());
    }
}
