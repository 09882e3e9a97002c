//! Cookies and cookie jars.
//!
//! [`Cookie`] carries the RFC 6265 attributes; [`MemoryCookieJar`] and
//! [`FileCookieJar`] implement the [`CookieStore`] matching rules the
//! client consults on send and receive. Matching follows RFC 6265 with
//! one pragmatic relaxation: `www.` prefixes are treated symmetrically
//! (a cookie set by `example.com` matches `www.example.com` and vice
//! versa). The relaxation is controlled by
//! [`CookieJarOptions::www_symmetry`] and is on by default.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use url::Url;

use crate::error::{Error, Result};

////////////////////////////////////////////////////////////////////////////////
// Cookie
////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: Option<String>,
    pub path: Option<String>,
    pub expires: Option<SystemTime>,
    pub max_age: Option<i64>,
    pub secure: bool,
    pub http_only: bool,
    /// When the cookie was created; the reference point for `Max-Age`.
    created: SystemTime,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: None,
            path: None,
            expires: None,
            max_age: None,
            secure: false,
            http_only: false,
            created: SystemTime::now(),
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn with_http_only(mut self, http_only: bool) -> Self {
        self.http_only = http_only;
        self
    }

    /// Parses a `Set-Cookie` attribute sequence. Unknown attributes are
    /// ignored; a malformed name/value pair is an error.
    pub fn parse_set_cookie(s: &str) -> Result<Self> {
        let mut parts = s.split(';');
        let pair = parts.next().unwrap_or("").trim();
        let (name, value) = pair
            .split_once('=')
            .ok_or_else(|| Error::usage(format!("malformed Set-Cookie: {s:?}")))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::usage("cookie with an empty name"));
        }
        let mut cookie = Cookie::new(name, value.trim().trim_matches('"'));
        for attr in parts {
            let attr = attr.trim();
            let (key, val) = match attr.split_once('=') {
                Some((k, v)) => (k.trim(), Some(v.trim())),
                None => (attr, None),
            };
            match key.to_ascii_lowercase().as_str() {
                "domain" => {
                    if let Some(v) = val {
                        cookie.domain = Some(v.trim_start_matches('.').to_ascii_lowercase());
                    }
                }
                "path" => cookie.path = val.map(str::to_string),
                "expires" => {
                    if let Some(v) = val {
                        cookie.expires = httpdate::parse_http_date(v).ok();
                    }
                }
                "max-age" => {
                    if let Some(v) = val {
                        cookie.max_age = v.parse().ok();
                    }
                }
                "secure" => cookie.secure = true,
                "httponly" => cookie.http_only = true,
                _ => {}
            }
        }
        Ok(cookie)
    }

    /// Serializes back into `Set-Cookie` attribute form, one line.
    pub fn to_set_cookie_string(&self) -> String {
        let mut out = format!("{}={}", self.name, self.value);
        if let Some(domain) = &self.domain {
            out.push_str("; Domain=");
            out.push_str(domain);
        }
        if let Some(path) = &self.path {
            out.push_str("; Path=");
            out.push_str(path);
        }
        if let Some(expires) = self.expires {
            out.push_str("; Expires=");
            out.push_str(&httpdate::fmt_http_date(expires));
        }
        if let Some(max_age) = self.max_age {
            out.push_str(&format!("; Max-Age={max_age}"));
        }
        if self.secure {
            out.push_str("; Secure");
        }
        if self.http_only {
            out.push_str("; HttpOnly");
        }
        out
    }

    /// `Max-Age` takes precedence over `Expires` per RFC 6265.
    pub fn expired(&self) -> bool {
        let now = SystemTime::now();
        if let Some(max_age) = self.max_age {
            if max_age <= 0 {
                return true;
            }
            return now >= self.created + Duration::from_secs(max_age as u64);
        }
        if let Some(expires) = self.expires {
            return now >= expires;
        }
        false
    }
}

////////////////////////////////////////////////////////////////////////////////
// Matching
////////////////////////////////////////////////////////////////////////////////

/// Jar behavior switches.
#[derive(Debug, Clone)]
pub struct CookieJarOptions {
    /// Treat `www.` prefixes symmetrically in domain matching. RFC 6265
    /// does not, but callers overwhelmingly expect a cookie set on
    /// `example.com` to travel to `www.example.com`; default on.
    pub www_symmetry: bool,
}

impl Default for CookieJarOptions {
    fn default() -> Self {
        Self { www_symmetry: true }
    }
}

fn strip_www(host: &str) -> &str {
    host.strip_prefix("www.").unwrap_or(host)
}

/// Domain-match per RFC 6265 §5.1.3, optionally with `www.` symmetry.
fn domain_matches(cookie_domain: &str, host: &str, www_symmetry: bool) -> bool {
    let cookie_domain = cookie_domain.trim_start_matches('.');
    let host = host.to_ascii_lowercase();
    let suffix_match = |d: &str, h: &str| h == d || h.ends_with(&format!(".{d}"));
    if suffix_match(cookie_domain, &host) {
        return true;
    }
    www_symmetry && suffix_match(strip_www(cookie_domain), strip_www(&host))
}

/// Path-match per RFC 6265 §5.1.4.
fn path_matches(cookie_path: &str, request_path: &str) -> bool {
    if cookie_path == request_path {
        return true;
    }
    request_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/')
            || request_path.as_bytes().get(cookie_path.len()) == Some(&b'/'))
}

/// The default path for a cookie without a `Path` attribute: the request
/// path up to, but not including, its last `/`.
fn default_path(request_path: &str) -> String {
    if !request_path.starts_with('/') {
        return "/".to_string();
    }
    match request_path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(at) => request_path[..at].to_string(),
    }
}

////////////////////////////////////////////////////////////////////////////////
// Stores
////////////////////////////////////////////////////////////////////////////////

/// The client-side hook: stores `Set-Cookie`s scoped to the request URL
/// on receive and contributes a `Cookie` header on send.
pub trait CookieStore: Send + Sync {
    fn store(&self, request_url: &Url, cookie: Cookie);

    /// Cookies matching (domain, path, security) of `url`, unexpired.
    fn cookies_for(&self, url: &Url) -> Vec<Cookie>;

    /// The `Cookie` header value for a request, if any cookie matches.
    fn cookie_header(&self, url: &Url) -> Option<String> {
        let cookies = self.cookies_for(url);
        if cookies.is_empty() {
            return None;
        }
        Some(
            cookies
                .iter()
                .map(|c| format!("{}={}", c.name, c.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

#[derive(Debug)]
struct StoredCookie {
    cookie: Cookie,
    /// Set when the cookie carried no `Domain` attribute: it then only
    /// matches its origin host exactly.
    host_only: bool,
    origin_host: String,
}

/// An in-memory cookie jar.
pub struct MemoryCookieJar {
    state: Mutex<Vec<StoredCookie>>,
    options: CookieJarOptions,
}

impl MemoryCookieJar {
    pub fn new() -> Self {
        Self::with_options(CookieJarOptions::default())
    }

    pub fn with_options(options: CookieJarOptions) -> Self {
        Self {
            state: Mutex::new(Vec::new()),
            options,
        }
    }

    fn insert(&self, stored: StoredCookie) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        // Same (name, domain, path) replaces.
        state.retain(|s| {
            !(s.cookie.name == stored.cookie.name
                && s.cookie.domain == stored.cookie.domain
                && s.cookie.path == stored.cookie.path
                && s.origin_host == stored.origin_host)
        });
        state.push(stored);
    }

    fn snapshot(&self) -> Vec<Cookie> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.iter().map(|s| s.cookie.clone()).collect()
    }
}

impl Default for MemoryCookieJar {
    fn default() -> Self {
        Self::new()
    }
}

impl CookieStore for MemoryCookieJar {
    fn store(&self, request_url: &Url, mut cookie: Cookie) {
        let host = match request_url.host_str() {
            Some(h) => h.to_ascii_lowercase(),
            None => return,
        };
        let host_only = cookie.domain.is_none();
        if let Some(domain) = &cookie.domain {
            // Reject an attempt to set a cookie for a foreign domain.
            if !domain_matches(domain, &host, self.options.www_symmetry) {
                return;
            }
        }
        if cookie.path.is_none() {
            cookie.path = Some(default_path(request_url.path()));
        }
        self.insert(StoredCookie {
            cookie,
            host_only,
            origin_host: host,
        });
    }

    fn cookies_for(&self, url: &Url) -> Vec<Cookie> {
        let host = match url.host_str() {
            Some(h) => h.to_ascii_lowercase(),
            None => return Vec::new(),
        };
        let secure_request = url.scheme() == "https" || url.scheme() == "wss";
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .iter()
            .filter(|s| !s.cookie.expired())
            .filter(|s| !s.cookie.secure || secure_request)
            .filter(|s| match (s.host_only, s.cookie.domain.as_deref()) {
                (true, _) | (_, None) => {
                    s.origin_host == host
                        || (self.options.www_symmetry
                            && strip_www(&s.origin_host) == strip_www(&host))
                }
                (false, Some(domain)) => domain_matches(domain, &host, self.options.www_symmetry),
            })
            .filter(|s| {
                path_matches(s.cookie.path.as_deref().unwrap_or("/"), url.path())
            })
            .map(|s| s.cookie.clone())
            .collect()
    }
}

/// A file-backed cookie jar: UTF-8 text, one `Set-Cookie`-style line per
/// cookie, updates rewritten through a temp file and rename. Creation is
/// idempotent; a missing file is an empty jar.
pub struct FileCookieJar {
    path: PathBuf,
    jar: MemoryCookieJar,
    write_lock: Mutex<()>,
}

impl FileCookieJar {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_options(path, CookieJarOptions::default())
    }

    pub fn open_with_options(path: &Path, options: CookieJarOptions) -> Result<Self> {
        let jar = MemoryCookieJar::with_options(options);
        match fs::read_to_string(path) {
            Ok(contents) => {
                let mut state = jar.state.lock().unwrap_or_else(|e| e.into_inner());
                for line in contents.lines() {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match Cookie::parse_set_cookie(line) {
                        Ok(cookie) => {
                            let origin_host =
                                cookie.domain.clone().unwrap_or_default();
                            state.push(StoredCookie {
                                host_only: cookie.domain.is_none(),
                                origin_host,
                                cookie,
                            });
                        }
                        Err(e) => log::warn!(
                            "ignoring malformed cookie line in {}: {e}",
                            path.display()
                        ),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(Self {
            path: path.to_path_buf(),
            jar,
            write_lock: Mutex::new(()),
        })
    }

    /// Serializes the whole jar into a temp file next to the target and
    /// renames it into place.
    fn persist(&self) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let cookies = self.jar.snapshot();
        let tmp_path = self.path.with_extension("tmp");
        {
            let mut tmp = fs::File::create(&tmp_path)?;
            for cookie in &cookies {
                writeln!(tmp, "{}", cookie.to_set_cookie_string())?;
            }
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

impl CookieStore for FileCookieJar {
    fn store(&self, request_url: &Url, mut cookie: Cookie) {
        // Persisted cookies need an explicit domain to survive reload.
        if cookie.domain.is_none() {
            if let Some(host) = request_url.host_str() {
                cookie.domain = Some(host.to_ascii_lowercase());
            }
        }
        self.jar.store(request_url, cookie);
        if let Err(e) = self.persist() {
            log::error!("failed to persist cookie jar {}: {e}", self.path.display());
        }
    }

    fn cookies_for(&self, url: &Url) -> Vec<Cookie> {
        self.jar.cookies_for(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn parse_and_serialize_roundtrip() {
        let c = Cookie::parse_set_cookie(
            "sid=abc123; Domain=example.com; Path=/app; Secure; HttpOnly",
        )
        .unwrap();
        assert_eq!(c.name, "sid");
        assert_eq!(c.value, "abc123");
        assert_eq!(c.domain.as_deref(), Some("example.com"));
        assert_eq!(c.path.as_deref(), Some("/app"));
        assert!(c.secure);
        assert!(c.http_only);
        let s = c.to_set_cookie_string();
        assert_eq!(Cookie::parse_set_cookie(&s).unwrap().name, "sid");
    }

    #[test]
    fn domain_cookie_matches_subdomains_and_www() {
        let jar = MemoryCookieJar::new();
        let c = Cookie::new("a", "1").with_domain("example.com");
        jar.store(&url("https://example.com/"), c);

        assert_eq!(jar.cookies_for(&url("https://example.com/")).len(), 1);
        assert_eq!(jar.cookies_for(&url("https://www.example.com/")).len(), 1);
        assert_eq!(jar.cookies_for(&url("https://sub.example.com/")).len(), 1);
        assert_eq!(jar.cookies_for(&url("https://other.com/")).len(), 0);
    }

    #[test]
    fn www_symmetry_can_be_disabled() {
        let jar = MemoryCookieJar::with_options(CookieJarOptions {
            www_symmetry: false,
        });
        jar.store(
            &url("https://www.example.com/"),
            Cookie::new("a", "1").with_domain("www.example.com"),
        );
        assert_eq!(jar.cookies_for(&url("https://example.com/")).len(), 0);
        assert_eq!(jar.cookies_for(&url("https://www.example.com/")).len(), 1);
    }

    #[test]
    fn host_only_cookie_does_not_travel() {
        let jar = MemoryCookieJar::new();
        jar.store(&url("https://a.example.com/"), Cookie::new("a", "1"));
        assert_eq!(jar.cookies_for(&url("https://a.example.com/")).len(), 1);
        assert_eq!(jar.cookies_for(&url("https://b.example.com/")).len(), 0);
    }

    #[test]
    fn secure_cookie_needs_tls() {
        let jar = MemoryCookieJar::new();
        jar.store(
            &url("https://example.com/"),
            Cookie::new("s", "1").with_secure(true),
        );
        assert_eq!(jar.cookies_for(&url("https://example.com/")).len(), 1);
        assert_eq!(jar.cookies_for(&url("http://example.com/")).len(), 0);
    }

    #[test]
    fn path_matching_respects_boundaries() {
        let jar = MemoryCookieJar::new();
        jar.store(
            &url("https://example.com/app/page"),
            Cookie::new("p", "1").with_path("/app"),
        );
        assert_eq!(jar.cookies_for(&url("https://example.com/app")).len(), 1);
        assert_eq!(jar.cookies_for(&url("https://example.com/app/x")).len(), 1);
        assert_eq!(jar.cookies_for(&url("https://example.com/apple")).len(), 0);
    }

    #[test]
    fn expired_cookies_filtered_at_read() {
        let jar = MemoryCookieJar::new();
        let mut c = Cookie::new("gone", "1");
        c.max_age = Some(0);
        jar.store(&url("https://example.com/"), c);
        assert_eq!(jar.cookies_for(&url("https://example.com/")).len(), 0);
    }

    #[test]
    fn file_jar_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookies.txt");
        {
            let jar = FileCookieJar::open(&path).unwrap();
            jar.store(
                &url("https://example.com/"),
                Cookie::new("persist", "yes"),
            );
        }
        let reloaded = FileCookieJar::open(&path).unwrap();
        let got = reloaded.cookies_for(&url("https://example.com/"));
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].name, "persist");
        assert_eq!(got[0].value, "yes");
    }

    #[test]
    fn file_jar_updates_replace_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookies.txt");
        let jar = FileCookieJar::open(&path).unwrap();
        jar.store(&url("https://example.com/"), Cookie::new("k", "v1"));
        jar.store(&url("https://example.com/"), Cookie::new("k", "v2"));
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.matches("k=").count(), 1);
        assert!(contents.contains("k=v2"));
    }
}
