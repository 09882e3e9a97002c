//! End-to-end HTTP exchanges over loopback TCP: a server and a client
//! running as fibers of the same runtime.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use weft::error::Error;
use weft::http::{
    HttpClient, HttpClientSettings, HttpServer, HttpServerSettings, MemoryCookieJar, Method,
    Router,
};
use weft::net::TcpConnection;
use weft::runtime::Runtime;
use weft::stream::{InputStream, IoMode, OutputStream};

fn test_settings() -> HttpServerSettings {
    HttpServerSettings {
        port: 0,
        ..HttpServerSettings::default()
    }
}

fn client() -> HttpClient {
    HttpClient::new(HttpClientSettings::default())
}

/// Sends raw bytes and collects everything until the server closes.
fn raw_exchange(port: u16, request: &[u8]) -> Vec<u8> {
    let mut conn = TcpConnection::connect("127.0.0.1", port, Duration::from_secs(5)).unwrap();
    conn.write_all(request).unwrap();
    let mut response = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match conn.read(&mut buf, IoMode::Once) {
            Ok(0) => break,
            Ok(n) => response.extend_from_slice(&buf[..n]),
            Err(_) => break,
        }
    }
    response
}

#[test]
fn static_get_has_content_length() {
    let rt = Runtime::new().unwrap();
    let rt2 = rt.clone();
    rt.run(move || {
        let server = HttpServer::new(test_settings(), |_req, res| {
            res.write_body(b"Hello", Some("text/plain"))
        });
        let listener = server.listen(&rt2).unwrap();
        let port = listener.bound_addresses()[0].port();

        let mut resp = client().get(&format!("http://127.0.0.1:{port}/")).unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.headers.get("content-length"), Some("5"));
        assert_eq!(resp.headers.get("content-type"), Some("text/plain"));
        assert_eq!(resp.read_body(1024).unwrap(), b"Hello");
    })
    .unwrap();
}

#[test]
fn missing_host_on_http11_yields_400_and_close() {
    let rt = Runtime::new().unwrap();
    let rt2 = rt.clone();
    rt.run(move || {
        let server = HttpServer::new(test_settings(), |_req, res| {
            res.write_body(b"unreachable", None)
        });
        let listener = server.listen(&rt2).unwrap();
        let port = listener.bound_addresses()[0].port();

        let response = raw_exchange(port, b"GET / HTTP/1.1\r\n\r\n");
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 400"), "got: {text}");
        assert!(text.contains("Missing Host header."), "got: {text}");
    })
    .unwrap();
}

#[test]
fn chunked_echo_roundtrip() {
    let rt = Runtime::new().unwrap();
    let rt2 = rt.clone();
    rt.run(move || {
        let server = HttpServer::new(test_settings(), |req, res| {
            let mut buf = [0u8; 4096];
            loop {
                let n = req.body().read(&mut buf, IoMode::Once)?;
                if n == 0 {
                    break;
                }
                res.write(&buf[..n])?;
            }
            Ok(())
        });
        let listener = server.listen(&rt2).unwrap();
        let port = listener.bound_addresses()[0].port();

        let payload = vec![b'A'; 20_000];
        let body = weft::stream::MemoryStream::from_vec(payload.clone());
        let mut resp = client()
            .request(Method::Post, &format!("http://127.0.0.1:{port}/echo"), |req| {
                req.body_stream(Box::new(body), None);
                Ok(())
            })
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.headers.get("transfer-encoding"), Some("chunked"));
        assert_eq!(resp.read_body(1 << 20).unwrap(), payload);
    })
    .unwrap();
}

#[test]
fn router_params_and_first_match() {
    let rt = Runtime::new().unwrap();
    let rt2 = rt.clone();
    rt.run(move || {
        let mut router = Router::new();
        router.get("/tag/:tag", |req, res| {
            let tag = req.param("tag").unwrap_or_default().to_string();
            res.write_body(tag.as_bytes(), Some("text/plain"))
        });
        router.get("/shadow", |_req, res| res.write_body(b"first", None));
        router.get("/shadow", |_req, res| res.write_body(b"second", None));
        let server = HttpServer::new(test_settings(), move |req, res| router.handle(req, res));
        let listener = server.listen(&rt2).unwrap();
        let port = listener.bound_addresses()[0].port();

        let c = client();
        let mut resp = c
            .get(&format!("http://127.0.0.1:{port}/tag/foo%2Fbar"))
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.read_body(1024).unwrap(), b"foo/bar");

        // A real slash is a segment boundary: no route matches.
        let resp = c
            .get(&format!("http://127.0.0.1:{port}/tag/foo/bar"))
            .unwrap();
        assert_eq!(resp.status, 404);

        // Registration order wins for identical patterns.
        let mut resp = c.get(&format!("http://127.0.0.1:{port}/shadow")).unwrap();
        assert_eq!(resp.read_body(1024).unwrap(), b"first");
    })
    .unwrap();
}

#[test]
fn keep_alive_reuses_the_connection() {
    let rt = Runtime::new().unwrap();
    let rt2 = rt.clone();
    rt.run(move || {
        let server = HttpServer::new(test_settings(), |req, res| {
            let port = req.peer_address.map(|a| a.port()).unwrap_or(0);
            res.write_body(port.to_string().as_bytes(), Some("text/plain"))
        });
        let listener = server.listen(&rt2).unwrap();
        let port = listener.bound_addresses()[0].port();

        let c = client();
        let url = format!("http://127.0.0.1:{port}/");
        let first = c.get(&url).unwrap().read_body(64).unwrap();
        let second = c.get(&url).unwrap().read_body(64).unwrap();
        // Same client source port on both exchanges: the connection was
        // kept alive and reused with independent request state.
        assert_eq!(first, second);
    })
    .unwrap();
}

#[test]
fn header_case_preserved_and_duplicates_ordered() {
    let rt = Runtime::new().unwrap();
    let rt2 = rt.clone();
    rt.run(move || {
        let server = HttpServer::new(test_settings(), |req, res| {
            // Input casing is irrelevant for lookups.
            assert_eq!(req.headers.get("x-custom-header"), Some("one"));
            let all: Vec<String> = req
                .headers
                .get_all("x-custom-header")
                .map(str::to_string)
                .collect();
            assert_eq!(all, ["one", "two"]);
            res.add_header("X-MiXeD-CaSe", "kept")?;
            res.write_body(b"ok", None)
        });
        let listener = server.listen(&rt2).unwrap();
        let port = listener.bound_addresses()[0].port();

        let response = raw_exchange(
            port,
            b"GET / HTTP/1.1\r\nHost: x\r\nX-CUSTOM-HEADER: one\r\nx-custom-header: two\r\nConnection: close\r\n\r\n",
        );
        let text = String::from_utf8_lossy(&response);
        // The exact spelling used by the handler goes out on the wire.
        assert!(text.contains("X-MiXeD-CaSe: kept"), "got: {text}");
    })
    .unwrap();
}

#[test]
fn unwritten_response_becomes_404() {
    let rt = Runtime::new().unwrap();
    let rt2 = rt.clone();
    rt.run(move || {
        let server = HttpServer::new(test_settings(), |_req, _res| Ok(()));
        let listener = server.listen(&rt2).unwrap();
        let port = listener.bound_addresses()[0].port();
        let resp = client().get(&format!("http://127.0.0.1:{port}/nope")).unwrap();
        assert_eq!(resp.status, 404);
    })
    .unwrap();
}

#[test]
fn status_error_is_rendered_when_headers_mutable() {
    let rt = Runtime::new().unwrap();
    let rt2 = rt.clone();
    rt.run(move || {
        let server = HttpServer::new(test_settings(), |_req, _res| {
            Err(Error::status(418, "shortage of coffee"))
        });
        let listener = server.listen(&rt2).unwrap();
        let port = listener.bound_addresses()[0].port();
        let mut resp = client().get(&format!("http://127.0.0.1:{port}/")).unwrap();
        assert_eq!(resp.status, 418);
        let body = String::from_utf8(resp.read_body(4096).unwrap()).unwrap();
        assert!(body.contains("shortage of coffee"));
    })
    .unwrap();
}

#[test]
fn redirects_are_followed() {
    let rt = Runtime::new().unwrap();
    let rt2 = rt.clone();
    rt.run(move || {
        let mut router = Router::new();
        router.get("/old", |_req, res| res.redirect("/new", 302));
        router.get("/new", |_req, res| res.write_body(b"arrived", None));
        let server = HttpServer::new(test_settings(), move |req, res| router.handle(req, res));
        let listener = server.listen(&rt2).unwrap();
        let port = listener.bound_addresses()[0].port();

        let mut resp = client().get(&format!("http://127.0.0.1:{port}/old")).unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.read_body(1024).unwrap(), b"arrived");
    })
    .unwrap();
}

#[test]
fn cookie_jar_roundtrip() {
    let rt = Runtime::new().unwrap();
    let rt2 = rt.clone();
    rt.run(move || {
        let hits = Arc::new(AtomicU32::new(0));
        let hits2 = Arc::clone(&hits);
        let server = HttpServer::new(test_settings(), move |req, res| {
            if hits2.fetch_add(1, Ordering::SeqCst) == 0 {
                res.set_cookie(weft::http::Cookie::new("sid", "s3cr3t"))?;
                res.write_body(b"set", None)
            } else {
                assert_eq!(req.cookie("sid"), Some("s3cr3t"));
                res.write_body(b"have", None)
            }
        });
        let listener = server.listen(&rt2).unwrap();
        let port = listener.bound_addresses()[0].port();

        let c = HttpClient::new(HttpClientSettings {
            cookie_jar: Some(Arc::new(MemoryCookieJar::new())),
            ..HttpClientSettings::default()
        });
        let url = format!("http://127.0.0.1:{port}/");
        assert_eq!(c.get(&url).unwrap().read_body(64).unwrap(), b"set");
        assert_eq!(c.get(&url).unwrap().read_body(64).unwrap(), b"have");
    })
    .unwrap();
}

#[test]
fn oversized_headers_yield_431() {
    let rt = Runtime::new().unwrap();
    let rt2 = rt.clone();
    rt.run(move || {
        let settings = HttpServerSettings {
            max_request_header_size: 256,
            ..test_settings()
        };
        let server = HttpServer::new(settings, |_req, res| res.write_body(b"ok", None));
        let listener = server.listen(&rt2).unwrap();
        let port = listener.bound_addresses()[0].port();

        let mut request = b"GET / HTTP/1.1\r\nHost: x\r\n".to_vec();
        request.extend_from_slice(format!("X-Big: {}\r\n\r\n", "v".repeat(1024)).as_bytes());
        let response = raw_exchange(port, &request);
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 431"), "got: {text}");
    })
    .unwrap();
}

#[test]
fn head_requests_have_headers_but_no_body() {
    let rt = Runtime::new().unwrap();
    let rt2 = rt.clone();
    rt.run(move || {
        let server = HttpServer::new(test_settings(), |_req, res| {
            res.write_body(b"payload", Some("text/plain"))
        });
        let listener = server.listen(&rt2).unwrap();
        let port = listener.bound_addresses()[0].port();

        let response = raw_exchange(
            port,
            b"HEAD / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
        );
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 200"), "got: {text}");
        assert!(text.contains("Content-Length: 7"), "got: {text}");
        assert!(text.ends_with("\r\n\r\n"), "unexpected body: {text}");
    })
    .unwrap();
}

#[test]
fn form_body_is_parsed_into_attributes() {
    let rt = Runtime::new().unwrap();
    let rt2 = rt.clone();
    rt.run(move || {
        let seen = Arc::new(Mutex::new(None));
        let seen2 = Arc::clone(&seen);
        let server = HttpServer::new(test_settings(), move |req, res| {
            *seen2.lock().unwrap() = req.form.get("name").cloned();
            res.write_body(b"ok", None)
        });
        let listener = server.listen(&rt2).unwrap();
        let port = listener.bound_addresses()[0].port();

        client()
            .post(
                &format!("http://127.0.0.1:{port}/submit"),
                b"name=fiber%20runtime&x=1",
                "application/x-www-form-urlencoded",
            )
            .unwrap();
        assert_eq!(seen.lock().unwrap().as_deref(), Some("fiber runtime"));
    })
    .unwrap();
}

#[test]
fn http10_without_content_length_closes_connection() {
    let rt = Runtime::new().unwrap();
    let rt2 = rt.clone();
    rt.run(move || {
        let server = HttpServer::new(test_settings(), |_req, res| {
            // Commit without Content-Length: 1.0 must fall back to
            // connection-close framing.
            res.write(b"legacy body")?;
            Ok(())
        });
        let listener = server.listen(&rt2).unwrap();
        let port = listener.bound_addresses()[0].port();

        let response = raw_exchange(port, b"GET / HTTP/1.0\r\n\r\n");
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.0 200"), "got: {text}");
        assert!(text.contains("Connection: close"), "got: {text}");
        assert!(text.ends_with("legacy body"), "got: {text}");
    })
    .unwrap();
}

#[test]
fn reject_predicate_yields_403() {
    let rt = Runtime::new().unwrap();
    let rt2 = rt.clone();
    rt.run(move || {
        let settings = HttpServerSettings {
            reject_connection_predicate: Some(Arc::new(|_addr| true)),
            ..test_settings()
        };
        let server = HttpServer::new(settings, |_req, res| res.write_body(b"in", None));
        let listener = server.listen(&rt2).unwrap();
        let port = listener.bound_addresses()[0].port();
        let response = raw_exchange(port, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 403"), "got: {text}");
    })
    .unwrap();
}
