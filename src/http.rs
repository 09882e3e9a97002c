//! HTTP/1.x protocol engine: server, router, client, cookies, multipart
//! bodies and WebSocket upgrades.

pub mod client;
pub mod common;
pub mod cookie;
pub mod log;
pub mod mime;
pub mod multipart;
pub mod router;
pub mod server;
pub mod websocket;

pub use client::{HttpClient, HttpClientResponse, HttpClientSettings};
pub use common::{status_phrase, HeaderMap, HttpVersion, Method};
pub use cookie::{Cookie, CookieJarOptions, CookieStore, FileCookieJar, MemoryCookieJar};
pub use router::Router;
pub use server::{
    BindAddress, HttpListener, HttpServer, HttpServerOptions, HttpServerRequest,
    HttpServerResponse, HttpServerSettings,
};
pub use websocket::WebSocket;
