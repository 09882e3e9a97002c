//! weft — a fiber-based cooperative network application framework.
//!
//! The crate contains the following building blocks:
//!
//! - [Runtime](runtime): the explicit owner of the scheduler threads
//! - [Fibers: spawning, joining, interruption, channels, mailboxes,
//!   locks and condition variables](fiber)
//! - [The event reactor clock and deadlines](clock)
//! - [Composable byte streams: buffered, counted, chunked, compressed,
//!   in-memory, task pipes and TLS](stream)
//! - [Cooperative network transports: TCP, UDP, UNIX sockets and the
//!   keyed connection pool](net)
//! - [The HTTP/1.x engine: server, router, client, cookies and
//!   WebSockets](http)
//! - [Error handling](error)
//!
//! Everything runs inside a [`Runtime`]: the root fiber is launched with
//! [`Runtime::run`], and every blocking operation inside suspends the
//! calling fiber on its scheduler instead of blocking the thread.
//!
//! ```no_run
//! use weft::http::{HttpServer, HttpServerSettings};
//! use weft::runtime::Runtime;
//!
//! let rt = Runtime::new().unwrap();
//! rt.run({
//!     let rt = rt.clone();
//!     move || {
//!         let server = HttpServer::new(HttpServerSettings::default(), |_req, res| {
//!             res.write_body(b"Hello", Some("text/plain"))
//!         });
//!         let listener = server.listen(&rt).unwrap();
//!         println!("serving on {:?}", listener.bound_addresses());
//!         weft::fiber::sleep(std::time::Duration::MAX).ok();
//!     }
//! })
//! .unwrap();
//! ```

pub mod clock;
pub mod error;
pub mod fiber;
pub mod http;
pub mod net;
pub(crate) mod reactor;
pub mod runtime;
pub mod stream;

pub use error::{Error, ProtocolError, Result};
pub use runtime::Runtime;
