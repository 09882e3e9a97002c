//! WebSocket upgrade and frame exchange over a real loopback connection.

use std::time::Duration;

use weft::http::websocket::{self, Message};
use weft::http::{HttpServer, HttpServerSettings};
use weft::net::TcpConnection;
use weft::runtime::Runtime;
use weft::stream::{BufferedReader, ConnectionStream, OutputStream};

fn test_settings() -> HttpServerSettings {
    HttpServerSettings {
        port: 0,
        ..HttpServerSettings::default()
    }
}

#[test]
fn websocket_echo_and_clean_close() {
    let rt = Runtime::new().unwrap();
    let rt2 = rt.clone();
    rt.run(move || {
        let server = HttpServer::new(test_settings(), |req, res| {
            websocket::handle_web_socket(req, res, |ws| {
                let first = ws.receive_text()?;
                assert_eq!(first, "foo");
                ws.send_text("hello")?;
                let second = ws.receive_text()?;
                assert_eq!(second, "bar");
                ws.close(1000, "done")?;
                // Wait for the peer's close echo.
                match ws.receive() {
                    Ok(Message::Close { .. }) | Err(_) => {}
                    other => panic!("expected close echo, got {other:?}"),
                }
                Ok(())
            })
        });
        let listener = server.listen(&rt2).unwrap();
        let port = listener.bound_addresses()[0].port();

        let conn = TcpConnection::connect("127.0.0.1", port, Duration::from_secs(5)).unwrap();
        let writer = conn.clone();
        let mut reader = BufferedReader::new(conn);
        let mut writer_box: Box<dyn weft::stream::OutputStream + Send> = Box::new(writer);
        websocket::client_handshake(&mut reader, &mut writer_box, "127.0.0.1", "/ws").unwrap();

        let mut ws = websocket::client_socket(&mut reader, writer_box);
        ws.send_text("foo").unwrap();
        assert_eq!(ws.receive_text().unwrap(), "hello");
        ws.send_text("bar").unwrap();
        match ws.receive().unwrap() {
            Message::Close { code, reason } => {
                assert_eq!(code, Some(1000));
                assert_eq!(reason, "done");
            }
            other => panic!("expected clean close, got {other:?}"),
        }
        assert!(!ws.connected());
    })
    .unwrap();
}

#[test]
fn upgrade_validates_version() {
    let rt = Runtime::new().unwrap();
    let rt2 = rt.clone();
    rt.run(move || {
        let server = HttpServer::new(test_settings(), |req, res| {
            websocket::handle_web_socket(req, res, |_ws| Ok(()))
        });
        let listener = server.listen(&rt2).unwrap();
        let port = listener.bound_addresses()[0].port();

        let mut conn = TcpConnection::connect("127.0.0.1", port, Duration::from_secs(5)).unwrap();
        conn.write_all(
            b"GET / HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
              Sec-WebSocket-Key: abc\r\nSec-WebSocket-Version: 8\r\n\r\n",
        )
        .unwrap();
        let mut reader = BufferedReader::new(conn.clone());
        let status = reader.read_line(1024).unwrap();
        assert!(status.contains("426"), "got: {status}");
        let _ = conn.close();
    })
    .unwrap();
}
