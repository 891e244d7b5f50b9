//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use soup_server::{ListenOptions, Server};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use url::Url;

/// Upper bound for any single network exchange in tests.
pub const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Bind `server` on an ephemeral IPv4 loopback port and return its base URI.
pub fn listen(server: &Server) -> Url {
    server
        .listen("127.0.0.1:0".parse().unwrap(), ListenOptions::ipv4_only())
        .unwrap()
        .uri()
}

pub fn addr_of(uri: &Url) -> SocketAddr {
    uri.socket_addrs(|| None).unwrap()[0]
}

/// HTTP client that never goes through an environment proxy.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

/// Send `request` verbatim over `stream` and read until the peer closes.
pub async fn exchange<S>(mut stream: S, request: &str) -> String
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(IO_TIMEOUT, stream.read_to_end(&mut response))
        .await
        .expect("response timed out")
        .unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

/// Send a raw request to `addr`. The request should carry `Connection: close`.
pub async fn raw_request(addr: SocketAddr, request: &str) -> String {
    exchange(TcpStream::connect(addr).await.unwrap(), request).await
}

/// `GET`-style request head with `Connection: close`.
pub fn request(method: &str, target: &str, host: SocketAddr) -> String {
    format!("{method} {target} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n")
}

/// Status code of a raw HTTP/1.x response.
pub fn status_of(response: &str) -> u16 {
    response
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or_else(|| panic!("not an HTTP response: {response:?}"))
}

/// Read a response head byte by byte, leaving anything after it unread.
pub async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = tokio::time::timeout(IO_TIMEOUT, stream.read(&mut byte))
            .await
            .expect("response head timed out")
            .unwrap();
        assert_ne!(n, 0, "connection closed inside response head");
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

/// Start a TCP echo server and return its address.
pub async fn start_echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// An address nothing listens on.
pub fn closed_port() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

/// Whether the host can bind IPv6 loopback.
pub fn ipv6_available() -> bool {
    std::net::TcpListener::bind("[::1]:0").is_ok()
}
