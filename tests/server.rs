//! Server behaviour over real sockets: routing, phases, pausing, listeners.

mod common;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::http::{HeaderValue, StatusCode};
use axum_server::tls_rustls::RustlsConfig;
use soup_server::net::BindError;
use soup_server::{ListenOptions, Server};

use common::{addr_of, client, listen, raw_request, request, status_of};

fn index_handler(server: &Server, path: Option<&str>, name: &'static str) {
    server.add_handler(path, move |msg, _ctx| {
        msg.append_response_header("x-handled-by", HeaderValue::from_static(name));
        msg.set_status(StatusCode::OK);
        msg.set_response("text/plain", "index");
    });
}

#[tokio::test]
async fn star_target_only_reaches_star_handler() {
    let server = Server::new();
    index_handler(&server, None, "server_callback");
    let addr = addr_of(&listen(&server));

    let response = raw_request(addr, &request("OPTIONS", "*", addr)).await;
    assert_eq!(status_of(&response), 404);
    assert!(!response.to_ascii_lowercase().contains("x-handled-by"));

    index_handler(&server, Some("*"), "star_callback");
    let response = raw_request(addr, &request("OPTIONS", "*", addr)).await;
    assert_eq!(status_of(&response), 200);
    assert!(response.contains("star_callback"));

    let response = raw_request(addr, &request("GET", "/", addr)).await;
    assert!(response.contains("server_callback"));
}

#[tokio::test]
async fn encoded_parent_segments_are_bad_requests() {
    let server = Server::new();
    let called = Arc::new(AtomicBool::new(false));
    let seen = Arc::clone(&called);
    server.add_handler(None, move |msg, _ctx| {
        seen.store(true, Ordering::SeqCst);
        msg.set_status(StatusCode::OK);
    });
    let addr = addr_of(&listen(&server));

    for target in ["/..%2ftest", "/%2e%2e%2ftest", "/a/../b"] {
        let response = raw_request(addr, &request("GET", target, addr)).await;
        assert_eq!(status_of(&response), 400, "{target}");
    }
    assert!(!called.load(Ordering::SeqCst));
}

#[tokio::test]
async fn absolute_targets_need_a_served_scheme() {
    let server = Server::builder().http_aliases(["dav"]).https_aliases(["davs"]).build();
    index_handler(&server, None, "server_callback");
    let addr = addr_of(&listen(&server));

    for (scheme, expected) in [("http", 200), ("dav", 200), ("https", 400), ("davs", 400), ("fred", 400)] {
        let target = format!("{scheme}://{addr}");
        let response = raw_request(addr, &request("GET", &target, addr)).await;
        assert_eq!(status_of(&response), expected, "{scheme}");
    }
}

#[tokio::test]
async fn unmatched_path_is_not_found() {
    let server = Server::new();
    let called = Arc::new(AtomicBool::new(false));
    let seen = Arc::clone(&called);
    server.add_handler(Some("/not-a-match"), move |_msg, _ctx| seen.store(true, Ordering::SeqCst));
    let uri = listen(&server);

    let response = client().get(uri).send().await.unwrap();
    assert_eq!(response.status(), 404);
    assert!(!called.load(Ordering::SeqCst));
}

#[tokio::test]
async fn handler_without_status_is_server_error() {
    let server = Server::new();
    server.add_handler(None, |_msg, _ctx| {});
    let uri = listen(&server);

    let response = client().get(uri).send().await.unwrap();
    assert_eq!(response.status(), 500);
}

#[tokio::test]
async fn paused_handler_without_status_is_server_error() {
    let server = Server::new();
    let paused = Arc::new(AtomicBool::new(false));
    let seen = Arc::clone(&paused);
    server.add_handler(None, move |msg, _ctx| {
        msg.pause();
        seen.store(true, Ordering::SeqCst);
        let msg = msg.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            msg.unpause();
        });
    });
    let uri = listen(&server);

    let response = client().get(uri).send().await.unwrap();
    assert_eq!(response.status(), 500);
    assert!(paused.load(Ordering::SeqCst));
}

#[tokio::test]
async fn nested_pauses_need_matching_unpauses() {
    let server = Server::new();
    server.add_handler(None, |msg, _ctx| {
        msg.pause();
        msg.pause();
        let msg = msg.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            msg.unpause();
            tokio::time::sleep(Duration::from_millis(10)).await;
            msg.set_status(StatusCode::OK);
            msg.set_response("text/plain", "late");
            msg.unpause();
            // Extra unpauses are ignored.
            msg.unpause();
        });
    });
    let uri = listen(&server);

    let response = client().get(uri).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "late");
}

#[tokio::test]
async fn panicking_handler_is_server_error() {
    let server = Server::new();
    server.add_handler(Some("/boom"), |_msg, _ctx| panic!("handler bug"));
    index_handler(&server, Some("/ok"), "server_callback");
    let uri = listen(&server);

    let http = client();
    let response = http.get(uri.join("/boom").unwrap()).send().await.unwrap();
    assert_eq!(response.status(), 500);
    let response = http.get(uri.join("/ok").unwrap()).send().await.unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn early_handler_can_answer() {
    let server = Server::new();
    server.add_early_handler(None, |msg, _ctx| {
        if msg.path() == "/" {
            msg.set_status(StatusCode::FORBIDDEN);
        }
    });
    index_handler(&server, None, "server_callback");
    let uri = listen(&server);
    let http = client();

    let response = http.get(uri.clone()).send().await.unwrap();
    assert_eq!(response.status(), 403);
    assert!(response.headers().get("x-handled-by").is_none());
    assert!(response.text().await.unwrap().is_empty());

    let response = http.get(uri.join("/subdir").unwrap()).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "index");
}

#[tokio::test]
async fn longest_entry_decides_both_phases() {
    let server = Server::new();
    let early = |msg: &soup_server::ServerMessage, _ctx: &soup_server::ClientContext| {
        msg.append_response_header("x-early", HeaderValue::from_static("yes"));
    };
    index_handler(&server, Some("/normal"), "normal");
    server.add_early_handler(Some("/normal/early"), early);
    server.add_early_handler(Some("/early"), early);
    index_handler(&server, Some("/early/normal"), "normal");
    index_handler(&server, Some("/both"), "normal");
    server.add_early_handler(Some("/both"), early);
    let uri = listen(&server);
    let http = client();

    let table = [
        ("/", false, false),
        ("/normal", true, false),
        ("/normal/subdir", true, false),
        ("/normal/early", false, true),
        ("/normal/early/subdir", false, true),
        ("/early", false, true),
        ("/early/subdir", false, true),
        ("/early/normal", true, false),
        ("/early/normal/subdir", true, false),
        ("/both", true, true),
        ("/both/subdir", true, true),
    ];

    for (path, expect_normal, expect_early) in table {
        let response = http.get(uri.join(path).unwrap()).send().await.unwrap();
        let status = response.status();
        if expect_normal {
            assert_eq!(status, 200, "{path}");
        } else if expect_early {
            assert_eq!(status, 500, "{path}");
        } else {
            assert_eq!(status, 404, "{path}");
        }
        assert_eq!(response.headers().get("x-early").is_some(), expect_early, "{path}");
        let body = response.text().await.unwrap();
        if expect_normal {
            assert_eq!(body, "index", "{path}");
        } else {
            assert!(body.is_empty(), "{path}");
        }
    }
}

fn fnv1a(hash: u64, bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(hash, |h, b| (h ^ u64::from(*b)).wrapping_mul(0x0000_0100_0000_01b3))
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;

#[tokio::test]
async fn early_handler_streams_body_through_observers() {
    let server = Server::new();
    server.add_early_handler(None, |msg, _ctx| {
        if msg.method() != axum::http::Method::POST {
            msg.set_status(StatusCode::METHOD_NOT_ALLOWED);
            return;
        }
        let digest = Arc::new(AtomicU64::new(FNV_OFFSET));
        let chunks = Arc::clone(&digest);
        msg.set_body_accumulate(false);
        msg.on_body_chunk(move |chunk| {
            let current = chunks.load(Ordering::SeqCst);
            chunks.store(fnv1a(current, chunk), Ordering::SeqCst);
        });
        msg.on_body_complete(move |msg| {
            assert!(msg.request_body().is_empty());
            msg.set_status(StatusCode::OK);
            msg.set_response("text/plain", format!("{:016x}", digest.load(Ordering::SeqCst)));
        });
    });
    let uri = listen(&server);

    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let expected = format!("{:016x}", fnv1a(FNV_OFFSET, &payload));

    let http = client();
    let response = http.post(uri.clone()).body(payload).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), expected);

    let response = http.get(uri).send().await.unwrap();
    assert_eq!(response.status(), 405);
}

#[tokio::test]
async fn panicking_body_observers_are_server_errors() {
    let server = Server::new();
    let completed = Arc::new(AtomicBool::new(false));
    let seen = Arc::clone(&completed);
    server.add_early_handler(Some("/chunk"), move |msg, _ctx| {
        let seen = Arc::clone(&seen);
        msg.on_body_chunk(|_chunk| panic!("chunk observer bug"));
        msg.on_body_complete(move |_msg| seen.store(true, Ordering::SeqCst));
    });
    server.add_early_handler(Some("/complete"), |msg, _ctx| {
        msg.on_body_complete(|_msg| panic!("completion observer bug"));
    });
    let normal_ran = Arc::new(AtomicBool::new(false));
    let ran = Arc::clone(&normal_ran);
    server.add_handler(None, move |msg, _ctx| {
        ran.store(true, Ordering::SeqCst);
        msg.set_status(StatusCode::OK);
    });
    let addr = addr_of(&listen(&server));

    for path in ["/chunk", "/complete"] {
        let post = format!(
            "POST {path} HTTP/1.1\r\nHost: {addr}\r\nContent-Length: 3\r\nConnection: close\r\n\r\nabc"
        );
        let response = raw_request(addr, &post).await;
        assert_eq!(status_of(&response), 500, "{path}");
    }
    assert!(!completed.load(Ordering::SeqCst));
    assert!(!normal_ran.load(Ordering::SeqCst));

    let response = raw_request(addr, &request("GET", "/", addr)).await;
    assert_eq!(status_of(&response), 200);
}

#[tokio::test]
async fn oversized_body_is_rejected() {
    let server = Server::builder().max_body_size(16).build();
    let called = Arc::new(AtomicBool::new(false));
    let seen = Arc::clone(&called);
    server.add_handler(None, move |msg, _ctx| {
        seen.store(true, Ordering::SeqCst);
        msg.set_status(StatusCode::OK);
    });
    let uri = listen(&server);

    let response = client().post(uri).body(vec![b'x'; 100]).send().await.unwrap();
    assert_eq!(response.status(), 413);
    assert!(!called.load(Ordering::SeqCst));
}

#[tokio::test]
async fn normal_handler_sees_buffered_body_and_query() {
    let server = Server::new();
    server.add_handler(Some("/echo"), |msg, ctx| {
        let name = msg.query().get("name").cloned().unwrap_or_default();
        let body = String::from_utf8_lossy(&msg.request_body()).into_owned();
        msg.set_status(StatusCode::OK);
        msg.append_response_header("x-remote", HeaderValue::from_str(&ctx.host()).unwrap());
        msg.set_response("text/plain", format!("{name}:{body}"));
    });
    let uri = listen(&server);

    let response = client()
        .post(uri.join("/echo?name=soup").unwrap())
        .body("payload")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["x-remote"], "127.0.0.1");
    assert_eq!(response.text().await.unwrap(), "soup:payload");
}

#[tokio::test]
async fn removed_handler_stops_matching() {
    let server = Server::new();
    index_handler(&server, Some("/gone"), "server_callback");
    let uri = listen(&server);
    let http = client();

    let response = http.get(uri.join("/gone").unwrap()).send().await.unwrap();
    assert_eq!(response.status(), 200);

    assert!(server.remove_handler(Some("/gone")));
    let response = http.get(uri.join("/gone").unwrap()).send().await.unwrap();
    assert_eq!(response.status(), 404);
}

fn url_echo(server: &Server) {
    server.add_handler(None, |msg, _ctx| {
        let url = msg.url().map(|u| u.to_string()).unwrap_or_default();
        msg.set_status(StatusCode::OK);
        msg.set_response("text/plain", url);
    });
}

#[tokio::test]
async fn separate_ipv4_listeners_get_distinct_ports() {
    let server = Server::new();
    url_echo(&server);
    let first = listen(&server);
    let second = listen(&server);
    assert_ne!(first.port(), second.port());
    assert_eq!(server.uris(), vec![first.clone(), second.clone()]);

    let http = client();
    for uri in [first, second] {
        let body = http.get(uri.clone()).send().await.unwrap().text().await.unwrap();
        assert_eq!(body, uri.as_str());
    }
}

#[tokio::test]
async fn dual_family_local_listen_shares_a_port() {
    if !common::ipv6_available() {
        eprintln!("skipping: no IPv6 loopback");
        return;
    }
    let server = Server::new();
    url_echo(&server);
    let listeners = server.listen_local(0, ListenOptions::new()).unwrap();
    assert_eq!(listeners.len(), 2);
    assert!(listeners[0].local_addr().is_ipv4());
    assert!(listeners[1].local_addr().is_ipv6());
    assert_eq!(listeners[0].port(), listeners[1].port());

    let http = client();
    for info in &listeners {
        let uri = info.uri();
        let response = http.get(uri.clone()).send().await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.text().await.unwrap(), uri.as_str());
    }
    assert_eq!(listeners[1].uri().host_str(), Some("[::1]"));
}

#[tokio::test]
async fn ipv6_only_listener_reports_ipv6_peer() {
    if !common::ipv6_available() {
        assert!(matches!(
            Server::new().listen_local(0, ListenOptions::ipv6_only()),
            Err(BindError::Unsupported(_))
        ));
        return;
    }
    let server = Server::new();
    server.add_handler(None, |msg, ctx| {
        msg.set_status(StatusCode::OK);
        msg.set_response("text/plain", ctx.host());
    });
    let listeners = server.listen_local(0, ListenOptions::ipv6_only()).unwrap();
    assert_eq!(listeners.len(), 1);

    let response = client().get(listeners[0].uri()).send().await.unwrap();
    assert_eq!(response.text().await.unwrap(), "::1");
}

#[tokio::test]
async fn imported_socket_is_closed_on_shutdown() {
    let server = Server::new();
    index_handler(&server, None, "server_callback");
    let socket = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let info = server.import_socket(socket, ListenOptions::new()).unwrap();
    assert!(info.is_imported());
    let addr = info.local_addr();

    let response = raw_request(addr, &request("GET", "/", addr)).await;
    assert_eq!(status_of(&response), 200);

    server.shutdown().await;
    assert!(server.listeners().is_empty());
    assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    assert!(matches!(
        server.listen("127.0.0.1:0".parse().unwrap(), ListenOptions::new()),
        Err(BindError::ShuttingDown)
    ));
}

#[cfg(unix)]
#[tokio::test]
async fn imported_descriptor_serves_requests() {
    use std::os::fd::OwnedFd;

    let server = Server::new();
    index_handler(&server, None, "server_callback");
    let socket = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = socket.local_addr().unwrap();
    let info = server.import_descriptor(OwnedFd::from(socket), ListenOptions::new()).unwrap();
    assert_eq!(info.local_addr(), addr);

    let response = raw_request(addr, &request("GET", "/", addr)).await;
    assert_eq!(status_of(&response), 200);

    server.shutdown().await;
    assert!(tokio::net::TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn adopted_stream_is_served_without_socket() {
    let server = Server::new();
    server.add_handler(None, |msg, ctx| {
        let has_socket = if ctx.socket().is_some() { "yes" } else { "no" };
        msg.append_response_header("x-has-socket", HeaderValue::from_static(has_socket));
        msg.set_status(StatusCode::OK);
        msg.set_response("text/plain", "index");
    });

    let (ours, theirs) = tokio::io::duplex(4096);
    let addr = "127.0.0.1:1".parse().unwrap();
    server.accept_stream(theirs, addr, addr).unwrap();

    let response = common::exchange(ours, "GET / HTTP/1.0\r\n\r\n").await;
    assert_eq!(status_of(&response), 200);
    assert!(response.starts_with("HTTP/1."));
    assert!(response.to_ascii_lowercase().contains("x-has-socket: no"));
    assert!(response.ends_with("index"));
}

#[tokio::test]
async fn tcp_connections_expose_their_socket() {
    let server = Server::new();
    let socket = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&socket);
    server.add_handler(None, move |msg, ctx| {
        *seen.lock().unwrap() = ctx.socket();
        msg.set_status(StatusCode::OK);
    });
    let uri = listen(&server);

    client().get(uri).send().await.unwrap();
    assert!(socket.lock().unwrap().is_some());
}

async fn self_signed() -> RustlsConfig {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string(), "127.0.0.1".to_string()]).unwrap();
    RustlsConfig::from_pem(
        certified.cert.pem().into_bytes(),
        certified.key_pair.serialize_pem().into_bytes(),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn tls_listener_requires_certificate() {
    let err = Server::new()
        .listen("127.0.0.1:0".parse().unwrap(), ListenOptions::new().https())
        .unwrap_err();
    assert!(matches!(err, BindError::TlsUnavailable));
}

#[tokio::test]
async fn plain_and_tls_listeners_report_their_scheme() {
    let server = Server::builder().tls(self_signed().await).build();
    url_echo(&server);
    let plain = listen(&server);
    let secure = server
        .listen("127.0.0.1:0".parse().unwrap(), ListenOptions::ipv4_only().https())
        .unwrap()
        .uri();
    assert_eq!(plain.scheme(), "http");
    assert_eq!(secure.scheme(), "https");

    let http = reqwest::Client::builder()
        .no_proxy()
        .danger_accept_invalid_certs(true)
        .build()
        .unwrap();
    for uri in [plain, secure] {
        let body = http.get(uri.clone()).send().await.unwrap().text().await.unwrap();
        assert_eq!(body, uri.as_str());
    }
}

#[tokio::test]
async fn shutdown_lets_in_flight_request_finish() {
    let server = Server::new();
    let arrived = Arc::new(tokio::sync::Notify::new());
    let notify = Arc::clone(&arrived);
    server.add_handler(None, move |msg, _ctx| {
        msg.pause();
        notify.notify_one();
        let msg = msg.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            msg.set_status(StatusCode::OK);
            msg.unpause();
        });
    });
    let uri = listen(&server);

    let request = tokio::spawn(async move { client().get(uri).send().await.map(|r| r.status()) });
    arrived.notified().await;
    server.shutdown().await;

    assert_eq!(request.await.unwrap().unwrap(), 200);
    assert!(server.drain(Duration::from_secs(2)).await);
    assert_eq!(server.active_connections(), 0);
}
