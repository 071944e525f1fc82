//! HTTP proxy end-to-end tests
//!
//! Drives the real listener with hand-rolled proxy clients: absolute-form
//! GETs, handler rejections, session ordering, HAR capture, and CONNECT
//! tunneling.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use http::StatusCode;
use midstream::{Proxy, ProxyConfig, ProxyCtx, Rejection, Verdict};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn start_proxy(proxy: Proxy) -> (Arc<Proxy>, std::net::SocketAddr) {
    let proxy = Arc::new(proxy);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(Arc::clone(&proxy).serve_http(listener));
    (proxy, addr)
}

#[tokio::test]
async fn forwards_absolute_form_requests() {
    let upstream =
        common::spawn_http_upstream(b"HTTP/1.1 200 OK\r\nContent-Length: 8\r\n\r\nupstream").await;
    let (_proxy, proxy_addr) = start_proxy(Proxy::new(ProxyConfig::default())).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(
            format!("GET http://{upstream}/hello HTTP/1.1\r\nHost: {upstream}\r\n\r\n").as_bytes(),
        )
        .await
        .unwrap();

    let (status, _headers, body) = common::read_http_response(&mut client).await;
    assert_eq!(status, 200);
    assert_eq!(body, b"upstream");
}

#[tokio::test]
async fn rejections_carry_cache_suppressing_headers() {
    let mut proxy = Proxy::new(ProxyConfig::default());
    proxy.handle_request(|_ctx: &mut ProxyCtx| {
        Verdict::Reject(Rejection::new(
            StatusCode::FORBIDDEN,
            "text/html",
            "<html><body>blocked by policy</body></html>",
        ))
    });
    let (_proxy, proxy_addr) = start_proxy(proxy).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(b"GET http://blocked.example/ HTTP/1.1\r\nHost: blocked.example\r\n\r\n")
        .await
        .unwrap();

    let (status, headers, body) = common::read_http_response(&mut client).await;
    assert_eq!(status, 403);
    assert!(body.starts_with(b"<html>"));

    let get = |name: &str| {
        headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    };
    assert_eq!(get("content-type"), Some("text/html"));
    assert_eq!(get("cache-control"), Some("no-cache, no-store, must-revalidate"));
    assert_eq!(get("pragma"), Some("no-cache"));
    assert_eq!(get("expires"), Some("0"));
}

#[tokio::test]
async fn sessions_increase_across_accepts() {
    let sessions = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&sessions);

    let upstream =
        common::spawn_http_upstream(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await;
    let mut proxy = Proxy::new(ProxyConfig::default());
    proxy.handle_request(move |ctx: &mut ProxyCtx| {
        sink.lock().unwrap().push(ctx.session);
        Verdict::Next
    });
    let (_proxy, proxy_addr) = start_proxy(proxy).await;

    for _ in 0..3 {
        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client
            .write_all(
                format!("GET http://{upstream}/ HTTP/1.1\r\nHost: {upstream}\r\n\r\n").as_bytes(),
            )
            .await
            .unwrap();
        let (status, _, _) = common::read_http_response(&mut client).await;
        assert_eq!(status, 200);
    }

    let seen = sessions.lock().unwrap();
    assert_eq!(seen.len(), 3);
    assert!(seen.windows(2).all(|pair| pair[0] < pair[1]));
}

#[tokio::test]
async fn har_entries_are_emitted_for_logged_contexts() {
    let upstream =
        common::spawn_http_upstream(b"HTTP/1.1 200 OK\r\nContent-Length: 7\r\n\r\nlogged!").await;

    let mut proxy = Proxy::new(ProxyConfig::default());
    proxy.handle_request(|ctx: &mut ProxyCtx| {
        ctx.log_har = true;
        ctx.capture_content = true;
        Verdict::Next
    });
    let (proxy, proxy_addr) = start_proxy(proxy).await;
    let mut har = proxy.take_har_entries().expect("first take yields the receiver");
    assert!(proxy.take_har_entries().is_none(), "receiver is single-take");

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(
            format!("GET http://{upstream}/logged HTTP/1.1\r\nHost: {upstream}\r\n\r\n").as_bytes(),
        )
        .await
        .unwrap();
    let (status, _, _) = common::read_http_response(&mut client).await;
    assert_eq!(status, 200);

    let entry = tokio::time::timeout(Duration::from_secs(2), har.recv())
        .await
        .expect("HAR entry must arrive")
        .expect("channel open");
    assert_eq!(entry.request.uri.path(), "/logged");
    assert!(entry.end >= entry.start);
    let response = entry.response.expect("successful round-trip is captured");
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body.as_ref(), b"logged!");
}

#[tokio::test]
async fn connect_tunnels_raw_bytes() {
    let upstream = common::spawn_echo_upstream().await;
    let (_proxy, proxy_addr) = start_proxy(Proxy::new(ProxyConfig::default())).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(format!("CONNECT {upstream} HTTP/1.1\r\nHost: {upstream}\r\n\r\n").as_bytes())
        .await
        .unwrap();

    // 200 from the proxy, then the stream is raw.
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = client.read(&mut chunk).await.unwrap();
        assert!(n > 0);
        buf.extend_from_slice(&chunk[..n]);
        if common::find_subslice(&buf, b"\r\n\r\n").is_some() {
            break;
        }
    }
    let head = String::from_utf8_lossy(&buf);
    assert!(head.starts_with("HTTP/1.1 200"), "got: {head}");

    client.write_all(b"echo me through the tunnel").await.unwrap();
    let mut echoed = [0u8; 26];
    tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut echoed))
        .await
        .expect("echo must come back")
        .unwrap();
    assert_eq!(&echoed, b"echo me through the tunnel");
}

#[tokio::test]
async fn connect_reject_returns_synthesized_response() {
    let mut proxy = Proxy::new(ProxyConfig::default());
    proxy.handle_connect(|_ctx: &mut ProxyCtx| {
        Verdict::Reject(Rejection::new(
            StatusCode::FORBIDDEN,
            "text/plain",
            "CONNECT not allowed here",
        ))
    });
    let (_proxy, proxy_addr) = start_proxy(proxy).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
        .await
        .unwrap();

    let (status, headers, body) = common::read_http_response(&mut client).await;
    assert_eq!(status, 403);
    assert_eq!(body, b"CONNECT not allowed here");
    assert!(headers.iter().any(|(n, v)| n == "pragma" && v == "no-cache"));
}

#[tokio::test]
async fn http_override_short_circuits_the_pipeline() {
    let mut proxy = Proxy::new(ProxyConfig::default());
    proxy.handle_request(|_ctx: &mut ProxyCtx| -> Verdict {
        panic!("request chain must not run when the override services the request")
    });
    proxy.set_http_override(Arc::new(|_ctx: &mut ProxyCtx| {
        Some(midstream::synthesize(
            StatusCode::OK,
            "text/plain",
            "served locally",
        ))
    }));
    let (_proxy, proxy_addr) = start_proxy(proxy).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(b"GET http://anything.example/ HTTP/1.1\r\nHost: anything.example\r\n\r\n")
        .await
        .unwrap();

    let (status, _, body) = common::read_http_response(&mut client).await;
    assert_eq!(status, 200);
    assert_eq!(body, b"served locally");
}
