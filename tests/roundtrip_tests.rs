//! Transport selection tests
//!
//! Shadow-network routing with its failure fallback, the
//! private-network/shadow-handle invariant, fake-destination dialing, and
//! idle-pool flushing, all observed through real proxied requests.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use midstream::{
    Proxy, ProxyConfig, ProxyCtx, ShadowNetwork, ShadowOutcome, ShadowTransport, TransportError,
    Verdict, SHADOW_TRANSPORT_KEY,
};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

async fn start_proxy(proxy: Proxy) -> (Arc<Proxy>, std::net::SocketAddr) {
    let proxy = Arc::new(proxy);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(Arc::clone(&proxy).serve_http(listener));
    (proxy, addr)
}

/// A shadow transport with a scripted outcome.
struct ScriptedShadow {
    calls: AtomicUsize,
    respond: bool,
    fail: bool,
}

#[async_trait]
impl ShadowTransport for ScriptedShadow {
    fn name(&self) -> &str {
        "scripted-shadow"
    }

    async fn round_trip(&self, _request: Request<Bytes>) -> ShadowOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let response = self.respond.then(|| {
            Response::builder()
                .status(StatusCode::OK)
                .header("content-length", "10")
                .body(Bytes::from_static(b"via shadow"))
                .unwrap()
        });
        let error = self.fail.then(|| TransportError::ConnectionClosed);
        ShadowOutcome { response, error }
    }
}

struct ScriptedNetwork {
    transport: Option<Arc<ScriptedShadow>>,
}

impl ShadowNetwork for ScriptedNetwork {
    fn transport(&self) -> Option<Arc<dyn ShadowTransport>> {
        self.transport
            .as_ref()
            .map(|t| Arc::clone(t) as Arc<dyn ShadowTransport>)
    }
}

/// State observed by the done chain after the round-trip settled.
#[derive(Default)]
struct Observed {
    private_network: Option<bool>,
    shadow_handle: Option<bool>,
    shadow_key: Option<String>,
}

fn observing(proxy: &mut Proxy, observed: &Arc<Mutex<Observed>>) {
    let sink = Arc::clone(observed);
    proxy.handle_done(move |ctx: &mut ProxyCtx| {
        let mut state = sink.lock().unwrap();
        state.private_network = Some(ctx.private_network);
        state.shadow_handle = Some(ctx.shadow_transport.is_some());
        state.shadow_key = ctx.user_data.get(SHADOW_TRANSPORT_KEY).cloned();
        Verdict::Next
    });
}

async fn proxied_get(proxy_addr: std::net::SocketAddr, url: &str, host: &str) -> (u16, Vec<u8>) {
    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(format!("GET {url} HTTP/1.1\r\nHost: {host}\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let (status, _headers, body) = common::read_http_response(&mut client).await;
    (status, body)
}

/// Shadow yields both a response and an error: the response is surfaced,
/// the error dropped, and the private-network flag cleared.
#[tokio::test]
async fn shadow_failure_fallback_surfaces_the_response() {
    let shadow = Arc::new(ScriptedShadow {
        calls: AtomicUsize::new(0),
        respond: true,
        fail: true,
    });
    let observed = Arc::new(Mutex::new(Observed::default()));

    let mut proxy = Proxy::new(ProxyConfig::default());
    proxy.set_shadow_network(Arc::new(ScriptedNetwork {
        transport: Some(Arc::clone(&shadow)),
    }));
    proxy.handle_request(|ctx: &mut ProxyCtx| {
        ctx.private_network = true;
        Verdict::Next
    });
    observing(&mut proxy, &observed);
    let (_proxy, proxy_addr) = start_proxy(proxy).await;

    let (status, body) =
        proxied_get(proxy_addr, "http://cloaked.example/", "cloaked.example").await;
    assert_eq!(status, 200);
    assert_eq!(body, b"via shadow");
    assert_eq!(shadow.calls.load(Ordering::SeqCst), 1);

    let state = observed.lock().unwrap();
    assert_eq!(
        state.private_network,
        Some(false),
        "fallback must clear the private-network disposition"
    );
    assert_eq!(state.shadow_handle, Some(true));
    assert_eq!(state.shadow_key.as_deref(), Some("scripted-shadow"));
}

/// A clean shadow response keeps the private-network disposition, and the
/// invariant holds: private network implies a shadow handle.
#[tokio::test]
async fn clean_shadow_round_trip_keeps_private_network() {
    let shadow = Arc::new(ScriptedShadow {
        calls: AtomicUsize::new(0),
        respond: true,
        fail: false,
    });
    let observed = Arc::new(Mutex::new(Observed::default()));

    let mut proxy = Proxy::new(ProxyConfig::default());
    proxy.set_shadow_network(Arc::new(ScriptedNetwork {
        transport: Some(Arc::clone(&shadow)),
    }));
    proxy.handle_request(|ctx: &mut ProxyCtx| {
        ctx.private_network = true;
        Verdict::Next
    });
    observing(&mut proxy, &observed);
    let (_proxy, proxy_addr) = start_proxy(proxy).await;

    let (status, body) =
        proxied_get(proxy_addr, "http://cloaked.example/", "cloaked.example").await;
    assert_eq!(status, 200);
    assert_eq!(body, b"via shadow");

    let state = observed.lock().unwrap();
    assert_eq!(state.private_network, Some(true));
    assert_eq!(
        state.shadow_handle,
        Some(true),
        "private network true implies a shadow handle"
    );
}

/// The factory returning no transport falls back to the local path and
/// clears the flag so the caller sees the real disposition.
#[tokio::test]
async fn missing_shadow_transport_falls_back_to_local() {
    let upstream =
        common::spawn_http_upstream(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nlocal").await;
    let observed = Arc::new(Mutex::new(Observed::default()));

    let mut proxy = Proxy::new(ProxyConfig::default());
    proxy.set_shadow_network(Arc::new(ScriptedNetwork { transport: None }));
    proxy.handle_request(|ctx: &mut ProxyCtx| {
        ctx.private_network = true;
        Verdict::Next
    });
    observing(&mut proxy, &observed);
    let (_proxy, proxy_addr) = start_proxy(proxy).await;

    let (status, body) =
        proxied_get(proxy_addr, &format!("http://{upstream}/"), &upstream.to_string()).await;
    assert_eq!(status, 200);
    assert_eq!(body, b"local");

    let state = observed.lock().unwrap();
    assert_eq!(state.private_network, Some(false));
    assert_eq!(state.shadow_handle, Some(false));
    assert!(state.shadow_key.is_none());
}

/// A fake destination dials the override host while the request keeps
/// naming the original one.
#[tokio::test]
async fn fake_destination_redirects_the_dial() {
    let decoy =
        common::spawn_http_upstream(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\ndecoy").await;

    let mut proxy = Proxy::new(ProxyConfig::default());
    let decoy_addr = decoy.to_string();
    proxy.handle_request(move |ctx: &mut ProxyCtx| {
        assert!(
            !ctx.round_tripper_installed(),
            "routing state must be set before the first upstream call"
        );
        ctx.fake_destination_dns = decoy_addr.clone();
        Verdict::Next
    });
    let (_proxy, proxy_addr) = start_proxy(proxy).await;

    // The nominal destination does not exist; only the decoy answers.
    let (status, body) = proxied_get(
        proxy_addr,
        "http://origin.invalid/check",
        "origin.invalid",
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body, b"decoy");
}

/// A pending flush request drops pooled idle connections before the next
/// dial, so the follow-up request arrives on a fresh connection.
#[tokio::test]
async fn flush_idle_connections_forces_a_fresh_dial() {
    let connections = Arc::new(AtomicUsize::new(0));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream = listener.local_addr().unwrap();
    let counter = Arc::clone(&connections);
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                use tokio::io::AsyncReadExt;
                loop {
                    let mut buf = [0u8; 4096];
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(_) => {
                            if stream
                                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });

    let (proxy, proxy_addr) = start_proxy(Proxy::new(ProxyConfig::default())).await;
    let url = format!("http://{upstream}/");
    let host = upstream.to_string();

    proxied_get(proxy_addr, &url, &host).await;
    proxied_get(proxy_addr, &url, &host).await;
    assert_eq!(
        connections.load(Ordering::SeqCst),
        1,
        "keep-alive must reuse the pooled connection"
    );

    proxy.flush_idle_connections();
    proxied_get(proxy_addr, &url, &host).await;
    assert_eq!(
        connections.load(Ordering::SeqCst),
        2,
        "a flushed pool must force a fresh upstream dial"
    );
}

/// Upstream failures surface as synthesized 502s.
#[tokio::test]
async fn upstream_failure_becomes_bad_gateway() {
    // A listener that accepts and immediately closes.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            drop(stream);
        }
    });

    let (_proxy, proxy_addr) = start_proxy(Proxy::new(ProxyConfig::default())).await;
    let (status, _body) =
        proxied_get(proxy_addr, &format!("http://{dead}/"), &dead.to_string()).await;
    assert_eq!(status, 502);
}
