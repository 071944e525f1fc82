//! Proxy acceptors and dispatch
//!
//! Two entry points feed the same handler chains and context shape:
//!
//! - [`Proxy::listen_http`]: an ordinary HTTP proxy (absolute-form
//!   requests plus CONNECT), served with hyper.
//! - [`Proxy::listen_transparent_tls`]: a raw TCP listener for traffic
//!   redirected at the network layer: the ClientHello is sniffed for SNI,
//!   non-SNI clients are resolved through conntrack, and a CONNECT
//!   context is synthesized so handlers cannot tell the two apart.
//!
//! The connect chain's verdict selects the action: tunnel the bytes
//! opaquely, intercept with a minted leaf certificate and loop decrypted
//! requests back through the request chain, reject, or let a handler
//! consume the request outright.

use std::convert::Infallible;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Context as _;
use bytes::{Buf, Bytes, BytesMut};
use http::header::{HOST, UPGRADE};
use http::{Method, Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::config::ProxyConfig;
use crate::conntrack::{self, ConntrackError};
use crate::context::{Cancellation, ProxyCtx, TraceFlags};
use crate::har::{self, HarReceiver, HarSender};
use crate::mitm::LeafSigner;
use crate::pipeline::{Chain, Handler, Verdict};
use crate::plumb;
use crate::responses;
use crate::shadow::ShadowNetwork;
use crate::signature;
use crate::sniff::{self, PrefixedStream, SniffedTls};
use crate::trace;
use crate::transport::{self, filter_hop_by_hop, split_host_port, IoStream, Transport};

/// Decides which trace passes a context gets.
pub type TraceHook = Arc<dyn Fn(&ProxyCtx) -> TraceFlags + Send + Sync>;

/// Observes inner TLS handshake failures. The boolean reports whether the
/// failure looked like the client distrusting the minted certificate
/// (cert-pinning clients), as opposed to a plain transport error.
pub type TlsFailureHook = Arc<dyn Fn(&ProxyCtx, bool) + Send + Sync>;

/// Gets first shot at plain HTTP requests; returning a response ends the
/// transaction before any chain runs.
pub type HttpOverrideHook = Arc<dyn Fn(&mut ProxyCtx) -> Option<Response<Bytes>> + Send + Sync>;

/// Why a transparent-listener connection was dropped. No response bytes
/// are ever sent for these.
#[derive(Debug, Error)]
pub enum AcceptError {
    #[error("ClientHello sniff failed: {0}")]
    Sniff(#[from] io::Error),

    #[error(transparent)]
    Conntrack(#[from] ConntrackError),

    #[error("non-SNI client with no usable source port")]
    NoSourcePort,

    #[error("no conntrack flow matches source port {source_port}")]
    UnknownDestination { source_port: u16 },

    #[error("destination {0} is inside the local reflection-guard range")]
    LocalDestination(String),

    #[error("destination {0} does not form a valid authority")]
    InvalidDestination(String),

    #[error("connect handler panicked")]
    HandlerPanic,
}

/// The proxy: configuration, handler chains, shared transport, and the
/// pluggable hooks. Register handlers before wrapping it in an `Arc` and
/// starting listeners.
pub struct Proxy {
    pub(crate) config: ProxyConfig,
    pub(crate) transport: Arc<Transport>,
    pub(crate) shadow: Option<Arc<dyn ShadowNetwork>>,
    signer: Option<Arc<dyn LeafSigner>>,
    trace_hook: Option<TraceHook>,
    tls_failure: Option<TlsFailureHook>,
    handle_http: Option<HttpOverrideHook>,

    /// When set, the next round-trip drains the default transport's idle
    /// pool before dialing.
    pub(crate) flush_idle: AtomicBool,

    sess: AtomicU64,
    last_signature: Mutex<String>,

    pub(crate) har_tx: HarSender,
    har_rx: Mutex<Option<HarReceiver>>,

    connect_chain: Chain,
    request_chain: Chain,
    response_chain: Chain,
    done_chain: Chain,
}

impl Proxy {
    pub fn new(config: ProxyConfig) -> Self {
        let transport = Arc::new(Transport::new(config.transport.clone()));
        let (har_tx, har_rx) = har::channel();
        Self {
            config,
            transport,
            shadow: None,
            signer: None,
            trace_hook: None,
            tls_failure: None,
            handle_http: None,
            flush_idle: AtomicBool::new(false),
            sess: AtomicU64::new(0),
            last_signature: Mutex::new(String::new()),
            har_tx,
            har_rx: Mutex::new(Some(har_rx)),
            connect_chain: Chain::new("connect"),
            request_chain: Chain::new("request"),
            response_chain: Chain::new("response"),
            done_chain: Chain::new("done"),
        }
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    pub fn handle_connect(&mut self, handler: impl Handler + 'static) -> &mut Self {
        self.connect_chain.push(handler);
        self
    }

    pub fn handle_request(&mut self, handler: impl Handler + 'static) -> &mut Self {
        self.request_chain.push(handler);
        self
    }

    pub fn handle_response(&mut self, handler: impl Handler + 'static) -> &mut Self {
        self.response_chain.push(handler);
        self
    }

    pub fn handle_done(&mut self, handler: impl Handler + 'static) -> &mut Self {
        self.done_chain.push(handler);
        self
    }

    /// Route eligible requests through `network` once it is available.
    pub fn set_shadow_network(&mut self, network: Arc<dyn ShadowNetwork>) -> &mut Self {
        self.shadow = Some(network);
        self
    }

    /// Certificate authority used to sign interception leaves. Without
    /// one, MITM verdicts degrade to opaque tunnels.
    pub fn set_leaf_signer(&mut self, signer: Arc<dyn LeafSigner>) -> &mut Self {
        self.signer = Some(signer);
        self
    }

    pub fn set_trace_hook(&mut self, hook: TraceHook) -> &mut Self {
        self.trace_hook = Some(hook);
        self
    }

    pub fn on_tls_failure(&mut self, hook: TlsFailureHook) -> &mut Self {
        self.tls_failure = Some(hook);
        self
    }

    pub fn set_http_override(&mut self, hook: HttpOverrideHook) -> &mut Self {
        self.handle_http = Some(hook);
        self
    }

    // ------------------------------------------------------------------
    // Shared state
    // ------------------------------------------------------------------

    /// Request that the next upstream call drop all idle connections.
    pub fn flush_idle_connections(&self) {
        self.flush_idle.store(true, Ordering::SeqCst);
    }

    /// The HAR entry stream. Yields `Some` exactly once.
    pub fn take_har_entries(&self) -> Option<HarReceiver> {
        self.har_rx.lock().expect("har receiver lock poisoned").take()
    }

    /// Most recent client signature reported by a listener.
    pub fn last_signature(&self) -> String {
        self.last_signature
            .lock()
            .expect("signature lock poisoned")
            .clone()
    }

    pub fn set_signature(&self, signature: impl Into<String>) {
        *self.last_signature.lock().expect("signature lock poisoned") = signature.into();
    }

    fn next_session(&self) -> u64 {
        self.sess.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Build the per-transaction context, inheriting proxy-wide defaults.
    pub(crate) fn new_ctx(
        &self,
        method: Method,
        source_addr: Option<SocketAddr>,
        request: Request<Bytes>,
        host: String,
    ) -> ProxyCtx {
        ProxyCtx {
            session: self.next_session(),
            method,
            source_addr,
            request,
            response: None,
            host,
            signer: self.signer.clone(),
            device_type: -1,
            sniffed_tls: false,
            sni_host: String::new(),
            cipher_signature: String::new(),
            private_network: false,
            shadow_transport: None,
            fake_destination_dns: String::new(),
            skip_request_handler: false,
            skip_response_handler: false,
            is_non_http: false,
            trace: TraceFlags::default(),
            trace_info: None,
            log_har: false,
            capture_content: false,
            user_data: Default::default(),
            user_objects: Default::default(),
            round_tripper: None,
            cancel: Cancellation::never(),
            verbosity: self.config.verbosity,
            request_time: chrono::Utc::now(),
        }
    }

    pub(crate) fn run_connect_chain(
        &self,
        ctx: &mut ProxyCtx,
    ) -> Result<Verdict, crate::pipeline::ChainPanic> {
        self.connect_chain.run(ctx)
    }

    fn apply_trace(&self, ctx: &mut ProxyCtx) {
        if let Some(hook) = &self.trace_hook {
            ctx.trace = hook(ctx);
            if ctx.trace.modified {
                trace::setup(ctx, "modified request");
            }
        }
    }

    // ------------------------------------------------------------------
    // HTTP proxy acceptor
    // ------------------------------------------------------------------

    /// Serve the HTTP proxy on `addr` until the listener fails.
    pub async fn listen_http(self: Arc<Self>, addr: &str) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding HTTP proxy listener on {addr}"))?;
        self.serve_http(listener).await
    }

    /// Serve the HTTP proxy on an already-bound listener.
    pub async fn serve_http(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "HTTP proxy listening");

        loop {
            let (stream, peer) = listener.accept().await.context("accepting connection")?;
            let proxy = Arc::clone(&self);
            tokio::spawn(async move {
                let (handle, cancel) = Cancellation::pair();
                let conn_proxy = Arc::clone(&proxy);
                let service = service_fn(move |req| {
                    let proxy = Arc::clone(&conn_proxy);
                    let cancel = cancel.clone();
                    async move { Ok::<_, Infallible>(proxy.serve(req, peer, cancel).await) }
                });

                let io = TokioIo::new(stream);
                if let Err(e) = http1::Builder::new()
                    .preserve_header_case(true)
                    .serve_connection(io, service)
                    .with_upgrades()
                    .await
                {
                    debug!(peer = %peer, error = %e, "client connection ended");
                }
                drop(handle);
            });
        }
    }

    async fn serve(
        self: Arc<Self>,
        mut req: Request<Incoming>,
        peer: SocketAddr,
        cancel: Cancellation,
    ) -> Response<Full<Bytes>> {
        if req.method() == Method::CONNECT {
            return self.serve_connect(req, peer).await;
        }

        let upgrade_requested = req.headers().contains_key(UPGRADE);
        let on_upgrade = upgrade_requested.then(|| hyper::upgrade::on(&mut req));

        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                return to_full(responses::synthesize(
                    StatusCode::BAD_REQUEST,
                    "text/plain",
                    format!("failed to read request body: {e}"),
                ));
            }
        };
        let mut request = Request::from_parts(parts, body);

        if let Err(reason) = normalize_request_uri(&mut request) {
            return to_full(responses::synthesize(
                StatusCode::BAD_REQUEST,
                "text/plain",
                reason,
            ));
        }
        let host = effective_host(request.uri());
        let method = request.method().clone();

        let mut ctx = self.new_ctx(method, Some(peer), request, host);
        ctx.set_cancellation(cancel);
        self.apply_trace(&mut ctx);

        if let Some(on_upgrade) = on_upgrade {
            return self.serve_upgrade(ctx, on_upgrade).await;
        }

        if let Some(hook) = &self.handle_http {
            if let Some(response) = hook(&mut ctx) {
                debug!(session = ctx.session, "request serviced by HTTP override");
                return to_full(response);
            }
        }

        let response = self.dispatch_request(&mut ctx).await;
        if ctx.trace.modified {
            trace::write(&ctx, Some(&response));
        }
        if ctx.trace.unmodified {
            trace::spawn_unmodified_http(Arc::clone(&self), &ctx);
        }
        to_full(response)
    }

    async fn serve_connect(
        self: Arc<Self>,
        mut req: Request<Incoming>,
        peer: SocketAddr,
    ) -> Response<Full<Bytes>> {
        let authority = req
            .uri()
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_else(|| req.uri().to_string());
        let (host, port) = split_host_port(&authority, 443);
        let host_port = format!("{host}:{port}");

        let on_upgrade = hyper::upgrade::on(&mut req);

        let connect_req = match Request::builder()
            .method(Method::CONNECT)
            .uri(host_port.as_str())
            .body(Bytes::new())
        {
            Ok(r) => r,
            Err(e) => {
                return to_full(responses::synthesize(
                    StatusCode::BAD_REQUEST,
                    "text/plain",
                    format!("invalid CONNECT authority {authority:?}: {e}"),
                ));
            }
        };

        let mut ctx = self.new_ctx(Method::CONNECT, Some(peer), connect_req, host_port);
        self.apply_trace(&mut ctx);

        let verdict = match self.connect_chain.run(&mut ctx) {
            Ok(v) => v,
            Err(_) => {
                return to_full(responses::synthesize(
                    StatusCode::BAD_GATEWAY,
                    "text/plain",
                    "proxy handler failure",
                ));
            }
        };

        match verdict {
            Verdict::Reject(rejection) => to_full(rejection.into_response()),
            Verdict::Done => to_full(ctx.response.take().unwrap_or_else(empty_ok)),
            verdict => {
                // Hyper sends our 200 and hands over the raw stream.
                let proxy = Arc::clone(&self);
                tokio::spawn(async move {
                    let (handle, cancel) = Cancellation::pair();
                    ctx.set_cancellation(cancel);
                    match on_upgrade.await {
                        Ok(upgraded) => {
                            let client = TokioIo::new(upgraded);
                            if let Some(ctx) = proxy.perform_connect_action(ctx, verdict, client).await
                            {
                                if ctx.trace.unmodified {
                                    trace::replay_unmodified_tls(&proxy, &ctx).await;
                                }
                            }
                        }
                        Err(e) => debug!(error = %e, "CONNECT upgrade never completed"),
                    }
                    drop(handle);
                });
                Response::builder()
                    .status(StatusCode::OK)
                    .body(Full::new(Bytes::new()))
                    .expect("static response parts are valid")
            }
        }
    }

    /// Non-CONNECT requests carrying `Upgrade:` enter the connect chain;
    /// the default action forwards the handshake and splices the two
    /// streams on a `101`.
    async fn serve_upgrade(
        self: Arc<Self>,
        mut ctx: ProxyCtx,
        on_upgrade: hyper::upgrade::OnUpgrade,
    ) -> Response<Full<Bytes>> {
        let verdict = match self.connect_chain.run(&mut ctx) {
            Ok(v) => v,
            Err(_) => {
                return to_full(responses::synthesize(
                    StatusCode::BAD_GATEWAY,
                    "text/plain",
                    "proxy handler failure",
                ));
            }
        };

        match verdict {
            Verdict::Reject(rejection) => to_full(rejection.into_response()),
            Verdict::Done => to_full(ctx.response.take().unwrap_or_else(empty_ok)),
            Verdict::Mitm => {
                warn!(
                    session = ctx.session,
                    "MITM verdict on an upgrade request; forwarding instead"
                );
                self.upgrade_round_trip(ctx, on_upgrade).await
            }
            Verdict::Next | Verdict::Forward => self.upgrade_round_trip(ctx, on_upgrade).await,
        }
    }

    async fn upgrade_round_trip(
        self: Arc<Self>,
        ctx: ProxyCtx,
        on_upgrade: hyper::upgrade::OnUpgrade,
    ) -> Response<Full<Bytes>> {
        let scheme = ctx.request.uri().scheme_str().unwrap_or("http");
        let is_tls = matches!(scheme, "https" | "wss");
        let (host, port) = split_host_port(&ctx.host, if is_tls { 443 } else { 80 });

        let mut upstream = match self.transport.connect(&host, port, is_tls, &host).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(session = ctx.session, host = %ctx.host, error = %e, "upgrade dial failed");
                return to_full(responses::synthesize(
                    StatusCode::BAD_GATEWAY,
                    "text/plain",
                    format!("upstream dial failed: {e}"),
                ));
            }
        };

        // The handshake request goes through nearly verbatim: upgrade
        // negotiation headers must survive.
        let head = encode_upgrade_head(&ctx.request, &ctx.host);
        if let Err(e) = upstream.write_all(&head).await {
            return to_full(responses::synthesize(
                StatusCode::BAD_GATEWAY,
                "text/plain",
                format!("upstream write failed: {e}"),
            ));
        }

        let config = self.transport.config();
        let mut leftover = BytesMut::new();
        let head_result = tokio::time::timeout(
            config.response_header_timeout,
            transport::read_head_bytes(&mut upstream, &mut leftover, config.idle_timeout),
        )
        .await;
        let head_len = match head_result {
            Ok(Ok(len)) => len,
            Ok(Err(e)) => {
                return to_full(responses::synthesize(
                    StatusCode::BAD_GATEWAY,
                    "text/plain",
                    format!("upstream handshake failed: {e}"),
                ));
            }
            Err(_) => {
                return to_full(responses::synthesize(
                    StatusCode::GATEWAY_TIMEOUT,
                    "text/plain",
                    "upstream handshake timed out",
                ));
            }
        };

        let (status, _version, headers) = match transport::parse_response_head(&leftover[..head_len])
        {
            Ok(parsed) => parsed,
            Err(e) => {
                return to_full(responses::synthesize(
                    StatusCode::BAD_GATEWAY,
                    "text/plain",
                    format!("invalid upstream handshake response: {e}"),
                ));
            }
        };
        leftover.advance(head_len);

        if status == StatusCode::SWITCHING_PROTOCOLS {
            let session = ctx.session;
            tokio::spawn(async move {
                match on_upgrade.await {
                    Ok(upgraded) => {
                        let client = TokioIo::new(upgraded);
                        let spliced = PrefixedStream::new(leftover.freeze(), upstream);
                        let outcome = plumb::fit(client, spliced).await;
                        debug!(
                            session,
                            up = outcome.a_to_b.bytes,
                            down = outcome.b_to_a.bytes,
                            "upgrade tunnel finished"
                        );
                    }
                    Err(e) => debug!(session, error = %e, "client upgrade never completed"),
                }
            });

            let mut response = Response::builder()
                .status(StatusCode::SWITCHING_PROTOCOLS)
                .body(Full::new(Bytes::new()))
                .expect("static response parts are valid");
            *response.headers_mut() = headers;
            return response;
        }

        // The upstream declined to switch; relay its answer as a normal
        // response.
        let body = transport::read_message_body(
            &mut upstream,
            ctx.request.method(),
            status,
            &headers,
            leftover,
            config.max_body_size,
            config.idle_timeout,
        )
        .await;
        match body {
            Ok((body, _)) => {
                let mut response = Response::builder()
                    .status(status)
                    .body(Full::new(body))
                    .expect("parsed response parts are valid");
                *response.headers_mut() = filter_hop_by_hop(&headers);
                response
            }
            Err(e) => to_full(responses::synthesize(
                StatusCode::BAD_GATEWAY,
                "text/plain",
                format!("failed reading upstream response: {e}"),
            )),
        }
    }

    // ------------------------------------------------------------------
    // Request pipeline
    // ------------------------------------------------------------------

    /// Run the request chain, the round-trip, the response chain and the
    /// done chain for `ctx.request`, producing the response to send.
    pub(crate) async fn dispatch_request(&self, ctx: &mut ProxyCtx) -> Response<Bytes> {
        let verdict = if ctx.skip_request_handler {
            Verdict::Next
        } else {
            match self.request_chain.run(ctx) {
                Ok(v) => v,
                Err(_) => {
                    return responses::synthesize(
                        StatusCode::BAD_GATEWAY,
                        "text/plain",
                        "proxy handler failure",
                    );
                }
            }
        };

        match verdict {
            Verdict::Reject(rejection) => {
                ctx.response = Some(rejection.into_response());
            }
            Verdict::Done => {
                // A handler satisfied the request; ctx.response is its
                // answer. Remaining chains are skipped.
            }
            Verdict::Mitm => {
                warn!(
                    session = ctx.session,
                    "MITM verdict outside the connect chain; forwarding instead"
                );
                self.forward(ctx).await;
            }
            Verdict::Next | Verdict::Forward => {
                self.forward(ctx).await;
            }
        }

        // A panicking done handler is already logged; the response stands.
        let _ = self.done_chain.run(ctx);

        ctx.response.take().unwrap_or_else(|| {
            responses::synthesize(
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain",
                "no response produced for request",
            )
        })
    }

    /// Round-trip upstream and run the response chain on real responses.
    async fn forward(&self, ctx: &mut ProxyCtx) {
        match self.round_trip(ctx).await {
            Ok(response) => {
                ctx.response = Some(response);
                let synthesized = ctx
                    .response
                    .as_ref()
                    .map(responses::is_synthesized)
                    .unwrap_or(false);
                if !ctx.skip_response_handler && !synthesized {
                    match self.response_chain.run(ctx) {
                        Ok(Verdict::Reject(rejection)) => {
                            ctx.response = Some(rejection.into_response());
                        }
                        Ok(_) => {}
                        Err(_) => {
                            ctx.response = Some(responses::synthesize(
                                StatusCode::BAD_GATEWAY,
                                "text/plain",
                                "proxy handler failure",
                            ));
                        }
                    }
                }
            }
            Err(e) => {
                warn!(session = ctx.session, host = %ctx.host, error = %e, "upstream round-trip failed");
                ctx.response = Some(responses::synthesize(
                    StatusCode::BAD_GATEWAY,
                    "text/html",
                    format!("<html><body>upstream request failed: {e}</body></html>"),
                ));
            }
        }
    }

    // ------------------------------------------------------------------
    // Connect actions (shared by both acceptors)
    // ------------------------------------------------------------------

    /// Act on a connect-chain verdict with the client's raw stream in
    /// hand. Returns the context back for trace replay, when it survives.
    pub(crate) async fn perform_connect_action<S>(
        self: &Arc<Self>,
        mut ctx: ProxyCtx,
        verdict: Verdict,
        client: S,
    ) -> Option<ProxyCtx>
    where
        S: IoStream + 'static,
    {
        match verdict {
            Verdict::Done => Some(ctx),
            Verdict::Reject(rejection) => {
                if ctx.sniffed_tls {
                    // The client expects TLS records, not an HTTP error.
                    debug!(session = ctx.session, "dropping rejected transparent connection");
                } else {
                    write_raw_response(client, rejection.into_response()).await;
                }
                Some(ctx)
            }
            Verdict::Mitm => self.mitm_intercept(ctx, client).await,
            Verdict::Next | Verdict::Forward => {
                self.tunnel(&mut ctx, client).await;
                Some(ctx)
            }
        }
    }

    /// Default connect action: splice the client against a raw upstream.
    async fn tunnel<S>(&self, ctx: &mut ProxyCtx, client: S)
    where
        S: IoStream,
    {
        let upstream = match self.transport.dial_raw(&ctx.host).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(session = ctx.session, host = %ctx.host, error = %e, "tunnel dial failed");
                return;
            }
        };
        ctx.log(3, format!("tunneling to {}", ctx.host));
        let outcome = plumb::fit(client, upstream).await;
        debug!(
            session = ctx.session,
            host = %ctx.host,
            up = outcome.a_to_b.bytes,
            down = outcome.b_to_a.bytes,
            "tunnel finished"
        );
    }

    /// Terminate the client's TLS with a minted leaf and serve the
    /// decrypted requests through the request pipeline.
    async fn mitm_intercept<S>(self: &Arc<Self>, mut ctx: ProxyCtx, client: S) -> Option<ProxyCtx>
    where
        S: IoStream + 'static,
    {
        let Some(signer) = ctx.signer.clone() else {
            warn!(
                session = ctx.session,
                "MITM verdict without a leaf signer; tunneling instead"
            );
            self.tunnel(&mut ctx, client).await;
            return Some(ctx);
        };

        let sni = if ctx.sni_host.is_empty() {
            ctx.host_name().to_string()
        } else {
            ctx.sni_host.clone()
        };

        let server_config = match signer.server_config(&sni) {
            Ok(config) => config,
            Err(e) => {
                error!(session = ctx.session, sni = %sni, error = %e, "leaf signing failed");
                return Some(ctx);
            }
        };

        let acceptor = TlsAcceptor::from(server_config);
        let tls = match acceptor.accept(client).await {
            Ok(stream) => stream,
            Err(e) => {
                // Handshake-level failures (as opposed to plain transport
                // errors) usually mean the client rejected our leaf:
                // a cert-pinning client worth adding to a bypass set.
                let untrusted = e.kind() == io::ErrorKind::InvalidData;
                debug!(
                    session = ctx.session,
                    sni = %sni,
                    untrusted,
                    error = %e,
                    "inner TLS handshake failed"
                );
                if !ctx.cipher_signature.is_empty() {
                    self.set_signature(ctx.cipher_signature.clone());
                }
                if let Some(hook) = &self.tls_failure {
                    hook(&ctx, untrusted);
                }
                return Some(ctx);
            }
        };

        ctx.log(3, format!("intercepting TLS for {sni}"));

        let authority = ctx.host.clone();
        let shared = Arc::new(tokio::sync::Mutex::new(ctx));
        let service_ctx = Arc::clone(&shared);
        let proxy = Arc::clone(self);
        let service = service_fn(move |req: Request<Incoming>| {
            let proxy = Arc::clone(&proxy);
            let shared = Arc::clone(&service_ctx);
            let authority = authority.clone();
            async move {
                let (parts, body) = req.into_parts();
                let body = match body.collect().await {
                    Ok(collected) => collected.to_bytes(),
                    Err(e) => {
                        return Ok::<_, Infallible>(to_full(responses::synthesize(
                            StatusCode::BAD_REQUEST,
                            "text/plain",
                            format!("failed to read request body: {e}"),
                        )));
                    }
                };
                let mut request = Request::from_parts(parts, body);
                absolutize_intercepted_uri(&mut request, &authority);

                let mut ctx = shared.lock().await;
                ctx.method = request.method().clone();
                ctx.request = request;
                // A trace armed at CONNECT time captured the opaque
                // CONNECT; re-capture now that the real request is known.
                if let Some(label) = ctx.trace_info.as_ref().map(|info| info.label) {
                    trace::setup(&mut ctx, label);
                }
                let response = proxy.dispatch_request(&mut ctx).await;
                if ctx.trace.modified {
                    trace::write(&ctx, Some(&response));
                }
                Ok::<_, Infallible>(to_full(response))
            }
        });

        if let Err(e) = http1::Builder::new()
            .preserve_header_case(true)
            .serve_connection(TokioIo::new(tls), service)
            .await
        {
            debug!(error = %e, "intercepted connection ended");
        }

        match Arc::try_unwrap(shared) {
            Ok(mutex) => Some(mutex.into_inner()),
            Err(_) => None,
        }
    }

    // ------------------------------------------------------------------
    // Transparent TLS acceptor
    // ------------------------------------------------------------------

    /// Accept raw TLS connections on `addr` until the listener fails.
    pub async fn listen_transparent_tls(self: Arc<Self>, addr: &str) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding transparent TLS listener on {addr}"))?;
        self.serve_transparent_tls(listener).await
    }

    /// Accept raw TLS connections on an already-bound listener.
    pub async fn serve_transparent_tls(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "transparent TLS listener ready");

        loop {
            let (stream, peer) = listener.accept().await.context("accepting connection")?;
            let proxy = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = proxy.accept_transparent(stream, peer).await {
                    debug!(peer = %peer, error = %e, "transparent connection dropped");
                }
            });
        }
    }

    pub(crate) async fn accept_transparent(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), AcceptError> {
        let sniffed = sniff::sniff(stream).await?;
        let host = self.resolve_transparent_host(&sniffed, peer).await?;
        let host_port = format!("{host}:443");

        // SNI values come off the wire; refuse anything that does not
        // form a valid authority.
        let connect_req = Request::builder()
            .method(Method::CONNECT)
            .uri(host_port.as_str())
            .body(Bytes::new())
            .map_err(|_| AcceptError::InvalidDestination(host.clone()))?;

        let mut ctx = self.new_ctx(Method::CONNECT, Some(peer), connect_req, host_port);
        ctx.sniffed_tls = true;
        ctx.sni_host = host.clone();
        ctx.is_non_http = !sniffed.is_tls();
        ctx.cipher_signature = sniffed
            .hello
            .as_ref()
            .filter(|hello| !hello.cipher_suites.is_empty())
            .map(signature::signature)
            .unwrap_or_default();

        if ctx.is_non_http {
            ctx.log(1, format!("non-TLS bytes on TLS port from {peer}; forwarding opaquely"));
        }

        self.apply_trace(&mut ctx);

        let verdict = self
            .connect_chain
            .run(&mut ctx)
            .map_err(|_| AcceptError::HandlerPanic)?;

        let client = sniffed.into_stream();
        if let Some(ctx) = self.perform_connect_action(ctx, verdict, client).await {
            if ctx.trace.unmodified {
                trace::replay_unmodified_tls(&self, &ctx).await;
            }
        }
        Ok(())
    }

    /// Effective destination host for a transparent connection: the SNI
    /// when present, otherwise the conntrack original destination for
    /// this peer's source port.
    async fn resolve_transparent_host(
        &self,
        sniffed: &SniffedTls<TcpStream>,
        peer: SocketAddr,
    ) -> Result<String, AcceptError> {
        let sni = sniffed.host();
        let host = if !sni.is_empty() {
            sni.to_string()
        } else {
            let source_port = peer.port();
            if source_port == 0 {
                return Err(AcceptError::NoSourcePort);
            }
            let flows = conntrack::read_flows(&self.config.conntrack_path).await?;
            conntrack::original_destination(&flows, source_port)
                .ok_or(AcceptError::UnknownDestination { source_port })?
                .to_string()
        };

        if is_reflection_risk(&host) {
            return Err(AcceptError::LocalDestination(host));
        }
        Ok(host)
    }
}

/// Hard-coded guard against reflection loops: transparent connections may
/// never target the local 192.168.0.0/16 range.
pub(crate) fn is_reflection_risk(host: &str) -> bool {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        let octets = ip.octets();
        return octets[0] == 192 && octets[1] == 168;
    }
    host.starts_with("192.168.")
}

/// Convert a relative request line into absolute form: scheme `http`,
/// authority from the Host header.
pub(crate) fn normalize_request_uri(req: &mut Request<Bytes>) -> Result<(), String> {
    if req.method() == Method::CONNECT || req.uri().scheme().is_some() {
        return Ok(());
    }

    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
        .ok_or_else(|| "relative request without a Host header".to_string())?;

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let uri = Uri::try_from(format!("http://{host}{path_and_query}"))
        .map_err(|e| format!("cannot absolutize request URI: {e}"))?;
    *req.uri_mut() = uri;
    Ok(())
}

/// `host:port` for a normalized URI, defaulting the port by scheme
/// (80 for http/ws, 443 for https/wss).
pub(crate) fn effective_host(uri: &Uri) -> String {
    let authority = uri.authority().map(|a| a.as_str()).unwrap_or("");
    let has_port = authority
        .rsplit_once(':')
        .map(|(_, p)| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(false);
    if has_port {
        return authority.to_string();
    }
    let port = match uri.scheme_str().unwrap_or("http") {
        "https" | "wss" => 443,
        _ => 80,
    };
    format!("{authority}:{port}")
}

/// Rewrite an intercepted origin-form request to absolute `https` form
/// using the CONNECT authority, so handlers and the round-tripper see the
/// same shape as for plain proxied requests.
pub(crate) fn absolutize_intercepted_uri(req: &mut Request<Bytes>, authority: &str) {
    if req.uri().scheme().is_some() {
        return;
    }
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    if let Ok(uri) = Uri::try_from(format!("https://{authority}{path_and_query}")) {
        *req.uri_mut() = uri;
    }
}

/// Serialize the upgrade handshake request nearly verbatim: negotiation
/// headers survive, only the Host header is rewritten.
fn encode_upgrade_head(req: &Request<Bytes>, authority: &str) -> Vec<u8> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut buf = Vec::with_capacity(256);
    buf.extend_from_slice(format!("{} {} HTTP/1.1\r\n", req.method(), path).as_bytes());
    buf.extend_from_slice(format!("Host: {}\r\n", authority).as_bytes());
    for (name, value) in req.headers() {
        if name == HOST || name.as_str().eq_ignore_ascii_case("proxy-connection") {
            continue;
        }
        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(req.body());
    buf
}

/// Serialize a response straight onto a raw stream (used where no HTTP
/// framing layer owns the connection).
async fn write_raw_response<S: IoStream>(mut client: S, response: Response<Bytes>) {
    let status = response.status();
    let mut buf = Vec::with_capacity(256);
    buf.extend_from_slice(
        format!(
            "HTTP/1.1 {} {}\r\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        )
        .as_bytes(),
    );
    for (name, value) in response.headers() {
        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(response.body());

    if let Err(e) = client.write_all(&buf).await {
        debug!(error = %e, "failed writing raw response");
    }
    let _ = client.shutdown().await;
}

fn empty_ok() -> Response<Bytes> {
    Response::builder()
        .status(StatusCode::OK)
        .body(Bytes::new())
        .expect("static response parts are valid")
}

fn to_full(response: Response<Bytes>) -> Response<Full<Bytes>> {
    let (parts, body) = response.into_parts();
    Response::from_parts(parts, Full::new(body))
}
