//! Default upstream transport
//!
//! A hand-rolled HTTP/1.1 client over tokio streams: dial with a connect
//! budget, optionally wrap in TLS (upstream certificate verification is
//! deliberately skipped: the proxy terminates the client's TLS with its
//! own authority, so the upstream leg is opportunistic), serialize the
//! request in origin-form, parse the response with `httparse`, and keep
//! healthy connections in a per-authority idle pool.
//!
//! The fake-destination variant dials an override host while pinning the
//! TLS SNI to the original hostname, which is how handlers redirect a
//! request without disturbing what the far end sees in the handshake.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use http::header::{CONNECTION, CONTENT_LENGTH, EXPECT, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode, Version};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::config::TransportConfig;

const MAX_HEADER_SIZE: usize = 16384;
const READ_BUFFER_SIZE: usize = 8192;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request has no authority to dial")]
    MissingAuthority,

    #[error("connection timeout")]
    ConnectTimeout,

    #[error("TLS handshake timeout")]
    TlsHandshakeTimeout,

    #[error("timed out waiting for response headers")]
    ResponseHeaderTimeout,

    #[error("read timeout")]
    ReadTimeout,

    #[error("invalid server name: {0}")]
    InvalidServerName(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("connection closed before a response arrived")]
    ConnectionClosed,

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("response body too large: {size} bytes (limit: {limit})")]
    ResponseTooLarge { size: usize, limit: usize },

    #[error("headers too large (> 16KB)")]
    HeadersTooLarge,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("request cancelled by client disconnect")]
    Cancelled,
}

impl TransportError {
    /// Failures a stale pooled connection can produce; worth one retry on
    /// a fresh dial.
    fn is_stale_connection(&self) -> bool {
        matches!(self, Self::ConnectionClosed | Self::Io(_))
    }
}

impl From<httparse::Error> for TransportError {
    fn from(e: httparse::Error) -> Self {
        TransportError::InvalidResponse(e.to_string())
    }
}

/// Object-safe alias for the streams the transport moves bytes over.
pub trait IoStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> IoStream for T {}

pub(crate) type BoxedIo = Box<dyn IoStream>;

/// The default upstream round-tripper.
pub struct Transport {
    config: TransportConfig,
    tls: TlsConnector,
    pool: IdlePool,
    /// Dial this authority instead of the request's.
    dial_override: Option<String>,
    /// Pin the TLS SNI to this name regardless of the dialed host.
    sni_override: Option<String>,
}

impl Transport {
    pub fn new(config: TransportConfig) -> Self {
        let tls = TlsConnector::from(insecure_client_config(config.session_cache_capacity));
        let pool = IdlePool::new(config.max_idle_per_host, config.idle_timeout);
        Self {
            config,
            tls,
            pool,
            dial_override: None,
            sni_override: None,
        }
    }

    /// A transport that dials `fake_destination` while presenting
    /// `sni_host` in the TLS handshake.
    pub fn with_fake_destination(
        config: TransportConfig,
        fake_destination: impl Into<String>,
        sni_host: impl Into<String>,
    ) -> Self {
        let mut transport = Self::new(config);
        transport.dial_override = Some(fake_destination.into());
        transport.sni_override = Some(sni_host.into());
        transport
    }

    pub(crate) fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Drop every pooled idle connection.
    pub async fn close_idle_connections(&self) {
        self.pool.clear().await;
    }

    pub async fn idle_connections(&self) -> usize {
        self.pool.total_idle().await
    }

    /// Dial a raw TCP connection to `authority` (for CONNECT tunnels).
    pub async fn dial_raw(&self, authority: &str) -> Result<TcpStream, TransportError> {
        let (host, port) = split_host_port(authority, 443);
        timeout(
            self.config.connect_timeout,
            TcpStream::connect((host.as_str(), port)),
        )
        .await
        .map_err(|_| TransportError::ConnectTimeout)?
        .map_err(TransportError::Io)
    }

    /// Perform one upstream round-trip for a fully-buffered request.
    pub async fn round_trip(&self, req: &Request<Bytes>) -> Result<Response<Bytes>, TransportError> {
        let scheme = req.uri().scheme_str().unwrap_or("http");
        let is_tls = matches!(scheme, "https" | "wss");
        let authority = req
            .uri()
            .authority()
            .map(|a| a.to_string())
            .or_else(|| {
                req.headers()
                    .get(HOST)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned)
            })
            .ok_or(TransportError::MissingAuthority)?;
        let (host, port) = split_host_port(&authority, default_port(scheme));

        let (dial_host, dial_port) = match &self.dial_override {
            Some(target) => split_host_port(target, port),
            None => (host.clone(), port),
        };
        let sni = self.sni_override.clone().unwrap_or_else(|| host.clone());
        let pool_key = format!("{scheme}://{dial_host}:{dial_port}");

        for attempt in 0..2 {
            let (mut stream, reused) = match self.pool.get(&pool_key).await {
                Some(stream) => (stream, true),
                None => (
                    self.connect(&dial_host, dial_port, is_tls, &sni).await?,
                    false,
                ),
            };

            match self.exchange(&mut stream, req, &authority).await {
                Ok((response, keep_alive)) => {
                    if keep_alive {
                        self.pool.put(pool_key, stream).await;
                    }
                    return Ok(response);
                }
                Err(e) if reused && attempt == 0 && e.is_stale_connection() => {
                    debug!(
                        authority = %pool_key,
                        error = %e,
                        "pooled connection went stale, retrying on a fresh dial"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("second attempt never reuses a pooled connection")
    }

    /// Dial (and optionally TLS-wrap) a connection to `host:port`.
    pub(crate) async fn connect(
        &self,
        host: &str,
        port: u16,
        is_tls: bool,
        sni: &str,
    ) -> Result<BoxedIo, TransportError> {
        let tcp = timeout(
            self.config.connect_timeout,
            TcpStream::connect((host, port)),
        )
        .await
        .map_err(|_| TransportError::ConnectTimeout)?
        .map_err(TransportError::Io)?;

        if !is_tls {
            return Ok(Box::new(tcp));
        }

        let server_name = rustls::pki_types::ServerName::try_from(sni.to_string())
            .map_err(|e| TransportError::InvalidServerName(format!("{sni}: {e}")))?;

        let tls_stream = timeout(
            self.config.tls_handshake_timeout,
            self.tls.connect(server_name, tcp),
        )
        .await
        .map_err(|_| TransportError::TlsHandshakeTimeout)?
        .map_err(|e| TransportError::Tls(e.to_string()))?;

        Ok(Box::new(tls_stream))
    }

    /// Write the request and read the full response off `stream`.
    /// Returns the response and whether the connection may be reused.
    async fn exchange(
        &self,
        stream: &mut BoxedIo,
        req: &Request<Bytes>,
        authority: &str,
    ) -> Result<(Response<Bytes>, bool), TransportError> {
        let head = encode_request_head(req, authority)?;
        let body = req.body();

        let expects_continue = req
            .headers()
            .get(EXPECT)
            .map(|v| v.as_bytes().eq_ignore_ascii_case(b"100-continue"))
            .unwrap_or(false);

        let mut leftover = BytesMut::new();
        if expects_continue && !body.is_empty() {
            stream.write_all(&head).await?;
            match timeout(
                self.config.expect_continue_timeout,
                read_head_bytes(stream, &mut leftover, self.config.idle_timeout),
            )
            .await
            {
                Ok(result) => {
                    let head_len = result?;
                    let status = interim_status(&leftover[..head_len])?;
                    if status == 100 {
                        leftover.advance(head_len);
                        stream.write_all(body).await?;
                    }
                    // Anything else is already the final response; the
                    // body is withheld and parsing continues below.
                }
                Err(_) => {
                    // No interim response in time; send the body anyway.
                    stream.write_all(body).await?;
                }
            }
        } else {
            let mut buf = Vec::with_capacity(head.len() + body.len());
            buf.extend_from_slice(&head);
            buf.extend_from_slice(body);
            stream.write_all(&buf).await?;
        }
        stream.flush().await?;

        // Response head, bounded by the response-header timeout.
        let head_len = match find_header_end(&leftover) {
            Some(len) => len,
            None => timeout(
                self.config.response_header_timeout,
                read_head_bytes(stream, &mut leftover, self.config.idle_timeout),
            )
            .await
            .map_err(|_| TransportError::ResponseHeaderTimeout)??,
        };

        let (status, version, headers) = parse_response_head(&leftover[..head_len])?;
        // Keep only body bytes that arrived with the head.
        leftover.advance(head_len);

        let (body, delimited) = read_message_body(
            stream,
            req.method(),
            status,
            &headers,
            leftover,
            self.config.max_body_size,
            self.config.idle_timeout,
        )
        .await?;
        let is_chunked = headers
            .get(TRANSFER_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false);

        let request_wants_close = req
            .headers()
            .get(CONNECTION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("close"))
            .unwrap_or(false);
        let response_wants_close = headers
            .get(CONNECTION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_ascii_lowercase().contains("close"))
            .unwrap_or(false);
        let keep_alive = delimited
            && version == Version::HTTP_11
            && !request_wants_close
            && !response_wants_close;

        let mut filtered = filter_hop_by_hop(&headers);
        if is_chunked {
            // The body was dechunked; re-frame it for the caller.
            filtered.insert(
                CONTENT_LENGTH,
                HeaderValue::from_str(&body.len().to_string())
                    .expect("decimal length is a valid header value"),
            );
        }

        let mut response = Response::builder()
            .status(status)
            .version(version)
            .body(body)
            .expect("parsed response parts are valid");
        *response.headers_mut() = filtered;

        Ok((response, keep_alive))
    }
}

/// TLS client configuration with verification disabled and a bounded
/// session-ticket cache. The interception design trusts the client-side
/// leg; the upstream leg is opportunistic encryption.
pub(crate) fn insecure_client_config(session_cache_capacity: usize) -> Arc<rustls::ClientConfig> {
    let mut config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoCertVerifier))
        .with_no_client_auth();

    config.resumption = rustls::client::Resumption::store(Arc::new(
        rustls::client::ClientSessionMemoryCache::new(session_cache_capacity.max(1)),
    ));
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

/// No-op certificate verifier for the upstream leg.
#[derive(Debug)]
struct NoCertVerifier;

impl rustls::client::danger::ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

/// Per-authority idle connection pool.
struct IdlePool {
    pools: Mutex<HashMap<String, VecDeque<IdleConn>>>,
    max_per_host: usize,
    idle_timeout: Duration,
}

struct IdleConn {
    stream: BoxedIo,
    parked_at: Instant,
}

impl IdlePool {
    fn new(max_per_host: usize, idle_timeout: Duration) -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
            max_per_host,
            idle_timeout,
        }
    }

    async fn get(&self, key: &str) -> Option<BoxedIo> {
        let mut pools = self.pools.lock().await;
        let pool = pools.get_mut(key)?;
        while let Some(conn) = pool.pop_front() {
            if conn.parked_at.elapsed() > self.idle_timeout {
                debug!(authority = key, "discarding idle-expired connection");
                continue;
            }
            return Some(conn.stream);
        }
        None
    }

    async fn put(&self, key: String, stream: BoxedIo) {
        let mut pools = self.pools.lock().await;
        let pool = pools.entry(key).or_default();
        if pool.len() >= self.max_per_host {
            return;
        }
        pool.push_back(IdleConn {
            stream,
            parked_at: Instant::now(),
        });
    }

    async fn clear(&self) {
        let mut pools = self.pools.lock().await;
        let dropped: usize = pools.values().map(VecDeque::len).sum();
        pools.clear();
        if dropped > 0 {
            debug!(dropped, "flushed idle connections");
        }
    }

    async fn total_idle(&self) -> usize {
        self.pools.lock().await.values().map(VecDeque::len).sum()
    }
}

/// Serialize the request head in origin-form with hop-by-hop headers
/// stripped and a Host header derived from `authority`.
pub(crate) fn encode_request_head(
    req: &Request<Bytes>,
    authority: &str,
) -> Result<Vec<u8>, TransportError> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut buf = Vec::with_capacity(256);
    buf.extend_from_slice(format!("{} {} HTTP/1.1\r\n", req.method(), path).as_bytes());
    buf.extend_from_slice(format!("Host: {}\r\n", authority).as_bytes());

    for (name, value) in filter_hop_by_hop(req.headers()).iter() {
        if name == HOST || name == CONTENT_LENGTH {
            continue;
        }
        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    let body_len = req.body().len();
    if body_len > 0 || method_carries_body(req.method()) {
        buf.extend_from_slice(format!("Content-Length: {}\r\n", body_len).as_bytes());
    }
    buf.extend_from_slice(b"\r\n");
    Ok(buf)
}

fn method_carries_body(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

/// RFC 7230 §6.1 hop-by-hop headers, plus the de-facto
/// `proxy-connection`. `Upgrade` and `Expect` survive: the server relays
/// upgrades explicitly and expect/continue is handled in the exchange.
fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "proxy-connection"
    )
}

pub(crate) fn filter_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::new();
    for (name, value) in headers {
        if !is_hop_by_hop(&name.as_str().to_ascii_lowercase()) {
            filtered.append(name.clone(), value.clone());
        }
    }
    filtered
}

fn default_port(scheme: &str) -> u16 {
    match scheme {
        "https" | "wss" => 443,
        _ => 80,
    }
}

/// Split `host:port`, tolerating bracketed IPv6 literals.
pub(crate) fn split_host_port(authority: &str, fallback_port: u16) -> (String, u16) {
    if let Some(rest) = authority.strip_prefix('[') {
        if let Some((host, port)) = rest.split_once(']') {
            let port = port
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(fallback_port);
            return (host.to_string(), port);
        }
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => {
            (host.to_string(), port.parse().unwrap_or(fallback_port))
        }
        _ => (authority.to_string(), fallback_port),
    }
}

/// Read into `buf` until a complete header block is present; returns the
/// offset just past the terminating blank line.
pub(crate) async fn read_head_bytes<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    per_read_timeout: Duration,
) -> Result<usize, TransportError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    loop {
        if let Some(end) = find_header_end(buf) {
            return Ok(end);
        }
        if buf.len() > MAX_HEADER_SIZE {
            return Err(TransportError::HeadersTooLarge);
        }
        let mut chunk = [0u8; READ_BUFFER_SIZE];
        let n = timeout(per_read_timeout, stream.read(&mut chunk))
            .await
            .map_err(|_| TransportError::ReadTimeout)??;
        if n == 0 {
            return Err(TransportError::ConnectionClosed);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

pub(crate) fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn interim_status(head: &[u8]) -> Result<u16, TransportError> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut response = httparse::Response::new(&mut headers);
    response.parse(head)?;
    response
        .code
        .ok_or_else(|| TransportError::InvalidResponse("status line missing".to_string()))
}

pub(crate) fn parse_response_head(
    head: &[u8],
) -> Result<(StatusCode, Version, HeaderMap), TransportError> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(head)? {
        httparse::Status::Complete(_) => {}
        httparse::Status::Partial => {
            return Err(TransportError::InvalidResponse(
                "incomplete headers".to_string(),
            ));
        }
    }

    let status = StatusCode::from_u16(response.code.unwrap_or(500))
        .map_err(|e| TransportError::InvalidResponse(format!("invalid status code: {e}")))?;
    let version = match response.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };

    let mut map = HeaderMap::new();
    for h in response.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(h.name.as_bytes()),
            HeaderValue::from_bytes(h.value),
        ) {
            map.append(name, value);
        }
    }
    Ok((status, version, map))
}

/// Read a complete response body according to its framing. Returns the
/// body and whether the framing was delimited (false means read-to-EOF,
/// which rules out connection reuse).
pub(crate) async fn read_message_body<S>(
    stream: &mut S,
    req_method: &Method,
    status: StatusCode,
    headers: &HeaderMap,
    leftover: BytesMut,
    max_size: usize,
    per_read_timeout: Duration,
) -> Result<(Bytes, bool), TransportError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let is_chunked = headers
        .get(TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);
    let content_length = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());

    let bodyless = *req_method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED;

    if bodyless {
        return Ok((Bytes::new(), true));
    }
    if is_chunked {
        let body = read_chunked_body(stream, leftover, max_size, per_read_timeout).await?;
        return Ok((body, true));
    }
    if let Some(len) = content_length {
        if len > max_size {
            return Err(TransportError::ResponseTooLarge {
                size: len,
                limit: max_size,
            });
        }
        let body = read_content_length_body(stream, leftover, len, per_read_timeout).await?;
        return Ok((body, true));
    }
    let body = read_until_eof(stream, leftover, max_size, per_read_timeout).await?;
    Ok((body, false))
}

async fn read_content_length_body<S>(
    stream: &mut S,
    mut body: BytesMut,
    content_length: usize,
    per_read_timeout: Duration,
) -> Result<Bytes, TransportError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    body.truncate(body.len().min(content_length));
    while body.len() < content_length {
        let mut chunk = [0u8; READ_BUFFER_SIZE];
        let n = timeout(per_read_timeout, stream.read(&mut chunk))
            .await
            .map_err(|_| TransportError::ReadTimeout)??;
        if n == 0 {
            return Err(TransportError::InvalidResponse(format!(
                "premature EOF: expected {} bytes, got {}",
                content_length,
                body.len()
            )));
        }
        let take = n.min(content_length - body.len());
        body.extend_from_slice(&chunk[..take]);
    }
    Ok(body.freeze())
}

/// RFC 7230 chunked decoding, including chunk extensions and trailers.
async fn read_chunked_body<S>(
    stream: &mut S,
    mut buf: BytesMut,
    max_size: usize,
    per_read_timeout: Duration,
) -> Result<Bytes, TransportError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut dechunked = BytesMut::new();

    loop {
        let crlf = loop {
            if let Some(i) = find_crlf(&buf) {
                break i;
            }
            fill(stream, &mut buf, per_read_timeout, "chunk size line").await?;
        };

        let size_line = std::str::from_utf8(&buf[..crlf])
            .map_err(|_| TransportError::InvalidResponse("invalid chunk size encoding".into()))?;
        let size_token = size_line.split(';').next().unwrap_or(size_line).trim();
        let chunk_size = usize::from_str_radix(size_token, 16).map_err(|_| {
            TransportError::InvalidResponse(format!("invalid chunk size hex: {size_token}"))
        })?;
        buf.advance(crlf + 2);

        if chunk_size == 0 {
            consume_trailers(stream, &mut buf, per_read_timeout).await?;
            break;
        }

        while buf.len() < chunk_size + 2 {
            fill(stream, &mut buf, per_read_timeout, "chunk data").await?;
        }
        if &buf[chunk_size..chunk_size + 2] != b"\r\n" {
            return Err(TransportError::InvalidResponse(
                "missing CRLF after chunk data".into(),
            ));
        }
        dechunked.extend_from_slice(&buf[..chunk_size]);
        buf.advance(chunk_size + 2);

        if dechunked.len() > max_size {
            return Err(TransportError::ResponseTooLarge {
                size: dechunked.len(),
                limit: max_size,
            });
        }
    }

    Ok(dechunked.freeze())
}

async fn consume_trailers<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    per_read_timeout: Duration,
) -> Result<(), TransportError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    while !buf.starts_with(b"\r\n") {
        match find_crlf(buf) {
            Some(i) => buf.advance(i + 2),
            None => fill(stream, buf, per_read_timeout, "trailers").await?,
        }
    }
    buf.advance(2);
    Ok(())
}

async fn read_until_eof<S>(
    stream: &mut S,
    mut body: BytesMut,
    max_size: usize,
    per_read_timeout: Duration,
) -> Result<Bytes, TransportError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    loop {
        let mut chunk = [0u8; READ_BUFFER_SIZE];
        let n = timeout(per_read_timeout, stream.read(&mut chunk))
            .await
            .map_err(|_| TransportError::ReadTimeout)??;
        if n == 0 {
            return Ok(body.freeze());
        }
        body.extend_from_slice(&chunk[..n]);
        if body.len() > max_size {
            return Err(TransportError::ResponseTooLarge {
                size: body.len(),
                limit: max_size,
            });
        }
    }
}

async fn fill<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    per_read_timeout: Duration,
    what: &str,
) -> Result<(), TransportError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut chunk = [0u8; READ_BUFFER_SIZE];
    let n = timeout(per_read_timeout, stream.read(&mut chunk))
        .await
        .map_err(|_| TransportError::ReadTimeout)??;
    if n == 0 {
        warn!(what, "connection closed mid-body");
        return Err(TransportError::InvalidResponse(format!(
            "incomplete {what}"
        )));
    }
    buf.extend_from_slice(&chunk[..n]);
    Ok(())
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}
