//! Trace capture and the unmodified mirror pass
//!
//! When the trace hook asks for an unmodified pass, the proxy re-issues
//! the request after the primary settles, with every request and
//! response handler skipped, so operators can compare the filtered and
//! unfiltered answers side by side without touching the client. The
//! mirror request reuses the primary's captured body buffer; neither
//! pass mutates it.

use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, Request, Response};
use rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::context::{ProxyCtx, TraceInfo};
use crate::har;
use crate::server::Proxy;
use crate::sniff;
use crate::transport;

/// Capture the shared trace state off the live request.
pub(crate) fn setup(ctx: &mut ProxyCtx, label: &'static str) {
    let original_headers = ctx
        .request
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.to_string(), v.to_string()))
        })
        .collect();

    ctx.trace_info = Some(TraceInfo {
        req_body: ctx.request.body().clone(),
        original_headers,
        method: ctx.request.method().clone(),
        label,
    });
    debug!(session = ctx.session, label, uri = %ctx.request.uri(), "trace armed");
}

/// Log the completion of a traced pass.
pub(crate) fn write(ctx: &ProxyCtx, response: Option<&Response<Bytes>>) {
    let label = ctx
        .trace_info
        .as_ref()
        .map(|info| info.label)
        .unwrap_or("trace");
    match response {
        Some(response) => info!(
            session = ctx.session,
            label,
            uri = %ctx.request.uri(),
            status = %response.status(),
            bytes = response.body().len(),
            "trace complete"
        ),
        None => info!(
            session = ctx.session,
            label,
            uri = %ctx.request.uri(),
            "trace complete without response"
        ),
    }
}

/// Mirror a plain HTTP request through the pipeline with both handler
/// chains skipped. Runs detached; the primary response is already on its
/// way to the client.
pub(crate) fn spawn_unmodified_http(proxy: Arc<Proxy>, primary: &ProxyCtx) {
    let Some(info) = primary.trace_info.clone() else {
        warn!(
            session = primary.session,
            "unmodified trace requested without captured trace state"
        );
        return;
    };

    let mut request = har::clone_request(&primary.request);
    *request.method_mut() = info.method.clone();
    *request.body_mut() = info.req_body.clone();
    *request.headers_mut() = rebuild_headers(&info.original_headers);

    let method = request.method().clone();
    let host = primary.host.clone();
    let source_addr = primary.source_addr;
    let trace = primary.trace;

    tokio::spawn(async move {
        tokio::time::sleep(proxy.config.trace_settle_delay).await;

        let mut ctx = proxy.new_ctx(method, source_addr, request, host);
        ctx.skip_request_handler = true;
        ctx.skip_response_handler = true;
        ctx.trace = trace;
        ctx.trace_info = Some(TraceInfo {
            label: "unmodified request",
            ..info
        });

        let response = proxy.dispatch_request(&mut ctx).await;
        write(&ctx, Some(&response));
    });
}

/// Mirror an intercepted (CONNECT-path) request: an in-memory socket
/// pair, a TLS client impersonating the original caller on one end, and
/// the connect chain consuming the other end as if freshly accepted.
pub(crate) async fn replay_unmodified_tls(proxy: &Arc<Proxy>, primary: &ProxyCtx) {
    tokio::time::sleep(proxy.config.trace_settle_delay).await;

    let Some(info) = primary.trace_info.clone() else {
        warn!(
            session = primary.session,
            "unmodified trace requested without captured trace state"
        );
        return;
    };

    let (client_end, server_end) = tokio::io::duplex(16 * 1024);

    let host_port = primary.host.clone();
    let host_name = primary.host_name().to_string();
    let uri = primary.request.uri().clone();
    let session = primary.session;
    let client_info = info.clone();

    // The impersonating client: TLS with verification off (the proxy is
    // about to mint the certificate), SNI pinned to the original host.
    let client_task = tokio::spawn(async move {
        let connector = TlsConnector::from(transport::insecure_client_config(1));
        let server_name = match ServerName::try_from(host_name.clone()) {
            Ok(name) => name,
            Err(e) => {
                warn!(session, host = %host_name, error = %e, "mirror client has no usable SNI");
                return;
            }
        };
        let stream = match connector.connect(server_name, client_end).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(session, error = %e, "mirror client handshake failed");
                return;
            }
        };

        if let Err(e) = mirror_exchange(stream, &client_info, uri, &host_port, session).await {
            debug!(session, error = %e, "mirror exchange failed");
        }
    });

    // Server side: the pair's other end is a freshly-accepted connection
    // as far as the connect chain can tell, except that both handler chains
    // are skipped.
    let sniffed = match sniff::sniff(server_end).await {
        Ok(sniffed) => sniffed,
        Err(e) => {
            warn!(session, error = %e, "mirror sniff failed");
            return;
        }
    };

    let connect_req = Request::builder()
        .method(Method::CONNECT)
        .uri(primary.host.as_str())
        .body(Bytes::new())
        .expect("authority-form CONNECT URI is valid");

    let mut ctx = proxy.new_ctx(
        Method::CONNECT,
        primary.source_addr,
        connect_req,
        primary.host.clone(),
    );
    ctx.sniffed_tls = true;
    ctx.sni_host = if primary.sni_host.is_empty() {
        primary.host_name().to_string()
    } else {
        primary.sni_host.clone()
    };
    ctx.cipher_signature = primary.cipher_signature.clone();
    ctx.skip_request_handler = true;
    ctx.skip_response_handler = true;
    ctx.trace = primary.trace;
    ctx.trace_info = Some(TraceInfo {
        label: "unmodified request",
        ..info
    });

    let verdict = match proxy.run_connect_chain(&mut ctx) {
        Ok(verdict) => verdict,
        Err(_) => return,
    };
    proxy
        .perform_connect_action(ctx, verdict, sniffed.into_stream())
        .await;

    let _ = client_task.await;
}

/// Send the captured request over the mirror connection and drain the
/// response for logging.
async fn mirror_exchange<S>(
    mut stream: S,
    info: &TraceInfo,
    uri: http::Uri,
    authority: &str,
    session: u64,
) -> Result<(), transport::TransportError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    use tokio::io::AsyncWriteExt;

    let mut request = Request::builder()
        .method(info.method.clone())
        .uri(uri)
        .body(info.req_body.clone())
        .expect("captured request parts are valid");
    *request.headers_mut() = rebuild_headers(&info.original_headers);

    let head = transport::encode_request_head(&request, authority)?;
    stream.write_all(&head).await?;
    stream.write_all(request.body()).await?;
    stream.flush().await?;

    let mut buf = bytes::BytesMut::new();
    let head_len =
        transport::read_head_bytes(&mut stream, &mut buf, std::time::Duration::from_secs(30))
            .await?;
    let (status, _version, headers) = transport::parse_response_head(&buf[..head_len])?;
    {
        use bytes::Buf;
        buf.advance(head_len);
    }

    let (body, _) = transport::read_message_body(
        &mut stream,
        request.method(),
        status,
        &headers,
        buf,
        100 * 1024 * 1024,
        std::time::Duration::from_secs(30),
    )
    .await?;

    info!(
        session,
        status = %status,
        bytes = body.len(),
        "unmodified mirror response"
    );
    Ok(())
}

fn rebuild_headers(pairs: &[(String, String)]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.append(name, value);
        }
    }
    headers
}
