//! Synthesized responses
//!
//! Responses the proxy generates itself (handler rejections, upstream
//! failure pages) always carry cache-suppressing headers so that no
//! client or intermediary caches a page the proxy invented.

use bytes::Bytes;
use http::header::{CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE, EXPIRES, PRAGMA};
use http::{Response, StatusCode};

/// Build a synthesized response with the given status, content type and
/// body. Adds `Cache-Control`, `Pragma` and `Expires` suppression headers.
pub fn synthesize(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Response<Bytes> {
    let body = body.into();
    let mut response = Response::builder()
        .status(status)
        .header(CONTENT_TYPE, content_type)
        .header(CACHE_CONTROL, "no-cache, no-store, must-revalidate")
        .header(PRAGMA, "no-cache")
        .header(EXPIRES, "0")
        .header(CONTENT_LENGTH, body.len())
        .body(body)
        .expect("static response parts are valid");
    response.extensions_mut().insert(Synthesized);
    response
}

/// Marker extension identifying responses the proxy generated itself;
/// the response handler chain is not run for these.
#[derive(Debug, Clone, Copy)]
pub struct Synthesized;

/// Whether `response` was generated by the proxy rather than an upstream.
pub fn is_synthesized<B>(response: &Response<B>) -> bool {
    response.extensions().get::<Synthesized>().is_some()
}
