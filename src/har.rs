//! HAR capture channel
//!
//! Around every logged round-trip the proxy emits one entry into a
//! bounded channel; serialization and persistence belong to the external
//! consumer. The channel capacity is small on purpose: a stalled consumer
//! back-pressures request handling rather than ballooning memory.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{HeaderMap, Method, Response, StatusCode, Uri, Version};
use http::Request;
use tokio::sync::mpsc;

/// Capacity of the entry channel.
pub const HAR_CHANNEL_CAPACITY: usize = 10;

/// An immutable snapshot of an outbound request.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    /// Present only when content capture was requested for the context.
    pub body: Bytes,
}

/// An immutable snapshot of an upstream response.
#[derive(Debug, Clone)]
pub struct CapturedResponse {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// One logged round-trip.
#[derive(Debug, Clone)]
pub struct HarEntry {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub request: CapturedRequest,
    pub response: Option<CapturedResponse>,
    pub capture_content: bool,
}

pub type HarSender = mpsc::Sender<HarEntry>;
pub type HarReceiver = mpsc::Receiver<HarEntry>;

/// Create the bounded entry channel.
pub fn channel() -> (HarSender, HarReceiver) {
    mpsc::channel(HAR_CHANNEL_CAPACITY)
}

/// Snapshot a request. Bodies are shared `Bytes`, so the live request
/// observed by handlers is never copied, truncated or advanced.
pub fn capture_request(request: &Request<Bytes>, with_content: bool) -> CapturedRequest {
    CapturedRequest {
        method: request.method().clone(),
        uri: request.uri().clone(),
        version: request.version(),
        headers: request.headers().clone(),
        body: if with_content {
            request.body().clone()
        } else {
            Bytes::new()
        },
    }
}

/// Snapshot a response; same sharing rules as [`capture_request`].
pub fn capture_response(response: &Response<Bytes>, with_content: bool) -> CapturedResponse {
    CapturedResponse {
        status: response.status(),
        version: response.version(),
        headers: response.headers().clone(),
        body: if with_content {
            response.body().clone()
        } else {
            Bytes::new()
        },
    }
}

/// Rebuild an owned request from its parts. `http::Request` is not
/// `Clone`; the mirror pass and shadow transports need their own copy.
pub fn clone_request(request: &Request<Bytes>) -> Request<Bytes> {
    let mut out = Request::builder()
        .method(request.method().clone())
        .uri(request.uri().clone())
        .version(request.version())
        .body(request.body().clone())
        .expect("cloning valid request parts");
    *out.headers_mut() = request.headers().clone();
    out
}

/// Rebuild an owned response from its parts.
pub fn clone_response(response: &Response<Bytes>) -> Response<Bytes> {
    let mut out = Response::builder()
        .status(response.status())
        .version(response.version())
        .body(response.body().clone())
        .expect("cloning valid response parts");
    *out.headers_mut() = response.headers().clone();
    out
}
