//! Shadow-network transport surface
//!
//! A shadow network is an alternative outbound path (typically a peer
//! network) that the proxy can route individual requests through. Only
//! the trait surface lives here; implementations are supplied by the
//! embedding application.

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};
use std::sync::Arc;

use crate::transport::TransportError;

/// Context key under which the selected shadow handle's name is recorded.
pub const SHADOW_TRANSPORT_KEY: &str = "shadow-transport-key";

/// Factory for per-request shadow transports. Returning `None` means the
/// shadow network cannot serve the request right now; the caller falls
/// back to the local transport.
pub trait ShadowNetwork: Send + Sync {
    fn transport(&self) -> Option<Arc<dyn ShadowTransport>>;
}

/// The result of a shadow round-trip. A shadow transport that failed over
/// internally to the local path reports *both* a response and an error;
/// the round-tripper surfaces the response and clears the private-network
/// disposition so callers see what actually happened.
pub struct ShadowOutcome {
    pub response: Option<Response<Bytes>>,
    pub error: Option<TransportError>,
}

impl ShadowOutcome {
    pub fn ok(response: Response<Bytes>) -> Self {
        Self {
            response: Some(response),
            error: None,
        }
    }

    pub fn err(error: TransportError) -> Self {
        Self {
            response: None,
            error: Some(error),
        }
    }
}

/// A single-request-capable handle into the shadow network.
#[async_trait]
pub trait ShadowTransport: Send + Sync {
    /// Stable name identifying this handle in logs and request context.
    fn name(&self) -> &str;

    async fn round_trip(&self, request: Request<Bytes>) -> ShadowOutcome;
}
