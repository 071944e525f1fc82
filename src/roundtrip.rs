//! Transport selection and the upstream round-trip
//!
//! The first upstream call on a context picks its transport (fake
//! destination, shadow network, or the shared default) and installs it
//! on the context for good. Routing state (`fake_destination_dns`,
//! `private_network`) must therefore be final before the first call.
//!
//! Shadow transports may fail over internally to the local path and
//! report both a response and an error; the error is dropped, the
//! response surfaced, and `private_network` cleared so callers see the
//! real disposition.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use http::{Request, Response};
use thiserror::Error;
use tracing::{debug, warn};

use crate::context::ProxyCtx;
use crate::har::{capture_request, capture_response, clone_request, HarEntry};
use crate::server::Proxy;
use crate::shadow::{ShadowTransport, SHADOW_TRANSPORT_KEY};
use crate::transport::{Transport, TransportError};

/// The transport a context settled on. Installed once, reused for every
/// subsequent round-trip on the same context.
#[derive(Clone)]
pub enum SelectedTransport {
    /// The proxy's shared default transport.
    Local(Arc<Transport>),
    /// A per-context transport dialing the fake destination with SNI
    /// pinned to the original host.
    FakeDestination(Arc<Transport>),
    /// A shadow-network handle.
    Shadow(Arc<dyn ShadowTransport>),
}

#[derive(Debug, Error)]
pub enum RoundTripError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("shadow transport produced neither response nor error")]
    ShadowNoResponse,

    #[error("request cancelled by client disconnect")]
    Cancelled,
}

impl Proxy {
    /// Perform the upstream round-trip for `ctx.request`, installing the
    /// context's transport on first use and recording a HAR entry when
    /// logging is enabled for this context.
    pub async fn round_trip(&self, ctx: &mut ProxyCtx) -> Result<Response<Bytes>, RoundTripError> {
        if ctx.round_tripper.is_none() {
            let selected = self.select_transport(ctx);
            // A pending flush request drains the default transport's pool
            // exactly once, on the true -> false transition.
            if self.flush_idle.swap(false, Ordering::SeqCst) {
                self.transport.close_idle_connections().await;
            }
            ctx.round_tripper = Some(selected);
        }
        let selected = ctx
            .round_tripper
            .clone()
            .expect("round-tripper installed above");

        let log_har = ctx.log_har;
        let start = Utc::now();
        let captured_request = log_har.then(|| capture_request(&ctx.request, ctx.capture_content));

        let mut cancel = ctx.cancel.clone();
        let (result, clear_private) = {
            let call = perform(&selected, &ctx.request);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => (Err(RoundTripError::Cancelled), false),
                outcome = call => outcome,
            }
        };
        if clear_private {
            ctx.private_network = false;
        }

        if let Some(request) = captured_request {
            let entry = HarEntry {
                start,
                end: Utc::now(),
                request,
                response: result
                    .as_ref()
                    .ok()
                    .map(|r| capture_response(r, ctx.capture_content)),
                capture_content: ctx.capture_content,
            };
            if self.har_tx.send(entry).await.is_err() {
                warn!(session = ctx.session, "HAR consumer gone; dropping entry");
            }
        }

        result
    }

    /// First matching rule wins; evaluated once per context.
    fn select_transport(&self, ctx: &mut ProxyCtx) -> SelectedTransport {
        if !ctx.fake_destination_dns.is_empty() {
            let sni = ctx.host_name().to_string();
            debug!(
                session = ctx.session,
                fake_destination = %ctx.fake_destination_dns,
                sni = %sni,
                "routing via fake destination"
            );
            return SelectedTransport::FakeDestination(Arc::new(Transport::with_fake_destination(
                self.config.transport.clone(),
                ctx.fake_destination_dns.clone(),
                sni,
            )));
        }

        if ctx.private_network {
            if let Some(handle) = self.shadow.as_ref().and_then(|network| network.transport()) {
                debug!(
                    session = ctx.session,
                    shadow = handle.name(),
                    "routing via shadow transport"
                );
                ctx.shadow_transport = Some(Arc::clone(&handle));
                ctx.user_data.insert(
                    SHADOW_TRANSPORT_KEY.to_string(),
                    handle.name().to_string(),
                );
                return SelectedTransport::Shadow(handle);
            }
            // No shadow transport available; make the real disposition
            // visible to the caller.
            ctx.private_network = false;
            return SelectedTransport::Local(Arc::clone(&self.transport));
        }

        ctx.private_network = false;
        SelectedTransport::Local(Arc::clone(&self.transport))
    }
}

/// Run the actual call. The second element reports whether shadow
/// fallback fired and `private_network` must be cleared.
async fn perform(
    selected: &SelectedTransport,
    request: &Request<Bytes>,
) -> (Result<Response<Bytes>, RoundTripError>, bool) {
    match selected {
        SelectedTransport::Local(transport) | SelectedTransport::FakeDestination(transport) => (
            transport.round_trip(request).await.map_err(Into::into),
            false,
        ),
        SelectedTransport::Shadow(handle) => {
            let outcome = handle.round_trip(clone_request(request)).await;
            match (outcome.response, outcome.error) {
                (Some(response), Some(error)) => {
                    debug!(
                        shadow = handle.name(),
                        error = %error,
                        "shadow transport returned a response alongside an error; using the response"
                    );
                    (Ok(response), true)
                }
                (Some(response), None) => (Ok(response), false),
                (None, Some(error)) => (Err(error.into()), false),
                (None, None) => (Err(RoundTripError::ShadowNoResponse), false),
            }
        }
    }
}
