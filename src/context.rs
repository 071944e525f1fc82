//! Per-request proxy context
//!
//! One `ProxyCtx` is created per inbound client transaction and threaded
//! through every handler chain and the round-tripper. Handlers steer the
//! pipeline by mutating it: overriding the cert authority before the
//! connect chain consumes it, routing through the shadow network, faking
//! the upstream destination, or skipping whole chains.

use std::any::Any;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{Method, Request, Response};
use tokio::sync::watch;
use tracing::debug;

use crate::mitm::LeafSigner;
use crate::roundtrip::SelectedTransport;
use crate::shadow::ShadowTransport;

/// Which trace passes the operator asked for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraceFlags {
    /// Log the primary (filtered) pass.
    pub modified: bool,
    /// Additionally mirror the request through an unfiltered pass.
    pub unmodified: bool,
}

/// Shared state between a traced primary request and its mirror pass.
/// The body buffer is captured once and never mutated; both contexts
/// reference the same storage.
#[derive(Debug, Clone)]
pub struct TraceInfo {
    pub req_body: Bytes,
    pub original_headers: Vec<(String, String)>,
    pub method: Method,
    pub label: &'static str,
}

/// Cooperative cancellation observed by the round-tripper. Fires when the
/// client side of the transaction goes away.
#[derive(Clone)]
pub struct Cancellation {
    rx: watch::Receiver<bool>,
    // Keeps the never-fired channel alive for contexts without a handle.
    _keep: Option<Arc<watch::Sender<bool>>>,
}

/// Dropping (or explicitly firing) the handle cancels the paired
/// [`Cancellation`].
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl Cancellation {
    /// A cancellation pair; dropping the handle fires it.
    pub fn pair() -> (CancelHandle, Cancellation) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, Cancellation { rx, _keep: None })
    }

    /// A cancellation that never fires.
    pub fn never() -> Cancellation {
        let (tx, rx) = watch::channel(false);
        Cancellation {
            rx,
            _keep: Some(Arc::new(tx)),
        }
    }

    /// Resolves once cancelled. Sender disappearance counts as
    /// cancellation: the accepting task is gone.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl CancelHandle {
    pub fn cancel(self) {
        let _ = self.tx.send(true);
    }
}

impl Drop for CancelHandle {
    fn drop(&mut self) {
        let _ = self.tx.send(true);
    }
}

/// Mutable state carried through all handlers and the round-tripper for
/// one client transaction.
pub struct ProxyCtx {
    /// Strictly increasing within the owning proxy.
    pub session: u64,

    pub method: Method,
    pub source_addr: Option<SocketAddr>,

    /// The request as currently understood. Rewritten by MITM loop-back
    /// and mutable by request handlers.
    pub request: Request<Bytes>,

    /// Set after the round-trip (or by a handler that satisfied the
    /// request itself); consumed by the response and done chains.
    pub response: Option<Response<Bytes>>,

    /// Resolved `host:port` the transaction targets.
    pub host: String,

    /// Certificate authority used if this CONNECT gets intercepted.
    /// Inherited from the proxy; may be overridden before the connect
    /// chain consumes it.
    pub signer: Option<Arc<dyn LeafSigner>>,

    /// Device classification tag; -1 means unknown.
    pub device_type: i32,

    pub sniffed_tls: bool,
    pub sni_host: String,

    /// GREASE-stripped fingerprint of the client's ClientHello, empty
    /// when none was available.
    pub cipher_signature: String,

    /// Route this request through the shadow network. Cleared by the
    /// round-tripper when the shadow path was not actually used.
    pub private_network: bool,

    /// Populated by the round-tripper when a shadow transport is chosen.
    pub shadow_transport: Option<Arc<dyn ShadowTransport>>,

    /// When non-empty, upstream connections dial this host instead of the
    /// request URL's host, keeping the original name in the TLS SNI.
    pub fake_destination_dns: String,

    pub skip_request_handler: bool,
    pub skip_response_handler: bool,

    /// Bytes on a TLS port that were not TLS: forward opaquely, never
    /// intercept.
    pub is_non_http: bool,

    pub trace: TraceFlags,
    pub trace_info: Option<TraceInfo>,

    /// Emit a HAR entry for this transaction's round-trip.
    pub log_har: bool,
    /// Include bodies in the HAR entry.
    pub capture_content: bool,

    pub user_data: HashMap<String, String>,
    pub user_objects: HashMap<String, Box<dyn Any + Send + Sync>>,

    /// Installed on first upstream use, never replaced afterwards.
    pub(crate) round_tripper: Option<SelectedTransport>,

    pub(crate) cancel: Cancellation,

    pub verbosity: u8,

    /// When the transaction was accepted.
    pub request_time: DateTime<Utc>,
}

impl ProxyCtx {
    /// Log `message` if the proxy verbosity admits `level`.
    pub fn log(&self, level: u8, message: impl AsRef<str>) {
        if level <= self.verbosity {
            debug!(session = self.session, level, "{}", message.as_ref());
        }
    }

    /// The host part of `host:port`.
    pub fn host_name(&self) -> &str {
        self.host.split(':').next().unwrap_or(&self.host)
    }

    /// Whether the round-tripper has been installed yet. Per-request
    /// routing state (fake destination, private-network flag) must be
    /// finalised while this is still false.
    pub fn round_tripper_installed(&self) -> bool {
        self.round_tripper.is_some()
    }

    pub(crate) fn set_cancellation(&mut self, cancel: Cancellation) {
        self.cancel = cancel;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_handle_drop_fires() {
        let (handle, mut cancel) = Cancellation::pair();
        drop(handle);
        tokio::time::timeout(Duration::from_millis(100), cancel.cancelled())
            .await
            .expect("cancellation must fire when the handle drops");
    }

    #[tokio::test]
    async fn never_cancellation_stays_pending() {
        let mut cancel = Cancellation::never();
        let fired = tokio::time::timeout(Duration::from_millis(50), cancel.cancelled())
            .await
            .is_ok();
        assert!(!fired);
    }
}
