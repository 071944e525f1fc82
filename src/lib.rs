//! Midstream - Intercepting HTTP/HTTPS Forward Proxy
//!
//! Midstream is a forward proxy that terminates client connections,
//! optionally man-in-the-middles TLS traffic with a locally-minted
//! certificate authority, and dispatches every request through pluggable
//! handler pipelines before forwarding it over one of several transports.
//!
//! ## Features
//!
//! - **Transparent TLS acceptor**: sniffs the ClientHello off raw TCP,
//!   recovers non-SNI destinations from the kernel conntrack table, and
//!   fingerprints each client's TLS capability set
//! - **Handler pipelines**: ordered connect/request/response/done chains
//!   whose verdicts decide between tunneling, interception, rewriting and
//!   rejection
//! - **Pluggable transports**: default direct transport, per-request
//!   shadow-network routing with fallback, and fake-destination dialing
//!   with pinned SNI
//! - **Trace replay**: mirrors selected requests through an unfiltered
//!   second pass for side-by-side comparison
//! - **HAR capture**: bounded channel of request/response records for an
//!   external consumer
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use midstream::{Proxy, ProxyConfig, SigningAuthority, Verdict};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut proxy = Proxy::new(ProxyConfig::default());
//!     proxy.set_leaf_signer(Arc::new(SigningAuthority::self_signed("midstream ca")?));
//!     proxy.handle_connect(|_ctx: &mut midstream::ProxyCtx| Verdict::Mitm);
//!
//!     Arc::new(proxy).listen_http("127.0.0.1:8080").await
//! }
//! ```
//!
//! ## Architecture
//!
//! Midstream is a library meant to be embedded in larger applications:
//!
//! - `server` - acceptors and dispatch (HTTP proxy + transparent TLS)
//! - `pipeline` - handler chains and verdicts
//! - `roundtrip` / `transport` - transport selection and the upstream leg
//! - `sniff` / `signature` - ClientHello peeking and fingerprinting
//! - `conntrack` - original-destination recovery for non-SNI clients
//! - `plumb` / `impatient` - deadline-driven byte pumping for tunnels
//! - `trace` - unmodified mirror passes

// Connection plumbing
pub mod impatient;
pub mod plumb;

// TLS sniffing and fingerprinting
pub mod signature;
pub mod sniff;

// Non-SNI destination recovery
pub mod conntrack;

// Core proxy
pub mod config;
pub mod context;
pub mod pipeline;
pub mod roundtrip;
pub mod server;

// Transports
pub mod shadow;
pub mod transport;

// Interception certificates
pub mod mitm;

// Capture and replay
pub mod har;
pub mod responses;
mod trace;

// Re-export commonly used types

/// Configuration
pub use config::{ProxyConfig, TransportConfig};

/// Core proxy types
pub use context::{ProxyCtx, TraceFlags, TraceInfo};
pub use pipeline::{Chain, Handler, Rejection, Verdict};
pub use server::{AcceptError, HttpOverrideHook, Proxy, TlsFailureHook, TraceHook};

/// Plumbing
pub use impatient::ImpatientStream;
pub use plumb::{fit, fit_with, CopyEnd, FitOptions, FitOutcome};

/// Sniffing and fingerprinting
pub use signature::{sanitize_signature, signature, signature_string};
pub use sniff::{ClientHello, PrefixedStream, SniffedTls};

/// Conntrack
pub use conntrack::{Flow, Subflow};

/// Transports
pub use roundtrip::{RoundTripError, SelectedTransport};
pub use shadow::{ShadowNetwork, ShadowOutcome, ShadowTransport, SHADOW_TRANSPORT_KEY};
pub use transport::{Transport, TransportError};

/// Interception certificates
pub use mitm::{LeafSigner, MitmError, SigningAuthority};

/// Capture
pub use har::{CapturedRequest, CapturedResponse, HarEntry, HarReceiver};
pub use responses::synthesize;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
