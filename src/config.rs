//! Proxy configuration
//!
//! Process-wide settings, immutable once the proxy is built. Everything
//! here is library-level: no environment variables, no CLI surface.

use std::path::PathBuf;
use std::time::Duration;

use crate::conntrack::CONNTRACK_PATH;

/// Timeouts and limits for the default upstream transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// TCP connect budget per dial attempt.
    pub connect_timeout: Duration,

    /// Upstream TLS handshake budget.
    pub tls_handshake_timeout: Duration,

    /// Time allowed for the upstream response head to arrive.
    pub response_header_timeout: Duration,

    /// How long to wait for `100 Continue` before sending the body anyway.
    pub expect_continue_timeout: Duration,

    /// Per-read budget while draining response bodies, and the age at
    /// which pooled idle connections are discarded.
    pub idle_timeout: Duration,

    /// Maximum idle connections kept per upstream authority.
    pub max_idle_per_host: usize,

    /// Capacity of the TLS session-ticket cache. Kept small so tickets
    /// rotate out quickly.
    pub session_cache_capacity: usize,

    /// Upper bound on a fully-buffered response body.
    pub max_body_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            tls_handshake_timeout: Duration::from_secs(10),
            response_header_timeout: Duration::from_secs(30),
            expect_continue_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            max_idle_per_host: 20,
            session_cache_capacity: 25,
            max_body_size: 100 * 1024 * 1024,
        }
    }
}

/// Proxy-wide configuration.
///
/// Verbosity levels, for handlers that want graded logging:
/// 0 startup and service messages only, 1 serious errors, 2 blocked
/// traffic, 3 allowed traffic, 4 listing decisions, 5 image files,
/// 6 warnings, 7 partial content, 8 element hiding, 9 statistics.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub verbosity: u8,
    pub transport: TransportConfig,

    /// Delay before an unmodified-trace mirror pass runs, giving the
    /// primary request time to settle.
    pub trace_settle_delay: Duration,

    /// Kernel conntrack table consulted for non-SNI clients.
    pub conntrack_path: PathBuf,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            verbosity: 0,
            transport: TransportConfig::default(),
            trace_settle_delay: Duration::from_secs(10),
            conntrack_path: PathBuf::from(CONNTRACK_PATH),
        }
    }
}

impl ProxyConfig {
    pub fn verbosity(mut self, level: u8) -> Self {
        self.verbosity = level.min(9);
        self
    }

    pub fn transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn trace_settle_delay(mut self, delay: Duration) -> Self {
        self.trace_settle_delay = delay;
        self
    }

    pub fn conntrack_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.conntrack_path = path.into();
        self
    }
}
