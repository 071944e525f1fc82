//! Client TLS capability fingerprints
//!
//! A stable identifier for a client's advertised TLS capability set, used
//! to bucket clients whose handshakes fail against the interception CA so
//! operators can allow-list them as a group. The fingerprint deliberately
//! ignores GREASE noise; it is advisory only and must never feed a
//! security decision.

use md5::{Digest, Md5};

use crate::sniff::ClientHello;

/// GREASE values injected by BoringSSL-derived clients
/// (draft-davidben-tls-grease). Present in semi-random positions, so they
/// are stripped before fingerprinting.
pub const GREASE: [u16; 16] = [
    2570, 6682, 10794, 14906, 19018, 23130, 27242, 31354, 35466, 39578, 43690, 47802, 51914,
    56026, 60138, 64250,
];

pub fn is_grease(value: u16) -> bool {
    GREASE.contains(&value)
}

/// The readable form of the fingerprint: version, cipher suites, curves,
/// point formats and compression methods (each group in wire order,
/// decimal, GREASE stripped), then the OCSP / session-ticket / NPN flags.
pub fn signature_string(hello: &ClientHello) -> String {
    let mut out = hello.version.to_string();
    out.push('-');

    for suite in &hello.cipher_suites {
        if !is_grease(*suite) {
            out.push_str(&suite.to_string());
        }
    }
    out.push('-');

    for curve in &hello.supported_curves {
        if !is_grease(*curve) {
            out.push_str(&curve.to_string());
        }
    }
    out.push('-');

    for point in &hello.supported_points {
        out.push_str(&point.to_string());
    }
    out.push('-');

    for comp in &hello.compression_methods {
        out.push_str(&comp.to_string());
    }

    out.push_str(if hello.ocsp_stapling { "-S1" } else { "-S0" });
    out.push_str(if hello.ticket_supported { "-T1" } else { "-T0" });
    out.push_str(if hello.next_proto_neg { "-N1" } else { "-N0" });
    out
}

/// 32-hex-char fingerprint: lowercase-hex MD5 of [`signature_string`].
/// Two observationally-identical ClientHellos hash identically.
pub fn signature(hello: &ClientHello) -> String {
    let mut hasher = Md5::new();
    hasher.update(signature_string(hello).as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(32);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Compress a free-form signature label (typically a user-agent string)
/// into a short filesystem-safe token: lowercased, non-alphanumeric runs
/// collapsed to dashes, truncated to the first five tokens.
pub fn sanitize_signature(raw: &str) -> String {
    raw.to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .take(5)
        .collect::<Vec<_>>()
        .join("-")
}
