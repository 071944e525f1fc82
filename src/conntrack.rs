//! Kernel connection-tracking lookups
//!
//! Non-SNI TLS clients (smart-home devices, notably) give us no hostname
//! to dial, so the original destination is recovered from the kernel's
//! conntrack table: the flow whose original source port matches the
//! client socket tells us where the connection was really headed before
//! it was redirected here.
//!
//! Only `/proc/net/ip_conntrack` line format is understood. Each line is
//! whitespace-delimited; the first occurrence of a `key=value` pair
//! belongs to the original subflow, the second to the reply.

use std::net::IpAddr;
use std::path::Path;

use thiserror::Error;

/// Default kernel table location (Linux).
pub const CONNTRACK_PATH: &str = "/proc/net/ip_conntrack";

#[derive(Debug, Error)]
pub enum ConntrackError {
    #[error("failed to read conntrack table: {0}")]
    Io(#[from] std::io::Error),
}

/// One direction of a tracked flow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subflow {
    pub source: Option<IpAddr>,
    pub destination: Option<IpAddr>,
    pub sport: u16,
    pub dport: u16,
    pub bytes: u64,
    pub packets: u64,
}

/// A tracked connection: protocol, TTL, TCP state, and the two subflows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Flow {
    pub protocol: String,
    pub protocol_number: u8,
    pub ttl: u64,
    pub state: Option<String>,
    pub original: Subflow,
    pub reply: Subflow,
    pub unreplied: bool,
    pub assured: bool,
}

/// Parse the whole table, skipping lines that do not look like flows.
pub fn parse(content: &str) -> Vec<Flow> {
    content.lines().filter_map(parse_line).collect()
}

/// Read and parse the table at `path`.
pub async fn read_flows(path: impl AsRef<Path>) -> Result<Vec<Flow>, ConntrackError> {
    let content = tokio::fs::read_to_string(path).await?;
    Ok(parse(&content))
}

/// The original destination of the first flow whose original source port
/// matches `source_port`.
pub fn original_destination(flows: &[Flow], source_port: u16) -> Option<IpAddr> {
    flows
        .iter()
        .find(|flow| flow.original.sport == source_port)
        .and_then(|flow| flow.original.destination)
}

fn parse_line(line: &str) -> Option<Flow> {
    let mut fields = line.split_whitespace();

    let mut flow = Flow {
        protocol: fields.next()?.to_string(),
        protocol_number: fields.next()?.parse().ok()?,
        ttl: fields.next()?.parse().ok()?,
        ..Flow::default()
    };

    // TCP flows carry a state column before the key=value pairs.
    let mut rest: Vec<&str> = fields.collect();
    if flow.protocol == "tcp" {
        if rest.is_empty() {
            return None;
        }
        flow.state = Some(rest.remove(0).to_string());
    }

    for token in rest {
        match token {
            "[UNREPLIED]" => flow.unreplied = true,
            "[ASSURED]" => flow.assured = true,
            _ => {
                let Some((key, value)) = token.split_once('=') else {
                    continue;
                };
                // First occurrence: original subflow. Second: reply.
                let target = if seen(&flow.original, key) {
                    &mut flow.reply
                } else {
                    &mut flow.original
                };
                match key {
                    "src" => target.source = value.parse().ok(),
                    "dst" => target.destination = value.parse().ok(),
                    "sport" => target.sport = value.parse().unwrap_or(0),
                    "dport" => target.dport = value.parse().unwrap_or(0),
                    "bytes" => target.bytes = value.parse().unwrap_or(0),
                    "packets" => target.packets = value.parse().unwrap_or(0),
                    _ => {}
                }
            }
        }
    }

    Some(flow)
}

/// Whether `key` has already been assigned on the original subflow.
fn seen(original: &Subflow, key: &str) -> bool {
    match key {
        "src" => original.source.is_some(),
        "dst" => original.destination.is_some(),
        "sport" => original.sport != 0,
        "dport" => original.dport != 0,
        "bytes" => original.bytes != 0,
        "packets" => original.packets != 0,
        _ => true,
    }
}
