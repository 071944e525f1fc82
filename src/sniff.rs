//! TLS ClientHello sniffing
//!
//! Peeks the first TLS record off a freshly-accepted connection, parses
//! the ClientHello (SNI, cipher suites, curves, point formats, compression
//! methods, and the extension flags the fingerprint cares about), and
//! hands back a stream that still replays the peeked bytes to whatever
//! consumes it next, typically a TLS acceptor completing the handshake.
//!
//! Non-TLS bytes on a TLS port are not an error here: the summary is
//! simply absent and the caller forwards the connection opaquely.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// TLS record content type for handshake messages.
const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
/// Handshake message type for ClientHello.
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
/// Largest TLS plaintext record payload (RFC 8446 §5.1).
const MAX_RECORD_LEN: usize = 16384;

const EXT_SERVER_NAME: u16 = 0;
const EXT_STATUS_REQUEST: u16 = 5;
const EXT_SUPPORTED_GROUPS: u16 = 10;
const EXT_EC_POINT_FORMATS: u16 = 11;
const EXT_SESSION_TICKET: u16 = 35;
const EXT_NEXT_PROTO_NEG: u16 = 13172;

#[derive(Debug, Error)]
pub enum SniffError {
    #[error("truncated ClientHello at {0}")]
    Truncated(&'static str),

    #[error("not a handshake record (content type 0x{0:02x})")]
    NotHandshake(u8),

    #[error("not a ClientHello (handshake type 0x{0:02x})")]
    NotClientHello(u8),

    #[error("implausible record length {0}")]
    BadRecordLength(usize),
}

/// The parsed capability set of a ClientHello, in wire order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientHello {
    pub version: u16,
    pub cipher_suites: Vec<u16>,
    pub supported_curves: Vec<u16>,
    pub supported_points: Vec<u8>,
    pub compression_methods: Vec<u8>,
    pub server_name: Option<String>,
    pub ocsp_stapling: bool,
    pub ticket_supported: bool,
    pub next_proto_neg: bool,
}

/// A stream that yields a fixed prefix before reading from the inner
/// stream. Writes go straight through.
pub struct PrefixedStream<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }

    /// Bytes not yet replayed.
    pub fn remaining_prefix(&self) -> &[u8] {
        &self.prefix
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        if !me.prefix.is_empty() {
            let n = me.prefix.len().min(buf.remaining());
            buf.put_slice(&me.prefix[..n]);
            me.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut me.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// A sniffed connection: the replayable stream plus the ClientHello
/// summary, absent when the first bytes were not TLS.
pub struct SniffedTls<S> {
    pub stream: PrefixedStream<S>,
    pub hello: Option<ClientHello>,
}

impl<S> SniffedTls<S> {
    /// The SNI host, or the empty string when the ClientHello carried
    /// none (or the bytes were not TLS at all).
    pub fn host(&self) -> &str {
        self.hello
            .as_ref()
            .and_then(|h| h.server_name.as_deref())
            .unwrap_or("")
    }

    pub fn is_tls(&self) -> bool {
        self.hello.is_some()
    }

    pub fn into_stream(self) -> PrefixedStream<S> {
        self.stream
    }
}

/// Peek the ClientHello off `stream`. I/O errors propagate; malformed or
/// non-TLS bytes yield `hello: None` with everything read so far intact
/// in the prefix.
pub async fn sniff<S>(mut stream: S) -> io::Result<SniffedTls<S>>
where
    S: AsyncRead + Unpin,
{
    let mut peeked = BytesMut::with_capacity(1024);

    // Record header: content type (1), version (2), length (2).
    if let Err(e) = read_at_least(&mut stream, &mut peeked, 5).await {
        return downgrade(stream, peeked, e);
    }
    if peeked[0] != CONTENT_TYPE_HANDSHAKE {
        return Ok(SniffedTls {
            stream: PrefixedStream::new(peeked.freeze(), stream),
            hello: None,
        });
    }
    let record_len = u16::from_be_bytes([peeked[3], peeked[4]]) as usize;
    if record_len == 0 || record_len > MAX_RECORD_LEN {
        return Ok(SniffedTls {
            stream: PrefixedStream::new(peeked.freeze(), stream),
            hello: None,
        });
    }

    if let Err(e) = read_at_least(&mut stream, &mut peeked, 5 + record_len).await {
        return downgrade(stream, peeked, e);
    }

    let hello = parse_client_hello(&peeked[..5 + record_len]).ok();
    Ok(SniffedTls {
        stream: PrefixedStream::new(peeked.freeze(), stream),
        hello,
    })
}

/// EOF mid-peek is a downgrade (short prefix replayed as-is), any other
/// I/O error propagates.
fn downgrade<S>(stream: S, peeked: BytesMut, err: io::Error) -> io::Result<SniffedTls<S>> {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        Ok(SniffedTls {
            stream: PrefixedStream::new(peeked.freeze(), stream),
            hello: None,
        })
    } else {
        Err(err)
    }
}

async fn read_at_least<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut BytesMut,
    target: usize,
) -> io::Result<()> {
    while buf.len() < target {
        let n = stream.read_buf(buf).await?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
    }
    Ok(())
}

/// Parse a ClientHello from a complete handshake record (starting at the
/// record header).
pub fn parse_client_hello(data: &[u8]) -> Result<ClientHello, SniffError> {
    if data.len() < 6 {
        return Err(SniffError::Truncated("record header"));
    }
    if data[0] != CONTENT_TYPE_HANDSHAKE {
        return Err(SniffError::NotHandshake(data[0]));
    }
    if data[5] != HANDSHAKE_CLIENT_HELLO {
        return Err(SniffError::NotClientHello(data[5]));
    }

    let mut hello = ClientHello::default();
    // Skip record header (5) + handshake type (1) + handshake length (3).
    let mut pos = 9usize;

    let take_u16 = |data: &[u8], pos: usize| -> Option<u16> {
        data.get(pos..pos + 2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
    };

    hello.version = take_u16(data, pos).ok_or(SniffError::Truncated("version"))?;
    pos += 2;

    // Random.
    pos += 32;

    // Session id.
    let session_len = *data.get(pos).ok_or(SniffError::Truncated("session id"))? as usize;
    pos += 1 + session_len;

    // Cipher suites.
    let suites_len = take_u16(data, pos).ok_or(SniffError::Truncated("cipher suites"))? as usize;
    pos += 2;
    let suites_end = pos + suites_len;
    if suites_end > data.len() {
        return Err(SniffError::Truncated("cipher suites"));
    }
    while pos + 1 < suites_end {
        hello
            .cipher_suites
            .push(u16::from_be_bytes([data[pos], data[pos + 1]]));
        pos += 2;
    }
    pos = suites_end;

    // Compression methods.
    let comp_len = *data.get(pos).ok_or(SniffError::Truncated("compression"))? as usize;
    pos += 1;
    let comp_end = pos + comp_len;
    if comp_end > data.len() {
        return Err(SniffError::Truncated("compression"));
    }
    hello.compression_methods.extend_from_slice(&data[pos..comp_end]);
    pos = comp_end;

    // Extensions are optional (SSLv3-era hellos stop here).
    let Some(ext_total) = take_u16(data, pos) else {
        return Ok(hello);
    };
    pos += 2;
    let ext_end = (pos + ext_total as usize).min(data.len());

    while pos + 4 <= ext_end {
        let ext_type = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let ext_len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        pos += 4;
        let ext_data_end = pos + ext_len;
        if ext_data_end > data.len() {
            return Err(SniffError::Truncated("extension"));
        }
        let body = &data[pos..ext_data_end];

        match ext_type {
            EXT_SERVER_NAME => hello.server_name = parse_sni(body),
            EXT_STATUS_REQUEST => hello.ocsp_stapling = true,
            EXT_SESSION_TICKET => hello.ticket_supported = true,
            EXT_NEXT_PROTO_NEG => hello.next_proto_neg = true,
            EXT_SUPPORTED_GROUPS => {
                if body.len() >= 2 {
                    let list_len = u16::from_be_bytes([body[0], body[1]]) as usize;
                    let list = &body[2..(2 + list_len).min(body.len())];
                    for pair in list.chunks_exact(2) {
                        hello
                            .supported_curves
                            .push(u16::from_be_bytes([pair[0], pair[1]]));
                    }
                }
            }
            EXT_EC_POINT_FORMATS => {
                if !body.is_empty() {
                    let list_len = body[0] as usize;
                    hello
                        .supported_points
                        .extend_from_slice(&body[1..(1 + list_len).min(body.len())]);
                }
            }
            _ => {}
        }

        pos = ext_data_end;
    }

    Ok(hello)
}

/// Extract the first `host_name` entry from a server_name extension body.
fn parse_sni(body: &[u8]) -> Option<String> {
    if body.len() < 2 {
        return None;
    }
    let list_len = u16::from_be_bytes([body[0], body[1]]) as usize;
    let mut pos = 2usize;
    let end = (2 + list_len).min(body.len());
    while pos + 3 <= end {
        let name_type = body[pos];
        let name_len = u16::from_be_bytes([body[pos + 1], body[pos + 2]]) as usize;
        pos += 3;
        if pos + name_len > body.len() {
            return None;
        }
        if name_type == 0 {
            return std::str::from_utf8(&body[pos..pos + name_len])
                .ok()
                .map(str::to_owned);
        }
        pos += name_len;
    }
    None
}

#[cfg(test)]
pub(crate) mod test_support {
    /// Encode a minimal but well-formed ClientHello record for tests.
    pub fn encode_client_hello(
        version: u16,
        suites: &[u16],
        curves: &[u16],
        points: &[u8],
        comps: &[u8],
        sni: Option<&str>,
        ocsp: bool,
        tickets: bool,
        npn: bool,
    ) -> Vec<u8> {
        let mut exts = Vec::new();

        if let Some(name) = sni {
            let mut body = Vec::new();
            body.extend_from_slice(&(name.len() as u16 + 3).to_be_bytes());
            body.push(0);
            body.extend_from_slice(&(name.len() as u16).to_be_bytes());
            body.extend_from_slice(name.as_bytes());
            push_ext(&mut exts, 0, &body);
        }
        if ocsp {
            push_ext(&mut exts, 5, &[]);
        }
        if tickets {
            push_ext(&mut exts, 35, &[]);
        }
        if npn {
            push_ext(&mut exts, 13172, &[]);
        }
        {
            let mut body = Vec::new();
            body.extend_from_slice(&((curves.len() * 2) as u16).to_be_bytes());
            for c in curves {
                body.extend_from_slice(&c.to_be_bytes());
            }
            push_ext(&mut exts, 10, &body);
        }
        {
            let mut body = vec![points.len() as u8];
            body.extend_from_slice(points);
            push_ext(&mut exts, 11, &body);
        }

        let mut hs = Vec::new();
        hs.extend_from_slice(&version.to_be_bytes());
        hs.extend_from_slice(&[0u8; 32]);
        hs.push(0); // empty session id
        hs.extend_from_slice(&((suites.len() * 2) as u16).to_be_bytes());
        for s in suites {
            hs.extend_from_slice(&s.to_be_bytes());
        }
        hs.push(comps.len() as u8);
        hs.extend_from_slice(comps);
        hs.extend_from_slice(&(exts.len() as u16).to_be_bytes());
        hs.extend_from_slice(&exts);

        let mut record = vec![0x16, 0x03, 0x01];
        record.extend_from_slice(&((hs.len() + 4) as u16).to_be_bytes());
        record.push(0x01);
        record.extend_from_slice(&((hs.len() as u32).to_be_bytes())[1..]);
        record.extend_from_slice(&hs);
        record
    }

    fn push_ext(out: &mut Vec<u8>, ext_type: u16, body: &[u8]) {
        out.extend_from_slice(&ext_type.to_be_bytes());
        out.extend_from_slice(&(body.len() as u16).to_be_bytes());
        out.extend_from_slice(body);
    }
}
