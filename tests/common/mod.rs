//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Encode a minimal well-formed ClientHello record.
#[allow(clippy::too_many_arguments)]
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
    hs.push(0);
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

/// Spawn a plain-HTTP upstream that answers every request on a
/// connection with the same canned response, then closes.
pub async fn spawn_http_upstream(response: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                loop {
                    let mut buf = [0u8; 8192];
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(_) => {
                            if stream.write_all(response).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// Spawn a TCP upstream that echoes whatever it receives.
pub async fn spawn_echo_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 8192];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// Spawn a TLS upstream with a throwaway self-signed certificate that
/// answers every request with the canned response.
pub async fn spawn_tls_upstream(response: &'static [u8]) -> SocketAddr {
    use rustls::pki_types::{CertificateDer, PrivateKeyDer};

    let cert = rcgen::generate_simple_self_signed(vec!["127.0.0.1".to_string()]).unwrap();
    let cert_der = cert.serialize_der().unwrap();
    let key_der = cert.serialize_private_key_der();

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(
            vec![CertificateDer::from(cert_der)],
            PrivateKeyDer::Pkcs8(key_der.into()),
        )
        .unwrap();
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(mut tls) = acceptor.accept(stream).await else {
                    return;
                };
                loop {
                    let mut buf = [0u8; 8192];
                    match tls.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(_) => {
                            if tls.write_all(response).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// Read a full HTTP/1.1 response (Content-Length framed) off a stream.
pub async fn read_http_response<S>(stream: &mut S) -> (u16, Vec<(String, String)>, Vec<u8>)
where
    S: AsyncReadExt + Unpin,
{
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    let header_end = loop {
        if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed before response head completed");
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8(buf[..header_end].to_vec()).unwrap();
    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap();
    let status: u16 = status_line.split_whitespace().nth(1).unwrap().parse().unwrap();

    let mut headers = Vec::new();
    let mut content_length = 0usize;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim().to_ascii_lowercase();
            let value = value.trim().to_string();
            if name == "content-length" {
                content_length = value.parse().unwrap();
            }
            headers.push((name, value));
        }
    }

    let mut body = buf[header_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed before body completed");
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    (status, headers, body)
}

pub fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
