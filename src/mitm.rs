//! Interception certificate surface
//!
//! The proxy itself never mints certificates; it asks a [`LeafSigner`]
//! for a TLS server configuration matching the SNI host it is about to
//! impersonate. A ready-made [`SigningAuthority`] is provided for
//! embedders that want the batteries included: a CA (loaded from PEM or
//! generated self-signed) signing per-host leaves, with a host cache so
//! repeat connections skip key generation.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum MitmError {
    #[error("failed to load CA material: {0}")]
    CaLoadFailed(String),

    #[error("failed to generate CA certificate: {0}")]
    CaGenerationFailed(String),

    #[error("failed to generate leaf for {host}: {reason}")]
    LeafGenerationFailed { host: String, reason: String },

    #[error("TLS server configuration failed: {0}")]
    ServerConfigFailed(String),
}

/// Produces a client-facing TLS server configuration for an SNI host.
/// Implementations must be safe for concurrent use; the proxy calls this
/// once per intercepted CONNECT.
pub trait LeafSigner: Send + Sync {
    fn server_config(&self, sni: &str) -> Result<Arc<ServerConfig>, MitmError>;
}

/// CA-backed leaf signer with a per-host configuration cache.
pub struct SigningAuthority {
    ca: Certificate,
    ca_cert_der: Vec<u8>,
    cache: RwLock<HashMap<String, Arc<ServerConfig>>>,
}

impl SigningAuthority {
    /// Load an existing CA from PEM-encoded certificate and private key.
    pub fn from_pem(ca_cert_pem: &str, ca_key_pem: &str) -> Result<Self, MitmError> {
        let key_pair =
            KeyPair::from_pem(ca_key_pem).map_err(|e| MitmError::CaLoadFailed(e.to_string()))?;
        let params = CertificateParams::from_ca_cert_pem(ca_cert_pem, key_pair)
            .map_err(|e| MitmError::CaLoadFailed(e.to_string()))?;
        let ca =
            Certificate::from_params(params).map_err(|e| MitmError::CaLoadFailed(e.to_string()))?;

        // Keep the caller's DER bytes: re-serializing a loaded CA re-signs
        // it and would no longer match what clients have installed.
        let ca_cert_der = pem_to_der(ca_cert_pem)?;

        Ok(Self {
            ca,
            ca_cert_der,
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// Generate a fresh self-signed CA, for tests and throwaway setups.
    pub fn self_signed(common_name: &str) -> Result<Self, MitmError> {
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        dn.push(DnType::OrganizationName, "midstream interception CA");
        params.distinguished_name = dn;

        params.not_before = rcgen::date_time_ymd(2024, 1, 1);
        params.not_after = rcgen::date_time_ymd(2034, 1, 1);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let ca = Certificate::from_params(params)
            .map_err(|e| MitmError::CaGenerationFailed(e.to_string()))?;
        let ca_cert_der = ca
            .serialize_der()
            .map_err(|e| MitmError::CaGenerationFailed(e.to_string()))?;

        Ok(Self {
            ca,
            ca_cert_der,
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// DER bytes of the CA certificate, for installation in client trust
    /// stores.
    pub fn ca_certificate_der(&self) -> &[u8] {
        &self.ca_cert_der
    }

    /// Number of cached per-host configurations.
    pub fn cached_hosts(&self) -> usize {
        self.cache.read().expect("cert cache poisoned").len()
    }

    fn generate(&self, host: &str) -> Result<Arc<ServerConfig>, MitmError> {
        let mut params = CertificateParams::default();

        let san = match host.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(host.to_string()),
        };
        params.subject_alt_names = vec![san];

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;

        params.not_before = rcgen::date_time_ymd(2024, 1, 1);
        params.not_after = rcgen::date_time_ymd(2034, 1, 1);

        let leaf = Certificate::from_params(params).map_err(|e| {
            MitmError::LeafGenerationFailed {
                host: host.to_string(),
                reason: e.to_string(),
            }
        })?;

        let leaf_der =
            leaf.serialize_der_with_signer(&self.ca)
                .map_err(|e| MitmError::LeafGenerationFailed {
                    host: host.to_string(),
                    reason: e.to_string(),
                })?;
        let key_der = leaf.serialize_private_key_der();

        let chain = vec![
            CertificateDer::from(leaf_der),
            CertificateDer::from(self.ca_cert_der.clone()),
        ];
        let key = PrivateKeyDer::Pkcs8(key_der.into());

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|e| MitmError::ServerConfigFailed(e.to_string()))?;
        // HTTP/2 origins are out of scope; pin the inner protocol.
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        debug!(host, "generated interception leaf");
        Ok(Arc::new(config))
    }
}

impl LeafSigner for SigningAuthority {
    fn server_config(&self, sni: &str) -> Result<Arc<ServerConfig>, MitmError> {
        if let Some(config) = self.cache.read().expect("cert cache poisoned").get(sni) {
            return Ok(Arc::clone(config));
        }

        let config = self.generate(sni)?;
        self.cache
            .write()
            .expect("cert cache poisoned")
            .insert(sni.to_string(), Arc::clone(&config));
        Ok(config)
    }
}

fn pem_to_der(pem: &str) -> Result<Vec<u8>, MitmError> {
    let mut reader = std::io::BufReader::new(pem.as_bytes());
    for item in rustls_pemfile::certs(&mut reader) {
        let cert = item.map_err(|e| MitmError::CaLoadFailed(e.to_string()))?;
        return Ok(cert.to_vec());
    }
    Err(MitmError::CaLoadFailed(
        "no certificate found in PEM input".to_string(),
    ))
}
