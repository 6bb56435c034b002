//! Per-SNI certificate selection for the HTTPS listener
//!
//! Two managers exist: [`CaCertificates`] mints leaves signed by the cluster
//! CA, [`AutocertManager`] obtains publicly trusted certificates over ACME.
//! Both answer SNI-less handshakes with a self-signed fallback.

mod acme;
mod ca;
mod flight;

pub use acme::{AutocertManager, Http01Challenges};
pub use ca::CaCertificates;

use crate::error::CertError;
use async_trait::async_trait;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::io::BufReader;
use std::sync::Arc;
use tracing::{debug, error};

pub const ACME_TLS_ALPN_NAME: &[u8] = b"acme-tls/1";

/// Common name on the certificate served to handshakes without SNI
pub const FALLBACK_NAME: &str = "idlegate.invalid";

/// The parts of a ClientHello that certificate selection depends on
#[derive(Debug, Clone, Default)]
pub struct ClientHelloInfo {
    pub server_name: Option<String>,
    pub alpn: Vec<Vec<u8>>,
}

impl ClientHelloInfo {
    pub fn new(server_name: Option<&str>) -> Self {
        Self {
            server_name: server_name.map(str::to_string),
            alpn: Vec::new(),
        }
    }

    pub fn from_hello(hello: &ClientHello<'_>) -> Self {
        Self {
            server_name: hello.server_name().map(str::to_string),
            alpn: hello
                .alpn()
                .map(|protocols| protocols.map(<[u8]>::to_vec).collect())
                .unwrap_or_default(),
        }
    }

    /// Lowercased SNI with any trailing dot removed, or `None` when absent
    pub fn host(&self) -> Option<String> {
        self.server_name
            .as_deref()
            .map(|s| s.trim_end_matches('.').to_ascii_lowercase())
            .filter(|s| !s.is_empty())
    }

    pub fn is_acme_challenge(&self) -> bool {
        self.alpn.iter().any(|p| p == ACME_TLS_ALPN_NAME)
    }
}

#[async_trait]
pub trait CertificateManager: Send + Sync {
    /// Certificate for one handshake; an error rejects only that connection
    async fn certificate(&self, hello: &ClientHelloInfo) -> Result<Arc<CertifiedKey>, CertError>;
}

/// Build a per-connection server config around an already chosen certificate
pub fn server_config(key: Arc<CertifiedKey>, hello: &ClientHelloInfo) -> Result<Arc<ServerConfig>, CertError> {
    let mut config = ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(FixedCert(key)));

    config.alpn_protocols = if hello.is_acme_challenge() {
        vec![ACME_TLS_ALPN_NAME.to_vec()]
    } else {
        vec![b"h2".to_vec(), b"http/1.1".to_vec()]
    };

    Ok(Arc::new(config))
}

#[derive(Debug)]
struct FixedCert(Arc<CertifiedKey>);

impl ResolvesServerCert for FixedCert {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

/// Self-signed certificate for `names`
pub fn self_signed(names: Vec<String>) -> Result<Arc<CertifiedKey>, CertError> {
    let mut params = CertificateParams::new(names.clone())?;
    params.distinguished_name = DistinguishedName::new();
    if let Some(first) = names.first() {
        params.distinguished_name.push(DnType::CommonName, first.clone());
    }

    let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
    let cert = params.self_signed(&key_pair)?;

    let key = PrivateKeyDer::try_from(key_pair.serialize_der()).map_err(|e| CertError::Key(e.to_string()))?;
    certified_key(vec![CertificateDer::from(cert.der().to_vec())], &key)
}

pub fn certified_key(
    chain: Vec<CertificateDer<'static>>,
    key: &PrivateKeyDer<'_>,
) -> Result<Arc<CertifiedKey>, CertError> {
    let signing_key = rustls::crypto::ring::sign::any_supported_type(key)?;
    Ok(Arc::new(CertifiedKey::new(chain, signing_key)))
}

pub fn parse_chain(pem: &[u8]) -> Vec<CertificateDer<'static>> {
    rustls_pemfile::certs(&mut BufReader::new(pem))
        .filter_map(|c| c.ok())
        .collect()
}

pub fn load_private_key(data: &[u8]) -> Option<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(data);

    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(rustls_pemfile::Item::Pkcs1Key(key))) => return Some(key.into()),
            Ok(Some(rustls_pemfile::Item::Pkcs8Key(key))) => return Some(key.into()),
            Ok(Some(rustls_pemfile::Item::Sec1Key(key))) => return Some(key.into()),
            Ok(None) => return None,
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

/// Whether the leaf remains valid for at least `days` more days
pub fn is_cert_valid_for_days(cert: &CertificateDer<'_>, days: u64) -> bool {
    use x509_parser::prelude::*;

    let (_, parsed) = match X509Certificate::from_der(cert.as_ref()) {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "Failed to parse X.509 certificate");
            return false;
        }
    };

    let expiry = parsed.validity().not_after.timestamp();
    let remaining_secs = expiry - chrono::Utc::now().timestamp();
    if remaining_secs < 0 {
        return false;
    }

    let remaining_days = remaining_secs as u64 / (24 * 60 * 60);
    debug!(remaining_days, required_days = days, "Certificate validity check");
    remaining_days >= days
}
