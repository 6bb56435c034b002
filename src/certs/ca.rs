use super::{certified_key, parse_chain, self_signed, CertificateManager, ClientHelloInfo, FALLBACK_NAME};
use crate::backend::{Backend, CertificateAuthority};
use crate::error::CertError;
use async_trait::async_trait;
use chrono::{Datelike, Duration, Utc};
use dashmap::DashMap;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair, KeyUsagePurpose,
    PKCS_ECDSA_P256_SHA256,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, warn};

const LEAF_VALIDITY_DAYS: i64 = 365;

/// Leaf certificates signed by the cluster CA, minted once per hostname
///
/// Entries never expire. A rotated CA only takes effect after a restart.
pub struct CaCertificates {
    backend: Arc<dyn Backend>,
    fallback: Arc<CertifiedKey>,
    certs: DashMap<String, Arc<OnceCell<Arc<CertifiedKey>>>>,
    issued: AtomicU64,
}

impl CaCertificates {
    pub fn new(backend: Arc<dyn Backend>) -> Result<Self, CertError> {
        Ok(Self {
            backend,
            fallback: self_signed(vec![FALLBACK_NAME.to_string()])?,
            certs: DashMap::new(),
            issued: AtomicU64::new(0),
        })
    }

    /// Number of leaves signed since startup
    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }

    async fn issue(&self, host: &str) -> Result<Arc<CertifiedKey>, CertError> {
        let ca = self
            .backend
            .ca()
            .await
            .map_err(|e| CertError::Authority(format!("{:#}", e)))?;

        let key = sign_leaf(&ca, host)?;
        self.issued.fetch_add(1, Ordering::Relaxed);
        info!(host, "Issued certificate from cluster CA");
        Ok(key)
    }
}

#[async_trait]
impl CertificateManager for CaCertificates {
    async fn certificate(&self, hello: &ClientHelloInfo) -> Result<Arc<CertifiedKey>, CertError> {
        let Some(host) = hello.host() else {
            return Ok(self.fallback.clone());
        };

        // Concurrent handshakes for one host share a single signing call;
        // a failed attempt leaves the cell empty for the next handshake
        let cell = self.certs.entry(host.clone()).or_default().clone();
        let key = cell
            .get_or_try_init(|| self.issue(&host))
            .await
            .inspect_err(|e| warn!(host = %host, error = %e, "Certificate issuance failed"))?;

        Ok(key.clone())
    }
}

/// Mint a leaf for `host` signed by `ca`; the chain carries the CA certificate as given
fn sign_leaf(ca: &CertificateAuthority, host: &str) -> Result<Arc<CertifiedKey>, CertError> {
    let ca_key = KeyPair::from_pem(&ca.key_pem).map_err(|e| CertError::Authority(format!("invalid CA key: {}", e)))?;
    let ca_params = CertificateParams::from_ca_cert_pem(&ca.cert_pem)
        .map_err(|e| CertError::Authority(format!("invalid CA certificate: {}", e)))?;
    let ca_cert = ca_params.self_signed(&ca_key)?;

    let mut params = CertificateParams::new(vec![host.to_string()])?;
    params.distinguished_name = DistinguishedName::new();
    params.distinguished_name.push(DnType::CommonName, host);
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let not_before = Utc::now() - Duration::days(1);
    let not_after = Utc::now() + Duration::days(LEAF_VALIDITY_DAYS);
    params.not_before = rcgen::date_time_ymd(not_before.year(), not_before.month() as u8, not_before.day() as u8);
    params.not_after = rcgen::date_time_ymd(not_after.year(), not_after.month() as u8, not_after.day() as u8);

    let leaf_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
    let leaf = params.signed_by(&leaf_key, &ca_cert, &ca_key)?;

    let mut chain = vec![CertificateDer::from(leaf.der().to_vec())];
    chain.extend(parse_chain(ca.cert_pem.as_bytes()));

    let key = PrivateKeyDer::try_from(leaf_key.serialize_der()).map_err(|e| CertError::Key(e.to_string()))?;
    certified_key(chain, &key)
}
