//! On-demand ACME certificates, one per registered hostname
//!
//! A hostname is only ever sent to the ACME server when the routing table has
//! targets for it. Account credentials and issued certificates live in the
//! pluggable [`Cache`], so every router sharing a cache shares one account.
//!
//! Supported challenges:
//! - HTTP-01 (token served by the plain HTTP listener at /.well-known/acme-challenge/)
//! - TLS-ALPN-01 (challenge certificate served to `acme-tls/1` handshakes)

use super::flight::{Flight, Flights};
use super::{
    certified_key, is_cert_valid_for_days, load_private_key, parse_chain, self_signed, CertificateManager,
    ClientHelloInfo, FALLBACK_NAME,
};
use crate::cache::Cache;
use crate::config::{AcmeChallengeType, AcmeConfig};
use crate::error::{CacheError, CertError};
use crate::storage::Storage;
use async_trait::async_trait;
use dashmap::DashMap;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, KeyAuthorization, LetsEncrypt,
    NewAccount, NewOrder, Order, OrderStatus,
};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, OnceCell};
use tracing::{debug, error, info, warn};

const ACME_ALPN_OID: &[u64] = &[1, 3, 6, 1, 5, 5, 7, 1, 31];
const ACCOUNT_CACHE_KEY: &str = "acme_account+key";
const POLL_INTERVAL: Duration = Duration::from_secs(2);
const MAX_POLL_ATTEMPTS: u32 = 30;
const RENEWAL_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);
/// After a failed issuance, handshakes for the host do not start another for this long
const RETRY_BACKOFF: Duration = Duration::from_secs(5 * 60);

/// Pending ACME challenges for HTTP-01 validation
#[derive(Clone, Default)]
pub struct Http01Challenges {
    inner: Arc<DashMap<String, String>>,
}

impl Http01Challenges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, token: String, key_authorization: String) {
        self.inner.insert(token, key_authorization);
    }

    pub fn get(&self, token: &str) -> Option<String> {
        self.inner.get(token).map(|v| v.value().clone())
    }

    pub fn remove(&self, token: &str) {
        self.inner.remove(token);
    }
}

/// A challenge answer published while one authorization is validated
///
/// Withdrawn on drop, so an attempt that errors out or is cancelled never
/// leaves a stale token behind.
struct PublishedChallenge<'a> {
    state: &'a AcmeState,
    token: Option<String>,
    alpn_domain: Option<String>,
}

impl Drop for PublishedChallenge<'_> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.state.http01_challenges.remove(&token);
        }
        if let Some(domain) = self.alpn_domain.take() {
            self.state.alpn_challenges.remove(&domain);
        }
    }
}

#[derive(Clone)]
struct Issued {
    key: Arc<CertifiedKey>,
}

impl Issued {
    fn leaf(&self) -> Option<&CertificateDer<'static>> {
        self.key.cert.first()
    }

    fn valid_for_days(&self, days: u64) -> bool {
        self.leaf().is_some_and(|c| is_cert_valid_for_days(c, days))
    }
}

pub struct AutocertManager {
    state: Arc<AcmeState>,
    issuing: Flights<Arc<CertifiedKey>>,
    fallback: Arc<CertifiedKey>,
}

struct AcmeState {
    config: AcmeConfig,
    storage: Arc<dyn Storage>,
    cache: Arc<dyn Cache>,
    account: OnceCell<Account>,
    certs: DashMap<String, Issued>,
    failures: DashMap<String, Instant>,
    http01_challenges: Http01Challenges,
    alpn_challenges: DashMap<String, Arc<CertifiedKey>>,
}

impl AutocertManager {
    pub fn new(config: AcmeConfig, storage: Arc<dyn Storage>, cache: Arc<dyn Cache>) -> Result<Self, CertError> {
        Ok(Self {
            state: Arc::new(AcmeState {
                config,
                storage,
                cache,
                account: OnceCell::new(),
                certs: DashMap::new(),
                failures: DashMap::new(),
                http01_challenges: Http01Challenges::new(),
                alpn_challenges: DashMap::new(),
            }),
            issuing: Flights::new(),
            fallback: self_signed(vec![FALLBACK_NAME.to_string()])?,
        })
    }

    /// Tokens the plain HTTP listener must answer
    pub fn http01_challenges(&self) -> Http01Challenges {
        self.state.http01_challenges.clone()
    }

    /// Start (or join) issuance for `host` on a background task
    fn issue_in_background(&self, host: &str) -> Flight<Arc<CertifiedKey>> {
        let state = self.state.clone();
        let owned = host.to_string();
        self.issuing
            .join_or_spawn(host, async move { state.ensure(&owned).await.map_err(|e| e.to_string()) })
    }

    fn recently_failed(&self, host: &str) -> bool {
        self.state
            .failures
            .get(host)
            .is_some_and(|at| at.elapsed() < RETRY_BACKOFF)
    }

    /// The certificate held for `host` (in memory or in the cache), if not yet expired
    async fn current(&self, host: &str) -> Result<Option<Issued>, CertError> {
        if let Some(issued) = self.state.certs.get(host).map(|c| c.clone()) {
            return Ok(issued.valid_for_days(0).then_some(issued));
        }
        match self.state.load_cached(host).await? {
            Some(issued) if issued.valid_for_days(0) => {
                self.state.certs.insert(host.to_string(), issued.clone());
                debug!(host, "Loaded certificate from cache");
                Ok(Some(issued))
            }
            _ => Ok(None),
        }
    }

    /// Renew certificates held in memory before they expire
    pub async fn renewal_loop(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(RENEWAL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let due: Vec<String> = self
                        .state
                        .certs
                        .iter()
                        .filter(|e| !e.value().valid_for_days(self.state.config.renew_before_days))
                        .map(|e| e.key().clone())
                        .collect();

                    for host in due {
                        info!(host = %host, "Certificate renewal needed");
                        if let Err(e) = self.issue_in_background(&host).outcome().await {
                            error!(host = %host, error = %e, "Failed to renew certificate");
                        }
                    }
                }
                res = shutdown_rx.changed() => {
                    if res.is_err() || *shutdown_rx.borrow() {
                        debug!("ACME renewal loop stopped");
                        break;
                    }
                }
            }
        }
    }
}

impl AcmeState {
    /// Only hosts with registered targets may be issued a certificate
    async fn check_host(&self, host: &str) -> Result<(), CertError> {
        if self.storage.target_list(host).await?.is_empty() {
            return Err(CertError::UnknownHost(host.to_string()));
        }
        Ok(())
    }

    async fn account(&self) -> Result<&Account, CertError> {
        self.account
            .get_or_try_init(|| async {
                self.load_or_create_account()
                    .await
                    .map_err(|e| CertError::Acme(format!("{:#}", e)))
            })
            .await
    }

    async fn load_or_create_account(&self) -> anyhow::Result<Account> {
        match self.cache.get(ACCOUNT_CACHE_KEY).await {
            Ok(data) => {
                debug!("Loading existing ACME account");
                let credentials: AccountCredentials = serde_json::from_slice(&data)?;
                return Ok(Account::from_credentials(credentials).await?);
            }
            Err(CacheError::Miss) => {}
            Err(e) => return Err(e.into()),
        }

        info!("Creating new ACME account");
        let email = self
            .config
            .email
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("ACME email is required for account creation"))?;

        let directory_url = self
            .config
            .directory_url
            .as_deref()
            .unwrap_or(LetsEncrypt::Production.url());

        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &[&format!("mailto:{}", email)],
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            directory_url,
            None,
        )
        .await?;

        self.cache
            .put(ACCOUNT_CACHE_KEY, serde_json::to_string(&credentials)?.as_bytes())
            .await?;
        info!("ACME account credentials cached");

        Ok(account)
    }

    async fn load_cached(&self, host: &str) -> Result<Option<Issued>, CertError> {
        let data = match self.cache.get(host).await {
            Ok(data) => data,
            Err(CacheError::Miss) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let chain = parse_chain(&data);
        let Some(key) = load_private_key(&data) else {
            warn!(host, "Cached certificate has no private key, ignoring");
            return Ok(None);
        };
        if chain.is_empty() {
            warn!(host, "Cached certificate has no chain, ignoring");
            return Ok(None);
        }

        Ok(Some(Issued {
            key: certified_key(chain, &key)?,
        }))
    }

    /// Issue (or renew) the certificate for `host`
    ///
    /// Only ever runs inside [`Flights`], one run per host at a time.
    async fn ensure(&self, host: &str) -> Result<Arc<CertifiedKey>, CertError> {
        let renew_days = self.config.renew_before_days;
        let existing = match self.certs.get(host).map(|c| c.clone()) {
            Some(issued) => Some(issued),
            None => self.load_cached(host).await?,
        };

        if let Some(issued) = &existing {
            if issued.valid_for_days(renew_days) {
                self.certs.insert(host.to_string(), issued.clone());
                return Ok(issued.key.clone());
            }
        }

        match self.issue(host).await {
            Ok(issued) => {
                let key = issued.key.clone();
                self.certs.insert(host.to_string(), issued);
                self.failures.remove(host);
                Ok(key)
            }
            Err(e) => {
                self.failures.insert(host.to_string(), Instant::now());
                match existing.filter(|i| i.valid_for_days(0)) {
                    Some(issued) => {
                        warn!(host, error = %e, "Renewal failed, serving current certificate");
                        self.certs.insert(host.to_string(), issued.clone());
                        Ok(issued.key)
                    }
                    None => Err(e),
                }
            }
        }
    }

    async fn issue(&self, host: &str) -> Result<Issued, CertError> {
        let account = self.account().await?;
        let (chain_pem, key_pem) = self
            .obtain_certificate(account, host)
            .await
            .map_err(|e| CertError::Acme(format!("{:#}", e)))?;

        // Stored the way it is parsed back: key first, then the chain
        let mut bundle = key_pem.clone().into_bytes();
        bundle.extend_from_slice(chain_pem.as_bytes());
        self.cache.put(host, &bundle).await?;

        let key = load_private_key(key_pem.as_bytes()).ok_or_else(|| CertError::Key("unparseable key".into()))?;
        let chain = parse_chain(chain_pem.as_bytes());
        Ok(Issued {
            key: certified_key(chain, &key)?,
        })
    }

    /// Publish the answer for one challenge until the returned guard drops
    fn publish_challenge(
        &self,
        domain: &str,
        token: &str,
        key_authorization: &KeyAuthorization,
    ) -> anyhow::Result<PublishedChallenge<'_>> {
        let mut published = PublishedChallenge {
            state: self,
            token: None,
            alpn_domain: None,
        };
        match self.config.challenge_type {
            AcmeChallengeType::Http01 => {
                debug!(domain, token, "Setting up HTTP-01 challenge");
                self.http01_challenges
                    .set(token.to_string(), key_authorization.as_str().to_string());
                published.token = Some(token.to_string());
            }
            AcmeChallengeType::TlsAlpn01 => {
                debug!(domain, "Setting up TLS-ALPN-01 challenge");
                let cert = create_tls_alpn01_cert(domain, key_authorization.digest().as_ref())?;
                self.alpn_challenges.insert(domain.to_string(), cert);
                published.alpn_domain = Some(domain.to_string());
            }
        }
        Ok(published)
    }

    /// Obtain a new certificate via ACME, returning `(chain_pem, key_pem)`
    async fn obtain_certificate(&self, account: &Account, host: &str) -> anyhow::Result<(String, String)> {
        info!(host, "Requesting new certificate");

        let identifiers = [Identifier::Dns(host.to_string())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;

        let challenge_type = match self.config.challenge_type {
            AcmeChallengeType::Http01 => ChallengeType::Http01,
            AcmeChallengeType::TlsAlpn01 => ChallengeType::TlsAlpn01,
        };

        for authz in order.authorizations().await? {
            if authz.status == AuthorizationStatus::Valid {
                continue;
            }

            let domain = match &authz.identifier {
                Identifier::Dns(domain) => domain.clone(),
            };

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == challenge_type)
                .ok_or_else(|| {
                    anyhow::anyhow!(
                        "Challenge type {:?} not available for {}",
                        self.config.challenge_type,
                        domain
                    )
                })?;

            let key_auth = order.key_authorization(challenge);
            let _published = self.publish_challenge(&domain, &challenge.token, &key_auth)?;

            order.set_challenge_ready(&challenge.url).await?;
            wait_for_authorization(&mut order, &domain).await?;
        }

        let mut attempts = 0;
        loop {
            let state = order.state();
            match state.status {
                OrderStatus::Ready | OrderStatus::Valid => break,
                OrderStatus::Invalid => anyhow::bail!("Order invalid for {}", host),
                OrderStatus::Pending | OrderStatus::Processing => {
                    attempts += 1;
                    if attempts > MAX_POLL_ATTEMPTS {
                        anyhow::bail!("Order timeout for {}", host);
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                    order.refresh().await?;
                }
            }
        }

        let mut params = CertificateParams::new(vec![host.to_string()])?;
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, host);

        let private_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let csr = params.serialize_request(&private_key)?;
        order.finalize(csr.der()).await?;

        let mut attempts = 0;
        let chain_pem = loop {
            order.refresh().await?;
            let state = order.state();
            match state.status {
                OrderStatus::Valid => match order.certificate().await? {
                    Some(cert) => break cert,
                    None => anyhow::bail!("Order valid but no certificate returned"),
                },
                OrderStatus::Processing => {
                    attempts += 1;
                    if attempts > MAX_POLL_ATTEMPTS {
                        anyhow::bail!("Certificate timeout for {}", host);
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                _ => anyhow::bail!("Unexpected order status: {:?}", state.status),
            }
        };

        info!(host, "Certificate obtained successfully");
        Ok((chain_pem, private_key.serialize_pem()))
    }
}

#[async_trait]
impl CertificateManager for AutocertManager {
    async fn certificate(&self, hello: &ClientHelloInfo) -> Result<Arc<CertifiedKey>, CertError> {
        let Some(host) = hello.host() else {
            return Ok(self.fallback.clone());
        };

        if hello.is_acme_challenge() {
            return self
                .state
                .alpn_challenges
                .get(&host)
                .map(|c| c.value().clone())
                .ok_or_else(|| CertError::Acme(format!("no pending tls-alpn-01 challenge for {}", host)));
        }

        let renew_days = self.state.config.renew_before_days;
        if let Some(current) = self.state.certs.get(&host) {
            if current.valid_for_days(renew_days) {
                return Ok(current.key.clone());
            }
        }

        self.state.check_host(&host).await?;

        // A certificate that has not expired is served while renewal runs behind it
        if let Some(current) = self.current(&host).await? {
            if !current.valid_for_days(renew_days) && !self.recently_failed(&host) {
                debug!(host = %host, "Certificate inside renewal window, renewing in background");
                let _renewal = self.issue_in_background(&host);
            }
            return Ok(current.key);
        }

        if self.recently_failed(&host) && !self.issuing.is_pending(&host) {
            return Err(CertError::Acme(format!("issuance for {} failed recently", host)));
        }
        self.issue_in_background(&host).outcome().await.map_err(CertError::Acme)
    }
}

async fn wait_for_authorization(order: &mut Order, domain: &str) -> anyhow::Result<()> {
    let mut attempts = 0;
    loop {
        tokio::time::sleep(POLL_INTERVAL).await;

        order.refresh().await?;
        let auths = order.authorizations().await?;
        let status = auths
            .iter()
            .find(|a| matches!(&a.identifier, Identifier::Dns(d) if d == domain))
            .map(|a| &a.status);

        match status {
            Some(AuthorizationStatus::Valid) => {
                info!(domain, "Authorization valid");
                return Ok(());
            }
            Some(AuthorizationStatus::Pending) => {
                attempts += 1;
                if attempts > MAX_POLL_ATTEMPTS {
                    anyhow::bail!("Authorization timeout for {}", domain);
                }
                debug!(domain, attempt = attempts, "Waiting for authorization");
            }
            Some(AuthorizationStatus::Invalid) => anyhow::bail!("Authorization failed for {}", domain),
            Some(status) => debug!(domain, ?status, "Authorization status"),
            None => anyhow::bail!("Authorization not found for {}", domain),
        }
    }
}

/// Create a TLS-ALPN-01 challenge certificate carrying the key authorization digest
fn create_tls_alpn01_cert(domain: &str, digest: &[u8]) -> Result<Arc<CertifiedKey>, CertError> {
    use rcgen::{CustomExtension, IsCa, KeyUsagePurpose};

    let mut params = CertificateParams::new(vec![domain.to_string()])?;
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];

    // OCTET STRING of 32 bytes
    let mut ext_value = vec![0x04, 0x20];
    ext_value.extend_from_slice(digest);

    let mut extension = CustomExtension::from_oid_content(ACME_ALPN_OID, ext_value);
    extension.set_criticality(true);
    params.custom_extensions.push(extension);

    let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
    let cert = params.self_signed(&key_pair)?;

    let key = PrivateKeyDer::try_from(key_pair.serialize_der()).map_err(|e| CertError::Key(e.to_string()))?;
    certified_key(vec![CertificateDer::from(cert.der().to_vec())], &key)
}
