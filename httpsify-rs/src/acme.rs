//! ACME (Let's Encrypt) certificate issuance
//!
//! Issuance uses the TLS-ALPN-01 challenge, answered on the HTTPS listener
//! itself: while an order is pending, the challenge certificate for each
//! domain sits in the [`ChallengeStore`] consulted by the TLS resolver.

use async_trait::async_trait;
use chrono::{Datelike, Utc};
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use rcgen::{CertificateParams, CustomExtension, KeyPair};
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{AcmeSettings, DomainSet, TosPolicy};
use crate::error::{HttpsifyError, Result};
use crate::tls;

/// Pending TLS-ALPN-01 challenge certificates, keyed by domain
pub struct ChallengeStore {
    certs: RwLock<HashMap<String, Arc<CertifiedKey>>>,
}

impl ChallengeStore {
    /// Create a new challenge store
    pub fn new() -> Self {
        Self {
            certs: RwLock::new(HashMap::new()),
        }
    }

    /// Add a challenge certificate
    pub fn insert(&self, domain: &str, key: CertifiedKey) {
        let mut certs = self.certs.write().unwrap_or_else(|e| e.into_inner());
        certs.insert(domain.to_ascii_lowercase(), Arc::new(key));
        debug!("Added ACME challenge for domain: {}", domain);
    }

    /// Get a challenge certificate
    pub fn get(&self, domain: &str) -> Option<Arc<CertifiedKey>> {
        let certs = self.certs.read().unwrap_or_else(|e| e.into_inner());
        certs.get(&domain.to_ascii_lowercase()).cloned()
    }

    /// Remove a challenge (after validation)
    pub fn remove(&self, domain: &str) {
        let mut certs = self.certs.write().unwrap_or_else(|e| e.into_inner());
        certs.remove(&domain.to_ascii_lowercase());
        debug!("Removed ACME challenge for domain: {}", domain);
    }

    pub fn is_empty(&self) -> bool {
        self.certs.read().unwrap_or_else(|e| e.into_inner()).is_empty()
    }
}

impl Default for ChallengeStore {
    fn default() -> Self {
        Self::new()
    }
}

/// PEM output of a successful issuance
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub cert_chain_pem: String,
    pub key_pem: String,
}

/// Produces a certificate covering exactly the given domains
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    async fn issue(&self, domains: &DomainSet) -> Result<IssuedCertificate>;
}

/// ACME client for Let's Encrypt (or any RFC 8555 CA)
pub struct AcmeIssuer {
    directory_url: String,
    email: Option<String>,
    tos: TosPolicy,
    /// Cached account credentials
    account_path: PathBuf,
    challenges: Arc<ChallengeStore>,
}

impl AcmeIssuer {
    pub fn new(settings: &AcmeSettings, account_path: PathBuf, challenges: Arc<ChallengeStore>) -> Self {
        Self {
            directory_url: settings.directory_url.clone(),
            email: settings.email.clone(),
            tos: settings.tos,
            account_path,
            challenges,
        }
    }

    /// Load the registered account, or register one if the policy allows
    async fn account(&self) -> Result<Account> {
        if self.account_path.exists() {
            debug!("Loading ACME account from {}", self.account_path.display());
            let json = tokio::fs::read_to_string(&self.account_path).await?;
            let credentials: AccountCredentials = serde_json::from_str(&json).map_err(|e| {
                HttpsifyError::Acme(format!("Corrupt account file {}: {}", self.account_path.display(), e))
            })?;
            return Ok(Account::from_credentials(credentials).await?);
        }

        if self.tos == TosPolicy::RequireManualConfirmation {
            return Err(HttpsifyError::Acme(format!(
                "No ACME account at {} and terms of service were not accepted (use --tos auto)",
                self.account_path.display()
            )));
        }

        info!("Registering ACME account with {}", self.directory_url);
        let contacts: Vec<String> = self.email.iter().map(|e| format!("mailto:{}", e)).collect();
        let contact: Vec<&str> = contacts.iter().map(String::as_str).collect();
        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &contact,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.directory_url,
            None,
        )
        .await?;

        let json = serde_json::to_string_pretty(&credentials)
            .map_err(|e| HttpsifyError::Acme(format!("Failed to encode account: {}", e)))?;
        if let Some(dir) = self.account_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        tls::write_private_file(&self.account_path, json.as_bytes())?;
        info!("ACME account saved to {}", self.account_path.display());

        Ok(account)
    }

    /// Publish challenges, wait for validation, then finalize and download
    async fn complete_order(
        &self,
        order: &mut Order,
        ready: &[String],
        domains: &DomainSet,
    ) -> Result<IssuedCertificate> {
        for url in ready {
            order.set_challenge_ready(url).await?;
        }

        let mut delay = Duration::from_millis(250);
        let mut attempts = 0;
        loop {
            tokio::time::sleep(delay).await;
            let state = order.refresh().await?;
            match &state.status {
                OrderStatus::Ready => break,
                OrderStatus::Invalid => {
                    return Err(HttpsifyError::Acme(format!(
                        "Order for {:?} was rejected",
                        domains.as_slice()
                    )))
                }
                status => debug!("Order status: {:?}", status),
            }

            attempts += 1;
            if attempts >= 10 {
                return Err(HttpsifyError::Acme("Challenge validation timeout".to_string()));
            }
            delay = (delay * 2).min(Duration::from_secs(10));
        }

        let key_pair = KeyPair::generate()?;
        let params = CertificateParams::new(domains.as_slice().to_vec())?;
        let csr = params.serialize_request(&key_pair)?;
        order.finalize(csr.der().as_ref()).await?;

        let mut attempts = 0;
        let cert_chain_pem = loop {
            match order.certificate().await? {
                Some(pem) => break pem,
                None if attempts < 30 => {
                    attempts += 1;
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                None => {
                    return Err(HttpsifyError::Acme(
                        "Certificate was not issued in time".to_string(),
                    ))
                }
            }
        };

        Ok(IssuedCertificate {
            cert_chain_pem,
            key_pem: key_pair.serialize_pem(),
        })
    }
}

#[async_trait]
impl CertificateIssuer for AcmeIssuer {
    async fn issue(&self, domains: &DomainSet) -> Result<IssuedCertificate> {
        info!("Requesting ACME certificate for domains: {:?}", domains.as_slice());
        let account = self.account().await?;

        let identifiers: Vec<Identifier> = domains
            .as_slice()
            .iter()
            .map(|d| Identifier::Dns(d.clone()))
            .collect();
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;

        let mut published: Vec<String> = Vec::new();
        let mut ready: Vec<String> = Vec::new();
        let mut prepared: Result<()> = Ok(());

        for authz in order.authorizations().await? {
            match &authz.status {
                AuthorizationStatus::Pending => {}
                AuthorizationStatus::Valid => continue,
                status => {
                    prepared = Err(HttpsifyError::Acme(format!(
                        "Authorization in unexpected state {:?}",
                        status
                    )));
                    break;
                }
            }

            let Identifier::Dns(domain) = &authz.identifier;
            let Some(challenge) = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::TlsAlpn01)
            else {
                prepared = Err(HttpsifyError::Acme(format!(
                    "No TLS-ALPN-01 challenge offered for {}",
                    domain
                )));
                break;
            };

            let key_authorization = order.key_authorization(challenge);
            match challenge_certificate(domain, key_authorization.digest().as_ref()) {
                Ok(key) => {
                    self.challenges.insert(domain, key);
                    published.push(domain.clone());
                    ready.push(challenge.url.clone());
                }
                Err(e) => {
                    prepared = Err(e);
                    break;
                }
            }
        }

        let result = match prepared {
            Ok(()) => self.complete_order(&mut order, &ready, domains).await,
            Err(e) => Err(e),
        };

        for domain in &published {
            self.challenges.remove(domain);
        }
        if let Err(ref e) = result {
            warn!("ACME issuance for {:?} failed: {}", domains.as_slice(), e);
        }
        result
    }
}

/// Self-signed certificate carrying the acmeIdentifier extension (RFC 8737)
pub fn challenge_certificate(domain: &str, digest: &[u8]) -> Result<CertifiedKey> {
    let mut params = CertificateParams::new(vec![domain.to_string()])?;
    params.custom_extensions = vec![CustomExtension::new_acme_identifier(digest)];
    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;
    tls::certified_key_from_der(cert.der().to_vec(), key_pair.serialize_der())
}

/// Issues self-signed certificates; for development and tests
pub struct SelfSignedIssuer {
    validity_days: i64,
}

impl SelfSignedIssuer {
    pub fn new() -> Self {
        Self { validity_days: 90 }
    }

    pub fn with_validity_days(validity_days: i64) -> Self {
        Self { validity_days }
    }
}

impl Default for SelfSignedIssuer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CertificateIssuer for SelfSignedIssuer {
    async fn issue(&self, domains: &DomainSet) -> Result<IssuedCertificate> {
        warn!("Generating self-signed certificate for {:?}", domains.as_slice());

        let mut params = CertificateParams::new(domains.as_slice().to_vec())?;
        let start = Utc::now() - chrono::Duration::days(1);
        let end = Utc::now() + chrono::Duration::days(self.validity_days);
        params.not_before = rcgen::date_time_ymd(start.year(), start.month() as u8, start.day() as u8);
        params.not_after = rcgen::date_time_ymd(end.year(), end.month() as u8, end.day() as u8);

        let key_pair = KeyPair::generate()?;
        let cert = params.self_signed(&key_pair)?;
        Ok(IssuedCertificate {
            cert_chain_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LETS_ENCRYPT_PRODUCTION;
    use crate::tls::CertificateRecord;
    use tempfile::tempdir;

    #[test]
    fn test_challenge_store() {
        let store = ChallengeStore::new();
        assert!(store.is_empty());

        let key = challenge_certificate("example.com", &[7u8; 32]).unwrap();
        store.insert("Example.com", key);
        assert!(store.get("example.com").is_some());
        assert!(store.get("other.com").is_none());

        store.remove("EXAMPLE.COM");
        assert!(store.get("example.com").is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_self_signed_covers_domains() {
        let domains = DomainSet::new(["example.com", "www.example.com"]).unwrap();
        let issued = SelfSignedIssuer::new().issue(&domains).await.unwrap();

        let record = CertificateRecord::from_pem(issued.cert_chain_pem, issued.key_pem).unwrap();
        assert!(record.covers(&domains));
        assert!(record.is_valid_at(Utc::now()));
        assert!(record.certified_key().is_ok());
    }

    #[tokio::test]
    async fn test_manual_tos_refuses_registration() {
        let dir = tempdir().unwrap();
        let settings = AcmeSettings {
            directory_url: LETS_ENCRYPT_PRODUCTION.to_string(),
            email: None,
            tos: TosPolicy::RequireManualConfirmation,
        };
        let issuer = AcmeIssuer::new(
            &settings,
            dir.path().join("lets-encrypt-user.reg"),
            Arc::new(ChallengeStore::new()),
        );

        let domains = DomainSet::new(["example.com"]).unwrap();
        let result = issuer.issue(&domains).await;
        assert!(matches!(result, Err(HttpsifyError::Acme(msg)) if msg.contains("terms of service")));
        assert!(!dir.path().join("lets-encrypt-user.reg").exists());
    }
}
