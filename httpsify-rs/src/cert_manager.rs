//! Certificate lifecycle
//!
//! Loads the cached certificate, obtains a new one when it is missing,
//! expired or issued for other names, and renews it in the background.
//! Every new certificate is persisted before it is swapped into the
//! listener; in-flight connections keep the key they negotiated with.

use arc_swap::ArcSwapOption;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::acme::CertificateIssuer;
use crate::config::{Config, DomainSet, RenewalSettings, StoragePaths};
use crate::error::{HttpsifyError, Result};
use crate::tls::{CertResolver, CertificateRecord};

pub struct CertManager {
    domains: DomainSet,
    paths: StoragePaths,
    renewal: RenewalSettings,
    issuer: Arc<dyn CertificateIssuer>,
    resolver: Arc<CertResolver>,
    current: ArcSwapOption<CertificateRecord>,
    /// Held for the duration of one issuance
    issuance: Mutex<()>,
}

impl CertManager {
    pub fn new(config: &Config, issuer: Arc<dyn CertificateIssuer>, resolver: Arc<CertResolver>) -> Self {
        Self {
            domains: config.domains.clone(),
            paths: config.storage.clone(),
            renewal: config.renewal.clone(),
            issuer,
            resolver,
            current: ArcSwapOption::empty(),
            issuance: Mutex::new(()),
        }
    }

    /// Certificate currently served
    pub fn current(&self) -> Option<Arc<CertificateRecord>> {
        self.current.load_full()
    }

    /// Make sure a certificate for the configured domains is being served
    ///
    /// A usable cached certificate is installed as-is; if it is close to
    /// expiry a renewal is attempted and its failure is only logged. Without
    /// a usable certificate, failing to obtain one is fatal.
    pub async fn ensure_certificate(&self) -> Result<()> {
        let cached = match CertificateRecord::load(&self.paths) {
            Ok(record) => record,
            Err(e) => {
                warn!("Ignoring unreadable cached certificate: {}", e);
                None
            }
        };

        let now = Utc::now();
        let usable = cached.filter(|record| {
            if !record.covers(&self.domains) {
                info!(
                    "Cached certificate names {:?} differ from {:?}",
                    record.names,
                    self.domains.as_slice()
                );
                false
            } else if !record.is_valid_at(now) {
                info!("Cached certificate expired on {}", record.not_after);
                false
            } else {
                true
            }
        });

        match usable {
            Some(record) => {
                info!(
                    "Using cached certificate for {:?}, valid until {}",
                    record.names, record.not_after
                );
                self.install(record)?;
                if let Err(e) = self.renew_if_needed().await {
                    warn!("Renewal failed, keeping cached certificate: {}", e);
                }
                Ok(())
            }
            None => {
                let _guard = self.issuance.lock().await;
                self.issue()
                    .await
                    .map_err(|e| HttpsifyError::CertificateAcquisition(e.to_string()))
            }
        }
    }

    /// Issue a new certificate when the current one is missing or aging
    ///
    /// Returns whether an issuance took place. Concurrent callers are
    /// serialized and re-check after waiting, so one renewal serves them all.
    pub async fn renew_if_needed(&self) -> Result<bool> {
        let _guard = self.issuance.lock().await;

        if let Some(record) = self.current.load_full() {
            if record.covers(&self.domains)
                && !record.expires_within(self.renewal.threshold, Utc::now())
            {
                debug!("Certificate valid until {}, no renewal needed", record.not_after);
                return Ok(false);
            }
        }

        info!("Renewing certificate for {:?}", self.domains.as_slice());
        self.issue().await?;
        Ok(true)
    }

    /// Caller must hold `issuance`
    async fn issue(&self) -> Result<()> {
        let issued = self.issuer.issue(&self.domains).await?;
        let record = CertificateRecord::from_pem(issued.cert_chain_pem, issued.key_pem)?;

        if !record.covers(&self.domains) {
            return Err(HttpsifyError::Tls(format!(
                "Issued certificate covers {:?}, expected {:?}",
                record.names,
                self.domains.as_slice()
            )));
        }

        record.save(&self.paths)?;
        info!("New certificate for {:?}, valid until {}", record.names, record.not_after);
        self.install(record)
    }

    fn install(&self, record: CertificateRecord) -> Result<()> {
        let key = record.certified_key()?;
        self.resolver.install(key);
        self.current.store(Some(Arc::new(record)));
        Ok(())
    }

    /// Periodic renewal check until cancelled
    pub async fn run_renewal(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.renewal.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.renew_if_needed().await {
                        Ok(true) => info!("Certificate renewed"),
                        Ok(false) => {}
                        Err(e) => error!("Certificate renewal failed, will retry: {}", e),
                    }
                }
            }
        }
        debug!("Renewal task stopped");
    }

    /// Time left on the served certificate
    pub fn remaining(&self) -> Option<Duration> {
        self.current().map(|record| record.remaining(Utc::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::{ChallengeStore, IssuedCertificate, SelfSignedIssuer};
    use crate::config::Args;
    use crate::ddns::DdnsCredentials;
    use crate::tls::test_support::pem_pair;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::{tempdir, TempDir};

    /// Self-signed issuer that counts calls and can be slowed down or broken
    struct TestIssuer {
        calls: AtomicUsize,
        delay: Duration,
        fail: bool,
        names: Option<Vec<&'static str>>,
    }

    impl TestIssuer {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                fail: false,
                names: None,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CertificateIssuer for TestIssuer {
        async fn issue(&self, domains: &DomainSet) -> Result<IssuedCertificate> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(HttpsifyError::Acme("CA unreachable".to_string()));
            }
            match &self.names {
                Some(names) => {
                    let (cert_chain_pem, key_pem) = pem_pair(names, 90);
                    Ok(IssuedCertificate { cert_chain_pem, key_pem })
                }
                None => SelfSignedIssuer::new().issue(domains).await,
            }
        }
    }

    fn config(dir: &TempDir) -> Config {
        let args = Args {
            domain: Some("example.com".to_string()),
            cert: Some(dir.path().join("certs/cert.pem")),
            key: Some(dir.path().join("certs/key.pem")),
            ..Default::default()
        };
        Config::resolve(args, Default::default(), DdnsCredentials::default()).unwrap()
    }

    fn manager(config: &Config, issuer: Arc<TestIssuer>) -> (CertManager, Arc<CertResolver>) {
        let resolver = Arc::new(CertResolver::new(Arc::new(ChallengeStore::new())));
        (CertManager::new(config, issuer, resolver.clone()), resolver)
    }

    fn store(config: &Config, names: &[&str], days: i64) {
        let (cert, key) = pem_pair(names, days);
        CertificateRecord::from_pem(cert, key)
            .unwrap()
            .save(&config.storage)
            .unwrap();
    }

    #[tokio::test]
    async fn test_issues_when_nothing_cached() {
        let dir = tempdir().unwrap();
        let config = config(&dir);
        let issuer = Arc::new(TestIssuer::new());
        let (manager, resolver) = manager(&config, issuer.clone());

        manager.ensure_certificate().await.unwrap();

        assert_eq!(issuer.calls(), 1);
        assert!(resolver.has_certificate());
        assert!(config.storage.exists());
        assert!(manager.current().unwrap().covers(&config.domains));
    }

    #[tokio::test]
    async fn test_fresh_cache_is_reused() {
        let dir = tempdir().unwrap();
        let config = config(&dir);
        store(&config, &["example.com"], 80);

        let issuer = Arc::new(TestIssuer::new());
        let (manager, resolver) = manager(&config, issuer.clone());
        manager.ensure_certificate().await.unwrap();

        assert_eq!(issuer.calls(), 0);
        assert!(resolver.has_certificate());
    }

    #[tokio::test]
    async fn test_name_mismatch_triggers_issuance() {
        let dir = tempdir().unwrap();
        let config = config(&dir);
        store(&config, &["other.org"], 80);

        let issuer = Arc::new(TestIssuer::new());
        let (manager, _) = manager(&config, issuer.clone());
        manager.ensure_certificate().await.unwrap();

        assert_eq!(issuer.calls(), 1);
        assert_eq!(manager.current().unwrap().names, vec!["example.com".to_string()]);
    }

    #[tokio::test]
    async fn test_expired_cache_with_failing_issuer_is_fatal() {
        let dir = tempdir().unwrap();
        let config = config(&dir);
        store(&config, &["example.com"], -2);

        let issuer = Arc::new(TestIssuer {
            fail: true,
            ..TestIssuer::new()
        });
        let (manager, resolver) = manager(&config, issuer);

        let result = manager.ensure_certificate().await;
        assert!(matches!(result, Err(HttpsifyError::CertificateAcquisition(_))));
        assert!(!resolver.has_certificate());
    }

    #[tokio::test]
    async fn test_aging_cache_kept_when_renewal_fails() {
        let dir = tempdir().unwrap();
        let config = config(&dir);
        store(&config, &["example.com"], 5);

        let issuer = Arc::new(TestIssuer {
            fail: true,
            ..TestIssuer::new()
        });
        let (manager, resolver) = manager(&config, issuer.clone());

        manager.ensure_certificate().await.unwrap();
        assert_eq!(issuer.calls(), 1);
        assert!(resolver.has_certificate());
        assert!(manager.remaining().unwrap() < Duration::from_secs(6 * 24 * 3600));
    }

    #[tokio::test]
    async fn test_concurrent_renewals_issue_once() {
        let dir = tempdir().unwrap();
        let config = config(&dir);
        let issuer = Arc::new(TestIssuer {
            delay: Duration::from_millis(50),
            ..TestIssuer::new()
        });
        let (manager, _) = manager(&config, issuer.clone());

        let (a, b) = tokio::join!(manager.renew_if_needed(), manager.renew_if_needed());
        assert!(a.unwrap() ^ b.unwrap());
        assert_eq!(issuer.calls(), 1);
    }

    #[tokio::test]
    async fn test_wrong_names_from_issuer_rejected() {
        let dir = tempdir().unwrap();
        let config = config(&dir);
        let issuer = Arc::new(TestIssuer {
            names: Some(vec!["example.com", "extra.example.com"]),
            ..TestIssuer::new()
        });
        let (manager, resolver) = manager(&config, issuer);

        assert!(manager.ensure_certificate().await.is_err());
        assert!(!resolver.has_certificate());
        assert!(!config.storage.exists());
    }
}
