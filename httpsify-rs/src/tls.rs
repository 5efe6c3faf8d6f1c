//! TLS configuration and certificate storage
//!
//! The listener's [`ServerConfig`] is built once around a [`CertResolver`].
//! Renewal swaps the resolver's certified key atomically, so every handshake
//! sees either the old or the new certificate, never a mix of the two.

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use rustls_pemfile::Item;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::parse_x509_certificate;

use crate::acme::ChallengeStore;
use crate::config::{DomainSet, StoragePaths};
use crate::error::{HttpsifyError, Result};

/// ALPN protocol of the TLS-ALPN-01 challenge (RFC 8737)
pub const ACME_TLS_ALPN: &[u8] = b"acme-tls/1";

/// A certificate chain with its key and the metadata needed for renewal
#[derive(Clone)]
pub struct CertificateRecord {
    pub cert_pem: String,
    pub key_pem: String,
    /// DNS names covered by the leaf certificate
    pub names: Vec<String>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl std::fmt::Debug for CertificateRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateRecord")
            .field("names", &self.names)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

impl CertificateRecord {
    /// Parse a PEM chain and key, reading validity and names from the leaf
    pub fn from_pem(cert_pem: String, key_pem: String) -> Result<Self> {
        let chain = parse_certs(&cert_pem)?;
        parse_private_key(&key_pem)?;

        let (_, leaf) = parse_x509_certificate(&chain[0].0)
            .map_err(|e| HttpsifyError::Tls(format!("Failed to parse certificate: {}", e)))?;

        let names = match leaf.subject_alternative_name() {
            Ok(Some(san)) => san
                .value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some(dns.to_ascii_lowercase()),
                    _ => None,
                })
                .collect(),
            Ok(None) => Vec::new(),
            Err(e) => {
                return Err(HttpsifyError::Tls(format!(
                    "Invalid subjectAltName extension: {}",
                    e
                )))
            }
        };

        let validity = leaf.validity();
        let not_before = timestamp(validity.not_before.timestamp())?;
        let not_after = timestamp(validity.not_after.timestamp())?;

        Ok(Self {
            cert_pem,
            key_pem,
            names,
            not_before,
            not_after,
        })
    }

    /// Load the stored certificate, `None` when either file is missing
    pub fn load(paths: &StoragePaths) -> Result<Option<Self>> {
        if !paths.exists() {
            return Ok(None);
        }
        info!("Loading TLS certificate from {} and {}", paths.cert.display(), paths.key.display());
        let cert_pem = fs::read_to_string(&paths.cert)
            .map_err(|e| HttpsifyError::Tls(format!("Failed to read certificate: {}", e)))?;
        let key_pem = fs::read_to_string(&paths.key)
            .map_err(|e| HttpsifyError::Tls(format!("Failed to read private key: {}", e)))?;
        Self::from_pem(cert_pem, key_pem).map(Some)
    }

    /// Persist certificate and key; the key is only readable by the owner
    pub fn save(&self, paths: &StoragePaths) -> Result<()> {
        paths.ensure_dirs()?;
        write_file(&paths.cert, self.cert_pem.as_bytes(), false)?;
        write_file(&paths.key, self.key_pem.as_bytes(), true)?;
        debug!("Certificate written to {}", paths.cert.display());
        Ok(())
    }

    /// Time left before expiry (zero when already expired)
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.not_after - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Currently inside the validity window
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now < self.not_after
    }

    /// Valid now but with less than `threshold` left
    pub fn expires_within(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        let threshold = ChronoDuration::from_std(threshold).unwrap_or_else(|_| ChronoDuration::days(36500));
        now + threshold >= self.not_after
    }

    pub fn covers(&self, domains: &DomainSet) -> bool {
        domains.matches(&self.names)
    }

    /// Build the rustls key served to clients
    pub fn certified_key(&self) -> Result<CertifiedKey> {
        let certs = parse_certs(&self.cert_pem)?;
        let key = parse_private_key(&self.key_pem)?;
        let signing_key = rustls::sign::any_supported_type(&key)
            .map_err(|e| HttpsifyError::Tls(format!("Unsupported private key: {}", e)))?;
        Ok(CertifiedKey::new(certs, signing_key))
    }
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .ok_or_else(|| HttpsifyError::Tls(format!("Certificate timestamp out of range: {}", secs)))
}

/// Write via a temporary file so readers never see a half-written PEM
fn write_file(path: &Path, contents: &[u8], private: bool) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    if private {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    #[cfg(not(unix))]
    let _ = private;

    let mut file = options
        .open(&tmp)
        .map_err(|e| HttpsifyError::Tls(format!("Failed to write {}: {}", tmp.display(), e)))?;
    file.write_all(contents)?;
    file.sync_all()?;
    fs::rename(&tmp, path)
        .map_err(|e| HttpsifyError::Tls(format!("Failed to write {}: {}", path.display(), e)))?;
    Ok(())
}

/// Write a file readable only by the owner
pub(crate) fn write_private_file(path: &Path, contents: &[u8]) -> Result<()> {
    write_file(path, contents, true)
}

/// Parse every certificate in a PEM bundle
pub fn parse_certs(pem: &str) -> Result<Vec<rustls::Certificate>> {
    let certs = rustls_pemfile::certs(&mut pem.as_bytes())
        .map_err(|e| HttpsifyError::Tls(format!("Failed to read certificates: {}", e)))?;

    if certs.is_empty() {
        return Err(HttpsifyError::Tls("No certificates found".to_string()));
    }
    Ok(certs.into_iter().map(rustls::Certificate).collect())
}

/// Parse the first PKCS#8, RSA or SEC1 private key in a PEM document
pub fn parse_private_key(pem: &str) -> Result<rustls::PrivateKey> {
    let items = rustls_pemfile::read_all(&mut pem.as_bytes())
        .map_err(|e| HttpsifyError::Tls(format!("Failed to read private key: {}", e)))?;

    items
        .into_iter()
        .find_map(|item| match item {
            Item::PKCS8Key(key) | Item::RSAKey(key) | Item::ECKey(key) => {
                Some(rustls::PrivateKey(key))
            }
            _ => None,
        })
        .ok_or_else(|| HttpsifyError::Tls("No private key found".to_string()))
}

/// Build a rustls key from DER certificate and PKCS#8 key bytes
pub fn certified_key_from_der(cert_der: Vec<u8>, key_der: Vec<u8>) -> Result<CertifiedKey> {
    let key = rustls::PrivateKey(key_der);
    let signing_key = rustls::sign::any_supported_type(&key)
        .map_err(|e| HttpsifyError::Tls(format!("Unsupported private key: {}", e)))?;
    Ok(CertifiedKey::new(vec![rustls::Certificate(cert_der)], signing_key))
}

/// Picks the certificate for each handshake
///
/// Regular clients get the live certificate. Clients offering only the
/// `acme-tls/1` protocol get the pending challenge certificate for their SNI.
pub struct CertResolver {
    live: ArcSwapOption<CertifiedKey>,
    challenges: Arc<ChallengeStore>,
}

impl CertResolver {
    pub fn new(challenges: Arc<ChallengeStore>) -> Self {
        Self {
            live: ArcSwapOption::empty(),
            challenges,
        }
    }

    /// Replace the live certificate for all subsequent handshakes
    pub fn install(&self, key: CertifiedKey) {
        self.live.store(Some(Arc::new(key)));
    }

    pub fn has_certificate(&self) -> bool {
        self.live.load().is_some()
    }

    pub fn challenges(&self) -> &Arc<ChallengeStore> {
        &self.challenges
    }
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        let wants_challenge = client_hello
            .alpn()
            .map(|protocols| protocols.collect::<Vec<_>>() == [ACME_TLS_ALPN])
            .unwrap_or(false);

        if wants_challenge {
            let name = client_hello.server_name()?;
            debug!("Answering TLS-ALPN-01 challenge for {}", name);
            return self.challenges.get(name);
        }

        self.live.load_full()
    }
}

/// Build the listener configuration around `resolver`
pub fn server_config(resolver: Arc<CertResolver>) -> Arc<ServerConfig> {
    let mut config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_cert_resolver(resolver);

    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec(), ACME_TLS_ALPN.to_vec()];
    Arc::new(config)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use rcgen::{date_time_ymd, CertificateParams, KeyPair};

    /// Self-signed PEM pair covering `names`, expiring `days` from now
    pub fn pem_pair(names: &[&str], days: i64) -> (String, String) {
        let mut params =
            CertificateParams::new(names.iter().map(|n| n.to_string()).collect::<Vec<_>>())
                .unwrap();
        params.not_before = date_time_ymd(2020, 1, 1);
        let end = Utc::now() + ChronoDuration::days(days);
        params.not_after = date_time_ymd(
            chrono::Datelike::year(&end),
            chrono::Datelike::month(&end) as u8,
            chrono::Datelike::day(&end) as u8,
        );
        let key_pair = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key_pair).unwrap();
        (cert.pem(), key_pair.serialize_pem())
    }
}
