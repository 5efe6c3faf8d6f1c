//! Configuration for httpsify-rs
//!
//! Settings come from three layers: command-line flags, an optional TOML file
//! and built-in defaults (in that order of precedence). The result is a single
//! immutable [`Config`] shared by every component.

use clap::{builder::BoolishValueParser, Parser, ValueEnum};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::ddns::{DdnsCredentials, DdnsProvider};
use crate::error::{HttpsifyError, Result};

/// Default HTTPS listen port
pub const DEFAULT_PORT: u16 = 4443;
/// Default backend origin
pub const DEFAULT_BACKEND: &str = "http://127.0.0.1:80";
/// Let's Encrypt production directory
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
/// ACME account registration file, stored next to the certificate
pub const ACCOUNT_FILE: &str = "lets-encrypt-user.reg";

/// Command-line flags
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "httpsify")]
#[command(version, about = "Transparent HTTPS offloader with automatic certificates", long_about = None)]
pub struct Args {
    /// Domain to serve (merged with --domains)
    pub domain: Option<String>,

    /// Additional comma separated domains for the certificate
    #[arg(long, value_delimiter = ',')]
    pub domains: Vec<String>,

    /// Port that will serve the HTTPS requests
    #[arg(long)]
    pub port: Option<String>,

    /// Certificate PEM save-path
    #[arg(long)]
    pub cert: Option<PathBuf>,

    /// Private key PEM save-path
    #[arg(long)]
    pub key: Option<PathBuf>,

    /// Backend HTTP server that will serve the terminated requests
    #[arg(long)]
    pub backend: Option<String>,

    /// Whether to send a Server header identifying httpsify
    #[arg(long, value_parser = BoolishValueParser::new())]
    pub info: Option<bool>,

    /// DDNS provider (namecheap, iwantmyname) or a raw update URL
    #[arg(long)]
    pub ddns: Option<String>,

    /// Don't set up port forwarding on the upstream NAT router
    #[arg(long)]
    pub skipnatfwd: bool,

    /// Comma separated internal:external ports to map, or "default" (port -> 443)
    #[arg(long)]
    pub natfwd: Option<String>,

    /// Optional TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Contact e-mail for the ACME account
    #[arg(long)]
    pub email: Option<String>,

    /// ACME directory URL
    #[arg(long)]
    pub acme_directory: Option<String>,

    /// Terms-of-service policy for new ACME accounts
    #[arg(long, value_enum)]
    pub tos: Option<TosPolicy>,

    /// Use a self-signed certificate instead of ACME
    #[arg(long)]
    pub self_signed: bool,

    /// Seconds to wait for backend response headers
    #[arg(long)]
    pub backend_timeout: Option<u64>,
}

/// Configuration file contents; every key is optional
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub port: Option<u16>,
    #[serde(default)]
    pub domains: Vec<String>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub backend: Option<String>,
    pub info: Option<bool>,
    pub ddns: Option<String>,
    pub skipnatfwd: Option<bool>,
    pub natfwd: Option<String>,
    pub email: Option<String>,
    pub acme_directory: Option<String>,
    pub tos: Option<TosPolicy>,
    pub self_signed: Option<bool>,
    pub backend_timeout: Option<u64>,
}

impl FileConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| HttpsifyError::Config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| HttpsifyError::Config(format!("Failed to parse config: {}", e)))
    }
}

/// Terms-of-service acceptance policy for ACME account registration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
pub enum TosPolicy {
    /// Agree to the CA's terms when registering
    #[default]
    #[value(name = "auto")]
    #[serde(rename = "auto")]
    AutoAccept,
    /// Never register a new account; an existing registration must be present
    #[value(name = "manual")]
    #[serde(rename = "manual")]
    RequireManualConfirmation,
}

/// Ordered, de-duplicated set of hostnames the certificate must cover
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainSet(Vec<String>);

impl DomainSet {
    pub fn new<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut domains: Vec<String> = Vec::new();
        for name in names {
            let name = name.as_ref().trim().trim_end_matches('.').to_ascii_lowercase();
            if name.is_empty() {
                continue;
            }
            if name.contains(|c: char| c.is_whitespace() || c == '/' || c == ':') {
                return Err(HttpsifyError::Config(format!("Invalid domain '{}'", name)));
            }
            if !domains.contains(&name) {
                domains.push(name);
            }
        }

        if domains.is_empty() {
            return Err(HttpsifyError::Config("No domain specified".to_string()));
        }
        Ok(Self(domains))
    }

    /// First configured domain; used for DDNS and log messages
    pub fn primary(&self) -> &str {
        &self.0[0]
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    /// True when `names` covers exactly this set, ignoring order and case
    pub fn matches<I, S>(&self, names: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen: Vec<String> = names
            .into_iter()
            .map(|n| n.as_ref().to_ascii_lowercase())
            .collect();
        seen.sort();
        seen.dedup();

        let mut expected = self.0.clone();
        expected.sort();
        seen == expected
    }
}

/// Certificate and account storage locations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePaths {
    /// Certificate chain PEM
    pub cert: PathBuf,
    /// Private key PEM
    pub key: PathBuf,
    /// ACME account registration (credentials JSON)
    pub account: PathBuf,
}

impl StoragePaths {
    /// Derive account storage from the certificate's directory
    pub fn new(cert: PathBuf, key: PathBuf) -> Self {
        let dir = cert
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            account: dir.join(ACCOUNT_FILE),
            cert,
            key,
        }
    }

    /// Check if certificate files exist
    pub fn exists(&self) -> bool {
        self.cert.exists() && self.key.exists()
    }

    /// Ensure the storage directories exist
    pub fn ensure_dirs(&self) -> Result<()> {
        for path in [&self.cert, &self.key, &self.account] {
            if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir).map_err(|e| {
                    HttpsifyError::Tls(format!("Failed to create {}: {}", dir.display(), e))
                })?;
            }
        }
        Ok(())
    }
}

/// A single internal -> external TCP port forward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortPair {
    pub internal: u16,
    pub external: u16,
}

/// ACME account settings
#[derive(Debug, Clone)]
pub struct AcmeSettings {
    pub directory_url: String,
    pub email: Option<String>,
    pub tos: TosPolicy,
}

/// Certificate renewal timing
#[derive(Debug, Clone)]
pub struct RenewalSettings {
    /// How often remaining validity is checked
    pub check_interval: Duration,
    /// Renew once validity drops below this
    pub threshold: Duration,
}

/// NAT port forwarding settings
#[derive(Debug, Clone)]
pub struct NatSettings {
    pub mappings: Vec<PortPair>,
    pub lease: Duration,
    pub refresh_interval: Duration,
    pub discovery_timeout: Duration,
    pub operation_timeout: Duration,
}

/// Dynamic DNS settings
#[derive(Debug, Clone)]
pub struct DdnsSettings {
    pub provider: DdnsProvider,
    pub credentials: DdnsCredentials,
    pub interval: Duration,
    pub rate_limit_backoff: Duration,
    pub request_timeout: Duration,
}

/// Immutable runtime configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTPS listen port
    pub port: u16,
    pub domains: DomainSet,
    pub storage: StoragePaths,
    /// Plain HTTP backend origin
    pub backend: Url,
    pub backend_timeout: Duration,
    /// Send a Server identification header
    pub info: bool,
    pub acme: AcmeSettings,
    pub self_signed: bool,
    pub renewal: RenewalSettings,
    /// `None` when NAT forwarding is disabled
    pub nat: Option<NatSettings>,
    /// `None` when no DDNS provider is configured
    pub ddns: Option<DdnsSettings>,
}

impl Config {
    /// Resolve flags, the optional config file and DNS credentials
    pub fn load(args: Args, credentials: DdnsCredentials) -> Result<Self> {
        let file = match args.config {
            Some(ref path) => FileConfig::from_file(path)?,
            None => FileConfig::default(),
        };
        Self::resolve(args, file, credentials)
    }

    /// Merge the layers; flags win over the file, the file wins over defaults
    pub fn resolve(args: Args, file: FileConfig, credentials: DdnsCredentials) -> Result<Self> {
        let port = match args.port {
            Some(ref raw) => parse_port(raw)?,
            None => file.port.unwrap_or(DEFAULT_PORT),
        };
        if port == 0 {
            return Err(HttpsifyError::Config("bogus port: 0".to_string()));
        }

        let domains = DomainSet::new(
            args.domain
                .iter()
                .chain(args.domains.iter())
                .chain(file.domains.iter()),
        )?;

        let storage = StoragePaths::new(
            args.cert
                .or(file.cert)
                .unwrap_or_else(|| PathBuf::from("./cert.pem")),
            args.key
                .or(file.key)
                .unwrap_or_else(|| PathBuf::from("./key.pem")),
        );

        let backend = parse_backend(
            args.backend
                .as_deref()
                .or(file.backend.as_deref())
                .unwrap_or(DEFAULT_BACKEND),
        )?;

        let skip_nat = args.skipnatfwd || file.skipnatfwd.unwrap_or(false);
        let nat = if skip_nat {
            None
        } else {
            let spec = args.natfwd.or(file.natfwd).unwrap_or_else(|| "default".to_string());
            Some(NatSettings {
                mappings: parse_natfwd(&spec, port)?,
                lease: Duration::from_secs(60),
                refresh_interval: Duration::from_secs(30),
                discovery_timeout: Duration::from_secs(10),
                operation_timeout: Duration::from_secs(5),
            })
        };

        let ddns = match args.ddns.or(file.ddns).filter(|d| !d.trim().is_empty()) {
            Some(raw) => {
                let provider: DdnsProvider = raw.parse()?;
                provider.check_credentials(&credentials)?;
                Some(DdnsSettings {
                    provider,
                    credentials,
                    interval: Duration::from_secs(60),
                    rate_limit_backoff: Duration::from_secs(10 * 60),
                    request_timeout: Duration::from_secs(10),
                })
            }
            None => None,
        };

        let directory_url = args
            .acme_directory
            .or(file.acme_directory)
            .unwrap_or_else(|| LETS_ENCRYPT_PRODUCTION.to_string());
        Url::parse(&directory_url).map_err(|e| {
            HttpsifyError::Config(format!("Invalid ACME directory '{}': {}", directory_url, e))
        })?;

        let config = Self {
            port,
            domains,
            storage,
            backend,
            backend_timeout: Duration::from_secs(
                args.backend_timeout.or(file.backend_timeout).unwrap_or(30),
            ),
            info: args.info.or(file.info).unwrap_or(true),
            acme: AcmeSettings {
                directory_url,
                email: args.email.or(file.email),
                tos: args.tos.or(file.tos).unwrap_or_default(),
            },
            self_signed: args.self_signed || file.self_signed.unwrap_or(false),
            renewal: RenewalSettings {
                check_interval: Duration::from_secs(12 * 60 * 60),
                threshold: Duration::from_secs(30 * 24 * 60 * 60),
            },
            nat,
            ddns,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field invariants
    pub fn validate(&self) -> Result<()> {
        if let Some(ref nat) = self.nat {
            if nat.refresh_interval >= nat.lease {
                return Err(HttpsifyError::Config(
                    "NAT refresh interval must be shorter than the lease".to_string(),
                ));
            }
        }
        if self.backend_timeout.is_zero() {
            return Err(HttpsifyError::Config("Backend timeout must be positive".to_string()));
        }
        Ok(())
    }

    /// Address the TLS listener binds to
    pub fn listen_addr(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }
}

fn parse_port(raw: &str) -> Result<u16> {
    raw.trim()
        .parse::<u16>()
        .map_err(|e| HttpsifyError::Config(format!("bogus port '{}': {}", raw, e)))
}

fn parse_backend(raw: &str) -> Result<Url> {
    let url = Url::parse(raw)
        .map_err(|e| HttpsifyError::Config(format!("Invalid backend URL '{}': {}", raw, e)))?;
    if url.scheme() != "http" {
        return Err(HttpsifyError::Config(format!(
            "Backend must be a plain http:// URL, got '{}'",
            raw
        )));
    }
    if url.host_str().is_none() {
        return Err(HttpsifyError::Config(format!("Backend URL '{}' has no host", raw)));
    }
    Ok(url)
}

/// Parse a `natfwd` value into port pairs
///
/// `default` maps the listen port to external port 443.
pub fn parse_natfwd(spec: &str, listen_port: u16) -> Result<Vec<PortPair>> {
    let spec = spec.trim();
    if spec == "default" {
        return Ok(vec![PortPair {
            internal: listen_port,
            external: 443,
        }]);
    }

    let mut pairs: Vec<PortPair> = Vec::new();
    for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (internal, external) = entry.split_once(':').ok_or_else(|| {
            HttpsifyError::Config(format!("bogus natfwd parameter '{}': expected int:ext", entry))
        })?;
        let pair = PortPair {
            internal: parse_natfwd_port(internal, entry)?,
            external: parse_natfwd_port(external, entry)?,
        };
        if pairs.iter().any(|p| p.external == pair.external) {
            return Err(HttpsifyError::Config(format!(
                "bogus natfwd parameter: external port {} mapped twice",
                pair.external
            )));
        }
        pairs.push(pair);
    }

    if pairs.is_empty() {
        return Err(HttpsifyError::Config("bogus natfwd parameter: empty".to_string()));
    }
    Ok(pairs)
}

fn parse_natfwd_port(raw: &str, entry: &str) -> Result<u16> {
    match raw.trim().parse::<u16>() {
        Ok(0) | Err(_) => Err(HttpsifyError::Config(format!(
            "bogus natfwd parameter '{}'",
            entry
        ))),
        Ok(port) => Ok(port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_for(domain: &str) -> Args {
        Args {
            domain: Some(domain.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config =
            Config::resolve(args_for("example.com"), FileConfig::default(), DdnsCredentials::default())
                .unwrap();

        assert_eq!(config.port, 4443);
        assert_eq!(config.domains.as_slice(), ["example.com"]);
        assert_eq!(config.backend.as_str(), "http://127.0.0.1/");
        assert!(config.info);
        assert!(config.ddns.is_none());
        assert_eq!(config.acme.tos, TosPolicy::AutoAccept);

        let nat = config.nat.unwrap();
        assert_eq!(nat.mappings, vec![PortPair { internal: 4443, external: 443 }]);
        assert!(nat.refresh_interval < nat.lease);
    }

    #[test]
    fn test_missing_domain_is_error() {
        let result = Config::resolve(Args::default(), FileConfig::default(), DdnsCredentials::default());
        assert!(matches!(result, Err(HttpsifyError::Config(_))));
    }

    #[test]
    fn test_bogus_port() {
        let mut args = args_for("example.com");
        args.port = Some("https".to_string());
        let result = Config::resolve(args, FileConfig::default(), DdnsCredentials::default());
        assert!(matches!(result, Err(HttpsifyError::Config(msg)) if msg.contains("bogus port")));
    }

    #[test]
    fn test_domain_set_dedup_and_order() {
        let set = DomainSet::new(["Example.com", "www.example.com", "example.com."]).unwrap();
        assert_eq!(set.as_slice(), ["example.com", "www.example.com"]);
        assert_eq!(set.primary(), "example.com");

        assert!(set.matches(["www.example.com", "EXAMPLE.com"]));
        assert!(!set.matches(["example.com"]));
        assert!(!set.matches(["example.com", "www.example.com", "api.example.com"]));
    }

    #[test]
    fn test_domain_set_rejects_urls() {
        assert!(DomainSet::new(["https://example.com"]).is_err());
        assert!(DomainSet::new(["", "  "]).is_err());
    }

    #[test]
    fn test_parse_natfwd() {
        assert_eq!(
            parse_natfwd("default", 8443).unwrap(),
            vec![PortPair { internal: 8443, external: 443 }]
        );
        assert_eq!(
            parse_natfwd("4443:443, 8080:80", 4443).unwrap(),
            vec![
                PortPair { internal: 4443, external: 443 },
                PortPair { internal: 8080, external: 80 },
            ]
        );
        assert!(parse_natfwd("4443", 4443).is_err());
        assert!(parse_natfwd("4443:abc", 4443).is_err());
        assert!(parse_natfwd("4443:443,4444:443", 4443).is_err());
    }

    #[test]
    fn test_skipnatfwd() {
        let mut args = args_for("example.com");
        args.skipnatfwd = true;
        args.natfwd = Some("garbage".to_string());
        let config = Config::resolve(args, FileConfig::default(), DdnsCredentials::default()).unwrap();
        assert!(config.nat.is_none());
    }

    #[test]
    fn test_backend_must_be_http() {
        let mut args = args_for("example.com");
        args.backend = Some("https://127.0.0.1:8443".to_string());
        assert!(Config::resolve(args, FileConfig::default(), DdnsCredentials::default()).is_err());
    }

    #[test]
    fn test_storage_paths() {
        let paths = StoragePaths::new(
            PathBuf::from("/var/lib/httpsify/cert.pem"),
            PathBuf::from("/etc/keys/key.pem"),
        );
        assert_eq!(paths.account, PathBuf::from("/var/lib/httpsify/lets-encrypt-user.reg"));

        let relative = StoragePaths::new(PathBuf::from("cert.pem"), PathBuf::from("key.pem"));
        assert_eq!(relative.account, PathBuf::from("./lets-encrypt-user.reg"));
    }

    #[test]
    fn test_ddns_preset_requires_password() {
        let mut args = args_for("home.example.com");
        args.ddns = Some("namecheap".to_string());
        let result = Config::resolve(args.clone(), FileConfig::default(), DdnsCredentials::default());
        assert!(matches!(result, Err(HttpsifyError::Config(_))));

        let credentials = DdnsCredentials {
            username: None,
            password: Some("secret".to_string()),
        };
        let config = Config::resolve(args, FileConfig::default(), credentials).unwrap();
        assert_eq!(config.ddns.unwrap().provider, DdnsProvider::Namecheap);
    }

    #[test]
    fn test_parse_file_config() {
        let toml = r#"
port = 8443
domains = ["example.com", "www.example.com"]
backend = "http://127.0.0.1:8080"
info = false
natfwd = "8443:443"
tos = "manual"
"#;
        let file: FileConfig = toml::from_str(toml).unwrap();
        let config = Config::resolve(Args::default(), file, DdnsCredentials::default()).unwrap();
        assert_eq!(config.port, 8443);
        assert_eq!(config.domains.as_slice().len(), 2);
        assert!(!config.info);
        assert_eq!(config.acme.tos, TosPolicy::RequireManualConfirmation);
    }

    #[test]
    fn test_flags_override_file() {
        let file = FileConfig {
            port: Some(8443),
            domains: vec!["file.example.com".to_string()],
            info: Some(false),
            ..Default::default()
        };
        let mut args = args_for("cli.example.com");
        args.port = Some("9443".to_string());
        args.info = Some(true);

        let config = Config::resolve(args, file, DdnsCredentials::default()).unwrap();
        assert_eq!(config.port, 9443);
        assert!(config.info);
        assert_eq!(config.domains.as_slice(), ["cli.example.com", "file.example.com"]);
    }

    #[test]
    fn test_cli_parsing() {
        let args = Args::try_parse_from([
            "httpsify",
            "--port",
            "8443",
            "--info",
            "no",
            "--natfwd",
            "8443:443",
            "--tos",
            "manual",
            "example.com",
        ])
        .unwrap();
        assert_eq!(args.domain.as_deref(), Some("example.com"));
        assert_eq!(args.info, Some(false));
        assert_eq!(args.tos, Some(TosPolicy::RequireManualConfirmation));
    }
}
