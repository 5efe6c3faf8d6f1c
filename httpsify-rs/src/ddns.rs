//! Dynamic DNS updates
//!
//! Periodically notifies a DNS provider so the configured domain keeps
//! resolving to this host. Requests are strictly sequential: the next update
//! is only scheduled once the previous one has completed.

use reqwest::StatusCode;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::DdnsSettings;
use crate::error::{HttpsifyError, Result};

/// Namecheap dynamic DNS endpoint
pub const NAMECHEAP_UPDATE_URL: &str = "https://dynamicdns.park-your-domain.com/update";
/// iWantMyName dynamic DNS endpoint
pub const IWANTMYNAME_UPDATE_URL: &str = "https://iwantmyname.com/basicauth/ddns";

/// Provider credentials, read from `DNS_USERNAME` / `DNS_PASSWORD`
#[derive(Clone, Default)]
pub struct DdnsCredentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl DdnsCredentials {
    /// Read credentials from the environment; empty values count as unset
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            username: var("DNS_USERNAME"),
            password: var("DNS_PASSWORD"),
        }
    }

    fn basic_auth(&self) -> Option<(String, String)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            _ => None,
        }
    }
}

impl fmt::Debug for DdnsCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DdnsCredentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// DNS provider identity: a named preset or a raw update URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DdnsProvider {
    Namecheap,
    IWantMyName,
    Custom(Url),
}

impl FromStr for DdnsProvider {
    type Err = HttpsifyError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        match s.to_ascii_lowercase().as_str() {
            "namecheap" => Ok(DdnsProvider::Namecheap),
            "iwantmyname" => Ok(DdnsProvider::IWantMyName),
            _ => {
                let url = Url::parse(s).map_err(|e| {
                    HttpsifyError::Config(format!(
                        "Unknown DDNS provider '{}' (not a preset and not a URL: {})",
                        s, e
                    ))
                })?;
                if !matches!(url.scheme(), "http" | "https") {
                    return Err(HttpsifyError::Config(format!(
                        "DDNS update URL must be http(s), got '{}'",
                        s
                    )));
                }
                Ok(DdnsProvider::Custom(url))
            }
        }
    }
}

impl fmt::Display for DdnsProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DdnsProvider::Namecheap => write!(f, "namecheap"),
            DdnsProvider::IWantMyName => write!(f, "iwantmyname"),
            DdnsProvider::Custom(url) => write!(f, "{}", url.host_str().unwrap_or("custom")),
        }
    }
}

impl DdnsProvider {
    /// Fail early when a preset's credentials are missing
    pub fn check_credentials(&self, credentials: &DdnsCredentials) -> Result<()> {
        match self {
            DdnsProvider::Namecheap if credentials.password.is_none() => Err(HttpsifyError::Config(
                "Need to define DNS_PASSWORD in your environment".to_string(),
            )),
            DdnsProvider::IWantMyName if credentials.basic_auth().is_none() => {
                Err(HttpsifyError::Config(
                    "Need to define DNS_USERNAME and DNS_PASSWORD in your environment".to_string(),
                ))
            }
            DdnsProvider::Custom(_) if credentials.basic_auth().is_none() => {
                warn!("ddns url specified without username/password");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Build the provider-specific update request for `domain`
    pub fn build_request(&self, domain: &str, credentials: &DdnsCredentials) -> Result<UpdateRequest> {
        self.check_credentials(credentials)?;

        match self {
            DdnsProvider::Namecheap => {
                let (host, sld) = split_domain(domain);
                let mut url = parse_static(NAMECHEAP_UPDATE_URL)?;
                url.query_pairs_mut()
                    .append_pair("host", &host)
                    .append_pair("domain", &sld)
                    .append_pair("password", credentials.password.as_deref().unwrap_or_default());
                Ok(UpdateRequest {
                    url,
                    basic_auth: None,
                })
            }
            DdnsProvider::IWantMyName => {
                let mut url = parse_static(IWANTMYNAME_UPDATE_URL)?;
                url.query_pairs_mut().append_pair("hostname", domain);
                Ok(UpdateRequest {
                    url,
                    basic_auth: credentials.basic_auth(),
                })
            }
            DdnsProvider::Custom(url) => Ok(UpdateRequest {
                url: url.clone(),
                basic_auth: credentials.basic_auth(),
            }),
        }
    }
}

fn parse_static(raw: &str) -> Result<Url> {
    Url::parse(raw).map_err(|e| HttpsifyError::Config(format!("Invalid URL '{}': {}", raw, e)))
}

/// Split a fully-qualified domain into (host, second-level domain)
///
/// `home.example.com` becomes `("home", "example.com")`; a bare
/// `example.com` uses the `@` apex host.
pub fn split_domain(domain: &str) -> (String, String) {
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() > 2 {
        let cut = labels.len() - 2;
        (labels[..cut].join("."), labels[cut..].join("."))
    } else {
        ("@".to_string(), domain.to_string())
    }
}

/// A fully built update request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRequest {
    pub url: Url,
    pub basic_auth: Option<(String, String)>,
}

/// Result of one non-fatal update attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Provider accepted the update
    Updated,
    /// Provider answered 429
    RateLimited,
    /// Request never got an answer (timeout, connection refused, ...)
    Unreachable,
}

impl UpdateOutcome {
    /// Delay before the next attempt
    pub fn next_delay(self, interval: Duration, rate_limit_backoff: Duration) -> Duration {
        match self {
            UpdateOutcome::RateLimited => rate_limit_backoff,
            UpdateOutcome::Updated | UpdateOutcome::Unreachable => interval,
        }
    }
}

/// Long-lived DDNS update job
pub struct DdnsUpdater {
    client: reqwest::Client,
    provider: DdnsProvider,
    domain: String,
    request: UpdateRequest,
    interval: Duration,
    rate_limit_backoff: Duration,
    last_status: Option<StatusCode>,
}

impl DdnsUpdater {
    /// Create an updater for `domain`
    pub fn new(settings: &DdnsSettings, domain: &str) -> Result<Self> {
        let request = settings.provider.build_request(domain, &settings.credentials)?;
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .user_agent(concat!("httpsify-rs/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| HttpsifyError::Http(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            provider: settings.provider.clone(),
            domain: domain.to_string(),
            request,
            interval: settings.interval,
            rate_limit_backoff: settings.rate_limit_backoff,
            last_status: None,
        })
    }

    /// Status code of the most recent answered request
    pub fn last_status(&self) -> Option<StatusCode> {
        self.last_status
    }

    /// Send a single update
    ///
    /// Any non-success status other than 429 is returned as
    /// [`HttpsifyError::DdnsRejected`].
    pub async fn update_once(&mut self) -> Result<UpdateOutcome> {
        let mut request = self.client.get(self.request.url.clone());
        if let Some((ref user, ref pass)) = self.request.basic_auth {
            request = request.basic_auth(user, Some(pass));
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                warn!("ddns update via {} failed: {}", self.provider, e);
                return Ok(UpdateOutcome::Unreachable);
            }
        };

        let status = response.status();
        self.last_status = Some(status);

        if status.is_success() {
            debug!("ddns update for {} accepted by {}", self.domain, self.provider);
            Ok(UpdateOutcome::Updated)
        } else if status == StatusCode::TOO_MANY_REQUESTS {
            warn!(
                "ddns rate limited by {}, trying again in {:?}",
                self.provider, self.rate_limit_backoff
            );
            Ok(UpdateOutcome::RateLimited)
        } else {
            Err(HttpsifyError::DdnsRejected(status.as_u16()))
        }
    }

    /// Run until cancelled or until the provider rejects an update
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        info!("Starting ddns updates for {} via {}", self.domain, self.provider);

        loop {
            let outcome = match self.update_once().await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("ddns updates stopped: {}", e);
                    return Err(e);
                }
            };

            let delay = outcome.next_delay(self.interval, self.rate_limit_backoff);
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("ddns updater shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
