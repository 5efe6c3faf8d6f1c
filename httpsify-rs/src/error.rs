//! Error types for httpsify-rs

use thiserror::Error;

/// Result type alias for httpsify operations
pub type Result<T> = std::result::Result<T, HttpsifyError>;

/// Httpsify error types
#[derive(Error, Debug)]
pub enum HttpsifyError {
    /// Configuration error (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(String),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(String),

    /// ACME protocol error
    #[error("ACME error: {0}")]
    Acme(String),

    /// No usable certificate could be obtained
    #[error("Certificate acquisition failed: {0}")]
    CertificateAcquisition(String),

    /// NAT gateway could not be discovered
    #[error("Gateway discovery failed: {0}")]
    GatewayDiscovery(String),

    /// A single port mapping operation failed
    #[error("Port mapping {external_port} failed: {reason}")]
    PortMapping { external_port: u16, reason: String },

    /// DNS provider answered with a non-success status
    #[error("DDNS provider rejected update with status {0}")]
    DdnsRejected(u16),

    /// Backend connection error
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),
}

impl From<instant_acme::Error> for HttpsifyError {
    fn from(e: instant_acme::Error) -> Self {
        HttpsifyError::Acme(e.to_string())
    }
}

impl From<rcgen::Error> for HttpsifyError {
    fn from(e: rcgen::Error) -> Self {
        HttpsifyError::Tls(format!("Certificate generation failed: {}", e))
    }
}

impl From<rustls::Error> for HttpsifyError {
    fn from(e: rustls::Error) -> Self {
        HttpsifyError::Tls(e.to_string())
    }
}
