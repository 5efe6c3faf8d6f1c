//! httpsify-rs: transparent HTTPS offloader
//!
//! Terminates TLS in front of a single plain-HTTP backend with
//! automatically managed certificates.
//!
//! # Features
//!
//! - Let's Encrypt (ACME TLS-ALPN-01) issuance and renewal without restarts
//! - Reverse proxy with non-spoofable forwarding headers
//! - UPnP port forwarding with lease refresh and teardown on exit
//! - Dynamic DNS updates (namecheap, iwantmyname or a custom URL)
//!
//! # Example Configuration
//!
//! ```toml
//! domains = ["example.com", "www.example.com"]
//! port = 4443
//! backend = "http://127.0.0.1:8080"
//! natfwd = "4443:443"
//! ddns = "namecheap"
//! email = "admin@example.com"
//! ```

pub mod acme;
pub mod cert_manager;
pub mod config;
pub mod ddns;
pub mod error;
pub mod nat;
pub mod proxy;
pub mod supervisor;
pub mod tls;

pub use cert_manager::CertManager;
pub use config::{Args, Config};
pub use error::{HttpsifyError, Result};
pub use proxy::ProxyServer;
pub use supervisor::{run, Supervisor};

/// Log filter used when `RUST_LOG` is unset
///
/// Covers the `httpsify` binary as well as the library, so startup errors
/// reported by `main` are visible.
pub const DEFAULT_LOG_FILTER: &str = "httpsify=info,httpsify_rs=info,tower_http=info";

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::{fmt::MakeWriter, layer::SubscriberExt, EnvFilter};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Captured {
        type Writer = Captured;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn test_default_filter_shows_binary_errors() {
        let captured = Captured::default();
        let subscriber = tracing_subscriber::registry()
            .with(EnvFilter::new(DEFAULT_LOG_FILTER))
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(captured.clone())
                    .with_ansi(false),
            );

        tracing::subscriber::with_default(subscriber, || {
            tracing::error!(target: "httpsify", "Configuration error: No domain specified");
            tracing::debug!(target: "httpsify", "hidden at info");
            tracing::info!(target: "httpsify_rs::config", "library event");
        });

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("No domain specified"));
        assert!(output.contains("library event"));
        assert!(!output.contains("hidden at info"));
    }
}
