//! Process bootstrap and background task supervision

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::acme::{AcmeIssuer, CertificateIssuer, ChallengeStore, SelfSignedIssuer};
use crate::cert_manager::CertManager;
use crate::config::Config;
use crate::ddns::DdnsUpdater;
use crate::error::Result;
use crate::nat::{self, NatManager};
use crate::proxy::ProxyServer;
use crate::tls::{self, CertResolver};

/// Upper bound on cleanup (NAT teardown) once shutdown starts
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Owns the background tasks and the token they all observe
pub struct Supervisor {
    shutdown: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            shutdown: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    /// Token cancelled when shutdown begins
    pub fn token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!("Starting {} task", name);
        self.tasks.push((name, tokio::spawn(task)));
    }

    /// Names of the tasks that have not finished
    pub fn running(&self) -> Vec<&'static str> {
        self.tasks
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(name, _)| *name)
            .collect()
    }

    /// Cancel every task, wait up to `grace` for them, then abort stragglers
    pub async fn shutdown(self, grace: Duration) {
        self.shutdown.cancel();
        let deadline = tokio::time::Instant::now() + grace;

        for (name, mut handle) in self.tasks {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => info!("{} task stopped", name),
                Ok(Err(e)) => error!("{} task failed: {}", name, e),
                Err(_) => {
                    warn!("{} task did not stop in time, aborting", name);
                    handle.abort();
                }
            }
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// Run the offloader until a signal arrives or the listener dies
///
/// NAT and DDNS problems are logged and never stop the process. Failing to
/// bind the listener or to obtain a first certificate is fatal.
pub async fn run(config: Config) -> Result<()> {
    let config = Arc::new(config);
    let mut supervisor = Supervisor::new();

    info!("Domains: {:?}", config.domains.as_slice());
    info!("Backend: {}", config.backend);

    let ddns = match config.ddns {
        Some(ref settings) => Some(DdnsUpdater::new(settings, config.domains.primary())?),
        None => None,
    };

    if let Some(nat_settings) = config.nat.clone() {
        let token = supervisor.token();
        supervisor.spawn("nat", async move {
            let gateway = tokio::select! {
                _ = token.cancelled() => return,
                found = nat::discover_gateway(nat_settings.discovery_timeout) => found,
            };
            match gateway {
                Ok(gateway) => NatManager::new(gateway, &nat_settings).run(token).await,
                Err(e) => warn!("{}; continuing without port forwarding", e),
            }
        });
    } else {
        info!("NAT port forwarding disabled");
    }

    if let Some(updater) = ddns {
        let token = supervisor.token();
        supervisor.spawn("ddns", async move {
            // The updater logs the reason it stopped
            let _ = updater.run(token).await;
        });
    }

    let listener = match TcpListener::bind(config.listen_addr()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", config.listen_addr(), e);
            supervisor.shutdown(SHUTDOWN_GRACE).await;
            return Err(e.into());
        }
    };

    let challenges = Arc::new(ChallengeStore::new());
    let resolver = Arc::new(CertResolver::new(challenges.clone()));
    let proxy = ProxyServer::new(&config, tls::server_config(resolver.clone()));

    let token = supervisor.token();
    supervisor.spawn("proxy", async move {
        if let Err(e) = proxy.serve(listener, token.clone()).await {
            error!("Proxy server error: {}", e);
        }
        token.cancel();
    });

    let issuer: Arc<dyn CertificateIssuer> = if config.self_signed {
        Arc::new(SelfSignedIssuer::new())
    } else {
        Arc::new(AcmeIssuer::new(
            &config.acme,
            config.storage.account.clone(),
            challenges,
        ))
    };
    let certs = Arc::new(CertManager::new(&config, issuer, resolver));

    let ensured = tokio::select! {
        result = certs.ensure_certificate() => Some(result),
        _ = shutdown_signal() => None,
    };
    match ensured {
        Some(Ok(())) => {}
        Some(Err(e)) => {
            error!("{}", e);
            supervisor.shutdown(SHUTDOWN_GRACE).await;
            return Err(e);
        }
        None => {
            supervisor.shutdown(SHUTDOWN_GRACE).await;
            return Ok(());
        }
    }

    supervisor.spawn("renewal", certs.clone().run_renewal(supervisor.token()));
    info!("Ready on https://{}:{}", config.domains.primary(), config.port);

    let token = supervisor.token();
    tokio::select! {
        _ = shutdown_signal() => {}
        _ = token.cancelled() => warn!("Listener stopped unexpectedly"),
    }

    info!("Shutting down");
    supervisor.shutdown(SHUTDOWN_GRACE).await;
    Ok(())
}
