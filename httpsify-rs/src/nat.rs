//! NAT port forwarding
//!
//! Discovers the upstream gateway and keeps TCP port mappings alive for the
//! lifetime of the process. Mappings carry a short lease and are re-created
//! on a shorter interval, so a crash leaks a mapping for at most one lease.

use async_trait::async_trait;
use igd_next::aio::tokio::Tokio;
use igd_next::{PortMappingProtocol, SearchOptions};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{NatSettings, PortPair};
use crate::error::{HttpsifyError, Result};

/// Description attached to every mapping on the gateway
pub const MAPPING_DESCRIPTION: &str = "httpsify";

/// A TCP port mapping with its lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub internal_port: u16,
    pub external_port: u16,
    pub lease: Duration,
    pub description: String,
}

impl PortMapping {
    pub fn new(pair: PortPair, lease: Duration) -> Self {
        Self {
            internal_port: pair.internal,
            external_port: pair.external,
            lease,
            description: MAPPING_DESCRIPTION.to_string(),
        }
    }
}

/// Control surface of a NAT gateway
#[async_trait]
pub trait NatGateway: Send + Sync {
    /// Gateway type, for logging
    fn kind(&self) -> String;

    /// Create or renew a TCP mapping
    async fn add_port_mapping(&self, mapping: &PortMapping) -> Result<()>;

    /// Remove the TCP mapping on `mapping.external_port`
    async fn delete_port_mapping(&self, mapping: &PortMapping) -> Result<()>;

    /// Address the gateway presents to the internet
    async fn external_ip(&self) -> Result<IpAddr>;
}

/// UPnP Internet Gateway Device
pub struct IgdGateway {
    gateway: igd_next::aio::Gateway<Tokio>,
    local_ip: IpAddr,
}

impl IgdGateway {
    /// Search the local network for a gateway
    pub async fn discover(timeout: Duration) -> Result<Self> {
        let options = SearchOptions {
            timeout: Some(timeout),
            ..Default::default()
        };
        let gateway = tokio::time::timeout(timeout, igd_next::aio::tokio::search_gateway(options))
            .await
            .map_err(|_| HttpsifyError::GatewayDiscovery(format!("no answer within {:?}", timeout)))?
            .map_err(|e| HttpsifyError::GatewayDiscovery(e.to_string()))?;

        let local_ip = local_ip_towards(gateway.addr).await?;
        Ok(Self { gateway, local_ip })
    }
}

/// Local address used to reach `peer`; this is the address the gateway forwards to
async fn local_ip_towards(peer: SocketAddr) -> Result<IpAddr> {
    let bind: SocketAddr = if peer.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        ([0u16; 8], 0).into()
    };
    let socket = tokio::net::UdpSocket::bind(bind).await?;
    socket.connect(peer).await?;
    Ok(socket.local_addr()?.ip())
}

#[async_trait]
impl NatGateway for IgdGateway {
    fn kind(&self) -> String {
        format!("UPnP IGD at {}", self.gateway.addr)
    }

    async fn add_port_mapping(&self, mapping: &PortMapping) -> Result<()> {
        let local = SocketAddr::new(self.local_ip, mapping.internal_port);
        self.gateway
            .add_port(
                PortMappingProtocol::TCP,
                mapping.external_port,
                local,
                mapping.lease.as_secs() as u32,
                &mapping.description,
            )
            .await
            .map_err(|e| HttpsifyError::PortMapping {
                external_port: mapping.external_port,
                reason: e.to_string(),
            })
    }

    async fn delete_port_mapping(&self, mapping: &PortMapping) -> Result<()> {
        self.gateway
            .remove_port(PortMappingProtocol::TCP, mapping.external_port)
            .await
            .map_err(|e| HttpsifyError::PortMapping {
                external_port: mapping.external_port,
                reason: e.to_string(),
            })
    }

    async fn external_ip(&self) -> Result<IpAddr> {
        self.gateway
            .get_external_ip()
            .await
            .map_err(|e| HttpsifyError::GatewayDiscovery(e.to_string()))
    }
}

/// Discover exactly one gateway; every step is bounded by `timeout`
pub async fn discover_gateway(timeout: Duration) -> Result<Arc<dyn NatGateway>> {
    let gateway: Arc<dyn NatGateway> = Arc::new(IgdGateway::discover(timeout).await?);
    report_external_ip(gateway.as_ref(), timeout).await;
    Ok(gateway)
}

/// Log the gateway's external address; gives up after `timeout`
pub async fn report_external_ip(gateway: &dyn NatGateway, timeout: Duration) -> Option<IpAddr> {
    match tokio::time::timeout(timeout, gateway.external_ip()).await {
        Ok(Ok(ip)) => {
            info!("Gateway reports external address {}", ip);
            Some(ip)
        }
        Ok(Err(e)) => {
            debug!("External address unavailable: {}", e);
            None
        }
        Err(_) => {
            warn!("Gateway did not report its external address within {:?}", timeout);
            None
        }
    }
}

/// Owns the mapping table and the gateway handle
pub struct NatManager {
    gateway: Arc<dyn NatGateway>,
    mappings: Vec<PortMapping>,
    refresh_interval: Duration,
    operation_timeout: Duration,
}

impl NatManager {
    pub fn new(gateway: Arc<dyn NatGateway>, settings: &NatSettings) -> Self {
        Self {
            gateway,
            mappings: settings
                .mappings
                .iter()
                .map(|pair| PortMapping::new(*pair, settings.lease))
                .collect(),
            refresh_interval: settings.refresh_interval,
            operation_timeout: settings.operation_timeout,
        }
    }

    pub fn mappings(&self) -> &[PortMapping] {
        &self.mappings
    }

    async fn add(&self, mapping: &PortMapping) -> Result<()> {
        tokio::time::timeout(self.operation_timeout, self.gateway.add_port_mapping(mapping))
            .await
            .map_err(|_| HttpsifyError::PortMapping {
                external_port: mapping.external_port,
                reason: "timed out".to_string(),
            })?
    }

    async fn delete(&self, mapping: &PortMapping) -> Result<()> {
        tokio::time::timeout(self.operation_timeout, self.gateway.delete_port_mapping(mapping))
            .await
            .map_err(|_| HttpsifyError::PortMapping {
                external_port: mapping.external_port,
                reason: "timed out".to_string(),
            })?
    }

    /// Initial mapping: drop any stale entry on the external port, then add
    pub async fn map_all(&self) {
        for mapping in &self.mappings {
            if let Err(e) = self.delete(mapping).await {
                debug!("No stale mapping removed for port {}: {}", mapping.external_port, e);
            }
            match self.add(mapping).await {
                Ok(()) => info!(
                    "Mapped internal port {} to external port {}",
                    mapping.internal_port, mapping.external_port
                ),
                Err(e) => warn!("{}; retrying on next refresh", e),
            }
        }
    }

    /// Re-create every mapping; failures are isolated per mapping
    pub async fn refresh(&self) {
        for mapping in &self.mappings {
            match self.add(mapping).await {
                Ok(()) => debug!("Refreshed mapping for external port {}", mapping.external_port),
                Err(e) => warn!("{}", e),
            }
        }
    }

    /// Best-effort removal of every mapping
    pub async fn teardown(&self) {
        for mapping in &self.mappings {
            match self.delete(mapping).await {
                Ok(()) => info!("Removed mapping for external port {}", mapping.external_port),
                Err(e) => warn!("{}; it will expire with its lease", e),
            }
        }
    }

    /// Map, refresh until cancelled, then tear down
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Detected gateway type: {}", self.gateway.kind());
        self.map_all().await;

        let mut ticker = tokio::time::interval(self.refresh_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.refresh().await,
            }
        }

        self.teardown().await;
    }
}


#[cfg(test)]
mod tests {
    use super::mock::MockGateway;
    use super::*;

    fn settings(pairs: &[(u16, u16)]) -> NatSettings {
        NatSettings {
            mappings: pairs
                .iter()
                .map(|&(internal, external)| PortPair { internal, external })
                .collect(),
            lease: Duration::from_secs(60),
            refresh_interval: Duration::from_millis(20),
            discovery_timeout: Duration::from_secs(1),
            operation_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_refresh_twice_leaves_one_mapping() {
        let gateway = Arc::new(MockGateway::default());
        let manager = NatManager::new(gateway.clone(), &settings(&[(4443, 443)]));

        manager.refresh().await;
        manager.refresh().await;

        let table = gateway.table.lock().unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table[&443].internal_port, 4443);
        assert_eq!(table[&443].lease, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_map_all_replaces_stale_entry() {
        let gateway = Arc::new(MockGateway::default());
        gateway.table.lock().unwrap().insert(
            443,
            PortMapping::new(PortPair { internal: 9999, external: 443 }, Duration::from_secs(60)),
        );

        let manager = NatManager::new(gateway.clone(), &settings(&[(4443, 443)]));
        manager.map_all().await;

        let table = gateway.table.lock().unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table[&443].internal_port, 4443);
    }

    #[tokio::test]
    async fn test_single_failure_does_not_abort_others() {
        let gateway = Arc::new(MockGateway::default());
        gateway.failing_ports.lock().unwrap().insert(80);

        let manager = NatManager::new(gateway.clone(), &settings(&[(8080, 80), (4443, 443)]));
        manager.map_all().await;
        manager.refresh().await;

        let table = gateway.table.lock().unwrap();
        assert!(table.contains_key(&443));
        assert!(!table.contains_key(&80));
        assert_eq!(*gateway.add_calls.lock().unwrap(), 4);
    }

    #[tokio::test]
    async fn test_cancel_removes_all_mappings() {
        let gateway = Arc::new(MockGateway::default());
        let manager = NatManager::new(gateway.clone(), &settings(&[(4443, 443), (8080, 80)]));

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(manager.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(gateway.table.lock().unwrap().len(), 2);
        assert!(*gateway.add_calls.lock().unwrap() > 2, "refresh loop should have run");

        shutdown.cancel();
        task.await.unwrap();
        assert!(gateway.table.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_external_ip_query_is_bounded() {
        let gateway = MockGateway {
            stalled: true,
            ..Default::default()
        };

        let started = std::time::Instant::now();
        let ip = report_external_ip(&gateway, Duration::from_millis(50)).await;
        assert!(ip.is_none());
        assert!(started.elapsed() < Duration::from_secs(1));

        let answering = MockGateway::default();
        let ip = report_external_ip(&answering, Duration::from_millis(50)).await;
        assert_eq!(ip, Some(IpAddr::from([198, 51, 100, 1])));
    }

    #[test]
    fn test_port_mapping_from_pair() {
        let mapping = PortMapping::new(PortPair { internal: 4443, external: 443 }, Duration::from_secs(60));
        assert_eq!(mapping.internal_port, 4443);
        assert_eq!(mapping.external_port, 443);
        assert_eq!(mapping.description, "httpsify");
    }
}
