//! Active discovery: subnet scan and loopback repair

use crate::candidates::{neighbors, ScanPlan};
use crate::registry::{PeerRegistry, UpsertOutcome};
use crate::DiscoveryConfig;
use peerlink_core::{Connector, ControlMessage, Error, Peer, Result, TransportConfig};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info};

/// Who we are, as announced in `discover` probes
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub username: String,
    pub ip: IpAddr,
    /// Port of our transport server
    pub service_port: u16,
    /// Port of our own passive listener, never probed
    pub discovery_port: Option<u16>,
}

impl LocalIdentity {
    fn hello(&self) -> ControlMessage {
        ControlMessage::Discover {
            username: self.username.clone(),
            ip: Some(self.ip.to_string()),
            port: self.service_port,
        }
    }
}

/// A `discover_response` and the address that produced it
#[derive(Debug, Clone)]
struct Sighting {
    addr: SocketAddr,
    username: String,
    port: u16,
}

pub struct DiscoveryEngine {
    registry: Arc<PeerRegistry>,
    identity: LocalIdentity,
    config: DiscoveryConfig,
    probe_ports: Vec<u16>,
    discovery_offset: u16,
    connector: Connector,
    new_peers: Option<mpsc::UnboundedSender<Peer>>,
}

impl DiscoveryEngine {
    /// `first_probe_port` is the lowest discovery port in the scanned range;
    /// `discovery_offset` maps a service port to its listener port.
    pub fn new(
        registry: Arc<PeerRegistry>,
        identity: LocalIdentity,
        config: DiscoveryConfig,
        first_probe_port: u16,
        discovery_offset: u16,
    ) -> Self {
        let probe_ports = (0..config.port_count)
            .filter_map(|i| first_probe_port.checked_add(i))
            .collect();
        let connector = Connector::new(TransportConfig {
            connect_timeout: config.connect_timeout(),
            io_timeout: config.reply_timeout(),
        });
        Self {
            registry,
            identity,
            config,
            probe_ports,
            discovery_offset,
            connector,
            new_peers: None,
        }
    }

    /// Report peers a scan adds to the registry
    pub fn with_peer_notifications(mut self, tx: mpsc::UnboundedSender<Peer>) -> Self {
        self.new_peers = Some(tx);
        self
    }

    /// Replace the scanned port list
    pub fn with_probe_ports(mut self, ports: Vec<u16>) -> Self {
        self.probe_ports = ports;
        self
    }

    pub fn set_probe_ports(&mut self, ports: Vec<u16>) {
        self.probe_ports = ports;
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    /// Scan, then repair loopback entries; returns the registry afterwards
    pub async fn discover(&self) -> Vec<Peer> {
        let found = self.scan().await;
        let repaired = self.fix_localhost_addresses().await;
        info!(
            "Discovery finished: {} peers answered, {} loopback entries repaired",
            found.len(),
            repaired
        );
        self.registry.list().await
    }

    /// Probe a single address with our `discover` message
    pub async fn probe(&self, addr: SocketAddr) -> Result<(String, u16)> {
        probe_with(&self.connector, addr, &self.identity.hello()).await
    }

    /// Run one active scan within the configured budget.
    ///
    /// Returns the peers that answered. Probe failures are swallowed; a scan
    /// never fails.
    pub async fn scan(&self) -> Vec<Peer> {
        let plan = ScanPlan::build(
            self.identity.ip,
            &self.probe_ports,
            &self.known_addresses().await,
            self.own_listener(),
            &self.config,
        );
        info!("Scanning {} candidates", plan.len());

        let deadline = tokio::time::Instant::now() + self.config.scan_budget();
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_probes.max(1)));
        let (tx, mut rx) = mpsc::unbounded_channel::<Sighting>();

        let connector = self.connector.clone();
        let hello = self.identity.hello();
        let feeder = tokio::spawn(async move {
            for candidate in plan {
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };
                let tx = tx.clone();
                let connector = connector.clone();
                let hello = hello.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    match probe_with(&connector, candidate.addr, &hello).await {
                        Ok((username, port)) => {
                            let _ = tx.send(Sighting {
                                addr: candidate.addr,
                                username,
                                port,
                            });
                        }
                        Err(e) => debug!("Probe {} failed: {}", candidate.addr, e),
                    }
                });
            }
        });

        let mut found: HashMap<String, Peer> = HashMap::new();
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(sighting)) => {
                    if let Some(peer) = self.record(sighting).await {
                        found.insert(peer.username.clone(), peer);
                    }
                }
                // Every probe finished
                Ok(None) => break,
                Err(_) => {
                    info!("Scan budget exhausted, abandoning outstanding probes");
                    feeder.abort();
                    break;
                }
            }
        }

        let mut found: Vec<Peer> = found.into_values().collect();
        found.sort_by(|a, b| a.username.cmp(&b.username));
        found
    }

    async fn record(&self, sighting: Sighting) -> Option<Peer> {
        if sighting.username == self.identity.username {
            return None;
        }
        let peer = Peer::new(&sighting.username, sighting.addr.ip(), sighting.port)
            .with_discovery_port(sighting.addr.port());
        if self.registry.upsert(peer.clone()).await == UpsertOutcome::Inserted {
            info!("Discovered {} at {}", sighting.username, sighting.addr.ip());
            if let Some(tx) = &self.new_peers {
                let _ = tx.send(peer);
            }
        }
        self.registry.get(&sighting.username).await
    }

    /// Re-probe loopback-tagged peers at our LAN address and its neighbours,
    /// replacing the entry when the same name answers. Returns the number of
    /// entries repaired.
    pub async fn fix_localhost_addresses(&self) -> usize {
        if self.identity.ip.is_loopback() {
            return 0;
        }

        let mut addresses = vec![self.identity.ip];
        addresses.extend(neighbors(self.identity.ip, self.config.neighbor_span));
        self.repair_loopback_peers(&addresses).await
    }

    /// Probe every loopback-tagged peer at each of `addresses`; the first
    /// answer carrying the same name replaces the entry
    async fn repair_loopback_peers(&self, addresses: &[IpAddr]) -> usize {
        let mut repaired = 0;
        for peer in self.registry.loopback_peers().await {
            if peer.username == self.identity.username {
                continue;
            }
            let port = peer
                .discovery_port
                .unwrap_or_else(|| peer.port.saturating_add(self.discovery_offset));

            let mut probes = JoinSet::new();
            for ip in addresses {
                let addr = SocketAddr::new(*ip, port);
                let connector = self.connector.clone();
                let hello = self.identity.hello();
                probes.spawn(async move {
                    (addr, probe_with(&connector, addr, &hello).await)
                });
            }

            while let Some(joined) = probes.join_next().await {
                let Ok((addr, Ok((username, service_port)))) = joined else {
                    continue;
                };
                if username != peer.username {
                    continue;
                }
                let fixed = Peer::new(&username, addr.ip(), service_port).with_discovery_port(port);
                self.registry.upsert_forced(fixed).await;
                info!("Repaired {} from loopback to {}", username, addr.ip());
                repaired += 1;
                probes.abort_all();
                break;
            }
        }
        repaired
    }

    async fn known_addresses(&self) -> Vec<SocketAddr> {
        self.registry
            .list()
            .await
            .into_iter()
            .filter(|p| p.username != self.identity.username)
            .map(|p| {
                let port = p
                    .discovery_port
                    .unwrap_or_else(|| p.port.saturating_add(self.discovery_offset));
                SocketAddr::new(p.ip, port)
            })
            .collect()
    }

    fn own_listener(&self) -> Option<SocketAddr> {
        self.identity
            .discovery_port
            .map(|port| SocketAddr::new(self.identity.ip, port))
    }
}

async fn probe_with(
    connector: &Connector,
    addr: SocketAddr,
    hello: &ControlMessage,
) -> Result<(String, u16)> {
    match connector.request(addr, hello).await? {
        ControlMessage::DiscoverResponse { username, port } => Ok((username, port)),
        other => Err(Error::Protocol(format!(
            "expected discover_response, got {}",
            other.kind()
        ))),
    }
}
