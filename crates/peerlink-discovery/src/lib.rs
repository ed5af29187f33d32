//! PeerLink Discovery - Finding peers on the local network
//!
//! This crate keeps the peer registry and populates it two ways: an active
//! scan of the local subnet and a passive listener answering other peers'
//! probes.

pub mod candidates;
pub mod engine;
pub mod listener;
pub mod registry;

pub use engine::{DiscoveryEngine, LocalIdentity};
pub use listener::PassiveListener;
pub use registry::{observed_address, PeerRegistry, UpsertOutcome};

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Discovery tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Per-probe connect timeout
    pub connect_timeout_ms: u64,
    /// Per-probe wait for `discover_response`
    pub reply_timeout_ms: u64,
    /// Wall-clock budget for a whole scan
    pub scan_budget_secs: u64,
    /// Probes in flight at once
    pub max_concurrent_probes: usize,
    /// Host octets on either side of our own probed with several ports
    pub neighbor_span: u8,
    /// Host octets 1..=N treated as infrastructure
    pub infrastructure_hosts: u8,
    /// Ports tried on neighbour and infrastructure hosts
    pub infrastructure_ports: usize,
    /// Discovery ports in the scanned range
    pub port_count: u16,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 2000,
            reply_timeout_ms: 2000,
            scan_budget_secs: 45,
            max_concurrent_probes: 64,
            neighbor_span: 10,
            infrastructure_hosts: 20,
            infrastructure_ports: 3,
            port_count: peerlink_core::DEFAULT_PORT_RANGE,
        }
    }
}

impl DiscoveryConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn scan_budget(&self) -> Duration {
        Duration::from_secs(self.scan_budget_secs)
    }
}

/// This host's LAN address, or 127.0.0.1 when none can be determined
pub fn local_ip() -> IpAddr {
    match local_ip_address::local_ip() {
        Ok(ip) => ip,
        Err(e) => {
            tracing::warn!("Could not determine local IP, using loopback: {}", e);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}
