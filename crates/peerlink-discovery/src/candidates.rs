//! Scan candidate planning
//!
//! The active scan walks the local /24 in priority tiers so the likeliest
//! hosts are probed before the budget runs out.

use crate::DiscoveryConfig;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Why a candidate was included, in probe order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Tier {
    /// Address of a peer already in the registry
    Known,
    /// Own host, any discovery port
    OwnHost,
    /// Host octets within the neighbour span of our own
    Neighbor,
    /// Low host octets where routers and servers usually sit
    Infrastructure,
    /// Everything else on the subnet, first port only
    Sweep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub addr: SocketAddr,
    pub tier: Tier,
}

/// Ordered, duplicate-free list of addresses to probe
#[derive(Debug, Clone, Default)]
pub struct ScanPlan {
    candidates: Vec<Candidate>,
    seen: HashSet<SocketAddr>,
    exclude: Option<SocketAddr>,
}

impl ScanPlan {
    /// Build the plan for a host at `local_ip`.
    ///
    /// `ports` are the discovery ports to try, in preference order.
    /// `known` addresses are probed first. `own_listener` is our own passive
    /// listener and is never probed.
    pub fn build(
        local_ip: IpAddr,
        ports: &[u16],
        known: &[SocketAddr],
        own_listener: Option<SocketAddr>,
        config: &DiscoveryConfig,
    ) -> Self {
        let mut plan = ScanPlan {
            exclude: own_listener,
            ..Default::default()
        };

        for addr in known {
            plan.push(*addr, Tier::Known);
        }
        for port in ports {
            plan.push(SocketAddr::new(local_ip, *port), Tier::OwnHost);
        }

        // Loopback and IPv6 hosts have no subnet worth sweeping
        let IpAddr::V4(local_v4) = local_ip else {
            return plan;
        };
        if local_v4.is_loopback() || local_v4.is_unspecified() {
            return plan;
        }

        let [a, b, c, own] = local_v4.octets();
        let host = |octet: u8| IpAddr::V4(Ipv4Addr::new(a, b, c, octet));
        let few_ports = &ports[..ports.len().min(config.infrastructure_ports)];

        let low = own.saturating_sub(config.neighbor_span).max(1);
        let high = own.saturating_add(config.neighbor_span).min(254);
        for octet in low..=high {
            if octet == own {
                continue;
            }
            for port in few_ports {
                plan.push(SocketAddr::new(host(octet), *port), Tier::Neighbor);
            }
        }

        for octet in 1..=config.infrastructure_hosts.min(254) {
            for port in few_ports {
                plan.push(SocketAddr::new(host(octet), *port), Tier::Infrastructure);
            }
        }

        if let Some(first) = ports.first() {
            for octet in 1..=254u8 {
                plan.push(SocketAddr::new(host(octet), *first), Tier::Sweep);
            }
        }

        plan
    }

    fn push(&mut self, addr: SocketAddr, tier: Tier) {
        if Some(addr) == self.exclude || !self.seen.insert(addr) {
            return;
        }
        self.candidates.push(Candidate { addr, tier });
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

impl IntoIterator for ScanPlan {
    type Item = Candidate;
    type IntoIter = std::vec::IntoIter<Candidate>;

    fn into_iter(self) -> Self::IntoIter {
        self.candidates.into_iter()
    }
}

/// Addresses near `ip` on its /24 (own octet excluded), closest first
pub fn neighbors(ip: IpAddr, span: u8) -> Vec<IpAddr> {
    let IpAddr::V4(v4) = ip else {
        return Vec::new();
    };
    if v4.is_loopback() {
        return Vec::new();
    }
    let [a, b, c, own] = v4.octets();
    let mut out = Vec::new();
    for delta in 1..=span {
        if let Some(octet) = own.checked_sub(delta).filter(|o| *o >= 1) {
            out.push(IpAddr::V4(Ipv4Addr::new(a, b, c, octet)));
        }
        if let Some(octet) = own.checked_add(delta).filter(|o| *o <= 254) {
            out.push(IpAddr::V4(Ipv4Addr::new(a, b, c, octet)));
        }
    }
    out
}
