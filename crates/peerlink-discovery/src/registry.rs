//! Peer registry keyed by display name

use peerlink_core::{unix_now, Peer};
use std::collections::HashMap;
use std::net::IpAddr;
use tokio::sync::RwLock;

/// What an upsert did to the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// First record for this name
    Inserted,
    /// Existing record refreshed, address taken from the update
    Updated,
    /// Existing non-loopback address kept over a loopback update
    KeptAddress,
}

/// The set of known peers, safe to share between tasks
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<String, Peer>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a sighting of `peer` into the registry.
    ///
    /// A loopback address never replaces a known non-loopback one; use
    /// [`PeerRegistry::upsert_forced`] to correct an address explicitly.
    pub async fn upsert(&self, peer: Peer) -> UpsertOutcome {
        self.merge(peer, false).await
    }

    /// Merge a sighting, taking its address unconditionally
    pub async fn upsert_forced(&self, peer: Peer) -> UpsertOutcome {
        self.merge(peer, true).await
    }

    async fn merge(&self, peer: Peer, force: bool) -> UpsertOutcome {
        let mut peers = self.peers.write().await;
        let Some(existing) = peers.get_mut(&peer.username) else {
            tracing::debug!("New peer {} at {}", peer.username, peer.addr());
            peers.insert(peer.username.clone(), peer);
            return UpsertOutcome::Inserted;
        };

        let keep_address = !force && peer.ip.is_loopback() && !existing.ip.is_loopback();
        if keep_address {
            tracing::debug!(
                "Keeping {} for {} over loopback sighting",
                existing.ip,
                peer.username
            );
        } else {
            existing.ip = peer.ip;
        }
        existing.port = peer.port;
        existing.online = true;
        existing.last_seen = existing.last_seen.max(peer.last_seen);
        existing.discovery_port = peer.discovery_port.or(existing.discovery_port);

        if keep_address {
            UpsertOutcome::KeptAddress
        } else {
            UpsertOutcome::Updated
        }
    }

    pub async fn get(&self, username: &str) -> Option<Peer> {
        self.peers.read().await.get(username).cloned()
    }

    pub async fn contains(&self, username: &str) -> bool {
        self.peers.read().await.contains_key(username)
    }

    /// Snapshot of all peers, ordered by name
    pub async fn list(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.read().await.values().cloned().collect();
        peers.sort_by(|a, b| a.username.cmp(&b.username));
        peers
    }

    /// Peers still recorded at a loopback address
    pub async fn loopback_peers(&self) -> Vec<Peer> {
        self.list()
            .await
            .into_iter()
            .filter(|p| p.is_loopback())
            .collect()
    }

    /// Returns false if the name is unknown
    pub async fn mark_offline(&self, username: &str) -> bool {
        match self.peers.write().await.get_mut(username) {
            Some(peer) => {
                peer.online = false;
                true
            }
            None => false,
        }
    }

    /// Record a successful contact; returns false if the name is unknown
    pub async fn mark_online(&self, username: &str) -> bool {
        match self.peers.write().await.get_mut(username) {
            Some(peer) => {
                peer.online = true;
                peer.last_seen = unix_now();
                true
            }
            None => false,
        }
    }

    /// Refresh last-seen without changing the online flag
    pub async fn touch(&self, username: &str) -> bool {
        match self.peers.write().await.get_mut(username) {
            Some(peer) => {
                peer.last_seen = unix_now();
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }
}

/// Address to record for a peer that contacted us.
///
/// The connection's source address is authoritative. Only when the source is
/// loopback (same host) and the peer claims a routable address is the claim
/// preferred, so same-host peers still get a LAN-reachable entry.
pub fn observed_address(source: IpAddr, claimed: Option<&str>) -> IpAddr {
    if !source.is_loopback() {
        return source;
    }
    claimed
        .and_then(|c| c.parse::<IpAddr>().ok())
        .filter(|ip| !ip.is_loopback() && !ip.is_unspecified())
        .unwrap_or(source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn lan(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, last))
    }

    fn loopback() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    #[tokio::test]
    async fn test_one_record_per_name() {
        let registry = PeerRegistry::new();
        assert_eq!(
            registry.upsert(Peer::new("bob", lan(20), 12346)).await,
            UpsertOutcome::Inserted
        );
        assert_eq!(
            registry.upsert(Peer::new("bob", lan(21), 12347)).await,
            UpsertOutcome::Updated
        );

        assert_eq!(registry.len().await, 1);
        let bob = registry.get("bob").await.unwrap();
        assert_eq!(bob.ip, lan(21));
        assert_eq!(bob.port, 12347);
    }

    #[tokio::test]
    async fn test_loopback_never_downgrades_lan_address() {
        let registry = PeerRegistry::new();
        registry.upsert(Peer::new("bob", lan(20), 12346)).await;

        let outcome = registry.upsert(Peer::new("bob", loopback(), 12350)).await;
        assert_eq!(outcome, UpsertOutcome::KeptAddress);

        let bob = registry.get("bob").await.unwrap();
        assert_eq!(bob.ip, lan(20));
        assert_eq!(bob.port, 12350);
    }

    #[tokio::test]
    async fn test_lan_address_replaces_loopback_and_force_overrides() {
        let registry = PeerRegistry::new();
        registry.upsert(Peer::new("bob", loopback(), 12346)).await;
        registry.upsert(Peer::new("bob", lan(20), 12346)).await;
        assert_eq!(registry.get("bob").await.unwrap().ip, lan(20));

        registry.upsert_forced(Peer::new("bob", loopback(), 12346)).await;
        assert_eq!(registry.get("bob").await.unwrap().ip, loopback());
        assert_eq!(registry.loopback_peers().await.len(), 1);
    }

    #[tokio::test]
    async fn test_discovery_hint_survives_updates_without_one() {
        let registry = PeerRegistry::new();
        registry
            .upsert(Peer::new("bob", lan(20), 12346).with_discovery_port(12446))
            .await;
        registry.upsert(Peer::new("bob", lan(20), 12346)).await;
        assert_eq!(registry.get("bob").await.unwrap().discovery_port, Some(12446));
    }

    #[tokio::test]
    async fn test_offline_and_back() {
        let registry = PeerRegistry::new();
        assert!(!registry.mark_offline("ghost").await);
        assert!(registry.get("ghost").await.is_none());

        registry.upsert(Peer::new("bob", lan(20), 12346)).await;
        assert!(registry.mark_offline("bob").await);
        assert!(!registry.get("bob").await.unwrap().online);

        assert!(registry.mark_online("bob").await);
        assert!(registry.get("bob").await.unwrap().online);
    }

    #[test]
    fn test_observed_address_prefers_real_source() {
        // Loopback claim from a LAN source is corrected to the source
        assert_eq!(observed_address(lan(30), Some("127.0.0.1")), lan(30));
        // Same-host connection keeps a routable claim
        assert_eq!(observed_address(loopback(), Some("192.168.1.30")), lan(30));
        assert_eq!(observed_address(loopback(), Some("garbage")), loopback());
        assert_eq!(observed_address(loopback(), None), loopback());
    }
}
