//! State shared by the server, the dispatcher and the node facade

use crate::events::EventSender;
use crate::groups::{GroupCoordinator, Outbound};
use crate::transfer::FileTransferEngine;
use peerlink_core::{Connector, ControlMessage, Error, Result};
use peerlink_discovery::PeerRegistry;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// One chat message, sent or received
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEntry {
    /// The other party
    pub peer: String,
    pub message: String,
    pub timestamp: u64,
    pub incoming: bool,
}

pub struct NodeState {
    pub username: String,
    /// LAN address announced to peers
    pub local_ip: IpAddr,
    pub service_port: u16,
    pub registry: Arc<PeerRegistry>,
    pub groups: Mutex<GroupCoordinator>,
    pub transfers: Arc<FileTransferEngine>,
    pub messages: Mutex<Vec<ChatEntry>>,
    pub events: EventSender,
    pub connector: Connector,
    /// Peers at our own LAN address are dialled over loopback
    pub dial_loopback: bool,
}

impl NodeState {
    /// Service address to dial for `username`
    pub async fn resolve(&self, username: &str) -> Result<SocketAddr> {
        let peer = self
            .registry
            .get(username)
            .await
            .ok_or_else(|| Error::UnknownPeer(username.to_string()))?;
        if self.dial_loopback && peer.ip == self.local_ip && !peer.ip.is_loopback() {
            return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), peer.port));
        }
        Ok(peer.addr())
    }

    /// One request/response exchange with a named peer. The peer is marked
    /// online on success and offline when it cannot be reached.
    pub async fn request(&self, username: &str, msg: &ControlMessage) -> Result<ControlMessage> {
        let addr = self.resolve(username).await?;
        match self.connector.request(addr, msg).await {
            Ok(response) => {
                self.registry.mark_online(username).await;
                Ok(response)
            }
            Err(e) => {
                if matches!(
                    e,
                    Error::Timeout(_) | Error::ConnectionRefused(_) | Error::Io(_)
                ) {
                    self.registry.mark_offline(username).await;
                }
                warn!("Sending {} to {} failed: {}", msg.kind(), username, e);
                Err(e)
            }
        }
    }

    /// Send `msg` and require `expected` back; an `error` reply becomes
    /// [`Error::Rejected`]
    pub async fn exchange(
        &self,
        username: &str,
        msg: &ControlMessage,
        expected: &str,
    ) -> Result<ControlMessage> {
        let response = self.request(username, msg).await?;
        expect_kind(response, expected)
    }

    /// Deliver coordinator output, each message in its own task
    pub fn deliver(self: &Arc<Self>, outbound: Vec<Outbound>) {
        for out in outbound {
            let state = self.clone();
            tokio::spawn(async move {
                if let Err(e) = state.request(&out.to, &out.message).await {
                    debug!("Delivery of {} to {} failed: {}", out.message.kind(), out.to, e);
                }
            });
        }
    }

    /// Deliver coordinator output concurrently and wait; returns the failures
    pub async fn deliver_all(self: &Arc<Self>, outbound: Vec<Outbound>) -> Vec<(String, Error)> {
        let mut sends = JoinSet::new();
        for out in outbound {
            let state = self.clone();
            sends.spawn(async move {
                let result = state.request(&out.to, &out.message).await;
                (out.to, result)
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = sends.join_next().await {
            match joined {
                Ok((to, Ok(ControlMessage::Error { message, .. }))) => {
                    failures.push((to, Error::Rejected(message)))
                }
                Ok((_, Ok(_))) => {}
                Ok((to, Err(e))) => failures.push((to, e)),
                Err(e) => warn!("Delivery task failed: {}", e),
            }
        }
        failures
    }
}

/// Check a response's type
pub fn expect_kind(response: ControlMessage, expected: &str) -> Result<ControlMessage> {
    match response {
        ControlMessage::Error { status, message } => {
            Err(Error::Rejected(format!("{:?}: {}", status, message)))
        }
        other if other.kind() == expected => Ok(other),
        other => Err(Error::Protocol(format!(
            "expected {}, got {}",
            expected,
            other.kind()
        ))),
    }
}
