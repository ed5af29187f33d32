//! The node facade
//!
//! [`Node`] owns the listeners and exposes every user-facing action. Actions
//! are bounded by the configured action timeout and report failures as
//! [`peerlink_core::Error`].

use crate::config::Config;
use crate::dispatcher::MessageDispatcher;
use crate::events::{self, emit, EventReceiver, NodeEvent};
use crate::groups::{GroupCoordinator, Outbound};
use crate::server::{bind_service_port, TransportServer};
use crate::state::{ChatEntry, NodeState};
use crate::transfer::{FileTransferEngine, InboundRequest};
use peerlink_core::{
    unix_now, Connector, ControlMessage, Error, Group, Invitation, Peer, Result, TransportConfig,
};
use peerlink_discovery::{DiscoveryEngine, LocalIdentity, PassiveListener, PeerRegistry};
use std::collections::BTreeMap;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct Node {
    state: Arc<NodeState>,
    discovery: DiscoveryEngine,
    service_addr: SocketAddr,
    discovery_addr: SocketAddr,
    action_timeout: Duration,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Bind the service and discovery listeners and start serving.
    ///
    /// Returns the node and the receiving end of its event channel.
    pub async fn start(config: &Config) -> Result<(Node, EventReceiver)> {
        let username = config.username.trim().to_string();
        if username.is_empty() {
            return Err(Error::InvalidInput("username is empty".into()));
        }
        let host = config.bind_host()?;
        let network = &config.network;

        let listener = bind_service_port(
            host,
            network.base_port,
            network.port_range,
            network.fallback_port,
        )
        .await?;
        let service_addr = listener.local_addr()?;
        let service_port = service_addr.port();

        let local_ip = if host.is_unspecified() {
            peerlink_discovery::local_ip()
        } else {
            host
        };

        let (events_tx, events_rx) = events::channel();
        let registry = Arc::new(PeerRegistry::new());
        let connector = Connector::new(TransportConfig {
            connect_timeout: network.send_timeout(),
            io_timeout: network.send_timeout(),
        });
        let transfers = Arc::new(FileTransferEngine::new(
            &username,
            config.download_dir(),
            config.transfer.chunk_size,
            connector.clone(),
            events_tx.clone(),
        ));
        let state = Arc::new(NodeState {
            username: username.clone(),
            local_ip,
            service_port,
            registry: registry.clone(),
            groups: tokio::sync::Mutex::new(GroupCoordinator::new(&username)),
            transfers: transfers.clone(),
            messages: tokio::sync::Mutex::new(Vec::new()),
            events: events_tx.clone(),
            connector,
            dial_loopback: host.is_unspecified(),
        });

        let mut tasks = Vec::new();
        let server = TransportServer::new(
            listener,
            Arc::new(MessageDispatcher::new(state.clone())),
            transfers,
            network.read_timeout(),
            network.send_timeout(),
        );
        tasks.push(server.spawn());

        let passive = bind_discovery_listener(config, host, service_port, &registry, &username).await?;
        let discovery_addr = passive.local_addr()?;
        let (peer_tx, mut peer_rx) = tokio::sync::mpsc::unbounded_channel::<Peer>();
        tasks.push(passive.with_peer_notifications(peer_tx.clone()).spawn());
        let forward = events_tx.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(peer) = peer_rx.recv().await {
                emit(&forward, NodeEvent::PeerDiscovered(peer));
            }
        }));

        let first_probe_port = network.base_port.saturating_add(network.discovery_offset);
        let discovery = DiscoveryEngine::new(
            registry,
            LocalIdentity {
                username: username.clone(),
                ip: local_ip,
                service_port,
                discovery_port: Some(discovery_addr.port()),
            },
            config.discovery.clone(),
            first_probe_port,
            network.discovery_offset,
        )
        .with_peer_notifications(peer_tx);

        info!(
            "{} serving on {} (discovery on {})",
            username, service_addr, discovery_addr
        );
        let node = Node {
            state,
            discovery,
            service_addr,
            discovery_addr,
            action_timeout: network.action_timeout(),
            tasks,
        };
        Ok((node, events_rx))
    }

    pub fn username(&self) -> &str {
        &self.state.username
    }

    pub fn local_ip(&self) -> IpAddr {
        self.state.local_ip
    }

    pub fn service_addr(&self) -> SocketAddr {
        self.service_addr
    }

    pub fn discovery_addr(&self) -> SocketAddr {
        self.discovery_addr
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.state.registry
    }

    /// Restrict active scans to these discovery ports
    pub fn set_probe_ports(&mut self, ports: Vec<u16>) {
        self.discovery.set_probe_ports(ports);
    }

    /// Scan the network and repair loopback entries; returns all known peers
    pub async fn discover(&self) -> Vec<Peer> {
        self.discovery.scan().await;
        let repaired = self.discovery.fix_localhost_addresses().await;
        if repaired > 0 {
            info!("Repaired {} loopback peer addresses", repaired);
        }
        self.state.registry.list().await
    }

    /// Probe one discovery listener address directly and record the peer
    pub async fn add_peer(&self, discovery_addr: SocketAddr) -> Result<Peer> {
        let (username, port) = self.discovery.probe(discovery_addr).await?;
        if username == self.state.username {
            return Err(Error::InvalidInput(format!("{} is ourselves", discovery_addr)));
        }
        let peer = Peer::new(&username, discovery_addr.ip(), port)
            .with_discovery_port(discovery_addr.port());
        self.state.registry.upsert(peer).await;
        self.state
            .registry
            .get(&username)
            .await
            .ok_or_else(|| Error::UnknownPeer(username))
    }

    pub async fn peers(&self) -> Vec<Peer> {
        self.state.registry.list().await
    }

    /// Liveness probe; the peer is marked online or offline accordingly
    pub async fn check_peer(&self, username: &str) -> Result<bool> {
        let ping = ControlMessage::Ping {
            username: self.state.username.clone(),
            port: Some(self.state.service_port),
        };
        match self.bounded(self.state.exchange(username, &ping, "pong")).await {
            Ok(_) => Ok(true),
            Err(Error::UnknownPeer(name)) => Err(Error::UnknownPeer(name)),
            Err(e) => {
                info!("{} did not answer: {}", username, e);
                self.state.registry.mark_offline(username).await;
                Ok(false)
            }
        }
    }

    pub async fn send_chat(&self, username: &str, message: &str) -> Result<()> {
        if message.is_empty() {
            return Err(Error::InvalidInput("message is empty".into()));
        }
        let timestamp = unix_now();
        let msg = ControlMessage::ChatMessage {
            sender: self.state.username.clone(),
            message: message.to_string(),
            timestamp,
        };
        self.bounded(self.state.exchange(username, &msg, "chat_ack"))
            .await?;
        self.state.messages.lock().await.push(ChatEntry {
            peer: username.to_string(),
            message: message.to_string(),
            timestamp,
            incoming: false,
        });
        Ok(())
    }

    /// Chat history, oldest first
    pub async fn messages(&self) -> Vec<ChatEntry> {
        self.state.messages.lock().await.clone()
    }

    /// Offer a file to a peer; returns the request id. The transfer itself
    /// starts when the peer accepts.
    pub async fn send_file(&self, username: &str, path: &Path) -> Result<String> {
        if !self.state.registry.contains(username).await {
            return Err(Error::UnknownPeer(username.to_string()));
        }
        let request = self.state.transfers.prepare_outbound(username, path).await?;
        let msg = ControlMessage::FileSendRequest {
            request_id: request.request_id.clone(),
            sender: self.state.username.clone(),
            file_name: request.file_name.clone(),
            file_size: request.file_size,
            timestamp: unix_now(),
        };
        if let Err(e) = self
            .bounded(self.state.exchange(username, &msg, "notification_sent"))
            .await
        {
            self.state.transfers.cancel_outbound(&request.request_id).await;
            return Err(e);
        }
        info!("Offered {} to {}", request.file_name, username);
        Ok(request.request_id)
    }

    /// Accept or decline a file a peer offered
    pub async fn respond_to_file_request(&self, request_id: &str, accepted: bool) -> Result<()> {
        let request = self.state.transfers.answer_inbound(request_id, accepted).await?;
        let msg = ControlMessage::FileSendResponse {
            request_id: request_id.to_string(),
            sender: self.state.username.clone(),
            accepted,
        };
        self.bounded(self.state.exchange(&request.sender, &msg, "ack"))
            .await?;
        Ok(())
    }

    pub async fn pending_file_requests(&self) -> Vec<InboundRequest> {
        self.state.transfers.inbound_requests().await
    }

    /// Create a group and invite `members`; every invitee must be known.
    /// Returns the invitees that could not be reached.
    pub async fn create_group(&self, name: &str, members: &[String]) -> Result<Vec<String>> {
        for member in members {
            if *member != self.state.username && !self.state.registry.contains(member).await {
                return Err(Error::UnknownPeer(member.clone()));
            }
        }
        let outbound = self.state.groups.lock().await.create_group(name, members)?;
        Ok(self.deliver(outbound).await)
    }

    /// Invite one more known peer to a group
    pub async fn invite(&self, group: &str, username: &str) -> Result<()> {
        if !self.state.registry.contains(username).await {
            return Err(Error::UnknownPeer(username.to_string()));
        }
        let outbound = self.state.groups.lock().await.invite(group, username)?;
        self.bounded(self.state.exchange(&outbound.to, &outbound.message, "ack"))
            .await?;
        Ok(())
    }

    /// Accept or decline a received invitation. When the inviter cannot be
    /// told, the local decision is undone and the invitation stays open.
    pub async fn respond_to_invitation(&self, group: &str, accept: bool) -> Result<()> {
        let (outbound, invitation, joined) = {
            let mut groups = self.state.groups.lock().await;
            let invitation = groups
                .received_invitation(group)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("invitation to {}", group)))?;
            let joined = accept && groups.group(group).is_none();
            let outbound = if accept {
                groups.accept_invitation(group)?
            } else {
                groups.decline_invitation(group)?
            };
            (outbound, invitation, joined)
        };

        let delivered = self
            .bounded(self.state.exchange(&outbound.to, &outbound.message, "ack"))
            .await;
        if let Err(e) = delivered {
            warn!("Could not answer {} about {}: {}", outbound.to, group, e);
            self.state
                .groups
                .lock()
                .await
                .restore_invitation(invitation, joined);
            return Err(e);
        }
        Ok(())
    }

    /// Announce one of our directories to group members (all of them when
    /// `recipients` is empty). Returns the members that could not be reached.
    pub async fn share_directory(
        &self,
        group: &str,
        directory: &Path,
        recipients: &[String],
    ) -> Result<Vec<String>> {
        let is_dir = tokio::fs::metadata(directory)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Err(Error::NotFound(directory.display().to_string()));
        }
        let directory = directory.display().to_string();
        let outbound = self
            .state
            .groups
            .lock()
            .await
            .share_directory(group, &directory, recipients)?;
        Ok(self.deliver(outbound).await)
    }

    pub async fn groups(&self) -> Vec<Group> {
        self.state.groups.lock().await.groups()
    }

    pub async fn members(&self, group: &str) -> Result<Vec<String>> {
        self.state.groups.lock().await.members(group)
    }

    pub async fn shared_directories(&self, group: &str) -> Result<BTreeMap<String, Vec<String>>> {
        self.state.groups.lock().await.shared_directories(group)
    }

    pub async fn received_invitations(&self) -> Vec<Invitation> {
        self.state.groups.lock().await.received_invitations().to_vec()
    }

    pub fn download_dir(&self) -> PathBuf {
        self.state.transfers.download_dir().to_path_buf()
    }

    /// Tell online peers we are leaving, then stop serving. Dropping the
    /// node stops it without the announcement.
    pub async fn shutdown(self) {
        let farewell = ControlMessage::StatusUpdate {
            username: self.state.username.clone(),
            online: false,
        };
        let outbound = self
            .state
            .registry
            .list()
            .await
            .into_iter()
            .filter(|p| p.online)
            .map(|p| Outbound {
                to: p.username,
                message: farewell.clone(),
            })
            .collect();
        let unreachable = self.deliver(outbound).await;
        if !unreachable.is_empty() {
            warn!("Could not announce shutdown to {}", unreachable.join(", "));
        }
        info!("{} stopped", self.state.username);
    }

    async fn deliver(&self, outbound: Vec<Outbound>) -> Vec<String> {
        let failures = match tokio::time::timeout(
            self.action_timeout,
            self.state.deliver_all(outbound.clone()),
        )
        .await
        {
            Ok(failures) => failures,
            Err(_) => {
                return outbound.into_iter().map(|o| o.to).collect();
            }
        };
        failures
            .into_iter()
            .map(|(peer, e)| {
                warn!("Could not deliver to {}: {}", peer, e);
                peer
            })
            .collect()
    }

    async fn bounded<T>(&self, action: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.action_timeout, action)
            .await
            .map_err(|_| Error::Timeout(format!("action exceeded {:?}", self.action_timeout)))?
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn bind_discovery_listener(
    config: &Config,
    host: IpAddr,
    service_port: u16,
    registry: &Arc<PeerRegistry>,
    username: &str,
) -> Result<PassiveListener> {
    let network = &config.network;
    let io_timeout = network.send_timeout();
    if let Some(port) = service_port.checked_add(network.discovery_offset) {
        match PassiveListener::bind(
            host,
            port,
            network.discovery_bind_attempts,
            registry.clone(),
            username,
            service_port,
        )
        .await
        {
            Ok(listener) => return Ok(listener.with_io_timeout(io_timeout)),
            Err(e) => warn!("Discovery port {} unavailable ({}), using any free port", port, e),
        }
    }
    let listener =
        PassiveListener::bind(host, 0, 1, registry.clone(), username, service_port).await?;
    Ok(listener.with_io_timeout(io_timeout))
}
