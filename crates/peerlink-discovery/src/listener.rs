//! Passive discovery listener
//!
//! Sits at the service port plus a fixed offset and answers `discover`
//! probes, recording each caller as it goes.

use crate::registry::{observed_address, PeerRegistry, UpsertOutcome};
use peerlink_core::transport::{read_message, write_message};
use peerlink_core::{ControlMessage, Error, ErrorStatus, Peer, Result};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct Responder {
    registry: Arc<PeerRegistry>,
    username: String,
    service_port: u16,
    io_timeout: Duration,
    new_peers: Option<mpsc::UnboundedSender<Peer>>,
}

pub struct PassiveListener {
    listener: TcpListener,
    responder: Responder,
}

impl PassiveListener {
    /// Bind at `first_port`, moving up one port per conflict for up to
    /// `attempts` tries. Port 0 binds once to an OS-assigned port.
    pub async fn bind(
        host: IpAddr,
        first_port: u16,
        attempts: u16,
        registry: Arc<PeerRegistry>,
        username: impl Into<String>,
        service_port: u16,
    ) -> Result<Self> {
        let listener = bind_with_retry(host, first_port, attempts).await?;
        if let Ok(addr) = listener.local_addr() {
            info!("Discovery listener on {}", addr);
        }
        Ok(Self {
            listener,
            responder: Responder {
                registry,
                username: username.into(),
                service_port,
                io_timeout: Duration::from_secs(5),
                new_peers: None,
            },
        })
    }

    /// Report callers seen for the first time on `tx`
    pub fn with_peer_notifications(mut self, tx: mpsc::UnboundedSender<Peer>) -> Self {
        self.responder.new_peers = Some(tx);
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.responder.io_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the accept loop on its own task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        let responder = Arc::new(self.responder);
        loop {
            match self.listener.accept().await {
                Ok((stream, source)) => {
                    let responder = responder.clone();
                    tokio::spawn(async move {
                        if let Err(e) = responder.answer(stream, source).await {
                            debug!("Discovery probe from {} failed: {}", source, e);
                        }
                    });
                }
                Err(e) => {
                    warn!("Discovery listener accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

impl Responder {
    async fn answer(&self, mut stream: TcpStream, source: SocketAddr) -> Result<()> {
        let request = tokio::time::timeout(self.io_timeout, read_message(&mut stream))
            .await
            .map_err(|_| Error::Timeout(format!("reading probe from {}", source)))?;

        let response = match request {
            Ok(ControlMessage::Discover { username, ip, port }) => {
                if username != self.username {
                    self.record(username, source.ip(), ip.as_deref(), port).await;
                }
                ControlMessage::DiscoverResponse {
                    username: self.username.clone(),
                    port: self.service_port,
                }
            }
            Ok(ControlMessage::Unknown) => {
                ControlMessage::error(ErrorStatus::UnknownMessageType, "unknown message type")
            }
            Ok(other) => ControlMessage::error(
                ErrorStatus::UnexpectedMessage,
                format!("discovery listener does not handle {}", other.kind()),
            ),
            Err(Error::Json(e)) => ControlMessage::error(ErrorStatus::MalformedMessage, e.to_string()),
            Err(e) => return Err(e),
        };

        tokio::time::timeout(self.io_timeout, write_message(&mut stream, &response))
            .await
            .map_err(|_| Error::Timeout(format!("answering probe from {}", source)))?
    }

    async fn record(&self, username: String, source: IpAddr, claimed: Option<&str>, port: u16) {
        let ip = observed_address(source, claimed);
        let peer = Peer::new(username, ip, port);
        if self.registry.upsert(peer.clone()).await == UpsertOutcome::Inserted {
            info!("Probed by new peer {} at {}", peer.username, ip);
            if let Some(tx) = &self.new_peers {
                let _ = tx.send(peer);
            }
        }
    }
}

async fn bind_with_retry(host: IpAddr, first_port: u16, attempts: u16) -> Result<TcpListener> {
    if first_port == 0 {
        return Ok(TcpListener::bind((host, 0)).await?);
    }

    let mut last_error = None;
    for offset in 0..attempts.max(1) {
        let Some(port) = first_port.checked_add(offset) else {
            break;
        };
        match TcpListener::bind((host, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                debug!("Discovery port {} unavailable: {}", port, e);
                last_error = Some(e);
            }
        }
    }
    Err(match last_error {
        Some(e) => Error::Io(e),
        None => Error::InvalidInput(format!("no discovery port available from {}", first_port)),
    })
}
