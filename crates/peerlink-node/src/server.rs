//! Transport server: one control message per inbound connection

use crate::dispatcher::{Dispatch, MessageDispatcher};
use crate::transfer::FileTransferEngine;
use peerlink_core::transport::{read_message, write_message};
use peerlink_core::{ControlMessage, Error, ErrorStatus, Result};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Bind the first free port in `[base_port, base_port + range)`, then
/// `fallback_port`. A base port of 0 binds an OS-assigned port.
pub async fn bind_service_port(
    host: IpAddr,
    base_port: u16,
    range: u16,
    fallback_port: u16,
) -> Result<TcpListener> {
    if base_port == 0 {
        return Ok(TcpListener::bind((host, 0)).await?);
    }

    for offset in 0..range {
        let Some(port) = base_port.checked_add(offset) else {
            break;
        };
        match TcpListener::bind((host, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => tracing::debug!("Port {} unavailable: {}", port, e),
        }
    }

    tracing::warn!(
        "No free port in {}..{}, trying fallback {}",
        base_port,
        base_port.saturating_add(range),
        fallback_port
    );
    Ok(TcpListener::bind((host, fallback_port)).await?)
}

pub struct TransportServer {
    listener: TcpListener,
    dispatcher: Arc<MessageDispatcher>,
    transfers: Arc<FileTransferEngine>,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl TransportServer {
    pub fn new(
        listener: TcpListener,
        dispatcher: Arc<MessageDispatcher>,
        transfers: Arc<FileTransferEngine>,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Self {
        Self {
            listener,
            dispatcher,
            transfers,
            read_timeout,
            write_timeout,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Accept loop; each connection is served on its own task
    pub async fn run(self) {
        if let Ok(addr) = self.listener.local_addr() {
            tracing::info!("Listening for peers on {}", addr);
        }
        let server = Arc::new(Connection {
            dispatcher: self.dispatcher,
            transfers: self.transfers,
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
        });

        loop {
            match self.listener.accept().await {
                Ok((stream, source)) => {
                    let server = server.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle(stream, source).await {
                            tracing::debug!("Connection from {} ended: {}", source, e);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

struct Connection {
    dispatcher: Arc<MessageDispatcher>,
    transfers: Arc<FileTransferEngine>,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl Connection {
    async fn handle(&self, mut stream: TcpStream, source: SocketAddr) -> Result<()> {
        let request = match tokio::time::timeout(self.read_timeout, read_message(&mut stream)).await
        {
            Ok(request) => request,
            Err(_) => return Err(Error::Timeout(format!("reading from {}", source))),
        };

        let dispatch = match request {
            Ok(msg) => self.dispatcher.dispatch(msg, source).await,
            Err(Error::Json(e)) => {
                tracing::warn!("Malformed message from {}: {}", source, e);
                Dispatch::Reply(ControlMessage::error(
                    ErrorStatus::MalformedMessage,
                    e.to_string(),
                ))
            }
            Err(e @ Error::FrameTooLarge { .. }) => {
                tracing::warn!("Oversized message from {}: {}", source, e);
                Dispatch::Reply(ControlMessage::error(
                    ErrorStatus::MalformedMessage,
                    e.to_string(),
                ))
            }
            Err(e) => return Err(e),
        };

        match dispatch {
            Dispatch::Reply(response) => {
                tokio::time::timeout(self.write_timeout, write_message(&mut stream, &response))
                    .await
                    .map_err(|_| Error::Timeout(format!("writing to {}", source)))?
            }
            Dispatch::Transfer {
                request_id,
                sender,
                file_name,
                file_size,
            } => {
                self.transfers
                    .receive(&mut stream, &request_id, &sender, &file_name, file_size)
                    .await?;
                Ok(())
            }
        }
    }
}
