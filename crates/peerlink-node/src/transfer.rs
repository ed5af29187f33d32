//! File transfer engine
//!
//! A transfer runs in two phases over one dedicated connection: a
//! `file_transfer_start` header answered with `ready`, then the chunked body
//! answered with `received`. Both sides keep a table of negotiated requests so
//! that only an accepted request id can open a transfer, and only once.

use crate::events::{emit, EventSender, NodeEvent};
use peerlink_core::chunk::{create_destination, receive_body, send_body};
use peerlink_core::transport::{read_reply, write_message, write_reply};
use peerlink_core::{
    new_request_id, unix_now, Connector, ControlMessage, Error, FileTransferSession, Result,
    TransferReply,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// A file we offered to a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    pub request_id: String,
    pub peer: String,
    pub path: PathBuf,
    pub file_name: String,
    pub file_size: u64,
}

/// A file a peer offered to us
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundRequest {
    pub request_id: String,
    pub sender: String,
    pub file_name: String,
    pub file_size: u64,
    pub accepted: bool,
    pub received_at: u64,
}

pub struct FileTransferEngine {
    username: String,
    download_dir: PathBuf,
    chunk_size: usize,
    connector: Connector,
    outbound: Mutex<HashMap<String, OutboundRequest>>,
    inbound: Mutex<HashMap<String, InboundRequest>>,
    events: EventSender,
}

impl FileTransferEngine {
    pub fn new(
        username: impl Into<String>,
        download_dir: PathBuf,
        chunk_size: usize,
        connector: Connector,
        events: EventSender,
    ) -> Self {
        Self {
            username: username.into(),
            download_dir,
            chunk_size,
            connector,
            outbound: Mutex::new(HashMap::new()),
            inbound: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// Register a file we are about to offer to `peer`
    pub async fn prepare_outbound(&self, peer: &str, path: &Path) -> Result<OutboundRequest> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|_| Error::NotFound(path.display().to_string()))?;
        if !metadata.is_file() {
            return Err(Error::InvalidInput(format!("{} is not a file", path.display())));
        }
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::InvalidInput(format!("unusable file name: {}", path.display())))?
            .to_string();

        let request = OutboundRequest {
            request_id: new_request_id(&self.username, &file_name),
            peer: peer.to_string(),
            path: path.to_path_buf(),
            file_name,
            file_size: metadata.len(),
        };
        self.outbound
            .lock()
            .await
            .insert(request.request_id.clone(), request.clone());
        Ok(request)
    }

    /// Forget an outbound request
    pub async fn cancel_outbound(&self, request_id: &str) -> Option<OutboundRequest> {
        self.outbound.lock().await.remove(request_id)
    }

    pub async fn outbound_requests(&self) -> Vec<OutboundRequest> {
        self.outbound.lock().await.values().cloned().collect()
    }

    /// Record an offer from a peer; false if the request id is already known
    pub async fn register_inbound(
        &self,
        request_id: &str,
        sender: &str,
        file_name: &str,
        file_size: u64,
    ) -> bool {
        let mut inbound = self.inbound.lock().await;
        if inbound.contains_key(request_id) {
            return false;
        }
        inbound.insert(
            request_id.to_string(),
            InboundRequest {
                request_id: request_id.to_string(),
                sender: sender.to_string(),
                file_name: file_name.to_string(),
                file_size,
                accepted: false,
                received_at: unix_now(),
            },
        );
        true
    }

    /// Accept or drop an offer. Accepted offers stay until their transfer
    /// arrives.
    pub async fn answer_inbound(&self, request_id: &str, accepted: bool) -> Result<InboundRequest> {
        let mut inbound = self.inbound.lock().await;
        let request = if accepted {
            let request = inbound
                .get_mut(request_id)
                .ok_or_else(|| Error::NotFound(format!("file request {}", request_id)))?;
            request.accepted = true;
            request.clone()
        } else {
            inbound
                .remove(request_id)
                .ok_or_else(|| Error::NotFound(format!("file request {}", request_id)))?
        };
        Ok(request)
    }

    /// Offers still waiting for a decision
    pub async fn inbound_requests(&self) -> Vec<InboundRequest> {
        let mut pending: Vec<InboundRequest> = self
            .inbound
            .lock()
            .await
            .values()
            .filter(|r| !r.accepted)
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.received_at);
        pending
    }

    /// Peer an outbound request was offered to
    pub async fn outbound_peer(&self, request_id: &str) -> Option<String> {
        self.outbound
            .lock()
            .await
            .get(request_id)
            .map(|r| r.peer.clone())
    }

    /// Handle the peer's decision on one of our offers.
    ///
    /// On acceptance the request leaves the table and its transfer starts on
    /// its own task, so a request id drives at most one transfer. Returns
    /// false for an unknown request id or a response from anyone but the
    /// peer the file was offered to; the request is kept in that case.
    pub async fn handle_response(
        self: &Arc<Self>,
        request_id: &str,
        peer: &str,
        accepted: bool,
        addr: Option<SocketAddr>,
    ) -> bool {
        let request = {
            let mut outbound = self.outbound.lock().await;
            match outbound.get(request_id) {
                None => {
                    warn!("Response from {} for unknown request {}", peer, request_id);
                    return false;
                }
                Some(request) if request.peer != peer => {
                    warn!(
                        "Ignoring response from {} for request {} offered to {}",
                        peer, request_id, request.peer
                    );
                    return false;
                }
                Some(_) => {}
            }
            match outbound.remove(request_id) {
                Some(request) => request,
                None => return false,
            }
        };

        if !accepted {
            info!("{} declined {}", peer, request.file_name);
            emit(
                &self.events,
                NodeEvent::FileRejected {
                    request_id: request.request_id,
                    peer: peer.to_string(),
                },
            );
            return true;
        }

        let Some(addr) = addr else {
            self.report_failure(&request, "peer address unknown".to_string());
            return true;
        };

        let engine = self.clone();
        tokio::spawn(async move {
            match engine.send(addr, &request).await {
                Ok(bytes) => emit(
                    &engine.events,
                    NodeEvent::FileSent {
                        request_id: request.request_id.clone(),
                        peer: request.peer.clone(),
                        bytes,
                    },
                ),
                Err(e) => engine.report_failure(&request, e.to_string()),
            }
        });
        true
    }

    fn report_failure(&self, request: &OutboundRequest, reason: String) {
        error!("Sending {} to {} failed: {}", request.file_name, request.peer, reason);
        emit(
            &self.events,
            NodeEvent::TransferFailed {
                request_id: request.request_id.clone(),
                peer: request.peer.clone(),
                reason,
            },
        );
    }

    /// Sender side: stream the file to `addr`. Returns the byte count the
    /// receiver confirmed.
    pub async fn send(&self, addr: SocketAddr, request: &OutboundRequest) -> Result<u64> {
        let mut source = tokio::fs::File::open(&request.path).await?;
        let mut stream = self.connector.connect(addr).await?;
        let idle = self.connector.config().io_timeout;

        let header = ControlMessage::FileTransferStart {
            request_id: request.request_id.clone(),
            sender: self.username.clone(),
            file_name: request.file_name.clone(),
            file_size: request.file_size,
        };
        self.connector
            .with_timeout(addr, write_message(&mut stream, &header))
            .await?;
        match self.connector.with_timeout(addr, read_reply(&mut stream)).await? {
            TransferReply::Ready => {}
            TransferReply::Error { message } => return Err(Error::Rejected(message)),
            other => {
                return Err(Error::Protocol(format!("expected ready, got {:?}", other)));
            }
        }

        info!("Sending {} ({} bytes) to {}", request.file_name, request.file_size, addr);
        let sent = send_body(&mut source, &mut stream, self.chunk_size, idle).await?;

        match self.connector.with_timeout(addr, read_reply(&mut stream)).await? {
            TransferReply::Received { bytes } => {
                if bytes != sent {
                    warn!("{} confirmed {} of {} bytes", addr, bytes, sent);
                }
                info!("Sent {} to {}", request.file_name, request.peer);
                Ok(bytes)
            }
            TransferReply::Error { message } => Err(Error::Transfer(message)),
            TransferReply::Ready => Err(Error::Protocol("unexpected second ready".into())),
        }
    }

    /// Receiver side, after the server read a `file_transfer_start` header.
    ///
    /// The request id must belong to an accepted offer from `sender`; it is
    /// consumed here. A failure midway leaves the partial file in place.
    pub async fn receive<S>(
        &self,
        stream: &mut S,
        request_id: &str,
        sender: &str,
        file_name: &str,
        file_size: u64,
    ) -> Result<FileTransferSession>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let idle = self.connector.config().io_timeout;
        if let Err(e) = self.claim_accepted(request_id, sender).await {
            warn!("Refusing transfer {} from {}: {}", request_id, sender, e);
            let _ = write_reply(stream, &TransferReply::error(e.to_string())).await;
            return Err(e);
        }

        let (path, file) = match self.open_destination(file_name).await {
            Ok(opened) => opened,
            Err(e) => {
                error!("Cannot store {} from {}: {}", file_name, sender, e);
                let _ = write_reply(stream, &TransferReply::error(e.to_string())).await;
                self.report_inbound_failure(request_id, sender, &e);
                return Err(e);
            }
        };
        tokio::time::timeout(idle, write_reply(stream, &TransferReply::Ready))
            .await
            .map_err(|_| Error::Timeout("sending ready".into()))??;

        let mut session = FileTransferSession {
            request_id: request_id.to_string(),
            sender: sender.to_string(),
            receiver: self.username.clone(),
            file_name: file_name.to_string(),
            file_size,
            path: path.clone(),
            bytes_transferred: 0,
        };

        let mut sink = BufWriter::new(file);
        let outcome = receive_body(stream, &mut sink, &mut session.bytes_transferred, idle).await;
        let outcome = match outcome {
            Ok(_) => sink.shutdown().await.map_err(Error::from),
            Err(e) => {
                let _ = sink.flush().await;
                Err(e)
            }
        };
        if let Err(e) = outcome {
            error!(
                "Transfer of {} from {} failed after {} bytes: {}",
                file_name, sender, session.bytes_transferred, e
            );
            let _ = write_reply(stream, &TransferReply::error(e.to_string())).await;
            self.report_inbound_failure(request_id, sender, &e);
            return Err(e);
        }

        if session.bytes_transferred != file_size {
            warn!(
                "{} declared {} bytes but sent {}",
                sender, file_size, session.bytes_transferred
            );
        }
        write_reply(
            stream,
            &TransferReply::Received {
                bytes: session.bytes_transferred,
            },
        )
        .await?;

        info!(
            "Received {} from {} ({} bytes) -> {}",
            file_name,
            sender,
            session.bytes_transferred,
            path.display()
        );
        emit(
            &self.events,
            NodeEvent::FileReceived {
                sender: sender.to_string(),
                path,
                bytes: session.bytes_transferred,
            },
        );
        Ok(session)
    }

    async fn claim_accepted(&self, request_id: &str, sender: &str) -> Result<InboundRequest> {
        let mut inbound = self.inbound.lock().await;
        match inbound.get(request_id) {
            Some(r) if r.accepted && r.sender == sender => {}
            Some(r) if !r.accepted => {
                return Err(Error::Rejected(format!("request {} not accepted", request_id)))
            }
            _ => return Err(Error::Rejected(format!("no request {} from {}", request_id, sender))),
        }
        inbound
            .remove(request_id)
            .ok_or_else(|| Error::NotFound(request_id.to_string()))
    }

    async fn open_destination(&self, file_name: &str) -> Result<(PathBuf, tokio::fs::File)> {
        tokio::fs::create_dir_all(&self.download_dir).await?;
        let (path, file) = create_destination(&self.download_dir, file_name).await?;
        debug!("Writing incoming file to {}", path.display());
        Ok((path, file))
    }

    fn report_inbound_failure(&self, request_id: &str, sender: &str, e: &Error) {
        emit(
            &self.events,
            NodeEvent::TransferFailed {
                request_id: request_id.to_string(),
                peer: sender.to_string(),
                reason: e.to_string(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;
    use peerlink_core::transport::read_message;
    use peerlink_core::TransportConfig;
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    fn engine(name: &str, dir: &Path, chunk_size: usize) -> (Arc<FileTransferEngine>, events::EventReceiver) {
        let (tx, rx) = events::channel();
        let engine = FileTransferEngine::new(
            name,
            dir.to_path_buf(),
            chunk_size,
            Connector::new(TransportConfig::default()),
            tx,
        );
        (Arc::new(engine), rx)
    }

    /// Accept one connection and run the receive path on it
    async fn serve_once(receiver: Arc<FileTransferEngine>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let header = read_message(&mut stream).await.unwrap();
            if let ControlMessage::FileTransferStart {
                request_id,
                sender,
                file_name,
                file_size,
            } = header
            {
                let _ = receiver
                    .receive(&mut stream, &request_id, &sender, &file_name, file_size)
                    .await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_accepted_request_transfers_bit_identical() {
        let src_dir = TempDir::new().unwrap();
        let dst_dir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..50_000u32).map(|i| (i % 253) as u8).collect();
        let path = src_dir.path().join("data.bin");
        std::fs::write(&path, &data).unwrap();

        for chunk_size in [1000, 8192, 65536] {
            let (sender, _sender_events) = engine("bob", src_dir.path(), chunk_size);
            let (receiver, mut receiver_events) = engine("alice", dst_dir.path(), 8192);

            let request = sender.prepare_outbound("alice", &path).await.unwrap();
            assert!(receiver
                .register_inbound(&request.request_id, "bob", "data.bin", request.file_size)
                .await);
            receiver.answer_inbound(&request.request_id, true).await.unwrap();

            let addr = serve_once(receiver.clone()).await;
            let confirmed = sender.send(addr, &request).await.unwrap();
            assert_eq!(confirmed, data.len() as u64);

            match receiver_events.recv().await.unwrap() {
                NodeEvent::FileReceived { path, bytes, .. } => {
                    assert_eq!(bytes, data.len() as u64);
                    assert_eq!(std::fs::read(path).unwrap(), data);
                }
                other => panic!("Expected FileReceived, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_unaccepted_request_is_refused() {
        let src_dir = TempDir::new().unwrap();
        let dst_dir = TempDir::new().unwrap();
        let path = src_dir.path().join("note.txt");
        std::fs::write(&path, b"hello").unwrap();

        let (sender, _) = engine("bob", src_dir.path(), 8192);
        let (receiver, _) = engine("alice", dst_dir.path(), 8192);
        let request = sender.prepare_outbound("alice", &path).await.unwrap();
        receiver
            .register_inbound(&request.request_id, "bob", "note.txt", 5)
            .await;

        let addr = serve_once(receiver.clone()).await;
        let err = sender.send(addr, &request).await.unwrap_err();
        assert!(matches!(err, Error::Rejected(_)));
        assert!(!dst_dir.path().join("note.txt").exists());
    }

    #[tokio::test]
    async fn test_request_id_opens_only_one_session() {
        let src_dir = TempDir::new().unwrap();
        let dst_dir = TempDir::new().unwrap();
        let path = src_dir.path().join("note.txt");
        std::fs::write(&path, b"hello").unwrap();

        let (sender, _) = engine("bob", src_dir.path(), 8192);
        let (receiver, _) = engine("alice", dst_dir.path(), 8192);
        let request = sender.prepare_outbound("alice", &path).await.unwrap();
        receiver.register_inbound(&request.request_id, "bob", "note.txt", 5).await;
        receiver.answer_inbound(&request.request_id, true).await.unwrap();

        let addr = serve_once(receiver.clone()).await;
        sender.send(addr, &request).await.unwrap();

        let addr = serve_once(receiver.clone()).await;
        assert!(sender.send(addr, &request).await.is_err());
        assert!(!dst_dir.path().join("note_1.txt").exists());
    }

    #[tokio::test]
    async fn test_answering_and_declining_offers() {
        let dir = TempDir::new().unwrap();
        let (receiver, _) = engine("alice", dir.path(), 8192);
        assert!(receiver.register_inbound("r1", "bob", "a.txt", 1).await);
        assert!(!receiver.register_inbound("r1", "bob", "a.txt", 1).await);
        assert!(receiver.register_inbound("r2", "bob", "b.txt", 1).await);
        assert_eq!(receiver.inbound_requests().await.len(), 2);

        receiver.answer_inbound("r1", true).await.unwrap();
        receiver.answer_inbound("r2", false).await.unwrap();
        assert!(receiver.inbound_requests().await.is_empty());
        assert!(matches!(
            receiver.answer_inbound("r2", true).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_declined_response_emits_rejection() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.txt");
        std::fs::write(&path, b"x").unwrap();
        let (sender, mut events) = engine("bob", dir.path(), 8192);

        let request = sender.prepare_outbound("alice", &path).await.unwrap();
        assert!(sender.handle_response(&request.request_id, "alice", false, None).await);
        assert!(sender.outbound_requests().await.is_empty());
        assert!(matches!(events.recv().await.unwrap(), NodeEvent::FileRejected { .. }));

        assert!(!sender.handle_response("nope", "alice", true, None).await);
    }

    #[tokio::test]
    async fn test_response_from_other_peer_is_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.txt");
        std::fs::write(&path, b"x").unwrap();
        let (sender, mut events) = engine("bob", dir.path(), 8192);

        let request = sender.prepare_outbound("alice", &path).await.unwrap();
        assert_eq!(sender.outbound_peer(&request.request_id).await.as_deref(), Some("alice"));

        let stranger: SocketAddr = "127.0.0.1:9".parse().unwrap();
        assert!(!sender
            .handle_response(&request.request_id, "mallory", true, Some(stranger))
            .await);
        assert_eq!(sender.outbound_requests().await.len(), 1);
        assert!(events.try_recv().is_err());

        assert!(sender.handle_response(&request.request_id, "alice", false, None).await);
        assert!(sender.outbound_requests().await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_same_name_transfers_keep_every_file() {
        let dst_dir = TempDir::new().unwrap();
        let (receiver, _receiver_events) = engine("alice", dst_dir.path(), 8192);

        let mut sends = Vec::new();
        let mut sources = Vec::new();
        for value in 0..8u8 {
            let src_dir = TempDir::new().unwrap();
            let path = src_dir.path().join("same.bin");
            std::fs::write(&path, vec![value; 200_000]).unwrap();

            let (sender, _) = engine("bob", src_dir.path(), 4096);
            let request = sender.prepare_outbound("alice", &path).await.unwrap();
            receiver
                .register_inbound(&request.request_id, "bob", "same.bin", request.file_size)
                .await;
            receiver.answer_inbound(&request.request_id, true).await.unwrap();

            let addr = serve_once(receiver.clone()).await;
            sends.push(tokio::spawn(async move { sender.send(addr, &request).await }));
            sources.push(src_dir);
        }
        for send in sends {
            assert_eq!(send.await.unwrap().unwrap(), 200_000);
        }

        let mut values = Vec::new();
        for entry in std::fs::read_dir(dst_dir.path()).unwrap() {
            let content = std::fs::read(entry.unwrap().path()).unwrap();
            assert_eq!(content.len(), 200_000);
            assert!(content.iter().all(|b| *b == content[0]));
            values.push(content[0]);
        }
        values.sort();
        assert_eq!(values, (0..8u8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_missing_source_file() {
        let dir = TempDir::new().unwrap();
        let (sender, _) = engine("bob", dir.path(), 8192);
        assert!(matches!(
            sender.prepare_outbound("alice", &dir.path().join("absent")).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            sender.prepare_outbound("alice", dir.path()).await,
            Err(Error::InvalidInput(_))
        ));
    }
}
