//! TCP transport for control messages
//!
//! Each control message travels in its own frame: a 4-byte big-endian
//! length followed by that many bytes of JSON. A session is one request frame
//! and one response frame over a fresh connection.

use crate::proto::{ControlMessage, TransferReply};
use crate::{Error, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Length prefix size in bytes
pub const LEN_SIZE: usize = 4;

/// Largest control frame accepted (1 MiB)
pub const MAX_CONTROL_FRAME: usize = 1024 * 1024;

/// Write one length-prefixed frame
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| Error::FrameTooLarge {
        len: payload.len(),
        limit: u32::MAX as usize,
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame no longer than `limit`
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, limit: usize) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; LEN_SIZE];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > limit {
        return Err(Error::FrameTooLarge { len, limit });
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &ControlMessage,
) -> Result<()> {
    write_frame(writer, &msg.to_bytes()?).await
}

pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<ControlMessage> {
    let frame = read_frame(reader, MAX_CONTROL_FRAME).await?;
    ControlMessage::from_bytes(&frame)
}

pub async fn write_reply<W: AsyncWrite + Unpin>(writer: &mut W, reply: &TransferReply) -> Result<()> {
    write_frame(writer, &reply.to_bytes()?).await
}

pub async fn read_reply<R: AsyncRead + Unpin>(reader: &mut R) -> Result<TransferReply> {
    let frame = read_frame(reader, MAX_CONTROL_FRAME).await?;
    TransferReply::from_bytes(&frame)
}

/// Configuration for outbound sessions
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Upper bound on establishing the TCP connection
    pub connect_timeout: Duration,
    /// Upper bound on each read or write of a session
    pub io_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(5),
        }
    }
}

/// Client side of the request/response exchange
#[derive(Clone, Debug, Default)]
pub struct Connector {
    config: TransportConfig,
}

impl Connector {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Open a TCP connection, mapping refusals and timeouts to typed errors
    pub async fn connect(&self, addr: SocketAddr) -> Result<TcpStream> {
        match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                Err(Error::ConnectionRefused(addr.to_string()))
            }
            Ok(Err(e)) => Err(Error::Io(e)),
            Err(_) => Err(Error::Timeout(format!("connecting to {}", addr))),
        }
    }

    /// Send one message and wait for its response
    pub async fn request(&self, addr: SocketAddr, msg: &ControlMessage) -> Result<ControlMessage> {
        let mut stream = self.connect(addr).await?;
        tracing::debug!("Sending {} to {}", msg.kind(), addr);

        self.with_timeout(addr, write_message(&mut stream, msg)).await?;
        let response = self.with_timeout(addr, read_message(&mut stream)).await?;

        tracing::debug!("Received {} from {}", response.kind(), addr);
        Ok(response)
    }

    /// Bound an I/O future by the session timeout
    pub async fn with_timeout<T>(
        &self,
        addr: SocketAddr,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::time::timeout(self.config.io_timeout, fut)
            .await
            .map_err(|_| Error::Timeout(format!("waiting on {}", addr)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_frame_survives_fragmented_writes() {
        let (mut client, mut server) = tokio::io::duplex(8);
        let msg = ControlMessage::ChatMessage {
            sender: "alice".to_string(),
            message: "a message longer than the duplex buffer".to_string(),
            timestamp: 7,
        };

        let expected = msg.clone();
        let writer = tokio::spawn(async move { write_message(&mut client, &msg).await });
        let decoded = read_message(&mut server).await.unwrap();
        writer.await.unwrap().unwrap();

        assert_eq!(decoded, expected);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&((MAX_CONTROL_FRAME as u32) + 1).to_be_bytes());
        let mut reader = &buf[..];
        let err = read_frame(&mut reader, MAX_CONTROL_FRAME).await.unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_request_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let msg = read_message(&mut stream).await.unwrap();
            assert!(matches!(msg, ControlMessage::Ping { .. }));
            write_message(&mut stream, &ControlMessage::Pong { username: "bob".into() })
                .await
                .unwrap();
        });

        let connector = Connector::default();
        let response = connector
            .request(addr, &ControlMessage::Ping { username: "alice".into(), port: None })
            .await
            .unwrap();
        assert_eq!(response, ControlMessage::Pong { username: "bob".into() });
    }

    #[tokio::test]
    async fn test_refused_connection_is_typed() {
        // Bind then drop to obtain a port with nothing listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = Connector::default()
            .request(addr, &ControlMessage::Ack)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionRefused(_)));
    }
}
