//! File body framing and destination naming
//!
//! The body of a transfer is a sequence of chunks, each a 4-byte big-endian
//! length followed by that many bytes of file content. A zero length ends the
//! stream.

use crate::transport::LEN_SIZE;
use crate::{Error, Result, CHUNK_SIZE};
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest chunk a receiver accepts (16 MiB)
pub const MAX_CHUNK_LEN: usize = 16 * 1024 * 1024;

/// Stream `source` as length-prefixed chunks followed by the terminator.
/// Returns the number of content bytes sent. Any single read or write
/// stalling longer than `idle` aborts the stream.
pub async fn send_body<R, W>(
    source: &mut R,
    writer: &mut W,
    chunk_size: usize,
    idle: Duration,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let chunk_size = if chunk_size == 0 { CHUNK_SIZE } else { chunk_size.min(MAX_CHUNK_LEN) };
    let mut buffer = vec![0u8; chunk_size];
    let mut total = 0u64;

    loop {
        let bytes_read = source.read(&mut buffer).await?;
        if bytes_read == 0 {
            break;
        }
        within(idle, writer.write_all(&(bytes_read as u32).to_be_bytes())).await?;
        within(idle, writer.write_all(&buffer[..bytes_read])).await?;
        total += bytes_read as u64;
        tracing::trace!("Sent chunk of {} bytes ({} total)", bytes_read, total);
    }

    within(idle, writer.write_all(&0u32.to_be_bytes())).await?;
    within(idle, writer.flush()).await?;
    Ok(total)
}

/// Read chunks until the terminator, writing each to `sink`.
///
/// `received` is advanced as chunks land so a caller still sees the partial
/// count when the stream fails midway.
pub async fn receive_body<R, W>(
    reader: &mut R,
    sink: &mut W,
    received: &mut u64,
    idle: Duration,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = Vec::new();
    loop {
        let mut len_buf = [0u8; LEN_SIZE];
        within(idle, reader.read_exact(&mut len_buf)).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 {
            break;
        }
        if len > MAX_CHUNK_LEN {
            return Err(Error::FrameTooLarge {
                len,
                limit: MAX_CHUNK_LEN,
            });
        }

        buffer.resize(len, 0);
        within(idle, reader.read_exact(&mut buffer)).await?;
        sink.write_all(&buffer).await?;
        *received += len as u64;
    }
    sink.flush().await?;
    Ok(*received)
}

async fn within<T>(idle: Duration, io: impl Future<Output = std::io::Result<T>>) -> Result<T> {
    match tokio::time::timeout(idle, io).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(Error::Transfer(
            "connection lost during file transfer".to_string(),
        )),
        Ok(Err(e)) => Err(Error::Io(e)),
        Err(_) => Err(Error::Timeout("file transfer stalled".to_string())),
    }
}

/// Keep only the final path component of a peer-supplied file name
pub fn sanitize_file_name(name: &str) -> String {
    let candidate = name.rsplit(|c: char| c == '/' || c == '\\').next().unwrap_or("").trim();
    if candidate.is_empty() || candidate == "." || candidate == ".." {
        "received_file".to_string()
    } else {
        candidate.to_string()
    }
}

/// Create a new file in `dir` for `file_name`, appending `_1`, `_2`, ...
/// before the extension on collision. The name is claimed with
/// `create_new`, so concurrent callers never share a file.
pub async fn create_destination(dir: &Path, file_name: &str) -> Result<(PathBuf, File)> {
    let file_name = sanitize_file_name(file_name);
    let path = Path::new(&file_name);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(&file_name)
        .to_string();
    let extension = path.extension().and_then(|e| e.to_str());

    let mut counter = 0u32;
    loop {
        let name = match (counter, extension) {
            (0, _) => file_name.clone(),
            (n, Some(ext)) => format!("{}_{}.{}", stem, n, ext),
            (n, None) => format!("{}_{}", stem, n),
        };
        let candidate = dir.join(name);
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await
        {
            Ok(file) => return Ok((candidate, file)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => counter += 1,
            Err(e) => return Err(e.into()),
        }
    }
}
