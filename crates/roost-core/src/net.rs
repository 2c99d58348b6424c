//! Unix-socket helpers and the length-prefixed frame codec.
//!
//! Every IPC message is one frame: a u32 length followed by a bincode
//! payload. The frame size is capped so a corrupt length cannot make us
//! allocate unbounded memory.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixListener;
use tracing::error;

use roost_proto::error::{RoostError, RoostResult};

/// Upper bound on a single IPC frame.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Bind a Unix listener, removing a stale socket file first.
pub fn create_listen_socket(path: &Path) -> RoostResult<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    UnixListener::bind(path).map_err(|e| {
        error!("cannot bind {}: {}", path.display(), e);
        RoostError::SystemError
    })
}

/// Read one frame. Returns `Ok(None)` on a clean end-of-stream.
pub async fn read_frame<T, R>(stream: &mut R) -> RoostResult<Option<T>>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let len = match stream.read_u32().await {
        Ok(n) => n as usize,
        Err(_) => return Ok(None), // Peer disconnected cleanly
    };

    if len > MAX_FRAME_BYTES {
        error!("frame too large: {} bytes", len);
        return Err(RoostError::InvalidParms);
    }

    let mut buf = vec![0u8; len];
    stream
        .read_exact(&mut buf)
        .await
        .map_err(|_| RoostError::NetworkError)?;

    bincode::deserialize::<T>(&buf)
        .map(Some)
        .map_err(|_| {
            error!("failed to deserialize frame");
            RoostError::InvalidParms
        })
}

/// Write one frame.
pub async fn write_frame<T, W>(stream: &mut W, msg: &T) -> RoostResult<()>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let data = bincode::serialize(msg).map_err(|_| RoostError::SystemError)?;
    stream
        .write_u32(data.len() as u32)
        .await
        .map_err(|_| RoostError::NetworkError)?;
    stream
        .write_all(&data)
        .await
        .map_err(|_| RoostError::NetworkError)?;
    Ok(())
}

/// Read one frame as raw bytes, without deserializing the payload.
/// Returns `Ok(None)` on a clean end-of-stream.
pub async fn read_raw_frame<R>(stream: &mut R) -> RoostResult<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let len = match stream.read_u32().await {
        Ok(n) => n as usize,
        Err(_) => return Ok(None),
    };
    if len > MAX_FRAME_BYTES {
        error!("frame too large: {} bytes", len);
        return Err(RoostError::InvalidParms);
    }
    let mut buf = vec![0u8; len];
    stream
        .read_exact(&mut buf)
        .await
        .map_err(|_| RoostError::NetworkError)?;
    Ok(Some(buf))
}

/// Write raw bytes as one frame.
pub async fn write_raw_frame<W>(stream: &mut W, payload: &[u8]) -> RoostResult<()>
where
    W: AsyncWrite + Unpin,
{
    stream
        .write_u32(payload.len() as u32)
        .await
        .map_err(|_| RoostError::NetworkError)?;
    stream
        .write_all(payload)
        .await
        .map_err(|_| RoostError::NetworkError)?;
    Ok(())
}
