//! Local service channels over Unix sockets.
//!
//! Proxy sessions forward remote requests into the real IPC services on
//! this node. Each service listens on `<dir>/<channel>.sock` and speaks
//! raw u32-length-prefixed frames; the payload bytes are opaque to the
//! proxy. The service marks nothing on the wire, so the channel itself
//! tracks whether the next inbound frame answers an outstanding proxied
//! request (the relay-response marker the multiplexer keys on).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{oneshot, Mutex};
use tracing::debug;

use roost_core::net::{read_raw_frame, write_raw_frame};
use roost_exec::proxy::{ChannelFactory, LocalChannel};
use roost_proto::error::{RoostError, RoostResult};
use roost_proto::message::PROXY_FLAG_RELAY_RESPONSE;

/// Connects to services by name under a socket directory.
pub struct UnixChannelFactory {
    dir: PathBuf,
}

impl UnixChannelFactory {
    pub fn new(dir: PathBuf) -> Arc<Self> {
        Arc::new(Self { dir })
    }
}

#[async_trait]
impl ChannelFactory for UnixChannelFactory {
    async fn connect(&self, channel: &str) -> RoostResult<Arc<dyn LocalChannel>> {
        let path = self.dir.join(format!("{}.sock", channel));
        let stream = UnixStream::connect(&path).await.map_err(|err| {
            debug!("cannot connect to {}: {}", path.display(), err);
            RoostError::ChannelDead
        })?;
        let (reader, writer) = stream.into_split();
        Ok(Arc::new(UnixChannel {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            awaiting_response: AtomicBool::new(false),
            pending_sync: Mutex::new(None),
            alive: AtomicBool::new(true),
        }))
    }
}

struct UnixChannel {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    /// A proxied request is outstanding; the next unsolicited frame from
    /// the service answers it.
    awaiting_response: AtomicBool,
    /// Reply slot for an in-progress synchronous forward.
    pending_sync: Mutex<Option<oneshot::Sender<Vec<u8>>>>,
    alive: AtomicBool,
}

impl UnixChannel {
    async fn write(&self, payload: &[u8]) -> RoostResult<()> {
        let mut writer = self.writer.lock().await;
        write_raw_frame(&mut *writer, payload).await.map_err(|err| {
            self.alive.store(false, Ordering::SeqCst);
            err
        })
    }
}

#[async_trait]
impl LocalChannel for UnixChannel {
    fn connected(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn send_async(&self, _origin: &str, payload: &[u8]) -> RoostResult<()> {
        self.write(payload).await?;
        self.awaiting_response.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send_sync(
        &self,
        _origin: &str,
        payload: &[u8],
        timeout: Duration,
    ) -> RoostResult<Option<Vec<u8>>> {
        let (tx, rx) = oneshot::channel();
        *self.pending_sync.lock().await = Some(tx);
        self.write(payload).await?;

        // The session pump owns the read side; the reply is routed to us
        // through the oneshot.
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(Some(reply)),
            Ok(Err(_)) => Err(RoostError::ChannelDead),
            Err(_) => {
                self.pending_sync.lock().await.take();
                Err(RoostError::TimedOut)
            }
        }
    }

    async fn recv(&self) -> RoostResult<(u32, Vec<u8>)> {
        loop {
            let frame = {
                let mut reader = self.reader.lock().await;
                read_raw_frame(&mut *reader).await
            };
            match frame {
                Ok(Some(payload)) => {
                    if let Some(tx) = self.pending_sync.lock().await.take() {
                        let _ = tx.send(payload);
                        continue;
                    }
                    let flags = if self.awaiting_response.swap(false, Ordering::SeqCst) {
                        PROXY_FLAG_RELAY_RESPONSE
                    } else {
                        0
                    };
                    return Ok((flags, payload));
                }
                Ok(None) | Err(_) => {
                    self.alive.store(false, Ordering::SeqCst);
                    return Err(RoostError::ChannelDead);
                }
            }
        }
    }
}
