//! IPC proxy multiplexer.
//!
//! A remote (non-cluster) node has no local IPC services of its own;
//! its clients' conversations are tunneled here and relayed into the
//! real services on this cluster node. Each conversation is one session,
//! keyed by an opaque session id; proxied requests record their message
//! id so the eventual answer can be relayed back under the same id.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use roost_proto::error::{RoostError, RoostResult};
use roost_proto::message::{ProxyMsg, PROXY_FLAG_PROXIED, PROXY_FLAG_RELAY_RESPONSE};

/// Timeout for the backwards-compatible synchronous forward.
pub const SYNC_FORWARD_TIMEOUT: Duration = Duration::from_secs(10);

/// A connection to one local IPC service.
#[async_trait]
pub trait LocalChannel: Send + Sync {
    /// Whether the connection is still usable.
    fn connected(&self) -> bool;

    /// Forward a request whose answer (if any) comes back through
    /// `recv`. The origin node name travels along for access control.
    async fn send_async(&self, origin: &str, payload: &[u8]) -> RoostResult<()>;

    /// Forward a request and wait inline for the reply.
    async fn send_sync(
        &self,
        origin: &str,
        payload: &[u8],
        timeout: Duration,
    ) -> RoostResult<Option<Vec<u8>>>;

    /// Next buffer emitted by the service: `(flags, payload)`.
    async fn recv(&self) -> RoostResult<(u32, Vec<u8>)>;
}

/// Opens connections to local services by channel name.
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    async fn connect(&self, channel: &str) -> RoostResult<Arc<dyn LocalChannel>>;
}

struct ProxySession {
    session_id: String,
    node_name: String,
    channel: String,
    conn: Option<Arc<dyn LocalChannel>>,
    /// Non-zero while a proxied request awaits its response.
    last_request_id: u64,
    /// The session targets our own service; forwarding would re-enter
    /// ourselves, so requests on it are protocol errors.
    is_local_shortcut: bool,
}

/// The session table plus the tunnel toward one remote node.
pub struct ProxyMux {
    /// Our own service name, used for the loop guard.
    local_service: String,
    sessions: DashMap<String, Arc<tokio::sync::Mutex<ProxySession>>>,
    to_remote: mpsc::Sender<ProxyMsg>,
    factory: Arc<dyn ChannelFactory>,
    accept_shutdown: bool,
}

impl ProxyMux {
    pub fn new(
        local_service: &str,
        factory: Arc<dyn ChannelFactory>,
        to_remote: mpsc::Sender<ProxyMsg>,
        accept_shutdown: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_service: local_service.to_string(),
            sessions: DashMap::new(),
            to_remote,
            factory,
            accept_shutdown,
        })
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    async fn send_remote(&self, msg: ProxyMsg) {
        if self.to_remote.send(msg).await.is_err() {
            warn!("remote tunnel is gone, dropping outbound message");
        }
    }

    async fn notify_destroy(&self, session_id: &str) {
        self.send_remote(ProxyMsg::Destroy {
            session_id: session_id.to_string(),
        })
        .await;
    }

    /// Tear a session down and tell the remote side about it.
    async fn end_session(&self, session_id: &str) {
        if self.sessions.remove(session_id).is_some() {
            trace!("ending session {}", session_id);
        }
        self.notify_destroy(session_id).await;
    }

    /// Handle one tunneled message from the remote node.
    pub async fn handle_remote(self: &Arc<Self>, msg: ProxyMsg) {
        match msg {
            ProxyMsg::New {
                session_id,
                channel,
                node_name,
            } => {
                self.open_session(session_id, channel, node_name).await;
            }

            ProxyMsg::Request {
                session_id,
                msg_id,
                flags,
                payload,
                client,
            } => {
                self.forward_request(&session_id, msg_id, flags, payload, client)
                    .await;
            }

            ProxyMsg::Destroy { session_id } => {
                if self.sessions.remove(&session_id).is_some() {
                    trace!("remote destroyed session {}", session_id);
                } else {
                    debug!("destroy for unknown session {}", session_id);
                }
            }

            ProxyMsg::ShutdownReq => {
                if self.accept_shutdown {
                    info!("acknowledging remote shutdown request");
                    self.send_remote(ProxyMsg::ShutdownAck).await;
                } else {
                    info!("declining remote shutdown request");
                    self.send_remote(ProxyMsg::ShutdownNack).await;
                }
            }

            other => {
                error!("unexpected proxy operation from remote: {:?}", other);
            }
        }
    }

    async fn open_session(self: &Arc<Self>, session_id: String, channel: String, node_name: String) {
        if channel.is_empty() {
            error!("no channel specified for session {}", session_id);
            self.notify_destroy(&session_id).await;
            return;
        }

        let is_local_shortcut = channel == self.local_service;
        let conn = if is_local_shortcut {
            // Our own service must not connect to itself.
            None
        } else {
            match self.factory.connect(&channel).await {
                Ok(conn) => Some(conn),
                Err(err) => {
                    warn!(
                        "cannot open channel {} for session {}: {}",
                        channel, session_id, err
                    );
                    self.notify_destroy(&session_id).await;
                    return;
                }
            }
        };

        trace!(
            "new proxy session {} to {} for {}",
            session_id,
            channel,
            node_name
        );
        let session = Arc::new(tokio::sync::Mutex::new(ProxySession {
            session_id: session_id.clone(),
            node_name,
            channel,
            conn: conn.clone(),
            last_request_id: 0,
            is_local_shortcut,
        }));
        self.sessions.insert(session_id.clone(), session);

        // Pump unsolicited service buffers back toward the remote until
        // the service disconnects.
        if let Some(conn) = conn {
            let mux = self.clone();
            tokio::spawn(async move {
                loop {
                    match conn.recv().await {
                        Ok((flags, payload)) => {
                            mux.handle_local(&session_id, flags, payload).await;
                        }
                        Err(_) => {
                            mux.local_disconnected(&session_id).await;
                            break;
                        }
                    }
                }
            });
        }
    }

    async fn forward_request(
        &self,
        session_id: &str,
        msg_id: u64,
        flags: u32,
        payload: Vec<u8>,
        client: Option<String>,
    ) {
        let Some(session) = self.sessions.get(session_id).map(|s| s.value().clone()) else {
            debug!("request for unknown session {}", session_id);
            self.notify_destroy(session_id).await;
            return;
        };

        let mut session = session.lock().await;

        if session.is_local_shortcut {
            // Guard against loops: our own requests must not re-enter us.
            error!(
                "request {} on session {} would loop back into {}",
                msg_id, session_id, self.local_service
            );
            drop(session);
            self.end_session(session_id).await;
            return;
        }

        let Some(conn) = session.conn.clone() else {
            drop(session);
            self.end_session(session_id).await;
            return;
        };
        if !conn.connected() {
            drop(session);
            self.end_session(session_id).await;
            return;
        }

        session.last_request_id = 0;
        let origin = session.node_name.clone();

        if flags & PROXY_FLAG_PROXIED != 0 {
            match conn.send_async(&origin, &payload).await {
                Ok(()) => {
                    trace!(
                        "relayed request {} from {} to {} for {}",
                        msg_id,
                        origin,
                        session.channel,
                        client.as_deref().unwrap_or("-")
                    );
                    session.last_request_id = msg_id;
                }
                Err(err) => {
                    error!(
                        "could not relay request {} from {} to {}: {}",
                        msg_id, origin, session.channel, err
                    );
                    // Negative acknowledgment so the caller does not block
                    let nack = err.to_code().to_be_bytes().to_vec();
                    let sid = session.session_id.clone();
                    drop(session);
                    self.send_remote(ProxyMsg::Response {
                        session_id: sid,
                        msg_id,
                        payload: nack,
                    })
                    .await;
                }
            }
        } else {
            // Backwards-compatible synchronous forward
            match conn.send_sync(&origin, &payload, SYNC_FORWARD_TIMEOUT).await {
                Ok(Some(reply)) => {
                    let sid = session.session_id.clone();
                    drop(session);
                    self.send_remote(ProxyMsg::Response {
                        session_id: sid,
                        msg_id,
                        payload: reply,
                    })
                    .await;
                }
                Ok(None) => {}
                Err(err) => {
                    error!(
                        "could not relay request {} from {} to {}: {}",
                        msg_id, origin, session.channel, err
                    );
                }
            }
        }
    }

    /// A local service emitted a buffer toward the remote side: relay it
    /// as the response to the outstanding proxied request when the buffer
    /// says so, as an event otherwise.
    pub async fn handle_local(&self, session_id: &str, flags: u32, payload: Vec<u8>) {
        let Some(session) = self.sessions.get(session_id).map(|s| s.value().clone()) else {
            debug!("local buffer for unknown session {}", session_id);
            return;
        };
        let mut session = session.lock().await;

        if flags & PROXY_FLAG_RELAY_RESPONSE != 0 && session.last_request_id != 0 {
            let msg_id = session.last_request_id;
            session.last_request_id = 0;
            trace!(
                "passing response {} back to {} on {}",
                msg_id,
                session.session_id,
                session.node_name
            );
            let sid = session.session_id.clone();
            drop(session);
            self.send_remote(ProxyMsg::Response {
                session_id: sid,
                msg_id,
                payload,
            })
            .await;
        } else {
            trace!(
                "passing event back to {} on {}",
                session.session_id,
                session.node_name
            );
            let sid = session.session_id.clone();
            drop(session);
            self.send_remote(ProxyMsg::Event {
                session_id: sid,
                payload,
            })
            .await;
        }
    }

    /// The local service behind a session disconnected.
    pub async fn local_disconnected(&self, session_id: &str) {
        if let Some((_, session)) = self.sessions.remove(session_id) {
            let mut session = session.lock().await;
            session.conn = None;
            trace!("local service for session {} disconnected", session_id);
            self.notify_destroy(session_id).await;
        }
    }
}
