//! Cluster messaging bus.
//!
//! The messaging layer is an external collaborator providing ordered
//! per-peer and all-peer delivery plus membership-change callbacks. The
//! daemons talk to it through `ClusterBus`; `LocalBus` is the in-process
//! loopback driver for single-node operation and tests.
//!
//! A broadcast is delivered to every member including the sender, which
//! is why flush messages carry an echo-suppression marker.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use roost_proto::error::{RoostError, RoostResult};
use roost_proto::message::{AttrdRequest, PeerEnvelope};

/// Events delivered from the bus to the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// An attribute message arrived from a member (possibly ourselves).
    Message(PeerEnvelope),
    /// A node joined the membership.
    PeerJoin(String),
    /// A node left the membership.
    PeerLeave(String),
}

/// Trait all cluster messaging backends implement.
#[async_trait]
pub trait ClusterBus: Send + Sync {
    /// Human-readable backend name.
    fn name(&self) -> &str;

    /// The local node's name in the membership.
    fn local_node(&self) -> &str;

    /// Send a request to every member, the sender included.
    async fn broadcast(&self, request: &AttrdRequest) -> RoostResult<()>;

    /// Send a request to one named member.
    async fn send_to(&self, peer: &str, request: &AttrdRequest) -> RoostResult<()>;

    /// Receive the next bus event. Blocks (async) until one is available.
    async fn recv_event(&self) -> RoostResult<BusEvent>;
}

/// Loopback bus: every send is delivered back through the local event
/// channel, and sends to other peers are recorded for inspection.
pub struct LocalBus {
    node_name: String,
    event_tx: mpsc::Sender<BusEvent>,
    event_rx: Arc<Mutex<mpsc::Receiver<BusEvent>>>,
    sent: Mutex<Vec<(Option<String>, PeerEnvelope)>>,
}

impl LocalBus {
    pub fn new(node_name: &str) -> Self {
        let (tx, rx) = mpsc::channel(256);
        Self {
            node_name: node_name.to_string(),
            event_tx: tx,
            event_rx: Arc::new(Mutex::new(rx)),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Inject an event as if it came off the wire (test helper).
    pub async fn inject_event(&self, event: BusEvent) -> RoostResult<()> {
        self.event_tx
            .send(event)
            .await
            .map_err(|_| RoostError::ClusterError)
    }

    /// Drain the record of outbound messages: `(target, envelope)` where
    /// a `None` target means broadcast (test helper).
    pub async fn take_sent(&self) -> Vec<(Option<String>, PeerEnvelope)> {
        std::mem::take(&mut *self.sent.lock().await)
    }

    async fn record_and_loop(
        &self,
        target: Option<String>,
        request: &AttrdRequest,
        deliver_locally: bool,
    ) -> RoostResult<()> {
        let envelope = PeerEnvelope {
            origin: self.node_name.clone(),
            request: request.clone(),
        };
        self.sent.lock().await.push((target, envelope.clone()));
        if deliver_locally {
            self.event_tx
                .send(BusEvent::Message(envelope))
                .await
                .map_err(|_| RoostError::ClusterError)?;
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterBus for LocalBus {
    fn name(&self) -> &str {
        "local"
    }

    fn local_node(&self) -> &str {
        &self.node_name
    }

    async fn broadcast(&self, request: &AttrdRequest) -> RoostResult<()> {
        debug!("bus broadcast from {}", self.node_name);
        self.record_and_loop(None, request, true).await
    }

    async fn send_to(&self, peer: &str, request: &AttrdRequest) -> RoostResult<()> {
        debug!("bus send to {} from {}", peer, self.node_name);
        // Only the loopback member exists; a send addressed to ourselves
        // is delivered, anything else is just recorded.
        let local = peer == self.node_name;
        self.record_and_loop(Some(peer.to_string()), request, local)
            .await
    }

    async fn recv_event(&self) -> RoostResult<BusEvent> {
        let mut rx = self.event_rx.lock().await;
        rx.recv().await.ok_or(RoostError::ClusterError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roost_proto::message::AttrdRequest;

    #[tokio::test]
    async fn test_broadcast_loops_back_with_origin() {
        let bus = LocalBus::new("node1");
        let req = AttrdRequest::update("load", Some("3"));
        bus.broadcast(&req).await.unwrap();

        match bus.recv_event().await.unwrap() {
            BusEvent::Message(env) => {
                assert_eq!(env.origin, "node1");
                assert_eq!(env.request, req);
            }
            other => panic!("expected Message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_to_peer_is_recorded_not_delivered() {
        let bus = LocalBus::new("node1");
        let req = AttrdRequest::update("load", Some("3"));
        bus.send_to("node2", &req).await.unwrap();

        let sent = bus.take_sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.as_deref(), Some("node2"));

        // Nothing looped back
        bus.inject_event(BusEvent::PeerJoin("node2".into()))
            .await
            .unwrap();
        assert_eq!(
            bus.recv_event().await.unwrap(),
            BusEvent::PeerJoin("node2".into())
        );
    }

    #[tokio::test]
    async fn test_send_to_self_is_delivered() {
        let bus = LocalBus::new("node1");
        let req = AttrdRequest::update("x", None);
        bus.send_to("node1", &req).await.unwrap();
        assert!(matches!(
            bus.recv_event().await.unwrap(),
            BusEvent::Message(_)
        ));
    }
}
