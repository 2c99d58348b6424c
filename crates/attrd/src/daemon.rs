//! Daemon-wide shared state and the long-running event loops.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::{Notify, RwLock};
use tracing::{error, info};

use roost_core::bus::{BusEvent, ClusterBus};
use roost_core::cib::{CibClient, CibEvent};
use roost_exec::executor::Executor;
use roost_proto::alert::AlertEntry;
use roost_proto::constants::SECTION_STATUS;

use crate::{alerts, attrs, peer};

/// One named node attribute on the local node.
#[derive(Debug, Clone)]
pub struct AttrEntry {
    pub name: String,
    pub set: Option<String>,
    pub section: String,
    /// Identifier of the node this attribute is committed against;
    /// filled in lazily at the first commit.
    pub host_key: Option<String>,
    /// Pending-to-commit value; `None` means "delete".
    pub current: Option<String>,
    /// Last value known to be committed, for change detection.
    pub committed: Option<String>,
    pub dampen_ms: u64,
    /// Dampening as the client spelled it, re-broadcast verbatim.
    pub dampen_raw: Option<String>,
    /// Identity to commit as.
    pub user: Option<String>,
    pub timer_armed: bool,
    /// Invalidates armed dampening timers when bumped.
    pub timer_gen: u64,
    /// Commits are serialized per entry.
    pub commit_inflight: bool,
    /// A new converge was requested while a commit was in flight.
    pub commit_queued: bool,
}

impl AttrEntry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            set: None,
            section: SECTION_STATUS.to_string(),
            host_key: None,
            current: None,
            committed: None,
            dampen_ms: 0,
            dampen_raw: None,
            user: None,
            timer_armed: false,
            timer_gen: 0,
            commit_inflight: false,
            commit_queued: false,
        }
    }
}

/// Process-wide daemon state, behind one lock.
pub struct AttrdSystem {
    pub node_name: String,
    pub attrs: BTreeMap<String, AttrEntry>,
    /// Cluster members we currently know about.
    pub peers: BTreeSet<String>,
    pub alerts: Vec<AlertEntry>,
    pub shutting_down: bool,
}

/// Handle to the daemon: shared state plus the external collaborators.
/// Clones are cheap and share everything.
#[derive(Clone)]
pub struct Attrd {
    pub sys: Arc<RwLock<AttrdSystem>>,
    pub cib: Arc<dyn CibClient>,
    pub bus: Arc<dyn ClusterBus>,
    pub executor: Executor,
    pub shutdown: Arc<Notify>,
}

impl Attrd {
    pub fn new(
        node_name: &str,
        cib: Arc<dyn CibClient>,
        bus: Arc<dyn ClusterBus>,
        executor: Executor,
    ) -> Self {
        Self {
            sys: Arc::new(RwLock::new(AttrdSystem {
                node_name: node_name.to_string(),
                attrs: BTreeMap::new(),
                peers: BTreeSet::new(),
                alerts: Vec::new(),
                shutting_down: false,
            })),
            cib,
            bus,
            executor,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub async fn node_name(&self) -> String {
        self.sys.read().await.node_name.clone()
    }
}

/// Cluster message loop. Returns true when the connection was lost while
/// the daemon was not shutting down, which the caller treats as fatal.
pub async fn bus_event_loop(attrd: Attrd) -> bool {
    info!("cluster message loop started (bus={})", attrd.bus.name());

    loop {
        match attrd.bus.recv_event().await {
            Ok(BusEvent::Message(envelope)) => {
                peer::process_peer_message(&attrd, envelope).await;
            }
            Ok(BusEvent::PeerJoin(node)) => {
                info!("peer {} joined", node);
                attrd.sys.write().await.peers.insert(node);
            }
            Ok(BusEvent::PeerLeave(node)) => {
                info!("peer {} left", node);
                attrd.sys.write().await.peers.remove(&node);
            }
            Err(err) => {
                let shutting_down = attrd.sys.read().await.shutting_down;
                if shutting_down {
                    info!("cluster disconnection complete");
                    return false;
                }
                error!("lost connection to cluster: {}", err);
                return true;
            }
        }
    }
}

/// Configuration-store notification loop. Returns true on a fatal
/// disconnect (store gone while not shutting down).
pub async fn cib_event_loop(attrd: Attrd) -> bool {
    info!("configuration store loop started (cib={})", attrd.cib.name());

    loop {
        match attrd.cib.recv_event().await {
            Ok(CibEvent::Diff { alerts_changed }) => {
                if alerts_changed {
                    alerts::read_alert_config(&attrd).await;
                }
            }
            Ok(CibEvent::Replace) => {
                info!("updating all attributes after a configuration replace");
                attrs::recommit_idle(&attrd).await;
            }
            Ok(CibEvent::Disconnected) | Err(_) => {
                let shutting_down = attrd.sys.read().await.shutting_down;
                if shutting_down {
                    info!("configuration store connection closed");
                    return false;
                }
                error!("connection to the configuration store terminated");
                return true;
            }
        }
    }
}
