//! Configuration store (CIB) client.
//!
//! The CIB is an opaque cluster-replicated transactional store. The
//! daemons only need a narrow surface: per-nvpair update/delete, xpath
//! bulk delete, section query, and change notifications. The trait keeps
//! that surface swappable; `LocalCib` is the in-process implementation
//! used in single-node mode and by the tests, with fault injection for
//! exercising the transient-error paths.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, trace};

use roost_proto::error::{RoostError, RoostResult};

/// Change notifications delivered by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CibEvent {
    /// An incremental change was applied. `alerts_changed` is set when the
    /// change touched the alert configuration section.
    Diff { alerts_changed: bool },
    /// The whole configuration was replaced (e.g. after a resync).
    Replace,
    /// The store connection dropped.
    Disconnected,
}

/// Address of one nvpair in the store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct NvKey {
    pub section: String,
    pub host: String,
    pub set: String,
    pub name: String,
}

/// Trait all configuration-store backends implement.
#[async_trait]
pub trait CibClient: Send + Sync {
    /// Human-readable backend name.
    fn name(&self) -> &str;

    /// Whether the store connection is currently usable.
    async fn connected(&self) -> bool;

    /// Write one nvpair value for a host.
    async fn update(
        &self,
        section: &str,
        host: &str,
        set: Option<&str>,
        name: &str,
        value: &str,
        user: Option<&str>,
    ) -> RoostResult<()>;

    /// Remove one nvpair for a host. Deleting an absent pair is not an
    /// error worth surfacing; backends report it as `NotFound`.
    async fn delete(
        &self,
        section: &str,
        host: &str,
        set: Option<&str>,
        name: &str,
        user: Option<&str>,
    ) -> RoostResult<()>;

    /// Delete every nvpair matched by an xpath expression. Returns the
    /// number of pairs removed.
    async fn delete_xpath(&self, xpath: &str) -> RoostResult<u32>;

    /// Fetch an opaque configuration section, if present.
    async fn query_section(&self, section: &str) -> RoostResult<Option<Vec<u8>>>;

    /// Receive the next change notification. Blocks (async) until one is
    /// available.
    async fn recv_event(&self) -> RoostResult<CibEvent>;
}

const DEFAULT_SET: &str = "transient-attributes";

struct CibState {
    nvpairs: BTreeMap<NvKey, String>,
    sections: BTreeMap<String, Vec<u8>>,
    /// Hosts known to be remote (non-cluster) nodes, matched by the
    /// remote-attribute xpath shape.
    remote_nodes: BTreeSet<String>,
    /// Error to fail the next mutating call with (test fault injection).
    fail_next: Option<RoostError>,
    connected: bool,
    update_calls: u64,
    delete_calls: u64,
}

/// In-process configuration store.
pub struct LocalCib {
    state: RwLock<CibState>,
    event_tx: mpsc::Sender<CibEvent>,
    event_rx: Arc<Mutex<mpsc::Receiver<CibEvent>>>,
}

impl Default for LocalCib {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalCib {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(64);
        Self {
            state: RwLock::new(CibState {
                nvpairs: BTreeMap::new(),
                sections: BTreeMap::new(),
                remote_nodes: BTreeSet::new(),
                fail_next: None,
                connected: true,
                update_calls: 0,
                delete_calls: 0,
            }),
            event_tx: tx,
            event_rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Read one nvpair back (test helper).
    pub async fn get(&self, section: &str, host: &str, set: Option<&str>, name: &str) -> Option<String> {
        let state = self.state.read().await;
        state
            .nvpairs
            .get(&nvkey(section, host, set, name))
            .cloned()
    }

    /// Number of stored nvpairs (test helper).
    pub async fn nvpair_count(&self) -> usize {
        self.state.read().await.nvpairs.len()
    }

    /// Number of update calls accepted so far (test helper).
    pub async fn update_calls(&self) -> u64 {
        self.state.read().await.update_calls
    }

    /// Number of delete calls accepted so far (test helper).
    pub async fn delete_calls(&self) -> u64 {
        self.state.read().await.delete_calls
    }

    /// Mark a host as a remote (non-cluster) node so the remote-attribute
    /// xpath shape matches its pairs.
    pub async fn add_remote_node(&self, host: &str) {
        self.state.write().await.remote_nodes.insert(host.to_string());
    }

    /// Store an opaque section blob and notify subscribers.
    pub async fn put_section(&self, section: &str, data: Vec<u8>) -> RoostResult<()> {
        {
            let mut state = self.state.write().await;
            state.sections.insert(section.to_string(), data);
        }
        self.event_tx
            .send(CibEvent::Diff {
                alerts_changed: section == "alerts",
            })
            .await
            .map_err(|_| RoostError::NotConnected)
    }

    /// Fail the next mutating call with the given error (test helper).
    pub async fn fail_next(&self, err: RoostError) {
        self.state.write().await.fail_next = Some(err);
    }

    /// Drop or restore the connection (test helper).
    pub async fn set_connected(&self, connected: bool) {
        self.state.write().await.connected = connected;
        if !connected {
            let _ = self.event_tx.send(CibEvent::Disconnected).await;
        }
    }

    /// Inject a change notification (test helper).
    pub async fn inject_event(&self, event: CibEvent) -> RoostResult<()> {
        self.event_tx
            .send(event)
            .await
            .map_err(|_| RoostError::NotConnected)
    }

    async fn take_fault(&self) -> RoostResult<()> {
        let mut state = self.state.write().await;
        if !state.connected {
            return Err(RoostError::NotConnected);
        }
        if let Some(err) = state.fail_next.take() {
            return Err(err);
        }
        Ok(())
    }
}

fn nvkey(section: &str, host: &str, set: Option<&str>, name: &str) -> NvKey {
    NvKey {
        section: section.to_string(),
        host: host.to_string(),
        set: set.unwrap_or(DEFAULT_SET).to_string(),
        name: name.to_string(),
    }
}

/// One name predicate inside an xpath nvpair filter.
enum NamePredicate {
    Exact(String),
    Prefix(String),
}

impl NamePredicate {
    fn matches(&self, name: &str) -> bool {
        match self {
            NamePredicate::Exact(n) => name == n,
            NamePredicate::Prefix(p) => name.starts_with(p),
        }
    }
}

/// Parse the remote-attribute delete xpath shape:
/// an optional `[@id='HOST']` narrowing plus an OR-joined list of
/// `@name='X'` / `starts-with(@name,'X')` predicates.
fn parse_remote_attr_xpath(xpath: &str) -> RoostResult<(Option<String>, Vec<NamePredicate>)> {
    let host_re = Regex::new(r"\[@id='([^']+)'\]").map_err(|_| RoostError::InvalidPattern)?;
    let pred_re = Regex::new(r"(?:starts-with\(@name,'([^']+)'\)|@name='([^']+)')")
        .map_err(|_| RoostError::InvalidPattern)?;

    let host = host_re
        .captures(xpath)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());

    let mut predicates = Vec::new();
    for cap in pred_re.captures_iter(xpath) {
        if let Some(prefix) = cap.get(1) {
            predicates.push(NamePredicate::Prefix(prefix.as_str().to_string()));
        } else if let Some(exact) = cap.get(2) {
            predicates.push(NamePredicate::Exact(exact.as_str().to_string()));
        }
    }
    if predicates.is_empty() {
        return Err(RoostError::InvalidPattern);
    }
    Ok((host, predicates))
}

#[async_trait]
impl CibClient for LocalCib {
    fn name(&self) -> &str {
        "local"
    }

    async fn connected(&self) -> bool {
        self.state.read().await.connected
    }

    async fn update(
        &self,
        section: &str,
        host: &str,
        set: Option<&str>,
        name: &str,
        value: &str,
        user: Option<&str>,
    ) -> RoostResult<()> {
        self.take_fault().await?;
        let mut state = self.state.write().await;
        trace!(
            "cib update {}/{}/{}={} (user={})",
            section,
            host,
            name,
            value,
            user.unwrap_or("-")
        );
        state.update_calls += 1;
        state
            .nvpairs
            .insert(nvkey(section, host, set, name), value.to_string());
        Ok(())
    }

    async fn delete(
        &self,
        section: &str,
        host: &str,
        set: Option<&str>,
        name: &str,
        user: Option<&str>,
    ) -> RoostResult<()> {
        self.take_fault().await?;
        let mut state = self.state.write().await;
        trace!(
            "cib delete {}/{}/{} (user={})",
            section,
            host,
            name,
            user.unwrap_or("-")
        );
        state.delete_calls += 1;
        match state.nvpairs.remove(&nvkey(section, host, set, name)) {
            Some(_) => Ok(()),
            None => Err(RoostError::NotFound),
        }
    }

    async fn delete_xpath(&self, xpath: &str) -> RoostResult<u32> {
        self.take_fault().await?;
        let (host, predicates) = parse_remote_attr_xpath(xpath)?;

        let mut state = self.state.write().await;
        let remote = state.remote_nodes.clone();
        let before = state.nvpairs.len();
        state.nvpairs.retain(|key, _| {
            let in_scope = remote.contains(&key.host)
                && host.as_deref().map_or(true, |h| h == key.host)
                && predicates.iter().any(|p| p.matches(&key.name));
            !in_scope
        });
        let removed = (before - state.nvpairs.len()) as u32;
        debug!("cib xpath delete removed {} pairs: {}", removed, xpath);
        Ok(removed)
    }

    async fn query_section(&self, section: &str) -> RoostResult<Option<Vec<u8>>> {
        if !self.connected().await {
            return Err(RoostError::NotConnected);
        }
        Ok(self.state.read().await.sections.get(section).cloned())
    }

    async fn recv_event(&self) -> RoostResult<CibEvent> {
        let mut rx = self.event_rx.lock().await;
        rx.recv().await.ok_or(RoostError::NotConnected)
    }
}
