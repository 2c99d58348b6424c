//! Message taxonomies for the attribute daemon, the executor daemon, and
//! the IPC proxy tunnel. These are the payloads that cross the local IPC
//! sockets and the cluster bus, serialized with bincode inside u32
//! length-prefixed frames.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------
// Attribute daemon
// ---------------------------------------------------------------------

/// Task carried by an attribute request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttrdTask {
    /// Set (or delete, when no value is given) an attribute.
    Update,
    /// Peer-to-peer broadcast of a converged value.
    Flush,
    /// Re-broadcast every known attribute.
    Refresh,
    /// Remove a departed peer from the membership caches.
    PeerRemove,
    /// Clear failure-tracking attributes for a resource/operation.
    ClearFailure,
}

/// One attribute request, from a local client or relayed from a peer.
///
/// Which fields are meaningful depends on the task; absent fields are
/// simply `None`. An absent `value` on an update means "delete".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrdRequest {
    pub task: Option<AttrdTask>,
    pub attribute: Option<String>,
    /// Anchored regular expression selecting attributes in bulk.
    pub pattern: Option<String>,
    pub value: Option<String>,
    pub set: Option<String>,
    pub section: Option<String>,
    /// Human-readable dampening duration (see `values::parse_duration_ms`).
    pub dampen: Option<String>,
    pub host: Option<String>,
    /// The named host is a remote (non-cluster) node.
    pub is_remote: bool,
    /// Identity to perform the configuration-store operation as.
    pub user: Option<String>,
    pub resource: Option<String>,
    pub operation: Option<String>,
    pub interval: Option<String>,
    /// Echo-suppression marker: set on a flush whose origin has already
    /// applied the value locally, so the origin must not apply it again.
    pub ignore_locally: Option<String>,
}

impl AttrdRequest {
    pub fn update(attribute: &str, value: Option<&str>) -> Self {
        Self {
            task: Some(AttrdTask::Update),
            attribute: Some(attribute.to_string()),
            value: value.map(str::to_string),
            ..Default::default()
        }
    }
}

/// Envelope tagging a request with its origin node, as put on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEnvelope {
    pub origin: String,
    pub request: AttrdRequest,
}

/// The attribute daemon acknowledges every request without a body;
/// results are observed through the configuration store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttrdReply {
    Ack,
}

// ---------------------------------------------------------------------
// Executor daemon
// ---------------------------------------------------------------------

/// Requests accepted by the executor daemon over its IPC socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecRequest {
    Exec {
        rsc_id: String,
        class: String,
        provider: Option<String>,
        agent: String,
        operation: String,
        interval_ms: u64,
        timeout_ms: u64,
        parameters: BTreeMap<String, String>,
    },
    Cancel {
        rsc_id: String,
        operation: String,
        interval_ms: u64,
    },
    Kick {
        rsc_id: String,
        operation: String,
        interval_ms: u64,
    },
    /// Run one alert agent with the given environment.
    Alert {
        id: String,
        path: String,
        timeout_ms: u64,
        env: BTreeMap<String, String>,
    },
}

/// Replies and completion events streamed back to the executor client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecReply {
    /// Request accepted; completions follow as `Completion` frames.
    Ack,
    /// Request rejected with a wire error code.
    Nack { code: u32 },
    /// Whether a cancel/kick found its target.
    Cancelled { done: bool },
    /// Terminal state of one execution.
    Completion {
        key: String,
        exit_code: i32,
        status: u32,
        stdout: String,
        stderr: String,
        elapsed_ms: u64,
    },
}

// ---------------------------------------------------------------------
// IPC proxy tunnel
// ---------------------------------------------------------------------

/// Flag: the request expects an asynchronous response to be relayed back
/// under the same message id.
pub const PROXY_FLAG_PROXIED: u32 = 0x1;
/// Flag on a local service buffer: this buffer answers the outstanding
/// proxied request and must be relayed as a response, not an event.
pub const PROXY_FLAG_RELAY_RESPONSE: u32 = 0x2;

/// Messages carried over the proxy tunnel between a remote node and the
/// cluster node that fronts its IPC services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProxyMsg {
    /// Open a session to a local service channel.
    New {
        session_id: String,
        channel: String,
        node_name: String,
    },
    /// Remote-originated request to forward into the local service.
    Request {
        session_id: String,
        msg_id: u64,
        flags: u32,
        payload: Vec<u8>,
        /// Client name, for logging only.
        client: Option<String>,
    },
    /// Local service answer correlated to an earlier proxied request.
    Response {
        session_id: String,
        msg_id: u64,
        payload: Vec<u8>,
    },
    /// Unsolicited local service message relayed to the remote side.
    Event {
        session_id: String,
        payload: Vec<u8>,
    },
    /// Session teardown, in either direction.
    Destroy { session_id: String },
    /// Remote asks for a graceful shutdown.
    ShutdownReq,
    /// Shutdown accepted.
    ShutdownAck,
    /// Shutdown declined.
    ShutdownNack,
}

impl ProxyMsg {
    /// The session this message belongs to, when it names one.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ProxyMsg::New { session_id, .. }
            | ProxyMsg::Request { session_id, .. }
            | ProxyMsg::Response { session_id, .. }
            | ProxyMsg::Event { session_id, .. }
            | ProxyMsg::Destroy { session_id } => Some(session_id),
            _ => None,
        }
    }
}
