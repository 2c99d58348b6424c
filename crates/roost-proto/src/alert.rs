//! Alert agent configuration records.
//!
//! Alerts are external executables invoked on cluster events. The entries
//! are configured in the configuration store and consumed read-only here:
//! which agent to run, with which recipient, for which event kinds, and
//! with which extra environment.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Event kinds an alert can subscribe to, used as a bitmask in
/// `AlertEntry::kinds`.
pub const ALERT_KIND_NODE: u32 = 0x1;
pub const ALERT_KIND_FENCING: u32 = 0x2;
pub const ALERT_KIND_RESOURCE: u32 = 0x4;
pub const ALERT_KIND_ATTRIBUTE: u32 = 0x8;

/// Default timestamp format handed to agents that do not configure one.
pub const ALERT_DEFAULT_TSTAMP_FORMAT: &str = "%H:%M:%S%.6f";

/// Default per-agent execution timeout.
pub const ALERT_DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// One configured alert agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertEntry {
    pub id: String,
    /// Path to the agent executable.
    pub path: String,
    pub timeout_ms: u64,
    pub recipient: Option<String>,
    /// Bitmask of ALERT_KIND_* values this entry subscribes to.
    pub kinds: u32,
    /// For attribute events: names this entry wants. Empty means all.
    pub select_attributes: Vec<String>,
    /// Extra environment handed to the agent.
    pub envvars: BTreeMap<String, String>,
    /// chrono format string for the CRM_alert_timestamp variable.
    pub tstamp_format: String,
}

impl AlertEntry {
    pub fn new(id: &str, path: &str) -> Self {
        Self {
            id: id.to_string(),
            path: path.to_string(),
            timeout_ms: ALERT_DEFAULT_TIMEOUT_MS,
            recipient: None,
            kinds: ALERT_KIND_NODE
                | ALERT_KIND_FENCING
                | ALERT_KIND_RESOURCE
                | ALERT_KIND_ATTRIBUTE,
            select_attributes: Vec::new(),
            envvars: BTreeMap::new(),
            tstamp_format: ALERT_DEFAULT_TSTAMP_FORMAT.to_string(),
        }
    }

    pub fn wants_kind(&self, kind: u32) -> bool {
        self.kinds & kind != 0
    }

    /// Attribute filter: an empty allow-list accepts every attribute.
    pub fn wants_attribute(&self, name: &str) -> bool {
        self.select_attributes.is_empty() || self.select_attributes.iter().any(|a| a == name)
    }
}

/// Environment variable names in the alert agent interface.
pub mod keys {
    pub const KIND: &str = "CRM_alert_kind";
    pub const VERSION: &str = "CRM_alert_version";
    pub const RECIPIENT: &str = "CRM_alert_recipient";
    pub const TIMESTAMP: &str = "CRM_alert_timestamp";
    pub const NODE: &str = "CRM_alert_node";
    pub const NODEID: &str = "CRM_alert_nodeid";
    pub const ATTRIBUTE_NAME: &str = "CRM_alert_attribute_name";
    pub const ATTRIBUTE_VALUE: &str = "CRM_alert_attribute_value";
    pub const RSC: &str = "CRM_alert_rsc";
    pub const TASK: &str = "CRM_alert_task";
    pub const INTERVAL: &str = "CRM_alert_interval";
    pub const DESC: &str = "CRM_alert_desc";
    pub const STATUS: &str = "CRM_alert_status";
    pub const RC: &str = "CRM_alert_rc";
    pub const TARGET_RC: &str = "CRM_alert_target_rc";
}
