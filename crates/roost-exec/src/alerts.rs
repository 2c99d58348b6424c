//! Alert agent dispatch.
//!
//! Cluster events (node membership, attribute change, fencing, resource
//! operation) fan out to the configured alert agents. Each entry filters
//! by event kind (and attribute name, for attribute events), then runs
//! with the shared event parameters plus its own recipient, timestamp,
//! and environment variables.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Local;
use tracing::{debug, info, warn};

use roost_proto::alert::{
    keys, AlertEntry, ALERT_KIND_ATTRIBUTE, ALERT_KIND_FENCING, ALERT_KIND_NODE,
    ALERT_KIND_RESOURCE,
};

use crate::action::{ActionStatus, EXIT_NOT_RUNNING, EXIT_OK};
use crate::executor::{Executor, GenericCallback};

/// Aggregate outcome of one dispatch across all matching agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertOutcome {
    AllOk,
    SomeFailed,
    AllFailed,
}

/// A completed resource operation, as far as alerting is concerned.
#[derive(Debug, Clone)]
pub struct ResourceOpInfo {
    pub rsc_id: String,
    pub operation: String,
    pub interval_ms: u64,
    pub status: ActionStatus,
    pub exit_code: i32,
    /// The exit code the orchestration expected from this operation.
    pub target_rc: i32,
}

impl ResourceOpInfo {
    /// The default expectation: monitors of stopped/probed resources
    /// report not-running, everything else reports ok.
    pub fn default_target_rc(operation: &str, probing: bool) -> i32 {
        if probing || operation == "stop" {
            EXIT_NOT_RUNNING
        } else {
            EXIT_OK
        }
    }
}

fn kind_name(kind: u32) -> &'static str {
    match kind {
        ALERT_KIND_NODE => "node",
        ALERT_KIND_FENCING => "fencing",
        ALERT_KIND_RESOURCE => "resource",
        ALERT_KIND_ATTRIBUTE => "attribute",
        _ => "unknown",
    }
}

/// Run every matching alert agent for one event.
///
/// Aggregation is over submissions: an agent that cannot be spawned is a
/// failure, one that spawns counts as delivered (its own exit code is the
/// agent's business and is only logged).
async fn exec_alert_list(
    executor: &Executor,
    alerts: &[AlertEntry],
    kind: u32,
    attr_name: Option<&str>,
    mut params: BTreeMap<String, String>,
) -> AlertOutcome {
    let kind_s = kind_name(kind);
    params.insert(keys::KIND.to_string(), kind_s.to_string());
    params.insert(
        keys::VERSION.to_string(),
        env!("CARGO_PKG_VERSION").to_string(),
    );

    // One wall-clock snapshot per batch so every recipient sees the same
    // event time regardless of its format string.
    let now = Local::now();

    let mut any_success = false;
    let mut any_failure = false;

    for entry in alerts {
        if !entry.wants_kind(kind) {
            debug!(
                "filtering unwanted {} alert to {} via {}",
                kind_s,
                entry.recipient.as_deref().unwrap_or("-"),
                entry.id
            );
            continue;
        }
        if kind == ALERT_KIND_ATTRIBUTE {
            let name = attr_name.unwrap_or("");
            if !entry.wants_attribute(name) {
                debug!(
                    "filtering unwanted attribute '{}' alert via {}",
                    name, entry.id
                );
                continue;
            }
        }

        info!(
            "sending {} alert via {} to {}",
            kind_s,
            entry.id,
            entry.recipient.as_deref().unwrap_or("-")
        );

        let mut env = params.clone();
        env.insert(
            keys::RECIPIENT.to_string(),
            entry.recipient.clone().unwrap_or_default(),
        );
        env.insert(
            keys::TIMESTAMP.to_string(),
            now.format(&entry.tstamp_format).to_string(),
        );
        for (key, value) in &entry.envvars {
            env.insert(key.clone(), value.clone());
        }

        let id = entry.id.clone();
        let callback: GenericCallback = Arc::new(move |result| {
            if result.status != ActionStatus::Done || result.exit_code != 0 {
                warn!(
                    "alert agent {} finished {:?} rc={}",
                    id, result.status, result.exit_code
                );
            }
        });

        match executor
            .run_generic(&entry.id, &entry.path, entry.timeout_ms, env, callback)
            .await
        {
            Ok(()) => any_success = true,
            Err(err) => {
                warn!("could not execute alert {}: {}", entry.id, err);
                any_failure = true;
            }
        }
    }

    if any_failure {
        if any_success {
            AlertOutcome::SomeFailed
        } else {
            AlertOutcome::AllFailed
        }
    } else {
        AlertOutcome::AllOk
    }
}

/// Alert for a node attribute change.
pub async fn send_attribute_alert(
    executor: &Executor,
    alerts: &[AlertEntry],
    node: &str,
    nodeid: u32,
    attr_name: &str,
    attr_value: &str,
) -> AlertOutcome {
    if alerts.is_empty() {
        return AlertOutcome::AllOk;
    }
    let mut params = BTreeMap::new();
    params.insert(keys::NODE.to_string(), node.to_string());
    params.insert(keys::NODEID.to_string(), nodeid.to_string());
    params.insert(keys::ATTRIBUTE_NAME.to_string(), attr_name.to_string());
    params.insert(keys::ATTRIBUTE_VALUE.to_string(), attr_value.to_string());
    exec_alert_list(
        executor,
        alerts,
        ALERT_KIND_ATTRIBUTE,
        Some(attr_name),
        params,
    )
    .await
}

/// Alert for a node membership event.
pub async fn send_node_alert(
    executor: &Executor,
    alerts: &[AlertEntry],
    node: &str,
    nodeid: u32,
    state: &str,
) -> AlertOutcome {
    if alerts.is_empty() {
        return AlertOutcome::AllOk;
    }
    let mut params = BTreeMap::new();
    params.insert(keys::NODE.to_string(), node.to_string());
    params.insert(keys::NODEID.to_string(), nodeid.to_string());
    params.insert(keys::DESC.to_string(), state.to_string());
    exec_alert_list(executor, alerts, ALERT_KIND_NODE, None, params).await
}

/// Alert for a fencing event.
pub async fn send_fencing_alert(
    executor: &Executor,
    alerts: &[AlertEntry],
    target: &str,
    task: &str,
    desc: &str,
    op_rc: i32,
) -> AlertOutcome {
    if alerts.is_empty() {
        return AlertOutcome::AllOk;
    }
    let mut params = BTreeMap::new();
    params.insert(keys::NODE.to_string(), target.to_string());
    params.insert(keys::TASK.to_string(), task.to_string());
    params.insert(keys::DESC.to_string(), desc.to_string());
    params.insert(keys::RC.to_string(), op_rc.to_string());
    exec_alert_list(executor, alerts, ALERT_KIND_FENCING, None, params).await
}

/// Alert for a completed resource operation.
///
/// Probes that find the resource in its expected state are routine and
/// produce no alert.
pub async fn send_resource_alert(
    executor: &Executor,
    alerts: &[AlertEntry],
    node: &str,
    op: &ResourceOpInfo,
) -> AlertOutcome {
    if alerts.is_empty() {
        return AlertOutcome::AllOk;
    }
    if op.interval_ms == 0
        && op.status == ActionStatus::Done
        && op.exit_code == op.target_rc
        && (op.operation == "monitor" || op.operation == "status")
    {
        return AlertOutcome::AllOk;
    }

    let mut params = BTreeMap::new();
    params.insert(keys::NODE.to_string(), node.to_string());
    params.insert(keys::RSC.to_string(), op.rsc_id.clone());
    params.insert(keys::TASK.to_string(), op.operation.clone());
    params.insert(keys::INTERVAL.to_string(), op.interval_ms.to_string());
    params.insert(keys::TARGET_RC.to_string(), op.target_rc.to_string());
    params.insert(
        keys::STATUS.to_string(),
        op.status.to_code().to_string(),
    );
    params.insert(keys::RC.to_string(), op.exit_code.to_string());
    params.insert(keys::DESC.to_string(), format!("{:?}", op.status));

    exec_alert_list(executor, alerts, ALERT_KIND_RESOURCE, None, params).await
}
