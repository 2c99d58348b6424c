//! The attribute table: request dispatch, per-attribute dampening,
//! flush broadcasting, and configuration-store commits.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use regex::Regex;
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn};

use roost_proto::constants::{CIB_CALL_TIMEOUT_SECS, SECTION_STATUS};
use roost_proto::error::RoostError;
use roost_proto::message::{AttrdRequest, AttrdTask};
use roost_proto::values::parse_duration_ms;

use crate::daemon::{AttrEntry, Attrd};
use crate::{alerts, clear, expand};

/// Backoff before re-converging an entry whose commit failed with an
/// expected transient store error.
const COMMIT_RETRY_MS: u64 = 500;

/// Entry point for requests from local clients (and for requests relayed
/// to this node by a peer).
pub async fn handle_request(attrd: &Attrd, request: AttrdRequest) {
    match request.task {
        Some(AttrdTask::Refresh) => {
            info!("sending full refresh");
            refresh_all(attrd).await;
        }
        Some(AttrdTask::PeerRemove) => {
            if let Some(host) = &request.host {
                info!("broadcasting removal of peer {}", host);
                if let Err(err) = attrd.bus.broadcast(&request).await {
                    warn!("could not broadcast peer removal: {}", err);
                }
            }
        }
        Some(AttrdTask::ClearFailure) => {
            clear::client_clear_failure(attrd, request).await;
        }
        Some(AttrdTask::Update) | None => {
            handle_update(attrd, request).await;
        }
        Some(other) => {
            info!("ignoring unsupported {:?} request", other);
        }
    }
}

async fn handle_update(attrd: &Attrd, request: AttrdRequest) {
    let node_name = attrd.node_name().await;

    if let Some(host) = request.host.clone() {
        // Remote (non-cluster) nodes have no attribute daemon of their
        // own; their attributes go straight to the configuration store
        // and dampening does not apply.
        if request.is_remote {
            if request.attribute.is_none() && request.pattern.is_some() {
                info!(
                    "update of {} for {} failed: patterns are not supported \
                     for remote nodes",
                    request.pattern.as_deref().unwrap_or(""),
                    host
                );
                return;
            }
            update_remote_attr(attrd, &host, &request).await;
            return;
        }

        // Redirect requests for another cluster node to that node
        if host != node_name {
            if let Err(err) = attrd.bus.send_to(&host, &request).await {
                warn!("could not relay update to {}: {}", host, err);
            }
            return;
        }
    }

    if request.attribute.is_some() {
        if let Some(name) = find_entry(attrd, &request).await {
            update_local_attr(attrd, &name, &request).await;
        }
    } else if let Some(pattern) = request.pattern.clone() {
        let regex = match Regex::new(&pattern) {
            Ok(regex) => regex,
            Err(_) => {
                error!("update failed: invalid pattern {}", pattern);
                return;
            }
        };
        let names: Vec<String> = {
            let sys = attrd.sys.read().await;
            sys.attrs
                .keys()
                .filter(|name| regex.is_match(name))
                .cloned()
                .collect()
        };
        debug!("pattern {} matched {} attributes", pattern, names.len());
        for name in names {
            update_local_attr(attrd, &name, &request).await;
        }
    } else {
        info!("ignoring update with no attribute name or pattern");
    }
}

/// Look up the entry for a named attribute, creating it on first
/// reference, and refresh its metadata from the request.
pub async fn find_entry(attrd: &Attrd, request: &AttrdRequest) -> Option<String> {
    let name = request.attribute.as_ref()?;
    let mut sys = attrd.sys.write().await;

    let entry = sys.attrs.entry(name.clone()).or_insert_with(|| {
        info!("creating entry for {}", name);
        AttrEntry::new(name)
    });

    if let Some(set) = &request.set {
        entry.set = Some(set.clone());
    }
    entry.section = request
        .section
        .clone()
        .unwrap_or_else(|| SECTION_STATUS.to_string());
    if let Some(dampen) = &request.dampen {
        entry.dampen_raw = Some(dampen.clone());
        entry.dampen_ms = match parse_duration_ms(dampen) {
            Some(ms) => ms,
            None => {
                warn!("invalid dampening '{}' for {}, using none", dampen, name);
                0
            }
        };
    }
    entry.user = request.user.clone();

    trace!(
        "entry {}: set={:?} section={} dampen={}ms",
        name,
        entry.set,
        entry.section,
        entry.dampen_ms
    );
    Some(name.clone())
}

/// Apply an update to one entry: ignore non-changes, expand increments,
/// and (re)start the dampening cycle.
pub async fn update_local_attr(attrd: &Attrd, name: &str, request: &AttrdRequest) {
    let trigger_now = {
        let mut sys = attrd.sys.write().await;
        let Some(entry) = sys.attrs.get_mut(name) else {
            return;
        };

        let mut value = request.value.clone();
        debug!(
            "request to update {} to {:?} (current {:?}, committed {:?})",
            name, value, entry.current, entry.committed
        );

        if value == entry.current && value == entry.committed {
            trace!("ignoring non-change for {}", name);
            return;
        }

        if let Some(raw) = &value {
            if let Some(expanded) = expand::expand_value(raw, entry.current.as_deref()) {
                info!("expanded {}={} to {}", name, raw, expanded);
                value = Some(expanded);
            }
        }

        if value == entry.current && entry.timer_armed {
            // Already waiting to commit this value; a value-preserving
            // update must not push the deadline out.
            return;
        }

        entry.current = value;
        debug!("new value of {} is {:?}", name, entry.current);

        stop_timer(entry);
        let dampen_ms = entry.dampen_ms;
        if dampen_ms > 0 {
            arm_timer(attrd, entry, dampen_ms);
            false
        } else {
            true
        }
    };

    if trigger_now {
        trigger_update(attrd, name).await;
    }
}

fn stop_timer(entry: &mut AttrEntry) {
    if entry.timer_armed {
        trace!("stopping {} timer", entry.name);
    }
    entry.timer_gen += 1;
    entry.timer_armed = false;
}

/// Arm (or re-arm) the dampening timer. Must be called with the system
/// lock held through `entry`.
fn arm_timer(attrd: &Attrd, entry: &mut AttrEntry, delay_ms: u64) {
    entry.timer_gen += 1;
    entry.timer_armed = true;

    let gen = entry.timer_gen;
    let name = entry.name.clone();
    let attrd = attrd.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(delay_ms)).await;
        timer_fired(&attrd, &name, gen).await;
    });
}

async fn timer_fired(attrd: &Attrd, name: &str, gen: u64) {
    {
        let mut sys = attrd.sys.write().await;
        let Some(entry) = sys.attrs.get_mut(name) else {
            return;
        };
        if !entry.timer_armed || entry.timer_gen != gen {
            return; // Superseded or stopped
        }
        entry.timer_armed = false;
    }
    trigger_update(attrd, name).await;
}

/// Converge one attribute: broadcast the authoritative value to every
/// peer, and commit locally right away when there is no dampening (the
/// flush then carries an echo-suppression marker so we do not apply our
/// own broadcast a second time).
pub async fn trigger_update(attrd: &Attrd, name: &str) {
    let (request, commit_now) = {
        let sys = attrd.sys.read().await;
        let Some(entry) = sys.attrs.get(name) else {
            return;
        };
        info!(
            "sending flush op to all hosts for {} ({:?})",
            name, entry.current
        );
        let commit_now = entry.dampen_ms == 0;
        let request = AttrdRequest {
            task: Some(AttrdTask::Flush),
            attribute: Some(entry.name.clone()),
            value: entry.current.clone(),
            set: entry.set.clone(),
            section: Some(entry.section.clone()),
            dampen: entry.dampen_raw.clone(),
            user: entry.user.clone(),
            ignore_locally: commit_now.then(|| "true".to_string()),
            ..Default::default()
        };
        (request, commit_now)
    };

    if commit_now {
        perform_update(attrd.clone(), name.to_string()).await;
    }
    if let Err(err) = attrd.bus.broadcast(&request).await {
        warn!("could not broadcast flush for {}: {}", name, err);
    }
}

struct CommitSnapshot {
    host: String,
    section: String,
    set: Option<String>,
    value: Option<String>,
    user: Option<String>,
    committed: Option<String>,
}

/// Submit the pending value of one entry to the configuration store.
///
/// Commits are serialized per entry; a converge requested while one is
/// in flight runs when it completes. Boxed to break the async cycle
/// through the retry path.
pub fn perform_update(attrd: Attrd, name: String) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        if !attrd.cib.connected().await {
            info!("delaying operation on {}: store not connected", name);
            return;
        }

        let snapshot = {
            let mut sys = attrd.sys.write().await;
            let node_name = sys.node_name.clone();
            let Some(entry) = sys.attrs.get_mut(&name) else {
                return;
            };
            if entry.commit_inflight {
                entry.commit_queued = true;
                return;
            }
            entry.commit_inflight = true;
            if entry.host_key.is_none() {
                entry.host_key = Some(node_name);
            }
            CommitSnapshot {
                host: entry.host_key.clone().unwrap_or_default(),
                section: entry.section.clone(),
                set: entry.set.clone(),
                value: entry.current.clone(),
                user: entry.user.clone(),
                committed: entry.committed.clone(),
            }
        };

        if snapshot.value.is_some() && snapshot.value != snapshot.committed {
            info!("sent update: {}={:?}", name, snapshot.value);
        } else if snapshot.value.is_none() && snapshot.committed.is_some() {
            info!(
                "sent delete: node={}, attr={}, section={}",
                snapshot.host, name, snapshot.section
            );
        }

        tokio::spawn(commit_task(attrd.clone(), name, snapshot));
    })
}

async fn commit_task(attrd: Attrd, name: String, snapshot: CommitSnapshot) {
    let call = async {
        match &snapshot.value {
            Some(value) => {
                attrd
                    .cib
                    .update(
                        &snapshot.section,
                        &snapshot.host,
                        snapshot.set.as_deref(),
                        &name,
                        value,
                        snapshot.user.as_deref(),
                    )
                    .await
            }
            None => {
                attrd
                    .cib
                    .delete(
                        &snapshot.section,
                        &snapshot.host,
                        snapshot.set.as_deref(),
                        &name,
                        snapshot.user.as_deref(),
                    )
                    .await
            }
        }
    };

    let rc = match tokio::time::timeout(Duration::from_secs(CIB_CALL_TIMEOUT_SECS), call).await {
        Ok(rc) => rc,
        Err(_) => Err(RoostError::TimedOut),
    };
    // Deleting an attribute that was never written is a success
    let rc = match (&snapshot.value, rc) {
        (None, Err(RoostError::NotFound)) => Ok(()),
        (_, rc) => rc,
    };

    alerts::send_attribute_alert(
        &attrd,
        &snapshot.host,
        &name,
        snapshot.value.as_deref().unwrap_or(""),
    )
    .await;

    let queued = {
        let mut sys = attrd.sys.write().await;
        let Some(entry) = sys.attrs.get_mut(&name) else {
            return;
        };
        entry.commit_inflight = false;

        match &rc {
            Ok(()) => {
                debug!("update for {}={:?} passed", name, snapshot.value);
                entry.committed = snapshot.value.clone();
            }
            Err(err) if err.is_transient_store_error() => {
                warn!(
                    "update for {}={:?} failed: {} (will retry)",
                    name, snapshot.value, err
                );
                arm_timer(&attrd, entry, COMMIT_RETRY_MS);
            }
            Err(err) => {
                error!("update for {}={:?} failed: {}", name, snapshot.value, err);
            }
        }

        let queued = entry.commit_queued;
        entry.commit_queued = false;
        queued
    };

    if queued {
        perform_update(attrd.clone(), name).await;
    }
}

/// Update a remote (non-cluster) node's attribute straight through the
/// configuration store. Dampening does not apply, and updates for the
/// same attribute submitted through different cluster nodes are ordered
/// by the store alone.
async fn update_remote_attr(attrd: &Attrd, host: &str, request: &AttrdRequest) {
    let Some(name) = request.attribute.clone() else {
        return;
    };
    let section = request
        .section
        .clone()
        .unwrap_or_else(|| SECTION_STATUS.to_string());
    let value = request.value.clone();
    let user = request.user.clone();

    if !attrd.cib.connected().await {
        info!(
            "ignoring update of {} for {}: store not connected",
            name, host
        );
        return;
    }

    let call = async {
        match &value {
            Some(v) => {
                attrd
                    .cib
                    .update(&section, host, request.set.as_deref(), &name, v, user.as_deref())
                    .await
            }
            None => {
                attrd
                    .cib
                    .delete(&section, host, request.set.as_deref(), &name, user.as_deref())
                    .await
            }
        }
    };
    let rc = match tokio::time::timeout(Duration::from_secs(CIB_CALL_TIMEOUT_SECS), call).await {
        Ok(rc) => rc,
        Err(_) => Err(RoostError::TimedOut),
    };
    let rc = match (&value, rc) {
        (None, Err(RoostError::NotFound)) => Ok(()),
        (_, rc) => rc,
    };

    match rc {
        Ok(()) => debug!("update of {}={:?} in {} for {} succeeded", name, value, section, host),
        Err(err) => info!(
            "update of {}={:?} in {} for {} failed: {}",
            name, value, section, host, err
        ),
    }

    alerts::send_attribute_alert(attrd, host, &name, value.as_deref().unwrap_or("")).await;
}

/// Re-broadcast every attribute that has (or had) a value.
pub async fn refresh_all(attrd: &Attrd) {
    let names: Vec<String> = {
        let sys = attrd.sys.read().await;
        sys.attrs
            .values()
            .filter(|e| e.current.is_some() || e.committed.is_some())
            .map(|e| e.name.clone())
            .collect()
    };
    for name in names {
        {
            let mut sys = attrd.sys.write().await;
            if let Some(entry) = sys.attrs.get_mut(&name) {
                stop_timer(entry);
            }
        }
        trigger_update(attrd, &name).await;
    }
}

/// After the store replaced its contents wholesale, re-commit every
/// entry that is not mid-dampening (armed timers will converge on their
/// own when they fire).
pub async fn recommit_idle(attrd: &Attrd) {
    let names: Vec<String> = {
        let sys = attrd.sys.read().await;
        sys.attrs
            .values()
            .filter(|e| !e.timer_armed)
            .map(|e| e.name.clone())
            .collect()
    };
    for name in names {
        trace!("performing local-only update after replace for {}", name);
        perform_update(attrd.clone(), name).await;
    }
}

/// Stop a possibly armed dampening timer from outside this module.
pub async fn stop_entry_timer(attrd: &Attrd, name: &str) {
    let mut sys = attrd.sys.write().await;
    if let Some(entry) = sys.attrs.get_mut(name) {
        stop_timer(entry);
    }
}
