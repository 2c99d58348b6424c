//! Clearing of failure-tracking attributes.
//!
//! Failures are recorded as `fail-count-<rsc>` / `last-failure-<rsc>`
//! attributes (optionally narrowed per operation as
//! `...-<rsc>#<op>_<interval>`). A clear request may target the local
//! node (bulk delete over the attribute table), a peer (relayed), every
//! node (broadcast), or a remote node (translated to a configuration
//! store xpath delete).

use regex::Regex;
use tracing::{debug, info, trace, warn};

use roost_proto::constants::{FAIL_COUNT_PREFIX, LAST_FAILURE_PREFIX};
use roost_proto::message::AttrdRequest;
use roost_proto::values::parse_duration_ms;

use crate::attrs;
use crate::daemon::Attrd;

/// Anchored pattern over attribute names for a clear request.
pub fn failure_pattern(rsc: Option<&str>, operation: Option<&str>, interval_ms: u64) -> String {
    let prefixes = format!("({}|{})", FAIL_COUNT_PREFIX, LAST_FAILURE_PREFIX);
    match (rsc, operation) {
        (None, _) => format!("^{}-", prefixes),
        (Some(rsc), None) => format!("^{}-{}(#.*)?$", prefixes, regex::escape(rsc)),
        (Some(rsc), Some(op)) => format!(
            "^{}-{}(#{}_{})?$",
            prefixes,
            regex::escape(rsc),
            regex::escape(op),
            interval_ms
        ),
    }
}

fn request_interval_ms(request: &AttrdRequest) -> u64 {
    request
        .interval
        .as_deref()
        .and_then(parse_duration_ms)
        .unwrap_or(0)
}

/// Route a client clear request per its target host.
pub async fn client_clear_failure(attrd: &Attrd, request: AttrdRequest) {
    let node_name = attrd.node_name().await;

    match request.host.clone() {
        None => {
            // Every cluster node clears locally, and remote nodes are
            // handled here through the store.
            info!("broadcasting request to clear failure on all hosts");
            if let Err(err) = attrd.bus.broadcast(&request).await {
                warn!("could not broadcast clear request: {}", err);
            }
            remote_clear_failure(attrd, &request, None).await;
        }
        Some(host) if host == node_name => {
            local_clear_failure(attrd, &request).await;
        }
        Some(host) => {
            let known_peer = attrd.sys.read().await.peers.contains(&host);
            if request.is_remote || !known_peer {
                // Not a known cluster node, assume remote
                remote_clear_failure(attrd, &request, Some(&host)).await;
            } else {
                info!("relaying request to clear failure to {}", host);
                if let Err(err) = attrd.bus.send_to(&host, &request).await {
                    warn!("could not relay clear request to {}: {}", host, err);
                }
            }
        }
    }
}

/// Delete every matching failure attribute from the local table (which
/// in turn commits the deletions to the store).
pub async fn local_clear_failure(attrd: &Attrd, request: &AttrdRequest) {
    let what = request.resource.as_deref().unwrap_or("all resources");
    let pattern = failure_pattern(
        request.resource.as_deref(),
        request.operation.as_deref(),
        request_interval_ms(request),
    );
    let regex = match Regex::new(&pattern) {
        Ok(regex) => regex,
        Err(_) => {
            info!("ignoring invalid request to clear {}", what);
            return;
        }
    };
    debug!("clearing {} locally", what);

    // Deletion is an update with no value
    let mut delete = request.clone();
    delete.value = None;

    let names: Vec<String> = {
        let sys = attrd.sys.read().await;
        sys.attrs
            .keys()
            .filter(|name| regex.is_match(name))
            .cloned()
            .collect()
    };
    for name in names {
        trace!("matched {} when clearing {}", name, what);
        attrs::update_local_attr(attrd, &name, &delete).await;
    }
}

/// Clear failure attributes for remote (non-cluster) nodes through a
/// store xpath delete.
async fn remote_clear_failure(attrd: &Attrd, request: &AttrdRequest, host: Option<&str>) {
    if !attrd.cib.connected().await {
        info!(
            "ignoring request to clear {} on {}: store not connected",
            request.resource.as_deref().unwrap_or("all resources"),
            host.unwrap_or("all remote nodes")
        );
        return;
    }

    let xpath = remote_clear_xpath(
        host,
        request.resource.as_deref(),
        request.operation.as_deref(),
        request_interval_ms(request),
    );
    trace!("clearing attributes matching {}", xpath);

    match attrd.cib.delete_xpath(&xpath).await {
        Ok(removed) => debug!("cleared {} failure attributes via {}", removed, xpath),
        Err(err) => info!("failed to clear failures: {} (xpath={})", err, xpath),
    }
}

/// The xpath selecting failure nvpairs of remote nodes, in the three
/// narrowing shapes: every resource, one resource, or one operation.
pub fn remote_clear_xpath(
    host: Option<&str>,
    rsc: Option<&str>,
    operation: Option<&str>,
    interval_ms: u64,
) -> String {
    let mut xpath = String::from("/cib/status/node_state[@remote='true']");
    if let Some(host) = host {
        xpath.push_str(&format!("[@id='{}']", host));
    }
    xpath.push_str("/transient_attributes/instance_attributes/nvpair");

    let predicates = match (rsc, operation) {
        (None, _) => format!(
            "starts-with(@name,'{fc}-') or starts-with(@name,'{lf}-')",
            fc = FAIL_COUNT_PREFIX,
            lf = LAST_FAILURE_PREFIX
        ),
        (Some(rsc), None) => format!(
            "@name='{fc}-{rsc}' or @name='{lf}-{rsc}' or \
             starts-with(@name,'{fc}-{rsc}#') or starts-with(@name,'{lf}-{rsc}#')",
            fc = FAIL_COUNT_PREFIX,
            lf = LAST_FAILURE_PREFIX,
            rsc = rsc
        ),
        (Some(rsc), Some(op)) => format!(
            "@name='{fc}-{rsc}' or @name='{lf}-{rsc}' or \
             @name='{fc}-{rsc}#{op}_{iv}' or @name='{lf}-{rsc}#{op}_{iv}'",
            fc = FAIL_COUNT_PREFIX,
            lf = LAST_FAILURE_PREFIX,
            rsc = rsc,
            op = op,
            iv = interval_ms
        ),
    };
    format!("{}[{}]", xpath, predicates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs::handle_request;
    use crate::daemon::{bus_event_loop, Attrd};
    use roost_core::bus::LocalBus;
    use roost_core::cib::{CibClient, LocalCib};
    use roost_exec::executor::Executor;
    use roost_exec::registry::{AgentRoots, Registry};
    use roost_proto::message::AttrdTask;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::sleep;

    struct Fixture {
        attrd: Attrd,
        cib: Arc<LocalCib>,
        bus: Arc<LocalBus>,
    }

    fn fixture() -> Fixture {
        let cib = Arc::new(LocalCib::new());
        let bus = Arc::new(LocalBus::new("node1"));
        let executor = Executor::new(Registry::new(AgentRoots::default()));
        let attrd = Attrd::new("node1", cib.clone(), bus.clone(), executor);
        tokio::spawn(bus_event_loop(attrd.clone()));
        Fixture { attrd, cib, bus }
    }

    fn update(attr: &str, value: &str) -> AttrdRequest {
        AttrdRequest {
            task: Some(AttrdTask::Update),
            attribute: Some(attr.to_string()),
            value: Some(value.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_failure_pattern_shapes() {
        let all = Regex::new(&failure_pattern(None, None, 0)).unwrap();
        assert!(all.is_match("fail-count-db"));
        assert!(all.is_match("last-failure-web"));
        assert!(!all.is_match("load"));

        let one = Regex::new(&failure_pattern(Some("db"), None, 0)).unwrap();
        assert!(one.is_match("fail-count-db"));
        assert!(one.is_match("last-failure-db"));
        assert!(one.is_match("fail-count-db#monitor_5000"));
        assert!(!one.is_match("fail-count-db2"));

        let op = Regex::new(&failure_pattern(Some("db"), Some("monitor"), 5000)).unwrap();
        assert!(op.is_match("fail-count-db"));
        assert!(op.is_match("fail-count-db#monitor_5000"));
        assert!(!op.is_match("fail-count-db#monitor_9999"));
        assert!(!op.is_match("fail-count-db#start_0"));
    }

    #[test]
    fn test_remote_clear_xpath_shapes() {
        let all = remote_clear_xpath(None, None, None, 0);
        assert!(all.contains("node_state[@remote='true']"));
        assert!(all.contains("starts-with(@name,'fail-count-')"));
        assert!(!all.contains("@id="));

        let host = remote_clear_xpath(Some("r1"), Some("db"), None, 0);
        assert!(host.contains("[@id='r1']"));
        assert!(host.contains("@name='fail-count-db'"));
        assert!(host.contains("starts-with(@name,'fail-count-db#')"));

        let op = remote_clear_xpath(Some("r1"), Some("db"), Some("monitor"), 5000);
        assert!(op.contains("@name='fail-count-db#monitor_5000'"));
        assert!(op.contains("@name='last-failure-db#monitor_5000'"));
    }

    #[tokio::test]
    async fn test_clear_one_resource_leaves_others_alone() {
        let fx = fixture();

        handle_request(&fx.attrd, update("fail-count-X", "5")).await;
        handle_request(&fx.attrd, update("fail-count-Y", "2")).await;
        handle_request(&fx.attrd, update("last-failure-X", "abc")).await;
        sleep(Duration::from_millis(300)).await;
        assert_eq!(fx.cib.nvpair_count().await, 3);

        let clear = AttrdRequest {
            task: Some(AttrdTask::ClearFailure),
            resource: Some("X".to_string()),
            ..Default::default()
        };
        handle_request(&fx.attrd, clear).await;
        sleep(Duration::from_millis(400)).await;

        assert!(fx
            .cib
            .get("status", "node1", None, "fail-count-X")
            .await
            .is_none());
        assert!(fx
            .cib
            .get("status", "node1", None, "last-failure-X")
            .await
            .is_none());
        assert_eq!(
            fx.cib.get("status", "node1", None, "fail-count-Y").await,
            Some("2".to_string())
        );

        let sys = fx.attrd.sys.read().await;
        assert_eq!(sys.attrs.get("fail-count-X").unwrap().current, None);
        assert_eq!(sys.attrs.get("fail-count-X").unwrap().committed, None);
        assert_eq!(
            sys.attrs.get("fail-count-Y").unwrap().committed,
            Some("2".to_string())
        );
    }

    #[tokio::test]
    async fn test_clear_for_unknown_host_goes_to_the_store() {
        let fx = fixture();
        fx.cib.add_remote_node("remote1").await;
        fx.cib
            .update("status", "remote1", None, "fail-count-db", "4", None)
            .await
            .unwrap();

        let clear = AttrdRequest {
            task: Some(AttrdTask::ClearFailure),
            resource: Some("db".to_string()),
            host: Some("remote1".to_string()),
            is_remote: true,
            ..Default::default()
        };
        handle_request(&fx.attrd, clear).await;
        sleep(Duration::from_millis(200)).await;

        assert!(fx
            .cib
            .get("status", "remote1", None, "fail-count-db")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_clear_for_known_peer_is_relayed() {
        let fx = fixture();
        fx.attrd.sys.write().await.peers.insert("node2".to_string());

        let clear = AttrdRequest {
            task: Some(AttrdTask::ClearFailure),
            resource: Some("db".to_string()),
            host: Some("node2".to_string()),
            ..Default::default()
        };
        handle_request(&fx.attrd, clear).await;
        sleep(Duration::from_millis(100)).await;

        let sent = fx.bus.take_sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.as_deref(), Some("node2"));
        assert_eq!(sent[0].1.request.task, Some(AttrdTask::ClearFailure));
        // Nothing was cleared locally and no xpath delete ran
        assert_eq!(fx.cib.delete_calls().await, 0);
    }

    #[tokio::test]
    async fn test_clear_without_host_reaches_every_scope() {
        let fx = fixture();
        fx.cib.add_remote_node("remote1").await;
        fx.cib
            .update("status", "remote1", None, "fail-count-db", "4", None)
            .await
            .unwrap();
        handle_request(&fx.attrd, update("fail-count-db", "2")).await;
        sleep(Duration::from_millis(200)).await;

        let clear = AttrdRequest {
            task: Some(AttrdTask::ClearFailure),
            resource: Some("db".to_string()),
            ..Default::default()
        };
        handle_request(&fx.attrd, clear).await;
        sleep(Duration::from_millis(400)).await;

        // The broadcast loops back and clears the local table entry, and
        // the remote node's pair is removed through the store.
        assert!(fx
            .cib
            .get("status", "node1", None, "fail-count-db")
            .await
            .is_none());
        assert!(fx
            .cib
            .get("status", "remote1", None, "fail-count-db")
            .await
            .is_none());
    }
}
