//! Handling of attribute messages arriving over the cluster bus.

use tracing::{debug, info, trace};

use roost_proto::message::{AttrdTask, PeerEnvelope};

use crate::daemon::Attrd;
use crate::{attrs, clear};

/// Dispatch one message from the bus (possibly our own broadcast).
pub async fn process_peer_message(attrd: &Attrd, envelope: PeerEnvelope) {
    let node_name = attrd.node_name().await;
    let request = envelope.request;

    // A request relayed to this node by a peer goes through the normal
    // client path.
    if request.host.as_deref() == Some(node_name.as_str())
        && request.task != Some(AttrdTask::PeerRemove)
    {
        info!(
            "{:?} relayed from {}",
            request.task.unwrap_or(AttrdTask::Update),
            envelope.origin
        );
        attrs::handle_request(attrd, request).await;
        return;
    }

    match request.task {
        Some(AttrdTask::PeerRemove) => {
            let Some(host) = &request.host else {
                return;
            };
            debug!("removing {} from peer caches for {}", host, envelope.origin);
            attrd.sys.write().await.peers.remove(host);
        }

        Some(AttrdTask::ClearFailure) => {
            clear::local_clear_failure(attrd, &request).await;
        }

        _ => {
            // A flush: commit our value for this attribute, unless it is
            // our own echo-suppressed broadcast coming back around.
            if request.ignore_locally.is_some() && envelope.origin == node_name {
                trace!(
                    "ignoring our own broadcast of {}",
                    request.attribute.as_deref().unwrap_or("")
                );
                return;
            }
            trace!(
                "{:?} message from {}",
                request.task,
                envelope.origin
            );
            let Some(name) = attrs::find_entry(attrd, &request).await else {
                info!("ignoring message with no attribute name");
                return;
            };
            attrs::stop_entry_timer(attrd, &name).await;
            attrs::perform_update(attrd.clone(), name).await;
        }
    }
}
