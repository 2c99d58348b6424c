//! Local IPC surface: a Unix socket accepting framed attribute requests.
//! Every request is acknowledged immediately; results are observed
//! through the configuration store.

use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error};

use roost_core::net::{read_frame, write_frame};
use roost_proto::message::{AttrdReply, AttrdRequest};

use crate::attrs;
use crate::daemon::Attrd;

/// Accept loop for local clients.
pub async fn accept_loop(attrd: Attrd, listener: UnixListener) {
    let shutdown = attrd.shutdown.clone();
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        debug!("accepted local client");
                        let attrd = attrd.clone();
                        tokio::spawn(async move {
                            if let Err(err) = handle_client(attrd, stream).await {
                                debug!("client disconnected: {}", err);
                            }
                        });
                    }
                    Err(err) => error!("accept error: {}", err),
                }
            }
            _ = shutdown.notified() => {
                break;
            }
        }
    }
}

async fn handle_client(attrd: Attrd, mut stream: UnixStream) -> roost_proto::RoostResult<()> {
    loop {
        let Some(request): Option<AttrdRequest> = read_frame(&mut stream).await? else {
            return Ok(());
        };
        write_frame(&mut stream, &AttrdReply::Ack).await?;
        attrs::handle_request(&attrd, request).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roost_core::bus::LocalBus;
    use roost_core::cib::LocalCib;
    use roost_core::net::create_listen_socket;
    use roost_exec::executor::Executor;
    use roost_exec::registry::{AgentRoots, Registry};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_client_request_is_acked_and_applied() {
        let tmp = tempfile::tempdir().unwrap();
        let socket = tmp.path().join("attrd.sock");

        let cib = Arc::new(LocalCib::new());
        let bus = Arc::new(LocalBus::new("node1"));
        let executor = Executor::new(Registry::new(AgentRoots::default()));
        let attrd = Attrd::new("node1", cib.clone(), bus, executor);
        tokio::spawn(crate::daemon::bus_event_loop(attrd.clone()));

        let listener = create_listen_socket(&socket).unwrap();
        tokio::spawn(accept_loop(attrd, listener));

        let mut client = UnixStream::connect(&socket).await.unwrap();
        let request = AttrdRequest::update("load", Some("3"));
        write_frame(&mut client, &request).await.unwrap();
        let reply: Option<AttrdReply> = read_frame(&mut client).await.unwrap();
        assert_eq!(reply, Some(AttrdReply::Ack));

        sleep(Duration::from_millis(300)).await;
        assert_eq!(
            cib.get("status", "node1", None, "load").await,
            Some("3".to_string())
        );
    }
}
