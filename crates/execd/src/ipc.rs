//! IPC surfaces of the executor daemon.
//!
//! Two listeners: one accepting framed `ExecRequest` messages from local
//! clients (submissions, cancellations, kicks), with completions
//! streamed back as frames; and one accepting tunnel connections from
//! remote nodes, each of which gets its own proxy session table.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info};

use roost_core::net::{read_frame, write_frame};
use roost_exec::action::{ActionRequest, AgentClass};
use roost_exec::executor::{ActionCallback, Executor, GenericCallback};
use roost_exec::proxy::{ChannelFactory, ProxyMux};
use roost_proto::error::{RoostError, RoostResult};
use roost_proto::message::{ExecReply, ExecRequest, ProxyMsg};
use roost_proto::opkey::OpKey;

/// Accept loop for local executor clients.
pub async fn exec_accept_loop(executor: Executor, listener: UnixListener, shutdown: Arc<Notify>) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        debug!("accepted executor client");
                        let executor = executor.clone();
                        tokio::spawn(async move {
                            if let Err(err) = handle_exec_client(executor, stream).await {
                                debug!("executor client disconnected: {}", err);
                            }
                        });
                    }
                    Err(err) => error!("accept error: {}", err),
                }
            }
            _ = shutdown.notified() => break,
        }
    }
}

async fn handle_exec_client(executor: Executor, stream: UnixStream) -> RoostResult<()> {
    let (mut reader, mut writer) = stream.into_split();

    // Replies and completion events funnel through one writer task so
    // concurrent completions cannot interleave frames.
    let (tx, mut rx) = mpsc::unbounded_channel::<ExecReply>();
    tokio::spawn(async move {
        while let Some(reply) = rx.recv().await {
            if write_frame(&mut writer, &reply).await.is_err() {
                break;
            }
        }
    });

    loop {
        let Some(request): Option<ExecRequest> = read_frame(&mut reader).await? else {
            return Ok(());
        };

        match request {
            ExecRequest::Exec {
                rsc_id,
                class,
                provider,
                agent,
                operation,
                interval_ms,
                timeout_ms,
                parameters,
            } => {
                let reply = submit_exec(
                    &executor,
                    tx.clone(),
                    rsc_id,
                    class,
                    provider,
                    agent,
                    operation,
                    interval_ms,
                    timeout_ms,
                    parameters,
                )
                .await;
                let _ = tx.send(reply);
            }
            ExecRequest::Cancel {
                rsc_id,
                operation,
                interval_ms,
            } => {
                let key = OpKey::new(&rsc_id, &operation, interval_ms);
                let done = executor.cancel(&key).await;
                let _ = tx.send(ExecReply::Cancelled { done });
            }
            ExecRequest::Kick {
                rsc_id,
                operation,
                interval_ms,
            } => {
                let key = OpKey::new(&rsc_id, &operation, interval_ms);
                let done = executor.kick(&key).await;
                let _ = tx.send(ExecReply::Cancelled { done });
            }
            ExecRequest::Alert {
                id,
                path,
                timeout_ms,
                env,
            } => {
                let reply = submit_alert(&executor, tx.clone(), id, path, timeout_ms, env).await;
                let _ = tx.send(reply);
            }
        }
    }
}

async fn submit_alert(
    executor: &Executor,
    tx: mpsc::UnboundedSender<ExecReply>,
    id: String,
    path: String,
    timeout_ms: u64,
    env: BTreeMap<String, String>,
) -> ExecReply {
    let key = id.clone();
    let callback: GenericCallback = Arc::new(move |result| {
        let _ = tx.send(ExecReply::Completion {
            key: key.clone(),
            exit_code: result.exit_code,
            status: result.status.to_code(),
            stdout: result.stdout.clone(),
            stderr: result.stderr.clone(),
            elapsed_ms: result.elapsed.as_millis() as u64,
        });
    });

    match executor.run_generic(&id, &path, timeout_ms, env, callback).await {
        Ok(()) => ExecReply::Ack,
        Err(err) => ExecReply::Nack {
            code: err.to_code(),
        },
    }
}

#[allow(clippy::too_many_arguments)]
async fn submit_exec(
    executor: &Executor,
    tx: mpsc::UnboundedSender<ExecReply>,
    rsc_id: String,
    class: String,
    provider: Option<String>,
    agent: String,
    operation: String,
    interval_ms: u64,
    timeout_ms: u64,
    parameters: BTreeMap<String, String>,
) -> ExecReply {
    let Some(class) = AgentClass::parse(&class) else {
        return ExecReply::Nack {
            code: RoostError::MissingClass.to_code(),
        };
    };

    let request = ActionRequest {
        rsc_id,
        class,
        provider,
        agent,
        operation,
        interval_ms,
        timeout_ms,
        parameters,
    };

    let callback: ActionCallback = Arc::new(move |key, result| {
        let _ = tx.send(ExecReply::Completion {
            key: key.to_string(),
            exit_code: result.exit_code,
            status: result.status.to_code(),
            stdout: result.stdout.clone(),
            stderr: result.stderr.clone(),
            elapsed_ms: result.elapsed.as_millis() as u64,
        });
    });

    match executor.submit(request, callback).await {
        Ok(()) => ExecReply::Ack,
        Err(err) => ExecReply::Nack {
            code: err.to_code(),
        },
    }
}

/// Accept loop for remote tunnel connections. Each remote connection
/// gets its own multiplexer (and thus its own session table).
pub async fn proxy_accept_loop(
    listener: UnixListener,
    factory: Arc<dyn ChannelFactory>,
    local_service: String,
    accept_shutdown: bool,
    shutdown: Arc<Notify>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        info!("remote tunnel connected");
                        let factory = factory.clone();
                        let local_service = local_service.clone();
                        tokio::spawn(async move {
                            handle_remote_tunnel(stream, factory, local_service, accept_shutdown)
                                .await;
                        });
                    }
                    Err(err) => error!("accept error: {}", err),
                }
            }
            _ = shutdown.notified() => break,
        }
    }
}

async fn handle_remote_tunnel(
    stream: UnixStream,
    factory: Arc<dyn ChannelFactory>,
    local_service: String,
    accept_shutdown: bool,
) {
    let (mut reader, mut writer) = stream.into_split();
    let (to_remote, mut from_mux) = mpsc::channel::<ProxyMsg>(64);
    let mux = ProxyMux::new(&local_service, factory, to_remote, accept_shutdown);

    tokio::spawn(async move {
        while let Some(msg) = from_mux.recv().await {
            if write_frame(&mut writer, &msg).await.is_err() {
                break;
            }
        }
    });

    loop {
        match read_frame::<ProxyMsg, _>(&mut reader).await {
            Ok(Some(msg)) => mux.handle_remote(msg).await,
            Ok(None) => {
                info!("remote tunnel disconnected ({} sessions)", mux.session_count());
                break;
            }
            Err(err) => {
                error!("bad tunnel frame: {}", err);
                break;
            }
        }
    }
}
