//! Node attribute aggregation daemon (roost-attrd).
//!
//! One instance runs per cluster node. It accepts local attribute
//! updates, coalesces them under per-attribute dampening windows,
//! broadcasts authoritative values to its peers, and commits the
//! converged state to the configuration store on behalf of the local
//! node. Failure-clearing requests are routed to the local table, a
//! peer, or the store depending on the target host.

mod alerts;
mod attrs;
mod clear;
mod daemon;
mod expand;
mod ipc;
mod peer;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use roost_core::bus::LocalBus;
use roost_core::cib::LocalCib;
use roost_core::net::create_listen_socket;
use roost_exec::executor::Executor;
use roost_exec::registry::{AgentRoots, Registry};
use roost_proto::constants::{ATTRD_SOCKET, EXIT_CLUSTER_LOST};

use crate::daemon::Attrd;

/// Node attribute aggregation daemon
#[derive(Parser, Debug)]
#[command(name = "roost-attrd", version, about = "Roost attribute daemon")]
struct Args {
    /// This node's name in the cluster membership
    #[arg(short = 'n', long, default_value = "localnode")]
    node_name: String,

    /// Unix socket for local clients
    #[arg(short = 's', long, default_value = ATTRD_SOCKET)]
    socket: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("roost-attrd v{} starting", env!("CARGO_PKG_VERSION"));

    // In single-node operation the loopback drivers stand in for the
    // cluster stack; production backends implement the same traits.
    let cib = Arc::new(LocalCib::new());
    let bus = Arc::new(LocalBus::new(&args.node_name));

    // Alert agents run through the executor; they carry absolute paths,
    // so the default agent roots are sufficient here.
    let executor = Executor::new(Registry::new(AgentRoots::default()));

    let attrd = Attrd::new(&args.node_name, cib.clone(), bus, executor);

    info!("cluster connection active");

    // Read the alert configuration now that we can reach the store
    alerts::read_alert_config(&attrd).await;

    let listener = match create_listen_socket(&args.socket) {
        Ok(listener) => listener,
        Err(err) => {
            error!("cannot listen on {}: {}", args.socket.display(), err);
            std::process::exit(1);
        }
    };
    info!("accepting attribute updates on {}", args.socket.display());
    tokio::spawn(ipc::accept_loop(attrd.clone(), listener));

    // Cluster message loop: losing the bus outside shutdown is fatal so
    // the supervisor respawns us.
    {
        let attrd = attrd.clone();
        tokio::spawn(async move {
            if daemon::bus_event_loop(attrd).await {
                std::process::exit(EXIT_CLUSTER_LOST);
            }
        });
    }

    // Configuration store notifications
    {
        let attrd = attrd.clone();
        tokio::spawn(async move {
            if daemon::cib_event_loop(attrd).await {
                std::process::exit(EXIT_CLUSTER_LOST);
            }
        });
    }

    tokio::select! {
        _ = attrd.shutdown.notified() => {
            info!("shutdown requested");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("SIGTERM/SIGINT received, shutting down");
        }
    }

    attrd.sys.write().await.shutting_down = true;
    attrd.shutdown.notify_waiters();

    // One last converge so nothing armed is lost
    attrs::recommit_idle(&attrd).await;

    info!("roost-attrd stopped");
}
