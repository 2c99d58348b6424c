//! Local resource-operation executor daemon (roost-execd).
//!
//! Executes resource agent operations on behalf of the cluster
//! controller: builds the canonical action descriptor, dispatches
//! through the class-appropriate transport, serializes actions per
//! resource, manages the recurring schedule, and supports cancellation.
//! It is also the cluster-side endpoint for remote-node IPC tunnels.

mod channels;
mod ipc;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::Notify;
use tracing::{error, info};

use roost_core::net::create_listen_socket;
use roost_exec::executor::Executor;
use roost_exec::registry::{AgentRoots, Registry, StaticBus};
use roost_proto::constants::EXECD_SOCKET;

use crate::channels::UnixChannelFactory;

/// Resource-operation executor daemon
#[derive(Parser, Debug)]
#[command(name = "roost-execd", version, about = "Roost executor daemon")]
struct Args {
    /// Unix socket for local executor clients
    #[arg(short = 's', long, default_value = EXECD_SOCKET)]
    socket: PathBuf,

    /// Unix socket accepting remote-node tunnel connections
    /// (disabled when not given)
    #[arg(long)]
    proxy_socket: Option<PathBuf>,

    /// Directory holding the local services' IPC sockets, for proxied
    /// sessions
    #[arg(long, default_value = "/run/roost")]
    service_dir: PathBuf,

    /// Root directory for script agents
    #[arg(long)]
    script_root: Option<PathBuf>,

    /// Root directory for legacy positional-parameter agents
    #[arg(long)]
    legacy_root: Option<PathBuf>,

    /// Root directory for probe plugins
    #[arg(long)]
    probe_root: Option<PathBuf>,

    /// Agents advertised by the in-process unit bus (single-node mode)
    #[arg(long = "unit-agent", value_name = "NAME")]
    unit_agents: Vec<String>,

    /// Agents advertised by the in-process job bus (single-node mode)
    #[arg(long = "job-agent", value_name = "NAME")]
    job_agents: Vec<String>,

    /// Our own service name; tunnel sessions naming it are refused to
    /// guard against loops
    #[arg(long, default_value = "execd")]
    service_name: String,

    /// Accept remote shutdown requests over the tunnel
    #[arg(long)]
    accept_shutdown: bool,

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

    info!("roost-execd v{} starting", env!("CARGO_PKG_VERSION"));

    let mut roots = AgentRoots::default();
    if let Some(dir) = args.script_root {
        roots.script_dir = dir;
    }
    if let Some(dir) = args.legacy_root {
        roots.legacy_dir = dir;
    }
    if let Some(dir) = args.probe_root {
        roots.probe_dir = dir;
    }

    let mut registry = Registry::new(roots);
    if !args.unit_agents.is_empty() {
        let mut bus = StaticBus::new("unit");
        for agent in &args.unit_agents {
            bus = bus.with_agent(agent, 0);
        }
        registry = registry.with_unit_bus(Arc::new(bus));
    }
    if !args.job_agents.is_empty() {
        let mut bus = StaticBus::new("job");
        for agent in &args.job_agents {
            bus = bus.with_agent(agent, 0);
        }
        registry = registry.with_job_bus(Arc::new(bus));
    }

    let executor = Executor::new(registry);
    let shutdown = Arc::new(Notify::new());

    let listener = match create_listen_socket(&args.socket) {
        Ok(listener) => listener,
        Err(err) => {
            error!("cannot listen on {}: {}", args.socket.display(), err);
            std::process::exit(1);
        }
    };
    info!("accepting operations on {}", args.socket.display());
    tokio::spawn(ipc::exec_accept_loop(
        executor.clone(),
        listener,
        shutdown.clone(),
    ));

    if let Some(proxy_socket) = &args.proxy_socket {
        let listener = match create_listen_socket(proxy_socket) {
            Ok(listener) => listener,
            Err(err) => {
                error!("cannot listen on {}: {}", proxy_socket.display(), err);
                std::process::exit(1);
            }
        };
        info!("accepting remote tunnels on {}", proxy_socket.display());
        let factory = UnixChannelFactory::new(args.service_dir.clone());
        tokio::spawn(ipc::proxy_accept_loop(
            listener,
            factory,
            args.service_name.clone(),
            args.accept_shutdown,
            shutdown.clone(),
        ));
    }

    tokio::signal::ctrl_c().await.ok();
    info!("SIGTERM/SIGINT received, shutting down");
    shutdown.notify_waiters();

    info!("roost-execd stopped");
}
