//! Resource-operation execution for the roost daemons.
//!
//! Three tightly related pieces live here:
//! - the action executor: builds canonical action descriptors, serializes
//!   execution per resource, tracks in-flight/blocked/recurring actions,
//!   and supports cancellation;
//! - alert dispatch: runs configured alert agents for cluster events with
//!   per-recipient filtering and environment propagation;
//! - the IPC proxy multiplexer: tunnels requests between a remote node
//!   and the IPC services on a cluster node.

pub mod action;
pub mod alerts;
pub mod executor;
pub mod proxy;
pub mod registry;
