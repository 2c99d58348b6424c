//! Core plumbing for the roost daemons.
//!
//! The configuration store and the cluster messaging layer are external
//! collaborators; the daemons talk to them through the traits defined
//! here. Each trait ships with an in-process implementation used for
//! development and tests. The `net` module holds the Unix-socket frame
//! codec shared by both daemons' IPC surfaces.

pub mod bus;
pub mod cib;
pub mod net;
