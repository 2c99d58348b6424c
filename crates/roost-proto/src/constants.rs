/// Protocol-wide constants.

/// Internal wire protocol version.
pub const ROOST_PROTO_VER: u8 = 1;

/// Default Unix socket path for the attribute daemon.
pub const ATTRD_SOCKET: &str = "/run/roost/attrd.sock";

/// Default Unix socket path for the executor daemon.
pub const EXECD_SOCKET: &str = "/run/roost/execd.sock";

/// CIB section holding per-node transient state.
pub const SECTION_STATUS: &str = "status";

/// Attribute-name prefix for per-operation failure counters.
pub const FAIL_COUNT_PREFIX: &str = "fail-count";

/// Attribute-name prefix for last-failure timestamps.
pub const LAST_FAILURE_PREFIX: &str = "last-failure";

/// Fixed correlation timeout for configuration-store requests.
pub const CIB_CALL_TIMEOUT_SECS: u64 = 120;

/// Exit code used when the cluster connection is lost unexpectedly,
/// telling the supervisor to respawn the daemon.
pub const EXIT_CLUSTER_LOST: i32 = 107;
