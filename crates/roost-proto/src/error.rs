/// Roost error types.
///
/// All error codes observable at component boundaries are represented as a
/// single enum: validation failures, configuration-store outcomes, cluster
/// transport failures, execution failures, and proxy protocol errors.

use serde::{Deserialize, Serialize};

/// Unified error type for all roost operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
pub enum RoostError {
    #[error("unknown error")]
    Unknown,
    #[error("invalid parameters")]
    InvalidParms,
    #[error("system error")]
    SystemError,
    #[error("network error")]
    NetworkError,
    #[error("daemon is shutting down")]
    Shutdown,

    // Validation errors (fail fast, no table mutation)
    #[error("no resource name specified")]
    MissingResource,
    #[error("no agent class specified")]
    MissingClass,
    #[error("no agent name specified")]
    MissingAgent,
    #[error("no operation specified")]
    MissingOperation,
    #[error("agent class requires a provider")]
    MissingProvider,
    #[error("invalid pattern")]
    InvalidPattern,
    #[error("invalid value format")]
    InvalidValue,

    // Configuration-store outcomes
    #[error("object not found in configuration store")]
    NotFound,
    #[error("configuration diff failed to apply")]
    DiffFailed,
    #[error("configuration store request timed out")]
    TimedOut,
    #[error("not connected to configuration store")]
    NotConnected,
    #[error("configuration store rejected request")]
    GenericFailure,

    // Cluster transport
    #[error("cluster messaging error")]
    ClusterError,
    #[error("no such cluster peer")]
    PeerUnknown,

    // Execution
    #[error("could not spawn agent")]
    SpawnFailed,
    #[error("operation is not cancellable")]
    NotCancellable,

    // Proxy protocol
    #[error("no such proxy session")]
    UnknownSession,
    #[error("proxy session would loop back to its own service")]
    SessionLoop,
    #[error("local IPC channel is not connected")]
    ChannelDead,
    #[error("invalid proxy operation")]
    InvalidProxyOp,
}

impl RoostError {
    /// Convert from a raw wire error code.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0x00 => None, // Success
            0x01 => Some(Self::Unknown),
            0x02 => Some(Self::InvalidParms),
            0x03 => Some(Self::SystemError),
            0x04 => Some(Self::NetworkError),
            0x05 => Some(Self::Shutdown),
            0x10 => Some(Self::MissingResource),
            0x11 => Some(Self::MissingClass),
            0x12 => Some(Self::MissingAgent),
            0x13 => Some(Self::MissingOperation),
            0x14 => Some(Self::MissingProvider),
            0x15 => Some(Self::InvalidPattern),
            0x16 => Some(Self::InvalidValue),
            0x20 => Some(Self::NotFound),
            0x21 => Some(Self::DiffFailed),
            0x22 => Some(Self::TimedOut),
            0x23 => Some(Self::NotConnected),
            0x24 => Some(Self::GenericFailure),
            0x30 => Some(Self::ClusterError),
            0x31 => Some(Self::PeerUnknown),
            0x40 => Some(Self::SpawnFailed),
            0x41 => Some(Self::NotCancellable),
            0x50 => Some(Self::UnknownSession),
            0x51 => Some(Self::SessionLoop),
            0x52 => Some(Self::ChannelDead),
            0x53 => Some(Self::InvalidProxyOp),
            _ => Some(Self::Unknown),
        }
    }

    /// Convert to a raw wire error code.
    pub fn to_code(self) -> u32 {
        match self {
            Self::Unknown => 0x01,
            Self::InvalidParms => 0x02,
            Self::SystemError => 0x03,
            Self::NetworkError => 0x04,
            Self::Shutdown => 0x05,
            Self::MissingResource => 0x10,
            Self::MissingClass => 0x11,
            Self::MissingAgent => 0x12,
            Self::MissingOperation => 0x13,
            Self::MissingProvider => 0x14,
            Self::InvalidPattern => 0x15,
            Self::InvalidValue => 0x16,
            Self::NotFound => 0x20,
            Self::DiffFailed => 0x21,
            Self::TimedOut => 0x22,
            Self::NotConnected => 0x23,
            Self::GenericFailure => 0x24,
            Self::ClusterError => 0x30,
            Self::PeerUnknown => 0x31,
            Self::SpawnFailed => 0x40,
            Self::NotCancellable => 0x41,
            Self::UnknownSession => 0x50,
            Self::SessionLoop => 0x51,
            Self::ChannelDead => 0x52,
            Self::InvalidProxyOp => 0x53,
        }
    }

    /// Whether a configuration-store failure is expected to clear on its
    /// own (store syncing, election in progress, section not written yet)
    /// and should be retried by the next converge rather than reported.
    pub fn is_transient_store_error(self) -> bool {
        matches!(
            self,
            Self::DiffFailed | Self::TimedOut | Self::NotFound | Self::NotConnected
        )
    }
}

/// Result type alias for roost operations.
pub type RoostResult<T> = Result<T, RoostError>;

impl From<std::io::Error> for RoostError {
    fn from(_: std::io::Error) -> Self {
        RoostError::SystemError
    }
}
