//! Error types for the cluster.
//!
//! Construction problems surface as [`ConfigError`], misuse of the cluster
//! surface as [`DispatchError`], and failures reported by an underlying
//! session as [`TransportError`]. [`ClusterError`] wraps all three for the
//! public operations.

use thiserror::Error;

/// Invalid or missing setup. Fatal at construction.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("connection count must be at least 1")]
    NoConnections,

    #[error("{field} must be greater than zero")]
    ZeroDuration { field: &'static str },

    #[error("invalid channel name {name:?}: {reason}")]
    InvalidChannel { name: String, reason: String },

    #[error("chatters url must contain a {{channel}} placeholder: {0}")]
    ChattersUrl(String),

    #[error("transport operation {0:?} has no dispatch class")]
    UnclassifiedOperation(String),

    #[error("transport does not provide required operation {0:?}")]
    MissingOperation(&'static str),

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to set up the chatters source: {0}")]
    SnapshotSource(String),

    #[error("failed to create {role} session: {source}")]
    Session {
        role: &'static str,
        #[source]
        source: TransportError,
    },
}

/// Calling the cluster in a way its current setup does not allow.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("chatters list is only available when mock_membership is enabled")]
    EmulationDisabled,

    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    #[error("operation {0} expects a channel as its first argument")]
    MissingChannel(String),

    #[error("invalid channel name {name:?}: {reason}")]
    InvalidChannel { name: String, reason: String },
}

/// A failure reported by one underlying chat session.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("operation {0} is not supported by this session")]
    Unsupported(String),

    #[error("invalid arguments for {op}: {reason}")]
    InvalidArguments { op: String, reason: String },

    #[error("{0}")]
    Failed(String),
}

/// Any error returned from a public cluster operation.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("failed to encode result: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ClusterError {
    /// Static code for log fields.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Dispatch(DispatchError::EmulationDisabled) => "emulation_disabled",
            Self::Dispatch(DispatchError::UnknownOperation(_)) => "unknown_operation",
            Self::Dispatch(DispatchError::MissingChannel(_)) => "missing_channel",
            Self::Dispatch(DispatchError::InvalidChannel { .. }) => "invalid_channel",
            Self::Transport(_) => "transport",
            Self::Encode(_) => "encode",
        }
    }
}
