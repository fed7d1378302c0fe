use thiserror::Error;

/// Top-level error type shared by every crate in the workspace.
#[derive(Debug, Error)]
pub enum FleetError {
    /// The atomic-scripting store is unreachable or returned a transport error.
    #[error("store error: {0}")]
    Store(String),

    /// Configuration failed to load or validate.
    #[error("configuration error: {0}")]
    Config(String),

    /// A worker violated the reserve/acknowledge contract (programming error).
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("queue expired: {0}")]
    QueueExpired(String),

    #[error("{0}")]
    Internal(String),
}

impl FleetError {
    /// Whether this error should abort the whole run (master-setup-commit failures,
    /// protocol violations) as opposed to being retried by the caller.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::QueueExpired(_))
    }
}

/// Result alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, FleetError>;
